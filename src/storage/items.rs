use sqlx::SqliteConnection;

use super::types::{to_timestamp, DatabaseError};
use crate::model::Item;

// Items are addressed by (channel_key, title, link), the same identity the parser uses
// to recognise entries it has already seen.

/// Inserts an item, or refreshes its fields if the entry is already stored.
pub(crate) async fn insert_item(
    conn: &mut SqliteConnection,
    channel_key: &str,
    item: &Item,
) -> Result<(), DatabaseError> {
    sqlx::query(
        r#"
            INSERT INTO items (channel_key, title, link, pub_date, description, author, category, unread)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(channel_key, title, link) DO UPDATE SET
                pub_date = excluded.pub_date,
                description = excluded.description,
                author = excluded.author,
                category = excluded.category,
                unread = excluded.unread
        "#,
    )
    .bind(channel_key)
    .bind(&item.title)
    .bind(&item.link)
    .bind(to_timestamp(item.pub_date))
    .bind(&item.description)
    .bind(&item.author)
    .bind(&item.category)
    .bind(item.unread)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn update_item(
    conn: &mut SqliteConnection,
    channel_key: &str,
    item: &Item,
) -> Result<(), DatabaseError> {
    sqlx::query(
        r#"
            UPDATE items SET unread = ?, pub_date = ?, description = ?, author = ?, category = ?
            WHERE channel_key = ? AND title = ? AND link = ?
        "#,
    )
    .bind(item.unread)
    .bind(to_timestamp(item.pub_date))
    .bind(&item.description)
    .bind(&item.author)
    .bind(&item.category)
    .bind(channel_key)
    .bind(&item.title)
    .bind(&item.link)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub(crate) async fn remove_item(
    conn: &mut SqliteConnection,
    channel_key: &str,
    item: &Item,
) -> Result<(), DatabaseError> {
    sqlx::query("DELETE FROM items WHERE channel_key = ? AND title = ? AND link = ?")
        .bind(channel_key)
        .bind(&item.title)
        .bind(&item.link)
        .execute(&mut *conn)
        .await?;
    Ok(())
}
