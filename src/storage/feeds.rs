use chrono::Utc;
use sqlx::SqliteConnection;
use std::collections::HashMap;

use super::items::{insert_item, remove_item, update_item};
use super::schema::Database;
use super::types::{to_timestamp, ChannelRow, DatabaseError, FeedRow, ItemRow};
use crate::model::{Channel, Feed, Item};
use crate::sync::StorageOp;

impl Database {
    // ========================================================================
    // Batched writes
    // ========================================================================

    /// Applies a batch of storage operations in one transaction, in order.
    ///
    /// Either every operation lands or none does.
    pub async fn apply_ops(&self, ops: &[StorageOp]) -> Result<(), DatabaseError> {
        if ops.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(DatabaseError::from_sqlx)?;
        for op in ops {
            apply_op(&mut *tx, op).await?;
        }
        tx.commit().await.map_err(DatabaseError::from_sqlx)?;
        Ok(())
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// Rebuilds every stored feed, channels in stored order and items newest first.
    ///
    /// Channel handles are left unassigned; the registry hands them out on insertion.
    pub async fn load_feeds(&self) -> Result<Vec<Feed>, DatabaseError> {
        let feed_rows: Vec<FeedRow> = sqlx::query_as("SELECT url, tags FROM feeds ORDER BY url")
            .fetch_all(&self.pool)
            .await?;

        let channel_rows: Vec<ChannelRow> = sqlx::query_as(
            r#"
                SELECT feed_url, title, link, description, author, pixmap_url,
                       last_build, tags, image, favicon
                FROM channels
                ORDER BY feed_url, position
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        // Ties on pub_date keep insertion order, matching where the engine places them.
        let item_rows: Vec<ItemRow> = sqlx::query_as(
            r#"
                SELECT channel_key, title, link, pub_date, description, author, category, unread
                FROM items
                ORDER BY channel_key, pub_date DESC, id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut items_by_key: HashMap<String, Vec<Item>> = HashMap::new();
        for row in item_rows {
            let key = row.channel_key.clone();
            items_by_key.entry(key).or_default().push(row.into_item());
        }

        let mut channels_by_feed: HashMap<String, Vec<Channel>> = HashMap::new();
        for row in channel_rows {
            let feed_url = row.feed_url.clone();
            let mut channel = row.into_channel()?;
            channel.items = items_by_key.get(&channel.key()).cloned().unwrap_or_default();
            channels_by_feed.entry(feed_url).or_default().push(channel);
        }

        let mut feeds = Vec::with_capacity(feed_rows.len());
        for row in feed_rows {
            let mut feed = Feed::new(row.url, serde_json::from_str(&row.tags)?);
            feed.channels = channels_by_feed.remove(&feed.url).unwrap_or_default();
            feeds.push(feed);
        }

        tracing::debug!(feeds = feeds.len(), "Loaded feeds from storage");
        Ok(feeds)
    }
}

async fn apply_op(conn: &mut SqliteConnection, op: &StorageOp) -> Result<(), DatabaseError> {
    match op {
        StorageOp::AddFeed(feed) => {
            insert_feed(conn, feed).await?;
            for channel in &feed.channels {
                insert_channel(conn, &feed.url, channel).await?;
            }
        }
        StorageOp::RemoveFeed { url } => remove_feed(conn, url).await?,
        StorageOp::AddChannel { feed_url, channel } => insert_channel(conn, feed_url, channel).await?,
        StorageOp::UpdateChannel { feed_url, channel } => update_channel(conn, feed_url, channel).await?,
        StorageOp::AddItem { channel_key, item } => insert_item(conn, channel_key, item).await?,
        StorageOp::UpdateItem { channel_key, item } => update_item(conn, channel_key, item).await?,
        StorageOp::RemoveItem { channel_key, item } => remove_item(conn, channel_key, item).await?,
    }
    Ok(())
}

async fn insert_feed(conn: &mut SqliteConnection, feed: &Feed) -> Result<(), DatabaseError> {
    sqlx::query(
        r#"
            INSERT INTO feeds (url, tags, added_at) VALUES (?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET tags = excluded.tags
        "#,
    )
    .bind(&feed.url)
    .bind(serde_json::to_string(&feed.tags)?)
    .bind(to_timestamp(Utc::now()))
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Removes a feed with its channels, and the items of channels no other feed shares.
async fn remove_feed(conn: &mut SqliteConnection, url: &str) -> Result<(), DatabaseError> {
    sqlx::query(
        r#"
            DELETE FROM items
            WHERE channel_key IN (SELECT channel_key FROM channels WHERE feed_url = ?)
              AND channel_key NOT IN (SELECT channel_key FROM channels WHERE feed_url != ?)
        "#,
    )
    .bind(url)
    .bind(url)
    .execute(&mut *conn)
    .await?;
    sqlx::query("DELETE FROM channels WHERE feed_url = ?")
        .bind(url)
        .execute(&mut *conn)
        .await?;
    sqlx::query("DELETE FROM feeds WHERE url = ?")
        .bind(url)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Appends a channel (and its items) after the feed's existing channels.
async fn insert_channel(
    conn: &mut SqliteConnection,
    feed_url: &str,
    channel: &Channel,
) -> Result<(), DatabaseError> {
    let key = channel.key();
    sqlx::query(
        r#"
            INSERT INTO channels (
                feed_url, channel_key, title, link, description, author, pixmap_url,
                last_build, tags, image, favicon, position
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?,
                    COALESCE((SELECT MAX(position) + 1 FROM channels WHERE feed_url = ?), 0))
            ON CONFLICT(feed_url, channel_key) DO UPDATE SET
                description = excluded.description,
                author = excluded.author,
                pixmap_url = excluded.pixmap_url,
                last_build = excluded.last_build,
                tags = excluded.tags,
                image = excluded.image,
                favicon = excluded.favicon
        "#,
    )
    .bind(feed_url)
    .bind(&key)
    .bind(&channel.title)
    .bind(&channel.link)
    .bind(&channel.description)
    .bind(&channel.author)
    .bind(&channel.pixmap_url)
    .bind(channel.last_build.map(to_timestamp))
    .bind(serde_json::to_string(&channel.tags)?)
    .bind(channel.image.as_deref())
    .bind(channel.favicon.as_deref())
    .bind(feed_url)
    .execute(&mut *conn)
    .await?;

    // In list order, so equal dates load back in the in-memory order.
    for item in &channel.items {
        insert_item(conn, &key, item).await?;
    }
    Ok(())
}

/// Overwrites a channel's metadata. Items are untouched.
async fn update_channel(
    conn: &mut SqliteConnection,
    feed_url: &str,
    channel: &Channel,
) -> Result<(), DatabaseError> {
    let result = sqlx::query(
        r#"
            UPDATE channels SET
                description = ?, author = ?, pixmap_url = ?, last_build = ?,
                tags = ?, image = ?, favicon = ?
            WHERE feed_url = ? AND channel_key = ?
        "#,
    )
    .bind(&channel.description)
    .bind(&channel.author)
    .bind(&channel.pixmap_url)
    .bind(channel.last_build.map(to_timestamp))
    .bind(serde_json::to_string(&channel.tags)?)
    .bind(channel.image.as_deref())
    .bind(channel.favicon.as_deref())
    .bind(feed_url)
    .bind(channel.key())
    .execute(&mut *conn)
    .await?;

    if result.rows_affected() == 0 {
        tracing::debug!(feed_url = %feed_url, channel = %channel.title, "Update for a channel not in storage");
    }
    Ok(())
}
