use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

use crate::model::{Channel, Item};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process has locked the database
    #[error("Another instance of feedsync appears to be running. Please close it and try again.")]
    InstanceLocked,

    #[error("Database migration failed: {0}")]
    Migration(String),

    /// Tags column could not be encoded or decoded
    #[error("Corrupt tag list: {0}")]
    Tags(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

impl DatabaseError {
    /// Maps SQLite lock conditions to `InstanceLocked`.
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Row Types
// ============================================================================

pub(crate) fn to_timestamp(date: DateTime<Utc>) -> i64 {
    date.timestamp()
}

pub(crate) fn from_timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct FeedRow {
    pub url: String,
    pub tags: String,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ChannelRow {
    pub feed_url: String,
    pub title: String,
    pub link: String,
    pub description: String,
    pub author: String,
    pub pixmap_url: String,
    pub last_build: Option<i64>,
    pub tags: String,
    pub image: Option<Vec<u8>>,
    pub favicon: Option<Vec<u8>>,
}

impl ChannelRow {
    pub(crate) fn into_channel(self) -> Result<Channel, DatabaseError> {
        let mut channel = Channel::new(self.title, self.link);
        channel.description = self.description;
        channel.author = self.author;
        channel.pixmap_url = self.pixmap_url;
        channel.last_build = self.last_build.map(from_timestamp);
        channel.tags = serde_json::from_str(&self.tags)?;
        channel.image = self.image;
        channel.favicon = self.favicon;
        Ok(channel)
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ItemRow {
    pub channel_key: String,
    pub title: String,
    pub link: String,
    pub pub_date: i64,
    pub description: String,
    pub author: String,
    pub category: String,
    pub unread: bool,
}

impl ItemRow {
    pub(crate) fn into_item(self) -> Item {
        let mut item = Item::new(self.title, self.link, from_timestamp(self.pub_date));
        item.description = self.description;
        item.author = self.author;
        item.category = self.category;
        item.unread = self.unread;
        item
    }
}
