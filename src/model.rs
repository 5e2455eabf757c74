//! Domain entities: feeds, channels and items.
//!
//! A [`Feed`] is keyed by its source URL and owns an ordered list of [`Channel`]s; each
//! channel owns its [`Item`]s, kept newest first. Channels are matched across fetches by
//! title and link, not by identity, and carry a registry-assigned [`ChannelId`] so that
//! correlation tables can refer to them without holding a reference.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::util::{favicon_url, is_absolute_http_url};

// ============================================================================
// Identifiers
// ============================================================================

/// Handle of a channel inside the registry.
///
/// Handles are allocated by the registry when a channel is adopted; `0` is never handed
/// out and marks a channel that has not been registered yet (e.g. fresh parser output).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ChannelId(pub(crate) u64);

impl ChannelId {
    pub const UNASSIGNED: ChannelId = ChannelId(0);

    pub fn get(self) -> u64 {
        self.0
    }

    pub fn is_assigned(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch#{}", self.0)
    }
}

/// What an external asset fetch decorates a channel with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AssetKind {
    ChannelImage,
    Favicon,
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssetKind::ChannelImage => f.write_str("image"),
            AssetKind::Favicon => f.write_str("favicon"),
        }
    }
}

// ============================================================================
// Item
// ============================================================================

/// A single entry of a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub title: String,
    pub link: String,
    pub pub_date: DateTime<Utc>,
    pub description: String,
    pub author: String,
    pub category: String,
    pub unread: bool,
}

impl Item {
    /// New unread item with empty description, author and category.
    pub fn new(title: impl Into<String>, link: impl Into<String>, pub_date: DateTime<Utc>) -> Self {
        Self {
            title: title.into(),
            link: link.into(),
            pub_date,
            description: String::new(),
            author: String::new(),
            category: String::new(),
            unread: true,
        }
    }

    /// Two items describe the same entry when title and link agree.
    pub fn is_same_entry(&self, other: &Item) -> bool {
        self.title == other.title && self.link == other.link
    }
}

// ============================================================================
// Channel
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Channel {
    pub(crate) id: ChannelId,
    pub title: String,
    pub link: String,
    pub description: String,
    pub author: String,
    pub pixmap_url: String,
    pub last_build: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    /// Newest first.
    pub items: Vec<Item>,
    /// Raw bytes of the downloaded channel image, if any.
    pub image: Option<Vec<u8>>,
    /// Raw bytes of the downloaded site favicon, if any.
    pub favicon: Option<Vec<u8>>,
}

impl Channel {
    pub fn new(title: impl Into<String>, link: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            link: link.into(),
            ..Self::default()
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Storage key of the channel: link and title concatenated.
    pub fn key(&self) -> String {
        format!("{}{}", self.link, self.title)
    }

    /// Channel equality used during reconciliation (title + link).
    pub fn is_same_channel(&self, other: &Channel) -> bool {
        self.title == other.title && self.link == other.link
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|i| i.unread).count()
    }

    /// Copy of the channel without its items, used for metadata-only persistence.
    pub fn metadata(&self) -> Channel {
        Channel {
            items: Vec::new(),
            ..self.clone()
        }
    }

    /// Image URL worth fetching: only absolute http(s) URLs qualify.
    pub fn image_url(&self) -> Option<&str> {
        let url = self.pixmap_url.trim();
        is_absolute_http_url(url).then_some(url)
    }

    /// `<origin of link>/favicon.ico`, if the link is a usable URL.
    pub fn favicon_url(&self) -> Option<String> {
        favicon_url(&self.link)
    }
}

// ============================================================================
// Feed
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Feed {
    pub url: String,
    /// Tags applied at subscription time.
    pub tags: Vec<String>,
    pub channels: Vec<Channel>,
}

impl Feed {
    pub fn new(url: impl Into<String>, tags: Vec<String>) -> Self {
        Self {
            url: url.into(),
            tags,
            channels: Vec::new(),
        }
    }

    pub fn unread_count(&self) -> usize {
        self.channels.iter().map(Channel::unread_count).sum()
    }
}
