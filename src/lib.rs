//! feedsync: keeps a local store of RSS/Atom subscriptions in step with their sources.
//!
//! - [`feed`]: downloading, RSS/Atom parsing and OPML import
//! - [`sync`]: job correlation, reconciliation, retention and unread accounting
//! - [`storage`]: SQLite persistence of feeds, channels and items
//! - [`config`]: TOML configuration

pub mod config;
pub mod feed;
pub mod model;
pub mod storage;
pub mod sync;
pub mod util;
