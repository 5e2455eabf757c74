//! Adapters between the engine and the outside world's documents.
//!
//! - [`parser`] turns RSS/Atom bytes into [`Channel`](crate::model::Channel)s using `feed-rs`
//! - [`fetcher`] downloads documents to local files, one tokio task per job
//! - [`opml`] reads OPML subscription lists for bulk import

mod fetcher;
mod opml;
mod parser;

pub use fetcher::{
    build_client, fetch_bytes, Downloader, FetchError, FetchEvent, HttpDownloader, RetryPolicy,
};
pub use opml::{parse_file, parse_opml, OpmlError, OpmlOutline};
pub use parser::{parse_channels, ParseError};
