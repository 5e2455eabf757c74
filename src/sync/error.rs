use std::path::PathBuf;
use thiserror::Error;

use super::jobs::JobId;
use crate::feed::ParseError;
use crate::model::ChannelId;

/// Failures of the synchronization engine.
///
/// None of these abort anything: every failure means "no mutation happened", optionally
/// with a message for the user. Consistency errors come from benign races (a feed removed
/// while its refresh was in flight) and are only logged.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The feed is already subscribed, or a subscription for it is in flight.
    #[error("This feed is already added: {0}")]
    FeedAlreadyAdded(String),

    /// The downloader refused the URL.
    #[error("Could not handle URL {0}")]
    CannotHandleUrl(String),

    /// The fetch completed but produced no bytes.
    #[error("Downloaded file for {url} has null size")]
    EmptyDownload { url: String },

    /// The downloaded file could not be read back.
    #[error("Could not read downloaded file {path:?}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The downloader reported a transport failure.
    #[error("Fetch of {url} failed: {reason}")]
    FetchFailed { url: String, reason: String },

    /// The document could not be parsed.
    #[error("Could not parse {url}: {source}")]
    Parse {
        url: String,
        #[source]
        source: ParseError,
    },

    /// No feed with this URL is in the registry.
    #[error("Feed with url {0} not found")]
    UnknownFeed(String),

    /// No channel with this handle is in the registry.
    #[error("Channel {0} not found")]
    UnknownChannel(ChannelId),

    /// A job id was registered twice; the first registration is kept.
    #[error("Job id {0} is already registered")]
    DuplicateJobId(JobId),
}

impl SyncError {
    /// Consistency errors reflect races, not failures, and are not shown to the user.
    pub fn is_benign(&self) -> bool {
        matches!(self, SyncError::UnknownFeed(_) | SyncError::UnknownChannel(_))
    }
}
