//! Synchronization and retention engine.
//!
//! Downloads are started through a [`Downloader`](crate::feed::Downloader) and come back
//! as events. [`Aggregator`] correlates each completion with the job that started it,
//! merges the parsed channels into the [`FeedRegistry`], applies retention and records
//! storage operations, view events and user notices in a [`NotificationSink`].

mod aggregator;
mod assets;
mod classifier;
mod error;
mod jobs;
mod notify;
mod reconcile;
mod registry;
mod unread;

pub use aggregator::Aggregator;
pub use assets::{ExternalAssetCorrelator, ExternalAssetEntry};
pub use classifier::{ClassifierHit, ClassifierRule, ContentClassifier, KeywordClassifier, NoopClassifier};
pub use error::SyncError;
pub use jobs::{JobId, JobRole, PendingJob, PendingJobTracker};
pub use notify::{Notice, NotificationSink, StorageOp, ViewEvent};
pub use reconcile::{
    age_cutoff, age_in_days, insertion_index, AssetRequest, Clock, ReconcileReport, ReconciliationEngine,
    RetentionPolicy, SystemClock,
};
pub use registry::FeedRegistry;
pub use unread::UnreadAggregator;
