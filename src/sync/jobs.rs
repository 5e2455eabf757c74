use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use super::error::SyncError;
use crate::model::{AssetKind, ChannelId};

/// Opaque identifier the downloader hands out for a dispatched fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a fetch was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobRole {
    /// First fetch of a feed being subscribed; `tags` are applied to its channels.
    NewFeedFetch { tags: Vec<String> },
    /// Periodic or manual refresh of a subscribed feed.
    FeedRefreshFetch,
    /// Channel image or favicon for `channel`.
    ExternalAssetFetch { kind: AssetKind, channel: ChannelId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingJob {
    pub role: JobRole,
    pub url: String,
    pub temp_path: PathBuf,
}

impl PendingJob {
    pub fn new_feed(url: impl Into<String>, temp_path: PathBuf, tags: Vec<String>) -> Self {
        Self {
            role: JobRole::NewFeedFetch { tags },
            url: url.into(),
            temp_path,
        }
    }

    pub fn refresh(url: impl Into<String>, temp_path: PathBuf) -> Self {
        Self {
            role: JobRole::FeedRefreshFetch,
            url: url.into(),
            temp_path,
        }
    }

    pub fn asset(url: impl Into<String>, temp_path: PathBuf, kind: AssetKind, channel: ChannelId) -> Self {
        Self {
            role: JobRole::ExternalAssetFetch { kind, channel },
            url: url.into(),
            temp_path,
        }
    }
}

/// Correlates in-flight fetch jobs with the reason they were started.
///
/// Every job is consumed at most once: [`resolve`](Self::resolve) takes the record out,
/// so a completion delivered twice by the downloader finds nothing the second time.
#[derive(Debug, Default)]
pub struct PendingJobTracker {
    jobs: HashMap<JobId, PendingJob>,
}

impl PendingJobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a dispatched job. On an id collision the existing record wins.
    pub fn register(&mut self, id: JobId, job: PendingJob) -> Result<(), SyncError> {
        if let Some(existing) = self.jobs.get(&id) {
            tracing::warn!(
                job_id = %id,
                existing_url = %existing.url,
                rejected_url = %job.url,
                "Duplicate job id, keeping the first registration"
            );
            return Err(SyncError::DuplicateJobId(id));
        }
        self.jobs.insert(id, job);
        Ok(())
    }

    /// Removes and returns the record for `id`.
    pub fn resolve(&mut self, id: JobId) -> Option<PendingJob> {
        self.jobs.remove(&id)
    }

    /// Drops the record for a job cancelled by the downloader. Absent ids are ignored.
    pub fn forget(&mut self, id: JobId) -> Option<PendingJob> {
        let job = self.jobs.remove(&id);
        if job.is_none() {
            tracing::debug!(job_id = %id, "Forget for unknown job ignored");
        }
        job
    }

    /// True while a subscription fetch for `url` is in flight.
    pub fn is_adding(&self, url: &str) -> bool {
        self.jobs
            .values()
            .any(|job| job.url == url && matches!(job.role, JobRole::NewFeedFetch { .. }))
    }

    /// Ids of every job still in flight, in no particular order.
    pub fn ids(&self) -> Vec<JobId> {
        self.jobs.keys().copied().collect()
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
