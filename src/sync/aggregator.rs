//! Single owner of the engine state.
//!
//! [`Aggregator`] holds the registry, the job and asset correlation tables, the
//! reconciliation engine and the notification sink, and is the only thing that dispatches
//! downloads. Every entry point takes `&mut self`, so all mutation is serialised by
//! whoever owns the aggregator (normally one task selecting over downloader events).
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use super::assets::ExternalAssetCorrelator;
use super::error::SyncError;
use super::jobs::{JobId, JobRole, PendingJob, PendingJobTracker};
use super::notify::{Notice, NotificationSink, StorageOp, ViewEvent};
use super::reconcile::{AssetRequest, ReconciliationEngine};
use super::registry::FeedRegistry;
use super::unread::UnreadAggregator;
use crate::feed::{parse_channels, parse_file, Downloader, FetchError, FetchEvent, OpmlError};
use crate::model::{ChannelId, Feed};
use crate::storage::{Database, DatabaseError};

/// Removes a downloaded temp file when handling of its job ends.
struct TempFile<'a>(&'a Path);

impl Drop for TempFile<'_> {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::debug!(path = %self.0.display(), error = %e, "Failed to remove temp file");
            }
        }
    }
}

/// Trims, drops blanks and duplicates, keeps first-seen order.
fn normalize_tags(tags: impl IntoIterator<Item = String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for tag in tags {
        let tag = tag.trim();
        if !tag.is_empty() && !out.iter().any(|t| t == tag) {
            out.push(tag.to_owned());
        }
    }
    out
}

pub struct Aggregator<D: Downloader> {
    downloader: D,
    registry: FeedRegistry,
    jobs: PendingJobTracker,
    assets: ExternalAssetCorrelator,
    engine: ReconciliationEngine,
    unread: UnreadAggregator,
    sink: NotificationSink,
    displayed: Option<ChannelId>,
    known_tags: BTreeSet<String>,
    temp_dir: PathBuf,
    temp_seq: u64,
}

impl<D: Downloader> Aggregator<D> {
    pub fn new(downloader: D, engine: ReconciliationEngine) -> Self {
        Self {
            downloader,
            registry: FeedRegistry::new(),
            jobs: PendingJobTracker::new(),
            assets: ExternalAssetCorrelator::new(),
            engine,
            unread: UnreadAggregator::new(),
            sink: NotificationSink::new(),
            displayed: None,
            known_tags: BTreeSet::new(),
            temp_dir: std::env::temp_dir(),
            temp_seq: 0,
        }
    }

    /// Seeds the registry with previously stored feeds.
    pub fn with_feeds(mut self, feeds: Vec<Feed>) -> Self {
        for feed in &feeds {
            self.known_tags.extend(feed.tags.iter().cloned());
            for channel in &feed.channels {
                self.known_tags.extend(channel.tags.iter().cloned());
            }
        }
        self.registry = FeedRegistry::from_feeds(feeds);
        self.unread.recompute(&self.registry, &mut self.sink);
        self
    }

    pub fn with_global_tags(mut self, tags: impl IntoIterator<Item = String>) -> Self {
        self.known_tags.extend(normalize_tags(tags));
        self
    }

    /// Directory for in-flight downloads. Defaults to the system temp dir.
    pub fn with_temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.temp_dir = dir.into();
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn registry(&self) -> &FeedRegistry {
        &self.registry
    }

    pub fn downloader(&self) -> &D {
        &self.downloader
    }

    pub fn pending_jobs(&self) -> usize {
        self.jobs.len()
    }

    pub fn pending_assets(&self) -> usize {
        self.assets.len()
    }

    pub fn unread_count(&self) -> usize {
        UnreadAggregator::count(&self.registry)
    }

    pub fn known_tags(&self) -> &BTreeSet<String> {
        &self.known_tags
    }

    pub fn displayed_channel(&self) -> Option<ChannelId> {
        self.displayed
    }

    pub fn save_scheduled(&self) -> bool {
        self.sink.save_scheduled()
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        self.sink.take_notices()
    }

    pub fn take_events(&mut self) -> Vec<ViewEvent> {
        self.sink.take_events()
    }

    pub fn pending_ops(&self) -> &[StorageOp] {
        self.sink.pending_ops()
    }

    /// Writes queued storage operations in one transaction.
    pub async fn flush(&mut self, db: &Database) -> Result<usize, DatabaseError> {
        self.sink.flush(db).await
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Starts subscribing to `url`. The feed appears once its first fetch completes.
    pub fn add_feed(&mut self, url: &str, tags: Vec<String>) -> Result<JobId, SyncError> {
        let url = url.trim();
        if self.registry.contains(url) || self.jobs.is_adding(url) {
            return Err(SyncError::FeedAlreadyAdded(url.to_owned()));
        }
        if !self.downloader.could_fetch(url) {
            return Err(SyncError::CannotHandleUrl(url.to_owned()));
        }

        let tags = normalize_tags(tags);
        self.known_tags.extend(tags.iter().cloned());
        let dest = self.next_temp_path();
        let job_id = self.dispatch(url, &dest)?;
        self.track(job_id, PendingJob::new_feed(url, dest, tags))?;
        tracing::debug!(url = %url, job_id = %job_id, "Subscription fetch dispatched");
        Ok(job_id)
    }

    /// Starts a refresh of one subscribed feed.
    pub fn update_feed(&mut self, url: &str) -> Result<JobId, SyncError> {
        if !self.registry.contains(url) {
            return Err(SyncError::UnknownFeed(url.to_owned()));
        }
        if !self.downloader.could_fetch(url) {
            return Err(SyncError::CannotHandleUrl(url.to_owned()));
        }

        let dest = self.next_temp_path();
        let job_id = self.dispatch(url, &dest)?;
        self.track(job_id, PendingJob::refresh(url, dest))?;
        tracing::debug!(url = %url, job_id = %job_id, "Refresh dispatched");
        Ok(job_id)
    }

    /// Starts a refresh of every feed. Dispatch failures become error notices.
    pub fn update_all(&mut self) -> Vec<JobId> {
        let mut dispatched = Vec::new();
        for url in self.registry.urls() {
            match self.update_feed(&url) {
                Ok(job_id) => dispatched.push(job_id),
                Err(e) => self.report(e),
            }
        }
        tracing::info!(feeds = dispatched.len(), "Refreshing all feeds");
        dispatched
    }

    /// Unsubscribes `url`. Refreshes still in flight for it resolve as no-ops.
    pub fn remove_feed(&mut self, url: &str) -> Result<Feed, SyncError> {
        let feed = self
            .registry
            .remove(url)
            .ok_or_else(|| SyncError::UnknownFeed(url.to_owned()))?;

        if let Some(displayed) = self.displayed {
            if feed.channels.iter().any(|c| c.id() == displayed) {
                self.displayed = None;
                self.sink.view(ViewEvent::Reset);
            }
        }
        self.sink.persist(StorageOp::RemoveFeed { url: url.to_owned() });
        self.unread.recompute(&self.registry, &mut self.sink);
        self.sink.schedule_save();
        tracing::info!(url = %url, channels = feed.channels.len(), "Feed removed");
        Ok(feed)
    }

    /// Unsubscribes the feed that owns `channel`.
    pub fn remove_feed_of_channel(&mut self, channel: ChannelId) -> Result<Feed, SyncError> {
        let url = self
            .registry
            .find_channel_owner(channel)
            .map(str::to_owned)
            .ok_or(SyncError::UnknownChannel(channel))?;
        self.remove_feed(&url)
    }

    /// Subscribes every feed listed in an OPML file.
    ///
    /// Each feed gets `tags` plus the categories of its outline. Per-feed failures are
    /// returned alongside the URL rather than aborting the import.
    pub async fn import_opml(
        &mut self,
        path: &Path,
        tags: &[String],
    ) -> Result<Vec<(String, Result<JobId, SyncError>)>, OpmlError> {
        let outlines = parse_file(path).await?;
        let mut results = Vec::with_capacity(outlines.len());
        for outline in outlines {
            let feed_tags = normalize_tags(tags.iter().cloned().chain(outline.categories));
            let result = self.add_feed(&outline.xml_url, feed_tags);
            results.push((outline.xml_url, result));
        }
        tracing::info!(
            path = %path.display(),
            feeds = results.len(),
            dispatched = results.iter().filter(|(_, r)| r.is_ok()).count(),
            "Imported OPML"
        );
        Ok(results)
    }

    // ========================================================================
    // View
    // ========================================================================

    /// Selects the channel whose item mutations produce row events.
    pub fn set_displayed_channel(&mut self, channel: Option<ChannelId>) {
        self.displayed = channel;
        self.sink.view(ViewEvent::Reset);
    }

    pub fn mark_item(&mut self, channel: ChannelId, row: usize, unread: bool) -> Result<bool, SyncError> {
        let changed = UnreadAggregator::mark_item(&mut self.registry, channel, row, unread, &mut self.sink)?;
        if changed {
            if self.displayed == Some(channel) {
                self.sink.view(ViewEvent::RowsChanged { start: row, end: row });
            }
            self.sink.channel_changed(channel);
            self.unread.recompute(&self.registry, &mut self.sink);
            self.sink.schedule_save();
        }
        Ok(changed)
    }

    pub fn mark_channel(&mut self, channel: ChannelId, unread: bool) -> Result<usize, SyncError> {
        let changed = UnreadAggregator::mark_channel(&mut self.registry, channel, unread, &mut self.sink)?;
        if changed > 0 {
            if self.displayed == Some(channel) {
                let rows = self.registry.channel(channel).map_or(0, |c| c.items.len());
                if rows > 0 {
                    self.sink.view(ViewEvent::RowsChanged { start: 0, end: rows - 1 });
                }
            }
            self.sink.channel_changed(channel);
            self.unread.recompute(&self.registry, &mut self.sink);
            self.sink.schedule_save();
        }
        Ok(changed)
    }

    /// Replaces a channel's tags.
    pub fn set_channel_tags(&mut self, channel: ChannelId, tags: Vec<String>) -> Result<(), SyncError> {
        let feed_url = self
            .registry
            .find_channel_owner(channel)
            .map(str::to_owned)
            .ok_or(SyncError::UnknownChannel(channel))?;
        let tags = normalize_tags(tags);
        self.known_tags.extend(tags.iter().cloned());

        let target = self
            .registry
            .channel_mut(channel)
            .ok_or(SyncError::UnknownChannel(channel))?;
        target.tags = tags;
        self.sink.persist(StorageOp::UpdateChannel {
            feed_url,
            channel: target.metadata(),
        });
        self.sink.channel_changed(channel);
        self.sink.schedule_save();
        Ok(())
    }

    // ========================================================================
    // Downloader events
    // ========================================================================

    /// Routes one downloader event. Failures become notices, benign ones only logs.
    pub fn handle_event(&mut self, event: FetchEvent) {
        let result = match event {
            FetchEvent::Finished(job_id) => self.handle_job_finished(job_id),
            FetchEvent::Failed { job_id, error } => self.handle_job_error(job_id, &error),
            FetchEvent::Removed(job_id) => {
                self.handle_job_removed(job_id);
                Ok(())
            }
        };
        if let Err(e) = result {
            self.report(e);
        }
    }

    /// Consumes a completed job. The job and its temp file are gone afterwards, whatever
    /// the outcome. Unknown ids (already consumed) are ignored.
    pub fn handle_job_finished(&mut self, job_id: JobId) -> Result<(), SyncError> {
        let Some(job) = self.jobs.resolve(job_id) else {
            tracing::debug!(job_id = %job_id, "Completion for unknown job ignored");
            return Ok(());
        };
        let _cleanup = TempFile(&job.temp_path);

        match &job.role {
            JobRole::NewFeedFetch { tags } => self.finish_new_feed(&job, tags),
            JobRole::FeedRefreshFetch => self.finish_refresh(&job),
            JobRole::ExternalAssetFetch { .. } => self.finish_asset(job_id, &job),
        }
    }

    /// Consumes a failed job.
    pub fn handle_job_error(&mut self, job_id: JobId, error: &FetchError) -> Result<(), SyncError> {
        let Some(job) = self.jobs.resolve(job_id) else {
            tracing::debug!(job_id = %job_id, "Failure for unknown job ignored");
            return Ok(());
        };
        let _cleanup = TempFile(&job.temp_path);

        if let JobRole::ExternalAssetFetch { kind, channel } = &job.role {
            self.assets.resolve(job_id);
            tracing::debug!(url = %job.url, kind = %kind, channel = %channel, error = %error, "Asset fetch failed");
            return Ok(());
        }
        Err(SyncError::FetchFailed {
            url: job.url.clone(),
            reason: error.to_string(),
        })
    }

    /// Drops a job the downloader cancelled.
    pub fn handle_job_removed(&mut self, job_id: JobId) {
        if let Some(job) = self.jobs.forget(job_id) {
            let _cleanup = TempFile(&job.temp_path);
            if matches!(job.role, JobRole::ExternalAssetFetch { .. }) {
                self.assets.resolve(job_id);
            }
        }
    }

    /// Cancels every job still in flight.
    pub fn cancel_all(&mut self) -> usize {
        let ids = self.jobs.ids();
        let mut cancelled = 0;
        for id in ids {
            if self.downloader.cancel(id) {
                cancelled += 1;
            }
            self.handle_job_removed(id);
        }
        cancelled
    }

    // ========================================================================
    // Job completion paths
    // ========================================================================

    fn finish_new_feed(&mut self, job: &PendingJob, tags: &[String]) -> Result<(), SyncError> {
        if self.registry.contains(&job.url) {
            return Err(SyncError::FeedAlreadyAdded(job.url.clone()));
        }
        let bytes = read_download(job)?;
        let channels = parse_channels(&bytes, &[], self.engine.now()).map_err(|source| SyncError::Parse {
            url: job.url.clone(),
            source,
        })?;

        let report = self
            .engine
            .adopt_new_feed(&mut self.registry, &job.url, tags, channels, &mut self.sink)?;
        for request in report.asset_requests {
            self.fetch_asset(request);
        }
        self.unread.recompute(&self.registry, &mut self.sink);
        self.sink.schedule_save();
        Ok(())
    }

    fn finish_refresh(&mut self, job: &PendingJob) -> Result<(), SyncError> {
        let bytes = read_download(job)?;
        let channels = {
            let feed = self
                .registry
                .get(&job.url)
                .ok_or_else(|| SyncError::UnknownFeed(job.url.clone()))?;
            parse_channels(&bytes, &feed.channels, self.engine.now()).map_err(|source| SyncError::Parse {
                url: job.url.clone(),
                source,
            })?
        };

        let report = self.engine.reconcile(
            &mut self.registry,
            &job.url,
            channels,
            self.displayed,
            &mut self.sink,
        )?;
        tracing::info!(
            url = %job.url,
            new_items = report.merged_items,
            new_channels = report.added_channels,
            evicted = report.evicted_items,
            "Feed updated"
        );
        self.sink.report_update(&report.summary);
        self.unread.recompute(&self.registry, &mut self.sink);
        self.sink.schedule_save();
        Ok(())
    }

    fn finish_asset(&mut self, job_id: JobId, job: &PendingJob) -> Result<(), SyncError> {
        let bytes = match read_download(job) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.assets.resolve(job_id);
                tracing::debug!(url = %job.url, error = %e, "Unusable asset download");
                return Ok(());
            }
        };
        if self
            .assets
            .complete(job_id, bytes, &mut self.registry, &mut self.sink)
            .is_some()
        {
            self.sink.schedule_save();
        }
        Ok(())
    }

    fn fetch_asset(&mut self, request: AssetRequest) {
        if !self.downloader.could_fetch(&request.url) {
            tracing::debug!(url = %request.url, kind = %request.kind, "Skipping asset URL");
            return;
        }
        let dest = self.next_temp_path();
        let job_id = match self.dispatch(&request.url, &dest) {
            Ok(job_id) => job_id,
            Err(e) => {
                tracing::warn!(url = %request.url, error = %e, "Could not dispatch asset fetch");
                return;
            }
        };
        let job = PendingJob::asset(&request.url, dest, request.kind, request.channel);
        if self.track(job_id, job).is_ok() {
            tracing::debug!(
                url = %request.url,
                kind = %request.kind,
                job_id = %job_id,
                in_flight = self.assets.pending_for(&request.url) + 1,
                "Asset fetch dispatched"
            );
            self.assets
                .register(job_id, request.url, request.kind, request.channel);
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn dispatch(&mut self, url: &str, dest: &Path) -> Result<JobId, SyncError> {
        self.downloader
            .dispatch(url, dest)
            .map_err(|e| SyncError::FetchFailed {
                url: url.to_owned(),
                reason: e.to_string(),
            })
    }

    /// Records a dispatched job. A rejected record cancels the download it belonged to.
    fn track(&mut self, job_id: JobId, job: PendingJob) -> Result<(), SyncError> {
        let temp_path = job.temp_path.clone();
        if let Err(e) = self.jobs.register(job_id, job) {
            self.downloader.cancel(job_id);
            let _cleanup = TempFile(&temp_path);
            return Err(e);
        }
        Ok(())
    }

    fn next_temp_path(&mut self) -> PathBuf {
        self.temp_seq += 1;
        self.temp_dir
            .join(format!("feedsync-{}-{}.part", std::process::id(), self.temp_seq))
    }

    fn report(&mut self, error: SyncError) {
        if error.is_benign() {
            tracing::debug!(error = %error, "Ignoring benign engine error");
        } else {
            tracing::warn!(error = %error, "Engine error");
            self.sink.report_error(error.to_string());
        }
    }
}

fn read_download(job: &PendingJob) -> Result<Vec<u8>, SyncError> {
    let bytes = std::fs::read(&job.temp_path).map_err(|source| SyncError::Unreadable {
        path: job.temp_path.clone(),
        source,
    })?;
    if bytes.is_empty() {
        return Err(SyncError::EmptyDownload { url: job.url.clone() });
    }
    Ok(bytes)
}
