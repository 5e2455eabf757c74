//! Merging freshly parsed channels into the registry.
//!
//! A subscription adopts the parsed channels as they are. A refresh matches every incoming
//! channel against the feed's existing ones (title + link), appends unmatched channels and
//! merges the items of matched ones into place, then applies retention:
//!
//! 1. each incoming item is inserted before the first existing item that is strictly
//!    older, so the list stays newest first and ties land ahead of older items;
//! 2. the list is cut to `max_items_per_channel`;
//! 3. everything from the first item older than `max_item_age_days` onwards is dropped,
//!    except that the newest item always survives the age rule.
//!
//! Every mutation is mirrored into the [`NotificationSink`]: storage operations always,
//! row events only for the displayed channel.
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::watch;

use super::classifier::ContentClassifier;
use super::error::SyncError;
use super::notify::{NotificationSink, StorageOp, ViewEvent};
use super::registry::FeedRegistry;
use crate::model::{AssetKind, Channel, ChannelId, Feed, Item};

// ============================================================================
// Policy & Clock
// ============================================================================

/// Retention limits, read afresh at the start of every refresh pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RetentionPolicy {
    pub max_items_per_channel: usize,
    pub max_item_age_days: i64,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            max_items_per_channel: 100,
            max_item_age_days: 30,
        }
    }
}

/// Source of "now" for age-based retention.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ============================================================================
// Report
// ============================================================================

/// An asset fetch the host should dispatch for a newly adopted channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetRequest {
    pub url: String,
    pub kind: AssetKind,
    pub channel: ChannelId,
}

/// Outcome of one adoption or refresh pass.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileReport {
    /// Human-readable lines, one per added or updated channel.
    pub summary: Vec<String>,
    /// Every channel that was added or merged into.
    pub changed_channels: Vec<ChannelId>,
    pub added_channels: usize,
    pub merged_items: usize,
    pub evicted_items: usize,
    pub asset_requests: Vec<AssetRequest>,
}

// ============================================================================
// Ordering & retention helpers
// ============================================================================

/// Index before the first item strictly older than `date`, or the end of the list.
pub fn insertion_index(items: &[Item], date: DateTime<Utc>) -> usize {
    items
        .iter()
        .position(|item| item.pub_date < date)
        .unwrap_or(items.len())
}

/// Whole calendar days between `pub_date` and `now`.
pub fn age_in_days(pub_date: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now.date_naive() - pub_date.date_naive()).num_days()
}

/// First index to evict under the age rule, never 0.
///
/// `None` when no item is older than `max_age_days`. When even the newest item is too old
/// the cut starts at 1, so a non-empty channel keeps its newest item.
pub fn age_cutoff(items: &[Item], now: DateTime<Utc>, max_age_days: i64) -> Option<usize> {
    let first_stale = items
        .iter()
        .position(|item| age_in_days(item.pub_date, now) > max_age_days)?;
    Some(first_stale.max(1))
}

/// Removes `channel.items[from..]`, persisting each removal and bracketing it with row
/// events when the channel is displayed. Returns the number of removed items.
fn evict_from(
    channel: &mut Channel,
    from: usize,
    live: bool,
    sink: &mut NotificationSink,
) -> usize {
    if from >= channel.items.len() {
        return 0;
    }
    let key = channel.key();
    let end = channel.items.len() - 1;
    if live {
        sink.view(ViewEvent::BeginRemoveRows { start: from, end });
    }
    let removed: Vec<Item> = channel.items.drain(from..).collect();
    let count = removed.len();
    for item in removed {
        sink.persist(StorageOp::RemoveItem {
            channel_key: key.clone(),
            item,
        });
    }
    if live {
        sink.view(ViewEvent::EndRemoveRows);
    }
    sink.channel_changed(channel.id);
    count
}

// ============================================================================
// Engine
// ============================================================================

pub struct ReconciliationEngine {
    retention: watch::Receiver<RetentionPolicy>,
    classifier: Box<dyn ContentClassifier>,
    clock: Box<dyn Clock>,
}

impl ReconciliationEngine {
    pub fn new(
        retention: watch::Receiver<RetentionPolicy>,
        classifier: Box<dyn ContentClassifier>,
    ) -> Self {
        Self {
            retention,
            classifier,
            clock: Box::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Current retention limits.
    pub fn retention(&self) -> RetentionPolicy {
        *self.retention.borrow()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Subscribes `url`: the parsed channels become the feed's channel list verbatim.
    ///
    /// Each channel receives the subscription tags and yields asset requests for its image
    /// (when it names an absolute URL) and favicon. The whole feed is persisted as new.
    /// No summary lines are produced.
    pub fn adopt_new_feed(
        &mut self,
        registry: &mut FeedRegistry,
        url: &str,
        tags: &[String],
        channels: Vec<Channel>,
        sink: &mut NotificationSink,
    ) -> Result<ReconcileReport, SyncError> {
        if registry.contains(url) {
            return Err(SyncError::FeedAlreadyAdded(url.to_owned()));
        }

        let mut feed = Feed::new(url, tags.to_vec());
        feed.channels = channels;
        for channel in &mut feed.channels {
            channel.tags = tags.to_vec();
        }
        registry.add(feed);

        let mut report = ReconcileReport::default();
        let Some(feed) = registry.get(url) else {
            return Ok(report);
        };
        for channel in &feed.channels {
            if let Some(image) = channel.image_url() {
                report.asset_requests.push(AssetRequest {
                    url: image.to_owned(),
                    kind: AssetKind::ChannelImage,
                    channel: channel.id(),
                });
            }
            if let Some(favicon) = channel.favicon_url() {
                report.asset_requests.push(AssetRequest {
                    url: favicon,
                    kind: AssetKind::Favicon,
                    channel: channel.id(),
                });
            }
            report.changed_channels.push(channel.id());
            sink.channel_changed(channel.id());
        }
        report.added_channels = feed.channels.len();
        sink.persist(StorageOp::AddFeed(feed.clone()));

        tracing::info!(url = %url, channels = feed.channels.len(), "Feed added");
        Ok(report)
    }

    /// Merges a refresh of `url` into the registry.
    ///
    /// Fails with [`SyncError::UnknownFeed`] without touching anything when the feed is no
    /// longer registered. `displayed` selects the channel whose row changes are reported.
    pub fn reconcile(
        &mut self,
        registry: &mut FeedRegistry,
        url: &str,
        incoming: Vec<Channel>,
        displayed: Option<ChannelId>,
        sink: &mut NotificationSink,
    ) -> Result<ReconcileReport, SyncError> {
        let policy = self.retention();
        let now = self.clock.now();
        let (feed, ids) = registry
            .feed_mut(url)
            .ok_or_else(|| SyncError::UnknownFeed(url.to_owned()))?;

        let mut report = ReconcileReport::default();
        for channel in incoming {
            match feed.channels.iter().position(|c| c.is_same_channel(&channel)) {
                None => {
                    let mut channel = channel;
                    ids.assign(&mut channel);
                    report.summary.push(format!(
                        "Added channel \"{}\" (has {} items)",
                        channel.title,
                        channel.items.len()
                    ));
                    sink.persist(StorageOp::AddChannel {
                        feed_url: url.to_owned(),
                        channel: channel.clone(),
                    });
                    sink.channel_changed(channel.id);
                    report.changed_channels.push(channel.id);
                    report.added_channels += 1;
                    feed.channels.push(channel);
                }
                Some(position) => {
                    let existing = &mut feed.channels[position];
                    self.merge_channel(url, existing, channel, policy, now, displayed, sink, &mut report);
                }
            }
        }

        tracing::debug!(
            url = %url,
            added_channels = report.added_channels,
            merged = report.merged_items,
            evicted = report.evicted_items,
            "Feed reconciled"
        );
        Ok(report)
    }

    #[allow(clippy::too_many_arguments)]
    fn merge_channel(
        &mut self,
        feed_url: &str,
        existing: &mut Channel,
        incoming: Channel,
        policy: RetentionPolicy,
        now: DateTime<Utc>,
        displayed: Option<ChannelId>,
        sink: &mut NotificationSink,
        report: &mut ReconcileReport,
    ) {
        let live = displayed == Some(existing.id);
        let key = existing.key();
        let Channel {
            title,
            description,
            author,
            pixmap_url,
            last_build,
            items,
            ..
        } = incoming;

        if !description.is_empty() {
            existing.description = description;
        }
        if !author.is_empty() {
            existing.author = author;
        }
        if !pixmap_url.is_empty() {
            existing.pixmap_url = pixmap_url;
        }

        if !items.is_empty() {
            report.summary.push(format!(
                "Updated channel \"{}\" ({} new items)",
                title,
                items.len()
            ));
        }

        for item in items {
            sink.persist(StorageOp::AddItem {
                channel_key: key.clone(),
                item: item.clone(),
            });
            let position = insertion_index(&existing.items, item.pub_date);
            if live {
                sink.view(ViewEvent::BeginInsertRows {
                    start: position,
                    end: position,
                });
            }
            existing.items.insert(position, item);
            if live {
                sink.view(ViewEvent::EndInsertRows);
            }
            self.classifier.classify(&existing.items[position]);
            report.merged_items += 1;
        }

        if last_build.is_some() {
            existing.last_build = last_build;
        } else if let Some(newest) = existing.items.first() {
            existing.last_build = Some(newest.pub_date);
        }

        sink.persist(StorageOp::UpdateChannel {
            feed_url: feed_url.to_owned(),
            channel: existing.metadata(),
        });
        sink.channel_changed(existing.id);
        report.changed_channels.push(existing.id);

        if existing.items.len() > policy.max_items_per_channel {
            tracing::debug!(
                channel = %existing.title,
                items = existing.items.len(),
                limit = policy.max_items_per_channel,
                "Evicting items over the count limit"
            );
            report.evicted_items += evict_from(existing, policy.max_items_per_channel, live, sink);
        }

        if let Some(cutoff) = age_cutoff(&existing.items, now, policy.max_item_age_days) {
            let evicted = evict_from(existing, cutoff, live, sink);
            if evicted > 0 {
                tracing::debug!(
                    channel = %existing.title,
                    evicted = evicted,
                    max_age_days = policy.max_item_age_days,
                    "Evicted items over the age limit"
                );
            }
            report.evicted_items += evicted;
        }
    }
}
