use super::error::SyncError;
use super::notify::{NotificationSink, StorageOp, ViewEvent};
use super::registry::FeedRegistry;
use crate::model::ChannelId;

/// Total unread count across the registry, plus read/unread transitions.
///
/// The count is always a fresh scan of every item. Marking never recomputes; callers
/// recompute once after a batch of marks.
#[derive(Debug, Default)]
pub struct UnreadAggregator {
    last: Option<usize>,
}

impl UnreadAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Unread items across every feed and channel.
    pub fn count(registry: &FeedRegistry) -> usize {
        registry.feeds().map(|feed| feed.unread_count()).sum()
    }

    /// Rescans the registry and emits `UnreadCountChanged` when the total moved.
    pub fn recompute(&mut self, registry: &FeedRegistry, sink: &mut NotificationSink) -> usize {
        let total = Self::count(registry);
        if self.last != Some(total) {
            tracing::debug!(unread = total, "Unread count changed");
            sink.view(ViewEvent::UnreadCountChanged(total));
            self.last = Some(total);
        }
        total
    }

    /// Last computed total, if any.
    pub fn last(&self) -> Option<usize> {
        self.last
    }

    /// Sets the flag of the item at `row` of `channel`.
    ///
    /// Returns whether the flag changed; only a change is persisted.
    pub fn mark_item(
        registry: &mut FeedRegistry,
        channel: ChannelId,
        row: usize,
        unread: bool,
        sink: &mut NotificationSink,
    ) -> Result<bool, SyncError> {
        let channel = registry
            .channel_mut(channel)
            .ok_or(SyncError::UnknownChannel(channel))?;
        let (id, key) = (channel.id(), channel.key());
        let Some(item) = channel.items.get_mut(row) else {
            tracing::debug!(channel = %id, row, "Mark for a row past the end ignored");
            return Ok(false);
        };
        if item.unread == unread {
            return Ok(false);
        }
        item.unread = unread;
        sink.persist(StorageOp::UpdateItem {
            channel_key: key,
            item: item.clone(),
        });
        Ok(true)
    }

    /// Sets the flag of every item in `channel`. Returns how many items changed.
    pub fn mark_channel(
        registry: &mut FeedRegistry,
        channel: ChannelId,
        unread: bool,
        sink: &mut NotificationSink,
    ) -> Result<usize, SyncError> {
        let channel = registry
            .channel_mut(channel)
            .ok_or(SyncError::UnknownChannel(channel))?;
        let key = channel.key();
        let mut changed = 0;
        for item in channel.items.iter_mut().filter(|i| i.unread != unread) {
            item.unread = unread;
            sink.persist(StorageOp::UpdateItem {
                channel_key: key.clone(),
                item: item.clone(),
            });
            changed += 1;
        }
        Ok(changed)
    }
}
