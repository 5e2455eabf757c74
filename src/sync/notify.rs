//! Boundary between the engine and its observers.
//!
//! The engine never calls storage or the view directly. It records what happened in a
//! [`NotificationSink`]: storage operations are queued until the host flushes them (so a
//! burst of mutations becomes one transaction), view events and user notices are queued
//! until the host drains them.
use crate::model::{Channel, ChannelId, Feed, Item};
use crate::storage::{Database, DatabaseError};

/// One persistence call, mirroring the storage backend interface.
#[derive(Debug, Clone, PartialEq)]
pub enum StorageOp {
    AddFeed(Feed),
    RemoveFeed { url: String },
    AddChannel { feed_url: String, channel: Channel },
    /// Metadata only; `channel.items` is empty.
    UpdateChannel { feed_url: String, channel: Channel },
    AddItem { channel_key: String, item: Item },
    UpdateItem { channel_key: String, item: Item },
    RemoveItem { channel_key: String, item: Item },
}

/// Change notifications for a view of the displayed channel.
///
/// Row events are bracketed: every `Begin*` is followed by its `End*` once the item list
/// has been mutated. Row ranges are inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewEvent {
    BeginInsertRows { start: usize, end: usize },
    EndInsertRows,
    BeginRemoveRows { start: usize, end: usize },
    EndRemoveRows,
    RowsChanged { start: usize, end: usize },
    /// The displayed channel changed or vanished; rebuild everything.
    Reset,
    ChannelDataChanged(ChannelId),
    UnreadCountChanged(usize),
}

/// A message meant for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Updated(String),
    Error(String),
}

#[derive(Debug, Default)]
pub struct NotificationSink {
    ops: Vec<StorageOp>,
    events: Vec<ViewEvent>,
    notices: Vec<Notice>,
    save_scheduled: bool,
}

impl NotificationSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn persist(&mut self, op: StorageOp) {
        self.ops.push(op);
    }

    pub fn view(&mut self, event: ViewEvent) {
        self.events.push(event);
    }

    pub fn channel_changed(&mut self, id: ChannelId) {
        // Collapse repeats: the same channel is often touched several times per pass.
        if self.events.last() != Some(&ViewEvent::ChannelDataChanged(id)) {
            self.events.push(ViewEvent::ChannelDataChanged(id));
        }
    }

    /// Surfaces a refresh summary. Empty summaries produce no notice.
    pub fn report_update(&mut self, lines: &[String]) {
        if lines.is_empty() {
            return;
        }
        let mut text = String::from("Aggregator updated:");
        for line in lines {
            text.push('\n');
            text.push_str(line);
        }
        self.notices.push(Notice::Updated(text));
    }

    pub fn report_error(&mut self, message: impl Into<String>) {
        self.notices.push(Notice::Error(message.into()));
    }

    /// Marks state as needing a save. Returns true only for the call that scheduled it,
    /// so the host arms one debounce timer per burst.
    pub fn schedule_save(&mut self) -> bool {
        if self.save_scheduled {
            return false;
        }
        self.save_scheduled = true;
        true
    }

    pub fn save_scheduled(&self) -> bool {
        self.save_scheduled
    }

    pub fn pending_ops(&self) -> &[StorageOp] {
        &self.ops
    }

    pub fn take_ops(&mut self) -> Vec<StorageOp> {
        std::mem::take(&mut self.ops)
    }

    pub fn take_events(&mut self) -> Vec<ViewEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Writes every queued operation in one transaction and clears the scheduled save.
    ///
    /// On failure the batch is put back in front of anything queued meanwhile and the save
    /// stays scheduled, so the next flush retries it.
    pub async fn flush(&mut self, db: &Database) -> Result<usize, DatabaseError> {
        self.save_scheduled = false;
        if self.ops.is_empty() {
            return Ok(0);
        }
        let batch = self.take_ops();
        match db.apply_ops(&batch).await {
            Ok(()) => {
                tracing::debug!(ops = batch.len(), "Flushed storage operations");
                Ok(batch.len())
            }
            Err(e) => {
                tracing::warn!(ops = batch.len(), error = %e, "Storage flush failed, re-queueing");
                let later = std::mem::replace(&mut self.ops, batch);
                self.ops.extend(later);
                self.save_scheduled = true;
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schedule_save_debounces() {
        let mut sink = NotificationSink::new();
        assert!(sink.schedule_save());
        assert!(!sink.schedule_save());
        assert!(sink.save_scheduled());
    }

    #[test]
    fn test_report_update_formats_lines() {
        let mut sink = NotificationSink::new();
        sink.report_update(&[]);
        assert!(sink.take_notices().is_empty());

        sink.report_update(&[
            "Added channel \"A\" (has 2 items)".to_string(),
            "Updated channel \"B\" (1 new items)".to_string(),
        ]);
        assert_eq!(
            sink.take_notices(),
            vec![Notice::Updated(
                "Aggregator updated:\nAdded channel \"A\" (has 2 items)\nUpdated channel \"B\" (1 new items)"
                    .to_string()
            )]
        );
    }

    #[test]
    fn test_channel_changed_collapses_repeats() {
        let mut sink = NotificationSink::new();
        sink.channel_changed(ChannelId(1));
        sink.channel_changed(ChannelId(1));
        sink.channel_changed(ChannelId(2));
        sink.channel_changed(ChannelId(1));
        assert_eq!(
            sink.take_events(),
            vec![
                ViewEvent::ChannelDataChanged(ChannelId(1)),
                ViewEvent::ChannelDataChanged(ChannelId(2)),
                ViewEvent::ChannelDataChanged(ChannelId(1)),
            ]
        );
    }

    #[tokio::test]
    async fn test_flush_writes_and_clears_queue() {
        let db = Database::open(":memory:").await.unwrap();
        let mut sink = NotificationSink::new();
        sink.persist(StorageOp::AddFeed(Feed::new("https://example.com/rss", vec![])));
        sink.schedule_save();

        let written = sink.flush(&db).await.unwrap();
        assert_eq!(written, 1);
        assert!(sink.pending_ops().is_empty());
        assert!(!sink.save_scheduled());

        let feeds = db.load_feeds().await.unwrap();
        assert_eq!(feeds.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_batch_and_schedule() {
        let db = Database::open(":memory:").await.unwrap();
        db.pool.close().await;
        let mut sink = NotificationSink::new();
        sink.persist(StorageOp::AddFeed(Feed::new("https://example.com/rss", vec![])));
        sink.schedule_save();

        assert!(sink.flush(&db).await.is_err());
        assert_eq!(sink.pending_ops().len(), 1);
        assert!(sink.save_scheduled());
    }
}
