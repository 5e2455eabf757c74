use std::collections::HashMap;

use super::jobs::JobId;
use super::notify::{NotificationSink, StorageOp};
use super::registry::FeedRegistry;
use crate::model::{AssetKind, ChannelId};

/// What an in-flight asset fetch is for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalAssetEntry {
    pub url: String,
    pub kind: AssetKind,
    pub channel: ChannelId,
}

/// Correlates asset fetches (channel images, favicons) with the channel they decorate.
///
/// Entries are keyed by the fetch job, so channels sharing an asset URL (several feeds
/// on one site all point at `<origin>/favicon.ico`) each get their own download. They
/// hold a channel handle, not a reference: a channel removed while its asset was
/// downloading simply fails to resolve in the registry.
#[derive(Debug, Default)]
pub struct ExternalAssetCorrelator {
    entries: HashMap<JobId, ExternalAssetEntry>,
}

impl ExternalAssetCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an asset fetch. On a job id collision the existing entry wins and the
    /// rejected one is returned.
    pub fn register(
        &mut self,
        job_id: JobId,
        url: impl Into<String>,
        kind: AssetKind,
        channel: ChannelId,
    ) -> Option<ExternalAssetEntry> {
        let entry = ExternalAssetEntry {
            url: url.into(),
            kind,
            channel,
        };
        if let Some(existing) = self.entries.get(&job_id) {
            tracing::warn!(
                job_id = %job_id,
                existing = %existing.url,
                rejected = %entry.url,
                "Asset job id already registered"
            );
            return Some(entry);
        }
        self.entries.insert(job_id, entry);
        None
    }

    /// Removes and returns the entry for `job_id`.
    pub fn resolve(&mut self, job_id: JobId) -> Option<ExternalAssetEntry> {
        self.entries.remove(&job_id)
    }

    /// Number of fetches still waiting for `url`.
    pub fn pending_for(&self, url: &str) -> usize {
        self.entries.values().filter(|e| e.url == url).count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Applies a downloaded asset to the channel its job was started for.
    ///
    /// Returns the decorated channel, or `None` when nothing was registered for the job
    /// or the channel has been removed since (both are silent no-ops).
    pub fn complete(
        &mut self,
        job_id: JobId,
        bytes: Vec<u8>,
        registry: &mut FeedRegistry,
        sink: &mut NotificationSink,
    ) -> Option<ChannelId> {
        let entry = self.resolve(job_id)?;
        let Some(feed_url) = registry.find_channel_owner(entry.channel).map(str::to_owned) else {
            tracing::debug!(url = %entry.url, channel = %entry.channel, "Asset arrived for a removed channel");
            return None;
        };
        let channel = registry.channel_mut(entry.channel)?;
        match entry.kind {
            AssetKind::ChannelImage => channel.image = Some(bytes),
            AssetKind::Favicon => channel.favicon = Some(bytes),
        }
        tracing::debug!(url = %entry.url, kind = %entry.kind, channel = %entry.channel, "Stored channel asset");
        sink.channel_changed(entry.channel);
        sink.persist(StorageOp::UpdateChannel {
            feed_url,
            channel: channel.metadata(),
        });
        Some(entry.channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Channel, Feed};
    use crate::sync::notify::ViewEvent;

    const FAVICON: &str = "https://example.com/favicon.ico";

    fn registry_with_channel() -> (FeedRegistry, ChannelId) {
        let mut registry = FeedRegistry::new();
        let mut feed = Feed::new("https://example.com/rss", vec![]);
        feed.channels.push(Channel::new("News", "https://example.com/"));
        registry.add(feed);
        let id = registry.get("https://example.com/rss").unwrap().channels[0].id();
        (registry, id)
    }

    #[test]
    fn test_resolve_takes_entry() {
        let mut assets = ExternalAssetCorrelator::new();
        assets.register(JobId(1), FAVICON, AssetKind::Favicon, ChannelId(1));
        assert_eq!(assets.resolve(JobId(1)).unwrap().url, FAVICON);
        assert!(assets.resolve(JobId(1)).is_none());
    }

    #[test]
    fn test_shared_url_keeps_one_entry_per_job() {
        let mut assets = ExternalAssetCorrelator::new();
        assert!(assets.register(JobId(1), FAVICON, AssetKind::Favicon, ChannelId(1)).is_none());
        assert!(assets.register(JobId(2), FAVICON, AssetKind::Favicon, ChannelId(2)).is_none());
        assert_eq!(assets.pending_for(FAVICON), 2);

        assert_eq!(assets.resolve(JobId(2)).unwrap().channel, ChannelId(2));
        assert_eq!(assets.resolve(JobId(1)).unwrap().channel, ChannelId(1));
    }

    #[test]
    fn test_duplicate_job_id_keeps_existing() {
        let mut assets = ExternalAssetCorrelator::new();
        assets.register(JobId(3), FAVICON, AssetKind::Favicon, ChannelId(1));
        let rejected = assets
            .register(JobId(3), "https://example.com/logo.png", AssetKind::ChannelImage, ChannelId(2))
            .unwrap();
        assert_eq!(rejected.channel, ChannelId(2));
        assert_eq!(assets.len(), 1);
        assert_eq!(assets.resolve(JobId(3)).unwrap().channel, ChannelId(1));
    }

    #[test]
    fn test_complete_decorates_channel_and_persists() {
        let (mut registry, id) = registry_with_channel();
        let mut sink = NotificationSink::new();
        let mut assets = ExternalAssetCorrelator::new();
        assets.register(JobId(7), FAVICON, AssetKind::Favicon, id);

        let done = assets.complete(JobId(7), vec![1, 2, 3], &mut registry, &mut sink);
        assert_eq!(done, Some(id));
        assert_eq!(registry.channel(id).unwrap().favicon.as_deref(), Some(&[1u8, 2, 3][..]));
        assert_eq!(sink.take_events(), vec![ViewEvent::ChannelDataChanged(id)]);
        match sink.take_ops().as_slice() {
            [StorageOp::UpdateChannel { feed_url, channel }] => {
                assert_eq!(feed_url, "https://example.com/rss");
                assert_eq!(channel.favicon.as_deref(), Some(&[1u8, 2, 3][..]));
            }
            other => panic!("unexpected ops: {:?}", other),
        }
    }

    #[test]
    fn test_complete_for_removed_channel_is_noop() {
        let (mut registry, id) = registry_with_channel();
        let mut sink = NotificationSink::new();
        let mut assets = ExternalAssetCorrelator::new();
        assets.register(JobId(4), "https://example.com/logo.png", AssetKind::ChannelImage, id);
        registry.remove("https://example.com/rss");

        let done = assets.complete(JobId(4), vec![9], &mut registry, &mut sink);
        assert_eq!(done, None);
        assert!(assets.is_empty());
        assert!(sink.pending_ops().is_empty());
        assert!(sink.take_events().is_empty());
    }

    #[test]
    fn test_complete_unregistered_job_is_noop() {
        let (mut registry, _) = registry_with_channel();
        let mut sink = NotificationSink::new();
        let mut assets = ExternalAssetCorrelator::new();
        assert_eq!(assets.complete(JobId(99), vec![], &mut registry, &mut sink), None);
    }
}
