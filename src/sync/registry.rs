use std::collections::BTreeMap;

use crate::model::{Channel, ChannelId, Feed};

/// Hands out channel handles. Starts at 1; 0 means "unassigned".
#[derive(Debug)]
pub(crate) struct ChannelIds {
    next: u64,
}

impl ChannelIds {
    fn new() -> Self {
        Self { next: 1 }
    }

    pub(crate) fn assign(&mut self, channel: &mut Channel) {
        channel.id = ChannelId(self.next);
        self.next += 1;
    }
}

/// In-memory mapping from feed URL to its [`Feed`].
///
/// Outside the crate the registry is read-only apart from adding and removing whole
/// feeds; channel lists and item lists are only changed by the reconciliation engine
/// and the unread aggregator.
#[derive(Debug)]
pub struct FeedRegistry {
    feeds: BTreeMap<String, Feed>,
    ids: ChannelIds,
}

impl Default for FeedRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedRegistry {
    pub fn new() -> Self {
        Self {
            feeds: BTreeMap::new(),
            ids: ChannelIds::new(),
        }
    }

    /// Builds a registry from previously stored feeds.
    pub fn from_feeds(feeds: impl IntoIterator<Item = Feed>) -> Self {
        let mut registry = Self::new();
        for feed in feeds {
            registry.add(feed);
        }
        registry
    }

    /// Adds a feed, giving each of its channels a fresh handle.
    ///
    /// Replaces and returns any feed previously stored under the same URL.
    pub fn add(&mut self, mut feed: Feed) -> Option<Feed> {
        for channel in &mut feed.channels {
            self.ids.assign(channel);
        }
        self.feeds.insert(feed.url.clone(), feed)
    }

    pub fn remove(&mut self, url: &str) -> Option<Feed> {
        self.feeds.remove(url)
    }

    pub fn get(&self, url: &str) -> Option<&Feed> {
        self.feeds.get(url)
    }

    pub fn contains(&self, url: &str) -> bool {
        self.feeds.contains_key(url)
    }

    /// URL of the feed owning `channel`.
    ///
    /// Linear scan over every channel; the registry is small and this is not called per item.
    pub fn find_channel_owner(&self, channel: ChannelId) -> Option<&str> {
        self.feeds
            .values()
            .find(|feed| feed.channels.iter().any(|c| c.id == channel))
            .map(|feed| feed.url.as_str())
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.feeds
            .values()
            .flat_map(|feed| feed.channels.iter())
            .find(|c| c.id == id)
    }

    pub fn feeds(&self) -> impl Iterator<Item = &Feed> {
        self.feeds.values()
    }

    pub fn urls(&self) -> Vec<String> {
        self.feeds.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.feeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feeds.is_empty()
    }

    pub(crate) fn channel_mut(&mut self, id: ChannelId) -> Option<&mut Channel> {
        self.feeds
            .values_mut()
            .flat_map(|feed| feed.channels.iter_mut())
            .find(|c| c.id == id)
    }

    /// Mutable feed plus the handle allocator, borrowed together.
    pub(crate) fn feed_mut(&mut self, url: &str) -> Option<(&mut Feed, &mut ChannelIds)> {
        let feed = self.feeds.get_mut(url)?;
        Some((feed, &mut self.ids))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_with_channels(url: &str, titles: &[&str]) -> Feed {
        let mut feed = Feed::new(url, vec!["news".into()]);
        for title in titles {
            feed.channels
                .push(Channel::new(*title, format!("{}/{}", url, title)));
        }
        feed
    }

    #[test]
    fn test_add_assigns_distinct_channel_ids() {
        let mut registry = FeedRegistry::new();
        registry.add(feed_with_channels("https://a.example.com", &["one", "two"]));
        registry.add(feed_with_channels("https://b.example.com", &["three"]));

        let ids: Vec<ChannelId> = registry
            .feeds()
            .flat_map(|f| f.channels.iter().map(Channel::id))
            .collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|id| id.is_assigned()));
        let mut unique = ids.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), 3);
    }

    #[test]
    fn test_find_channel_owner() {
        let mut registry = FeedRegistry::new();
        registry.add(feed_with_channels("https://a.example.com", &["one"]));
        registry.add(feed_with_channels("https://b.example.com", &["two"]));

        let id = registry.get("https://b.example.com").unwrap().channels[0].id();
        assert_eq!(registry.find_channel_owner(id), Some("https://b.example.com"));
        assert_eq!(registry.find_channel_owner(ChannelId(999)), None);
    }

    #[test]
    fn test_removed_channel_is_no_longer_found() {
        let mut registry = FeedRegistry::new();
        registry.add(feed_with_channels("https://a.example.com", &["one"]));
        let id = registry.get("https://a.example.com").unwrap().channels[0].id();

        assert!(registry.channel(id).is_some());
        let removed = registry.remove("https://a.example.com").unwrap();
        assert_eq!(removed.channels.len(), 1);
        assert!(registry.channel(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_readding_feed_never_reuses_handles() {
        let mut registry = FeedRegistry::new();
        registry.add(feed_with_channels("https://a.example.com", &["one"]));
        let old = registry.get("https://a.example.com").unwrap().channels[0].id();
        registry.remove("https://a.example.com");
        registry.add(feed_with_channels("https://a.example.com", &["one"]));
        let new = registry.get("https://a.example.com").unwrap().channels[0].id();
        assert_ne!(old, new);
    }
}
