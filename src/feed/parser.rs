use chrono::{DateTime, Utc};
use feed_rs::model::{Entry, Link};
use feed_rs::parser;
use thiserror::Error;

use crate::model::{Channel, Item};

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("Not an RSS or Atom document: {0}")]
    Feed(#[from] parser::ParseFeedError),
}

/// Parses a downloaded document into channels.
///
/// RSS and Atom documents describe exactly one channel. When `existing` holds a channel
/// with the same title and link, entries it already carries are left out, so a refresh
/// yields only new items. Entries without a date take the channel's build date, falling
/// back to `fetched_at`. Items come back newest first.
pub fn parse_channels(
    bytes: &[u8],
    existing: &[Channel],
    fetched_at: DateTime<Utc>,
) -> Result<Vec<Channel>, ParseError> {
    let feed = parser::parse(bytes)?;

    let mut channel = Channel::new(
        feed.title.map(|t| t.content.trim().to_string()).unwrap_or_default(),
        primary_link(&feed.links).unwrap_or_default(),
    );
    channel.description = feed
        .description
        .map(|d| d.content.trim().to_string())
        .unwrap_or_default();
    channel.author = feed
        .authors
        .first()
        .map(|p| p.name.trim().to_string())
        .unwrap_or_default();
    channel.pixmap_url = feed
        .logo
        .map(|image| image.uri)
        .or_else(|| feed.icon.map(|image| image.uri))
        .unwrap_or_default();
    channel.last_build = feed.updated;

    let fallback_date = channel.last_build.unwrap_or(fetched_at);
    let known = existing.iter().find(|c| c.is_same_channel(&channel));

    let mut items: Vec<Item> = Vec::with_capacity(feed.entries.len());
    let mut skipped = 0usize;
    for entry in feed.entries {
        let item = to_item(entry, fallback_date);
        let seen = known.is_some_and(|c| c.items.iter().any(|i| i.is_same_entry(&item)))
            || items.iter().any(|i| i.is_same_entry(&item));
        if seen {
            skipped += 1;
            continue;
        }
        items.push(item);
    }
    items.sort_by(|a, b| b.pub_date.cmp(&a.pub_date));

    if skipped > 0 {
        tracing::debug!(
            channel = %channel.title,
            skipped = skipped,
            new = items.len(),
            "Skipped entries already known"
        );
    }

    channel.items = items;
    Ok(vec![channel])
}

/// First link that is not the document's own location.
fn primary_link(links: &[Link]) -> Option<String> {
    links
        .iter()
        .find(|l| l.rel.as_deref() != Some("self"))
        .or_else(|| links.first())
        .map(|l| l.href.trim().to_string())
}

fn to_item(entry: Entry, fallback_date: DateTime<Utc>) -> Item {
    let title = entry
        .title
        .map(|t| t.content.trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "Untitled".to_string());
    let link = primary_link(&entry.links).unwrap_or_default();
    let pub_date = entry.published.or(entry.updated).unwrap_or(fallback_date);

    let mut item = Item::new(title, link, pub_date);
    item.description = entry
        .summary
        .map(|s| s.content)
        .or_else(|| entry.content.and_then(|c| c.body))
        .unwrap_or_default();
    item.author = entry
        .authors
        .first()
        .map(|p| p.name.trim().to_string())
        .unwrap_or_default();
    item.category = entry
        .categories
        .first()
        .map(|c| c.term.clone())
        .unwrap_or_default();
    item
}
