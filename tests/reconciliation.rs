//! Integration tests for refresh reconciliation.
//!
//! Documents go through the real parser and engine; the queued storage operations are
//! replayed into an in-memory database and the view events onto a shadow row count, and
//! both must agree with the in-memory registry afterwards.

use chrono::{DateTime, Duration, TimeZone, Utc};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use tokio::sync::watch;

use feedsync::feed::parse_channels;
use feedsync::model::{Channel, Item};
use feedsync::storage::Database;
use feedsync::sync::{
    Clock, FeedRegistry, NoopClassifier, NotificationSink, ReconciliationEngine, RetentionPolicy,
    StorageOp, ViewEvent,
};

const FEED: &str = "https://example.com/rss";

struct FixedClock(DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 30, 12, 0, 0).unwrap()
}

fn engine(max_items: usize, max_age_days: i64) -> ReconciliationEngine {
    let (_tx, rx) = watch::channel(RetentionPolicy {
        max_items_per_channel: max_items,
        max_item_age_days: max_age_days,
    });
    ReconciliationEngine::new(rx, Box::new(NoopClassifier)).with_clock(FixedClock(now()))
}

fn rss(entries: &[(&str, DateTime<Utc>)]) -> String {
    let mut body = String::from(
        r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
<title>Example News</title>
<link>https://example.com/</link>
"#,
    );
    for (slug, date) in entries {
        body.push_str(&format!(
            "<item><title>{slug}</title><link>https://example.com/{slug}</link><pubDate>{}</pubDate></item>\n",
            date.to_rfc2822()
        ));
    }
    body.push_str("</channel></rss>");
    body
}

fn titles(items: &[Item]) -> Vec<String> {
    items.iter().map(|i| i.title.clone()).collect()
}

fn days_ago(days: i64) -> DateTime<Utc> {
    now() - Duration::days(days)
}

/// Parses `body` against the feed's current channels and merges it.
fn refresh(
    engine: &mut ReconciliationEngine,
    registry: &mut FeedRegistry,
    body: &str,
    sink: &mut NotificationSink,
) -> Vec<String> {
    let existing = registry.get(FEED).unwrap().channels.clone();
    let channels = parse_channels(body.as_bytes(), &existing, now()).unwrap();
    engine
        .reconcile(registry, FEED, channels, None, sink)
        .unwrap()
        .summary
}

#[tokio::test]
async fn test_storage_mirrors_memory_across_refreshes() {
    let db = Database::open(":memory:").await.unwrap();
    let mut registry = FeedRegistry::new();
    let mut engine = engine(4, 14);
    let mut sink = NotificationSink::new();

    let first = rss(&[("c", days_ago(3)), ("b", days_ago(4)), ("a", days_ago(20))]);
    let channels = parse_channels(first.as_bytes(), &[], now()).unwrap();
    engine
        .adopt_new_feed(&mut registry, FEED, &["news".to_string()], channels, &mut sink)
        .unwrap();
    db.apply_ops(&sink.take_ops()).await.unwrap();

    // One new item: the 20-day-old entry ages out.
    let summary = refresh(
        &mut engine,
        &mut registry,
        &rss(&[("d", days_ago(1)), ("c", days_ago(3))]),
        &mut sink,
    );
    assert_eq!(summary, vec!["Updated channel \"Example News\" (1 new items)".to_string()]);
    db.apply_ops(&sink.take_ops()).await.unwrap();

    // Three more: the count limit keeps the newest four.
    refresh(
        &mut engine,
        &mut registry,
        &rss(&[("g", days_ago(0)), ("f", days_ago(1)), ("e", days_ago(2))]),
        &mut sink,
    );
    db.apply_ops(&sink.take_ops()).await.unwrap();

    let memory = &registry.get(FEED).unwrap().channels[0];
    assert_eq!(titles(&memory.items), vec!["g", "d", "f", "e"]);

    let stored = db.load_feeds().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].channels.len(), 1);
    assert_eq!(titles(&stored[0].channels[0].items), titles(&memory.items));
    assert_eq!(stored[0].channels[0].tags, vec!["news".to_string()]);
}

#[tokio::test]
async fn test_new_channel_in_refresh_is_stored() {
    let db = Database::open(":memory:").await.unwrap();
    let mut registry = FeedRegistry::new();
    let mut engine = engine(100, 365);
    let mut sink = NotificationSink::new();

    let channels = parse_channels(rss(&[("a", days_ago(1))]).as_bytes(), &[], now()).unwrap();
    engine
        .adopt_new_feed(&mut registry, FEED, &[], channels, &mut sink)
        .unwrap();
    db.apply_ops(&sink.take_ops()).await.unwrap();

    let mut extra = Channel::new("Podcast", "https://example.com/podcast");
    extra.items.push(Item::new("ep1", "https://example.com/ep1", days_ago(2)));
    let report = engine
        .reconcile(&mut registry, FEED, vec![extra], None, &mut sink)
        .unwrap();
    assert_eq!(report.summary, vec!["Added channel \"Podcast\" (has 1 items)".to_string()]);
    db.apply_ops(&sink.take_ops()).await.unwrap();

    let stored = db.load_feeds().await.unwrap();
    let stored_titles: Vec<&str> = stored[0].channels.iter().map(|c| c.title.as_str()).collect();
    assert_eq!(stored_titles, vec!["Example News", "Podcast"]);
    assert_eq!(titles(&stored[0].channels[1].items), vec!["ep1"]);
}

#[test]
fn test_undated_entries_take_channel_build_date() {
    let body = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
<title>Example News</title>
<link>https://example.com/</link>
<lastBuildDate>Sat, 29 Jun 2024 10:00:00 GMT</lastBuildDate>
<item><title>undated</title><link>https://example.com/undated</link></item>
</channel></rss>"#;
    let channels = parse_channels(body.as_bytes(), &[], now()).unwrap();
    assert_eq!(
        channels[0].items[0].pub_date,
        Utc.with_ymd_and_hms(2024, 6, 29, 10, 0, 0).unwrap()
    );
}

proptest! {
    #[test]
    fn prop_row_events_and_storage_ops_track_items(
        initial in proptest::collection::vec(0i64..(24 * 90), 0..10),
        batches in proptest::collection::vec(proptest::collection::vec(0i64..(24 * 90), 0..6), 1..5),
        max_items in 1usize..8,
        max_age_days in 1i64..60,
    ) {
        let (_tx, rx) = watch::channel(RetentionPolicy {
            max_items_per_channel: max_items,
            max_item_age_days: max_age_days,
        });
        let mut engine = ReconciliationEngine::new(rx, Box::new(NoopClassifier))
            .with_clock(FixedClock(now()));
        let mut registry = FeedRegistry::new();
        let mut sink = NotificationSink::new();
        let mut serial = 0;
        let mut next_item = |hours: i64| {
            serial += 1;
            Item::new(
                format!("item{}", serial),
                format!("https://example.com/{}", serial),
                now() - Duration::hours(hours),
            )
        };

        let mut first = Channel::new("Example News", "https://example.com/");
        first.items = initial.iter().map(|h| next_item(*h)).collect();
        first.items.sort_by(|a, b| b.pub_date.cmp(&a.pub_date));
        engine.adopt_new_feed(&mut registry, FEED, &[], vec![first], &mut sink).unwrap();
        let id = registry.get(FEED).unwrap().channels[0].id();

        let mut shadow_rows = registry.channel(id).unwrap().items.len() as i64;
        let mut stored = shadow_rows;
        sink.take_ops();

        for batch in &batches {
            let mut incoming = Channel::new("Example News", "https://example.com/");
            incoming.items = batch.iter().map(|h| next_item(*h)).collect();
            engine.reconcile(&mut registry, FEED, vec![incoming], Some(id), &mut sink).unwrap();

            for event in sink.take_events() {
                match event {
                    ViewEvent::BeginInsertRows { start, end } => {
                        prop_assert!(start as i64 <= shadow_rows);
                        shadow_rows += (end - start + 1) as i64;
                    }
                    ViewEvent::BeginRemoveRows { start, end } => {
                        prop_assert!((end as i64) < shadow_rows);
                        shadow_rows -= (end - start + 1) as i64;
                    }
                    _ => {}
                }
            }
            for op in sink.take_ops() {
                match op {
                    StorageOp::AddItem { .. } => stored += 1,
                    StorageOp::RemoveItem { .. } => stored -= 1,
                    _ => {}
                }
            }

            let items = &registry.channel(id).unwrap().items;
            prop_assert_eq!(shadow_rows, items.len() as i64);
            prop_assert_eq!(stored, items.len() as i64);
            prop_assert!(items.len() <= max_items);
            prop_assert!(items.windows(2).all(|w| w[0].pub_date >= w[1].pub_date));
        }
    }
}
