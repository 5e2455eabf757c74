use serde::Deserialize;
use tokio::sync::mpsc;

use crate::model::Item;

/// Enrichment hook run once for every item merged by a refresh.
///
/// The engine ignores whatever a classifier does; it is a side effect, never a filter.
pub trait ContentClassifier: Send {
    fn classify(&mut self, item: &Item);
}

/// Classifier that does nothing.
#[derive(Debug, Default)]
pub struct NoopClassifier;

impl ContentClassifier for NoopClassifier {
    fn classify(&mut self, _item: &Item) {}
}

/// One keyword rule from the configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClassifierRule {
    pub keywords: Vec<String>,
    pub tags: Vec<String>,
}

/// An item that matched at least one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierHit {
    pub title: String,
    pub link: String,
    pub tags: Vec<String>,
}

/// Matches case-insensitive keywords against item titles and descriptions.
pub struct KeywordClassifier {
    rules: Vec<ClassifierRule>,
    hits: Option<mpsc::UnboundedSender<ClassifierHit>>,
}

impl KeywordClassifier {
    pub fn new(rules: Vec<ClassifierRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| ClassifierRule {
                keywords: rule
                    .keywords
                    .iter()
                    .map(|k| k.trim().to_lowercase())
                    .filter(|k| !k.is_empty())
                    .collect(),
                tags: rule.tags,
            })
            .filter(|rule| !rule.keywords.is_empty())
            .collect();
        Self { rules, hits: None }
    }

    /// Forwards every hit to `tx` in addition to logging it.
    pub fn with_hits(mut self, tx: mpsc::UnboundedSender<ClassifierHit>) -> Self {
        self.hits = Some(tx);
        self
    }

    fn matching_tags(&self, item: &Item) -> Vec<String> {
        let title = item.title.to_lowercase();
        let description = item.description.to_lowercase();
        let mut tags: Vec<String> = Vec::new();
        for rule in &self.rules {
            let matched = rule
                .keywords
                .iter()
                .any(|k| title.contains(k.as_str()) || description.contains(k.as_str()));
            if matched {
                for tag in &rule.tags {
                    if !tags.contains(tag) {
                        tags.push(tag.clone());
                    }
                }
            }
        }
        tags
    }
}

impl ContentClassifier for KeywordClassifier {
    fn classify(&mut self, item: &Item) {
        let tags = self.matching_tags(item);
        if tags.is_empty() {
            return;
        }
        tracing::info!(title = %item.title, tags = ?tags, "Item matched classifier rules");
        if let Some(tx) = &self.hits {
            let hit = ClassifierHit {
                title: item.title.clone(),
                link: item.link.clone(),
                tags,
            };
            if tx.send(hit).is_err() {
                tracing::debug!("Classifier hit receiver dropped");
                self.hits = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn rule(keywords: &[&str], tags: &[&str]) -> ClassifierRule {
        ClassifierRule {
            keywords: keywords.iter().map(|s| s.to_string()).collect(),
            tags: tags.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_keyword_match_is_case_insensitive() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut classifier =
            KeywordClassifier::new(vec![rule(&["Rust"], &["lang"])]).with_hits(tx);

        classifier.classify(&Item::new("Why RUST matters", "https://example.com/1", Utc::now()));
        let hit = rx.try_recv().unwrap();
        assert_eq!(hit.tags, vec!["lang".to_string()]);
        assert_eq!(hit.link, "https://example.com/1");
    }

    #[test]
    fn test_description_is_searched_and_tags_deduplicated() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut classifier = KeywordClassifier::new(vec![
            rule(&["sqlite"], &["db", "storage"]),
            rule(&["wal"], &["db"]),
        ])
        .with_hits(tx);

        let mut item = Item::new("Release notes", "https://example.com/2", Utc::now());
        item.description = "SQLite now defaults to WAL".into();
        classifier.classify(&item);

        let hit = rx.try_recv().unwrap();
        assert_eq!(hit.tags, vec!["db".to_string(), "storage".to_string()]);
    }

    #[test]
    fn test_no_hit_for_unmatched_item() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut classifier = KeywordClassifier::new(vec![rule(&["rust"], &["lang"])]).with_hits(tx);
        classifier.classify(&Item::new("Gardening tips", "https://example.com/3", Utc::now()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_blank_keywords_are_dropped() {
        let classifier = KeywordClassifier::new(vec![rule(&["  ", ""], &["never"])]);
        assert!(classifier.rules.is_empty());
    }
}
