//! News artifacts surfaced by agent turns.
//!
//! The news search tool answers with JSON; [`extract_articles`] turns that
//! into [`NewsArticle`]s and [`store_new_articles`] hands them to a
//! [`NewsDedupStore`], which only accepts articles it has not seen before.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// A news item found by a tool during a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewsArticle {
    pub title: String,
    pub url: String,
    pub content: String,
    pub score: f64,
    #[serde(default, deserialize_with = "lenient_datetime")]
    pub published_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub notified: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl NewsArticle {
    /// An article with only the required fields set.
    pub fn new(
        title: impl Into<String>,
        url: impl Into<String>,
        content: impl Into<String>,
        score: f64,
    ) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            content: content.into(),
            score,
            published_at: None,
            summary: None,
            source: None,
            notified: false,
            created_at: Utc::now(),
        }
    }

    /// Idempotency key: SHA-256 of the URL, or of source, title and
    /// publication time when the URL is empty.
    pub fn dedup_key(&self) -> String {
        let mut hasher = Sha256::new();

        let url = self.url.trim();
        if url.is_empty() {
            hasher.update(self.source.as_deref().unwrap_or_default().as_bytes());
            hasher.update(b"|");
            hasher.update(self.title.trim().as_bytes());
            hasher.update(b"|");
            if let Some(published) = self.published_at {
                hasher.update(published.to_rfc3339().as_bytes());
            }
        } else {
            hasher.update(url.as_bytes());
        }

        hasher.finalize().iter().map(|b| format!("{:02x}", b)).collect()
    }
}

/// Accepts RFC 3339 or a bare `YYYY-MM-DDTHH:MM:SS`; anything else is `None`.
fn lenient_datetime<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    Ok(raw.and_then(|s| parse_timestamp(&s)))
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc())
}

/// Pull news articles out of a tool's text output.
///
/// The text is either a list of result groups or a single group, each
/// carrying a `results` array. A `{"text": "..."}` wrapper around that JSON
/// is unwrapped. Entries that do not parse are skipped and duplicates are
/// collapsed, keeping the first.
pub fn extract_articles(text: &str) -> Vec<NewsArticle> {
    let Ok(mut value) = serde_json::from_str::<Value>(text) else {
        return Vec::new();
    };

    if let Some(inner) = value.get("text").and_then(Value::as_str) {
        match serde_json::from_str(inner) {
            Ok(unwrapped) => value = unwrapped,
            Err(_) => return Vec::new(),
        }
    }

    let groups = match value {
        Value::Array(groups) => groups,
        group @ Value::Object(_) => vec![group],
        _ => return Vec::new(),
    };

    let mut seen = HashSet::new();
    let mut articles = Vec::new();

    for group in groups {
        let Some(results) = group.get("results").and_then(Value::as_array) else {
            continue;
        };

        for entry in results {
            match serde_json::from_value::<NewsArticle>(entry.clone()) {
                Ok(article) => {
                    if seen.insert(article.dedup_key()) {
                        articles.push(article);
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping unparseable news entry");
                }
            }
        }
    }

    articles
}

/// Error from a news persistence backend.
#[derive(Debug, thiserror::Error)]
pub enum NewsStoreError {
    #[error("News store unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to store article '{key}': {reason}")]
    Write { key: String, reason: String },
}

/// Idempotent persistence of news articles.
#[async_trait]
pub trait NewsDedupStore: Send + Sync {
    /// Store the article unless one with the same key exists.
    ///
    /// Returns whether it was inserted.
    async fn insert_if_new(&self, article: &NewsArticle) -> Result<bool, NewsStoreError>;
}

/// Store every article that is new, returning those in input order.
///
/// A failing insert is logged and skipped; the rest are still attempted.
pub async fn store_new_articles(
    store: &dyn NewsDedupStore,
    articles: &[NewsArticle],
) -> Vec<NewsArticle> {
    let mut inserted = Vec::new();

    for article in articles {
        match store.insert_if_new(article).await {
            Ok(true) => inserted.push(article.clone()),
            Ok(false) => {}
            Err(e) => {
                tracing::warn!(url = %article.url, error = %e, "Failed to store news article");
            }
        }
    }

    if !inserted.is_empty() {
        tracing::info!(count = inserted.len(), "Stored new news articles");
    }

    inserted
}

/// In-process [`NewsDedupStore`].
#[derive(Debug, Default)]
pub struct InMemoryNewsStore {
    inner: Mutex<InMemoryInner>,
}

#[derive(Debug, Default)]
struct InMemoryInner {
    index: HashMap<String, usize>,
    articles: Vec<NewsArticle>,
}

impl InMemoryNewsStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored articles, in insertion order.
    pub fn articles(&self) -> Vec<NewsArticle> {
        self.inner.lock().articles.clone()
    }

    /// Number of stored articles.
    pub fn len(&self) -> usize {
        self.inner.lock().articles.len()
    }

    /// Whether nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().articles.is_empty()
    }

    /// Articles not yet marked as notified.
    pub fn pending_notifications(&self) -> Vec<NewsArticle> {
        self.inner.lock().articles.iter().filter(|a| !a.notified).cloned().collect()
    }

    /// Mark the article with this key as notified. Returns whether it exists.
    pub fn mark_notified(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        let Some(&position) = inner.index.get(key) else {
            return false;
        };
        inner.articles[position].notified = true;
        true
    }
}

#[async_trait]
impl NewsDedupStore for InMemoryNewsStore {
    async fn insert_if_new(&self, article: &NewsArticle) -> Result<bool, NewsStoreError> {
        let key = article.dedup_key();
        let mut inner = self.inner.lock();

        if inner.index.contains_key(&key) {
            return Ok(false);
        }

        let position = inner.articles.len();
        inner.articles.push(article.clone());
        inner.index.insert(key, position);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn search_output() -> String {
        serde_json::json!([
            {
                "query": "AAPL",
                "results": [
                    {
                        "title": "Apple beats estimates",
                        "url": "https://news.example/apple-beats",
                        "content": "Apple reported...",
                        "score": 0.91,
                        "published_at": "2025-01-30T21:05:00Z"
                    },
                    {"title": "missing fields"},
                    {
                        "title": "Apple beats estimates (syndicated)",
                        "url": "https://news.example/apple-beats",
                        "content": "Apple reported...",
                        "score": 0.5
                    }
                ]
            },
            {
                "query": "MSFT",
                "results": [{
                    "title": "Microsoft cloud growth",
                    "url": "https://news.example/msft-cloud",
                    "content": "Azure grew...",
                    "score": 0.8,
                    "published_at": "not a date"
                }]
            }
        ])
        .to_string()
    }

    #[test]
    fn test_extract_articles_from_groups() {
        let articles = extract_articles(&search_output());

        assert_eq!(articles.len(), 2);
        assert_eq!(articles[0].title, "Apple beats estimates");
        assert!(articles[0].published_at.is_some());
        assert_eq!(articles[1].url, "https://news.example/msft-cloud");
        assert!(articles[1].published_at.is_none());
        assert!(!articles[1].notified);
    }

    #[test]
    fn test_extract_articles_single_group_and_wrapper() {
        let group = serde_json::json!({
            "results": [{"title": "t", "url": "https://x/1", "content": "c", "score": 1.0}]
        });
        assert_eq!(extract_articles(&group.to_string()).len(), 1);

        let wrapped = serde_json::json!({"type": "text", "text": group.to_string()});
        assert_eq!(extract_articles(&wrapped.to_string()).len(), 1);
    }

    #[test]
    fn test_extract_articles_ignores_non_json() {
        assert!(extract_articles("No news found for XYZ.").is_empty());
        assert!(extract_articles("42").is_empty());
    }

    #[test]
    fn test_dedup_key_prefers_url() {
        let a = NewsArticle::new("Title A", "https://x/1", "c", 1.0);
        let b = NewsArticle::new("Title B", "https://x/1", "other", 0.2);
        assert_eq!(a.dedup_key(), b.dedup_key());
        assert_eq!(a.dedup_key().len(), 64);

        let mut c = NewsArticle::new("Same", "", "c", 1.0);
        let mut d = NewsArticle::new("Same", "", "c", 1.0);
        c.source = Some("wire".into());
        d.source = Some("blog".into());
        assert_ne!(c.dedup_key(), d.dedup_key());
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert!(parse_timestamp("2025-01-30T21:05:00+02:00").is_some());
        assert!(parse_timestamp("2025-01-30T21:05:00").is_some());
        assert!(parse_timestamp("2025-01-30 21:05:00.123").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[tokio::test]
    async fn test_store_new_articles_is_idempotent() {
        let store = InMemoryNewsStore::new();
        let articles = extract_articles(&search_output());

        let first = store_new_articles(&store, &articles).await;
        let second = store_new_articles(&store, &articles).await;

        assert_eq!(first.len(), 2);
        assert!(second.is_empty());
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_mark_notified() {
        let store = InMemoryNewsStore::new();
        let article = NewsArticle::new("t", "https://x/1", "c", 1.0);
        store.insert_if_new(&article).await.unwrap();

        assert_eq!(store.pending_notifications().len(), 1);
        assert!(store.mark_notified(&article.dedup_key()));
        assert!(store.pending_notifications().is_empty());
        assert!(!store.mark_notified("unknown"));
    }
}
