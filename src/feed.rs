//! External data feed consumed by the feed sync job.
//!
//! The feed is a JSON array of `{ "key": "...", "value": <i64> }` entries.
//! [`FeedTracker`] remembers the previous refresh so the job can announce
//! what changed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// One keyed value from the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub key: String,
    pub value: i64,
}

/// Source of fresh feed data.
#[async_trait]
pub trait ExternalFeed: Send + Sync {
    async fn fetch(&self) -> anyhow::Result<Vec<FeedEntry>>;
}

/// Feed served as JSON over HTTP.
#[derive(Debug, Clone)]
pub struct HttpFeed {
    url: String,
    client: reqwest::Client,
}

impl HttpFeed {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ExternalFeed for HttpFeed {
    async fn fetch(&self) -> anyhow::Result<Vec<FeedEntry>> {
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("feed request failed ({})", response.status());
        }
        Ok(response.json().await?)
    }
}

/// A value that differs from the previous refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedChange {
    pub key: String,
    pub previous: i64,
    pub current: i64,
}

/// Last known feed values.
#[derive(Debug, Default)]
pub struct FeedTracker {
    baseline: Option<HashMap<String, i64>>,
}

impl FeedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether at least one refresh has been recorded.
    pub fn is_seeded(&self) -> bool {
        self.baseline.is_some()
    }

    /// Compare fresh entries with the baseline.
    ///
    /// The first call only seeds the baseline and reports nothing. Keys new
    /// since the last refresh are not reported; keys that disappeared are
    /// forgotten.
    pub fn diff(&self, entries: &[FeedEntry]) -> Vec<FeedChange> {
        let Some(baseline) = &self.baseline else {
            return Vec::new();
        };
        let mut changes: Vec<FeedChange> = entries
            .iter()
            .filter_map(|entry| {
                let previous = *baseline.get(&entry.key)?;
                (previous != entry.value).then(|| FeedChange {
                    key: entry.key.clone(),
                    previous,
                    current: entry.value,
                })
            })
            .collect();
        changes.sort_by(|a, b| a.key.cmp(&b.key));
        changes
    }

    /// Replace the baseline with fresh entries.
    pub fn commit(&mut self, entries: &[FeedEntry]) {
        self.baseline = Some(
            entries
                .iter()
                .map(|entry| (entry.key.clone(), entry.value))
                .collect(),
        );
    }

    /// Record a single announced change (used when only part of a refresh
    /// could be acted on).
    pub fn commit_change(&mut self, change: &FeedChange) {
        if let Some(baseline) = &mut self.baseline {
            baseline.insert(change.key.clone(), change.current);
        }
    }
}
