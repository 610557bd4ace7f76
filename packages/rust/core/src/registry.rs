//! The validated, ordered list of sources a run works through.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use tracing::debug;
use url::Url;

use sourcewatch_shared::{
    FetchStrategy, HealthRecord, PipelineConfig, Result, Source, SourceEntry, SourcewatchError,
};

/// Ordered registry of sources. Order is the configuration order and drives
/// the order of items and reports in the run output.
#[derive(Debug, Clone)]
pub struct SourceRegistry {
    sources: Vec<Source>,
}

impl SourceRegistry {
    /// Validate configuration entries into a registry.
    ///
    /// Fails on an empty registry, duplicate ids, unparseable URLs, and
    /// feed-only sources without a feed URL.
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let default_max_items = config.settings.max_items_per_source.clamp(1, 200);
        let sources = config
            .sources
            .iter()
            .map(|entry| source_from_entry(entry, default_max_items))
            .collect::<Result<Vec<_>>>()?;
        Self::from_sources(sources)
    }

    /// Build a registry from already-constructed sources.
    pub fn from_sources(sources: Vec<Source>) -> Result<Self> {
        if sources.is_empty() {
            return Err(SourcewatchError::validation("source registry is empty"));
        }

        let mut seen = HashSet::new();
        for source in &sources {
            if !seen.insert(source.id.as_str()) {
                return Err(SourcewatchError::validation(format!(
                    "duplicate source id '{}'",
                    source.id
                )));
            }
            if source.strategy == FetchStrategy::FeedOnly && source.feed_url.is_none() {
                return Err(SourcewatchError::validation(format!(
                    "source '{}' is feed-only but has no feed_url",
                    source.id
                )));
            }
        }

        Ok(Self { sources })
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Source> {
        self.sources.iter().find(|s| s.id == id)
    }

    /// Attach persisted health records. Sources without one stay healthy.
    pub fn hydrate(&mut self, mut records: HashMap<String, HealthRecord>) {
        for source in &mut self.sources {
            if let Some(record) = records.remove(&source.id) {
                source.health = record;
            }
        }
        if !records.is_empty() {
            debug!(orphans = records.len(), "ignoring health records for unknown sources");
        }
    }

    /// Split into `(eligible, cooling)` at `now`, each in registry order.
    pub fn partition_eligible(&self, now: DateTime<Utc>) -> (Vec<Source>, Vec<Source>) {
        self.sources
            .iter()
            .cloned()
            .partition(|source| !source.health.is_cooling(now))
    }

    /// Replace the health record of one source.
    pub fn apply_health(&mut self, source_id: &str, record: HealthRecord) -> bool {
        match self.sources.iter_mut().find(|s| s.id == source_id) {
            Some(source) => {
                source.health = record;
                true
            }
            None => false,
        }
    }
}

fn source_from_entry(entry: &SourceEntry, default_max_items: usize) -> Result<Source> {
    let id = entry.id.trim();
    if id.is_empty() {
        return Err(SourcewatchError::validation("source id must not be empty"));
    }

    let home_url = parse_http_url(id, "home_url", &entry.home_url)?;
    let feed_url = entry
        .feed_url
        .as_deref()
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .map(|raw| parse_http_url(id, "feed_url", raw))
        .transpose()?;

    // Without a configured feed, feed-then-fallback still discovers one.
    let strategy = entry.strategy.unwrap_or(FetchStrategy::FeedThenFallback);

    Ok(Source {
        id: id.to_string(),
        name: entry
            .name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(id)
            .to_string(),
        category: entry.category,
        home_url,
        feed_url,
        strategy,
        max_items: entry.max_items.unwrap_or(default_max_items).clamp(1, 200),
        feed_candidates: entry.feed_candidates.clone(),
        health: HealthRecord::default(),
    })
}

fn parse_http_url(id: &str, field: &str, raw: &str) -> Result<Url> {
    let url = Url::parse(raw.trim()).map_err(|e| {
        SourcewatchError::validation(format!("source '{id}': invalid {field} '{raw}': {e}"))
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SourcewatchError::validation(format!(
            "source '{id}': {field} must be http(s), got '{raw}'"
        )));
    }
    Ok(url)
}
