//! Core domain types: sources, health records, items, and run output.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::FailureKind;
use crate::text::stable_item_uid;

// ---------------------------------------------------------------------------
// Source
// ---------------------------------------------------------------------------

/// Informational grouping of a source. Not used by pipeline logic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceCategory {
    ModelCompany,
    AgentFramework,
    EngineeringBlog,
    ResearchLab,
    Tooling,
    #[default]
    Other,
}

/// How items are obtained for a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FetchStrategy {
    /// Structured feed only. Requires a feed URL.
    FeedOnly,
    /// Feed first; page extraction when the feed fails or is empty.
    FeedThenFallback,
    /// Page extraction only.
    FallbackOnly,
}

impl FetchStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::FeedOnly => "feed-only",
            Self::FeedThenFallback => "feed-then-fallback",
            Self::FallbackOnly => "fallback-only",
        }
    }
}

/// A validated registry entry.
#[derive(Debug, Clone)]
pub struct Source {
    /// Stable identifier, unique across the registry.
    pub id: String,
    /// Display name (defaults to the id).
    pub name: String,
    pub category: SourceCategory,
    /// Page scraped by the fallback fetcher; also the same-site anchor for feeds.
    pub home_url: Url,
    pub feed_url: Option<Url>,
    pub strategy: FetchStrategy,
    /// Per-source item cap.
    pub max_items: usize,
    /// Extra feed URLs to try during discovery.
    pub feed_candidates: Vec<String>,
    /// Current health, hydrated from storage at run start.
    pub health: HealthRecord,
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Coarse health classification of a source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    #[default]
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl std::str::FromStr for HealthLevel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(Self::Healthy),
            "degraded" => Ok(Self::Degraded),
            "unhealthy" => Ok(Self::Unhealthy),
            other => Err(format!("unknown health level '{other}'")),
        }
    }
}

/// Persisted operational state of one source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthRecord {
    pub level: HealthLevel,
    /// Reset to 0 on any success.
    pub consecutive_failures: u32,
    /// While `now < cooldown_until` the source is not attempted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<SourceStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_success_at: Option<DateTime<Utc>>,
}

impl HealthRecord {
    /// Whether the source is still inside its cooldown window at `now`.
    pub fn is_cooling(&self, now: DateTime<Utc>) -> bool {
        matches!(self.cooldown_until, Some(until) if now < until)
    }
}

// ---------------------------------------------------------------------------
// Item
// ---------------------------------------------------------------------------

/// A normalized piece of content from one source. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    /// Hash of `(source_id, canonical url, title)`.
    pub uid: String,
    pub source_id: String,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub published_at: Option<DateTime<Utc>>,
    pub collected_at: DateTime<Utc>,
    #[serde(default)]
    pub raw_summary: String,
}

impl Item {
    /// Build an item, deriving its uid from the identity fields.
    pub fn new(
        source_id: &str,
        url: &str,
        title: &str,
        published_at: Option<DateTime<Utc>>,
        raw_summary: String,
        collected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            uid: stable_item_uid(source_id, url, title),
            source_id: source_id.to_string(),
            url: url.to_string(),
            title: title.to_string(),
            published_at,
            collected_at,
            raw_summary,
        }
    }
}

/// Which extraction path produced a set of items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemVia {
    Feed,
    Page,
}

// ---------------------------------------------------------------------------
// Run output
// ---------------------------------------------------------------------------

/// Final per-source status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    /// Fetched with at least one item.
    Ok,
    /// Fetched successfully with zero items.
    Empty,
    /// Every attempt failed.
    Error,
    /// Not attempted: still cooling down.
    SkippedCooldown,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Empty => "empty",
            Self::Error => "error",
            Self::SkippedCooldown => "skipped_cooldown",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Ok | Self::Empty)
    }
}

impl std::str::FromStr for SourceStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "empty" => Ok(Self::Empty),
            "error" => Ok(Self::Error),
            "skipped_cooldown" => Ok(Self::SkippedCooldown),
            other => Err(format!("unknown source status '{other}'")),
        }
    }
}

/// One row of the per-source section of the run output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceReport {
    pub source_id: String,
    pub name: String,
    pub status: SourceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<ItemVia>,
    /// Items returned by the final attempt, before dedup.
    pub item_count: usize,
    /// Items that survived dedup.
    pub new_item_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    /// Feed URL found by discovery when the configured one was missing or broken.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discovered_feed: Option<String>,
    pub retry_attempted: bool,
    pub retry_succeeded: bool,
    pub retry_count: u32,
    pub health_level: HealthLevel,
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checked_at: Option<DateTime<Utc>>,
}

/// Aggregate counters of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Every registered source, skipped ones included.
    pub sources_checked: usize,
    pub sources_successful: usize,
    pub sources_with_items: usize,
    pub new_items_count: usize,
    /// Items returned by fetchers before dedup.
    pub items_fetched_count: usize,
    pub sources_skipped_cooldown: usize,
    pub retry_attempted_sources: usize,
    pub retry_recovered_sources: usize,
}

/// Raised when too few eligible sources succeeded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageFailure {
    pub successful: usize,
    pub eligible: usize,
    pub required: usize,
    pub min_success_ratio: f64,
}

impl std::fmt::Display for CoverageFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "critical coverage failure: {}/{} sources succeeded, {} required",
            self.successful, self.eligible, self.required
        )
    }
}

/// Reading priority assigned by an analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadingPriority {
    High,
    Medium,
    Low,
}

/// Optional annotations attached to a new item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Analysis {
    /// 0..=100
    pub relevance_score: u8,
    pub tags: Vec<String>,
    pub summary: String,
    pub has_code_example: bool,
    pub has_api_update: bool,
    pub reading_priority: ReadingPriority,
    /// 1..=5
    pub technical_depth: u8,
    /// Minutes.
    pub estimated_reading_time: u32,
    pub model_used: String,
}

/// A new item in the run output, with annotations when an analyzer ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunItem {
    #[serde(flatten)]
    pub item: Item,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<Analysis>,
}

/// The complete result of one run, and the sole payload handed to delivery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutput {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub summary: RunSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub critical: Option<CoverageFailure>,
    pub items: Vec<RunItem>,
    pub sources: Vec<SourceReport>,
    /// Dedup or health writes that failed after fetching. Items listed in
    /// `items` are emitted even when recording them failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub store_errors: Vec<String>,
}

impl RunOutput {
    pub fn is_critical(&self) -> bool {
        self.critical.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn cooling_window() {
        let now = Utc::now();
        let mut record = HealthRecord::default();
        assert!(!record.is_cooling(now));

        record.cooldown_until = Some(now + Duration::minutes(5));
        assert!(record.is_cooling(now));

        record.cooldown_until = Some(now);
        assert!(!record.is_cooling(now));
    }

    #[test]
    fn item_uid_derived_from_identity() {
        let now = Utc::now();
        let a = Item::new("s", "https://e.com/p", "Title", None, String::new(), now);
        let b = Item::new(
            "s",
            "https://e.com/p",
            "Title",
            None,
            "different summary".into(),
            now + Duration::hours(3),
        );
        assert_eq!(a.uid, b.uid);
    }

    #[test]
    fn run_item_flattens_item_fields() {
        let item = Item::new("s", "https://e.com/p", "Title", None, String::new(), Utc::now());
        let json = serde_json::to_value(RunItem {
            item,
            analysis: None,
        })
        .expect("serialize");
        assert_eq!(json["source_id"], "s");
        assert!(json["published_at"].is_null());
        assert!(json.get("analysis").is_none());
    }

    #[test]
    fn status_strings_roundtrip() {
        for status in [
            SourceStatus::Ok,
            SourceStatus::Empty,
            SourceStatus::Error,
            SourceStatus::SkippedCooldown,
        ] {
            assert_eq!(status.as_str().parse::<SourceStatus>(), Ok(status));
        }
        assert!(SourceStatus::Empty.is_success());
        assert!(!SourceStatus::SkippedCooldown.is_success());
    }

    #[test]
    fn strategy_serde_names() {
        let s: FetchStrategy = serde_json::from_str("\"feed-then-fallback\"").expect("parse");
        assert_eq!(s, FetchStrategy::FeedThenFallback);
        assert_eq!(s.as_str(), "feed-then-fallback");
    }
}
