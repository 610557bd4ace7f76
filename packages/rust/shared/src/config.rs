//! Pipeline configuration for sourcewatch.
//!
//! The source registry and run tunables live in `~/.sourcewatch/sources.toml`
//! unless a path is given explicitly. CLI flags override file values, which
//! override defaults. Out-of-range tunables are clamped when converted into
//! runtime configs, never rejected.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SourcewatchError};
use crate::types::{FetchStrategy, SourceCategory};

/// Default registry file name.
const SOURCES_FILE_NAME: &str = "sources.toml";

/// Default database file name.
const DB_FILE_NAME: &str = "sourcewatch.db";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".sourcewatch";

// ---------------------------------------------------------------------------
// Config structs (matching sources.toml schema)
// ---------------------------------------------------------------------------

/// Top-level pipeline config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Run tunables.
    #[serde(default)]
    pub settings: Settings,

    /// Ordered source registry.
    #[serde(default)]
    pub sources: Vec<SourceEntry>,
}

impl PipelineConfig {
    /// Set the feed URL of source `id`. Returns `true` when the entry changed.
    pub fn record_feed_url(&mut self, id: &str, feed_url: &str) -> bool {
        match self.sources.iter_mut().find(|entry| entry.id == id) {
            Some(entry) if entry.feed_url.as_deref() != Some(feed_url) => {
                entry.feed_url = Some(feed_url.to_string());
                true
            }
            _ => false,
        }
    }
}

/// `[settings]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Size of the fetch worker pool.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Number of retry passes for errored sources.
    #[serde(default = "default_retry_on_failure")]
    pub retry_on_failure: u32,

    /// Base delay before a retry pass; doubles on each further pass.
    #[serde(default = "default_retry_delay_seconds")]
    pub retry_delay_seconds: f64,

    #[serde(default = "default_degraded_after_failures")]
    pub degraded_after_failures: u32,

    #[serde(default = "default_unhealthy_after_failures")]
    pub unhealthy_after_failures: u32,

    #[serde(default = "default_degraded_cooldown_minutes")]
    pub degraded_cooldown_minutes: u64,

    #[serde(default = "default_unhealthy_cooldown_minutes")]
    pub unhealthy_cooldown_minutes: u64,

    /// Per-request HTTP timeout.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Hard cap on one source attempt (feed plus fallback).
    #[serde(default = "default_attempt_timeout_secs")]
    pub attempt_timeout_secs: u64,

    /// Wall-clock budget for the whole run.
    #[serde(default = "default_run_budget_minutes")]
    pub run_budget_minutes: u64,

    /// Below this share of successful eligible sources the run is critical.
    #[serde(default = "default_min_success_ratio")]
    pub min_success_ratio: f64,

    #[serde(default = "default_max_items_per_source")]
    pub max_items_per_source: usize,

    /// Anchors inspected by the page fallback.
    #[serde(default = "default_html_scan_limit")]
    pub html_scan_limit: usize,

    /// Candidate URLs tried per source by `audit` and by in-run discovery.
    #[serde(default = "default_feed_probe_limit")]
    pub feed_probe_limit: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            retry_on_failure: default_retry_on_failure(),
            retry_delay_seconds: default_retry_delay_seconds(),
            degraded_after_failures: default_degraded_after_failures(),
            unhealthy_after_failures: default_unhealthy_after_failures(),
            degraded_cooldown_minutes: default_degraded_cooldown_minutes(),
            unhealthy_cooldown_minutes: default_unhealthy_cooldown_minutes(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            attempt_timeout_secs: default_attempt_timeout_secs(),
            run_budget_minutes: default_run_budget_minutes(),
            min_success_ratio: default_min_success_ratio(),
            max_items_per_source: default_max_items_per_source(),
            html_scan_limit: default_html_scan_limit(),
            feed_probe_limit: default_feed_probe_limit(),
        }
    }
}

fn default_workers() -> usize {
    10
}
fn default_retry_on_failure() -> u32 {
    1
}
fn default_retry_delay_seconds() -> f64 {
    2.0
}
fn default_degraded_after_failures() -> u32 {
    2
}
fn default_unhealthy_after_failures() -> u32 {
    4
}
fn default_degraded_cooldown_minutes() -> u64 {
    60
}
fn default_unhealthy_cooldown_minutes() -> u64 {
    360
}
fn default_fetch_timeout_secs() -> u64 {
    20
}
fn default_connect_timeout_secs() -> u64 {
    4
}
fn default_attempt_timeout_secs() -> u64 {
    60
}
fn default_run_budget_minutes() -> u64 {
    30
}
fn default_min_success_ratio() -> f64 {
    0.5
}
fn default_max_items_per_source() -> usize {
    20
}
fn default_html_scan_limit() -> usize {
    500
}
fn default_feed_probe_limit() -> usize {
    8
}

/// `[[sources]]` entry, as written by the user. Validated by the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceEntry {
    /// Unique identifier.
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default)]
    pub category: SourceCategory,

    /// Listing page; also used for same-site checks.
    pub home_url: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feed_url: Option<String>,

    /// Defaults to feed-then-fallback, which discovers a feed when none is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<FetchStrategy>,

    /// Overrides `settings.max_items_per_source`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_items: Option<usize>,

    /// Extra URLs for feed discovery.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub feed_candidates: Vec<String>,
}

// ---------------------------------------------------------------------------
// Fetch config (runtime, derived from settings)
// ---------------------------------------------------------------------------

/// Runtime HTTP/extraction configuration used by the fetchers.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Anchors inspected by the page fallback.
    pub html_scan_limit: usize,
    /// Candidate URLs tried when a source's feed is missing or broken.
    pub feed_probe_limit: usize,
}

impl From<&Settings> for FetchConfig {
    fn from(settings: &Settings) -> Self {
        let max_items = settings.max_items_per_source.clamp(1, 200);
        Self {
            timeout_secs: settings.fetch_timeout_secs.clamp(1, 300),
            connect_timeout_secs: settings.connect_timeout_secs.clamp(1, 60),
            html_scan_limit: settings.html_scan_limit.min(2000).max(max_items),
            feed_probe_limit: settings.feed_probe_limit.clamp(1, 20),
        }
    }
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.sourcewatch/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| SourcewatchError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the default registry path (`~/.sourcewatch/sources.toml`).
pub fn sources_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(SOURCES_FILE_NAME))
}

/// Get the default database path (`~/.sourcewatch/sourcewatch.db`).
pub fn default_db_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(DB_FILE_NAME))
}

/// Load the pipeline config from the default location.
///
/// A missing file yields defaults with an empty registry, which the
/// orchestrator later rejects.
pub fn load_config() -> Result<PipelineConfig> {
    let path = sources_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "sources file not found, using defaults");
        return Ok(PipelineConfig::default());
    }

    load_config_from(&path)
}

/// Load the pipeline config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<PipelineConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| SourcewatchError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        SourcewatchError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Write a starter registry to `path` (or the default location).
/// Refuses to overwrite an existing file. Returns the written path.
pub fn init_config(path: Option<&Path>) -> Result<PathBuf> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => sources_file_path()?,
    };

    if path.exists() {
        return Err(SourcewatchError::config(format!(
            "{} already exists; remove it first to regenerate",
            path.display()
        )));
    }

    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).map_err(|e| SourcewatchError::io(dir, e))?;
    }

    let config = starter_config();
    let content =
        toml::to_string_pretty(&config).map_err(|e| SourcewatchError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| SourcewatchError::io(&path, e))?;
    tracing::info!(?path, "created starter sources file");

    Ok(path)
}

/// Write `config` back to `path`, replacing the file.
pub fn save_config_to(path: &Path, config: &PipelineConfig) -> Result<()> {
    let content =
        toml::to_string_pretty(config).map_err(|e| SourcewatchError::config(e.to_string()))?;
    std::fs::write(path, content).map_err(|e| SourcewatchError::io(path, e))
}

fn starter_config() -> PipelineConfig {
    PipelineConfig {
        settings: Settings::default(),
        sources: vec![
            SourceEntry {
                id: "example-feed".into(),
                name: Some("Example Engineering Blog".into()),
                category: SourceCategory::EngineeringBlog,
                home_url: "https://example.com/blog".into(),
                feed_url: Some("https://example.com/blog/rss.xml".into()),
                strategy: Some(FetchStrategy::FeedThenFallback),
                max_items: None,
                feed_candidates: Vec::new(),
            },
            SourceEntry {
                id: "example-news".into(),
                name: Some("Example Research News".into()),
                category: SourceCategory::ResearchLab,
                home_url: "https://example.org/news".into(),
                feed_url: None,
                strategy: Some(FetchStrategy::FallbackOnly),
                max_items: Some(10),
                feed_candidates: Vec::new(),
            },
        ],
    }
}
