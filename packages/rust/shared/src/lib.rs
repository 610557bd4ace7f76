//! Shared types, error model, and configuration for sourcewatch.
//!
//! This crate is the foundation depended on by all other sourcewatch crates.
//! It provides:
//! - [`SourcewatchError`] and [`FetchError`], the error model
//! - Domain types ([`Source`], [`HealthRecord`], [`Item`], [`RunOutput`])
//! - Configuration ([`PipelineConfig`], [`FetchConfig`], config loading)
//! - Canonical text helpers and the stable item uid

pub mod config;
pub mod error;
pub mod text;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    FetchConfig, PipelineConfig, Settings, SourceEntry, config_dir, default_db_path, init_config,
    load_config, load_config_from, save_config_to, sources_file_path,
};
pub use error::{FailureKind, FetchError, Result, SourcewatchError};
pub use text::{compact_text, host_of, normalize_url, stable_item_uid};
pub use types::{
    Analysis, CoverageFailure, FetchStrategy, HealthLevel, HealthRecord, Item, ItemVia,
    ReadingPriority, RunItem, RunOutput, RunSummary, Source, SourceCategory, SourceReport,
    SourceStatus,
};
