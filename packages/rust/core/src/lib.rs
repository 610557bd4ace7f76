//! Core run orchestration and domain logic for sourcewatch.
//!
//! This crate ties the registry, fetchers, health tracker and stores together
//! into a single run ([`pipeline::Orchestrator::run`]).

pub mod analysis;
pub mod health;
pub mod pipeline;
pub mod registry;
pub mod retry;
pub mod stores;
pub mod summary;

pub use analysis::{ItemAnalyzer, RuleBasedAnalyzer, annotate};
pub use health::{HealthEvent, HealthPolicy};
pub use pipeline::{Orchestrator, RunConfig, RunProgress, SilentProgress};
pub use registry::SourceRegistry;
pub use retry::{PendingRetry, RetryQueue, retry_delay};
pub use stores::{DedupStore, HealthStore, MemoryDedupStore, MemoryHealthStore};
pub use summary::{build_output, coverage_check};
