//! One full ingestion run: eligibility → phase 1 → retry passes → merge →
//! health update → run output.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use sourcewatch_crawler::{Harvest, SourceFetcher};
use sourcewatch_shared::{
    FailureKind, FetchError, Item, ItemVia, Result, RunOutput, Settings, Source, SourceReport,
    SourceStatus,
};

use crate::analysis::{self, ItemAnalyzer};
use crate::health::{HealthEvent, HealthPolicy};
use crate::registry::SourceRegistry;
use crate::retry::{RetryQueue, retry_delay};
use crate::stores::{DedupStore, HealthStore};
use crate::summary;

/// Runtime knobs of the orchestrator, clamped from [`Settings`].
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Concurrent fetches within a phase.
    pub workers: usize,
    /// Retry passes after phase 1.
    pub retry_passes: u32,
    pub retry_delay_secs: f64,
    /// Hard cap on a single fetch attempt.
    pub attempt_timeout: Duration,
    /// Wall-clock budget of the whole run.
    pub budget: Duration,
    pub min_success_ratio: f64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::from(&Settings::default())
    }
}

impl From<&Settings> for RunConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            workers: settings.workers.clamp(1, 64),
            retry_passes: settings.retry_on_failure.min(3),
            retry_delay_secs: settings.retry_delay_seconds,
            attempt_timeout: Duration::from_secs(settings.attempt_timeout_secs.clamp(1, 600)),
            budget: Duration::from_secs(settings.run_budget_minutes.clamp(1, 24 * 60) * 60),
            min_success_ratio: settings.min_success_ratio,
        }
    }
}

/// Progress callback for reporting run status.
pub trait RunProgress: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called when a fetch attempt finishes.
    fn attempt_finished(&self, source_id: &str, ok: bool, done: usize, total: usize);
    /// Called when the run completes.
    fn done(&self, output: &RunOutput);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl RunProgress for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn attempt_finished(&self, _source_id: &str, _ok: bool, _done: usize, _total: usize) {}
    fn done(&self, _output: &RunOutput) {}
}

type AttemptResult = std::result::Result<Harvest, FetchError>;

/// Merge verdict for one eligible source.
struct Outcome {
    status: SourceStatus,
    via: Option<ItemVia>,
    item_count: usize,
    new_count: usize,
    error: Option<String>,
    failure_kind: Option<FailureKind>,
    discovered_feed: Option<String>,
    /// `None` when the failure was ours rather than the source's.
    event: Option<HealthEvent>,
}

/// Attempt history of one eligible source.
struct Tracked {
    source: Source,
    result: AttemptResult,
    errors: Vec<String>,
    retry_count: u32,
}

/// Runs the pipeline against injected fetcher and stores.
pub struct Orchestrator {
    fetcher: Arc<dyn SourceFetcher>,
    dedup: Arc<dyn DedupStore>,
    health: Arc<dyn HealthStore>,
    policy: HealthPolicy,
    config: RunConfig,
    analyzer: Option<Arc<dyn ItemAnalyzer>>,
}

impl Orchestrator {
    pub fn new(
        fetcher: Arc<dyn SourceFetcher>,
        dedup: Arc<dyn DedupStore>,
        health: Arc<dyn HealthStore>,
        config: RunConfig,
        policy: HealthPolicy,
    ) -> Self {
        Self {
            fetcher,
            dedup,
            health,
            policy,
            config,
            analyzer: None,
        }
    }

    pub fn with_analyzer(mut self, analyzer: Arc<dyn ItemAnalyzer>) -> Self {
        self.analyzer = Some(analyzer);
        self
    }

    /// Execute one run over `registry`, updating its health records.
    ///
    /// Per-source failures never fail the run. Store failures after the
    /// fetch phases are contained and listed in `store_errors`; the only
    /// error returned is a health store that cannot be read up front.
    #[instrument(skip_all, fields(sources = registry.len()))]
    pub async fn run(
        &self,
        registry: &mut SourceRegistry,
        progress: &dyn RunProgress,
    ) -> Result<RunOutput> {
        let run_id = Uuid::now_v7();
        let started_at = Utc::now();
        let deadline = Instant::now() + self.config.budget;

        info!(%run_id, sources = registry.len(), "starting run");

        // --- Eligibility ---
        progress.phase("Checking source health");
        registry.hydrate(self.health.load().await?);
        let (eligible, cooling) = registry.partition_eligible(started_at);
        for source in &cooling {
            info!(
                source = %source.id,
                until = ?source.health.cooldown_until,
                "skipping source in cooldown"
            );
        }

        // --- Phase 1 ---
        progress.phase("Fetching sources");
        let batch: Vec<(usize, Source)> = eligible.iter().cloned().enumerate().collect();
        let mut results = self.run_pass(batch, deadline, progress).await;

        let mut tracked: Vec<Tracked> = eligible
            .into_iter()
            .enumerate()
            .map(|(idx, source)| {
                let result = results.remove(&idx).unwrap_or(Err(FetchError::Abandoned));
                let errors = result.as_ref().err().map(|e| vec![e.to_string()]).unwrap_or_default();
                Tracked {
                    source,
                    result,
                    errors,
                    retry_count: 0,
                }
            })
            .collect();

        // --- Retry passes ---
        for pass in 1..=self.config.retry_passes {
            let mut queue = RetryQueue::new();
            for (idx, t) in tracked.iter().enumerate() {
                if let Err(e) = &t.result {
                    queue.push(idx, t.source.clone(), e.clone());
                }
            }
            if queue.is_empty() {
                break;
            }

            let delay = retry_delay(self.config.retry_delay_secs, pass);
            if Instant::now() + delay >= deadline {
                warn!(pass, pending = queue.len(), "run budget exhausted, skipping retry pass");
                break;
            }

            info!(pass, sources = ?queue.source_ids(), delay_ms = delay.as_millis() as u64, "scheduling retry pass");
            progress.phase(&format!("Retrying {} source(s)", queue.len()));
            tokio::time::sleep(delay).await;

            let pending = queue.drain();
            let indices: Vec<usize> = pending.iter().map(|p| p.index).collect();
            for p in &pending {
                debug!(source = %p.source.id, error = %p.last_error, "retrying");
            }
            let batch = pending.into_iter().map(|p| (p.index, p.source)).collect();
            let mut retried = self.run_pass(batch, deadline, progress).await;

            for idx in indices {
                let t = &mut tracked[idx];
                let result = retried.remove(&idx).unwrap_or(Err(FetchError::Abandoned));
                if let Err(e) = &result {
                    t.errors.push(e.to_string());
                }
                t.retry_count += 1;
                t.result = result;
            }
        }

        // --- Merge (read-only against the dedup store), health ---
        progress.phase("Merging results");
        let checked_at = Utc::now();
        let mut new_items: Vec<Item> = Vec::new();
        let mut claimed: HashMap<String, String> = HashMap::new();
        let mut reports: HashMap<String, SourceReport> = HashMap::new();
        let mut store_errors: Vec<String> = Vec::new();

        for t in tracked {
            let source_id = t.source.id.clone();
            let retry_attempted = t.retry_count > 0;

            let outcome = match t.result {
                Ok(harvest) => {
                    if let Harvest::Page {
                        feed_error: Some(e),
                        ..
                    } = &harvest
                    {
                        debug!(source = %source_id, error = %e, "items came from page fallback");
                    }
                    let via = harvest.via();
                    let discovered_feed = harvest.discovered_feed().map(str::to_string);
                    let items = harvest.into_items();
                    let fetched = items.len();
                    match self.fresh_items(items, &mut claimed).await {
                        Ok(fresh) => {
                            let new_count = fresh.len();
                            new_items.extend(fresh);
                            Outcome {
                                status: if fetched == 0 {
                                    SourceStatus::Empty
                                } else {
                                    SourceStatus::Ok
                                },
                                via: Some(via),
                                item_count: fetched,
                                new_count,
                                error: None,
                                failure_kind: None,
                                discovered_feed,
                                event: Some(HealthEvent::Success {
                                    empty: fetched == 0,
                                }),
                            }
                        }
                        Err(e) => {
                            // Nothing was recorded for this source, so its
                            // items come back on the next run.
                            warn!(source = %source_id, error = %e, "dedup lookup failed, holding back items");
                            let error = format!("dedup store: {e}");
                            store_errors.push(format!("{source_id}: {error}"));
                            Outcome {
                                status: SourceStatus::Error,
                                via: Some(via),
                                item_count: fetched,
                                new_count: 0,
                                error: Some(error),
                                failure_kind: Some(FailureKind::Store),
                                discovered_feed,
                                event: None,
                            }
                        }
                    }
                }
                Err(last) => {
                    let error = t.errors.join("; ");
                    Outcome {
                        status: SourceStatus::Error,
                        via: None,
                        item_count: 0,
                        new_count: 0,
                        failure_kind: Some(last.kind()),
                        discovered_feed: None,
                        event: Some(HealthEvent::Failure {
                            error: error.clone(),
                        }),
                        error: Some(error),
                    }
                }
            };

            // A store failure says nothing about the source; its health stays as loaded.
            let next = match &outcome.event {
                Some(event) => {
                    let next = self.policy.apply(&t.source.health, event, checked_at);
                    if next.level != t.source.health.level {
                        info!(
                            source = %source_id,
                            from = t.source.health.level.as_str(),
                            to = next.level.as_str(),
                            failures = next.consecutive_failures,
                            "health level changed"
                        );
                    }
                    if let Err(e) = self.health.save(&source_id, &next).await {
                        warn!(source = %source_id, error = %e, "failed to persist health record");
                        store_errors.push(format!("{source_id}: health store: {e}"));
                    }
                    registry.apply_health(&source_id, next.clone());
                    next
                }
                None => t.source.health.clone(),
            };

            match &outcome.error {
                Some(e) => warn!(source = %source_id, error = %e, retries = t.retry_count, "source failed"),
                None => info!(
                    source = %source_id,
                    items = outcome.item_count,
                    new = outcome.new_count,
                    "source fetched"
                ),
            }

            reports.insert(
                source_id.clone(),
                SourceReport {
                    source_id,
                    name: t.source.name.clone(),
                    status: outcome.status,
                    via: outcome.via,
                    item_count: outcome.item_count,
                    new_item_count: outcome.new_count,
                    error: outcome.error,
                    failure_kind: outcome.failure_kind,
                    discovered_feed: outcome.discovered_feed,
                    retry_attempted,
                    retry_succeeded: retry_attempted && outcome.status.is_success(),
                    retry_count: t.retry_count,
                    health_level: next.level,
                    consecutive_failures: next.consecutive_failures,
                    cooldown_until: next.cooldown_until,
                    checked_at: Some(checked_at),
                },
            );
        }

        for source in cooling {
            reports.insert(
                source.id.clone(),
                SourceReport {
                    source_id: source.id.clone(),
                    name: source.name.clone(),
                    status: SourceStatus::SkippedCooldown,
                    via: None,
                    item_count: 0,
                    new_item_count: 0,
                    error: None,
                    failure_kind: None,
                    discovered_feed: None,
                    retry_attempted: false,
                    retry_succeeded: false,
                    retry_count: 0,
                    health_level: source.health.level,
                    consecutive_failures: source.health.consecutive_failures,
                    cooldown_until: source.health.cooldown_until,
                    checked_at: None,
                },
            );
        }

        let ordered_reports: Vec<SourceReport> = registry
            .sources()
            .iter()
            .filter_map(|s| reports.remove(&s.id))
            .collect();

        // --- Annotate and assemble ---
        let items = match &self.analyzer {
            Some(analyzer) => {
                progress.phase("Analyzing new items");
                let unannotated = new_items.clone();
                let annotating = analysis::annotate(new_items, Some(analyzer.as_ref()));
                match tokio::time::timeout_at(deadline, annotating).await {
                    Ok(mut annotated) => {
                        analysis::sort_by_relevance(&mut annotated);
                        annotated
                    }
                    Err(_) => {
                        warn!("run budget exhausted during analysis, emitting items unannotated");
                        analysis::annotate(unannotated, None).await
                    }
                }
            }
            None => analysis::annotate(new_items, None).await,
        };

        let mut output = summary::build_output(
            run_id,
            started_at,
            ordered_reports,
            items,
            self.config.min_success_ratio,
        );
        output.store_errors = store_errors;

        // --- Record emitted items ---
        // A uid is marked seen only once its item is part of the output.
        for run_item in &output.items {
            if let Err(e) = self.dedup.insert(&run_item.item).await {
                warn!(uid = %run_item.item.uid, error = %e, "failed to record item, it may be emitted again");
                output
                    .store_errors
                    .push(format!("{}: dedup store: {e}", run_item.item.source_id));
            }
        }

        info!(
            %run_id,
            checked = output.summary.sources_checked,
            successful = output.summary.sources_successful,
            skipped = output.summary.sources_skipped_cooldown,
            new_items = output.summary.new_items_count,
            retried = output.summary.retry_attempted_sources,
            recovered = output.summary.retry_recovered_sources,
            "run completed"
        );
        if let Some(critical) = &output.critical {
            warn!(%run_id, "{critical}");
        }
        if !output.store_errors.is_empty() {
            warn!(%run_id, errors = output.store_errors.len(), "run completed with store errors");
        }

        progress.done(&output);
        Ok(output)
    }

    /// Items of one harvest not claimed earlier in this run and not already
    /// known to the dedup store. Nothing is written; on a lookup error no
    /// claims are kept for the harvest.
    async fn fresh_items(
        &self,
        items: Vec<Item>,
        claimed: &mut HashMap<String, String>,
    ) -> Result<Vec<Item>> {
        let mut checked: Vec<(String, String)> = Vec::new();
        let mut fresh = Vec::new();

        for item in items {
            if let Some(owner) = claimed.get(&item.uid) {
                if owner != &item.source_id {
                    warn!(uid = %item.uid, first = %owner, second = %item.source_id, "uid collision across sources");
                }
                continue;
            }
            if checked.iter().any(|(uid, _)| uid == &item.uid) {
                continue;
            }
            checked.push((item.uid.clone(), item.source_id.clone()));
            if !self.dedup.exists(&item.uid).await? {
                fresh.push(item);
            }
        }

        claimed.extend(checked);
        Ok(fresh)
    }

    /// Fetch a batch through the worker pool. Sources missing from the
    /// returned map were abandoned when the budget ran out.
    async fn run_pass(
        &self,
        batch: Vec<(usize, Source)>,
        deadline: Instant,
        progress: &dyn RunProgress,
    ) -> HashMap<usize, AttemptResult> {
        let total = batch.len();
        let semaphore = Arc::new(Semaphore::new(self.config.workers));
        let attempt_timeout = self.config.attempt_timeout;
        let mut set = JoinSet::new();

        for (idx, source) in batch {
            let fetcher = self.fetcher.clone();
            let sem = semaphore.clone();
            set.spawn(async move {
                let Ok(_permit) = sem.acquire_owned().await else {
                    return (idx, source.id, Err(FetchError::Abandoned));
                };
                let result = match tokio::time::timeout(attempt_timeout, fetcher.fetch(&source)).await {
                    Ok(result) => result,
                    Err(_) => Err(FetchError::Timeout {
                        secs: attempt_timeout.as_secs(),
                    }),
                };
                (idx, source.id, result)
            });
        }

        let mut results = HashMap::with_capacity(total);
        loop {
            match tokio::time::timeout_at(deadline, set.join_next()).await {
                Ok(Some(Ok((idx, source_id, result)))) => {
                    progress.attempt_finished(&source_id, result.is_ok(), results.len() + 1, total);
                    results.insert(idx, result);
                }
                Ok(Some(Err(e))) => {
                    warn!(error = %e, "fetch task failed");
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(in_flight = set.len(), "run budget exhausted, abandoning in-flight fetches");
                    set.abort_all();
                    break;
                }
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stores::{MemoryDedupStore, MemoryHealthStore};
    use async_trait::async_trait;
    use chrono::{DateTime, Duration as ChronoDuration};
    use sourcewatch_shared::{
        FetchStrategy, HealthLevel, HealthRecord, SourceCategory,
    };
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    // -----------------------------------------------------------------------
    // Scripted fetcher
    // -----------------------------------------------------------------------

    #[derive(Clone)]
    enum Step {
        Items(usize),
        DiscoveredItems(usize),
        PageItems(usize),
        Fail,
        Hang,
    }

    /// Replays a per-source script; the last step repeats once exhausted.
    #[derive(Default)]
    struct ScriptedFetcher {
        scripts: Mutex<HashMap<String, VecDeque<Step>>>,
        calls: Mutex<HashMap<String, usize>>,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedFetcher {
        fn with(scripts: &[(&str, &[Step])]) -> Self {
            let fetcher = Self::default();
            {
                let mut map = fetcher.scripts.lock().unwrap();
                for (id, steps) in scripts {
                    map.insert(id.to_string(), steps.iter().cloned().collect());
                }
            }
            fetcher
        }

        fn calls(&self, id: &str) -> usize {
            self.calls.lock().unwrap().get(id).copied().unwrap_or(0)
        }

        fn next_step(&self, id: &str) -> Step {
            *self.calls.lock().unwrap().entry(id.to_string()).or_default() += 1;
            let mut scripts = self.scripts.lock().unwrap();
            let queue = scripts.entry(id.to_string()).or_default();
            if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().cloned().unwrap_or(Step::Items(0))
            }
        }
    }

    fn items_for(source: &Source, n: usize) -> Vec<Item> {
        (0..n)
            .map(|i| {
                Item::new(
                    &source.id,
                    &format!("{}post-{i}", source.home_url),
                    &format!("{} post {i}", source.id),
                    None,
                    String::new(),
                    Utc::now(),
                )
            })
            .collect()
    }

    #[async_trait]
    impl SourceFetcher for ScriptedFetcher {
        async fn fetch(&self, source: &Source) -> std::result::Result<Harvest, FetchError> {
            let step = self.next_step(&source.id);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            let result = match step {
                Step::Items(n) => Ok(Harvest::Feed {
                    feed_url: format!("{}feed.xml", source.home_url),
                    items: items_for(source, n),
                    discovered: false,
                }),
                Step::DiscoveredItems(n) => Ok(Harvest::Feed {
                    feed_url: format!("{}index.rss", source.home_url),
                    items: items_for(source, n),
                    discovered: true,
                }),
                Step::PageItems(n) => Ok(Harvest::Page {
                    items: items_for(source, n),
                    feed_error: Some(FetchError::Parse("not a feed".into())),
                }),
                Step::Fail => Err(FetchError::Http {
                    status: 503,
                    url: source.home_url.to_string(),
                }),
                Step::Hang => {
                    tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                    Ok(Harvest::Feed {
                        feed_url: String::new(),
                        items: Vec::new(),
                        discovered: false,
                    })
                }
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    fn source(id: &str) -> Source {
        Source {
            id: id.into(),
            name: id.to_uppercase(),
            category: SourceCategory::Other,
            home_url: Url::parse(&format!("https://{id}.example.com/blog/")).unwrap(),
            feed_url: Some(Url::parse(&format!("https://{id}.example.com/feed.xml")).unwrap()),
            strategy: FetchStrategy::FeedThenFallback,
            max_items: 20,
            feed_candidates: Vec::new(),
            health: HealthRecord::default(),
        }
    }

    fn registry(ids: &[&str]) -> SourceRegistry {
        SourceRegistry::from_sources(ids.iter().map(|id| source(id)).collect()).unwrap()
    }

    fn fast_config() -> RunConfig {
        RunConfig {
            workers: 4,
            retry_passes: 1,
            retry_delay_secs: 0.0,
            attempt_timeout: std::time::Duration::from_secs(5),
            budget: std::time::Duration::from_secs(60),
            min_success_ratio: 0.5,
        }
    }

    struct Harness {
        fetcher: Arc<ScriptedFetcher>,
        dedup: Arc<MemoryDedupStore>,
        health: Arc<MemoryHealthStore>,
        orchestrator: Orchestrator,
    }

    fn harness(fetcher: ScriptedFetcher, health: MemoryHealthStore, config: RunConfig) -> Harness {
        let fetcher = Arc::new(fetcher);
        let dedup = Arc::new(MemoryDedupStore::new());
        let health = Arc::new(health);
        let orchestrator = Orchestrator::new(
            fetcher.clone(),
            dedup.clone(),
            health.clone(),
            config,
            HealthPolicy::default(),
        );
        Harness {
            fetcher,
            dedup,
            health,
            orchestrator,
        }
    }

    fn cooling(until: DateTime<Utc>) -> HealthRecord {
        HealthRecord {
            level: HealthLevel::Degraded,
            consecutive_failures: 2,
            cooldown_until: Some(until),
            ..HealthRecord::default()
        }
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn mixed_run_scenario() {
        let mut records = HashMap::new();
        records.insert("c".to_string(), cooling(Utc::now() + ChronoDuration::hours(1)));

        let h = harness(
            ScriptedFetcher::with(&[
                ("a", &[Step::Items(2)]),
                ("b", &[Step::Fail, Step::Items(1)]),
                ("c", &[Step::Items(5)]),
            ]),
            MemoryHealthStore::with_records(records),
            fast_config(),
        );
        let mut reg = registry(&["a", "b", "c"]);
        let output = h.orchestrator.run(&mut reg, &SilentProgress).await.unwrap();

        let s = &output.summary;
        assert_eq!(s.sources_checked, 3);
        assert_eq!(s.sources_skipped_cooldown, 1);
        assert_eq!(s.sources_successful, 2);
        assert_eq!(s.retry_attempted_sources, 1);
        assert_eq!(s.retry_recovered_sources, 1);
        assert_eq!(s.new_items_count, 3);
        assert!(!output.is_critical());

        assert_eq!(h.fetcher.calls("c"), 0);
        assert_eq!(h.fetcher.calls("b"), 2);

        let ids: Vec<_> = output.sources.iter().map(|r| r.source_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(output.sources[2].status, SourceStatus::SkippedCooldown);
        assert!(output.sources[1].retry_succeeded);
        assert_eq!(output.sources[1].retry_count, 1);

        // Items follow registry order, then source order.
        let sources: Vec<_> = output.items.iter().map(|i| i.item.source_id.as_str()).collect();
        assert_eq!(sources, vec!["a", "a", "b"]);
    }

    #[tokio::test]
    async fn failing_source_does_not_affect_siblings() {
        let h = harness(
            ScriptedFetcher::with(&[
                ("s1", &[Step::Items(1)]),
                ("s2", &[Step::Items(1)]),
                ("s3", &[Step::Fail]),
                ("s4", &[Step::Items(1)]),
                ("s5", &[Step::Items(1)]),
            ]),
            MemoryHealthStore::new(),
            fast_config(),
        );
        let mut reg = registry(&["s1", "s2", "s3", "s4", "s5"]);
        let output = h.orchestrator.run(&mut reg, &SilentProgress).await.unwrap();

        assert_eq!(output.summary.sources_successful, 4);
        assert_eq!(output.summary.new_items_count, 4);
        assert_eq!(output.summary.retry_attempted_sources, 1);
        assert_eq!(output.summary.retry_recovered_sources, 0);

        let failed = &output.sources[2];
        assert_eq!(failed.status, SourceStatus::Error);
        // Both phase errors are kept.
        assert_eq!(failed.error.as_deref().unwrap().matches("503").count(), 2);
        assert_eq!(failed.failure_kind, Some(FailureKind::Network));
        assert_eq!(h.health.get("s3").await.unwrap().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn second_identical_run_is_idempotent() {
        let h = harness(
            ScriptedFetcher::with(&[("a", &[Step::Items(3)]), ("b", &[Step::Items(2)])]),
            MemoryHealthStore::new(),
            fast_config(),
        );
        let mut reg = registry(&["a", "b"]);

        let first = h.orchestrator.run(&mut reg, &SilentProgress).await.unwrap();
        assert_eq!(first.summary.new_items_count, 5);
        assert_eq!(h.dedup.len().await, 5);

        let second = h.orchestrator.run(&mut reg, &SilentProgress).await.unwrap();
        assert_eq!(second.summary.new_items_count, 0);
        assert_eq!(second.summary.items_fetched_count, 5);
        assert_eq!(second.summary.sources_with_items, 2);
        assert!(second.items.is_empty());
        assert_eq!(h.dedup.len().await, 5);
    }

    #[tokio::test]
    async fn health_degrades_and_cools_down() {
        let h = harness(
            ScriptedFetcher::with(&[("flaky", &[Step::Fail]), ("ok", &[Step::Items(1)])]),
            MemoryHealthStore::new(),
            RunConfig {
                retry_passes: 0,
                ..fast_config()
            },
        );
        let mut reg = registry(&["flaky", "ok"]);

        h.orchestrator.run(&mut reg, &SilentProgress).await.unwrap();
        let after_one = h.health.get("flaky").await.unwrap();
        assert_eq!(after_one.level, HealthLevel::Healthy);
        assert_eq!(after_one.consecutive_failures, 1);

        h.orchestrator.run(&mut reg, &SilentProgress).await.unwrap();
        let after_two = h.health.get("flaky").await.unwrap();
        assert_eq!(after_two.level, HealthLevel::Degraded);
        assert!(after_two.cooldown_until.is_some());
        assert_eq!(reg.get("flaky").unwrap().health, after_two);

        // Third run: cooling, so no attempt is made.
        let third = h.orchestrator.run(&mut reg, &SilentProgress).await.unwrap();
        assert_eq!(h.fetcher.calls("flaky"), 2);
        assert_eq!(third.summary.sources_skipped_cooldown, 1);
        assert_eq!(h.health.get("flaky").await.unwrap(), after_two);
    }

    #[tokio::test]
    async fn empty_harvest_counts_as_success() {
        let h = harness(
            ScriptedFetcher::with(&[("quiet", &[Step::Items(0)])]),
            MemoryHealthStore::new(),
            fast_config(),
        );
        let mut reg = registry(&["quiet"]);
        let output = h.orchestrator.run(&mut reg, &SilentProgress).await.unwrap();

        assert_eq!(output.sources[0].status, SourceStatus::Empty);
        assert_eq!(output.summary.sources_successful, 1);
        assert_eq!(output.summary.sources_with_items, 0);
        assert_eq!(output.summary.retry_attempted_sources, 0);
        assert_eq!(h.fetcher.calls("quiet"), 1);
    }

    #[tokio::test]
    async fn page_harvest_reports_via() {
        let h = harness(
            ScriptedFetcher::with(&[("p", &[Step::PageItems(2)])]),
            MemoryHealthStore::new(),
            fast_config(),
        );
        let mut reg = registry(&["p"]);
        let output = h.orchestrator.run(&mut reg, &SilentProgress).await.unwrap();
        assert_eq!(output.sources[0].via, Some(sourcewatch_shared::ItemVia::Page));
        assert_eq!(output.summary.new_items_count, 2);
    }

    #[tokio::test]
    async fn worker_pool_bounds_concurrency() {
        let ids: Vec<String> = (0..12).map(|i| format!("s{i}")).collect();
        let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let h = harness(
            ScriptedFetcher::default(),
            MemoryHealthStore::new(),
            RunConfig {
                workers: 3,
                ..fast_config()
            },
        );
        let mut reg = registry(&id_refs);
        h.orchestrator.run(&mut reg, &SilentProgress).await.unwrap();
        assert!(h.fetcher.max_in_flight.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn attempt_timeout_is_a_failure() {
        let h = harness(
            ScriptedFetcher::with(&[("slow", &[Step::Hang]), ("fast", &[Step::Items(1)])]),
            MemoryHealthStore::new(),
            RunConfig {
                retry_passes: 0,
                attempt_timeout: std::time::Duration::from_millis(100),
                ..fast_config()
            },
        );
        let mut reg = registry(&["slow", "fast"]);
        let output = h.orchestrator.run(&mut reg, &SilentProgress).await.unwrap();

        assert_eq!(output.sources[0].status, SourceStatus::Error);
        assert!(output.sources[0].error.as_deref().unwrap().contains("timed out"));
        assert_eq!(output.sources[1].status, SourceStatus::Ok);
    }

    #[tokio::test]
    async fn budget_exhaustion_abandons_in_flight() {
        let h = harness(
            ScriptedFetcher::with(&[
                ("slow", &[Step::Hang]),
                ("fast", &[Step::Items(1)]),
                ("also-fast", &[Step::Items(1)]),
            ]),
            MemoryHealthStore::new(),
            RunConfig {
                retry_delay_secs: 2.0,
                budget: std::time::Duration::from_millis(300),
                ..fast_config()
            },
        );
        let mut reg = registry(&["slow", "fast", "also-fast"]);
        let started = std::time::Instant::now();
        let output = h.orchestrator.run(&mut reg, &SilentProgress).await.unwrap();

        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(output.sources[0].status, SourceStatus::Error);
        assert_eq!(
            output.sources[0].error.as_deref(),
            Some(FetchError::Abandoned.to_string().as_str())
        );
        // No time left for a retry pass.
        assert_eq!(output.summary.retry_attempted_sources, 0);
        assert_eq!(output.summary.new_items_count, 2);
        assert_eq!(h.health.get("slow").await.unwrap().consecutive_failures, 1);
    }

    #[tokio::test]
    async fn low_coverage_is_critical_but_keeps_items() {
        let h = harness(
            ScriptedFetcher::with(&[
                ("a", &[Step::Items(1)]),
                ("b", &[Step::Fail]),
                ("c", &[Step::Fail]),
            ]),
            MemoryHealthStore::new(),
            fast_config(),
        );
        let mut reg = registry(&["a", "b", "c"]);
        let output = h.orchestrator.run(&mut reg, &SilentProgress).await.unwrap();

        let critical = output.critical.as_ref().expect("critical");
        assert_eq!(critical.successful, 1);
        assert_eq!(critical.required, 2);
        assert_eq!(output.items.len(), 1);
    }

    #[tokio::test]
    async fn cross_source_uid_collision_keeps_first() {
        // Two sources producing an item with the same identity fields.
        struct Colliding;

        #[async_trait]
        impl SourceFetcher for Colliding {
            async fn fetch(&self, _source: &Source) -> std::result::Result<Harvest, FetchError> {
                let item = Item::new(
                    "shared",
                    "https://example.com/blog/same",
                    "Same",
                    None,
                    String::new(),
                    Utc::now(),
                );
                Ok(Harvest::Feed {
                    feed_url: String::new(),
                    items: vec![item],
                    discovered: false,
                })
            }
        }

        let dedup = Arc::new(MemoryDedupStore::new());
        let orchestrator = Orchestrator::new(
            Arc::new(Colliding),
            dedup.clone(),
            Arc::new(MemoryHealthStore::new()),
            fast_config(),
            HealthPolicy::default(),
        );
        let mut reg = registry(&["x", "y"]);
        let output = orchestrator.run(&mut reg, &SilentProgress).await.unwrap();
        assert_eq!(output.summary.new_items_count, 1);
        assert_eq!(output.sources[0].new_item_count, 1);
        assert_eq!(output.sources[1].new_item_count, 0);
        assert_eq!(dedup.len().await, 1);
    }

    #[tokio::test]
    async fn analyzer_annotates_new_items() {
        let fetcher = Arc::new(ScriptedFetcher::with(&[("a", &[Step::Items(2)])]));
        let orchestrator = Orchestrator::new(
            fetcher,
            Arc::new(MemoryDedupStore::new()),
            Arc::new(MemoryHealthStore::new()),
            fast_config(),
            HealthPolicy::default(),
        )
        .with_analyzer(Arc::new(crate::analysis::RuleBasedAnalyzer));
        let mut reg = registry(&["a"]);
        let output = orchestrator.run(&mut reg, &SilentProgress).await.unwrap();
        assert_eq!(output.items.len(), 2);
        assert!(output.items.iter().all(|i| i.analysis.is_some()));
    }

    /// Dedup store that fails the n-th insert, or lookups of chosen uids.
    #[derive(Default)]
    struct FlakyDedup {
        inner: MemoryDedupStore,
        inserts: AtomicUsize,
        fail_insert_at: Option<usize>,
        fail_lookup: Vec<String>,
    }

    #[async_trait]
    impl DedupStore for FlakyDedup {
        async fn exists(&self, uid: &str) -> Result<bool> {
            if self.fail_lookup.iter().any(|u| u == uid) {
                return Err(sourcewatch_shared::SourcewatchError::Storage("database is locked".into()));
            }
            self.inner.exists(uid).await
        }

        async fn insert(&self, item: &Item) -> Result<()> {
            let n = self.inserts.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail_insert_at == Some(n) {
                return Err(sourcewatch_shared::SourcewatchError::Storage("disk full".into()));
            }
            self.inner.insert(item).await
        }
    }

    /// Health store whose writes always fail.
    struct ReadOnlyHealth;

    #[async_trait]
    impl HealthStore for ReadOnlyHealth {
        async fn load(&self) -> Result<HashMap<String, HealthRecord>> {
            Ok(HashMap::new())
        }

        async fn save(&self, _source_id: &str, _record: &HealthRecord) -> Result<()> {
            Err(sourcewatch_shared::SourcewatchError::Storage("attempt to write a readonly database".into()))
        }
    }

    #[tokio::test]
    async fn failed_insert_still_emits_every_item() {
        let dedup = Arc::new(FlakyDedup {
            fail_insert_at: Some(2),
            ..FlakyDedup::default()
        });
        let health = Arc::new(MemoryHealthStore::new());
        let orchestrator = Orchestrator::new(
            Arc::new(ScriptedFetcher::with(&[("a", &[Step::Items(1)]), ("b", &[Step::Items(1)])])),
            dedup.clone(),
            health.clone(),
            fast_config(),
            HealthPolicy::default(),
        );
        let mut reg = registry(&["a", "b"]);
        let output = orchestrator.run(&mut reg, &SilentProgress).await.unwrap();

        assert_eq!(output.summary.new_items_count, 2);
        let sources: Vec<_> = output.items.iter().map(|i| i.item.source_id.as_str()).collect();
        assert_eq!(sources, vec!["a", "b"]);
        assert_eq!(dedup.inner.len().await, 1);
        assert_eq!(output.store_errors.len(), 1);
        assert!(output.store_errors[0].starts_with("b: dedup store"));
        assert_eq!(health.get("a").await.unwrap().consecutive_failures, 0);
        assert_eq!(health.get("b").await.unwrap().consecutive_failures, 0);
    }

    #[tokio::test]
    async fn failed_lookup_holds_back_only_that_source() {
        let b_uids = items_for(&source("b"), 2).into_iter().map(|i| i.uid).collect();
        let dedup = Arc::new(FlakyDedup {
            fail_lookup: b_uids,
            ..FlakyDedup::default()
        });
        let health = Arc::new(MemoryHealthStore::new());
        let orchestrator = Orchestrator::new(
            Arc::new(ScriptedFetcher::with(&[("a", &[Step::Items(1)]), ("b", &[Step::Items(2)])])),
            dedup.clone(),
            health.clone(),
            fast_config(),
            HealthPolicy::default(),
        );
        let mut reg = registry(&["a", "b"]);
        let output = orchestrator.run(&mut reg, &SilentProgress).await.unwrap();

        let held = &output.sources[1];
        assert_eq!(held.status, SourceStatus::Error);
        assert_eq!(held.failure_kind, Some(FailureKind::Store));
        assert_eq!(held.item_count, 2);
        assert_eq!(held.new_item_count, 0);
        // The source answered; its health is not charged for our failure.
        assert!(health.get("b").await.is_none());
        assert_eq!(held.consecutive_failures, 0);

        assert_eq!(output.summary.new_items_count, 1);
        assert_eq!(output.items[0].item.source_id, "a");
        assert_eq!(dedup.inner.len().await, 1);
        assert_eq!(output.store_errors.len(), 1);
    }

    #[tokio::test]
    async fn failed_health_write_does_not_abort_run() {
        let dedup = Arc::new(MemoryDedupStore::new());
        let orchestrator = Orchestrator::new(
            Arc::new(ScriptedFetcher::with(&[("a", &[Step::Items(1)]), ("b", &[Step::Fail])])),
            dedup.clone(),
            Arc::new(ReadOnlyHealth),
            RunConfig {
                retry_passes: 0,
                ..fast_config()
            },
            HealthPolicy::default(),
        );
        let mut reg = registry(&["a", "b"]);
        let output = orchestrator.run(&mut reg, &SilentProgress).await.unwrap();

        assert_eq!(output.items.len(), 1);
        assert_eq!(dedup.len().await, 1);
        assert_eq!(output.store_errors.len(), 2);
        // The in-memory registry still carries the new record.
        assert_eq!(reg.get("b").unwrap().health.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn slow_analyzer_is_cut_off_by_budget() {
        struct SlowAnalyzer;

        #[async_trait]
        impl ItemAnalyzer for SlowAnalyzer {
            async fn analyze(&self, item: &Item) -> Result<sourcewatch_shared::Analysis> {
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                crate::analysis::RuleBasedAnalyzer.analyze(item).await
            }
        }

        let dedup = Arc::new(MemoryDedupStore::new());
        let orchestrator = Orchestrator::new(
            Arc::new(ScriptedFetcher::with(&[("a", &[Step::Items(2)])])),
            dedup.clone(),
            Arc::new(MemoryHealthStore::new()),
            RunConfig {
                budget: std::time::Duration::from_millis(300),
                ..fast_config()
            },
            HealthPolicy::default(),
        )
        .with_analyzer(Arc::new(SlowAnalyzer));
        let mut reg = registry(&["a"]);
        let started = std::time::Instant::now();
        let output = orchestrator.run(&mut reg, &SilentProgress).await.unwrap();

        assert!(started.elapsed() < std::time::Duration::from_secs(5));
        assert_eq!(output.items.len(), 2);
        assert!(output.items.iter().all(|i| i.analysis.is_none()));
        assert_eq!(dedup.len().await, 2);
    }

    #[tokio::test]
    async fn discovered_feed_is_reported() {
        let h = harness(
            ScriptedFetcher::with(&[("d", &[Step::DiscoveredItems(1)]), ("c", &[Step::Items(1)])]),
            MemoryHealthStore::new(),
            fast_config(),
        );
        let mut reg = registry(&["d", "c"]);
        let output = h.orchestrator.run(&mut reg, &SilentProgress).await.unwrap();
        assert_eq!(
            output.sources[0].discovered_feed.as_deref(),
            Some("https://d.example.com/blog/index.rss")
        );
        assert!(output.sources[1].discovered_feed.is_none());
    }

    #[test]
    fn run_config_is_clamped() {
        let settings = Settings {
            workers: 0,
            retry_on_failure: 9,
            attempt_timeout_secs: 0,
            ..Settings::default()
        };
        let config = RunConfig::from(&settings);
        assert_eq!(config.workers, 1);
        assert_eq!(config.retry_passes, 3);
        assert_eq!(config.attempt_timeout, std::time::Duration::from_secs(1));
        assert_eq!(config.budget, std::time::Duration::from_secs(30 * 60));
    }
}
