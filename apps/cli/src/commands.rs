//! CLI command definitions, routing, and tracing setup.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use sourcewatch_core::{
    DedupStore, HealthPolicy, HealthStore, Orchestrator, RuleBasedAnalyzer, RunConfig,
    RunProgress, SourceRegistry,
};
use sourcewatch_crawler::HttpSourceFetcher;
use sourcewatch_discovery::{DiscoveryOptions, audit_sources};
use sourcewatch_shared::{
    FetchConfig, PipelineConfig, RunOutput, default_db_path, init_config, load_config,
    load_config_from, save_config_to, sources_file_path,
};
use sourcewatch_storage::Storage;

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// sourcewatch: collect new items from feeds and listing pages.
#[derive(Parser)]
#[command(
    name = "sourcewatch",
    version,
    about = "Collect new items from a registry of feeds and listing pages.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv, -vvv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Item analysis mode for `run`.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum AnalyzeMode {
    None,
    RuleBased,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Run the ingestion pipeline once.
    Run {
        /// Source registry (defaults to ~/.sourcewatch/sources.toml).
        #[arg(long, env = "SOURCEWATCH_SOURCES")]
        sources: Option<PathBuf>,

        /// Database path (defaults to ~/.sourcewatch/sourcewatch.db).
        #[arg(long, env = "SOURCEWATCH_DB")]
        db: Option<PathBuf>,

        /// Write the run output JSON here (stdout when omitted).
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Override the worker pool size.
        #[arg(long)]
        workers: Option<usize>,

        /// Annotate new items.
        #[arg(long, value_enum, default_value = "none")]
        analyze: AnalyzeMode,

        /// Write feeds discovered during the run back into the registry.
        #[arg(long)]
        update_sources: bool,
    },

    /// Check every source for a usable RSS/Atom feed.
    Audit {
        /// Source registry (defaults to ~/.sourcewatch/sources.toml).
        #[arg(long, env = "SOURCEWATCH_SOURCES")]
        sources: Option<PathBuf>,

        /// Write the audit report JSON here (stdout when omitted).
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Show persisted source health and recent runs.
    Health {
        /// Database path (defaults to ~/.sourcewatch/sourcewatch.db).
        #[arg(long, env = "SOURCEWATCH_DB")]
        db: Option<PathBuf>,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Write a starter registry.
    Init {
        /// Target path (defaults to ~/.sourcewatch/sources.toml).
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Show resolved configuration.
    Show {
        /// Source registry (defaults to ~/.sourcewatch/sources.toml).
        #[arg(long, env = "SOURCEWATCH_SOURCES")]
        sources: Option<PathBuf>,
    },
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "sourcewatch=info",
        1 => "sourcewatch=debug",
        _ => "sourcewatch=trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            sources,
            db,
            out,
            workers,
            analyze,
            update_sources,
        } => {
            let opts = RunOptions {
                workers,
                analyze,
                update_sources,
            };
            cmd_run(sources.as_deref(), db.as_deref(), out.as_deref(), opts).await
        }
        Command::Audit { sources, out } => cmd_audit(sources.as_deref(), out.as_deref()).await,
        Command::Health { db } => cmd_health(db.as_deref()).await,
        Command::Config { action } => match action {
            ConfigAction::Init { path } => cmd_config_init(path.as_deref()).await,
            ConfigAction::Show { sources } => cmd_config_show(sources.as_deref()).await,
        },
    }
}

fn load_registry_config(sources: Option<&Path>) -> Result<PipelineConfig> {
    let config = match sources {
        Some(path) => load_config_from(path)?,
        None => load_config()?,
    };
    Ok(config)
}

fn resolve_db(db: Option<&Path>) -> Result<PathBuf> {
    match db {
        Some(p) => Ok(p.to_path_buf()),
        None => Ok(default_db_path()?),
    }
}

/// Write pretty JSON to `out`, or to stdout.
fn emit_json<T: serde::Serialize + ?Sized>(value: &T, out: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    match out {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, json)?;
        }
        None => println!("{json}"),
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Command handlers
// ---------------------------------------------------------------------------

/// Flags of `run` that shape the run itself.
struct RunOptions {
    workers: Option<usize>,
    analyze: AnalyzeMode,
    update_sources: bool,
}

async fn cmd_run(
    sources: Option<&Path>,
    db: Option<&Path>,
    out: Option<&Path>,
    opts: RunOptions,
) -> Result<()> {
    let file_config = load_registry_config(sources)?;
    let mut config = file_config.clone();
    if let Some(workers) = opts.workers {
        config.settings.workers = workers;
    }

    let mut registry = SourceRegistry::new(&config)?;
    let db_path = resolve_db(db)?;
    let storage = Arc::new(Storage::open(&db_path).await?);
    let fetcher = Arc::new(HttpSourceFetcher::new(FetchConfig::from(&config.settings))?);

    let mut orchestrator = Orchestrator::new(
        fetcher,
        storage.clone() as Arc<dyn DedupStore>,
        storage.clone() as Arc<dyn HealthStore>,
        RunConfig::from(&config.settings),
        HealthPolicy::from(&config.settings),
    );
    if matches!(opts.analyze, AnalyzeMode::RuleBased) {
        orchestrator = orchestrator.with_analyzer(Arc::new(RuleBasedAnalyzer));
    }

    info!(
        sources = registry.len(),
        db = %db_path.display(),
        "starting ingestion run"
    );

    let reporter = CliProgress::new();
    let output = orchestrator.run(&mut registry, &reporter).await?;

    emit_json(&output, out)?;
    print_run_summary(&output, out);

    if let Err(e) = journal_run(&storage, &output).await {
        warn!(run_id = %output.run_id, error = %e, "failed to journal run");
    }

    if opts.update_sources {
        let path = match sources {
            Some(p) => p.to_path_buf(),
            None => sources_file_path()?,
        };
        let updated = persist_discovered_feeds(file_config, &output, &path)?;
        if updated > 0 {
            info!(updated, path = %path.display(), "recorded discovered feeds");
        }
    }

    match &output.critical {
        Some(critical) => Err(eyre!("{critical}")),
        None => Ok(()),
    }
}

async fn journal_run(storage: &Storage, output: &RunOutput) -> Result<()> {
    let run_id = output.run_id.to_string();
    storage.insert_run(&run_id, output.started_at).await?;
    storage
        .finish_run(&run_id, output.generated_at, &output.summary, output.is_critical())
        .await?;
    Ok(())
}

/// Copy discovered feed URLs into the registry file. Returns how many entries changed.
fn persist_discovered_feeds(
    mut config: PipelineConfig,
    output: &RunOutput,
    path: &Path,
) -> Result<usize> {
    let mut updated = 0;
    for report in &output.sources {
        let Some(feed_url) = &report.discovered_feed else {
            continue;
        };
        if config.record_feed_url(&report.source_id, feed_url) {
            info!(source = %report.source_id, %feed_url, "updating feed url");
            updated += 1;
        }
    }
    if updated > 0 {
        save_config_to(path, &config)?;
    }
    Ok(updated)
}

fn print_run_summary(output: &RunOutput, out: Option<&Path>) {
    let s = &output.summary;
    eprintln!();
    eprintln!("  Run complete");
    eprintln!("  ID:         {}", output.run_id);
    eprintln!("  Checked:    {}", s.sources_checked);
    eprintln!("  Successful: {}", s.sources_successful);
    eprintln!("  With items: {}", s.sources_with_items);
    eprintln!("  Skipped:    {} (cooldown)", s.sources_skipped_cooldown);
    eprintln!(
        "  Retried:    {} ({} recovered)",
        s.retry_attempted_sources, s.retry_recovered_sources
    );
    eprintln!("  Fetched:    {}", s.items_fetched_count);
    eprintln!("  New items:  {}", s.new_items_count);
    if !output.store_errors.is_empty() {
        eprintln!("  Store errors:");
        for error in &output.store_errors {
            eprintln!("    {error}");
        }
    }
    if let Some(path) = out {
        eprintln!("  Output:     {}", path.display());
    }
    eprintln!(
        "  Time:       {:.1}s",
        (output.generated_at - output.started_at).num_milliseconds() as f64 / 1000.0
    );
    eprintln!();
}

async fn cmd_audit(sources: Option<&Path>, out: Option<&Path>) -> Result<()> {
    let config = load_registry_config(sources)?;
    let registry = SourceRegistry::new(&config)?;
    let opts = DiscoveryOptions {
        timeout_secs: config.settings.fetch_timeout_secs.clamp(1, 300),
        probe_limit: config.settings.feed_probe_limit,
    };

    info!(sources = registry.len(), probe_limit = opts.probe_limit, "auditing feeds");

    let spinner = CliProgress::new();
    spinner.phase("Checking feeds");
    let report = audit_sources(registry.sources(), &opts).await?;
    spinner.finish();

    emit_json(&report, out)?;

    eprintln!();
    for audit in &report.sources {
        match &audit.feed_url {
            Some(url) => eprintln!("  ✓ {:<24} {url}", audit.source_id),
            None => eprintln!(
                "  ✗ {:<24} no feed ({} candidates)",
                audit.source_id,
                audit.probes.len()
            ),
        }
    }
    eprintln!();
    eprintln!("  Confirmed: {}/{}", report.confirmed, report.total);
    eprintln!();
    Ok(())
}

async fn cmd_health(db: Option<&Path>) -> Result<()> {
    let db_path = resolve_db(db)?;
    let storage = Storage::open_readonly(&db_path).await?;

    let records = storage.load_health().await?;
    let mut ids: Vec<&String> = records.keys().collect();
    ids.sort();

    if ids.is_empty() {
        println!("No health records yet.");
    } else {
        println!(
            "{:<24} {:<10} {:>8}  {:<25}  {}",
            "SOURCE", "LEVEL", "FAILURES", "COOLDOWN UNTIL", "LAST ERROR"
        );
        for id in ids {
            let record = &records[id];
            println!(
                "{:<24} {:<10} {:>8}  {:<25}  {}",
                id,
                record.level.as_str(),
                record.consecutive_failures,
                record
                    .cooldown_until
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| "-".into()),
                record.last_error.as_deref().unwrap_or("-"),
            );
        }
    }

    let runs = storage.recent_runs(5).await?;
    if !runs.is_empty() {
        println!();
        println!("Recent runs:");
        for run in runs {
            let new_items = run
                .summary
                .as_ref()
                .map(|s| s.new_items_count.to_string())
                .unwrap_or_else(|| "?".into());
            println!(
                "  {}  {}  new={new_items}{}",
                run.started_at.to_rfc3339(),
                run.id,
                if run.critical { "  CRITICAL" } else { "" }
            );
        }
    }
    println!();
    println!("Items stored: {}", storage.count_items(None).await?);
    Ok(())
}

async fn cmd_config_init(path: Option<&Path>) -> Result<()> {
    let path = init_config(path)?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

async fn cmd_config_show(sources: Option<&Path>) -> Result<()> {
    let path = match sources {
        Some(p) => p.to_path_buf(),
        None => sources_file_path()?,
    };
    let config = load_registry_config(sources)?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("# {}", path.display());
    println!("{toml_str}");
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::with_template("{spinner:.cyan} {msg}") {
            spinner.set_style(
                style.tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
            );
        }
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }

    fn finish(&self) {
        self.spinner.finish_and_clear();
    }
}

impl RunProgress for CliProgress {
    fn phase(&self, name: &str) {
        self.spinner.set_message(name.to_string());
    }

    fn attempt_finished(&self, source_id: &str, ok: bool, done: usize, total: usize) {
        let mark = if ok { "ok" } else { "failed" };
        self.spinner
            .set_message(format!("Fetching [{done}/{total}] {source_id} {mark}"));
    }

    fn done(&self, _output: &RunOutput) {
        self.finish();
    }
}
