//! libSQL storage layer (local file mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding the set of items
//! already emitted (the dedup memory), per-source health records, and the run
//! journal.
//!
//! **Access rules:**
//! - `sourcewatch run`: read-write via [`Storage::open`]
//! - `sourcewatch health`: read-only via [`Storage::open_readonly`]

mod migrations;

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, Row, Value, params};
use sourcewatch_shared::{
    HealthLevel, HealthRecord, Item, Result, RunSummary, SourceStatus, SourcewatchError,
};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// One row of the run journal.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: Option<RunSummary>,
    pub critical: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SourcewatchError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| SourcewatchError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| SourcewatchError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(SourcewatchError::Storage(format!(
                "database not found: {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| SourcewatchError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| SourcewatchError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await?;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        SourcewatchError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> Result<u32> {
        let Ok(mut rows) = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await
        else {
            return Ok(0); // Table doesn't exist yet
        };

        let row = rows
            .next()
            .await
            .map_err(|e| SourcewatchError::Storage(e.to_string()))?;
        match row.map(|r| r.get_value(0)).transpose() {
            Ok(None) | Ok(Some(Value::Null)) => Ok(0),
            Ok(Some(Value::Integer(v))) => u32::try_from(v)
                .map_err(|_| SourcewatchError::Storage(format!("invalid schema version {v}"))),
            Ok(Some(other)) => Err(SourcewatchError::Storage(format!(
                "invalid schema version {other:?}"
            ))),
            Err(e) => Err(SourcewatchError::Storage(e.to_string())),
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(SourcewatchError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Item operations
    // -----------------------------------------------------------------------

    /// Whether an item with this uid has ever been recorded.
    pub async fn item_exists(&self, uid: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query("SELECT 1 FROM items WHERE uid = ?1 LIMIT 1", params![uid])
            .await
            .map_err(|e| SourcewatchError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(_)) => Ok(true),
            Ok(None) => Ok(false),
            Err(e) => Err(SourcewatchError::Storage(e.to_string())),
        }
    }

    /// Record an item. Returns `false` when the uid was already present, in
    /// which case the stored row is left untouched.
    pub async fn insert_item(&self, item: &Item) -> Result<bool> {
        self.check_writable()?;
        let changed = self
            .conn
            .execute(
                "INSERT OR IGNORE INTO items (uid, source_id, url, title, published_at, collected_at, raw_summary)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    item.uid.as_str(),
                    item.source_id.as_str(),
                    item.url.as_str(),
                    item.title.as_str(),
                    item.published_at.map(|t| t.to_rfc3339()),
                    item.collected_at.to_rfc3339(),
                    item.raw_summary.as_str(),
                ],
            )
            .await
            .map_err(|e| SourcewatchError::Storage(e.to_string()))?;
        Ok(changed > 0)
    }

    /// Get a stored item by uid.
    pub async fn get_item(&self, uid: &str) -> Result<Option<Item>> {
        let mut rows = self
            .conn
            .query(
                "SELECT uid, source_id, url, title, published_at, collected_at, raw_summary
                 FROM items WHERE uid = ?1",
                params![uid],
            )
            .await
            .map_err(|e| SourcewatchError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_item(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(SourcewatchError::Storage(e.to_string())),
        }
    }

    /// Number of items recorded, optionally for a single source.
    pub async fn count_items(&self, source_id: Option<&str>) -> Result<u64> {
        let mut rows = match source_id {
            Some(id) => {
                self.conn
                    .query("SELECT COUNT(*) FROM items WHERE source_id = ?1", params![id])
                    .await
            }
            None => self.conn.query("SELECT COUNT(*) FROM items", params![]).await,
        }
        .map_err(|e| SourcewatchError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => row
                .get::<i64>(0)
                .map(|n| n.max(0) as u64)
                .map_err(|e| SourcewatchError::Storage(e.to_string())),
            Ok(None) => Ok(0),
            Err(e) => Err(SourcewatchError::Storage(e.to_string())),
        }
    }

    // -----------------------------------------------------------------------
    // Health operations
    // -----------------------------------------------------------------------

    /// Load every persisted health record, keyed by source id.
    pub async fn load_health(&self) -> Result<HashMap<String, HealthRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT source_id, level, consecutive_failures, cooldown_until, last_status,
                        last_error, last_checked_at, last_success_at
                 FROM source_health ORDER BY source_id",
                params![],
            )
            .await
            .map_err(|e| SourcewatchError::Storage(e.to_string()))?;

        let mut records = HashMap::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| SourcewatchError::Storage(e.to_string()))?
        {
            let source_id = row
                .get::<String>(0)
                .map_err(|e| SourcewatchError::Storage(e.to_string()))?;
            records.insert(source_id, row_to_health(&row)?);
        }
        Ok(records)
    }

    /// Get the health record of one source.
    pub async fn get_health(&self, source_id: &str) -> Result<Option<HealthRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT source_id, level, consecutive_failures, cooldown_until, last_status,
                        last_error, last_checked_at, last_success_at
                 FROM source_health WHERE source_id = ?1",
                params![source_id],
            )
            .await
            .map_err(|e| SourcewatchError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_health(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(SourcewatchError::Storage(e.to_string())),
        }
    }

    /// Insert or replace the health record of a source.
    pub async fn upsert_health(&self, source_id: &str, record: &HealthRecord) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO source_health (source_id, level, consecutive_failures, cooldown_until,
                    last_status, last_error, last_checked_at, last_success_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(source_id) DO UPDATE SET
                   level = excluded.level,
                   consecutive_failures = excluded.consecutive_failures,
                   cooldown_until = excluded.cooldown_until,
                   last_status = excluded.last_status,
                   last_error = excluded.last_error,
                   last_checked_at = excluded.last_checked_at,
                   last_success_at = excluded.last_success_at,
                   updated_at = excluded.updated_at",
                params![
                    source_id,
                    record.level.as_str(),
                    i64::from(record.consecutive_failures),
                    record.cooldown_until.map(|t| t.to_rfc3339()),
                    record.last_status.map(|s| s.as_str()),
                    record.last_error.as_deref(),
                    record.last_checked_at.map(|t| t.to_rfc3339()),
                    record.last_success_at.map(|t| t.to_rfc3339()),
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| SourcewatchError::Storage(e.to_string()))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run journal
    // -----------------------------------------------------------------------

    /// Record the start of a run.
    pub async fn insert_run(&self, run_id: &str, started_at: DateTime<Utc>) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute(
                "INSERT INTO runs (id, started_at) VALUES (?1, ?2)",
                params![run_id, started_at.to_rfc3339()],
            )
            .await
            .map_err(|e| SourcewatchError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Mark a run finished with its summary and critical flag.
    pub async fn finish_run(
        &self,
        run_id: &str,
        finished_at: DateTime<Utc>,
        summary: &RunSummary,
        critical: bool,
    ) -> Result<()> {
        self.check_writable()?;
        let summary_json = serde_json::to_string(summary)
            .map_err(|e| SourcewatchError::Storage(format!("summary encoding failed: {e}")))?;
        self.conn
            .execute(
                "UPDATE runs SET finished_at = ?1, summary_json = ?2, critical = ?3 WHERE id = ?4",
                params![
                    finished_at.to_rfc3339(),
                    summary_json,
                    i64::from(critical),
                    run_id
                ],
            )
            .await
            .map_err(|e| SourcewatchError::Storage(e.to_string()))?;
        Ok(())
    }

    /// The most recent runs, newest first.
    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, finished_at, summary_json, critical
                 FROM runs ORDER BY started_at DESC LIMIT ?1",
                params![i64::from(limit)],
            )
            .await
            .map_err(|e| SourcewatchError::Storage(e.to_string()))?;

        let mut runs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| SourcewatchError::Storage(e.to_string()))?
        {
            let summary = row
                .get::<String>(3)
                .ok()
                .and_then(|json| serde_json::from_str::<RunSummary>(&json).ok());
            runs.push(RunRecord {
                id: row
                    .get::<String>(0)
                    .map_err(|e| SourcewatchError::Storage(e.to_string()))?,
                started_at: parse_timestamp(
                    &row.get::<String>(1)
                        .map_err(|e| SourcewatchError::Storage(e.to_string()))?,
                )?,
                finished_at: optional_timestamp(&row, 2)?,
                summary,
                critical: row
                    .get::<i64>(4)
                    .map_err(|e| SourcewatchError::Storage(e.to_string()))?
                    != 0,
            });
        }
        Ok(runs)
    }
}

// ---------------------------------------------------------------------------
// Row helpers
// ---------------------------------------------------------------------------

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| SourcewatchError::Storage(format!("bad timestamp '{raw}': {e}")))
}

/// NULL columns read as `None`.
fn optional_timestamp(row: &Row, idx: i32) -> Result<Option<DateTime<Utc>>> {
    row.get::<String>(idx)
        .ok()
        .map(|raw| parse_timestamp(&raw))
        .transpose()
}

fn row_to_item(row: &Row) -> Result<Item> {
    Ok(Item {
        uid: row
            .get::<String>(0)
            .map_err(|e| SourcewatchError::Storage(e.to_string()))?,
        source_id: row
            .get::<String>(1)
            .map_err(|e| SourcewatchError::Storage(e.to_string()))?,
        url: row
            .get::<String>(2)
            .map_err(|e| SourcewatchError::Storage(e.to_string()))?,
        title: row
            .get::<String>(3)
            .map_err(|e| SourcewatchError::Storage(e.to_string()))?,
        published_at: optional_timestamp(row, 4)?,
        collected_at: parse_timestamp(
            &row.get::<String>(5)
                .map_err(|e| SourcewatchError::Storage(e.to_string()))?,
        )?,
        raw_summary: row
            .get::<String>(6)
            .map_err(|e| SourcewatchError::Storage(e.to_string()))?,
    })
}

/// Columns: source_id, level, consecutive_failures, cooldown_until,
/// last_status, last_error, last_checked_at, last_success_at.
fn row_to_health(row: &Row) -> Result<HealthRecord> {
    let level = row
        .get::<String>(1)
        .map_err(|e| SourcewatchError::Storage(e.to_string()))?
        .parse::<HealthLevel>()
        .map_err(SourcewatchError::Storage)?;
    let consecutive_failures = row
        .get::<i64>(2)
        .map_err(|e| SourcewatchError::Storage(e.to_string()))?;
    let last_status = row
        .get::<String>(4)
        .ok()
        .map(|s| s.parse::<SourceStatus>())
        .transpose()
        .map_err(SourcewatchError::Storage)?;

    Ok(HealthRecord {
        level,
        consecutive_failures: u32::try_from(consecutive_failures).map_err(|_| {
            SourcewatchError::Storage(format!(
                "invalid consecutive_failures {consecutive_failures}"
            ))
        })?,
        cooldown_until: optional_timestamp(row, 3)?,
        last_status,
        last_error: row.get::<String>(5).ok(),
        last_checked_at: optional_timestamp(row, 6)?,
        last_success_at: optional_timestamp(row, 7)?,
    })
}
