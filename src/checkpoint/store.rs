//! SQLite-backed checkpoint store.
//!
//! Epistemic foundation:
//! - K_i: One row per run; every write is a single statement, so counters and
//!   `custom_state` can never be observed half-updated
//! - K_i: `synchronous = FULL` → a write is durable once the call returns
//! - B_i: Database file may be unavailable → `CheckpointError::Storage`
//! - I^B: Concurrent writers on the same run_id are unsupported

use super::{Checkpoint, ResumeDescriptor, ResumeOutcome, Run, RunStatus};
use crate::models::CheckpointError;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Row, params};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

type Result<T> = std::result::Result<T, CheckpointError>;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS runs (
    run_id              TEXT PRIMARY KEY,
    source_id           TEXT NOT NULL,
    started_at          TEXT NOT NULL,
    completed_at        TEXT,
    last_checkpoint_at  TEXT,
    current_batch       INTEGER NOT NULL DEFAULT -1,
    total_items         INTEGER,
    batch_size          INTEGER NOT NULL,
    items_processed     INTEGER NOT NULL DEFAULT 0,
    items_failed        INTEGER NOT NULL DEFAULT 0,
    status              TEXT NOT NULL DEFAULT 'running',
    error_message       TEXT,
    custom_state        TEXT,
    created_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_source_status ON runs (source_id, status);
CREATE INDEX IF NOT EXISTS idx_started_at ON runs (started_at DESC);
";

const RUN_COLUMNS: &str = "run_id, source_id, started_at, completed_at, last_checkpoint_at, \
     current_batch, total_items, batch_size, items_processed, items_failed, status, \
     error_message, custom_state";

/// Durable record of run progress.
pub struct CheckpointStore {
    conn: Connection,
    path: Option<PathBuf>,
}

impl CheckpointStore {
    /// Open (or create) the checkpoint database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| CheckpointError::io("creating checkpoint dir", e))?;
        }

        let conn = Connection::open(path)?;
        let store = Self {
            conn,
            path: Some(path.to_path_buf()),
        };
        store.init()?;
        info!(path = %path.display(), "Opened checkpoint store");
        Ok(store)
    }

    /// Open a throwaway in-memory store.
    pub fn in_memory() -> Result<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
            path: None,
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        // journal_mode answers with a row, so it cannot go through execute_batch
        let mode: String = self
            .conn
            .query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        debug!(journal_mode = %mode, "Checkpoint journal mode");
        self.conn.execute_batch("PRAGMA synchronous = FULL;")?;
        self.conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Path of the backing database, if file-backed.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Insert a new running run and return its id (`{source_id}_{timestamp}`).
    pub fn create_run(
        &self,
        source_id: &str,
        total_items: Option<u64>,
        batch_size: usize,
    ) -> Result<String> {
        let mut started_at = Utc::now();

        // Ids carry microseconds; a clash only happens for runs created back to back.
        for _ in 0..16 {
            let run_id = format!("{source_id}_{}", started_at.format("%Y%m%d_%H%M%S_%6f"));
            match self.insert_run(&run_id, source_id, started_at, total_items, batch_size) {
                Ok(()) => {
                    info!(run_id = %run_id, source = source_id, total_items, batch_size, "Created run");
                    return Ok(run_id);
                }
                Err(CheckpointError::InvalidState { .. }) => {
                    started_at += ChronoDuration::microseconds(1);
                }
                Err(e) => return Err(e),
            }
        }

        Err(CheckpointError::invalid_state(
            source_id,
            "could not allocate a unique run id",
        ))
    }

    /// Insert a run under an explicit id. A duplicate id is `InvalidState`.
    pub fn create_run_with_id(
        &self,
        run_id: &str,
        source_id: &str,
        total_items: Option<u64>,
        batch_size: usize,
    ) -> Result<()> {
        self.insert_run(run_id, source_id, Utc::now(), total_items, batch_size)
    }

    fn insert_run(
        &self,
        run_id: &str,
        source_id: &str,
        started_at: DateTime<Utc>,
        total_items: Option<u64>,
        batch_size: usize,
    ) -> Result<()> {
        let inserted = self.conn.execute(
            "INSERT INTO runs (run_id, source_id, started_at, total_items, batch_size, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'running', ?6)",
            params![
                run_id,
                source_id,
                timestamp(started_at),
                total_items.map(to_sql_count),
                batch_size as i64,
                timestamp(Utc::now()),
            ],
        );

        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(CheckpointError::invalid_state(run_id, "run already exists"))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Overwrite the run's progress fields and `custom_state` in one statement.
    ///
    /// Re-saving the current batch index is an idempotent overwrite; skipping an
    /// index, decreasing a counter or writing to a terminal run is `InvalidState`.
    pub fn save_checkpoint(&self, run_id: &str, checkpoint: &Checkpoint) -> Result<()> {
        let custom_state = checkpoint
            .custom_state
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let updated = self.conn.execute(
            "UPDATE runs SET
                 current_batch = ?2,
                 items_processed = ?3,
                 items_failed = ?4,
                 total_items = MAX(COALESCE(?5, total_items), ?3 + ?4),
                 custom_state = ?6,
                 last_checkpoint_at = ?7
             WHERE run_id = ?1
               AND status = 'running'
               AND ?2 IN (current_batch, current_batch + 1)
               AND ?3 >= items_processed
               AND ?4 >= items_failed",
            params![
                run_id,
                checkpoint.batch_index,
                to_sql_count(checkpoint.items_processed),
                to_sql_count(checkpoint.items_failed),
                checkpoint.total_items.map(to_sql_count),
                custom_state,
                timestamp(Utc::now()),
            ],
        )?;

        if updated == 0 {
            let run = self.get_run(run_id)?;
            let reason = if run.status.is_terminal() {
                format!("run is {}", run.status)
            } else if checkpoint.batch_index != run.current_batch_index
                && checkpoint.batch_index != run.current_batch_index + 1
            {
                format!(
                    "batch index {} does not follow {}",
                    checkpoint.batch_index, run.current_batch_index
                )
            } else {
                "counters may not decrease".to_string()
            };
            return Err(CheckpointError::invalid_state(run_id, reason));
        }

        debug!(
            run_id,
            batch = checkpoint.batch_index,
            processed = checkpoint.items_processed,
            failed = checkpoint.items_failed,
            "Checkpoint saved"
        );
        Ok(())
    }

    /// Mark a running run completed. `total_items` becomes the exact count.
    pub fn complete_run(&self, run_id: &str, total_processed: u64, total_failed: u64) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE runs SET
                 status = 'completed',
                 completed_at = ?2,
                 items_processed = ?3,
                 items_failed = ?4,
                 total_items = ?3 + ?4
             WHERE run_id = ?1 AND status = 'running'",
            params![
                run_id,
                timestamp(Utc::now()),
                to_sql_count(total_processed),
                to_sql_count(total_failed),
            ],
        )?;

        if updated == 0 {
            return Err(self.not_running(run_id)?);
        }

        info!(run_id, processed = total_processed, failed = total_failed, "Run completed");
        Ok(())
    }

    /// Mark a running run failed with the counters of its last good checkpoint.
    pub fn fail_run(
        &self,
        run_id: &str,
        message: &str,
        items_processed: u64,
        items_failed: u64,
    ) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE runs SET
                 status = 'failed',
                 error_message = ?2,
                 items_processed = ?3,
                 items_failed = ?4
             WHERE run_id = ?1 AND status = 'running'",
            params![
                run_id,
                message,
                to_sql_count(items_processed),
                to_sql_count(items_failed),
            ],
        )?;

        if updated == 0 {
            return Err(self.not_running(run_id)?);
        }

        warn!(run_id, error = message, "Run failed");
        Ok(())
    }

    /// Move a failed run back to running so it can be resumed.
    pub fn reopen_run(&self, run_id: &str) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE runs SET status = 'running', error_message = NULL
             WHERE run_id = ?1 AND status = 'failed'",
            params![run_id],
        )?;

        if updated == 0 {
            let run = self.get_run(run_id)?;
            if run.status != RunStatus::Running {
                return Err(CheckpointError::invalid_state(
                    run_id,
                    format!("cannot reopen a {} run", run.status),
                ));
            }
        }
        Ok(())
    }

    fn not_running(&self, run_id: &str) -> Result<CheckpointError> {
        let run = self.get_run(run_id)?;
        Ok(CheckpointError::invalid_state(
            run_id,
            format!("run is already {}", run.status),
        ))
    }

    /// Fetch a run by id.
    pub fn get_run(&self, run_id: &str) -> Result<Run> {
        self.find_run(run_id)?
            .ok_or_else(|| CheckpointError::NotFound(run_id.to_string()))
    }

    /// Fetch a run by id, `None` if absent.
    pub fn find_run(&self, run_id: &str) -> Result<Option<Run>> {
        let sql = format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1");
        Ok(self
            .conn
            .query_row(&sql, params![run_id], row_to_run)
            .optional()?)
    }

    /// Checkpoint data needed to continue a run.
    pub fn resume_run(&self, run_id: &str) -> Result<ResumeOutcome> {
        let run = self.get_run(run_id)?;
        if run.status == RunStatus::Completed {
            return Ok(ResumeOutcome::AlreadyCompleted(run));
        }
        Ok(ResumeOutcome::Resumable(ResumeDescriptor::from(run)))
    }

    /// All runs, most recent first, optionally restricted to one source.
    pub fn list_runs(&self, source_id: Option<&str>) -> Result<Vec<Run>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE ?1 IS NULL OR source_id = ?1
             ORDER BY started_at DESC, rowid DESC"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let runs = stmt
            .query_map(params![source_id], row_to_run)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    /// Most recent run, optionally restricted to one source.
    pub fn latest_run(&self, source_id: Option<&str>) -> Result<Option<Run>> {
        let sql = format!(
            "SELECT {RUN_COLUMNS} FROM runs
             WHERE ?1 IS NULL OR source_id = ?1
             ORDER BY started_at DESC, rowid DESC
             LIMIT 1"
        );
        Ok(self
            .conn
            .query_row(&sql, params![source_id], row_to_run)
            .optional()?)
    }

    /// Delete completed runs beyond the newest `keep_recent` per source.
    ///
    /// Running and failed runs are never deleted.
    pub fn cleanup_old_runs(&self, keep_recent: usize) -> Result<usize> {
        let deleted = self.conn.execute(
            "DELETE FROM runs WHERE run_id IN (
                 SELECT run_id FROM (
                     SELECT run_id,
                            ROW_NUMBER() OVER (
                                PARTITION BY source_id
                                ORDER BY started_at DESC, rowid DESC
                            ) AS rn
                     FROM runs
                     WHERE status = 'completed'
                 )
                 WHERE rn > ?1
             )",
            params![keep_recent as i64],
        )?;

        if deleted > 0 {
            info!(deleted, keep_recent, "Cleaned up old runs");
        }
        Ok(deleted)
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn to_sql_count(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_timestamp(idx: usize, raw: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    raw.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn count(idx: usize, raw: i64) -> rusqlite::Result<u64> {
    u64::try_from(raw).map_err(|e| conversion_error(idx, e))
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<Run> {
    let started_at = parse_timestamp(2, Some(row.get(2)?))?
        .ok_or_else(|| rusqlite::Error::InvalidColumnType(2, "started_at".into(), Type::Null))?;

    let status: String = row.get(10)?;
    let status = status.parse::<RunStatus>().map_err(|e| {
        conversion_error(10, std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })?;

    let custom_state = row
        .get::<_, Option<String>>(12)?
        .map(|s| serde_json::from_str(&s).map_err(|e| conversion_error(12, e)))
        .transpose()?;

    Ok(Run {
        run_id: row.get(0)?,
        source_id: row.get(1)?,
        started_at,
        completed_at: parse_timestamp(3, row.get(3)?)?,
        last_checkpoint_at: parse_timestamp(4, row.get(4)?)?,
        current_batch_index: row.get(5)?,
        total_items: row
            .get::<_, Option<i64>>(6)?
            .map(|n| count(6, n))
            .transpose()?,
        batch_size: count(7, row.get(7)?)? as usize,
        items_processed: count(8, row.get(8)?)?,
        items_failed: count(9, row.get(9)?)?,
        status,
        error_message: row.get(11)?,
        custom_state,
    })
}
