//! Durable JSONL output for store batches.
//!
//! Epistemic foundation:
//! - K_i: A batch is staged in a pending file, then appended and synced in one step
//! - K_i: Invalid stores are counted failed and never written
//! - B_i: The process may die between staging and append
//! - I^B: A leftover pending file belongs to an uncheckpointed batch → discard, resume redoes it

use crate::batch::{BatchOutcome, BatchSink};
use crate::models::{SinkError, Store};
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, warn};
use uuid::Uuid;

/// Appends valid stores to a JSONL file, one batch at a time.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    dir: PathBuf,
    written: u64,
    rejected: u64,
}

impl JsonlSink {
    /// Open (or create) the output and discard stale pending files.
    pub fn open(path: &Path) -> Result<Self, SinkError> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|e| SinkError::io("creating output directory", e))?;

        let sink = Self {
            path: path.to_path_buf(),
            dir,
            written: 0,
            rejected: 0,
        };
        let discarded = sink.discard_pending()?;
        if discarded > 0 {
            warn!(discarded, "Discarded pending batches from an interrupted run");
        }
        Ok(sink)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stores appended by this sink.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Stores rejected as invalid by this sink.
    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "output".to_string())
    }

    fn pending_pattern(&self) -> String {
        let dir = glob::Pattern::escape(&self.dir.to_string_lossy());
        let name = glob::Pattern::escape(&self.file_name());
        format!("{dir}/.{name}.*.pending")
    }

    /// Remove pending files left behind by a crash. Returns how many.
    pub fn discard_pending(&self) -> Result<usize, SinkError> {
        let paths = glob::glob(&self.pending_pattern())
            .map_err(|e| SinkError::Fatal(format!("invalid pending pattern: {e}")))?;

        let mut discarded = 0;
        for path in paths.filter_map(|r| r.ok()) {
            debug!(path = %path.display(), "Removing stale pending batch");
            fs::remove_file(&path).map_err(|e| SinkError::io("removing pending batch", e))?;
            discarded += 1;
        }
        Ok(discarded)
    }

    /// Validate, stage and append one batch.
    pub fn write_stores(&mut self, stores: &[Store]) -> Result<BatchOutcome, SinkError> {
        let mut lines = Vec::with_capacity(stores.len());
        let mut failed = 0;

        for store in stores {
            match store.validate() {
                Ok(()) => lines.push(serde_json::to_string(store)?),
                Err(e) => {
                    warn!(key = %e.key, reason = %e.reason, "Rejecting invalid store");
                    failed += 1;
                }
            }
        }

        if !lines.is_empty() {
            self.append(&lines)?;
        }

        self.written += lines.len() as u64;
        self.rejected += failed;
        Ok(BatchOutcome::new(lines.len() as u64, failed))
    }

    fn append(&self, lines: &[String]) -> Result<(), SinkError> {
        let pending = self
            .dir
            .join(format!(".{}.{}.pending", self.file_name(), Uuid::new_v4()));

        let result = stage(&pending, lines).and_then(|staged| self.commit(&staged));
        if let Err(e) = fs::remove_file(&pending)
            && e.kind() != ErrorKind::NotFound
        {
            warn!(path = %pending.display(), error = %e, "Could not remove pending batch");
        }
        result?;

        debug!(lines = lines.len(), path = %self.path.display(), "Batch appended");
        Ok(())
    }

    /// Append staged bytes and sync. On failure the output is cut back to its
    /// previous length, so a retried batch never lands after a torn one.
    fn commit(&self, staged: &[u8]) -> Result<(), SinkError> {
        let mut output = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| SinkError::io("opening output", e))?;
        let len = output
            .metadata()
            .map_err(|e| SinkError::io("reading output length", e))?
            .len();

        let written = output
            .write_all(staged)
            .map_err(|e| SinkError::io("appending batch", e))
            .and_then(|()| {
                output
                    .sync_all()
                    .map_err(|e| SinkError::io("syncing output", e))
            });
        if written.is_err() {
            rollback(&output, len);
        }
        written
    }
}

/// Write the batch to its pending file and read it back.
fn stage(pending: &Path, lines: &[String]) -> Result<Vec<u8>, SinkError> {
    {
        let file = File::create(pending).map_err(|e| SinkError::io("creating pending batch", e))?;
        let mut writer = BufWriter::new(file);
        for line in lines {
            writeln!(writer, "{line}").map_err(|e| SinkError::io("writing pending batch", e))?;
        }
        writer
            .flush()
            .map_err(|e| SinkError::io("flushing pending batch", e))?;
    }
    fs::read(pending).map_err(|e| SinkError::io("reading pending batch", e))
}

fn rollback(output: &File, len: u64) {
    match output.set_len(len).and_then(|()| output.sync_all()) {
        Ok(()) => debug!(len, "Output rolled back after failed append"),
        Err(e) => error!(len, error = %e, "Could not roll back output after failed append"),
    }
}

impl BatchSink<Store> for JsonlSink {
    async fn write_batch(&mut self, batch: &[Store]) -> Result<BatchOutcome, SinkError> {
        self.write_stores(batch)
    }
}
