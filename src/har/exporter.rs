//! Periodic flushing of recorded transactions to a JSONL file

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

use super::Recorder;
use crate::error::{Error, Result};

/// Drains a [`Recorder`] into an append-only log file, one JSON entry per
/// line.
pub struct Exporter {
    recorder: Arc<Recorder>,
    path: PathBuf,
    interval: Duration,
    skip_connect: bool,
    flushing: Mutex<()>,
}

impl Exporter {
    pub fn new(recorder: Arc<Recorder>, path: impl AsRef<Path>, interval: Duration) -> Self {
        Self {
            recorder,
            path: path.as_ref().to_path_buf(),
            interval,
            skip_connect: true,
            flushing: Mutex::new(()),
        }
    }

    /// Whether CONNECT entries are dropped instead of written
    pub fn with_skip_connect(mut self, skip: bool) -> Self {
        self.skip_connect = skip;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run one export cycle and return the number of lines written.
    ///
    /// If the file cannot be opened the taken batch is put back into the
    /// recorder and an error is returned.
    pub fn flush(&self) -> Result<usize> {
        let _guard = self.flushing.lock().unwrap_or_else(|e| e.into_inner());

        let mut batch = self.recorder.export_and_reset();
        if self.skip_connect {
            batch.retain(|e| !e.is_connect());
        }
        if batch.is_empty() {
            return Ok(0);
        }

        let file = match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        {
            Ok(f) => f,
            Err(e) => {
                let kept = batch.len();
                self.recorder.restore(batch);
                return Err(Error::export(format!(
                    "cannot open {} ({} entries kept in memory): {}",
                    self.path.display(),
                    kept,
                    e
                )));
            }
        };

        let mut writer = std::io::BufWriter::new(file);
        let mut written = 0;
        for entry in &batch {
            let line = match serde_json::to_string(entry) {
                Ok(l) => l,
                Err(e) => {
                    tracing::error!(id = %entry.id, error = %e, "Failed to serialize transaction entry");
                    continue;
                }
            };
            writeln!(writer, "{}", line)?;
            written += 1;
        }
        writer.flush()?;

        tracing::debug!(entries = written, path = %self.path.display(), "Flushed transaction log");
        Ok(written)
    }

    /// Flush every `interval` until `shutdown` flips (or its sender goes
    /// away), then flush one last time.
    ///
    /// Returns the first flush error; the caller is expected to stop the
    /// proxy.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let start = tokio::time::Instant::now() + self.interval;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush_blocking().await {
                        tracing::error!(error = %e, path = %self.path.display(), "Transaction log export failed, stopping exporter");
                        return Err(e);
                    }
                }
                _ = crate::shutdown::signalled(&mut shutdown) => {
                    tracing::debug!("Exporter shutting down, final flush");
                    return self.flush_blocking().await.map(|_| ()).map_err(|e| {
                        tracing::error!(error = %e, "Final transaction log export failed");
                        e
                    });
                }
            }
        }
    }

    /// Run one export cycle on the blocking pool. Used for the last cycle
    /// after [`Exporter::run`] has returned, including after it failed.
    pub async fn drain(self: &Arc<Self>) -> Result<usize> {
        self.flush_blocking().await
    }

    async fn flush_blocking(self: &Arc<Self>) -> Result<usize> {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.flush())
            .await
            .map_err(|e| Error::export(format!("export task failed: {}", e)))?
    }
}
