//! Settled-file detection.
//!
//! The instrument appends to its newest data file for minutes at a time. A file
//! is only announced once its size has stopped changing for the configured
//! quiet period, and only the newest file is ever under observation.

use crate::clock::ActivityClock;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Emitted exactly once per file whose size stayed constant for the quiet period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSettled {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub size: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct StabilityConfig {
    /// Pause between two size samples.
    pub stability_delay: Duration,
    /// Quiet period since the last size change before a file counts as settled.
    pub file_watch_threshold: Duration,
}

/// Size history of the file currently under observation.
#[derive(Debug, Clone)]
pub struct TrackedFile {
    path: PathBuf,
    created_at: DateTime<Utc>,
    last_observed_size: Option<u64>,
    last_size_change_at: Instant,
    settled: bool,
}

impl TrackedFile {
    pub fn new(path: PathBuf, created_at: DateTime<Utc>, started_at: Instant) -> Self {
        Self {
            path,
            created_at,
            last_observed_size: None,
            last_size_change_at: started_at,
            settled: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[cfg(test)]
    pub fn is_settled(&self) -> bool {
        self.settled
    }

    /// Feed one size sample taken at `at`. Returns true once the file is settled:
    /// the size matches the previous sample and at least `threshold` has passed
    /// since the size last changed.
    pub fn observe(&mut self, size: u64, at: Instant, threshold: Duration) -> bool {
        if self.settled {
            return true;
        }

        if self.last_observed_size != Some(size) {
            self.last_observed_size = Some(size);
            self.last_size_change_at = at;
            return false;
        }

        if at.saturating_duration_since(self.last_size_change_at) >= threshold {
            self.settled = true;
        }
        self.settled
    }
}

struct ActiveTrack {
    path: PathBuf,
    generation: u64,
    handle: JoinHandle<()>,
}

/// Samples the newest file until it settles, then reports it once.
///
/// Cloning yields another handle to the same detector.
#[derive(Clone)]
pub struct FileStabilityDetector {
    config: StabilityConfig,
    clock: ActivityClock,
    settled_tx: mpsc::UnboundedSender<FileSettled>,
    active: Arc<Mutex<Option<ActiveTrack>>>,
    generation: Arc<AtomicU64>,
    stopped: Arc<AtomicBool>,
}

impl FileStabilityDetector {
    pub fn new(
        config: StabilityConfig,
        clock: ActivityClock,
        settled_tx: mpsc::UnboundedSender<FileSettled>,
    ) -> Self {
        Self {
            config,
            clock,
            settled_tx,
            active: Arc::new(Mutex::new(None)),
            generation: Arc::new(AtomicU64::new(0)),
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Start observing `path`, abandoning any other file still being sampled.
    ///
    /// Re-tracking the file that is already under observation is a no-op.
    pub fn track(&self, path: PathBuf, created_at: DateTime<Utc>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }

        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());

        if let Some(current) = active.as_ref() {
            if current.path == path && !current.handle.is_finished() {
                tracing::debug!(path = %path.display(), "file already under observation");
                return;
            }
        }

        if let Some(previous) = active.take() {
            if !previous.handle.is_finished() {
                tracing::debug!(
                    abandoned = %previous.path.display(),
                    newer = %path.display(),
                    "newer file superseded unsettled file"
                );
            }
            previous.handle.abort();
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(path = %path.display(), %created_at, "tracking file until settled");

        let tracked = TrackedFile::new(path.clone(), created_at, Instant::now());
        let handle = tokio::spawn(sample_until_settled(
            tracked,
            generation,
            self.config,
            self.clock.clone(),
            self.settled_tx.clone(),
            Arc::clone(&self.active),
            Arc::clone(&self.stopped),
        ));

        *active = Some(ActiveTrack {
            path,
            generation,
            handle,
        });
    }

    /// Path currently under observation, if any.
    #[cfg(test)]
    pub fn tracked_path(&self) -> Option<PathBuf> {
        let active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        active
            .as_ref()
            .filter(|track| !track.handle.is_finished())
            .map(|track| track.path.clone())
    }

    /// Cancel any in-flight sampling. Idempotent; later `track` calls are ignored.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(track) = active.take() {
            track.handle.abort();
            tracing::debug!(path = %track.path.display(), "stability sampling cancelled");
        }
    }
}

async fn sample_until_settled(
    mut tracked: TrackedFile,
    generation: u64,
    config: StabilityConfig,
    clock: ActivityClock,
    settled_tx: mpsc::UnboundedSender<FileSettled>,
    active: Arc<Mutex<Option<ActiveTrack>>>,
    stopped: Arc<AtomicBool>,
) {
    loop {
        tokio::time::sleep(config.stability_delay).await;

        let size = match tokio::fs::metadata(tracked.path()).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    path = %tracked.path().display(),
                    "failed to stat tracked file, giving up on it"
                );
                release(&active, generation);
                return;
            }
        };

        // An in-progress write counts as activity even before the file settles.
        clock.record_activity(Utc::now());

        if tracked.observe(size, Instant::now(), config.file_watch_threshold) {
            break;
        }
        tracing::trace!(path = %tracked.path().display(), size, "file still changing");
    }

    if stopped.load(Ordering::SeqCst) {
        return;
    }

    let size = tracked.last_observed_size.unwrap_or(0);
    tracing::info!(
        path = %tracked.path().display(),
        size,
        created_at = %tracked.created_at(),
        "file settled"
    );
    let _ = settled_tx.send(FileSettled {
        path: tracked.path.clone(),
        created_at: tracked.created_at,
        size,
    });
    release(&active, generation);
}

/// Drop the active slot if it still belongs to this sampler.
fn release(active: &Mutex<Option<ActiveTrack>>, generation: u64) {
    let mut active = active.lock().unwrap_or_else(|p| p.into_inner());
    if active
        .as_ref()
        .is_some_and(|track| track.generation == generation)
    {
        *active = None;
    }
}
