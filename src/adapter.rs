//! Routes raw watch notifications into the activity clock and the stability
//! detector.

use crate::clock::ActivityClock;
use crate::stability::FileStabilityDetector;
use crate::watch::{DirectoryWatch, WatchError, WatchEvent};
use chrono::Utc;
use std::path::Path;
use tokio::sync::{mpsc, watch};

/// Which newly added files are worth tracking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtensionFilter {
    Any,
    /// Lower-case extension without the leading dot.
    Exact(String),
}

impl ExtensionFilter {
    /// `"*"` or `"any"` accept every file; otherwise `"raw"`, `".raw"` and
    /// `".RAW"` are equivalent.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        if value == "*" || value.eq_ignore_ascii_case("any") {
            return ExtensionFilter::Any;
        }
        ExtensionFilter::Exact(value.trim_start_matches('.').to_ascii_lowercase())
    }

    pub fn matches(&self, path: &Path) -> bool {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase());
        match (self, ext) {
            (_, None) => false,
            (ExtensionFilter::Any, Some(_)) => true,
            (ExtensionFilter::Exact(wanted), Some(ext)) => *wanted == ext,
        }
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

pub struct ActivityWatchAdapter {
    filter: ExtensionFilter,
    clock: ActivityClock,
    detector: FileStabilityDetector,
}

impl ActivityWatchAdapter {
    pub fn new(filter: ExtensionFilter, clock: ActivityClock, detector: FileStabilityDetector) -> Self {
        Self {
            filter,
            clock,
            detector,
        }
    }

    /// Apply one notification. Errors from the capability are handed back so the
    /// caller can shut the adapter down.
    pub fn handle(&self, event: WatchEvent) -> Result<(), WatchError> {
        match event {
            WatchEvent::Added { path, stats } => {
                if is_hidden(&path) || !self.filter.matches(&path) {
                    tracing::trace!(path = %path.display(), "ignoring added file");
                    return Ok(());
                }
                let created_at = stats.created_at.unwrap_or_else(Utc::now);
                tracing::debug!(path = %path.display(), %created_at, "file added");
                self.clock.record_activity(created_at);
                self.detector.track(path, created_at);
                Ok(())
            }
            WatchEvent::Changed { path } => {
                if is_hidden(&path) {
                    return Ok(());
                }
                let now = self.clock.record_activity(Utc::now());
                tracing::trace!(path = %path.display(), %now, "directory changed");
                Ok(())
            }
            WatchEvent::Error(e) => Err(e),
        }
    }

    /// Pump notifications until shutdown is requested or the capability fails.
    /// The capability is closed on every exit path.
    pub async fn run(
        self,
        mut capability: Box<dyn DirectoryWatch>,
        mut events: mpsc::UnboundedReceiver<WatchEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), WatchError> {
        let result = loop {
            if *shutdown.borrow() {
                break Ok(());
            }

            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        if let Err(e) = self.handle(event) {
                            break Err(e);
                        }
                    }
                    None => break Err(WatchError::Closed),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break Ok(());
                    }
                }
            }
        };

        capability.close();
        match &result {
            Ok(()) => tracing::debug!("watch adapter closed"),
            Err(e) => tracing::error!(error = %e, "directory watcher crashed"),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stability::{FileSettled, StabilityConfig};
    use crate::watch::FileStats;
    use chrono::TimeDelta;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct FakeWatch {
        closes: Arc<AtomicUsize>,
    }

    impl DirectoryWatch for FakeWatch {
        fn watch(&mut self, _events: mpsc::UnboundedSender<WatchEvent>) -> Result<(), WatchError> {
            Ok(())
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn adapter(
        extension: &str,
    ) -> (
        ActivityWatchAdapter,
        ActivityClock,
        FileStabilityDetector,
        mpsc::UnboundedReceiver<FileSettled>,
    ) {
        let clock = ActivityClock::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let detector = FileStabilityDetector::new(
            StabilityConfig {
                stability_delay: Duration::from_millis(50),
                file_watch_threshold: Duration::from_millis(100),
            },
            clock.clone(),
            tx,
        );
        let adapter = ActivityWatchAdapter::new(
            ExtensionFilter::parse(extension),
            clock.clone(),
            detector.clone(),
        );
        (adapter, clock, detector, rx)
    }

    #[test]
    fn test_extension_filter_parse() {
        assert_eq!(ExtensionFilter::parse("*"), ExtensionFilter::Any);
        assert_eq!(ExtensionFilter::parse("ANY"), ExtensionFilter::Any);
        assert_eq!(
            ExtensionFilter::parse(".RAW"),
            ExtensionFilter::Exact("raw".to_string())
        );
        assert_eq!(
            ExtensionFilter::parse("hdr"),
            ExtensionFilter::Exact("hdr".to_string())
        );
    }

    #[test]
    fn test_extension_filter_matches() {
        let raw = ExtensionFilter::parse("raw");
        assert!(raw.matches(Path::new("/data/D20240101-T000000.raw")));
        assert!(raw.matches(Path::new("/data/UPPER.RAW")));
        assert!(!raw.matches(Path::new("/data/D20240101-T000000.idx")));
        assert!(!raw.matches(Path::new("/data/noext")));
        assert!(!raw.matches(Path::new("/data/archive.raw.gz")));

        let any = ExtensionFilter::Any;
        assert!(any.matches(Path::new("/data/x.idx")));
        assert!(!any.matches(Path::new("/data/noext")));
    }

    #[tokio::test]
    async fn test_non_matching_add_is_ignored_entirely() {
        let (adapter, clock, detector, _rx) = adapter("raw");
        adapter
            .handle(WatchEvent::Added {
                path: PathBuf::from("/data/x.idx"),
                stats: FileStats::default(),
            })
            .unwrap();
        assert_eq!(clock.last_activity_at(), None);
        assert_eq!(detector.tracked_path(), None);
    }

    #[tokio::test]
    async fn test_hidden_files_are_ignored() {
        let (adapter, clock, detector, _rx) = adapter("*");
        adapter
            .handle(WatchEvent::Added {
                path: PathBuf::from("/data/.partial.raw"),
                stats: FileStats::default(),
            })
            .unwrap();
        adapter
            .handle(WatchEvent::Changed {
                path: PathBuf::from("/data/.DS_Store"),
            })
            .unwrap();
        assert_eq!(clock.last_activity_at(), None);
        assert_eq!(detector.tracked_path(), None);
    }

    #[tokio::test]
    async fn test_matching_add_records_creation_time_and_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.raw");
        std::fs::write(&path, b"x").unwrap();

        let (adapter, clock, detector, mut rx) = adapter(".raw");
        let created_at = Utc::now() - TimeDelta::seconds(3);
        adapter
            .handle(WatchEvent::Added {
                path: path.clone(),
                stats: FileStats {
                    created_at: Some(created_at),
                    size: Some(1),
                },
            })
            .unwrap();

        assert_eq!(clock.last_activity_at(), Some(created_at));
        assert_eq!(detector.tracked_path(), Some(path.clone()));

        let settled = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(settled.path, path);
        assert_eq!(settled.created_at, created_at);
    }

    #[tokio::test]
    async fn test_changed_updates_clock_only() {
        let (adapter, clock, detector, _rx) = adapter("raw");
        let before = Utc::now();
        adapter
            .handle(WatchEvent::Changed {
                path: PathBuf::from("/data/whatever.log"),
            })
            .unwrap();
        assert!(clock.last_activity_at().unwrap() >= before);
        assert_eq!(detector.tracked_path(), None);
    }

    #[tokio::test]
    async fn test_run_closes_capability_on_error() {
        let (adapter, _clock, _detector, _rx) = adapter("raw");
        let closes = Arc::new(AtomicUsize::new(0));
        let capability = Box::new(FakeWatch {
            closes: Arc::clone(&closes),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        tx.send(WatchEvent::Error(WatchError::Backend("disk gone".to_string())))
            .unwrap();
        let result = adapter.run(capability, rx, shutdown_rx).await;

        assert!(matches!(result, Err(WatchError::Backend(_))));
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (adapter, _clock, _detector, _rx) = adapter("raw");
        let closes = Arc::new(AtomicUsize::new(0));
        let capability = Box::new(FakeWatch {
            closes: Arc::clone(&closes),
        });
        let (_tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(adapter.run(capability, rx, shutdown_rx));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_run_reports_dropped_event_stream() {
        let (adapter, _clock, _detector, _rx) = adapter("raw");
        let capability = Box::new(FakeWatch {
            closes: Arc::new(AtomicUsize::new(0)),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        drop(tx);

        let result = adapter.run(capability, rx, shutdown_rx).await;
        assert!(matches!(result, Err(WatchError::Closed)));
    }
}
