//! Directory-watch capability: raw add/change notifications for one folder.
//!
//! `NotifyWatch` backs the capability with the `notify` crate. Polling is the
//! default because instrument folders are usually mounted into the container
//! from the host, where native events are not delivered.

use chrono::{DateTime, Utc};
use notify::event::{CreateKind, EventKind, ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, PollWatcher, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

/// What the watch backend knows about a file at notification time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileStats {
    pub created_at: Option<DateTime<Utc>>,
    pub size: Option<u64>,
}

impl FileStats {
    /// Stat `path`; fields the filesystem cannot report are left empty.
    pub fn from_path(path: &Path) -> Self {
        match std::fs::metadata(path) {
            Ok(meta) => Self {
                created_at: meta.created().ok().map(DateTime::<Utc>::from),
                size: Some(meta.len()),
            },
            Err(_) => Self::default(),
        }
    }
}

#[derive(Debug)]
pub enum WatchEvent {
    Added { path: PathBuf, stats: FileStats },
    Changed { path: PathBuf },
    Error(WatchError),
}

/// External directory-watch capability.
pub trait DirectoryWatch: Send {
    /// Begin delivering events for the folder into `events`.
    fn watch(&mut self, events: mpsc::UnboundedSender<WatchEvent>) -> Result<(), WatchError>;

    /// Stop delivering events. Idempotent.
    fn close(&mut self);
}

/// Best-effort refresh of the watched folder, used when it has been quiet for
/// a long time in case native events were missed.
pub trait DirectoryNudge: Send + Sync {
    /// Returns the number of entries seen.
    fn nudge(&self) -> Result<usize, WatchError>;
}

pub struct NotifyWatch {
    folder: PathBuf,
    use_polling: bool,
    poll_interval: Duration,
    watcher: Option<Box<dyn Watcher + Send>>,
}

impl NotifyWatch {
    pub fn new(folder: impl Into<PathBuf>, use_polling: bool, poll_interval: Duration) -> Self {
        Self {
            folder: folder.into(),
            use_polling,
            poll_interval,
            watcher: None,
        }
    }
}

impl DirectoryWatch for NotifyWatch {
    fn watch(&mut self, events: mpsc::UnboundedSender<WatchEvent>) -> Result<(), WatchError> {
        let handler = move |res: notify::Result<Event>| {
            for event in map_notify_result(res) {
                let _ = events.send(event);
            }
        };

        let mut watcher: Box<dyn Watcher + Send> = if self.use_polling {
            let config = NotifyConfig::default().with_poll_interval(self.poll_interval);
            Box::new(PollWatcher::new(handler, config).map_err(|e| WatchError::Init {
                path: self.folder.clone(),
                source: e,
            })?)
        } else {
            Box::new(
                RecommendedWatcher::new(handler, NotifyConfig::default()).map_err(|e| {
                    WatchError::Init {
                        path: self.folder.clone(),
                        source: e,
                    }
                })?,
            )
        };

        watcher
            .watch(&self.folder, RecursiveMode::NonRecursive)
            .map_err(|e| WatchError::Init {
                path: self.folder.clone(),
                source: e,
            })?;

        tracing::debug!(
            folder = %self.folder.display(),
            polling = self.use_polling,
            poll_interval_ms = self.poll_interval.as_millis() as u64,
            "directory watcher created"
        );
        self.watcher = Some(watcher);
        Ok(())
    }

    fn close(&mut self) {
        if self.watcher.take().is_some() {
            tracing::debug!(folder = %self.folder.display(), "directory watcher closed");
        }
    }
}

/// Translate one notify callback into capability events.
fn map_notify_result(res: notify::Result<Event>) -> Vec<WatchEvent> {
    let event = match res {
        Ok(event) => event,
        Err(e) => return vec![WatchEvent::Error(WatchError::Backend(e.to_string()))],
    };

    match event.kind {
        EventKind::Create(CreateKind::Folder) => Vec::new(),
        EventKind::Create(_) => event
            .paths
            .into_iter()
            .map(|path| {
                let stats = FileStats::from_path(&path);
                WatchEvent::Added { path, stats }
            })
            .collect(),
        // Files renamed into the folder are new files for the caller.
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .into_iter()
            .map(|path| {
                let stats = FileStats::from_path(&path);
                WatchEvent::Added { path, stats }
            })
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => event
            .paths
            .into_iter()
            .last()
            .map(|path| {
                let stats = FileStats::from_path(&path);
                WatchEvent::Added { path, stats }
            })
            .into_iter()
            .collect(),
        EventKind::Modify(_) => event
            .paths
            .into_iter()
            .map(|path| WatchEvent::Changed { path })
            .collect(),
        _ => Vec::new(),
    }
}

/// Nudges a folder by listing it.
pub struct FolderListing {
    folder: PathBuf,
}

impl FolderListing {
    pub fn new(folder: impl Into<PathBuf>) -> Self {
        Self {
            folder: folder.into(),
        }
    }
}

impl DirectoryNudge for FolderListing {
    fn nudge(&self) -> Result<usize, WatchError> {
        let entries = std::fs::read_dir(&self.folder).map_err(|e| WatchError::Listing {
            path: self.folder.clone(),
            source: e,
        })?;
        Ok(entries.flatten().count())
    }
}

/// Errors from the watch capability. All of them are fatal to the adapter.
#[derive(Debug)]
pub enum WatchError {
    Init {
        path: PathBuf,
        source: notify::Error,
    },
    Backend(String),
    Listing {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The capability stopped delivering events without being asked to.
    Closed,
}

impl std::fmt::Display for WatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WatchError::Init { path, source } => {
                write!(f, "failed to watch {}: {source}", path.display())
            }
            WatchError::Backend(msg) => write!(f, "watcher error: {msg}"),
            WatchError::Listing { path, source } => {
                write!(f, "failed to list {}: {source}", path.display())
            }
            WatchError::Closed => write!(f, "watcher closed unexpectedly"),
        }
    }
}

impl std::error::Error for WatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WatchError::Init { source, .. } => Some(source),
            WatchError::Listing { source, .. } => Some(source),
            WatchError::Backend(_) | WatchError::Closed => None,
        }
    }
}
