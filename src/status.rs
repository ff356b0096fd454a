/// Status file: persists the last reported health label on every transition.
///
/// Uses atomic write pattern: write to temp file then rename.
use crate::health::HealthState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The JSON payload written to the status file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusData {
    pub current_state: HealthState,
    pub updated_at: DateTime<Utc>,
}

/// Write-back channel for the last reported health label.
pub struct StatusFile {
    path: PathBuf,
}

impl StatusFile {
    /// Create a new StatusFile writer for the given path.
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Record `state` as the last reported label.
    pub fn persist(&self, state: HealthState) -> Result<(), StatusError> {
        let data = StatusData {
            current_state: state,
            updated_at: Utc::now(),
        };
        write_json_atomic(&self.path, &data)
    }

    /// Last persisted label, or `None` if nothing was written yet.
    pub fn load(&self) -> Result<Option<HealthState>, StatusError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StatusError::Read {
                    path: self.path.clone(),
                    source: e,
                })
            }
        };
        let data: StatusData =
            serde_json::from_str(&contents).map_err(|e| StatusError::Serialize { source: e })?;
        Ok(Some(data.current_state))
    }

    /// Path to the status file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Atomically write `value` as pretty JSON to `path`.
///
/// Writes to a temporary file in the same directory, then renames
/// to ensure readers never see a partial write.
pub fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), StatusError> {
    let json =
        serde_json::to_string_pretty(value).map_err(|e| StatusError::Serialize { source: e })?;

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "status".to_string());
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    std::fs::write(&tmp_path, json.as_bytes()).map_err(|e| StatusError::Write {
        path: tmp_path.clone(),
        source: e,
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| StatusError::Rename {
        from: tmp_path,
        to: path.to_path_buf(),
        source: e,
    })?;

    Ok(())
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    Serialize {
        source: serde_json::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Rename {
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::Serialize { source } => write!(f, "failed to (de)serialize status: {source}"),
            StatusError::Read { path, source } => {
                write!(f, "failed to read status file {}: {source}", path.display())
            }
            StatusError::Write { path, source } => {
                write!(
                    f,
                    "failed to write temp status file {}: {source}",
                    path.display()
                )
            }
            StatusError::Rename { from, to, source } => {
                write!(
                    f,
                    "failed to rename {} -> {}: {source}",
                    from.display(),
                    to.display()
                )
            }
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::Serialize { source } => Some(source),
            StatusError::Read { source, .. } => Some(source),
            StatusError::Write { source, .. } => Some(source),
            StatusError::Rename { source, .. } => Some(source),
        }
    }
}
