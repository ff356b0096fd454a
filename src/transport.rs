//! Messaging transport: publishes events and keeps reported properties.

use crate::health::{HealthState, HealthTransition};
use crate::metadata::InstrumentMetadata;
use crate::stability::FileSettled;
use crate::status::{write_json_atomic, StatusError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthPayload {
    pub state: HealthState,
    pub prev_state: HealthState,
    pub attempt: u64,
    pub timeout_ms: u64,
}

impl From<&HealthTransition> for HealthPayload {
    fn from(t: &HealthTransition) -> Self {
        Self {
            state: t.new_state,
            prev_state: t.prev_state,
            attempt: t.attempt,
            timeout_ms: t.timeout_ms,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePayload {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

impl From<&FileSettled> for FilePayload {
    fn from(f: &FileSettled) -> Self {
        Self {
            path: f.path.clone(),
            created_at: f.created_at,
            kind: "fileadd",
        }
    }
}

/// Anything the monitor sends upstream.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Health(HealthPayload),
    File(FilePayload),
    Metadata(InstrumentMetadata),
}

impl Payload {
    /// Message properties that let downstream routing filter without parsing
    /// the body. Health messages carry `alarm = "true" | "false"`.
    pub fn properties(&self) -> BTreeMap<&'static str, String> {
        let mut properties = BTreeMap::new();
        if let Payload::Health(health) = self {
            let alarm = health.state == HealthState::Alarm;
            properties.insert("alarm", alarm.to_string());
        }
        properties
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, payload: &Payload, channel: &str) -> Result<(), TransportError>;

    async fn update_reported_property(&self, key: &str, value: Value) -> Result<(), TransportError>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Envelope<'a> {
    channel: &'a str,
    sent_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    properties: BTreeMap<&'static str, String>,
    payload: &'a Payload,
}

#[derive(Debug, Clone)]
pub enum Sink {
    Stdout,
    /// Append-only file, one message per line.
    Outbox(PathBuf),
}

/// Writes messages as JSON lines and reported properties as a JSON object file.
pub struct JsonLinesTransport {
    sink: Sink,
    reported_path: PathBuf,
    reported: Mutex<Map<String, Value>>,
    write_lock: Mutex<()>,
}

impl JsonLinesTransport {
    /// Open the transport. Existing reported properties are loaded so restarts
    /// keep earlier keys.
    pub fn open(sink: Sink, reported_path: PathBuf) -> Result<Self, TransportError> {
        let reported = match std::fs::read_to_string(&reported_path) {
            Ok(contents) => match serde_json::from_str::<Value>(&contents) {
                Ok(Value::Object(map)) => map,
                Ok(_) | Err(_) => {
                    tracing::warn!(
                        path = %reported_path.display(),
                        "reported properties file is not a JSON object, starting empty"
                    );
                    Map::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Map::new(),
            Err(e) => {
                return Err(TransportError::Io {
                    path: reported_path,
                    source: e,
                })
            }
        };

        Ok(Self {
            sink,
            reported_path,
            reported: Mutex::new(reported),
            write_lock: Mutex::new(()),
        })
    }

    /// Current reported properties.
    pub async fn reported(&self) -> Map<String, Value> {
        self.reported.lock().await.clone()
    }
}

#[async_trait]
impl Transport for JsonLinesTransport {
    async fn publish(&self, payload: &Payload, channel: &str) -> Result<(), TransportError> {
        let envelope = Envelope {
            channel,
            sent_at: Utc::now(),
            properties: payload.properties(),
            payload,
        };
        let mut line = serde_json::to_vec(&envelope).map_err(TransportError::Serialize)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        match &self.sink {
            Sink::Stdout => {
                let mut out = tokio::io::stdout();
                out.write_all(&line).await.map_err(|e| TransportError::Io {
                    path: PathBuf::from("<stdout>"),
                    source: e,
                })?;
                out.flush().await.map_err(|e| TransportError::Io {
                    path: PathBuf::from("<stdout>"),
                    source: e,
                })?;
            }
            Sink::Outbox(path) => {
                let io_err = |e: std::io::Error| TransportError::Io {
                    path: path.clone(),
                    source: e,
                };
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await
                    .map_err(io_err)?;
                file.write_all(&line).await.map_err(io_err)?;
                file.flush().await.map_err(io_err)?;
            }
        }

        tracing::debug!(channel, "message published");
        Ok(())
    }

    async fn update_reported_property(&self, key: &str, value: Value) -> Result<(), TransportError> {
        let mut reported = self.reported.lock().await;
        let mut updated = reported.clone();
        updated.insert(key.to_string(), value);
        let path = self.reported_path.clone();

        // Only the persisted map becomes visible.
        let updated = tokio::task::spawn_blocking(move || {
            let snapshot = Value::Object(updated);
            write_json_atomic(&path, &snapshot).map(|()| snapshot)
        })
        .await
        .map_err(|e| TransportError::Rejected(format!("reported property writer panicked: {e}")))?
        .map_err(TransportError::Reported)?;

        if let Value::Object(map) = updated {
            *reported = map;
        }

        tracing::debug!(key, "reported property updated");
        Ok(())
    }
}

#[derive(Debug)]
pub enum TransportError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Serialize(serde_json::Error),
    Reported(StatusError),
    /// The upstream refused the message.
    Rejected(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Io { path, source } => {
                write!(f, "failed to write {}: {source}", path.display())
            }
            TransportError::Serialize(e) => write!(f, "failed to serialize message: {e}"),
            TransportError::Reported(e) => write!(f, "failed to store reported properties: {e}"),
            TransportError::Rejected(msg) => write!(f, "message rejected: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Io { source, .. } => Some(source),
            TransportError::Serialize(e) => Some(e),
            TransportError::Reported(e) => Some(e),
            TransportError::Rejected(_) => None,
        }
    }
}
