//! Instrument metadata embedded in raw data files.
//!
//! Echosounder raw files carry an XML `<Configuration>` datagram near the
//! start. Only the transducer and transceiver descriptions are extracted.

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

pub type Attributes = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstrumentMetadata {
    #[serde(rename = "Transducers")]
    pub transducers: Vec<Attributes>,
    #[serde(rename = "Transceivers")]
    pub transceivers: Vec<Transceiver>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Transceiver {
    #[serde(flatten)]
    pub attributes: Attributes,
    #[serde(rename = "Channels")]
    pub channels: Vec<Channel>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Channel {
    #[serde(flatten)]
    pub attributes: Attributes,
    #[serde(rename = "Transducer")]
    pub transducer: Attributes,
}

#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    /// Metadata found in `path`, or `None` if the file carries none.
    async fn extract(&self, path: &Path) -> Result<Option<InstrumentMetadata>, MetadataError>;
}

static CONFIGURATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<Configuration>(.*?)</Configuration>").unwrap());
static TRANSDUCERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<Transducers>(.*?)</Transducers>").unwrap());
static TRANSCEIVERS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<Transceivers>(.*?)</Transceivers>").unwrap());
static TRANSCEIVER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<Transceiver\b([^>]*)>(.*?)</Transceiver>").unwrap());
static CHANNEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<Channel\b([^>]*)>(.*?)</Channel>").unwrap());
static TRANSDUCER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<Transducer\b([^>]*?)/?>").unwrap());
static ATTRIBUTE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"([A-Za-z_][\w.:-]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
});
static ENTITY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"&(lt|gt|amp|quot|apos|#[0-9]+|#x[0-9A-Fa-f]+);").unwrap());

/// Reads the `<Configuration>` block from the head of a raw file.
pub struct ConfigurationXmlExtractor {
    scan_limit: u64,
}

impl ConfigurationXmlExtractor {
    pub fn new(scan_limit: u64) -> Self {
        Self { scan_limit }
    }
}

#[async_trait]
impl MetadataExtractor for ConfigurationXmlExtractor {
    async fn extract(&self, path: &Path) -> Result<Option<InstrumentMetadata>, MetadataError> {
        let path = path.to_path_buf();
        let limit = self.scan_limit;
        tokio::task::spawn_blocking(move || -> Result<_, MetadataError> {
            let head = read_head(&path, limit)?;
            let metadata = parse_configuration(&String::from_utf8_lossy(&head));
            match &metadata {
                Some(m) => tracing::debug!(
                    path = %path.display(),
                    transducers = m.transducers.len(),
                    transceivers = m.transceivers.len(),
                    "metadata extracted"
                ),
                None => tracing::debug!(path = %path.display(), "no configuration block found"),
            }
            Ok(metadata)
        })
        .await
        .map_err(|e| MetadataError::Task(e.to_string()))?
    }
}

fn read_head(path: &Path, limit: u64) -> Result<Vec<u8>, MetadataError> {
    let read_err = |e: std::io::Error| MetadataError::Read {
        path: path.to_path_buf(),
        source: e,
    };
    let file = std::fs::File::open(path).map_err(read_err)?;
    let mut head = Vec::new();
    file.take(limit).read_to_end(&mut head).map_err(read_err)?;
    Ok(head)
}

/// Parse the first `<Configuration>` block in `text`.
pub fn parse_configuration(text: &str) -> Option<InstrumentMetadata> {
    let config = CONFIGURATION.captures(text)?.get(1)?.as_str();

    let transducers = TRANSDUCERS
        .captures(config)
        .and_then(|c| c.get(1))
        .map(|block| {
            TRANSDUCER
                .captures_iter(block.as_str())
                .map(|c| parse_attributes(&c[1]))
                .collect()
        })
        .unwrap_or_default();

    let transceivers = TRANSCEIVERS
        .captures(config)
        .and_then(|c| c.get(1))
        .map(|block| {
            TRANSCEIVER
                .captures_iter(block.as_str())
                .map(|c| parse_transceiver(&c[1], &c[2]))
                .collect()
        })
        .unwrap_or_default();

    Some(InstrumentMetadata {
        transducers,
        transceivers,
    })
}

fn parse_transceiver(attrs: &str, body: &str) -> Transceiver {
    let mut attributes = parse_attributes(attrs);
    attributes.remove("Version");

    let channels = CHANNEL
        .captures_iter(body)
        .map(|c| Channel {
            attributes: parse_attributes(&c[1]),
            transducer: TRANSDUCER
                .captures(&c[2])
                .map(|t| parse_attributes(&t[1]))
                .unwrap_or_default(),
        })
        .collect();

    Transceiver {
        attributes,
        channels,
    }
}

fn parse_attributes(s: &str) -> Attributes {
    ATTRIBUTE
        .captures_iter(s)
        .map(|c| {
            let value = c.get(2).or_else(|| c.get(3)).map_or("", |m| m.as_str());
            (c[1].to_string(), decode_entities(value))
        })
        .collect()
}

fn decode_entities(s: &str) -> String {
    ENTITY
        .replace_all(s, |c: &regex::Captures<'_>| {
            let entity = &c[1];
            match entity {
                "lt" => "<".to_string(),
                "gt" => ">".to_string(),
                "amp" => "&".to_string(),
                "quot" => "\"".to_string(),
                "apos" => "'".to_string(),
                _ => {
                    let code = match entity.strip_prefix("#x") {
                        Some(hex) => u32::from_str_radix(hex, 16).ok(),
                        None => entity[1..].parse().ok(),
                    };
                    code.and_then(char::from_u32)
                        .map(String::from)
                        .unwrap_or_else(|| c[0].to_string())
                }
            }
        })
        .into_owned()
}

#[derive(Debug)]
pub enum MetadataError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Task(String),
}

impl std::fmt::Display for MetadataError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetadataError::Read { path, source } => {
                write!(f, "failed to read {}: {source}", path.display())
            }
            MetadataError::Task(msg) => write!(f, "metadata task failed: {msg}"),
        }
    }
}

impl std::error::Error for MetadataError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MetadataError::Read { source, .. } => Some(source),
            MetadataError::Task(_) => None,
        }
    }
}
