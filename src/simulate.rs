//! Emulates an instrument writing a raw file: copies a file in random-sized
//! chunks with a pause between writes.

use rand::Rng;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

pub const MIN_CHUNK_SIZE: usize = 512;
pub const MAX_CHUNK_SIZE: usize = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyReport {
    pub output: PathBuf,
    pub bytes_written: u64,
    pub chunks: usize,
}

/// Copy `input` to `output` chunk by chunk. If `output` is a directory the
/// file keeps its name inside it.
pub async fn chunked_copy(
    input: &Path,
    output: &Path,
    interval: Duration,
) -> Result<CopyReport, SimulateError> {
    if !input.is_file() {
        return Err(SimulateError::InputNotFound(input.to_path_buf()));
    }

    let output = if output.is_dir() {
        match input.file_name() {
            Some(name) => output.join(name),
            None => return Err(SimulateError::InputNotFound(input.to_path_buf())),
        }
    } else {
        output.to_path_buf()
    };

    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |e: std::io::Error| SimulateError::Io { path, source: e }
    };

    let mut reader = tokio::fs::File::open(input).await.map_err(io_err(input))?;
    let mut writer = tokio::fs::File::create(&output)
        .await
        .map_err(io_err(&output))?;

    let mut buf = vec![0u8; MAX_CHUNK_SIZE];
    let mut bytes_written = 0u64;
    let mut chunks = 0usize;

    loop {
        let chunk_size = rand::rng().random_range(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE);
        let n = reader
            .read(&mut buf[..chunk_size])
            .await
            .map_err(io_err(input))?;
        if n == 0 {
            break;
        }

        writer
            .write_all(&buf[..n])
            .await
            .map_err(io_err(&output))?;
        writer.flush().await.map_err(io_err(&output))?;
        bytes_written += n as u64;
        chunks += 1;
        tracing::info!(
            bytes = n,
            total = bytes_written,
            output = %output.display(),
            "chunk written"
        );

        if !interval.is_zero() {
            tokio::time::sleep(interval).await;
        }
    }

    writer.sync_all().await.map_err(io_err(&output))?;
    tracing::info!(
        input = %input.display(),
        output = %output.display(),
        bytes_written,
        chunks,
        "file transfer completed"
    );

    Ok(CopyReport {
        output,
        bytes_written,
        chunks,
    })
}

#[derive(Debug)]
pub enum SimulateError {
    InputNotFound(PathBuf),
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for SimulateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SimulateError::InputNotFound(path) => {
                write!(f, "input file not found: {}", path.display())
            }
            SimulateError::Io { path, source } => {
                write!(f, "I/O error on {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for SimulateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SimulateError::InputNotFound(_) => None,
            SimulateError::Io { source, .. } => Some(source),
        }
    }
}
