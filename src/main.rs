mod adapter;
mod clock;
mod config;
mod health;
mod metadata;
mod monitor;
mod poller;
#[cfg(feature = "serve")]
mod serve;
mod signals;
mod simulate;
mod stability;
mod status;
mod transport;
mod watch;

use clap::{Parser, Subcommand};
use config::MonitorConfig;
use metadata::{ConfigurationXmlExtractor, MetadataExtractor};
use monitor::{Collaborators, Monitor, ResumeState};
use status::StatusFile;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use transport::{JsonLinesTransport, Sink};
use watch::{FolderListing, NotifyWatch};

/// Watches the folder an instrument writes its raw files into: reports every
/// settled file and raises an alarm when the folder goes quiet.
#[derive(Parser, Debug)]
#[command(name = "rawwatch", version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Config file path
    #[arg(short, long, default_value = "rawwatch.toml")]
    config: PathBuf,

    /// Folder to watch (overrides config)
    #[arg(long)]
    folder: Option<PathBuf>,

    /// File extension to track, or "*" for any (overrides config)
    #[arg(long)]
    extension: Option<String>,

    /// Inactivity in milliseconds before raising the alarm (overrides config)
    #[arg(long)]
    alert_time_diff_ms: Option<u64>,

    /// Validate config and print resolved settings, don't run
    #[arg(long)]
    dry_run: bool,

    /// Debug logging (poll ticks, size samples, nudges)
    #[arg(short, long)]
    verbose: bool,

    /// Only warnings and errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy a file in random 512-2048 byte chunks, like an instrument writing it
    Simulate {
        /// File to copy
        input: PathBuf,
        /// Destination file or directory
        output: PathBuf,
        /// Pause between chunks in milliseconds
        #[arg(long, default_value_t = 1000)]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "rawwatch=debug"
    } else if cli.quiet {
        "rawwatch=warn"
    } else {
        "rawwatch=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    tracing::debug!(?cli, "parsed CLI arguments");

    let result: Result<(), Box<dyn std::error::Error>> = match &cli.command {
        Some(Command::Simulate {
            input,
            output,
            interval_ms,
        }) => simulate::chunked_copy(input, output, Duration::from_millis(*interval_ms))
            .await
            .map(|_| ())
            .map_err(Into::into),
        None => run(&cli).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "rawwatch failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = MonitorConfig::load(&cli.config)?;
    if let Some(folder) = &cli.folder {
        config.watch.folder = folder.clone();
    }
    if let Some(extension) = &cli.extension {
        config.watch.extension = extension.clone();
    }
    if let Some(ms) = cli.alert_time_diff_ms {
        config.health.alert_time_diff_ms = ms;
    }
    config.validate()?;

    if cli.dry_run {
        println!("{config:#?}");
        println!("Dry run: config validated, not running.");
        return Ok(());
    }

    let status = StatusFile::new(config.health.state_file.clone());
    let health = match status.load() {
        Ok(Some(state)) => {
            tracing::info!(%state, path = %status.path().display(), "resuming last reported state");
            state
        }
        Ok(None) => config.health.initial_state,
        Err(e) => {
            tracing::warn!(error = %e, "ignoring unreadable status file");
            config.health.initial_state
        }
    };

    let sink = match &config.transport.outbox {
        Some(path) => Sink::Outbox(path.clone()),
        None => Sink::Stdout,
    };
    let transport = Arc::new(JsonLinesTransport::open(
        sink,
        config.transport.reported_file.clone(),
    )?);
    let metadata_uploaded = transport
        .reported()
        .await
        .get("metadataUploaded")
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);

    let extractor: Option<Arc<dyn MetadataExtractor>> = if config.metadata.enabled {
        Some(Arc::new(ConfigurationXmlExtractor::new(
            config.metadata.scan_limit_bytes,
        )))
    } else {
        None
    };

    let collaborators = Collaborators {
        watch: Box::new(NotifyWatch::new(
            config.watch.folder.clone(),
            config.watch.use_polling,
            config.watch.poll_interval(),
        )),
        nudge: Some(Arc::new(FolderListing::new(config.watch.folder.clone()))),
        transport,
        extractor,
        status: Some(status),
    };

    let monitor = Monitor::start(
        &config,
        ResumeState {
            health,
            metadata_uploaded,
        },
        collaborators,
    )?;

    #[cfg(feature = "serve")]
    if config.serve.enabled {
        let serve_config = config.serve.clone();
        let snapshots = monitor.subscribe();
        tokio::spawn(async move {
            if let Err(e) = serve::run(&serve_config, snapshots).await {
                tracing::error!(error = %e, "status server failed");
            }
        });
    }

    let result = tokio::select! {
        result = monitor.wait() => result,
        _ = signals::shutdown_signal() => Ok(()),
    };
    monitor.close().await;
    result?;
    Ok(())
}
