//! Top-level wiring: watch adapter, stability detector, health poller, and the
//! dispatcher that forwards their events to the transport.

use crate::adapter::{ActivityWatchAdapter, ExtensionFilter};
use crate::clock::ActivityClock;
use crate::config::{MonitorConfig, TransportConfig};
use crate::health::{HealthSnapshot, HealthState, HealthTransition};
use crate::metadata::MetadataExtractor;
use crate::poller::{AdaptiveHealthPoller, PollerConfig};
use crate::stability::{FileSettled, FileStabilityDetector, StabilityConfig};
use crate::status::StatusFile;
use crate::transport::{Payload, Transport};
use crate::watch::{DirectoryNudge, DirectoryWatch, WatchError};
use chrono::Utc;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};

/// External capabilities the monitor drives.
pub struct Collaborators {
    pub watch: Box<dyn DirectoryWatch>,
    pub nudge: Option<Arc<dyn DirectoryNudge>>,
    pub transport: Arc<dyn Transport>,
    /// `None` disables metadata extraction.
    pub extractor: Option<Arc<dyn MetadataExtractor>>,
    /// Write-back for the last reported health label.
    pub status: Option<StatusFile>,
}

/// What the previous run left behind.
#[derive(Debug, Clone, Copy)]
pub struct ResumeState {
    pub health: HealthState,
    pub metadata_uploaded: bool,
}

pub struct Monitor {
    poller: AdaptiveHealthPoller,
    detector: FileStabilityDetector,
    shutdown: watch::Sender<bool>,
    adapter: Mutex<Option<JoinHandle<()>>>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    fatal: Mutex<Option<oneshot::Receiver<WatchError>>>,
    closed: AtomicBool,
}

impl Monitor {
    /// Start watching. Fails only if the watch capability cannot be started.
    pub fn start(
        config: &MonitorConfig,
        resume: ResumeState,
        collaborators: Collaborators,
    ) -> Result<Self, WatchError> {
        let Collaborators {
            mut watch,
            nudge,
            transport,
            extractor,
            status,
        } = collaborators;

        let clock = ActivityClock::new();
        if config.health.startup_grace {
            clock.record_activity(Utc::now());
        }

        let (settled_tx, settled_rx) = mpsc::unbounded_channel();
        let detector = FileStabilityDetector::new(
            StabilityConfig {
                stability_delay: config.watch.stability_delay(),
                file_watch_threshold: config.watch.file_watch_threshold(),
            },
            clock.clone(),
            settled_tx,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        watch.watch(events_tx)?;

        let (transitions_tx, transitions_rx) = mpsc::unbounded_channel();
        let poller = AdaptiveHealthPoller::new(
            PollerConfig {
                min_interval: config.health.min_interval(),
                max_interval: config.health.max_interval(),
                alert_time_diff: config.health.alert_time_diff(),
            },
            clock.clone(),
            resume.health,
            transitions_tx,
            nudge,
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (fatal_tx, fatal_rx) = oneshot::channel();

        let adapter = ActivityWatchAdapter::new(
            ExtensionFilter::parse(&config.watch.extension),
            clock,
            detector.clone(),
        );
        let adapter_handle = {
            let poller = poller.clone();
            let detector = detector.clone();
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move {
                if let Err(e) = adapter.run(watch, events_rx, shutdown_rx).await {
                    poller.stop();
                    detector.stop();
                    let _ = fatal_tx.send(e);
                }
            })
        };

        let dispatcher = Dispatcher {
            transport,
            extractor,
            status,
            channels: config.transport.clone(),
            metadata: Arc::new(MetadataProgress {
                uploaded: AtomicBool::new(resume.metadata_uploaded),
                in_flight: AtomicBool::new(false),
            }),
        };
        let dispatch_handle = tokio::spawn(dispatcher.run(transitions_rx, settled_rx, shutdown_rx));

        poller.perform();

        tracing::info!(
            folder = %config.watch.folder.display(),
            extension = %config.watch.extension,
            state = %resume.health,
            alert_time_diff_ms = config.health.alert_time_diff_ms,
            "monitor started"
        );

        Ok(Self {
            poller,
            detector,
            shutdown: shutdown_tx,
            adapter: Mutex::new(Some(adapter_handle)),
            dispatch: Mutex::new(Some(dispatch_handle)),
            fatal: Mutex::new(Some(fatal_rx)),
            closed: AtomicBool::new(false),
        })
    }

    /// Resolves when the watch capability fails. Resolves with `Ok` once the
    /// monitor has been closed, and immediately on a second call.
    pub async fn wait(&self) -> Result<(), WatchError> {
        let fatal = self.fatal.lock().unwrap_or_else(|p| p.into_inner()).take();
        match fatal {
            Some(rx) => match rx.await {
                Ok(e) => Err(e),
                Err(_) => Ok(()),
            },
            None => Ok(()),
        }
    }

    /// Stop the poller, then the stability sampler, then the watch adapter.
    /// Idempotent; nothing is published once this has been called.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("closing monitor");

        self.poller.stop();
        self.detector.stop();
        self.shutdown.send_replace(true);

        let dispatch = self.dispatch.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = dispatch {
            handle.abort();
            let _ = handle.await;
        }

        let adapter = self.adapter.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = adapter {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "watch adapter task failed");
            }
        }

        tracing::info!("monitor stopped");
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> HealthSnapshot {
        self.poller.snapshot()
    }

    /// Health snapshots, refreshed on every poll tick.
    pub fn subscribe(&self) -> watch::Receiver<HealthSnapshot> {
        self.poller.subscribe()
    }
}

struct MetadataProgress {
    uploaded: AtomicBool,
    in_flight: AtomicBool,
}

/// Forwards health transitions and settled files to the transport.
struct Dispatcher {
    transport: Arc<dyn Transport>,
    extractor: Option<Arc<dyn MetadataExtractor>>,
    status: Option<StatusFile>,
    channels: TransportConfig,
    metadata: Arc<MetadataProgress>,
}

impl Dispatcher {
    async fn run(
        self,
        mut transitions: mpsc::UnboundedReceiver<HealthTransition>,
        mut settled: mpsc::UnboundedReceiver<FileSettled>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut extractions = JoinSet::new();
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(transition) = transitions.recv() => self.on_transition(transition).await,
                Some(file) = settled.recv() => self.on_settled(file, &mut extractions).await,
                Some(joined) = extractions.join_next(), if !extractions.is_empty() => {
                    if let Err(e) = joined {
                        tracing::warn!(error = %e, "metadata task failed");
                    }
                }
                else => break,
            }
        }
        extractions.abort_all();
    }

    async fn on_transition(&self, transition: HealthTransition) {
        let state = transition.new_state;

        if let Some(status) = &self.status {
            if let Err(e) = status.persist(state) {
                tracing::warn!(error = %e, path = %status.path().display(), "failed to persist health state");
            }
        }

        let payload = Payload::Health((&transition).into());
        if let Err(e) = self
            .transport
            .publish(&payload, &self.channels.state_channel)
            .await
        {
            tracing::warn!(error = %e, %state, "failed to publish health state");
        }

        self.report("currentState", Value::from(state.label())).await;
    }

    async fn on_settled(&self, file: FileSettled, extractions: &mut JoinSet<()>) {
        let payload = Payload::File((&file).into());
        if let Err(e) = self
            .transport
            .publish(&payload, &self.channels.file_channel)
            .await
        {
            tracing::warn!(error = %e, path = %file.path.display(), "failed to publish settled file");
        }

        self.report("lastFileUpdateTime", Value::from(Utc::now().to_rfc3339()))
            .await;

        let Some(extractor) = self.extractor.clone() else {
            return;
        };
        if self.metadata.uploaded.load(Ordering::SeqCst)
            || self.metadata.in_flight.swap(true, Ordering::SeqCst)
        {
            return;
        }

        extractions.spawn(extract_and_publish(
            extractor,
            Arc::clone(&self.transport),
            self.channels.metadata_channel.clone(),
            Arc::clone(&self.metadata),
            file.path,
        ));
    }

    async fn report(&self, key: &str, value: Value) {
        if let Err(e) = self.transport.update_reported_property(key, value).await {
            tracing::warn!(error = %e, key, "failed to update reported property");
        }
    }
}

async fn extract_and_publish(
    extractor: Arc<dyn MetadataExtractor>,
    transport: Arc<dyn Transport>,
    channel: String,
    progress: Arc<MetadataProgress>,
    path: PathBuf,
) {
    let metadata = match extractor.extract(&path).await {
        Ok(Some(metadata)) => metadata,
        Ok(None) => {
            tracing::debug!(path = %path.display(), "file carries no metadata");
            progress.in_flight.store(false, Ordering::SeqCst);
            return;
        }
        Err(e) => {
            tracing::warn!(error = %e, path = %path.display(), "metadata extraction failed");
            progress.in_flight.store(false, Ordering::SeqCst);
            return;
        }
    };

    if let Err(e) = transport.publish(&Payload::Metadata(metadata), &channel).await {
        tracing::warn!(error = %e, path = %path.display(), "failed to publish metadata");
        progress.in_flight.store(false, Ordering::SeqCst);
        return;
    }

    progress.uploaded.store(true, Ordering::SeqCst);
    progress.in_flight.store(false, Ordering::SeqCst);
    tracing::info!(path = %path.display(), "metadata uploaded");

    if let Err(e) = transport
        .update_reported_property("metadataUploaded", Value::Bool(true))
        .await
    {
        tracing::warn!(error = %e, "failed to update reported property");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{InstrumentMetadata, MetadataError};
    use crate::transport::TransportError;
    use crate::watch::{FileStats, WatchEvent};
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tempfile::tempdir;

    type EventSender = Arc<Mutex<Option<mpsc::UnboundedSender<WatchEvent>>>>;

    struct FakeWatch {
        sender: EventSender,
        fail: bool,
    }

    impl DirectoryWatch for FakeWatch {
        fn watch(&mut self, events: mpsc::UnboundedSender<WatchEvent>) -> Result<(), WatchError> {
            if self.fail {
                return Err(WatchError::Backend("no such folder".to_string()));
            }
            *self.sender.lock().unwrap() = Some(events);
            Ok(())
        }

        fn close(&mut self) {
            self.sender.lock().unwrap().take();
        }
    }

    #[derive(Default)]
    struct RecordingTransport {
        published: Mutex<Vec<(String, Value)>>,
        reported: Mutex<Vec<(String, Value)>>,
        fail: bool,
    }

    impl RecordingTransport {
        fn on_channel(&self, channel: &str) -> Vec<Value> {
            self.published
                .lock()
                .unwrap()
                .iter()
                .filter(|(c, _)| c == channel)
                .map(|(_, v)| v.clone())
                .collect()
        }

        fn reported(&self, key: &str) -> Vec<Value> {
            self.reported
                .lock()
                .unwrap()
                .iter()
                .filter(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .collect()
        }

        fn total(&self) -> usize {
            self.published.lock().unwrap().len() + self.reported.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn publish(&self, payload: &Payload, channel: &str) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::Rejected("offline".to_string()));
            }
            self.published
                .lock()
                .unwrap()
                .push((channel.to_string(), serde_json::to_value(payload).unwrap()));
            Ok(())
        }

        async fn update_reported_property(&self, key: &str, value: Value) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::Rejected("offline".to_string()));
            }
            self.reported.lock().unwrap().push((key.to_string(), value));
            Ok(())
        }
    }

    struct FakeExtractor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MetadataExtractor for FakeExtractor {
        async fn extract(&self, _path: &Path) -> Result<Option<InstrumentMetadata>, MetadataError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut transducer = crate::metadata::Attributes::new();
            transducer.insert("TransducerName".to_string(), "ES38B".to_string());
            Ok(Some(InstrumentMetadata {
                transducers: vec![transducer],
                transceivers: Vec::new(),
            }))
        }
    }

    fn fast_config(dir: &Path) -> MonitorConfig {
        let mut config = MonitorConfig::default();
        config.watch.folder = dir.to_path_buf();
        config.watch.stability_delay_ms = 30;
        config.watch.file_watch_threshold_ms = 60;
        config.health.min_interval_ms = 20;
        config.health.max_interval_ms = 80;
        config.health.alert_time_diff_ms = 150;
        config
    }

    fn resume(health: HealthState) -> ResumeState {
        ResumeState {
            health,
            metadata_uploaded: false,
        }
    }

    struct Harness {
        monitor: Monitor,
        sender: EventSender,
        transport: Arc<RecordingTransport>,
        extractor: Arc<FakeExtractor>,
    }

    fn start(config: &MonitorConfig, state: ResumeState, transport: RecordingTransport, status: Option<StatusFile>) -> Harness {
        let sender: EventSender = Arc::new(Mutex::new(None));
        let transport = Arc::new(transport);
        let extractor = Arc::new(FakeExtractor {
            calls: AtomicUsize::new(0),
        });
        let monitor = Monitor::start(
            config,
            state,
            Collaborators {
                watch: Box::new(FakeWatch {
                    sender: Arc::clone(&sender),
                    fail: false,
                }),
                nudge: None,
                transport: transport.clone(),
                extractor: Some(extractor.clone()),
                status,
            },
        )
        .unwrap();
        Harness {
            monitor,
            sender,
            transport,
            extractor,
        }
    }

    fn send(sender: &EventSender, event: WatchEvent) {
        sender
            .lock()
            .unwrap()
            .as_ref()
            .expect("watch not started")
            .send(event)
            .unwrap();
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_quiet_folder_raises_alarm_once() {
        let dir = tempdir().unwrap();
        let mut config = fast_config(dir.path());
        config.health.startup_grace = false;
        let status = StatusFile::new(dir.path().join("state.json"));
        let h = start(
            &config,
            resume(HealthState::Healthy),
            RecordingTransport::default(),
            Some(StatusFile::new(status.path().to_path_buf())),
        );

        eventually(|| !h.transport.on_channel("currentState").is_empty()).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        let states = h.transport.on_channel("currentState");
        assert_eq!(states.len(), 1);
        assert_eq!(states[0]["state"], "Alarm");
        assert_eq!(states[0]["prevState"], "Healthy");
        assert_eq!(h.transport.reported("currentState"), vec![Value::from("Alarm")]);
        assert_eq!(status.load().unwrap(), Some(HealthState::Alarm));

        h.monitor.close().await;
    }

    #[tokio::test]
    async fn test_activity_recovers_from_alarm() {
        let dir = tempdir().unwrap();
        let config = fast_config(dir.path());
        let h = start(&config, resume(HealthState::Alarm), RecordingTransport::default(), None);

        // the startup grace counts as activity
        eventually(|| !h.transport.on_channel("currentState").is_empty()).await;
        let states = h.transport.on_channel("currentState");
        assert_eq!(states[0]["state"], "Healthy");
        assert_eq!(states[0]["prevState"], "Alarm");

        h.monitor.close().await;
    }

    #[tokio::test]
    async fn test_settled_file_is_published_with_metadata_once() {
        let dir = tempdir().unwrap();
        let mut config = fast_config(dir.path());
        config.health.alert_time_diff_ms = 60_000;
        let h = start(&config, resume(HealthState::Healthy), RecordingTransport::default(), None);

        let first = dir.path().join("D20240501-T100000.raw");
        std::fs::write(&first, b"header").unwrap();
        send(
            &h.sender,
            WatchEvent::Added {
                path: first.clone(),
                stats: FileStats::from_path(&first),
            },
        );

        eventually(|| !h.transport.on_channel("metadata").is_empty()).await;
        let files = h.transport.on_channel("raw_file_added");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0]["path"], first.to_string_lossy().as_ref());
        assert_eq!(files[0]["type"], "fileadd");
        assert_eq!(
            h.transport.on_channel("metadata")[0]["Transducers"][0]["TransducerName"],
            "ES38B"
        );
        eventually(|| !h.transport.reported("metadataUploaded").is_empty()).await;
        assert_eq!(h.transport.reported("lastFileUpdateTime").len(), 1);

        let second = dir.path().join("D20240501-T110000.raw");
        std::fs::write(&second, b"header").unwrap();
        send(
            &h.sender,
            WatchEvent::Added {
                path: second.clone(),
                stats: FileStats::from_path(&second),
            },
        );
        eventually(|| h.transport.on_channel("raw_file_added").len() == 2).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.on_channel("metadata").len(), 1);

        h.monitor.close().await;
    }

    #[tokio::test]
    async fn test_metadata_skipped_when_already_uploaded() {
        let dir = tempdir().unwrap();
        let mut config = fast_config(dir.path());
        config.health.alert_time_diff_ms = 60_000;
        let h = start(
            &config,
            ResumeState {
                health: HealthState::Healthy,
                metadata_uploaded: true,
            },
            RecordingTransport::default(),
            None,
        );

        let path = dir.path().join("a.raw");
        std::fs::write(&path, b"x").unwrap();
        send(
            &h.sender,
            WatchEvent::Added {
                path: path.clone(),
                stats: FileStats::from_path(&path),
            },
        );
        eventually(|| !h.transport.on_channel("raw_file_added").is_empty()).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.extractor.calls.load(Ordering::SeqCst), 0);

        h.monitor.close().await;
    }

    #[tokio::test]
    async fn test_watch_error_is_fatal() {
        let dir = tempdir().unwrap();
        let config = fast_config(dir.path());
        let h = start(&config, resume(HealthState::Healthy), RecordingTransport::default(), None);

        send(
            &h.sender,
            WatchEvent::Error(WatchError::Backend("device removed".to_string())),
        );
        let result = tokio::time::timeout(Duration::from_secs(2), h.monitor.wait())
            .await
            .unwrap();
        assert!(matches!(result, Err(WatchError::Backend(_))));

        h.monitor.close().await;
        assert!(h.monitor.is_closed());
        // the capability was closed by the adapter
        assert!(h.sender.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_start_fails_when_watch_fails() {
        let dir = tempdir().unwrap();
        let config = fast_config(dir.path());
        let result = Monitor::start(
            &config,
            resume(HealthState::Healthy),
            Collaborators {
                watch: Box::new(FakeWatch {
                    sender: Arc::new(Mutex::new(None)),
                    fail: true,
                }),
                nudge: None,
                transport: Arc::new(RecordingTransport::default()),
                extractor: None,
                status: None,
            },
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_silences_events() {
        let dir = tempdir().unwrap();
        let mut config = fast_config(dir.path());
        config.health.startup_grace = false;
        let h = start(&config, resume(HealthState::Healthy), RecordingTransport::default(), None);

        h.monitor.close().await;
        h.monitor.close().await;
        let before = h.transport.total();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.transport.total(), before);
        assert!(h.monitor.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_publish_failures_do_not_stall_the_machine() {
        let dir = tempdir().unwrap();
        let mut config = fast_config(dir.path());
        config.health.startup_grace = false;
        let h = start(
            &config,
            resume(HealthState::Healthy),
            RecordingTransport {
                fail: true,
                ..Default::default()
            },
            None,
        );

        let mut rx = h.monitor.subscribe();
        tokio::time::timeout(Duration::from_secs(2), async {
            while rx.borrow_and_update().state != HealthState::Alarm {
                rx.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert_eq!(h.monitor.snapshot().state, HealthState::Alarm);

        h.monitor.close().await;
    }
}
