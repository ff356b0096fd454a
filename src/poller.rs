use crate::clock::ActivityClock;
use crate::health::{HealthSnapshot, HealthState, HealthStateMachine, HealthTransition};
use crate::watch::DirectoryNudge;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Calculate the poll interval after `unhealthy_streak` consecutive inactive ticks.
///
/// Returns `min * 2^unhealthy_streak`, capped at `max` and never below `min`.
pub fn backoff_interval(min: Duration, unhealthy_streak: u32, max: Duration) -> Duration {
    let min_ms = min.as_millis().min(u64::MAX as u128) as u64;
    let max_ms = max.as_millis().min(u64::MAX as u128) as u64;
    let shift = 1u64.checked_shl(unhealthy_streak).unwrap_or(u64::MAX);
    let interval = min_ms.saturating_mul(shift);
    Duration::from_millis(interval.min(max_ms).max(min_ms))
}

/// Cadence of the health poller.
///
/// Tracks the tick counter and how long the source has been inactive, and
/// decides how long to wait before the next evaluation.
#[derive(Debug, Clone)]
pub struct PollSchedule {
    min_interval: Duration,
    max_interval: Duration,
    current_interval: Duration,
    attempt: u64,
    unhealthy_streak: u32,
}

impl PollSchedule {
    /// Create a schedule. A `max` below `min` is raised to `min`.
    pub fn new(min_interval: Duration, max_interval: Duration) -> Self {
        let max_interval = max_interval.max(min_interval);
        Self {
            min_interval,
            max_interval,
            current_interval: min_interval,
            attempt: 0,
            unhealthy_streak: 0,
        }
    }

    /// Start a new tick and return its 1-based attempt number.
    pub fn next_attempt(&mut self) -> u64 {
        self.attempt += 1;
        self.attempt
    }

    /// Record the outcome of the current tick and return the delay before the next.
    ///
    /// Inactive ticks double the interval up to `max_interval`; an active tick
    /// drops straight back to `min_interval`.
    pub fn advance(&mut self, is_active: bool) -> Duration {
        if is_active {
            self.unhealthy_streak = 0;
            self.current_interval = self.min_interval;
        } else {
            self.unhealthy_streak = self.unhealthy_streak.saturating_add(1);
            self.current_interval =
                backoff_interval(self.min_interval, self.unhealthy_streak, self.max_interval);
        }
        self.current_interval
    }

    pub fn current_interval(&self) -> Duration {
        self.current_interval
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    #[cfg(test)]
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    #[cfg(test)]
    pub fn max_interval(&self) -> Duration {
        self.max_interval
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PollerConfig {
    pub min_interval: Duration,
    pub max_interval: Duration,
    /// Inactivity after which the source is considered dead.
    pub alert_time_diff: Duration,
}

struct PollerState {
    machine: HealthStateMachine,
    schedule: PollSchedule,
    /// Last-activity value the most recent nudge was issued for.
    nudged_for: Option<Option<DateTime<Utc>>>,
}

struct PollerInner {
    config: PollerConfig,
    clock: ActivityClock,
    state: Mutex<PollerState>,
    transitions: mpsc::UnboundedSender<HealthTransition>,
    snapshot: watch::Sender<HealthSnapshot>,
    nudge: Option<Arc<dyn DirectoryNudge>>,
    stopped: AtomicBool,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Timer loop that evaluates liveness and drives the health state machine.
///
/// Cloning yields another handle to the same poller.
#[derive(Clone)]
pub struct AdaptiveHealthPoller {
    inner: Arc<PollerInner>,
}

impl AdaptiveHealthPoller {
    pub fn new(
        config: PollerConfig,
        clock: ActivityClock,
        initial: HealthState,
        transitions: mpsc::UnboundedSender<HealthTransition>,
        nudge: Option<Arc<dyn DirectoryNudge>>,
    ) -> Self {
        let now = Utc::now();
        let machine = HealthStateMachine::new(initial, now);
        let schedule = PollSchedule::new(config.min_interval, config.max_interval);
        let snapshot = build_snapshot(&machine, &schedule, clock.last_activity_at());
        let (snapshot_tx, _) = watch::channel(snapshot);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(PollerInner {
                config,
                clock,
                state: Mutex::new(PollerState {
                    machine,
                    schedule,
                    nudged_for: None,
                }),
                transitions,
                snapshot: snapshot_tx,
                nudge,
                stopped: AtomicBool::new(false),
                shutdown: shutdown_tx,
                handle: Mutex::new(None),
            }),
        }
    }

    /// Start the loop. The first evaluation runs immediately. Calling this on a
    /// running or stopped poller does nothing.
    pub fn perform(&self) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            tracing::debug!("poller already stopped, not starting");
            return;
        }
        let mut handle = self.inner.handle.lock().unwrap_or_else(|p| p.into_inner());
        if handle.is_some() {
            return;
        }

        let poller = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        *handle = Some(tokio::spawn(async move {
            loop {
                if poller.inner.stopped.load(Ordering::SeqCst) {
                    break;
                }
                let interval = poller.tick(Utc::now());
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => break,
                }
            }
            tracing::debug!("health poller stopped");
        }));
    }

    /// Cancel the loop. Idempotent and safe before `perform`; a tick already in
    /// flight finishes without emitting.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.send_replace(true);
        let handle = self
            .inner
            .handle
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    #[cfg(test)]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Run one evaluation at `now` and return the delay before the next one.
    pub fn tick(&self, now: DateTime<Utc>) -> Duration {
        let inner = &self.inner;
        let mut state = inner.state.lock().unwrap_or_else(|p| p.into_inner());
        // A stopped poller leaves state and schedule untouched.
        if inner.stopped.load(Ordering::SeqCst) {
            return state.schedule.current_interval();
        }

        let since = inner.clock.since_last_activity(now);
        let is_active = inner.clock.is_active(now, inner.config.alert_time_diff);

        let attempt = state.schedule.next_attempt();
        let timeout_ms = state.schedule.current_interval().as_millis() as u64;

        tracing::debug!(
            attempt,
            since_last_activity_ms = since.map(|d| d.as_millis() as u64),
            is_active,
            "health evaluation"
        );

        let transition = state.machine.evaluate(is_active, attempt, timeout_ms, now);
        let next = state.schedule.advance(is_active);

        let stale = since.map_or(true, |elapsed| elapsed >= inner.config.max_interval);
        let last_activity = inner.clock.last_activity_at();
        let should_nudge = stale && state.nudged_for != Some(last_activity);
        if should_nudge {
            state.nudged_for = Some(last_activity);
        }

        inner.snapshot.send_replace(build_snapshot(
            &state.machine,
            &state.schedule,
            last_activity,
        ));
        drop(state);

        if inner.stopped.load(Ordering::SeqCst) {
            return next;
        }

        if let Some(transition) = transition {
            tracing::info!(
                state = %transition.new_state,
                prev_state = %transition.prev_state,
                attempt,
                "health state changed"
            );
            let _ = inner.transitions.send(transition);
        }

        if should_nudge {
            if let Some(nudge) = inner.nudge.clone() {
                spawn_nudge(nudge);
            }
        }

        next
    }

    #[cfg(test)]
    pub fn snapshot(&self) -> HealthSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<HealthSnapshot> {
        self.inner.snapshot.subscribe()
    }
}

fn build_snapshot(
    machine: &HealthStateMachine,
    schedule: &PollSchedule,
    last_activity_at: Option<DateTime<Utc>>,
) -> HealthSnapshot {
    HealthSnapshot {
        state: machine.state(),
        entered_at: machine.entered_at(),
        last_evaluated_at: machine.last_evaluated_at(),
        consecutive_evaluations: machine.consecutive_evaluations(),
        attempt: schedule.attempt(),
        current_interval_ms: schedule.current_interval().as_millis() as u64,
        last_activity_at,
    }
}

/// Refresh the folder off the poll loop; failures are only logged.
fn spawn_nudge(nudge: Arc<dyn DirectoryNudge>) {
    tokio::task::spawn_blocking(move || match nudge.nudge() {
        Ok(entries) => tracing::debug!(entries, "refreshed watched folder"),
        Err(e) => tracing::warn!(error = %e, "failed to refresh watched folder"),
    });
}
