//! Binary liveness state of the monitored data source.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HealthState {
    #[serde(alias = "healthy", alias = "online", alias = "OK")]
    Healthy,
    #[serde(alias = "alarm", alias = "offline", alias = "ALERT")]
    Alarm,
}

impl HealthState {
    pub fn label(self) -> &'static str {
        match self {
            HealthState::Healthy => "Healthy",
            HealthState::Alarm => "Alarm",
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// A state change produced by one poller evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthTransition {
    pub new_state: HealthState,
    pub prev_state: HealthState,
    pub attempt: u64,
    pub evaluated_at: DateTime<Utc>,
    /// Poll interval that was in effect when the transition was observed.
    pub timeout_ms: u64,
}

/// Point-in-time view of the health machine and poll schedule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSnapshot {
    pub state: HealthState,
    pub entered_at: DateTime<Utc>,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub consecutive_evaluations: u64,
    pub attempt: u64,
    pub current_interval_ms: u64,
    pub last_activity_at: Option<DateTime<Utc>>,
}

/// Two-state machine fed once per poll tick.
///
/// `Healthy -> Alarm` when the source is inactive, `Alarm -> Healthy` when it is
/// active again. Any other input is a self-loop that only refreshes the
/// evaluation bookkeeping and produces no event.
#[derive(Debug, Clone)]
pub struct HealthStateMachine {
    state: HealthState,
    entered_at: DateTime<Utc>,
    last_evaluated_at: Option<DateTime<Utc>>,
    consecutive_evaluations: u64,
}

impl HealthStateMachine {
    pub fn new(initial: HealthState, now: DateTime<Utc>) -> Self {
        Self {
            state: initial,
            entered_at: now,
            last_evaluated_at: None,
            consecutive_evaluations: 0,
        }
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn entered_at(&self) -> DateTime<Utc> {
        self.entered_at
    }

    pub fn last_evaluated_at(&self) -> Option<DateTime<Utc>> {
        self.last_evaluated_at
    }

    /// Evaluations seen since the current state was entered, including the
    /// one that caused the transition.
    pub fn consecutive_evaluations(&self) -> u64 {
        self.consecutive_evaluations
    }

    /// Apply one evaluation result. Returns the transition, if any.
    pub fn evaluate(
        &mut self,
        is_active: bool,
        attempt: u64,
        timeout_ms: u64,
        evaluated_at: DateTime<Utc>,
    ) -> Option<HealthTransition> {
        self.last_evaluated_at = Some(evaluated_at);

        let next = match (self.state, is_active) {
            (HealthState::Healthy, false) => HealthState::Alarm,
            (HealthState::Alarm, true) => HealthState::Healthy,
            (current, _) => current,
        };

        if next == self.state {
            self.consecutive_evaluations += 1;
            return None;
        }

        let prev_state = self.state;
        self.state = next;
        self.entered_at = evaluated_at;
        self.consecutive_evaluations = 1;

        Some(HealthTransition {
            new_state: next,
            prev_state,
            attempt,
            evaluated_at,
            timeout_ms,
        })
    }
}
