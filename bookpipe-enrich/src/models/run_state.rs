//! Enrichment run state machine
//!
//! A run progresses through:
//! INIT → LOADING_CHECKPOINT → FETCHING → FINALIZING → DONE
//!
//! FETCHING is skipped when nothing is pending, and FETCHING → DONE is the
//! abort path (storage fault or failure-rate threshold exceeded).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Driver state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DriverState {
    Init,
    LoadingCheckpoint,
    Fetching,
    Finalizing,
    Done,
}

impl DriverState {
    /// Whether `self → next` is an edge of the state machine
    pub fn can_transition_to(self, next: DriverState) -> bool {
        use DriverState::*;
        matches!(
            (self, next),
            (Init, LoadingCheckpoint)
                | (LoadingCheckpoint, Fetching)
                | (LoadingCheckpoint, Finalizing)
                | (LoadingCheckpoint, Done)
                | (Fetching, Fetching)
                | (Fetching, Finalizing)
                | (Fetching, Done)
                | (Finalizing, Done)
        )
    }
}

/// State transition record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub run_id: Uuid,
    pub old_state: DriverState,
    pub new_state: DriverState,
    pub transitioned_at: DateTime<Utc>,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every candidate has an `ok` result
    Complete,
    /// Finished, but some items are `not_found` or `error`
    Degraded,
    /// Error rate crossed the configured threshold; no dataset written
    FailureRateExceeded { error_rate: f64, threshold: f64 },
    /// Operator stop; the checkpoint allows resuming
    Interrupted,
}

impl RunOutcome {
    /// Process exit status for this outcome
    pub fn exit_code(&self) -> u8 {
        match self {
            RunOutcome::Complete => 0,
            RunOutcome::Degraded => 2,
            RunOutcome::FailureRateExceeded { .. } => 3,
            RunOutcome::Interrupted => 130,
        }
    }

    pub fn display_string(&self) -> String {
        match self {
            RunOutcome::Complete => "completed".to_string(),
            RunOutcome::Degraded => "completed (degraded)".to_string(),
            RunOutcome::FailureRateExceeded {
                error_rate,
                threshold,
            } => format!(
                "aborted: error rate {:.3} exceeds threshold {:.3}",
                error_rate, threshold
            ),
            RunOutcome::Interrupted => "interrupted (resumable)".to_string(),
        }
    }
}

/// In-memory record of one run's progress through the state machine
#[derive(Debug, Clone)]
pub struct RunSession {
    pub run_id: Uuid,
    pub state: DriverState,
    pub transitions: Vec<StateTransition>,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl RunSession {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            state: DriverState::Init,
            transitions: Vec::new(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Transition to new state
    pub fn transition_to(&mut self, new_state: DriverState) {
        debug_assert!(
            self.state.can_transition_to(new_state),
            "illegal transition {:?} -> {:?}",
            self.state,
            new_state
        );

        let transition = StateTransition {
            run_id: self.run_id,
            old_state: self.state,
            new_state,
            transitioned_at: Utc::now(),
        };
        // The per-key FETCHING self-loop is not worth a log line
        if self.state != new_state {
            tracing::debug!(
                run_id = %self.run_id,
                from = ?self.state,
                to = ?new_state,
                "Driver state transition"
            );
        }
        self.state = new_state;
        if new_state == DriverState::Done {
            self.ended_at = Some(transition.transitioned_at);
        }
        self.transitions.push(transition);
    }

    /// Sequence of distinct states visited, self-loops collapsed
    pub fn visited_states(&self) -> Vec<DriverState> {
        let mut states = vec![DriverState::Init];
        for t in &self.transitions {
            if states.last() != Some(&t.new_state) {
                states.push(t.new_state);
            }
        }
        states
    }
}

impl Default for RunSession {
    fn default() -> Self {
        Self::new()
    }
}
