// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! Job state machine with typed state transitions.
//!
//! Implements the job lifecycle: Pending → Assigned → Running → {Succeeded, Failed, Cancelled}.
//! A retry re-enters Pending under a new attempt number, so the pair
//! `(attempt, state)` never repeats. Invalid transitions result in StateTransitionError.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StateTransitionError;
use crate::result::RunStatus;
use crate::types::JobId;

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting for a worker.
    Pending,

    /// Worker acquired, start sent, runner has not confirmed yet.
    Assigned,

    /// Runner confirmed the start and is executing.
    Running,

    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    /// Get the state name for error messages.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Assigned => "Assigned",
            Self::Running => "Running",
            Self::Succeeded => "Succeeded",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Check if a forward transition (same attempt) to the target state is valid.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        matches!(
            (self, target),
            // From Pending
            (Self::Pending, Self::Assigned) |
            (Self::Pending, Self::Failed) |
            (Self::Pending, Self::Cancelled) |
            // From Assigned
            (Self::Assigned, Self::Running) |
            (Self::Assigned, Self::Failed) |
            (Self::Assigned, Self::Cancelled) |
            // From Running
            (Self::Running, Self::Succeeded) |
            (Self::Running, Self::Failed) |
            (Self::Running, Self::Cancelled)
        )
    }

    /// Terminal status for the result record, if this state is terminal.
    pub fn run_status(&self) -> Option<RunStatus> {
        match self {
            Self::Succeeded => Some(RunStatus::Succeeded),
            Self::Failed => Some(RunStatus::Failed),
            Self::Cancelled => Some(RunStatus::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One entry of a job's transition log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Attempt number the job is in after the transition (1-based).
    pub attempt: u32,
    pub from: JobState,
    pub to: JobState,
    pub at: DateTime<Utc>,
}

/// State machine for a job's lifecycle.
/// Enforces valid transitions and keeps the full transition history.
#[derive(Debug)]
pub struct JobStateMachine {
    job_id: JobId,
    current_state: JobState,
    attempt: u32,
    history: Vec<TransitionRecord>,
}

impl JobStateMachine {
    /// Create a new state machine for a job, in Pending on attempt 1.
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            current_state: JobState::Pending,
            attempt: 1,
            history: Vec::new(),
        }
    }

    /// Get the current state.
    pub fn state(&self) -> JobState {
        self.current_state
    }

    /// Get the current attempt number (1-based).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn history(&self) -> &[TransitionRecord] {
        &self.history
    }

    pub fn is_terminal(&self) -> bool {
        self.current_state.is_terminal()
    }

    /// Attempt to transition to a new state within the current attempt.
    /// Returns Ok(()) if successful, or StateTransitionError if invalid.
    pub fn transition_to(&mut self, target: JobState) -> Result<(), StateTransitionError> {
        self.check_not_terminal()?;

        if !self.current_state.can_transition_to(target) {
            return Err(StateTransitionError::InvalidTransition {
                job_id: self.job_id,
                from: self.current_state.name(),
                to: target.name(),
            });
        }

        self.record(target);
        Ok(())
    }

    /// Re-enter Pending under a new attempt.
    ///
    /// Valid from any non-terminal state; returns the new attempt number.
    pub fn retry(&mut self) -> Result<u32, StateTransitionError> {
        self.check_not_terminal()?;

        self.attempt += 1;
        self.record(JobState::Pending);
        Ok(self.attempt)
    }

    fn check_not_terminal(&self) -> Result<(), StateTransitionError> {
        if self.current_state.is_terminal() {
            return Err(StateTransitionError::TerminalState {
                job_id: self.job_id,
                state: self.current_state.name(),
            });
        }
        Ok(())
    }

    fn record(&mut self, target: JobState) {
        tracing::debug!(
            job_id = %self.job_id,
            attempt = self.attempt,
            from = self.current_state.name(),
            to = target.name(),
            "State transition"
        );

        self.history.push(TransitionRecord {
            attempt: self.attempt,
            from: self.current_state,
            to: target,
            at: Utc::now(),
        });
        self.current_state = target;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initial_state() {
        let sm = JobStateMachine::new(JobId::new());
        assert_eq!(sm.state(), JobState::Pending);
        assert_eq!(sm.attempt(), 1);
        assert!(sm.history().is_empty());
    }

    #[test]
    fn test_happy_path() {
        let mut sm = JobStateMachine::new(JobId::new());

        assert!(sm.transition_to(JobState::Assigned).is_ok());
        assert!(sm.transition_to(JobState::Running).is_ok());
        assert!(sm.transition_to(JobState::Succeeded).is_ok());
        assert!(sm.is_terminal());

        let path: Vec<_> = sm.history().iter().map(|r| r.to).collect();
        assert_eq!(
            path,
            vec![JobState::Assigned, JobState::Running, JobState::Succeeded]
        );
    }

    #[test]
    fn test_invalid_transitions() {
        let mut sm = JobStateMachine::new(JobId::new());

        // Pending → Running skips Assigned
        assert!(sm.transition_to(JobState::Running).is_err());
        // Pending → Succeeded
        assert!(sm.transition_to(JobState::Succeeded).is_err());
        assert_eq!(sm.state(), JobState::Pending);

        sm.transition_to(JobState::Assigned).unwrap();
        // Assigned → Succeeded without a confirmed start
        assert!(sm.transition_to(JobState::Succeeded).is_err());
        // Assigned → Pending only through retry()
        assert!(sm.transition_to(JobState::Pending).is_err());
    }

    #[test]
    fn test_terminal_is_final() {
        let mut sm = JobStateMachine::new(JobId::new());
        sm.transition_to(JobState::Cancelled).unwrap();

        assert!(matches!(
            sm.transition_to(JobState::Assigned),
            Err(StateTransitionError::TerminalState { .. })
        ));
        assert!(sm.retry().is_err());
    }

    #[test]
    fn test_retry_opens_new_attempt() {
        let mut sm = JobStateMachine::new(JobId::new());
        sm.transition_to(JobState::Assigned).unwrap();
        sm.transition_to(JobState::Running).unwrap();

        assert_eq!(sm.retry().unwrap(), 2);
        assert_eq!(sm.state(), JobState::Pending);

        sm.transition_to(JobState::Assigned).unwrap();
        sm.transition_to(JobState::Running).unwrap();
        sm.transition_to(JobState::Failed).unwrap();

        // (attempt, state) pairs never repeat
        let pairs: Vec<_> = sm.history().iter().map(|r| (r.attempt, r.to)).collect();
        let unique: std::collections::HashSet<_> = pairs.iter().collect();
        assert_eq!(pairs.len(), unique.len());
        assert_eq!(pairs[2], (2, JobState::Pending));
    }
}
