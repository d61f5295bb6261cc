//! Status events and errors for supervised runs.

use serde::Serialize;
use thiserror::Error;

use crate::allocator::AllocationError;
use crate::run::RunConfigError;
use crate::session::SessionError;
use crate::workflow::{AttemptError, BookingStep};

/// Reasons a run never launches. Anything past `start` is reported
/// through status events instead.
#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Invalid(#[from] RunConfigError),

    #[error(transparent)]
    Allocation(#[from] AllocationError),

    #[error("session setup failed: {0}")]
    Session(#[from] SessionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventScope {
    Run,
    Attempt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One progress or outcome notification. Events for a given attempt
/// arrive in the order the attempt produced them.
#[derive(Debug, Clone, Serialize)]
pub struct StatusEvent {
    pub scope: EventScope,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_index: Option<usize>,
    pub severity: Severity,
    pub message: String,
    /// Stable tag present on terminal attempt failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_class: Option<&'static str>,
    /// Confirmation reference present on settled attempts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

impl StatusEvent {
    pub fn run(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            scope: EventScope::Run,
            attempt_id: None,
            job_index: None,
            severity,
            message: message.into(),
            failure_class: None,
            reference: None,
        }
    }

    pub fn step(attempt_id: usize, job_index: usize, step: BookingStep) -> Self {
        Self {
            scope: EventScope::Attempt,
            attempt_id: Some(attempt_id),
            job_index: Some(job_index),
            severity: Severity::Info,
            message: step.as_str().to_string(),
            failure_class: None,
            reference: None,
        }
    }

    pub fn settled(attempt_id: usize, job_index: usize, reference: Option<String>) -> Self {
        Self {
            scope: EventScope::Attempt,
            attempt_id: Some(attempt_id),
            job_index: Some(job_index),
            severity: Severity::Info,
            message: "booked".to_string(),
            failure_class: None,
            reference,
        }
    }

    pub fn failed(attempt_id: usize, job_index: usize, err: &AttemptError) -> Self {
        let severity = if matches!(err, AttemptError::Cancelled) {
            Severity::Warning
        } else {
            Severity::Error
        };
        Self {
            scope: EventScope::Attempt,
            attempt_id: Some(attempt_id),
            job_index: Some(job_index),
            severity,
            message: err.to_string(),
            failure_class: Some(err.failure_class()),
            reference: None,
        }
    }

    /// Whether this is the final event an attempt emits.
    pub fn is_attempt_terminal(&self) -> bool {
        self.scope == EventScope::Attempt
            && (self.failure_class.is_some() || self.message == "booked")
    }

    /// Whether this is the run's own terminal event. Its message names
    /// the run outcome.
    pub fn is_run_terminal(&self) -> bool {
        self.scope == EventScope::Run
            && matches!(self.message.as_str(), "completed" | "cancelled")
    }
}
