//! Step and error types for one booking attempt.

use serde::Serialize;
use thiserror::Error;

use crate::schedule::ScheduleError;
use crate::session::SessionError;
use crate::solver::SolverError;

/// The linear progression of one attempt. There is no backtracking; a
/// failed step ends the attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStep {
    Init,
    Authenticated,
    TrainsSearched,
    AvailabilityChecked,
    BoardingSelected,
    FormSubmitted,
    ChallengeResolved,
    PaymentSelected,
    PaymentSettled,
}

impl BookingStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStep::Init => "init",
            BookingStep::Authenticated => "authenticated",
            BookingStep::TrainsSearched => "trains_searched",
            BookingStep::AvailabilityChecked => "availability_checked",
            BookingStep::BoardingSelected => "boarding_selected",
            BookingStep::FormSubmitted => "form_submitted",
            BookingStep::ChallengeResolved => "challenge_resolved",
            BookingStep::PaymentSelected => "payment_selected",
            BookingStep::PaymentSettled => "payment_settled",
        }
    }
}

/// Terminal outcome of a failed attempt.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error(transparent)]
    Timing(#[from] ScheduleError),

    #[error("{op} failed: {source}")]
    Session {
        op: &'static str,
        #[source]
        source: SessionError,
    },

    #[error(transparent)]
    Solver(#[from] SolverError),

    #[error("attempt cancelled")]
    Cancelled,

    #[error("payment not settled within the gateway deadline")]
    SettlementTimeout,

    #[error("payment failed: {0}")]
    SettlementFailed(String),
}

impl AttemptError {
    /// Stable tag describing why the attempt ended, for status events
    /// and metrics labels.
    pub fn failure_class(&self) -> &'static str {
        match self {
            AttemptError::Timing(ScheduleError::TooEarly { .. }) => "too_early",
            AttemptError::Timing(ScheduleError::TooLate) => "too_late",
            AttemptError::Session { source, .. } => match source {
                SessionError::AuthInvalid(_) => "auth_invalid",
                SessionError::AuthExpired => "auth_expired",
                SessionError::Transient(_) => "transient_exhausted",
                SessionError::Business(_) => "business",
                SessionError::ChallengeUnsupported(_) => "challenge_unsupported",
                SessionError::Transport(_) => "transport",
            },
            AttemptError::Solver(_) => "solver",
            AttemptError::Cancelled => "cancelled",
            AttemptError::SettlementTimeout => "settlement_timeout",
            AttemptError::SettlementFailed(_) => "settlement_failed",
        }
    }
}
