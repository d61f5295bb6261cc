//! Types for remote booking sessions.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::run::{BookingJob, Credential, Proxy};

/// Failure classes for remote calls. The recovery layer keys its policy
/// off these variants, so classification happens at the adapter boundary
/// rather than in nested error handling at every call site.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The credential pair itself is bad. Never retried.
    #[error("invalid credentials: {0}")]
    AuthInvalid(String),

    /// The session token is no longer valid; a fresh login may recover.
    #[error("session expired")]
    AuthExpired,

    /// Upstream gateway hiccup (e.g. a 502). Retryable in place.
    #[error("transient upstream fault: {0}")]
    Transient(String),

    /// The remote service rejected the request for a business reason
    /// ("no tickets", invalid input). Surfaced verbatim, never retried.
    #[error("{0}")]
    Business(String),

    /// The remote service demanded a challenge form we cannot answer.
    #[error("unsupported challenge: {0}")]
    ChallengeUnsupported(String),

    /// Anything else on the wire. Terminal.
    #[error("transport error: {0}")]
    Transport(String),
}

impl From<reqwest::Error> for SessionError {
    fn from(e: reqwest::Error) -> Self {
        if e.status().map(|s| s.as_u16() == 502).unwrap_or(false) {
            SessionError::Transient(e.to_string())
        } else {
            SessionError::Transport(e.to_string())
        }
    }
}

/// An interactive proof demanded by the remote service.
#[derive(Debug, Clone)]
pub struct Challenge {
    /// Decoded challenge image bytes.
    pub image: Vec<u8>,
}

/// Result of submitting the reservation form.
#[derive(Debug, Clone)]
pub struct FormOutcome {
    /// Challenge that must be resolved before payment.
    pub challenge: Challenge,
    /// Total collectible amount reported by the service.
    pub amount: f64,
}

/// Result of one challenge verification round.
#[derive(Debug, Clone)]
pub enum ChallengeOutcome {
    Accepted,
    /// Rejected; the service issued a fresh challenge to solve.
    Rejected(Challenge),
}

/// Opaque handle to an initiated payment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentHandle {
    /// Transaction id the run generated for this reservation.
    pub transaction_id: String,
    /// Gateway order id, when the gateway reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
}

/// One settlement poll result.
#[derive(Debug, Clone)]
pub enum Settlement {
    /// Not settled yet; poll again after `retry_after_ms`, giving up
    /// once `timeout_ms` has elapsed overall. Both are remote-reported.
    Pending {
        retry_after_ms: u64,
        timeout_ms: u64,
    },
    Settled {
        /// Confirmation detail, e.g. a reservation reference.
        reference: Option<String>,
    },
    Failed {
        reason: String,
    },
}

/// The ordered multi-step remote transaction, one logical call per
/// workflow transition. Implementations own the per-attempt session
/// state (tokens, rotating anti-forgery value) internally; it dies with
/// the session value.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Full login sequence. Also used for reauthentication.
    async fn login(&self) -> Result<(), SessionError>;

    /// One round trip to the remote time endpoint; returns the
    /// difference between the remote-reported clock and the local clock
    /// at receipt, in milliseconds.
    async fn server_time(&self) -> Result<i64, SessionError>;

    async fn search_trains(&self, job: &BookingJob) -> Result<(), SessionError>;

    async fn check_availability(&self, job: &BookingJob) -> Result<(), SessionError>;

    async fn boarding_stations(&self, job: &BookingJob) -> Result<(), SessionError>;

    /// Submit the reservation form; returns the challenge to resolve
    /// and the collectible amount.
    async fn submit_form(
        &self,
        job: &BookingJob,
        transaction_id: &str,
    ) -> Result<FormOutcome, SessionError>;

    async fn verify_challenge(
        &self,
        transaction_id: &str,
        answer: &str,
    ) -> Result<ChallengeOutcome, SessionError>;

    async fn select_payment(
        &self,
        job: &BookingJob,
        transaction_id: &str,
        amount: f64,
    ) -> Result<PaymentHandle, SessionError>;

    async fn poll_settlement(&self, handle: &PaymentHandle) -> Result<Settlement, SessionError>;
}

/// Builds one session per attempt from its assigned credential and
/// optional egress path.
pub trait SessionFactory: Send + Sync {
    fn create(
        &self,
        credential: &Credential,
        proxy: Option<&Proxy>,
    ) -> Result<Arc<dyn RemoteSession>, SessionError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SessionError::Business("No tickets available".to_string());
        assert_eq!(err.to_string(), "No tickets available");

        let err = SessionError::Transient("502 Bad Gateway".to_string());
        assert_eq!(err.to_string(), "transient upstream fault: 502 Bad Gateway");

        assert_eq!(SessionError::AuthExpired.to_string(), "session expired");
    }

    #[test]
    fn test_payment_handle_serialization() {
        let handle = PaymentHandle {
            transaction_id: "txn-1".to_string(),
            order_id: None,
        };
        let json = serde_json::to_string(&handle).unwrap();
        assert!(!json.contains("order_id"));
        let parsed: PaymentHandle = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.transaction_id, "txn-1");
    }
}
