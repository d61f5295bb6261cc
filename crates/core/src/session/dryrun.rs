//! Scripted in-memory session.
//!
//! Backs the `dry_run` backend so a full run can be rehearsed without
//! touching the live service, and doubles as the fake that recovery,
//! workflow and supervisor tests drive.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::run::{BookingJob, Credential, Proxy};

use super::types::{
    Challenge, ChallengeOutcome, FormOutcome, PaymentHandle, RemoteSession, SessionError,
    SessionFactory, Settlement,
};

#[derive(Default)]
struct Script {
    /// Errors to serve per operation, popped front first. Once a queue
    /// drains the operation succeeds.
    errors: HashMap<&'static str, VecDeque<SessionError>>,
    /// Operations that never complete (the call is recorded first).
    stalls: HashSet<&'static str>,
    /// Challenge rounds rejected before one is accepted.
    verify_rejections: usize,
    /// Settlement polls answered `Pending` before one settles.
    pending_polls: usize,
}

/// A session whose behavior is fully scripted up front. Every call is
/// recorded, so tests can assert on call order and retry counts.
pub struct DryRunSession {
    script: Mutex<Script>,
    calls: Mutex<Vec<&'static str>>,
    logins: AtomicUsize,
    clock_skew_ms: i64,
    amount: f64,
}

impl Default for DryRunSession {
    fn default() -> Self {
        Self::new()
    }
}

impl DryRunSession {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(Script::default()),
            calls: Mutex::new(Vec::new()),
            logins: AtomicUsize::new(0),
            clock_skew_ms: 0,
            amount: 1250.0,
        }
    }

    /// Queue an error for one operation. Repeated calls stack.
    pub fn fail(self, op: &'static str, err: SessionError) -> Self {
        self.script
            .lock()
            .unwrap()
            .errors
            .entry(op)
            .or_default()
            .push_back(err);
        self
    }

    /// Reject the first `n` challenge answers before accepting one.
    pub fn reject_challenges(self, n: usize) -> Self {
        self.script.lock().unwrap().verify_rejections = n;
        self
    }

    /// Answer the first `n` settlement polls with `Pending`.
    pub fn pending_polls(self, n: usize) -> Self {
        self.script.lock().unwrap().pending_polls = n;
        self
    }

    /// Make one operation hang forever once reached. The call is still
    /// recorded, so tests can cancel at a known point.
    pub fn stall(self, op: &'static str) -> Self {
        self.script.lock().unwrap().stalls.insert(op);
        self
    }

    pub fn with_clock_skew_ms(mut self, skew: i64) -> Self {
        self.clock_skew_ms = skew;
        self
    }

    /// Operations invoked so far, in order.
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, op: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| **c == op).count()
    }

    pub fn login_count(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    async fn record(&self, op: &'static str) -> Result<(), SessionError> {
        self.calls.lock().unwrap().push(op);
        let stalled = {
            let mut script = self.script.lock().unwrap();
            if !script.stalls.contains(op) {
                if let Some(queue) = script.errors.get_mut(op) {
                    if let Some(err) = queue.pop_front() {
                        return Err(err);
                    }
                }
                false
            } else {
                true
            }
        };
        if stalled {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSession for DryRunSession {
    fn name(&self) -> &str {
        "dry_run"
    }

    async fn login(&self) -> Result<(), SessionError> {
        self.logins.fetch_add(1, Ordering::SeqCst);
        self.record("login").await
    }

    async fn server_time(&self) -> Result<i64, SessionError> {
        self.record("server_time").await?;
        Ok(self.clock_skew_ms)
    }

    async fn search_trains(&self, _job: &BookingJob) -> Result<(), SessionError> {
        self.record("search_trains").await
    }

    async fn check_availability(&self, _job: &BookingJob) -> Result<(), SessionError> {
        self.record("check_availability").await
    }

    async fn boarding_stations(&self, _job: &BookingJob) -> Result<(), SessionError> {
        self.record("boarding_stations").await
    }

    async fn submit_form(
        &self,
        _job: &BookingJob,
        _transaction_id: &str,
    ) -> Result<FormOutcome, SessionError> {
        self.record("submit_form").await?;
        Ok(FormOutcome {
            challenge: Challenge {
                image: b"dry-run-challenge".to_vec(),
            },
            amount: self.amount,
        })
    }

    async fn verify_challenge(
        &self,
        _transaction_id: &str,
        _answer: &str,
    ) -> Result<ChallengeOutcome, SessionError> {
        self.record("verify_challenge").await?;
        let mut script = self.script.lock().unwrap();
        if script.verify_rejections > 0 {
            script.verify_rejections -= 1;
            return Ok(ChallengeOutcome::Rejected(Challenge {
                image: b"dry-run-challenge-again".to_vec(),
            }));
        }
        Ok(ChallengeOutcome::Accepted)
    }

    async fn select_payment(
        &self,
        _job: &BookingJob,
        transaction_id: &str,
        _amount: f64,
    ) -> Result<PaymentHandle, SessionError> {
        self.record("select_payment").await?;
        Ok(PaymentHandle {
            transaction_id: transaction_id.to_string(),
            order_id: Some("dry-run-order".to_string()),
        })
    }

    async fn poll_settlement(&self, _handle: &PaymentHandle) -> Result<Settlement, SessionError> {
        self.record("poll_settlement").await?;
        let mut script = self.script.lock().unwrap();
        if script.pending_polls > 0 {
            script.pending_polls -= 1;
            return Ok(Settlement::Pending {
                retry_after_ms: 10,
                timeout_ms: 5_000,
            });
        }
        Ok(Settlement::Settled {
            reference: Some("DRY0000000".to_string()),
        })
    }
}

/// Hands out plain always-succeeding sessions, one per attempt.
pub struct DryRunSessionFactory;

impl SessionFactory for DryRunSessionFactory {
    fn create(
        &self,
        _credential: &Credential,
        _proxy: Option<&Proxy>,
    ) -> Result<Arc<dyn RemoteSession>, SessionError> {
        Ok(Arc::new(DryRunSession::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_errors_drain_in_order() {
        let session = DryRunSession::new()
            .fail("login", SessionError::Transient("first".to_string()))
            .fail("login", SessionError::Transient("second".to_string()));

        match session.login().await {
            Err(SessionError::Transient(msg)) => assert_eq!(msg, "first"),
            other => panic!("unexpected: {:?}", other),
        }
        match session.login().await {
            Err(SessionError::Transient(msg)) => assert_eq!(msg, "second"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(session.login().await.is_ok());
        assert_eq!(session.login_count(), 3);
    }

    #[tokio::test]
    async fn test_challenge_rejections_then_accept() {
        let session = DryRunSession::new().reject_challenges(2);
        for _ in 0..2 {
            match session.verify_challenge("t", "a").await.unwrap() {
                ChallengeOutcome::Rejected(c) => assert!(!c.image.is_empty()),
                ChallengeOutcome::Accepted => panic!("accepted too early"),
            }
        }
        assert!(matches!(
            session.verify_challenge("t", "a").await.unwrap(),
            ChallengeOutcome::Accepted
        ));
        assert_eq!(session.call_count("verify_challenge"), 3);
    }

    #[tokio::test]
    async fn test_settlement_pending_then_settled() {
        let session = DryRunSession::new().pending_polls(1);
        assert!(matches!(
            session.poll_settlement(&handle()).await.unwrap(),
            Settlement::Pending { .. }
        ));
        assert!(matches!(
            session.poll_settlement(&handle()).await.unwrap(),
            Settlement::Settled { .. }
        ));
    }

    fn handle() -> PaymentHandle {
        PaymentHandle {
            transaction_id: "t".to_string(),
            order_id: None,
        }
    }
}
