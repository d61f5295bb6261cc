//! The per-attempt booking state machine.
//!
//! One engine instance drives one attempt end to end: clock sync,
//! window guards, the timed waits, every remote step with recovery, the
//! challenge loop and the settlement poll. Cancellation is checked at
//! every suspension point; there is no backtracking between steps.

mod types;

pub use types::{AttemptError, BookingStep};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::cancel::CancelToken;
use crate::clock;
use crate::resilience::{recover, RecoveryPolicy};
use crate::run::BookingJob;
use crate::schedule::{self, TimingConfig};
use crate::session::{ChallengeOutcome, RemoteSession, SessionError, Settlement};
use crate::solver::ChallengeSolver;

/// Race a step against cancellation.
async fn guarded<T, Fut>(cancel: &CancelToken, fut: Fut) -> Result<T, AttemptError>
where
    Fut: Future<Output = Result<T, AttemptError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AttemptError::Cancelled),
        result = fut => result,
    }
}

pub struct WorkflowEngine {
    session: Arc<dyn RemoteSession>,
    solver: Arc<dyn ChallengeSolver>,
    policy: RecoveryPolicy,
    timing: TimingConfig,
}

impl WorkflowEngine {
    pub fn new(
        session: Arc<dyn RemoteSession>,
        solver: Arc<dyn ChallengeSolver>,
        policy: RecoveryPolicy,
        timing: TimingConfig,
    ) -> Self {
        Self {
            session,
            solver,
            policy,
            timing,
        }
    }

    /// One remote step: recovery inside, cancellation outside.
    async fn remote<T, F, Fut>(
        &self,
        cancel: &CancelToken,
        op: &'static str,
        f: F,
    ) -> Result<T, AttemptError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SessionError>>,
    {
        guarded(cancel, async {
            recover(&self.policy, self.session.as_ref(), op, f)
                .await
                .map_err(|source| AttemptError::Session { op, source })
        })
        .await
    }

    async fn pause(&self, cancel: &CancelToken, duration: Duration) -> Result<(), AttemptError> {
        if duration.is_zero() {
            return Ok(());
        }
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(AttemptError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Drive the attempt to settlement. Returns the confirmation
    /// reference when the gateway reports one.
    pub async fn run(
        &self,
        job: &BookingJob,
        test_time: Option<DateTime<Utc>>,
        transaction_id: &str,
        cancel: &CancelToken,
        on_step: &(dyn Fn(BookingStep) + Send + Sync),
    ) -> Result<Option<String>, AttemptError> {
        on_step(BookingStep::Init);

        let server_clock = guarded(cancel, async {
            clock::measure(self.session.as_ref())
                .await
                .map_err(|source| AttemptError::Session {
                    op: "server_time",
                    source,
                })
        })
        .await?;

        let window = schedule::resolve_window(job, test_time, &self.timing, &server_clock);
        if let Some(window) = &window {
            schedule::check_guards(window, server_clock.now(), &self.timing)?;
            debug!(
                opens_at = %window.opens_at,
                offset_ms = server_clock.offset_ms(),
                "window resolved, waiting for authentication slot"
            );
            if !schedule::wait_until(&server_clock, window.auth_at, cancel).await {
                return Err(AttemptError::Cancelled);
            }
        }

        self.remote(cancel, "login", || self.session.login()).await?;
        on_step(BookingStep::Authenticated);

        self.remote(cancel, "search_trains", || self.session.search_trains(job))
            .await?;
        on_step(BookingStep::TrainsSearched);

        if let Some(window) = &window {
            if !schedule::wait_until(&server_clock, window.submit_at, cancel).await {
                return Err(AttemptError::Cancelled);
            }
        }

        self.remote(cancel, "check_availability", || {
            self.session.check_availability(job)
        })
        .await?;
        on_step(BookingStep::AvailabilityChecked);

        self.remote(cancel, "boarding_stations", || {
            self.session.boarding_stations(job)
        })
        .await?;
        on_step(BookingStep::BoardingSelected);

        // Mimic human form-fill cadence; submitting instantly trips the
        // service's bot heuristics.
        let delay = schedule::form_fill_delay(&self.timing, job.passengers.len());
        self.pause(cancel, delay).await?;

        let form = self
            .remote(cancel, "submit_form", || {
                self.session.submit_form(job, transaction_id)
            })
            .await?;
        on_step(BookingStep::FormSubmitted);

        let mut challenge = form.challenge;
        loop {
            if cancel.is_cancelled() {
                return Err(AttemptError::Cancelled);
            }
            let answer = guarded(cancel, async {
                self.solver
                    .solve(&challenge.image)
                    .await
                    .map_err(AttemptError::from)
            })
            .await?;
            match self
                .remote(cancel, "verify_challenge", || {
                    self.session.verify_challenge(transaction_id, &answer)
                })
                .await?
            {
                ChallengeOutcome::Accepted => break,
                ChallengeOutcome::Rejected(next) => {
                    warn!("challenge answer rejected, solving the fresh one");
                    challenge = next;
                }
            }
        }
        on_step(BookingStep::ChallengeResolved);

        let handle = self
            .remote(cancel, "select_payment", || {
                self.session.select_payment(job, transaction_id, form.amount)
            })
            .await?;
        on_step(BookingStep::PaymentSelected);

        let started = tokio::time::Instant::now();
        let mut concluding = false;
        let reference = loop {
            match self
                .remote(cancel, "poll_settlement", || {
                    self.session.poll_settlement(&handle)
                })
                .await?
            {
                Settlement::Settled { reference } => break reference,
                Settlement::Failed { reason } => {
                    return Err(AttemptError::SettlementFailed(reason))
                }
                Settlement::Pending {
                    retry_after_ms,
                    timeout_ms,
                } => {
                    if concluding {
                        return Err(AttemptError::SettlementTimeout);
                    }
                    if started.elapsed() >= Duration::from_millis(timeout_ms) {
                        // The gateway gets one concluding status fetch
                        // past its deadline; a payment approved at the
                        // wire must not be reported as a failure.
                        warn!(transaction_id, "settlement deadline passed, fetching final status");
                        concluding = true;
                        continue;
                    }
                    self.pause(cancel, Duration::from_millis(retry_after_ms))
                        .await?;
                }
            }
        };
        on_step(BookingStep::PaymentSettled);
        info!(transaction_id, "attempt settled");
        Ok(reference)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSource;
    use crate::run::{PaymentMethod, Quota, TravelClass};
    use crate::session::DryRunSession;
    use crate::solver::StaticSolver;
    use chrono::{Duration as ChronoDuration, NaiveDate};
    use std::sync::Mutex;

    fn job() -> BookingJob {
        BookingJob {
            origin: "NDLS".to_string(),
            destination: "BCT".to_string(),
            date: NaiveDate::from_ymd_opt(2026, 9, 15).unwrap(),
            train: "12952".to_string(),
            travel_class: TravelClass::Sleeper,
            quota: Quota::General,
            payment: PaymentMethod::UpiCollect,
            payment_target: Some("someone@upi".to_string()),
            contact: "9999999999".to_string(),
            passengers: Vec::new(),
            open_time_override: None,
            attempt_count: None,
        }
    }

    fn engine(session: Arc<DryRunSession>) -> WorkflowEngine {
        WorkflowEngine::new(
            session,
            Arc::new(StaticSolver::new("1234")),
            RecoveryPolicy::default(),
            TimingConfig::default(),
        )
    }

    async fn drive(
        session: Arc<DryRunSession>,
        job: &BookingJob,
    ) -> (Result<Option<String>, AttemptError>, Vec<BookingStep>) {
        let engine = engine(session);
        let (_source, token) = CancelSource::new();
        let steps = Mutex::new(Vec::new());
        let result = engine
            .run(job, None, "txn-1", &token, &|step| {
                steps.lock().unwrap().push(step)
            })
            .await;
        (result, steps.into_inner().unwrap())
    }

    #[tokio::test]
    async fn test_happy_path_runs_steps_in_order() {
        let session = Arc::new(DryRunSession::new());
        let (result, steps) = drive(session.clone(), &job()).await;
        assert_eq!(result.unwrap(), Some("DRY0000000".to_string()));
        assert_eq!(
            steps,
            vec![
                BookingStep::Init,
                BookingStep::Authenticated,
                BookingStep::TrainsSearched,
                BookingStep::AvailabilityChecked,
                BookingStep::BoardingSelected,
                BookingStep::FormSubmitted,
                BookingStep::ChallengeResolved,
                BookingStep::PaymentSelected,
                BookingStep::PaymentSettled,
            ]
        );
        assert_eq!(
            session.calls(),
            vec![
                "server_time",
                "login",
                "search_trains",
                "check_availability",
                "boarding_stations",
                "submit_form",
                "verify_challenge",
                "select_payment",
                "poll_settlement",
            ]
        );
    }

    #[tokio::test]
    async fn test_challenge_loop_repeats_until_accepted() {
        let session = Arc::new(DryRunSession::new().reject_challenges(2));
        let (result, _) = drive(session.clone(), &job()).await;
        assert!(result.is_ok());
        assert_eq!(session.call_count("verify_challenge"), 3);
    }

    #[tokio::test]
    async fn test_business_rejection_is_terminal() {
        let session = Arc::new(
            DryRunSession::new().fail(
                "check_availability",
                SessionError::Business("No tickets available".to_string()),
            ),
        );
        let (result, steps) = drive(session.clone(), &job()).await;
        let err = result.unwrap_err();
        assert_eq!(err.failure_class(), "business");
        assert_eq!(*steps.last().unwrap(), BookingStep::TrainsSearched);
        assert_eq!(session.call_count("submit_form"), 0);
        // Terminal on the first rejection.
        assert_eq!(session.call_count("check_availability"), 1);
    }

    #[tokio::test]
    async fn test_transient_budget_exhaustion() {
        let mut session = DryRunSession::new();
        for _ in 0..6 {
            session = session.fail(
                "search_trains",
                SessionError::Transient("502".to_string()),
            );
        }
        let session = Arc::new(session);
        let (result, _) = drive(session.clone(), &job()).await;
        assert_eq!(result.unwrap_err().failure_class(), "transient_exhausted");
        assert_eq!(session.call_count("search_trains"), 6);
    }

    #[tokio::test]
    async fn test_expired_session_reauthenticates_once() {
        let session =
            Arc::new(DryRunSession::new().fail("boarding_stations", SessionError::AuthExpired));
        let (result, _) = drive(session.clone(), &job()).await;
        assert!(result.is_ok());
        assert_eq!(session.login_count(), 2);
        assert_eq!(session.call_count("boarding_stations"), 2);
    }

    #[tokio::test]
    async fn test_cancellation_short_circuits() {
        let session = Arc::new(DryRunSession::new());
        let engine = engine(session.clone());
        let (source, token) = CancelSource::new();
        source.cancel();
        let result = engine.run(&job(), None, "txn-1", &token, &|_| {}).await;
        assert!(matches!(result, Err(AttemptError::Cancelled)));
        assert_eq!(session.call_count("login"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settlement_polls_until_settled() {
        let session = Arc::new(DryRunSession::new().pending_polls(2));
        let (result, _) = drive(session.clone(), &job()).await;
        assert!(result.is_ok());
        assert_eq!(session.call_count("poll_settlement"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settlement_timeout() {
        let session = Arc::new(DryRunSession::new().pending_polls(10_000));
        let (result, _) = drive(session.clone(), &job()).await;
        assert_eq!(result.unwrap_err().failure_class(), "settlement_timeout");
        // 500 in-budget waits, the poll that crossed the deadline, then
        // the concluding status fetch.
        assert_eq!(session.call_count("poll_settlement"), 502);
    }

    #[tokio::test(start_paused = true)]
    async fn test_settlement_approved_at_the_deadline_still_books() {
        // Pending through the whole budget; the concluding status fetch
        // past the deadline reports the payment settled.
        let session = Arc::new(DryRunSession::new().pending_polls(501));
        let (result, steps) = drive(session.clone(), &job()).await;
        assert_eq!(result.unwrap(), Some("DRY0000000".to_string()));
        assert_eq!(*steps.last().unwrap(), BookingStep::PaymentSettled);
        assert_eq!(session.call_count("poll_settlement"), 502);
    }

    #[tokio::test]
    async fn test_guard_refuses_stale_window() {
        let mut stale = job();
        stale.open_time_override = Some(Utc::now() - ChronoDuration::minutes(30));
        let session = Arc::new(DryRunSession::new());
        let (result, _) = drive(session.clone(), &stale).await;
        assert_eq!(result.unwrap_err().failure_class(), "too_late");
        assert_eq!(session.call_count("login"), 0);
    }

    #[tokio::test]
    async fn test_guard_refuses_distant_window() {
        let mut early = job();
        early.open_time_override = Some(Utc::now() + ChronoDuration::hours(2));
        let session = Arc::new(DryRunSession::new());
        let (result, _) = drive(session.clone(), &early).await;
        assert_eq!(result.unwrap_err().failure_class(), "too_early");
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_waits_are_honored() {
        let mut windowed = job();
        windowed.open_time_override = Some(Utc::now() + ChronoDuration::seconds(30));
        let session = Arc::new(DryRunSession::new());
        let (result, _) = drive(session.clone(), &windowed).await;
        assert!(result.is_ok());
    }
}
