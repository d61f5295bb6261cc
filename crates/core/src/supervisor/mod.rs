//! Run supervision.
//!
//! Validates and allocates a run, spawns one task per attempt and fans
//! their status events into a single ordered stream. The supervisor
//! never aborts tasks; cancellation is cooperative through the shared
//! token, and even cancelled attempts emit their terminal event.

mod types;

pub use types::{EventScope, Severity, StartError, StatusEvent};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::allocator::{allocate, AttemptAssignment};
use crate::cancel::{CancelSource, CancelToken};
use crate::resilience::RecoveryPolicy;
use crate::run::{validate_run_config, RunConfig};
use crate::schedule::TimingConfig;
use crate::session::SessionFactory;
use crate::solver::ChallengeSolver;
use crate::workflow::WorkflowEngine;

pub struct Supervisor;

impl Supervisor {
    /// Validate, allocate and launch a run. Fails fast on anything
    /// wrong with the configuration; once this returns, all outcomes
    /// flow through the handle's event stream.
    pub fn start(
        config: RunConfig,
        factory: Arc<dyn SessionFactory>,
        solver: Arc<dyn ChallengeSolver>,
        policy: RecoveryPolicy,
        timing: TimingConfig,
    ) -> Result<RunHandle, StartError> {
        validate_run_config(&config)?;
        let allocation = allocate(&config)?;

        // Sessions are built up front so a bad proxy or credential
        // surfaces before any task launches.
        let mut prepared = Vec::with_capacity(allocation.assignments.len());
        for assignment in &allocation.assignments {
            let session = factory.create(&assignment.credential, assignment.proxy.as_ref())?;
            prepared.push((assignment.clone(), session));
        }

        let run_id = Uuid::new_v4();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (cancel_source, cancel_token) = CancelSource::new();
        let live = Arc::new(AtomicUsize::new(prepared.len()));

        info!(
            %run_id,
            attempts = prepared.len(),
            jobs = config.jobs.len(),
            "launching booking run"
        );
        if let Some(clamp) = allocation.clamped {
            let _ = events_tx.send(StatusEvent::run(
                Severity::Warning,
                format!(
                    "requested {} attempts, credentials support {}",
                    clamp.requested, clamp.possible
                ),
            ));
        }

        let mut attempts = Vec::with_capacity(prepared.len());
        for (assignment, session) in prepared {
            let engine = WorkflowEngine::new(session, solver.clone(), policy, timing.clone());
            attempts.push(spawn_attempt(
                engine,
                assignment,
                config.test_time,
                cancel_token.clone(),
                events_tx.clone(),
                live.clone(),
            ));
        }

        let watcher = spawn_watcher(run_id, attempts, cancel_token, events_tx, live.clone());

        Ok(RunHandle {
            run_id,
            events: events_rx,
            cancel: cancel_source,
            live,
            watcher,
        })
    }
}

fn spawn_attempt(
    engine: WorkflowEngine,
    assignment: AttemptAssignment,
    test_time: Option<chrono::DateTime<chrono::Utc>>,
    cancel: CancelToken,
    events: mpsc::UnboundedSender<StatusEvent>,
    live: Arc<AtomicUsize>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let attempt_id = assignment.attempt_id;
        let job_index = assignment.job_index;
        let transaction_id = Uuid::new_v4().simple().to_string();

        let step_events = events.clone();
        let on_step = move |step| {
            let _ = step_events.send(StatusEvent::step(attempt_id, job_index, step));
        };

        let result = engine
            .run(
                &assignment.job,
                test_time,
                &transaction_id,
                &cancel,
                &on_step,
            )
            .await;

        let terminal = match result {
            Ok(reference) => StatusEvent::settled(attempt_id, job_index, reference),
            Err(err) => {
                warn!(
                    attempt_id,
                    class = err.failure_class(),
                    "attempt ended: {err}"
                );
                StatusEvent::failed(attempt_id, job_index, &err)
            }
        };
        let _ = events.send(terminal);
        live.fetch_sub(1, Ordering::SeqCst);
    })
}

fn spawn_watcher(
    run_id: Uuid,
    attempts: Vec<JoinHandle<()>>,
    cancel: CancelToken,
    events: mpsc::UnboundedSender<StatusEvent>,
    live: Arc<AtomicUsize>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        for handle in attempts {
            if let Err(join_err) = handle.await {
                // A panicked task never reached its own decrement.
                live.fetch_sub(1, Ordering::SeqCst);
                warn!(%run_id, "attempt task panicked: {join_err}");
                let _ = events.send(StatusEvent::run(
                    Severity::Warning,
                    format!("an attempt task panicked: {join_err}"),
                ));
            }
        }
        let message = if cancel.is_cancelled() {
            "cancelled"
        } else {
            "completed"
        };
        info!(%run_id, "run {message}");
        let _ = events.send(StatusEvent::run(Severity::Info, message));
    })
}

/// Caller-side handle to a launched run. Dropping it does not stop the
/// run; call [`RunHandle::cancel`] for that.
pub struct RunHandle {
    run_id: Uuid,
    events: mpsc::UnboundedReceiver<StatusEvent>,
    cancel: CancelSource,
    live: Arc<AtomicUsize>,
    watcher: JoinHandle<()>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Next status event; `None` once the run-scope terminal event has
    /// been consumed and all senders are gone.
    pub async fn next_event(&mut self) -> Option<StatusEvent> {
        self.events.recv().await
    }

    /// Request cooperative cancellation of every live attempt.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Attempts that have not yet emitted their terminal event.
    pub fn active_attempts(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Drain every remaining event and wait for the run to finish.
    pub async fn join(mut self) -> Vec<StatusEvent> {
        let mut drained = Vec::new();
        while let Some(event) = self.events.recv().await {
            drained.push(event);
        }
        let _ = self.watcher.await;
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::run::{
        BerthPreference, BookingJob, Credential, Passenger, PaymentMethod, Quota, RunConfigError,
        Sex, TravelClass,
    };
    use crate::session::{
        DryRunSession, DryRunSessionFactory, RemoteSession, SessionError,
    };
    use crate::solver::StaticSolver;
    use chrono::NaiveDate;

    fn credential(n: usize) -> Credential {
        Credential {
            user_id: format!("user{:02}", n),
            password: "Secret1x".to_string(),
        }
    }

    fn job() -> BookingJob {
        BookingJob {
            origin: "NDLS".to_string(),
            destination: "BCT".to_string(),
            date: NaiveDate::from_ymd_opt(2026, 9, 15).unwrap(),
            train: "12952".to_string(),
            travel_class: TravelClass::Sleeper,
            quota: Quota::General,
            payment: PaymentMethod::Wallet,
            payment_target: None,
            contact: "9999999999".to_string(),
            passengers: vec![Passenger {
                name: "Test Passenger".to_string(),
                age: 30,
                sex: Sex::Male,
                berth: BerthPreference::Lower,
            }],
            open_time_override: None,
            attempt_count: None,
        }
    }

    fn config(concurrency: usize, credentials: usize) -> RunConfig {
        RunConfig {
            requested_concurrency: concurrency,
            attempts_per_credential: 1,
            use_proxies: false,
            partitioning: crate::run::Partitioning::Auto,
            solver: crate::run::SolverKind::Static,
            test_time: None,
            credentials: (0..credentials).map(credential).collect(),
            proxies: Vec::new(),
            jobs: vec![job()],
        }
    }

    fn start(
        config: RunConfig,
        factory: Arc<dyn SessionFactory>,
    ) -> Result<RunHandle, StartError> {
        Supervisor::start(
            config,
            factory,
            Arc::new(StaticSolver::new("1234")),
            RecoveryPolicy::default(),
            TimingConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_run_completes_with_terminal_events_per_attempt() {
        let handle = start(config(2, 2), Arc::new(DryRunSessionFactory)).unwrap();
        let events = handle.join().await;

        let terminals: Vec<_> = events.iter().filter(|e| e.is_attempt_terminal()).collect();
        assert_eq!(terminals.len(), 2);
        assert!(terminals.iter().all(|e| e.message == "booked"));

        let last = events.last().unwrap();
        assert_eq!(last.scope, EventScope::Run);
        assert_eq!(last.message, "completed");
    }

    #[tokio::test]
    async fn test_attempt_events_keep_their_order() {
        let mut handle = start(config(1, 1), Arc::new(DryRunSessionFactory)).unwrap();
        let mut messages = Vec::new();
        while let Some(event) = handle.next_event().await {
            if event.scope == EventScope::Attempt {
                messages.push(event.message);
            }
        }
        assert_eq!(messages.first().map(String::as_str), Some("init"));
        assert_eq!(messages.last().map(String::as_str), Some("booked"));
        let auth = messages.iter().position(|m| m == "authenticated").unwrap();
        let submit = messages.iter().position(|m| m == "form_submitted").unwrap();
        assert!(auth < submit);
    }

    struct StallingFactory;

    impl SessionFactory for StallingFactory {
        fn create(
            &self,
            _credential: &Credential,
            _proxy: Option<&crate::run::Proxy>,
        ) -> Result<Arc<dyn RemoteSession>, SessionError> {
            Ok(Arc::new(DryRunSession::new().stall("search_trains")))
        }
    }

    #[tokio::test]
    async fn test_cancel_mid_run_yields_all_terminals_and_cancelled_run() {
        let mut handle = start(config(3, 3), Arc::new(StallingFactory)).unwrap();

        // All three attempts are past login and parked in the stalled
        // step once their "authenticated" events arrive.
        let mut authenticated = 0;
        while authenticated < 3 {
            let event = handle.next_event().await.unwrap();
            if event.message == "authenticated" {
                authenticated += 1;
            }
        }
        assert_eq!(handle.active_attempts(), 3);
        handle.cancel();

        let events = handle.join().await;
        let terminals: Vec<_> = events.iter().filter(|e| e.is_attempt_terminal()).collect();
        assert_eq!(terminals.len(), 3);
        assert!(terminals
            .iter()
            .all(|e| e.failure_class == Some("cancelled")));
        assert_eq!(events.last().unwrap().message, "cancelled");
    }

    #[tokio::test]
    async fn test_live_counter_drains() {
        let handle = start(config(2, 2), Arc::new(DryRunSessionFactory)).unwrap();
        let live = handle.live.clone();
        handle.join().await;
        assert_eq!(live.load(Ordering::SeqCst), 0);
    }

    struct PanickingSession;

    #[async_trait::async_trait]
    impl RemoteSession for PanickingSession {
        fn name(&self) -> &str {
            "panicking"
        }
        async fn login(&self) -> Result<(), SessionError> {
            Ok(())
        }
        async fn server_time(&self) -> Result<i64, SessionError> {
            Ok(0)
        }
        async fn search_trains(&self, _job: &BookingJob) -> Result<(), SessionError> {
            panic!("boom");
        }
        async fn check_availability(&self, _job: &BookingJob) -> Result<(), SessionError> {
            unimplemented!()
        }
        async fn boarding_stations(&self, _job: &BookingJob) -> Result<(), SessionError> {
            unimplemented!()
        }
        async fn submit_form(
            &self,
            _job: &BookingJob,
            _transaction_id: &str,
        ) -> Result<crate::session::FormOutcome, SessionError> {
            unimplemented!()
        }
        async fn verify_challenge(
            &self,
            _transaction_id: &str,
            _answer: &str,
        ) -> Result<crate::session::ChallengeOutcome, SessionError> {
            unimplemented!()
        }
        async fn select_payment(
            &self,
            _job: &BookingJob,
            _transaction_id: &str,
            _amount: f64,
        ) -> Result<crate::session::PaymentHandle, SessionError> {
            unimplemented!()
        }
        async fn poll_settlement(
            &self,
            _handle: &crate::session::PaymentHandle,
        ) -> Result<crate::session::Settlement, SessionError> {
            unimplemented!()
        }
    }

    struct PanickingFactory;

    impl SessionFactory for PanickingFactory {
        fn create(
            &self,
            _credential: &Credential,
            _proxy: Option<&crate::run::Proxy>,
        ) -> Result<Arc<dyn RemoteSession>, SessionError> {
            Ok(Arc::new(PanickingSession))
        }
    }

    #[tokio::test]
    async fn test_panicked_attempt_still_drains_live_counter() {
        let handle = start(config(1, 1), Arc::new(PanickingFactory)).unwrap();
        let live = handle.live.clone();
        let events = handle.join().await;

        assert_eq!(live.load(Ordering::SeqCst), 0);
        assert!(events.iter().any(|e| {
            e.scope == EventScope::Run
                && e.severity == Severity::Warning
                && e.message.contains("panicked")
        }));
        assert_eq!(events.last().unwrap().message, "completed");
    }

    #[tokio::test]
    async fn test_invalid_config_never_launches() {
        let mut bad = config(2, 2);
        bad.credentials.clear();
        match start(bad, Arc::new(DryRunSessionFactory)) {
            Err(StartError::Invalid(RunConfigError::EmptyCredentials)) => {}
            other => panic!("unexpected: {:?}", other.map(|h| h.run_id())),
        }
    }

    #[tokio::test]
    async fn test_clamp_is_reported_as_run_warning() {
        let handle = start(config(5, 2), Arc::new(DryRunSessionFactory)).unwrap();
        let events = handle.join().await;
        let warning = events
            .iter()
            .find(|e| e.scope == EventScope::Run && e.severity == Severity::Warning)
            .expect("clamp warning");
        assert!(warning.message.contains("credentials support 2"));
        let terminals = events.iter().filter(|e| e.is_attempt_terminal()).count();
        assert_eq!(terminals, 2);
    }
}
