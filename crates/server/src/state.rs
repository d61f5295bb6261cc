use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;
use uuid::Uuid;

use chetak_core::config::{Config, SessionBackend};
use chetak_core::run::{RunConfig, SolverKind};
use chetak_core::session::{DryRunSessionFactory, IrctcSessionFactory, SessionFactory};
use chetak_core::solver::{ChallengeSolver, HttpOcrSolver, SolverError, StaticSolver};

/// Shared application state. At most one booking run is live at a time;
/// the slot is claimed before launch and released when the run's event
/// stream drains.
pub struct AppState {
    config: Config,
    active_run: Mutex<Option<Uuid>>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            active_run: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Claim the single run slot. Returns `false` when another run is
    /// still live.
    pub fn try_claim_run(&self, run_id: Uuid) -> bool {
        let mut active = self.active_run.lock().unwrap();
        if active.is_some() {
            return false;
        }
        *active = Some(run_id);
        true
    }

    /// Release the slot if it is still held by this run.
    pub fn release_run(&self, run_id: Uuid) {
        let mut active = self.active_run.lock().unwrap();
        if *active == Some(run_id) {
            *active = None;
            info!(%run_id, "run slot released");
        }
    }

    pub fn active_run(&self) -> Option<Uuid> {
        *self.active_run.lock().unwrap()
    }

    /// Build the challenge solver the submitted run asked for.
    pub fn solver_for(&self, run: &RunConfig) -> Result<Arc<dyn ChallengeSolver>, SolverError> {
        let solver: Arc<dyn ChallengeSolver> = match run.solver {
            SolverKind::HttpOcr => Arc::new(HttpOcrSolver::new(
                self.config.solver.ocr_url.clone(),
                Duration::from_secs(self.config.solver.timeout_secs),
            )?),
            SolverKind::Static => {
                Arc::new(StaticSolver::new(self.config.solver.static_answer.clone()))
            }
        };
        Ok(solver)
    }

    /// Build the session factory for the configured backend.
    pub fn session_factory(&self, solver: Arc<dyn ChallengeSolver>) -> Arc<dyn SessionFactory> {
        match self.config.session.backend {
            SessionBackend::Irctc => Arc::new(IrctcSessionFactory::new(
                self.config.session.base_url.clone(),
                Duration::from_secs(self.config.session.timeout_secs),
                solver,
            )),
            SessionBackend::DryRun => Arc::new(DryRunSessionFactory),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_slot_is_exclusive() {
        let state = AppState::new(Config::default());
        let first = Uuid::new_v4();
        let second = Uuid::new_v4();

        assert!(state.try_claim_run(first));
        assert!(!state.try_claim_run(second));

        // Releasing with the wrong id is a no-op.
        state.release_run(second);
        assert_eq!(state.active_run(), Some(first));

        state.release_run(first);
        assert!(state.try_claim_run(second));
    }
}
