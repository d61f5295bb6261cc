//! Failure recovery for remote workflow steps.
//!
//! Each step runs through [`recover`], which retries or reauthenticates
//! according to the error's class. Retry state is local to one step
//! invocation; a later step starts with fresh budgets.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::session::{RemoteSession, SessionError};

/// Retry budgets per failure class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RecoveryPolicy {
    /// Immediate retries allowed for transient upstream faults.
    #[serde(default = "default_transient_retries")]
    pub transient_retries: u32,

    /// Full re-logins allowed when the session expires mid-step.
    #[serde(default = "default_reauth_retries")]
    pub reauth_retries: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            transient_retries: default_transient_retries(),
            reauth_retries: default_reauth_retries(),
        }
    }
}

fn default_transient_retries() -> u32 {
    5
}

fn default_reauth_retries() -> u32 {
    1
}

/// Run one workflow step with recovery.
///
/// Transient faults are retried in place, immediately, up to the
/// policy's budget. An expired session triggers a full re-login and one
/// retry of the step per reauth budget. Every other class, and any
/// exhausted budget, surfaces the error unchanged.
pub async fn recover<T, F, Fut>(
    policy: &RecoveryPolicy,
    session: &dyn RemoteSession,
    op: &'static str,
    mut f: F,
) -> Result<T, SessionError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, SessionError>>,
{
    let mut transient_left = policy.transient_retries;
    let mut reauth_left = policy.reauth_retries;
    loop {
        match f().await {
            Ok(value) => return Ok(value),
            Err(SessionError::Transient(reason)) if transient_left > 0 => {
                transient_left -= 1;
                warn!(op, reason, remaining = transient_left, "transient fault, retrying");
            }
            Err(SessionError::AuthExpired) if reauth_left > 0 => {
                reauth_left -= 1;
                warn!(op, "session expired, reauthenticating");
                session.login().await?;
            }
            Err(err) => return Err(err),
        }
    }
}
