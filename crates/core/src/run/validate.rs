//! Run configuration validation.
//!
//! Every check here fires before a single attempt is launched; a run
//! that fails validation never starts.

use regex_lite::Regex;
use thiserror::Error;

use super::types::{Partitioning, PaymentMethod, RunConfig};

/// Errors surfaced before a run starts.
#[derive(Debug, Error)]
pub enum RunConfigError {
    #[error("no credentials provided")]
    EmptyCredentials,

    #[error("no booking jobs provided")]
    EmptyJobs,

    #[error("requested concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("attempts per credential must be at least 1")]
    ZeroAttemptsPerCredential,

    #[error("invalid user id: {0}")]
    InvalidUserId(String),

    #[error("invalid password for user {0}")]
    InvalidPassword(String),

    #[error("job {index}: at least one passenger is required")]
    NoPassengers { index: usize },

    #[error("job {index}: {count} passengers exceeds the {quota} limit of {max}")]
    TooManyPassengers {
        index: usize,
        count: usize,
        quota: &'static str,
        max: usize,
    },

    #[error("job {index}: upi_collect payment requires a payment target")]
    MissingPaymentTarget { index: usize },

    #[error("proxies enabled but none provided")]
    NoProxies,

    #[error("manual partitioning requires an attempt_count on every job")]
    MissingAttemptCount { index: usize },
}

/// Validate a [`RunConfig`] before allocation.
///
/// The manual-partition sum is checked by the allocator, which knows the
/// effective concurrency; everything shape-related is checked here.
pub fn validate_run_config(config: &RunConfig) -> Result<(), RunConfigError> {
    if config.credentials.is_empty() {
        return Err(RunConfigError::EmptyCredentials);
    }
    if config.jobs.is_empty() {
        return Err(RunConfigError::EmptyJobs);
    }
    if config.requested_concurrency == 0 {
        return Err(RunConfigError::ZeroConcurrency);
    }
    if config.attempts_per_credential == 0 {
        return Err(RunConfigError::ZeroAttemptsPerCredential);
    }
    if config.use_proxies && config.proxies.is_empty() {
        return Err(RunConfigError::NoProxies);
    }

    let user_id_re = Regex::new(r"^[a-zA-Z0-9]{3,35}$").expect("static regex");
    for credential in &config.credentials {
        if !user_id_re.is_match(&credential.user_id) {
            return Err(RunConfigError::InvalidUserId(credential.user_id.clone()));
        }
        if !password_shape_ok(&credential.password) {
            return Err(RunConfigError::InvalidPassword(credential.user_id.clone()));
        }
    }

    for (index, job) in config.jobs.iter().enumerate() {
        if job.passengers.is_empty() {
            return Err(RunConfigError::NoPassengers { index });
        }
        let max = job.quota.max_passengers();
        if job.passengers.len() > max {
            return Err(RunConfigError::TooManyPassengers {
                index,
                count: job.passengers.len(),
                quota: job.quota.as_code(),
                max,
            });
        }
        if job.payment == PaymentMethod::UpiCollect && job.payment_target.is_none() {
            return Err(RunConfigError::MissingPaymentTarget { index });
        }
        if config.partitioning == Partitioning::Manual && job.attempt_count.is_none() {
            return Err(RunConfigError::MissingAttemptCount { index });
        }
    }

    Ok(())
}

/// Password rules the remote service enforces: 8-15 characters with at
/// least one digit, one lowercase letter and one uppercase letter or
/// special character. Checked by scanning since the upstream rule uses
/// lookaheads that `regex_lite` does not support.
fn password_shape_ok(password: &str) -> bool {
    let len = password.chars().count();
    if !(8..=15).contains(&len) {
        return false;
    }
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
    let has_upper_or_special = password
        .chars()
        .any(|c| c.is_ascii_uppercase() || "@$!%*#^?&".contains(c));
    has_digit && has_lower && has_upper_or_special
}
