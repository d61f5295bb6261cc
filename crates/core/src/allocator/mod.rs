//! Resource allocation: maps the requested concurrency onto the finite
//! pools of credentials, proxies and booking jobs.

mod types;

pub use types::{Allocation, AllocationError, AttemptAssignment, ClampNotice};

use std::sync::Arc;

use tracing::warn;

use crate::run::{Partitioning, RunConfig};

/// Compute one assignment per attempt.
///
/// The effective concurrency is `min(requested, credentials × attempts
/// per credential)`; a clamp is reported, never an error. Credentials
/// are spread maximally evenly (no credential takes an extra use before
/// every credential has as many), proxies cycle round-robin when
/// enabled, and jobs either cycle (`auto`) or expand their declared
/// counts in order (`manual`).
pub fn allocate(config: &RunConfig) -> Result<Allocation, AllocationError> {
    if config.credentials.is_empty() || config.jobs.is_empty() {
        return Err(AllocationError::EmptyPools);
    }
    let max_attempts = config.credentials.len() * config.attempts_per_credential;
    let effective = config.requested_concurrency.min(max_attempts);

    let clamped = if config.requested_concurrency > max_attempts {
        warn!(
            requested = config.requested_concurrency,
            possible = max_attempts,
            "requested concurrency exceeds credential capacity, clamping"
        );
        Some(ClampNotice {
            requested: config.requested_concurrency,
            possible: max_attempts,
        })
    } else {
        None
    };

    let credentials = spread_credentials(config, effective);
    let jobs = assign_jobs(config, effective)?;

    let jobs_arc: Vec<Arc<_>> = config.jobs.iter().cloned().map(Arc::new).collect();

    let mut assignments = Vec::with_capacity(effective);
    for i in 0..effective {
        let proxy = if config.use_proxies && !config.proxies.is_empty() {
            Some(config.proxies[i % config.proxies.len()].clone())
        } else {
            None
        };
        assignments.push(AttemptAssignment {
            attempt_id: i + 1,
            credential: credentials[i].clone(),
            proxy,
            job_index: jobs[i],
            job: Arc::clone(&jobs_arc[jobs[i]]),
        });
    }

    Ok(Allocation {
        effective_concurrency: effective,
        clamped,
        assignments,
    })
}

/// Expand credentials so each is used either `floor(n/len)` or
/// `ceil(n/len)` times, earlier credentials taking the extra use, each
/// grouped consecutively: 2 credentials for 4 attempts yields A,A,B,B.
fn spread_credentials(config: &RunConfig, effective: usize) -> Vec<crate::run::Credential> {
    let len = config.credentials.len();
    let base = effective / len;
    let extra = effective % len;

    let mut out = Vec::with_capacity(effective);
    for (i, credential) in config.credentials.iter().enumerate() {
        let uses = base + usize::from(i < extra);
        for _ in 0..uses {
            out.push(credential.clone());
        }
    }
    out
}

/// Produce the job index for each attempt.
fn assign_jobs(config: &RunConfig, effective: usize) -> Result<Vec<usize>, AllocationError> {
    match config.partitioning {
        Partitioning::Auto => Ok((0..effective).map(|i| i % config.jobs.len()).collect()),
        Partitioning::Manual => {
            let declared: usize = config
                .jobs
                .iter()
                .map(|j| j.attempt_count.unwrap_or(0))
                .sum();
            if declared != effective {
                return Err(AllocationError::PartitionMismatch {
                    declared,
                    effective,
                });
            }
            let mut out = Vec::with_capacity(effective);
            for (index, job) in config.jobs.iter().enumerate() {
                for _ in 0..job.attempt_count.unwrap_or(0) {
                    out.push(index);
                }
            }
            Ok(out)
        }
    }
}
