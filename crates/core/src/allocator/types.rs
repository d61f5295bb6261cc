//! Types produced by the allocator.

use std::sync::Arc;

use thiserror::Error;

use crate::run::{BookingJob, Credential, Proxy};

/// Errors that stop a run before any attempt launches.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// Nothing to spread attempts over.
    #[error("cannot allocate without credentials and jobs")]
    EmptyPools,

    /// Manual partitioning counts do not add up to the effective
    /// concurrency.
    #[error("declared attempt counts sum to {declared}, expected {effective}")]
    PartitionMismatch { declared: usize, effective: usize },
}

/// Everything one execution unit needs; owned by exactly that unit.
#[derive(Debug, Clone)]
pub struct AttemptAssignment {
    /// 1-based attempt number, stable for the run.
    pub attempt_id: usize,
    pub credential: Credential,
    pub proxy: Option<Proxy>,
    /// Index of the job in the submitted configuration.
    pub job_index: usize,
    pub job: Arc<BookingJob>,
}

/// Emitted when the requested concurrency had to be reduced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClampNotice {
    pub requested: usize,
    pub possible: usize,
}

/// The allocator's output: one assignment per attempt.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub effective_concurrency: usize,
    pub clamped: Option<ClampNotice>,
    pub assignments: Vec<AttemptAssignment>,
}
