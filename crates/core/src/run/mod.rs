//! Run configuration and the booking data model.
//!
//! A [`RunConfig`] is submitted once per run (typically over the control
//! WebSocket), validated, and then consumed by the allocator. It is
//! immutable for the lifetime of the run.

mod types;
mod validate;

pub use types::{
    BerthPreference, BookingJob, Credential, Partitioning, Passenger, PaymentMethod, Proxy, Quota,
    RunConfig, Sex, SolverKind, TravelClass,
};
pub use validate::{validate_run_config, RunConfigError};
