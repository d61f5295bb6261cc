//! Remote booking session abstraction.
//!
//! This module provides the `RemoteSession` trait covering the ordered
//! remote transaction (login through settlement) plus two backends: the
//! concrete `irctc` adapter and an in-memory `dryrun` session used for
//! rehearsals and tests.

mod dryrun;
mod irctc;
mod types;

pub use dryrun::{DryRunSession, DryRunSessionFactory};
pub use irctc::{IrctcSession, IrctcSessionFactory};
pub use types::*;
