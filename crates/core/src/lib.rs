pub mod allocator;
pub mod cancel;
pub mod clock;
pub mod config;
pub mod resilience;
pub mod run;
pub mod schedule;
pub mod session;
pub mod solver;
pub mod supervisor;
pub mod workflow;

pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, SessionBackend,
};
pub use run::{validate_run_config, RunConfig, RunConfigError};
pub use supervisor::{RunHandle, StartError, StatusEvent, Supervisor};
