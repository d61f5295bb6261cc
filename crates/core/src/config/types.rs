use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::resilience::RecoveryPolicy;
use crate::schedule::TimingConfig;

/// Root service configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub recovery: RecoveryPolicy,
    #[serde(default)]
    pub solver: SolverConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    "0.0.0.0".parse().unwrap()
}

fn default_port() -> u16 {
    8080
}

/// Which remote backend runs are served against.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionBackend {
    Irctc,
    /// Scripted in-memory sessions; full rehearsal without remote calls.
    DryRun,
}

/// Remote session configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionConfig {
    #[serde(default = "default_backend")]
    pub backend: SessionBackend,
    /// Base URL of the booking service.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Per-request timeout in seconds.
    #[serde(default = "default_session_timeout")]
    pub timeout_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            base_url: default_base_url(),
            timeout_secs: default_session_timeout(),
        }
    }
}

fn default_backend() -> SessionBackend {
    SessionBackend::Irctc
}

fn default_base_url() -> String {
    "https://www.irctc.co.in".to_string()
}

fn default_session_timeout() -> u64 {
    30
}

/// Challenge solver configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SolverConfig {
    /// OCR endpoint challenge images are posted to.
    #[serde(default = "default_ocr_url")]
    pub ocr_url: String,
    #[serde(default = "default_solver_timeout")]
    pub timeout_secs: u64,
    /// Fixed answer used by the static solver.
    #[serde(default = "default_static_answer")]
    pub static_answer: String,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            ocr_url: default_ocr_url(),
            timeout_secs: default_solver_timeout(),
            static_answer: default_static_answer(),
        }
    }
}

fn default_ocr_url() -> String {
    "http://127.0.0.1:8090/solve".to_string()
}

fn default_solver_timeout() -> u64 {
    10
}

fn default_static_answer() -> String {
    "0000".to_string()
}
