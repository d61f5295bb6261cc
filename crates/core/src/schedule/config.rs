use chrono::NaiveTime;
use serde::{Deserialize, Serialize};

/// Timing constants for the booking window and its guards. Defaults
/// match the live service; every value can be overridden in config.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingConfig {
    /// How long before the window opens authentication starts.
    #[serde(default = "default_auth_lead_ms")]
    pub auth_lead_ms: u64,

    /// How long after the window opens the form is submitted.
    #[serde(default = "default_submit_lag_ms")]
    pub submit_lag_ms: u64,

    /// Attempts starting earlier than `auth_at` minus this are refused.
    #[serde(default = "default_early_guard_ms")]
    pub early_guard_ms: u64,

    /// Attempts starting later than `submit_at` plus this are refused.
    #[serde(default = "default_late_guard_ms")]
    pub late_guard_ms: u64,

    /// Daily opening clock time (UTC) for air-conditioned classes.
    #[serde(default = "default_ac_open")]
    pub ac_open: NaiveTime,

    /// Daily opening clock time (UTC) for non-air-conditioned classes.
    #[serde(default = "default_non_ac_open")]
    pub non_ac_open: NaiveTime,

    /// Pause before form submission, in seconds, indexed by passenger
    /// count (first entry is one passenger). Counts past the end use
    /// the last entry.
    #[serde(default = "default_form_fill_delay_secs")]
    pub form_fill_delay_secs: Vec<u64>,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            auth_lead_ms: default_auth_lead_ms(),
            submit_lag_ms: default_submit_lag_ms(),
            early_guard_ms: default_early_guard_ms(),
            late_guard_ms: default_late_guard_ms(),
            ac_open: default_ac_open(),
            non_ac_open: default_non_ac_open(),
            form_fill_delay_secs: default_form_fill_delay_secs(),
        }
    }
}

fn default_auth_lead_ms() -> u64 {
    60_000
}

fn default_submit_lag_ms() -> u64 {
    200
}

fn default_early_guard_ms() -> u64 {
    180_000
}

fn default_late_guard_ms() -> u64 {
    300_000
}

fn default_ac_open() -> NaiveTime {
    NaiveTime::from_hms_opt(4, 30, 0).unwrap()
}

fn default_non_ac_open() -> NaiveTime {
    NaiveTime::from_hms_opt(5, 30, 0).unwrap()
}

fn default_form_fill_delay_secs() -> Vec<u64> {
    vec![20, 20, 25, 25, 30, 30]
}
