//! Booking window arithmetic and deadline-precise waiting.
//!
//! The window for a job is a single instant `opens_at` plus two derived
//! instants: `auth_at`, when authentication starts, and `submit_at`,
//! when the reservation form goes out. Attempts that start far outside
//! the window are refused up front instead of failing remotely.

mod config;

pub use config::TimingConfig;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::trace;

use crate::cancel::CancelToken;
use crate::clock::ServerClock;
use crate::run::BookingJob;

/// The three instants an attempt keys its phases on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingWindow {
    pub opens_at: DateTime<Utc>,
    pub auth_at: DateTime<Utc>,
    pub submit_at: DateTime<Utc>,
}

impl BookingWindow {
    /// Derive the window around a known opening instant.
    pub fn around(opens_at: DateTime<Utc>, cfg: &TimingConfig) -> Self {
        Self {
            opens_at,
            auth_at: opens_at - Duration::milliseconds(cfg.auth_lead_ms as i64),
            submit_at: opens_at + Duration::milliseconds(cfg.submit_lag_ms as i64),
        }
    }
}

/// Timing guard violations. An attempt hitting one never reaches the
/// remote service.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    /// Started too far ahead; carries how long until authentication
    /// would begin.
    #[error("booking window opens in {}s, refusing to idle that long", .wait.num_seconds())]
    TooEarly { wait: Duration },

    /// Started after the window had already passed.
    #[error("booking window has already closed")]
    TooLate,
}

/// Determine the opening instant for a job, if it has one.
///
/// Priority quotas open at a fixed daily clock time that depends on the
/// travel class; overrides are ignored for them. Ordinary quota has no
/// natural opening, so it runs immediately unless the job or the run
/// pins an explicit instant.
pub fn resolve_window(
    job: &BookingJob,
    test_time: Option<DateTime<Utc>>,
    cfg: &TimingConfig,
    clock: &ServerClock,
) -> Option<BookingWindow> {
    let opens_at = if job.quota.is_priority() {
        let open = if job.travel_class.is_air_conditioned() {
            cfg.ac_open
        } else {
            cfg.non_ac_open
        };
        Some(
            clock
                .now()
                .date_naive()
                .and_time(open)
                .and_utc(),
        )
    } else {
        job.open_time_override.or(test_time)
    };
    opens_at.map(|at| BookingWindow::around(at, cfg))
}

/// Refuse attempts that start far outside the window.
pub fn check_guards(
    window: &BookingWindow,
    now: DateTime<Utc>,
    cfg: &TimingConfig,
) -> Result<(), ScheduleError> {
    let earliest = window.auth_at - Duration::milliseconds(cfg.early_guard_ms as i64);
    let latest = window.submit_at + Duration::milliseconds(cfg.late_guard_ms as i64);
    if now < earliest {
        return Err(ScheduleError::TooEarly {
            wait: window.auth_at - now,
        });
    }
    if now > latest {
        return Err(ScheduleError::TooLate);
    }
    Ok(())
}

/// Sleep until the instant according to the remote clock. Returns
/// `false` if cancellation arrived first, `true` once the instant is
/// reached (immediately when already due).
pub async fn wait_until(
    clock: &ServerClock,
    instant: DateTime<Utc>,
    cancel: &CancelToken,
) -> bool {
    let remaining = instant - clock.now();
    let Ok(remaining) = remaining.to_std() else {
        // Already due.
        return true;
    };
    trace!(remaining_ms = remaining.as_millis() as u64, "waiting for instant");
    tokio::select! {
        _ = tokio::time::sleep(remaining) => true,
        _ = cancel.cancelled() => false,
    }
}

/// Pause before submitting the reservation form, scaled by how many
/// passengers the form carries.
pub fn form_fill_delay(cfg: &TimingConfig, passenger_count: usize) -> std::time::Duration {
    let secs = match passenger_count {
        0 => 0,
        n => {
            let idx = (n - 1).min(cfg.form_fill_delay_secs.len().saturating_sub(1));
            cfg.form_fill_delay_secs.get(idx).copied().unwrap_or(0)
        }
    };
    std::time::Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancelSource;
    use crate::run::{BookingJob, PaymentMethod, Quota, TravelClass};
    use chrono::{NaiveDate, TimeZone};

    fn job(quota: Quota, class: TravelClass) -> BookingJob {
        BookingJob {
            origin: "NDLS".to_string(),
            destination: "BCT".to_string(),
            date: NaiveDate::from_ymd_opt(2026, 9, 15).unwrap(),
            train: "12952".to_string(),
            travel_class: class,
            quota,
            payment: PaymentMethod::Wallet,
            payment_target: None,
            contact: "9999999999".to_string(),
            passengers: Vec::new(),
            open_time_override: None,
            attempt_count: None,
        }
    }

    #[test]
    fn test_window_offsets() {
        let opens = Utc.with_ymd_and_hms(2026, 3, 14, 4, 30, 0).unwrap();
        let window = BookingWindow::around(opens, &TimingConfig::default());
        assert_eq!(window.auth_at, opens - Duration::seconds(60));
        assert_eq!(window.submit_at, opens + Duration::milliseconds(200));
    }

    #[test]
    fn test_priority_quota_opens_at_class_time() {
        let cfg = TimingConfig::default();
        let clock = ServerClock::with_offset_ms(0);

        let window =
            resolve_window(&job(Quota::Tatkal, TravelClass::ThirdAc), None, &cfg, &clock)
                .unwrap();
        assert_eq!(window.opens_at.time(), cfg.ac_open);

        let window =
            resolve_window(&job(Quota::Tatkal, TravelClass::Sleeper), None, &cfg, &clock)
                .unwrap();
        assert_eq!(window.opens_at.time(), cfg.non_ac_open);
    }

    #[test]
    fn test_priority_quota_ignores_test_time() {
        let cfg = TimingConfig::default();
        let clock = ServerClock::with_offset_ms(0);
        let pinned = Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap();
        let window =
            resolve_window(&job(Quota::Tatkal, TravelClass::Sleeper), Some(pinned), &cfg, &clock)
                .unwrap();
        assert_ne!(window.opens_at, pinned);
        assert_eq!(window.opens_at.time(), cfg.non_ac_open);
    }

    #[test]
    fn test_ordinary_quota_uses_override_then_test_time() {
        let cfg = TimingConfig::default();
        let clock = ServerClock::with_offset_ms(0);
        let pinned = Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap();
        let overridden = Utc.with_ymd_and_hms(2026, 3, 14, 13, 0, 0).unwrap();

        assert!(resolve_window(
            &job(Quota::General, TravelClass::Sleeper),
            None,
            &cfg,
            &clock
        )
        .is_none());

        let window = resolve_window(
            &job(Quota::General, TravelClass::Sleeper),
            Some(pinned),
            &cfg,
            &clock,
        )
        .unwrap();
        assert_eq!(window.opens_at, pinned);

        let mut j = job(Quota::General, TravelClass::Sleeper);
        j.open_time_override = Some(overridden);
        let window = resolve_window(&j, Some(pinned), &cfg, &clock).unwrap();
        assert_eq!(window.opens_at, overridden);
    }

    #[test]
    fn test_guard_boundaries() {
        let cfg = TimingConfig::default();
        let opens = Utc.with_ymd_and_hms(2026, 3, 14, 4, 30, 0).unwrap();
        let window = BookingWindow::around(opens, &cfg);

        // Just inside the early edge.
        let now = window.auth_at - Duration::milliseconds(cfg.early_guard_ms as i64);
        assert!(check_guards(&window, now, &cfg).is_ok());

        // One millisecond earlier is refused, naming the wait.
        let now = now - Duration::milliseconds(1);
        match check_guards(&window, now, &cfg) {
            Err(ScheduleError::TooEarly { wait }) => {
                assert_eq!(wait, window.auth_at - now);
            }
            other => panic!("expected TooEarly, got {:?}", other),
        }

        // Just inside the late edge.
        let now = window.submit_at + Duration::milliseconds(cfg.late_guard_ms as i64);
        assert!(check_guards(&window, now, &cfg).is_ok());

        let now = now + Duration::milliseconds(1);
        assert_eq!(check_guards(&window, now, &cfg), Err(ScheduleError::TooLate));
    }

    #[tokio::test]
    async fn test_wait_until_returns_immediately_when_due() {
        let clock = ServerClock::with_offset_ms(0);
        let (_source, token) = CancelSource::new();
        let past = Utc::now() - Duration::seconds(5);
        let reached = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            wait_until(&clock, past, &token),
        )
        .await
        .expect("must not sleep for a past instant");
        assert!(reached);
    }

    #[tokio::test]
    async fn test_wait_until_observes_cancellation() {
        let clock = ServerClock::with_offset_ms(0);
        let (source, token) = CancelSource::new();
        let far = Utc::now() + Duration::seconds(3600);
        source.cancel();
        let reached = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            wait_until(&clock, far, &token),
        )
        .await
        .expect("cancellation must interrupt the wait");
        assert!(!reached);
    }

    #[test]
    fn test_form_fill_delay_scaling() {
        let cfg = TimingConfig::default();
        assert_eq!(form_fill_delay(&cfg, 1).as_secs(), 20);
        assert_eq!(form_fill_delay(&cfg, 4).as_secs(), 25);
        assert_eq!(form_fill_delay(&cfg, 6).as_secs(), 30);
        // Past the table end sticks to the last entry.
        assert_eq!(form_fill_delay(&cfg, 9).as_secs(), 30);
    }
}
