//! Synchronization with the remote service's clock.
//!
//! All booking windows are computed against the remote clock, not the
//! local one. One round trip to the remote time endpoint yields an
//! offset; authoritative time is then `local now + offset` for the rest
//! of the attempt (drift over a few minutes is negligible).

use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::session::{RemoteSession, SessionError};

/// A fixed offset onto the local clock, valid for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerClock {
    offset_ms: i64,
}

impl ServerClock {
    /// A clock with a known offset. Offset zero means "trust local time".
    pub fn with_offset_ms(offset_ms: i64) -> Self {
        Self { offset_ms }
    }

    /// The authoritative current instant.
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + Duration::milliseconds(self.offset_ms)
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms
    }
}

/// Measure the remote clock offset with a single round trip.
///
/// Half the observed round-trip latency is folded into the offset so the
/// remote-reported value is centered on the request's time in flight:
/// `offset = round((t1 - t0) / 2) + r`.
pub async fn measure(session: &dyn RemoteSession) -> Result<ServerClock, SessionError> {
    let t0 = Utc::now().timestamp_millis();
    let reported = session.server_time().await?;
    let t1 = Utc::now().timestamp_millis();

    let offset_ms = ((t1 - t0) as f64 / 2.0).round() as i64 + reported;
    debug!(
        round_trip_ms = t1 - t0,
        offset_ms, "measured remote clock offset"
    );
    Ok(ServerClock::with_offset_ms(offset_ms))
}
