//! Time and timestamp helpers.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// UTC timestamp used for advertisement sightings and trigger records.
pub type Timestamp = DateTime<Utc>;

/// Return the current UTC time.
#[must_use]
pub fn now() -> Timestamp {
    Utc::now()
}

/// Whether `then` lies within `window` before `at`.
///
/// Timestamps in the future (clock skew between the BLE stack and the host)
/// count as fresh.
#[must_use]
pub fn is_within(then: Timestamp, at: Timestamp, window: Duration) -> bool {
    match (at - then).to_std() {
        Ok(elapsed) => elapsed <= window,
        Err(_) => true,
    }
}

/// How much of `window` is left at `at` for something seen at `then`.
///
/// `None` once the window has run out. Future timestamps get the full window.
#[must_use]
pub fn remaining(then: Timestamp, at: Timestamp, window: Duration) -> Option<Duration> {
    match (at - then).to_std() {
        Ok(elapsed) => window.checked_sub(elapsed),
        Err(_) => Some(window),
    }
}
