use std::time::Duration;

use chrono::{DateTime, Utc};

// Tokio timers run on the monotonic clock, so a single long sleep drifts
// away from the wall clock across host suspends and NTP steps. Sleeping in
// bounded chunks and re-reading the wall clock on every wake keeps multi-hour
// timers honest.
const MAX_SLEEP_CHUNK: Duration = Duration::from_secs(5 * 60);

/// Sleep until the wall clock reaches `fire_at`. Returns immediately when the
/// target is already in the past.
pub async fn sleep_until_wall_clock(fire_at: DateTime<Utc>) {
    loop {
        let remaining = match (fire_at - Utc::now()).to_std() {
            Ok(remaining) => remaining,
            // Negative: the target has passed.
            Err(_) => return,
        };
        if remaining.is_zero() {
            return;
        }
        tokio::time::sleep(remaining.min(MAX_SLEEP_CHUNK)).await;
        if Utc::now() >= fire_at {
            return;
        }
    }
}
