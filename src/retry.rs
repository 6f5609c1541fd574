//! Backoff schedule for failed deliveries.
//!
//! The index is 1-based on attempts already made: after the k-th failed attempt
//! the next attempt is due `BACKOFF_SCHEDULE_SECONDS[k - 1]` seconds later.

use chrono::Duration;

/// Attempts after which a delivery is marked `failed`.
pub const MAX_RETRIES: i32 = 5;

/// 1 minute, 5 minutes, 15 minutes, 1 hour, 2 hours.
pub const BACKOFF_SCHEDULE_SECONDS: [i64; 5] = [60, 300, 900, 3600, 7200];

/// Delay before the next attempt, given the number of attempts already made.
///
/// Values below 1 clamp to the first entry; values past the table reuse the last.
pub fn next_delay(attempts_made: i32) -> Duration {
    let index = attempts_made
        .max(1)
        .saturating_sub(1)
        .min(BACKOFF_SCHEDULE_SECONDS.len() as i32 - 1) as usize;
    Duration::seconds(BACKOFF_SCHEDULE_SECONDS[index])
}

/// Whether a delivery that has just failed its `attempts_made`-th attempt is exhausted.
pub fn is_exhausted(attempts_made: i32, max_attempts: i32) -> bool {
    attempts_made >= max_attempts
}
