//! Retry pacing for upstream calls: exponential backoff with jitter, plus
//! `Retry-After` handling for 429s.

use std::time::Duration;

pub const BASE_DELAY: Duration = Duration::from_millis(200);
pub const MAX_DELAY: Duration = Duration::from_secs(5);
pub const MAX_ATTEMPTS: u32 = 3;
pub const MAX_RATE_LIMIT_RETRIES: u32 = 2;

/// Delay before retry number `attempt` (1-based): base 200 ms, factor 2,
/// jitter +/-25 %, capped at 5 s.
pub fn retry_delay(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let nominal = BASE_DELAY.as_millis() as u64 * (1u64 << exp);
    let nominal = nominal.min(MAX_DELAY.as_millis() as u64);
    let jitter_span = nominal / 4;
    let jitter = if jitter_span == 0 {
        0
    } else {
        rand::random::<u64>() % (2 * jitter_span + 1)
    };
    let delayed = nominal - jitter_span + jitter;
    Duration::from_millis(delayed.min(MAX_DELAY.as_millis() as u64))
}

/// Delay before retrying a 429. `Retry-After` is a lower bound; jitter only
/// ever extends it.
pub fn rate_limit_delay(attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    let backoff = retry_delay(attempt);
    match retry_after_secs {
        Some(secs) => Duration::from_secs(secs).max(backoff),
        None => backoff,
    }
}

/// Parses a `Retry-After` header value in delta-seconds form.
pub fn parse_retry_after(value: &str) -> Option<u64> {
    value.trim().parse::<u64>().ok()
}
