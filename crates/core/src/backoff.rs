//! Retry backoff.

use std::time::Duration;

/// Delay before the first retry.
pub const BACKOFF_BASE: Duration = Duration::from_secs(10);

/// Upper bound for any retry delay.
pub const BACKOFF_CAP: Duration = Duration::from_secs(600);

/// Delay applied by an administrative requeue.
pub const REQUEUE_DELAY: Duration = Duration::from_secs(10);

/// Exponential backoff: `min(2^attempts * 10s, 10m)`.
///
/// ```
/// use std::time::Duration;
/// use duraq_core::backoff;
///
/// assert_eq!(backoff(0), Duration::from_secs(10));
/// assert_eq!(backoff(3), Duration::from_secs(80));
/// assert_eq!(backoff(40), Duration::from_secs(600));
/// ```
pub fn backoff(attempts: u32) -> Duration {
    let factor = 1u32.checked_shl(attempts).unwrap_or(u32::MAX);
    BACKOFF_BASE.saturating_mul(factor).min(BACKOFF_CAP)
}
