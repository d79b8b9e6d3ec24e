// Deadline arithmetic that saturates instead of overflowing

use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::time::Instant;

/// Roughly thirty years; what "no deadline" turns into
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `Instant::now() + timeout`, clamped to a far-future instant for timeouts
/// that would overflow the clock.
pub fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

/// Wall-clock expiry `timeout` after `from`, or `None` when it is not
/// representable.
pub fn expiry_after(from: DateTime<Utc>, timeout: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(timeout)
        .ok()
        .and_then(|ttl| from.checked_add_signed(ttl))
}
