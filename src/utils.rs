//! Small shared helpers.

use chrono::Utc;

/// Current time as whole epoch seconds. All reserved timestamp
/// headers (`created`, `expires_at`) use this clock.
pub fn epoch_secs() -> i64 {
    Utc::now().timestamp()
}
