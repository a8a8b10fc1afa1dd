//! Retention policy for sealed artifacts.

use chrono::{DateTime, Duration, Utc};

/// How long the artifacts of a run are kept after the run's newest artifact
/// was sealed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age: Duration,
}

impl RetentionPolicy {
    pub fn days(days: u32) -> Self {
        Self {
            max_age: Duration::days(i64::from(days)),
        }
    }

    pub fn is_expired(&self, newest_sealed_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - newest_sealed_at > self.max_age
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::days(30)
    }
}
