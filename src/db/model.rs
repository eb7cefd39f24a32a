//! Database view models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use crate::model::SyncStatus;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Order/line-item totals read from the local mirror, compared against the
/// remote's own counts during verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CountSnapshot {
    pub orders: i64,
    pub line_items: i64,
}

/// Persisted sync status together with its heartbeat timestamp. A missing
/// heartbeat on a running status reads as stale.
#[derive(Debug, Clone)]
pub struct StoredStatus {
    pub status: SyncStatus,
    pub heartbeat: Option<DateTime<Utc>>,
}

impl StoredStatus {
    /// Resolve the flag as an observer must see it: a running status whose
    /// heartbeat is older than `stale_after` is an error condition, never
    /// "still running".
    pub fn effective(&self, stale_after: Duration, now: DateTime<Utc>) -> SyncStatus {
        if !self.status.is_running() {
            return self.status;
        }
        let fresh = self
            .heartbeat
            .map(|hb| now.signed_duration_since(hb).to_std().unwrap_or_default() <= stale_after)
            .unwrap_or(false);
        if fresh {
            self.status
        } else {
            SyncStatus::Error
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn stale_running_status_reads_as_error() {
        let now = Utc::now();
        let stale_after = Duration::from_secs(300);

        let fresh = StoredStatus {
            status: SyncStatus::Importing,
            heartbeat: Some(now - ChronoDuration::seconds(10)),
        };
        assert_eq!(fresh.effective(stale_after, now), SyncStatus::Importing);

        let stale = StoredStatus {
            status: SyncStatus::Background,
            heartbeat: Some(now - ChronoDuration::seconds(600)),
        };
        assert_eq!(stale.effective(stale_after, now), SyncStatus::Error);

        let missing = StoredStatus {
            status: SyncStatus::Importing,
            heartbeat: None,
        };
        assert_eq!(missing.effective(stale_after, now), SyncStatus::Error);

        // Idle never depends on the heartbeat.
        let idle = StoredStatus {
            status: SyncStatus::Idle,
            heartbeat: None,
        };
        assert_eq!(idle.effective(stale_after, now), SyncStatus::Idle);
    }
}
