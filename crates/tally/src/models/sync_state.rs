//! Watermark state for incremental usage sync

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Tracks incremental refresh progress for one account
///
/// Persisted inside the account row. `last_refresh_time` bounds the next
/// usage-events query; `accumulated_cost` carries cost attributed up to
/// that instant across runs. A refresh that returns zero new events must
/// leave both fields exactly as they were.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct UsageSyncState {
    /// Timestamp of the newest usage event seen so far; `None` means no
    /// prior sync (the next refresh is a full, month-bounded one)
    pub last_refresh_time: Option<DateTime<Utc>>,
    /// Total cost in dollars accumulated up to `last_refresh_time`;
    /// monotonically non-decreasing across successful refreshes
    pub accumulated_cost: f64,
}

impl UsageSyncState {
    /// State before any sync has happened
    pub fn empty() -> Self {
        Self::default()
    }

    /// Create a state from persisted values
    pub fn new(last_refresh_time: Option<DateTime<Utc>>, accumulated_cost: f64) -> Self {
        Self {
            last_refresh_time,
            accumulated_cost,
        }
    }

    /// Whether the next refresh must be a full (month-bounded) one
    pub fn is_initial(&self) -> bool {
        self.last_refresh_time.is_none()
    }

    /// Advance the watermark after a refresh that observed new events
    ///
    /// `newest_event_at` becomes the new boundary and `new_cost` is added
    /// on top of the carried total when one exists.
    pub fn advanced(&self, newest_event_at: DateTime<Utc>, new_cost: f64) -> Self {
        let accumulated_cost = if self.last_refresh_time.is_some() && self.accumulated_cost > 0.0 {
            self.accumulated_cost + new_cost
        } else {
            new_cost
        };

        Self {
            last_refresh_time: Some(newest_event_at),
            accumulated_cost,
        }
    }
}
