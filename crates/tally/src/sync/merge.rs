//! Incremental merge of a fetched snapshot into an account record
//!
//! Pure function so the cost-accumulation invariants are testable
//! without any I/O.

use chrono::{DateTime, Utc};

use crate::api::AccountSnapshot;
use crate::models::{AccountRecord, UsageSyncState};

/// Merge one refresh window into the record
///
/// Invariants:
/// - a window with events adds its cost on top of a carried watermark
///   (`accumulated = prior + new`) and advances `last_refresh_time` to
///   the newest event's timestamp
/// - a window with zero events leaves the watermark pair exactly as it
///   was — never a reset
/// - `total_cost` always displays the accumulated value after the merge
/// - a successful merge clears the invalid flag
pub fn merge_snapshot(record: &mut AccountRecord, snapshot: &AccountSnapshot, now: DateTime<Utc>) {
    // identity fields: the stored email is the row key, so it is only
    // adopted when the record has none yet
    if record.email.is_empty() && !snapshot.email.is_empty() {
        record.email = snapshot.email.clone();
    }
    if !snapshot.user_id.is_empty() {
        record.user_id = snapshot.user_id.clone();
    }

    record.membership_type = snapshot.membership_type.clone();
    record.used = snapshot.used;
    record.limit_value = snapshot.limit_value;
    record.usage_percent = snapshot.usage_percent;
    record.days_remaining = snapshot.days_remaining;
    if snapshot.subscription_status.is_some() {
        record.subscription_status = snapshot.subscription_status.clone();
    }

    if snapshot.event_count == 0 {
        // no new activity: the watermark pair stays untouched and the
        // displayed total keeps showing what was carried
        record.total_cost = Some(record.sync.accumulated_cost);
        if record.sync.is_initial() {
            record.total_tokens = Some(0);
            record.unpaid_amount = 0.0;
            record.model_usage.clear();
        }
    } else {
        let prior = record.sync.clone();
        let accumulated = if prior.last_refresh_time.is_some() && prior.accumulated_cost > 0.0 {
            prior.accumulated_cost + snapshot.cost.total_cost
        } else {
            snapshot.cost.total_cost
        };

        // events without a parseable timestamp accumulate cost but
        // cannot move the time boundary
        record.sync = UsageSyncState::new(
            snapshot.newest_event_at.or(prior.last_refresh_time),
            accumulated,
        );
        record.total_cost = Some(accumulated);
        record.total_tokens = Some(snapshot.cost.total_tokens);
        record.unpaid_amount = snapshot.cost.unpaid_amount;
        record.model_usage = snapshot.cost.by_model.clone();

        if let Some(t) = snapshot.newest_event_at {
            record.last_used = Some(t);
        }
    }

    record.is_invalid = false;
    record.last_refreshed = Some(now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::cost::CostBreakdown;
    use crate::models::ModelUsage;
    use chrono::TimeZone;
    use std::collections::BTreeMap;

    fn snapshot(event_count: usize, cost: f64, newest: Option<DateTime<Utc>>) -> AccountSnapshot {
        let mut by_model = BTreeMap::new();
        if event_count > 0 {
            by_model.insert(
                "sonnet".to_string(),
                ModelUsage {
                    cost,
                    tokens: 100,
                    count: event_count as i64,
                },
            );
        }

        AccountSnapshot {
            email: "a@b.c".to_string(),
            user_id: "user_1".to_string(),
            membership_type: "pro".to_string(),
            used: 42,
            limit_value: 500,
            usage_percent: 8.4,
            days_remaining: 3,
            subscription_status: Some("active".to_string()),
            cost: CostBreakdown {
                total_cost: cost,
                total_tokens: 100 * event_count as i64,
                event_count,
                charged_count: event_count,
                by_model,
                unpaid_amount: (cost - 20.0).max(0.0),
            },
            event_count,
            newest_event_at: newest,
        }
    }

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 10, day, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_incremental_window_accumulates() {
        let mut record = AccountRecord::new("a@b.c");
        record.sync = UsageSyncState::new(Some(ts(5, 12)), 10.0);

        merge_snapshot(&mut record, &snapshot(3, 2.5, Some(ts(7, 9))), ts(7, 10));

        assert_eq!(record.sync.accumulated_cost, 12.5);
        assert_eq!(record.sync.last_refresh_time, Some(ts(7, 9)));
        assert_eq!(record.total_cost, Some(12.5));
        assert_eq!(record.last_used, Some(ts(7, 9)));
        assert_eq!(record.last_refreshed, Some(ts(7, 10)));
    }

    #[test]
    fn test_zero_event_window_is_a_noop_on_the_watermark() {
        let mut record = AccountRecord::new("a@b.c");
        record.sync = UsageSyncState::new(Some(ts(5, 12)), 10.0);
        record.total_tokens = Some(777);
        record.unpaid_amount = 1.5;

        merge_snapshot(&mut record, &snapshot(0, 0.0, None), ts(7, 10));

        assert_eq!(record.sync.last_refresh_time, Some(ts(5, 12)));
        assert_eq!(record.sync.accumulated_cost, 10.0);
        assert_eq!(record.total_cost, Some(10.0));
        // carried cost fields stay as they were
        assert_eq!(record.total_tokens, Some(777));
        assert_eq!(record.unpaid_amount, 1.5);
    }

    #[test]
    fn test_first_sync_sets_watermark_directly() {
        let mut record = AccountRecord::new("a@b.c");

        merge_snapshot(&mut record, &snapshot(2, 4.0, Some(ts(6, 8))), ts(6, 9));

        assert_eq!(record.sync.accumulated_cost, 4.0);
        assert_eq!(record.sync.last_refresh_time, Some(ts(6, 8)));
        assert_eq!(record.total_cost, Some(4.0));
        assert_eq!(record.total_tokens, Some(200));
    }

    #[test]
    fn test_first_sync_with_no_events_zeroes_totals() {
        let mut record = AccountRecord::new("a@b.c");
        record.total_tokens = Some(999);
        record.model_usage.insert("stale".into(), ModelUsage::default());

        merge_snapshot(&mut record, &snapshot(0, 0.0, None), ts(6, 9));

        assert!(record.sync.is_initial());
        assert_eq!(record.total_cost, Some(0.0));
        assert_eq!(record.total_tokens, Some(0));
        assert!(record.model_usage.is_empty());
    }

    #[test]
    fn test_events_without_timestamps_keep_time_boundary() {
        let mut record = AccountRecord::new("a@b.c");
        record.sync = UsageSyncState::new(Some(ts(5, 12)), 10.0);

        merge_snapshot(&mut record, &snapshot(1, 1.0, None), ts(7, 10));

        assert_eq!(record.sync.accumulated_cost, 11.0);
        assert_eq!(record.sync.last_refresh_time, Some(ts(5, 12)));
    }

    #[test]
    fn test_merge_clears_invalid_flag_and_updates_plan() {
        let mut record = AccountRecord::new("a@b.c");
        record.is_invalid = true;

        merge_snapshot(&mut record, &snapshot(1, 1.0, Some(ts(6, 8))), ts(6, 9));

        assert!(!record.is_invalid);
        assert_eq!(record.membership_type, "pro");
        assert_eq!(record.used, 42);
        assert_eq!(record.subscription_status.as_deref(), Some("active"));
    }

    #[test]
    fn test_merge_does_not_rename_existing_row() {
        let mut record = AccountRecord::new("stored@b.c");
        merge_snapshot(&mut record, &snapshot(0, 0.0, None), ts(6, 9));
        assert_eq!(record.email, "stored@b.c");
    }
}
