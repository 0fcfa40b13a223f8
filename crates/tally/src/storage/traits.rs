//! Storage trait definitions

use anyhow::Result;
use serde_json::Value;
use std::collections::BTreeMap;

use crate::models::AccountRecord;

/// Filters for [`AccountStore::list_accounts`]
#[derive(Debug, Clone, Default)]
pub struct AccountFilter {
    /// Plan-type prefix: `free` matches both `free` and `free_trial`
    pub plan_prefix: Option<String>,
    pub status: Option<StatusFilter>,
    /// Creation month in `YYYY-MM` form
    pub created_month: Option<String>,
}

/// Validity/expiry filter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFilter {
    /// `status = active` and not flagged invalid
    Active,
    /// `status = expired` or flagged invalid
    Expired,
    /// Free-plan accounts with no trial days left and no subscription
    NoPayment,
}

/// Sortable columns, NULL-safe (missing numeric values order as 0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortColumn {
    #[default]
    CreatedAt,
    Email,
    MembershipType,
    UsagePercent,
    DaysRemaining,
    TotalCost,
    UnpaidAmount,
    TotalTokens,
    LastRefreshed,
}

/// Aggregate counts over the stored accounts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AccountStats {
    pub total: usize,
    pub by_plan: BTreeMap<String, usize>,
    pub by_status: BTreeMap<String, usize>,
    /// Mean usage percentage across active accounts
    pub avg_usage_percent: f64,
}

/// Trait for account storage operations
///
/// Implementations receive and return decrypted [`AccountRecord`] values;
/// whether fields are encrypted at rest is the backend's concern. All
/// mutation goes through `upsert_account`/`update_fields`, each of which
/// must be internally atomic.
pub trait AccountStore: Send + Sync {
    /// Insert a new row or update the row with the same `email` in place.
    /// Returns the row id. This is the only write path the orchestrator
    /// uses, guaranteeing at most one row per email.
    fn upsert_account(&self, record: &AccountRecord) -> Result<i64>;

    /// Get an account by row id
    fn get_account(&self, id: i64) -> Result<Option<AccountRecord>>;

    /// Get an account by its unique email
    fn get_account_by_email(&self, email: &str) -> Result<Option<AccountRecord>>;

    /// List accounts matching `filter`, ordered by `sort`
    fn list_accounts(
        &self,
        filter: &AccountFilter,
        sort: SortColumn,
        ascending: bool,
    ) -> Result<Vec<AccountRecord>>;

    /// Update only the supplied fields on one row
    ///
    /// Keys name record fields; unknown or unsupported keys are silently
    /// dropped so that callers on older or newer schemas keep working.
    /// Returns whether a row changed.
    fn update_fields(&self, id: i64, fields: &BTreeMap<String, Value>) -> Result<bool>;

    /// Delete an account row. The sync core never calls this on its own;
    /// deletion is a host-application operation.
    fn delete_account(&self, id: i64) -> Result<bool>;

    /// Aggregate statistics over all rows
    fn account_stats(&self) -> Result<AccountStats>;
}
