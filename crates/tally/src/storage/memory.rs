//! In-memory storage implementation
//!
//! Used for tests and as a stand-in where no durable store is wanted.
//! Values are held decrypted; the encryption discipline is a property of
//! the SQLite backend, not of the trait.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};

use super::traits::{AccountFilter, AccountStats, AccountStore, SortColumn, StatusFilter};
use crate::models::{AccountRecord, MachineFingerprint, ModelUsage};

/// In-memory implementation of [`AccountStore`]
pub struct InMemoryAccountStore {
    accounts: RwLock<HashMap<i64, AccountRecord>>,
    next_id: AtomicI64,
}

impl InMemoryAccountStore {
    pub fn new() -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

impl Default for InMemoryAccountStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountStore for InMemoryAccountStore {
    fn upsert_account(&self, record: &AccountRecord) -> Result<i64> {
        let mut accounts = self.accounts.write().unwrap();

        let existing = accounts
            .values()
            .find(|a| a.email == record.email)
            .map(|a| (a.id, a.created_at));

        let (id, created_at) = match existing {
            Some(found) => found,
            None => (
                self.next_id.fetch_add(1, AtomicOrdering::SeqCst),
                record.created_at,
            ),
        };

        let mut stored = record.clone();
        stored.id = id;
        stored.created_at = created_at;
        accounts.insert(id, stored);

        Ok(id)
    }

    fn get_account(&self, id: i64) -> Result<Option<AccountRecord>> {
        Ok(self.accounts.read().unwrap().get(&id).cloned())
    }

    fn get_account_by_email(&self, email: &str) -> Result<Option<AccountRecord>> {
        Ok(self
            .accounts
            .read()
            .unwrap()
            .values()
            .find(|a| a.email == email)
            .cloned())
    }

    fn list_accounts(
        &self,
        filter: &AccountFilter,
        sort: SortColumn,
        ascending: bool,
    ) -> Result<Vec<AccountRecord>> {
        let accounts = self.accounts.read().unwrap();

        let mut matched: Vec<AccountRecord> = accounts
            .values()
            .filter(|a| matches_filter(a, filter))
            .cloned()
            .collect();

        matched.sort_by(|a, b| compare(a, b, sort));
        if !ascending {
            matched.reverse();
        }

        Ok(matched)
    }

    fn update_fields(&self, id: i64, fields: &BTreeMap<String, JsonValue>) -> Result<bool> {
        let mut accounts = self.accounts.write().unwrap();
        let Some(record) = accounts.get_mut(&id) else {
            return Ok(false);
        };

        let mut changed = false;
        for (key, value) in fields {
            changed |= apply_field(record, key, value);
        }

        Ok(changed)
    }

    fn delete_account(&self, id: i64) -> Result<bool> {
        Ok(self.accounts.write().unwrap().remove(&id).is_some())
    }

    fn account_stats(&self) -> Result<AccountStats> {
        let accounts = self.accounts.read().unwrap();

        let mut by_plan: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        let mut active_usage = Vec::new();

        for account in accounts.values() {
            *by_plan.entry(account.membership_type.clone()).or_default() += 1;
            *by_status.entry(account.status.clone()).or_default() += 1;
            if account.status == "active" {
                active_usage.push(account.usage_percent);
            }
        }

        let avg = if active_usage.is_empty() {
            0.0
        } else {
            active_usage.iter().sum::<f64>() / active_usage.len() as f64
        };

        Ok(AccountStats {
            total: accounts.len(),
            by_plan,
            by_status,
            avg_usage_percent: (avg * 10.0).round() / 10.0,
        })
    }
}

fn matches_filter(account: &AccountRecord, filter: &AccountFilter) -> bool {
    if let Some(prefix) = &filter.plan_prefix {
        let lower = prefix.to_lowercase();
        let plan = account.membership_type.to_lowercase();
        if plan != lower && !plan.starts_with(&format!("{lower}_")) {
            return false;
        }
    }

    match filter.status {
        Some(StatusFilter::Active) => {
            if account.status != "active" || account.is_invalid {
                return false;
            }
        }
        Some(StatusFilter::Expired) => {
            if account.status != "expired" && !account.is_invalid {
                return false;
            }
        }
        Some(StatusFilter::NoPayment) => {
            let free = account.membership_type.to_lowercase().starts_with("free");
            let no_subscription = account
                .subscription_status
                .as_deref()
                .is_none_or(|s| s.is_empty());
            if !free || account.days_remaining != 0 || !no_subscription {
                return false;
            }
        }
        None => {}
    }

    if let Some(month) = &filter.created_month
        && account.created_at.format("%Y-%m").to_string() != *month
    {
        return false;
    }

    true
}

fn compare(a: &AccountRecord, b: &AccountRecord, sort: SortColumn) -> Ordering {
    match sort {
        SortColumn::CreatedAt => a.created_at.cmp(&b.created_at),
        SortColumn::Email => a.email.cmp(&b.email),
        SortColumn::MembershipType => a.membership_type.cmp(&b.membership_type),
        SortColumn::UsagePercent => cmp_f64(a.usage_percent, b.usage_percent),
        SortColumn::DaysRemaining => a.days_remaining.cmp(&b.days_remaining),
        SortColumn::TotalCost => cmp_f64(a.total_cost.unwrap_or(0.0), b.total_cost.unwrap_or(0.0)),
        SortColumn::UnpaidAmount => cmp_f64(a.unpaid_amount, b.unpaid_amount),
        SortColumn::TotalTokens => a.total_tokens.unwrap_or(0).cmp(&b.total_tokens.unwrap_or(0)),
        SortColumn::LastRefreshed => a.last_refreshed.cmp(&b.last_refreshed),
    }
}

fn cmp_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// Apply one update-field entry; unknown keys are dropped
fn apply_field(record: &mut AccountRecord, key: &str, value: &JsonValue) -> bool {
    let key = if key == "limit" { "limit_value" } else { key };

    match key {
        "email" => set_string(&mut record.email, value),
        "password" => set_string(&mut record.password, value),
        "access_token" => set_string(&mut record.access_token, value),
        "refresh_token" => set_string(&mut record.refresh_token, value),
        "session_token" => set_string(&mut record.session_token, value),
        "user_id" => set_string(&mut record.user_id, value),
        "membership_type" => set_string(&mut record.membership_type, value),
        "status" => set_string(&mut record.status, value),
        "subscription_status" => set_opt_string(&mut record.subscription_status, value),
        "store_path" => set_opt_string(&mut record.store_path, value),
        "notes" => set_opt_string(&mut record.notes, value),
        "days_remaining" => set_i64(&mut record.days_remaining, value),
        "used" => set_i64(&mut record.used, value),
        "limit_value" => set_i64(&mut record.limit_value, value),
        "usage_percent" => set_f64(&mut record.usage_percent, value),
        "unpaid_amount" => set_f64(&mut record.unpaid_amount, value),
        "accumulated_cost" => set_f64(&mut record.sync.accumulated_cost, value),
        "total_cost" => {
            record.total_cost = value.as_f64();
            true
        }
        "total_tokens" => {
            record.total_tokens = value.as_i64();
            true
        }
        "is_invalid" => {
            match value {
                JsonValue::Bool(b) => record.is_invalid = *b,
                JsonValue::Number(n) => record.is_invalid = n.as_i64().unwrap_or(0) != 0,
                _ => return false,
            }
            true
        }
        "last_refresh_time" => {
            record.sync.last_refresh_time = parse_opt_time(value);
            true
        }
        "last_used" => {
            record.last_used = parse_opt_time(value);
            true
        }
        "last_refreshed" => {
            record.last_refreshed = parse_opt_time(value);
            true
        }
        "model_usage" | "model_usage_json" => {
            let parsed: Option<BTreeMap<String, ModelUsage>> = match value {
                JsonValue::String(json) => serde_json::from_str(json).ok(),
                object => serde_json::from_value(object.clone()).ok(),
            };
            match parsed {
                Some(usage) => {
                    record.model_usage = usage;
                    true
                }
                None => false,
            }
        }
        "machine_info" => match value.as_object() {
            Some(object) => {
                record.machine_info = Some(MachineFingerprint::from_pairs(
                    object
                        .iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))),
                ));
                true
            }
            None => false,
        },
        _ => {
            log::debug!("[STORE] dropping unknown field in update: {key}");
            false
        }
    }
}

fn set_string(target: &mut String, value: &JsonValue) -> bool {
    match value.as_str() {
        Some(s) => {
            *target = s.to_string();
            true
        }
        None => false,
    }
}

fn set_opt_string(target: &mut Option<String>, value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => {
            *target = None;
            true
        }
        JsonValue::String(s) => {
            *target = Some(s.clone());
            true
        }
        _ => false,
    }
}

fn set_i64(target: &mut i64, value: &JsonValue) -> bool {
    match value.as_i64() {
        Some(n) => {
            *target = n;
            true
        }
        None => false,
    }
}

fn set_f64(target: &mut f64, value: &JsonValue) -> bool {
    match value.as_f64() {
        Some(n) => {
            *target = n;
            true
        }
        None => false,
    }
}

fn parse_opt_time(value: &JsonValue) -> Option<DateTime<Utc>> {
    value.as_str().and_then(|s| {
        DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    })
}
