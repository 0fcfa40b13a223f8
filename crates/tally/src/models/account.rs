//! Account model owned by the encrypted store

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{MachineFingerprint, UsageSyncState};

/// Cost/usage totals attributed to one model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ModelUsage {
    pub cost: f64,
    pub tokens: i64,
    pub count: i64,
}

/// A tracked editor account
///
/// One row per `email` in the store; every other component works on
/// transient copies of this value. Credential fields and fingerprint
/// values are held decrypted here — encryption happens at the store
/// boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    /// Database row id (0 until first persisted)
    pub id: i64,
    /// Unique account key
    pub email: String,
    pub password: String,
    pub access_token: String,
    /// Defaults to the access token when the source store has none
    pub refresh_token: String,
    /// Composite `user_id::jwt`; may be empty
    pub session_token: String,
    pub user_id: String,
    pub membership_type: String,
    pub days_remaining: i64,
    pub subscription_status: Option<String>,
    pub usage_percent: f64,
    pub used: i64,
    pub limit_value: i64,
    /// Displayed total, mirrors the accumulated watermark cost
    pub total_cost: Option<f64>,
    pub unpaid_amount: f64,
    pub total_tokens: Option<i64>,
    /// Per-model cost breakdown for the most recent refresh window
    pub model_usage: BTreeMap<String, ModelUsage>,
    /// Incremental refresh watermark
    pub sync: UsageSyncState,
    pub machine_info: Option<MachineFingerprint>,
    /// Set when the most recent refresh resolved no data for this account
    pub is_invalid: bool,
    /// active / expired
    pub status: String,
    /// Path of the scanned state store this account came from, if any
    pub store_path: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub last_refreshed: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl AccountRecord {
    /// Create a new account (id will be assigned by the store)
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            id: 0,
            email: email.into(),
            password: String::new(),
            access_token: String::new(),
            refresh_token: String::new(),
            session_token: String::new(),
            user_id: String::new(),
            membership_type: "free".to_string(),
            days_remaining: 0,
            subscription_status: None,
            usage_percent: 0.0,
            used: 0,
            limit_value: 1000,
            total_cost: None,
            unpaid_amount: 0.0,
            total_tokens: None,
            model_usage: BTreeMap::new(),
            sync: UsageSyncState::empty(),
            machine_info: None,
            is_invalid: false,
            status: "active".to_string(),
            store_path: None,
            created_at: Utc::now(),
            last_used: None,
            last_refreshed: None,
            notes: None,
        }
    }

    /// Set the credential triple; an empty refresh token falls back to the
    /// access token
    pub fn with_tokens(
        mut self,
        access_token: impl Into<String>,
        refresh_token: Option<String>,
        session_token: impl Into<String>,
    ) -> Self {
        self.access_token = access_token.into();
        self.refresh_token = match refresh_token {
            Some(t) if !t.is_empty() => t,
            _ => self.access_token.clone(),
        };
        self.session_token = session_token.into();
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    pub fn with_machine_info(mut self, machine_info: MachineFingerprint) -> Self {
        self.machine_info = Some(machine_info);
        self
    }

    pub fn with_store_path(mut self, store_path: impl Into<String>) -> Self {
        self.store_path = Some(store_path.into());
        self
    }

    /// Whether the account counts as usable for filtering purposes
    pub fn is_active(&self) -> bool {
        self.status == "active" && !self.is_invalid
    }
}
