//! SQLite-based account storage with per-field encryption

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, OptionalExtension, params};
use rusqlite_migration::{M, Migrations};
use serde_json::Value as JsonValue;

use super::crypto::FieldCipher;
use super::traits::{AccountFilter, AccountStats, AccountStore, SortColumn, StatusFilter};
use crate::models::{AccountRecord, MachineFingerprint, ModelUsage, UsageSyncState};

/// Database migrations
///
/// Applied in order; the user_version pragma tracks progress. Every step
/// after the first is a pure column addition — the schema only ever grows,
/// so older databases upgrade in place and are never rewritten.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            CREATE TABLE accounts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                email TEXT UNIQUE NOT NULL,
                password TEXT NOT NULL DEFAULT '',
                access_token TEXT NOT NULL DEFAULT '',
                refresh_token TEXT NOT NULL DEFAULT '',
                user_id TEXT NOT NULL DEFAULT '',
                membership_type TEXT NOT NULL DEFAULT 'free',
                days_remaining INTEGER NOT NULL DEFAULT 0,
                usage_percent REAL NOT NULL DEFAULT 0.0,
                used INTEGER NOT NULL DEFAULT 0,
                limit_value INTEGER NOT NULL DEFAULT 1000,
                created_at TEXT NOT NULL,
                last_used TEXT,
                last_refreshed TEXT,
                status TEXT NOT NULL DEFAULT 'active',
                notes TEXT
            );

            CREATE INDEX idx_accounts_membership_type ON accounts(membership_type);
            CREATE INDEX idx_accounts_created_at ON accounts(created_at DESC);
            "#,
        ),
        // Migration 2: Session token and source-store tracking
        M::up(
            r#"
            ALTER TABLE accounts ADD COLUMN session_token TEXT NOT NULL DEFAULT '';
            ALTER TABLE accounts ADD COLUMN store_path TEXT;
            "#,
        ),
        // Migration 3: Billing columns
        M::up(
            r#"
            ALTER TABLE accounts ADD COLUMN subscription_status TEXT;
            ALTER TABLE accounts ADD COLUMN total_cost REAL;
            ALTER TABLE accounts ADD COLUMN total_tokens INTEGER;
            "#,
        ),
        // Migration 4: Unpaid amount and per-model breakdown
        M::up(
            r#"
            ALTER TABLE accounts ADD COLUMN unpaid_amount REAL NOT NULL DEFAULT 0;
            ALTER TABLE accounts ADD COLUMN model_usage_json TEXT;
            "#,
        ),
        // Migration 5: Incremental refresh watermark
        M::up(
            r#"
            ALTER TABLE accounts ADD COLUMN last_refresh_time TEXT;
            ALTER TABLE accounts ADD COLUMN accumulated_cost REAL NOT NULL DEFAULT 0;
            "#,
        ),
        // Migration 6: Invalid flag and machine fingerprint
        M::up(
            r#"
            ALTER TABLE accounts ADD COLUMN is_invalid INTEGER NOT NULL DEFAULT 0;
            ALTER TABLE accounts ADD COLUMN machine_fingerprint_json TEXT;
            "#,
        ),
    ])
}

const SELECT_COLUMNS: &str = "id, email, password, access_token, refresh_token, session_token, \
    user_id, membership_type, days_remaining, subscription_status, usage_percent, used, \
    limit_value, total_cost, unpaid_amount, total_tokens, model_usage_json, last_refresh_time, \
    accumulated_cost, is_invalid, status, store_path, machine_fingerprint_json, created_at, \
    last_used, last_refreshed, notes";

/// Columns writable through `update_fields`, by their record field name
const UPDATABLE_COLUMNS: &[&str] = &[
    "email",
    "user_id",
    "membership_type",
    "days_remaining",
    "subscription_status",
    "usage_percent",
    "used",
    "limit_value",
    "total_cost",
    "unpaid_amount",
    "total_tokens",
    "model_usage_json",
    "last_refresh_time",
    "accumulated_cost",
    "is_invalid",
    "status",
    "store_path",
    "notes",
    "last_used",
    "last_refreshed",
];

/// Fields encrypted before they touch the database
const ENCRYPTED_COLUMNS: &[&str] = &[
    "password",
    "access_token",
    "refresh_token",
    "session_token",
];

/// SQLite-backed account storage
///
/// Credential fields and fingerprint values are encrypted independently
/// with the process-wide cipher before storage; rows decrypt best-effort
/// on the way out.
pub struct SqliteAccountStore {
    conn: Mutex<Connection>,
    cipher: FieldCipher,
}

impl SqliteAccountStore {
    /// Open (or create) the account database
    pub fn new(db_path: impl AsRef<Path>, cipher: FieldCipher) -> Result<Self> {
        let mut conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        // WAL keeps readers unblocked during the caller's concurrent
        // syncs; NORMAL sync is safe under WAL.
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            "#,
        )?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
            cipher,
        })
    }

    fn encrypt_field(&self, value: &str) -> Result<String> {
        self.cipher.encrypt(value)
    }

    /// Fingerprint map with each value encrypted on its own, as JSON
    fn encode_fingerprint(&self, fingerprint: &MachineFingerprint) -> Result<String> {
        let mut encrypted = BTreeMap::new();
        for (key, value) in fingerprint.iter() {
            encrypted.insert(key.to_string(), self.encrypt_field(value)?);
        }
        serde_json::to_string(&encrypted).context("Failed to serialize machine fingerprint")
    }

    fn decode_fingerprint(&self, json: &str) -> Option<MachineFingerprint> {
        let encrypted: BTreeMap<String, String> = match serde_json::from_str(json) {
            Ok(map) => map,
            Err(e) => {
                log::warn!("[STORE] unreadable machine fingerprint json: {e}");
                return None;
            }
        };

        let fingerprint = MachineFingerprint::from_pairs(
            encrypted
                .iter()
                .map(|(k, v)| (k.clone(), self.cipher.decrypt_or_sentinel(v))),
        );

        if fingerprint.is_empty() {
            None
        } else {
            Some(fingerprint)
        }
    }

    fn row_to_record(&self, row: &rusqlite::Row<'_>) -> rusqlite::Result<AccountRecord> {
        let model_usage_json: Option<String> = row.get(16)?;
        let model_usage: BTreeMap<String, ModelUsage> = model_usage_json
            .as_deref()
            .and_then(|json| match serde_json::from_str(json) {
                Ok(map) => Some(map),
                Err(e) => {
                    log::warn!("[STORE] unreadable model usage json: {e}");
                    None
                }
            })
            .unwrap_or_default();

        let fingerprint_json: Option<String> = row.get(22)?;
        let machine_info = fingerprint_json
            .as_deref()
            .and_then(|json| self.decode_fingerprint(json));

        let last_refresh_time: Option<String> = row.get(17)?;
        let sync = UsageSyncState::new(
            last_refresh_time.as_deref().and_then(parse_rfc3339),
            row.get(18)?,
        );

        let created_at: String = row.get(23)?;
        let last_used: Option<String> = row.get(24)?;
        let last_refreshed: Option<String> = row.get(25)?;

        Ok(AccountRecord {
            id: row.get(0)?,
            email: row.get(1)?,
            password: self.cipher.decrypt_or_sentinel(&row.get::<_, String>(2)?),
            access_token: self.cipher.decrypt_or_sentinel(&row.get::<_, String>(3)?),
            refresh_token: self.cipher.decrypt_or_sentinel(&row.get::<_, String>(4)?),
            session_token: self.cipher.decrypt_or_sentinel(&row.get::<_, String>(5)?),
            user_id: row.get(6)?,
            membership_type: row.get(7)?,
            days_remaining: row.get(8)?,
            subscription_status: row.get(9)?,
            usage_percent: row.get(10)?,
            used: row.get(11)?,
            limit_value: row.get(12)?,
            total_cost: row.get(13)?,
            unpaid_amount: row.get(14)?,
            total_tokens: row.get(15)?,
            model_usage,
            sync,
            is_invalid: row.get(19)?,
            status: row.get(20)?,
            store_path: row.get(21)?,
            machine_info,
            created_at: parse_rfc3339(&created_at).unwrap_or_else(Utc::now),
            last_used: last_used.as_deref().and_then(parse_rfc3339),
            last_refreshed: last_refreshed.as_deref().and_then(parse_rfc3339),
            notes: row.get(26)?,
        })
    }
}

impl AccountStore for SqliteAccountStore {
    fn upsert_account(&self, record: &AccountRecord) -> Result<i64> {
        let password = self.encrypt_field(&record.password)?;
        let access_token = self.encrypt_field(&record.access_token)?;
        let refresh_token = self.encrypt_field(&record.refresh_token)?;
        let session_token = self.encrypt_field(&record.session_token)?;
        let fingerprint_json = record
            .machine_info
            .as_ref()
            .map(|fp| self.encode_fingerprint(fp))
            .transpose()?;
        let model_usage_json = if record.model_usage.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&record.model_usage)?)
        };

        let conn = self.conn.lock().unwrap();

        // ON CONFLICT keeps the original row (and its created_at) instead
        // of deleting and re-inserting it
        conn.execute(
            "INSERT INTO accounts
             (email, password, access_token, refresh_token, session_token, user_id,
              membership_type, days_remaining, subscription_status, usage_percent, used,
              limit_value, total_cost, unpaid_amount, total_tokens, model_usage_json,
              last_refresh_time, accumulated_cost, is_invalid, status, store_path,
              machine_fingerprint_json, created_at, last_used, last_refreshed, notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)
             ON CONFLICT(email) DO UPDATE SET
                password = excluded.password,
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                session_token = excluded.session_token,
                user_id = excluded.user_id,
                membership_type = excluded.membership_type,
                days_remaining = excluded.days_remaining,
                subscription_status = excluded.subscription_status,
                usage_percent = excluded.usage_percent,
                used = excluded.used,
                limit_value = excluded.limit_value,
                total_cost = excluded.total_cost,
                unpaid_amount = excluded.unpaid_amount,
                total_tokens = excluded.total_tokens,
                model_usage_json = excluded.model_usage_json,
                last_refresh_time = excluded.last_refresh_time,
                accumulated_cost = excluded.accumulated_cost,
                is_invalid = excluded.is_invalid,
                status = excluded.status,
                store_path = excluded.store_path,
                machine_fingerprint_json = excluded.machine_fingerprint_json,
                last_used = excluded.last_used,
                last_refreshed = excluded.last_refreshed,
                notes = excluded.notes",
            params![
                record.email,
                password,
                access_token,
                refresh_token,
                session_token,
                record.user_id,
                record.membership_type,
                record.days_remaining,
                record.subscription_status,
                record.usage_percent,
                record.used,
                record.limit_value,
                record.total_cost,
                record.unpaid_amount,
                record.total_tokens,
                model_usage_json,
                record.sync.last_refresh_time.map(|t| t.to_rfc3339()),
                record.sync.accumulated_cost,
                record.is_invalid,
                record.status,
                record.store_path,
                fingerprint_json,
                record.created_at.to_rfc3339(),
                record.last_used.map(|t| t.to_rfc3339()),
                record.last_refreshed.map(|t| t.to_rfc3339()),
                record.notes,
            ],
        )?;

        let id: i64 = conn.query_row(
            "SELECT id FROM accounts WHERE email = ?",
            [&record.email],
            |row| row.get(0),
        )?;

        Ok(id)
    }

    fn get_account(&self, id: i64) -> Result<Option<AccountRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM accounts WHERE id = ?"),
                [id],
                |row| self.row_to_record(row),
            )
            .optional()?;
        Ok(record)
    }

    fn get_account_by_email(&self, email: &str) -> Result<Option<AccountRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM accounts WHERE email = ?"),
                [email],
                |row| self.row_to_record(row),
            )
            .optional()?;
        Ok(record)
    }

    fn list_accounts(
        &self,
        filter: &AccountFilter,
        sort: SortColumn,
        ascending: bool,
    ) -> Result<Vec<AccountRecord>> {
        let mut sql = format!("SELECT {SELECT_COLUMNS} FROM accounts WHERE 1=1");
        let mut bind: Vec<SqlValue> = Vec::new();

        if let Some(prefix) = &filter.plan_prefix {
            // `free` matches both `free` and `free_trial`
            let lower = prefix.to_lowercase();
            sql.push_str(" AND (membership_type = ? OR membership_type LIKE ?)");
            bind.push(SqlValue::Text(lower.clone()));
            bind.push(SqlValue::Text(format!("{lower}_%")));
        }

        match filter.status {
            Some(StatusFilter::Active) => {
                sql.push_str(" AND status = 'active' AND is_invalid = 0");
            }
            Some(StatusFilter::Expired) => {
                sql.push_str(" AND (status = 'expired' OR is_invalid = 1)");
            }
            Some(StatusFilter::NoPayment) => {
                sql.push_str(
                    " AND membership_type LIKE 'free%' AND days_remaining = 0 \
                     AND (subscription_status IS NULL OR subscription_status = '')",
                );
            }
            None => {}
        }

        if let Some(month) = &filter.created_month {
            sql.push_str(" AND strftime('%Y-%m', created_at) = ?");
            bind.push(SqlValue::Text(month.clone()));
        }

        let order = if ascending { "ASC" } else { "DESC" };
        sql.push_str(&format!(" ORDER BY {} {order}", sort_sql(sort)));

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let records = stmt
            .query_map(rusqlite::params_from_iter(bind), |row| {
                self.row_to_record(row)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    fn update_fields(&self, id: i64, fields: &BTreeMap<String, JsonValue>) -> Result<bool> {
        let mut columns: Vec<String> = Vec::new();
        let mut bind: Vec<SqlValue> = Vec::new();

        for (key, value) in fields {
            // `limit` survives from the wire shape of older callers
            let key = if key == "limit" { "limit_value" } else { key.as_str() };

            if key == "machine_info" {
                let Some(object) = value.as_object() else {
                    log::debug!("[STORE] dropping non-object machine_info update");
                    continue;
                };
                let fingerprint = MachineFingerprint::from_pairs(
                    object
                        .iter()
                        .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))),
                );
                columns.push("machine_fingerprint_json = ?".to_string());
                bind.push(SqlValue::Text(self.encode_fingerprint(&fingerprint)?));
            } else if key == "model_usage" {
                columns.push("model_usage_json = ?".to_string());
                bind.push(SqlValue::Text(serde_json::to_string(value)?));
            } else if ENCRYPTED_COLUMNS.contains(&key) {
                let plaintext = value.as_str().map(str::to_string).unwrap_or_default();
                columns.push(format!("{key} = ?"));
                bind.push(SqlValue::Text(self.encrypt_field(&plaintext)?));
            } else if UPDATABLE_COLUMNS.contains(&key) {
                columns.push(format!("{key} = ?"));
                bind.push(json_to_sql(value));
            } else {
                // tolerate forward/backward schema drift
                log::debug!("[STORE] dropping unknown field in update: {key}");
            }
        }

        if columns.is_empty() {
            return Ok(false);
        }

        bind.push(SqlValue::Integer(id));
        let sql = format!("UPDATE accounts SET {} WHERE id = ?", columns.join(", "));

        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(&sql, rusqlite::params_from_iter(bind))?;
        Ok(changed > 0)
    }

    fn delete_account(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM accounts WHERE id = ?", [id])?;
        Ok(deleted > 0)
    }

    fn account_stats(&self) -> Result<AccountStats> {
        let conn = self.conn.lock().unwrap();

        let total: i64 = conn.query_row("SELECT COUNT(*) FROM accounts", [], |row| row.get(0))?;

        let mut by_plan = BTreeMap::new();
        let mut stmt =
            conn.prepare("SELECT membership_type, COUNT(*) FROM accounts GROUP BY membership_type")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            by_plan.insert(row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize);
        }

        let mut by_status = BTreeMap::new();
        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM accounts GROUP BY status")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            by_status.insert(row.get::<_, String>(0)?, row.get::<_, i64>(1)? as usize);
        }

        let avg: Option<f64> = conn.query_row(
            "SELECT AVG(usage_percent) FROM accounts WHERE status = 'active'",
            [],
            |row| row.get(0),
        )?;

        Ok(AccountStats {
            total: total as usize,
            by_plan,
            by_status,
            avg_usage_percent: ((avg.unwrap_or(0.0)) * 10.0).round() / 10.0,
        })
    }
}

fn sort_sql(sort: SortColumn) -> &'static str {
    match sort {
        SortColumn::CreatedAt => "created_at",
        SortColumn::Email => "email",
        SortColumn::MembershipType => "membership_type",
        SortColumn::UsagePercent => "usage_percent",
        SortColumn::DaysRemaining => "days_remaining",
        SortColumn::TotalCost => "COALESCE(total_cost, 0)",
        SortColumn::UnpaidAmount => "COALESCE(unpaid_amount, 0)",
        SortColumn::TotalTokens => "COALESCE(total_tokens, 0)",
        SortColumn::LastRefreshed => "COALESCE(last_refreshed, '')",
    }
}

fn json_to_sql(value: &JsonValue) -> SqlValue {
    match value {
        JsonValue::Null => SqlValue::Null,
        JsonValue::Bool(b) => SqlValue::Integer(*b as i64),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or(0.0)),
        },
        JsonValue::String(s) => SqlValue::Text(s.clone()),
        other => SqlValue::Text(other.to_string()),
    }
}

fn parse_rfc3339(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;
    use tempfile::tempdir;

    fn create_test_store() -> (SqliteAccountStore, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("accounts.test.sqlite");
        let store = SqliteAccountStore::new(&db_path, FieldCipher::new("test-key")).unwrap();
        (store, dir)
    }

    fn make_test_account(email: &str) -> AccountRecord {
        AccountRecord::new(email)
            .with_tokens("eyJaccess.payload.sig", None, "user_1::eyJaccess.payload.sig")
            .with_user_id("user_1")
    }

    #[test]
    fn test_upsert_is_idempotent() {
        let (store, _dir) = create_test_store();

        let account = make_test_account("a@b.c");
        let id1 = store.upsert_account(&account).unwrap();
        let id2 = store.upsert_account(&account).unwrap();
        assert_eq!(id1, id2);

        let listed = store
            .list_accounts(&AccountFilter::default(), SortColumn::CreatedAt, false)
            .unwrap();
        assert_eq!(listed.len(), 1);

        let loaded = store.get_account(id1).unwrap().unwrap();
        assert_eq!(loaded.email, "a@b.c");
        assert_eq!(loaded.access_token, "eyJaccess.payload.sig");
        assert_eq!(loaded.refresh_token, "eyJaccess.payload.sig");
        assert_eq!(loaded.session_token, "user_1::eyJaccess.payload.sig");
    }

    #[test]
    fn test_upsert_updates_in_place_and_keeps_created_at() {
        let (store, _dir) = create_test_store();

        let mut account = make_test_account("a@b.c");
        account.created_at = Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap();
        let id = store.upsert_account(&account).unwrap();

        account.membership_type = "pro".to_string();
        account.created_at = Utc::now();
        let id2 = store.upsert_account(&account).unwrap();
        assert_eq!(id, id2);

        let loaded = store.get_account(id).unwrap().unwrap();
        assert_eq!(loaded.membership_type, "pro");
        assert_eq!(
            loaded.created_at,
            Utc.with_ymd_and_hms(2025, 1, 15, 0, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_tokens_are_encrypted_at_rest() {
        let (store, _dir) = create_test_store();
        let id = store.upsert_account(&make_test_account("a@b.c")).unwrap();

        let conn = store.conn.lock().unwrap();
        let stored: String = conn
            .query_row("SELECT access_token FROM accounts WHERE id = ?", [id], |r| {
                r.get(0)
            })
            .unwrap();
        drop(conn);

        assert!(!stored.is_empty());
        assert!(!stored.contains("eyJaccess"));
        assert_ne!(stored, "eyJaccess.payload.sig");
    }

    #[test]
    fn test_corrupted_field_reads_as_sentinel() {
        let (store, _dir) = create_test_store();
        let id = store.upsert_account(&make_test_account("a@b.c")).unwrap();

        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE accounts SET access_token = 'garbage' WHERE id = ?",
                [id],
            )
            .unwrap();
        }

        let loaded = store.get_account(id).unwrap().unwrap();
        assert_eq!(loaded.access_token, crate::storage::DECRYPT_SENTINEL);
        // sibling fields stay readable
        assert_eq!(loaded.session_token, "user_1::eyJaccess.payload.sig");
    }

    #[test]
    fn test_machine_fingerprint_roundtrip() {
        let (store, _dir) = create_test_store();

        let fingerprint = MachineFingerprint::generate(Some("user_1"));
        let account = make_test_account("a@b.c").with_machine_info(fingerprint.clone());
        let id = store.upsert_account(&account).unwrap();

        let loaded = store.get_account(id).unwrap().unwrap();
        assert_eq!(loaded.machine_info, Some(fingerprint.clone()));

        // values must be individually encrypted at rest
        let conn = store.conn.lock().unwrap();
        let stored: String = conn
            .query_row(
                "SELECT machine_fingerprint_json FROM accounts WHERE id = ?",
                [id],
                |r| r.get(0),
            )
            .unwrap();
        assert!(!stored.contains(fingerprint.get("system.machineGuid").unwrap()));
    }

    #[test]
    fn test_plan_prefix_filter_matches_trials() {
        let (store, _dir) = create_test_store();

        let mut free = make_test_account("free@b.c");
        free.membership_type = "free".into();
        let mut trial = make_test_account("trial@b.c");
        trial.membership_type = "free_trial".into();
        let mut pro = make_test_account("pro@b.c");
        pro.membership_type = "pro".into();

        store.upsert_account(&free).unwrap();
        store.upsert_account(&trial).unwrap();
        store.upsert_account(&pro).unwrap();

        let filter = AccountFilter {
            plan_prefix: Some("free".into()),
            ..Default::default()
        };
        let listed = store
            .list_accounts(&filter, SortColumn::Email, true)
            .unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|a| a.membership_type.starts_with("free")));
    }

    #[test]
    fn test_active_filter_excludes_invalid_accounts() {
        let (store, _dir) = create_test_store();

        let ok = make_test_account("ok@b.c");
        let mut invalid = make_test_account("bad@b.c");
        invalid.is_invalid = true;
        let mut expired = make_test_account("old@b.c");
        expired.status = "expired".into();

        store.upsert_account(&ok).unwrap();
        store.upsert_account(&invalid).unwrap();
        store.upsert_account(&expired).unwrap();

        let active = store
            .list_accounts(
                &AccountFilter {
                    status: Some(StatusFilter::Active),
                    ..Default::default()
                },
                SortColumn::Email,
                true,
            )
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].email, "ok@b.c");

        let expired = store
            .list_accounts(
                &AccountFilter {
                    status: Some(StatusFilter::Expired),
                    ..Default::default()
                },
                SortColumn::Email,
                true,
            )
            .unwrap();
        assert_eq!(expired.len(), 2);
    }

    #[test]
    fn test_sort_by_cost_treats_null_as_zero() {
        let (store, _dir) = create_test_store();

        let mut cheap = make_test_account("cheap@b.c");
        cheap.total_cost = Some(1.0);
        let mut costly = make_test_account("costly@b.c");
        costly.total_cost = Some(9.0);
        let unsynced = make_test_account("null@b.c");

        store.upsert_account(&cheap).unwrap();
        store.upsert_account(&costly).unwrap();
        store.upsert_account(&unsynced).unwrap();

        let listed = store
            .list_accounts(&AccountFilter::default(), SortColumn::TotalCost, true)
            .unwrap();
        let emails: Vec<&str> = listed.iter().map(|a| a.email.as_str()).collect();
        assert_eq!(emails, vec!["null@b.c", "cheap@b.c", "costly@b.c"]);
    }

    #[test]
    fn test_created_month_filter() {
        let (store, _dir) = create_test_store();

        let mut march = make_test_account("march@b.c");
        march.created_at = Utc.with_ymd_and_hms(2025, 3, 10, 0, 0, 0).unwrap();
        let mut october = make_test_account("october@b.c");
        october.created_at = Utc.with_ymd_and_hms(2025, 10, 2, 0, 0, 0).unwrap();

        store.upsert_account(&march).unwrap();
        store.upsert_account(&october).unwrap();

        let listed = store
            .list_accounts(
                &AccountFilter {
                    created_month: Some("2025-03".into()),
                    ..Default::default()
                },
                SortColumn::CreatedAt,
                false,
            )
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].email, "march@b.c");
    }

    #[test]
    fn test_update_fields_drops_unknown_keys() {
        let (store, _dir) = create_test_store();
        let id = store.upsert_account(&make_test_account("a@b.c")).unwrap();

        let mut fields = BTreeMap::new();
        fields.insert("membership_type".to_string(), json!("pro"));
        fields.insert("is_invalid".to_string(), json!(true));
        fields.insert("some_future_column".to_string(), json!("ignored"));

        assert!(store.update_fields(id, &fields).unwrap());

        let loaded = store.get_account(id).unwrap().unwrap();
        assert_eq!(loaded.membership_type, "pro");
        assert!(loaded.is_invalid);
    }

    #[test]
    fn test_update_fields_with_only_unknown_keys_is_a_noop() {
        let (store, _dir) = create_test_store();
        let id = store.upsert_account(&make_test_account("a@b.c")).unwrap();

        let mut fields = BTreeMap::new();
        fields.insert("not_a_column".to_string(), json!(1));
        assert!(!store.update_fields(id, &fields).unwrap());
    }

    #[test]
    fn test_update_fields_encrypts_tokens() {
        let (store, _dir) = create_test_store();
        let id = store.upsert_account(&make_test_account("a@b.c")).unwrap();

        let mut fields = BTreeMap::new();
        fields.insert("access_token".to_string(), json!("eyJnew.token.sig"));
        store.update_fields(id, &fields).unwrap();

        let conn = store.conn.lock().unwrap();
        let stored: String = conn
            .query_row("SELECT access_token FROM accounts WHERE id = ?", [id], |r| {
                r.get(0)
            })
            .unwrap();
        drop(conn);
        assert!(!stored.contains("eyJnew"));

        let loaded = store.get_account(id).unwrap().unwrap();
        assert_eq!(loaded.access_token, "eyJnew.token.sig");
    }

    #[test]
    fn test_reopen_existing_database() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("accounts.test.sqlite");

        let id = {
            let store = SqliteAccountStore::new(&db_path, FieldCipher::new("test-key")).unwrap();
            store.upsert_account(&make_test_account("a@b.c")).unwrap()
        };

        // reopening re-runs migrations harmlessly and reads old rows
        let store = SqliteAccountStore::new(&db_path, FieldCipher::new("test-key")).unwrap();
        let loaded = store.get_account(id).unwrap().unwrap();
        assert_eq!(loaded.email, "a@b.c");
        assert_eq!(loaded.access_token, "eyJaccess.payload.sig");
    }

    #[test]
    fn test_watermark_roundtrip() {
        let (store, _dir) = create_test_store();

        let mut account = make_test_account("a@b.c");
        let t = Utc.with_ymd_and_hms(2025, 10, 5, 12, 0, 0).unwrap();
        account.sync = UsageSyncState::new(Some(t), 12.34);
        let id = store.upsert_account(&account).unwrap();

        let loaded = store.get_account(id).unwrap().unwrap();
        assert_eq!(loaded.sync.last_refresh_time, Some(t));
        assert_eq!(loaded.sync.accumulated_cost, 12.34);
    }

    #[test]
    fn test_account_stats() {
        let (store, _dir) = create_test_store();

        let mut a = make_test_account("a@b.c");
        a.membership_type = "pro".into();
        a.usage_percent = 40.0;
        let mut b = make_test_account("b@b.c");
        b.usage_percent = 20.0;
        let mut c = make_test_account("c@b.c");
        c.status = "expired".into();
        c.usage_percent = 99.0;

        store.upsert_account(&a).unwrap();
        store.upsert_account(&b).unwrap();
        store.upsert_account(&c).unwrap();

        let stats = store.account_stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.by_plan["pro"], 1);
        assert_eq!(stats.by_plan["free"], 2);
        assert_eq!(stats.by_status["active"], 2);
        assert_eq!(stats.avg_usage_percent, 30.0);
    }
}
