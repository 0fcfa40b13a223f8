//! Integration tests for the tally crate
//!
//! These tests verify the complete flow from credential resolution
//! through merging and encrypted persistence, against both store
//! backends.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;

use tally::api::cost::{CostBreakdown, aggregate_events};
use tally::api::wire::{TokenUsage, UsageEvent};
use tally::api::AccountSnapshot;
use tally::models::{AccountRecord, MachineFingerprint, TokenKind, UsageSyncState};
use tally::scanner::RawCredentialRecord;
use tally::storage::{
    AccountFilter, AccountStore, FieldCipher, InMemoryAccountStore, SortColumn,
    SqliteAccountStore, StatusFilter,
};
use tally::sync::merge_snapshot;
use tally::{resolve_email, resolve_token};
use tempfile::TempDir;

/// Helper to build a decodable JWT with the given payload JSON
fn make_jwt(payload: &str) -> String {
    format!(
        "{}.{}.{}",
        URL_SAFE_NO_PAD.encode(r#"{"alg":"HS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(payload),
        "sig"
    )
}

/// Helper to build a charged usage event
fn make_event(model: &str, cents: f64, millis: i64) -> UsageEvent {
    UsageEvent {
        kind: "USAGE_EVENT_KIND_USAGE_BASED".to_string(),
        model: Some(model.to_string()),
        timestamp: Some(millis.to_string()),
        token_usage: Some(TokenUsage {
            total_cents: cents,
            input_tokens: 100,
            output_tokens: 50,
            cache_write_tokens: 10,
            cache_read_tokens: 200,
        }),
    }
}

fn make_snapshot(events: &[UsageEvent], membership: &str) -> AccountSnapshot {
    let cost = aggregate_events(events, membership);
    AccountSnapshot {
        email: "user@example.com".to_string(),
        user_id: "user_42".to_string(),
        membership_type: membership.to_string(),
        used: 17,
        limit_value: 500,
        usage_percent: 3.4,
        days_remaining: 5,
        subscription_status: Some("trialing".to_string()),
        event_count: events.len(),
        newest_event_at: events.first().and_then(|e| e.timestamp_utc()),
        cost,
    }
}

fn sqlite_store() -> (SqliteAccountStore, TempDir) {
    let dir = TempDir::new().unwrap();
    let store =
        SqliteAccountStore::new(dir.path().join("accounts.sqlite"), FieldCipher::new("itest"))
            .unwrap();
    (store, dir)
}

#[test]
fn test_resolve_then_persist_then_incremental_refresh() {
    let (store, _dir) = sqlite_store();

    // 1. a scanned store with an access token whose subject is a user id
    let jwt = make_jwt(r#"{"sub":"auth0|user_42","type":"session","exp":4102444800}"#);
    let scanned = RawCredentialRecord::from_pairs(
        "/tmp/state.vscdb",
        [
            ("cursorAuth/accessToken", jwt.as_str()),
            ("cursorAuth/cachedEmail", "user@example.com"),
        ],
    );

    let token = resolve_token(&scanned).expect("token resolves");
    assert_eq!(token.kind, TokenKind::Session);
    assert_eq!(token.raw, format!("user_42::{jwt}"));

    let email = resolve_email(&scanned).unwrap();

    // 2. first refresh window: two charged events, newest first
    let events = vec![
        make_event("sonnet", 300.0, 1_759_830_000_000),
        make_event("opus", 200.0, 1_759_820_000_000),
    ];

    let mut record = AccountRecord::new(&email).with_tokens(
        token.jwt().to_string(),
        None,
        token.raw.clone(),
    );
    merge_snapshot(&mut record, &make_snapshot(&events, "pro"), Utc::now());
    assert_eq!(record.total_cost, Some(5.0));

    let id = store.upsert_account(&record).unwrap();

    // 3. second, incremental window adds on top of the watermark
    let mut stored = store.get_account(id).unwrap().unwrap();
    assert_eq!(stored.sync.accumulated_cost, 5.0);
    let first_watermark = stored.sync.last_refresh_time.unwrap();

    let new_events = vec![make_event("sonnet", 150.0, 1_759_930_000_000)];
    merge_snapshot(&mut stored, &make_snapshot(&new_events, "pro"), Utc::now());
    store.upsert_account(&stored).unwrap();

    let refreshed = store.get_account(id).unwrap().unwrap();
    assert_eq!(refreshed.sync.accumulated_cost, 6.5);
    assert_eq!(refreshed.total_cost, Some(6.5));
    assert!(refreshed.sync.last_refresh_time.unwrap() > first_watermark);

    // 4. a window with no activity changes nothing
    let mut unchanged = refreshed.clone();
    merge_snapshot(&mut unchanged, &make_snapshot(&[], "pro"), Utc::now());
    store.upsert_account(&unchanged).unwrap();

    let after = store.get_account(id).unwrap().unwrap();
    assert_eq!(after.sync.accumulated_cost, 6.5);
    assert_eq!(after.sync.last_refresh_time, refreshed.sync.last_refresh_time);
}

#[test]
fn test_credentials_survive_encrypted_roundtrip() {
    let (store, _dir) = sqlite_store();

    let fingerprint = MachineFingerprint::generate(Some("user_42"));
    let record = AccountRecord::new("user@example.com")
        .with_tokens("eyJa.b.c", Some("eyJr.e.f".to_string()), "user_42::eyJa.b.c")
        .with_machine_info(fingerprint.clone());
    let id = store.upsert_account(&record).unwrap();

    let loaded = store.get_account(id).unwrap().unwrap();
    assert_eq!(loaded.access_token, "eyJa.b.c");
    assert_eq!(loaded.refresh_token, "eyJr.e.f");
    assert_eq!(loaded.session_token, "user_42::eyJa.b.c");
    assert_eq!(loaded.machine_info, Some(fingerprint));
}

#[test]
fn test_same_key_reads_rows_written_by_another_store_instance() {
    // portable-key property: a second process (or machine) with the same
    // passphrase reads everything
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("accounts.sqlite");

    let id = {
        let store = SqliteAccountStore::new(&path, FieldCipher::new("shared-key")).unwrap();
        store
            .upsert_account(
                &AccountRecord::new("user@example.com").with_tokens("eyJa.b.c", None, ""),
            )
            .unwrap()
    };

    let other = SqliteAccountStore::new(&path, FieldCipher::new("shared-key")).unwrap();
    let loaded = other.get_account(id).unwrap().unwrap();
    assert_eq!(loaded.access_token, "eyJa.b.c");
}

#[test]
fn test_wrong_key_degrades_to_sentinels_not_errors() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("accounts.sqlite");

    let id = {
        let store = SqliteAccountStore::new(&path, FieldCipher::new("right")).unwrap();
        store
            .upsert_account(
                &AccountRecord::new("user@example.com").with_tokens("eyJa.b.c", None, ""),
            )
            .unwrap()
    };

    let other = SqliteAccountStore::new(&path, FieldCipher::new("wrong")).unwrap();
    let loaded = other.get_account(id).unwrap().unwrap();
    assert_eq!(loaded.access_token, tally::DECRYPT_SENTINEL);
    // non-encrypted columns still read normally
    assert_eq!(loaded.email, "user@example.com");
}

#[test]
fn test_filtering_and_sorting_across_backends() {
    let (sqlite, _dir) = sqlite_store();
    let memory = InMemoryAccountStore::new();

    for store in [&sqlite as &dyn AccountStore, &memory as &dyn AccountStore] {
        let mut free_trial = AccountRecord::new("trial@example.com");
        free_trial.membership_type = "free_trial".to_string();
        free_trial.total_cost = Some(2.0);

        let mut pro = AccountRecord::new("pro@example.com");
        pro.membership_type = "pro".to_string();
        pro.total_cost = Some(25.0);

        let mut invalid = AccountRecord::new("invalid@example.com");
        invalid.is_invalid = true;

        store.upsert_account(&free_trial).unwrap();
        store.upsert_account(&pro).unwrap();
        store.upsert_account(&invalid).unwrap();

        let free = store
            .list_accounts(
                &AccountFilter {
                    plan_prefix: Some("free".to_string()),
                    ..Default::default()
                },
                SortColumn::TotalCost,
                false,
            )
            .unwrap();
        assert_eq!(free.len(), 2, "free prefix matches free and free_trial");

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
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|a| !a.is_invalid));

        let by_cost = store
            .list_accounts(&AccountFilter::default(), SortColumn::TotalCost, false)
            .unwrap();
        assert_eq!(by_cost[0].email, "pro@example.com");
    }
}

#[test]
fn test_update_fields_tolerates_schema_drift() {
    let (store, _dir) = sqlite_store();
    let id = store
        .upsert_account(&AccountRecord::new("user@example.com"))
        .unwrap();

    let mut fields = BTreeMap::new();
    fields.insert("is_invalid".to_string(), serde_json::json!(true));
    fields.insert(
        "column_from_the_future".to_string(),
        serde_json::json!({"nested": true}),
    );
    assert!(store.update_fields(id, &fields).unwrap());
    assert!(store.get_account(id).unwrap().unwrap().is_invalid);
}

#[test]
fn test_unpaid_amounts_for_documented_tiers() {
    let events = vec![make_event("sonnet", 2500.0, 1_759_830_000_000)];
    let breakdown: CostBreakdown = aggregate_events(&events, "pro");
    assert_eq!(breakdown.total_cost, 25.0);
    assert_eq!(breakdown.unpaid_amount, 5.0);

    let events = vec![make_event("sonnet", 800.0, 1_759_830_000_000)];
    let breakdown = aggregate_events(&events, "free");
    assert_eq!(breakdown.total_cost, 8.0);
    assert_eq!(breakdown.unpaid_amount, 0.0);
}

#[test]
fn test_watermark_value_type_survives_persistence() {
    let (store, _dir) = sqlite_store();

    let t = Utc.with_ymd_and_hms(2025, 10, 5, 12, 30, 45).unwrap();
    let mut record = AccountRecord::new("user@example.com");
    record.sync = UsageSyncState::new(Some(t), 12.75);

    let id = store.upsert_account(&record).unwrap();
    let loaded = store.get_account(id).unwrap().unwrap();
    assert_eq!(loaded.sync, UsageSyncState::new(Some(t), 12.75));
}
