//! The single externally-invoked refresh operation
//!
//! `sync_account` composes scanner, resolver, store and API client:
//! discover → resolve → load watermark → fetch → merge → persist. Each
//! call is self-contained and safe to run concurrently for different
//! emails; callers that care about same-email races serialize per email
//! themselves.

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::cancel::CancelToken;
use super::merge::merge_snapshot;
use crate::api::{AccountSnapshot, ServerUnavailable, UsageApiClient};
use crate::models::{AccountRecord, MachineFingerprint, ResolvedToken, TokenKind};
use crate::resolver;
use crate::scanner::{self, ScanOptions};
use crate::storage::AccountStore;

/// Everything a refresh needs, constructed once per process
///
/// Passed by reference into every `sync_account` call; there are no
/// global instances. The encryption key lives inside the store.
pub struct SyncContext {
    pub store: Arc<dyn AccountStore>,
    pub client: UsageApiClient,
    pub scan: ScanOptions,
}

impl SyncContext {
    pub fn new(store: Arc<dyn AccountStore>, client: UsageApiClient) -> Self {
        Self {
            store,
            client,
            scan: ScanOptions::default(),
        }
    }

    pub fn with_scan_options(mut self, scan: ScanOptions) -> Self {
        self.scan = scan;
        self
    }
}

/// Where the credential for a refresh comes from
pub enum SyncSource {
    /// A record already known to the caller; its stored row (when one
    /// exists) supplies the authoritative watermark
    Stored(AccountRecord),
    /// Scan the local editor stores for the active session
    Scan,
}

/// Definite outcome of one refresh
#[derive(Debug)]
pub enum SyncOutcome {
    /// Data fetched, merged and persisted
    Active(AccountRecord),
    /// Nothing resolvable in the local stores
    NoCredential,
    /// The remote service is down (5xx); callers stop the whole batch.
    /// The account is NOT marked invalid — the fault is transient.
    ServerUnavailable,
    /// The server rejected the token or resolved no data; the account
    /// keeps its last-known-good fields plus the invalid flag
    Invalid,
}

/// Refresh one account
pub fn sync_account(
    ctx: &SyncContext,
    source: SyncSource,
    cancel: &CancelToken,
) -> Result<SyncOutcome> {
    let (record, token) = match source {
        SyncSource::Stored(given) => {
            let record = ctx
                .store
                .get_account_by_email(&given.email)?
                .unwrap_or(given);
            let Some(token) = token_from_record(&record) else {
                log::warn!("no usable credential stored for {}", record.email);
                return Ok(SyncOutcome::NoCredential);
            };
            (record, token)
        }
        SyncSource::Scan => match scan_for_account(ctx)? {
            Some(found) => found,
            None => return Ok(SyncOutcome::NoCredential),
        },
    };

    log::info!("refreshing {}", record.email);

    match ctx.client.fetch_snapshot(&token, &record.sync, cancel) {
        Ok(fetched) => apply_outcome(ctx.store.as_ref(), record, fetched),
        Err(e) if e.downcast_ref::<ServerUnavailable>().is_some() => {
            log::error!("usage service unavailable, batch should halt: {e}");
            Ok(SyncOutcome::ServerUnavailable)
        }
        // cancellation and unexpected faults propagate with nothing
        // persisted — the watermark never advances partially
        Err(e) => Err(e),
    }
}

/// Persist what the fetch produced and name the outcome
fn apply_outcome(
    store: &dyn AccountStore,
    mut record: AccountRecord,
    fetched: Option<AccountSnapshot>,
) -> Result<SyncOutcome> {
    match fetched {
        Some(snapshot) => {
            merge_snapshot(&mut record, &snapshot, Utc::now());
            let id = store.upsert_account(&record)?;
            record.id = id;
            log::info!(
                "refreshed {}: {} / {:.1}% used / ${:.2} accumulated",
                record.email,
                record.membership_type,
                record.usage_percent,
                record.sync.accumulated_cost,
            );
            Ok(SyncOutcome::Active(record))
        }
        None => {
            if record.id > 0 {
                // flag only; every previously known field stays intact
                let mut fields = BTreeMap::new();
                fields.insert("is_invalid".to_string(), json!(true));
                store.update_fields(record.id, &fields)?;
                log::warn!("{} resolved no data, flagged invalid", record.email);
            } else {
                // rows are created on first successful sync only
                log::warn!(
                    "{} rejected before its first successful sync, nothing persisted",
                    record.email
                );
            }
            Ok(SyncOutcome::Invalid)
        }
    }
}

/// Scan local stores and build the record/token pair for the active session
fn scan_for_account(ctx: &SyncContext) -> Result<Option<(AccountRecord, ResolvedToken)>> {
    for found in scanner::scan_accounts(&ctx.scan) {
        let Some(token) = resolver::resolve_token(&found.record) else {
            log::debug!(
                "no token resolvable in {}",
                found.record.store_path().display()
            );
            continue;
        };
        let Some(email) = resolver::resolve_email(&found.record) else {
            log::debug!("no email in {}", found.record.store_path().display());
            continue;
        };

        let mut record = ctx
            .store
            .get_account_by_email(&email)?
            .unwrap_or_else(|| AccountRecord::new(&email));

        let access_token = token.jwt().to_string();
        let refresh_token = resolver::resolve_refresh_token(&found.record);
        let session_token = match token.kind {
            TokenKind::Session => token.raw.clone(),
            TokenKind::Access => String::new(),
        };
        record = record.with_tokens(access_token, refresh_token, session_token);

        if let Some(user_id) = &token.user_id {
            record.user_id = user_id.clone();
        }
        record.store_path = Some(found.record.store_path().display().to_string());

        // scanned fingerprint wins; otherwise keep the stored one or
        // generate a fresh one for a brand-new account
        if let Some(fingerprint) = found.fingerprint {
            record.machine_info = Some(fingerprint);
        } else if record.machine_info.is_none() {
            log::debug!("no fingerprint in store, generating one");
            record.machine_info =
                Some(MachineFingerprint::generate(token.user_id.as_deref()));
        }

        return Ok(Some((record, token)));
    }

    log::warn!("no resolvable credential in any local store");
    Ok(None)
}

/// Rebuild a usable token from stored credential fields
///
/// Prefers the stored composite session token; otherwise rebuilds the
/// composite form from the access token's claims the same way the
/// resolver does for scanned stores.
fn token_from_record(record: &AccountRecord) -> Option<ResolvedToken> {
    if record.session_token.contains("::") {
        let user_id = record
            .session_token
            .split_once("::")
            .map(|(user, _)| user)
            .filter(|user| user.starts_with("user_"))
            .map(str::to_string);
        return Some(ResolvedToken::session(
            record.session_token.clone(),
            user_id,
            None,
        ));
    }

    if record.access_token.starts_with("eyJ") {
        let claims = resolver::decode_jwt_claims(&record.access_token).ok();
        let user_id = claims
            .as_ref()
            .and_then(|c| c.sub.as_deref())
            .map(|sub| sub.trim_start_matches("auth0|").to_string())
            .or_else(|| {
                (!record.user_id.is_empty()).then(|| record.user_id.clone())
            });

        return match user_id {
            Some(id) if id.starts_with("user_") => Some(ResolvedToken::session(
                format!("{id}::{}", record.access_token),
                Some(id),
                claims,
            )),
            other => Some(ResolvedToken::access(
                record.access_token.clone(),
                other,
                claims.unwrap_or_default(),
            )),
        };
    }

    None
}
