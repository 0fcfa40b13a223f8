//! Token normalization
//!
//! Turns raw scanned fields into exactly one [`ResolvedToken`], handling
//! the historical field-naming conventions of the editor's state store.
//! Lookup precedence is encoded in the ordered key lists below rather
//! than in chained expressions, so the order is reviewable and testable
//! on its own.

use anyhow::{Context, Result, bail};
use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Utc};

use crate::models::{ResolvedToken, TokenClaims};
use crate::scanner::RawCredentialRecord;

/// Access-token fields, newest convention first
pub const ACCESS_TOKEN_KEYS: &[&str] = &["cursorAuth/accessToken", "cursorAuth.accessToken"];

/// Raw session-token fields, tried only when no access token resolves
pub const SESSION_TOKEN_KEYS: &[&str] = &[
    "WorkosCursorSessionToken",
    "workos.sessionToken",
    "cursorAuth.sessionToken",
];

/// Account email fields; the cached-email key reflects the currently
/// signed-in account and wins over the older conventions
pub const EMAIL_KEYS: &[&str] = &["cursorAuth/cachedEmail", "cursor.email", "user.email"];

/// Refresh-token fields
pub const REFRESH_TOKEN_KEYS: &[&str] = &["cursorAuth/refreshToken"];

/// `type` claims accepted for an access token
const VALID_TOKEN_TYPES: &[&str] = &["session", "web"];

/// Standard base64url JWT header prefix
const JWT_PREFIX: &str = "eyJ";

/// Resolve one canonical token from a scanned record
///
/// Prefers an access token; a valid one whose subject matches the
/// `user_…` pattern is rewritten into the composite `user_id::jwt`
/// session form used for Cookie-style calls. Falls back to a raw
/// session-token field otherwise. Returns `None` when nothing resolvable
/// exists — that is a reportable outcome, not an error.
pub fn resolve_token(record: &RawCredentialRecord) -> Option<ResolvedToken> {
    resolve_token_at(record, Utc::now())
}

/// [`resolve_token`] against an explicit clock, for expiry checks
pub fn resolve_token_at(record: &RawCredentialRecord, now: DateTime<Utc>) -> Option<ResolvedToken> {
    if let Some(token) = resolve_access_field(record, now) {
        return Some(token);
    }
    resolve_session_field(record)
}

/// Resolve the account email for a scanned record
pub fn resolve_email(record: &RawCredentialRecord) -> Option<String> {
    record.first_of(EMAIL_KEYS).map(str::to_string)
}

/// Resolve the refresh token, when the store carries one
pub fn resolve_refresh_token(record: &RawCredentialRecord) -> Option<String> {
    record.first_of(REFRESH_TOKEN_KEYS).map(str::to_string)
}

fn resolve_access_field(record: &RawCredentialRecord, now: DateTime<Utc>) -> Option<ResolvedToken> {
    let jwt = record
        .first_of(ACCESS_TOKEN_KEYS)
        .filter(|t| t.starts_with(JWT_PREFIX))?;

    let claims = match decode_jwt_claims(jwt) {
        Ok(claims) => claims,
        Err(e) => {
            log::debug!("access token payload unreadable, trying session fields: {e:#}");
            return None;
        }
    };

    if !access_claims_valid(&claims, now) {
        log::debug!(
            "access token rejected (type {:?}, exp {:?}), trying session fields",
            claims.token_type,
            claims.exp
        );
        return None;
    }

    let user_id = claims
        .sub
        .as_deref()
        .map(|sub| sub.trim_start_matches("auth0|").to_string());

    match user_id {
        Some(id) if id.starts_with("user_") => {
            // Composite form for Cookie-style calls only; not a genuine
            // server-issued session credential
            let raw = format!("{id}::{jwt}");
            Some(ResolvedToken::session(raw, Some(id), Some(claims)))
        }
        other => {
            if let Some(id) = &other {
                log::warn!("unexpected subject format in access token: {id}");
            }
            Some(ResolvedToken::access(jwt, other, claims))
        }
    }
}

fn resolve_session_field(record: &RawCredentialRecord) -> Option<ResolvedToken> {
    let (key, raw) = SESSION_TOKEN_KEYS
        .iter()
        .find_map(|k| record.get(k).map(|v| (*k, v)))?;

    let decoded = if raw.contains("%3A%3A") {
        match urlencoding::decode(raw) {
            Ok(d) => d.into_owned(),
            Err(e) => {
                log::debug!("session token in {key} not URL-decodable: {e}");
                raw.to_string()
            }
        }
    } else {
        raw.to_string()
    };

    let user_id = decoded
        .split_once("::")
        .map(|(user, _)| user)
        .filter(|user| user.starts_with("user_"))
        .map(str::to_string);

    log::debug!("resolved raw session token from {key}");
    Some(ResolvedToken::session(decoded, user_id, None))
}

/// Decode the payload segment of a JWT
///
/// Restores `=` padding to a multiple of 4 bytes before base64url
/// decoding, then parses the JSON claims.
pub fn decode_jwt_claims(jwt: &str) -> Result<TokenClaims> {
    let parts: Vec<&str> = jwt.split('.').collect();
    if parts.len() != 3 {
        bail!(
            "token has {} segment(s), expected the 3 of a JWT",
            parts.len()
        );
    }

    let mut payload = parts[1].to_string();
    while payload.len() % 4 != 0 {
        payload.push('=');
    }

    let decoded = general_purpose::URL_SAFE
        .decode(payload)
        .context("payload segment is not base64url")?;

    serde_json::from_slice(&decoded).context("payload segment is not a JSON claim set")
}

/// Whether access-token claims pass the type allow-list and expiry check
pub fn access_claims_valid(claims: &TokenClaims, now: DateTime<Utc>) -> bool {
    let type_ok = claims
        .token_type
        .as_deref()
        .is_some_and(|t| VALID_TOKEN_TYPES.contains(&t));

    let not_expired = match claims.exp {
        Some(exp) => now.timestamp() < exp,
        None => true,
    };

    type_ok && not_expired
}
