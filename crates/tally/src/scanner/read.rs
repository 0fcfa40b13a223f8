//! Read-only extraction from a state store
//!
//! The editor owns these SQLite files and writes to them while running,
//! so reads open read-only and retry on lock contention with a linear
//! backoff. A store that stays locked past the retry budget fails with
//! [`LockTimeout`]; any other fault is fatal for that store only.

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{RawCredentialRecord, StoreHandle};
use crate::models::{FINGERPRINT_KEYS, MachineFingerprint};

/// Error indicating a store stayed locked through every retry
#[derive(Debug, thiserror::Error)]
#[error("store {} still locked after {attempts} attempts", path.display())]
pub struct LockTimeout {
    pub path: PathBuf,
    pub attempts: u32,
}

/// How long each attempt waits on a held lock before counting as failed
const ATTEMPT_BUSY_TIMEOUT: Duration = Duration::from_millis(250);

/// Selects only credential and fingerprint keys. Pulling the whole table
/// would drag unrelated editor state through this process.
const SELECT_CREDENTIAL_KEYS: &str = "\
    SELECT key, value FROM ItemTable \
    WHERE key LIKE '%email%' \
       OR key LIKE '%Token%' \
       OR key LIKE '%token%' \
       OR key LIKE 'cursorAuth/%' \
       OR key LIKE 'WorkosCursorSessionToken%' \
       OR key LIKE 'telemetry.%' \
       OR key LIKE 'system.machine%'";

/// Read credential fields from one store
///
/// Opens read-only; on a locked store retries up to `max_retries` times
/// with a linearly increasing backoff (`base_backoff * attempt`).
pub fn read_store(
    handle: &StoreHandle,
    max_retries: u32,
    base_backoff: Duration,
) -> Result<RawCredentialRecord> {
    for attempt in 1..=max_retries.max(1) {
        match try_read(&handle.path) {
            Ok(values) => {
                log::debug!(
                    "read {} key(s) from {}",
                    values.len(),
                    handle.path.display()
                );
                return Ok(RawCredentialRecord::new(&handle.path, values));
            }
            Err(e) if is_locked(&e) => {
                log::debug!(
                    "store locked, retry {attempt}/{} for {}",
                    max_retries,
                    handle.path.display()
                );
                std::thread::sleep(base_backoff * attempt);
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("failed to read store {}", handle.path.display())
                });
            }
        }
    }

    Err(LockTimeout {
        path: handle.path.clone(),
        attempts: max_retries.max(1),
    }
    .into())
}

/// One read attempt against the store
fn try_read(path: &Path) -> Result<BTreeMap<String, String>, rusqlite::Error> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
    )?;
    conn.busy_timeout(ATTEMPT_BUSY_TIMEOUT)?;

    let mut stmt = conn.prepare(SELECT_CREDENTIAL_KEYS)?;
    let mut rows = stmt.query([])?;

    let mut values = BTreeMap::new();
    while let Some(row) = rows.next()? {
        let key: String = row.get(0)?;
        // values are TEXT in practice, but the table's value column is
        // untyped; non-text payloads are skipped
        let value = match row.get_ref(1)? {
            rusqlite::types::ValueRef::Text(bytes) => {
                String::from_utf8_lossy(bytes).into_owned()
            }
            rusqlite::types::ValueRef::Blob(bytes) => match std::str::from_utf8(bytes) {
                Ok(s) => s.to_string(),
                Err(_) => continue,
            },
            _ => continue,
        };
        values.insert(key, value);
    }

    Ok(values)
}

fn is_locked(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// Extract the machine fingerprint fields from a scanned record
///
/// Requires the five fixed keys for a complete fingerprint. A partial set
/// is returned as-is with a completeness warning; missing keys are never
/// fabricated here. Returns `None` when no fingerprint key is present.
pub fn extract_machine_fingerprint(record: &RawCredentialRecord) -> Option<MachineFingerprint> {
    let fingerprint = MachineFingerprint::from_pairs(
        FINGERPRINT_KEYS
            .iter()
            .filter_map(|key| record.get(key).map(|v| (*key, v))),
    );

    if fingerprint.is_empty() {
        return None;
    }

    if !fingerprint.is_complete() {
        log::warn!(
            "incomplete machine fingerprint in {}: {}/{} keys (missing {:?})",
            record.store_path().display(),
            fingerprint.len(),
            FINGERPRINT_KEYS.len(),
            fingerprint.missing_keys()
        );
    }

    Some(fingerprint)
}
