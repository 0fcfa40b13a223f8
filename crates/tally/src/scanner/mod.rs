//! Local credential-store scanner
//!
//! This module provides:
//! - Discovery of the editor's `state.vscdb` key-value stores
//! - Read-only extraction of credential/fingerprint fields under
//!   concurrent-writer lock contention
//! - Machine fingerprint extraction

mod locate;
mod read;

pub use locate::{StoreHandle, locate_stores};
pub use read::{LockTimeout, extract_machine_fingerprint, read_store};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::MachineFingerprint;

/// Knobs for store reads under lock contention
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Attempts before giving up on a locked store
    pub max_retries: u32,
    /// Backoff grows linearly: `base_backoff * attempt`
    pub base_backoff: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(200),
        }
    }
}

/// Raw key/value fields read from one credential store
///
/// Keys are the store's own opaque names; only keys matching the known
/// credential/fingerprint patterns are ever loaded into this record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCredentialRecord {
    store_path: PathBuf,
    values: BTreeMap<String, String>,
}

impl RawCredentialRecord {
    pub fn new(store_path: impl Into<PathBuf>, values: BTreeMap<String, String>) -> Self {
        Self {
            store_path: store_path.into(),
            values,
        }
    }

    /// Build a record from key/value pairs
    pub fn from_pairs<I, K, V>(store_path: impl Into<PathBuf>, pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let values = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self::new(store_path, values)
    }

    pub fn store_path(&self) -> &Path {
        &self.store_path
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    /// First non-empty value among `keys`, in order
    pub fn first_of(&self, keys: &[&str]) -> Option<&str> {
        keys.iter().find_map(|k| self.get(k))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// One store's worth of scanned credential material
#[derive(Debug, Clone)]
pub struct ScannedCredential {
    pub record: RawCredentialRecord,
    /// Fingerprint found in the store; `None` when the store had none
    /// (the orchestrator generates a fresh one in that case)
    pub fingerprint: Option<MachineFingerprint>,
}

/// Read every discoverable store, most recently modified first
///
/// A store that cannot be read (locked past the retry budget, or any
/// other I/O fault) is skipped; scanning continues with the remaining
/// candidates. Returns an empty Vec when no store exists or none are
/// readable.
pub fn scan_accounts(options: &ScanOptions) -> Vec<ScannedCredential> {
    let mut results = Vec::new();

    for handle in locate_stores() {
        match read_store(&handle, options.max_retries, options.base_backoff) {
            Ok(record) if !record.is_empty() => {
                let fingerprint = extract_machine_fingerprint(&record);
                results.push(ScannedCredential {
                    record,
                    fingerprint,
                });
            }
            Ok(_) => {
                log::debug!("store {} held no matching keys", handle.path.display());
            }
            Err(e) => {
                log::warn!("skipping store {}: {e:#}", handle.path.display());
            }
        }
    }

    results
}

/// The most recently touched store's credential material, if any
///
/// The most recently modified store is assumed to belong to the active
/// editor session.
pub fn active_credentials(options: &ScanOptions) -> Option<ScannedCredential> {
    scan_accounts(options).into_iter().next()
}
