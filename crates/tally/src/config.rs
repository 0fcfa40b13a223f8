//! Configuration loading for the account store
//!
//! Resolves the field-encryption passphrase from (in order of priority):
//! 1. Compile-time embedded key (for production builds)
//! 2. JSON file (~/.config/tally/store-key.json)
//! 3. Runtime environment variable
//! 4. Built-in portable key
//!
//! The portable fallback exists so that an exported account database can
//! be imported on any machine running this software without extra setup.
//! Installations that want a private store override it with any of the
//! higher-priority sources.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Key filename in the Tally config directory
const KEY_FILE: &str = "store-key.json";

/// Database filename in the Tally data directory
const STORE_FILE: &str = "accounts.sqlite";

/// Built-in portable passphrase used when no override is configured
const PORTABLE_KEY: &str = "TALLY-2025-PORTABLE-FIELD-ENCRYPTION-KEY";

/// Passphrase for the process-wide field cipher
#[derive(Debug, Clone)]
pub struct StoreKeyConfig {
    pub passphrase: String,
}

/// On-disk key file format
#[derive(Serialize, Deserialize)]
struct KeyFile {
    passphrase: String,
}

impl StoreKeyConfig {
    /// Load the store key using the following priority:
    /// 1. Compile-time embedded key (for production builds)
    /// 2. JSON file (~/.config/tally/store-key.json)
    /// 3. Runtime environment variable
    /// 4. Built-in portable key
    pub fn load() -> Self {
        if let Some(key) = Self::from_compile_time() {
            return key;
        }

        if config::config_exists(KEY_FILE)
            && let Ok(key) = config::load_json::<KeyFile>(KEY_FILE)
        {
            return Self {
                passphrase: key.passphrase,
            };
        }

        if let Ok(key) = Self::from_env() {
            return key;
        }

        Self::portable()
    }

    /// Key embedded at compile time via an environment variable.
    /// Build with: TALLY_STORE_KEY=xxx cargo build --release
    pub fn from_compile_time() -> Option<Self> {
        let passphrase = option_env!("TALLY_STORE_KEY")?;

        if passphrase.is_empty() {
            return None;
        }

        Some(Self {
            passphrase: passphrase.to_string(),
        })
    }

    /// Load the key from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let key: KeyFile = config::load_json_file(path)?;
        Ok(Self {
            passphrase: key.passphrase,
        })
    }

    /// Load the key from the runtime environment
    pub fn from_env() -> Result<Self> {
        let passphrase = std::env::var("TALLY_STORE_KEY")
            .context("TALLY_STORE_KEY environment variable not set")?;

        Ok(Self { passphrase })
    }

    /// The built-in portable key shared by all default installations
    pub fn portable() -> Self {
        Self {
            passphrase: PORTABLE_KEY.to_string(),
        }
    }

    /// Whether this key differs from the built-in portable key
    pub fn is_customized(&self) -> bool {
        self.passphrase != PORTABLE_KEY
    }

    /// Get the default key file path (~/.config/tally/store-key.json)
    pub fn default_key_path() -> Option<PathBuf> {
        config::config_path(KEY_FILE)
    }

    /// Persist this key to the default key file
    pub fn save(&self) -> Result<()> {
        config::save_json(
            KEY_FILE,
            &KeyFile {
                passphrase: self.passphrase.clone(),
            },
        )
    }
}

/// Get the default account database path (~/.local/share/tally/accounts.sqlite)
pub fn default_store_path() -> Option<PathBuf> {
    config::data_path(STORE_FILE)
}
