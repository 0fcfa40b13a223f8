//! Machine fingerprint model

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use uuid::Uuid;

/// The five fixed keys that make up a complete machine fingerprint
pub const FINGERPRINT_KEYS: [&str; 5] = [
    "telemetry.machineId",
    "telemetry.macMachineId",
    "telemetry.devDeviceId",
    "telemetry.sqmId",
    "system.machineGuid",
];

/// Device-identifying values stored alongside a credential
///
/// Holds only the five fixed keys. Partial fingerprints (some keys missing
/// in the scanned store) are representable; callers decide whether to use
/// or regenerate them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MachineFingerprint {
    values: BTreeMap<String, String>,
}

impl MachineFingerprint {
    /// Build from key/value pairs, keeping only the five known keys
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let values = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(k, v)| FINGERPRINT_KEYS.contains(&k.as_str()) && !v.is_empty())
            .collect();
        Self { values }
    }

    /// Generate a fresh fingerprint
    ///
    /// `telemetry.machineId` is the `auth0|user_…` identity followed by its
    /// SHA-256 hex digest; the remaining fields are random v4 UUIDs, with
    /// `telemetry.sqmId` in the braced uppercase GUID form the editor uses.
    pub fn generate(user_id: Option<&str>) -> Self {
        let identity = match user_id {
            Some(id) if !id.is_empty() => format!("auth0|{id}"),
            _ => format!("auth0|user_{}", short_hex()),
        };

        let digest = Sha256::digest(identity.as_bytes());
        let digest_hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        let machine_id = format!("{identity}{digest_hex}");

        let mut values = BTreeMap::new();
        values.insert("telemetry.machineId".to_string(), machine_id);
        values.insert(
            "telemetry.macMachineId".to_string(),
            Uuid::new_v4().to_string(),
        );
        values.insert(
            "telemetry.devDeviceId".to_string(),
            Uuid::new_v4().to_string(),
        );
        values.insert(
            "telemetry.sqmId".to_string(),
            format!("{{{}}}", Uuid::new_v4().to_string().to_uppercase()),
        );
        values.insert(
            "system.machineGuid".to_string(),
            Uuid::new_v4().to_string(),
        );

        Self { values }
    }

    /// Whether all five keys are present
    pub fn is_complete(&self) -> bool {
        self.values.len() == FINGERPRINT_KEYS.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// The keys from [`FINGERPRINT_KEYS`] that are not present
    pub fn missing_keys(&self) -> Vec<&'static str> {
        FINGERPRINT_KEYS
            .iter()
            .copied()
            .filter(|k| !self.values.contains_key(*k))
            .collect()
    }
}

/// 16 hex chars for synthesized user ids
fn short_hex() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}
