//! Domain models for account usage tracking

mod account;
mod fingerprint;
mod sync_state;
mod token;

pub use account::{AccountRecord, ModelUsage};
pub use fingerprint::{FINGERPRINT_KEYS, MachineFingerprint};
pub use sync_state::UsageSyncState;
pub use token::{ResolvedToken, TokenClaims, TokenKind};
