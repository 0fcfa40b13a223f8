//! Tally crate - Business logic for account usage tracking
//!
//! This crate provides platform-independent account bookkeeping including:
//! - Domain models (AccountRecord, ResolvedToken, UsageSyncState)
//! - Local credential-store scanner for the Cursor editor
//! - Token normalization across historical field conventions
//! - Dashboard API client with incremental usage refresh
//! - Encrypted SQLite storage with additive schema evolution
//! - A single-call sync orchestrator composing the above
//!
//! This crate has zero UI dependencies. All I/O is blocking; callers
//! that want parallel refreshes run `sync_account` from their own
//! worker pool, one call per account.

pub mod api;
pub mod config;
pub mod models;
pub mod resolver;
pub mod scanner;
pub mod storage;
pub mod sync;

pub use api::{ServerUnavailable, UsageApiClient, cost::CostBreakdown, cost::plan_credit};
pub use config::{StoreKeyConfig, default_store_path};
pub use models::{
    AccountRecord, MachineFingerprint, ModelUsage, ResolvedToken, TokenClaims, TokenKind,
    UsageSyncState,
};
pub use resolver::{resolve_email, resolve_token};
pub use scanner::{LockTimeout, RawCredentialRecord, ScanOptions, StoreHandle, locate_stores};
pub use storage::{
    AccountFilter, AccountStats, AccountStore, DECRYPT_SENTINEL, FieldCipher,
    InMemoryAccountStore, SortColumn, SqliteAccountStore, StatusFilter,
};
pub use sync::{CancelToken, SyncCancelled, SyncContext, SyncOutcome, SyncSource, sync_account};
