//! Sync orchestration
//!
//! Composes scanner, resolver, API client and store into the single
//! "refresh one account" operation, plus the pure merge rule and the
//! cancellation token threaded through pagination.

mod cancel;
mod merge;
mod orchestrator;

pub use cancel::{CancelToken, SyncCancelled};
pub use merge::merge_snapshot;
pub use orchestrator::{SyncContext, SyncOutcome, SyncSource, sync_account};
