//! Discovery of editor state stores

use std::path::PathBuf;
use std::time::SystemTime;

/// A discovered `state.vscdb` file
#[derive(Debug, Clone)]
pub struct StoreHandle {
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// The global-storage suffix under each editor profile root
const STORE_SUFFIX: [&str; 3] = ["User", "globalStorage", "state.vscdb"];

/// Find all existing state stores, most recently modified first
///
/// The most recently touched store belongs to the active session, so
/// callers that only want "the current account" take the first entry.
/// Missing candidates are silently skipped; an empty result is not an
/// error.
pub fn locate_stores() -> Vec<StoreHandle> {
    let mut handles: Vec<StoreHandle> = candidate_roots()
        .into_iter()
        .map(|root| STORE_SUFFIX.iter().fold(root, |p, seg| p.join(seg)))
        .filter_map(|path| {
            let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
            Some(StoreHandle { path, modified })
        })
        .collect();

    handles.sort_by(|a, b| b.modified.cmp(&a.modified));

    if handles.is_empty() {
        log::debug!("no state.vscdb store found");
    } else {
        log::debug!("found {} state.vscdb store(s)", handles.len());
    }

    handles
}

/// Platform-specific editor profile roots, in probe order
#[cfg(target_os = "windows")]
fn candidate_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Ok(roaming) = std::env::var("APPDATA") {
        roots.push(PathBuf::from(roaming).join("Cursor"));
    }
    if let Ok(local) = std::env::var("LOCALAPPDATA") {
        roots.push(PathBuf::from(local).join("Cursor"));
    }
    if let Some(home) = dirs::home_dir() {
        roots.push(home.join(".cursor"));
    }

    roots
}

#[cfg(target_os = "macos")]
fn candidate_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Some(home) = dirs::home_dir() {
        roots.push(home.join("Library").join("Application Support").join("Cursor"));
        roots.push(home.join(".cursor"));
    }

    roots
}

#[cfg(not(any(target_os = "windows", target_os = "macos")))]
fn candidate_roots() -> Vec<PathBuf> {
    let mut roots = Vec::new();

    if let Some(config) = dirs::config_dir() {
        roots.push(config.join("Cursor"));
    }
    if let Some(home) = dirs::home_dir() {
        roots.push(home.join(".cursor"));
    }

    roots
}
