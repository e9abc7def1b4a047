//! Display-index allocation.
//!
//! A running X server leaves a `.X<N>-lock` file in the lock directory. The
//! next free display is one past the highest index in use, or `1` when none
//! are found.

use std::io::ErrorKind;
use std::path::Path;

use tracing::debug;

use crate::{AppError, Result};

/// Default lock directory scanned for display lock files.
pub const DEFAULT_LOCK_DIR: &str = "/tmp";

/// Extract the display index from a lock file name such as `.X99-lock`.
#[must_use]
pub fn parse_lock_index(file_name: &str) -> Option<u32> {
    file_name
        .strip_prefix(".X")?
        .strip_suffix("-lock")?
        .parse()
        .ok()
}

/// List display indices that have a lock file in `dir`.
///
/// A missing directory counts as "no displays in use".
///
/// # Errors
///
/// Returns `AppError::Io` if the directory exists but cannot be read.
pub async fn scan_lock_indices(dir: &Path) -> Result<Vec<u32>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => {
            return Err(AppError::Io(format!(
                "failed to scan {} for display locks: {err}",
                dir.display()
            )))
        }
    };

    let mut indices = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        if let Some(index) = entry.file_name().to_str().and_then(parse_lock_index) {
            indices.push(index);
        }
    }

    debug!(dir = %dir.display(), ?indices, "display locks scanned");
    Ok(indices)
}

/// Next free display index given the indices in use.
#[must_use]
pub fn next_display_index(in_use: &[u32]) -> u32 {
    in_use.iter().copied().max().unwrap_or(0).saturating_add(1)
}

/// Scan `dir` and allocate the next free display index.
///
/// # Errors
///
/// Propagates [`scan_lock_indices`] failures.
pub async fn allocate_display_index(dir: &Path) -> Result<u32> {
    let in_use = scan_lock_indices(dir).await?;
    Ok(next_display_index(&in_use))
}

/// `DISPLAY` value for a display index (`:N.0`).
#[must_use]
pub fn display_binding(index: u32) -> String {
    format!(":{index}.0")
}

/// Default display-server arguments for `index`.
#[must_use]
pub fn default_framebuffer_args(index: u32) -> Vec<String> {
    vec![
        "-ac".to_owned(),
        "-screen".to_owned(),
        "0".to_owned(),
        "1280x2000x24+32".to_owned(),
        display_binding(index),
    ]
}
