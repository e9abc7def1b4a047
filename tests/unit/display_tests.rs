//! Unit tests for display-index allocation.

use std::fs;

use marionette::lifecycle::display::{
    allocate_display_index, default_framebuffer_args, display_binding, next_display_index,
    parse_lock_index, scan_lock_indices,
};

/// Lock file names parse to their index; anything else is ignored.
#[test]
fn lock_names_parse() {
    assert_eq!(parse_lock_index(".X7-lock"), Some(7));
    assert_eq!(parse_lock_index(".X123-lock"), Some(123));
    assert_eq!(parse_lock_index(".X-lock"), None);
    assert_eq!(parse_lock_index(".Xabc-lock"), None);
    assert_eq!(parse_lock_index("X7-lock"), None);
    assert_eq!(parse_lock_index(".X7-lock.bak"), None);
    assert_eq!(parse_lock_index(".X11-unix"), None);
}

/// Allocation is one past the highest index in use, or 1.
#[test]
fn next_index_follows_highest() {
    assert_eq!(next_display_index(&[7, 9]), 10);
    assert_eq!(next_display_index(&[9, 7]), 10);
    assert_eq!(next_display_index(&[]), 1);
}

/// Existing locks for 7 and 9 yield 10.
#[tokio::test]
async fn allocation_skips_existing_locks() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join(".X7-lock"), "").unwrap();
    fs::write(dir.path().join(".X9-lock"), "").unwrap();
    fs::write(dir.path().join("unrelated"), "").unwrap();

    let mut indices = scan_lock_indices(dir.path()).await.unwrap();
    indices.sort_unstable();

    assert_eq!(indices, vec![7, 9]);
    assert_eq!(allocate_display_index(dir.path()).await.unwrap(), 10);
}

/// No locks yields 1.
#[tokio::test]
async fn allocation_without_locks_is_one() {
    let dir = tempfile::tempdir().unwrap();

    assert_eq!(allocate_display_index(dir.path()).await.unwrap(), 1);
}

/// A missing lock directory counts as empty.
#[tokio::test]
async fn missing_lock_dir_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("nope");

    assert!(scan_lock_indices(&missing).await.unwrap().is_empty());
}

/// Default display-server arguments bind the allocated display.
#[test]
fn default_args_bind_display() {
    assert_eq!(display_binding(4), ":4.0");
    assert_eq!(
        default_framebuffer_args(4),
        vec!["-ac", "-screen", "0", "1280x2000x24+32", ":4.0"]
    );
}
