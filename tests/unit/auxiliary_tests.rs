//! Unit tests for the reference-counted auxiliary process group.
//!
//! `sleep` stands in for both the display server and the message bus.

#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::time::Duration;

use marionette::lifecycle::auxiliary::{AuxiliaryConfig, AuxiliaryGroup, Release};

fn sleeper_group(lock_dir: &Path) -> AuxiliaryGroup {
    AuxiliaryGroup::new(AuxiliaryConfig {
        display_program: "sleep".to_owned(),
        bus_program: "sleep".to_owned(),
        bus_args: vec!["30".to_owned()],
        lock_dir: lock_dir.to_path_buf(),
        settle_delay: Duration::from_millis(10),
    })
}

fn sleep_args() -> Vec<String> {
    vec!["30".to_owned()]
}

/// A shell that appends `name` to `log` when it receives SIGTERM.
fn logging_args(name: &str, log: &Path) -> Vec<String> {
    vec![
        "-c".to_owned(),
        format!(
            "trap 'echo {name} >> \"{}\"; exit 0' TERM; while :; do sleep 0.05; done",
            log.display()
        ),
    ]
}

/// Two holders share one pair; the last release stops display then bus.
#[tokio::test]
async fn pair_is_shared_and_stopped_in_order() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join(".X7-lock"), "").unwrap();
    fs::write(dir.path().join(".X9-lock"), "").unwrap();
    let log = dir.path().join("stop-order.log");
    let group = AuxiliaryGroup::new(AuxiliaryConfig {
        display_program: "sh".to_owned(),
        bus_program: "sh".to_owned(),
        bus_args: logging_args("bus", &log),
        lock_dir: dir.path().to_path_buf(),
        settle_delay: Duration::from_millis(50),
    });
    let display_args = logging_args("display", &log);

    let first = group.acquire(Some(&display_args)).await.unwrap();
    let second = group.acquire(Some(&display_args)).await.unwrap();

    assert_eq!(first, 10);
    assert_eq!(second, 10);
    assert_eq!(group.handles().await, 2);

    assert_eq!(group.release().await, Release::Retained { handles: 1 });
    assert_eq!(group.display_index().await, Some(10));

    let release = group.release().await;
    let Release::Stopped(shutdown) = release else {
        panic!("last release must stop the pair, got {release:?}");
    };
    assert_eq!(shutdown.display.expect("display must have run").code, Some(0));
    assert_eq!(shutdown.bus.expect("bus must have run").code, Some(0));

    let order = fs::read_to_string(&log).unwrap();
    assert_eq!(
        order.lines().collect::<Vec<_>>(),
        vec!["display", "bus"],
        "display must stop before the bus is signalled"
    );
    assert_eq!(group.handles().await, 0);
    assert_eq!(group.display_index().await, None);
}

/// After a full stop the next acquisition re-scans for a display index.
#[tokio::test]
async fn index_is_rescanned_after_stop() {
    let dir = tempfile::tempdir().unwrap();
    let group = sleeper_group(dir.path());

    assert_eq!(group.acquire(Some(&sleep_args())).await.unwrap(), 1);
    assert!(group.release().await.stopped());

    fs::write(dir.path().join(".X1-lock"), "").unwrap();
    assert_eq!(group.acquire(Some(&sleep_args())).await.unwrap(), 2);
    assert!(group.release().await.stopped());
}

/// Concurrent first acquisitions start one pair.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquire_starts_one_pair() {
    let dir = tempfile::tempdir().unwrap();
    let group = std::sync::Arc::new(sleeper_group(dir.path()));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let group = std::sync::Arc::clone(&group);
        tasks.push(tokio::spawn(async move {
            group.acquire(Some(&sleep_args())).await.unwrap()
        }));
    }
    let mut indices = Vec::new();
    for task in tasks {
        indices.push(task.await.unwrap());
    }

    assert!(indices.iter().all(|&index| index == 1), "got {indices:?}");
    assert_eq!(group.handles().await, 4);

    for _ in 0..3 {
        assert!(!group.release().await.stopped());
    }
    assert!(group.release().await.stopped());
}

/// Releasing with nothing held is a no-op.
#[tokio::test]
async fn release_without_handles_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let group = sleeper_group(dir.path());

    assert_eq!(group.release().await, Release::Retained { handles: 0 });
}

/// A missing display program fails without taking a handle.
#[tokio::test]
async fn missing_program_fails_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let group = AuxiliaryGroup::new(AuxiliaryConfig {
        display_program: "marionette-no-such-display-server".to_owned(),
        lock_dir: dir.path().to_path_buf(),
        settle_delay: Duration::from_millis(1),
        ..AuxiliaryConfig::default()
    });

    let err = group.acquire(None).await.unwrap_err();

    assert!(matches!(err, marionette::AppError::Auxiliary(_)), "got {err:?}");
    assert_eq!(group.handles().await, 0);
    assert_eq!(group.display_index().await, None);
}
