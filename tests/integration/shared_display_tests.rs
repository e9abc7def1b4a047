//! Instances sharing one display server and bus.
//!
//! `sleep` stands in for both auxiliary programs.

#![cfg(unix)]

use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;

use marionette::lifecycle::auxiliary::{AuxiliaryConfig, AuxiliaryGroup};
use marionette::lifecycle::signals::CleanupRegistry;
use marionette::{AppError, Instance, InstanceOptions};

use super::test_helpers::{eventually, runner_options};

fn shared_options() -> InstanceOptions {
    InstanceOptions {
        shared_display: Some(true),
        virtual_framebuffer_arguments: Some(vec!["30".to_owned()]),
        ..runner_options()
    }
}

fn shared_instance(group: &Arc<AuxiliaryGroup>) -> Instance {
    Instance::builder(shared_options())
        .cleanup(Arc::new(CleanupRegistry::new()))
        .auxiliary(Arc::clone(group))
        .build()
}

fn sleeper_group(lock_dir: &std::path::Path, settle_delay: Duration) -> Arc<AuxiliaryGroup> {
    Arc::new(AuxiliaryGroup::new(AuxiliaryConfig {
        display_program: "sleep".to_owned(),
        bus_program: "sleep".to_owned(),
        bus_args: vec!["30".to_owned()],
        lock_dir: lock_dir.to_path_buf(),
        settle_delay,
    }))
}

/// Two instances share one pair; it stops only when both have ended.
#[tokio::test]
async fn instances_share_one_pair() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join(".X41-lock"), "").unwrap();
    let group = sleeper_group(dir.path(), Duration::from_millis(10));

    let mut first = shared_instance(&group);
    let mut second = shared_instance(&group);
    assert!(first.uses_shared_display());
    assert_eq!(first.queued()[0], "start-display");

    first.run().await.unwrap();
    second.run().await.unwrap();

    assert_eq!(first.display_index(), Some(42));
    assert_eq!(second.display_index(), Some(42));
    assert_eq!(group.handles().await, 2);

    first.end().run().await.unwrap();
    assert_eq!(group.handles().await, 1);
    assert_eq!(group.display_index().await, Some(42));

    second.end().run().await.unwrap();
    assert_eq!(group.handles().await, 0);
    assert_eq!(group.display_index().await, None);
}

/// A worker killed after `ready` tears its instance down and gives back
/// its display handle while the other holder keeps the pair.
#[tokio::test]
async fn crashed_worker_releases_its_handle() {
    let dir = tempfile::tempdir().unwrap();
    let group = sleeper_group(dir.path(), Duration::from_millis(10));
    let mut crashing = shared_instance(&group);
    let mut survivor = shared_instance(&group);
    crashing.run().await.unwrap();
    survivor.run().await.unwrap();
    assert_eq!(group.handles().await, 2);

    let pid = crashing.worker_pid().await.expect("worker must be running");
    kill(Pid::from_raw(i32::try_from(pid).unwrap()), Signal::SIGKILL).unwrap();

    assert!(eventually(|| crashing.is_ended()).await);
    assert!(!crashing.is_ending());
    assert_eq!(group.handles().await, 1);
    assert_eq!(crashing.display_index(), None);

    survivor.end().run().await.unwrap();
    assert_eq!(group.handles().await, 0);
    assert_eq!(group.display_index().await, None);
}

/// Teardown that lands while the display is starting still returns the
/// handle once the start completes.
#[tokio::test]
async fn teardown_during_display_start_releases_handle() {
    let dir = tempfile::tempdir().unwrap();
    let group = sleeper_group(dir.path(), Duration::from_millis(300));
    let cleanup = Arc::new(CleanupRegistry::new());
    let mut instance = Instance::builder(shared_options())
        .cleanup(Arc::clone(&cleanup))
        .auxiliary(Arc::clone(&group))
        .build();

    let run = tokio::spawn(async move {
        let result = instance.run().await;
        (instance, result)
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    cleanup.run_all().await;

    let (instance, result) = run.await.unwrap();

    assert!(matches!(result, Err(AppError::Ended(_))), "got {result:?}");
    assert!(instance.is_ended());
    assert_eq!(instance.display_index(), None);
    assert_eq!(group.handles().await, 0);
    assert_eq!(group.display_index().await, None);
}
