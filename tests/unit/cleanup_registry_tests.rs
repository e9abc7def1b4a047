//! Unit tests for per-instance termination cleanup.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use marionette::lifecycle::signals::{Cleanup, CleanupRegistry};
use marionette::{Instance, InstanceOptions};

fn counting(counter: &Arc<AtomicUsize>) -> Cleanup {
    let counter = Arc::clone(counter);
    Arc::new(move || {
        let counter = Arc::clone(&counter);
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    })
}

/// Dropping a guard deregisters its cleanup.
#[test]
fn guard_drop_deregisters() {
    let registry = Arc::new(CleanupRegistry::new());
    let counter = Arc::new(AtomicUsize::new(0));

    let first = registry.register(counting(&counter));
    let second = registry.register(counting(&counter));
    assert_eq!(registry.len(), 2);

    drop(first);
    assert_eq!(registry.len(), 1);
    drop(second);
    assert!(registry.is_empty());
}

/// `run_all` runs each cleanup once and empties the registry.
#[tokio::test]
async fn run_all_runs_each_cleanup_once() {
    let registry = Arc::new(CleanupRegistry::new());
    let counter = Arc::new(AtomicUsize::new(0));
    let _a = registry.register(counting(&counter));
    let _b = registry.register(counting(&counter));

    registry.run_all().await;
    registry.run_all().await;

    assert_eq!(counter.load(Ordering::SeqCst), 2);
    assert!(registry.is_empty());
}

/// Many instances ending normally leave no registrations behind.
#[tokio::test]
async fn ended_instances_do_not_accumulate_registrations() {
    let registry = Arc::new(CleanupRegistry::new());

    for _ in 0..25 {
        let mut instance = Instance::builder(InstanceOptions::default())
            .cleanup(Arc::clone(&registry))
            .detached()
            .build();
        assert_eq!(registry.len(), 1);
        instance.end().run().await.unwrap();
        assert!(instance.is_ended());
    }

    assert!(registry.is_empty());
}

/// Running cleanups tears down live instances.
#[tokio::test]
async fn run_all_ends_live_instances() {
    let registry = Arc::new(CleanupRegistry::new());
    let instance = Instance::builder(InstanceOptions::default())
        .cleanup(Arc::clone(&registry))
        .detached()
        .build();
    assert!(!instance.is_ended());

    registry.run_all().await;

    assert!(instance.is_ended());
}

/// Starting the listener twice keeps a single task.
#[tokio::test]
async fn ensure_listener_is_idempotent() {
    let registry = Arc::new(CleanupRegistry::new());

    registry.ensure_listener();
    registry.ensure_listener();

    assert!(registry.is_empty());
}
