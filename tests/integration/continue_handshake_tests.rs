//! The continue handshake holds the next action until navigation settles.

use std::time::Duration;

use serde_json::{json, Value};

use super::test_helpers::{in_process, instance, slow_runner_options};

/// With an in-process runner, `url` after `navigate` sees the new page.
#[tokio::test]
async fn next_action_observes_post_navigation_state() {
    let (mut instance, _worker) = in_process(Duration::from_millis(150)).await;

    instance
        .queue_action("navigate", vec![json!("https://example.com/slow")])
        .queue_action("url", Vec::new());
    let url = instance.run().await.unwrap();

    assert_eq!(url, json!("https://example.com/slow"));
    instance.end().run().await.unwrap();
}

/// A final action gets no handshake, so `navigate` alone returns at once.
#[tokio::test]
async fn last_action_returns_without_waiting() {
    let (mut instance, _worker) = in_process(Duration::from_millis(300)).await;
    instance.run().await.unwrap();

    instance.queue_action("navigate", vec![json!("https://example.com/later")]);
    let started = std::time::Instant::now();
    let result = instance.run().await.unwrap();

    assert_eq!(result, Value::Null);
    assert!(started.elapsed() < Duration::from_millis(300));

    instance.queue_action("url", Vec::new());
    let url = instance.run().await.unwrap();
    assert_eq!(url, json!("about:blank"), "navigation must still be in flight");
}

/// The same ordering holds against the spawned runner binary.
#[tokio::test]
async fn spawned_worker_gates_on_navigation() {
    let mut instance = instance(slow_runner_options(150));

    instance
        .queue_action("navigate", vec![json!("https://example.com/one")])
        .queue_action("url", Vec::new());
    let url = instance.end().run().await.unwrap();

    assert_eq!(url, json!("https://example.com/one"));
    assert!(instance.is_ended());
}

/// Several `goto`s in a row each land before the next starts.
#[tokio::test]
async fn sequential_gotos_land_in_order() {
    let (mut instance, _worker) = in_process(Duration::from_millis(20)).await;

    for page in ["a", "b", "c"] {
        instance.goto(&format!("https://example.com/{page}"), Default::default());
    }
    instance.queue_action("url", Vec::new());

    assert_eq!(instance.run().await.unwrap(), json!("https://example.com/c"));
    instance.end().run().await.unwrap();
}
