//! Unit tests for the in-memory reference engine.

use std::collections::BTreeMap;
use std::time::Duration;

use serde_json::{json, Map};

use marionette::config::BootstrapArgs;
use marionette::runner::engine::{Engine, MemoryEngine, NAVIGATION_DELAY_SWITCH};
use marionette::AppError;

/// A fresh engine sits idle at `about:blank`.
#[test]
fn starts_blank_and_idle() {
    let engine = MemoryEngine::new(Duration::ZERO);

    assert_eq!(engine.url(), "about:blank");
    assert!(!engine.is_loading());
    assert_eq!(engine.versions()["engine"], "memory");
}

/// Navigation is loading until the delay elapses, then commits.
#[tokio::test]
async fn navigation_commits_after_delay() {
    let engine = MemoryEngine::new(Duration::from_millis(50));

    engine
        .begin_navigation("https://example.com/", &Map::new())
        .unwrap();
    assert!(engine.is_loading());
    assert_eq!(engine.url(), "about:blank");

    engine.wait_for_load().await.unwrap();

    assert!(!engine.is_loading());
    assert_eq!(engine.url(), "https://example.com/");
}

/// Lifecycle events are emitted in load order.
#[tokio::test]
async fn lifecycle_events_in_order() {
    let engine = MemoryEngine::new(Duration::from_millis(5));
    let mut events = engine.events();

    engine
        .begin_navigation("https://example.com/", &Map::new())
        .unwrap();
    engine.wait_for_load().await.unwrap();

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name);
    }
    assert_eq!(
        names,
        vec!["did-start-loading", "dom-ready", "did-finish-load", "did-stop-loading"]
    );
}

/// Unsupported schemes fail immediately with `did-fail-load`.
#[tokio::test]
async fn invalid_url_fails_load() {
    let engine = MemoryEngine::new(Duration::ZERO);
    let mut events = engine.events();

    let err = engine
        .begin_navigation("notascheme", &Map::new())
        .unwrap_err();

    assert!(matches!(err, AppError::Remote(ref msg) if msg.contains("ERR_INVALID_URL")));
    assert!(!engine.is_loading());
    assert!(engine.wait_for_load().await.is_err());
    assert_eq!(engine.url(), "about:blank");

    let mut names = Vec::new();
    while let Ok(event) = events.try_recv() {
        names.push(event.name);
    }
    assert!(names.contains(&"did-fail-load".to_owned()));
}

/// A newer navigation supersedes an older one.
#[tokio::test]
async fn newer_navigation_wins() {
    let engine = MemoryEngine::new(Duration::from_millis(30));

    engine
        .begin_navigation("https://example.com/first", &Map::new())
        .unwrap();
    engine
        .begin_navigation("https://example.com/second", &Map::new())
        .unwrap();
    engine.wait_for_load().await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert_eq!(engine.url(), "https://example.com/second");
}

/// The delay switch and app paths come from the bootstrap arguments.
#[tokio::test]
async fn bootstrap_configures_engine() {
    let bootstrap = BootstrapArgs {
        paths: BTreeMap::from([("userData".to_owned(), "/tmp/profile".to_owned())]),
        switches: BTreeMap::from([(NAVIGATION_DELAY_SWITCH.to_owned(), "40".to_owned())]),
        ..BootstrapArgs::default()
    };
    let engine = MemoryEngine::from_bootstrap(&bootstrap);

    assert_eq!(engine.path("userData"), Some("/tmp/profile"));
    engine
        .begin_navigation("https://example.com/", &Map::new())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(engine.is_loading());
    engine.wait_for_load().await.unwrap();
}

/// Initialisation stores object options and rejects scalars.
#[test]
fn initialize_accepts_objects_only() {
    let engine = MemoryEngine::new(Duration::ZERO);

    engine.initialize(&json!({"width": 800})).unwrap();
    assert_eq!(engine.options(), json!({"width": 800}));
    assert!(engine.initialize(&json!(42)).is_err());
}
