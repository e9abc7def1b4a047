//! Unit tests for the control channel wire envelope.

use serde_json::{json, Value};

use marionette::channel::message::Message;
use marionette::AppError;

/// Events omit both correlation fields on the wire.
#[test]
fn event_serializes_without_correlation() {
    let line = Message::event("log", vec![json!("hello")]).to_line().unwrap();
    let value: Value = serde_json::from_str(&line).unwrap();

    assert_eq!(value, json!({"event": "log", "args": ["hello"]}));
}

/// Requests carry `call_id`.
#[test]
fn request_carries_call_id() {
    let line = Message::request("goto", vec![json!("https://example.com")], 7)
        .to_line()
        .unwrap();
    let value: Value = serde_json::from_str(&line).unwrap();

    assert_eq!(value["call_id"], json!(7));
    assert!(value.get("reply_to").is_none());
}

/// Successful replies put `null` in the error slot.
#[test]
fn ok_reply_uses_null_error_slot() {
    let reply = Message::reply("url", 3, Ok(json!("about:blank")));

    assert_eq!(reply.reply_to, Some(3));
    assert_eq!(reply.args, vec![Value::Null, json!("about:blank")]);
    assert_eq!(reply.into_reply_result().unwrap(), json!("about:blank"));
}

/// Error replies come back as `AppError::Remote` without piling up prefixes.
#[test]
fn error_reply_round_trips_as_remote() {
    let reply = Message::reply("goto", 1, Err(AppError::Remote("navigation failed".into())));

    assert_eq!(reply.args[0], json!("navigation failed"));
    assert_eq!(
        reply.into_reply_result(),
        Err(AppError::Remote("navigation failed".into()))
    );
}

/// Non-remote errors keep their kind prefix in the message.
#[test]
fn local_error_reply_keeps_kind() {
    let reply = Message::reply("action", 2, Err(AppError::NotFound("no worker action named 'x'".into())));

    assert_eq!(
        reply.into_reply_result(),
        Err(AppError::Remote("not found: no worker action named 'x'".into()))
    );
}

/// Object errors use their `message` field.
#[test]
fn object_error_uses_message_field() {
    let reply = Message {
        event: "goto".into(),
        args: vec![json!({"code": -300, "message": "ERR_INVALID_URL"}), Value::Null],
        call_id: None,
        reply_to: Some(9),
    };

    assert_eq!(
        reply.into_reply_result(),
        Err(AppError::Remote("ERR_INVALID_URL".into()))
    );
}

/// A reply with no arguments is a success with a null result.
#[test]
fn empty_reply_is_null_success() {
    let reply = Message {
        event: "continue".into(),
        args: Vec::new(),
        call_id: None,
        reply_to: Some(1),
    };

    assert_eq!(reply.into_reply_result().unwrap(), Value::Null);
}

/// Blank lines parse to nothing; garbage is a channel error.
#[test]
fn parse_handles_blank_and_malformed_lines() {
    assert_eq!(Message::parse("   ").unwrap(), None);
    assert!(matches!(
        Message::parse("{not json"),
        Err(AppError::Channel(_))
    ));
}

/// Missing `args` defaults to an empty list.
#[test]
fn parse_defaults_missing_args() {
    let message = Message::parse("{\"event\":\"ready\"}").unwrap().unwrap();

    assert_eq!(message.event, "ready");
    assert!(message.args.is_empty());
    assert_eq!(message.call_id, None);
}
