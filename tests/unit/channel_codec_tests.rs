//! Unit tests for control channel line framing.

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use marionette::channel::codec::{ChannelCodec, MAX_LINE_BYTES};
use marionette::AppError;

/// A complete line is returned without its trailing newline.
#[test]
fn single_line_decodes() {
    let mut codec = ChannelCodec::new();
    let mut buf = BytesMut::from("{\"event\":\"ready\",\"args\":[]}\n");

    let line = codec.decode(&mut buf).expect("decode must succeed");

    assert_eq!(line.as_deref(), Some("{\"event\":\"ready\",\"args\":[]}"));
}

/// Two lines in one buffer come out as two items.
#[test]
fn batched_lines_decode_separately() {
    let mut codec = ChannelCodec::new();
    let mut buf = BytesMut::from("{\"event\":\"a\"}\n{\"event\":\"b\"}\n");

    let first = codec.decode(&mut buf).unwrap();
    let second = codec.decode(&mut buf).unwrap();
    let third = codec.decode(&mut buf).unwrap();

    assert_eq!(first.as_deref(), Some("{\"event\":\"a\"}"));
    assert_eq!(second.as_deref(), Some("{\"event\":\"b\"}"));
    assert!(third.is_none());
}

/// A partial line is buffered until its newline arrives.
#[test]
fn partial_line_waits_for_newline() {
    let mut codec = ChannelCodec::new();
    let mut buf = BytesMut::from("{\"event\":");

    assert!(codec.decode(&mut buf).unwrap().is_none());

    buf.extend_from_slice(b"\"log\"}\n");
    assert_eq!(
        codec.decode(&mut buf).unwrap().as_deref(),
        Some("{\"event\":\"log\"}")
    );
}

/// Lines beyond the limit are rejected as a channel error.
#[test]
fn oversized_line_is_rejected() {
    let mut codec = ChannelCodec::new();
    let mut buf = BytesMut::with_capacity(MAX_LINE_BYTES + 2);
    buf.extend(std::iter::repeat(b'x').take(MAX_LINE_BYTES + 1));

    let err = codec.decode(&mut buf).expect_err("must reject oversized line");

    match err {
        AppError::Channel(msg) => assert!(msg.starts_with("line too long"), "got: {msg}"),
        other => panic!("expected AppError::Channel, got {other:?}"),
    }
}

/// Encoding appends exactly one newline.
#[test]
fn encode_appends_newline() {
    let mut codec = ChannelCodec::new();
    let mut buf = BytesMut::new();

    codec
        .encode("{\"event\":\"continue\"}".to_owned(), &mut buf)
        .unwrap();

    assert_eq!(&buf[..], b"{\"event\":\"continue\"}\n");
}
