//! Unit tests for the newline-preserving output codec.
//!
//! Covers:
//! - complete lines keep their trailing newline
//! - partial lines buffer until the newline arrives
//! - a terminated partial line is flushed at EOF
//! - oversized unterminated chunks are flushed rather than dropped
//! - invalid UTF-8 degrades lossily instead of erroring

use agent_link::supervisor::pipe::LogLineCodec;
use bytes::BytesMut;
use tokio_util::codec::Decoder;

/// A complete line is returned with its `\n` intact.
#[test]
fn complete_line_keeps_newline() {
    let mut codec = LogLineCodec::new();
    let mut buf = BytesMut::from("hello world\n");

    let line = codec.decode(&mut buf).expect("decode");
    assert_eq!(line, Some("hello world\n".to_owned()));
    assert!(codec.decode(&mut buf).expect("decode").is_none());
}

/// Two lines in one buffer come out as two items.
#[test]
fn batched_lines_split() {
    let mut codec = LogLineCodec::new();
    let mut buf = BytesMut::from("one\ntwo\n");

    assert_eq!(codec.decode(&mut buf).expect("decode"), Some("one\n".to_owned()));
    assert_eq!(codec.decode(&mut buf).expect("decode"), Some("two\n".to_owned()));
    assert!(codec.decode(&mut buf).expect("decode").is_none());
}

/// A fragment without a newline stays buffered.
#[test]
fn partial_line_is_buffered() {
    let mut codec = LogLineCodec::new();
    let mut buf = BytesMut::from("no newline yet");

    assert!(codec.decode(&mut buf).expect("decode").is_none());

    buf.extend_from_slice(b" done\n");
    assert_eq!(
        codec.decode(&mut buf).expect("decode"),
        Some("no newline yet done\n".to_owned())
    );
}

/// At EOF a terminated partial line is flushed without a newline.
#[test]
fn partial_line_flushed_at_eof() {
    let mut codec = LogLineCodec::new();
    let mut buf = BytesMut::from("tail without newline");

    let line = codec.decode_eof(&mut buf).expect("decode_eof");
    assert_eq!(line, Some("tail without newline".to_owned()));
    assert!(codec.decode_eof(&mut buf).expect("decode_eof").is_none());
}

/// An empty buffer at EOF yields nothing.
#[test]
fn empty_eof_yields_none() {
    let mut codec = LogLineCodec::new();
    let mut buf = BytesMut::new();
    assert!(codec.decode_eof(&mut buf).expect("decode_eof").is_none());
}

/// An unterminated chunk past the cap is flushed as its own item instead of
/// growing the buffer without bound.
#[test]
fn oversized_chunk_is_flushed() {
    let mut codec = LogLineCodec::new();
    let big = "x".repeat(1_048_577);
    let mut buf = BytesMut::from(big.as_str());

    let line = codec.decode(&mut buf).expect("decode");
    assert_eq!(line.as_deref().map(str::len), Some(1_048_577));
    assert!(buf.is_empty());
}

/// Invalid UTF-8 bytes are replaced, never fatal.
#[test]
fn invalid_utf8_is_lossy() {
    let mut codec = LogLineCodec::new();
    let mut buf = BytesMut::from(&b"ok \xff\xfe bytes\n"[..]);

    let line = codec.decode(&mut buf).expect("decode").expect("line");
    assert!(line.contains('\u{FFFD}'));
    assert!(line.ends_with('\n'));
}
