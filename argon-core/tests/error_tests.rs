//! Tests for the error type

use argon_core::error::{ArgonError, Result, ResultExt};

#[test]
fn test_helper_constructors() {
    assert!(matches!(ArgonError::display("gone"), ArgonError::Display(_)));
    assert!(matches!(ArgonError::encoder("bad"), ArgonError::Encoder(_)));
    assert!(matches!(ArgonError::scaler("bad"), ArgonError::Scaler(_)));
    assert!(matches!(ArgonError::config("bad"), ArgonError::Config(_)));
    assert!(matches!(ArgonError::probe("none"), ArgonError::Probe(_)));
    assert!(matches!(
        ArgonError::unsupported("no"),
        ArgonError::Unsupported(_)
    ));
}

#[test]
fn test_messages_carry_detail() {
    let err = ArgonError::encoder("send_frame failed");
    assert_eq!(err.to_string(), "Encoder error: send_frame failed");
}

#[test]
fn test_context_wraps_source() {
    let result: Result<()> = Err(ArgonError::scaler("conversion failed"));
    let err = result.context("session 1280x720").unwrap_err();

    let message = err.to_string();
    assert!(message.contains("session 1280x720"));

    let ArgonError::WithContext { source, .. } = err else {
        panic!("expected WithContext");
    };
    assert!(matches!(*source, ArgonError::Scaler(_)));
}

#[test]
fn test_io_error_converts() {
    let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    let err: ArgonError = io.into();
    assert!(matches!(err, ArgonError::Io(_)));
}
