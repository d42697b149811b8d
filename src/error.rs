use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid arguments: {0}")]
    InvalidArgs(String),
    #[error("Error Initializing Tracing: {0}")]
    InitTracing(String),
    #[error("Error Initializing Prometheus Metrics: {0}")]
    InitMetrics(String),
}

/// Failures surfaced by a [`ConnectionHandle`](crate::connection::ConnectionHandle) or reported
/// through [`ConnectionEvent::Error`](crate::connection::ConnectionEvent::Error).
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("connection task has shut down")]
    Closed,
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error(transparent)]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Errors that can occur while decoding an inbound feed frame.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("failed to parse payload JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("failed to decompress brotli payload: {0}")]
    Decompress(std::io::Error),
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

/// Why a manual reconnect request was not carried out.
#[derive(Error, Debug)]
pub enum ReconnectError {
    #[error(transparent)]
    RateLimited(#[from] crate::RateLimitError),
    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("transaction count store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("transaction count store is corrupt: {0}")]
    Json(#[from] serde_json::Error),
}
