//! Debug Adapter Protocol plumbing: `Content-Length` framing, message types,
//! and an async client that drives an external adapter over stdio or TCP.

use std::io;

use thiserror::Error;

mod client;
pub mod codec;
pub mod messages;
pub mod types;

pub use client::{DapClient, DapClientConfig, DapEvent, DapTransport, PendingResponse};
pub use codec::{DapReader, DapWriter, MAX_DAP_HEADER_LINE_BYTES, MAX_DAP_MESSAGE_BYTES};
pub use messages::{Event, ProtocolMessage, Request, Response};

#[derive(Debug, Error)]
pub enum DapError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("dap protocol error: {0}")]
    Protocol(String),

    #[error("failed to spawn debug adapter {command:?}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{command} failed: {message}")]
    Request { command: String, message: String },

    #[error("debug adapter request timed out")]
    Timeout,

    #[error("debug adapter client was shut down")]
    Cancelled,

    #[error("debug adapter connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, DapError>;

#[cfg(any(test, feature = "test-support"))]
pub mod mock;
