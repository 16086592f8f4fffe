use thiserror::Error;

use crate::model::DebugSessionId;

pub type Result<T, E = DebuggerError> = std::result::Result<T, E>;

/// Errors surfaced to the host.
#[derive(Debug, Error)]
pub enum DebuggerError {
    #[error("unsupported protocol {0:?}")]
    UnsupportedProtocol(String),
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("host session {0:?} already has a debug session attached")]
    AlreadyAttached(String),
    #[error("unknown debug session {0}")]
    SessionNotFound(DebugSessionId),
    #[error("debug session {id} is {state} and does not accept commands")]
    SessionNotActive { id: DebugSessionId, state: String },
    #[error("invalid attach configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

impl DebuggerError {
    /// Stable machine-readable code for the host surface.
    pub fn code(&self) -> &'static str {
        match self {
            DebuggerError::UnsupportedProtocol(_) => "UnsupportedProtocol",
            DebuggerError::ConnectionFailed(_) => "ConnectionFailed",
            DebuggerError::AlreadyAttached(_) => "AlreadyAttached",
            DebuggerError::SessionNotFound(_) => "SessionNotFound",
            DebuggerError::SessionNotActive { .. } => "SessionNotActive",
            DebuggerError::InvalidConfig(_) => "InvalidConfig",
            DebuggerError::Adapter(_) => "AdapterError",
        }
    }
}

/// Errors raised by a protocol adapter.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("inspector: {0}")]
    Cdp(#[from] tether_cdp::CdpError),
    #[error("debug adapter: {0}")]
    Dap(#[from] tether_dap::DapError),
    #[error("could not open transport: {0}")]
    ConnectionFailed(String),
    #[error("{0}")]
    InvalidConfig(String),
    #[error("adapter is not connected")]
    NotConnected,
}

impl AdapterError {
    /// True when the request failed because the adapter was shut down under it.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            AdapterError::Cdp(tether_cdp::CdpError::Cancelled | tether_cdp::CdpError::ConnectionClosed)
                | AdapterError::Dap(
                    tether_dap::DapError::Cancelled | tether_dap::DapError::ConnectionClosed
                )
                | AdapterError::NotConnected
        )
    }
}
