//! Async client for the inspector debugging protocol spoken by V8-based
//! runtimes (Node.js `--inspect`, Chromium).
//!
//! Messages are JSON objects over a websocket: commands carry an `id` and
//! receive a matching reply; notifications carry only a `method`. The client
//! correlates replies, fans notifications out over a `broadcast` channel, and
//! is cancellation-aware (`tokio_util::sync::CancellationToken`).

mod client;
pub mod discovery;
pub mod types;

pub use client::{CdpClient, CdpClientConfig};
pub use discovery::{discover_websocket_url, list_targets, target_websocket_url, TargetInfo};
pub use types::{
    BreakpointResolvedEvent, CallFrame, CdpError, CdpEvent, ConsoleApiCalledEvent,
    EvaluateResult, ExceptionDetails, ExceptionThrownEvent, Location, PausedEvent,
    PropertyDescriptor, RemoteObject, Result, Scope, ScriptParsedEvent, SetBreakpointByUrlResult,
    StackTrace, StackTraceFrame,
};

// Compiled for this crate's own unit tests and, behind `test-support`, for
// downstream integration suites.
#[cfg(any(test, feature = "test-support"))]
pub mod mock;
