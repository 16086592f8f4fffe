//! Protocol-neutral debugger orchestration.
//!
//! This crate provides:
//! - The [`Orchestrator`]: a table of debug sessions, each driven by one
//!   protocol adapter, with buffered console/exception capture and an event
//!   stream for the host.
//! - Two adapters behind the [`adapter::DebugAdapter`] trait: the inspector
//!   (remote-object) protocol and the Debug Adapter Protocol.
//! - The host command surface served by the `tether-debugger` binary.

pub mod adapter;
pub mod breakpoints;
pub mod error;
pub mod handles;
pub mod hardening;
pub mod host;
pub mod lines;
pub mod model;
pub mod orchestrator;
pub mod presets;

pub use error::{AdapterError, DebuggerError, Result};
pub use model::{
    AttachConfig, Breakpoint, ConsoleFilter, ConsoleLevel, ConsoleMessage, DebugSessionId,
    DebugSessionInfo, DebuggerEvent, EvaluateResult, ExceptionFilter, ExceptionRecord,
    PauseLocation, ProtocolKind, Scope, SessionState, SourceBreakpoint, SourceLocation, StackFrame,
    Variable,
};
pub use orchestrator::{EventSubscription, Orchestrator, SubscriptionHandle};
pub use presets::{Preset, PresetTransport};
