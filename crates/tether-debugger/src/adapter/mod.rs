//! The protocol adapter contract and its two implementations.
//!
//! An adapter owns one wire connection. It pushes normalized [`AdapterEvent`]s
//! into the sink the orchestrator registers before `connect`, and answers
//! queries in the 1-based, protocol-neutral model.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_config::DebuggerConfig;
use tokio::sync::mpsc;

use crate::error::AdapterError;
use crate::model::{
    AttachConfig, Breakpoint, ConsoleLevel, EvaluateResult, PauseLocation, ProtocolKind, Scope,
    SourceBreakpoint, SourceLocation, StackFrame, Variable,
};

pub mod adapter_protocol;
pub mod remote_object;

pub use adapter_protocol::AdapterProtocolAdapter;
pub use remote_object::RemoteObjectAdapter;

pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Where an adapter delivers its events.
pub type EventSink = mpsc::UnboundedSender<AdapterEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleEntry {
    pub level: ConsoleLevel,
    pub text: String,
    pub location: Option<SourceLocation>,
    pub stack_trace: Option<String>,
    /// Milliseconds since the epoch when the wire message carried one.
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionEntry {
    pub message: String,
    pub description: Option<String>,
    pub location: Option<SourceLocation>,
    pub stack_trace: Option<String>,
    pub uncaught: bool,
    pub timestamp: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterEvent {
    /// The transport is open; emitted before the protocol's events are enabled.
    Connected,
    Paused {
        location: PauseLocation,
        reason: String,
        call_stack: Vec<StackFrame>,
        scopes: Vec<Scope>,
        hit_breakpoints: Vec<String>,
    },
    Resumed,
    Console(ConsoleEntry),
    Exception(ExceptionEntry),
    BreakpointChanged(Breakpoint),
    /// The debuggee ended the session.
    Terminated { reason: String },
    /// The connection dropped underneath the adapter.
    TransportClosed { error: Option<String> },
}

#[async_trait]
pub trait DebugAdapter: Send + Sync {
    fn protocol(&self) -> ProtocolKind;

    /// Must be called before [`DebugAdapter::connect`].
    fn set_event_sink(&self, sink: EventSink);

    async fn connect(&self, config: &AttachConfig) -> AdapterResult<()>;

    /// Best-effort teardown; safe to call at any time, any number of times.
    async fn disconnect(&self);

    async fn get_call_stack(&self) -> AdapterResult<Vec<StackFrame>>;

    async fn get_scopes(&self, frame_id: i64) -> AdapterResult<Vec<Scope>>;

    /// Unknown or stale references yield an empty list.
    async fn get_variables(&self, variables_reference: i64) -> AdapterResult<Vec<Variable>>;

    /// Replace every breakpoint in `source`. Rejected entries come back
    /// unverified; the call only fails when the adapter itself is gone.
    async fn set_breakpoints(
        &self,
        source: &str,
        breakpoints: &[SourceBreakpoint],
    ) -> AdapterResult<Vec<Breakpoint>>;

    /// Remove one breakpoint and return what is still live in its source.
    /// Protocols without single removal re-send the rest, which can re-issue ids.
    async fn remove_breakpoint(&self, breakpoint_id: &str) -> AdapterResult<Vec<Breakpoint>>;

    async fn resume(&self) -> AdapterResult<()>;

    async fn pause(&self) -> AdapterResult<()>;

    async fn step_over(&self) -> AdapterResult<()>;

    async fn step_into(&self) -> AdapterResult<()>;

    async fn step_out(&self) -> AdapterResult<()>;

    async fn evaluate(&self, expression: &str, frame_id: Option<i64>)
        -> AdapterResult<EvaluateResult>;
}

/// Wire-level knobs shared by both adapters.
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub event_channel_size: usize,
}

impl AdapterSettings {
    pub fn from_config(config: &DebuggerConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            request_timeout: config.request_timeout(),
            event_channel_size: config.event_channel_size,
        }
    }
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self::from_config(&DebuggerConfig::default())
    }
}

/// Builds adapters for the orchestrator; replaceable so tests can inject fakes.
pub trait AdapterFactory: Send + Sync {
    fn create(&self, protocol: ProtocolKind, settings: &AdapterSettings) -> Arc<dyn DebugAdapter>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultAdapterFactory;

impl AdapterFactory for DefaultAdapterFactory {
    fn create(&self, protocol: ProtocolKind, settings: &AdapterSettings) -> Arc<dyn DebugAdapter> {
        match protocol {
            ProtocolKind::RemoteObject => Arc::new(RemoteObjectAdapter::new(settings.clone())),
            ProtocolKind::AdapterProtocol => {
                Arc::new(AdapterProtocolAdapter::new(settings.clone()))
            }
        }
    }
}

/// Check the fields `protocol` needs before anything is created.
pub fn validate_config(protocol: ProtocolKind, config: &AttachConfig) -> Result<(), String> {
    match protocol {
        ProtocolKind::RemoteObject => {
            if let Some(ws_url) = &config.ws_url {
                if !(ws_url.starts_with("ws://") || ws_url.starts_with("wss://")) {
                    return Err(format!("wsUrl must be a ws:// or wss:// url, got {ws_url:?}"));
                }
            }
            Ok(())
        }
        ProtocolKind::AdapterProtocol => {
            if config.adapter_path.as_deref().is_some_and(str::is_empty) {
                return Err("adapterPath must not be empty".into());
            }
            if config.adapter_path.is_none() && config.port.is_none() {
                return Err("adapter-protocol needs adapterPath or a port to connect to".into());
            }
            if config.program.is_none() && config.attach_port.is_none() {
                return Err("adapter-protocol needs program (launch) or attachPort (attach)".into());
            }
            Ok(())
        }
    }
}

/// The registered sink. Sends after the orchestrator dropped its receiver are
/// silently discarded.
#[derive(Default)]
pub(crate) struct SinkSlot {
    sink: Mutex<Option<EventSink>>,
}

impl SinkSlot {
    pub(crate) fn set(&self, sink: EventSink) {
        *self.sink.lock() = Some(sink);
    }

    pub(crate) fn emit(&self, event: AdapterEvent) {
        if let Some(sink) = self.sink.lock().as_ref() {
            let _ = sink.send(event);
        }
    }
}
