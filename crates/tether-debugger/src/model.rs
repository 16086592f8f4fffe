//! Protocol-neutral debugger data model.
//!
//! Everything here crosses the host boundary, so types serialize in camelCase
//! to match the command surface. Lines and columns are always 1-based.

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DebugSessionId(pub u64);

impl fmt::Display for DebugSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProtocolKind {
    RemoteObject,
    AdapterProtocol,
}

impl ProtocolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProtocolKind::RemoteObject => "remote-object",
            ProtocolKind::AdapterProtocol => "adapter-protocol",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "remote-object" => Some(ProtocolKind::RemoteObject),
            "adapter-protocol" => Some(ProtocolKind::AdapterProtocol),
            _ => None,
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Running,
    Paused,
    Terminated,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Connected => "connected",
            SessionState::Running => "running",
            SessionState::Paused => "paused",
            SessionState::Terminated => "terminated",
        }
    }

    /// Whether the session forwards commands to its adapter in this state.
    pub fn accepts_commands(self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::Running | SessionState::Paused
        )
    }

    /// Transition table. `Terminated` is reachable from anywhere and is absorbing.
    pub fn can_transition(self, to: SessionState) -> bool {
        use SessionState::*;

        match (self, to) {
            (Terminated, _) => false,
            (_, Terminated) => true,
            (Disconnected, Connecting) => true,
            (Connecting, Connected) => true,
            (Connected, Running | Paused) => true,
            (Running, Paused) | (Paused, Running) => true,
            // A step that lands immediately reports paused -> paused.
            (Paused, Paused) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceLocation {
    pub source: String,
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseLocation {
    pub source: String,
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    /// `breakpoint`, `step`, `exception`, `entry`, `pause`, ...
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Breakpoint {
    /// Adapter-issued id, or a `local-N` id when the adapter gave none.
    pub id: String,
    pub verified: bool,
    pub source: String,
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceBreakpoint {
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl SourceBreakpoint {
    pub fn at_line(line: u32) -> Self {
        Self {
            line,
            column: None,
            condition: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub id: i64,
    pub name: String,
    pub source: String,
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    pub name: String,
    pub variables_reference: i64,
    #[serde(default)]
    pub expensive: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    pub value: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    /// Zero when the value has no children.
    #[serde(default)]
    pub variables_reference: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Debug,
    Info,
    Warn,
    Error,
}

impl ConsoleLevel {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "log" => Some(ConsoleLevel::Log),
            "debug" => Some(ConsoleLevel::Debug),
            "info" => Some(ConsoleLevel::Info),
            "warn" => Some(ConsoleLevel::Warn),
            "error" => Some(ConsoleLevel::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleMessage {
    pub session_id: DebugSessionId,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub level: ConsoleLevel,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionRecord {
    pub session_id: DebugSessionId,
    pub timestamp: u64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub uncaught: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResult {
    pub result: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(default)]
    pub variables_reference: i64,
    /// Set when `result` is the text of an exception the expression raised.
    #[serde(default)]
    pub is_error: bool,
}

/// Host-supplied attach configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AttachConfig {
    /// `remote-object` or `adapter-protocol`; kept raw so unsupported values
    /// can be reported as such.
    pub protocol: String,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Target path appended to `host:port` for remote-object endpoints.
    pub target: Option<String>,
    pub ws_url: Option<String>,
    pub adapter_path: Option<String>,
    pub adapter_args: Vec<String>,
    pub program: Option<String>,
    pub args: Vec<String>,
    pub cwd: Option<String>,
    pub attach_port: Option<u16>,
    pub stop_on_entry: bool,
    pub env: HashMap<String, String>,
}

/// Snapshot of one session, as returned by `getSession`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugSessionInfo {
    pub id: DebugSessionId,
    pub host_session_id: String,
    pub protocol: ProtocolKind,
    pub state: SessionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_location: Option<PauseLocation>,
    pub call_stack: Vec<StackFrame>,
    pub scopes: Vec<Scope>,
    pub breakpoints: Vec<Breakpoint>,
    pub created_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsoleFilter {
    pub session_id: Option<DebugSessionId>,
    pub level: Option<ConsoleLevel>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExceptionFilter {
    pub session_id: Option<DebugSessionId>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

/// Events published to orchestrator subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "body", rename_all = "camelCase")]
pub enum DebuggerEvent {
    #[serde(rename_all = "camelCase")]
    SessionCreated {
        session_id: DebugSessionId,
        host_session_id: String,
        protocol: ProtocolKind,
    },
    #[serde(rename_all = "camelCase")]
    StateChanged {
        session_id: DebugSessionId,
        state: SessionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<PauseLocation>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_stack: Option<Vec<StackFrame>>,
    },
    ConsoleMessage(ConsoleMessage),
    Exception(ExceptionRecord),
    #[serde(rename_all = "camelCase")]
    BreakpointHit {
        session_id: DebugSessionId,
        breakpoint: Breakpoint,
        call_stack: Vec<StackFrame>,
    },
    #[serde(rename_all = "camelCase")]
    SessionRemoved {
        session_id: DebugSessionId,
        reason: String,
    },
}

impl DebuggerEvent {
    pub fn session_id(&self) -> DebugSessionId {
        match self {
            DebuggerEvent::SessionCreated { session_id, .. }
            | DebuggerEvent::StateChanged { session_id, .. }
            | DebuggerEvent::BreakpointHit { session_id, .. }
            | DebuggerEvent::SessionRemoved { session_id, .. } => *session_id,
            DebuggerEvent::ConsoleMessage(message) => message.session_id,
            DebuggerEvent::Exception(record) => record.session_id,
        }
    }

    /// Wire name used on the host surface.
    pub fn name(&self) -> &'static str {
        match self {
            DebuggerEvent::SessionCreated { .. } => "sessionCreated",
            DebuggerEvent::StateChanged { .. } => "stateChanged",
            DebuggerEvent::ConsoleMessage(_) => "consoleMessage",
            DebuggerEvent::Exception(_) => "exception",
            DebuggerEvent::BreakpointHit { .. } => "breakpointHit",
            DebuggerEvent::SessionRemoved { .. } => "sessionRemoved",
        }
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}
