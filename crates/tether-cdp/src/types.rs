use std::io;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CdpError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] async_tungstenite::tungstenite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("target discovery failed: {0}")]
    Discovery(String),

    #[error("invalid inspector url {0:?}")]
    InvalidUrl(String),

    #[error("inspector request timed out")]
    Timeout,

    #[error("inspector client was shut down")]
    Cancelled,

    #[error("inspector connection closed")]
    ConnectionClosed,

    #[error("inspector protocol error: {0}")]
    Protocol(String),

    #[error("{method} failed ({code}): {message}")]
    Remote {
        method: String,
        code: i64,
        message: String,
    },
}

impl From<reqwest::Error> for CdpError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            CdpError::Timeout
        } else {
            CdpError::Discovery(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, CdpError>;

/// A mirror object for a value living in the debuggee.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unserializable_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
}

impl RemoteObject {
    /// Human-readable rendering, as a console would print it.
    pub fn display(&self) -> String {
        if let Some(unserializable) = &self.unserializable_value {
            return unserializable.clone();
        }
        if self.subtype.as_deref() == Some("null") {
            return "null".to_string();
        }
        match (&self.value, self.kind.as_str()) {
            (Some(Value::String(s)), _) => s.clone(),
            (Some(value), _) => value.to_string(),
            (None, "undefined") => "undefined".to_string(),
            (None, _) => self
                .description
                .clone()
                .or_else(|| self.class_name.clone())
                .unwrap_or_else(|| self.kind.clone()),
        }
    }

    /// Type label shown next to a variable.
    pub fn type_name(&self) -> String {
        match (&self.class_name, &self.subtype) {
            (Some(class), _) if self.kind == "object" => class.clone(),
            (_, Some(subtype)) => subtype.clone(),
            _ => self.kind.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub script_id: String,
    /// 0-based.
    pub line_number: u32,
    /// 0-based.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scope {
    #[serde(rename = "type")]
    pub kind: String,
    pub object: RemoteObject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// `Debugger.CallFrame`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallFrame {
    pub call_frame_id: String,
    pub function_name: String,
    pub location: Location,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub scope_chain: Vec<Scope>,
}

/// `Runtime.CallFrame`, used in captured stack traces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTraceFrame {
    pub function_name: String,
    pub script_id: String,
    pub url: String,
    pub line_number: i64,
    pub column_number: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTrace {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub call_frames: Vec<StackTraceFrame>,
}

impl StackTrace {
    /// Render the trace as `    at fn (url:line:col)` lines with 1-based positions.
    pub fn render(&self) -> String {
        self.call_frames
            .iter()
            .map(|frame| {
                let name = if frame.function_name.is_empty() {
                    "<anonymous>"
                } else {
                    frame.function_name.as_str()
                };
                format!(
                    "    at {name} ({}:{}:{})",
                    frame.url,
                    frame.line_number + 1,
                    frame.column_number + 1
                )
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionDetails {
    #[serde(default)]
    pub exception_id: i64,
    pub text: String,
    #[serde(default)]
    pub line_number: i64,
    #[serde(default)]
    pub column_number: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub script_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<StackTrace>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<RemoteObject>,
}

impl ExceptionDetails {
    /// Best description of what was thrown: the exception's own description
    /// (usually `Error: message\n    at ...`) or the summary text.
    pub fn message(&self) -> String {
        self.exception
            .as_ref()
            .and_then(|exception| exception.description.clone())
            .unwrap_or_else(|| self.text.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDescriptor {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<RemoteObject>,
    #[serde(default)]
    pub enumerable: bool,
    #[serde(default)]
    pub is_own: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PausedEvent {
    pub call_frames: Vec<CallFrame>,
    pub reason: String,
    #[serde(default)]
    pub hit_breakpoints: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptParsedEvent {
    pub script_id: String,
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakpointResolvedEvent {
    pub breakpoint_id: String,
    pub location: Location,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleApiCalledEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub args: Vec<RemoteObject>,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<StackTrace>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExceptionThrownEvent {
    #[serde(default)]
    pub timestamp: f64,
    pub exception_details: ExceptionDetails,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBreakpointByUrlResult {
    pub breakpoint_id: String,
    #[serde(default)]
    pub locations: Vec<Location>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluateResult {
    pub result: RemoteObject,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception_details: Option<ExceptionDetails>,
}

/// Notifications pushed by the inspector, in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub enum CdpEvent {
    Paused(PausedEvent),
    Resumed,
    ScriptParsed(ScriptParsedEvent),
    BreakpointResolved(BreakpointResolvedEvent),
    ConsoleApiCalled(ConsoleApiCalledEvent),
    ExceptionThrown(ExceptionThrownEvent),
    ExecutionContextsCleared,
    /// `Inspector.detached`: the debuggee ended the session.
    Detached { reason: String },
    /// The socket closed without a shutdown request.
    TransportClosed { error: Option<String> },
    Other { method: String, params: Value },
}

impl CdpEvent {
    pub fn from_notification(method: &str, params: Value) -> Result<Self> {
        let event = match method {
            "Debugger.paused" => CdpEvent::Paused(serde_json::from_value(params)?),
            "Debugger.resumed" => CdpEvent::Resumed,
            "Debugger.scriptParsed" => CdpEvent::ScriptParsed(serde_json::from_value(params)?),
            "Debugger.breakpointResolved" => {
                CdpEvent::BreakpointResolved(serde_json::from_value(params)?)
            }
            "Runtime.consoleAPICalled" => {
                CdpEvent::ConsoleApiCalled(serde_json::from_value(params)?)
            }
            "Runtime.exceptionThrown" => CdpEvent::ExceptionThrown(serde_json::from_value(params)?),
            "Runtime.executionContextsCleared" => CdpEvent::ExecutionContextsCleared,
            "Inspector.detached" => CdpEvent::Detached {
                reason: params
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("detached")
                    .to_string(),
            },
            _ => CdpEvent::Other {
                method: method.to_string(),
                params,
            },
        };
        Ok(event)
    }
}
