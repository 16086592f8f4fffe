//! Host command surface.
//!
//! Host requests arrive framed like adapter-protocol messages
//! (`Content-Length` + `{seq, type: "request", command, arguments}`). Each
//! request runs on its own task so a slow `attach` never blocks a `detach`;
//! orchestrator events are forwarded as protocol events.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tether_dap::{DapError, DapReader, DapWriter, Event, ProtocolMessage, Request, Response};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::DebuggerError;
use crate::model::{
    AttachConfig, ConsoleFilter, DebugSessionId, DebuggerEvent, ExceptionFilter, SourceBreakpoint,
};
use crate::orchestrator::Orchestrator;

#[derive(Debug, Error)]
pub enum HostError {
    #[error(transparent)]
    Dap(#[from] DapError),
}

/// Serve the host surface over the process's stdin/stdout.
pub async fn run_stdio(orchestrator: Orchestrator) -> anyhow::Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    run(orchestrator, stdin, stdout)
        .await
        .map_err(anyhow::Error::from)
}

/// Serve until the host sends `shutdown`/`disconnect` or closes the stream.
/// Every session is detached before returning.
pub async fn run<R, W>(orchestrator: Orchestrator, reader: R, writer: W) -> Result<(), HostError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ProtocolMessage>();
    let seq = Arc::new(AtomicI64::new(1));

    let writer_task = tokio::spawn(async move {
        let mut writer = DapWriter::new(writer);
        while let Some(message) = out_rx.recv().await {
            if let Err(err) = writer.write_message(&message).await {
                tracing::warn!(target: "tether.debugger", error = %err, "failed to write to host");
                break;
            }
        }
    });

    let stop_events = CancellationToken::new();
    let event_task = spawn_event_task(&orchestrator, out_tx.clone(), seq.clone(), stop_events.clone());

    let mut requests = JoinSet::new();
    let mut reader = DapReader::new(reader);
    let mut closing_request = None;
    let result = loop {
        let message = match reader.read_message().await {
            Ok(Some(message)) => message,
            Ok(None) => break Ok(()),
            Err(err) => break Err(HostError::from(err)),
        };
        let ProtocolMessage::Request(request) = message else {
            continue;
        };
        if matches!(request.command.as_str(), "shutdown" | "disconnect") {
            closing_request = Some(request);
            break Ok(());
        }

        let orchestrator = orchestrator.clone();
        let out_tx = out_tx.clone();
        let seq = seq.clone();
        requests.spawn(async move {
            let response = match dispatch(&orchestrator, &request).await {
                Ok(body) => Response::success(next_seq(&seq), &request, body),
                Err(failure) => failure.into_response(next_seq(&seq), &request),
            };
            let _ = out_tx.send(ProtocolMessage::Response(response));
        });
    };

    orchestrator.shutdown().await;
    requests.abort_all();
    while requests.join_next().await.is_some() {}

    stop_events.cancel();
    let _ = event_task.await;
    if let Some(request) = closing_request {
        let response = Response::success(next_seq(&seq), &request, None);
        let _ = out_tx.send(ProtocolMessage::Response(response));
    }
    drop(out_tx);
    let _ = writer_task.await;
    result
}

fn next_seq(seq: &AtomicI64) -> i64 {
    seq.fetch_add(1, Ordering::Relaxed)
}

fn spawn_event_task(
    orchestrator: &Orchestrator,
    out_tx: mpsc::UnboundedSender<ProtocolMessage>,
    seq: Arc<AtomicI64>,
    stop: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let (mut events, _handle) = orchestrator.subscribe(None);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(event) => send_event(&out_tx, &seq, &event),
                    None => break,
                },
                _ = stop.cancelled() => {
                    while let Some(event) = events.try_recv() {
                        send_event(&out_tx, &seq, &event);
                    }
                    break;
                }
            }
        }
    })
}

fn send_event(out_tx: &mpsc::UnboundedSender<ProtocolMessage>, seq: &AtomicI64, event: &DebuggerEvent) {
    let body = match serde_json::to_value(event) {
        Ok(mut value) => value.get_mut("body").map(Value::take),
        Err(err) => {
            tracing::warn!(target: "tether.debugger", event = event.name(), error = %err, "failed to encode event");
            return;
        }
    };
    let event = Event::new(next_seq(seq), event.name(), body);
    let _ = out_tx.send(ProtocolMessage::Event(event));
}

/// A failed host request: stable code plus human-readable message.
struct Failure {
    code: &'static str,
    message: String,
}

impl Failure {
    fn into_response(self, seq: i64, request: &Request) -> Response {
        let mut response = Response::error(seq, request, self.message.clone());
        response.body = Some(json!({
            "error": { "code": self.code, "format": self.message }
        }));
        response
    }
}

impl From<DebuggerError> for Failure {
    fn from(err: DebuggerError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

fn arguments<T: DeserializeOwned>(request: &Request) -> Result<T, Failure> {
    let value = request
        .arguments
        .clone()
        .unwrap_or_else(|| Value::Object(Default::default()));
    serde_json::from_value(value).map_err(|err| Failure {
        code: "InvalidArguments",
        message: format!("invalid {} arguments: {err}", request.command),
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachArgs {
    host_session_id: String,
    config: AttachConfig,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionArgs {
    session_id: DebugSessionId,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScopesArgs {
    session_id: DebugSessionId,
    frame_id: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VariablesArgs {
    session_id: DebugSessionId,
    variables_reference: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetBreakpointsArgs {
    session_id: DebugSessionId,
    source: String,
    #[serde(default)]
    breakpoints: Vec<SourceBreakpoint>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoveBreakpointArgs {
    session_id: DebugSessionId,
    breakpoint_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluateArgs {
    session_id: DebugSessionId,
    expression: String,
    #[serde(default)]
    frame_id: Option<i64>,
}

async fn dispatch(orchestrator: &Orchestrator, request: &Request) -> Result<Option<Value>, Failure> {
    let body = match request.command.as_str() {
        "attach" => {
            let args: AttachArgs = arguments(request)?;
            let id = orchestrator.attach(&args.host_session_id, args.config).await?;
            json!({ "debugSessionId": id })
        }
        "detach" => {
            let args: SessionArgs = arguments(request)?;
            orchestrator.detach(args.session_id).await;
            return Ok(None);
        }
        "getSession" => {
            let args: SessionArgs = arguments(request)?;
            json!({ "session": orchestrator.get_session(args.session_id) })
        }
        "getAllSessions" => json!({ "sessions": orchestrator.get_all_sessions() }),
        "getConsoleMessages" => {
            let filter: ConsoleFilter = arguments(request)?;
            json!({ "messages": orchestrator.get_console_messages(&filter) })
        }
        "getExceptions" => {
            let filter: ExceptionFilter = arguments(request)?;
            json!({ "exceptions": orchestrator.get_exceptions(&filter) })
        }
        "getCallStack" => {
            let args: SessionArgs = arguments(request)?;
            json!({ "callStack": orchestrator.get_call_stack(args.session_id).await? })
        }
        "getScopes" => {
            let args: ScopesArgs = arguments(request)?;
            json!({ "scopes": orchestrator.get_scopes(args.session_id, args.frame_id).await? })
        }
        "getVariables" => {
            let args: VariablesArgs = arguments(request)?;
            let variables = orchestrator
                .get_variables(args.session_id, args.variables_reference)
                .await?;
            json!({ "variables": variables })
        }
        "setBreakpoints" => {
            let args: SetBreakpointsArgs = arguments(request)?;
            let breakpoints = orchestrator
                .set_breakpoints(args.session_id, &args.source, args.breakpoints)
                .await?;
            json!({ "breakpoints": breakpoints })
        }
        "removeBreakpoint" => {
            let args: RemoveBreakpointArgs = arguments(request)?;
            orchestrator
                .remove_breakpoint(args.session_id, &args.breakpoint_id)
                .await?;
            return Ok(None);
        }
        "continue" | "pause" | "stepOver" | "stepInto" | "stepOut" => {
            let args: SessionArgs = arguments(request)?;
            let id = args.session_id;
            match request.command.as_str() {
                "continue" => orchestrator.resume(id).await?,
                "pause" => orchestrator.pause(id).await?,
                "stepOver" => orchestrator.step_over(id).await?,
                "stepInto" => orchestrator.step_into(id).await?,
                _ => orchestrator.step_out(id).await?,
            }
            return Ok(None);
        }
        "evaluate" => {
            let args: EvaluateArgs = arguments(request)?;
            let result = orchestrator
                .evaluate(args.session_id, &args.expression, args.frame_id)
                .await?;
            json!(result)
        }
        "getPresets" => json!({ "presets": orchestrator.get_presets() }),
        other => {
            return Err(Failure {
                code: "UnknownCommand",
                message: format!("unknown command {other:?}"),
            })
        }
    };
    Ok(Some(body))
}
