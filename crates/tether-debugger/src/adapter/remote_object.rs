//! [`DebugAdapter`] over the inspector protocol (`tether-cdp`).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tether_cdp::{
    BreakpointResolvedEvent, CdpClient, CdpClientConfig, CdpError, CdpEvent,
    ConsoleApiCalledEvent, ExceptionThrownEvent, PausedEvent, RemoteObject, StackTrace,
};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::{
    AdapterEvent, AdapterResult, AdapterSettings, ConsoleEntry, DebugAdapter, EventSink,
    ExceptionEntry, SinkSlot,
};
use crate::breakpoints::BreakpointReconciler;
use crate::error::AdapterError;
use crate::handles::HandleTable;
use crate::lines::LineBase;
use crate::model::{
    AttachConfig, Breakpoint, ConsoleLevel, EvaluateResult, PauseLocation, ProtocolKind, Scope,
    SourceBreakpoint, SourceLocation, StackFrame, Variable,
};

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 9229;

const LINES: LineBase = LineBase::ZeroBased;

#[derive(Debug, Clone)]
enum RemoteHandle {
    Scope { frame_id: i64, object_id: String },
    Object { object_id: String },
}

impl RemoteHandle {
    fn object_id(&self) -> &str {
        match self {
            RemoteHandle::Scope { object_id, .. } | RemoteHandle::Object { object_id } => object_id,
        }
    }

    fn frame_id(&self) -> Option<i64> {
        match self {
            RemoteHandle::Scope { frame_id, .. } => Some(*frame_id),
            RemoteHandle::Object { .. } => None,
        }
    }
}

/// Everything that is only valid while the debuggee is paused.
#[derive(Default)]
struct PauseState {
    call_stack: Vec<StackFrame>,
    native_frames: HashMap<i64, String>,
    scope_chains: HashMap<i64, Vec<tether_cdp::Scope>>,
}

#[derive(Default)]
struct State {
    scripts: HashMap<String, String>,
    handles: HandleTable<RemoteHandle>,
    breakpoints: BreakpointReconciler,
    pause: PauseState,
    seen_pause: bool,
    pending_step: bool,
}

struct Shared {
    settings: AdapterSettings,
    sink: SinkSlot,
    client: Mutex<Option<CdpClient>>,
    state: Mutex<State>,
    stop: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Over,
    Into,
    Out,
}

pub struct RemoteObjectAdapter {
    shared: Arc<Shared>,
}

impl RemoteObjectAdapter {
    pub fn new(settings: AdapterSettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                sink: SinkSlot::default(),
                client: Mutex::new(None),
                state: Mutex::new(State::default()),
                stop: CancellationToken::new(),
            }),
        }
    }

    fn client(&self) -> AdapterResult<CdpClient> {
        self.shared
            .client
            .lock()
            .clone()
            .ok_or(AdapterError::NotConnected)
    }

    async fn step(&self, step: Step) -> AdapterResult<()> {
        let client = self.client()?;
        self.shared.state.lock().pending_step = true;
        let sent = match step {
            Step::Over => client.step_over().await,
            Step::Into => client.step_into().await,
            Step::Out => client.step_out().await,
        };
        if let Err(err) = sent {
            self.shared.state.lock().pending_step = false;
            return Err(err.into());
        }
        Ok(())
    }
}

#[async_trait]
impl DebugAdapter for RemoteObjectAdapter {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::RemoteObject
    }

    fn set_event_sink(&self, sink: EventSink) {
        self.shared.sink.set(sink);
    }

    async fn connect(&self, config: &AttachConfig) -> AdapterResult<()> {
        let settings = &self.shared.settings;
        let ws_url = resolve_websocket_url(config, settings.connect_timeout).await?;
        let client = CdpClient::connect_with_config(
            &ws_url,
            CdpClientConfig {
                connect_timeout: settings.connect_timeout,
                reply_timeout: settings.request_timeout,
                event_channel_size: settings.event_channel_size,
            },
        )
        .await
        .map_err(connect_error)?;
        *self.shared.client.lock() = Some(client.clone());
        // `disconnect` cancels `stop` before taking the client, so a detach
        // that ran while the transport was opening is seen here.
        if self.shared.stop.is_cancelled() {
            self.shared.client.lock().take();
            client.shutdown();
            return Err(AdapterError::NotConnected);
        }
        tracing::debug!(target: "tether.debugger", %ws_url, "inspector transport open");
        self.shared.sink.emit(AdapterEvent::Connected);

        let mut events = client.subscribe_events();
        client.runtime_enable().await?;
        client.debugger_enable().await?;
        if let Err(err) = client.run_if_waiting_for_debugger().await {
            tracing::debug!(target: "tether.debugger", error = %err, "runIfWaitingForDebugger failed");
        }

        // A target may pause the moment the debugger domain is enabled; apply
        // what already arrived before deciding the initial state.
        loop {
            match events.try_recv() {
                Ok(event) => {
                    if !self.shared.handle_event(event) {
                        return Err(AdapterError::ConnectionFailed(
                            "inspector closed during handshake".into(),
                        ));
                    }
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(target: "tether.debugger", skipped, "inspector events lagged during handshake");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        {
            let state = self.shared.state.lock();
            if !state.seen_pause {
                self.shared.sink.emit(AdapterEvent::Resumed);
            }
        }

        tokio::spawn(event_loop(self.shared.clone(), events));
        Ok(())
    }

    async fn disconnect(&self) {
        self.shared.stop.cancel();
        let client = self.shared.client.lock().take();
        if let Some(client) = client {
            client.shutdown();
        }
        let mut state = self.shared.state.lock();
        state.handles.clear();
        state.pause = PauseState::default();
    }

    async fn get_call_stack(&self) -> AdapterResult<Vec<StackFrame>> {
        self.client()?;
        Ok(self.shared.state.lock().pause.call_stack.clone())
    }

    async fn get_scopes(&self, frame_id: i64) -> AdapterResult<Vec<Scope>> {
        self.client()?;
        let mut state = self.shared.state.lock();
        Ok(register_scopes(&mut state, frame_id))
    }

    async fn get_variables(&self, variables_reference: i64) -> AdapterResult<Vec<Variable>> {
        let client = self.client()?;
        let (object_id, frame_id, generation) = {
            let state = self.shared.state.lock();
            match state.handles.get(variables_reference) {
                Some(handle) => (
                    handle.object_id().to_string(),
                    handle.frame_id(),
                    state.handles.generation(),
                ),
                None => return Ok(Vec::new()),
            }
        };

        let properties = match client.get_properties(&object_id).await {
            Ok(properties) => properties,
            Err(err) => {
                let err = AdapterError::from(err);
                if err.is_cancellation() {
                    return Err(err);
                }
                tracing::debug!(target: "tether.debugger", error = %err, %object_id, ?frame_id, "getProperties failed");
                return Ok(Vec::new());
            }
        };

        let mut state = self.shared.state.lock();
        // Resumed while the request was in flight: the reference is stale.
        if state.handles.generation() != generation {
            return Ok(Vec::new());
        }
        Ok(properties
            .into_iter()
            .map(|property| match property.value {
                Some(value) => {
                    let variables_reference = child_reference(&mut state.handles, &value);
                    Variable {
                        name: property.name,
                        value: value.display(),
                        type_name: Some(value.type_name()),
                        variables_reference,
                    }
                }
                None => Variable {
                    name: property.name,
                    value: "undefined".into(),
                    type_name: None,
                    variables_reference: 0,
                },
            })
            .collect())
    }

    async fn set_breakpoints(
        &self,
        source: &str,
        breakpoints: &[SourceBreakpoint],
    ) -> AdapterResult<Vec<Breakpoint>> {
        let client = self.client()?;
        let previous = self.shared.state.lock().breakpoints.take(source);
        for old in previous.iter().filter(|bp| !bp.id.starts_with("local-")) {
            if let Err(err) = client.remove_breakpoint(&old.id).await {
                let err = AdapterError::from(err);
                if err.is_cancellation() {
                    return Err(err);
                }
                tracing::debug!(target: "tether.debugger", id = %old.id, error = %err, "removeBreakpoint failed");
            }
        }

        let url = source_to_url(source);
        let mut installed = Vec::with_capacity(breakpoints.len());
        for requested in breakpoints {
            let result = client
                .set_breakpoint_by_url(
                    &url,
                    LINES.to_native(requested.line),
                    requested.column.map(|column| LINES.to_native(column)),
                    requested.condition.as_deref(),
                )
                .await;
            let breakpoint = match result {
                Ok(result) => {
                    let resolved = result.locations.first();
                    Breakpoint {
                        id: result.breakpoint_id,
                        verified: resolved.is_some(),
                        source: source.to_string(),
                        line: resolved
                            .map(|location| LINES.to_model(i64::from(location.line_number)))
                            .unwrap_or(requested.line),
                        column: resolved
                            .and_then(|location| location.column_number)
                            .map(|column| LINES.to_model(i64::from(column)))
                            .or(requested.column),
                        condition: requested.condition.clone(),
                        message: None,
                    }
                }
                Err(err) => {
                    let err = AdapterError::from(err);
                    if err.is_cancellation() {
                        return Err(err);
                    }
                    let id = self.shared.state.lock().breakpoints.local_id();
                    Breakpoint {
                        id,
                        verified: false,
                        source: source.to_string(),
                        line: requested.line,
                        column: requested.column,
                        condition: requested.condition.clone(),
                        message: Some(err.to_string()),
                    }
                }
            };
            installed.push(breakpoint);
        }

        self.shared
            .state
            .lock()
            .breakpoints
            .replace(source, installed.clone());
        Ok(installed)
    }

    async fn remove_breakpoint(&self, breakpoint_id: &str) -> AdapterResult<Vec<Breakpoint>> {
        let client = self.client()?;
        let (removed, remaining) = {
            let mut state = self.shared.state.lock();
            match state.breakpoints.remove(breakpoint_id) {
                Some(removed) => {
                    let remaining = state.breakpoints.for_source(&removed.source).to_vec();
                    (removed, remaining)
                }
                None => return Ok(Vec::new()),
            }
        };
        // The entry is already gone from the reconciler, so a failure here
        // must not leave the session record disagreeing with it.
        if !removed.id.starts_with("local-") {
            if let Err(err) = client.remove_breakpoint(&removed.id).await {
                tracing::debug!(target: "tether.debugger", id = %removed.id, error = %err, "removeBreakpoint failed");
            }
        }
        Ok(remaining)
    }

    async fn resume(&self) -> AdapterResult<()> {
        let client = self.client()?;
        self.shared.state.lock().pending_step = false;
        client.resume().await?;
        Ok(())
    }

    async fn pause(&self) -> AdapterResult<()> {
        self.client()?.pause().await?;
        Ok(())
    }

    async fn step_over(&self) -> AdapterResult<()> {
        self.step(Step::Over).await
    }

    async fn step_into(&self) -> AdapterResult<()> {
        self.step(Step::Into).await
    }

    async fn step_out(&self) -> AdapterResult<()> {
        self.step(Step::Out).await
    }

    async fn evaluate(
        &self,
        expression: &str,
        frame_id: Option<i64>,
    ) -> AdapterResult<EvaluateResult> {
        let client = self.client()?;
        let call_frame_id = frame_id.and_then(|id| {
            let state = self.shared.state.lock();
            state.pause.native_frames.get(&id).cloned()
        });

        let result = match call_frame_id {
            Some(call_frame_id) => {
                client
                    .evaluate_on_call_frame(&call_frame_id, expression)
                    .await?
            }
            None => client.evaluate(expression).await?,
        };

        if let Some(details) = result.exception_details {
            return Ok(EvaluateResult {
                result: details.message(),
                type_name: details.exception.as_ref().map(RemoteObject::type_name),
                variables_reference: 0,
                is_error: true,
            });
        }

        let variables_reference = {
            let mut state = self.shared.state.lock();
            child_reference(&mut state.handles, &result.result)
        };
        Ok(EvaluateResult {
            result: result.result.display(),
            type_name: Some(result.result.type_name()),
            variables_reference,
            is_error: false,
        })
    }
}

impl Shared {
    /// Apply one inspector notification. Returns false once the transport is gone.
    fn handle_event(&self, event: CdpEvent) -> bool {
        match event {
            CdpEvent::Paused(paused) => self.on_paused(paused),
            CdpEvent::Resumed => {
                let mut state = self.state.lock();
                state.handles.clear();
                state.pause = PauseState::default();
                self.sink.emit(AdapterEvent::Resumed);
            }
            CdpEvent::ScriptParsed(script) => {
                if !script.url.is_empty() {
                    self.state.lock().scripts.insert(script.script_id, script.url);
                }
            }
            CdpEvent::BreakpointResolved(resolved) => self.on_breakpoint_resolved(resolved),
            CdpEvent::ConsoleApiCalled(call) => {
                self.sink.emit(AdapterEvent::Console(console_entry(&call)));
            }
            CdpEvent::ExceptionThrown(thrown) => {
                let entry = {
                    let state = self.state.lock();
                    exception_entry(&thrown, &state.scripts)
                };
                self.sink.emit(AdapterEvent::Exception(entry));
            }
            CdpEvent::ExecutionContextsCleared => {
                self.state.lock().scripts.clear();
            }
            CdpEvent::Detached { reason } => {
                self.sink.emit(AdapterEvent::Terminated { reason });
            }
            CdpEvent::TransportClosed { error } => {
                self.sink.emit(AdapterEvent::TransportClosed { error });
                return false;
            }
            CdpEvent::Other { method, .. } => {
                tracing::trace!(target: "tether.debugger", %method, "ignoring inspector notification");
            }
        }
        true
    }

    fn on_paused(&self, paused: PausedEvent) {
        let mut state = self.state.lock();
        state.handles.clear();
        state.seen_pause = true;
        let reason = pause_reason(&paused, state.pending_step);
        state.pending_step = false;

        // Frame ids are numeric strings on V8; anything else falls back to
        // the frame's ordinal in this pause.
        let numeric = paused
            .call_frames
            .iter()
            .all(|frame| frame.call_frame_id.parse::<i64>().is_ok());

        let mut pause = PauseState::default();
        for (ordinal, frame) in paused.call_frames.into_iter().enumerate() {
            let id = if numeric {
                frame.call_frame_id.parse::<i64>().unwrap_or(ordinal as i64)
            } else {
                ordinal as i64
            };
            let url = if frame.url.is_empty() {
                state
                    .scripts
                    .get(&frame.location.script_id)
                    .cloned()
                    .unwrap_or_else(|| frame.location.script_id.clone())
            } else {
                frame.url.clone()
            };
            pause.call_stack.push(StackFrame {
                id,
                name: display_function_name(&frame.function_name),
                source: url_to_source(&url),
                line: LINES.to_model(i64::from(frame.location.line_number)),
                column: frame
                    .location
                    .column_number
                    .map(|column| LINES.to_model(i64::from(column))),
            });
            pause.native_frames.insert(id, frame.call_frame_id);
            pause.scope_chains.insert(id, frame.scope_chain);
        }
        state.pause = pause;

        let call_stack = state.pause.call_stack.clone();
        let (location, scopes) = match call_stack.first() {
            Some(top) => (
                PauseLocation {
                    source: top.source.clone(),
                    line: top.line,
                    column: top.column,
                    reason: reason.clone(),
                },
                register_scopes(&mut state, top.id),
            ),
            None => (
                PauseLocation {
                    source: String::new(),
                    line: 1,
                    column: None,
                    reason: reason.clone(),
                },
                Vec::new(),
            ),
        };

        self.sink.emit(AdapterEvent::Paused {
            location,
            reason,
            call_stack,
            scopes,
            hit_breakpoints: paused.hit_breakpoints,
        });
    }

    fn on_breakpoint_resolved(&self, resolved: BreakpointResolvedEvent) {
        let mut state = self.state.lock();
        let Some(existing) = state.breakpoints.get(&resolved.breakpoint_id).cloned() else {
            return;
        };
        let updated = Breakpoint {
            verified: true,
            line: LINES.to_model(i64::from(resolved.location.line_number)),
            column: resolved
                .location
                .column_number
                .map(|column| LINES.to_model(i64::from(column))),
            message: None,
            ..existing
        };
        state.breakpoints.update(updated.clone());
        self.sink.emit(AdapterEvent::BreakpointChanged(updated));
    }
}

async fn event_loop(shared: Arc<Shared>, mut events: broadcast::Receiver<CdpEvent>) {
    loop {
        let event = tokio::select! {
            _ = shared.stop.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => {
                if !shared.handle_event(event) {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(target: "tether.debugger", skipped, "inspector events lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn resolve_websocket_url(config: &AttachConfig, timeout: Duration) -> AdapterResult<String> {
    if let Some(ws_url) = &config.ws_url {
        return Ok(ws_url.clone());
    }
    let host = config.host.as_deref().unwrap_or(DEFAULT_HOST);
    let port = config.port.unwrap_or(DEFAULT_PORT);
    if let Some(target) = &config.target {
        return Ok(tether_cdp::target_websocket_url(host, port, target));
    }
    tether_cdp::discover_websocket_url(host, port, timeout)
        .await
        .map_err(connect_error)
}

fn connect_error(err: CdpError) -> AdapterError {
    match err {
        CdpError::InvalidUrl(url) => AdapterError::InvalidConfig(format!("invalid inspector url {url:?}")),
        other => AdapterError::ConnectionFailed(other.to_string()),
    }
}

fn register_scopes(state: &mut State, frame_id: i64) -> Vec<Scope> {
    let Some(chain) = state.pause.scope_chains.get(&frame_id).cloned() else {
        return Vec::new();
    };
    chain
        .into_iter()
        .map(|scope| {
            let variables_reference = match scope.object.object_id {
                Some(object_id) => state.handles.alloc(RemoteHandle::Scope {
                    frame_id,
                    object_id,
                }),
                None => 0,
            };
            Scope {
                name: scope.name.unwrap_or_else(|| scope_display_name(&scope.kind)),
                expensive: scope.kind == "global",
                variables_reference,
            }
        })
        .collect()
}

fn child_reference(handles: &mut HandleTable<RemoteHandle>, value: &RemoteObject) -> i64 {
    match &value.object_id {
        Some(object_id) if value.subtype.as_deref() != Some("null") => {
            handles.alloc(RemoteHandle::Object {
                object_id: object_id.clone(),
            })
        }
        _ => 0,
    }
}

fn pause_reason(paused: &PausedEvent, pending_step: bool) -> String {
    if !paused.hit_breakpoints.is_empty() {
        return "breakpoint".into();
    }
    let reason = match paused.reason.as_str() {
        "exception" | "promiseRejection" => "exception",
        "Break on start" => "entry",
        "step" => "step",
        _ if pending_step => "step",
        _ => "pause",
    };
    reason.into()
}

fn console_level(kind: &str) -> ConsoleLevel {
    match kind {
        "debug" | "trace" => ConsoleLevel::Debug,
        "info" => ConsoleLevel::Info,
        "warning" | "warn" => ConsoleLevel::Warn,
        "error" | "assert" => ConsoleLevel::Error,
        _ => ConsoleLevel::Log,
    }
}

fn console_entry(call: &ConsoleApiCalledEvent) -> ConsoleEntry {
    ConsoleEntry {
        level: console_level(&call.kind),
        text: call
            .args
            .iter()
            .map(RemoteObject::display)
            .collect::<Vec<_>>()
            .join(" "),
        location: call.stack_trace.as_ref().and_then(top_location),
        stack_trace: call.stack_trace.as_ref().and_then(rendered_trace),
        timestamp: timestamp_millis(call.timestamp),
    }
}

fn exception_entry(thrown: &ExceptionThrownEvent, scripts: &HashMap<String, String>) -> ExceptionEntry {
    let details = &thrown.exception_details;
    let message = details.message();
    let url = details.url.clone().or_else(|| {
        details
            .script_id
            .as_ref()
            .and_then(|script_id| scripts.get(script_id).cloned())
    });
    let location = details
        .stack_trace
        .as_ref()
        .and_then(top_location)
        .or_else(|| {
            url.map(|url| SourceLocation {
                source: url_to_source(&url),
                line: LINES.to_model(details.line_number),
                column: Some(LINES.to_model(details.column_number)),
            })
        });

    ExceptionEntry {
        message: message.lines().next().unwrap_or_default().to_string(),
        description: details
            .exception
            .as_ref()
            .and_then(|exception| exception.description.clone()),
        location,
        stack_trace: details.stack_trace.as_ref().and_then(rendered_trace),
        uncaught: details.text.starts_with("Uncaught"),
        timestamp: timestamp_millis(thrown.timestamp),
    }
}

fn top_location(trace: &StackTrace) -> Option<SourceLocation> {
    let frame = trace.call_frames.first()?;
    Some(SourceLocation {
        source: url_to_source(&frame.url),
        line: LINES.to_model(frame.line_number),
        column: Some(LINES.to_model(frame.column_number)),
    })
}

fn rendered_trace(trace: &StackTrace) -> Option<String> {
    (!trace.call_frames.is_empty()).then(|| trace.render())
}

fn timestamp_millis(value: f64) -> Option<u64> {
    (value.is_finite() && value > 0.0).then_some(value as u64)
}

fn display_function_name(name: &str) -> String {
    if name.is_empty() {
        "(anonymous)".into()
    } else {
        name.into()
    }
}

fn scope_display_name(kind: &str) -> String {
    let mut chars = kind.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => "Scope".into(),
    }
}

/// Absolute paths become `file://` URLs; anything URL-shaped passes through.
fn source_to_url(source: &str) -> String {
    if source.contains("://") {
        return source.to_string();
    }
    let path = Path::new(source);
    if path.is_absolute() {
        if let Ok(url) = Url::from_file_path(path) {
            return url.to_string();
        }
    }
    source.to_string()
}

/// `file://` URLs turn back into paths; other URLs stay as they are.
fn url_to_source(url: &str) -> String {
    if url.starts_with("file://") {
        if let Ok(Ok(path)) = Url::parse(url).map(|url| url.to_file_path()) {
            return path.display().to_string();
        }
    }
    url.to_string()
}
