//! [`DebugAdapter`] over the Debug Adapter Protocol (`tether-dap`).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tether_dap::types::{
    Breakpoint as DapBreakpoint, InitializeArguments, OutputEventBody,
    SourceBreakpoint as DapSourceBreakpoint, StackFrame as DapStackFrame, StoppedEventBody,
};
use tether_dap::{DapClient, DapClientConfig, DapError, DapEvent, DapTransport};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;

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

const LINES: LineBase = LineBase::OneBased;

/// Upper bound on waiting for the adapter to acknowledge `disconnect`.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// Used when the adapter never reports a stopped thread and `threads` fails.
const FALLBACK_THREAD_ID: i64 = 1;

#[derive(Default)]
struct State {
    thread_id: Option<i64>,
    /// Bumped on every `stopped`; lets a resume tell whether a newer stop
    /// overtook it.
    stop_epoch: u64,
    paused: bool,
    launched: bool,
    /// Synthetic reference -> the adapter's own `variablesReference`.
    handles: HandleTable<i64>,
    breakpoints: BreakpointReconciler,
}

struct Shared {
    settings: AdapterSettings,
    sink: SinkSlot,
    client: Mutex<Option<DapClient>>,
    state: Mutex<State>,
    stop: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Over,
    Into,
    Out,
}

pub struct AdapterProtocolAdapter {
    shared: Arc<Shared>,
}

impl AdapterProtocolAdapter {
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

    fn client(&self) -> AdapterResult<DapClient> {
        self.shared.client()
    }

    async fn step(&self, step: Step) -> AdapterResult<()> {
        let client = self.client()?;
        let epoch = self.shared.state.lock().stop_epoch;
        let thread_id = self.shared.thread_id(&client).await;
        match step {
            Step::Over => client.next(thread_id).await?,
            Step::Into => client.step_in(thread_id).await?,
            Step::Out => client.step_out(thread_id).await?,
        }
        self.shared.mark_resumed(Some(epoch));
        Ok(())
    }
}

#[async_trait]
impl DebugAdapter for AdapterProtocolAdapter {
    fn protocol(&self) -> ProtocolKind {
        ProtocolKind::AdapterProtocol
    }

    fn set_event_sink(&self, sink: EventSink) {
        self.shared.sink.set(sink);
    }

    async fn connect(&self, config: &AttachConfig) -> AdapterResult<()> {
        let settings = &self.shared.settings;
        let transport = transport_for(config)?;
        let client = DapClient::connect_with_config(
            transport.clone(),
            DapClientConfig {
                connect_timeout: settings.connect_timeout,
                request_timeout: settings.request_timeout,
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
        tracing::debug!(target: "tether.debugger", transport = %transport.describe(), "debug adapter transport open");
        self.shared.sink.emit(AdapterEvent::Connected);

        let mut events = client.subscribe_events();
        client
            .initialize(&InitializeArguments::for_adapter(adapter_id(config)))
            .await?;

        let (command, arguments) = launch_request(config);
        self.shared.state.lock().launched = command == "launch";
        let launch = client.start_request(command, Some(arguments)).await?.wait();
        tokio::pin!(launch);

        // Adapters commonly hold the launch/attach response until
        // configurationDone, so wait for `initialized` and the response together.
        let mut launched = false;
        let mut backlog = Vec::new();
        let deadline = tokio::time::sleep(settings.request_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                result = &mut launch, if !launched => {
                    result?;
                    launched = true;
                }
                event = events.recv() => match event {
                    Ok(DapEvent::Initialized) => break,
                    Ok(DapEvent::TransportClosed { error }) => {
                        return Err(AdapterError::ConnectionFailed(error.unwrap_or_else(|| {
                            "debug adapter closed during handshake".into()
                        })));
                    }
                    Ok(other) => backlog.push(other),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(target: "tether.debugger", skipped, "adapter events lagged during handshake");
                    }
                    Err(RecvError::Closed) => return Err(AdapterError::NotConnected),
                },
                _ = &mut deadline => return Err(DapError::Timeout.into()),
            }
        }

        client.configuration_done().await?;
        if !launched {
            (&mut launch).await?;
        }

        while let Ok(event) = events.try_recv() {
            backlog.push(event);
        }
        // A launch with stopOnEntry reports its entry stop shortly after.
        let entry_stop_pending = config.program.is_some() && config.stop_on_entry;
        let stopped_early = backlog.iter().any(|event| matches!(event, DapEvent::Stopped(_)));
        {
            let state = self.shared.state.lock();
            if !stopped_early && !entry_stop_pending && state.stop_epoch == 0 {
                self.shared.sink.emit(AdapterEvent::Resumed);
            }
        }

        tokio::spawn(event_loop(self.shared.clone(), events, backlog));
        Ok(())
    }

    async fn disconnect(&self) {
        self.shared.stop.cancel();
        let client = self.shared.client.lock().take();
        let Some(client) = client else {
            return;
        };
        if !client.is_closed() {
            let terminate = self.shared.state.lock().launched;
            match tokio::time::timeout(DISCONNECT_GRACE, client.disconnect(terminate)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    tracing::debug!(target: "tether.debugger", error = %err, "adapter disconnect failed");
                }
                Err(_) => {
                    tracing::debug!(target: "tether.debugger", "adapter did not acknowledge disconnect");
                }
            }
        }
        client.shutdown();
        let mut state = self.shared.state.lock();
        state.paused = false;
        state.handles.clear();
    }

    async fn get_call_stack(&self) -> AdapterResult<Vec<StackFrame>> {
        let client = self.client()?;
        if !self.shared.state.lock().paused {
            return Ok(Vec::new());
        }
        let thread_id = self.shared.thread_id(&client).await;
        let frames = client.stack_trace(thread_id).await?;
        Ok(frames.iter().map(model_frame).collect())
    }

    async fn get_scopes(&self, frame_id: i64) -> AdapterResult<Vec<Scope>> {
        let client = self.client()?;
        let generation = self.shared.state.lock().handles.generation();
        let scopes = client.scopes(frame_id).await?;

        let mut state = self.shared.state.lock();
        if state.handles.generation() != generation {
            return Ok(Vec::new());
        }
        Ok(scopes
            .into_iter()
            .map(|scope| Scope {
                variables_reference: register(&mut state.handles, scope.variables_reference),
                name: scope.name,
                expensive: scope.expensive,
            })
            .collect())
    }

    async fn get_variables(&self, variables_reference: i64) -> AdapterResult<Vec<Variable>> {
        let client = self.client()?;
        let (native, generation) = {
            let state = self.shared.state.lock();
            match state.handles.get(variables_reference) {
                Some(native) => (*native, state.handles.generation()),
                None => return Ok(Vec::new()),
            }
        };

        let variables = match client.variables(native).await {
            Ok(variables) => variables,
            Err(err) => {
                let err = AdapterError::from(err);
                if err.is_cancellation() {
                    return Err(err);
                }
                tracing::debug!(target: "tether.debugger", error = %err, native, "variables request failed");
                return Ok(Vec::new());
            }
        };

        let mut state = self.shared.state.lock();
        if state.handles.generation() != generation {
            return Ok(Vec::new());
        }
        Ok(variables
            .into_iter()
            .map(|variable| Variable {
                variables_reference: register(&mut state.handles, variable.variables_reference),
                name: variable.name,
                value: variable.value,
                type_name: variable.type_name,
            })
            .collect())
    }

    async fn set_breakpoints(
        &self,
        source: &str,
        breakpoints: &[SourceBreakpoint],
    ) -> AdapterResult<Vec<Breakpoint>> {
        let client = self.client()?;
        let native: Vec<DapSourceBreakpoint> = breakpoints
            .iter()
            .map(|bp| DapSourceBreakpoint {
                line: LINES.to_native(bp.line),
                column: bp.column.map(|column| LINES.to_native(column)),
                condition: bp.condition.clone(),
            })
            .collect();

        let reported = match client.set_breakpoints(source, &native).await {
            Ok(reported) => Ok(reported),
            Err(err) => {
                let err = AdapterError::from(err);
                if err.is_cancellation() {
                    return Err(err);
                }
                tracing::debug!(target: "tether.debugger", %source, error = %err, "setBreakpoints failed");
                Err(err.to_string())
            }
        };

        let mut state = self.shared.state.lock();
        let installed: Vec<Breakpoint> = breakpoints
            .iter()
            .enumerate()
            .map(|(index, requested)| {
                let answer = match &reported {
                    Ok(reported) => reported
                        .get(index)
                        .ok_or_else(|| "breakpoint not reported by adapter".to_string()),
                    Err(message) => Err(message.clone()),
                };
                match answer {
                    Ok(bp) => Breakpoint {
                        id: match bp.id {
                            Some(id) => id.to_string(),
                            None => state.breakpoints.local_id(),
                        },
                        verified: bp.verified,
                        source: source.to_string(),
                        line: bp
                            .line
                            .map(|line| LINES.to_model(i64::from(line)))
                            .unwrap_or(requested.line),
                        column: bp
                            .column
                            .map(|column| LINES.to_model(i64::from(column)))
                            .or(requested.column),
                        condition: requested.condition.clone(),
                        message: bp.message.clone(),
                    },
                    Err(message) => Breakpoint {
                        id: state.breakpoints.local_id(),
                        verified: false,
                        source: source.to_string(),
                        line: requested.line,
                        column: requested.column,
                        condition: requested.condition.clone(),
                        message: Some(message),
                    },
                }
            })
            .collect();
        state.breakpoints.replace(source, installed.clone());
        Ok(installed)
    }

    async fn remove_breakpoint(&self, breakpoint_id: &str) -> AdapterResult<Vec<Breakpoint>> {
        self.client()?;
        let (source, remaining) = {
            let state = self.shared.state.lock();
            let Some(source) = state.breakpoints.source_of(breakpoint_id) else {
                return Ok(Vec::new());
            };
            let remaining: Vec<SourceBreakpoint> = state
                .breakpoints
                .for_source(source)
                .iter()
                .filter(|bp| bp.id != breakpoint_id)
                .map(|bp| SourceBreakpoint {
                    line: bp.line,
                    column: bp.column,
                    condition: bp.condition.clone(),
                })
                .collect();
            (source.to_string(), remaining)
        };
        // The protocol has no single-breakpoint removal; re-send the rest.
        self.set_breakpoints(&source, &remaining).await
    }

    async fn resume(&self) -> AdapterResult<()> {
        let client = self.client()?;
        let epoch = self.shared.state.lock().stop_epoch;
        let thread_id = self.shared.thread_id(&client).await;
        client.continue_thread(thread_id).await?;
        self.shared.mark_resumed(Some(epoch));
        Ok(())
    }

    async fn pause(&self) -> AdapterResult<()> {
        let client = self.client()?;
        let thread_id = self.shared.thread_id(&client).await;
        client.pause(thread_id).await?;
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
        // Frame ids die with the stop that produced them; fall back to the
        // global scope while running.
        let frame_id = frame_id.filter(|_| self.shared.state.lock().paused);
        match client.evaluate(expression, frame_id, "repl").await {
            Ok(body) => {
                let variables_reference = {
                    let mut state = self.shared.state.lock();
                    register(&mut state.handles, body.variables_reference)
                };
                Ok(EvaluateResult {
                    result: body.result,
                    type_name: body.type_name,
                    variables_reference,
                    is_error: false,
                })
            }
            Err(DapError::Request { message, .. }) => Ok(EvaluateResult {
                result: message,
                type_name: None,
                variables_reference: 0,
                is_error: true,
            }),
            Err(err) => Err(err.into()),
        }
    }
}

impl Shared {
    fn client(&self) -> AdapterResult<DapClient> {
        self.client.lock().clone().ok_or(AdapterError::NotConnected)
    }

    /// The stopped thread, else the adapter's first thread.
    async fn thread_id(&self, client: &DapClient) -> i64 {
        if let Some(thread_id) = self.state.lock().thread_id {
            return thread_id;
        }
        let thread_id = match client.threads().await {
            Ok(threads) => threads
                .first()
                .map(|thread| thread.id)
                .unwrap_or(FALLBACK_THREAD_ID),
            Err(err) => {
                tracing::debug!(target: "tether.debugger", error = %err, "threads request failed");
                FALLBACK_THREAD_ID
            }
        };
        *self.state.lock().thread_id.get_or_insert(thread_id)
    }

    /// Report `Resumed` unless a newer stop arrived after `expected_epoch` was read.
    fn mark_resumed(&self, expected_epoch: Option<u64>) {
        let mut state = self.state.lock();
        if expected_epoch.is_some_and(|epoch| epoch != state.stop_epoch) || !state.paused {
            return;
        }
        state.paused = false;
        state.handles.clear();
        self.sink.emit(AdapterEvent::Resumed);
    }

    /// Apply one adapter event. Returns false once the transport is gone.
    async fn handle_event(&self, event: DapEvent) -> bool {
        match event {
            DapEvent::Stopped(body) => self.on_stopped(body).await,
            DapEvent::Continued(_) => self.mark_resumed(None),
            DapEvent::Output(body) => {
                if let Some(entry) = console_entry(&body) {
                    self.sink.emit(AdapterEvent::Console(entry));
                }
            }
            DapEvent::Exited(body) => self.sink.emit(AdapterEvent::Terminated {
                reason: format!("exited with code {}", body.exit_code),
            }),
            DapEvent::Terminated => self.sink.emit(AdapterEvent::Terminated {
                reason: "terminated".into(),
            }),
            DapEvent::Initialized => {}
            DapEvent::Other(event) if event.event == "breakpoint" => {
                self.on_breakpoint_event(event.body.unwrap_or(Value::Null));
            }
            DapEvent::Other(event) => {
                tracing::trace!(target: "tether.debugger", event = %event.event, "ignoring adapter event");
            }
            DapEvent::TransportClosed { error } => {
                self.sink.emit(AdapterEvent::TransportClosed { error });
                return false;
            }
        }
        true
    }

    async fn on_stopped(&self, body: StoppedEventBody) {
        let epoch = {
            let mut state = self.state.lock();
            state.stop_epoch += 1;
            state.paused = true;
            state.handles.clear();
            if body.thread_id.is_some() {
                state.thread_id = body.thread_id;
            }
            state.stop_epoch
        };
        let Ok(client) = self.client() else {
            return;
        };

        let thread_id = self.thread_id(&client).await;
        let frames = client.stack_trace(thread_id).await.unwrap_or_else(|err| {
            tracing::debug!(target: "tether.debugger", error = %err, "stackTrace after stop failed");
            Vec::new()
        });
        let native_scopes = match frames.first() {
            Some(top) => client.scopes(top.id).await.unwrap_or_else(|err| {
                tracing::debug!(target: "tether.debugger", error = %err, "scopes after stop failed");
                Vec::new()
            }),
            None => Vec::new(),
        };

        let mut state = self.state.lock();
        if state.stop_epoch != epoch || !state.paused {
            // Resumed or stopped again while the stack was being fetched.
            return;
        }

        let call_stack: Vec<StackFrame> = frames.iter().map(model_frame).collect();
        let scopes = native_scopes
            .into_iter()
            .map(|scope| Scope {
                variables_reference: register(&mut state.handles, scope.variables_reference),
                name: scope.name,
                expensive: scope.expensive,
            })
            .collect();
        let top = call_stack.first();
        let location = PauseLocation {
            source: top.map(|frame| frame.source.clone()).unwrap_or_default(),
            line: top.map(|frame| frame.line).unwrap_or(1),
            column: top.and_then(|frame| frame.column),
            reason: body.reason.clone(),
        };

        if body.reason == "exception" {
            self.sink.emit(AdapterEvent::Exception(exception_entry(&body, &call_stack)));
        }
        self.sink.emit(AdapterEvent::Paused {
            location,
            reason: body.reason,
            call_stack,
            scopes,
            hit_breakpoints: body
                .hit_breakpoint_ids
                .iter()
                .map(ToString::to_string)
                .collect(),
        });
    }

    fn on_breakpoint_event(&self, body: Value) {
        let Some(reported) = body
            .get("breakpoint")
            .cloned()
            .and_then(|value| serde_json::from_value::<DapBreakpoint>(value).ok())
        else {
            return;
        };
        let Some(id) = reported.id.map(|id| id.to_string()) else {
            return;
        };

        let mut state = self.state.lock();
        let Some(existing) = state.breakpoints.get(&id).cloned() else {
            return;
        };
        let updated = Breakpoint {
            verified: reported.verified,
            line: reported
                .line
                .map(|line| LINES.to_model(i64::from(line)))
                .unwrap_or(existing.line),
            column: reported
                .column
                .map(|column| LINES.to_model(i64::from(column)))
                .or(existing.column),
            message: reported.message,
            ..existing
        };
        state.breakpoints.update(updated.clone());
        self.sink.emit(AdapterEvent::BreakpointChanged(updated));
    }
}

async fn event_loop(
    shared: Arc<Shared>,
    mut events: broadcast::Receiver<DapEvent>,
    backlog: Vec<DapEvent>,
) {
    for event in backlog {
        if !shared.handle_event(event).await {
            return;
        }
    }
    loop {
        let event = tokio::select! {
            _ = shared.stop.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(event) => {
                if !shared.handle_event(event).await {
                    break;
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(target: "tether.debugger", skipped, "adapter events lagged");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn transport_for(config: &AttachConfig) -> AdapterResult<DapTransport> {
    match &config.adapter_path {
        Some(command) => Ok(DapTransport::Stdio {
            command: command.clone(),
            args: config.adapter_args.clone(),
            cwd: config.cwd.as_ref().map(PathBuf::from),
            env: config.env.clone(),
        }),
        None => {
            let port = config.port.ok_or_else(|| {
                AdapterError::InvalidConfig("adapter-protocol needs adapterPath or port".into())
            })?;
            Ok(DapTransport::Tcp {
                host: config
                    .host
                    .clone()
                    .unwrap_or_else(|| DEFAULT_HOST.to_string()),
                port,
            })
        }
    }
}

/// `launch` when a program is given, otherwise `attach` to `attachPort`.
fn launch_request(config: &AttachConfig) -> (&'static str, Value) {
    let mut arguments = Map::new();
    match &config.program {
        Some(program) => {
            arguments.insert("program".into(), json!(program));
            arguments.insert("args".into(), json!(config.args));
            if let Some(cwd) = &config.cwd {
                arguments.insert("cwd".into(), json!(cwd));
            }
            if !config.env.is_empty() {
                arguments.insert("env".into(), json!(config.env));
            }
            arguments.insert("stopOnEntry".into(), json!(config.stop_on_entry));
            ("launch", Value::Object(arguments))
        }
        None => {
            let host = config.host.as_deref().unwrap_or(DEFAULT_HOST);
            arguments.insert("host".into(), json!(host));
            if let Some(port) = config.attach_port {
                arguments.insert("port".into(), json!(port));
                arguments.insert("connect".into(), json!({ "host": host, "port": port }));
            }
            ("attach", Value::Object(arguments))
        }
    }
}

fn adapter_id(config: &AttachConfig) -> String {
    config
        .adapter_path
        .as_deref()
        .and_then(|path| Path::new(path).file_stem())
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| "tether".to_string())
}

fn connect_error(err: DapError) -> AdapterError {
    match err {
        DapError::Spawn { .. } | DapError::Io(_) | DapError::Timeout => {
            AdapterError::ConnectionFailed(err.to_string())
        }
        other => AdapterError::Dap(other),
    }
}

fn register(handles: &mut HandleTable<i64>, native: i64) -> i64 {
    if native > 0 {
        handles.alloc(native)
    } else {
        0
    }
}

fn model_frame(frame: &DapStackFrame) -> StackFrame {
    let source = frame
        .source
        .as_ref()
        .and_then(|source| source.path.clone().or_else(|| source.name.clone()))
        .unwrap_or_default();
    StackFrame {
        id: frame.id,
        name: frame.name.clone(),
        source,
        line: LINES.to_model(i64::from(frame.line)),
        column: (frame.column > 0).then(|| LINES.to_model(i64::from(frame.column))),
    }
}

fn console_entry(body: &OutputEventBody) -> Option<ConsoleEntry> {
    let level = match body.category.as_deref() {
        Some("telemetry") => return None,
        Some("stderr") => ConsoleLevel::Error,
        Some("important") => ConsoleLevel::Warn,
        _ => ConsoleLevel::Log,
    };
    let location = match (&body.source, body.line) {
        (Some(source), Some(line)) => source.path.clone().map(|path| SourceLocation {
            source: path,
            line: LINES.to_model(i64::from(line)),
            column: None,
        }),
        _ => None,
    };
    Some(ConsoleEntry {
        level,
        text: body.output.trim_end_matches(&['\r', '\n'][..]).to_string(),
        location,
        stack_trace: None,
        timestamp: None,
    })
}

fn exception_entry(body: &StoppedEventBody, call_stack: &[StackFrame]) -> ExceptionEntry {
    let message = body
        .text
        .clone()
        .or_else(|| body.description.clone())
        .unwrap_or_else(|| "exception".to_string());
    let summary = format!(
        "{} {}",
        body.text.as_deref().unwrap_or_default(),
        body.description.as_deref().unwrap_or_default()
    )
    .to_ascii_lowercase();
    let stack_trace = (!call_stack.is_empty()).then(|| {
        call_stack
            .iter()
            .map(|frame| format!("    at {} ({}:{})", frame.name, frame.source, frame.line))
            .collect::<Vec<_>>()
            .join("\n")
    });

    ExceptionEntry {
        message,
        description: body.description.clone(),
        location: call_stack.first().map(|frame| SourceLocation {
            source: frame.source.clone(),
            line: frame.line,
            column: frame.column,
        }),
        stack_trace,
        uncaught: summary.contains("uncaught") || summary.contains("unhandled"),
        timestamp: None,
    }
}
