use std::{
    collections::HashMap,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use serde_json::{json, Value};
use tokio::{
    net::{tcp::OwnedWriteHalf, TcpListener, TcpStream},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{DapReader, DapWriter},
    messages::{Event, ProtocolMessage, Request, Response},
};

/// A scripted debug adapter listening on TCP, for tests.
///
/// The debuggee is a single thread walking down one program: `continue` runs
/// to the next verified breakpoint below the current line, or to exit.
pub struct MockDebugAdapter {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
}

#[derive(Clone, Debug)]
pub struct MockDebugAdapterConfig {
    pub program: String,
    /// Hold the `launch`/`attach` response until `configurationDone`, like
    /// debugpy and js-debug do.
    pub defer_launch_response: bool,
    /// 1-based lines reported back as unverified.
    pub rejected_lines: Vec<u32>,
    pub delayed_replies: Vec<DelayedReply>,
    pub evaluations: HashMap<String, MockEvaluation>,
    /// Fail `launch`/`attach` with this message.
    pub launch_error: Option<String>,
    pub exit_code: i64,
}

impl Default for MockDebugAdapterConfig {
    fn default() -> Self {
        Self {
            program: "/app/main.py".to_string(),
            defer_launch_response: true,
            rejected_lines: Vec::new(),
            delayed_replies: Vec::new(),
            evaluations: HashMap::new(),
            launch_error: None,
            exit_code: 0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DelayedReply {
    pub command: String,
    pub delay: Duration,
}

#[derive(Clone, Debug)]
pub enum MockEvaluation {
    Value { result: String, type_name: String },
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockSourceBreakpoint {
    pub id: i64,
    pub line: u32,
    pub condition: Option<String>,
    pub verified: bool,
}

pub const THREAD_ID: i64 = 1;

impl MockDebugAdapter {
    pub async fn spawn() -> io::Result<Self> {
        Self::spawn_with_config(MockDebugAdapterConfig::default()).await
    }

    pub async fn spawn_with_config(config: MockDebugAdapterConfig) -> io::Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let state = Arc::new(State::new(config));
        let task_shutdown = shutdown.clone();
        let task_state = state.clone();
        tokio::spawn(async move {
            let _ = run(listener, task_state, task_shutdown).await;
        });

        Ok(Self {
            addr,
            shutdown,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn program(&self) -> String {
        self.state.config.program.clone()
    }

    /// Every command received, in arrival order.
    pub async fn commands(&self) -> Vec<String> {
        self.state.commands.lock().await.clone()
    }

    pub async fn launch_arguments(&self) -> Option<Value> {
        self.state.launch_arguments.lock().await.clone()
    }

    pub async fn breakpoints(&self, path: &str) -> Vec<MockSourceBreakpoint> {
        self.state
            .breakpoints
            .lock()
            .await
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    pub fn continue_calls(&self) -> u32 {
        self.state.continue_calls.load(Ordering::Relaxed)
    }

    pub fn step_calls(&self) -> u32 {
        self.state.step_calls.load(Ordering::Relaxed)
    }

    pub fn pause_calls(&self) -> u32 {
        self.state.pause_calls.load(Ordering::Relaxed)
    }

    pub async fn reverse_responses(&self) -> Vec<Response> {
        self.state.reverse_responses.lock().await.clone()
    }

    pub async fn emit_output(&self, category: &str, output: &str) -> bool {
        self.state
            .send_event("output", json!({ "category": category, "output": output }))
            .await
    }

    pub async fn emit_stopped(&self, reason: &str, line: u32) -> bool {
        self.state.line.store(line, Ordering::Relaxed);
        self.state
            .send_event(
                "stopped",
                json!({ "reason": reason, "threadId": THREAD_ID, "allThreadsStopped": true }),
            )
            .await
    }

    pub async fn emit_exited(&self, exit_code: i64) -> bool {
        self.state
            .send_event("exited", json!({ "exitCode": exit_code }))
            .await
    }

    /// Report the thread running again without a `continue` request.
    pub async fn emit_continued(&self) -> bool {
        self.state
            .send_event(
                "continued",
                json!({ "threadId": THREAD_ID, "allThreadsContinued": true }),
            )
            .await
    }

    pub async fn emit_terminated(&self) -> bool {
        self.state.send_event("terminated", json!({})).await
    }

    /// Send an adapter-to-client request such as `runInTerminal`.
    pub async fn send_reverse_request(&self, command: &str, arguments: Value) -> bool {
        let request = Request {
            seq: self.state.alloc_seq(),
            command: command.to_string(),
            arguments: Some(arguments),
        };
        self.state.send(ProtocolMessage::Request(request)).await
    }

    /// Close the active connection from the adapter side.
    pub async fn close_connection(&self) -> bool {
        let writer = self.state.writer.lock().await.take();
        match writer {
            Some(writer) => writer.lock().await.shutdown().await.is_ok(),
            None => false,
        }
    }
}

impl Drop for MockDebugAdapter {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

type SharedWriter = Arc<Mutex<DapWriter<OwnedWriteHalf>>>;

struct State {
    config: MockDebugAdapterConfig,
    delayed_replies: HashMap<String, Duration>,
    next_seq: AtomicI64,
    next_breakpoint_id: AtomicI64,
    /// 1-based line the thread is stopped at.
    line: AtomicU32,
    stop_on_entry: AtomicBool,
    /// Whether the thread is stopped, so frame ids are valid.
    halted: AtomicBool,
    continue_calls: AtomicU32,
    step_calls: AtomicU32,
    pause_calls: AtomicU32,
    commands: Mutex<Vec<String>>,
    launch_arguments: Mutex<Option<Value>>,
    deferred_launch: Mutex<Option<Request>>,
    breakpoints: Mutex<HashMap<String, Vec<MockSourceBreakpoint>>>,
    reverse_responses: Mutex<Vec<Response>>,
    writer: Mutex<Option<SharedWriter>>,
}

impl State {
    fn new(config: MockDebugAdapterConfig) -> Self {
        let delayed_replies = config
            .delayed_replies
            .iter()
            .map(|entry| (entry.command.clone(), entry.delay))
            .collect();
        Self {
            config,
            delayed_replies,
            next_seq: AtomicI64::new(1),
            next_breakpoint_id: AtomicI64::new(1),
            line: AtomicU32::new(1),
            stop_on_entry: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            continue_calls: AtomicU32::new(0),
            step_calls: AtomicU32::new(0),
            pause_calls: AtomicU32::new(0),
            commands: Mutex::new(Vec::new()),
            launch_arguments: Mutex::new(None),
            deferred_launch: Mutex::new(None),
            breakpoints: Mutex::new(HashMap::new()),
            reverse_responses: Mutex::new(Vec::new()),
            writer: Mutex::new(None),
        }
    }

    fn alloc_seq(&self) -> i64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    async fn send(&self, message: ProtocolMessage) -> bool {
        let writer = self.writer.lock().await.clone();
        let Some(writer) = writer else {
            return false;
        };
        let mut writer = writer.lock().await;
        writer.write_message(&message).await.is_ok()
    }

    async fn send_event(&self, event: &str, body: Value) -> bool {
        match event {
            "stopped" => self.halted.store(true, Ordering::Relaxed),
            "continued" | "exited" | "terminated" => {
                self.halted.store(false, Ordering::Relaxed)
            }
            _ => {}
        }
        let event = Event::new(self.alloc_seq(), event, Some(body));
        self.send(ProtocolMessage::Event(event)).await
    }

    async fn reply(&self, request: &Request, body: Value) {
        let response = Response::success(self.alloc_seq(), request, Some(body));
        self.send(ProtocolMessage::Response(response)).await;
    }

    async fn reply_error(&self, request: &Request, message: &str) {
        let response = Response::error(self.alloc_seq(), request, message);
        self.send(ProtocolMessage::Response(response)).await;
    }

    async fn stopped(&self, reason: &str, hit_breakpoint_ids: &[i64]) {
        self.send_event(
            "stopped",
            json!({
                "reason": reason,
                "threadId": THREAD_ID,
                "allThreadsStopped": true,
                "hitBreakpointIds": hit_breakpoint_ids,
            }),
        )
        .await;
    }

    /// Run to the next verified breakpoint below the current line, or exit.
    async fn run_to_next_breakpoint(&self) {
        let current = self.line.load(Ordering::Relaxed);
        let next = self
            .breakpoints
            .lock()
            .await
            .values()
            .flatten()
            .filter(|bp| bp.verified && bp.line > current)
            .min_by_key(|bp| bp.line)
            .cloned();

        match next {
            Some(bp) => {
                self.line.store(bp.line, Ordering::Relaxed);
                self.stopped("breakpoint", &[bp.id]).await;
            }
            None => {
                self.send_event(
                    "output",
                    json!({ "category": "stdout", "output": "program finished\n" }),
                )
                .await;
                self.send_event("exited", json!({ "exitCode": self.config.exit_code }))
                    .await;
                self.send_event("terminated", json!({})).await;
            }
        }
    }
}

async fn run(
    listener: TcpListener,
    state: Arc<State>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accept = listener.accept() => {
                let (socket, _) = accept?;
                let state = state.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    let _ = serve(socket, state, shutdown).await;
                });
            }
        }
    }
}

async fn serve(socket: TcpStream, state: Arc<State>, shutdown: CancellationToken) -> io::Result<()> {
    let _ = socket.set_nodelay(true);
    let (reader, writer) = socket.into_split();
    let mut reader = DapReader::new(reader);
    *state.writer.lock().await = Some(Arc::new(Mutex::new(DapWriter::new(writer))));

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = reader.read_message() => message,
        };
        let request = match message {
            Ok(Some(ProtocolMessage::Request(request))) => request,
            Ok(Some(ProtocolMessage::Response(response))) => {
                state.reverse_responses.lock().await.push(response);
                continue;
            }
            Ok(Some(ProtocolMessage::Event(_))) => continue,
            Ok(None) | Err(_) => break,
        };

        state.commands.lock().await.push(request.command.clone());
        let disconnect = request.command == "disconnect";

        match state.delayed_replies.get(&request.command).copied() {
            Some(delay) => {
                let state = state.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    handle_request(&state, request).await;
                });
            }
            None => handle_request(&state, request).await,
        }

        if disconnect {
            break;
        }
    }

    if let Some(writer) = state.writer.lock().await.take() {
        let _ = writer.lock().await.shutdown().await;
    }
    Ok(())
}

async fn handle_request(state: &State, request: Request) {
    let arguments = request.arguments.clone().unwrap_or(Value::Null);

    match request.command.as_str() {
        "initialize" => {
            state
                .reply(
                    &request,
                    json!({
                        "supportsConfigurationDoneRequest": true,
                        "supportsConditionalBreakpoints": true,
                        "supportsTerminateRequest": true,
                        "supportsEvaluateForHovers": true
                    }),
                )
                .await;
        }
        "launch" | "attach" => {
            *state.launch_arguments.lock().await = Some(arguments.clone());
            if let Some(message) = &state.config.launch_error {
                state.reply_error(&request, message).await;
                return;
            }
            let stop_on_entry = arguments
                .get("stopOnEntry")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            state.stop_on_entry.store(stop_on_entry, Ordering::Relaxed);
            state.send_event("initialized", json!({})).await;
            if state.config.defer_launch_response {
                *state.deferred_launch.lock().await = Some(request);
            } else {
                state.reply(&request, json!({})).await;
            }
        }
        "setBreakpoints" => {
            let path = arguments
                .pointer("/source/path")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let requested = arguments
                .get("breakpoints")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let installed: Vec<MockSourceBreakpoint> = requested
                .iter()
                .map(|bp| {
                    let line = bp.get("line").and_then(Value::as_u64).unwrap_or(0) as u32;
                    MockSourceBreakpoint {
                        id: state.next_breakpoint_id.fetch_add(1, Ordering::Relaxed),
                        line,
                        condition: bp
                            .get("condition")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        verified: !state.config.rejected_lines.contains(&line),
                    }
                })
                .collect();
            let body: Vec<Value> = installed
                .iter()
                .map(|bp| {
                    if bp.verified {
                        json!({ "id": bp.id, "verified": true, "line": bp.line })
                    } else {
                        json!({
                            "id": bp.id,
                            "verified": false,
                            "line": bp.line,
                            "message": "Line is not executable"
                        })
                    }
                })
                .collect();
            state.breakpoints.lock().await.insert(path, installed);
            state.reply(&request, json!({ "breakpoints": body })).await;
        }
        "configurationDone" => {
            state.reply(&request, json!({})).await;
            let deferred = state.deferred_launch.lock().await.take();
            if let Some(launch) = deferred {
                state.reply(&launch, json!({})).await;
            }
            if state.stop_on_entry.load(Ordering::Relaxed) {
                state.stopped("entry", &[]).await;
            } else {
                state.run_to_next_breakpoint().await;
            }
        }
        "threads" => {
            state
                .reply(
                    &request,
                    json!({ "threads": [{ "id": THREAD_ID, "name": "MainThread" }] }),
                )
                .await;
        }
        "stackTrace" => {
            let line = state.line.load(Ordering::Relaxed);
            let source = json!({ "name": "main.py", "path": state.config.program });
            state
                .reply(
                    &request,
                    json!({
                        "stackFrames": [
                            { "id": 1000, "name": "handle", "line": line, "column": 5, "source": source },
                            { "id": 1001, "name": "<module>", "line": 1, "column": 1, "source": source }
                        ],
                        "totalFrames": 2
                    }),
                )
                .await;
        }
        "scopes" => {
            let frame_id = arguments.get("frameId").and_then(Value::as_i64).unwrap_or(0);
            let locals = if frame_id == 1001 { 4 } else { 1 };
            state
                .reply(
                    &request,
                    json!({
                        "scopes": [
                            { "name": "Locals", "variablesReference": locals, "expensive": false },
                            { "name": "Globals", "variablesReference": 2, "expensive": false }
                        ]
                    }),
                )
                .await;
        }
        "variables" => {
            let reference = arguments
                .get("variablesReference")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            let variables = match reference {
                1 => json!([
                    { "name": "count", "value": "42", "type": "int", "variablesReference": 0 },
                    { "name": "settings", "value": "{'debug': True}", "type": "dict", "variablesReference": 3 }
                ]),
                2 => json!([
                    { "name": "__name__", "value": "'__main__'", "type": "str", "variablesReference": 0 }
                ]),
                3 => json!([
                    { "name": "'debug'", "value": "True", "type": "bool", "variablesReference": 0 }
                ]),
                4 => json!([]),
                _ => {
                    state
                        .reply_error(&request, "invalid variablesReference")
                        .await;
                    return;
                }
            };
            state
                .reply(&request, json!({ "variables": variables }))
                .await;
        }
        "continue" => {
            state.continue_calls.fetch_add(1, Ordering::Relaxed);
            state.halted.store(false, Ordering::Relaxed);
            state
                .reply(&request, json!({ "allThreadsContinued": true }))
                .await;
            state.run_to_next_breakpoint().await;
        }
        "next" | "stepIn" | "stepOut" => {
            state.step_calls.fetch_add(1, Ordering::Relaxed);
            state.halted.store(false, Ordering::Relaxed);
            state.reply(&request, json!({})).await;
            state.line.fetch_add(1, Ordering::Relaxed);
            state.stopped("step", &[]).await;
        }
        "pause" => {
            state.pause_calls.fetch_add(1, Ordering::Relaxed);
            state.reply(&request, json!({})).await;
            state.stopped("pause", &[]).await;
        }
        "evaluate" => {
            let expression = arguments
                .get("expression")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let frame_id = arguments.get("frameId").and_then(Value::as_i64);
            let halted = state.halted.load(Ordering::Relaxed);
            if frame_id.is_some_and(|id| !halted || !matches!(id, 1000 | 1001)) {
                state.reply_error(&request, "Invalid frame id").await;
                return;
            }
            match state.config.evaluations.get(expression) {
                Some(MockEvaluation::Value { result, type_name }) => {
                    state
                        .reply(
                            &request,
                            json!({ "result": result, "type": type_name, "variablesReference": 0 }),
                        )
                        .await;
                }
                Some(MockEvaluation::Error(message)) => {
                    state.reply_error(&request, message).await;
                }
                None => {
                    state
                        .reply(
                            &request,
                            json!({ "result": expression, "variablesReference": 0 }),
                        )
                        .await;
                }
            }
        }
        "disconnect" => {
            state.reply(&request, json!({})).await;
        }
        other => {
            let message = format!("unrecognized request '{other}'");
            state.reply_error(&request, &message).await;
        }
    }
}
