use std::{
    collections::HashMap,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_tungstenite::{tokio::accept_async, tungstenite::Message};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};
use tokio_util::sync::CancellationToken;

/// A small in-process inspector used by unit and integration tests.
///
/// It serves `GET /json/list` discovery and the websocket protocol on the same
/// port and implements enough of the `Runtime`/`Debugger` domains to drive a
/// full attach, break, inspect, step, detach cycle.
pub struct MockInspector {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
}

#[derive(Clone, Debug)]
pub struct MockInspectorConfig {
    pub script_url: String,
    /// Emit `Debugger.paused` before the reply to `Debugger.enable`, the way a
    /// target launched with `--inspect-brk` does.
    pub pause_on_debugger_enable: bool,
    /// 0-based line reported by the first pause.
    pub initial_pause_line: u32,
    /// 0-based lines for which `Debugger.setBreakpointByUrl` fails.
    pub rejected_lines: Vec<u32>,
    /// Reply delays keyed by method name. Other commands are still answered
    /// while a delayed reply is pending.
    pub delayed_replies: Vec<DelayedReply>,
    /// Canned results for `Runtime.evaluate`/`Debugger.evaluateOnCallFrame`
    /// keyed by expression.
    pub evaluations: HashMap<String, MockEvaluation>,
    /// Use non-numeric call frame ids, like real V8 does.
    pub opaque_call_frame_ids: bool,
    /// After `Debugger.resume`, pause at the next breakpoint below the current line.
    pub resume_hits_breakpoints: bool,
    /// Methods answered with a protocol error.
    pub failing_methods: Vec<String>,
}

impl Default for MockInspectorConfig {
    fn default() -> Self {
        Self {
            script_url: "file:///app/main.js".to_string(),
            pause_on_debugger_enable: false,
            initial_pause_line: 0,
            rejected_lines: Vec::new(),
            delayed_replies: Vec::new(),
            evaluations: HashMap::new(),
            opaque_call_frame_ids: false,
            resume_hits_breakpoints: true,
            failing_methods: Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct DelayedReply {
    pub method: String,
    pub delay: Duration,
}

#[derive(Clone, Debug)]
pub enum MockEvaluation {
    Value(Value),
    Throw(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockBreakpoint {
    pub id: String,
    pub url: String,
    /// 0-based.
    pub line: u32,
    pub condition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockEvaluateCall {
    pub method: String,
    pub call_frame_id: Option<String>,
    pub expression: String,
}

impl MockInspector {
    pub async fn spawn() -> io::Result<Self> {
        Self::spawn_with_config(MockInspectorConfig::default()).await
    }

    pub async fn spawn_with_config(config: MockInspectorConfig) -> io::Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let state = Arc::new(State::new(config, format!("ws://{addr}/{TARGET_ID}")));
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

    pub fn ws_url(&self) -> String {
        self.state.ws_url.clone()
    }

    pub fn script_url(&self) -> String {
        self.state.config.script_url.clone()
    }

    pub async fn breakpoints(&self) -> Vec<MockBreakpoint> {
        self.state.breakpoints.lock().await.clone()
    }

    /// Every method received, in arrival order.
    pub async fn methods(&self) -> Vec<String> {
        self.state.methods.lock().await.clone()
    }

    pub async fn evaluate_calls(&self) -> Vec<MockEvaluateCall> {
        self.state.evaluate_calls.lock().await.clone()
    }

    pub fn resume_calls(&self) -> u32 {
        self.state.resume_calls.load(Ordering::Relaxed)
    }

    pub fn step_calls(&self) -> u32 {
        self.state.step_calls.load(Ordering::Relaxed)
    }

    pub fn pause_calls(&self) -> u32 {
        self.state.pause_calls.load(Ordering::Relaxed)
    }

    /// Number of websocket sessions accepted so far.
    pub fn connections(&self) -> u32 {
        self.state.connections.load(Ordering::Relaxed)
    }

    /// Whether a websocket session is currently open.
    pub fn is_connected(&self) -> bool {
        self.state.outgoing.lock().is_some()
    }

    /// Emit `Runtime.consoleAPICalled` with one argument per value.
    pub fn emit_console(&self, kind: &str, values: &[Value]) -> bool {
        let args: Vec<Value> = values.iter().map(remote_from_json).collect();
        let line = self.state.pause_line.load(Ordering::Relaxed);
        self.state.notify(
            "Runtime.consoleAPICalled",
            json!({
                "type": kind,
                "args": args,
                "executionContextId": 1,
                "timestamp": 1_700_000_000_000.0,
                "stackTrace": {
                    "callFrames": [{
                        "functionName": "handler",
                        "scriptId": SCRIPT_ID,
                        "url": self.state.config.script_url,
                        "lineNumber": line,
                        "columnNumber": 2
                    }]
                }
            }),
        )
    }

    /// Emit `Runtime.exceptionThrown` for an `Error` with `description`.
    pub fn emit_exception(&self, description: &str, line: u32) -> bool {
        self.state.notify(
            "Runtime.exceptionThrown",
            json!({
                "timestamp": 1_700_000_000_500.0,
                "exceptionDetails": {
                    "exceptionId": 1,
                    "text": "Uncaught",
                    "lineNumber": line,
                    "columnNumber": 0,
                    "scriptId": SCRIPT_ID,
                    "url": self.state.config.script_url,
                    "stackTrace": {
                        "callFrames": [{
                            "functionName": "handler",
                            "scriptId": SCRIPT_ID,
                            "url": self.state.config.script_url,
                            "lineNumber": line,
                            "columnNumber": 0
                        }]
                    },
                    "exception": error_object(description)
                }
            }),
        )
    }

    /// Pause at `line` (0-based) as if a `debugger` statement was hit.
    pub fn emit_paused(&self, line: u32) -> bool {
        self.state.pause_line.store(line, Ordering::Relaxed);
        self.state
            .notify("Debugger.paused", self.state.paused_params("other", &[]))
    }

    pub fn emit_detached(&self, reason: &str) -> bool {
        self.state
            .notify("Inspector.detached", json!({ "reason": reason }))
    }

    /// Close the active websocket session from the server side.
    pub fn close_connection(&self) -> bool {
        match self.state.outgoing.lock().take() {
            Some(tx) => tx.send(Message::Close(None)).is_ok(),
            None => false,
        }
    }
}

impl Drop for MockInspector {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

const TARGET_ID: &str = "mock-target";
const SCRIPT_ID: &str = "1";

struct State {
    config: MockInspectorConfig,
    ws_url: String,
    delayed_replies: HashMap<String, Duration>,
    next_breakpoint_id: AtomicU32,
    pause_line: AtomicU32,
    resume_calls: AtomicU32,
    step_calls: AtomicU32,
    pause_calls: AtomicU32,
    connections: AtomicU32,
    breakpoints: tokio::sync::Mutex<Vec<MockBreakpoint>>,
    methods: tokio::sync::Mutex<Vec<String>>,
    evaluate_calls: tokio::sync::Mutex<Vec<MockEvaluateCall>>,
    outgoing: parking_lot::Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

impl State {
    fn new(config: MockInspectorConfig, ws_url: String) -> Self {
        let delayed_replies = config
            .delayed_replies
            .iter()
            .map(|entry| (entry.method.clone(), entry.delay))
            .collect();
        let pause_line = config.initial_pause_line;
        Self {
            config,
            ws_url,
            delayed_replies,
            next_breakpoint_id: AtomicU32::new(0),
            pause_line: AtomicU32::new(pause_line),
            resume_calls: AtomicU32::new(0),
            step_calls: AtomicU32::new(0),
            pause_calls: AtomicU32::new(0),
            connections: AtomicU32::new(0),
            breakpoints: tokio::sync::Mutex::new(Vec::new()),
            methods: tokio::sync::Mutex::new(Vec::new()),
            evaluate_calls: tokio::sync::Mutex::new(Vec::new()),
            outgoing: parking_lot::Mutex::new(None),
        }
    }

    fn notify(&self, method: &str, params: Value) -> bool {
        let guard = self.outgoing.lock();
        let Some(tx) = guard.as_ref() else {
            return false;
        };
        let message = json!({ "method": method, "params": params });
        tx.send(Message::text(message.to_string())).is_ok()
    }

    fn call_frame_id(&self, ordinal: usize) -> String {
        if self.config.opaque_call_frame_ids {
            format!("{{\"ordinal\":{ordinal},\"injectedScriptId\":1}}")
        } else {
            ordinal.to_string()
        }
    }

    fn paused_params(&self, reason: &str, hit_breakpoints: &[String]) -> Value {
        let line = self.pause_line.load(Ordering::Relaxed);
        let url = &self.config.script_url;
        json!({
            "reason": reason,
            "hitBreakpoints": hit_breakpoints,
            "callFrames": [
                {
                    "callFrameId": self.call_frame_id(0),
                    "functionName": "handler",
                    "location": { "scriptId": SCRIPT_ID, "lineNumber": line, "columnNumber": 4 },
                    "url": url,
                    "scopeChain": [
                        { "type": "local", "object": { "type": "object", "objectId": "scope:local:0" } },
                        { "type": "global", "object": { "type": "object", "objectId": "scope:global" } }
                    ],
                    "this": { "type": "undefined" }
                },
                {
                    "callFrameId": self.call_frame_id(1),
                    "functionName": "",
                    "location": { "scriptId": SCRIPT_ID, "lineNumber": 0, "columnNumber": 0 },
                    "url": url,
                    "scopeChain": [
                        { "type": "local", "object": { "type": "object", "objectId": "scope:local:1" } },
                        { "type": "global", "object": { "type": "object", "objectId": "scope:global" } }
                    ],
                    "this": { "type": "undefined" }
                }
            ]
        })
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
                    let _ = handle_socket(socket, state, shutdown).await;
                });
            }
        }
    }
}

async fn handle_socket(
    socket: TcpStream,
    state: Arc<State>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    const DISCOVERY_PREFIX: &[u8] = b"GET /json";

    // Discovery and the websocket upgrade both start with `GET /`; peek far
    // enough to tell them apart without consuming the upgrade request.
    let mut buf = [0u8; 16];
    let n = loop {
        let n = socket.peek(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        if n >= DISCOVERY_PREFIX.len() || !DISCOVERY_PREFIX.starts_with(&buf[..n]) {
            break n;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    if buf[..n].starts_with(DISCOVERY_PREFIX) {
        serve_discovery(socket, &state).await
    } else {
        serve_websocket(socket, state, shutdown).await
    }
}

async fn serve_discovery(mut socket: TcpStream, state: &State) -> io::Result<()> {
    let mut request = Vec::new();
    let mut chunk = [0u8; 1024];
    while !request.windows(4).any(|window| window == b"\r\n\r\n") {
        let n = socket.read(&mut chunk).await?;
        if n == 0 || request.len() > 8 * 1024 {
            return Ok(());
        }
        request.extend_from_slice(&chunk[..n]);
    }

    let body = json!([{
        "id": TARGET_ID,
        "type": "node",
        "title": "mock inspector",
        "url": state.config.script_url,
        "webSocketDebuggerUrl": state.ws_url,
    }])
    .to_string();
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json; charset=UTF-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    socket.write_all(response.as_bytes()).await?;
    socket.shutdown().await
}

async fn serve_websocket(
    socket: TcpStream,
    state: Arc<State>,
    shutdown: CancellationToken,
) -> io::Result<()> {
    let socket = accept_async(socket)
        .await
        .map_err(|err| io::Error::new(io::ErrorKind::Other, err))?;
    let (mut sink, mut source) = socket.split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    *state.outgoing.lock() = Some(tx.clone());
    state.connections.fetch_add(1, Ordering::Relaxed);

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = matches!(message, Message::Close(_));
            if sink.send(message).await.is_err() || closing {
                let _ = sink.close().await;
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            next = source.next() => match next {
                Some(Ok(Message::Text(text))) => handle_command(&state, &tx, &text).await,
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    state.outgoing.lock().take();
    drop(tx);
    writer.abort();
    Ok(())
}

async fn handle_command(state: &Arc<State>, tx: &mpsc::UnboundedSender<Message>, text: &str) {
    let Ok(request) = serde_json::from_str::<Value>(text) else {
        return;
    };
    let id = request.get("id").and_then(Value::as_u64).unwrap_or(0);
    let method = request
        .get("method")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let params = request.get("params").cloned().unwrap_or_else(|| json!({}));

    state.methods.lock().await.push(method.clone());

    match state.delayed_replies.get(&method).copied() {
        Some(delay) => {
            let state = state.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                respond(&state, &tx, id, &method, params).await;
            });
        }
        None => respond(state, tx, id, &method, params).await,
    }
}

async fn respond(
    state: &State,
    tx: &mpsc::UnboundedSender<Message>,
    id: u64,
    method: &str,
    params: Value,
) {
    let send = |value: Value| {
        let _ = tx.send(Message::text(value.to_string()));
    };
    let reply = |result: Value| send(json!({ "id": id, "result": result }));
    let reply_error = |code: i64, message: &str| {
        send(json!({ "id": id, "error": { "code": code, "message": message } }))
    };
    let notify = |method: &str, params: Value| send(json!({ "method": method, "params": params }));

    if state.config.failing_methods.iter().any(|failing| failing == method) {
        reply_error(-32000, "Internal error");
        return;
    }

    match method {
        "Runtime.enable" | "Runtime.runIfWaitingForDebugger" => reply(json!({})),
        "Debugger.enable" => {
            notify(
                "Debugger.scriptParsed",
                json!({ "scriptId": SCRIPT_ID, "url": state.config.script_url }),
            );
            if state.config.pause_on_debugger_enable {
                notify(
                    "Debugger.paused",
                    state.paused_params("Break on start", &[]),
                );
            }
            reply(json!({ "debuggerId": "mock-debugger" }));
        }
        "Debugger.setBreakpointByUrl" => {
            let line = params
                .get("lineNumber")
                .and_then(Value::as_u64)
                .unwrap_or(0) as u32;
            if state.config.rejected_lines.contains(&line) {
                reply_error(-32000, "Could not resolve breakpoint");
                return;
            }
            let n = state.next_breakpoint_id.fetch_add(1, Ordering::Relaxed) + 1;
            let breakpoint = MockBreakpoint {
                id: format!("bp-{n}"),
                url: params
                    .get("url")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                line,
                condition: params
                    .get("condition")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            };
            let result = json!({
                "breakpointId": breakpoint.id,
                "locations": [{ "scriptId": SCRIPT_ID, "lineNumber": line, "columnNumber": 0 }]
            });
            state.breakpoints.lock().await.push(breakpoint);
            reply(result);
        }
        "Debugger.removeBreakpoint" => {
            let breakpoint_id = params
                .get("breakpointId")
                .and_then(Value::as_str)
                .unwrap_or_default();
            state
                .breakpoints
                .lock()
                .await
                .retain(|bp| bp.id != breakpoint_id);
            reply(json!({}));
        }
        "Debugger.resume" => {
            state.resume_calls.fetch_add(1, Ordering::Relaxed);
            reply(json!({}));
            notify("Debugger.resumed", json!({}));
            if !state.config.resume_hits_breakpoints {
                return;
            }
            let current = state.pause_line.load(Ordering::Relaxed);
            let next = state
                .breakpoints
                .lock()
                .await
                .iter()
                .filter(|bp| bp.line > current)
                .min_by_key(|bp| bp.line)
                .cloned();
            if let Some(bp) = next {
                state.pause_line.store(bp.line, Ordering::Relaxed);
                notify(
                    "Debugger.paused",
                    state.paused_params("other", &[bp.id.clone()]),
                );
            }
        }
        "Debugger.pause" => {
            state.pause_calls.fetch_add(1, Ordering::Relaxed);
            reply(json!({}));
            notify("Debugger.paused", state.paused_params("other", &[]));
        }
        "Debugger.stepOver" | "Debugger.stepInto" | "Debugger.stepOut" => {
            state.step_calls.fetch_add(1, Ordering::Relaxed);
            reply(json!({}));
            notify("Debugger.resumed", json!({}));
            state.pause_line.fetch_add(1, Ordering::Relaxed);
            notify("Debugger.paused", state.paused_params("step", &[]));
        }
        "Runtime.getProperties" => {
            let object_id = params
                .get("objectId")
                .and_then(Value::as_str)
                .unwrap_or_default();
            match properties_for(object_id) {
                Some(result) => reply(json!({ "result": result })),
                None => reply_error(-32000, "Could not find object with given id"),
            }
        }
        "Runtime.evaluate" | "Debugger.evaluateOnCallFrame" => {
            let expression = params
                .get("expression")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            state.evaluate_calls.lock().await.push(MockEvaluateCall {
                method: method.to_string(),
                call_frame_id: params
                    .get("callFrameId")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                expression: expression.clone(),
            });
            let result = match state.config.evaluations.get(&expression) {
                Some(MockEvaluation::Value(value)) => json!({ "result": remote_from_json(value) }),
                Some(MockEvaluation::Throw(description)) => json!({
                    "result": error_object(description),
                    "exceptionDetails": {
                        "exceptionId": 2,
                        "text": "Uncaught",
                        "lineNumber": 0,
                        "columnNumber": 0,
                        "exception": error_object(description)
                    }
                }),
                None => json!({ "result": { "type": "undefined" } }),
            };
            reply(result);
        }
        other => reply_error(-32601, &format!("'{other}' wasn't found")),
    }
}

fn properties_for(object_id: &str) -> Option<Value> {
    let props = match object_id {
        "scope:local:0" => json!([
            { "name": "count", "value": { "type": "number", "value": 42, "description": "42" }, "enumerable": true, "isOwn": true },
            { "name": "message", "value": { "type": "string", "value": "hello" }, "enumerable": true, "isOwn": true },
            { "name": "config", "value": { "type": "object", "className": "Object", "description": "Object", "objectId": "obj:1" }, "enumerable": true, "isOwn": true }
        ]),
        "scope:local:1" => json!([
            { "name": "argv", "value": { "type": "object", "subtype": "array", "className": "Array", "description": "Array(2)", "objectId": "obj:2" }, "enumerable": true, "isOwn": true }
        ]),
        "scope:global" => json!([
            { "name": "version", "value": { "type": "string", "value": "v20.0.0" }, "enumerable": true, "isOwn": true }
        ]),
        "obj:1" => json!([
            { "name": "debug", "value": { "type": "boolean", "value": true }, "enumerable": true, "isOwn": true },
            { "name": "retries", "value": { "type": "number", "value": 3, "description": "3" }, "enumerable": true, "isOwn": true }
        ]),
        "obj:2" => json!([
            { "name": "0", "value": { "type": "string", "value": "node" }, "enumerable": true, "isOwn": true },
            { "name": "1", "value": { "type": "string", "value": "main.js" }, "enumerable": true, "isOwn": true },
            { "name": "length", "value": { "type": "number", "value": 2, "description": "2" }, "enumerable": false, "isOwn": true }
        ]),
        _ => return None,
    };
    Some(props)
}

fn error_object(description: &str) -> Value {
    json!({
        "type": "object",
        "subtype": "error",
        "className": "Error",
        "description": description
    })
}

fn remote_from_json(value: &Value) -> Value {
    match value {
        Value::String(_) => json!({ "type": "string", "value": value }),
        Value::Number(_) => json!({ "type": "number", "value": value, "description": value.to_string() }),
        Value::Bool(_) => json!({ "type": "boolean", "value": value }),
        Value::Null => json!({ "type": "object", "subtype": "null", "value": null }),
        Value::Array(_) | Value::Object(_) => json!({
            "type": "object",
            "className": "Object",
            "description": "Object",
            "objectId": "obj:1"
        }),
    }
}
