use std::{
    collections::HashMap,
    path::PathBuf,
    process::Stdio,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use serde_json::{json, Value};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader},
    net::TcpStream,
    process::{Child, Command},
    sync::{broadcast, oneshot, Mutex},
};
use tokio_util::sync::CancellationToken;

use crate::{
    codec::{sanitize_json_error_message, DapReader, DapWriter},
    messages::{Event, ProtocolMessage, Request, Response},
    types::{
        Breakpoint, Capabilities, ContinuedEventBody, EvaluateResponseBody, ExitedEventBody,
        InitializeArguments, OutputEventBody, Scope, Source, SourceBreakpoint, StackFrame,
        StoppedEventBody, Thread, Variable,
    },
    DapError, Result,
};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How to reach a debug adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DapTransport {
    /// Connect to an adapter already listening on `host:port`.
    Tcp { host: String, port: u16 },
    /// Spawn the adapter and speak DAP over its stdin/stdout.
    Stdio {
        command: String,
        args: Vec<String>,
        cwd: Option<PathBuf>,
        env: HashMap<String, String>,
    },
}

impl DapTransport {
    /// Loggable summary; leaves out the environment.
    pub fn describe(&self) -> String {
        match self {
            DapTransport::Tcp { host, port } => format!("tcp {host}:{port}"),
            DapTransport::Stdio { command, .. } => format!("stdio {command}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DapClientConfig {
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub event_channel_size: usize,
}

impl Default for DapClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(10),
            event_channel_size: 256,
        }
    }
}

/// Adapter events, typed where the client cares about the body.
#[derive(Debug, Clone, PartialEq)]
pub enum DapEvent {
    Initialized,
    Stopped(StoppedEventBody),
    Continued(ContinuedEventBody),
    Output(OutputEventBody),
    Exited(ExitedEventBody),
    Terminated,
    Other(Event),
    /// The connection dropped without a shutdown request.
    TransportClosed { error: Option<String> },
}

impl DapEvent {
    pub fn from_event(event: Event) -> Self {
        fn body<T: serde::de::DeserializeOwned>(event: &Event) -> Option<T> {
            serde_json::from_value(event.body.clone().unwrap_or(Value::Null)).ok()
        }

        let typed = match event.event.as_str() {
            "initialized" => Some(DapEvent::Initialized),
            "terminated" => Some(DapEvent::Terminated),
            "stopped" => body(&event).map(DapEvent::Stopped),
            "continued" => body(&event).map(DapEvent::Continued),
            "output" => body(&event).map(DapEvent::Output),
            "exited" => body(&event).map(DapEvent::Exited),
            _ => None,
        };
        typed.unwrap_or(DapEvent::Other(event))
    }
}

struct Inner {
    writer: Mutex<DapWriter<BoxedWriter>>,
    pending: Mutex<HashMap<i64, oneshot::Sender<Result<Response>>>>,
    next_seq: AtomicI64,
    events: broadcast::Sender<DapEvent>,
    shutdown: CancellationToken,
    child: parking_lot::Mutex<Option<Child>>,
    config: DapClientConfig,
}

impl Inner {
    fn alloc_seq(&self) -> i64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn kill_child(&self) {
        if let Some(mut child) = self.child.lock().take() {
            let _ = child.start_kill();
        }
    }
}

/// A client connection to one debug adapter.
#[derive(Clone)]
pub struct DapClient {
    inner: Arc<Inner>,
}

/// A request that has been written but whose response has not been awaited.
///
/// Needed for `launch`/`attach`, whose response many adapters hold back
/// until `configurationDone` arrives.
pub struct PendingResponse {
    inner: Arc<Inner>,
    seq: i64,
    command: String,
    rx: oneshot::Receiver<Result<Response>>,
}

impl PendingResponse {
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Wait for the response body; a `success: false` response is an error.
    pub async fn wait(self) -> Result<Value> {
        let reply = tokio::select! {
            biased;
            res = tokio::time::timeout(self.inner.config.request_timeout, self.rx) => {
                match res {
                    Ok(Ok(reply)) => reply,
                    Ok(Err(_closed)) => return Err(DapError::ConnectionClosed),
                    Err(_elapsed) => {
                        self.inner.pending.lock().await.remove(&self.seq);
                        return Err(DapError::Timeout);
                    }
                }
            }
            _ = self.inner.shutdown.cancelled() => {
                self.inner.pending.lock().await.remove(&self.seq);
                return Err(DapError::Cancelled);
            }
        }?;

        if !reply.success {
            return Err(DapError::Request {
                command: self.command,
                message: reply.error_message(),
            });
        }
        Ok(reply.body.unwrap_or(Value::Null))
    }
}

impl DapClient {
    pub async fn connect(transport: DapTransport) -> Result<Self> {
        Self::connect_with_config(transport, DapClientConfig::default()).await
    }

    pub async fn connect_with_config(
        transport: DapTransport,
        config: DapClientConfig,
    ) -> Result<Self> {
        let (reader, writer, child): (BoxedReader, BoxedWriter, Option<Child>) = match &transport
        {
            DapTransport::Tcp { host, port } => {
                let stream = tokio::time::timeout(
                    config.connect_timeout,
                    TcpStream::connect((host.as_str(), *port)),
                )
                .await
                .map_err(|_| DapError::Timeout)??;
                let _ = stream.set_nodelay(true);
                let (reader, writer) = stream.into_split();
                (Box::new(reader) as BoxedReader, Box::new(writer) as BoxedWriter, None)
            }
            DapTransport::Stdio {
                command,
                args,
                cwd,
                env,
            } => {
                let mut cmd = Command::new(command);
                cmd.args(args)
                    .envs(env)
                    .stdin(Stdio::piped())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped())
                    .kill_on_drop(true);
                if let Some(cwd) = cwd {
                    cmd.current_dir(cwd);
                }
                let mut child = cmd.spawn().map_err(|source| DapError::Spawn {
                    command: command.clone(),
                    source,
                })?;
                let stdin = child
                    .stdin
                    .take()
                    .ok_or_else(|| DapError::Protocol("adapter stdin unavailable".into()))?;
                let stdout = child
                    .stdout
                    .take()
                    .ok_or_else(|| DapError::Protocol("adapter stdout unavailable".into()))?;
                if let Some(stderr) = child.stderr.take() {
                    let command = command.clone();
                    tokio::spawn(async move {
                        let mut lines = BufReader::new(stderr).lines();
                        while let Ok(Some(line)) = lines.next_line().await {
                            tracing::debug!(target: "tether.dap.adapter", %command, "{line}");
                        }
                    });
                }
                (Box::new(stdout) as BoxedReader, Box::new(stdin) as BoxedWriter, Some(child))
            }
        };

        let (events, _) = broadcast::channel(config.event_channel_size.max(1));
        let inner = Arc::new(Inner {
            writer: Mutex::new(DapWriter::new(writer)),
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicI64::new(1),
            events,
            shutdown: CancellationToken::new(),
            child: parking_lot::Mutex::new(child),
            config,
        });

        tokio::spawn(read_loop(DapReader::new(reader), inner.clone()));
        tracing::debug!(target: "tether.dap", transport = %transport.describe(), "debug adapter connected");

        Ok(Self { inner })
    }

    /// Stop the read loop, fail in-flight requests, and kill a spawned adapter.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.kill_child();
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<DapEvent> {
        self.inner.events.subscribe()
    }

    /// Write a request without waiting for its response.
    pub async fn start_request(
        &self,
        command: &str,
        arguments: Option<Value>,
    ) -> Result<PendingResponse> {
        if self.inner.shutdown.is_cancelled() {
            return Err(DapError::Cancelled);
        }

        let seq = self.inner.alloc_seq();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(seq, tx);

        let message = ProtocolMessage::Request(Request {
            seq,
            command: command.to_string(),
            arguments,
        });
        let written = {
            let mut writer = self.inner.writer.lock().await;
            writer.write_message(&message).await
        };
        if let Err(err) = written {
            self.inner.pending.lock().await.remove(&seq);
            return Err(err);
        }

        Ok(PendingResponse {
            inner: self.inner.clone(),
            seq,
            command: command.to_string(),
            rx,
        })
    }

    pub async fn request(&self, command: &str, arguments: Option<Value>) -> Result<Value> {
        self.start_request(command, arguments).await?.wait().await
    }

    async fn request_typed<T: serde::de::DeserializeOwned>(
        &self,
        command: &str,
        arguments: Value,
        field: &str,
    ) -> Result<T> {
        let body = self.request(command, Some(arguments)).await?;
        let value = body.get(field).cloned().unwrap_or(Value::Null);
        serde_json::from_value(value).map_err(|err| {
            DapError::Protocol(format!(
                "malformed {command} response: {}",
                sanitize_json_error_message(&err.to_string())
            ))
        })
    }

    pub async fn initialize(&self, arguments: &InitializeArguments) -> Result<Capabilities> {
        let body = self
            .request("initialize", Some(serde_json::to_value(arguments)?))
            .await?;
        if body.is_null() {
            return Ok(Capabilities::default());
        }
        Ok(serde_json::from_value(body)?)
    }

    pub async fn configuration_done(&self) -> Result<()> {
        self.request("configurationDone", None).await.map(|_| ())
    }

    /// Replace every breakpoint in `path` with `breakpoints` (1-based lines).
    pub async fn set_breakpoints(
        &self,
        path: &str,
        breakpoints: &[SourceBreakpoint],
    ) -> Result<Vec<Breakpoint>> {
        let arguments = json!({
            "source": Source { name: None, path: Some(path.to_string()) },
            "breakpoints": breakpoints,
            "lines": breakpoints.iter().map(|bp| bp.line).collect::<Vec<_>>(),
        });
        self.request_typed("setBreakpoints", arguments, "breakpoints")
            .await
    }

    pub async fn threads(&self) -> Result<Vec<Thread>> {
        self.request_typed("threads", json!({}), "threads").await
    }

    pub async fn stack_trace(&self, thread_id: i64) -> Result<Vec<StackFrame>> {
        self.request_typed(
            "stackTrace",
            json!({ "threadId": thread_id, "startFrame": 0 }),
            "stackFrames",
        )
        .await
    }

    pub async fn scopes(&self, frame_id: i64) -> Result<Vec<Scope>> {
        self.request_typed("scopes", json!({ "frameId": frame_id }), "scopes")
            .await
    }

    pub async fn variables(&self, variables_reference: i64) -> Result<Vec<Variable>> {
        self.request_typed(
            "variables",
            json!({ "variablesReference": variables_reference }),
            "variables",
        )
        .await
    }

    pub async fn continue_thread(&self, thread_id: i64) -> Result<()> {
        self.request("continue", Some(json!({ "threadId": thread_id })))
            .await
            .map(|_| ())
    }

    pub async fn pause(&self, thread_id: i64) -> Result<()> {
        self.request("pause", Some(json!({ "threadId": thread_id })))
            .await
            .map(|_| ())
    }

    pub async fn next(&self, thread_id: i64) -> Result<()> {
        self.request("next", Some(json!({ "threadId": thread_id })))
            .await
            .map(|_| ())
    }

    pub async fn step_in(&self, thread_id: i64) -> Result<()> {
        self.request("stepIn", Some(json!({ "threadId": thread_id })))
            .await
            .map(|_| ())
    }

    pub async fn step_out(&self, thread_id: i64) -> Result<()> {
        self.request("stepOut", Some(json!({ "threadId": thread_id })))
            .await
            .map(|_| ())
    }

    pub async fn evaluate(
        &self,
        expression: &str,
        frame_id: Option<i64>,
        context: &str,
    ) -> Result<EvaluateResponseBody> {
        let mut arguments = json!({ "expression": expression, "context": context });
        if let Some(frame_id) = frame_id {
            arguments["frameId"] = json!(frame_id);
        }
        let body = self.request("evaluate", Some(arguments)).await?;
        Ok(serde_json::from_value(body)?)
    }

    pub async fn disconnect(&self, terminate_debuggee: bool) -> Result<()> {
        self.request(
            "disconnect",
            Some(json!({ "terminateDebuggee": terminate_debuggee })),
        )
        .await
        .map(|_| ())
    }
}

async fn read_loop(mut reader: DapReader<BoxedReader>, inner: Arc<Inner>) {
    let mut closed_by_peer = false;
    let mut close_error = None;

    loop {
        let read = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            read = reader.read_raw() => read,
        };
        let bytes = match read {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                closed_by_peer = true;
                break;
            }
            Err(err) => {
                closed_by_peer = true;
                close_error = Some(err.to_string());
                break;
            }
        };

        // The frame was consumed whole, so a bad body does not desync the stream.
        let message = match serde_json::from_slice::<ProtocolMessage>(&bytes) {
            Ok(message) => message,
            Err(err) => {
                tracing::warn!(
                    target: "tether.dap",
                    error = %sanitize_json_error_message(&err.to_string()),
                    "ignoring malformed adapter message"
                );
                continue;
            }
        };

        match message {
            ProtocolMessage::Response(response) => {
                let tx = inner.pending.lock().await.remove(&response.request_seq);
                if let Some(tx) = tx {
                    let _ = tx.send(Ok(response));
                }
            }
            ProtocolMessage::Event(event) => {
                let _ = inner.events.send(DapEvent::from_event(event));
            }
            ProtocolMessage::Request(request) => {
                reject_reverse_request(&inner, &request).await;
            }
        }
    }

    let pending = std::mem::take(&mut *inner.pending.lock().await);
    for (_seq, tx) in pending {
        let _ = tx.send(Err(if closed_by_peer {
            DapError::ConnectionClosed
        } else {
            DapError::Cancelled
        }));
    }

    inner.shutdown.cancel();
    inner.kill_child();

    if closed_by_peer {
        tracing::debug!(target: "tether.dap", error = ?close_error, "debug adapter connection closed");
        let _ = inner
            .events
            .send(DapEvent::TransportClosed { error: close_error });
    }
}

/// Reverse requests (`runInTerminal`, `startDebugging`) need a UI; answer them
/// with an error so the adapter can fall back.
async fn reject_reverse_request(inner: &Inner, request: &Request) {
    tracing::debug!(target: "tether.dap", command = %request.command, "rejecting reverse request");
    let response = ProtocolMessage::Response(Response::error(
        inner.alloc_seq(),
        request,
        format!("reverse request '{}' is not supported", request.command),
    ));
    let mut writer = inner.writer.lock().await;
    if let Err(err) = writer.write_message(&response).await {
        tracing::debug!(target: "tether.dap", error = %err, "failed to answer reverse request");
    }
}
