use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_tungstenite::{
    tokio::{client_async, TokioAdapter},
    tungstenite::Message,
    WebSocketStream,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde_json::{json, Value};
use tokio::{
    net::TcpStream,
    sync::{broadcast, oneshot, Mutex},
};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::types::{
    CdpError, CdpEvent, EvaluateResult, PropertyDescriptor, Result, SetBreakpointByUrlResult,
};

type WsStream = WebSocketStream<TokioAdapter<TcpStream>>;

const CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct CdpClientConfig {
    pub connect_timeout: Duration,
    pub reply_timeout: Duration,
    pub event_channel_size: usize,
}

impl Default for CdpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            reply_timeout: Duration::from_secs(10),
            event_channel_size: 256,
        }
    }
}

struct Inner {
    sink: Mutex<SplitSink<WsStream, Message>>,
    pending: Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>,
    next_id: AtomicU64,
    events: broadcast::Sender<CdpEvent>,
    shutdown: CancellationToken,
    config: CdpClientConfig,
}

/// A connection to one inspector target.
///
/// Requests are correlated by id; notifications fan out through
/// [`CdpClient::subscribe_events`]. Cloning shares the connection.
#[derive(Clone)]
pub struct CdpClient {
    inner: Arc<Inner>,
}

impl CdpClient {
    pub async fn connect(ws_url: &str) -> Result<Self> {
        Self::connect_with_config(ws_url, CdpClientConfig::default()).await
    }

    pub async fn connect_with_config(ws_url: &str, config: CdpClientConfig) -> Result<Self> {
        let url = Url::parse(ws_url).map_err(|_| CdpError::InvalidUrl(ws_url.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(CdpError::InvalidUrl(ws_url.to_string()));
        }
        let host = url
            .host_str()
            .ok_or_else(|| CdpError::InvalidUrl(ws_url.to_string()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| CdpError::InvalidUrl(ws_url.to_string()))?;

        let stream = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| CdpError::Timeout)??;
        let _ = stream.set_nodelay(true);

        let (socket, _response) =
            tokio::time::timeout(config.connect_timeout, client_async(ws_url, stream))
                .await
                .map_err(|_| CdpError::Timeout)??;

        let (sink, stream) = socket.split();
        let (events, _) = broadcast::channel(config.event_channel_size.max(1));

        let inner = Arc::new(Inner {
            sink: Mutex::new(sink),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            events,
            shutdown: CancellationToken::new(),
            config,
        });

        tokio::spawn(read_loop(stream, inner.clone()));
        tracing::debug!(target: "tether.cdp", url = %ws_url, "inspector connected");

        Ok(Self { inner })
    }

    /// Stop the read loop and fail in-flight requests with [`CdpError::Cancelled`].
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
    }

    /// Cancelled on explicit shutdown and when the socket closes.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Subscribe to notifications. Only notifications read after this call are
    /// delivered, so subscribe before issuing commands whose side effects you
    /// need to observe.
    pub fn subscribe_events(&self) -> broadcast::Receiver<CdpEvent> {
        self.inner.events.subscribe()
    }

    /// Send `method` and wait for its result object.
    pub async fn send_command(&self, method: &str, params: Value) -> Result<Value> {
        if self.inner.shutdown.is_cancelled() {
            return Err(CdpError::Cancelled);
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(id, tx);
        }

        let message = json!({ "id": id, "method": method, "params": params });
        let text = serde_json::to_string(&message)?;
        let sent = {
            let mut sink = self.inner.sink.lock().await;
            sink.send(Message::text(text)).await
        };
        if let Err(err) = sent {
            self.remove_pending(id).await;
            return Err(err.into());
        }

        // The read loop settles pending requests before cancelling, so a
        // ready reply must win over the cancellation branch.
        let reply = tokio::select! {
            biased;
            res = tokio::time::timeout(self.inner.config.reply_timeout, rx) => {
                match res {
                    Ok(Ok(reply)) => reply,
                    Ok(Err(_closed)) => return Err(CdpError::ConnectionClosed),
                    Err(_elapsed) => {
                        self.remove_pending(id).await;
                        return Err(CdpError::Timeout);
                    }
                }
            }
            _ = self.inner.shutdown.cancelled() => {
                self.remove_pending(id).await;
                return Err(CdpError::Cancelled);
            }
        };

        reply.map_err(|err| match err {
            CdpError::Remote { code, message, .. } => CdpError::Remote {
                method: method.to_string(),
                code,
                message,
            },
            other => other,
        })
    }

    async fn remove_pending(&self, id: u64) {
        let mut pending = self.inner.pending.lock().await;
        pending.remove(&id);
    }

    async fn send_unit(&self, method: &str, params: Value) -> Result<()> {
        self.send_command(method, params).await.map(|_| ())
    }

    pub async fn runtime_enable(&self) -> Result<()> {
        self.send_unit("Runtime.enable", json!({})).await
    }

    pub async fn debugger_enable(&self) -> Result<()> {
        self.send_unit("Debugger.enable", json!({})).await
    }

    pub async fn run_if_waiting_for_debugger(&self) -> Result<()> {
        self.send_unit("Runtime.runIfWaitingForDebugger", json!({}))
            .await
    }

    /// `line` and `column` are 0-based.
    pub async fn set_breakpoint_by_url(
        &self,
        url: &str,
        line: u32,
        column: Option<u32>,
        condition: Option<&str>,
    ) -> Result<SetBreakpointByUrlResult> {
        let mut params = json!({ "url": url, "lineNumber": line });
        if let Some(column) = column {
            params["columnNumber"] = json!(column);
        }
        if let Some(condition) = condition {
            params["condition"] = json!(condition);
        }
        let result = self
            .send_command("Debugger.setBreakpointByUrl", params)
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn remove_breakpoint(&self, breakpoint_id: &str) -> Result<()> {
        self.send_unit(
            "Debugger.removeBreakpoint",
            json!({ "breakpointId": breakpoint_id }),
        )
        .await
    }

    pub async fn resume(&self) -> Result<()> {
        self.send_unit("Debugger.resume", json!({})).await
    }

    pub async fn pause(&self) -> Result<()> {
        self.send_unit("Debugger.pause", json!({})).await
    }

    pub async fn step_over(&self) -> Result<()> {
        self.send_unit("Debugger.stepOver", json!({})).await
    }

    pub async fn step_into(&self) -> Result<()> {
        self.send_unit("Debugger.stepInto", json!({})).await
    }

    pub async fn step_out(&self) -> Result<()> {
        self.send_unit("Debugger.stepOut", json!({})).await
    }

    pub async fn evaluate(&self, expression: &str) -> Result<EvaluateResult> {
        let result = self
            .send_command(
                "Runtime.evaluate",
                json!({ "expression": expression, "generatePreview": false }),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn evaluate_on_call_frame(
        &self,
        call_frame_id: &str,
        expression: &str,
    ) -> Result<EvaluateResult> {
        let result = self
            .send_command(
                "Debugger.evaluateOnCallFrame",
                json!({ "callFrameId": call_frame_id, "expression": expression }),
            )
            .await?;
        Ok(serde_json::from_value(result)?)
    }

    pub async fn get_properties(&self, object_id: &str) -> Result<Vec<PropertyDescriptor>> {
        let result = self
            .send_command(
                "Runtime.getProperties",
                json!({ "objectId": object_id, "ownProperties": true }),
            )
            .await?;
        let properties = result
            .get("result")
            .cloned()
            .ok_or_else(|| CdpError::Protocol("getProperties reply without result".into()))?;
        Ok(serde_json::from_value(properties)?)
    }
}

async fn read_loop(mut stream: SplitStream<WsStream>, inner: Arc<Inner>) {
    let mut close_error = None;
    let mut closed_by_peer = false;

    loop {
        let next = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            next = stream.next() => next,
        };

        let message = match next {
            None => {
                closed_by_peer = true;
                break;
            }
            Some(Err(err)) => {
                closed_by_peer = true;
                close_error = Some(err.to_string());
                break;
            }
            Some(Ok(message)) => message,
        };

        let parsed: std::result::Result<Value, _> = match &message {
            Message::Text(text) => serde_json::from_str(text),
            Message::Binary(bytes) => serde_json::from_slice(bytes),
            Message::Close(_) => {
                closed_by_peer = true;
                break;
            }
            _ => continue,
        };
        let value = match parsed {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(target: "tether.cdp", error = %err, "ignoring malformed inspector message");
                continue;
            }
        };

        dispatch(&inner, value).await;
    }

    let pending = {
        let mut pending = inner.pending.lock().await;
        std::mem::take(&mut *pending)
    };
    for (_id, tx) in pending {
        let _ = tx.send(Err(if closed_by_peer {
            CdpError::ConnectionClosed
        } else {
            CdpError::Cancelled
        }));
    }

    inner.shutdown.cancel();

    if !closed_by_peer {
        // Close the socket even while clones of the client are still alive.
        let mut sink = inner.sink.lock().await;
        let _ = tokio::time::timeout(CLOSE_GRACE, sink.close()).await;
    }

    if closed_by_peer {
        tracing::debug!(target: "tether.cdp", error = ?close_error, "inspector socket closed");
        let _ = inner
            .events
            .send(CdpEvent::TransportClosed { error: close_error });
    }
}

async fn dispatch(inner: &Inner, value: Value) {
    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        let tx = {
            let mut pending = inner.pending.lock().await;
            pending.remove(&id)
        };
        // Replies for requests that timed out or were cancelled are dropped.
        let Some(tx) = tx else {
            return;
        };
        let reply = match value.get("error") {
            Some(error) => Err(CdpError::Remote {
                method: String::new(),
                code: error.get("code").and_then(Value::as_i64).unwrap_or(0),
                message: error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            }),
            None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = tx.send(reply);
        return;
    }

    let Some(method) = value.get("method").and_then(Value::as_str) else {
        return;
    };
    let params = value.get("params").cloned().unwrap_or(Value::Null);
    let event = match CdpEvent::from_notification(method, params.clone()) {
        Ok(event) => event,
        Err(err) => {
            tracing::warn!(target: "tether.cdp", method, error = %err, "unparseable notification");
            CdpEvent::Other {
                method: method.to_string(),
                params,
            }
        }
    };
    // No receivers is fine: nobody is listening yet.
    let _ = inner.events.send(event);
}
