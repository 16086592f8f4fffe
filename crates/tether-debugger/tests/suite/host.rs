use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tether_cdp::mock::{MockInspector, MockInspectorConfig};
use tether_dap::{DapReader, DapWriter, Event, ProtocolMessage, Request, Response};
use tether_debugger::host;
use tokio::io::{DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use crate::harness::{orchestrator, TIMEOUT};

/// Drives the host surface the way an editor would.
struct Host {
    reader: DapReader<ReadHalf<DuplexStream>>,
    writer: DapWriter<WriteHalf<DuplexStream>>,
    seq: i64,
    events: Vec<Event>,
    task: JoinHandle<Result<(), host::HostError>>,
}

impl Host {
    fn start() -> Self {
        let (client, server) = tokio::io::duplex(256 * 1024);
        let (server_read, server_write) = tokio::io::split(server);
        let (client_read, client_write) = tokio::io::split(client);
        let task = tokio::spawn(host::run(orchestrator(), server_read, server_write));
        Self {
            reader: DapReader::new(client_read),
            writer: DapWriter::new(client_write),
            seq: 0,
            events: Vec::new(),
            task,
        }
    }

    async fn send(&mut self, command: &str, arguments: Value) -> i64 {
        self.seq += 1;
        let request = Request {
            seq: self.seq,
            command: command.to_string(),
            arguments: Some(arguments),
        };
        self.writer
            .write_message(&ProtocolMessage::Request(request))
            .await
            .unwrap();
        self.seq
    }

    async fn request(&mut self, command: &str, arguments: Value) -> Response {
        let seq = self.send(command, arguments).await;
        tokio::time::timeout(TIMEOUT, async {
            loop {
                match self.reader.read_message().await.unwrap() {
                    Some(ProtocolMessage::Response(response)) if response.request_seq == seq => {
                        return response;
                    }
                    Some(ProtocolMessage::Event(event)) => self.events.push(event),
                    Some(_) => continue,
                    None => panic!("host closed the stream"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no response to {command}"))
    }

    async fn body(&mut self, command: &str, arguments: Value) -> Value {
        let response = self.request(command, arguments).await;
        assert!(response.success, "{command} failed: {:?}", response.body);
        response.body.unwrap_or(Value::Null)
    }

    /// Wait for an event named `name`, looking at ones already buffered first.
    async fn event(&mut self, name: &str, pred: impl Fn(&Value) -> bool) -> Value {
        if let Some(index) = self
            .events
            .iter()
            .position(|event| event.event == name && pred(event.body.as_ref().unwrap_or(&Value::Null)))
        {
            return self.events.remove(index).body.unwrap_or(Value::Null);
        }
        tokio::time::timeout(TIMEOUT, async {
            loop {
                match self.reader.read_message().await.unwrap() {
                    Some(ProtocolMessage::Event(event)) => {
                        let body = event.body.clone().unwrap_or(Value::Null);
                        if event.event == name && pred(&body) {
                            return body;
                        }
                        self.events.push(event);
                    }
                    Some(_) => continue,
                    None => panic!("host closed the stream"),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("no {name} event"))
    }
}

#[tokio::test]
async fn editor_session_over_the_host_surface() {
    let inspector = MockInspector::spawn_with_config(MockInspectorConfig {
        pause_on_debugger_enable: true,
        ..Default::default()
    })
    .await
    .unwrap();
    let mut host = Host::start();

    let attached = host
        .body(
            "attach",
            json!({
                "hostSessionId": "editor-1",
                "config": { "protocol": "remote-object", "wsUrl": inspector.ws_url() }
            }),
        )
        .await;
    let id = attached["debugSessionId"].as_u64().unwrap();

    let created = host
        .event("sessionCreated", |body| body["sessionId"] == json!(id))
        .await;
    assert_eq!(created["hostSessionId"], "editor-1");
    assert_eq!(created["protocol"], "remote-object");
    let paused = host
        .event("stateChanged", |body| body["state"] == "paused")
        .await;
    assert_eq!(paused["location"]["line"], 5);

    let session = host.body("getSession", json!({ "sessionId": id })).await;
    assert_eq!(session["session"]["state"], "paused");
    assert_eq!(session["session"]["hostSessionId"], "editor-1");

    let stack = host.body("getCallStack", json!({ "sessionId": id })).await;
    assert_eq!(stack["callStack"][0]["line"], 5);

    let installed = host
        .body(
            "setBreakpoints",
            json!({
                "sessionId": id,
                "source": inspector.script_url(),
                "breakpoints": [{ "line": 10 }]
            }),
        )
        .await;
    assert_eq!(installed["breakpoints"][0]["line"], 10);
    assert_eq!(installed["breakpoints"][0]["verified"], true);
    assert_eq!(inspector.breakpoints().await.len(), 1);

    let again = host
        .request(
            "attach",
            json!({
                "hostSessionId": "editor-1",
                "config": { "protocol": "remote-object", "wsUrl": inspector.ws_url() }
            }),
        )
        .await;
    assert!(!again.success);
    assert_eq!(again.body.unwrap()["error"]["code"], "AlreadyAttached");

    host.body("detach", json!({ "sessionId": id })).await;
    let removed = host
        .event("sessionRemoved", |body| body["sessionId"] == json!(id))
        .await;
    assert_eq!(removed["reason"], "detached");
    let sessions = host.body("getAllSessions", json!({})).await;
    assert_eq!(sessions["sessions"], json!([]));

    let closing = host.request("shutdown", json!({})).await;
    assert!(closing.success);
    let result = tokio::time::timeout(TIMEOUT, host.task).await.unwrap().unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn shutdown_detaches_sessions_left_open() {
    let inspector = MockInspector::spawn().await.unwrap();
    let mut host = Host::start();

    host.body(
        "attach",
        json!({
            "hostSessionId": "editor-2",
            "config": { "protocol": "remote-object", "wsUrl": inspector.ws_url() }
        }),
    )
    .await;

    let closing = host.request("disconnect", json!({})).await;
    assert!(closing.success);
    host.event("sessionRemoved", |_| true).await;
    let result = tokio::time::timeout(TIMEOUT, host.task).await.unwrap().unwrap();
    assert!(result.is_ok());
}
