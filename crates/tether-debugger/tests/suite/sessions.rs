use std::net::SocketAddr;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tether_cdp::mock::{DelayedReply, MockInspector, MockInspectorConfig};
use tether_dap::mock::MockDebugAdapter;
use tether_debugger::{AttachConfig, DebuggerError, DebuggerEvent, ProtocolKind, SessionState};

use crate::harness::{
    attach_adapter, attach_inspector, inspector_config, next_event, orchestrator, wait_for_state,
    TIMEOUT,
};

fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Forwards connections to `upstream` after holding each one for `delay`.
async fn slow_proxy(upstream: SocketAddr, delay: Duration) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut inbound, _)) = listener.accept().await {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let Ok(mut outbound) = tokio::net::TcpStream::connect(upstream).await else {
                    return;
                };
                let _ = tokio::io::copy_bidirectional(&mut inbound, &mut outbound).await;
            });
        }
    });
    addr
}

fn via_proxy(inspector: &MockInspector, proxy: SocketAddr) -> AttachConfig {
    AttachConfig {
        protocol: "remote-object".into(),
        ws_url: Some(
            inspector
                .ws_url()
                .replace(&inspector.addr().to_string(), &proxy.to_string()),
        ),
        ..Default::default()
    }
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    tokio::time::timeout(TIMEOUT, async {
        while !done() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn unsupported_protocol_is_rejected_before_anything_is_created() {
    let orchestrator = orchestrator();
    let (mut events, handle) = orchestrator.subscribe(None);

    let err = orchestrator
        .attach(
            "host-1",
            AttachConfig {
                protocol: "jdwp".into(),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DebuggerError::UnsupportedProtocol(ref name) if name == "jdwp"));
    assert!(orchestrator.get_all_sessions().is_empty());
    handle.cancel();
    assert_eq!(events.recv().await, None);
}

#[tokio::test]
async fn invalid_configs_are_rejected() {
    let orchestrator = orchestrator();

    let err = orchestrator
        .attach(
            "host-1",
            AttachConfig {
                protocol: "remote-object".into(),
                ws_url: Some("http://127.0.0.1:9229/abc".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "InvalidConfig");

    let err = orchestrator
        .attach(
            "host-1",
            AttachConfig {
                protocol: "adapter-protocol".into(),
                port: Some(4711),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "InvalidConfig");
    assert!(orchestrator.get_all_sessions().is_empty());
}

#[tokio::test]
async fn refused_connections_fail_cleanly() {
    let orchestrator = orchestrator();
    let port = closed_port();

    let err = orchestrator
        .attach(
            "host-1",
            AttachConfig {
                protocol: "remote-object".into(),
                ws_url: Some(format!("ws://127.0.0.1:{port}/gone")),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ConnectionFailed", "{err}");

    let err = orchestrator
        .attach(
            "host-1",
            AttachConfig {
                protocol: "adapter-protocol".into(),
                port: Some(port),
                program: Some("/app/main.py".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "ConnectionFailed", "{err}");
    assert!(orchestrator.get_all_sessions().is_empty());
}

#[tokio::test]
async fn one_debug_session_per_host_session() {
    let first = MockInspector::spawn().await.unwrap();
    let second = MockInspector::spawn().await.unwrap();
    let orchestrator = orchestrator();

    let id = attach_inspector(&orchestrator, &first).await;
    let err = orchestrator
        .attach("host-js", inspector_config(&second))
        .await
        .unwrap_err();
    assert!(matches!(err, DebuggerError::AlreadyAttached(ref host) if host == "host-js"));
    assert_eq!(second.connections(), 0);

    let other = orchestrator
        .attach("host-other", inspector_config(&second))
        .await
        .unwrap();
    let sessions: Vec<_> = orchestrator
        .get_all_sessions()
        .into_iter()
        .map(|info| (info.id, info.host_session_id))
        .collect();
    assert_eq!(
        sessions,
        vec![(id, "host-js".to_string()), (other, "host-other".to_string())]
    );
}

#[tokio::test]
async fn concurrent_attaches_for_different_hosts_proceed_in_parallel() {
    let inspector = MockInspector::spawn().await.unwrap();
    let adapter = MockDebugAdapter::spawn().await.unwrap();
    let orchestrator = orchestrator();

    let (js, py) = tokio::join!(
        attach_inspector(&orchestrator, &inspector),
        attach_adapter(&orchestrator, &adapter)
    );
    assert_ne!(js, py);

    let js = orchestrator.get_session(js).unwrap();
    let py = orchestrator.get_session(py).unwrap();
    assert_eq!(js.protocol, ProtocolKind::RemoteObject);
    assert_eq!(py.protocol, ProtocolKind::AdapterProtocol);
}

#[tokio::test]
async fn detach_during_an_in_flight_step_is_clean() {
    let inspector = MockInspector::spawn_with_config(MockInspectorConfig {
        pause_on_debugger_enable: true,
        delayed_replies: vec![DelayedReply {
            method: "Debugger.stepOver".into(),
            delay: Duration::from_millis(500),
        }],
        ..Default::default()
    })
    .await
    .unwrap();
    let orchestrator = orchestrator();
    let id = attach_inspector(&orchestrator, &inspector).await;

    let stepping = tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.step_over(id).await }
    });
    tokio::time::timeout(TIMEOUT, async {
        while inspector.step_calls() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    orchestrator.detach(id).await;
    let result = tokio::time::timeout(TIMEOUT, stepping).await.unwrap().unwrap();
    assert!(result.is_ok(), "{result:?}");
    assert!(orchestrator.get_session(id).is_none());
    assert!(orchestrator.get_all_sessions().is_empty());

    let err = orchestrator.step_over(id).await.unwrap_err();
    assert_eq!(err.code(), "SessionNotFound");
}

#[tokio::test]
async fn lost_transport_removes_the_session() {
    let inspector = MockInspector::spawn().await.unwrap();
    let orchestrator = orchestrator();
    let id = attach_inspector(&orchestrator, &inspector).await;
    let (mut events, _handle) = orchestrator.subscribe(Some(id));

    assert!(inspector.close_connection());

    let terminated = next_event(&mut events, |event| {
        matches!(
            event,
            DebuggerEvent::StateChanged {
                state: SessionState::Terminated,
                ..
            }
        )
    })
    .await;
    assert_eq!(terminated.session_id(), id);
    next_event(&mut events, |event| {
        matches!(event, DebuggerEvent::SessionRemoved { .. })
    })
    .await;
    assert!(orchestrator.get_session(id).is_none());

    let again = attach_inspector(&orchestrator, &inspector).await;
    assert_ne!(again, id);
    assert_eq!(inspector.connections(), 2);
}

#[tokio::test]
async fn adapter_exit_terminates_but_keeps_the_session_until_detach() {
    let adapter = MockDebugAdapter::spawn().await.unwrap();
    let orchestrator = orchestrator();
    let id = attach_adapter(&orchestrator, &adapter).await;

    assert!(adapter.emit_exited(0).await);
    wait_for_state(&orchestrator, id, SessionState::Terminated).await;
    assert!(orchestrator.get_session(id).is_some());

    orchestrator.detach(id).await;
    assert!(orchestrator.get_session(id).is_none());
}

#[tokio::test]
async fn lifecycle_events_reach_global_subscribers() {
    let inspector = MockInspector::spawn().await.unwrap();
    let orchestrator = orchestrator();
    let (mut events, _handle) = orchestrator.subscribe(None);

    let id = attach_inspector(&orchestrator, &inspector).await;
    orchestrator.detach(id).await;

    let mut names = Vec::new();
    loop {
        let event = tokio::time::timeout(TIMEOUT, events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.session_id(), id);
        names.push(event.name());
        if event.name() == "sessionRemoved" {
            break;
        }
    }
    assert!(names.contains(&"sessionCreated"));
    assert!(names.contains(&"stateChanged"));
    assert_eq!(names.last(), Some(&"sessionRemoved"));
}

#[tokio::test]
async fn shutdown_detaches_every_session() {
    let inspector = MockInspector::spawn().await.unwrap();
    let adapter = MockDebugAdapter::spawn().await.unwrap();
    let orchestrator = orchestrator();
    attach_inspector(&orchestrator, &inspector).await;
    attach_adapter(&orchestrator, &adapter).await;

    orchestrator.shutdown().await;

    assert!(orchestrator.get_all_sessions().is_empty());
    assert!(adapter.commands().await.contains(&"disconnect".to_string()));
}

#[tokio::test]
async fn shutdown_while_attaching_closes_the_new_transport() {
    let inspector = MockInspector::spawn().await.unwrap();
    let proxy = slow_proxy(inspector.addr(), Duration::from_millis(300)).await;
    let orchestrator = orchestrator();

    let attaching = tokio::spawn({
        let orchestrator = orchestrator.clone();
        let config = via_proxy(&inspector, proxy);
        async move { orchestrator.attach("host-js", config).await }
    });
    wait_until(|| !orchestrator.get_all_sessions().is_empty()).await;
    orchestrator.shutdown().await;

    let result = tokio::time::timeout(TIMEOUT, attaching).await.unwrap().unwrap();
    assert!(result.is_err(), "{result:?}");
    assert!(orchestrator.get_all_sessions().is_empty());

    wait_until(|| inspector.connections() == 1 && !inspector.is_connected()).await;
    assert!(inspector.methods().await.is_empty());

    attach_inspector(&orchestrator, &inspector).await;
    assert_eq!(inspector.connections(), 2);
}

#[tokio::test]
async fn abandoned_attach_leaves_nothing_behind() {
    let inspector = MockInspector::spawn().await.unwrap();
    let proxy = slow_proxy(inspector.addr(), Duration::from_millis(300)).await;
    let orchestrator = orchestrator();

    let abandoned = tokio::time::timeout(
        Duration::from_millis(100),
        orchestrator.attach("host-js", via_proxy(&inspector, proxy)),
    )
    .await;
    assert!(abandoned.is_err());
    assert!(orchestrator.get_all_sessions().is_empty());

    attach_inspector(&orchestrator, &inspector).await;
    assert_eq!(orchestrator.get_all_sessions().len(), 1);
}
