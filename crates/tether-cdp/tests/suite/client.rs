use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use tether_cdp::mock::{DelayedReply, MockEvaluation, MockInspector, MockInspectorConfig};
use tether_cdp::{CdpClient, CdpClientConfig, CdpError, CdpEvent};
use tokio::sync::broadcast;

async fn next_event(
    events: &mut broadcast::Receiver<CdpEvent>,
    mut pred: impl FnMut(&CdpEvent) -> bool,
) -> CdpEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for inspector event")
}

#[tokio::test]
async fn pause_emitted_before_enable_reply_reaches_early_subscriber() {
    let server = MockInspector::spawn_with_config(MockInspectorConfig {
        pause_on_debugger_enable: true,
        initial_pause_line: 4,
        ..Default::default()
    })
    .await
    .unwrap();
    let client = CdpClient::connect(&server.ws_url()).await.unwrap();

    let mut events = client.subscribe_events();
    client.runtime_enable().await.unwrap();
    client.debugger_enable().await.unwrap();

    let event = next_event(&mut events, |e| matches!(e, CdpEvent::Paused(_))).await;
    let CdpEvent::Paused(paused) = event else {
        unreachable!()
    };
    assert_eq!(paused.reason, "Break on start");
    assert_eq!(paused.call_frames[0].location.line_number, 4);
    assert_eq!(paused.call_frames.len(), 2);
}

#[tokio::test]
async fn breakpoints_round_trip_through_the_inspector() {
    let server = MockInspector::spawn().await.unwrap();
    let client = CdpClient::connect(&server.ws_url()).await.unwrap();

    let result = client
        .set_breakpoint_by_url(&server.script_url(), 9, None, Some("n > 1"))
        .await
        .unwrap();
    assert_eq!(result.locations[0].line_number, 9);

    let active = server.breakpoints().await;
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].line, 9);
    assert_eq!(active[0].condition.as_deref(), Some("n > 1"));

    client.remove_breakpoint(&result.breakpoint_id).await.unwrap();
    assert!(server.breakpoints().await.is_empty());
}

#[tokio::test]
async fn remote_errors_carry_method_and_message() {
    let server = MockInspector::spawn_with_config(MockInspectorConfig {
        rejected_lines: vec![2],
        ..Default::default()
    })
    .await
    .unwrap();
    let client = CdpClient::connect(&server.ws_url()).await.unwrap();

    let err = client
        .set_breakpoint_by_url(&server.script_url(), 2, None, None)
        .await
        .unwrap_err();
    match err {
        CdpError::Remote {
            method, message, ..
        } => {
            assert_eq!(method, "Debugger.setBreakpointByUrl");
            assert_eq!(message, "Could not resolve breakpoint");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn step_produces_resumed_then_paused() {
    let server = MockInspector::spawn().await.unwrap();
    let client = CdpClient::connect(&server.ws_url()).await.unwrap();
    let mut events = client.subscribe_events();

    client.step_over().await.unwrap();

    next_event(&mut events, |e| matches!(e, CdpEvent::Resumed)).await;
    let CdpEvent::Paused(paused) =
        next_event(&mut events, |e| matches!(e, CdpEvent::Paused(_))).await
    else {
        unreachable!()
    };
    assert_eq!(paused.call_frames[0].location.line_number, 1);
    assert_eq!(server.step_calls(), 1);
}

#[tokio::test]
async fn get_properties_and_evaluate() {
    let mut config = MockInspectorConfig::default();
    config
        .evaluations
        .insert("count * 2".into(), MockEvaluation::Value(json!(84)));
    config
        .evaluations
        .insert("boom()".into(), MockEvaluation::Throw("Error: boom".into()));
    let server = MockInspector::spawn_with_config(config).await.unwrap();
    let client = CdpClient::connect(&server.ws_url()).await.unwrap();

    let props = client.get_properties("scope:local:0").await.unwrap();
    let names: Vec<_> = props.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, ["count", "message", "config"]);

    let value = client.evaluate_on_call_frame("0", "count * 2").await.unwrap();
    assert_eq!(value.result.display(), "84");
    assert!(value.exception_details.is_none());

    let thrown = client.evaluate("boom()").await.unwrap();
    assert_eq!(
        thrown.exception_details.map(|details| details.message()),
        Some("Error: boom".to_string())
    );

    let calls = server.evaluate_calls().await;
    assert_eq!(calls[0].call_frame_id.as_deref(), Some("0"));
    assert_eq!(calls[1].method, "Runtime.evaluate");
}

#[tokio::test]
async fn console_and_exception_notifications_are_typed() {
    let server = MockInspector::spawn().await.unwrap();
    let client = CdpClient::connect(&server.ws_url()).await.unwrap();
    let mut events = client.subscribe_events();
    // Make sure the server has registered the session before injecting.
    client.runtime_enable().await.unwrap();

    assert!(server.emit_console("warning", &[json!("low disk"), json!(3)]));
    let CdpEvent::ConsoleApiCalled(console) =
        next_event(&mut events, |e| matches!(e, CdpEvent::ConsoleApiCalled(_))).await
    else {
        unreachable!()
    };
    assert_eq!(console.kind, "warning");
    let texts: Vec<_> = console.args.iter().map(|arg| arg.display()).collect();
    assert_eq!(texts, ["low disk", "3"]);

    assert!(server.emit_exception("TypeError: x is undefined", 7));
    let CdpEvent::ExceptionThrown(thrown) =
        next_event(&mut events, |e| matches!(e, CdpEvent::ExceptionThrown(_))).await
    else {
        unreachable!()
    };
    assert_eq!(thrown.exception_details.line_number, 7);
    assert_eq!(
        thrown.exception_details.message(),
        "TypeError: x is undefined"
    );
}

#[tokio::test]
async fn server_close_fails_pending_and_reports_transport_closed() {
    let server = MockInspector::spawn_with_config(MockInspectorConfig {
        delayed_replies: vec![DelayedReply {
            method: "Debugger.pause".into(),
            delay: Duration::from_secs(30),
        }],
        ..Default::default()
    })
    .await
    .unwrap();
    let client = CdpClient::connect(&server.ws_url()).await.unwrap();
    let mut events = client.subscribe_events();
    client.runtime_enable().await.unwrap();

    let pending = {
        let client = client.clone();
        tokio::spawn(async move { client.pause().await })
    };
    // Let the pause request reach the server.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.close_connection());

    next_event(&mut events, |e| matches!(e, CdpEvent::TransportClosed { .. })).await;
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, CdpError::ConnectionClosed), "{err:?}");
    assert!(client.is_closed());
}

#[tokio::test]
async fn requests_after_shutdown_are_cancelled() {
    let server = MockInspector::spawn().await.unwrap();
    let client = CdpClient::connect(&server.ws_url()).await.unwrap();
    client.shutdown();

    let err = client.resume().await.unwrap_err();
    assert!(matches!(err, CdpError::Cancelled), "{err:?}");
    assert!(client.shutdown_token().is_cancelled());
}

#[tokio::test]
async fn slow_replies_time_out_without_poisoning_the_client() {
    let server = MockInspector::spawn_with_config(MockInspectorConfig {
        delayed_replies: vec![DelayedReply {
            method: "Debugger.stepOut".into(),
            delay: Duration::from_millis(500),
        }],
        ..Default::default()
    })
    .await
    .unwrap();
    let client = CdpClient::connect_with_config(
        &server.ws_url(),
        CdpClientConfig {
            reply_timeout: Duration::from_millis(50),
            ..Default::default()
        },
    )
    .await
    .unwrap();

    let err = client.step_out().await.unwrap_err();
    assert!(matches!(err, CdpError::Timeout), "{err:?}");

    // A late reply for the abandoned request is dropped; new requests still work.
    client.runtime_enable().await.unwrap();
}

#[tokio::test]
async fn rejects_non_websocket_urls() {
    let err = CdpClient::connect("http://127.0.0.1:1/x")
        .await
        .err()
        .expect("http url must be rejected");
    assert!(matches!(err, CdpError::InvalidUrl(_)));
}
