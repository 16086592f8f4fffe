use std::collections::HashMap;

use pretty_assertions::assert_eq;
use serde_json::json;
use tether_cdp::mock::{MockEvaluation, MockInspector, MockInspectorConfig};
use tether_debugger::{
    AttachConfig, ConsoleFilter, ConsoleLevel, DebuggerEvent, ExceptionFilter, SessionState,
    SourceBreakpoint,
};

use crate::harness::{
    attach_inspector, next_event, next_pause, orchestrator, orchestrator_with, wait_for_state,
};

fn paused_on_enable(line: u32) -> MockInspectorConfig {
    MockInspectorConfig {
        pause_on_debugger_enable: true,
        initial_pause_line: line,
        ..Default::default()
    }
}

#[tokio::test]
async fn pause_during_debugger_enable_is_the_initial_state() {
    let inspector = MockInspector::spawn_with_config(paused_on_enable(4))
        .await
        .unwrap();
    let orchestrator = orchestrator();

    let id = attach_inspector(&orchestrator, &inspector).await;
    let info = orchestrator.get_session(id).unwrap();

    assert_eq!(info.state, SessionState::Paused);
    let location = info.pause_location.unwrap();
    assert_eq!(location.source, "/app/main.js");
    assert_eq!(location.line, 5);
    assert_eq!(location.reason, "entry");

    let lines: Vec<u32> = info.call_stack.iter().map(|frame| frame.line).collect();
    assert_eq!(lines, vec![5, 1]);
    assert_eq!(info.call_stack[0].name, "handler");
    assert_eq!(info.call_stack[1].name, "(anonymous)");

    let methods = inspector.methods().await;
    let enable_order: Vec<&str> = methods
        .iter()
        .map(String::as_str)
        .filter(|method| method.ends_with(".enable"))
        .collect();
    assert_eq!(enable_order, ["Runtime.enable", "Debugger.enable"]);
}

#[tokio::test]
async fn running_target_attaches_as_running() {
    let inspector = MockInspector::spawn().await.unwrap();
    let orchestrator = orchestrator();

    let id = attach_inspector(&orchestrator, &inspector).await;
    assert_eq!(
        orchestrator.get_session(id).unwrap().state,
        SessionState::Running
    );
    assert!(inspector
        .methods()
        .await
        .contains(&"Runtime.runIfWaitingForDebugger".to_string()));
}

#[tokio::test]
async fn discovers_the_websocket_url_from_host_and_port() {
    let inspector = MockInspector::spawn().await.unwrap();
    let orchestrator = orchestrator();

    let id = orchestrator
        .attach(
            "host-js",
            AttachConfig {
                protocol: "remote-object".into(),
                host: Some("127.0.0.1".into()),
                port: Some(inspector.addr().port()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(inspector.connections(), 1);
    assert_eq!(
        orchestrator.get_session(id).unwrap().state,
        SessionState::Running
    );
}

#[tokio::test]
async fn replacing_breakpoints_leaves_only_the_new_set() {
    let inspector = MockInspector::spawn_with_config(paused_on_enable(0))
        .await
        .unwrap();
    let orchestrator = orchestrator();
    let id = attach_inspector(&orchestrator, &inspector).await;

    orchestrator
        .set_breakpoints(id, "/app/main.js", vec![SourceBreakpoint::at_line(10)])
        .await
        .unwrap();
    let installed = orchestrator
        .set_breakpoints(id, "/app/main.js", vec![SourceBreakpoint::at_line(20)])
        .await
        .unwrap();

    assert_eq!(installed.len(), 1);
    assert!(installed[0].verified);
    assert_eq!(installed[0].line, 20);

    let model: Vec<(u32, bool)> = orchestrator
        .get_session(id)
        .unwrap()
        .breakpoints
        .iter()
        .map(|bp| (bp.line, bp.verified))
        .collect();
    assert_eq!(model, vec![(20, true)]);

    let native = inspector.breakpoints().await;
    assert_eq!(native.len(), 1);
    assert_eq!(native[0].line, 19);
    assert_eq!(native[0].url, "file:///app/main.js");
}

#[tokio::test]
async fn resuming_into_a_breakpoint_reports_the_hit() {
    let inspector = MockInspector::spawn_with_config(paused_on_enable(0))
        .await
        .unwrap();
    let orchestrator = orchestrator();
    let id = attach_inspector(&orchestrator, &inspector).await;
    let (mut events, _handle) = orchestrator.subscribe(Some(id));

    let installed = orchestrator
        .set_breakpoints(
            id,
            "/app/main.js",
            vec![SourceBreakpoint {
                line: 12,
                column: None,
                condition: Some("count > 1".into()),
            }],
        )
        .await
        .unwrap();
    orchestrator.resume(id).await.unwrap();

    let hit = next_event(&mut events, |event| {
        matches!(event, DebuggerEvent::BreakpointHit { .. })
    })
    .await;
    let DebuggerEvent::BreakpointHit {
        breakpoint,
        call_stack,
        ..
    } = hit
    else {
        unreachable!()
    };
    assert_eq!(breakpoint.id, installed[0].id);
    assert_eq!(breakpoint.line, 12);
    assert_eq!(call_stack[0].line, 12);

    let native = inspector.breakpoints().await;
    assert_eq!(native[0].condition.as_deref(), Some("count > 1"));
    assert_eq!(inspector.resume_calls(), 1);
}

#[tokio::test]
async fn rejected_breakpoints_come_back_unverified_with_local_ids() {
    let inspector = MockInspector::spawn_with_config(MockInspectorConfig {
        rejected_lines: vec![14],
        ..paused_on_enable(0)
    })
    .await
    .unwrap();
    let orchestrator = orchestrator();
    let id = attach_inspector(&orchestrator, &inspector).await;

    let installed = orchestrator
        .set_breakpoints(
            id,
            "/app/main.js",
            vec![SourceBreakpoint::at_line(10), SourceBreakpoint::at_line(15)],
        )
        .await
        .unwrap();

    assert_eq!(installed.len(), 2);
    assert!(installed[0].verified);
    assert_eq!(installed[0].id, "bp-1");
    assert!(!installed[1].verified);
    assert!(installed[1].id.starts_with("local-"), "{}", installed[1].id);
    assert!(installed[1].message.is_some());

    orchestrator
        .remove_breakpoint(id, &installed[0].id)
        .await
        .unwrap();
    assert!(inspector.breakpoints().await.is_empty());
    let remaining: Vec<String> = orchestrator
        .get_session(id)
        .unwrap()
        .breakpoints
        .into_iter()
        .map(|bp| bp.id)
        .collect();
    assert_eq!(remaining, vec![installed[1].id.clone()]);
}

#[tokio::test]
async fn failed_native_removal_still_drops_the_breakpoint() {
    let inspector = MockInspector::spawn_with_config(MockInspectorConfig {
        failing_methods: vec!["Debugger.removeBreakpoint".to_string()],
        ..paused_on_enable(0)
    })
    .await
    .unwrap();
    let orchestrator = orchestrator();
    let id = attach_inspector(&orchestrator, &inspector).await;

    let installed = orchestrator
        .set_breakpoints(
            id,
            "/app/main.js",
            vec![SourceBreakpoint::at_line(10), SourceBreakpoint::at_line(20)],
        )
        .await
        .unwrap();
    orchestrator
        .remove_breakpoint(id, &installed[0].id)
        .await
        .unwrap();
    assert!(inspector
        .methods()
        .await
        .iter()
        .any(|method| method == "Debugger.removeBreakpoint"));

    let listed: Vec<String> = orchestrator
        .get_session(id)
        .unwrap()
        .breakpoints
        .into_iter()
        .map(|bp| bp.id)
        .collect();
    assert_eq!(listed, vec![installed[1].id.clone()]);

    // Removing it again is a no-op on both sides.
    orchestrator
        .remove_breakpoint(id, &installed[0].id)
        .await
        .unwrap();
    let removals = inspector
        .methods()
        .await
        .iter()
        .filter(|method| *method == "Debugger.removeBreakpoint")
        .count();
    assert_eq!(removals, 1);
}

#[tokio::test]
async fn variables_expand_and_dangle_after_resume() {
    let inspector = MockInspector::spawn_with_config(MockInspectorConfig {
        resume_hits_breakpoints: false,
        ..paused_on_enable(2)
    })
    .await
    .unwrap();
    let orchestrator = orchestrator();
    let id = attach_inspector(&orchestrator, &inspector).await;

    let frame_id = orchestrator.get_session(id).unwrap().call_stack[0].id;
    let scopes = orchestrator.get_scopes(id, frame_id).await.unwrap();
    let names: Vec<&str> = scopes.iter().map(|scope| scope.name.as_str()).collect();
    assert_eq!(names, ["Local", "Global"]);
    assert!(scopes[1].expensive);

    let locals = orchestrator
        .get_variables(id, scopes[0].variables_reference)
        .await
        .unwrap();
    let rendered: Vec<(&str, &str)> = locals
        .iter()
        .map(|var| (var.name.as_str(), var.value.as_str()))
        .collect();
    assert_eq!(
        rendered,
        [("count", "42"), ("message", "hello"), ("config", "Object")]
    );
    assert_eq!(locals[0].variables_reference, 0);
    let config_ref = locals[2].variables_reference;
    assert!(config_ref > 0);

    let children = orchestrator.get_variables(id, config_ref).await.unwrap();
    let child_names: Vec<&str> = children.iter().map(|var| var.name.as_str()).collect();
    assert_eq!(child_names, ["debug", "retries"]);

    assert!(orchestrator.get_variables(id, 999_999).await.unwrap().is_empty());

    orchestrator.resume(id).await.unwrap();
    wait_for_state(&orchestrator, id, SessionState::Running).await;

    assert!(orchestrator.get_variables(id, config_ref).await.unwrap().is_empty());
    assert!(orchestrator
        .get_variables(id, scopes[0].variables_reference)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn stepping_moves_the_pause_location() {
    let inspector = MockInspector::spawn_with_config(paused_on_enable(3))
        .await
        .unwrap();
    let orchestrator = orchestrator();
    let id = attach_inspector(&orchestrator, &inspector).await;
    let (mut events, _handle) = orchestrator.subscribe(Some(id));

    orchestrator.step_over(id).await.unwrap();
    let DebuggerEvent::StateChanged { location, .. } = next_pause(&mut events).await else {
        unreachable!()
    };
    let location = location.unwrap();
    assert_eq!(location.line, 5);
    assert_eq!(location.reason, "step");

    orchestrator.step_into(id).await.unwrap();
    next_pause(&mut events).await;
    orchestrator.step_out(id).await.unwrap();
    next_pause(&mut events).await;

    assert_eq!(inspector.step_calls(), 3);
    let info = orchestrator.get_session(id).unwrap();
    assert_eq!(info.pause_location.unwrap().line, 7);
}

#[tokio::test]
async fn throwing_evaluation_is_a_textual_result() {
    let inspector = MockInspector::spawn_with_config(MockInspectorConfig {
        evaluations: HashMap::from([
            (
                "explode()".to_string(),
                MockEvaluation::Throw("Error: boom\n    at explode (main.js:3:9)".to_string()),
            ),
            ("1 + 1".to_string(), MockEvaluation::Value(json!(2))),
        ]),
        ..paused_on_enable(0)
    })
    .await
    .unwrap();
    let orchestrator = orchestrator();
    let id = attach_inspector(&orchestrator, &inspector).await;
    let frame_id = orchestrator.get_session(id).unwrap().call_stack[0].id;

    let thrown = orchestrator
        .evaluate(id, "explode()", Some(frame_id))
        .await
        .unwrap();
    assert!(thrown.is_error);
    assert!(thrown.result.starts_with("Error: boom"), "{}", thrown.result);

    let value = orchestrator.evaluate(id, "1 + 1", None).await.unwrap();
    assert!(!value.is_error);
    assert_eq!(value.result, "2");

    let calls = inspector.evaluate_calls().await;
    assert_eq!(calls[0].method, "Debugger.evaluateOnCallFrame");
    assert_eq!(calls[0].call_frame_id.as_deref(), Some("0"));
    assert_eq!(calls[1].method, "Runtime.evaluate");
}

#[tokio::test]
async fn opaque_call_frame_ids_map_back_to_native_frames() {
    let inspector = MockInspector::spawn_with_config(MockInspectorConfig {
        opaque_call_frame_ids: true,
        ..paused_on_enable(0)
    })
    .await
    .unwrap();
    let orchestrator = orchestrator();
    let id = attach_inspector(&orchestrator, &inspector).await;

    let frames = orchestrator.get_call_stack(id).await.unwrap();
    let ids: Vec<i64> = frames.iter().map(|frame| frame.id).collect();
    assert_eq!(ids, vec![0, 1]);

    orchestrator
        .evaluate(id, "this", Some(frames[1].id))
        .await
        .unwrap();
    let calls = inspector.evaluate_calls().await;
    assert_eq!(
        calls[0].call_frame_id.as_deref(),
        Some("{\"ordinal\":1,\"injectedScriptId\":1}")
    );
}

#[tokio::test]
async fn console_and_exceptions_are_captured_with_one_based_locations() {
    let inspector = MockInspector::spawn_with_config(paused_on_enable(6))
        .await
        .unwrap();
    let orchestrator = orchestrator();
    let id = attach_inspector(&orchestrator, &inspector).await;
    let (mut events, _handle) = orchestrator.subscribe(Some(id));

    assert!(inspector.emit_console("log", &[json!("hello"), json!(42)]));
    assert!(inspector.emit_console("warning", &[json!("careful")]));
    assert!(inspector.emit_exception("TypeError: x is undefined\n    at handler", 9));

    next_event(&mut events, |event| matches!(event, DebuggerEvent::Exception(_))).await;

    let console = orchestrator.get_console_messages(&ConsoleFilter::default());
    let texts: Vec<(ConsoleLevel, &str)> = console
        .iter()
        .map(|message| (message.level, message.text.as_str()))
        .collect();
    assert_eq!(
        texts,
        [
            (ConsoleLevel::Log, "hello 42"),
            (ConsoleLevel::Warn, "careful")
        ]
    );
    let location = console[0].location.clone().unwrap();
    assert_eq!(location.source, "/app/main.js");
    assert_eq!(location.line, 7);
    assert_eq!(console[0].timestamp, 1_700_000_000_000);

    let exceptions = orchestrator.get_exceptions(&ExceptionFilter::default());
    assert_eq!(exceptions.len(), 1);
    assert_eq!(exceptions[0].message, "TypeError: x is undefined");
    assert!(exceptions[0].uncaught);
    assert_eq!(exceptions[0].location.clone().unwrap().line, 10);
}

#[tokio::test]
async fn console_buffer_is_bounded_per_session() {
    let inspector = MockInspector::spawn().await.unwrap();
    let orchestrator = orchestrator_with(|config| config.debugger.console_capacity = 2);
    let id = attach_inspector(&orchestrator, &inspector).await;
    let (mut events, _handle) = orchestrator.subscribe(Some(id));

    for n in 0..4 {
        assert!(inspector.emit_console("log", &[json!(format!("line {n}"))]));
    }
    next_event(&mut events, |event| {
        matches!(event, DebuggerEvent::ConsoleMessage(message) if message.text == "line 3")
    })
    .await;

    let texts: Vec<String> = orchestrator
        .get_console_messages(&ConsoleFilter {
            session_id: Some(id),
            ..Default::default()
        })
        .into_iter()
        .map(|message| message.text)
        .collect();
    assert_eq!(texts, ["line 2", "line 3"]);
}

#[tokio::test]
async fn inspector_detach_terminates_the_session() {
    let inspector = MockInspector::spawn().await.unwrap();
    let orchestrator = orchestrator();
    let id = attach_inspector(&orchestrator, &inspector).await;

    assert!(inspector.emit_detached("target closed"));
    wait_for_state(&orchestrator, id, SessionState::Terminated).await;

    let err = orchestrator.pause(id).await.unwrap_err();
    assert_eq!(err.code(), "SessionNotActive");

    orchestrator.detach(id).await;
    assert!(orchestrator.get_session(id).is_none());
}

#[tokio::test]
async fn pause_request_surfaces_a_pause() {
    let inspector = MockInspector::spawn().await.unwrap();
    let orchestrator = orchestrator();
    let id = attach_inspector(&orchestrator, &inspector).await;

    orchestrator.pause(id).await.unwrap();
    wait_for_state(&orchestrator, id, SessionState::Paused).await;

    assert_eq!(inspector.pause_calls(), 1);
    let location = orchestrator.get_session(id).unwrap().pause_location.unwrap();
    assert_eq!(location.reason, "pause");
}
