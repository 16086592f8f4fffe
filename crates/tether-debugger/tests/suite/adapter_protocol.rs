use std::collections::HashMap;

use pretty_assertions::assert_eq;
use serde_json::json;
use tether_dap::mock::{MockDebugAdapter, MockDebugAdapterConfig, MockEvaluation};
use tether_debugger::{
    ConsoleFilter, ConsoleLevel, DebuggerEvent, ExceptionFilter, SessionState, SourceBreakpoint,
};

use crate::harness::{
    adapter_config, attach_adapter, next_event, next_pause, orchestrator, wait_for_state,
};

const PROGRAM: &str = "/app/main.py";

#[tokio::test]
async fn launch_with_stop_on_entry_pauses_at_the_entry() {
    let adapter = MockDebugAdapter::spawn().await.unwrap();
    let orchestrator = orchestrator();

    let id = attach_adapter(&orchestrator, &adapter).await;
    wait_for_state(&orchestrator, id, SessionState::Paused).await;

    let info = orchestrator.get_session(id).unwrap();
    let location = info.pause_location.unwrap();
    assert_eq!(location.source, PROGRAM);
    assert_eq!(location.line, 1);
    assert_eq!(location.reason, "entry");

    let frames: Vec<(&str, u32)> = info
        .call_stack
        .iter()
        .map(|frame| (frame.name.as_str(), frame.line))
        .collect();
    assert_eq!(frames, [("handle", 1), ("<module>", 1)]);
    let scopes: Vec<&str> = info.scopes.iter().map(|scope| scope.name.as_str()).collect();
    assert_eq!(scopes, ["Locals", "Globals"]);

    let launch = adapter.launch_arguments().await.unwrap();
    assert_eq!(launch["program"], json!(PROGRAM));
    assert_eq!(launch["stopOnEntry"], json!(true));

    let commands = adapter.commands().await;
    assert_eq!(&commands[..3], &["initialize", "launch", "configurationDone"]);
}

#[tokio::test]
async fn launch_without_stop_on_entry_runs_to_completion() {
    let adapter = MockDebugAdapter::spawn_with_config(MockDebugAdapterConfig {
        exit_code: 3,
        ..Default::default()
    })
    .await
    .unwrap();
    let orchestrator = orchestrator();

    let id = orchestrator
        .attach("host-py", adapter_config(&adapter, false))
        .await
        .unwrap();
    wait_for_state(&orchestrator, id, SessionState::Terminated).await;

    let console = orchestrator.get_console_messages(&ConsoleFilter::default());
    assert_eq!(console.len(), 1);
    assert_eq!(console[0].text, "program finished");
    assert_eq!(console[0].level, ConsoleLevel::Log);

    let err = orchestrator.resume(id).await.unwrap_err();
    assert_eq!(err.code(), "SessionNotActive");
}

#[tokio::test]
async fn replacing_breakpoints_then_continuing_hits_the_new_line() {
    let adapter = MockDebugAdapter::spawn().await.unwrap();
    let orchestrator = orchestrator();
    let id = attach_adapter(&orchestrator, &adapter).await;
    wait_for_state(&orchestrator, id, SessionState::Paused).await;
    let (mut events, _handle) = orchestrator.subscribe(Some(id));

    orchestrator
        .set_breakpoints(id, PROGRAM, vec![SourceBreakpoint::at_line(3)])
        .await
        .unwrap();
    let installed = orchestrator
        .set_breakpoints(id, PROGRAM, vec![SourceBreakpoint::at_line(5)])
        .await
        .unwrap();

    let native: Vec<u32> = adapter
        .breakpoints(PROGRAM)
        .await
        .iter()
        .map(|bp| bp.line)
        .collect();
    assert_eq!(native, vec![5]);
    let model: Vec<u32> = orchestrator
        .get_session(id)
        .unwrap()
        .breakpoints
        .iter()
        .map(|bp| bp.line)
        .collect();
    assert_eq!(model, vec![5]);

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
    assert_eq!(call_stack[0].line, 5);
    assert_eq!(adapter.continue_calls(), 1);
}

#[tokio::test]
async fn rejected_lines_come_back_unverified() {
    let adapter = MockDebugAdapter::spawn_with_config(MockDebugAdapterConfig {
        rejected_lines: vec![4],
        ..Default::default()
    })
    .await
    .unwrap();
    let orchestrator = orchestrator();
    let id = attach_adapter(&orchestrator, &adapter).await;

    let installed = orchestrator
        .set_breakpoints(
            id,
            PROGRAM,
            vec![SourceBreakpoint::at_line(4), SourceBreakpoint::at_line(6)],
        )
        .await
        .unwrap();

    assert!(!installed[0].verified);
    assert_eq!(installed[0].message.as_deref(), Some("Line is not executable"));
    assert!(installed[1].verified);

    orchestrator
        .remove_breakpoint(id, &installed[1].id)
        .await
        .unwrap();
    let native: Vec<u32> = adapter
        .breakpoints(PROGRAM)
        .await
        .iter()
        .map(|bp| bp.line)
        .collect();
    assert_eq!(native, vec![4]);
    let model = orchestrator.get_session(id).unwrap().breakpoints;
    assert_eq!(model.len(), 1);
    assert_eq!(model[0].line, 4);
}

#[tokio::test]
async fn variables_expand_and_dangle_after_a_step() {
    let adapter = MockDebugAdapter::spawn().await.unwrap();
    let orchestrator = orchestrator();
    let id = attach_adapter(&orchestrator, &adapter).await;
    wait_for_state(&orchestrator, id, SessionState::Paused).await;
    let (mut events, _handle) = orchestrator.subscribe(Some(id));

    let frame_id = orchestrator.get_call_stack(id).await.unwrap()[0].id;
    assert_eq!(frame_id, 1000);
    let scopes = orchestrator.get_scopes(id, frame_id).await.unwrap();
    let locals = orchestrator
        .get_variables(id, scopes[0].variables_reference)
        .await
        .unwrap();
    let rendered: Vec<(&str, &str, Option<&str>)> = locals
        .iter()
        .map(|var| (var.name.as_str(), var.value.as_str(), var.type_name.as_deref()))
        .collect();
    assert_eq!(
        rendered,
        [
            ("count", "42", Some("int")),
            ("settings", "{'debug': True}", Some("dict"))
        ]
    );
    let settings_ref = locals[1].variables_reference;
    assert!(settings_ref > 0);
    let children = orchestrator.get_variables(id, settings_ref).await.unwrap();
    assert_eq!(children[0].name, "'debug'");

    orchestrator.step_over(id).await.unwrap();
    let DebuggerEvent::StateChanged { location, .. } = next_pause(&mut events).await else {
        unreachable!()
    };
    assert_eq!(location.unwrap().line, 2);
    assert_eq!(adapter.step_calls(), 1);

    assert!(orchestrator.get_variables(id, settings_ref).await.unwrap().is_empty());
    assert!(orchestrator.get_variables(id, 424_242).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_evaluation_is_a_textual_result() {
    let adapter = MockDebugAdapter::spawn_with_config(MockDebugAdapterConfig {
        evaluations: HashMap::from([
            (
                "1/0".to_string(),
                MockEvaluation::Error("ZeroDivisionError: division by zero".to_string()),
            ),
            (
                "len(items)".to_string(),
                MockEvaluation::Value {
                    result: "3".to_string(),
                    type_name: "int".to_string(),
                },
            ),
        ]),
        ..Default::default()
    })
    .await
    .unwrap();
    let orchestrator = orchestrator();
    let id = attach_adapter(&orchestrator, &adapter).await;
    wait_for_state(&orchestrator, id, SessionState::Paused).await;

    let failed = orchestrator.evaluate(id, "1/0", Some(1000)).await.unwrap();
    assert!(failed.is_error);
    assert!(failed.result.contains("ZeroDivisionError"), "{}", failed.result);

    let value = orchestrator
        .evaluate(id, "len(items)", Some(1000))
        .await
        .unwrap();
    assert!(!value.is_error);
    assert_eq!(value.result, "3");
    assert_eq!(value.type_name.as_deref(), Some("int"));
}

#[tokio::test]
async fn evaluating_with_a_frame_from_an_earlier_stop_uses_global_scope() {
    let adapter = MockDebugAdapter::spawn_with_config(MockDebugAdapterConfig {
        evaluations: HashMap::from([(
            "len(items)".to_string(),
            MockEvaluation::Value {
                result: "3".to_string(),
                type_name: "int".to_string(),
            },
        )]),
        ..Default::default()
    })
    .await
    .unwrap();
    let orchestrator = orchestrator();
    let id = attach_adapter(&orchestrator, &adapter).await;
    wait_for_state(&orchestrator, id, SessionState::Paused).await;
    let frame_id = orchestrator.get_session(id).unwrap().call_stack[0].id;

    assert!(adapter.emit_continued().await);
    wait_for_state(&orchestrator, id, SessionState::Running).await;

    let value = orchestrator
        .evaluate(id, "len(items)", Some(frame_id))
        .await
        .unwrap();
    assert!(!value.is_error, "{}", value.result);
    assert_eq!(value.result, "3");
}

#[tokio::test]
async fn output_and_exception_stops_are_captured() {
    let adapter = MockDebugAdapter::spawn().await.unwrap();
    let orchestrator = orchestrator();
    let id = attach_adapter(&orchestrator, &adapter).await;
    wait_for_state(&orchestrator, id, SessionState::Paused).await;
    let (mut events, _handle) = orchestrator.subscribe(Some(id));

    assert!(adapter.emit_output("stderr", "Traceback (most recent call last):\n").await);
    assert!(adapter.emit_output("telemetry", "{\"event\":\"ping\"}").await);
    assert!(adapter.emit_output("important", "deprecated API\n").await);
    assert!(adapter.emit_stopped("exception", 7).await);

    next_pause(&mut events).await;

    let console: Vec<(ConsoleLevel, String)> = orchestrator
        .get_console_messages(&ConsoleFilter::default())
        .into_iter()
        .map(|message| (message.level, message.text))
        .collect();
    assert_eq!(
        console,
        [
            (
                ConsoleLevel::Error,
                "Traceback (most recent call last):".to_string()
            ),
            (ConsoleLevel::Warn, "deprecated API".to_string())
        ]
    );

    let exceptions = orchestrator.get_exceptions(&ExceptionFilter {
        session_id: Some(id),
        ..Default::default()
    });
    assert_eq!(exceptions.len(), 1);
    assert_eq!(exceptions[0].location.clone().unwrap().line, 7);

    let location = orchestrator.get_session(id).unwrap().pause_location.unwrap();
    assert_eq!(location.reason, "exception");
    assert_eq!(location.line, 7);
}

#[tokio::test]
async fn launch_failure_leaves_no_session() {
    let adapter = MockDebugAdapter::spawn_with_config(MockDebugAdapterConfig {
        launch_error: Some("program not found".to_string()),
        ..Default::default()
    })
    .await
    .unwrap();
    let orchestrator = orchestrator();

    let err = orchestrator
        .attach("host-py", adapter_config(&adapter, true))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("program not found"), "{err}");
    assert!(orchestrator.get_all_sessions().is_empty());

    // The host session is free for another attempt.
    let retry = orchestrator
        .attach("host-py", adapter_config(&adapter, true))
        .await;
    assert!(retry.is_err());
}
