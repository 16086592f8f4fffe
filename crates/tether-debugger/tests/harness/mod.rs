//! Helpers shared by the integration suite.

use std::time::Duration;

use tether_cdp::mock::MockInspector;
use tether_config::TetherConfig;
use tether_dap::mock::MockDebugAdapter;
use tether_debugger::{
    AttachConfig, DebugSessionId, DebuggerEvent, EventSubscription, Orchestrator, SessionState,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn orchestrator() -> Orchestrator {
    orchestrator_with(|_| {})
}

pub fn orchestrator_with(configure: impl FnOnce(&mut TetherConfig)) -> Orchestrator {
    let mut config = TetherConfig::default();
    config.debugger.connect_timeout_ms = 2_000;
    config.debugger.request_timeout_ms = 2_000;
    config.debugger.first_state_timeout_ms = 2_000;
    configure(&mut config);
    Orchestrator::new(&config)
}

pub fn inspector_config(inspector: &MockInspector) -> AttachConfig {
    AttachConfig {
        protocol: "remote-object".into(),
        ws_url: Some(inspector.ws_url()),
        ..Default::default()
    }
}

pub fn adapter_config(adapter: &MockDebugAdapter, stop_on_entry: bool) -> AttachConfig {
    AttachConfig {
        protocol: "adapter-protocol".into(),
        host: Some("127.0.0.1".into()),
        port: Some(adapter.addr().port()),
        program: Some(adapter.program()),
        stop_on_entry,
        ..Default::default()
    }
}

pub async fn attach_inspector(
    orchestrator: &Orchestrator,
    inspector: &MockInspector,
) -> DebugSessionId {
    orchestrator
        .attach("host-js", inspector_config(inspector))
        .await
        .expect("attach to mock inspector")
}

pub async fn attach_adapter(
    orchestrator: &Orchestrator,
    adapter: &MockDebugAdapter,
) -> DebugSessionId {
    orchestrator
        .attach("host-py", adapter_config(adapter, true))
        .await
        .expect("attach to mock debug adapter")
}

/// Poll the session table until `id` reaches `state`.
pub async fn wait_for_state(orchestrator: &Orchestrator, id: DebugSessionId, state: SessionState) {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            if orchestrator.get_session(id).map(|info| info.state) == Some(state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("session {id} never reached {state}"));
}

pub async fn next_event(
    events: &mut EventSubscription,
    mut pred: impl FnMut(&DebuggerEvent) -> bool,
) -> DebuggerEvent {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let event = events.recv().await.expect("event stream closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for debugger event")
}

pub async fn next_pause(events: &mut EventSubscription) -> DebuggerEvent {
    next_event(events, |event| {
        matches!(
            event,
            DebuggerEvent::StateChanged {
                state: SessionState::Paused,
                ..
            }
        )
    })
    .await
}
