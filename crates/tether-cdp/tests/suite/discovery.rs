use std::time::Duration;

use tether_cdp::mock::MockInspector;
use tether_cdp::{discover_websocket_url, list_targets, CdpClient};

#[tokio::test]
async fn discovery_lists_the_mock_target() {
    let server = MockInspector::spawn().await.unwrap();
    let addr = server.addr();

    let targets = list_targets("127.0.0.1", addr.port(), Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(targets.len(), 1);
    assert_eq!(targets[0].kind, "node");
    assert_eq!(
        targets[0].web_socket_debugger_url.as_deref(),
        Some(server.ws_url().as_str())
    );
}

#[tokio::test]
async fn discovered_url_is_connectable() {
    let server = MockInspector::spawn().await.unwrap();
    let url = discover_websocket_url("127.0.0.1", server.addr().port(), Duration::from_secs(5))
        .await
        .unwrap();

    let client = CdpClient::connect(&url).await.unwrap();
    client.runtime_enable().await.unwrap();
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn discovery_against_closed_port_fails() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let result = discover_websocket_url("127.0.0.1", port, Duration::from_secs(2)).await;
    assert!(result.is_err());
}
