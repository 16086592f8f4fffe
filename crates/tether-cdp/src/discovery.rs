//! HTTP target discovery (`GET /json/list`).

use std::time::Duration;

use serde::Deserialize;

use crate::types::{CdpError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetInfo {
    pub id: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub web_socket_debugger_url: Option<String>,
}

pub async fn list_targets(host: &str, port: u16, timeout: Duration) -> Result<Vec<TargetInfo>> {
    let client = reqwest::Client::builder().timeout(timeout).build()?;
    let endpoint = format!("http://{host}:{port}/json/list");
    let targets = client
        .get(&endpoint)
        .send()
        .await?
        .error_for_status()?
        .json::<Vec<TargetInfo>>()
        .await?;
    tracing::debug!(target: "tether.cdp", %endpoint, count = targets.len(), "listed inspector targets");
    Ok(targets)
}

/// Resolve the websocket URL for the first debuggable target on `host:port`.
pub async fn discover_websocket_url(host: &str, port: u16, timeout: Duration) -> Result<String> {
    let targets = list_targets(host, port, timeout).await?;
    targets
        .into_iter()
        .find_map(|target| target.web_socket_debugger_url)
        .ok_or_else(|| CdpError::Discovery(format!("no debuggable targets on {host}:{port}")))
}

/// Build `ws://host:port/<target>` from an explicit target id or path.
pub fn target_websocket_url(host: &str, port: u16, target: &str) -> String {
    format!("ws://{host}:{port}/{}", target.trim_start_matches('/'))
}
