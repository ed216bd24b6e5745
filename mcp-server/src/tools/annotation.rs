//! Annotation listing, resolution and the send wait.

use pagebridge_mcp_types::CallToolResult;
use pagebridge_mcp_types::Tool;
use serde::Deserialize;
use serde_json::Value;
use serde_json::json;
use uuid::Uuid;

use super::ToolKit;
use super::browser::parse_args;
use super::json_result;
use super::tool;

type Result<T> = std::result::Result<T, String>;

const SEND_WAIT_DEFAULT_MS: u64 = 30_000;
const SEND_WAIT_MAX_MS: u64 = 600_000;

pub(crate) fn definitions() -> Vec<Tool> {
    vec![
        tool(
            "annotations_list",
            "List annotations pinned in the overlay, open ones first.",
            json!({}),
            &[],
        ),
        tool(
            "annotation_resolve",
            "Mark one annotation resolved and refresh the overlay badges.",
            json!({"id": {"type": "string"}}),
            &["id"],
        ),
        tool(
            "annotations_wait_for_send",
            "Block until the user clicks Send in the overlay, or the timeout elapses.",
            json!({"timeoutMs": {"type": "number"}}),
            &[],
        ),
    ]
}

pub(crate) async fn list(kit: &ToolKit) -> Result<CallToolResult> {
    let mut annotations = kit.annotations.annotations().await;
    annotations.sort_by_key(|a| !a.is_open());
    let open_count = annotations.iter().filter(|a| a.is_open()).count();
    Ok(json_result(json!({
        "count": annotations.len(),
        "openCount": open_count,
        "annotations": annotations,
    })))
}

#[derive(Deserialize)]
struct ResolveArgs {
    id: String,
}

pub(crate) async fn resolve(kit: &ToolKit, arguments: &Value) -> Result<CallToolResult> {
    let args: ResolveArgs = parse_args(arguments)?;
    let id = Uuid::parse_str(&args.id).map_err(|e| format!("invalid annotation id: {e}"))?;
    let annotation = kit
        .annotations
        .resolve(id)
        .await
        .map_err(|e| e.to_string())?;
    kit.session
        .evaluate_if_connected(
            "if (window.__pagebridgeRefreshBadges) { window.__pagebridgeRefreshBadges(); }",
        )
        .await;
    Ok(json_result(json!({"success": true, "annotation": annotation})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WaitForSendArgs {
    #[serde(default)]
    timeout_ms: Option<u64>,
}

pub(crate) async fn wait_for_send(kit: &ToolKit, arguments: &Value) -> Result<CallToolResult> {
    let args: WaitForSendArgs = parse_args(arguments)?;
    let timeout_ms = args
        .timeout_ms
        .unwrap_or(SEND_WAIT_DEFAULT_MS)
        .min(SEND_WAIT_MAX_MS);
    let triggered = kit.annotations.wait_for_send(timeout_ms).await;
    Ok(json_result(json!({"triggered": triggered})))
}
