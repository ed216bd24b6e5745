//! Browser-facing tool handlers.

use pagebridge_browser::BrowserError;
use pagebridge_browser::overlay::build_overlay_script;
use pagebridge_browser::session::ConnectOptions;
use pagebridge_mcp_types::CallToolResult;
use pagebridge_mcp_types::CallToolResultContent;
use pagebridge_mcp_types::ImageContent;
use pagebridge_mcp_types::TextContent;
use pagebridge_mcp_types::Tool;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use serde_json::json;
use url::Url;

use super::ToolKit;
use super::json_result;
use super::tool;
use super::truncate_output;

type Result<T> = std::result::Result<T, String>;

pub(crate) fn definitions() -> Vec<Tool> {
    vec![
        tool(
            "browser_status",
            "Report browser connection state, selected page target and telemetry buffer occupancy.",
            json!({}),
            &[],
        ),
        tool(
            "browser_select_page",
            "Select the page target to control, by exact target id or case-insensitive URL substring, optionally waiting for it to appear.",
            json!({
                "targetId": {"type": "string"},
                "urlPattern": {"type": "string"},
                "waitMs": {"type": "number"},
            }),
            &[],
        ),
        tool(
            "browser_evaluate",
            "Evaluate a JavaScript expression in the page and return its JSON value.",
            json!({"expression": {"type": "string"}}),
            &["expression"],
        ),
        tool(
            "browser_get_console",
            "Drain buffered console output (page console calls and browser-level log entries).",
            json!({}),
            &[],
        ),
        tool(
            "browser_get_network",
            "Drain buffered completed network requests with status and timing.",
            json!({}),
            &[],
        ),
        tool(
            "browser_get_network_request",
            "Fetch response body and request post data for one buffered network request.",
            json!({"requestId": {"type": "string"}}),
            &["requestId"],
        ),
        tool(
            "browser_query_dom",
            "Return the outer HTML of elements matching a CSS selector.",
            json!({
                "selector": {"type": "string"},
                "limit": {"type": "number"},
            }),
            &["selector"],
        ),
        tool(
            "browser_wait",
            "Wait a bounded number of milliseconds, then drain console and network buffers.",
            json!({"waitMs": {"type": "number"}}),
            &[],
        ),
        tool(
            "browser_screenshot",
            "Capture a screenshot of the current viewport.",
            json!({}),
            &[],
        ),
        tool(
            "browser_navigate",
            "Navigate the controlled page to an http, https or file URL.",
            json!({"url": {"type": "string"}}),
            &["url"],
        ),
        tool(
            "browser_reload",
            "Reload the controlled page.",
            json!({}),
            &[],
        ),
        tool(
            "browser_inject_overlay",
            "Start the annotation service if needed and (re)inject the feedback overlay into the page.",
            json!({}),
            &[],
        ),
    ]
}

pub(crate) fn parse_args<T: DeserializeOwned>(arguments: &Value) -> Result<T> {
    let value = if arguments.is_null() {
        Value::Object(serde_json::Map::new())
    } else {
        arguments.clone()
    };
    serde_json::from_value(value).map_err(|e| format!("invalid arguments: {e}"))
}

/// Attach a hint to connection failures, sensitive to the auto-launch flag.
fn describe(kit: &ToolKit, error: BrowserError) -> String {
    match &error {
        BrowserError::Unreachable(_) => {
            let config = kit.session.config();
            if config.auto_launch {
                format!("{error}; discovery and automatic launch both failed, is Chrome installed?")
            } else {
                format!(
                    "{error}; auto-launch is disabled, start the browser with --remote-debugging-port={} or enable auto-launch",
                    config.debug_port
                )
            }
        }
        _ => error.to_string(),
    }
}

pub(crate) async fn status(kit: &ToolKit) -> Result<CallToolResult> {
    let config = kit.session.config();
    let buffers = kit.session.buffers();
    Ok(json_result(json!({
        "connected": kit.session.is_connected().await,
        "target": kit.session.current_target().await,
        "debugHost": config.debug_host,
        "debugPort": config.debug_port,
        "autoLaunch": config.auto_launch,
        "consoleBuffered": buffers.console_len().await,
        "networkBuffered": buffers.network_len().await,
        "pendingRequests": buffers.pending_len().await,
        "annotationServicePort": kit.annotations.port().await,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectPageArgs {
    #[serde(default)]
    target_id: Option<String>,
    #[serde(default)]
    url_pattern: Option<String>,
    #[serde(default)]
    wait_ms: Option<u64>,
}

pub(crate) async fn select_page(kit: &ToolKit, arguments: &Value) -> Result<CallToolResult> {
    let args: SelectPageArgs = parse_args(arguments)?;
    let target = kit
        .session
        .connect_to_page(ConnectOptions {
            target_id: args.target_id,
            url_pattern: args.url_pattern,
            wait_ms: args.wait_ms,
        })
        .await
        .map_err(|e| describe(kit, e))?;
    Ok(json_result(json!({"selected": target})))
}

#[derive(Deserialize)]
struct EvaluateArgs {
    expression: String,
}

pub(crate) async fn evaluate(kit: &ToolKit, arguments: &Value) -> Result<CallToolResult> {
    let args: EvaluateArgs = parse_args(arguments)?;
    match kit.session.evaluate(&args.expression).await {
        Ok(value) => Ok(json_result(json!({"value": value}))),
        // A page exception is a structured result, not a transport failure.
        Err(BrowserError::EvaluationException(message)) => Ok(CallToolResult {
            content: vec![CallToolResultContent::TextContent(TextContent {
                text: json!({"exception": message}).to_string(),
            })],
            is_error: Some(true),
        }),
        Err(e) => Err(describe(kit, e)),
    }
}

pub(crate) async fn get_console(kit: &ToolKit) -> Result<CallToolResult> {
    let entries = kit.session.buffers().drain_console().await;
    Ok(json_result(json!({
        "count": entries.len(),
        "entries": entries,
    })))
}

pub(crate) async fn get_network(kit: &ToolKit) -> Result<CallToolResult> {
    let entries = kit.session.buffers().drain_network().await;
    Ok(json_result(json!({
        "count": entries.len(),
        "entries": entries,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NetworkRequestArgs {
    request_id: String,
}

pub(crate) async fn get_network_request(
    kit: &ToolKit,
    arguments: &Value,
) -> Result<CallToolResult> {
    let args: NetworkRequestArgs = parse_args(arguments)?;
    let entry = kit
        .session
        .buffers()
        .peek_network()
        .await
        .into_iter()
        .find(|e| e.id == args.request_id);

    let (body, body_base64, body_truncated) =
        match kit.session.response_body(&args.request_id).await {
            Ok((body, base64_encoded)) => {
                let (body, truncated) = truncate_output(body);
                (Some(body), base64_encoded, truncated)
            }
            Err(e) => {
                tracing::debug!("response body unavailable for {}: {e}", args.request_id);
                (None, false, false)
            }
        };
    let (post_data, post_data_truncated) =
        match kit.session.request_post_data(&args.request_id).await {
            Ok(data) => {
                let (data, truncated) = truncate_output(data);
                (Some(data), truncated)
            }
            Err(_) => (None, false),
        };

    Ok(json_result(json!({
        "requestId": args.request_id,
        "entry": entry,
        "responseBody": body,
        "responseBodyBase64": body_base64,
        "responseBodyTruncated": body_truncated,
        "requestPostData": post_data,
        "requestPostDataTruncated": post_data_truncated,
    })))
}

#[derive(Deserialize)]
struct QueryDomArgs {
    selector: String,
    #[serde(default)]
    limit: Option<usize>,
}

const DOM_QUERY_DEFAULT_LIMIT: usize = 10;
const DOM_QUERY_MAX_LIMIT: usize = 50;

pub(crate) async fn query_dom(kit: &ToolKit, arguments: &Value) -> Result<CallToolResult> {
    let args: QueryDomArgs = parse_args(arguments)?;
    let limit = args
        .limit
        .unwrap_or(DOM_QUERY_DEFAULT_LIMIT)
        .min(DOM_QUERY_MAX_LIMIT);
    let matches = kit
        .session
        .query_dom(&args.selector, limit)
        .await
        .map_err(|e| describe(kit, e))?;
    let rendered: Vec<Value> = matches
        .into_iter()
        .map(|html| {
            let (html, truncated) = truncate_output(html);
            json!({"outerHtml": html, "truncated": truncated})
        })
        .collect();
    Ok(json_result(json!({
        "selector": args.selector,
        "count": rendered.len(),
        "matches": rendered,
    })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WaitArgs {
    #[serde(default)]
    wait_ms: Option<u64>,
}

const WAIT_DEFAULT_MS: u64 = 1_000;
const WAIT_MAX_MS: u64 = 30_000;

pub(crate) async fn wait(kit: &ToolKit, arguments: &Value) -> Result<CallToolResult> {
    let args: WaitArgs = parse_args(arguments)?;
    let wait_ms = args.wait_ms.unwrap_or(WAIT_DEFAULT_MS).min(WAIT_MAX_MS);
    tokio::time::sleep(std::time::Duration::from_millis(wait_ms)).await;
    let buffers = kit.session.buffers();
    let console = buffers.drain_console().await;
    let network = buffers.drain_network().await;
    Ok(json_result(json!({
        "waitedMs": wait_ms,
        "console": console,
        "network": network,
    })))
}

pub(crate) async fn screenshot(kit: &ToolKit) -> Result<CallToolResult> {
    let data = kit
        .session
        .screenshot_viewport()
        .await
        .map_err(|e| describe(kit, e))?;
    let target = kit.session.current_target().await;
    let mut result = json_result(json!({
        "url": target.as_ref().map(|t| t.url.clone()),
        "mode": "viewport",
    }));
    result
        .content
        .push(CallToolResultContent::ImageContent(ImageContent {
            data,
            mime_type: "image/png".to_string(),
        }));
    Ok(result)
}

#[derive(Deserialize)]
struct NavigateArgs {
    url: String,
}

pub(crate) async fn navigate(kit: &ToolKit, arguments: &Value) -> Result<CallToolResult> {
    let args: NavigateArgs = parse_args(arguments)?;
    let parsed =
        Url::parse(&args.url).map_err(|e| format!("invalid URL {:?}: {e}", args.url))?;
    if !matches!(parsed.scheme(), "http" | "https" | "file") {
        return Err(format!(
            "navigation is restricted to http, https and file URLs (got {:?})",
            parsed.scheme()
        ));
    }
    let (url, title) = kit
        .session
        .navigate(&args.url)
        .await
        .map_err(|e| describe(kit, e))?;
    Ok(json_result(json!({"url": url, "title": title})))
}

pub(crate) async fn reload(kit: &ToolKit) -> Result<CallToolResult> {
    let (url, title) = kit.session.reload().await.map_err(|e| describe(kit, e))?;
    Ok(json_result(json!({"url": url, "title": title})))
}

pub(crate) async fn inject_overlay(kit: &ToolKit) -> Result<CallToolResult> {
    let port = kit
        .annotations
        .start()
        .await
        .map_err(|e| e.to_string())?;
    let script = build_overlay_script(port);
    kit.session
        .evaluate(&script)
        .await
        .map_err(|e| describe(kit, e))?;
    Ok(json_result(json!({"injected": true, "port": port})))
}
