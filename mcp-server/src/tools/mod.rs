//! Tool registry and dispatch.
//!
//! Every operation the agent may invoke is declared here with a JSON schema
//! and dispatched to a handler. Handler failures never escape: they become a
//! JSON content block with an `isError` marker. After the core logic runs,
//! the response envelope is augmented with pending-annotation state.

mod annotation;
mod browser;
mod process;

use std::sync::Arc;

use pagebridge_annotations::AnnotationService;
use pagebridge_browser::SessionManager;
use pagebridge_mcp_types::CallToolResult;
use pagebridge_mcp_types::CallToolResultContent;
use pagebridge_mcp_types::ImageContent;
use pagebridge_mcp_types::TextContent;
use pagebridge_mcp_types::Tool;
use pagebridge_mcp_types::ToolInputSchema;
use pagebridge_procman::ProcessManager;
use serde_json::Value;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::debug;
use tracing::warn;

use crate::state::ProcessingCoordinator;

/// Network bodies larger than this are cut off in tool output.
pub(crate) const MAX_BODY_OUTPUT: usize = 10 * 1024;

pub struct ToolKit {
    pub(crate) session: Arc<SessionManager>,
    pub(crate) annotations: Arc<AnnotationService>,
    pub(crate) processes: Arc<ProcessManager>,
    pub(crate) coordinator: ProcessingCoordinator,
    /// Serializes whole tool cycles. Call bodies run on their own tasks so
    /// the stdin loop stays responsive, but the one-shot sent-state consume
    /// and the processing-state transitions must observe request order even
    /// when a client pipelines tools/call requests.
    call_gate: Mutex<()>,
}

impl ToolKit {
    pub fn new(
        session: Arc<SessionManager>,
        annotations: Arc<AnnotationService>,
        processes: Arc<ProcessManager>,
    ) -> Arc<Self> {
        let coordinator = ProcessingCoordinator::new(Arc::clone(&session));
        Arc::new(Self {
            session,
            annotations,
            processes,
            coordinator,
            call_gate: Mutex::new(()),
        })
    }

    pub fn definitions() -> Vec<Tool> {
        let mut tools = Vec::new();
        tools.extend(browser::definitions());
        tools.extend(process::definitions());
        tools.extend(annotation::definitions());
        tools
    }

    /// Run one tool call end to end, including envelope augmentation. One
    /// cycle at a time: concurrent calls queue on the gate in arrival order.
    pub async fn call(&self, name: &str, arguments: Option<Value>) -> CallToolResult {
        let _cycle = self.call_gate.lock().await;
        let arguments = arguments.unwrap_or(Value::Null);
        let mut result = match self.dispatch(name, &arguments).await {
            Ok(result) => result,
            Err(message) => {
                debug!("tool {name} failed: {message}");
                error_result(&message)
            }
        };

        let sent = self.annotations.consume_sent_state().await;
        if sent {
            self.flush_sent_annotations(&mut result).await;
        } else {
            self.coordinator.finish_if_processing().await;
            self.annotate_pending(&mut result).await;
        }
        result
    }

    async fn dispatch(
        &self,
        name: &str,
        arguments: &Value,
    ) -> std::result::Result<CallToolResult, String> {
        match name {
            "browser_status" => browser::status(self).await,
            "browser_select_page" => browser::select_page(self, arguments).await,
            "browser_evaluate" => browser::evaluate(self, arguments).await,
            "browser_get_console" => browser::get_console(self).await,
            "browser_get_network" => browser::get_network(self).await,
            "browser_get_network_request" => browser::get_network_request(self, arguments).await,
            "browser_query_dom" => browser::query_dom(self, arguments).await,
            "browser_wait" => browser::wait(self, arguments).await,
            "browser_screenshot" => browser::screenshot(self).await,
            "browser_navigate" => browser::navigate(self, arguments).await,
            "browser_reload" => browser::reload(self).await,
            "browser_inject_overlay" => browser::inject_overlay(self).await,
            "process_start" => process::start(self, arguments).await,
            "process_stop" => process::stop(self, arguments).await,
            "process_list" => process::list(self).await,
            "process_logs" => process::logs(self, arguments).await,
            "annotations_list" => annotation::list(self).await,
            "annotation_resolve" => annotation::resolve(self, arguments).await,
            "annotations_wait_for_send" => annotation::wait_for_send(self, arguments).await,
            other => Err(format!("unknown tool: {other}")),
        }
    }

    /// A send was consumed this cycle: append every open annotation (text +
    /// screenshot blocks), show `processing`, and auto-resolve by removing
    /// badges and deleting the records.
    async fn flush_sent_annotations(&self, result: &mut CallToolResult) {
        self.coordinator.push_processing().await;

        let open = self.annotations.open_annotations().await;
        if open.is_empty() {
            return;
        }

        let feedback: Vec<Value> = open
            .iter()
            .map(|a| {
                json!({
                    "id": a.id,
                    "url": a.url,
                    "selector": a.selector,
                    "selectorConfidence": a.selector_confidence,
                    "text": a.text,
                    "componentInfo": a.component_info,
                    "elements": a.elements,
                    "anchorPoint": a.anchor_point,
                })
            })
            .collect();
        let summary = json!({
            "userFeedback": feedback,
            "count": open.len(),
        });
        result
            .content
            .push(CallToolResultContent::TextContent(TextContent {
                text: summary.to_string(),
            }));

        for annotation in &open {
            if let Some(data_url) = &annotation.screenshot_data_url {
                if let Some((mime_type, data)) = split_data_url(data_url) {
                    result
                        .content
                        .push(CallToolResultContent::ImageContent(ImageContent {
                            data: data.to_string(),
                            mime_type: mime_type.to_string(),
                        }));
                }
            }
        }

        // Auto-resolve: badges out of the page first, then the records.
        let mut remove_script = String::new();
        for annotation in &open {
            if let Some(id) = sanitize_identifier(&annotation.id.to_string()) {
                remove_script.push_str(&format!(
                    "document.querySelectorAll('[data-annotation-id=\"{id}\"]').forEach((el) => el.remove());"
                ));
            }
        }
        if !remove_script.is_empty() {
            self.session.evaluate_if_connected(&remove_script).await;
        }
        for annotation in &open {
            if !self.annotations.delete(annotation.id).await {
                warn!("annotation {} vanished before auto-resolve", annotation.id);
            }
        }
        self.session
            .evaluate_if_connected(
                "if (window.__pagebridgeRefreshBadges) { window.__pagebridgeRefreshBadges(); }",
            )
            .await;
    }

    /// No send this cycle: if open annotations exist, tag the primary JSON
    /// block with their count.
    async fn annotate_pending(&self, result: &mut CallToolResult) {
        let open = self.annotations.open_annotations().await.len();
        if open == 0 {
            return;
        }
        if let Some(CallToolResultContent::TextContent(block)) = result.content.first_mut() {
            if let Ok(Value::Object(mut object)) = serde_json::from_str::<Value>(&block.text) {
                object.insert("pending_annotations".to_string(), json!(open));
                block.text = Value::Object(object).to_string();
            }
        }
    }
}

pub(crate) fn json_result(value: Value) -> CallToolResult {
    CallToolResult {
        content: vec![CallToolResultContent::TextContent(TextContent {
            text: value.to_string(),
        })],
        is_error: None,
    }
}

pub(crate) fn error_result(message: &str) -> CallToolResult {
    CallToolResult {
        content: vec![CallToolResultContent::TextContent(TextContent {
            text: json!({"error": message}).to_string(),
        })],
        is_error: Some(true),
    }
}

/// Identifiers interpolated into page scripts are reduced to `[a-f0-9-]`.
pub(crate) fn sanitize_identifier(raw: &str) -> Option<String> {
    let cleaned: String = raw
        .chars()
        .filter(|c| matches!(c, 'a'..='f' | '0'..='9' | '-'))
        .collect();
    if cleaned.is_empty() { None } else { Some(cleaned) }
}

/// Cut large payloads (network bodies) at 10 KiB with an explicit marker.
pub(crate) fn truncate_output(mut text: String) -> (String, bool) {
    if text.len() <= MAX_BODY_OUTPUT {
        return (text, false);
    }
    let mut cut = MAX_BODY_OUTPUT;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str("…Truncated");
    (text, true)
}

fn split_data_url(data_url: &str) -> Option<(&str, &str)> {
    let rest = data_url.strip_prefix("data:")?;
    let (mime_type, data) = rest.split_once(";base64,")?;
    Some((mime_type, data))
}

pub(crate) fn tool(
    name: &str,
    description: &str,
    properties: Value,
    required: &[&str],
) -> Tool {
    Tool {
        name: name.to_string(),
        description: description.to_string(),
        input_schema: ToolInputSchema {
            r#type: "object".to_string(),
            properties: Some(properties),
            required: if required.is_empty() {
                None
            } else {
                Some(required.iter().map(|s| s.to_string()).collect())
            },
        },
    }
}
