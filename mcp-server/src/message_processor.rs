//! Request router for the stdio JSON-RPC loop.
//!
//! Tool calls are dispatched onto their own tasks so a parked call (send
//! rendezvous, target wait) never blocks the read loop.

use std::sync::Arc;

use pagebridge_mcp_types::CallToolRequestParams;
use pagebridge_mcp_types::INVALID_PARAMS_ERROR_CODE;
use pagebridge_mcp_types::INVALID_REQUEST_ERROR_CODE;
use pagebridge_mcp_types::Implementation;
use pagebridge_mcp_types::InitializeResult;
use pagebridge_mcp_types::JSONRPCError;
use pagebridge_mcp_types::JSONRPCMessage;
use pagebridge_mcp_types::JSONRPCNotification;
use pagebridge_mcp_types::JSONRPCRequest;
use pagebridge_mcp_types::JSONRPCResponse;
use pagebridge_mcp_types::ListToolsResult;
use pagebridge_mcp_types::MCP_SCHEMA_VERSION;
use pagebridge_mcp_types::METHOD_NOT_FOUND_ERROR_CODE;
use pagebridge_mcp_types::RequestId;
use pagebridge_mcp_types::ServerCapabilities;
use pagebridge_mcp_types::ServerCapabilitiesTools;
use serde_json::json;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::outgoing::OutgoingMessageSender;
use crate::tools::ToolKit;

pub(crate) struct MessageProcessor {
    outgoing: OutgoingMessageSender,
    toolkit: Arc<ToolKit>,
    initialized: bool,
}

impl MessageProcessor {
    pub(crate) fn new(outgoing: OutgoingMessageSender, toolkit: Arc<ToolKit>) -> Self {
        Self {
            outgoing,
            toolkit,
            initialized: false,
        }
    }

    pub(crate) fn process(&mut self, message: JSONRPCMessage) {
        match message {
            JSONRPCMessage::Request(request) => self.process_request(request),
            JSONRPCMessage::Notification(notification) => {
                self.process_notification(notification)
            }
            JSONRPCMessage::Response(response) => self.process_response(response),
            JSONRPCMessage::Error(error) => self.process_error(error),
        }
    }

    fn process_request(&mut self, request: JSONRPCRequest) {
        let request_id = request.id.clone();
        match request.method.as_str() {
            "initialize" => self.handle_initialize(request_id, request.params),
            "ping" => self.outgoing.send_response(request_id, json!({})),
            "tools/list" => self.handle_list_tools(request_id),
            "tools/call" => self.handle_call_tool(request_id, request.params),
            other => {
                debug!("unsupported method: {other}");
                self.outgoing.send_error(
                    request_id,
                    METHOD_NOT_FOUND_ERROR_CODE,
                    format!("method not supported: {other}"),
                );
            }
        }
    }

    fn process_notification(&mut self, notification: JSONRPCNotification) {
        match notification.method.as_str() {
            "notifications/initialized" => info!("client initialized"),
            other => debug!("ignoring notification {other}"),
        }
    }

    fn process_response(&mut self, response: JSONRPCResponse) {
        debug!("unexpected response from peer: {response:?}");
    }

    fn process_error(&mut self, error: JSONRPCError) {
        warn!("peer error: {error:?}");
    }

    fn handle_initialize(&mut self, id: RequestId, params: Option<serde_json::Value>) {
        if self.initialized {
            self.outgoing.send_error(
                id,
                INVALID_REQUEST_ERROR_CODE,
                "initialize called more than once".to_string(),
            );
            return;
        }
        self.initialized = true;

        let protocol_version = params
            .as_ref()
            .and_then(|p| p.get("protocolVersion"))
            .and_then(|v| v.as_str())
            .unwrap_or(MCP_SCHEMA_VERSION)
            .to_string();

        let result = InitializeResult {
            capabilities: ServerCapabilities {
                tools: Some(ServerCapabilitiesTools {
                    list_changed: Some(false),
                }),
            },
            protocol_version,
            server_info: Implementation {
                name: "pagebridge-mcp-server".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: None,
        };
        self.outgoing.send_response(id, result);
    }

    fn handle_list_tools(&self, id: RequestId) {
        let result = ListToolsResult {
            tools: ToolKit::definitions(),
        };
        self.outgoing.send_response(id, result);
    }

    fn handle_call_tool(&self, id: RequestId, params: Option<serde_json::Value>) {
        let params: CallToolRequestParams = match params
            .map(serde_json::from_value)
            .transpose()
        {
            Ok(Some(params)) => params,
            Ok(None) => {
                self.outgoing.send_error(
                    id,
                    INVALID_PARAMS_ERROR_CODE,
                    "tools/call requires params".to_string(),
                );
                return;
            }
            Err(e) => {
                self.outgoing.send_error(
                    id,
                    INVALID_PARAMS_ERROR_CODE,
                    format!("invalid tools/call params: {e}"),
                );
                return;
            }
        };

        let toolkit = Arc::clone(&self.toolkit);
        let outgoing = self.outgoing.clone();
        tokio::spawn(async move {
            let result = toolkit.call(&params.name, params.arguments).await;
            outgoing.send_response(id, result);
        });
    }
}
