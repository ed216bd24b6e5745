//! Outgoing half of the stdio transport: handlers enqueue JSON-RPC messages
//! on a channel and a single writer task owns stdout. Stdout carries protocol
//! frames only; diagnostics go to stderr via tracing.

use pagebridge_mcp_types::JSONRPC_VERSION;
use pagebridge_mcp_types::JSONRPCError;
use pagebridge_mcp_types::JSONRPCErrorError;
use pagebridge_mcp_types::JSONRPCMessage;
use pagebridge_mcp_types::JSONRPCResponse;
use pagebridge_mcp_types::RequestId;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

#[derive(Clone)]
pub struct OutgoingMessageSender {
    tx: mpsc::UnboundedSender<JSONRPCMessage>,
}

impl OutgoingMessageSender {
    pub fn new(tx: mpsc::UnboundedSender<JSONRPCMessage>) -> Self {
        Self { tx }
    }

    pub fn send(&self, message: JSONRPCMessage) {
        if self.tx.send(message).is_err() {
            error!("stdout writer is gone, dropping outgoing message");
        }
    }

    pub fn send_response<T: Serialize>(&self, id: RequestId, result: T) {
        match serde_json::to_value(result) {
            Ok(result) => self.send(JSONRPCMessage::Response(JSONRPCResponse {
                jsonrpc: JSONRPC_VERSION.to_string(),
                id,
                result,
            })),
            Err(e) => {
                error!("failed to serialize response: {e}");
                self.send_error(id, pagebridge_mcp_types::INTERNAL_ERROR_CODE, e.to_string());
            }
        }
    }

    pub fn send_error(&self, id: RequestId, code: i64, message: String) {
        self.send(JSONRPCMessage::Error(JSONRPCError {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            error: JSONRPCErrorError {
                code,
                message,
                data: None,
            },
        }));
    }
}

/// Spawn the task that drains the outgoing channel onto stdout, one JSON
/// frame per line.
pub fn spawn_stdout_writer(
    mut rx: mpsc::UnboundedReceiver<JSONRPCMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(message) = rx.recv().await {
            let line = match serde_json::to_string(&message) {
                Ok(line) => line,
                Err(e) => {
                    error!("failed to serialize outgoing frame: {e}");
                    continue;
                }
            };
            if stdout.write_all(line.as_bytes()).await.is_err()
                || stdout.write_all(b"\n").await.is_err()
                || stdout.flush().await.is_err()
            {
                error!("stdout closed, stopping writer");
                break;
            }
        }
    })
}
