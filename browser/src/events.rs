//! Console and network telemetry pipelines.
//!
//! Raw CDP events are converted into flat entries and pushed into bounded
//! ring buffers that tool calls drain. Network request/response/failure
//! events are correlated by request id through a pending map; requests that
//! never complete (SSE, WebSocket upgrades, long-poll) are evicted by a
//! periodic sweep so the map stays bounded.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

use chromiumoxide::cdp::browser_protocol::log as cdp_log;
use chromiumoxide::cdp::browser_protocol::network as cdp_network;
use chromiumoxide::cdp::js_protocol::runtime as cdp_runtime;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;

use pagebridge_common::RingBuffer;

pub const PENDING_MAX_AGE: Duration = Duration::from_secs(300);
pub const PENDING_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleEntry {
    pub timestamp_iso: String,
    pub level: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkEntry {
    pub id: String,
    pub url: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp_iso: String,
}

#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub id: String,
    pub url: String,
    pub method: String,
    pub started: Instant,
    pub wall_clock_iso: String,
}

/// Render a console argument list to a single line: strings verbatim,
/// `undefined` spelled out, anything with a JSON value stringified, and a
/// type placeholder otherwise.
pub fn render_console_args(args: &[cdp_runtime::RemoteObject]) -> String {
    args.iter()
        .map(render_remote_object)
        .collect::<Vec<_>>()
        .join(" ")
}

fn render_remote_object(obj: &cdp_runtime::RemoteObject) -> String {
    if obj.r#type == cdp_runtime::RemoteObjectType::Undefined {
        return "undefined".to_string();
    }
    if let Some(value) = &obj.value {
        if let Some(s) = value.as_str() {
            return s.to_string();
        }
        if let Ok(s) = serde_json::to_string(value) {
            return s;
        }
    }
    if let Some(description) = &obj.description {
        return description.clone();
    }
    format!("[{:?}]", obj.r#type).to_lowercase()
}

fn console_level(kind: &cdp_runtime::ConsoleApiCalledType) -> String {
    format!("{kind:?}").to_lowercase()
}

fn log_level(level: &cdp_log::LogEntryLevel) -> String {
    format!("{level:?}").to_lowercase()
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Owner of the two telemetry ring buffers and the pending-request map.
/// All mutation happens through these methods; callers never hold the locks.
pub struct EventBuffers {
    console: Mutex<RingBuffer<ConsoleEntry>>,
    network: Mutex<RingBuffer<NetworkEntry>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl EventBuffers {
    pub fn new(console_capacity: usize, network_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            console: Mutex::new(RingBuffer::new(console_capacity)),
            network: Mutex::new(RingBuffer::new(network_capacity)),
            pending: Mutex::new(HashMap::new()),
        })
    }

    pub async fn on_console_api(&self, event: &cdp_runtime::EventConsoleApiCalled) {
        let entry = ConsoleEntry {
            timestamp_iso: now_iso(),
            level: console_level(&event.r#type),
            message: render_console_args(&event.args),
        };
        self.console.lock().await.push(entry);
    }

    pub async fn on_log_entry(&self, event: &cdp_log::EventEntryAdded) {
        let entry = ConsoleEntry {
            timestamp_iso: now_iso(),
            level: log_level(&event.entry.level),
            message: format!("[browser] {}", event.entry.text),
        };
        self.console.lock().await.push(entry);
    }

    pub async fn on_request_will_be_sent(&self, event: &cdp_network::EventRequestWillBeSent) {
        let id = event.request_id.inner().clone();
        let pending = PendingRequest {
            id: id.clone(),
            url: event.request.url.clone(),
            method: event.request.method.clone(),
            started: Instant::now(),
            wall_clock_iso: now_iso(),
        };
        self.pending.lock().await.insert(id, pending);
    }

    pub async fn on_response_received(&self, event: &cdp_network::EventResponseReceived) {
        let id = event.request_id.inner().clone();
        let Some(pending) = self.pending.lock().await.remove(&id) else {
            return;
        };
        let timing_ms = elapsed_ms(pending.started);
        let entry = NetworkEntry {
            id,
            url: pending.url,
            method: pending.method,
            status: Some(event.response.status),
            timing_ms: Some(timing_ms),
            error: None,
            timestamp_iso: pending.wall_clock_iso,
        };
        self.network.lock().await.push(entry);
    }

    pub async fn on_loading_failed(&self, event: &cdp_network::EventLoadingFailed) {
        let id = event.request_id.inner().clone();
        let Some(pending) = self.pending.lock().await.remove(&id) else {
            return;
        };
        let entry = NetworkEntry {
            id,
            url: pending.url,
            method: pending.method,
            status: None,
            timing_ms: Some(elapsed_ms(pending.started)),
            error: Some(event.error_text.clone()),
            timestamp_iso: pending.wall_clock_iso,
        };
        self.network.lock().await.push(entry);
    }

    /// Drop pending requests older than [`PENDING_MAX_AGE`]. Returns how many
    /// were evicted.
    pub async fn sweep_stale_pending(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let before = pending.len();
        pending.retain(|_, p| p.started.elapsed() <= PENDING_MAX_AGE);
        before - pending.len()
    }

    pub async fn clear_pending(&self) {
        self.pending.lock().await.clear();
    }

    pub async fn drain_console(&self) -> Vec<ConsoleEntry> {
        self.console.lock().await.drain()
    }

    pub async fn drain_network(&self) -> Vec<NetworkEntry> {
        self.network.lock().await.drain()
    }

    pub async fn peek_network(&self) -> Vec<NetworkEntry> {
        self.network.lock().await.peek()
    }

    pub async fn console_len(&self) -> usize {
        self.console.lock().await.len()
    }

    pub async fn network_len(&self) -> usize {
        self.network.lock().await.len()
    }

    pub async fn pending_len(&self) -> usize {
        self.pending.lock().await.len()
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    (started.elapsed().as_secs_f64() * 1000.0 * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn remote_string(s: &str) -> cdp_runtime::RemoteObject {
        cdp_runtime::RemoteObject::builder()
            .r#type(cdp_runtime::RemoteObjectType::String)
            .value(serde_json::Value::String(s.to_string()))
            .build()
            .unwrap()
    }

    fn remote_undefined() -> cdp_runtime::RemoteObject {
        cdp_runtime::RemoteObject::builder()
            .r#type(cdp_runtime::RemoteObjectType::Undefined)
            .build()
            .unwrap()
    }

    #[test]
    fn strings_render_verbatim_and_undefined_is_literal() {
        let rendered = render_console_args(&[remote_string("hello"), remote_undefined()]);
        assert_eq!(rendered, "hello undefined");
    }

    #[test]
    fn json_values_are_stringified() {
        let number = cdp_runtime::RemoteObject::builder()
            .r#type(cdp_runtime::RemoteObjectType::Number)
            .value(serde_json::json!(42))
            .build()
            .unwrap();
        let object = cdp_runtime::RemoteObject::builder()
            .r#type(cdp_runtime::RemoteObjectType::Object)
            .value(serde_json::json!({"a": 1}))
            .build()
            .unwrap();
        assert_eq!(render_console_args(&[number, object]), r#"42 {"a":1}"#);
    }

    #[test]
    fn valueless_objects_fall_back_to_description_or_placeholder() {
        let described = cdp_runtime::RemoteObject::builder()
            .r#type(cdp_runtime::RemoteObjectType::Function)
            .description("function foo()")
            .build()
            .unwrap();
        assert_eq!(render_console_args(&[described]), "function foo()");

        let bare = cdp_runtime::RemoteObject::builder()
            .r#type(cdp_runtime::RemoteObjectType::Symbol)
            .build()
            .unwrap();
        assert_eq!(render_console_args(&[bare]), "[symbol]");
    }

    #[tokio::test]
    async fn response_correlates_with_pending_request() {
        let buffers = EventBuffers::new(10, 10);
        let request: cdp_network::EventRequestWillBeSent = serde_json::from_value(serde_json::json!({
            "requestId": "req-1",
            "loaderId": "loader-1",
            "documentURL": "http://localhost:3000/",
            "request": {
                "url": "http://localhost:3000/api/items",
                "method": "GET",
                "headers": {},
                "initialPriority": "High",
                "referrerPolicy": "no-referrer",
            },
            "timestamp": 1.0,
            "wallTime": 1.0,
            "initiator": {"type": "script"},
            "redirectHasExtraInfo": false,
        }))
        .unwrap();
        buffers.on_request_will_be_sent(&request).await;
        assert_eq!(buffers.pending_len().await, 1);

        let response: cdp_network::EventResponseReceived = serde_json::from_value(serde_json::json!({
            "requestId": "req-1",
            "loaderId": "loader-1",
            "timestamp": 1.5,
            "type": "XHR",
            "response": {
                "url": "http://localhost:3000/api/items",
                "status": 200,
                "statusText": "OK",
                "headers": {},
                "mimeType": "application/json",
                "charset": "utf-8",
                "connectionReused": false,
                "connectionId": 1.0,
                "encodedDataLength": 10.0,
                "securityState": "secure",
            },
            "hasExtraInfo": false,
        }))
        .unwrap();
        buffers.on_response_received(&response).await;

        assert_eq!(buffers.pending_len().await, 0);
        let entries = buffers.drain_network().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "req-1");
        assert_eq!(entries[0].status, Some(200));
        assert_eq!(entries[0].method, "GET");
        assert!(entries[0].timing_ms.is_some());
        assert!(entries[0].error.is_none());
    }

    #[tokio::test]
    async fn unknown_response_ids_are_ignored() {
        let buffers = EventBuffers::new(10, 10);
        let response: cdp_network::EventResponseReceived = serde_json::from_value(serde_json::json!({
            "requestId": "never-seen",
            "loaderId": "loader-1",
            "timestamp": 1.5,
            "type": "XHR",
            "response": {
                "url": "http://localhost:3000/",
                "status": 404,
                "statusText": "Not Found",
                "headers": {},
                "mimeType": "text/html",
                "charset": "utf-8",
                "connectionReused": false,
                "connectionId": 1.0,
                "encodedDataLength": 10.0,
                "securityState": "secure",
            },
            "hasExtraInfo": false,
        }))
        .unwrap();
        buffers.on_response_received(&response).await;
        assert_eq!(buffers.network_len().await, 0);
    }

    #[tokio::test]
    async fn loading_failed_records_error_without_status() {
        let buffers = EventBuffers::new(10, 10);
        let request: cdp_network::EventRequestWillBeSent = serde_json::from_value(serde_json::json!({
            "requestId": "req-2",
            "loaderId": "loader-1",
            "documentURL": "http://localhost:3000/",
            "request": {
                "url": "http://localhost:3000/api/down",
                "method": "POST",
                "headers": {},
                "initialPriority": "High",
                "referrerPolicy": "no-referrer",
            },
            "timestamp": 1.0,
            "wallTime": 1.0,
            "initiator": {"type": "script"},
            "redirectHasExtraInfo": false,
        }))
        .unwrap();
        buffers.on_request_will_be_sent(&request).await;

        let failed: cdp_network::EventLoadingFailed = serde_json::from_value(serde_json::json!({
            "requestId": "req-2",
            "timestamp": 2.0,
            "type": "XHR",
            "errorText": "net::ERR_CONNECTION_REFUSED",
            "canceled": false,
        }))
        .unwrap();
        buffers.on_loading_failed(&failed).await;

        let entries = buffers.drain_network().await;
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].status, None);
        assert_eq!(
            entries[0].error.as_deref(),
            Some("net::ERR_CONNECTION_REFUSED")
        );
    }

    #[tokio::test]
    async fn sweep_only_evicts_old_entries() {
        let buffers = EventBuffers::new(10, 10);
        let request: cdp_network::EventRequestWillBeSent = serde_json::from_value(serde_json::json!({
            "requestId": "fresh",
            "loaderId": "loader-1",
            "documentURL": "http://localhost:3000/",
            "request": {
                "url": "http://localhost:3000/stream",
                "method": "GET",
                "headers": {},
                "initialPriority": "High",
                "referrerPolicy": "no-referrer",
            },
            "timestamp": 1.0,
            "wallTime": 1.0,
            "initiator": {"type": "script"},
            "redirectHasExtraInfo": false,
        }))
        .unwrap();
        buffers.on_request_will_be_sent(&request).await;
        assert_eq!(buffers.sweep_stale_pending().await, 0);
        assert_eq!(buffers.pending_len().await, 1);
    }
}
