//! Loopback HTTP service consumed by the in-page overlay.
//!
//! Routing is a plain method + path match over hyper's HTTP/1.1 connection
//! handler. The service starts lazily (first overlay injection) and survives
//! browser reconnects; only explicit shutdown stops it.

use std::convert::Infallible;
use std::sync::Arc;

use futures::future::BoxFuture;
use http_body_util::BodyExt;
use http_body_util::Full as BodyFull;
use http_body_util::Limited;
use hyper::Method;
use hyper::Request;
use hyper::Response;
use hyper::StatusCode;
use hyper::body::Bytes;
use hyper::body::Incoming;
use hyper::header;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use serde_json::Value;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::warn;
use url::Url;
use uuid::Uuid;

use crate::AnnotationError;
use crate::Result;
use crate::send::SendRendezvous;
use crate::store::AnnotationStore;
use crate::store::CreateRequest;
use crate::store::PatchRequest;
use crate::types::Annotation;
use crate::types::ElementRect;

pub const MAX_BODY_BYTES: usize = 64 * 1024;
const PORT_PROBE_RANGE: u16 = 4;
const NEUTRAL_ORIGIN: &str = "http://localhost";

/// Captures a clipped screenshot for a freshly created annotation and
/// returns it as a data URL.
pub type ScreenshotFn = Box<
    dyn Fn(ElementRect) -> BoxFuture<'static, std::result::Result<String, String>> + Send + Sync,
>;

/// Fired on every overlay send with the number of open annotations.
pub type SendNotifyFn = Box<dyn Fn(usize) + Send + Sync>;

struct ServerRuntime {
    port: u16,
    accept_task: JoinHandle<()>,
}

pub struct AnnotationService {
    base_port: u16,
    store: AnnotationStore,
    send: SendRendezvous,
    screenshot: RwLock<Option<ScreenshotFn>>,
    send_notify: RwLock<Option<SendNotifyFn>>,
    runtime: Mutex<Option<ServerRuntime>>,
}

impl AnnotationService {
    pub fn new(base_port: u16) -> Arc<Self> {
        Arc::new(Self {
            base_port,
            store: AnnotationStore::new(),
            send: SendRendezvous::new(),
            screenshot: RwLock::new(None),
            send_notify: RwLock::new(None),
            runtime: Mutex::new(None),
        })
    }

    pub async fn set_on_screenshot(&self, callback: ScreenshotFn) {
        *self.screenshot.write().await = Some(callback);
    }

    pub async fn set_on_send_notify(&self, callback: SendNotifyFn) {
        *self.send_notify.write().await = Some(callback);
    }

    /// Bind the base port or the next three consecutive ones, then start
    /// serving. Idempotent: a running service just reports its port.
    pub async fn start(self: &Arc<Self>) -> Result<u16> {
        let mut runtime = self.runtime.lock().await;
        if let Some(running) = runtime.as_ref() {
            return Ok(running.port);
        }

        let (listener, port) = bind_first_free(self.base_port).await?;
        let service = Arc::clone(self);
        let accept_task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!("annotation service accept error: {e}");
                        continue;
                    }
                };
                let io = TokioIo::new(stream);
                let service = Arc::clone(&service);
                tokio::spawn(async move {
                    let handler = service_fn(move |req| {
                        let service = Arc::clone(&service);
                        async move { handle_request(req, service).await }
                    });
                    if let Err(err) = http1::Builder::new().serve_connection(io, handler).await {
                        debug!("annotation connection error: {err}");
                    }
                });
            }
        });

        *runtime = Some(ServerRuntime { port, accept_task });
        info!("annotation service listening on 127.0.0.1:{port}");
        Ok(port)
    }

    pub async fn port(&self) -> Option<u16> {
        self.runtime.lock().await.as_ref().map(|r| r.port)
    }

    pub async fn shutdown(&self) {
        if let Some(runtime) = self.runtime.lock().await.take() {
            runtime.accept_task.abort();
            info!("annotation service stopped");
        }
    }

    // Entity accessors used by the tool surface.

    pub async fn annotations(&self) -> Vec<Annotation> {
        self.store.list().await
    }

    pub async fn open_annotations(&self) -> Vec<Annotation> {
        self.store.open().await
    }

    pub async fn annotation(&self, id: Uuid) -> Option<Annotation> {
        self.store.get(id).await
    }

    pub async fn resolve(&self, id: Uuid) -> Result<Annotation> {
        self.store.resolve(id).await
    }

    pub async fn delete(&self, id: Uuid) -> bool {
        self.store.delete(id).await
    }

    pub async fn wait_for_send(&self, timeout_ms: u64) -> bool {
        self.send.wait_for_send(timeout_ms).await
    }

    pub async fn consume_sent_state(&self) -> bool {
        self.send.consume_sent_state().await
    }

    async fn capture_screenshot(&self, rect: ElementRect) -> Option<String> {
        if !rect.is_capturable() {
            return None;
        }
        let fut = {
            let guard = self.screenshot.read().await;
            guard.as_ref().map(|cb| cb(rect))
        };
        match fut {
            None => None,
            Some(fut) => match fut.await {
                Ok(data_url) => Some(data_url),
                Err(e) => {
                    warn!("screenshot capture failed, storing annotation without one: {e}");
                    None
                }
            },
        }
    }

    async fn handle_create(&self, body: &Value) -> Result<Annotation> {
        let request = CreateRequest::decode(body)?;
        let screenshot = match request.element_rect {
            Some(rect) => self.capture_screenshot(rect).await,
            None => None,
        };
        self.store.create(request, screenshot).await
    }

    async fn handle_send(&self) {
        let open = self.store.open_count().await;
        self.send.trigger().await;
        let guard = self.send_notify.read().await;
        if let Some(notify) = guard.as_ref() {
            notify(open);
        }
    }
}

async fn bind_first_free(base_port: u16) -> Result<(TcpListener, u16)> {
    let mut last_error = None;
    for offset in 0..PORT_PROBE_RANGE {
        let port = base_port + offset;
        match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => {
                if offset > 0 {
                    debug!("port {base_port} busy, bound {port} instead");
                }
                return Ok((listener, port));
            }
            Err(e) => last_error = Some(e),
        }
    }
    Err(AnnotationError::Bind(format!(
        "ports {base_port}..={} all in use: {}",
        base_port + PORT_PROBE_RANGE - 1,
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}

/// CORS gate: echo the origin back iff it is an absolute http(s) URL on a
/// loopback host. Everything else gets no allowance.
pub fn allowed_origin(origin: Option<&str>) -> Option<String> {
    let origin = origin?;
    let url = Url::parse(origin).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    let host = url.host_str()?;
    if matches!(host, "localhost" | "127.0.0.1" | "::1" | "[::1]") {
        Some(origin.to_string())
    } else {
        None
    }
}

async fn handle_request(
    req: Request<Incoming>,
    service: Arc<AnnotationService>,
) -> std::result::Result<Response<BodyFull<Bytes>>, Infallible> {
    let origin = req
        .headers()
        .get(header::ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let allow_origin =
        allowed_origin(origin.as_deref()).unwrap_or_else(|| NEUTRAL_ORIGIN.to_string());

    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let (status, body) = if method == Method::OPTIONS {
        (StatusCode::NO_CONTENT, None)
    } else {
        let (status, value) = route(&method, &path, req, &service).await;
        (status, Some(value))
    };

    let mut builder = Response::builder()
        .status(status)
        .header(header::VARY, "Origin")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, allow_origin);
    if method == Method::OPTIONS {
        builder = builder
            .header(
                header::ACCESS_CONTROL_ALLOW_METHODS,
                "GET, POST, PATCH, DELETE, OPTIONS",
            )
            .header(header::ACCESS_CONTROL_ALLOW_HEADERS, "Content-Type");
    }

    let bytes = match body {
        Some(value) => {
            builder = builder.header(header::CONTENT_TYPE, "application/json");
            Bytes::from(value.to_string())
        }
        None => Bytes::new(),
    };

    let response = builder
        .body(BodyFull::new(bytes))
        .unwrap_or_else(|_| Response::new(BodyFull::new(Bytes::new())));
    Ok(response)
}

async fn route(
    method: &Method,
    path: &str,
    req: Request<Incoming>,
    service: &Arc<AnnotationService>,
) -> (StatusCode, Value) {
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();

    match (method.as_str(), segments.as_slice()) {
        ("GET", [""]) => {
            let count = service.store.len().await;
            let port = service.port().await.unwrap_or(service.base_port);
            (
                StatusCode::OK,
                json!({"status": "ok", "count": count, "port": port}),
            )
        }

        ("GET", ["annotations"]) => {
            let annotations = service.annotations().await;
            match serde_json::to_value(&annotations) {
                Ok(value) => (StatusCode::OK, value),
                Err(e) => internal_error(e),
            }
        }

        ("POST", ["annotations"]) => match read_json_body(req).await {
            Err(e) => error_response(e),
            Ok(body) => match service.handle_create(&body).await {
                Ok(annotation) => (StatusCode::CREATED, json!({"id": annotation.id})),
                Err(e) => error_response(e),
            },
        },

        ("POST", ["annotations", "send"]) => {
            service.handle_send().await;
            (StatusCode::OK, json!({"success": true}))
        }

        ("POST", ["annotations", id, "resolve"]) => match parse_id(id) {
            None => error_response(AnnotationError::NotFound),
            Some(id) => match service.resolve(id).await {
                Ok(annotation) => annotation_json(annotation),
                Err(e) => error_response(e),
            },
        },

        ("PATCH", ["annotations", id]) => match parse_id(id) {
            None => error_response(AnnotationError::NotFound),
            Some(id) => match read_json_body(req).await {
                Err(e) => error_response(e),
                Ok(body) => match PatchRequest::decode(&body) {
                    Err(e) => error_response(e),
                    Ok(patch) => match service.store.patch(id, patch).await {
                        Ok(annotation) => annotation_json(annotation),
                        Err(e) => error_response(e),
                    },
                },
            },
        },

        ("DELETE", ["annotations", id]) => match parse_id(id) {
            None => error_response(AnnotationError::NotFound),
            Some(id) => {
                if service.delete(id).await {
                    (StatusCode::OK, json!({"success": true}))
                } else {
                    error_response(AnnotationError::NotFound)
                }
            }
        },

        ("DELETE", ["annotations"]) => {
            let deleted = service.store.clear().await;
            (StatusCode::OK, json!({"success": true, "deleted": deleted}))
        }

        _ => (StatusCode::NOT_FOUND, json!({"error": "Not found"})),
    }
}

fn parse_id(raw: &str) -> Option<Uuid> {
    Uuid::parse_str(raw).ok()
}

fn annotation_json(annotation: Annotation) -> (StatusCode, Value) {
    match serde_json::to_value(&annotation) {
        Ok(value) => (StatusCode::OK, value),
        Err(e) => internal_error(e),
    }
}

fn internal_error(e: serde_json::Error) -> (StatusCode, Value) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({"error": e.to_string()}),
    )
}

fn error_response(error: AnnotationError) -> (StatusCode, Value) {
    let status = match &error {
        AnnotationError::BadRequest(_) => StatusCode::BAD_REQUEST,
        AnnotationError::QuotaExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        AnnotationError::NotFound => StatusCode::NOT_FOUND,
        AnnotationError::Bind(_) | AnnotationError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, json!({"error": error.to_string()}))
}

/// Read the request body under the 64 KiB cap and parse it as JSON. An empty
/// body decodes as null for the routes that take none.
async fn read_json_body(req: Request<Incoming>) -> Result<Value> {
    let limited = Limited::new(req.into_body(), MAX_BODY_BYTES);
    let collected = limited
        .collect()
        .await
        .map_err(|e| AnnotationError::BadRequest(format!("body rejected: {e}")))?;
    let bytes = collected.to_bytes();
    if bytes.is_empty() {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes)
        .map_err(|e| AnnotationError::BadRequest(format!("invalid JSON body: {e}")))
}
