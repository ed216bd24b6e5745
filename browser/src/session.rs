//! Browser-control session manager.
//!
//! Nothing connects until the first tool call. `ensure_connected` runs a
//! fast-path / liveness / reconnect cascade; concurrent callers collapse onto
//! one in-flight connect. A disconnect tears the session down but never
//! auto-reconnects; the next call pays for the reconnect.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chromiumoxide::Browser;
use chromiumoxide::cdp::browser_protocol::dom as cdp_dom;
use chromiumoxide::cdp::browser_protocol::log as cdp_log;
use chromiumoxide::cdp::browser_protocol::network as cdp_network;
use chromiumoxide::cdp::browser_protocol::page as cdp_page;
use chromiumoxide::cdp::js_protocol::runtime as cdp_runtime;
use chromiumoxide::page::Page as CdpPage;
use futures::StreamExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio::time::sleep;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use tracing::warn;

use pagebridge_common::Config;

use crate::BrowserError;
use crate::Result;
use crate::chrome;
use crate::events::EventBuffers;
use crate::events::PENDING_SWEEP_INTERVAL;
use crate::targets;
use crate::targets::PageTarget;

const SESSION_FRESH_WINDOW: Duration = Duration::from_secs(30);
const LIVENESS_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const EVALUATE_TIMEOUT_MS: u64 = 10_000;
const NAVIGATION_SETTLE_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_BACKOFF_BASE: Duration = Duration::from_millis(500);
const CONNECT_BACKOFF_CAP: Duration = Duration::from_secs(10);
const TARGET_POLL_INTERVAL: Duration = Duration::from_millis(300);

/// Page hook fired on connect and after every page load. Errors are logged,
/// never propagated.
pub type PageHook =
    Box<dyn Fn(CdpPage) -> BoxFuture<'static, std::result::Result<(), String>> + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    pub target_id: Option<String>,
    pub url_pattern: Option<String>,
    pub wait_ms: Option<u64>,
}

#[derive(Debug, Clone)]
enum TargetPreference {
    Id(String),
    UrlPattern(String),
}

struct Session {
    browser: Browser,
    page: CdpPage,
    target: PageTarget,
    generation: u64,
    handler_task: JoinHandle<()>,
    listener_tasks: Vec<JoinHandle<()>>,
}

struct Hooks {
    on_connect: RwLock<Option<PageHook>>,
    on_navigate: RwLock<Option<PageHook>>,
}

pub struct SessionManager {
    config: Config,
    session: Arc<Mutex<Option<Session>>>,
    /// Serializes the slow connect path so concurrent callers share one
    /// in-flight attempt.
    connect_gate: Mutex<()>,
    last_ok: Mutex<Option<Instant>>,
    preference: Mutex<Option<TargetPreference>>,
    buffers: Arc<EventBuffers>,
    sweep_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    hooks: Arc<Hooks>,
    pid_swept: AtomicBool,
    generation: AtomicU64,
}

impl SessionManager {
    pub fn new(config: Config) -> Arc<Self> {
        let buffers = EventBuffers::new(config.console_buffer, config.network_buffer);
        Arc::new(Self {
            config,
            session: Arc::new(Mutex::new(None)),
            connect_gate: Mutex::new(()),
            last_ok: Mutex::new(None),
            preference: Mutex::new(None),
            buffers,
            sweep_task: Arc::new(Mutex::new(None)),
            hooks: Arc::new(Hooks {
                on_connect: RwLock::new(None),
                on_navigate: RwLock::new(None),
            }),
            pid_swept: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn buffers(&self) -> Arc<EventBuffers> {
        Arc::clone(&self.buffers)
    }

    pub async fn set_on_connect(&self, hook: PageHook) {
        *self.hooks.on_connect.write().await = Some(hook);
    }

    pub async fn set_on_navigate(&self, hook: PageHook) {
        *self.hooks.on_navigate.write().await = Some(hook);
    }

    /// Passive: reports whether a session currently exists, without probing
    /// or reconnecting.
    pub async fn is_connected(&self) -> bool {
        self.session.lock().await.is_some()
    }

    pub async fn current_target(&self) -> Option<PageTarget> {
        self.session
            .lock()
            .await
            .as_ref()
            .map(|s| s.target.clone())
    }

    async fn mark_ok(&self) {
        *self.last_ok.lock().await = Some(Instant::now());
    }

    /// Fast path / liveness cascade, then connect with retries.
    pub async fn ensure_connected(&self) -> Result<CdpPage> {
        if let Some(page) = self.fresh_or_probed_page().await {
            return Ok(page);
        }

        let _gate = self.connect_gate.lock().await;
        // A concurrent caller may have connected while we waited on the gate.
        if let Some(page) = self.fresh_or_probed_page().await {
            return Ok(page);
        }

        self.connect_with_retries().await?;
        let page = self
            .session
            .lock()
            .await
            .as_ref()
            .map(|s| s.page.clone())
            .ok_or_else(|| BrowserError::SessionLost("session vanished after connect".into()))?;
        Ok(page)
    }

    /// Returns the live page if the session is fresh (successful round-trip
    /// within the last 30 s) or still answers a cheap probe. Tears the
    /// session down when the probe fails.
    async fn fresh_or_probed_page(&self) -> Option<CdpPage> {
        let (page, probe_target) = {
            let guard = self.session.lock().await;
            let session = guard.as_ref()?;
            let fresh = self
                .last_ok
                .lock()
                .await
                .map(|t| t.elapsed() < SESSION_FRESH_WINDOW)
                .unwrap_or(false);
            if fresh {
                return Some(session.page.clone());
            }
            (session.page.clone(), session.target.id.clone())
        };

        debug!("session stale, probing liveness of target {probe_target}");
        let probe = timeout(LIVENESS_PROBE_TIMEOUT, page.evaluate("1")).await;
        match probe {
            Ok(Ok(_)) => {
                self.mark_ok().await;
                Some(page)
            }
            _ => {
                info!("liveness probe failed, discarding session");
                self.teardown().await;
                None
            }
        }
    }

    async fn connect_with_retries(&self) -> Result<()> {
        // Crash-recovery sweep, once per process lifetime.
        if !self.pid_swept.swap(true, Ordering::SeqCst) && self.config.ws_url.is_none() {
            chrome::sweep_stale_pid_file(self.config.debug_port).await;
        }

        let mut last_err = BrowserError::Unreachable("no connect attempt made".into());
        for attempt in 1..=CONNECT_ATTEMPTS {
            if attempt > 1 {
                let backoff = CONNECT_BACKOFF_BASE * 2u32.pow(attempt - 2);
                sleep(backoff.min(CONNECT_BACKOFF_CAP)).await;
            }
            match self.connect_once().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("connect attempt {attempt}/{CONNECT_ATTEMPTS} failed: {e}");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn connect_once(&self) -> Result<()> {
        let (browser, mut handler) = if let Some(ws) = &self.config.ws_url {
            // Direct WebSocket override: no discovery, no launch fallback.
            info!("connecting to browser via configured WebSocket {ws}");
            Browser::connect(ws.clone()).await?
        } else {
            let host = &self.config.debug_host;
            let port = self.config.debug_port;
            let ws = match targets::discover_ws_url(host, port).await {
                Ok(ws) => ws,
                Err(discover_err) if self.config.auto_launch => {
                    info!("discovery failed ({discover_err}), auto-launching browser");
                    let executable =
                        chrome::locate(self.config.chrome_path.as_deref()).ok_or_else(|| {
                            BrowserError::Unreachable(
                                "no browser executable found; set the browser path override"
                                    .into(),
                            )
                        })?;
                    let handle =
                        chrome::launch(&executable, host, port, self.config.launch_url.as_deref())
                            .await?;
                    chrome::write_pid_file(port, handle.pid)?;
                    targets::discover_ws_url(host, port).await?
                }
                Err(discover_err) => return Err(discover_err),
            };
            Browser::connect(ws).await?
        };

        let target = self.select_target(&browser).await?;
        let page = self.page_for_target(&browser, &target).await?;

        // Enable the domains we consume events from, in parallel.
        tokio::try_join!(
            page.execute(cdp_runtime::EnableParams::default()),
            page.execute(cdp_network::EnableParams::default()),
            page.execute(cdp_dom::EnableParams::default()),
            page.execute(cdp_page::EnableParams::default()),
            page.execute(cdp_log::EnableParams::default()),
        )?;

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let listener_tasks = self.spawn_event_listeners(&page).await?;

        let session_slot = Arc::clone(&self.session);
        let buffers = Arc::clone(&self.buffers);
        let sweep_slot = Arc::clone(&self.sweep_task);
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
            info!("browser connection closed");
            let mut guard = session_slot.lock().await;
            if guard.as_ref().map(|s| s.generation) == Some(generation) {
                if let Some(session) = guard.take() {
                    for task in session.listener_tasks {
                        task.abort();
                    }
                }
                drop(guard);
                buffers.clear_pending().await;
                if let Some(task) = sweep_slot.lock().await.take() {
                    task.abort();
                }
            }
        });

        {
            let mut guard = self.session.lock().await;
            *guard = Some(Session {
                browser,
                page: page.clone(),
                target: target.clone(),
                generation,
                handler_task,
                listener_tasks,
            });
        }
        self.start_pending_sweep().await;
        self.mark_ok().await;
        info!("connected to page target {} ({})", target.id, target.url);

        self.fire_hook(&self.hooks.on_connect, page).await;
        Ok(())
    }

    async fn select_target(&self, browser: &Browser) -> Result<PageTarget> {
        let targets = self.list_targets_via(browser).await?;
        let preference = self.preference.lock().await.clone();
        let chosen = match &preference {
            Some(TargetPreference::Id(id)) => targets
                .iter()
                .find(|t| t.is_page() && t.id == *id)
                .ok_or_else(|| BrowserError::TargetNotFound(format!("no target with id {id}")))?,
            Some(TargetPreference::UrlPattern(pattern)) => {
                targets::choose_matching_target(&targets, pattern).ok_or_else(|| {
                    BrowserError::TargetNotFound(format!("no target matching {pattern:?}"))
                })?
            }
            None => targets::choose_default_target(&targets).ok_or_else(|| {
                BrowserError::TargetNotFound("browser reports no page targets".into())
            })?,
        };
        Ok(chosen.clone())
    }

    async fn page_for_target(&self, browser: &Browser, target: &PageTarget) -> Result<CdpPage> {
        let pages = browser.pages().await?;
        for page in pages {
            if page.target_id().inner() == &target.id {
                return Ok(page);
            }
        }
        Err(BrowserError::TargetNotFound(format!(
            "target {} disappeared before attach",
            target.id
        )))
    }

    /// Target listing: over the HTTP inspection endpoint normally, from the
    /// live connection when a direct WebSocket URL is configured.
    async fn list_targets_via(&self, browser: &Browser) -> Result<Vec<PageTarget>> {
        if self.config.ws_url.is_none() {
            return targets::list_targets(&self.config.debug_host, self.config.debug_port).await;
        }
        let mut out = Vec::new();
        for page in browser.pages().await? {
            let url = page.url().await?.unwrap_or_default();
            let title = page.get_title().await.ok().flatten().unwrap_or_default();
            out.push(PageTarget {
                id: page.target_id().inner().clone(),
                title,
                kind: "page".to_string(),
                url,
            });
        }
        Ok(out)
    }

    async fn spawn_event_listeners(&self, page: &CdpPage) -> Result<Vec<JoinHandle<()>>> {
        let mut tasks = Vec::new();

        let buffers = Arc::clone(&self.buffers);
        let mut console_events = page
            .event_listener::<cdp_runtime::EventConsoleApiCalled>()
            .await?;
        tasks.push(tokio::spawn(async move {
            while let Some(event) = console_events.next().await {
                buffers.on_console_api(&event).await;
            }
        }));

        let buffers = Arc::clone(&self.buffers);
        let mut log_events = page.event_listener::<cdp_log::EventEntryAdded>().await?;
        tasks.push(tokio::spawn(async move {
            while let Some(event) = log_events.next().await {
                buffers.on_log_entry(&event).await;
            }
        }));

        let buffers = Arc::clone(&self.buffers);
        let mut request_events = page
            .event_listener::<cdp_network::EventRequestWillBeSent>()
            .await?;
        tasks.push(tokio::spawn(async move {
            while let Some(event) = request_events.next().await {
                buffers.on_request_will_be_sent(&event).await;
            }
        }));

        let buffers = Arc::clone(&self.buffers);
        let mut response_events = page
            .event_listener::<cdp_network::EventResponseReceived>()
            .await?;
        tasks.push(tokio::spawn(async move {
            while let Some(event) = response_events.next().await {
                buffers.on_response_received(&event).await;
            }
        }));

        let buffers = Arc::clone(&self.buffers);
        let mut failed_events = page
            .event_listener::<cdp_network::EventLoadingFailed>()
            .await?;
        tasks.push(tokio::spawn(async move {
            while let Some(event) = failed_events.next().await {
                buffers.on_loading_failed(&event).await;
            }
        }));

        let hooks = Arc::clone(&self.hooks);
        let hook_page = page.clone();
        let mut load_events = page
            .event_listener::<cdp_page::EventLoadEventFired>()
            .await?;
        tasks.push(tokio::spawn(async move {
            while let Some(_event) = load_events.next().await {
                let fut = {
                    let guard = hooks.on_navigate.read().await;
                    guard.as_ref().map(|hook| hook(hook_page.clone()))
                };
                if let Some(fut) = fut {
                    if let Err(e) = fut.await {
                        warn!("navigation hook failed: {e}");
                    }
                }
            }
        }));

        Ok(tasks)
    }

    async fn start_pending_sweep(&self) {
        let mut slot = self.sweep_task.lock().await;
        if let Some(task) = slot.take() {
            task.abort();
        }
        let buffers = Arc::clone(&self.buffers);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PENDING_SWEEP_INTERVAL);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let evicted = buffers.sweep_stale_pending().await;
                if evicted > 0 {
                    debug!("evicted {evicted} stale pending requests");
                }
            }
        }));
    }

    async fn fire_hook(&self, slot: &RwLock<Option<PageHook>>, page: CdpPage) {
        let fut = {
            let guard = slot.read().await;
            guard.as_ref().map(|hook| hook(page))
        };
        if let Some(fut) = fut {
            if let Err(e) = fut.await {
                warn!("connection hook failed: {e}");
            }
        }
    }

    /// Select (or wait for) a specific page target, remember the preference
    /// for future reconnects, and reconnect to it.
    pub async fn connect_to_page(&self, options: ConnectOptions) -> Result<PageTarget> {
        // Make sure a browser exists at all before polling for targets.
        self.ensure_connected().await?;

        let wait = Duration::from_millis(options.wait_ms.unwrap_or(0));
        let deadline = Instant::now() + wait;
        let poll = TARGET_POLL_INTERVAL.min(wait.max(Duration::from_millis(1)));

        let matched = loop {
            let targets = if self.config.ws_url.is_none() {
                targets::list_targets(&self.config.debug_host, self.config.debug_port).await?
            } else {
                let guard = self.session.lock().await;
                match guard.as_ref() {
                    Some(session) => self.list_targets_via(&session.browser).await?,
                    None => Vec::new(),
                }
            };
            let found = if let Some(id) = &options.target_id {
                targets.iter().find(|t| t.is_page() && t.id == *id).cloned()
            } else if let Some(pattern) = &options.url_pattern {
                targets::choose_matching_target(&targets, pattern).cloned()
            } else {
                targets::choose_default_target(&targets).cloned()
            };
            if let Some(target) = found {
                break target;
            }
            if Instant::now() >= deadline {
                let wanted = options
                    .target_id
                    .clone()
                    .or(options.url_pattern.clone())
                    .unwrap_or_else(|| "default".to_string());
                return Err(BrowserError::TargetNotFound(format!(
                    "no page target matching {wanted:?} within {} ms",
                    wait.as_millis()
                )));
            }
            sleep(poll).await;
        };

        {
            let mut preference = self.preference.lock().await;
            *preference = match (&options.target_id, &options.url_pattern) {
                (Some(id), _) => Some(TargetPreference::Id(id.clone())),
                (None, Some(pattern)) => Some(TargetPreference::UrlPattern(pattern.clone())),
                (None, None) => None,
            };
        }

        self.teardown().await;
        self.ensure_connected().await?;
        Ok(self.current_target().await.unwrap_or(matched))
    }

    // ---- session operations -------------------------------------------------

    /// Evaluate an expression in the page, returning its JSON value. A page
    /// exception is surfaced as [`BrowserError::EvaluationException`].
    pub async fn evaluate(&self, expression: &str) -> Result<Value> {
        let page = self.ensure_connected().await?;
        let params = cdp_runtime::EvaluateParams::builder()
            .expression(expression)
            .return_by_value(true)
            .await_promise(true)
            .build()
            .map_err(BrowserError::CdpError)?;
        let response = timeout(
            Duration::from_millis(EVALUATE_TIMEOUT_MS),
            page.execute(params),
        )
        .await
        .map_err(|_| BrowserError::EvaluationTimeout(EVALUATE_TIMEOUT_MS))?
        .map_err(|e| BrowserError::SessionLost(e.to_string()))?;

        let returns = response.result;
        if let Some(details) = &returns.exception_details {
            return Err(BrowserError::EvaluationException(render_exception(details)));
        }
        self.mark_ok().await;
        Ok(returns.result.value.unwrap_or(Value::Null))
    }

    /// Evaluate without triggering a connect; used for informational pushes
    /// into the overlay. Returns false when no session is live.
    pub async fn evaluate_if_connected(&self, expression: &str) -> bool {
        let page = {
            let guard = self.session.lock().await;
            guard.as_ref().map(|s| s.page.clone())
        };
        let Some(page) = page else {
            return false;
        };
        match page.evaluate(expression).await {
            Ok(_) => {
                self.mark_ok().await;
                true
            }
            Err(e) => {
                debug!("best-effort evaluation failed: {e}");
                false
            }
        }
    }

    pub async fn navigate(&self, url: &str) -> Result<(String, Option<String>)> {
        let page = self.ensure_connected().await?;
        page.goto(url)
            .await
            .map_err(|e| BrowserError::SessionLost(e.to_string()))?;
        let _ = timeout(NAVIGATION_SETTLE_TIMEOUT, page.wait_for_navigation()).await;
        let final_url = page
            .url()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| url.to_string());
        let title = page.get_title().await.ok().flatten();
        self.refresh_target_url(&final_url).await;
        self.mark_ok().await;
        Ok((final_url, title))
    }

    pub async fn reload(&self) -> Result<(String, Option<String>)> {
        let page = self.ensure_connected().await?;
        page.execute(cdp_page::ReloadParams::default())
            .await
            .map_err(|e| BrowserError::SessionLost(e.to_string()))?;
        let _ = timeout(NAVIGATION_SETTLE_TIMEOUT, page.wait_for_navigation()).await;
        let url = page.url().await.ok().flatten().unwrap_or_default();
        let title = page.get_title().await.ok().flatten();
        self.mark_ok().await;
        Ok((url, title))
    }

    async fn refresh_target_url(&self, url: &str) {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_mut() {
            session.target.url = url.to_string();
        }
    }

    /// Viewport screenshot as base64 PNG.
    pub async fn screenshot_viewport(&self) -> Result<String> {
        let page = self.ensure_connected().await?;
        let params = cdp_page::CaptureScreenshotParams::builder()
            .format(cdp_page::CaptureScreenshotFormat::Png)
            .build();
        let response = page
            .execute(params)
            .await
            .map_err(|e| BrowserError::SessionLost(e.to_string()))?;
        self.mark_ok().await;
        let data: &str = response.data.as_ref();
        Ok(data.to_string())
    }

    /// Clipped screenshot as base64 PNG. Used for annotation element shots.
    pub async fn screenshot_clip(&self, x: f64, y: f64, width: f64, height: f64) -> Result<String> {
        let page = self.ensure_connected().await?;
        let params = cdp_page::CaptureScreenshotParams::builder()
            .format(cdp_page::CaptureScreenshotFormat::Png)
            .capture_beyond_viewport(true)
            .clip(cdp_page::Viewport {
                x,
                y,
                width,
                height,
                scale: 1.0,
            })
            .build();
        let response = page
            .execute(params)
            .await
            .map_err(|e| BrowserError::SessionLost(e.to_string()))?;
        self.mark_ok().await;
        let data: &str = response.data.as_ref();
        Ok(data.to_string())
    }

    /// Outer HTML of up to `limit` elements matching a CSS selector.
    pub async fn query_dom(&self, selector: &str, limit: usize) -> Result<Vec<String>> {
        let page = self.ensure_connected().await?;
        let document = page
            .execute(cdp_dom::GetDocumentParams::default())
            .await
            .map_err(|e| BrowserError::SessionLost(e.to_string()))?;
        let root_id = document.root.node_id.clone();
        let query = cdp_dom::QuerySelectorAllParams::builder()
            .node_id(root_id)
            .selector(selector)
            .build()
            .map_err(BrowserError::CdpError)?;
        let nodes = page
            .execute(query)
            .await
            .map_err(|e| BrowserError::SessionLost(e.to_string()))?;

        let mut out = Vec::new();
        for node_id in nodes.node_ids.iter().take(limit) {
            let params = cdp_dom::GetOuterHtmlParams::builder()
                .node_id(node_id.clone())
                .build();
            match page.execute(params).await {
                Ok(html) => out.push(html.outer_html.clone()),
                Err(e) => debug!("outer HTML fetch failed for one node: {e}"),
            }
        }
        self.mark_ok().await;
        Ok(out)
    }

    pub async fn response_body(&self, request_id: &str) -> Result<(String, bool)> {
        let page = self.ensure_connected().await?;
        let params = cdp_network::GetResponseBodyParams::builder()
            .request_id(cdp_network::RequestId::new(request_id))
            .build()
            .map_err(BrowserError::CdpError)?;
        let response = page
            .execute(params)
            .await
            .map_err(|e| BrowserError::CdpError(e.to_string()))?;
        self.mark_ok().await;
        Ok((response.body.clone(), response.base64_encoded))
    }

    pub async fn request_post_data(&self, request_id: &str) -> Result<String> {
        let page = self.ensure_connected().await?;
        let params = cdp_network::GetRequestPostDataParams::builder()
            .request_id(cdp_network::RequestId::new(request_id))
            .build()
            .map_err(BrowserError::CdpError)?;
        let response = page
            .execute(params)
            .await
            .map_err(|e| BrowserError::CdpError(e.to_string()))?;
        self.mark_ok().await;
        Ok(response.post_data.clone())
    }

    // ---- teardown -----------------------------------------------------------

    async fn teardown(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.handler_task.abort();
            for task in session.listener_tasks {
                task.abort();
            }
            // Dropping the Browser closes the WebSocket without closing the
            // browser process itself.
        }
        self.buffers.clear_pending().await;
        if let Some(task) = self.sweep_task.lock().await.take() {
            task.abort();
        }
        *self.last_ok.lock().await = None;
    }

    pub async fn shutdown(&self) {
        self.teardown().await;
        chrome::remove_pid_file(self.config.debug_port);
    }

    /// Last-resort synchronous cleanup, safe to call from an exit handler.
    pub fn shutdown_sync(&self) {
        chrome::remove_pid_file(self.config.debug_port);
    }
}

fn render_exception(details: &cdp_runtime::ExceptionDetails) -> String {
    if let Some(exception) = &details.exception {
        if let Some(description) = &exception.description {
            return description.clone();
        }
        if let Some(value) = &exception.value {
            return value.to_string();
        }
    }
    details.text.clone()
}
