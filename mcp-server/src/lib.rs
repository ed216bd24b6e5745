//! Stdio MCP server bridging a coding agent to a live browser: page-script
//! evaluation, buffered console/network telemetry, managed dev-server
//! processes, and pinned in-page feedback flowing back through the annotation
//! service.
//!
//! Startup is lazy: the browser is first contacted when a tool call needs it.
//! Tool failures become error content blocks; nothing that happens inside a
//! tool call may take down the RPC loop.

mod message_processor;
mod outgoing;
mod state;
mod tools;

use std::sync::Arc;

use chromiumoxide::page::Page as CdpPage;
use futures::future::BoxFuture;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tracing::info;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use pagebridge_annotations::AnnotationService;
use pagebridge_browser::SessionManager;
use pagebridge_browser::overlay::build_overlay_script;
use pagebridge_common::Config;
use pagebridge_mcp_types::JSONRPCMessage;
use pagebridge_procman::ProcessManager;

use crate::message_processor::MessageProcessor;
use crate::outgoing::OutgoingMessageSender;
use crate::outgoing::spawn_stdout_writer;
use crate::tools::ToolKit;

pub async fn run_main() -> anyhow::Result<()> {
    // Stdout is reserved for protocol frames; all diagnostics go to stderr.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .or_else(|_| EnvFilter::try_new("info"))
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init();

    let config = Config::from_env()?;
    info!(
        "starting pagebridge (debug {}:{}, annotation base port {})",
        config.debug_host, config.debug_port, config.annotation_port
    );

    let session = SessionManager::new(config.clone());
    let annotations = AnnotationService::new(config.annotation_port);
    let processes = ProcessManager::new(config.server_log_buffer);
    wire_overlay_hooks(&session, &annotations).await;

    let toolkit = ToolKit::new(
        Arc::clone(&session),
        Arc::clone(&annotations),
        Arc::clone(&processes),
    );

    let (outgoing_tx, outgoing_rx) = mpsc::unbounded_channel::<JSONRPCMessage>();
    let writer_task = spawn_stdout_writer(outgoing_rx);
    let outgoing = OutgoingMessageSender::new(outgoing_tx);

    spawn_signal_handler(
        Arc::clone(&session),
        Arc::clone(&annotations),
        Arc::clone(&processes),
    );

    let mut processor = MessageProcessor::new(outgoing, toolkit);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<JSONRPCMessage>(line) {
            Ok(message) => processor.process(message),
            Err(e) => warn!("dropping unparseable frame: {e}"),
        }
    }

    info!("stdin closed, shutting down");
    shutdown_all(&session, &annotations, &processes).await;
    writer_task.abort();
    Ok(())
}

/// Wire the annotation service and session manager together: screenshots are
/// captured through the browser session, and the overlay is injected on
/// connect and after every page load.
async fn wire_overlay_hooks(session: &Arc<SessionManager>, annotations: &Arc<AnnotationService>) {
    let screenshot_session = Arc::clone(session);
    annotations
        .set_on_screenshot(Box::new(move |rect| {
            let session = Arc::clone(&screenshot_session);
            Box::pin(async move {
                let data = session
                    .screenshot_clip(rect.x, rect.y, rect.width, rect.height)
                    .await
                    .map_err(|e| e.to_string())?;
                Ok(format!("data:image/png;base64,{data}"))
            })
        }))
        .await;

    annotations
        .set_on_send_notify(Box::new(|open| {
            info!("overlay send received with {open} open annotation(s)");
        }))
        .await;

    let inject = {
        let annotations = Arc::clone(annotations);
        move |page: CdpPage| -> BoxFuture<'static, Result<(), String>> {
            let annotations = Arc::clone(&annotations);
            Box::pin(async move {
                let port = annotations.start().await.map_err(|e| e.to_string())?;
                let script = build_overlay_script(port);
                page.evaluate(script).await.map_err(|e| e.to_string())?;
                Ok(())
            })
        }
    };
    session.set_on_connect(Box::new(inject.clone())).await;
    session.set_on_navigate(Box::new(inject)).await;
}

fn spawn_signal_handler(
    session: Arc<SessionManager>,
    annotations: Arc<AnnotationService>,
    processes: Arc<ProcessManager>,
) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => {}
                        _ = sigterm.recv() => {}
                    }
                }
                Err(e) => {
                    warn!("could not install SIGTERM handler: {e}");
                    let _ = tokio::signal::ctrl_c().await;
                }
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        info!("signal received, shutting down");
        shutdown_all(&session, &annotations, &processes).await;
        std::process::exit(0);
    });
}

/// Orderly shutdown: managed processes, then the browser session, then the
/// annotation service. The PID file is removed again synchronously at the
/// very end as a last resort.
async fn shutdown_all(
    session: &Arc<SessionManager>,
    annotations: &Arc<AnnotationService>,
    processes: &Arc<ProcessManager>,
) {
    processes.stop_all().await;
    session.shutdown().await;
    annotations.shutdown().await;
    session.shutdown_sync();
}
