//! Processing-state coordinator.
//!
//! Three states, pushed into the overlay through the page-global setter:
//! `processing` when a send was consumed, `done` on the next tool call that
//! is not itself a send, and `idle` which the overlay reaches on its own
//! after showing the confirmation. Pushes are informational; when no session
//! is live they are skipped silently.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use pagebridge_browser::SessionManager;

fn setter_script(state: &str) -> String {
    format!(
        "if (window.__pagebridgeSetProcessingState) {{ window.__pagebridgeSetProcessingState('{state}'); }}"
    )
}

pub struct ProcessingCoordinator {
    session: Arc<SessionManager>,
    /// True while the overlay shows `processing` from the last consumed send.
    processing: Mutex<bool>,
}

impl ProcessingCoordinator {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self {
            session,
            processing: Mutex::new(false),
        }
    }

    /// A send was consumed this cycle: show `processing` in the overlay.
    pub async fn push_processing(&self) {
        *self.processing.lock().await = true;
        if !self
            .session
            .evaluate_if_connected(&setter_script("processing"))
            .await
        {
            debug!("no session, skipped processing push");
        }
    }

    /// If the previous cycle pushed `processing`, push `done` and return to
    /// idle on the server side. The overlay walks done back to idle itself.
    pub async fn finish_if_processing(&self) {
        let mut processing = self.processing.lock().await;
        if !*processing {
            return;
        }
        *processing = false;
        drop(processing);
        if !self
            .session
            .evaluate_if_connected(&setter_script("done"))
            .await
        {
            debug!("no session, skipped done push");
        }
    }

    #[cfg(test)]
    pub async fn is_processing(&self) -> bool {
        *self.processing.lock().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pagebridge_common::Config;

    #[tokio::test]
    async fn processing_flag_latches_until_finished() {
        let session = SessionManager::new(Config::default());
        let coordinator = ProcessingCoordinator::new(session);
        assert!(!coordinator.is_processing().await);

        // Disconnected pushes still move the server-side marker.
        coordinator.push_processing().await;
        assert!(coordinator.is_processing().await);

        coordinator.finish_if_processing().await;
        assert!(!coordinator.is_processing().await);

        // A second finish is a no-op.
        coordinator.finish_if_processing().await;
        assert!(!coordinator.is_processing().await);
    }

    #[test]
    fn setter_script_guards_the_global() {
        let script = setter_script("done");
        assert!(script.contains("window.__pagebridgeSetProcessingState"));
        assert!(script.contains("'done'"));
    }
}
