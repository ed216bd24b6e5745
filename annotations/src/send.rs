//! The send rendezvous: a single-slot handoff between the overlay's Send
//! button and a tool call waiting on the agent side.
//!
//! At most one waiter exists at a time; a newer waiter cancels the previous
//! one. A send with nobody waiting sets a latch so the next wait resolves
//! immediately. Independently of the waiter, every send marks a sent-seen
//! flag that `consume_sent_state` reads out exactly once.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::sync::oneshot;

/// Upper bound on how long a caller may park on `wait_for_send`.
pub const MAX_WAIT_MS: u64 = 600_000;

#[derive(Default)]
struct SendState {
    waiter: Option<(u64, oneshot::Sender<bool>)>,
    next_generation: u64,
    latched: bool,
    sent_seen: bool,
}

#[derive(Default)]
pub struct SendRendezvous {
    state: Mutex<SendState>,
}

impl SendRendezvous {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park until a send arrives or `timeout_ms` elapses. Returns whether a
    /// send triggered the wakeup. Installing a new waiter cancels any
    /// previous one (it resolves as not-triggered).
    pub async fn wait_for_send(&self, timeout_ms: u64) -> bool {
        let (generation, rx) = {
            let mut state = self.state.lock().await;
            if state.latched {
                state.latched = false;
                return true;
            }
            if let Some((_, previous)) = state.waiter.take() {
                let _ = previous.send(false);
            }
            let (tx, rx) = oneshot::channel();
            state.next_generation += 1;
            let generation = state.next_generation;
            state.waiter = Some((generation, tx));
            (generation, rx)
        };

        let timeout = Duration::from_millis(timeout_ms.min(MAX_WAIT_MS));
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(triggered)) => triggered,
            // Sender dropped without resolving; treat as cancellation.
            Ok(Err(_)) => false,
            Err(_) => {
                // Timer fired first. Remove our waiter if it is still the
                // installed one, so a later send latches instead of waking a
                // dead receiver.
                let mut state = self.state.lock().await;
                if state.waiter.as_ref().map(|(g, _)| *g) == Some(generation) {
                    state.waiter = None;
                }
                false
            }
        }
    }

    /// A user clicked Send: wake the waiter if there is one, latch otherwise,
    /// and mark the sent-seen flag either way.
    pub async fn trigger(&self) {
        let mut state = self.state.lock().await;
        state.sent_seen = true;
        match state.waiter.take() {
            Some((_, waiter)) => {
                let _ = waiter.send(true);
            }
            None => state.latched = true,
        }
    }

    /// One-shot: true on the first call after a send, false until the next.
    pub async fn consume_sent_state(&self) -> bool {
        let mut state = self.state.lock().await;
        std::mem::take(&mut state.sent_seen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn latched_send_resolves_the_next_wait_immediately() {
        let rendezvous = SendRendezvous::new();
        rendezvous.trigger().await;

        let start = Instant::now();
        assert!(rendezvous.wait_for_send(5_000).await);
        assert!(start.elapsed() < Duration::from_millis(100));

        assert!(rendezvous.consume_sent_state().await);
        assert!(!rendezvous.consume_sent_state().await);
    }

    #[tokio::test]
    async fn wait_times_out_as_not_triggered() {
        let rendezvous = SendRendezvous::new();
        let start = Instant::now();
        assert!(!rendezvous.wait_for_send(50).await);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(45), "elapsed {elapsed:?}");
        assert!(!rendezvous.consume_sent_state().await);
    }

    #[tokio::test]
    async fn send_wakes_an_active_waiter() {
        let rendezvous = Arc::new(SendRendezvous::new());
        let waiter = {
            let rendezvous = Arc::clone(&rendezvous);
            tokio::spawn(async move { rendezvous.wait_for_send(5_000).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        rendezvous.trigger().await;
        assert!(waiter.await.unwrap());
        assert!(rendezvous.consume_sent_state().await);
    }

    #[tokio::test]
    async fn a_new_waiter_cancels_the_previous_one() {
        let rendezvous = Arc::new(SendRendezvous::new());
        let first = {
            let rendezvous = Arc::clone(&rendezvous);
            tokio::spawn(async move { rendezvous.wait_for_send(5_000).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let second = {
            let rendezvous = Arc::clone(&rendezvous);
            tokio::spawn(async move { rendezvous.wait_for_send(5_000).await })
        };
        // The first waiter resolves as not-triggered once displaced.
        assert!(!first.await.unwrap());

        rendezvous.trigger().await;
        assert!(second.await.unwrap());
    }

    #[tokio::test]
    async fn send_after_timeout_latches_for_the_next_wait() {
        let rendezvous = SendRendezvous::new();
        assert!(!rendezvous.wait_for_send(10).await);
        rendezvous.trigger().await;
        assert!(rendezvous.wait_for_send(10).await);
    }
}
