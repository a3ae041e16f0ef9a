//! Client admission, bookkeeping, and the idle-shutdown scheduler.
//!
//! The manager owns the set of connected clients and the single idle timer.
//! The process is idle when no clients are connected and no sessions are
//! running; sustaining that for the grace period fires the idle sink. The
//! sink is injected so the library never calls `exit` in tests.

use axum::extract::ws::{close_code, CloseFrame, Message};
use common::protocol::{ServerFrame, ServerMessage};
use common::store::{SessionStore, StoreEvent};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// Grace period the process must stay idle before it exits.
pub const IDLE_GRACE: Duration = Duration::from_secs(5);

const SHUTDOWN_REASON: &str = "server shutting down";

/// Called when the idle grace period elapses with nothing to do.
pub type IdleSink = Arc<dyn Fn() + Send + Sync>;

struct ClientHandle {
    outbound: mpsc::Sender<Message>,
}

pub struct SessionManager {
    store: Arc<SessionStore>,
    clients: DashMap<String, ClientHandle>,
    max_clients: usize,
    idle_grace: Duration,
    idle_timer: Mutex<Option<JoinHandle<()>>>,
    idle_sink: IdleSink,
    shutting_down: AtomicBool,
}

impl SessionManager {
    pub fn new(
        store: Arc<SessionStore>,
        max_clients: usize,
        idle_grace: Duration,
        idle_sink: IdleSink,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            clients: DashMap::new(),
            max_clients,
            idle_grace,
            idle_timer: Mutex::new(None),
            idle_sink,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Fan store lifecycle signals into the idle scheduler and client pushes.
    pub fn spawn_store_listener(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let mut events = self.store.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(StoreEvent::Active) => manager.cancel_idle(),
                    Ok(StoreEvent::Idle) => manager.check_idle(),
                    Ok(StoreEvent::SessionRemoved(id)) => {
                        let frame = ServerFrame::push(ServerMessage::SessionRemoved { id });
                        if let Some(json) = frame.to_json() {
                            manager.broadcast_text(json).await;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Admit a new client unless the cap is reached or we are shutting down.
    /// Admission cancels any pending idle timer.
    pub fn try_admit(&self, client_id: &str, outbound: mpsc::Sender<Message>) -> bool {
        if self.shutting_down.load(Ordering::SeqCst) {
            return false;
        }
        if self.clients.len() >= self.max_clients {
            return false;
        }
        self.clients
            .insert(client_id.to_string(), ClientHandle { outbound });
        self.cancel_idle();
        true
    }

    /// Drop a client and re-check the idle condition.
    pub fn remove_client(self: &Arc<Self>, client_id: &str) {
        if self.clients.remove(client_id).is_some() {
            self.check_idle();
        }
    }

    /// Send a text frame to every connected client.
    pub async fn broadcast_text(&self, json: String) {
        let senders: Vec<_> = self
            .clients
            .iter()
            .map(|entry| entry.value().outbound.clone())
            .collect();
        for tx in senders {
            let _ = tx.send(Message::Text(json.clone().into())).await;
        }
    }

    /// Start the idle timer if the process is idle and none is pending.
    /// The timer re-verifies the condition when it fires.
    pub fn check_idle(self: &Arc<Self>) {
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        if self.client_count() > 0 || self.store.running_count() > 0 {
            return;
        }
        let mut guard = self.idle_timer.lock().expect("idle timer mutex");
        if guard.as_ref().is_some_and(|h| h.is_finished()) {
            *guard = None;
        }
        if guard.is_some() {
            return;
        }
        tracing::debug!(grace = ?self.idle_grace, "idle timer started");
        let manager = Arc::clone(self);
        *guard = Some(tokio::spawn(async move {
            tokio::time::sleep(manager.idle_grace).await;
            if manager.client_count() == 0 && manager.store.running_count() == 0 {
                tracing::info!("idle grace elapsed, shutting down");
                (manager.idle_sink)();
            }
        }));
    }

    fn cancel_idle(&self) {
        if let Some(handle) = self.idle_timer.lock().expect("idle timer mutex").take() {
            handle.abort();
        }
    }

    /// Close every client with a "going away" frame, then shut the store.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.cancel_idle();
        let senders: Vec<_> = self
            .clients
            .iter()
            .map(|entry| entry.value().outbound.clone())
            .collect();
        for tx in senders {
            let _ = tx
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::AWAY,
                    reason: SHUTDOWN_REASON.into(),
                })))
                .await;
        }
        self.clients.clear();
        self.store.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager(grace: Duration) -> (Arc<SessionManager>, Arc<AtomicBool>) {
        let fired = Arc::new(AtomicBool::new(false));
        let sink_fired = fired.clone();
        let manager = SessionManager::new(
            SessionStore::new(),
            2,
            grace,
            Arc::new(move || sink_fired.store(true, Ordering::SeqCst)),
        );
        (manager, fired)
    }

    fn channel() -> mpsc::Sender<Message> {
        let (tx, rx) = mpsc::channel(8);
        std::mem::forget(rx);
        tx
    }

    #[tokio::test]
    async fn idle_timer_fires_sink_after_grace() {
        let (manager, fired) = test_manager(Duration::from_millis(50));
        manager.check_idle();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn admission_cancels_pending_timer() {
        let (manager, fired) = test_manager(Duration::from_millis(50));
        manager.check_idle();
        assert!(manager.try_admit("c1", channel()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn disconnect_rechecks_idle() {
        let (manager, fired) = test_manager(Duration::from_millis(50));
        assert!(manager.try_admit("c1", channel()));
        manager.check_idle(); // clients > 0, no timer starts
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!fired.load(Ordering::SeqCst));

        manager.remove_client("c1");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn admission_cap_is_enforced() {
        let (manager, _) = test_manager(Duration::from_secs(5));
        assert!(manager.try_admit("c1", channel()));
        assert!(manager.try_admit("c2", channel()));
        assert!(!manager.try_admit("c3", channel()));
        assert_eq!(manager.client_count(), 2);
    }

    #[tokio::test]
    async fn shutdown_blocks_further_admissions() {
        let (manager, fired) = test_manager(Duration::from_millis(50));
        manager.shutdown().await;
        assert!(!manager.try_admit("c1", channel()));
        manager.check_idle();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!fired.load(Ordering::SeqCst), "no idle exit after shutdown");
    }
}
