//! Process-wide registry of PTY sessions.
//!
//! The store announces population changes over a broadcast channel: `active`
//! on every create, `idle` when the last running session exits on its own,
//! and `session_removed` on explicit removal. Exited sessions stay in the
//! map so a late lister can still see their status; they leave only through
//! [`SessionStore::remove`] or [`SessionStore::shutdown`].

use crate::session::{PtySession, SessionError, SessionId, SessionOptions, SessionSource};
use crate::tmux;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

/// Capacity of the store's lifecycle signal channel.
const STORE_EVENT_CAP: usize = 64;

/// Lifecycle signal emitted by the store.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A session was created.
    Active,
    /// The running count dropped to zero through a natural child exit.
    Idle,
    /// A session was explicitly removed from the store.
    SessionRemoved(SessionId),
}

pub struct SessionStore {
    sessions: DashMap<SessionId, Arc<PtySession>>,
    events: broadcast::Sender<StoreEvent>,
}

impl SessionStore {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(STORE_EVENT_CAP);
        Arc::new(Self {
            sessions: DashMap::new(),
            events,
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Create and register a managed shell session.
    pub fn create(self: &Arc<Self>, opts: SessionOptions) -> Result<Arc<PtySession>, SessionError> {
        let (session, rx) = PtySession::spawn(opts)?;
        self.register(session.clone(), rx);
        Ok(session)
    }

    /// Create a session that attaches to an existing tmux session, seeding
    /// its ring with captured scrollback. A running attach session for the
    /// same target is reused; a stale exited one is replaced.
    pub fn create_tmux_attach(
        self: &Arc<Self>,
        name: &str,
        cols: u16,
        rows: u16,
        scrollback: Vec<u8>,
    ) -> Result<Arc<PtySession>, SessionError> {
        let id = SessionId::tmux(name);
        if let Some(existing) = self.get(&id) {
            if !existing.has_exited() {
                return Ok(existing);
            }
            self.remove(&id);
        }
        let cmd = tmux::attach_command(name, id.as_str());
        let (session, rx) = PtySession::spawn_with_command(
            name.to_string(),
            id,
            SessionSource::Tmux,
            cmd,
            cols,
            rows,
            None,
        )?;
        if !scrollback.is_empty() {
            session.ingest(scrollback);
        }
        self.register(session.clone(), rx);
        Ok(session)
    }

    fn register(self: &Arc<Self>, session: Arc<PtySession>, mut rx: mpsc::Receiver<Vec<u8>>) {
        self.sessions.insert(session.id().clone(), session.clone());
        let _ = self.events.send(StoreEvent::Active);
        tracing::info!(id = %session.id(), name = %session.name(), "session created");

        let store = Arc::clone(self);
        tokio::spawn(async move {
            // Drain until EOF so subscribers see every in-flight byte before
            // the exit event.
            while let Some(chunk) = rx.recv().await {
                session.ingest(chunk);
            }
            let code = session.wait_exit_code().await;
            session.mark_exited(code);
            tracing::info!(id = %session.id(), code, "session exited");
            // Explicit remove/shutdown pulls the session from the map first;
            // only a natural exit that leaves nothing running flips idle.
            if store.sessions.contains_key(session.id()) && store.running_count() == 0 {
                let _ = store.events.send(StoreEvent::Idle);
            }
        });
    }

    pub fn get(&self, id: &SessionId) -> Option<Arc<PtySession>> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn list(&self) -> Vec<Arc<PtySession>> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.contains_key(id)
    }

    /// Sessions whose child is still running.
    pub fn running_count(&self) -> usize {
        self.sessions
            .iter()
            .filter(|entry| !entry.value().has_exited())
            .count()
    }

    /// Kill and drop a session. Never emits `idle`.
    pub fn remove(&self, id: &SessionId) -> bool {
        match self.sessions.remove(id) {
            Some((_, session)) => {
                session.kill();
                let _ = self.events.send(StoreEvent::SessionRemoved(id.clone()));
                tracing::info!(id = %id, "session removed");
                true
            }
            None => false,
        }
    }

    /// Kill and drop every session. Idempotent.
    pub fn shutdown(&self) {
        for entry in self.sessions.iter() {
            entry.value().kill();
        }
        self.sessions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionEvent;
    use std::time::Duration;
    use tokio::time::timeout;

    const SH: &str = "/bin/sh";

    async fn recv_event(rx: &mut broadcast::Receiver<StoreEvent>) -> StoreEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("store event in time")
            .expect("store channel open")
    }

    #[tokio::test]
    async fn create_emits_active_and_registers() {
        let store = SessionStore::new();
        let mut events = store.subscribe();
        let session = store
            .create(SessionOptions::new("s1", SH))
            .expect("create session");
        assert!(matches!(recv_event(&mut events).await, StoreEvent::Active));
        assert!(store.contains(session.id()));
        assert_eq!(store.running_count(), 1);
        store.shutdown();
    }

    #[tokio::test]
    async fn natural_exit_emits_idle_and_retains_session() {
        let store = SessionStore::new();
        let session = store
            .create(SessionOptions::new("s1", SH))
            .expect("create session");
        let mut events = store.subscribe();

        session.write(b"exit 3\n");
        let idle = timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(StoreEvent::Idle) = events.recv().await {
                    break;
                }
            }
        })
        .await;
        assert!(idle.is_ok(), "expected idle after last session exited");

        // Exited session is retained until explicitly removed.
        assert!(store.contains(session.id()));
        assert_eq!(store.running_count(), 0);
        assert!(session.has_exited());
        assert_eq!(session.exit_code(), Some(3));
        store.shutdown();
    }

    #[tokio::test]
    async fn remove_kills_without_idle() {
        let store = SessionStore::new();
        let session = store
            .create(SessionOptions::new("s1", SH))
            .expect("create session");
        let id = session.id().clone();
        let mut events = store.subscribe();

        assert!(store.remove(&id));
        assert!(!store.contains(&id));
        assert!(!store.remove(&id), "second remove reports absence");

        // session_removed arrives; idle must not.
        let mut saw_removed = false;
        let drained = timeout(Duration::from_secs(2), async {
            loop {
                match events.recv().await {
                    Ok(StoreEvent::SessionRemoved(rid)) => {
                        assert_eq!(rid, id);
                        saw_removed = true;
                    }
                    Ok(StoreEvent::Idle) => panic!("remove must not emit idle"),
                    Ok(StoreEvent::Active) => {}
                    Err(_) => break,
                }
            }
        })
        .await;
        let _ = drained; // timeout is the expected way out
        assert!(saw_removed);
    }

    #[tokio::test]
    async fn attached_subscriber_sees_exit_after_remove() {
        let store = SessionStore::new();
        let session = store
            .create(SessionOptions::new("s1", SH))
            .expect("create session");
        let attachment = session.attach("c1").expect("attach");
        let mut events = attachment.events;

        store.remove(session.id());
        let got_exit = timeout(Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Ok(SessionEvent::Exit(_)) => break,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => {
                        panic!("channel closed before exit event")
                    }
                }
            }
        })
        .await;
        assert!(got_exit.is_ok(), "attached client observes exit after kill");
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let store = SessionStore::new();
        store
            .create(SessionOptions::new("s1", SH))
            .expect("create session");
        store.shutdown();
        assert_eq!(store.list().len(), 0);
        store.shutdown();
    }
}
