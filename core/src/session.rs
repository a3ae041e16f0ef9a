//! PTY-backed sessions: one child shell behind a pseudo-terminal, a chunked
//! ring of recent output, and a typed broadcast of live events.
//!
//! All mutable session state (ring, size, attached clients, exit flag) sits
//! behind one mutex. Output ingestion appends to the ring and publishes the
//! chunk while holding that lock, and [`PtySession::attach`] snapshots the
//! ring and subscribes under the same lock, so a joining client never misses
//! a byte and never sees one twice.

use crate::osc;
use crate::pty::{self, PtyHandle};
use bytes::Bytes;
use portable_pty::CommandBuilder;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

/// Default cap on buffered output per session.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = 200 * 1024;

/// Live event broadcast capacity (chunks buffered per lagging subscriber).
pub const EVENT_CHANNEL_CAP: usize = 256;

const DEFAULT_COLS: u16 = 80;
const DEFAULT_ROWS: u16 = 24;

/// Unique session identifier. Managed ids are UUID v4; sessions attached
/// through tmux use the namespaced `tmux:<name>` form from the wire contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn tmux(name: &str) -> Self {
        Self(format!("tmux:{name}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Where a session came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionSource {
    Managed,
    Tmux,
}

/// Session lifecycle status as reported in listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Running,
    Exited,
}

/// Typed event published by a session to its subscribers.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Raw output chunk from the PTY.
    Data(Bytes),
    /// The child exited with this code. Always the last event.
    Exit(u32),
    /// The PTY was resized.
    Resize { cols: u16, rows: u16 },
    /// The window title changed (OSC 0/2).
    Title(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(SessionId),
    #[error("session has already exited")]
    Exited,
    #[error("failed to start PTY")]
    Spawn(#[source] anyhow::Error),
}

/// What to spawn. `cols`/`rows` of 0 fall back to 80×24.
pub struct SessionOptions {
    pub name: String,
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
    pub id: Option<SessionId>,
    pub max_buffer_bytes: Option<usize>,
    pub env: HashMap<String, String>,
}

impl SessionOptions {
    pub fn new(name: impl Into<String>, shell: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            shell: shell.into(),
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
            id: None,
            max_buffer_bytes: None,
            env: HashMap::new(),
        }
    }
}

/// Chunked ring of recent output. Whole chunks are evicted from the head
/// while over the byte cap, but the newest chunk is always retained, so a
/// single chunk larger than the cap survives intact.
struct ChunkRing {
    chunks: VecDeque<Bytes>,
    bytes: usize,
    cap: usize,
}

impl ChunkRing {
    fn new(cap: usize) -> Self {
        Self {
            chunks: VecDeque::new(),
            bytes: 0,
            cap,
        }
    }

    fn push(&mut self, chunk: Bytes) {
        self.bytes += chunk.len();
        self.chunks.push_back(chunk);
        while self.bytes > self.cap && self.chunks.len() > 1 {
            if let Some(old) = self.chunks.pop_front() {
                self.bytes -= old.len();
            }
        }
    }

    fn concat(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.bytes);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        out
    }
}

struct SessionState {
    name: String,
    cols: u16,
    rows: u16,
    ring: ChunkRing,
    attached: HashSet<String>,
    exited: bool,
    exit_code: Option<u32>,
}

/// Everything a newly attached client needs: the ring snapshot taken at
/// attach time and a subscription that starts strictly after it.
pub struct Attachment {
    pub snapshot: Vec<u8>,
    pub events: broadcast::Receiver<SessionEvent>,
    pub cols: u16,
    pub rows: u16,
}

/// One child shell behind a PTY.
pub struct PtySession {
    id: SessionId,
    source: SessionSource,
    pty: PtyHandle,
    state: Mutex<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl PtySession {
    /// Spawn a managed shell session.
    pub(crate) fn spawn(
        opts: SessionOptions,
    ) -> Result<(Arc<PtySession>, mpsc::Receiver<Vec<u8>>), SessionError> {
        let SessionOptions {
            name,
            shell,
            cols,
            rows,
            id,
            max_buffer_bytes,
            env,
        } = opts;
        let id = id.unwrap_or_else(SessionId::generate);
        let cmd = pty::shell_command(&shell, id.as_str(), &env);
        Self::spawn_with_command(name, id, SessionSource::Managed, cmd, cols, rows, max_buffer_bytes)
    }

    /// Spawn a session around an arbitrary command (used for tmux attach).
    pub(crate) fn spawn_with_command(
        name: String,
        id: SessionId,
        source: SessionSource,
        cmd: CommandBuilder,
        cols: u16,
        rows: u16,
        max_buffer_bytes: Option<usize>,
    ) -> Result<(Arc<PtySession>, mpsc::Receiver<Vec<u8>>), SessionError> {
        let cols = if cols == 0 { DEFAULT_COLS } else { cols };
        let rows = if rows == 0 { DEFAULT_ROWS } else { rows };
        let (pty, rx) = pty::spawn_pty(cmd, cols, rows).map_err(SessionError::Spawn)?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAP);
        let session = Arc::new(PtySession {
            id,
            source,
            pty,
            state: Mutex::new(SessionState {
                name,
                cols,
                rows,
                ring: ChunkRing::new(max_buffer_bytes.unwrap_or(DEFAULT_MAX_BUFFER_BYTES)),
                attached: HashSet::new(),
                exited: false,
                exit_code: None,
            }),
            events,
        });
        Ok((session, rx))
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn source(&self) -> SessionSource {
        self.source
    }

    pub fn name(&self) -> String {
        self.lock_state().name.clone()
    }

    pub fn status(&self) -> SessionStatus {
        if self.has_exited() {
            SessionStatus::Exited
        } else {
            SessionStatus::Running
        }
    }

    pub fn has_exited(&self) -> bool {
        self.lock_state().exited
    }

    pub fn exit_code(&self) -> Option<u32> {
        self.lock_state().exit_code
    }

    pub fn size(&self) -> (u16, u16) {
        let state = self.lock_state();
        (state.cols, state.rows)
    }

    pub fn attached_count(&self) -> usize {
        self.lock_state().attached.len()
    }

    pub fn buffered_output(&self) -> Vec<u8> {
        self.lock_state().ring.concat()
    }

    /// Bytes currently held in the ring.
    pub fn buffered_bytes(&self) -> usize {
        self.lock_state().ring.bytes
    }

    /// Chunks currently held in the ring.
    pub fn chunk_count(&self) -> usize {
        self.lock_state().ring.chunks.len()
    }

    /// Subscribe to live events without registering as an attached client.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Ingest one output chunk from the PTY: append to the ring, scan for a
    /// window title, publish to subscribers.
    pub fn ingest(&self, data: Vec<u8>) {
        let chunk = Bytes::from(data);
        let mut state = self.lock_state();
        state.ring.push(chunk.clone());
        if let Some(title) = osc::scan_title(&chunk) {
            if title != state.name {
                state.name = title.clone();
                let _ = self.events.send(SessionEvent::Title(title));
            }
        }
        let _ = self.events.send(SessionEvent::Data(chunk));
    }

    /// Forward input to the child. Silently ignored after exit.
    pub fn write(&self, data: &[u8]) {
        if self.lock_state().exited {
            return;
        }
        if let Err(e) = self.pty.write(data) {
            tracing::debug!(id = %self.id, error = %e, "pty write failed");
        }
    }

    /// Resize the PTY. No-op after exit, for non-positive dimensions, and
    /// for the current size; emits a resize event otherwise. Returns whether
    /// a change was applied.
    pub fn resize(&self, cols: u16, rows: u16) -> bool {
        let mut state = self.lock_state();
        if state.exited || cols == 0 || rows == 0 || (cols, rows) == (state.cols, state.rows) {
            return false;
        }
        state.cols = cols;
        state.rows = rows;
        if let Err(e) = self.pty.resize(cols, rows) {
            tracing::debug!(id = %self.id, error = %e, "pty resize failed");
        }
        let _ = self.events.send(SessionEvent::Resize { cols, rows });
        true
    }

    /// Register `client_id` as attached. Idempotent.
    pub fn attach_client(&self, client_id: &str) {
        self.lock_state().attached.insert(client_id.to_string());
    }

    /// Deregister `client_id`. Unknown ids are a no-op.
    pub fn detach_client(&self, client_id: &str) {
        self.lock_state().attached.remove(client_id);
    }

    /// Attach a client: check not exited, register it, snapshot the ring,
    /// and install the subscription in one critical section, so the snapshot
    /// and the live stream line up exactly.
    pub fn attach(&self, client_id: &str) -> Result<Attachment, SessionError> {
        let mut state = self.lock_state();
        if state.exited {
            return Err(SessionError::Exited);
        }
        state.attached.insert(client_id.to_string());
        let snapshot = state.ring.concat();
        let events = self.events.subscribe();
        Ok(Attachment {
            snapshot,
            events,
            cols: state.cols,
            rows: state.rows,
        })
    }

    /// Best-effort terminate the child.
    pub fn kill(&self) {
        self.pty.kill();
    }

    /// Record the exit and publish it. Returns false if already marked.
    pub(crate) fn mark_exited(&self, code: u32) -> bool {
        let mut state = self.lock_state();
        if state.exited {
            return false;
        }
        state.exited = true;
        state.exit_code = Some(code);
        let _ = self.events.send(SessionEvent::Exit(code));
        true
    }

    pub(crate) async fn wait_exit_code(&self) -> u32 {
        self.pty.wait_exit_code().await
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().expect("session state mutex")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const SH: &str = "/bin/sh";

    fn ring_with(cap: usize, chunks: &[&[u8]]) -> ChunkRing {
        let mut ring = ChunkRing::new(cap);
        for c in chunks {
            ring.push(Bytes::copy_from_slice(c));
        }
        ring
    }

    #[test]
    fn ring_evicts_oldest_chunks_over_cap() {
        let ring = ring_with(10, &[b"aaaa", b"bbbb", b"cccc"]);
        assert_eq!(ring.concat(), b"bbbbcccc");
        assert_eq!(ring.bytes, 8);
    }

    #[test]
    fn ring_keeps_single_oversized_chunk() {
        let big = vec![b'x'; 100];
        let mut ring = ChunkRing::new(10);
        ring.push(Bytes::from(big.clone()));
        assert_eq!(ring.concat(), big);
        assert_eq!(ring.chunks.len(), 1);
        assert_eq!(ring.bytes, 100);

        let second = vec![b'y'; 100];
        ring.push(Bytes::from(second.clone()));
        assert_eq!(ring.concat(), second);
        assert_eq!(ring.chunks.len(), 1);
        assert_eq!(ring.bytes, 100);
    }

    #[test]
    fn ring_invariant_holds_under_mixed_pushes() {
        let mut ring = ChunkRing::new(64);
        for i in 0..50 {
            ring.push(Bytes::from(vec![b'a'; (i % 13) + 1]));
            assert!(ring.bytes <= 64 || ring.chunks.len() == 1);
        }
    }

    fn spawn_sh() -> (Arc<PtySession>, mpsc::Receiver<Vec<u8>>) {
        PtySession::spawn(SessionOptions::new("test", SH)).expect("spawn /bin/sh")
    }

    #[tokio::test]
    async fn write_produces_output_events() {
        let (session, mut rx) = spawn_sh();
        let mut events = session.subscribe();
        session.write(b"echo marker_out\n");
        let mut seen = Vec::new();
        let found = timeout(Duration::from_secs(5), async {
            loop {
                let chunk = rx.recv().await.expect("pty output");
                session.ingest(chunk);
                while let Ok(ev) = events.try_recv() {
                    if let SessionEvent::Data(bytes) = ev {
                        seen.extend_from_slice(&bytes);
                    }
                }
                if seen.windows(10).any(|w| w == b"marker_out") {
                    break;
                }
            }
        })
        .await;
        assert!(found.is_ok(), "expected echoed marker in output");
        session.kill();
    }

    #[tokio::test]
    async fn resize_is_gated_and_emits_once() {
        let (session, _rx) = spawn_sh();
        let mut events = session.subscribe();

        assert!(!session.resize(0, 24));
        assert!(!session.resize(80, 0));
        assert!(!session.resize(80, 24)); // unchanged
        assert!(session.resize(160, 48));
        assert_eq!(session.size(), (160, 48));
        assert!(!session.resize(160, 48)); // now unchanged again

        match events.try_recv() {
            Ok(SessionEvent::Resize { cols, rows }) => {
                assert_eq!((cols, rows), (160, 48));
            }
            other => panic!("expected one resize event, got {other:?}"),
        }
        assert!(events.try_recv().is_err(), "no further resize events");
        session.kill();
    }

    #[tokio::test]
    async fn attach_replays_ring_before_live_events() {
        let (session, _rx) = spawn_sh();
        session.ingest(b"early output".to_vec());

        let mut attachment = session.attach("client-1").expect("attach");
        assert_eq!(attachment.snapshot, b"early output");
        assert_eq!(attachment.cols, 80);
        assert_eq!(attachment.rows, 24);

        session.ingest(b"X".to_vec());
        match attachment.events.recv().await {
            Ok(SessionEvent::Data(bytes)) => assert_eq!(&bytes[..], b"X"),
            other => panic!("expected live data after snapshot, got {other:?}"),
        }
        session.kill();
    }

    #[tokio::test]
    async fn attach_client_is_idempotent() {
        let (session, _rx) = spawn_sh();
        session.attach_client("c1");
        session.attach_client("c1");
        assert_eq!(session.attached_count(), 1);
        session.detach_client("unknown");
        assert_eq!(session.attached_count(), 1);
        session.detach_client("c1");
        assert_eq!(session.attached_count(), 0);
        session.kill();
    }

    #[tokio::test]
    async fn exited_session_ignores_writes_and_resizes() {
        let (session, _rx) = spawn_sh();
        session.kill();
        assert!(session.mark_exited(9));
        assert!(!session.mark_exited(0), "second mark is a no-op");

        session.write(b"echo nope\n");
        assert!(!session.resize(100, 40));
        assert!(session.has_exited());
        assert_eq!(session.status(), SessionStatus::Exited);
        assert_eq!(session.exit_code(), Some(9));

        assert!(matches!(
            session.attach("late"),
            Err(SessionError::Exited)
        ));
    }

    #[tokio::test]
    async fn osc_title_updates_name_and_publishes() {
        let (session, _rx) = spawn_sh();
        let mut events = session.subscribe();
        session.ingest(b"\x1b]0;build: ok\x07".to_vec());
        assert_eq!(session.name(), "build: ok");

        let mut saw_title = false;
        while let Ok(ev) = events.try_recv() {
            if let SessionEvent::Title(t) = ev {
                assert_eq!(t, "build: ok");
                saw_title = true;
            }
        }
        assert!(saw_title);

        // Same title again: no event.
        session.ingest(b"\x1b]0;build: ok\x07".to_vec());
        let mut saw_second = false;
        while let Ok(ev) = events.try_recv() {
            if matches!(ev, SessionEvent::Title(_)) {
                saw_second = true;
            }
        }
        assert!(!saw_second);
        session.kill();
    }
}
