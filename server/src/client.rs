//! Per-connection protocol state machine: BROWSING ↔ ATTACHED.
//!
//! Each connection runs one reader loop that dispatches parsed frames, one
//! writer task that owns the socket sink (so every producer serializes
//! through a single outbound channel), and, while attached, one forward
//! task that turns session events into wire frames. The client holds only
//! the id of its attached session and resolves it through the store on each
//! use, so an explicit remove never leaves a dangling reference.

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use common::protocol::{
    ClientFrame, ClientMessage, DetachReason, ErrorCode, ServerFrame, ServerMessage, SessionInfo,
    PUSH_SEQ,
};
use common::session::{SessionError, SessionEvent, SessionId, SessionOptions};
use common::store::SessionStore;
use common::tmux;
use futures_util::stream::StreamExt;
use futures_util::SinkExt;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use crate::manager::SessionManager;

/// Per-socket outbound queue depth.
pub const OUTBOUND_CAP: usize = 256;

struct AttachedState {
    session_id: SessionId,
    forward: JoinHandle<()>,
}

pub struct ClientSession {
    id: String,
    store: Arc<SessionStore>,
    manager: Arc<SessionManager>,
    outbound: mpsc::Sender<Message>,
    exit_tx: mpsc::Sender<(SessionId, u32)>,
    default_shell: String,
    scrollback_lines: u32,
    attached: Option<AttachedState>,
}

impl ClientSession {
    pub fn new(
        id: String,
        manager: Arc<SessionManager>,
        outbound: mpsc::Sender<Message>,
        default_shell: String,
        scrollback_lines: u32,
    ) -> (Self, mpsc::Receiver<(SessionId, u32)>) {
        let (exit_tx, exit_rx) = mpsc::channel(4);
        let store = manager.store().clone();
        (
            Self {
                id,
                store,
                manager,
                outbound,
                exit_tx,
                default_shell,
                scrollback_lines,
                attached: None,
            },
            exit_rx,
        )
    }

    /// Drive the connection until the socket closes, then deregister.
    pub async fn run(
        mut self,
        socket: WebSocket,
        mut out_rx: mpsc::Receiver<Message>,
        mut exit_rx: mpsc::Receiver<(SessionId, u32)>,
    ) {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let is_close = matches!(msg, Message::Close(_));
                if ws_tx.send(msg).await.is_err() || is_close {
                    break;
                }
            }
        });

        loop {
            tokio::select! {
                incoming = ws_rx.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_text(text.as_str()).await,
                    Some(Ok(Message::Binary(_))) => {
                        self.send_error(PUSH_SEQ, ErrorCode::ParseError, "binary frames are not valid client messages")
                            .await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {} // ping/pong handled by the websocket stack
                    Some(Err(_)) => break,
                },
                Some((session_id, code)) = exit_rx.recv() => {
                    self.handle_session_exit(session_id, code).await;
                }
            }
        }

        self.cleanup();
        self.manager.remove_client(&self.id);
        writer.abort();
    }

    async fn handle_text(&mut self, text: &str) {
        match ClientFrame::parse(text) {
            Ok(frame) => self.dispatch(frame.seq, frame.msg).await,
            Err(e) => {
                self.send_error(PUSH_SEQ, ErrorCode::ParseError, &format!("invalid frame: {e}"))
                    .await;
            }
        }
    }

    async fn dispatch(&mut self, seq: u64, msg: ClientMessage) {
        match msg {
            ClientMessage::ListSessions {} => self.list_sessions(seq).await,
            ClientMessage::CreateSession { name, cols, rows } => {
                self.create_session(seq, name, cols, rows).await;
            }
            ClientMessage::Attach { target, cols, rows } => {
                self.attach(seq, target, cols, rows).await;
            }
            ClientMessage::Input { data } => self.input(seq, data).await,
            ClientMessage::Resize { cols, rows } => self.resize(seq, cols, rows).await,
            ClientMessage::Detach {} => self.detach(seq).await,
        }
    }

    async fn list_sessions(&mut self, seq: u64) {
        let mut sessions: Vec<SessionInfo> = self
            .store
            .list()
            .iter()
            .map(|s| SessionInfo::from_session(s))
            .collect();
        match tmux::list_sessions().await {
            Ok(names) => {
                for name in names {
                    if !self.store.contains(&SessionId::tmux(&name)) {
                        sessions.push(SessionInfo::from_tmux_name(&name));
                    }
                }
            }
            Err(e) => {
                self.send_error(seq, ErrorCode::ListError, &format!("tmux listing failed: {e}"))
                    .await;
                return;
            }
        }
        self.send_frame(ServerFrame::reply(seq, ServerMessage::SessionList { sessions }))
            .await;
    }

    async fn create_session(&mut self, seq: u64, name: String, cols: u16, rows: u16) {
        let mut opts = SessionOptions::new(name, self.default_shell.as_str());
        opts.cols = cols;
        opts.rows = rows;
        match self.store.create(opts) {
            Ok(session) => {
                self.send_frame(ServerFrame::reply(
                    seq,
                    ServerMessage::SessionCreated {
                        id: session.id().clone(),
                        name: session.name(),
                    },
                ))
                .await;
            }
            Err(e) => {
                tracing::warn!(client = %self.id, error = %e, "session create failed");
                self.send_error(seq, ErrorCode::CreateFailed, &format!("could not create session: {e}"))
                    .await;
            }
        }
    }

    async fn attach(&mut self, seq: u64, target: String, cols: u16, rows: u16) {
        if self.attached.is_some() {
            self.send_error(seq, ErrorCode::AlreadyAttached, "already attached to a session")
                .await;
            return;
        }

        let session = if let Some(name) = target.strip_prefix("tmux:") {
            let running = self
                .store
                .get(&SessionId(target.clone()))
                .filter(|s| !s.has_exited());
            match running {
                Some(session) => session,
                None => {
                    let scrollback = match tmux::capture_scrollback(name, self.scrollback_lines).await
                    {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            tracing::warn!(session = name, error = %e, "scrollback capture failed");
                            Vec::new()
                        }
                    };
                    match self.store.create_tmux_attach(name, cols, rows, scrollback) {
                        Ok(session) => session,
                        Err(e) => {
                            self.send_error(
                                seq,
                                ErrorCode::AttachFailed,
                                &format!("could not attach to tmux session: {e}"),
                            )
                            .await;
                            return;
                        }
                    }
                }
            }
        } else {
            match self.store.get(&SessionId(target.clone())) {
                Some(session) => session,
                None => {
                    self.send_error(seq, ErrorCode::SessionNotFound, &format!("no session {target}"))
                        .await;
                    return;
                }
            }
        };

        // An attach may carry the viewer's dimensions; zeros mean "keep".
        session.resize(cols, rows);

        let attachment = match session.attach(&self.id) {
            Ok(a) => a,
            Err(SessionError::Exited) => {
                self.send_error(seq, ErrorCode::SessionExited, "session has already exited")
                    .await;
                return;
            }
            Err(e) => {
                self.send_error(seq, ErrorCode::AttachFailed, &format!("{e}"))
                    .await;
                return;
            }
        };

        // Replay first, then the attached reply, then live events, all
        // through the same outbound queue, so the order holds on the wire.
        if !attachment.snapshot.is_empty() {
            let _ = self
                .outbound
                .send(Message::Binary(Bytes::from(attachment.snapshot)))
                .await;
        }
        let forward = spawn_forward(
            self.outbound.clone(),
            attachment.events,
            self.exit_tx.clone(),
            session.id().clone(),
        );
        self.attached = Some(AttachedState {
            session_id: session.id().clone(),
            forward,
        });
        tracing::info!(client = %self.id, session = %session.id(), "client attached");
        self.send_frame(ServerFrame::reply(
            seq,
            ServerMessage::Attached {
                target: session.id().clone(),
                cols: attachment.cols,
                rows: attachment.rows,
            },
        ))
        .await;
    }

    async fn input(&mut self, seq: u64, data: String) {
        let Some(att) = &self.attached else {
            self.send_error(seq, ErrorCode::NotAttached, "not attached to a session")
                .await;
            return;
        };
        if let Some(session) = self.store.get(&att.session_id) {
            let _ = tokio::task::spawn_blocking(move || session.write(data.as_bytes())).await;
        }
    }

    async fn resize(&mut self, seq: u64, cols: u16, rows: u16) {
        let Some(att) = &self.attached else {
            self.send_error(seq, ErrorCode::NotAttached, "not attached to a session")
                .await;
            return;
        };
        if let Some(session) = self.store.get(&att.session_id) {
            session.resize(cols, rows);
        }
    }

    async fn detach(&mut self, seq: u64) {
        match self.attached.take() {
            Some(att) => {
                att.forward.abort();
                if let Some(session) = self.store.get(&att.session_id) {
                    session.detach_client(&self.id);
                }
                tracing::info!(client = %self.id, session = %att.session_id, "client detached");
                self.send_frame(ServerFrame::reply(
                    seq,
                    ServerMessage::Detached {
                        reason: DetachReason::ClientRequest,
                        message: None,
                    },
                ))
                .await;
            }
            None => {
                self.send_error(seq, ErrorCode::NotAttached, "not attached to a session")
                    .await;
            }
        }
    }

    /// The attached session's child exited: deregister and tell the viewer.
    async fn handle_session_exit(&mut self, session_id: SessionId, code: u32) {
        let Some(att) = self.attached.take_if(|a| a.session_id == session_id) else {
            return;
        };
        att.forward.abort();
        if let Some(session) = self.store.get(&att.session_id) {
            session.detach_client(&self.id);
        }
        self.send_frame(ServerFrame::push(ServerMessage::Detached {
            reason: DetachReason::SessionExit,
            message: Some(format!("session exited with code {code}")),
        }))
        .await;
    }

    /// Socket gone: detach without emitting anything.
    fn cleanup(&mut self) {
        if let Some(att) = self.attached.take() {
            att.forward.abort();
            if let Some(session) = self.store.get(&att.session_id) {
                session.detach_client(&self.id);
            }
        }
    }

    async fn send_frame(&self, frame: ServerFrame) {
        if let Some(json) = frame.to_json() {
            let _ = self.outbound.send(Message::Text(json.into())).await;
        }
    }

    async fn send_error(&self, seq: u64, code: ErrorCode, message: &str) {
        self.send_frame(ServerFrame::reply(
            seq,
            ServerMessage::Error {
                code,
                message: message.to_string(),
            },
        ))
        .await;
    }
}

/// Forward session events to the socket until exit or detach. Data chunks
/// become bare binary frames; resizes become `resized` pushes; the exit
/// event is handed back to the reader loop, which owns the state change.
fn spawn_forward(
    outbound: mpsc::Sender<Message>,
    mut events: broadcast::Receiver<SessionEvent>,
    exit_tx: mpsc::Sender<(SessionId, u32)>,
    session_id: SessionId,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::Data(bytes)) => {
                    if outbound.send(Message::Binary(bytes)).await.is_err() {
                        break;
                    }
                }
                Ok(SessionEvent::Resize { cols, rows }) => {
                    let frame = ServerFrame::push(ServerMessage::Resized { cols, rows });
                    let Some(json) = frame.to_json() else { continue };
                    if outbound.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                Ok(SessionEvent::Title(_)) => {} // listings pick the new name up
                Ok(SessionEvent::Exit(code)) => {
                    let _ = exit_tx.send((session_id.clone(), code)).await;
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(session = %session_id, skipped, "viewer lagging behind pty output");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}
