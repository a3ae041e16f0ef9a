//! Wire protocol for the WebSocket control channel.
//!
//! Text frames carry `{ "type": <string>, "seq": <int>, "payload": <object> }`;
//! binary frames are raw PTY bytes and have no envelope. Replies echo the
//! request's `seq`, server-initiated pushes use `seq = 0`. Parse failures are
//! a first-class outcome, not an exception path.

use crate::session::{PtySession, SessionId, SessionSource, SessionStatus};
use serde::{Deserialize, Serialize};

/// `seq` value used for server-initiated pushes.
pub const PUSH_SEQ: u64 = 0;

/// A parsed client frame: the request sequence number plus the typed body.
#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    pub seq: u64,
    #[serde(flatten)]
    pub msg: ClientMessage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientMessage {
    ListSessions {},
    CreateSession { name: String, cols: u16, rows: u16 },
    Attach { target: String, cols: u16, rows: u16 },
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Detach {},
}

impl ClientFrame {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// An outbound server frame.
#[derive(Debug, Serialize)]
pub struct ServerFrame {
    pub seq: u64,
    #[serde(flatten)]
    pub msg: ServerMessage,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    SessionList {
        sessions: Vec<SessionInfo>,
    },
    SessionCreated {
        id: SessionId,
        name: String,
    },
    SessionRemoved {
        id: SessionId,
    },
    Attached {
        target: SessionId,
        cols: u16,
        rows: u16,
    },
    Resized {
        cols: u16,
        rows: u16,
    },
    Detached {
        reason: DetachReason,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    Error {
        code: ErrorCode,
        message: String,
    },
}

impl ServerFrame {
    /// Reply to a request, mirroring its `seq`.
    pub fn reply(seq: u64, msg: ServerMessage) -> Self {
        Self { seq, msg }
    }

    /// Server-initiated push (`seq = 0`).
    pub fn push(msg: ServerMessage) -> Self {
        Self { seq: PUSH_SEQ, msg }
    }

    pub fn to_json(&self) -> Option<String> {
        serde_json::to_string(self).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachReason {
    ClientRequest,
    SessionExit,
    Error,
}

/// Wire error codes. Structural failures map to `ParseError`; everything
/// else is a logical failure reported on the request's `seq`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ParseError,
    SessionNotFound,
    SessionExited,
    AlreadyAttached,
    NotAttached,
    CreateFailed,
    ListError,
    AttachFailed,
}

/// One row of a `session_list` reply.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: SessionId,
    pub name: String,
    pub status: SessionStatus,
    #[serde(rename = "attachedClients")]
    pub attached_clients: usize,
    pub source: SessionSource,
}

impl SessionInfo {
    pub fn from_session(session: &PtySession) -> Self {
        Self {
            id: session.id().clone(),
            name: session.name(),
            status: session.status(),
            attached_clients: session.attached_count(),
            source: session.source(),
        }
    }

    /// Listing entry for a tmux session the store does not own.
    pub fn from_tmux_name(name: &str) -> Self {
        Self {
            id: SessionId::tmux(name),
            name: name.to_string(),
            status: SessionStatus::Running,
            attached_clients: 0,
            source: SessionSource::Tmux,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_attach_frame() {
        let frame = ClientFrame::parse(
            r#"{"type":"attach","seq":3,"payload":{"target":"abc","cols":80,"rows":24}}"#,
        )
        .expect("valid frame");
        assert_eq!(frame.seq, 3);
        match frame.msg {
            ClientMessage::Attach { target, cols, rows } => {
                assert_eq!(target, "abc");
                assert_eq!((cols, rows), (80, 24));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn parses_empty_payload_messages() {
        let list = ClientFrame::parse(r#"{"type":"list_sessions","seq":1,"payload":{}}"#)
            .expect("valid frame");
        assert!(matches!(list.msg, ClientMessage::ListSessions {}));
        let detach =
            ClientFrame::parse(r#"{"type":"detach","seq":9,"payload":{}}"#).expect("valid frame");
        assert!(matches!(detach.msg, ClientMessage::Detach {}));
    }

    #[test]
    fn rejects_missing_seq_and_unknown_type() {
        assert!(ClientFrame::parse(r#"{"type":"detach","payload":{}}"#).is_err());
        assert!(ClientFrame::parse(r#"{"type":"reboot","seq":1,"payload":{}}"#).is_err());
        assert!(ClientFrame::parse("not json").is_err());
    }

    #[test]
    fn replies_mirror_seq_and_pushes_use_zero() {
        let reply = ServerFrame::reply(
            7,
            ServerMessage::Attached {
                target: SessionId("abc".into()),
                cols: 80,
                rows: 24,
            },
        );
        let json = reply.to_json().expect("serializes");
        let value: serde_json::Value = serde_json::from_str(&json).expect("round-trip");
        assert_eq!(value["seq"], 7);
        assert_eq!(value["type"], "attached");
        assert_eq!(value["payload"]["cols"], 80);

        let push = ServerFrame::push(ServerMessage::Resized { cols: 160, rows: 48 });
        let value: serde_json::Value =
            serde_json::from_str(&push.to_json().expect("serializes")).expect("round-trip");
        assert_eq!(value["seq"], 0);
        assert_eq!(value["type"], "resized");
    }

    #[test]
    fn error_codes_use_wire_spelling() {
        let frame = ServerFrame::reply(
            2,
            ServerMessage::Error {
                code: ErrorCode::NotAttached,
                message: "not attached".into(),
            },
        );
        let json = frame.to_json().expect("serializes");
        assert!(json.contains(r#""code":"NOT_ATTACHED""#));
    }

    #[test]
    fn detached_omits_absent_message() {
        let frame = ServerFrame::reply(
            4,
            ServerMessage::Detached {
                reason: DetachReason::ClientRequest,
                message: None,
            },
        );
        let json = frame.to_json().expect("serializes");
        assert!(json.contains(r#""reason":"client_request""#));
        assert!(!json.contains("message"));
    }

    #[test]
    fn session_info_serializes_camel_case_client_count() {
        let info = SessionInfo::from_tmux_name("main");
        let json = serde_json::to_string(&info).expect("serializes");
        assert!(json.contains(r#""id":"tmux:main""#));
        assert!(json.contains(r#""attachedClients":0"#));
        assert!(json.contains(r#""source":"tmux""#));
        assert!(json.contains(r#""status":"running""#));
    }
}
