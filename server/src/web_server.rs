//! Axum gateway: `/health`, the token-gated WebSocket upgrade at `/ws`, and
//! static UI files from a configured web root with a path-traversal guard.

use axum::{
    body::Body,
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio::sync::mpsc;
use tower_http::services::ServeDir;

use crate::client::{ClientSession, OUTBOUND_CAP};
use crate::manager::SessionManager;

pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub token: String,
    pub web_root: PathBuf,
    pub default_shell: String,
    pub scrollback_lines: u32,
}

/// Query params for `/ws`. The token may come here or in an
/// `Authorization: Bearer` header.
#[derive(serde::Deserialize)]
struct WsQuery {
    token: Option<String>,
}

pub fn router(state: Arc<AppState>) -> Router {
    let assets_dir = state.web_root.join("assets");
    Router::new()
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .nest_service("/assets", ServeDir::new(assets_dir))
        .fallback(get(static_handler))
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn run_web_server(
    addr: SocketAddr,
    state: Arc<AppState>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "web server listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "clients": state.manager.client_count(),
    }))
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let presented = presented_token(&query, &headers);
    if !token_matches(state.token.as_bytes(), presented.as_deref()) {
        tracing::warn!("websocket upgrade rejected: bad token");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: Arc<AppState>) {
    let client_id = uuid::Uuid::new_v4().to_string();
    let (out_tx, out_rx) = mpsc::channel::<Message>(OUTBOUND_CAP);
    if !state.manager.try_admit(&client_id, out_tx.clone()) {
        tracing::warn!(client = %client_id, "client rejected: cap reached");
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: close_code::AGAIN,
                reason: "client limit reached".into(),
            })))
            .await;
        return;
    }
    tracing::info!(client = %client_id, "client connected");
    let (client, exit_rx) = ClientSession::new(
        client_id.clone(),
        state.manager.clone(),
        out_tx,
        state.default_shell.clone(),
        state.scrollback_lines,
    );
    client.run(socket, out_rx, exit_rx).await;
    tracing::info!(client = %client_id, "client disconnected");
}

fn presented_token(query: &WsQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = &query.token {
        return Some(token.clone());
    }
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

/// Constant-time token comparison. Length mismatches (and a missing token)
/// still run a same-length dummy compare so rejection timing stays flat.
fn token_matches(expected: &[u8], presented: Option<&str>) -> bool {
    match presented {
        Some(p) if p.len() == expected.len() => p.as_bytes().ct_eq(expected).into(),
        Some(p) => {
            let _ = p.as_bytes().ct_eq(p.as_bytes());
            false
        }
        None => {
            let _ = expected.ct_eq(expected);
            false
        }
    }
}

/// GET fallback: serve a file from the web root. `/` maps to `index.html`;
/// anything resolving outside the root is a 403.
async fn static_handler(
    State(state): State<Arc<AppState>>,
    uri: Uri,
) -> Result<Response, StatusCode> {
    let resolved = resolve_static_path(&state.web_root, uri.path())?;
    let content = tokio::fs::read(&resolved)
        .await
        .map_err(|_| StatusCode::NOT_FOUND)?;
    let mime = mime_guess::from_path(&resolved)
        .first_raw()
        .unwrap_or("application/octet-stream");
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", mime)
        .body(Body::from(content))
        .unwrap())
}

fn resolve_static_path(root: &Path, request_path: &str) -> Result<PathBuf, StatusCode> {
    let root = root.canonicalize().map_err(|_| StatusCode::NOT_FOUND)?;
    let trimmed = request_path.trim_start_matches('/');
    let relative = if trimmed.is_empty() { "index.html" } else { trimmed };
    if Path::new(relative)
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(StatusCode::FORBIDDEN);
    }
    let requested = root
        .join(relative)
        .canonicalize()
        .map_err(|_| StatusCode::NOT_FOUND)?;
    if !requested.starts_with(&root) {
        return Err(StatusCode::FORBIDDEN);
    }
    if !requested.is_file() {
        return Err(StatusCode::NOT_FOUND);
    }
    Ok(requested)
}
