//! Server configuration: settings.json fields, environment overrides,
//! defaults. Environment variables override file values; file values
//! override defaults. The token has no default; the server refuses to
//! start without one.

use std::path::{Path, PathBuf};

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8089;
const DEFAULT_MAX_CLIENTS: usize = 10;
const DEFAULT_SCROLLBACK_LINES: u32 = 1000;
const DEFAULT_WEB_ROOT: &str = "web/dist";

pub struct Config {
    /// Auth secret required on every WebSocket upgrade.
    pub token: Option<String>,
    pub host: String,
    pub port: u16,
    /// Admission cap for concurrent WebSocket clients.
    pub max_clients: usize,
    /// How many lines to capture when attaching to a tmux session.
    pub scrollback_lines: u32,
    /// Shell spawned for managed sessions.
    pub default_shell: String,
    /// Root directory for the browser UI assets.
    pub web_root: PathBuf,
}

impl Config {
    /// Load from an optional settings file, then apply environment
    /// overrides. A missing or malformed file falls back to defaults.
    pub fn load(path: Option<&Path>) -> Self {
        let mut cfg = match path {
            Some(p) => Self::load_settings_from(p),
            None => Self::default(),
        };
        cfg.apply_env();
        cfg
    }

    fn load_settings_from(path: &Path) -> Self {
        let Ok(data) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        let Ok(root) = serde_json::from_str::<serde_json::Value>(&data) else {
            return Self::default();
        };
        let defaults = Self::default();

        let token = root
            .get("token")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let host = root
            .get("host")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.host);
        let port = root
            .get("port")
            .and_then(|v| v.as_u64())
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or(defaults.port);
        let max_clients = root
            .get("max_clients")
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .filter(|n| *n > 0)
            .unwrap_or(defaults.max_clients);
        let scrollback_lines = root
            .get("scrollback_lines")
            .and_then(|v| v.as_u64())
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(defaults.scrollback_lines);
        let default_shell = root
            .get("default_shell")
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.default_shell);
        let web_root = root
            .get("web_root")
            .and_then(|v| v.as_str())
            .map(|s| PathBuf::from(s.trim()))
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(defaults.web_root);

        Self {
            token,
            host,
            port,
            max_clients,
            scrollback_lines,
            default_shell,
            web_root,
        }
    }

    fn apply_env(&mut self) {
        if let Some(token) = env_string("TERMINALSYNC_TOKEN") {
            self.token = Some(token);
        }
        if let Some(host) = env_string("TERMINALSYNC_HOST") {
            self.host = host;
        }
        if let Some(port) = env_parse::<u16>("TERMINALSYNC_PORT") {
            self.port = port;
        }
        if let Some(max) = env_parse::<usize>("TERMINALSYNC_MAX_CLIENTS") {
            if max > 0 {
                self.max_clients = max;
            }
        }
        if let Some(lines) = env_parse::<u32>("TERMINALSYNC_SCROLLBACK_LINES") {
            self.scrollback_lines = lines;
        }
        if let Some(shell) = env_string("TERMINALSYNC_SHELL") {
            self.default_shell = shell;
        }
        if let Some(root) = env_string("TERMINALSYNC_WEB_ROOT") {
            self.web_root = PathBuf::from(root);
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|s| s.parse().ok())
}

/// Default shell for managed sessions: $SHELL, falling back to /bin/sh.
fn default_shell() -> String {
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

impl Default for Config {
    fn default() -> Self {
        Self {
            token: None,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_clients: DEFAULT_MAX_CLIENTS,
            scrollback_lines: DEFAULT_SCROLLBACK_LINES,
            default_shell: default_shell(),
            web_root: PathBuf::from(DEFAULT_WEB_ROOT),
        }
    }
}
