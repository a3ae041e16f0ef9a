//! Read-only tmux adapter: list pre-existing sessions, capture scrollback,
//! and build the attach command. The core merges tmux sessions into listings
//! but never owns them; an attach spawns a `tmux attach` child in its own PTY.

use crate::pty::SESSION_ENV_MARKER;
use portable_pty::CommandBuilder;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;

/// Cap on every tmux invocation. A timeout means "no tmux available", never
/// a fatal error.
pub const COMMAND_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum TmuxError {
    #[error("tmux invocation failed: {0}")]
    Io(#[from] std::io::Error),
}

async fn run_tmux(args: &[&str]) -> Result<Option<Vec<u8>>, TmuxError> {
    let child = Command::new("tmux")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .output();
    let output = match tokio::time::timeout(COMMAND_TIMEOUT, child).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            tracing::warn!(?args, "tmux command timed out");
            return Ok(None);
        }
    };
    // tmux exits non-zero when no server is running; treat as empty.
    if !output.status.success() {
        return Ok(None);
    }
    Ok(Some(output.stdout))
}

/// Whether tmux is installed and answering.
pub async fn available() -> bool {
    matches!(run_tmux(&["-V"]).await, Ok(Some(_)))
}

/// Names of active tmux sessions. Missing binary, dead server, and timeouts
/// all yield an empty list; only unexpected I/O errors surface.
pub async fn list_sessions() -> Result<Vec<String>, TmuxError> {
    let Some(stdout) = run_tmux(&["list-sessions", "-F", "#{session_name}"]).await? else {
        return Ok(Vec::new());
    };
    Ok(String::from_utf8_lossy(&stdout)
        .lines()
        .filter(|l| !l.is_empty())
        .map(|l| l.to_string())
        .collect())
}

/// Capture the last `lines` of scrollback from a tmux session, with escape
/// sequences preserved, normalized to CRLF line endings for terminal replay.
pub async fn capture_scrollback(name: &str, lines: u32) -> Result<Vec<u8>, TmuxError> {
    let start = format!("-{lines}");
    let Some(stdout) = run_tmux(&[
        "capture-pane",
        "-p",
        "-e",
        "-t",
        name,
        "-S",
        &start,
    ])
    .await?
    else {
        return Ok(Vec::new());
    };
    let mut out = Vec::with_capacity(stdout.len());
    for byte in stdout {
        if byte == b'\n' {
            out.extend_from_slice(b"\r\n");
        } else {
            out.push(byte);
        }
    }
    Ok(out)
}

/// Build the PTY command that attaches to a tmux session. TMUX is unset to
/// avoid "sessions should be nested with care" when the server itself runs
/// inside tmux.
pub fn attach_command(name: &str, session_id: &str) -> CommandBuilder {
    let escaped = name.replace('\'', "'\"'\"'");
    let line = format!("exec tmux attach -t '{escaped}'");
    let mut wrap = CommandBuilder::new("bash");
    wrap.arg("-c");
    wrap.arg(line);
    wrap.env("TERM", "xterm-256color");
    wrap.env(SESSION_ENV_MARKER, session_id);
    wrap.env_remove("TMUX");
    wrap
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_command_quotes_the_target() {
        let cmd = attach_command("it's mine", "tmux:it's mine");
        let argv: Vec<String> = cmd
            .get_argv()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(argv[0], "bash");
        assert_eq!(argv[1], "-c");
        assert!(argv[2].contains("tmux attach -t"));
        assert!(argv[2].contains("'\"'\"'"), "single quote is escaped");
    }

    #[tokio::test]
    async fn listing_without_tmux_server_is_empty_or_ok() {
        // Whatever the host has installed, this must not error out for the
        // "no server running" case.
        match list_sessions().await {
            Ok(_) => {}
            Err(e) => panic!("listing should degrade gracefully, got {e}"),
        }
    }
}
