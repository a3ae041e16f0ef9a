//! Portable PTY plumbing: spawn a child behind a pseudo-terminal and bridge
//! its byte stream to the async side. A blocking thread drains the master fd
//! into a tokio channel; writes and resizes go through shared handles on the
//! same [`PtyHandle`].

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// Environment marker injected into every child so nested shells can detect
/// they already run inside a shared session and decline to nest.
pub const SESSION_ENV_MARKER: &str = "TERMINALSYNC_SESSION";

/// Capacity of the PTY output channel handed to the async side.
const OUTPUT_CHANNEL_CAP: usize = 256;

/// Build the command for a managed shell session. Injects TERM and COLORTERM
/// so the child sees a modern 256/truecolor terminal (matches xterm.js).
pub fn shell_command(shell: &str, session_id: &str, extra_env: &HashMap<String, String>) -> CommandBuilder {
    let mut c = CommandBuilder::new(shell);
    c.env("TERM", "xterm-256color");
    c.env("COLORTERM", "truecolor");
    c.env(SESSION_ENV_MARKER, session_id);
    for (k, v) in extra_env {
        c.env(k, v);
    }
    c
}

/// Handles to a live PTY child: writer for input, master for resize, child
/// for kill/wait. Each is locked independently so input and resize never
/// contend with each other.
pub struct PtyHandle {
    writer: Mutex<Box<dyn Write + Send>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
}

/// Spawn `cmd` behind a fresh PTY of the given size. Returns the handle plus
/// the receiver of output chunks; the channel closes on EOF (child exit).
pub fn spawn_pty(
    cmd: CommandBuilder,
    cols: u16,
    rows: u16,
) -> anyhow::Result<(PtyHandle, mpsc::Receiver<Vec<u8>>)> {
    let pty_system = native_pty_system();
    let pair = pty_system.openpty(PtySize {
        rows,
        cols,
        pixel_width: 0,
        pixel_height: 0,
    })?;

    let child = pair.slave.spawn_command(cmd)?;
    let mut reader = pair.master.try_clone_reader()?;
    let writer = pair.master.take_writer()?;

    let (tx, rx) = mpsc::channel::<Vec<u8>>(OUTPUT_CHANNEL_CAP);

    // Blocking thread: drain the master fd until EOF and feed the async side.
    std::thread::spawn(move || {
        let mut buf = [0u8; 4096];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let handle = PtyHandle {
        writer: Mutex::new(writer),
        master: Mutex::new(pair.master),
        child: Mutex::new(child),
    };
    Ok((handle, rx))
}

impl PtyHandle {
    /// Forward bytes to the child's stdin.
    pub fn write(&self, data: &[u8]) -> std::io::Result<()> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| std::io::Error::other("pty writer mutex poisoned"))?;
        guard.write_all(data)?;
        guard.flush()
    }

    /// Push a new size to the PTY. The caller decides whether the change is
    /// worth announcing; this just performs the ioctl.
    pub fn resize(&self, cols: u16, rows: u16) -> anyhow::Result<()> {
        let guard = self
            .master
            .lock()
            .map_err(|_| anyhow::anyhow!("pty master mutex poisoned"))?;
        guard.resize(PtySize {
            cols,
            rows,
            pixel_width: 0,
            pixel_height: 0,
        })
    }

    /// Best-effort terminate. Swallows "already dead".
    pub fn kill(&self) {
        if let Ok(mut guard) = self.child.lock() {
            let _ = guard.kill();
        }
    }

    /// Wait for the child's exit status. Called after the output channel
    /// closed, so the child is gone or going; polls until the OS hands back
    /// a code.
    pub async fn wait_exit_code(&self) -> u32 {
        loop {
            let status = {
                let mut guard = match self.child.lock() {
                    Ok(g) => g,
                    Err(_) => return 1,
                };
                match guard.try_wait() {
                    Ok(s) => s,
                    Err(_) => return 1,
                }
            };
            if let Some(s) = status {
                return s.exit_code();
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
