//! tmux-backed local sessions over a PTY.

use std::io::{Read, Write};
use std::process::Command;
use std::sync::Mutex;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::debug;

use super::{SessionHandle, SessionManager, SessionStreams};

/// Chunks queued per session before the reader thread backs off.
const OUTPUT_BUFFER: usize = 32;
const READ_CHUNK: usize = 32 * 1024;

/// Attaches local tmux sessions (`tmux new -As <name>`) on a PTY.
#[derive(Clone, Debug)]
pub struct LocalSessionManager {
    pub shell: String,
    pub tmux: String,
    /// Kill the tmux session when the PTY side closes.
    pub kill_on_close: bool,
}

impl Default for LocalSessionManager {
    fn default() -> Self {
        Self {
            shell: "bash".to_string(),
            tmux: "tmux".to_string(),
            kill_on_close: false,
        }
    }
}

impl SessionManager for LocalSessionManager {
    fn attach(&self, session_id: &str) -> Result<SessionStreams> {
        let pty = native_pty_system()
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("opening pty")?;

        let mut command = CommandBuilder::new(&self.shell);
        command.arg("-lc");
        command.arg(format!("{} new -As {}", self.tmux, session_id));
        command.env("TERM", "xterm-256color");
        let child = pty.slave.spawn_command(command).context("spawning session")?;
        drop(pty.slave);

        let mut reader = pty.master.try_clone_reader().context("cloning pty reader")?;
        let writer = pty.master.take_writer().context("taking pty writer")?;

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_BUFFER);
        let reader_session = session_id.to_string();
        std::thread::spawn(move || {
            let mut buf = [0u8; READ_CHUNK];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(session = %reader_session, "pty reader finished");
        });

        Ok(SessionStreams {
            handle: Box::new(PtySession {
                master: Mutex::new(pty.master),
                writer: Mutex::new(Some(writer)),
                child: Mutex::new(Some(child)),
                session_id: session_id.to_string(),
                tmux: self.tmux.clone(),
                kill_on_close: self.kill_on_close,
            }),
            output: output_rx,
        })
    }

    fn list_sessions(&self) -> Result<Vec<String>> {
        let output = Command::new(&self.shell)
            .arg("-lc")
            .arg(format!("{} list-sessions -F '#S'", self.tmux))
            .output();
        // No server running (or no tmux at all) means no sessions, not an error.
        let output = match output {
            Ok(output) if output.status.success() => output,
            _ => return Ok(Vec::new()),
        };
        Ok(String::from_utf8_lossy(&output.stdout)
            .split_whitespace()
            .map(str::to_string)
            .collect())
    }
}

struct PtySession {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Option<Box<dyn std::io::Write + Send>>>,
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,
    session_id: String,
    tmux: String,
    kill_on_close: bool,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SessionHandle for PtySession {
    fn write(&self, data: &[u8]) -> Result<()> {
        let mut guard = lock(&self.writer);
        let writer = guard.as_mut().context("session closed")?;
        writer.write_all(data).context("writing to pty")
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        lock(&self.master)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("resizing pty")
    }

    fn close(&self) {
        drop(lock(&self.writer).take());
        if let Some(mut child) = lock(&self.child).take() {
            let _ = child.kill();
            let _ = child.wait();
            if self.kill_on_close && !self.session_id.is_empty() {
                let _ = Command::new(&self.tmux)
                    .args(["kill-session", "-t", &self.session_id])
                    .status();
            }
        }
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn list_sessions_without_a_server_is_empty() {
        let manager = LocalSessionManager {
            tmux: "definitely-not-a-real-binary".to_string(),
            ..Default::default()
        };
        assert_eq!(manager.list_sessions().unwrap(), Vec::<String>::new());
    }

    // Stand in `echo` for tmux, as the command is only ever interpolated
    // into a shell line: the "attach" then just prints its arguments.
    #[tokio::test]
    async fn attach_streams_process_output() {
        let manager = LocalSessionManager {
            shell: "sh".to_string(),
            tmux: "echo".to_string(),
            kill_on_close: false,
        };
        let mut streams = manager.attach("demo").unwrap();

        let mut collected = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !String::from_utf8_lossy(&collected).contains("new -As demo") {
            let chunk = tokio::time::timeout_at(deadline, streams.output.recv())
                .await
                .expect("timed out waiting for pty output")
                .expect("output channel closed before expected text");
            collected.extend_from_slice(&chunk);
        }

        streams.handle.close();
        // Closing twice is fine.
        streams.handle.close();
    }

    #[test]
    fn write_after_close_fails() {
        let manager = LocalSessionManager {
            shell: "sh".to_string(),
            tmux: "echo".to_string(),
            kill_on_close: false,
        };
        let streams = manager.attach("closed").unwrap();
        streams.handle.close();
        assert!(streams.handle.write(b"late").is_err());
    }
}
