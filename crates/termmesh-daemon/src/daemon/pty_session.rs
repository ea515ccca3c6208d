//! PTY session (§4.4): spawns an interactive shell, waits for it to go
//! idle before writing the assistant launch command, then streams bytes.
//!
//! Grounded on `happy-cli::daemon::persistence::run_pty_loop` — reader and
//! writer are split across their own `spawn_blocking` tasks since
//! `portable-pty`'s I/O is blocking, bridged into the async world over
//! `mpsc` channels and a `tokio::select!` event loop.

use bytes::Bytes;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use termmesh_core::{paths, CoreError};

const DEFAULT_COLS: u16 = 120;
const DEFAULT_ROWS: u16 = 30;
const IDLE_GAP: Duration = Duration::from_millis(300);
const LAUNCH_FALLBACK: Duration = Duration::from_secs(5);
const KILL_GRACE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
pub struct TermSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TermSize {
    fn default() -> Self {
        Self {
            cols: DEFAULT_COLS,
            rows: DEFAULT_ROWS,
        }
    }
}

#[derive(Debug)]
pub enum PtyEvent {
    Data(Bytes),
    Exit {
        code: Option<i32>,
    },
}

pub struct StartOptions {
    pub working_dir: PathBuf,
    pub size: TermSize,
    /// The command to write once the shell has gone idle, e.g. `claude` or
    /// (on resume) `claude --continue || claude`.
    pub launch_command: String,
}

/// Builds the resume-aware launch command per §4.4: a plain invocation
/// normally, or a `--continue` attempt with a fallback when `resume` is
/// requested and the kind supports it.
pub fn build_launch_command(assistant: &str, resume: bool, supports_resume: bool) -> String {
    if resume && supports_resume {
        format!("{assistant} --continue || {assistant}")
    } else {
        assistant.to_string()
    }
}

/// Resolves the working directory a session should actually start in: if
/// `requested` does not exist, falls back to the home directory and
/// returns `true` to signal the caller should log a warning.
pub fn resolve_working_dir(requested: &Path) -> (PathBuf, bool) {
    if requested.is_dir() {
        (requested.to_path_buf(), false)
    } else {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        (home, true)
    }
}

pub struct PtyHandle {
    input_tx: mpsc::Sender<Vec<u8>>,
    resize_tx: mpsc::Sender<(u16, u16)>,
    pub pid: Option<u32>,
    killed: Arc<std::sync::atomic::AtomicBool>,
    child: Arc<StdMutex<Option<Box<dyn Child + Send + Sync>>>>,
}

impl PtyHandle {
    /// No-op after termination, per the §4.4 contract.
    pub async fn write(&self, bytes: Vec<u8>) {
        if self.is_killed() {
            return;
        }
        let _ = self.input_tx.send(bytes).await;
    }

    pub async fn resize(&self, cols: u16, rows: u16) {
        if self.is_killed() {
            return;
        }
        let _ = self.resize_tx.send((cols, rows)).await;
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Idempotent: marks killed, then signals the child gracefully and
    /// forcefully after [`KILL_GRACE`].
    pub async fn kill(&self) {
        if self
            .killed
            .swap(true, std::sync::atomic::Ordering::SeqCst)
        {
            return;
        }
        let child = self.child.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = child.lock().expect("pty child mutex poisoned");
            if let Some(child) = guard.as_mut() {
                let _ = child.kill();
            }
        })
        .await
        .ok();
        tokio::time::sleep(KILL_GRACE).await;
        let child = self.child.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = child.lock().expect("pty child mutex poisoned");
            if let Some(child) = guard.as_mut() {
                let _ = child.kill();
            }
        })
        .await
        .ok();
    }
}

/// Spawns the PTY, starts the idle-detect launch sequencer and the
/// reader/writer bridge tasks, and returns a handle plus the event
/// receiver. `events_tx` is cloned so the caller retains a copy if wanted;
/// here we instead hand back the receiver directly.
pub fn spawn(opts: StartOptions) -> CoreResult<(PtyHandle, mpsc::Receiver<PtyEvent>)> {
    let (working_dir, fell_back) = resolve_working_dir(&opts.working_dir);
    if fell_back {
        tracing::warn!(
            requested = %opts.working_dir.display(),
            fallback = %working_dir.display(),
            "working directory missing, falling back to home"
        );
    }

    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: opts.size.rows,
            cols: opts.size.cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| CoreError::Other(format!("failed to open pty: {e}")))?;

    let mut cmd = CommandBuilder::new(default_shell());
    cmd.cwd(&working_dir);
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| CoreError::Other(format!("failed to spawn shell: {e}")))?;
    let pid = child.process_id();
    drop(pair.slave);

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| CoreError::Other(format!("failed to clone pty reader: {e}")))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|e| CoreError::Other(format!("failed to take pty writer: {e}")))?;

    let (reader_tx, mut reader_rx) = mpsc::channel::<std::io::Result<Bytes>>(256);
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut buf = [0u8; 8192];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if reader_tx
                        .blocking_send(Ok(Bytes::copy_from_slice(&buf[..n])))
                        .is_err()
                    {
                        break;
                    }
                }
                Err(e) => {
                    let _ = reader_tx.blocking_send(Err(e));
                    break;
                }
            }
        }
    });

    let (write_tx, mut write_rx) = mpsc::channel::<Vec<u8>>(256);
    tokio::task::spawn_blocking(move || {
        use std::io::Write;
        while let Some(bytes) = write_rx.blocking_recv() {
            if writer.write_all(&bytes).is_err() {
                break;
            }
            let _ = writer.flush();
        }
    });

    let (resize_tx, mut resize_rx) = mpsc::channel::<(u16, u16)>(16);
    let (events_tx, events_rx) = mpsc::channel::<PtyEvent>(256);
    let killed = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let child_arc: Arc<StdMutex<Option<Box<dyn Child + Send + Sync>>>> =
        Arc::new(StdMutex::new(Some(child)));

    let master = pair.master;
    let launch_command = opts.launch_command;
    let write_tx_for_loop = write_tx.clone();
    let child_for_wait = child_arc.clone();

    tokio::spawn(async move {
        let start = Instant::now();
        let mut last_output = Instant::now();
        let mut launch_sent = false;

        loop {
            let next_deadline = if launch_sent {
                None
            } else {
                Some(std::cmp::min(
                    last_output + IDLE_GAP,
                    start + LAUNCH_FALLBACK,
                ))
            };

            tokio::select! {
                maybe = reader_rx.recv() => {
                    match maybe {
                        Some(Ok(bytes)) => {
                            last_output = Instant::now();
                            if events_tx.send(PtyEvent::Data(bytes)).await.is_err() {
                                break;
                            }
                        }
                        _ => break,
                    }
                }
                Some((cols, rows)) = resize_rx.recv() => {
                    let _ = master.resize(PtySize { rows, cols, pixel_width: 0, pixel_height: 0 });
                }
                _ = tokio::time::sleep_until(next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600))), if next_deadline.is_some() => {
                    let mut line = launch_command.clone();
                    line.push('\n');
                    let _ = write_tx_for_loop.send(line.into_bytes()).await;
                    launch_sent = true;
                }
            }
        }

        let exit_code = tokio::task::spawn_blocking(move || {
            let mut guard = child_for_wait.lock().expect("pty child mutex poisoned");
            guard
                .as_mut()
                .and_then(|c| c.wait().ok())
                .map(|status| status.exit_code() as i32)
        })
        .await
        .unwrap_or(None);

        let _ = events_tx.send(PtyEvent::Exit { code: exit_code }).await;
    });

    Ok((
        PtyHandle {
            input_tx: write_tx,
            resize_tx,
            pid,
            killed,
            child: child_arc,
        },
        events_rx,
    ))
}

type CoreResult<T> = Result<T, CoreError>;

fn default_shell() -> String {
    if cfg!(windows) {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd.exe".to_string())
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
    }
}

#[allow(dead_code)]
fn instance_data_dir() -> std::io::Result<PathBuf> {
    paths::termmesh_home()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_command_plain_when_no_resume() {
        assert_eq!(build_launch_command("claude", false, true), "claude");
    }

    #[test]
    fn launch_command_falls_back_on_resume() {
        assert_eq!(
            build_launch_command("claude", true, true),
            "claude --continue || claude"
        );
    }

    #[test]
    fn launch_command_plain_when_kind_cannot_resume() {
        assert_eq!(build_launch_command("copilot", true, false), "copilot");
    }

    #[test]
    fn resolve_working_dir_falls_back_when_missing() {
        let missing = PathBuf::from("/definitely/not/a/real/path/xyz");
        let (resolved, fell_back) = resolve_working_dir(&missing);
        assert!(fell_back);
        assert_eq!(resolved, dirs::home_dir().unwrap());
    }

    #[test]
    fn resolve_working_dir_keeps_existing() {
        let dir = tempfile::tempdir().unwrap();
        let (resolved, fell_back) = resolve_working_dir(dir.path());
        assert!(!fell_back);
        assert_eq!(resolved, dir.path());
    }
}
