//! PTY-backed terminal session.
//!
//! One shell per session, spawned on a PTY pair. A blocking reader thread
//! bridges PTY output into async land over an unbounded channel; a consumer
//! task strips ANSI escapes, feeds the capture buffer, and drives the
//! debounced readiness signal for `stdout`.

use std::collections::BTreeSet;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use once_cell::sync::Lazy;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use regex::Regex;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::RioConfig;
use crate::error::{FsError, FsResult};
use crate::fs::{OutputStream, StreamMode};
use crate::term::ansi::AnsiStripper;

/// `echo 'new <name>'` in a submitted command registers an agent.
static AGENT_REGISTRATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"echo\s+['"]?new\s+([A-Za-z_][A-Za-z0-9_]*)"#).unwrap());

pub fn parse_agent_registration(command: &str) -> Option<String> {
    AGENT_REGISTRATION_RE
        .captures(command)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Events for embedding UIs (the display side of `output`, raw PTY data).
#[derive(Debug, Clone)]
pub enum TermEvent {
    /// Raw bytes from the PTY.
    Data(Vec<u8>),
    /// Text written to the terminal's `output` file.
    Display(String),
    /// The shell exited.
    Exited,
}

pub struct TermSession {
    pub id: String,
    writer: Mutex<Box<dyn Write + Send>>,
    /// Keeps the PTY master alive for the session's lifetime.
    master: StdMutex<Option<Box<dyn MasterPty + Send>>>,
    child: StdMutex<Option<Box<dyn Child + Send + Sync>>>,
    pid: Option<u32>,
    running: Arc<AtomicBool>,
    /// ANSI-stripped shell output, always-blocking reads.
    pub stdout: Arc<OutputStream>,
    /// Agent-facing output mirror, always-blocking reads.
    pub output: Arc<OutputStream>,
    capturing: Arc<AtomicBool>,
    pub font_size: AtomicU32,
    pub connected_agent: StdMutex<Option<String>>,
    pub known_agents: StdMutex<BTreeSet<String>>,
    events: broadcast::Sender<TermEvent>,
    pub llmfs_mount: String,
}

impl TermSession {
    /// Spawn a shell on a fresh PTY and start its reader tasks.
    pub fn spawn(config: &RioConfig) -> FsResult<Arc<Self>> {
        let id = format!("t{}", &Uuid::new_v4().simple().to_string()[..8]);

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 30,
                cols: 120,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| FsError::io(format!("openpty: {e}")))?;

        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string());
        let mut cmd = CommandBuilder::new(&shell);
        cmd.env("TERM", "xterm-256color");
        if let Ok(cwd) = std::env::current_dir() {
            cmd.cwd(cwd);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| FsError::io(format!("spawn {shell}: {e}")))?;
        let pid = child.process_id();

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| FsError::io(format!("pty writer: {e}")))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| FsError::io(format!("pty reader: {e}")))?;

        let (events, _) = broadcast::channel(256);
        let running = Arc::new(AtomicBool::new(true));
        let stdout = Arc::new(OutputStream::new("stdout", StreamMode::AlwaysBlock));
        let output = Arc::new(OutputStream::new("output", StreamMode::AlwaysBlock));
        let capturing = Arc::new(AtomicBool::new(false));

        let session = Arc::new(Self {
            id: id.clone(),
            writer: Mutex::new(writer),
            master: StdMutex::new(Some(pair.master)),
            child: StdMutex::new(Some(child)),
            pid,
            running: Arc::clone(&running),
            stdout: Arc::clone(&stdout),
            output,
            capturing: Arc::clone(&capturing),
            font_size: AtomicU32::new(12),
            connected_agent: StdMutex::new(None),
            known_agents: StdMutex::new(BTreeSet::new()),
            events: events.clone(),
            llmfs_mount: config.llmfs_mount.clone(),
        });

        // Reader thread: blocking PTY reads bridged over a channel.
        let (data_tx, data_rx) = mpsc::unbounded_channel::<Vec<u8>>();
        let running_for_reader = Arc::clone(&running);
        tokio::task::spawn_blocking(move || {
            let mut reader = reader;
            let mut buf = [0u8; 4096];
            loop {
                match std::io::Read::read(&mut reader, &mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        if data_tx.send(buf[..n].to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        if running_for_reader.load(Ordering::SeqCst) {
                            error!(error = %e, "PTY read error");
                        }
                        break;
                    }
                }
            }
        });

        // Consumer task: strip escapes, capture, debounce readiness.
        let debounce = Duration::from_millis(config.stdout_debounce_ms.max(10));
        let generation = Arc::new(AtomicU64::new(0));
        let term_id = id.clone();
        tokio::spawn(Self::consume_loop(
            term_id,
            data_rx,
            stdout,
            capturing,
            generation,
            debounce,
            events,
            running,
        ));

        info!(term_id = %id, pid = ?pid, shell = %shell, "terminal spawned");
        Ok(session)
    }

    #[allow(clippy::too_many_arguments)]
    async fn consume_loop(
        term_id: String,
        mut data_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        stdout: Arc<OutputStream>,
        capturing: Arc<AtomicBool>,
        generation: Arc<AtomicU64>,
        debounce: Duration,
        events: broadcast::Sender<TermEvent>,
        running: Arc<AtomicBool>,
    ) {
        let mut stripper = AnsiStripper::new();
        while let Some(chunk) = data_rx.recv().await {
            let _ = events.send(TermEvent::Data(chunk.clone()));
            let stripped = stripper.feed(&chunk);
            if !stripped.is_empty() && capturing.load(Ordering::SeqCst) {
                stdout.post(stripped.as_bytes());
            }

            // Restart the quiet timer; only the last chunk's timer fires.
            let gen = generation.fetch_add(1, Ordering::SeqCst) + 1;
            let generation = Arc::clone(&generation);
            let stdout = Arc::clone(&stdout);
            let capturing = Arc::clone(&capturing);
            tokio::spawn(async move {
                tokio::time::sleep(debounce).await;
                if generation.load(Ordering::SeqCst) == gen && capturing.load(Ordering::SeqCst) {
                    // No-op when nothing was captured during the window.
                    stdout.mark_ready();
                }
            });
        }
        running.store(false, Ordering::SeqCst);
        let _ = events.send(TermEvent::Exited);
        debug!(term_id = %term_id, "PTY reader finished");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TermEvent> {
        self.events.subscribe()
    }

    pub fn send_display(&self, text: &str) {
        let _ = self.events.send(TermEvent::Display(text.to_string()));
    }

    /// Arm `stdout` for a fresh capture window.
    pub fn start_capture(&self) {
        self.capturing.store(true, Ordering::SeqCst);
        self.stdout.start_capture();
    }

    /// Inject an error line (sandbox rejections) so a blocked reader of
    /// `stdout` observes it.
    pub fn feed_error(&self, line: &str) {
        self.stdout.start_capture();
        self.capturing.store(true, Ordering::SeqCst);
        self.stdout.feed_line(line);
    }

    pub async fn write_raw(&self, data: &[u8]) -> FsResult<()> {
        if !self.is_running() {
            return Err(FsError::io(format!("terminal {} has exited", self.id)));
        }
        let mut writer = self.writer.lock().await;
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(|e| FsError::io(format!("pty write: {e}")))
    }

    /// Send a command line to the shell.
    pub async fn write_line(&self, command: &str) -> FsResult<()> {
        let mut line = command.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.write_raw(line.as_bytes()).await
    }

    /// Deliver SIGINT to the foreground process group: `^C` through the
    /// master, raised by the line discipline.
    pub async fn interrupt(&self) -> FsResult<()> {
        self.write_raw(b"\x03").await
    }

    pub fn register_agent(&self, name: &str) {
        self.known_agents.lock().unwrap().insert(name.to_string());
        *self.connected_agent.lock().unwrap() = Some(name.to_string());
        info!(term_id = %self.id, agent = %name, "agent connected to terminal");
    }

    /// Path of the connected agent's `input` file in the mounted namespace.
    pub fn agent_input_path(&self) -> Option<std::path::PathBuf> {
        let agent = self.connected_agent.lock().unwrap().clone()?;
        Some(
            std::path::Path::new(&self.llmfs_mount)
                .join("agents")
                .join(agent)
                .join("input"),
        )
    }

    /// Terminate the shell (process-group SIGTERM equivalent) and stop the
    /// reader tasks.
    pub fn kill(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(mut child) = self.child.lock().unwrap().take() {
            if let Err(e) = child.kill() {
                warn!(term_id = %self.id, error = %e, "failed to kill shell");
            }
        }
        self.master.lock().unwrap().take();
        info!(term_id = %self.id, "terminal killed");
    }
}

impl Drop for TermSession {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            self.kill();
        }
    }
}
