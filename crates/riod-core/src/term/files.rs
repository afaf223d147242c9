//! Terminal file surface.
//!
//! Each live terminal is a directory `terms/<term_id>/` of six files. The
//! files hold weak session references — the filesystem never extends a
//! terminal's lifetime, and operations on a torn-down terminal answer
//! *io* "no longer exists".

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use async_trait::async_trait;
use tracing::info;

use crate::config::RioConfig;
use crate::error::{FsError, FsResult};
use crate::fs::{CtlFile, CtlHandler, Dir, FileNode};
use crate::sandbox::Sandbox;
use crate::term::session::{parse_agent_registration, TermSession};

fn upgrade(term: &Weak<TermSession>, id: &str) -> FsResult<Arc<TermSession>> {
    term.upgrade()
        .ok_or_else(|| FsError::io(format!("terminal {id} no longer exists")))
}

// ========== ctl ==========

struct TermCtlHandler {
    term: Weak<TermSession>,
    term_id: String,
}

#[async_trait]
impl CtlHandler for TermCtlHandler {
    async fn execute(&self, verb: &str, arg: &str) -> FsResult<Option<String>> {
        let session = upgrade(&self.term, &self.term_id)?;
        if verb == "font" {
            if arg.is_empty() {
                let size = session.font_size.load(std::sync::atomic::Ordering::SeqCst);
                return Ok(Some(format!("font {size}")));
            }
            let size: u32 = arg
                .parse()
                .map_err(|_| FsError::usage("font <points>"))?;
            session
                .font_size
                .store(size, std::sync::atomic::Ordering::SeqCst);
            return Ok(None);
        }

        // Anything else is a shell command for the PTY.
        let command = if arg.is_empty() {
            verb.to_string()
        } else {
            format!("{verb} {arg}")
        };
        session.write_line(&command).await?;
        Ok(None)
    }

    async fn status(&self) -> String {
        let Ok(session) = upgrade(&self.term, &self.term_id) else {
            return "running false\n".to_string();
        };
        let agent = session
            .connected_agent
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| "(none)".to_string());
        let agents: Vec<String> = session.known_agents.lock().unwrap().iter().cloned().collect();
        format!(
            "font {}\npid {}\nagent {}\nagents {}\nrunning {}\n",
            session.font_size.load(std::sync::atomic::Ordering::SeqCst),
            session.pid().map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            agent,
            if agents.is_empty() {
                "(none)".to_string()
            } else {
                agents.join(" ")
            },
            session.is_running(),
        )
    }
}

// ========== stdin ==========

/// Write-only gated execution. The write always succeeds; sandbox
/// rejections are observable only by reading `stdout`.
pub struct TermStdinFile {
    term: Weak<TermSession>,
    term_id: String,
    sandbox: Arc<Sandbox>,
}

#[async_trait]
impl FileNode for TermStdinFile {
    fn name(&self) -> &str {
        "stdin"
    }

    async fn read(&self, _fid: u32, _offset: u64, _count: u32) -> FsResult<Vec<u8>> {
        Err(FsError::permission("stdin is write-only"))
    }

    async fn write(&self, _fid: u32, _offset: u64, data: &[u8]) -> FsResult<u32> {
        let session = upgrade(&self.term, &self.term_id)?;
        let command = String::from_utf8_lossy(data);
        let command = command.trim();
        if command.is_empty() {
            return Ok(data.len() as u32);
        }

        let verdict = self.sandbox.check(command);
        if !verdict.ok {
            let reason = verdict.reason.unwrap_or_else(|| "policy".to_string());
            info!(term_id = %self.term_id, command = %command, reason = %reason, "sandbox blocked");
            session.feed_error(&format!("SANDBOX BLOCKED: {reason}\n"));
            return Ok(data.len() as u32);
        }

        session.start_capture();
        session.write_line(command).await?;

        if let Some(agent) = parse_agent_registration(command) {
            session.register_agent(&agent);
        }

        Ok(data.len() as u32)
    }
}

// ========== stdout ==========

pub struct TermStdoutFile {
    term: Weak<TermSession>,
    term_id: String,
}

#[async_trait]
impl FileNode for TermStdoutFile {
    fn name(&self) -> &str {
        "stdout"
    }

    async fn read(&self, _fid: u32, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        let session = upgrade(&self.term, &self.term_id)?;
        Ok(session.stdout.read_at(offset, count).await)
    }

    async fn write(&self, _fid: u32, _offset: u64, _data: &[u8]) -> FsResult<u32> {
        Err(FsError::permission("stdout is read-only"))
    }
}

// ========== input ==========

/// Forwarder to the connected agent's `input` file in the mounted agent
/// namespace. No-op when no agent is connected.
pub struct TermInputFile {
    term: Weak<TermSession>,
    term_id: String,
}

#[async_trait]
impl FileNode for TermInputFile {
    fn name(&self) -> &str {
        "input"
    }

    async fn read(&self, _fid: u32, _offset: u64, _count: u32) -> FsResult<Vec<u8>> {
        Err(FsError::permission("input is write-only"))
    }

    async fn write(&self, _fid: u32, _offset: u64, data: &[u8]) -> FsResult<u32> {
        let session = upgrade(&self.term, &self.term_id)?;
        let Some(path) = session.agent_input_path() else {
            return Ok(data.len() as u32);
        };
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| FsError::io(format!("open {}: {e}", path.display())))?;
        tokio::io::AsyncWriteExt::write_all(&mut file, data)
            .await
            .map_err(|e| FsError::io(format!("write {}: {e}", path.display())))?;
        Ok(data.len() as u32)
    }
}

// ========== output ==========

/// Bidirectional: writes go to the terminal display and mirror into the
/// session's blocking-read buffer; reads tap that buffer. The batch is
/// latched when the writing fid closes, so routed content arrives whole.
pub struct TermOutputFile {
    term: Weak<TermSession>,
    term_id: String,
    writers: StdMutex<HashSet<u32>>,
}

#[async_trait]
impl FileNode for TermOutputFile {
    fn name(&self) -> &str {
        "output"
    }

    async fn read(&self, _fid: u32, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        let session = upgrade(&self.term, &self.term_id)?;
        Ok(session.output.read_at(offset, count).await)
    }

    async fn write(&self, fid: u32, _offset: u64, data: &[u8]) -> FsResult<u32> {
        let session = upgrade(&self.term, &self.term_id)?;
        let text = String::from_utf8_lossy(data);
        session.send_display(&text);
        session.output.post(data);
        self.writers.lock().unwrap().insert(fid);
        Ok(data.len() as u32)
    }

    async fn clunked(&self, fid: u32) {
        let wrote = self.writers.lock().unwrap().remove(&fid);
        if wrote {
            if let Some(session) = self.term.upgrade() {
                session.output.mark_ready();
            }
        }
    }
}

// ========== interrupt ==========

pub struct TermInterruptFile {
    term: Weak<TermSession>,
    term_id: String,
}

#[async_trait]
impl FileNode for TermInterruptFile {
    fn name(&self) -> &str {
        "interrupt"
    }

    async fn read(&self, _fid: u32, _offset: u64, _count: u32) -> FsResult<Vec<u8>> {
        Err(FsError::permission("interrupt is write-only"))
    }

    async fn write(&self, _fid: u32, _offset: u64, data: &[u8]) -> FsResult<u32> {
        let session = upgrade(&self.term, &self.term_id)?;
        session.interrupt().await?;
        Ok(data.len() as u32)
    }
}

// ========== terms directory ==========

/// Registry of live terminals and their subtrees.
pub struct TermsDir {
    dir: Arc<Dir>,
    sessions: StdMutex<HashMap<String, Arc<TermSession>>>,
    sandbox: Arc<Sandbox>,
    config: RioConfig,
}

impl TermsDir {
    pub fn new(config: RioConfig, sandbox: Arc<Sandbox>) -> Arc<Self> {
        Arc::new(Self {
            dir: Dir::new("terms"),
            sessions: StdMutex::new(HashMap::new()),
            sandbox,
            config,
        })
    }

    pub fn dir(&self) -> &Arc<Dir> {
        &self.dir
    }

    /// Spawn a shell and reify it as `terms/<term_id>/`.
    pub fn register_terminal(&self) -> FsResult<String> {
        let session = TermSession::spawn(&self.config)?;
        let id = session.id.clone();
        let weak = Arc::downgrade(&session);

        let term_dir = Dir::new(id.clone());
        term_dir.add_file(Arc::new(CtlFile::new(
            "ctl",
            Box::new(TermCtlHandler {
                term: weak.clone(),
                term_id: id.clone(),
            }),
        )));
        term_dir.add_file(Arc::new(TermStdinFile {
            term: weak.clone(),
            term_id: id.clone(),
            sandbox: Arc::clone(&self.sandbox),
        }));
        term_dir.add_file(Arc::new(TermStdoutFile {
            term: weak.clone(),
            term_id: id.clone(),
        }));
        term_dir.add_file(Arc::new(TermInputFile {
            term: weak.clone(),
            term_id: id.clone(),
        }));
        term_dir.add_file(Arc::new(TermOutputFile {
            term: weak.clone(),
            term_id: id.clone(),
            writers: StdMutex::new(HashSet::new()),
        }));
        term_dir.add_file(Arc::new(TermInterruptFile {
            term: weak,
            term_id: id.clone(),
        }));

        self.dir.add_dir(term_dir);
        self.sessions.lock().unwrap().insert(id.clone(), session);
        Ok(id)
    }

    /// Tear a terminal down: kill the shell, drop the subtree. Files held
    /// by open fids keep their weak refs and start failing gracefully.
    pub fn unregister_terminal(&self, term_id: &str) -> FsResult<()> {
        let session = self
            .sessions
            .lock()
            .unwrap()
            .remove(term_id)
            .ok_or_else(|| FsError::not_found(format!("terminal {term_id}")))?;
        session.kill();
        self.dir.remove(term_id);
        Ok(())
    }

    pub fn get(&self, term_id: &str) -> Option<Arc<TermSession>> {
        self.sessions.lock().unwrap().get(term_id).cloned()
    }

    pub fn list_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn shutdown_all(&self) {
        let sessions: Vec<(String, Arc<TermSession>)> =
            self.sessions.lock().unwrap().drain().collect();
        for (id, session) in sessions {
            session.kill();
            self.dir.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn terms() -> Arc<TermsDir> {
        let config = RioConfig {
            stdout_debounce_ms: 50,
            ..RioConfig::default()
        };
        let sandbox = Arc::new(Sandbox::new("/n", true));
        TermsDir::new(config, sandbox)
    }

    #[tokio::test]
    async fn sandbox_rejection_surfaces_in_stdout_and_shell_survives() {
        let terms = terms();
        let Ok(id) = terms.register_terminal() else {
            return; // no PTY available here
        };
        let session = terms.get(&id).unwrap();
        let stdin = TermStdinFile {
            term: Arc::downgrade(&session),
            term_id: id.clone(),
            sandbox: Arc::new(Sandbox::new("/n", true)),
        };

        // The write itself succeeds even though the command is blocked.
        let n = stdin.write(1, 0, b"rm -rf /\n").await.unwrap();
        assert_eq!(n, 9);

        let out = timeout(Duration::from_secs(2), session.stdout.read_at(0, 4096))
            .await
            .expect("rejection must be readable");
        let text = String::from_utf8_lossy(&out);
        assert!(text.starts_with("SANDBOX BLOCKED:"), "got: {text}");
        assert!(session.is_running(), "shell must survive a rejection");

        terms.unregister_terminal(&id).unwrap();
    }

    #[tokio::test]
    async fn dead_terminal_reads_fail_with_io() {
        let terms = terms();
        let Ok(id) = terms.register_terminal() else {
            return;
        };
        let session = terms.get(&id).unwrap();
        let stdout = TermStdoutFile {
            term: Arc::downgrade(&session),
            term_id: id.clone(),
        };
        drop(session);
        terms.unregister_terminal(&id).unwrap();

        match stdout.read(1, 0, 64).await {
            Err(FsError::Io(msg)) => assert!(msg.contains("no longer exists")),
            other => panic!("expected io error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn output_write_mirrors_to_buffer_and_latches_on_clunk() {
        let terms = terms();
        let Ok(id) = terms.register_terminal() else {
            return;
        };
        let session = terms.get(&id).unwrap();
        let output = TermOutputFile {
            term: Arc::downgrade(&session),
            term_id: id.clone(),
            writers: StdMutex::new(HashSet::new()),
        };

        let mut events = session.subscribe();
        output.write(9, 0, b"agent says hi\n").await.unwrap();

        // Display side sees it immediately (skipping raw shell chatter).
        let display = timeout(Duration::from_secs(2), async {
            loop {
                if let Ok(crate::term::session::TermEvent::Display(text)) = events.recv().await {
                    return text;
                }
            }
        })
        .await
        .expect("display event");
        assert_eq!(display, "agent says hi\n");

        // Read side blocks until the writer clunks.
        let blocked = timeout(Duration::from_millis(80), session.output.read_at(0, 4096)).await;
        assert!(blocked.is_err());
        output.clunked(9).await;
        let got = timeout(Duration::from_secs(1), session.output.read_at(0, 4096))
            .await
            .unwrap();
        assert_eq!(got, b"agent says hi\n");

        terms.unregister_terminal(&id).unwrap();
    }

    #[tokio::test]
    async fn agent_registration_via_stdin() {
        let terms = terms();
        let Ok(id) = terms.register_terminal() else {
            return;
        };
        let session = terms.get(&id).unwrap();
        let stdin = TermStdinFile {
            term: Arc::downgrade(&session),
            term_id: id.clone(),
            sandbox: Arc::new(Sandbox::new("/n", true)),
        };
        stdin
            .write(1, 0, b"echo 'new coder' > /n/llm/ctl\n")
            .await
            .unwrap();
        assert_eq!(
            session.connected_agent.lock().unwrap().as_deref(),
            Some("coder")
        );
        assert!(session.known_agents.lock().unwrap().contains("coder"));

        terms.unregister_terminal(&id).unwrap();
    }
}
