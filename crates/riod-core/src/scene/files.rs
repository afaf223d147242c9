//! Scene file surface.
//!
//! The files under `scene/` plus the root-level `CONTEXT` and `screen`.
//! `parse` feeds the execution pipeline; `stdout`/`STDERR` expose captured
//! output through the blocking-read engine; `vars`, `state`, `version` and
//! `screen` are buffered views of the shared state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::error::{FsError, FsResult};
use crate::exec::{CodeCompactor, ExecutionContext, Executor, StreamingParser, Value};
use crate::fs::{CtlHandler, FileNode, OutputStream};
use crate::scene::manager::SceneManager;
use crate::scene::screenshot;

// ========== Execution pipeline ==========

/// Shared orchestration for `parse` submissions and `state` restore.
pub struct ExecPipeline {
    pub executor: Executor,
    pub stdout: Arc<OutputStream>,
    pub stderr: Arc<OutputStream>,
    pub context_file: Arc<ContextFile>,
}

impl ExecPipeline {
    /// Run one submission end to end: clear the streams, execute, post the
    /// captured output and summaries, append to CONTEXT, snapshot, and
    /// finally latch readiness on both streams.
    pub async fn run_submission(&self, code: &str) {
        self.stdout.reset();
        self.stderr.reset();

        let outcome = self.executor.execute(code).await;

        if !outcome.stdout.is_empty() {
            self.stdout.post(outcome.stdout.as_bytes());
        }

        if outcome.success {
            let repr = outcome
                .result
                .as_ref()
                .unwrap_or(&Value::Null)
                .repr();
            self.stdout.post(format!("→ {repr}\n").as_bytes());
            if !outcome.widgets_created.is_empty() {
                self.stdout.post(
                    format!(
                        "✓ Created {} widget(s): {}\n",
                        outcome.widgets_created.len(),
                        outcome.widgets_created.join(", ")
                    )
                    .as_bytes(),
                );
            }
            if !outcome.items_registered.is_empty() {
                self.stdout.post(
                    format!("✓ Registered {} item(s)\n", outcome.items_registered.len())
                        .as_bytes(),
                );
            }

            self.context_file.append_code(code);

            let label: String = code
                .trim()
                .lines()
                .next()
                .unwrap_or("")
                .chars()
                .take(80)
                .collect();
            let vars = self.executor.context.lock().await.primitive_vars();
            let version = self
                .executor
                .scene
                .lock()
                .await
                .take_snapshot(&label, code, vars);
            self.stdout.post(format!("✓ Version {version}\n").as_bytes());
            info!(version = version, "submission succeeded");
        } else {
            let mut err = outcome.error.unwrap_or_else(|| "unknown error".to_string());
            if !err.ends_with('\n') {
                err.push('\n');
            }
            self.stderr.post(err.as_bytes());
            debug!("submission failed");
        }

        self.stdout.mark_ready();
        self.stderr.mark_ready();
    }

    /// Re-execute a historical fragment during `state` restore. Output is
    /// discarded; failures are logged and skipped (best-effort recovery).
    async fn replay(&self, version: u64, code: &str) {
        let outcome = self.executor.execute(code).await;
        if !outcome.success {
            warn!(
                version = version,
                error = outcome.error.as_deref().unwrap_or(""),
                "state restore: fragment failed to replay"
            );
        }
    }
}

// ========== parse ==========

/// Write-only consumer of streamed code. Chunks accumulate per fid; clunk
/// drains the buffer and schedules execution.
pub struct ParseFile {
    pipeline: Arc<ExecPipeline>,
    buffers: StdMutex<HashMap<u32, StreamingParser>>,
}

impl ParseFile {
    pub fn new(pipeline: Arc<ExecPipeline>) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            buffers: StdMutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl FileNode for ParseFile {
    fn name(&self) -> &str {
        "parse"
    }

    async fn read(&self, fid: u32, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        let buffering = self
            .buffers
            .lock()
            .unwrap()
            .get(&fid)
            .map(StreamingParser::has_content)
            .unwrap_or(false);
        let content: &[u8] = if buffering {
            b"buffering...\n"
        } else {
            b"ready\n"
        };
        Ok(slice(content, offset, count))
    }

    async fn write(&self, fid: u32, _offset: u64, data: &[u8]) -> FsResult<u32> {
        let text = String::from_utf8_lossy(data);
        self.buffers
            .lock()
            .unwrap()
            .entry(fid)
            .or_default()
            .feed(&text);
        Ok(data.len() as u32)
    }

    async fn clunked(&self, fid: u32) {
        let code = {
            let mut buffers = self.buffers.lock().unwrap();
            buffers.remove(&fid).and_then(|mut p| p.flush())
        };
        if let Some(code) = code {
            self.pipeline.run_submission(&code).await;
        }
    }
}

// ========== stdout / STDERR ==========

/// Read side of a streaming buffer. Writes fail with *permission*.
pub struct StreamOutFile {
    name: String,
    stream: Arc<OutputStream>,
}

impl StreamOutFile {
    pub fn new(name: impl Into<String>, stream: Arc<OutputStream>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            stream,
        })
    }
}

#[async_trait]
impl FileNode for StreamOutFile {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, _fid: u32, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        Ok(self.stream.read_at(offset, count).await)
    }

    async fn write(&self, _fid: u32, _offset: u64, _data: &[u8]) -> FsResult<u32> {
        Err(FsError::permission(format!("{} is read-only", self.name)))
    }

    fn size_hint(&self) -> u64 {
        self.stream.len() as u64
    }
}

// ========== vars ==========

pub struct VarsFile {
    context: Arc<tokio::sync::Mutex<ExecutionContext>>,
}

impl VarsFile {
    pub fn new(context: Arc<tokio::sync::Mutex<ExecutionContext>>) -> Arc<Self> {
        Arc::new(Self { context })
    }
}

#[async_trait]
impl FileNode for VarsFile {
    fn name(&self) -> &str {
        "vars"
    }

    async fn read(&self, _fid: u32, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        let json = self.context.lock().await.vars_json();
        let mut content = serde_json::to_string_pretty(&json).unwrap_or_else(|_| "{}".to_string());
        content.push('\n');
        Ok(slice(content.as_bytes(), offset, count))
    }

    async fn write(&self, _fid: u32, _offset: u64, _data: &[u8]) -> FsResult<u32> {
        Err(FsError::permission("vars is read-only"))
    }
}

// ========== state ==========

const STATE_VERSION: u64 = 1;

/// Crash-recovery envelope. Reads build one cp-friendly JSON document per
/// fid; writes accumulate and a clunk triggers the restore.
pub struct StateFile {
    pipeline: Arc<ExecPipeline>,
    read_cache: StdMutex<HashMap<u32, Arc<Vec<u8>>>>,
    write_bufs: StdMutex<HashMap<u32, Vec<u8>>>,
}

impl StateFile {
    pub fn new(pipeline: Arc<ExecPipeline>) -> Arc<Self> {
        Arc::new(Self {
            pipeline,
            read_cache: StdMutex::new(HashMap::new()),
            write_bufs: StdMutex::new(HashMap::new()),
        })
    }

    async fn build_envelope(&self) -> Vec<u8> {
        // Same order as the executor (context, then scene).
        let ctx = self.pipeline.executor.context.lock().await;
        let scene = self.pipeline.executor.scene.lock().await;

        let scene_doc: serde_json::Value =
            serde_json::from_str(&scene.to_json()).unwrap_or_else(|_| json!({}));
        let versions: Vec<serde_json::Value> =
            scene.versions.list().iter().map(|s| s.summary()).collect();
        let code_history: Vec<serde_json::Value> = scene
            .versions
            .list()
            .iter()
            .filter(|s| !s.code.trim().is_empty())
            .map(|s| json!({"version": s.version, "code": s.code}))
            .collect();

        let envelope = json!({
            "rio_state": STATE_VERSION,
            "timestamp": chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            "scene": scene_doc,
            "settings": {
                "width": scene.width,
                "height": scene.height,
                "background": scene.background,
            },
            "versions": versions,
            "vars": ctx.primitive_vars(),
            "code_history": code_history,
        });

        let mut text =
            serde_json::to_string_pretty(&envelope).unwrap_or_else(|_| "{}".to_string());
        text.push('\n');
        text.into_bytes()
    }

    /// Apply a written envelope: clear, apply settings, replay history,
    /// restore leftover primitive vars, snapshot as `restored session`.
    async fn restore(&self, payload: &[u8]) {
        let doc: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(doc) => doc,
            Err(e) => {
                error!(error = %e, "state restore: bad JSON, scene unchanged");
                return;
            }
        };
        if doc.get("rio_state").and_then(|v| v.as_u64()) != Some(STATE_VERSION) {
            error!("state restore: unknown rio_state version, scene unchanged");
            return;
        }

        {
            let mut scene = self.pipeline.executor.scene.lock().await;
            scene.clear();
            if let Some(settings) = doc.get("settings") {
                if let Some(w) = settings.get("width").and_then(|v| v.as_u64()) {
                    scene.width = w as u32;
                }
                if let Some(h) = settings.get("height").and_then(|v| v.as_u64()) {
                    scene.height = h as u32;
                }
                if let Some(bg) = settings.get("background").and_then(|v| v.as_str()) {
                    scene.background = bg.to_string();
                }
            }
        }

        // Replay the code history in order. The code is the source of truth
        // for both visuals and bindings.
        let mut replayed = 0usize;
        if let Some(history) = doc.get("code_history").and_then(|v| v.as_array()) {
            for entry in history {
                let version = entry.get("version").and_then(|v| v.as_u64()).unwrap_or(0);
                if let Some(code) = entry.get("code").and_then(|v| v.as_str()) {
                    if code.trim().is_empty() {
                        continue;
                    }
                    self.pipeline.replay(version, code).await;
                    replayed += 1;
                }
            }
        }

        // Primitive vars the replay did not recreate.
        if let Some(vars) = doc.get("vars").and_then(|v| v.as_object()) {
            let mut ctx = self.pipeline.executor.context.lock().await;
            for (name, value) in vars {
                if !ctx.contains(name) {
                    if let Some(v) = Value::from_json(value) {
                        ctx.set(name.clone(), v);
                    }
                }
            }
        }

        let vars = self.pipeline.executor.context.lock().await.primitive_vars();
        let version = self
            .pipeline
            .executor
            .scene
            .lock()
            .await
            .take_snapshot("restored session", "", vars);
        info!(replayed = replayed, version = version, "state restored");
    }
}

#[async_trait]
impl FileNode for StateFile {
    fn name(&self) -> &str {
        "state"
    }

    async fn read(&self, fid: u32, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        let cached = {
            let cache = self.read_cache.lock().unwrap();
            if offset == 0 {
                None
            } else {
                cache.get(&fid).cloned()
            }
        };
        let content = match cached {
            Some(content) => content,
            None => {
                let built = Arc::new(self.build_envelope().await);
                self.read_cache
                    .lock()
                    .unwrap()
                    .insert(fid, Arc::clone(&built));
                built
            }
        };
        Ok(slice(&content, offset, count))
    }

    async fn write(&self, fid: u32, offset: u64, data: &[u8]) -> FsResult<u32> {
        let mut bufs = self.write_bufs.lock().unwrap();
        let buf = bufs.entry(fid).or_default();
        // A fresh write sequence at offset 0 replaces the previous one.
        if offset == 0 && !buf.is_empty() {
            buf.clear();
        }
        let offset = offset as usize;
        if buf.len() < offset + data.len() {
            buf.resize(offset + data.len(), 0);
        }
        buf[offset..offset + data.len()].copy_from_slice(data);
        Ok(data.len() as u32)
    }

    async fn clunked(&self, fid: u32) {
        self.read_cache.lock().unwrap().remove(&fid);
        let payload = self.write_bufs.lock().unwrap().remove(&fid);
        if let Some(payload) = payload {
            if !payload.is_empty() {
                self.restore(&payload).await;
            }
        }
    }
}

// ========== version ==========

pub struct VersionFile {
    scene: Arc<tokio::sync::Mutex<SceneManager>>,
}

impl VersionFile {
    pub fn new(scene: Arc<tokio::sync::Mutex<SceneManager>>) -> Arc<Self> {
        Arc::new(Self { scene })
    }
}

#[async_trait]
impl FileNode for VersionFile {
    fn name(&self) -> &str {
        "version"
    }

    async fn read(&self, _fid: u32, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        let scene = self.scene.lock().await;
        let current = scene.versions.current_version();
        let mut out = String::new();
        for snap in scene.versions.list() {
            let marker = if snap.version == current { " *" } else { "" };
            out.push_str(&format!(
                "{}\t{} items\t{}{}\n",
                snap.version,
                snap.item_count(),
                snap.label,
                marker
            ));
        }
        out.push_str(&format!("current {current}\n"));
        out.push_str(&format!("can_undo {}\n", scene.versions.can_undo()));
        out.push_str(&format!("can_redo {}\n", scene.versions.can_redo()));
        Ok(slice(out.as_bytes(), offset, count))
    }

    async fn write(&self, _fid: u32, _offset: u64, data: &[u8]) -> FsResult<u32> {
        let command = String::from_utf8_lossy(data);
        let command = command.trim();
        let mut scene = self.scene.lock().await;
        match command {
            "undo" => {
                scene.undo();
            }
            "redo" => {
                scene.redo();
            }
            other => {
                let version: u64 = other.parse().map_err(|_| {
                    FsError::usage("version: expected undo, redo, or a version number")
                })?;
                scene
                    .goto_version(version)
                    .ok_or_else(|| FsError::not_found(format!("version {version}")))?;
            }
        }
        Ok(data.len() as u32)
    }
}

// ========== screen ==========

/// PNG of the rendered scene, captured lazily on first read per fid.
pub struct ScreenFile {
    scene: Arc<tokio::sync::Mutex<SceneManager>>,
    cache: StdMutex<HashMap<u32, Arc<Vec<u8>>>>,
}

impl ScreenFile {
    pub fn new(scene: Arc<tokio::sync::Mutex<SceneManager>>) -> Arc<Self> {
        Arc::new(Self {
            scene,
            cache: StdMutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl FileNode for ScreenFile {
    fn name(&self) -> &str {
        "screen"
    }

    async fn read(&self, fid: u32, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        let cached = {
            let cache = self.cache.lock().unwrap();
            cache.get(&fid).cloned()
        };
        let png = match cached {
            Some(png) => png,
            None => {
                let capture = {
                    let scene = self.scene.lock().await;
                    screenshot::capture(&scene)
                };
                let png = Arc::new(screenshot::render_png(&capture));
                self.cache.lock().unwrap().insert(fid, Arc::clone(&png));
                png
            }
        };
        Ok(slice(&png, offset, count))
    }

    async fn write(&self, _fid: u32, _offset: u64, _data: &[u8]) -> FsResult<u32> {
        Err(FsError::permission("screen is read-only"))
    }

    async fn clunked(&self, fid: u32) {
        self.cache.lock().unwrap().remove(&fid);
    }
}

// ========== CONTEXT ==========

#[derive(Default)]
struct ContextState {
    ready: bool,
    consumed: bool,
}

/// Compacted program text with always-blocking reads: agents `cat` it each
/// cycle and get the latest coherent view once something new has landed.
pub struct ContextFile {
    log: StdMutex<Vec<String>>,
    state: StdMutex<ContextState>,
    notify: Notify,
    compactor: CodeCompactor,
    context: Arc<tokio::sync::Mutex<ExecutionContext>>,
    scene: Arc<tokio::sync::Mutex<SceneManager>>,
}

impl ContextFile {
    pub fn new(
        context: Arc<tokio::sync::Mutex<ExecutionContext>>,
        scene: Arc<tokio::sync::Mutex<SceneManager>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            log: StdMutex::new(Vec::new()),
            state: StdMutex::new(ContextState::default()),
            notify: Notify::new(),
            compactor: CodeCompactor,
            context,
            scene,
        })
    }

    /// Append a successfully executed fragment and wake blocked readers.
    pub fn append_code(&self, code: &str) {
        if code.trim().is_empty() {
            return;
        }
        self.log
            .lock()
            .unwrap()
            .push(code.trim_end().to_string() + "\n");
        let mut state = self.state.lock().unwrap();
        state.ready = true;
        drop(state);
        self.notify.notify_waiters();
    }

    async fn compacted(&self) -> String {
        let blocks = self.log.lock().unwrap().clone();
        let ctx = self.context.lock().await;
        let scene = self.scene.lock().await;
        match self
            .compactor
            .compact(&blocks, &|name| ctx.binding_is_live_item(name, &scene))
        {
            Some(text) => text,
            None => {
                warn!("context compaction failed; emitting raw concatenation");
                blocks.concat()
            }
        }
    }
}

#[async_trait]
impl FileNode for ContextFile {
    fn name(&self) -> &str {
        "CONTEXT"
    }

    async fn read(&self, _fid: u32, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        {
            let mut state = self.state.lock().unwrap();
            if offset == 0 && state.consumed {
                state.consumed = false;
                state.ready = false;
            }
        }

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.lock().unwrap().ready {
                break;
            }
            notified.await;
        }

        let content = self.compacted().await;
        let bytes = content.as_bytes();
        let chunk = slice(bytes, offset, count);
        if offset as usize + chunk.len() >= bytes.len() {
            self.state.lock().unwrap().consumed = true;
        }
        Ok(chunk)
    }

    async fn write(&self, _fid: u32, _offset: u64, _data: &[u8]) -> FsResult<u32> {
        Err(FsError::permission(
            "CONTEXT is read-only; code is appended on successful execution",
        ))
    }
}

// ========== scene ctl ==========

pub struct SceneCtlHandler {
    pipeline: Arc<ExecPipeline>,
}

impl SceneCtlHandler {
    pub fn new(pipeline: Arc<ExecPipeline>) -> Self {
        Self { pipeline }
    }
}

#[async_trait]
impl CtlHandler for SceneCtlHandler {
    async fn execute(&self, verb: &str, arg: &str) -> FsResult<Option<String>> {
        let scene = &self.pipeline.executor.scene;
        match verb {
            "clear" => {
                let mut scene = scene.lock().await;
                scene.take_snapshot("before clear", "", Default::default());
                scene.clear();
                Ok(None)
            }
            "refresh" => {
                scene.lock().await.refresh();
                Ok(None)
            }
            "export" => Ok(Some(scene.lock().await.to_json())),
            "undo" => {
                scene.lock().await.undo();
                Ok(None)
            }
            "redo" => {
                scene.lock().await.redo();
                Ok(None)
            }
            "goto" => {
                let version: u64 = arg
                    .parse()
                    .map_err(|_| FsError::usage("goto <version>"))?;
                scene
                    .lock()
                    .await
                    .goto_version(version)
                    .ok_or_else(|| FsError::not_found(format!("version {version}")))?;
                Ok(None)
            }
            "snapshot" => {
                let label = if arg.is_empty() { "manual" } else { arg };
                let vars = self.pipeline.executor.context.lock().await.primitive_vars();
                let version = scene.lock().await.take_snapshot(label, "", vars);
                Ok(Some(format!("version {version}")))
            }
            other => Err(FsError::usage(format!("unknown command: {other}"))),
        }
    }

    async fn status(&self) -> String {
        let scene = self.pipeline.executor.scene.lock().await;
        format!(
            "items {}\nversion {}\ncan_undo {}\ncan_redo {}\n",
            scene.item_count(),
            scene.versions.current_version(),
            scene.versions.can_undo(),
            scene.versions.can_redo()
        )
    }
}

fn slice(data: &[u8], offset: u64, count: u32) -> Vec<u8> {
    let offset = offset as usize;
    if offset >= data.len() {
        return Vec::new();
    }
    let end = (offset + count as usize).min(data.len());
    data[offset..end].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RioConfig;
    use crate::fs::StreamMode;
    use std::time::Duration;
    use tokio::time::timeout;

    fn pipeline() -> Arc<ExecPipeline> {
        let config = RioConfig::default();
        let context = Arc::new(tokio::sync::Mutex::new(ExecutionContext::new(&config)));
        let scene = Arc::new(tokio::sync::Mutex::new(SceneManager::new(&config)));
        let stdout = Arc::new(OutputStream::new("stdout", StreamMode::StateAware));
        let stderr = Arc::new(OutputStream::new("STDERR", StreamMode::AlwaysBlock));
        let context_file = ContextFile::new(Arc::clone(&context), Arc::clone(&scene));
        Arc::new(ExecPipeline {
            executor: Executor::new(context, scene),
            stdout,
            stderr,
            context_file,
        })
    }

    #[tokio::test]
    async fn parse_reports_buffering_state() {
        let p = pipeline();
        let parse = ParseFile::new(Arc::clone(&p));
        assert_eq!(parse.read(7, 0, 64).await.unwrap(), b"ready\n");
        parse.write(7, 0, b"x = ").await.unwrap();
        assert_eq!(parse.read(7, 0, 64).await.unwrap(), b"buffering...\n");
        // A different fid sees its own (empty) buffer.
        assert_eq!(parse.read(8, 0, 64).await.unwrap(), b"ready\n");
    }

    #[tokio::test]
    async fn submission_posts_expected_stdout() {
        let p = pipeline();
        let parse = ParseFile::new(Arc::clone(&p));
        parse.write(1, 0, b"x = 1\n").await.unwrap();
        parse.write(1, 6, b"print(x)\n").await.unwrap();
        parse.clunked(1).await;

        let got = p.stdout.read_at(0, 4096).await;
        assert_eq!(
            String::from_utf8(got).unwrap(),
            "1\n→ None\n✓ Version 1\n"
        );

        let scene = p.executor.scene.lock().await;
        assert_eq!(scene.versions.len(), 1);
        assert_eq!(scene.versions.list()[0].label, "x = 1");
    }

    #[tokio::test]
    async fn malformed_code_goes_to_stderr_not_protocol() {
        let p = pipeline();
        let parse = ParseFile::new(Arc::clone(&p));
        // The write itself must succeed.
        parse.write(1, 0, b"x = = broken\n").await.unwrap();
        parse.clunked(1).await;

        let err = p.stderr.read_at(0, 4096).await;
        assert!(String::from_utf8(err).unwrap().contains("SyntaxError"));
        // stdout saw nothing and stays idle.
        let out = timeout(Duration::from_millis(10), p.stdout.read_at(0, 4096))
            .await
            .unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn version_file_drives_undo_redo() {
        let p = pipeline();
        p.run_submission("a = rect(0, 0, 10, 10)").await;
        p.run_submission("b = rect(20, 20, 10, 10)").await;

        let vf = VersionFile::new(Arc::clone(&p.executor.scene));
        let listing = String::from_utf8(vf.read(1, 0, 4096).await.unwrap()).unwrap();
        assert!(listing.contains("current 2"));
        assert!(listing.contains("can_redo false"));

        vf.write(1, 0, b"undo").await.unwrap();
        let listing = String::from_utf8(vf.read(1, 0, 4096).await.unwrap()).unwrap();
        assert!(listing.contains("current 1"));
        assert!(listing.contains("can_redo true"));

        vf.write(1, 0, b"redo").await.unwrap();
        let listing = String::from_utf8(vf.read(1, 0, 4096).await.unwrap()).unwrap();
        assert!(listing.contains("current 2"));
        assert!(listing.contains("can_redo false"));

        assert!(matches!(
            vf.write(1, 0, b"3").await,
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            vf.write(1, 0, b"sideways").await,
            Err(FsError::Usage(_))
        ));
    }

    #[tokio::test]
    async fn state_round_trip_restores_scene_and_vars() {
        let p = pipeline();
        p.run_submission("x = 5\nbox = rect(1, 2, 30, 40)\n").await;

        let state = StateFile::new(Arc::clone(&p));
        let mut envelope = Vec::new();
        let mut offset = 0u64;
        loop {
            let chunk = state.read(1, offset, 512).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            offset += chunk.len() as u64;
            envelope.extend(chunk);
        }
        state.clunked(1).await;

        let doc: serde_json::Value = serde_json::from_slice(&envelope).unwrap();
        assert_eq!(doc["rio_state"], 1);
        assert_eq!(doc["vars"]["x"], 5);
        assert_eq!(doc["code_history"].as_array().unwrap().len(), 1);

        // Wipe and restore through the file.
        {
            let mut scene = p.executor.scene.lock().await;
            scene.clear();
        }
        let pre_versions = p.executor.scene.lock().await.versions.len();
        state.write(2, 0, &envelope).await.unwrap();
        state.clunked(2).await;

        let scene = p.executor.scene.lock().await;
        assert_eq!(scene.item_count(), 1);
        assert!(scene.versions.len() >= pre_versions);
        assert_eq!(
            scene.versions.current_snapshot().unwrap().label,
            "restored session"
        );
        drop(scene);
        let ctx = p.executor.context.lock().await;
        assert_eq!(ctx.get("x"), Some(&Value::Int(5)));
    }

    #[tokio::test]
    async fn corrupt_state_leaves_scene_unchanged() {
        let p = pipeline();
        p.run_submission("box = rect(0, 0, 5, 5)").await;

        let state = StateFile::new(Arc::clone(&p));
        state.write(1, 0, b"{\"rio_state\": 99}").await.unwrap();
        state.clunked(1).await;
        assert_eq!(p.executor.scene.lock().await.item_count(), 1);

        state.write(2, 0, b"not json at all").await.unwrap();
        state.clunked(2).await;
        assert_eq!(p.executor.scene.lock().await.item_count(), 1);
    }

    #[tokio::test]
    async fn context_blocks_until_append_then_compacts() {
        let p = pipeline();
        let ctx_file = Arc::clone(&p.context_file);

        let blocked = timeout(Duration::from_millis(80), ctx_file.read(1, 0, 4096)).await;
        assert!(blocked.is_err(), "CONTEXT must block before first append");

        p.run_submission("x = 1").await;
        p.run_submission("x = 2").await;

        let text =
            String::from_utf8(ctx_file.read(1, 0, 4096).await.unwrap()).unwrap();
        assert!(text.contains("x = 2"));
        assert!(!text.contains("x = 1"));
    }

    #[tokio::test]
    async fn screen_returns_png_cached_per_fid() {
        let p = pipeline();
        p.run_submission("box = rect(0, 0, 50, 50)").await;
        let screen = ScreenFile::new(Arc::clone(&p.executor.scene));
        let head = screen.read(1, 0, 8).await.unwrap();
        assert_eq!(head, [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A]);
        screen.clunked(1).await;
        assert!(matches!(
            screen.write(1, 0, b"x").await,
            Err(FsError::Permission(_))
        ));
    }
}
