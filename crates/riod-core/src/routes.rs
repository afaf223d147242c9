//! Routes manager: persistent tail-style pipes between files.
//!
//! An attachment is an owned task looping *open source → blocking read to
//! EOF → close → open destination → append → close*. EOF resets the
//! source's blocking-read state through the rearm protocol, so one route
//! drives its file perpetually without busy-polling. Sources inside this
//! server's tree are driven through the `FileServer`; other absolute paths
//! go through the host filesystem (the mounted namespace).

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{FsError, FsResult};
use crate::fs::{FileNode, FileServer, OpenMode};

#[derive(Debug, Clone)]
pub enum RouteEvent {
    Added { source: String, destination: String },
    Removed { source: String },
}

struct RouteEntry {
    destination: String,
    running: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

pub struct RoutesManager {
    /// Prefix under which this server's tree appears to clients; route
    /// paths under it are served in-process.
    mount_root: String,
    routes: StdMutex<BTreeMap<String, RouteEntry>>,
    server: OnceLock<Weak<FileServer>>,
    events: broadcast::Sender<RouteEvent>,
}

impl RoutesManager {
    pub fn new(mount_root: impl Into<String>) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            mount_root: mount_root.into(),
            routes: StdMutex::new(BTreeMap::new()),
            server: OnceLock::new(),
            events,
        })
    }

    /// Wire the manager to the server whose tree it can serve directly.
    /// Called once during root assembly.
    pub fn bind_server(&self, server: &Arc<FileServer>) {
        let _ = self.server.set(Arc::downgrade(server));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RouteEvent> {
        self.events.subscribe()
    }

    /// Expand a route path: relative paths are joined to the mount root.
    pub fn normalize(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!("{}/{}", self.mount_root.trim_end_matches('/'), path)
        }
    }

    /// Create an attachment. At most one exists per source; an existing
    /// one is stopped and replaced.
    pub fn add_route(self: &Arc<Self>, source: &str, destination: &str) -> FsResult<()> {
        let source = self.normalize(source);
        let destination = self.normalize(destination);

        let running = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(route_worker(
            self.server.get().cloned().unwrap_or_default(),
            self.mount_root.clone(),
            source.clone(),
            destination.clone(),
            Arc::clone(&running),
        ));

        let old = {
            let mut routes = self.routes.lock().unwrap();
            routes.insert(
                source.clone(),
                RouteEntry {
                    destination: destination.clone(),
                    running,
                    task,
                },
            )
        };
        if let Some(old) = old {
            old.running.store(false, Ordering::SeqCst);
            old.task.abort();
            debug!(source = %source, "replaced existing attachment");
        }

        info!(source = %source, destination = %destination, "route added");
        let _ = self.events.send(RouteEvent::Added {
            source,
            destination,
        });
        Ok(())
    }

    /// Stop and drop the attachment for `source`. Quiet when none exists.
    pub fn remove_route(&self, source: &str) -> bool {
        let source = self.normalize(source);
        let removed = self.routes.lock().unwrap().remove(&source);
        match removed {
            Some(entry) => {
                entry.running.store(false, Ordering::SeqCst);
                entry.task.abort();
                info!(source = %source, "route removed");
                let _ = self.events.send(RouteEvent::Removed { source });
                true
            }
            None => false,
        }
    }

    pub fn list_routes(&self) -> Vec<(String, String, bool)> {
        self.routes
            .lock()
            .unwrap()
            .iter()
            .map(|(source, entry)| {
                (
                    source.clone(),
                    entry.destination.clone(),
                    entry.running.load(Ordering::SeqCst) && !entry.task.is_finished(),
                )
            })
            .collect()
    }

    pub fn count(&self) -> usize {
        self.routes.lock().unwrap().len()
    }

    pub fn stop_all(&self) {
        let routes: Vec<(String, RouteEntry)> = {
            let mut map = self.routes.lock().unwrap();
            std::mem::take(&mut *map).into_iter().collect()
        };
        for (source, entry) in routes {
            entry.running.store(false, Ordering::SeqCst);
            entry.task.abort();
            let _ = self.events.send(RouteEvent::Removed { source });
        }
    }
}

/// Strip the mount-root prefix so a client-visible path addresses our tree.
fn in_tree_path(mount_root: &str, path: &str) -> Option<String> {
    let root = mount_root.trim_end_matches('/');
    if path == root {
        return Some("/".to_string());
    }
    path.strip_prefix(&format!("{root}/"))
        .map(|rest| format!("/{rest}"))
}

async fn route_worker(
    server: Weak<FileServer>,
    mount_root: String,
    source: String,
    destination: String,
    running: Arc<AtomicBool>,
) {
    while running.load(Ordering::SeqCst) {
        match read_source(&server, &mount_root, &source).await {
            Ok(bytes) if !bytes.is_empty() => {
                if let Err(e) = write_destination(&server, &mount_root, &destination, &bytes).await
                {
                    warn!(source = %source, destination = %destination, error = %e, "route write failed");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
            Ok(_) => {
                // Non-blocking source delivered nothing; don't spin.
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            Err(e) => {
                warn!(source = %source, error = %e, "route read failed");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

/// Open, read to EOF (blocking server-side), close.
async fn read_source(server: &Weak<FileServer>, mount_root: &str, path: &str) -> FsResult<Vec<u8>> {
    if let Some(srv) = server.upgrade() {
        let inner = in_tree_path(mount_root, path).unwrap_or_else(|| path.to_string());
        if srv.resolve(&inner).is_ok() {
            let fid = srv.walk_path(&inner)?;
            srv.open(fid, OpenMode::Read).await?;
            let mut out = Vec::new();
            loop {
                let chunk = match srv.read(fid, out.len() as u64, 65536).await {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        let _ = srv.clunk(fid).await;
                        return Err(e);
                    }
                };
                if chunk.is_empty() {
                    break;
                }
                out.extend(chunk);
            }
            srv.clunk(fid).await?;
            return Ok(out);
        }
    }
    // Mounted namespace path.
    tokio::fs::read(path)
        .await
        .map_err(|e| FsError::io(format!("read {path}: {e}")))
}

/// Open, append the batch, close.
async fn write_destination(
    server: &Weak<FileServer>,
    mount_root: &str,
    path: &str,
    bytes: &[u8],
) -> FsResult<()> {
    if let Some(srv) = server.upgrade() {
        let inner = in_tree_path(mount_root, path).unwrap_or_else(|| path.to_string());
        if srv.resolve(&inner).is_ok() {
            let fid = srv.walk_path(&inner)?;
            srv.open(fid, OpenMode::Write).await?;
            let result = srv.write(fid, 0, bytes).await;
            let _ = srv.clunk(fid).await;
            result?;
            return Ok(());
        }
    }
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| FsError::io(format!("open {path}: {e}")))?;
    file.write_all(bytes)
        .await
        .map_err(|e| FsError::io(format!("write {path}: {e}")))?;
    Ok(())
}

// ========== routes file ==========

/// Public interface: one line per attachment on read; `src -> dst` or
/// `-src` on write.
pub struct RoutesFile {
    manager: Arc<RoutesManager>,
}

impl RoutesFile {
    pub fn new(manager: Arc<RoutesManager>) -> Arc<Self> {
        Arc::new(Self { manager })
    }
}

#[async_trait]
impl FileNode for RoutesFile {
    fn name(&self) -> &str {
        "routes"
    }

    async fn read(&self, _fid: u32, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        let routes = self.manager.list_routes();
        let content = if routes.is_empty() {
            "(no routes)\n".to_string()
        } else {
            routes
                .iter()
                .map(|(src, dst, running)| {
                    format!(
                        "{src} -> {dst} [{}]\n",
                        if *running { "running" } else { "stopped" }
                    )
                })
                .collect()
        };
        let bytes = content.as_bytes();
        let offset = offset as usize;
        if offset >= bytes.len() {
            return Ok(Vec::new());
        }
        let end = (offset + count as usize).min(bytes.len());
        Ok(bytes[offset..end].to_vec())
    }

    async fn write(&self, _fid: u32, _offset: u64, data: &[u8]) -> FsResult<u32> {
        let text = std::str::from_utf8(data)
            .map_err(|_| FsError::usage("routes lines must be UTF-8"))?;

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(source) = line.strip_prefix('-') {
                let source = source.trim();
                if source.is_empty() {
                    return Err(FsError::usage("routes: '-<source_path>'"));
                }
                self.manager.remove_route(source);
                continue;
            }
            let (src, dst) = line
                .split_once("->")
                .ok_or_else(|| FsError::usage("routes: '<source> -> <destination>' or '-<source>'"))?;
            let (src, dst) = (src.trim(), dst.trim());
            if src.is_empty() || dst.is_empty() {
                return Err(FsError::usage(
                    "routes: '<source> -> <destination>' or '-<source>'",
                ));
            }
            self.manager.add_route(src, dst)?;
        }
        Ok(data.len() as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{DataFile, Dir, OutputStream, StreamMode};
    use crate::scene::StreamOutFile;
    use std::time::Duration;

    fn tree_with_stream() -> (Arc<FileServer>, Arc<OutputStream>, Arc<DataFile>) {
        let root = Dir::new("");
        let scene = Dir::new("scene");
        let stderr = Arc::new(OutputStream::new("STDERR", StreamMode::AlwaysBlock));
        scene.add_file(StreamOutFile::new("STDERR", Arc::clone(&stderr)));
        root.add_dir(scene);
        let sink = DataFile::new("sink", b"", true);
        root.add_file(Arc::clone(&sink) as Arc<dyn crate::fs::FileNode>);
        (FileServer::new(root), stderr, sink)
    }

    async fn wait_for(sink: &DataFile, needle: &str) -> bool {
        for _ in 0..100 {
            if String::from_utf8_lossy(&sink.contents()).contains(needle) {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    #[tokio::test]
    async fn route_tails_blocking_source_into_destination() {
        let (server, stderr, sink) = tree_with_stream();
        let manager = RoutesManager::new("/n/rio");
        manager.bind_server(&server);

        manager.add_route("/scene/STDERR", "/sink").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        stderr.post(b"first error\n");
        stderr.mark_ready();
        assert!(wait_for(&sink, "first error").await, "first batch routed");

        // The route rearms the source and keeps tailing.
        stderr.post(b"second error\n");
        stderr.mark_ready();
        assert!(wait_for(&sink, "second error").await, "second batch routed");

        let routes = manager.list_routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].0, "/scene/STDERR");
        assert!(routes[0].2, "route should report running");

        assert!(manager.remove_route("/scene/STDERR"));
        assert!(manager.list_routes().is_empty());
    }

    #[tokio::test]
    async fn one_attachment_per_source() {
        let (server, _stderr, _sink) = tree_with_stream();
        let manager = RoutesManager::new("/n/rio");
        manager.bind_server(&server);

        manager.add_route("/scene/STDERR", "/sink").unwrap();
        manager.add_route("/scene/STDERR", "/other").unwrap();

        let routes = manager.list_routes();
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].1, "/other");
        manager.stop_all();
        assert_eq!(manager.count(), 0);
    }

    #[tokio::test]
    async fn relative_paths_expand_against_mount_root() {
        let manager = RoutesManager::new("/n/rio");
        assert_eq!(manager.normalize("scene/STDERR"), "/n/rio/scene/STDERR");
        assert_eq!(manager.normalize("/abs/path"), "/abs/path");
        assert_eq!(in_tree_path("/n/rio", "/n/rio/scene/STDERR").as_deref(), Some("/scene/STDERR"));
        assert_eq!(in_tree_path("/n/rio", "/elsewhere"), None);
    }

    #[tokio::test]
    async fn routes_file_surface() {
        let (server, _stderr, _sink) = tree_with_stream();
        let manager = RoutesManager::new("/n/rio");
        manager.bind_server(&server);
        let file = RoutesFile::new(Arc::clone(&manager));

        let empty = file.read(1, 0, 4096).await.unwrap();
        assert_eq!(empty, b"(no routes)\n");

        file.write(1, 0, b"/scene/STDERR -> /sink\n").await.unwrap();
        let listing = String::from_utf8(file.read(1, 0, 4096).await.unwrap()).unwrap();
        assert!(listing.contains("/scene/STDERR -> /sink [running]"));

        file.write(1, 0, b"-/scene/STDERR\n").await.unwrap();
        assert_eq!(file.read(1, 0, 4096).await.unwrap(), b"(no routes)\n");

        assert!(matches!(
            file.write(1, 0, b"garbage line\n").await,
            Err(FsError::Usage(_))
        ));
        assert!(matches!(
            file.write(1, 0, b"-\n").await,
            Err(FsError::Usage(_))
        ));
    }

    #[tokio::test]
    async fn event_subscription_sees_add_and_remove() {
        let (server, _stderr, _sink) = tree_with_stream();
        let manager = RoutesManager::new("/n/rio");
        manager.bind_server(&server);
        let mut events = manager.subscribe();

        manager.add_route("/scene/STDERR", "/sink").unwrap();
        match events.recv().await.unwrap() {
            RouteEvent::Added { source, .. } => assert_eq!(source, "/scene/STDERR"),
            other => panic!("expected Added, got {other:?}"),
        }
        manager.remove_route("/scene/STDERR");
        match events.recv().await.unwrap() {
            RouteEvent::Removed { source } => assert_eq!(source, "/scene/STDERR"),
            other => panic!("expected Removed, got {other:?}"),
        }
    }
}
