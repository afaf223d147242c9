//! File-operation dispatch.
//!
//! `FileServer` is what the external 9P codec / FUSE bridge drives:
//! walk / open / read / write / clunk against a fid table. Each incoming
//! message is expected to be its own task; `spawn_read` exists for
//! transports that want the server to do the spawning and get abort-on-clunk
//! for free. Writes on one fid are serialized in call order; everything else
//! runs concurrently.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::fs::fid::Fid;
use crate::fs::node::{self, Dir, Node, OpenMode};

pub struct FileServer {
    root: Arc<Dir>,
    fids: Mutex<HashMap<u32, Arc<Fid>>>,
    next_fid: AtomicU32,
}

impl FileServer {
    pub fn new(root: Arc<Dir>) -> Arc<Self> {
        Arc::new(Self {
            root,
            fids: Mutex::new(HashMap::new()),
            next_fid: AtomicU32::new(1),
        })
    }

    pub fn root(&self) -> &Arc<Dir> {
        &self.root
    }

    /// Resolve a `/`-rooted path to a node without allocating a fid.
    pub fn resolve(&self, path: &str) -> FsResult<Node> {
        node::walk(&self.root, &node::path_components(path))
    }

    fn get_fid(&self, fid: u32) -> FsResult<Arc<Fid>> {
        self.fids
            .lock()
            .unwrap()
            .get(&fid)
            .cloned()
            .ok_or_else(|| FsError::not_found(format!("fid {fid}")))
    }

    fn insert_fid(&self, node: Node, path: String) -> u32 {
        let id = self.next_fid.fetch_add(1, Ordering::SeqCst);
        self.fids
            .lock()
            .unwrap()
            .insert(id, Arc::new(Fid::new(id, node, path)));
        id
    }

    /// Allocate a fid pointing at the root.
    pub fn attach(&self) -> u32 {
        self.insert_fid(Node::Dir(Arc::clone(&self.root)), "/".to_string())
    }

    /// Walk `components` from an existing fid, producing a new fid.
    /// The source fid stays valid.
    pub fn walk(&self, fid: u32, components: &[&str]) -> FsResult<u32> {
        let from = self.get_fid(fid)?;

        let mut parts: Vec<String> = node::path_components(&from.path)
            .into_iter()
            .map(str::to_string)
            .collect();
        for comp in components {
            match *comp {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                name => parts.push(name.to_string()),
            }
        }
        let refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        let target = node::walk(&self.root, &refs)?;
        let path = if refs.is_empty() {
            "/".to_string()
        } else {
            format!("/{}", refs.join("/"))
        };
        Ok(self.insert_fid(target, path))
    }

    /// attach + walk in one step, for in-process clients (routes).
    pub fn walk_path(&self, path: &str) -> FsResult<u32> {
        let node = self.resolve(path)?;
        Ok(self.insert_fid(node, path.to_string()))
    }

    pub async fn open(&self, fid: u32, mode: OpenMode) -> FsResult<()> {
        let f = self.get_fid(fid)?;
        *f.mode.lock().unwrap() = Some(mode);
        if let Node::File(file) = &f.node {
            file.opened(f.id, mode).await;
        }
        Ok(())
    }

    /// Read from a fid. Directory reads return the listing; file reads
    /// dispatch to the node and may suspend (blocking files).
    pub async fn read(&self, fid: u32, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        let f = self.get_fid(fid)?;
        match &f.node {
            Node::Dir(dir) => {
                let listing = dir.listing();
                let offset = offset as usize;
                if offset >= listing.len() {
                    return Ok(Vec::new());
                }
                let end = (offset + count as usize).min(listing.len());
                Ok(listing[offset..end].to_vec())
            }
            Node::File(file) => file.read(f.id, offset, count).await,
        }
    }

    /// Dispatch a read as an owned task. The task is aborted if the fid is
    /// clunked while the read is still blocked; the receiver then yields a
    /// channel error rather than data.
    pub fn spawn_read(
        self: &Arc<Self>,
        fid: u32,
        offset: u64,
        count: u32,
    ) -> oneshot::Receiver<FsResult<Vec<u8>>> {
        let (tx, rx) = oneshot::channel();
        let server = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let result = server.read(fid, offset, count).await;
            let _ = tx.send(result);
        });
        if let Ok(f) = self.get_fid(fid) {
            f.track_read(handle);
        }
        rx
    }

    /// Write to a fid. Writes on the same fid are serialized in call order;
    /// writes on different fids of the same file proceed concurrently.
    pub async fn write(&self, fid: u32, offset: u64, data: &[u8]) -> FsResult<u32> {
        let f = self.get_fid(fid)?;
        let _gate = f.write_gate.lock().await;
        match &f.node {
            Node::Dir(_) => Err(FsError::permission("cannot write to a directory")),
            Node::File(file) => file.write(f.id, offset, data).await,
        }
    }

    /// Release a fid: abort any blocked spawned reads, then notify the file
    /// so it can drop per-fid scratch (and, for `parse`, run the submission).
    pub async fn clunk(&self, fid: u32) -> FsResult<()> {
        let f = self
            .fids
            .lock()
            .unwrap()
            .remove(&fid)
            .ok_or_else(|| FsError::not_found(format!("fid {fid}")))?;
        f.abort_reads();
        if let Node::File(file) = &f.node {
            file.clunked(f.id).await;
        }
        debug!(fid = fid, path = %f.path, "fid clunked");
        Ok(())
    }

    pub fn open_fids(&self) -> usize {
        self.fids.lock().unwrap().len()
    }
}
