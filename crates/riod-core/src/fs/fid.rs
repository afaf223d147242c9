//! Fid table entries.
//!
//! A fid is a client handle onto a tree node. The node reference is an Arc
//! clone — fids never own tree structure. Per-fid scratch lives in the file
//! itself, keyed by fid id, and is released through the `clunked` hook.

use std::sync::Mutex;

use tokio::task::JoinHandle;

use crate::fs::node::{Node, OpenMode};

pub struct Fid {
    pub id: u32,
    pub node: Node,
    /// Absolute path within this tree, `/`-rooted. Informational — offsets
    /// are always explicit in read/write calls.
    pub path: String,
    pub mode: Mutex<Option<OpenMode>>,
    /// Serializes writes issued on this fid (call order = apply order).
    pub(crate) write_gate: tokio::sync::Mutex<()>,
    /// Reads dispatched through `spawn_read`; aborted on clunk so a blocked
    /// reader dies with its handle.
    pub(crate) read_tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Fid {
    pub fn new(id: u32, node: Node, path: String) -> Self {
        Self {
            id,
            node,
            path,
            mode: Mutex::new(None),
            write_gate: tokio::sync::Mutex::new(()),
            read_tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn track_read(&self, handle: JoinHandle<()>) {
        let mut tasks = self.read_tasks.lock().unwrap();
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    pub(crate) fn abort_reads(&self) {
        for h in self.read_tasks.lock().unwrap().drain(..) {
            h.abort();
        }
    }
}
