//! Synthetic tree primitives.
//!
//! A `Node` is either a directory (insertion-ordered children) or a file
//! implementing [`FileNode`]. Node identity is the `Arc` allocation, not the
//! name — two files named `ctl` in different directories are distinct.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use crate::error::{FsError, FsResult};

/// Open mode, advisory. Files enforce their own read/write policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
    ReadWrite,
}

/// Operations a synthetic file implements.
///
/// `fid` is the server-assigned fid id; files that keep per-handle scratch
/// (write accumulators, read caches) key it by this value and free it in
/// `clunked`.
#[async_trait]
pub trait FileNode: Send + Sync {
    fn name(&self) -> &str;

    async fn read(&self, fid: u32, offset: u64, count: u32) -> FsResult<Vec<u8>>;

    async fn write(&self, fid: u32, offset: u64, data: &[u8]) -> FsResult<u32>;

    /// Called when a fid is opened on this file.
    async fn opened(&self, _fid: u32, _mode: OpenMode) {
    }

    /// Called when a fid on this file is clunked. Free per-fid scratch here.
    async fn clunked(&self, _fid: u32) {}

    fn size_hint(&self) -> u64 {
        0
    }
}

pub type FileRef = Arc<dyn FileNode>;

/// A member of the tree.
#[derive(Clone)]
pub enum Node {
    Dir(Arc<Dir>),
    File(FileRef),
}

impl Node {
    pub fn name(&self) -> String {
        match self {
            Node::Dir(d) => d.name().to_string(),
            Node::File(f) => f.name().to_string(),
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, Node::Dir(_))
    }

    pub fn as_file(&self) -> Option<&FileRef> {
        match self {
            Node::File(f) => Some(f),
            Node::Dir(_) => None,
        }
    }
}

/// Directory with insertion-ordered children.
pub struct Dir {
    name: String,
    children: RwLock<Vec<(String, Node)>>,
}

impl Dir {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            children: RwLock::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a child, replacing any existing child with the same name in place.
    pub fn add(&self, node: Node) {
        let name = node.name();
        let mut children = self.children.write().unwrap();
        if let Some(slot) = children.iter_mut().find(|(n, _)| *n == name) {
            slot.1 = node;
        } else {
            children.push((name, node));
        }
    }

    pub fn add_file(&self, file: FileRef) {
        self.add(Node::File(file));
    }

    pub fn add_dir(&self, dir: Arc<Dir>) {
        self.add(Node::Dir(dir));
    }

    pub fn remove(&self, name: &str) -> Option<Node> {
        let mut children = self.children.write().unwrap();
        let idx = children.iter().position(|(n, _)| n == name)?;
        Some(children.remove(idx).1)
    }

    pub fn get(&self, name: &str) -> Option<Node> {
        self.children
            .read()
            .unwrap()
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, node)| node.clone())
    }

    /// Child names, insertion order.
    pub fn list(&self) -> Vec<(String, bool)> {
        self.children
            .read()
            .unwrap()
            .iter()
            .map(|(n, node)| (n.clone(), node.is_dir()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.children.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Directory listing as bytes: one entry per line, `/` suffix on
    /// subdirectories, insertion order.
    pub fn listing(&self) -> Vec<u8> {
        let mut out = String::new();
        for (name, is_dir) in self.list() {
            out.push_str(&name);
            if is_dir {
                out.push('/');
            }
            out.push('\n');
        }
        out.into_bytes()
    }
}

/// Resolve a path of components against a directory, tracking the ancestor
/// chain so `..` works without parent pointers. `.` and empty components are
/// skipped; walking through a file fails with *not-found*.
pub fn walk(root: &Arc<Dir>, components: &[&str]) -> FsResult<Node> {
    let mut stack: Vec<Arc<Dir>> = vec![Arc::clone(root)];
    let mut current: Node = Node::Dir(Arc::clone(root));

    for comp in components {
        match *comp {
            "" | "." => continue,
            ".." => {
                if stack.len() > 1 {
                    stack.pop();
                }
                current = Node::Dir(Arc::clone(stack.last().unwrap()));
            }
            name => {
                let dir = match &current {
                    Node::Dir(d) => Arc::clone(d),
                    Node::File(_) => return Err(FsError::not_found(name.to_string())),
                };
                let child = dir.get(name).ok_or_else(|| FsError::not_found(name.to_string()))?;
                if let Node::Dir(d) = &child {
                    stack.push(Arc::clone(d));
                }
                current = child;
            }
        }
    }

    Ok(current)
}

/// Split a slash-separated path into walk components.
pub fn path_components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

/// Simple in-memory data file. Used for status-ish leaves and as the
/// default route destination for paths inside the tree.
pub struct DataFile {
    name: String,
    data: RwLock<Vec<u8>>,
    writable: bool,
}

impl DataFile {
    pub fn new(name: impl Into<String>, initial: &[u8], writable: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            data: RwLock::new(initial.to_vec()),
            writable,
        })
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.read().unwrap().clone()
    }

    pub fn set_contents(&self, data: &[u8]) {
        *self.data.write().unwrap() = data.to_vec();
    }
}

#[async_trait]
impl FileNode for DataFile {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, _fid: u32, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        let data = self.data.read().unwrap();
        let offset = offset as usize;
        if offset >= data.len() {
            return Ok(Vec::new());
        }
        let end = (offset + count as usize).min(data.len());
        Ok(data[offset..end].to_vec())
    }

    async fn write(&self, _fid: u32, offset: u64, data: &[u8]) -> FsResult<u32> {
        if !self.writable {
            return Err(FsError::permission(format!("{} is read-only", self.name)));
        }
        let mut buf = self.data.write().unwrap();
        let offset = offset as usize;
        if buf.len() < offset + data.len() {
            buf.resize(offset + data.len(), 0);
        }
        buf[offset..offset + data.len()].copy_from_slice(data);
        Ok(data.len() as u32)
    }

    fn size_hint(&self) -> u64 {
        self.data.read().unwrap().len() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn children_keep_insertion_order() {
        let dir = Dir::new("root");
        dir.add_file(DataFile::new("zeta", b"", true));
        dir.add_file(DataFile::new("alpha", b"", true));
        dir.add_dir(Dir::new("mid"));
        let names: Vec<String> = dir.list().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert_eq!(
            String::from_utf8(dir.listing()).unwrap(),
            "zeta\nalpha\nmid/\n"
        );
    }

    #[test]
    fn walk_resolves_dot_and_dotdot() {
        let root = Dir::new("");
        let sub = Dir::new("scene");
        sub.add_file(DataFile::new("vars", b"{}", false));
        root.add_dir(Arc::clone(&sub));

        let node = walk(&root, &["scene", ".", "vars"]).unwrap();
        assert_eq!(node.name(), "vars");

        let node = walk(&root, &["scene", "..", "scene", "vars"]).unwrap();
        assert_eq!(node.name(), "vars");

        assert!(walk(&root, &["scene", "missing"]).is_err());
    }

    #[tokio::test]
    async fn data_file_read_past_eof_is_empty() {
        let f = DataFile::new("d", b"abc", true);
        assert_eq!(f.read(1, 0, 16).await.unwrap(), b"abc");
        assert!(f.read(1, 3, 16).await.unwrap().is_empty());
        assert!(f.read(1, 100, 16).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn read_only_data_file_rejects_writes() {
        let f = DataFile::new("r", b"", false);
        assert!(matches!(
            f.write(1, 0, b"x").await,
            Err(FsError::Permission(_))
        ));
    }
}
