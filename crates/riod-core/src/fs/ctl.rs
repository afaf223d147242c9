//! Control files.
//!
//! The Plan 9 pattern for steering a service: write single-line commands,
//! read a `key value` status block. A verb that produces output (`export`,
//! `background` with no argument) stores a read-once response — the next
//! read at offset 0 returns it, after which reads return the status again.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::debug;

use crate::error::{FsError, FsResult};
use crate::fs::node::FileNode;

/// Command handler behind a [`CtlFile`].
#[async_trait]
pub trait CtlHandler: Send + Sync {
    /// Execute one command line (`verb [arg]`). Return `Some(text)` to make
    /// the result readable, `None` for silent success. Unknown verbs fail
    /// with [`FsError::Usage`].
    async fn execute(&self, verb: &str, arg: &str) -> FsResult<Option<String>>;

    /// Current status, one `key value` per line.
    async fn status(&self) -> String;
}

pub struct CtlFile {
    name: String,
    handler: Box<dyn CtlHandler>,
    response: Mutex<Option<Arc<String>>>,
    /// Fids currently reading out a response (the whole response stays
    /// addressable across chunked reads on that fid).
    delivering: Mutex<HashMap<u32, Arc<String>>>,
}

impl CtlFile {
    pub fn new(name: impl Into<String>, handler: Box<dyn CtlHandler>) -> Self {
        Self {
            name: name.into(),
            handler,
            response: Mutex::new(None),
            delivering: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl FileNode for CtlFile {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, fid: u32, offset: u64, count: u32) -> FsResult<Vec<u8>> {
        let pending = if offset == 0 {
            let taken = self.response.lock().unwrap().take();
            let mut delivering = self.delivering.lock().unwrap();
            match taken {
                Some(resp) => {
                    delivering.insert(fid, Arc::clone(&resp));
                    Some(resp)
                }
                None => {
                    delivering.remove(&fid);
                    None
                }
            }
        } else {
            self.delivering.lock().unwrap().get(&fid).cloned()
        };
        let content = match pending {
            Some(resp) => {
                let mut r = (*resp).clone();
                if !r.ends_with('\n') {
                    r.push('\n');
                }
                r
            }
            None => self.handler.status().await,
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
            .map_err(|_| FsError::usage("ctl commands must be UTF-8"))?;

        for line in text.split('\n') {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (verb, arg) = match line.split_once(char::is_whitespace) {
                Some((v, a)) => (v, a.trim()),
                None => (line, ""),
            };
            debug!(file = %self.name, verb = verb, "ctl command");
            if let Some(resp) = self.handler.execute(verb, arg).await? {
                *self.response.lock().unwrap() = Some(Arc::new(resp));
            }
        }

        Ok(data.len() as u32)
    }

    async fn clunked(&self, fid: u32) {
        self.delivering.lock().unwrap().remove(&fid);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoHandler;

    #[async_trait]
    impl CtlHandler for EchoHandler {
        async fn execute(&self, verb: &str, arg: &str) -> FsResult<Option<String>> {
            match verb {
                "ping" => Ok(Some(format!("pong {arg}"))),
                "quiet" => Ok(None),
                _ => Err(FsError::usage(format!("unknown command: {verb}"))),
            }
        }

        async fn status(&self) -> String {
            "state idle\n".to_string()
        }
    }

    fn ctl() -> CtlFile {
        CtlFile::new("ctl", Box::new(EchoHandler))
    }

    #[tokio::test]
    async fn status_read_by_default() {
        let f = ctl();
        assert_eq!(f.read(1, 0, 512).await.unwrap(), b"state idle\n");
    }

    #[tokio::test]
    async fn response_is_read_once() {
        let f = ctl();
        f.write(1, 0, b"ping now\n").await.unwrap();
        assert_eq!(f.read(1, 0, 512).await.unwrap(), b"pong now\n");
        assert_eq!(f.read(1, 0, 512).await.unwrap(), b"state idle\n");
    }

    #[tokio::test]
    async fn unknown_verb_is_usage() {
        let f = ctl();
        assert!(matches!(
            f.write(1, 0, b"frobnicate\n").await,
            Err(FsError::Usage(_))
        ));
    }

    #[tokio::test]
    async fn multiple_lines_execute_in_order() {
        let f = ctl();
        f.write(1, 0, b"quiet\nping twice\n").await.unwrap();
        assert_eq!(f.read(1, 0, 512).await.unwrap(), b"pong twice\n");
    }
}
