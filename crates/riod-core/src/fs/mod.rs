//! Synthetic filesystem plumbing: tree primitives, fid dispatch, control
//! files, and the blocking-read engine.

mod ctl;
mod fid;
mod node;
mod server;
mod stream;

pub use ctl::{CtlFile, CtlHandler};
pub use fid::Fid;
pub use node::{path_components, walk, DataFile, Dir, FileNode, FileRef, Node, OpenMode};
pub use server::FileServer;
pub use stream::{OutputStream, StreamMode};
