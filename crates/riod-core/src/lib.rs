//! riod-core — synthetic filesystem core for the riod display server.
//!
//! Long-lived state (a versioned scene built from streamed code fragments,
//! PTY-backed terminals, persistent file-to-file routes) is exposed as a
//! tree of named files with blocking-read and write semantics. Clients
//! interact exclusively through file operations; composition happens at
//! the shell level (`cat agent/output > scene/parse`).
//!
//! The 9P wire codec / FUSE bridge is an external collaborator: it drives
//! [`fs::FileServer`] with walk / open / read / write / clunk calls, one
//! task per message. Build a tree with [`RioRoot::new`].
//!
//! # Layout
//! ```text
//! /
//! ├── ctl         refresh/clear/export/import/size/background/save/load
//! ├── screen      PNG of the rendered scene
//! ├── CONTEXT     compacted program text (blocking read)
//! ├── routes      attachment manager surface
//! ├── terms/<id>/ {ctl, stdin, stdout, input, output, interrupt}
//! └── scene/      {ctl, parse, stdout, STDERR, vars, state, version}
//! ```

pub mod config;
pub mod error;
pub mod exec;
pub mod fs;
pub mod root;
pub mod routes;
pub mod sandbox;
pub mod scene;
pub mod term;

pub use config::RioConfig;
pub use error::{FsError, FsResult};
pub use fs::{FileServer, OpenMode};
pub use root::RioRoot;
pub use routes::{RouteEvent, RoutesManager};
pub use sandbox::{Sandbox, Verdict};
pub use scene::{SceneEvent, SceneManager};
pub use term::{TermEvent, TermSession, TermsDir};
