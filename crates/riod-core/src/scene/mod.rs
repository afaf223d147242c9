//! Scene subsystem: registered items, the version store, the execution
//! pipeline glue, and the scene file surface.

pub mod files;
pub mod item;
pub mod manager;
pub mod screenshot;
pub mod version;

pub use files::{
    ContextFile, ExecPipeline, ParseFile, SceneCtlHandler, ScreenFile, StateFile, StreamOutFile,
    VarsFile, VersionFile,
};
pub use item::{ItemKind, SceneItem};
pub use manager::{SceneEvent, SceneManager};
pub use version::{Snapshot, VersionStore};
