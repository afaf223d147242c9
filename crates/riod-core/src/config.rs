//! Server configuration.
//!
//! Plumbed explicitly into every constructor — there are no module-level
//! singletons, so tests can instantiate several independent trees.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Configuration for one riod tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RioConfig {
    /// Scene width in scene units.
    pub width: u32,
    /// Scene height in scene units.
    pub height: u32,
    /// Scene background color, `#RRGGBB`.
    pub background: String,
    /// Where this server's tree appears in the client namespace.
    /// Route paths written without a leading `/` are joined to this.
    pub rio_mount: String,
    /// Where the agent filesystem is mounted; `terms/*/input` forwards to
    /// `<llmfs_mount>/agents/<name>/input`.
    pub llmfs_mount: String,
    /// Root under which the sandbox permits writes.
    pub writable_root: String,
    /// Quiet interval before a terminal's `stdout` batch is marked ready.
    pub stdout_debounce_ms: u64,
    /// When false, the sandbox is replaced by a permissive fallback.
    pub sandbox_enabled: bool,
    /// Default path for `ctl save` / `ctl load`.
    pub state_path: PathBuf,
}

impl Default for RioConfig {
    fn default() -> Self {
        let state_path = std::env::var_os("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join(".riod_state.json");
        Self {
            width: 3840,
            height: 2160,
            background: "#FAFAFA".to_string(),
            rio_mount: "/n/rio".to_string(),
            llmfs_mount: "/n/llm".to_string(),
            writable_root: "/n".to_string(),
            stdout_debounce_ms: 120,
            sandbox_enabled: true,
            state_path,
        }
    }
}
