//! Scene manager.
//!
//! Owns the registered items, the display settings, and the version store.
//! Only parser-registered items live here — there is no infrastructure
//! tier to protect, so clear/undo/redo affect everything registered.
//!
//! Mutations happen inside short critical sections; the manager itself has
//! no interior locking. Callers hold it behind `Arc<tokio::sync::Mutex<_>>`
//! and never keep the lock across file I/O.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::config::RioConfig;
use crate::error::{FsError, FsResult};
use crate::scene::item::SceneItem;
use crate::scene::version::{Snapshot, VersionStore};

/// Change notifications for embedding UIs.
#[derive(Debug, Clone)]
pub enum SceneEvent {
    Added { item_id: u64 },
    Removed { item_id: u64 },
    Cleared { count: usize },
    Refreshed,
    Restored { version: u64 },
}

pub struct SceneManager {
    pub width: u32,
    pub height: u32,
    pub background: String,
    items: BTreeMap<u64, SceneItem>,
    next_id: u64,
    pub versions: VersionStore,
    events: broadcast::Sender<SceneEvent>,
}

/// On-disk form for `ctl save` / `ctl load` crash recovery.
#[derive(Serialize, Deserialize)]
struct PersistedState {
    width: u32,
    height: u32,
    background: String,
    next_id: u64,
    versions: VersionStore,
}

impl SceneManager {
    pub fn new(config: &RioConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            width: config.width,
            height: config.height,
            background: config.background.clone(),
            items: BTreeMap::new(),
            next_id: 1,
            versions: VersionStore::default(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SceneEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: SceneEvent) {
        let _ = self.events.send(event);
    }

    // ========== Item registration ==========

    /// Register a parsed item; the sole entry point into the version system.
    pub fn register_item(&mut self, mut item: SceneItem) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        item.id = id;
        self.items.insert(id, item);
        self.notify(SceneEvent::Added { item_id: id });
        id
    }

    pub fn remove_item(&mut self, id: u64) -> bool {
        if self.items.remove(&id).is_some() {
            self.notify(SceneEvent::Removed { item_id: id });
            true
        } else {
            false
        }
    }

    pub fn get_item(&self, id: u64) -> Option<&SceneItem> {
        self.items.get(&id)
    }

    pub fn get_item_mut(&mut self, id: u64) -> Option<&mut SceneItem> {
        self.items.get_mut(&id)
    }

    pub fn has_item(&self, id: u64) -> bool {
        self.items.contains_key(&id)
    }

    pub fn list_parsed_items(&self) -> Vec<u64> {
        self.items.keys().copied().collect()
    }

    pub fn items(&self) -> impl Iterator<Item = &SceneItem> {
        self.items.values()
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }

    // ========== Scene operations ==========

    /// Remove every registered item. The caller decides whether to snapshot
    /// first (root `ctl clear` does, `state` restore does not).
    pub fn clear(&mut self) {
        let count = self.items.len();
        self.items.clear();
        self.notify(SceneEvent::Cleared { count });
    }

    pub fn refresh(&mut self) {
        self.notify(SceneEvent::Refreshed);
    }

    pub fn to_json(&self) -> String {
        let items: Vec<serde_json::Value> = self.items.values().map(|i| i.to_export()).collect();
        serde_json::to_string_pretty(&serde_json::json!({
            "width": self.width,
            "height": self.height,
            "background": self.background,
            "items": items,
        }))
        .unwrap_or_else(|_| "{}".to_string())
    }

    /// Replace the scene from an export payload.
    pub fn from_json(&mut self, payload: &str) -> FsResult<usize> {
        let parsed: serde_json::Value = serde_json::from_str(payload)
            .map_err(|e| FsError::usage(format!("import: invalid JSON: {e}")))?;

        let items = parsed
            .get("items")
            .and_then(|v| v.as_array())
            .ok_or_else(|| FsError::usage("import: missing items array"))?;

        if let Some(w) = parsed.get("width").and_then(|v| v.as_u64()) {
            self.width = w as u32;
        }
        if let Some(h) = parsed.get("height").and_then(|v| v.as_u64()) {
            self.height = h as u32;
        }
        if let Some(bg) = parsed.get("background").and_then(|v| v.as_str()) {
            self.background = bg.to_string();
        }

        self.clear();
        let mut imported = 0;
        for entry in items {
            match import_item(entry) {
                Some(item) => {
                    self.register_item(item);
                    imported += 1;
                }
                None => warn!("import: skipping malformed item entry"),
            }
        }
        Ok(imported)
    }

    // ========== Snapshots ==========

    /// Capture the scene plus the given label/code/vars as a new version.
    pub fn take_snapshot(
        &mut self,
        label: &str,
        code: &str,
        vars: BTreeMap<String, serde_json::Value>,
    ) -> u64 {
        let snapshot = Snapshot {
            version: 0,
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            label: label.to_string(),
            code: code.to_string(),
            items: self.items.values().cloned().collect(),
            vars,
            width: self.width,
            height: self.height,
            background: self.background.clone(),
        };
        self.versions.save(snapshot)
    }

    fn restore_snapshot(&mut self, snapshot: Snapshot) -> u64 {
        self.width = snapshot.width;
        self.height = snapshot.height;
        self.background = snapshot.background.clone();
        self.items = snapshot.items.iter().map(|i| (i.id, i.clone())).collect();
        self.next_id = self
            .items
            .keys()
            .max()
            .map(|m| m + 1)
            .unwrap_or(1)
            .max(self.next_id);
        self.notify(SceneEvent::Restored {
            version: snapshot.version,
        });
        snapshot.version
    }

    pub fn undo(&mut self) -> Option<u64> {
        let snapshot = self.versions.undo()?.clone();
        Some(self.restore_snapshot(snapshot))
    }

    pub fn redo(&mut self) -> Option<u64> {
        let snapshot = self.versions.redo()?.clone();
        Some(self.restore_snapshot(snapshot))
    }

    pub fn goto_version(&mut self, version: u64) -> Option<u64> {
        let snapshot = self.versions.goto(version)?;
        Some(self.restore_snapshot(snapshot))
    }

    // ========== Crash recovery ==========

    pub fn save_state(&self, path: &Path) -> FsResult<()> {
        let state = PersistedState {
            width: self.width,
            height: self.height,
            background: self.background.clone(),
            next_id: self.next_id,
            versions: self.versions.clone(),
        };
        let json = serde_json::to_string_pretty(&state)
            .map_err(|e| FsError::io(format!("serialize state: {e}")))?;
        std::fs::write(path, json).map_err(|e| FsError::io(format!("save {path:?}: {e}")))?;
        info!(path = %path.display(), versions = self.versions.len(), "scene state saved");
        Ok(())
    }

    /// Load version history from disk. Items are restored from the current
    /// snapshot; bindings come back only through `state`-file replay.
    pub fn load_state(&mut self, path: &Path) -> FsResult<()> {
        let json =
            std::fs::read_to_string(path).map_err(|e| FsError::io(format!("load {path:?}: {e}")))?;
        let state: PersistedState = serde_json::from_str(&json)
            .map_err(|e| FsError::CorruptState(format!("{}: {e}", path.display())))?;

        self.width = state.width;
        self.height = state.height;
        self.background = state.background;
        self.next_id = state.next_id;
        self.versions = state.versions;
        if let Some(snapshot) = self.versions.current_snapshot().cloned() {
            self.restore_snapshot(snapshot);
        }
        info!(path = %path.display(), versions = self.versions.len(), "scene state loaded");
        Ok(())
    }
}

fn import_item(entry: &serde_json::Value) -> Option<SceneItem> {
    use crate::scene::item::ItemKind;

    let kind = match entry.get("class").and_then(|v| v.as_str())? {
        "rect" => ItemKind::Rect,
        "ellipse" => ItemKind::Ellipse,
        "line" => ItemKind::Line,
        "text" => ItemKind::Text,
        "label" => ItemKind::Label,
        "widget" => ItemKind::Widget,
        _ => return None,
    };
    let num = |key: &str, default: f64| entry.get(key).and_then(|v| v.as_f64()).unwrap_or(default);

    let mut item = SceneItem::new(
        kind,
        num("x", 0.0),
        num("y", 0.0),
        num("width", 0.0),
        num("height", 0.0),
    );
    item.z = num("z", 0.0);
    item.opacity = num("opacity", 1.0);
    item.visible = entry.get("visible").and_then(|v| v.as_bool()).unwrap_or(true);
    if let Some(color) = entry.get("color").and_then(|v| v.as_str()) {
        item.color = color.to_string();
    }
    if let Some(text) = entry.get("text").and_then(|v| v.as_str()) {
        item.text = Some(text.to_string());
    }
    if let Some(vars) = entry.get("variables").and_then(|v| v.as_array()) {
        item.variables = vars
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect();
    }
    Some(item)
}
