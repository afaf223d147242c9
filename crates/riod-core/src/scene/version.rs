//! Version store: linear snapshot history with undo/redo/goto.
//!
//! Undoing and then saving a new snapshot discards the redo tail (standard
//! undo semantics). History is trimmed past `max_versions`; version numbers
//! keep increasing monotonically regardless.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::scene::item::SceneItem;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u64,
    pub timestamp: f64,
    pub label: String,
    pub code: String,
    pub items: Vec<SceneItem>,
    /// Primitive namespace variables at snapshot time.
    pub vars: BTreeMap<String, serde_json::Value>,
    pub width: u32,
    pub height: u32,
    pub background: String,
}

impl Snapshot {
    pub fn item_count(&self) -> u32 {
        self.items.len() as u32
    }

    pub fn summary(&self) -> serde_json::Value {
        serde_json::json!({
            "version": self.version,
            "label": self.label,
            "item_count": self.item_count(),
            "timestamp": self.timestamp,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionStore {
    snapshots: Vec<Snapshot>,
    /// Index of the current snapshot, or None when history is empty.
    current: Option<usize>,
    next_version: u64,
    max_versions: usize,
}

pub const DEFAULT_MAX_VERSIONS: usize = 100;

impl Default for VersionStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_VERSIONS)
    }
}

impl VersionStore {
    pub fn new(max_versions: usize) -> Self {
        Self {
            snapshots: Vec::new(),
            current: None,
            next_version: 1,
            max_versions: max_versions.max(1),
        }
    }

    /// Save a snapshot: assigns the next version number, truncates any redo
    /// tail, and becomes current. Returns the version number.
    pub fn save(&mut self, mut snapshot: Snapshot) -> u64 {
        snapshot.version = self.next_version;
        self.next_version += 1;

        if let Some(cur) = self.current {
            self.snapshots.truncate(cur + 1);
        }
        self.snapshots.push(snapshot);
        self.current = Some(self.snapshots.len() - 1);

        if self.snapshots.len() > self.max_versions {
            let excess = self.snapshots.len() - self.max_versions;
            self.snapshots.drain(..excess);
            self.current = Some(self.current.unwrap().saturating_sub(excess));
        }

        self.snapshots[self.current.unwrap()].version
    }

    pub fn can_undo(&self) -> bool {
        matches!(self.current, Some(i) if i > 0)
    }

    pub fn can_redo(&self) -> bool {
        matches!(self.current, Some(i) if i + 1 < self.snapshots.len())
    }

    pub fn undo(&mut self) -> Option<&Snapshot> {
        if !self.can_undo() {
            return None;
        }
        let i = self.current.unwrap() - 1;
        self.current = Some(i);
        Some(&self.snapshots[i])
    }

    pub fn redo(&mut self) -> Option<&Snapshot> {
        if !self.can_redo() {
            return None;
        }
        let i = self.current.unwrap() + 1;
        self.current = Some(i);
        Some(&self.snapshots[i])
    }

    /// Jump to an arbitrary version and clear the redo tail.
    pub fn goto(&mut self, version: u64) -> Option<Snapshot> {
        let idx = self.snapshots.iter().position(|s| s.version == version)?;
        self.current = Some(idx);
        let snap = self.snapshots[idx].clone();
        self.snapshots.truncate(idx + 1);
        self.current = Some(self.snapshots.len() - 1);
        Some(snap)
    }

    pub fn current_version(&self) -> u64 {
        self.current.map(|i| self.snapshots[i].version).unwrap_or(0)
    }

    pub fn current_snapshot(&self) -> Option<&Snapshot> {
        self.current.map(|i| &self.snapshots[i])
    }

    pub fn list(&self) -> &[Snapshot] {
        &self.snapshots
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(label: &str) -> Snapshot {
        Snapshot {
            version: 0,
            timestamp: 0.0,
            label: label.to_string(),
            code: String::new(),
            items: Vec::new(),
            vars: BTreeMap::new(),
            width: 100,
            height: 100,
            background: "#FFFFFF".to_string(),
        }
    }

    #[test]
    fn versions_increase_monotonically() {
        let mut store = VersionStore::default();
        assert_eq!(store.save(snap("a")), 1);
        assert_eq!(store.save(snap("b")), 2);
        assert_eq!(store.current_version(), 2);
    }

    #[test]
    fn undo_then_redo_restores_current_version() {
        let mut store = VersionStore::default();
        store.save(snap("a"));
        store.save(snap("b"));
        let before = store.current_version();
        assert_eq!(store.undo().unwrap().version, 1);
        assert!(store.can_redo());
        assert_eq!(store.redo().unwrap().version, 2);
        assert_eq!(store.current_version(), before);
        assert!(!store.can_redo());
    }

    #[test]
    fn undo_at_oldest_fails() {
        let mut store = VersionStore::default();
        store.save(snap("a"));
        assert!(store.undo().is_none());
        assert_eq!(store.current_version(), 1);
    }

    #[test]
    fn save_after_undo_truncates_redo_tail() {
        let mut store = VersionStore::default();
        store.save(snap("a"));
        store.save(snap("b"));
        store.undo();
        store.save(snap("c"));
        assert!(!store.can_redo());
        assert_eq!(store.current_version(), 3);
        let versions: Vec<u64> = store.list().iter().map(|s| s.version).collect();
        assert_eq!(versions, vec![1, 3]);
    }

    #[test]
    fn goto_jumps_and_clears_redo() {
        let mut store = VersionStore::default();
        store.save(snap("a"));
        store.save(snap("b"));
        store.save(snap("c"));
        assert!(store.goto(1).is_some());
        assert_eq!(store.current_version(), 1);
        assert!(!store.can_redo());
        assert!(store.goto(99).is_none());
    }

    #[test]
    fn history_trims_past_max() {
        let mut store = VersionStore::new(3);
        for i in 0..5 {
            store.save(snap(&format!("s{i}")));
        }
        assert_eq!(store.len(), 3);
        assert_eq!(store.current_version(), 5);
        assert_eq!(store.list()[0].version, 3);
    }
}
