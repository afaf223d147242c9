//! Scene items.
//!
//! Everything the parser creates is a plain-data item: geometry, style,
//! z-order, visibility, plus the variable names that referred to it at
//! registration time. Items are fully serializable — snapshots and the
//! `state` envelope clone them wholesale.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Rect,
    Ellipse,
    Line,
    Text,
    Label,
    Widget,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::Rect => "rect",
            ItemKind::Ellipse => "ellipse",
            ItemKind::Line => "line",
            ItemKind::Text => "text",
            ItemKind::Label => "label",
            ItemKind::Widget => "widget",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneItem {
    pub id: u64,
    pub kind: ItemKind,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    pub z: f64,
    pub opacity: f64,
    pub visible: bool,
    pub color: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Variable names bound to this item after its creating execution.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<String>,
}

impl SceneItem {
    pub fn new(kind: ItemKind, x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            id: 0,
            kind,
            x,
            y,
            width,
            height,
            z: 0.0,
            opacity: 1.0,
            visible: true,
            color: "#4482FF".to_string(),
            text: None,
            variables: Vec::new(),
        }
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    /// Export shape used by `ctl export` and the `state` envelope.
    pub fn to_export(&self) -> serde_json::Value {
        let mut obj = serde_json::json!({
            "id": self.id,
            "class": self.kind.as_str(),
            "x": self.x,
            "y": self.y,
            "width": self.width,
            "height": self.height,
            "z": self.z,
            "opacity": self.opacity,
            "visible": self.visible,
            "color": self.color,
        });
        if let Some(text) = &self.text {
            obj["text"] = serde_json::json!(text);
        }
        if let Some(primary) = self.variables.first() {
            obj["variable"] = serde_json::json!(primary);
            obj["variables"] = serde_json::json!(self.variables);
        }
        obj
    }
}
