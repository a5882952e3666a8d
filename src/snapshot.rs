use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Axis-aligned box in CSS pixels, viewport coordinates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self { width: 1280, height: 800 }
    }
}

/// Scroll offset plus how much document remains below the fold.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct ScrollState {
    pub x: f64,
    pub y: f64,
    pub pixels_below: f64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TabInfo {
    pub id: String,
    pub url: String,
    pub title: String,
    pub active: bool,
}

/// One node of the raw page tree as delivered by the capability surface.
///
/// The adapter fills in visibility/interactability hints at capture time;
/// the element index trusts them but re-checks geometry.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RawNode {
    pub tag: String,
    #[serde(default)]
    pub role: Option<String>,
    /// Accessible name or trimmed visible text.
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub bounds: Rect,
    #[serde(default)]
    pub visible: bool,
    #[serde(default)]
    pub interactable: bool,
    /// Another element covers this one's center point.
    #[serde(default)]
    pub occluded: bool,
    /// CSS selector hint the adapter derived for dispatch. Best effort.
    #[serde(default)]
    pub selector: Option<String>,
    /// Provenance tag when the node came from a nested document.
    #[serde(default)]
    pub frame: Option<String>,
    #[serde(default)]
    pub children: Vec<RawNode>,
}

/// Immutable capture of one page at one instant. Owned by a single step
/// and discarded with it; element references are never carried across
/// snapshots.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: String,
    pub title: String,
    pub viewport: Viewport,
    pub scroll: ScrollState,
    pub tabs: Vec<TabInfo>,
    pub tree: Vec<RawNode>,
    pub captured_at_ms: u64,
}

impl PageSnapshot {
    /// An empty snapshot for a page that yielded no tree (blank tab,
    /// navigation still settling). Valid input for the index builder.
    pub fn empty(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: String::new(),
            viewport: Viewport::default(),
            scroll: ScrollState::default(),
            tabs: Vec::new(),
            tree: Vec::new(),
            captured_at_ms: 0,
        }
    }

    pub fn tab_exists(&self, tab_id: &str) -> bool {
        self.tabs.iter().any(|t| t.id == tab_id)
    }
}
