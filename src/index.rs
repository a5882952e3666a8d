//! Element index: deterministic flattening of a page snapshot into
//! numbered interactable elements plus lesser-weight text context.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::snapshot::{PageSnapshot, RawNode, Rect};

#[derive(Clone, Debug)]
pub struct IndexConfig {
    /// Keep elements the capture marked invisible.
    pub include_hidden: bool,
    /// Elements farther off-viewport than this many pixels are dropped.
    pub viewport_margin: f64,
    /// Subtrees deeper than this are skipped (guards degenerate or cyclic
    /// captures), logged, never fatal.
    pub max_depth: usize,
    /// Context text lines shorter than this are noise and dropped.
    pub min_context_len: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            include_hidden: false,
            viewport_margin: 800.0,
            max_depth: 128,
            min_context_len: 3,
        }
    }
}

/// An interactable element with its snapshot-scoped handle. Indices are
/// 1-based, unique within one snapshot, and meaningless outside it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexedElement {
    pub index: usize,
    pub tag: String,
    pub role: Option<String>,
    pub text: String,
    pub attributes: BTreeMap<String, String>,
    pub bounds: Rect,
    pub interactable: bool,
    pub occluded: bool,
    pub selector: Option<String>,
    pub frame: Option<String>,
}

impl fmt::Display for IndexedElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] <{}", self.index, self.tag)?;
        if let Some(t) = self.attributes.get("type") {
            if t != "text" {
                write!(f, " type=\"{}\"", t)?;
            }
        }
        f.write_str(">")?;
        if !self.text.is_empty() {
            write!(f, " \"{}\"", self.text)?;
        }
        if let Some(p) = self.attributes.get("placeholder") {
            write!(f, " placeholder=\"{}\"", p)?;
        }
        if let Some(v) = self.attributes.get("value") {
            if !v.is_empty() {
                write!(f, " value=\"{}\"", v)?;
            }
        }
        if let Some(ref r) = self.role {
            let redundant = (r == "button" && self.tag == "button")
                || (r == "link" && self.tag == "a");
            if !redundant {
                write!(f, " role=\"{}\"", r)?;
            }
        }
        if let Some(ref fr) = self.frame {
            write!(f, " frame=\"{}\"", fr)?;
        }
        if self.occluded {
            f.write_str(" (occluded)")?;
        }
        Ok(())
    }
}

/// Flattened view of one snapshot. Built once per step, discarded with it.
#[derive(Clone, Debug, Default)]
pub struct ElementIndex {
    pub elements: Vec<IndexedElement>,
    /// Non-interactable visible text, in document order.
    pub context: Vec<String>,
    /// Subtrees skipped during the walk (depth guard, degenerate geometry).
    pub skipped_subtrees: usize,
}

impl ElementIndex {
    /// Depth-first walk of the snapshot tree. Same tree in, same indices
    /// and ordering out.
    pub fn build(snapshot: &PageSnapshot) -> Self {
        Self::build_with(snapshot, &IndexConfig::default())
    }

    pub fn build_with(snapshot: &PageSnapshot, cfg: &IndexConfig) -> Self {
        let mut out = ElementIndex::default();
        let mut next_index = 1usize;
        for node in &snapshot.tree {
            walk(node, 0, cfg, snapshot, &mut next_index, &mut out);
        }
        if out.skipped_subtrees > 0 {
            warn!(
                skipped = out.skipped_subtrees,
                url = %snapshot.url,
                "element index skipped malformed subtrees"
            );
        }
        out
    }

    pub fn get(&self, index: usize) -> Option<&IndexedElement> {
        // Indices are assigned contiguously from 1 in push order.
        index
            .checked_sub(1)
            .and_then(|i| self.elements.get(i))
            .filter(|e| e.index == index)
    }

    pub fn contains(&self, index: usize) -> bool {
        self.get(index).is_some()
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

fn walk(
    node: &RawNode,
    depth: usize,
    cfg: &IndexConfig,
    snapshot: &PageSnapshot,
    next_index: &mut usize,
    out: &mut ElementIndex,
) {
    if depth > cfg.max_depth {
        out.skipped_subtrees += 1;
        return;
    }
    if node.tag.is_empty() {
        // Degenerate capture node. Skip it and its children wholesale.
        out.skipped_subtrees += 1;
        return;
    }

    let keep = cfg.include_hidden || is_renderable(node, cfg, snapshot);
    if keep {
        if node.interactable {
            let el = IndexedElement {
                index: *next_index,
                tag: node.tag.clone(),
                role: node.role.clone(),
                text: node.text.clone(),
                attributes: node.attributes.clone(),
                bounds: node.bounds,
                interactable: true,
                occluded: node.occluded,
                selector: node.selector.clone(),
                frame: node.frame.clone(),
            };
            out.elements.push(el);
            *next_index += 1;
        } else if node.text.chars().count() >= cfg.min_context_len && node.children.is_empty() {
            // Leaf text only; interior nodes repeat their children's text.
            out.context.push(node.text.clone());
        }
    }

    for child in &node.children {
        walk(child, depth + 1, cfg, snapshot, next_index, out);
    }
}

fn is_renderable(node: &RawNode, cfg: &IndexConfig, snapshot: &PageSnapshot) -> bool {
    if !node.visible {
        return false;
    }
    if node.bounds.area() < 1.0 {
        return false;
    }
    let vw = snapshot.viewport.width as f64;
    let vh = snapshot.viewport.height as f64;
    let b = &node.bounds;
    if b.x + b.width < -cfg.viewport_margin
        || b.y + b.height < -cfg.viewport_margin
        || b.x > vw + cfg.viewport_margin
        || b.y > vh + cfg.viewport_margin
    {
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Viewport;

    fn node(tag: &str, text: &str, interactable: bool) -> RawNode {
        RawNode {
            tag: tag.into(),
            text: text.into(),
            visible: true,
            interactable,
            bounds: Rect { x: 10.0, y: 10.0, width: 100.0, height: 20.0 },
            ..Default::default()
        }
    }

    fn snapshot_with(tree: Vec<RawNode>) -> PageSnapshot {
        let mut s = PageSnapshot::empty("https://example.com");
        s.viewport = Viewport { width: 1280, height: 800 };
        s.tree = tree;
        s
    }

    #[test]
    fn context_threshold_counts_characters_not_bytes() {
        // Two CJK characters are six bytes but still below a threshold of 3.
        let snap = snapshot_with(vec![node("p", "日本", false), node("p", "日本語", false)]);
        let idx = ElementIndex::build(&snap);
        assert_eq!(idx.context, vec!["日本語".to_string()]);
    }

    #[test]
    fn indices_are_one_based_and_contiguous() {
        let snap = snapshot_with(vec![
            node("button", "One", true),
            node("p", "just text", false),
            node("a", "Two", true),
        ]);
        let idx = ElementIndex::build(&snap);
        assert_eq!(idx.len(), 2);
        assert_eq!(idx.elements[0].index, 1);
        assert_eq!(idx.elements[1].index, 2);
        assert!(idx.contains(1) && idx.contains(2));
        assert!(!idx.contains(0) && !idx.contains(3));
        assert_eq!(idx.context, vec!["just text".to_string()]);
    }

    #[test]
    fn build_is_idempotent_on_identical_snapshots() {
        let mut root = node("div", "", false);
        root.children = vec![
            node("input", "Search", true),
            node("button", "Go", true),
            node("span", "hint text", false),
        ];
        let snap = snapshot_with(vec![root]);
        let a = ElementIndex::build(&snap);
        let b = ElementIndex::build(&snap.clone());
        assert_eq!(a.len(), b.len());
        for (x, y) in a.elements.iter().zip(&b.elements) {
            assert_eq!(x.index, y.index);
            assert_eq!(x.tag, y.tag);
            assert_eq!(x.text, y.text);
        }
        assert_eq!(a.context, b.context);
    }

    #[test]
    fn depth_first_ordering() {
        let mut outer = node("div", "", false);
        let mut inner = node("form", "", false);
        inner.children = vec![node("input", "query", true)];
        outer.children = vec![inner, node("button", "Submit", true)];
        let snap = snapshot_with(vec![outer, node("a", "Footer", true)]);
        let idx = ElementIndex::build(&snap);
        let tags: Vec<&str> = idx.elements.iter().map(|e| e.tag.as_str()).collect();
        assert_eq!(tags, vec!["input", "button", "a"]);
    }

    #[test]
    fn invisible_and_zero_area_filtered() {
        let mut hidden = node("button", "Hidden", true);
        hidden.visible = false;
        let mut flat = node("button", "Flat", true);
        flat.bounds = Rect { x: 0.0, y: 0.0, width: 0.0, height: 0.0 };
        let snap = snapshot_with(vec![hidden, flat, node("button", "Real", true)]);
        let idx = ElementIndex::build(&snap);
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.elements[0].text, "Real");
    }

    #[test]
    fn include_hidden_keeps_everything() {
        let mut hidden = node("button", "Hidden", true);
        hidden.visible = false;
        let snap = snapshot_with(vec![hidden]);
        let cfg = IndexConfig { include_hidden: true, ..Default::default() };
        let idx = ElementIndex::build_with(&snap, &cfg);
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn far_off_viewport_filtered_but_margin_respected() {
        let mut near = node("button", "Near", true);
        near.bounds = Rect { x: 10.0, y: 900.0, width: 100.0, height: 20.0 };
        let mut far = node("button", "Far", true);
        far.bounds = Rect { x: 10.0, y: 5000.0, width: 100.0, height: 20.0 };
        let snap = snapshot_with(vec![near, far]);
        let idx = ElementIndex::build(&snap);
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.elements[0].text, "Near");
    }

    #[test]
    fn occluded_elements_flagged_not_dropped() {
        let mut covered = node("button", "Covered", true);
        covered.occluded = true;
        let snap = snapshot_with(vec![covered]);
        let idx = ElementIndex::build(&snap);
        assert_eq!(idx.len(), 1);
        assert!(idx.elements[0].occluded);
        assert!(idx.elements[0].to_string().contains("(occluded)"));
    }

    #[test]
    fn iframe_provenance_carried_through() {
        let mut framed = node("button", "Pay", true);
        framed.frame = Some("checkout-frame".into());
        let snap = snapshot_with(vec![framed]);
        let idx = ElementIndex::build(&snap);
        assert_eq!(idx.elements[0].frame.as_deref(), Some("checkout-frame"));
        assert!(idx.elements[0].to_string().contains("frame=\"checkout-frame\""));
    }

    #[test]
    fn overdeep_subtree_skipped_not_fatal() {
        let mut leaf = node("button", "Deep", true);
        for _ in 0..200 {
            let mut wrap = node("div", "", false);
            wrap.children = vec![leaf];
            leaf = wrap;
        }
        let snap = snapshot_with(vec![leaf, node("button", "Shallow", true)]);
        let idx = ElementIndex::build(&snap);
        assert!(idx.skipped_subtrees > 0);
        assert!(idx.elements.iter().any(|e| e.text == "Shallow"));
        assert!(!idx.elements.iter().any(|e| e.text == "Deep"));
    }

    #[test]
    fn empty_tag_subtree_skipped() {
        let mut broken = RawNode::default();
        broken.children = vec![node("button", "Orphan", true)];
        let snap = snapshot_with(vec![broken, node("a", "Ok", true)]);
        let idx = ElementIndex::build(&snap);
        assert_eq!(idx.skipped_subtrees, 1);
        assert_eq!(idx.len(), 1);
        assert_eq!(idx.elements[0].text, "Ok");
    }

    #[test]
    fn element_line_rendering() {
        let snap = snapshot_with(vec![node("button", "Submit", true)]);
        let idx = ElementIndex::build(&snap);
        assert_eq!(idx.elements[0].to_string(), "[1] <button> \"Submit\"");
    }
}
