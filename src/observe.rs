//! Observation builder: renders a snapshot plus its element index into a
//! bounded chunk of text for the model. Pure transform; the only side
//! effect is a diagnostic when truncation kicks in.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::index::ElementIndex;
use crate::snapshot::PageSnapshot;

#[derive(Clone, Debug)]
pub struct ObserveConfig {
    /// Hard ceiling on the rendered observation, in characters.
    pub max_chars: usize,
    /// Context text lines are clipped to this length before rendering.
    pub max_context_line: usize,
}

impl Default for ObserveConfig {
    fn default() -> Self {
        Self { max_chars: 8_000, max_context_line: 200 }
    }
}

/// What the model sees for one step.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Observation {
    pub step_number: usize,
    pub url: String,
    pub title: String,
    pub rendered: String,
    pub available_indices: BTreeSet<usize>,
    pub truncated: bool,
}

pub struct ObservationBuilder {
    cfg: ObserveConfig,
}

impl ObservationBuilder {
    pub fn new(cfg: ObserveConfig) -> Self {
        Self { cfg }
    }

    pub fn build(
        &self,
        snapshot: &PageSnapshot,
        index: &ElementIndex,
        step_number: usize,
    ) -> Observation {
        // The header shares the budget with the body; a page with two
        // hundred tabs must not blow past the ceiling.
        let (header, mut truncated) = self.render_header(snapshot, step_number);

        // Element lines carry an index each; context lines do not.
        let element_lines: Vec<String> =
            index.elements.iter().map(|e| e.to_string()).collect();
        let context_lines: Vec<String> = index
            .context
            .iter()
            .map(|t| clip(t, self.cfg.max_context_line))
            .collect();

        let budget = self.cfg.max_chars.saturating_sub(header.len());
        let (body, body_truncated) = fit_lines(&element_lines, &context_lines, budget);
        truncated |= body_truncated;
        if truncated {
            debug!(
                step = step_number,
                elements = index.len(),
                budget = self.cfg.max_chars,
                "observation truncated to fit budget"
            );
        }

        let mut rendered = header;
        rendered.push_str(&body);

        Observation {
            step_number,
            url: snapshot.url.clone(),
            title: snapshot.title.clone(),
            rendered,
            available_indices: index.elements.iter().map(|e| e.index).collect(),
            truncated,
        }
    }

    /// Render the header within the overall budget. The tab list is the
    /// only droppable part: the active tab is placed first so it survives
    /// any trimming, the rest follow in snapshot order until the budget
    /// runs out.
    fn render_header(&self, snapshot: &PageSnapshot, step_number: usize) -> (String, bool) {
        let clip_to = self.cfg.max_context_line;
        let mut lines: Vec<String> = vec![format!("Step {}", step_number)];
        lines.push(clip(&format!("URL: {}", snapshot.url), clip_to));
        if !snapshot.title.is_empty() {
            lines.push(clip(&format!("Title: {}", snapshot.title), clip_to));
        }
        if snapshot.scroll.y > 0.0 || snapshot.scroll.pixels_below > 0.0 {
            lines.push(format!(
                "Scroll: {:.0}px down, {:.0}px below the fold",
                snapshot.scroll.y, snapshot.scroll.pixels_below
            ));
        }
        let closing = "Interactive elements:";
        let essential: usize =
            lines.iter().map(|l| l.len() + 1).sum::<usize>() + closing.len() + 1;

        let mut truncated = false;
        if snapshot.tabs.len() > 1 {
            let tabs_header = "Tabs:";
            let mut remaining = self
                .cfg
                .max_chars
                .saturating_sub(essential + tabs_header.len() + 1);
            let ordered = snapshot
                .tabs
                .iter()
                .filter(|t| t.active)
                .chain(snapshot.tabs.iter().filter(|t| !t.active));
            let mut tab_lines: Vec<String> = Vec::new();
            for tab in ordered {
                let marker = if tab.active { "*" } else { " " };
                let line = clip(
                    &format!("{} [{}] {} — {}", marker, tab.id, tab.title, tab.url),
                    clip_to,
                );
                if line.len() + 1 > remaining {
                    truncated = true;
                    break;
                }
                remaining -= line.len() + 1;
                tab_lines.push(line);
            }
            if !tab_lines.is_empty() {
                lines.push(tabs_header.to_string());
                lines.append(&mut tab_lines);
            }
        }
        lines.push(closing.to_string());

        let mut out = String::new();
        for line in &lines {
            out.push_str(line);
            out.push('\n');
        }
        (out, truncated)
    }
}

/// Deterministic truncation: whole lines only, so an element's index is
/// never severed from its description. Context goes first, then element
/// lines are dropped from the tail.
fn fit_lines(elements: &[String], context: &[String], budget: usize) -> (String, bool) {
    let full_len = |lines: &[String]| -> usize {
        lines.iter().map(|l| l.len() + 1).sum::<usize>()
    };

    let elements_len = full_len(elements);
    let context_len = full_len(context);

    let mut truncated = false;
    let mut out = String::new();

    // Elements first, trimmed from the tail if even they alone overflow.
    let mut kept_elements = elements.len();
    if elements_len > budget {
        truncated = true;
        let mut used = 0usize;
        kept_elements = 0;
        for line in elements {
            if used + line.len() + 1 > budget {
                break;
            }
            used += line.len() + 1;
            kept_elements += 1;
        }
    }
    for line in &elements[..kept_elements] {
        out.push_str(line);
        out.push('\n');
    }
    if kept_elements < elements.len() {
        return (out, true);
    }

    // Context fills whatever budget remains.
    let remaining = budget.saturating_sub(elements_len);
    if context.is_empty() {
        return (out, truncated);
    }
    let context_header = "Page text:\n";
    if context_len + context_header.len() <= remaining {
        out.push_str(context_header);
        for line in context {
            out.push_str(line);
            out.push('\n');
        }
        return (out, truncated);
    }

    truncated = true;
    let mut used = context_header.len();
    let mut kept = 0usize;
    for line in context {
        if used + line.len() + 1 > remaining {
            break;
        }
        used += line.len() + 1;
        kept += 1;
    }
    if kept > 0 {
        out.push_str(context_header);
        for line in &context[..kept] {
            out.push_str(line);
            out.push('\n');
        }
    }
    (out, truncated)
}

fn clip(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}
