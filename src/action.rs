//! The closed action vocabulary, the model-reply decoder and per-action
//! validation against the current snapshot.

use serde::{Deserialize, Serialize};

use crate::error::{InvalidAction, ParseError};
use crate::index::ElementIndex;
use crate::snapshot::PageSnapshot;

pub const MAX_WAIT_SECONDS: u64 = 30;
pub const MAX_SCROLL_AMOUNT: u32 = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
}

/// Everything the model may ask for. Proposed by the model, validated by
/// the executor, applied or rejected with a reason.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Navigate { url: String },
    GoBack,
    Click { index: usize },
    InputText { index: usize, text: String },
    SendKeys { keys: String },
    Scroll { direction: ScrollDirection, amount: Option<u32> },
    SelectOption { index: usize, option: String },
    SwitchTab { tab_id: String },
    Wait { seconds: u64 },
    /// Terminal. Carries the task's answer and a success flag; performs no
    /// browser side effect.
    Done { result: String, success: bool },
}

impl Action {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Action::Done { .. })
    }

    /// Short human-readable form for logs and history summaries.
    pub fn describe(&self) -> String {
        match self {
            Action::Navigate { url } => format!("navigate {url}"),
            Action::GoBack => "go_back".into(),
            Action::Click { index } => format!("click [{index}]"),
            Action::InputText { index, text } => {
                format!("input [{index}] \"{}\"", clip(text, 40))
            }
            Action::SendKeys { keys } => format!("send_keys {keys}"),
            Action::Scroll { direction, amount } => match amount {
                Some(px) => format!("scroll {direction:?} {px}px").to_lowercase(),
                None => format!("scroll {direction:?}").to_lowercase(),
            },
            Action::SelectOption { index, option } => {
                format!("select [{index}] \"{}\"", clip(option, 40))
            }
            Action::SwitchTab { tab_id } => format!("switch_tab {tab_id}"),
            Action::Wait { seconds } => format!("wait {seconds}s"),
            Action::Done { success, .. } => format!("done success={success}"),
        }
    }

    /// Check this action against the snapshot taken immediately before
    /// execution. Never touches the browser.
    pub fn validate(
        &self,
        index: &ElementIndex,
        snapshot: &PageSnapshot,
    ) -> Result<(), InvalidAction> {
        match self {
            Action::Navigate { url } => {
                if !(url.starts_with("http://") || url.starts_with("https://") || url == "about:blank") {
                    return Err(InvalidAction::new(format!(
                        "navigate requires an http(s) url, got \"{}\"",
                        clip(url, 80)
                    )));
                }
                Ok(())
            }
            Action::GoBack => Ok(()),
            Action::Click { index: i } | Action::SelectOption { index: i, .. } => {
                require_index(index, *i)
            }
            Action::InputText { index: i, text } => {
                if text.is_empty() {
                    return Err(InvalidAction::new("input_text with empty text"));
                }
                require_index(index, *i)
            }
            Action::SendKeys { keys } => {
                if keys.is_empty() {
                    return Err(InvalidAction::new("send_keys with empty keys"));
                }
                Ok(())
            }
            Action::Scroll { amount, .. } => {
                if let Some(px) = amount {
                    if *px == 0 || *px > MAX_SCROLL_AMOUNT {
                        return Err(InvalidAction::new(format!(
                            "scroll amount {px} out of range 1..={MAX_SCROLL_AMOUNT}"
                        )));
                    }
                }
                Ok(())
            }
            Action::SwitchTab { tab_id } => {
                if !snapshot.tab_exists(tab_id) {
                    return Err(InvalidAction::new(format!("unknown tab \"{tab_id}\"")));
                }
                Ok(())
            }
            Action::Wait { seconds } => {
                if *seconds == 0 || *seconds > MAX_WAIT_SECONDS {
                    return Err(InvalidAction::new(format!(
                        "wait {seconds}s out of range 1..={MAX_WAIT_SECONDS}"
                    )));
                }
                Ok(())
            }
            Action::Done { .. } => Ok(()),
        }
    }
}

fn require_index(index: &ElementIndex, i: usize) -> Result<(), InvalidAction> {
    if index.contains(i) {
        Ok(())
    } else {
        Err(InvalidAction::new(format!(
            "index {i} does not exist in the current snapshot ({} elements)",
            index.len()
        )))
    }
}

fn clip(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut out: String = s.chars().take(max).collect();
        out.push('…');
        out
    }
}

/// What happened when one action was applied (or rejected).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    /// Short description of the observed effect, for history and logs.
    pub observed_effect: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<crate::error::StepError>,
}

impl ActionOutcome {
    pub fn ok(effect: impl Into<String>) -> Self {
        Self { success: true, observed_effect: effect.into(), error: None }
    }

    pub fn failed(error: impl Into<crate::error::StepError>) -> Self {
        let error = error.into();
        Self {
            success: false,
            observed_effect: error.to_string(),
            error: Some(error),
        }
    }
}

/// How forgiving the reply decoder is about the text around the JSON.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParseMode {
    /// The reply must be exactly one JSON object.
    Strict,
    /// Also accept fenced/prose-wrapped replies; the first JSON object wins.
    #[default]
    Lenient,
}

/// One decoded model turn: optional free-text reasoning plus the ordered
/// action sequence to apply this step.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelDecision {
    #[serde(default)]
    pub thinking: Option<String>,
    #[serde(default)]
    pub actions: Vec<Action>,
}

/// Decode free model text into a [`ModelDecision`]. Unparseable input is a
/// typed error, never a silent no-op.
pub fn parse_reply(text: &str, mode: ParseMode) -> Result<ModelDecision, ParseError> {
    let candidate = match mode {
        ParseMode::Strict => text.trim().to_string(),
        ParseMode::Lenient => extract_json_object(text)
            .ok_or_else(|| ParseError::new("no JSON object found in reply", text))?,
    };

    let decision: ModelDecision = serde_json::from_str(&candidate)
        .map_err(|e| ParseError::new(format!("bad action JSON: {e}"), text))?;

    if decision.actions.is_empty() {
        return Err(ParseError::new("reply contains no actions", text));
    }
    Ok(decision)
}

/// Find the first balanced `{...}` in the text, skipping markdown fences.
/// Quote-aware so braces inside string values do not confuse the scan.
fn extract_json_object(text: &str) -> Option<String> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..=i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{RawNode, Rect, TabInfo};

    fn fixture() -> (ElementIndex, PageSnapshot) {
        let mut snap = PageSnapshot::empty("https://example.com");
        snap.tabs = vec![TabInfo {
            id: "t1".into(),
            url: snap.url.clone(),
            title: "Example".into(),
            active: true,
        }];
        snap.tree = (0..3)
            .map(|i| RawNode {
                tag: "button".into(),
                text: format!("B{i}"),
                visible: true,
                interactable: true,
                bounds: Rect { x: 0.0, y: 0.0, width: 50.0, height: 20.0 },
                ..Default::default()
            })
            .collect();
        let idx = ElementIndex::build(&snap);
        (idx, snap)
    }

    #[test]
    fn roundtrip_tagged_json() {
        let a = Action::Click { index: 4 };
        let json = serde_json::to_string(&a).unwrap();
        assert_eq!(json, r#"{"type":"click","index":4}"#);
        assert_eq!(serde_json::from_str::<Action>(&json).unwrap(), a);
    }

    #[test]
    fn parse_strict_accepts_bare_object() {
        let reply = r#"{"thinking":"go","actions":[{"type":"navigate","url":"https://example.com"}]}"#;
        let d = parse_reply(reply, ParseMode::Strict).unwrap();
        assert_eq!(d.actions.len(), 1);
        assert_eq!(d.thinking.as_deref(), Some("go"));
    }

    #[test]
    fn parse_strict_rejects_fenced() {
        let reply = "```json\n{\"actions\":[{\"type\":\"go_back\"}]}\n```";
        assert!(parse_reply(reply, ParseMode::Strict).is_err());
    }

    #[test]
    fn parse_lenient_accepts_fenced_and_prose() {
        let reply = "Sure, here is the plan:\n```json\n{\"actions\":[{\"type\":\"click\",\"index\":2}]}\n```\nDone.";
        let d = parse_reply(reply, ParseMode::Lenient).unwrap();
        assert_eq!(d.actions, vec![Action::Click { index: 2 }]);
    }

    #[test]
    fn parse_lenient_handles_braces_inside_strings() {
        let reply = r#"{"actions":[{"type":"input_text","index":1,"text":"weird {stuff}"}]}"#;
        let d = parse_reply(reply, ParseMode::Lenient).unwrap();
        assert_eq!(d.actions.len(), 1);
    }

    #[test]
    fn unknown_action_kind_is_parse_error() {
        let reply = r#"{"actions":[{"type":"teleport","index":1}]}"#;
        let err = parse_reply(reply, ParseMode::Lenient).unwrap_err();
        assert!(err.reason.contains("bad action JSON"));
    }

    #[test]
    fn empty_actions_is_parse_error() {
        let err = parse_reply(r#"{"actions":[]}"#, ParseMode::Lenient).unwrap_err();
        assert!(err.reason.contains("no actions"));
    }

    #[test]
    fn no_json_at_all_is_parse_error() {
        assert!(parse_reply("I cannot help with that.", ParseMode::Lenient).is_err());
    }

    #[test]
    fn validate_stale_index_rejected() {
        let (idx, snap) = fixture();
        let err = Action::Click { index: 57 }.validate(&idx, &snap).unwrap_err();
        assert!(err.reason.contains("57"));
        assert!(Action::Click { index: 3 }.validate(&idx, &snap).is_ok());
        assert!(Action::Click { index: 0 }.validate(&idx, &snap).is_err());
    }

    #[test]
    fn validate_argument_ranges() {
        let (idx, snap) = fixture();
        assert!(Action::Wait { seconds: 0 }.validate(&idx, &snap).is_err());
        assert!(Action::Wait { seconds: 31 }.validate(&idx, &snap).is_err());
        assert!(Action::Wait { seconds: 2 }.validate(&idx, &snap).is_ok());
        assert!(Action::Scroll { direction: ScrollDirection::Down, amount: Some(0) }
            .validate(&idx, &snap)
            .is_err());
        assert!(Action::Scroll { direction: ScrollDirection::Down, amount: None }
            .validate(&idx, &snap)
            .is_ok());
        assert!(Action::Navigate { url: "ftp://x".into() }.validate(&idx, &snap).is_err());
        assert!(Action::InputText { index: 1, text: String::new() }
            .validate(&idx, &snap)
            .is_err());
    }

    #[test]
    fn validate_tabs_against_snapshot() {
        let (idx, snap) = fixture();
        assert!(Action::SwitchTab { tab_id: "t1".into() }.validate(&idx, &snap).is_ok());
        assert!(Action::SwitchTab { tab_id: "nope".into() }.validate(&idx, &snap).is_err());
    }

    #[test]
    fn done_always_validates() {
        let (idx, snap) = fixture();
        let done = Action::Done { result: "42".into(), success: true };
        assert!(done.is_terminal());
        assert!(done.validate(&idx, &snap).is_ok());
    }
}
