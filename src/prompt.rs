//! Prompt assembly: the fixed action contract, the task, trimmed history,
//! last-step failures and the current observation.

use crate::error::StepError;
use crate::model::{ChatMessage, ChatRequest};
use crate::observe::Observation;

const SYSTEM_PROMPT: &str = r#"You are a precise, deterministic web agent driving a real browser.

Each turn you receive the task, a trimmed history of previous steps, and an observation of the current page. Interactive elements are listed as numbered lines like:

[3] <button> "Search"
[4] <input type="email" placeholder="Email">

Rules:
- Act ONLY on indices listed in the current observation. Indices change between steps; never reuse an index from an earlier step.
- Reply with EXACTLY one JSON object, no prose, no code fences:
  {"thinking": "<one short sentence>", "actions": [<one or more actions>]}
- Available actions:
  {"type": "navigate", "url": "https://..."}
  {"type": "go_back"}
  {"type": "click", "index": N}
  {"type": "input_text", "index": N, "text": "..."}
  {"type": "send_keys", "keys": "Enter"}
  {"type": "scroll", "direction": "down" | "up", "amount": <pixels, optional>}
  {"type": "select_option", "index": N, "option": "..."}
  {"type": "switch_tab", "tab_id": "..."}
  {"type": "wait", "seconds": N}
  {"type": "done", "result": "<final answer>", "success": true | false}
- Actions in one reply run in order and stop at the first failure.
- When the task is complete, emit "done" with the answer in "result". If the task cannot be completed, emit "done" with success=false and explain why in "result".
- An element marked (occluded) is covered by something else; close or scroll past the covering element first.
- Keep thinking short. Prefer few, decisive actions per step."#;

/// Build the message list for one model turn.
pub fn build_messages(
    task: &str,
    observation: &Observation,
    history_window: &str,
    last_error: Option<&StepError>,
) -> ChatRequest {
    let mut messages = vec![ChatMessage::system(SYSTEM_PROMPT)];
    messages.push(ChatMessage::user(format!("Task: {task}")));

    if !history_window.is_empty() {
        messages.push(ChatMessage::user(format!(
            "History so far:\n{history_window}"
        )));
    }
    if let Some(err) = last_error {
        messages.push(ChatMessage::user(format!(
            "The previous step failed: {err}. Adjust your next actions accordingly."
        )));
    }
    messages.push(ChatMessage::user(format!(
        "Current observation:\n{}",
        observation.rendered
    )));
    ChatRequest { messages }
}
