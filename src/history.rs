//! Append-only step history and the budgeted context window handed to
//! the model.

use serde::{Deserialize, Serialize};

use crate::action::{Action, ActionOutcome};
use crate::error::StepError;

/// The audit record of one step. Appended once per loop iteration and
/// never mutated afterwards.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_number: usize,
    pub url: String,
    /// One-line abstraction of what the step saw.
    pub observation_summary: String,
    pub proposed_actions: Vec<Action>,
    pub results: Vec<(Action, ActionOutcome)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

impl StepRecord {
    /// One line for the compacted region of the context window. The `done`
    /// payload is load-bearing and always survives here verbatim.
    fn compact_line(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        for (action, outcome) in &self.results {
            let status = if outcome.success { "ok" } else { "failed" };
            match action {
                Action::Done { result, success } => {
                    parts.push(format!("done success={success} result={result}"));
                }
                other => parts.push(format!("{} — {status}", other.describe())),
            }
        }
        if parts.is_empty() {
            if let Some(err) = &self.error {
                parts.push(format!("no actions ({err})"));
            } else {
                parts.push("no actions".into());
            }
        }
        format!("step {}: {}", self.step_number, parts.join("; "))
    }

    /// Verbatim block for the most recent steps.
    fn verbatim_block(&self) -> String {
        let mut s = format!("step {} @ {}\n", self.step_number, self.url);
        s.push_str(&format!("  saw: {}\n", self.observation_summary));
        for (action, outcome) in &self.results {
            s.push_str(&format!(
                "  {} — {}\n",
                action.describe(),
                if outcome.success { "ok".to_string() } else { outcome.observed_effect.clone() }
            ));
        }
        if let Some(err) = &self.error {
            s.push_str(&format!("  error: {err}\n"));
        }
        s
    }
}

#[derive(Clone, Debug)]
pub struct HistoryConfig {
    /// Character budget for the rendered context window, task included.
    pub budget_chars: usize,
    /// Most recent steps rendered verbatim before compaction starts.
    pub recent_verbatim: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self { budget_chars: 6_000, recent_verbatim: 3 }
    }
}

/// Ordered log of the task so far. Owned by the agent; one append per
/// completed step.
#[derive(Clone, Debug, Default)]
pub struct History {
    records: Vec<StepRecord>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, record: StepRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[StepRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Render a context window within `cfg.budget_chars`. The task appears
    /// verbatim always; the most recent steps verbatim; older steps as
    /// one-line summaries, dropped oldest-first when the budget is tight.
    /// `done` payloads are never summarized away.
    pub fn window(&self, task: &str, cfg: &HistoryConfig) -> String {
        let task_line = format!("Task: {task}\n");
        let budget = cfg.budget_chars;
        if task_line.len() >= budget {
            // The task itself is sacrosanct even when the budget is absurd.
            return task_line;
        }
        let mut remaining = budget - task_line.len();

        let split = self.records.len().saturating_sub(cfg.recent_verbatim);
        let (old, recent) = self.records.split_at(split);

        // Recent steps, newest last. If even those overflow, drop the
        // oldest of them down to a single verbatim step.
        let mut recent_blocks: Vec<String> = recent.iter().map(|r| r.verbatim_block()).collect();
        while recent_blocks.len() > 1
            && recent_blocks.iter().map(String::len).sum::<usize>() > remaining
        {
            recent_blocks.remove(0);
        }
        if recent_blocks.len() == 1 && recent_blocks[0].len() > remaining {
            // Last resort: compact even the newest step rather than split it.
            if let Some(last) = recent.last() {
                let line = format!("{}\n", last.compact_line());
                recent_blocks = if line.len() <= remaining { vec![line] } else { Vec::new() };
            }
        }
        remaining = remaining.saturating_sub(recent_blocks.iter().map(String::len).sum());

        // Older steps compacted, dropped oldest-first to fit. Records that
        // carry a done payload are kept with priority.
        let mut old_lines: Vec<(bool, String)> = old
            .iter()
            .map(|r| {
                let load_bearing = r
                    .results
                    .iter()
                    .any(|(a, _)| matches!(a, Action::Done { .. }));
                (load_bearing, format!("{}\n", r.compact_line()))
            })
            .collect();
        while !old_lines.is_empty()
            && old_lines.iter().map(|(_, l)| l.len()).sum::<usize>() > remaining
        {
            if let Some(pos) = old_lines.iter().position(|(keep, _)| !keep) {
                old_lines.remove(pos);
            } else {
                old_lines.remove(0);
            }
        }

        let mut out = task_line;
        for (_, line) in &old_lines {
            out.push_str(line);
        }
        for block in &recent_blocks {
            out.push_str(block);
        }
        out
    }
}
