//! The step loop: observe, decide, act, record, until a terminal state.
//!
//! One task runs as a sequential state machine. The only suspension
//! points are the model call and action execution; cancellation and the
//! task's wall-clock budget are honored at both.

use std::sync::Arc;
use std::time::Duration;

use nanoid::nanoid;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::{sleep, timeout, Instant};
use tracing::{info, warn};

use crate::action::{parse_reply, Action, ParseMode};
use crate::capability::BrowserCapability;
use crate::error::{ModelError, StepError, StopReason};
use crate::executor::{Executor, ExecutorConfig};
use crate::history::{History, HistoryConfig, StepRecord};
use crate::index::{ElementIndex, IndexConfig};
use crate::model::{ChatRequest, ModelClient, ModelReply};
use crate::observe::{ObservationBuilder, ObserveConfig};
use crate::prompt::build_messages;
use crate::recorder::{NullRecorder, RunRecorder};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Done,
    Failed,
    Stopped,
}

impl AgentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, AgentStatus::Running)
    }
}

/// The caller-visible outcome: a terminal status plus the full audit
/// trail. Per-step errors never surface as faults; they live in history.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TaskReport {
    pub run_id: String,
    pub task: String,
    pub status: AgentStatus,
    pub final_result: Option<String>,
    pub step_count: usize,
    pub history: Vec<StepRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_reason: Option<StopReason>,
}

#[derive(Clone, Debug)]
pub struct AgentConfig {
    pub max_steps: usize,
    /// Hard-failure ceiling on consecutive failed steps.
    pub max_consecutive_failures: usize,
    /// Extra model attempts after the first, for transient failures.
    pub model_retries: usize,
    pub model_retry_backoff: Duration,
    pub model_timeout: Duration,
    /// Wall-clock budget for the whole task.
    pub task_timeout: Option<Duration>,
    pub parse_mode: ParseMode,
    pub index: IndexConfig,
    pub observe: ObserveConfig,
    pub history: HistoryConfig,
    pub executor: ExecutorConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: 40,
            max_consecutive_failures: 3,
            model_retries: 2,
            model_retry_backoff: Duration::from_secs(1),
            model_timeout: Duration::from_secs(90),
            task_timeout: None,
            parse_mode: ParseMode::Lenient,
            index: IndexConfig::default(),
            observe: ObserveConfig::default(),
            history: HistoryConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

/// Cancels the owning agent's task at its next suspension point.
#[derive(Clone)]
pub struct StopHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// Mutable core of the loop. Created at task start, mutated once per step
/// by the loop exclusively, finalized into a [`TaskReport`].
struct AgentState {
    task: String,
    history: History,
    step_count: usize,
    status: AgentStatus,
    consecutive_failures: usize,
}

struct Terminal {
    status: AgentStatus,
    reason: StopReason,
    final_result: Option<String>,
}

enum StepResult {
    Continue { error: Option<StepError> },
    DoneReported { result: String, success: bool },
    Interrupted(StopReason),
}

pub struct Agent<C, M>
where
    C: BrowserCapability,
    M: ModelClient,
{
    capability: C,
    model: M,
    recorder: Arc<dyn RunRecorder>,
    cfg: AgentConfig,
    executor: Executor,
    stop_tx: Arc<watch::Sender<bool>>,
    stop_rx: watch::Receiver<bool>,
}

impl<C, M> Agent<C, M>
where
    C: BrowserCapability,
    M: ModelClient,
{
    pub fn new(capability: C, model: M, cfg: AgentConfig) -> Self {
        let (tx, rx) = watch::channel(false);
        let executor = Executor::new(cfg.executor.clone());
        Self {
            capability,
            model,
            recorder: Arc::new(NullRecorder),
            cfg,
            executor,
            stop_tx: Arc::new(tx),
            stop_rx: rx,
        }
    }

    pub fn with_recorder(mut self, recorder: Arc<dyn RunRecorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { tx: Arc::clone(&self.stop_tx) }
    }

    pub fn capability(&self) -> &C {
        &self.capability
    }

    /// Run one task to a terminal state. Always returns a report; the
    /// audit trail survives every failure mode.
    pub async fn run(&self, task: &str, start_url: Option<&str>) -> TaskReport {
        let run_id = nanoid!();
        let started = Instant::now();
        let deadline = self.cfg.task_timeout.map(|t| started + t);
        let mut state = AgentState {
            task: task.to_string(),
            history: History::new(),
            step_count: 0,
            status: AgentStatus::Running,
            consecutive_failures: 0,
        };
        self.recorder.run_started(&run_id, task).await;
        info!(run = %run_id, task, "task started");

        if let Some(url) = start_url {
            if let Err(err) = self.capability.navigate(url).await {
                warn!(run = %run_id, "start navigation failed: {err}");
                // Recorded as a zero-action step so the trail shows why.
                let record = StepRecord {
                    step_number: 0,
                    url: url.to_string(),
                    observation_summary: "start navigation".into(),
                    proposed_actions: vec![],
                    results: vec![],
                    error: Some(StepError::Capability(err)),
                };
                self.recorder.record_step(&run_id, &record).await;
                state.history.push(record);
                let terminal = Terminal {
                    status: AgentStatus::Failed,
                    reason: StopReason::SessionLost,
                    final_result: None,
                };
                return self.finish(run_id, state, terminal).await;
            }
        }

        let mut last_error: Option<StepError> = None;
        let terminal = loop {
            if *self.stop_rx.borrow() {
                break Terminal {
                    status: AgentStatus::Stopped,
                    reason: StopReason::Cancelled,
                    final_result: None,
                };
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    break Terminal {
                        status: AgentStatus::Stopped,
                        reason: StopReason::TaskTimeout,
                        final_result: None,
                    };
                }
            }
            if state.step_count >= self.cfg.max_steps {
                // Budget exhaustion is an outcome, not an error.
                break Terminal {
                    status: AgentStatus::Stopped,
                    reason: StopReason::StepBudgetExhausted,
                    final_result: None,
                };
            }

            let step_number = state.step_count + 1;
            match self
                .step(&run_id, step_number, &mut state, last_error.take(), deadline)
                .await
            {
                StepResult::Continue { error } => {
                    state.step_count = step_number;
                    match &error {
                        Some(_) => state.consecutive_failures += 1,
                        None => state.consecutive_failures = 0,
                    }
                    last_error = error;
                    if state.consecutive_failures >= self.cfg.max_consecutive_failures {
                        break Terminal {
                            status: AgentStatus::Failed,
                            reason: StopReason::ConsecutiveFailureCeiling,
                            final_result: None,
                        };
                    }
                }
                StepResult::DoneReported { result, success } => {
                    state.step_count = step_number;
                    break Terminal {
                        status: if success { AgentStatus::Done } else { AgentStatus::Failed },
                        reason: StopReason::DoneReported,
                        final_result: Some(result),
                    };
                }
                StepResult::Interrupted(reason) => {
                    break Terminal {
                        status: AgentStatus::Stopped,
                        reason,
                        final_result: None,
                    };
                }
            }
        };

        self.finish(run_id, state, terminal).await
    }

    async fn finish(
        &self,
        run_id: String,
        mut state: AgentState,
        terminal: Terminal,
    ) -> TaskReport {
        state.status = terminal.status;
        let report = TaskReport {
            run_id: run_id.clone(),
            task: state.task,
            status: state.status,
            final_result: terminal.final_result,
            step_count: state.step_count,
            history: state.history.records().to_vec(),
            stop_reason: Some(terminal.reason),
        };
        self.recorder.run_finished(&run_id, &report).await;
        info!(
            run = %run_id,
            status = ?report.status,
            steps = report.step_count,
            "task finished"
        );
        report
    }

    /// One observe-decide-act iteration.
    async fn step(
        &self,
        run_id: &str,
        step_number: usize,
        state: &mut AgentState,
        last_error: Option<StepError>,
        deadline: Option<Instant>,
    ) -> StepResult {
        // 1. Capture. A failed capture is a failed step, not a crash.
        let snapshot = match self.capability.snapshot().await {
            Ok(s) => s,
            Err(err) => {
                return self
                    .record_failed_step(
                        run_id,
                        state,
                        step_number,
                        String::new(),
                        String::new(),
                        err.into(),
                    )
                    .await;
            }
        };

        // 2. Index and observe.
        let index = ElementIndex::build_with(&snapshot, &self.cfg.index);
        let observation = ObservationBuilder::new(self.cfg.observe.clone())
            .build(&snapshot, &index, step_number);
        let summary = format!(
            "{} ({} interactive elements)",
            if snapshot.title.is_empty() { snapshot.url.clone() } else { snapshot.title.clone() },
            index.len()
        );

        // 3. Decide. Transient model failures retry bounded; the rest is
        // a soft failure surfaced to the model next turn.
        let window = state.history.window(&state.task, &self.cfg.history);
        let request = build_messages(&state.task, &observation, &window, last_error.as_ref());
        let reply = tokio::select! {
            biased;
            reason = self.interruption(deadline) => return StepResult::Interrupted(reason),
            r = self.call_model(&request) => r,
        };
        let reply = match reply {
            Ok(r) => r,
            Err(err) => {
                return self
                    .record_failed_step(
                        run_id,
                        state,
                        step_number,
                        snapshot.url.clone(),
                        summary,
                        err.into(),
                    )
                    .await;
            }
        };

        // 4. Parse. Unparseable output is recorded, never a silent no-op.
        let decision = match parse_reply(&reply.text, self.cfg.parse_mode) {
            Ok(d) => d,
            Err(err) => {
                warn!(step = step_number, "unparseable model reply: {}", err.reason);
                return self
                    .record_failed_step(
                        run_id,
                        state,
                        step_number,
                        snapshot.url.clone(),
                        summary,
                        err.into(),
                    )
                    .await;
            }
        };

        // 5. Validate and execute fail-fast against this step's snapshot.
        // Execution is the second suspension point.
        let results = tokio::select! {
            biased;
            reason = self.interruption(deadline) => return StepResult::Interrupted(reason),
            r = self.executor.run_step(&decision.actions, &index, &snapshot, &self.capability) => r,
        };

        let step_error = results
            .iter()
            .rev()
            .filter(|(_, o)| !o.success)
            .find_map(|(_, o)| o.error.clone());
        let done = results.iter().find_map(|(a, o)| match a {
            Action::Done { result, success } if o.success => Some((result.clone(), *success)),
            _ => None,
        });

        let record = StepRecord {
            step_number,
            url: snapshot.url.clone(),
            observation_summary: summary,
            proposed_actions: decision.actions.clone(),
            results,
            error: step_error.clone(),
        };
        self.recorder.record_step(run_id, &record).await;
        state.history.push(record);

        if let Some((result, success)) = done {
            return StepResult::DoneReported { result, success };
        }
        StepResult::Continue { error: step_error }
    }

    async fn record_failed_step(
        &self,
        run_id: &str,
        state: &mut AgentState,
        step_number: usize,
        url: String,
        summary: String,
        error: StepError,
    ) -> StepResult {
        let record = StepRecord {
            step_number,
            url,
            observation_summary: summary,
            proposed_actions: vec![],
            results: vec![],
            error: Some(error.clone()),
        };
        self.recorder.record_step(run_id, &record).await;
        state.history.push(record);
        StepResult::Continue { error: Some(error) }
    }

    async fn call_model(&self, request: &ChatRequest) -> Result<ModelReply, ModelError> {
        let mut attempt = 0usize;
        loop {
            let result =
                match timeout(self.cfg.model_timeout, self.model.complete(request)).await {
                    Ok(r) => r,
                    Err(_) => Err(ModelError::timeout(format!(
                        "model call exceeded {:?}",
                        self.cfg.model_timeout
                    ))),
                };
            match result {
                Ok(reply) => return Ok(reply),
                Err(err) if err.is_transient() && attempt < self.cfg.model_retries => {
                    attempt += 1;
                    warn!(attempt, "transient model failure, retrying: {err}");
                    sleep(self.cfg.model_retry_backoff * attempt as u32).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Resolves when the task should stop: external cancellation or the
    /// wall-clock budget. Pends forever otherwise.
    async fn interruption(&self, deadline: Option<Instant>) -> StopReason {
        let mut rx = self.stop_rx.clone();
        let cancelled = async move {
            // Resolves immediately if the flag is already set.
            let _ = rx.wait_for(|stopped| *stopped).await;
        };
        match deadline {
            Some(d) => {
                tokio::select! {
                    _ = cancelled => StopReason::Cancelled,
                    _ = tokio::time::sleep_until(d) => StopReason::TaskTimeout,
                }
            }
            None => {
                cancelled.await;
                StopReason::Cancelled
            }
        }
    }
}
