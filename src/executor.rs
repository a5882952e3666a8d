//! Validates and applies a step's proposed actions against the browser
//! capability: in proposed order, fail-fast, one capability operation per
//! action, transient failures retried a bounded number of times.

use std::time::Duration;

use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::action::{Action, ActionOutcome, ScrollDirection};
use crate::capability::{BrowserCapability, PrimitiveInput};
use crate::error::{CapabilityError, InvalidAction, StepError};
use crate::index::{ElementIndex, IndexedElement};
use crate::snapshot::PageSnapshot;

#[derive(Clone, Debug)]
pub struct ExecutorConfig {
    /// Extra attempts after the first, for transient capability failures.
    pub action_retries: usize,
    pub retry_backoff: Duration,
    /// Per-operation ceiling; an expiry counts as a transient timeout.
    pub action_timeout: Duration,
    /// Default scroll distance when the model gives no amount.
    pub default_scroll: f64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            action_retries: 2,
            retry_backoff: Duration::from_millis(500),
            action_timeout: Duration::from_secs(20),
            default_scroll: 600.0,
        }
    }
}

pub struct Executor {
    cfg: ExecutorConfig,
}

impl Executor {
    pub fn new(cfg: ExecutorConfig) -> Self {
        Self { cfg }
    }

    /// Apply the actions in order against the capability. Stops at the
    /// first failure so later actions never run against a page the failed
    /// one left in an unknown state; the loop decides what happens next.
    pub async fn run_step<C: BrowserCapability>(
        &self,
        actions: &[Action],
        index: &ElementIndex,
        snapshot: &PageSnapshot,
        capability: &C,
    ) -> Vec<(Action, ActionOutcome)> {
        // On a shared session this keeps the whole step's actions together;
        // another task's step cannot land between two of ours.
        let _step_token = capability.step_token().await;
        let mut results = Vec::with_capacity(actions.len());
        for action in actions {
            if let Err(invalid) = action.validate(index, snapshot) {
                warn!(action = %action.describe(), reason = %invalid.reason, "action rejected");
                results.push((action.clone(), ActionOutcome::failed(invalid)));
                break;
            }
            let outcome = self.execute(action, index, capability).await;
            let failed = !outcome.success;
            info!(action = %action.describe(), ok = outcome.success, "action applied");
            results.push((action.clone(), outcome));
            if failed {
                break;
            }
        }
        results
    }

    async fn execute<C: BrowserCapability>(
        &self,
        action: &Action,
        index: &ElementIndex,
        capability: &C,
    ) -> ActionOutcome {
        // Terminal and local actions have no browser side effect.
        match action {
            Action::Done { success, .. } => {
                return ActionOutcome::ok(format!("task reported done (success={success})"));
            }
            Action::Wait { seconds } => {
                sleep(Duration::from_secs(*seconds)).await;
                return ActionOutcome::ok(format!("waited {seconds}s"));
            }
            _ => {}
        }

        let op = match self.lower(action, index) {
            Ok(op) => op,
            Err(invalid) => return ActionOutcome::failed(invalid),
        };

        let mut attempt = 0usize;
        loop {
            let result = match &op {
                BrowserOp::Navigate(url) => {
                    self.bounded(capability.navigate(url)).await
                }
                BrowserOp::Dispatch(input) => {
                    self.bounded(capability.dispatch(input.clone())).await
                }
            };
            match result {
                Ok(()) => return ActionOutcome::ok(effect_of(action)),
                Err(err) if err.is_transient() && attempt < self.cfg.action_retries => {
                    attempt += 1;
                    warn!(
                        action = %action.describe(),
                        attempt,
                        "transient capability failure, retrying: {err}"
                    );
                    sleep(self.cfg.retry_backoff * attempt as u32).await;
                }
                Err(err) => return ActionOutcome::failed(StepError::Capability(err)),
            }
        }
    }

    async fn bounded<F>(&self, fut: F) -> Result<(), CapabilityError>
    where
        F: std::future::Future<Output = Result<(), CapabilityError>>,
    {
        match timeout(self.cfg.action_timeout, fut).await {
            Ok(r) => r,
            Err(_) => Err(CapabilityError::timeout(format!(
                "action exceeded {:?}",
                self.cfg.action_timeout
            ))),
        }
    }

    /// Lower a validated action into exactly one browser-level operation.
    fn lower(&self, action: &Action, index: &ElementIndex) -> Result<BrowserOp, InvalidAction> {
        let op = match action {
            Action::Navigate { url } => BrowserOp::Navigate(url.clone()),
            Action::GoBack => BrowserOp::Dispatch(PrimitiveInput::GoBack),
            Action::Click { index: i } => {
                let el = resolve(index, *i)?;
                let (x, y) = el.bounds.center();
                BrowserOp::Dispatch(PrimitiveInput::ClickAt { x, y })
            }
            Action::InputText { index: i, text } => {
                let el = resolve(index, *i)?;
                let selector = el.selector.clone().ok_or_else(|| {
                    InvalidAction::new(format!("element [{i}] has no dispatch selector"))
                })?;
                BrowserOp::Dispatch(PrimitiveInput::TypeInto { selector, text: text.clone() })
            }
            Action::SendKeys { keys } => {
                BrowserOp::Dispatch(PrimitiveInput::KeyPress { key: keys.clone() })
            }
            Action::Scroll { direction, amount } => {
                let px = amount.map(f64::from).unwrap_or(self.cfg.default_scroll);
                let dy = match direction {
                    ScrollDirection::Down => px,
                    ScrollDirection::Up => -px,
                };
                BrowserOp::Dispatch(PrimitiveInput::ScrollBy { dx: 0.0, dy })
            }
            Action::SelectOption { index: i, option } => {
                let el = resolve(index, *i)?;
                let selector = el.selector.clone().ok_or_else(|| {
                    InvalidAction::new(format!("element [{i}] has no dispatch selector"))
                })?;
                BrowserOp::Dispatch(PrimitiveInput::SelectOption {
                    selector,
                    value: option.clone(),
                })
            }
            Action::SwitchTab { tab_id } => {
                BrowserOp::Dispatch(PrimitiveInput::ActivateTab { tab_id: tab_id.clone() })
            }
            Action::Wait { .. } | Action::Done { .. } => {
                unreachable!("local actions are handled before lowering")
            }
        };
        Ok(op)
    }
}

enum BrowserOp {
    Navigate(String),
    Dispatch(PrimitiveInput),
}

fn resolve(index: &ElementIndex, i: usize) -> Result<&IndexedElement, InvalidAction> {
    index
        .get(i)
        .ok_or_else(|| InvalidAction::new(format!("index {i} vanished from the snapshot")))
}

fn effect_of(action: &Action) -> String {
    match action {
        Action::Navigate { url } => format!("navigated to {url}"),
        Action::GoBack => "went back".into(),
        Action::Click { index } => format!("clicked [{index}]"),
        Action::InputText { index, .. } => format!("typed into [{index}]"),
        Action::SendKeys { keys } => format!("sent keys {keys}"),
        Action::Scroll { .. } => "scrolled".into(),
        Action::SelectOption { index, .. } => format!("selected option in [{index}]"),
        Action::SwitchTab { tab_id } => format!("switched to {tab_id}"),
        Action::Wait { seconds } => format!("waited {seconds}s"),
        Action::Done { .. } => "done".into(),
    }
}
