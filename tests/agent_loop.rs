//! End-to-end step loop tests against scripted browser and model fakes.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use webpilot::capability::{BrowserCapability, PrimitiveInput};
use webpilot::error::{CapabilityError, ModelError, StepError, StopReason};
use webpilot::model::{ChatRequest, ModelClient, ModelReply};
use webpilot::snapshot::{PageSnapshot, RawNode, Rect};
use webpilot::{Agent, AgentConfig, AgentStatus};

fn page(url: &str, title: &str, buttons: usize) -> PageSnapshot {
    let mut snap = PageSnapshot::empty(url);
    snap.title = title.to_string();
    snap.tree = (0..buttons)
        .map(|i| RawNode {
            tag: "button".into(),
            text: format!("Button {i}"),
            visible: true,
            interactable: true,
            selector: Some(format!("#b{i}")),
            bounds: Rect { x: 10.0, y: 10.0 + 30.0 * i as f64, width: 120.0, height: 24.0 },
            ..Default::default()
        })
        .collect();
    snap
}

/// In-memory site: a map of navigable pages plus a call log.
struct FakeBrowser {
    pages: HashMap<String, PageSnapshot>,
    current: Mutex<PageSnapshot>,
    dispatches: Mutex<Vec<PrimitiveInput>>,
}

impl FakeBrowser {
    fn new(start: PageSnapshot, pages: Vec<PageSnapshot>) -> Self {
        let pages = pages.into_iter().map(|p| (p.url.clone(), p)).collect();
        Self { pages, current: Mutex::new(start), dispatches: Mutex::new(Vec::new()) }
    }

    fn blank() -> Self {
        Self::new(PageSnapshot::empty("about:blank"), vec![])
    }
}

#[async_trait]
impl BrowserCapability for FakeBrowser {
    async fn snapshot(&self) -> Result<PageSnapshot, CapabilityError> {
        Ok(self.current.lock().unwrap().clone())
    }

    async fn navigate(&self, url: &str) -> Result<(), CapabilityError> {
        let next = self
            .pages
            .get(url)
            .cloned()
            .unwrap_or_else(|| PageSnapshot::empty(url));
        *self.current.lock().unwrap() = next;
        Ok(())
    }

    async fn dispatch(&self, input: PrimitiveInput) -> Result<(), CapabilityError> {
        self.dispatches.lock().unwrap().push(input);
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>, CapabilityError> {
        Ok(Vec::new())
    }

    async fn close(&self) -> Result<(), CapabilityError> {
        Ok(())
    }
}

/// Replays a fixed reply sequence, then refuses.
struct ScriptedModel {
    replies: Mutex<VecDeque<String>>,
}

impl ScriptedModel {
    fn new(replies: &[&str]) -> Self {
        Self { replies: Mutex::new(replies.iter().map(|s| s.to_string()).collect()) }
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn complete(&self, _request: &ChatRequest) -> Result<ModelReply, ModelError> {
        match self.replies.lock().unwrap().pop_front() {
            Some(text) => Ok(ModelReply { text }),
            None => Err(ModelError::refused("script exhausted")),
        }
    }
}

/// Fails every call with the given transient error.
struct TimingOutModel;

#[async_trait]
impl ModelClient for TimingOutModel {
    async fn complete(&self, _request: &ChatRequest) -> Result<ModelReply, ModelError> {
        Err(ModelError::timeout("no reply within budget"))
    }
}

/// Never answers; only useful with cancellation or a task deadline.
struct StalledModel;

#[async_trait]
impl ModelClient for StalledModel {
    async fn complete(&self, _request: &ChatRequest) -> Result<ModelReply, ModelError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Err(ModelError::timeout("unreachable"))
    }
}

fn quick_config() -> AgentConfig {
    let mut cfg = AgentConfig::default();
    cfg.model_retries = 0;
    cfg.model_retry_backoff = Duration::from_millis(1);
    cfg.executor.retry_backoff = Duration::from_millis(1);
    cfg
}

#[tokio::test]
async fn navigate_then_done_completes_in_two_steps() {
    let browser = FakeBrowser::new(
        PageSnapshot::empty("about:blank"),
        vec![page("https://example.com", "Example Domain", 3)],
    );
    let model = ScriptedModel::new(&[
        r#"{"thinking":"need the page first","actions":[{"type":"navigate","url":"https://example.com"}]}"#,
        r#"{"thinking":"title is visible","actions":[{"type":"done","result":"Example Domain","success":true}]}"#,
    ]);
    let agent = Agent::new(browser, model, quick_config());

    let report = agent.run("report the page title", None).await;

    assert_eq!(report.status, AgentStatus::Done);
    assert_eq!(report.final_result.as_deref(), Some("Example Domain"));
    assert_eq!(report.step_count, 2);
    assert_eq!(report.stop_reason, Some(StopReason::DoneReported));
    assert_eq!(report.history.len(), 2);
    assert!(report.history.iter().all(|r| r.error.is_none()));
}

#[tokio::test]
async fn out_of_range_index_is_recorded_and_loop_continues() {
    let browser = FakeBrowser::new(page("https://example.com", "Twelve Buttons", 12), vec![]);
    let model = ScriptedModel::new(&[
        r#"{"actions":[{"type":"click","index":57}]}"#,
        r#"{"actions":[{"type":"done","result":"recovered","success":true}]}"#,
    ]);
    let agent = Agent::new(browser, model, quick_config());

    let report = agent.run("click something", None).await;

    // The bogus index fails the step without touching the browser, and the
    // model gets another turn.
    assert_eq!(report.status, AgentStatus::Done);
    assert_eq!(report.step_count, 2);
    let first = &report.history[0];
    assert!(matches!(first.error, Some(StepError::Invalid(_))), "{:?}", first.error);
    assert_eq!(first.results.len(), 1);
    assert!(!first.results[0].1.success);
    assert!(agent.capability().dispatches.lock().unwrap().is_empty());
}

#[tokio::test]
async fn repeated_model_timeouts_fail_the_task() {
    let mut cfg = quick_config();
    cfg.max_consecutive_failures = 3;
    let agent = Agent::new(FakeBrowser::blank(), TimingOutModel, cfg);

    let report = agent.run("anything", None).await;

    assert_eq!(report.status, AgentStatus::Failed);
    assert_eq!(report.stop_reason, Some(StopReason::ConsecutiveFailureCeiling));
    assert_eq!(report.step_count, 3);
    assert!(report
        .history
        .iter()
        .all(|r| matches!(r.error, Some(StepError::Model(_)))));
    assert!(report.history.iter().all(|r| r.url == "about:blank"));
}

#[tokio::test]
async fn step_budget_stops_the_task() {
    let browser = FakeBrowser::new(page("https://example.com", "Endless", 3), vec![]);
    // Scrolls forever, never done.
    let scroll = r#"{"actions":[{"type":"scroll","direction":"down"}]}"#;
    let model = ScriptedModel::new(&[scroll; 10]);
    let mut cfg = quick_config();
    cfg.max_steps = 5;
    let agent = Agent::new(browser, model, cfg);

    let report = agent.run("scroll to the end", None).await;

    assert_eq!(report.status, AgentStatus::Stopped);
    assert_eq!(report.stop_reason, Some(StopReason::StepBudgetExhausted));
    assert_eq!(report.step_count, 5);
    assert_eq!(report.history.len(), 5);
}

#[tokio::test]
async fn unparseable_reply_is_a_soft_failure() {
    let browser = FakeBrowser::new(page("https://example.com", "Page", 3), vec![]);
    let model = ScriptedModel::new(&[
        "I think I should click the button now.",
        r#"{"actions":[{"type":"done","result":"ok","success":true}]}"#,
    ]);
    let agent = Agent::new(browser, model, quick_config());

    let report = agent.run("finish", None).await;

    assert_eq!(report.status, AgentStatus::Done);
    assert_eq!(report.step_count, 2);
    assert!(matches!(report.history[0].error, Some(StepError::Parse(_))));
    // The failed step still names the page it happened on.
    assert_eq!(report.history[0].url, "https://example.com");
}

#[tokio::test]
async fn done_with_failure_flag_fails_the_task() {
    let browser = FakeBrowser::new(page("https://example.com", "Page", 3), vec![]);
    let model = ScriptedModel::new(&[
        r#"{"actions":[{"type":"done","result":"could not find the form","success":false}]}"#,
    ]);
    let agent = Agent::new(browser, model, quick_config());

    let report = agent.run("fill the form", None).await;

    assert_eq!(report.status, AgentStatus::Failed);
    assert_eq!(report.stop_reason, Some(StopReason::DoneReported));
    assert_eq!(report.final_result.as_deref(), Some("could not find the form"));
}

#[tokio::test]
async fn stop_handle_cancels_at_the_model_call() {
    let agent = Agent::new(FakeBrowser::blank(), StalledModel, quick_config());
    let handle = agent.stop_handle();

    let stopper = async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.stop();
    };
    let (report, _) = tokio::join!(agent.run("never finishes", None), stopper);

    assert_eq!(report.status, AgentStatus::Stopped);
    assert_eq!(report.stop_reason, Some(StopReason::Cancelled));
}

#[tokio::test]
async fn task_timeout_stops_a_stalled_task() {
    let mut cfg = quick_config();
    cfg.task_timeout = Some(Duration::from_millis(100));
    let agent = Agent::new(FakeBrowser::blank(), StalledModel, cfg);

    let report = agent.run("never finishes", None).await;

    assert_eq!(report.status, AgentStatus::Stopped);
    assert_eq!(report.stop_reason, Some(StopReason::TaskTimeout));
}

#[tokio::test]
async fn failed_start_navigation_loses_the_session() {
    struct DeadBrowser;

    #[async_trait]
    impl BrowserCapability for DeadBrowser {
        async fn snapshot(&self) -> Result<PageSnapshot, CapabilityError> {
            Err(CapabilityError::disconnected("gone"))
        }
        async fn navigate(&self, _url: &str) -> Result<(), CapabilityError> {
            Err(CapabilityError::disconnected("gone"))
        }
        async fn dispatch(&self, _input: PrimitiveInput) -> Result<(), CapabilityError> {
            Err(CapabilityError::disconnected("gone"))
        }
        async fn screenshot(&self) -> Result<Vec<u8>, CapabilityError> {
            Err(CapabilityError::disconnected("gone"))
        }
        async fn close(&self) -> Result<(), CapabilityError> {
            Ok(())
        }
    }

    let agent = Agent::new(DeadBrowser, StalledModel, quick_config());
    let report = agent.run("anything", Some("https://example.com")).await;

    assert_eq!(report.status, AgentStatus::Failed);
    assert_eq!(report.stop_reason, Some(StopReason::SessionLost));
    assert_eq!(report.step_count, 0);
    assert!(matches!(report.history[0].error, Some(StepError::Capability(_))));
}

#[tokio::test]
async fn failure_streak_resets_on_a_good_step() {
    let browser = FakeBrowser::new(page("https://example.com", "Page", 12), vec![]);
    // Two bad steps, one good, two bad, then done. With a ceiling of 3 the
    // reset after the good step keeps the task alive.
    let model = ScriptedModel::new(&[
        r#"{"actions":[{"type":"click","index":99}]}"#,
        r#"{"actions":[{"type":"click","index":99}]}"#,
        r#"{"actions":[{"type":"click","index":1}]}"#,
        r#"{"actions":[{"type":"click","index":99}]}"#,
        r#"{"actions":[{"type":"click","index":99}]}"#,
        r#"{"actions":[{"type":"done","result":"got there","success":true}]}"#,
    ]);
    let mut cfg = quick_config();
    cfg.max_consecutive_failures = 3;
    let agent = Agent::new(browser, model, cfg);

    let report = agent.run("persist", None).await;

    assert_eq!(report.status, AgentStatus::Done);
    assert_eq!(report.step_count, 6);
}
