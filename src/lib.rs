//! LLM-driven browser automation core.
//!
//! A task runs as a bounded perception-act loop: capture a page snapshot,
//! index the interactable elements, render a textual observation, ask a
//! model for the next actions, validate and execute them against the same
//! snapshot, record the step, repeat until a terminal state.

pub mod action;
pub mod agent;
pub mod capability;
pub mod chromium;
pub mod error;
pub mod executor;
pub mod history;
pub mod index;
pub mod model;
pub mod observe;
pub mod prompt;
pub mod recorder;
pub mod snapshot;

pub use action::{Action, ModelDecision, ParseMode, ScrollDirection};
pub use agent::{Agent, AgentConfig, AgentStatus, StopHandle, TaskReport};
pub use capability::{BrowserCapability, PrimitiveInput, SharedSession};
pub use chromium::{ChromiumConfig, ChromiumSession};
pub use error::{CapabilityError, InvalidAction, ModelError, ParseError, StepError, StopReason};
pub use executor::{Executor, ExecutorConfig};
pub use history::{History, HistoryConfig, StepRecord};
pub use index::{ElementIndex, IndexConfig, IndexedElement};
pub use model::{ChatMessage, ChatRequest, ModelClient, ModelReply, OpenAiClient, OpenAiConfig};
pub use observe::{Observation, ObservationBuilder, ObserveConfig};
pub use recorder::{JsonlRecorder, NullRecorder, RunRecorder};
pub use snapshot::{PageSnapshot, RawNode, Rect, ScrollState, TabInfo, Viewport};
