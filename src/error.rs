use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Browser-side failure kinds, as reported by the capability surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityErrorKind {
    Timeout,
    Disconnected,
    InvalidTarget,
    Protocol,
}

#[derive(Clone, Debug, Error, Serialize, Deserialize)]
#[error("browser capability error ({kind:?}): {message}")]
pub struct CapabilityError {
    pub kind: CapabilityErrorKind,
    pub message: String,
}

impl CapabilityError {
    pub fn new(kind: CapabilityErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::Timeout, message)
    }

    pub fn disconnected(message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::Disconnected, message)
    }

    pub fn invalid_target(message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::InvalidTarget, message)
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(CapabilityErrorKind::Protocol, message)
    }

    /// Whether a bounded retry is worth attempting for this failure.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.kind,
            CapabilityErrorKind::Timeout | CapabilityErrorKind::Protocol
        )
    }
}

/// Model endpoint failure kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelErrorKind {
    RateLimited,
    Timeout,
    Malformed,
    Refused,
}

#[derive(Clone, Debug, Error, Serialize, Deserialize)]
#[error("model error ({kind:?}): {message}")]
pub struct ModelError {
    pub kind: ModelErrorKind,
    pub message: String,
}

impl ModelError {
    pub fn new(kind: ModelErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::new(ModelErrorKind::RateLimited, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ModelErrorKind::Timeout, message)
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::new(ModelErrorKind::Malformed, message)
    }

    pub fn refused(message: impl Into<String>) -> Self {
        Self::new(ModelErrorKind::Refused, message)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind, ModelErrorKind::RateLimited | ModelErrorKind::Timeout)
    }
}

/// Unparseable model output. Soft failure: recorded and surfaced to the
/// model on the next turn, never fatal on its own.
#[derive(Clone, Debug, Error, Serialize, Deserialize)]
#[error("unparseable model reply: {reason}")]
pub struct ParseError {
    pub reason: String,
    /// A short excerpt of the offending text, for the audit trail.
    pub excerpt: String,
}

impl ParseError {
    pub fn new(reason: impl Into<String>, text: &str) -> Self {
        let mut excerpt: String = text.chars().take(160).collect();
        if text.chars().count() > 160 {
            excerpt.push('…');
        }
        Self { reason: reason.into(), excerpt }
    }
}

/// Rejected before touching the browser: stale index, out-of-range argument
/// or otherwise ill-formed action. Local and non-fatal.
#[derive(Clone, Debug, Error, Serialize, Deserialize)]
#[error("invalid action: {reason}")]
pub struct InvalidAction {
    pub reason: String,
}

impl InvalidAction {
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Anything that can go wrong inside one step. Captured into the step
/// record and fed back to the model; only ceilings terminate the task.
#[derive(Clone, Debug, Error, Serialize, Deserialize)]
pub enum StepError {
    #[error(transparent)]
    Capability(#[from] CapabilityError),
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Invalid(#[from] InvalidAction),
}

/// Why a task left the `Running` state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A `done` action completed the task.
    DoneReported,
    /// Step ceiling reached without `done`. Budget exhaustion, not an error.
    StepBudgetExhausted,
    /// Wall-clock budget for the whole task expired.
    TaskTimeout,
    /// Too many consecutive failed steps.
    ConsecutiveFailureCeiling,
    /// Cancelled from outside at a suspension point.
    Cancelled,
    /// The browser session went away and could not be recovered.
    SessionLost,
}
