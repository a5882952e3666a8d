//! The browser capability surface the agent core consumes. Everything
//! browser-specific lives behind this seam; the chromium adapter is one
//! implementation, the test fakes are another.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::error::CapabilityError;
use crate::snapshot::PageSnapshot;

/// Browser-level input primitives. The executor lowers each [`crate::action::Action`]
/// into exactly one of these per capability call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PrimitiveInput {
    ClickAt { x: f64, y: f64 },
    /// Focus the element and insert text in one operation.
    TypeInto { selector: String, text: String },
    KeyPress { key: String },
    ScrollBy { dx: f64, dy: f64 },
    SelectOption { selector: String, value: String },
    ActivateTab { tab_id: String },
    GoBack,
}

#[async_trait]
pub trait BrowserCapability: Send + Sync {
    /// Capture the page as it is right now. The caller owns the snapshot
    /// for one step only and must never act on element references from an
    /// older one.
    async fn snapshot(&self) -> Result<PageSnapshot, CapabilityError>;

    async fn navigate(&self, url: &str) -> Result<(), CapabilityError>;

    async fn dispatch(&self, input: PrimitiveInput) -> Result<(), CapabilityError>;

    /// PNG bytes of the current viewport. Optional for callers that build
    /// text-only observations.
    async fn screenshot(&self) -> Result<Vec<u8>, CapabilityError>;

    async fn close(&self) -> Result<(), CapabilityError>;

    /// Exclusive hold for one step's execution phase. The executor takes
    /// this once per step and keeps it until every action of the step has
    /// been applied. Sessions owned by a single task have nothing to hold.
    async fn step_token(&self) -> Option<OwnedMutexGuard<()>> {
        None
    }
}

/// Exclusion token for the deliberate case of two tasks sharing one
/// browser session. The default is one session per task; when sharing, the
/// executor holds the token for the duration of a step's execution phase,
/// so the actions of one step are never interleaved with another task's.
pub struct SharedSession<C> {
    inner: Arc<C>,
    token: Arc<Mutex<()>>,
}

impl<C> Clone for SharedSession<C> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner), token: Arc::clone(&self.token) }
    }
}

impl<C: BrowserCapability> SharedSession<C> {
    pub fn new(inner: C) -> Self {
        Self { inner: Arc::new(inner), token: Arc::new(Mutex::new(())) }
    }

    /// Take the session token. Dropping the guard releases it.
    pub async fn acquire(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.token).lock_owned().await
    }
}

#[async_trait]
impl<C: BrowserCapability> BrowserCapability for SharedSession<C> {
    async fn snapshot(&self) -> Result<PageSnapshot, CapabilityError> {
        self.inner.snapshot().await
    }

    async fn navigate(&self, url: &str) -> Result<(), CapabilityError> {
        self.inner.navigate(url).await
    }

    async fn dispatch(&self, input: PrimitiveInput) -> Result<(), CapabilityError> {
        self.inner.dispatch(input).await
    }

    async fn screenshot(&self) -> Result<Vec<u8>, CapabilityError> {
        self.inner.screenshot().await
    }

    async fn close(&self) -> Result<(), CapabilityError> {
        self.inner.close().await
    }

    async fn step_token(&self) -> Option<OwnedMutexGuard<()>> {
        Some(self.acquire().await)
    }
}
