//! Capability abstractions: descriptors, the invocable trait, and the
//! cooperative-cancellation context passed into every invocation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CapabilityError;

// ---------------------------------------------------------------------------
// Descriptor
// ---------------------------------------------------------------------------

/// Cheap, immutable metadata describing a capability without loading it.
///
/// Descriptors are created at registration time and returned by discovery;
/// holding one implies nothing about whether the implementation is
/// instantiated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDescriptor {
    /// Unique capability name, e.g. `document_extract`.
    pub name: String,
    /// Coarse grouping inferred from the name's leading segment.
    pub category: String,
    /// Human-readable description.
    pub description: String,
}

/// Infer a category from a capability name's leading `_`-separated segment.
pub fn infer_category(name: &str) -> String {
    match name.split('_').next() {
        Some(segment) if !segment.is_empty() && segment != name => segment.to_string(),
        _ => "general".to_string(),
    }
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Shared cancellation flag for one task.
///
/// Setting it is idempotent and never fails; the effect is only visible once
/// the running capability observes it at a checkpoint. There is no forced
/// termination.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Safe to call any number of times.
    pub fn request(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Callback receiving mid-run progress reports in `[0.0, 1.0)`.
pub type ProgressFn = Arc<dyn Fn(f64) + Send + Sync>;

/// Per-invocation context handed to a capability.
///
/// Capabilities are expected to call [`checkpoint`](Self::checkpoint) at or
/// before suspension points; between checkpoints they run uninterrupted.
#[derive(Clone)]
pub struct InvocationContext {
    cancel: CancelFlag,
    progress: Option<ProgressFn>,
}

impl std::fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("cancel", &self.cancel)
            .field("has_progress", &self.progress.is_some())
            .finish()
    }
}

impl InvocationContext {
    pub fn new(cancel: CancelFlag) -> Self {
        Self {
            cancel,
            progress: None,
        }
    }

    /// A context that can never be cancelled, for the synchronous path.
    pub fn detached() -> Self {
        Self::new(CancelFlag::new())
    }

    /// Attach a progress sink.
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn is_cancellation_requested(&self) -> bool {
        self.cancel.is_requested()
    }

    /// Report fractional completion; ignored when no sink is attached.
    pub fn report_progress(&self, value: f64) {
        if let Some(progress) = &self.progress {
            progress(value);
        }
    }

    /// Cooperative yield point: returns `Err(Cancelled)` once cancellation
    /// has been requested.
    pub fn checkpoint(&self) -> Result<(), CapabilityError> {
        if self.cancel.is_requested() {
            Err(CapabilityError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Capability trait
// ---------------------------------------------------------------------------

/// A named, pluggable unit of work the runtime can invoke.
///
/// Implementations live behind the registry; the runtime only ever sees them
/// through this trait. Input validation against the capability's own contract
/// belongs in `invoke` and surfaces as [`CapabilityError::Validation`].
#[async_trait]
pub trait Capability: Send + Sync {
    /// The capability's unique name, matching its registry entry.
    fn name(&self) -> &str;

    /// Invocation deadline override; `None` uses the runtime default.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Execute against a payload that has already passed admission.
    async fn invoke(
        &self,
        payload: Value,
        ctx: &InvocationContext,
    ) -> Result<Value, CapabilityError>;
}
