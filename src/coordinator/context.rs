//! # Consumer Execution Context
//!
//! Where user-visible side effects run. Native threads never call user code;
//! the bridge spawns one drain task per operation onto a [`ConsumerContext`],
//! and every token callback and completion happens inside that task.
//!
//! Hand [`TokioContext`] the handle of a current-thread runtime to get
//! single-threaded delivery (e.g. a UI thread driving its own runtime).

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::runtime::Handle;
use tracing::error;
use uuid::Uuid;

use crate::ffi::types::SessionHandle;

pub trait ConsumerContext: Send + Sync + 'static {
    fn spawn(&self, task: BoxFuture<'static, ()>);

    fn name(&self) -> &str {
        "consumer"
    }
}

/// Runs delivery on a tokio runtime
#[derive(Clone)]
pub struct TokioContext {
    handle: Handle,
    name: String,
}

impl fmt::Debug for TokioContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioContext")
            .field("name", &self.name)
            .finish()
    }
}

impl TokioContext {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            name: "tokio".to_string(),
        }
    }

    /// Context for the runtime the caller is running on, if any
    pub fn try_current() -> Option<Self> {
        Handle::try_current().ok().map(Self::new)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

impl ConsumerContext for TokioContext {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        self.handle.spawn(task);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Fallback sink for failures that must not reach native code
pub trait DiagnosticSink: Send + Sync + 'static {
    fn report_callback_panic(&self, session: SessionHandle, operation_id: Uuid, message: &str);
}

/// Default sink: logs through tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnosticSink;

impl DiagnosticSink for TracingDiagnosticSink {
    fn report_callback_panic(&self, session: SessionHandle, operation_id: Uuid, message: &str) {
        error!(
            session = %session,
            operation_id = %operation_id,
            panic = %message,
            "token callback panicked; delivery continued"
        );
    }
}

pub fn default_diagnostics() -> Arc<dyn DiagnosticSink> {
    Arc::new(TracingDiagnosticSink)
}
