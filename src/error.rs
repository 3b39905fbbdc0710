//! # Error Types
//!
//! Structured error taxonomy for the generation coordinator using thiserror.
//!
//! Errors fall into four groups:
//!
//! - **Precondition** - the engine or session was disposed, or the input was rejected
//!   before anything reached the native layer.
//! - **Synchronous start failures** - the native layer refused to begin an operation.
//! - **Terminal failures** - the operation ran and finished with a non-ok code.
//!   Cancellation is its own variant so callers never have to inspect a code for it.
//! - **Internal violations** - the coordinator broke one of its own invariants.
//!   These are logged as fatal when constructed and never retried.

use std::fmt;

use thiserror::Error;
use tracing::error;
use uuid::Uuid;

use crate::ffi::types::{EngineHandle, ResponseCode, SessionHandle};

/// The kind of native operation a request maps onto
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// Streaming generation through `generate_text_async`
    Generate,
    /// System-prompt prefill
    Prefill,
    /// Buffer-based blocking generation
    GenerateSync,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Generate => write!(f, "generate"),
            OperationKind::Prefill => write!(f, "prefill"),
            OperationKind::GenerateSync => write!(f, "generate_sync"),
        }
    }
}

/// Bugs in the coordinator itself, never part of the normal error flow
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InternalViolation {
    #[error("session {session} already has an in-flight operation registered")]
    DuplicateRegistration { session: SessionHandle },

    #[error("session {session} was disposed after its engine {engine} had been destroyed")]
    SessionOutlivedEngine {
        session: SessionHandle,
        engine: EngineHandle,
    },

    #[error("completion slot for operation {operation_id} was dropped before it resolved")]
    CompletionDropped { operation_id: Uuid },
}

impl InternalViolation {
    /// Log the violation at error level and hand it back for propagation
    pub fn report(self) -> Self {
        error!(violation = %self, "FATAL: coordinator invariant violated");
        self
    }
}

/// Coordinator error type surfaced to callers
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LiteRtError {
    #[error("engine has been disposed")]
    EngineDisposed,

    #[error("session has been disposed")]
    SessionDisposed,

    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("session already has an operation in flight")]
    SessionBusy,

    #[error("engine creation failed with code {code}")]
    EngineCreation { code: ResponseCode },

    #[error("session creation failed with code {code}")]
    SessionCreation { code: ResponseCode },

    #[error("{operation} could not be started: native code {code}")]
    StartFailed {
        operation: OperationKind,
        code: ResponseCode,
    },

    #[error("operation was cancelled")]
    Cancelled,

    #[error("generation failed with code {code}")]
    GenerationFailed { code: ResponseCode },

    #[error("internal consistency violation: {0}")]
    Internal(#[from] InternalViolation),

    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl LiteRtError {
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        LiteRtError::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        LiteRtError::Configuration {
            message: message.into(),
        }
    }

    /// True for the user- or disposal-initiated cancellation outcome
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LiteRtError::Cancelled)
    }

    /// True when the engine or session was no longer usable
    pub fn is_precondition(&self) -> bool {
        matches!(
            self,
            LiteRtError::EngineDisposed
                | LiteRtError::SessionDisposed
                | LiteRtError::InvalidArgument { .. }
                | LiteRtError::SessionBusy
        )
    }

    /// True for coordinator bugs that must not be tolerated silently
    pub fn is_fatal(&self) -> bool {
        matches!(self, LiteRtError::Internal(_))
    }

    /// The native response code behind this error, if there is one
    pub fn response_code(&self) -> Option<ResponseCode> {
        match self {
            LiteRtError::Cancelled => Some(ResponseCode::Cancelled),
            LiteRtError::GenerationFailed { code }
            | LiteRtError::StartFailed { code, .. }
            | LiteRtError::EngineCreation { code }
            | LiteRtError::SessionCreation { code } => Some(*code),
            _ => None,
        }
    }
}

impl From<config::ConfigError> for LiteRtError {
    fn from(err: config::ConfigError) -> Self {
        LiteRtError::Configuration {
            message: err.to_string(),
        }
    }
}

pub type LiteRtResult<T> = std::result::Result<T, LiteRtError>;
