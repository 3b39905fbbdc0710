#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]

//! # LiteRT-LM Rust Binding
//!
//! Async, cancellable text generation over the LiteRT-LM native engine.
//!
//! ## Overview
//!
//! The native engine runs generation on threads it owns and reports progress
//! through two C callbacks: one per text fragment, one terminal result code.
//! This crate turns that into an `async` API where:
//!
//! - each session runs at most one native operation at a time, and concurrent
//!   requests queue in arrival order;
//! - fragments reach the caller's token callback in emission order, on the
//!   caller's execution context, before the operation resolves;
//! - cancellation is a distinct outcome, never a generic failure;
//! - disposal waits for in-flight native work and never leaves a handle that
//!   a late callback could touch.
//!
//! ## Module Organization
//!
//! - [`ffi`] - native types, the [`ffi::NativeApi`] boundary and (feature `litert`) the C bindings
//! - [`coordinator`] - handle registry, exclusion gate, callback bridge, generation coordinator
//! - [`lifecycle`] - [`Engine`] and [`Session`] ownership and ordered disposal
//! - [`conversation`] - chat prompt builder
//! - [`config`] - layered configuration
//! - [`logging`] - structured logging
//! - [`error`] - error taxonomy
//! - `test_helpers` - scriptable fake engine (feature `test-utils`)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use litert_lm::{Engine, NativeApi, SamplingParams};
//!
//! # async fn example(native: Arc<dyn NativeApi>) -> Result<(), litert_lm::LiteRtError> {
//! let engine = Engine::load(native, "model.task")?;
//! let session = engine.create_session(SamplingParams::default())?;
//!
//! let completion = session
//!     .generate_streaming("Tell me a joke", |fragment| print!("{fragment}"))
//!     .await?;
//! println!("\n{} fragments", completion.fragment_count);
//!
//! session.dispose()?;
//! engine.dispose();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod conversation;
pub mod coordinator;
pub mod error;
pub mod ffi;
pub mod lifecycle;
pub mod logging;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_helpers;

pub use config::{ConfigManager, CoordinatorConfig};
pub use conversation::{ChatMessage, ChatSession, MessageRole};
pub use coordinator::{
    Completion, ConsumerContext, DiagnosticSink, TerminalOutcome, TokenCallback, TokioContext,
};
pub use error::{InternalViolation, LiteRtError, LiteRtResult, OperationKind};
pub use ffi::{
    EngineHandle, GenerateOptions, NativeApi, NativeEvents, NativeLogLevel, ResponseCode,
    SamplingParams, SamplingType, SessionHandle,
};
pub use lifecycle::{Engine, EngineBuilder, EngineStatus, Session, SessionStatus};
pub use logging::{init_structured_logging, init_with_config};
