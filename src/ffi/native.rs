//! # Native Engine Boundary
//!
//! The native library is consumed through two traits:
//!
//! - [`NativeApi`] - every call the binding makes into the engine.
//! - [`NativeEvents`] - the two callbacks the engine makes back, on threads it owns.
//!
//! All calls except `cancel_generation`, `destroy_*` and `wait_until_done` are
//! non-reentrant per handle and must only be issued while holding the session's
//! exclusion gate. Implementations: [`crate::ffi::litert::LiteRtNative`] for
//! the real library and `test_helpers::FakeNative` (feature `test-utils`) for tests.

use std::sync::Arc;
use std::time::Duration;

use super::types::{
    EngineHandle, GenerateOptions, NativeLogLevel, ResponseCode, SessionHandle, SessionParams,
};

/// Callbacks invoked by the native layer, possibly from several threads.
///
/// Implementations must never block and never unwind into the caller.
pub trait NativeEvents: Send + Sync {
    /// One UTF-8 text fragment produced for the in-flight operation
    fn on_token(&self, session: SessionHandle, fragment: &[u8]);

    /// Terminal signal for the in-flight operation
    fn on_final(&self, session: SessionHandle, code: i32);
}

/// Calls into the native engine
pub trait NativeApi: Send + Sync + 'static {
    fn create_engine(
        &self,
        model_path: &str,
        num_threads: i32,
        max_num_tokens: i32,
    ) -> Result<EngineHandle, ResponseCode>;

    fn create_session(
        &self,
        engine: EngineHandle,
        params: &SessionParams,
    ) -> Result<SessionHandle, ResponseCode>;

    /// Start streaming generation. Outcome arrives through `events`.
    fn generate_async(
        &self,
        session: SessionHandle,
        prompt: &str,
        options: GenerateOptions,
        events: Arc<dyn NativeEvents>,
    );

    /// Start a system-prompt prefill. A non-ok return means no final callback will follow.
    fn prefill_system_prompt(
        &self,
        session: SessionHandle,
        text: &str,
        events: Arc<dyn NativeEvents>,
    ) -> ResponseCode;

    /// Blocking generation into a caller-owned, NUL-terminated buffer
    fn generate_text_sync(
        &self,
        session: SessionHandle,
        prompt: &str,
        buffer: &mut [u8],
    ) -> ResponseCode;

    /// Best-effort cancellation; safe to call at any time
    fn cancel_generation(&self, session: SessionHandle);

    /// Block until the engine has no outstanding work, or the timeout elapses
    fn wait_until_done(&self, engine: EngineHandle, timeout: Duration) -> bool;

    fn destroy_session(&self, session: SessionHandle);

    fn destroy_engine(&self, engine: EngineHandle);

    fn number_of_tokens(&self, engine: EngineHandle, text: &str) -> i32;

    fn set_min_log_level(&self, level: NativeLogLevel);

    fn disable_logging(&self);
}
