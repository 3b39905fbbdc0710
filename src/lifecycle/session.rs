//! # Session
//!
//! A conversation context on an engine. Operations on one session are
//! serialized by its exclusion gate; operations on different sessions run
//! independently.
//!
//! ## Disposal
//!
//! 1. Mark `Disposing` under the handle write lock and close the gate, so no
//!    new operation can start and queued callers fail with `SessionDisposed`.
//! 2. If an operation is in flight, request native cancellation and wait for
//!    the engine to go idle, bounded by `dispose.wait_timeout_ms`.
//! 3. Resolve anything the native side never finished as cancelled.
//! 4. Destroy the native session and clear the handle.
//!
//! Disposing a session whose engine is already destroyed skips every native
//! call and returns [`InternalViolation::SessionOutlivedEngine`].

use std::fmt;
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::engine::EngineCore;
use super::state::{SessionPhaseCell, SessionStatus};
use crate::coordinator::bridge::TokenCallback;
use crate::coordinator::gate::ExclusionGate;
use crate::coordinator::generation::{Completion, GenerationCoordinator};
use crate::error::{InternalViolation, LiteRtError, LiteRtResult};
use crate::ffi::types::{GenerateOptions, ResponseCode, SamplingParams, SessionHandle};
use crate::logging::log_session_operation;

/// Per-session state shared with the coordinator
pub struct SessionCore {
    handle: RwLock<SessionHandle>,
    created_handle: SessionHandle,
    gate: ExclusionGate,
    phase: SessionPhaseCell,
    params: SamplingParams,
}

impl fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionCore")
            .field("handle", &self.created_handle)
            .field("phase", &self.phase.current())
            .field("params", &self.params)
            .finish()
    }
}

impl SessionCore {
    pub(crate) fn new(handle: SessionHandle, params: SamplingParams) -> Self {
        Self {
            handle: RwLock::new(handle),
            created_handle: handle,
            gate: ExclusionGate::new(handle),
            phase: SessionPhaseCell::new(),
            params,
        }
    }

    pub(crate) fn read_handle(&self) -> RwLockReadGuard<'_, SessionHandle> {
        self.handle.read()
    }

    pub(crate) fn gate(&self) -> &ExclusionGate {
        &self.gate
    }

    pub(crate) fn is_live(&self) -> bool {
        self.phase.is_live()
    }
}

pub struct Session {
    core: SessionCore,
    engine: Arc<EngineCore>,
    coordinator: Arc<GenerationCoordinator>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("core", &self.core)
            .field("status", &self.status())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(
        core: SessionCore,
        engine: Arc<EngineCore>,
        coordinator: Arc<GenerationCoordinator>,
    ) -> Self {
        Self {
            core,
            engine,
            coordinator,
        }
    }

    /// The native handle this session was created with
    pub fn handle(&self) -> SessionHandle {
        self.core.created_handle
    }

    pub fn params(&self) -> SamplingParams {
        self.core.params
    }

    /// Generate a completion for `prompt`, streaming fragments to `on_token`.
    ///
    /// Waits in FIFO order if another operation on this session is in flight.
    pub async fn generate(
        &self,
        prompt: &str,
        on_token: Option<TokenCallback>,
    ) -> LiteRtResult<Completion> {
        self.coordinator
            .generate(
                &self.engine,
                &self.core,
                prompt,
                GenerateOptions::default(),
                on_token,
            )
            .await
    }

    /// Generate, calling `on_token` for every fragment
    pub async fn generate_streaming<F>(&self, prompt: &str, on_token: F) -> LiteRtResult<Completion>
    where
        F: FnMut(&str) + Send + 'static,
    {
        self.generate(prompt, Some(Box::new(on_token))).await
    }

    /// Generate exactly up to `max_num_tokens`, sampling past end-of-sequence
    pub async fn generate_ignore_eos(
        &self,
        prompt: &str,
        max_num_tokens: i32,
        on_token: Option<TokenCallback>,
    ) -> LiteRtResult<Completion> {
        if max_num_tokens <= 0 {
            return Err(LiteRtError::invalid_argument(format!(
                "max_num_tokens must be positive when ignoring end-of-sequence, got {max_num_tokens}"
            )));
        }
        self.coordinator
            .generate(
                &self.engine,
                &self.core,
                prompt,
                GenerateOptions::ignore_eos(max_num_tokens),
                on_token,
            )
            .await
    }

    pub async fn prefill_system_prompt(&self, text: &str) -> LiteRtResult<()> {
        self.coordinator
            .prefill_system_prompt(&self.engine, &self.core, text)
            .await
    }

    /// Blocking generation; fails with `SessionBusy` rather than waiting for the gate
    pub fn generate_blocking(&self, prompt: &str) -> LiteRtResult<String> {
        self.coordinator
            .generate_blocking(&self.engine, &self.core, prompt)
    }

    /// Request cancellation of the in-flight operation, if any
    pub fn cancel(&self) {
        self.coordinator.cancel(&self.engine, &self.core);
    }

    pub fn number_of_tokens(&self, text: &str) -> LiteRtResult<usize> {
        self.engine.number_of_tokens(text)
    }

    pub fn status(&self) -> SessionStatus {
        use super::state::SessionPhase;

        match self.core.phase.current() {
            SessionPhase::Disposing => SessionStatus::Disposing,
            SessionPhase::Destroyed => SessionStatus::Destroyed,
            SessionPhase::Live => {
                if self
                    .coordinator
                    .bridge()
                    .is_in_flight(self.core.created_handle)
                {
                    SessionStatus::InFlight
                } else {
                    SessionStatus::Idle
                }
            }
        }
    }

    /// Id of the operation in flight, if any
    pub fn current_operation(&self) -> Option<Uuid> {
        self.coordinator
            .bridge()
            .current_operation(self.core.created_handle)
    }

    pub fn is_valid(&self) -> bool {
        self.core.is_live() && !self.core.read_handle().is_null() && self.engine.is_loaded()
    }

    /// Dispose the session. Idempotent; concurrent callers after the first return `Ok`.
    pub fn dispose(&self) -> LiteRtResult<()> {
        let handle = {
            let guard = self.core.handle.write();
            if !self.core.phase.begin_dispose() {
                return Ok(());
            }
            *guard
        };
        self.core.gate.close();
        let bridge = self.coordinator.bridge();
        let native = self.engine.native();

        let engine_guard = self.engine.read_handle();
        if engine_guard.is_null() || !self.engine.is_loaded() {
            drop(engine_guard);
            bridge.force_terminal(handle, ResponseCode::Cancelled);
            *self.core.handle.write() = SessionHandle::NULL;
            self.core.phase.mark_destroyed();
            self.engine.session_closed();
            return Err(InternalViolation::SessionOutlivedEngine {
                session: handle,
                engine: self.engine.created_handle(),
            }
            .report()
            .into());
        }
        let engine_handle = *engine_guard;

        if bridge.is_in_flight(handle) {
            debug!(session = %handle, "cancelling in-flight operation for disposal");
            native.cancel_generation(handle);

            let timeout = self.engine.config().dispose.wait_timeout();
            if !native.wait_until_done(engine_handle, timeout) {
                warn!(
                    session = %handle,
                    timeout_ms = timeout.as_millis() as u64,
                    "timed out waiting for native work; invalidating session anyway"
                );
            }
            bridge.force_terminal(handle, ResponseCode::Cancelled);
        }

        {
            let mut guard = self.core.handle.write();
            native.destroy_session(*guard);
            *guard = SessionHandle::NULL;
        }
        drop(engine_guard);

        self.core.phase.mark_destroyed();
        self.engine.session_closed();
        log_session_operation("dispose", handle, None, "ok", None);
        info!(session = %handle, "session disposed");
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.core.is_live() {
            if let Err(err) = self.dispose() {
                debug!(session = %self.core.created_handle, error = %err, "disposal on drop failed");
            }
        }
    }
}
