//! # Generation Coordinator
//!
//! Runs one operation end to end:
//!
//! ```text
//! validate → gate.acquire ─→ [engine read] [session read] re-check
//!                            bridge.begin → native start
//!          ←───────────────── pending.wait ← drain worker ← final callback
//! ```
//!
//! Handle locks are only held while the operation is registered and started,
//! never across an await. Disposal takes the same locks for writing, so a
//! start either completes before disposal sees it or observes the disposed
//! phase and fails with a precondition error.

use std::sync::Arc;

use parking_lot::RwLockReadGuard;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::bridge::{CallbackBridge, DeliveryReport, PendingOperation, TokenCallback};
use super::gate::GateError;
use crate::error::{LiteRtError, LiteRtResult, OperationKind};
use crate::ffi::native::{NativeApi, NativeEvents};
use crate::ffi::types::{GenerateOptions, ResponseCode, SessionHandle};
use crate::lifecycle::{EngineCore, SessionCore};
use crate::logging::log_session_operation;

/// How an operation ended, as seen by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalOutcome {
    Completed,
    Cancelled,
    Failed(ResponseCode),
}

impl From<ResponseCode> for TerminalOutcome {
    fn from(code: ResponseCode) -> Self {
        match code {
            ResponseCode::Ok => TerminalOutcome::Completed,
            ResponseCode::Cancelled => TerminalOutcome::Cancelled,
            code => TerminalOutcome::Failed(code),
        }
    }
}

impl TerminalOutcome {
    pub fn into_result<T>(self, value: T) -> LiteRtResult<T> {
        match self {
            TerminalOutcome::Completed => Ok(value),
            TerminalOutcome::Cancelled => Err(LiteRtError::Cancelled),
            TerminalOutcome::Failed(code) => Err(LiteRtError::GenerationFailed { code }),
        }
    }
}

/// Successful result of a streaming generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Completion {
    pub operation_id: Uuid,
    /// Concatenation of every fragment delivered to the token callback
    pub text: String,
    pub fragment_count: usize,
}

impl From<DeliveryReport> for Completion {
    fn from(report: DeliveryReport) -> Self {
        Self {
            operation_id: report.operation_id,
            text: report.text,
            fragment_count: report.fragment_count,
        }
    }
}

pub struct GenerationCoordinator {
    native: Arc<dyn NativeApi>,
    bridge: Arc<CallbackBridge>,
    sync_buffer_size: usize,
}

impl std::fmt::Debug for GenerationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationCoordinator")
            .field("bridge", &self.bridge)
            .field("sync_buffer_size", &self.sync_buffer_size)
            .finish()
    }
}

impl GenerationCoordinator {
    pub fn new(
        native: Arc<dyn NativeApi>,
        bridge: Arc<CallbackBridge>,
        sync_buffer_size: usize,
    ) -> Self {
        Self {
            native,
            bridge,
            sync_buffer_size,
        }
    }

    pub fn bridge(&self) -> &Arc<CallbackBridge> {
        &self.bridge
    }

    pub fn native(&self) -> &Arc<dyn NativeApi> {
        &self.native
    }

    /// Stream a generation, waiting for the gate if another operation holds it
    pub async fn generate(
        &self,
        engine: &EngineCore,
        session: &SessionCore,
        prompt: &str,
        options: GenerateOptions,
        on_token: Option<TokenCallback>,
    ) -> LiteRtResult<Completion> {
        validate_text(prompt, "prompt")?;

        let native = self.native.clone();
        let pending = self
            .start(engine, session, OperationKind::Generate, on_token, |handle, events| {
                native.generate_async(handle, prompt, options, events);
                ResponseCode::Ok
            })
            .await?;

        let session_handle = pending.session();
        let report = pending.wait().await?;
        let outcome = TerminalOutcome::from(report.code);
        log_session_operation(
            "generate",
            session_handle,
            Some(&report.operation_id.to_string()),
            report.code.as_str(),
            Some(&format!("fragments={}", report.fragment_count)),
        );
        outcome.into_result(Completion::from(report))
    }

    /// Prefill the system prompt; resolves once the native final callback arrives
    pub async fn prefill_system_prompt(
        &self,
        engine: &EngineCore,
        session: &SessionCore,
        text: &str,
    ) -> LiteRtResult<()> {
        validate_text(text, "system prompt")?;

        let native = self.native.clone();
        let pending = self
            .start(engine, session, OperationKind::Prefill, None, |handle, events| {
                native.prefill_system_prompt(handle, text, events)
            })
            .await?;

        let session_handle = pending.session();
        let report = pending.wait().await?;
        log_session_operation(
            "prefill",
            session_handle,
            Some(&report.operation_id.to_string()),
            report.code.as_str(),
            None,
        );
        TerminalOutcome::from(report.code).into_result(())
    }

    /// Blocking generation. Fails fast with `SessionBusy` instead of queueing.
    pub fn generate_blocking(
        &self,
        engine: &EngineCore,
        session: &SessionCore,
        prompt: &str,
    ) -> LiteRtResult<String> {
        validate_text(prompt, "prompt")?;
        if !session.is_live() {
            return Err(LiteRtError::SessionDisposed);
        }
        let permit = session.gate().try_acquire().map_err(|err| match err {
            GateError::Busy(_) => LiteRtError::SessionBusy,
            GateError::Closed(_) => LiteRtError::SessionDisposed,
        })?;

        let (_engine_guard, session_guard) = live_handles(engine, session)?;
        let handle = *session_guard;

        let mut buffer = vec![0u8; self.sync_buffer_size];
        let code = self.native.generate_text_sync(handle, prompt, &mut buffer);
        drop(session_guard);
        drop(permit);

        log_session_operation(
            &OperationKind::GenerateSync.to_string(),
            handle,
            None,
            code.as_str(),
            None,
        );
        if !code.is_ok() {
            return TerminalOutcome::from(code).into_result(String::new());
        }

        let len = buffer.iter().position(|b| *b == 0).unwrap_or(buffer.len());
        Ok(String::from_utf8_lossy(&buffer[..len]).into_owned())
    }

    /// Request cancellation of whatever is in flight. No-op when idle.
    pub fn cancel(&self, engine: &EngineCore, session: &SessionCore) {
        let engine_guard = engine.read_handle();
        if engine_guard.is_null() || !engine.is_loaded() {
            return;
        }
        let session_guard = session.read_handle();
        let handle = *session_guard;
        if handle.is_null() {
            return;
        }
        if self.bridge.is_in_flight(handle) {
            debug!(session = %handle, "cancellation requested");
            self.native.cancel_generation(handle);
        }
    }

    async fn start<F>(
        &self,
        engine: &EngineCore,
        session: &SessionCore,
        kind: OperationKind,
        on_token: Option<TokenCallback>,
        starter: F,
    ) -> LiteRtResult<PendingOperation>
    where
        F: FnOnce(SessionHandle, Arc<dyn NativeEvents>) -> ResponseCode,
    {
        if !session.is_live() {
            return Err(LiteRtError::SessionDisposed);
        }
        let permit = session.gate().acquire().await.map_err(|_| LiteRtError::SessionDisposed)?;
        self.start_locked(engine, session, kind, on_token, permit, starter)
    }

    fn start_locked<F>(
        &self,
        engine: &EngineCore,
        session: &SessionCore,
        kind: OperationKind,
        on_token: Option<TokenCallback>,
        permit: super::gate::GatePermit,
        starter: F,
    ) -> LiteRtResult<PendingOperation>
    where
        F: FnOnce(SessionHandle, Arc<dyn NativeEvents>) -> ResponseCode,
    {
        let (_engine_guard, session_guard) = live_handles(engine, session)?;
        let handle = *session_guard;

        let pending = self.bridge.begin(handle, kind, on_token, permit)?;
        let events: Arc<dyn NativeEvents> = self.bridge.clone();
        let code = starter(handle, events);
        if !code.is_ok() {
            self.bridge.abort_start(handle, pending.operation_id());
            warn!(session = %handle, operation = %kind, code = %code, "native layer refused to start operation");
            return Err(LiteRtError::StartFailed {
                operation: kind,
                code,
            });
        }
        Ok(pending)
    }
}

/// Read-lock both handles and confirm neither was disposed
fn live_handles<'a>(
    engine: &'a EngineCore,
    session: &'a SessionCore,
) -> LiteRtResult<(
    RwLockReadGuard<'a, crate::ffi::types::EngineHandle>,
    RwLockReadGuard<'a, SessionHandle>,
)> {
    let engine_guard = engine.read_handle();
    if engine_guard.is_null() || !engine.is_loaded() {
        return Err(LiteRtError::EngineDisposed);
    }
    let session_guard = session.read_handle();
    if session_guard.is_null() || !session.is_live() {
        return Err(LiteRtError::SessionDisposed);
    }
    Ok((engine_guard, session_guard))
}

fn validate_text(text: &str, what: &str) -> LiteRtResult<()> {
    if text.is_empty() {
        return Err(LiteRtError::invalid_argument(format!("{what} must not be empty")));
    }
    if text.contains('\0') {
        return Err(LiteRtError::invalid_argument(format!(
            "{what} must not contain NUL bytes"
        )));
    }
    Ok(())
}
