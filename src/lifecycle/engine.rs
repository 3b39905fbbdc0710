//! # Engine
//!
//! Owns the native engine handle. Sessions keep the engine core alive through
//! an `Arc`, but disposal is explicit: once `dispose` returns, the native
//! handle is gone and every later call fails with `EngineDisposed`.
//!
//! Destroying the engine cancels whatever its sessions still have in flight,
//! waits for the native side within `dispose.wait_timeout_ms`, and resolves
//! the leftovers as cancelled before the native engine goes away.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use super::session::{Session, SessionCore};
use super::state::{EngineStatus, EngineStatusCell};
use crate::config::CoordinatorConfig;
use crate::coordinator::bridge::CallbackBridge;
use crate::coordinator::context::{default_diagnostics, ConsumerContext, DiagnosticSink, TokioContext};
use crate::coordinator::generation::GenerationCoordinator;
use crate::error::{LiteRtError, LiteRtResult};
use crate::ffi::native::NativeApi;
use crate::ffi::types::{EngineHandle, ResponseCode, SamplingParams, SessionParams};
use crate::logging::{apply_native_log_level, log_native_operation};

/// Shared engine state referenced by every session it created
pub struct EngineCore {
    native: Arc<dyn NativeApi>,
    handle: RwLock<EngineHandle>,
    created_handle: EngineHandle,
    status: EngineStatusCell,
    live_sessions: AtomicUsize,
    model_path: PathBuf,
    config: Arc<CoordinatorConfig>,
    bridge: Arc<CallbackBridge>,
}

impl fmt::Debug for EngineCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineCore")
            .field("handle", &self.created_handle)
            .field("status", &self.status.current())
            .field("live_sessions", &self.live_sessions())
            .field("model_path", &self.model_path)
            .finish()
    }
}

impl EngineCore {
    pub(crate) fn read_handle(&self) -> RwLockReadGuard<'_, EngineHandle> {
        self.handle.read()
    }

    pub(crate) fn is_loaded(&self) -> bool {
        self.status.is_loaded()
    }

    pub(crate) fn native(&self) -> &Arc<dyn NativeApi> {
        &self.native
    }

    pub(crate) fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Handle as created, kept for diagnostics after the live handle is cleared
    pub(crate) fn created_handle(&self) -> EngineHandle {
        self.created_handle
    }

    pub(crate) fn session_closed(&self) {
        self.live_sessions.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn status(&self) -> EngineStatus {
        self.status.current()
    }

    pub fn live_sessions(&self) -> usize {
        self.live_sessions.load(Ordering::Acquire)
    }

    pub(crate) fn number_of_tokens(&self, text: &str) -> LiteRtResult<usize> {
        let guard = self.read_handle();
        if guard.is_null() || !self.is_loaded() {
            return Err(LiteRtError::EngineDisposed);
        }
        let count = self.native.number_of_tokens(*guard, text);
        usize::try_from(count).map_err(|_| {
            LiteRtError::invalid_argument(format!("tokenizer rejected input (code {count})"))
        })
    }

    /// `Loaded → Destroyed`. Only the first call does anything.
    fn destroy(&self) -> bool {
        let handle = {
            let guard = self.handle.write();
            if !self.status.begin_destroy() {
                return false;
            }
            *guard
        };

        let live = self.live_sessions();
        if live > 0 {
            warn!(
                engine = %handle,
                live_sessions = live,
                "destroying engine while sessions are still live; dispose sessions first"
            );
        }

        // No start can register once the phase flipped, so this snapshot is complete
        let in_flight = self.bridge.in_flight_sessions();
        for session in &in_flight {
            debug!(
                engine = %handle,
                session = %session,
                "cancelling in-flight operation for engine destruction"
            );
            self.native.cancel_generation(*session);
        }

        let timeout = self.config.dispose.wait_timeout();
        if !self.native.wait_until_done(handle, timeout) {
            warn!(
                engine = %handle,
                timeout_ms = timeout.as_millis() as u64,
                "timed out waiting for native work before engine destruction"
            );
        }
        for session in in_flight {
            self.bridge.force_terminal(session, ResponseCode::Cancelled);
        }

        let mut guard: RwLockWriteGuard<'_, EngineHandle> = self.handle.write();
        self.native.destroy_engine(*guard);
        *guard = EngineHandle::NULL;
        drop(guard);

        log_native_operation("destroy_engine", "ok", Some(&handle.to_string()));
        true
    }
}

impl Drop for EngineCore {
    fn drop(&mut self) {
        if self.status.is_loaded() {
            debug!(engine = %self.created_handle, "engine dropped while loaded; destroying");
            self.destroy();
        }
    }
}

/// Builder for [`Engine`]
pub struct EngineBuilder {
    native: Arc<dyn NativeApi>,
    config: Option<CoordinatorConfig>,
    context: Option<Arc<dyn ConsumerContext>>,
    diagnostics: Option<Arc<dyn DiagnosticSink>>,
}

impl EngineBuilder {
    pub fn new(native: Arc<dyn NativeApi>) -> Self {
        Self {
            native,
            config: None,
            context: None,
            diagnostics: None,
        }
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Where token callbacks and completions run. Defaults to the current tokio runtime.
    pub fn context(mut self, context: Arc<dyn ConsumerContext>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn diagnostics(mut self, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = Some(diagnostics);
        self
    }

    /// Create the native engine for `model_path`
    pub fn load(self, model_path: impl AsRef<Path>) -> LiteRtResult<Engine> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let context = match self.context {
            Some(context) => context,
            None => Arc::new(TokioContext::try_current().ok_or_else(|| {
                LiteRtError::configuration(
                    "no consumer context: load the engine inside a tokio runtime or pass one to the builder",
                )
            })?) as Arc<dyn ConsumerContext>,
        };
        let diagnostics = self.diagnostics.unwrap_or_else(default_diagnostics);

        let model_path = model_path.as_ref().to_path_buf();
        let path = model_path.to_str().ok_or_else(|| {
            LiteRtError::invalid_argument(format!(
                "model path {} is not valid UTF-8",
                model_path.display()
            ))
        })?;
        if path.is_empty() || path.contains('\0') {
            return Err(LiteRtError::invalid_argument(
                "model path must be non-empty and free of NUL bytes",
            ));
        }

        if let Some(level) = config.logging.native_level {
            apply_native_log_level(self.native.as_ref(), level);
        }

        // Range checked by validate()
        let num_threads = i32::try_from(config.engine.num_threads).unwrap_or(i32::MAX);
        let handle = self
            .native
            .create_engine(path, num_threads, config.engine.max_num_tokens)
            .map_err(|code| {
                log_native_operation("create_engine", code.as_str(), Some(path));
                LiteRtError::EngineCreation { code }
            })?;
        if handle.is_null() {
            return Err(LiteRtError::EngineCreation {
                code: ResponseCode::Internal,
            });
        }

        let config = Arc::new(config);
        let bridge = Arc::new(CallbackBridge::new(context.clone(), diagnostics));
        let core = Arc::new(EngineCore {
            native: self.native.clone(),
            handle: RwLock::new(handle),
            created_handle: handle,
            status: EngineStatusCell::new(),
            live_sessions: AtomicUsize::new(0),
            model_path,
            config: config.clone(),
            bridge: bridge.clone(),
        });
        core.status.mark_loaded();

        let coordinator = Arc::new(GenerationCoordinator::new(
            self.native,
            bridge,
            config.generation.sync_buffer_size,
        ));

        info!(
            engine = %handle,
            model = %core.model_path.display(),
            threads = num_threads,
            context = context.name(),
            "engine loaded"
        );
        log_native_operation("create_engine", "ok", Some(&handle.to_string()));

        Ok(Engine { core, coordinator })
    }
}

/// A loaded model. Create sessions from it to generate text.
#[derive(Debug)]
pub struct Engine {
    core: Arc<EngineCore>,
    coordinator: Arc<GenerationCoordinator>,
}

impl Engine {
    pub fn builder(native: Arc<dyn NativeApi>) -> EngineBuilder {
        EngineBuilder::new(native)
    }

    /// Load with default configuration on the current tokio runtime
    pub fn load(native: Arc<dyn NativeApi>, model_path: impl AsRef<Path>) -> LiteRtResult<Self> {
        EngineBuilder::new(native).load(model_path)
    }

    pub fn create_session(&self, params: SamplingParams) -> LiteRtResult<Session> {
        params.validate().map_err(LiteRtError::invalid_argument)?;

        let guard = self.core.read_handle();
        if guard.is_null() || !self.core.is_loaded() {
            return Err(LiteRtError::EngineDisposed);
        }
        let native_params = SessionParams::from(&params);
        let handle = self
            .core
            .native
            .create_session(*guard, &native_params)
            .map_err(|code| LiteRtError::SessionCreation { code })?;
        if handle.is_null() {
            return Err(LiteRtError::SessionCreation {
                code: ResponseCode::Internal,
            });
        }
        self.core.live_sessions.fetch_add(1, Ordering::AcqRel);
        drop(guard);

        debug!(engine = %self.core.created_handle, session = %handle, ?params, "session created");
        Ok(Session::new(
            SessionCore::new(handle, params),
            self.core.clone(),
            self.coordinator.clone(),
        ))
    }

    /// Session with the configured default sampling parameters
    pub fn create_default_session(&self) -> LiteRtResult<Session> {
        self.create_session(self.core.config.session.default_params)
    }

    pub fn number_of_tokens(&self, text: &str) -> LiteRtResult<usize> {
        self.core.number_of_tokens(text)
    }

    pub fn status(&self) -> EngineStatus {
        self.core.status()
    }

    pub fn is_valid(&self) -> bool {
        self.core.is_loaded() && !self.core.read_handle().is_null()
    }

    pub fn live_sessions(&self) -> usize {
        self.core.live_sessions()
    }

    pub fn model_path(&self) -> &Path {
        &self.core.model_path
    }

    pub fn config(&self) -> &CoordinatorConfig {
        self.core.config()
    }

    /// Number of operations in flight across all sessions of this engine
    pub fn in_flight(&self) -> usize {
        self.coordinator.bridge().in_flight()
    }

    /// Destroy the native engine. Idempotent.
    ///
    /// Operations still in flight on any session resolve as cancelled.
    /// Sessions should be disposed first; disposing a session after its
    /// engine is reported as an internal violation.
    pub fn dispose(&self) {
        if self.core.destroy() {
            info!(engine = %self.core.created_handle, "engine disposed");
        }
    }
}
