//! # Fake Native Engine
//!
//! Scriptable stand-in for the native library. Callbacks are emitted from the
//! fake's own worker threads, never from the calling thread, so tests see the
//! same thread split as with the real engine.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};

use crate::ffi::native::{NativeApi, NativeEvents};
use crate::ffi::types::{
    EngineHandle, GenerateOptions, NativeLogLevel, ResponseCode, SessionHandle, SessionParams,
};

/// How the fake answers one prompt
#[derive(Debug, Clone)]
pub struct Script {
    pub fragments: Vec<Vec<u8>>,
    pub final_code: ResponseCode,
    /// Returned synchronously by prefill and blocking generation
    pub start_code: ResponseCode,
    pub duplicate_final: bool,
    /// Emit fragments, then wait for cancellation before the final callback
    pub hold_until_cancel: bool,
    /// Ignore cancellation until [`FakeNative::release_unresponsive`]
    pub unresponsive: bool,
    /// Emit each fragment from a fresh OS thread
    pub spread_threads: bool,
    pub fragment_delay: Duration,
    /// Emit nothing; the test drives callbacks with `emit_token` / `emit_final`
    pub manual: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self::tokens(["Hello", ", ", "world"])
    }
}

impl Script {
    pub fn tokens<I, T>(fragments: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<[u8]>,
    {
        Self {
            fragments: fragments.into_iter().map(|f| f.as_ref().to_vec()).collect(),
            final_code: ResponseCode::Ok,
            start_code: ResponseCode::Ok,
            duplicate_final: false,
            hold_until_cancel: false,
            unresponsive: false,
            spread_threads: false,
            fragment_delay: Duration::ZERO,
            manual: false,
        }
    }

    pub fn manual() -> Self {
        Self {
            manual: true,
            ..Self::tokens(Vec::<Vec<u8>>::new())
        }
    }

    pub fn with_final(mut self, code: ResponseCode) -> Self {
        self.final_code = code;
        self
    }

    pub fn with_start_code(mut self, code: ResponseCode) -> Self {
        self.start_code = code;
        self
    }

    pub fn with_duplicate_final(mut self) -> Self {
        self.duplicate_final = true;
        self
    }

    pub fn hold_until_cancel(mut self) -> Self {
        self.hold_until_cancel = true;
        self
    }

    pub fn unresponsive(mut self) -> Self {
        self.unresponsive = true;
        self
    }

    pub fn across_threads(mut self) -> Self {
        self.spread_threads = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = delay;
        self
    }

    fn text(&self) -> Vec<u8> {
        self.fragments.concat()
    }
}

/// Every call the binding made, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeCall {
    CreateEngine { model_path: String, num_threads: i32 },
    CreateSession { engine: EngineHandle },
    GenerateAsync { session: SessionHandle, prompt: String, options: GenerateOptions },
    Prefill { session: SessionHandle, text: String },
    GenerateSync { session: SessionHandle, prompt: String },
    Cancel { session: SessionHandle },
    WaitUntilDone { engine: EngineHandle },
    DestroySession { session: SessionHandle },
    DestroyEngine { engine: EngineHandle },
    NumberOfTokens { engine: EngineHandle },
    SetLogLevel { level: NativeLogLevel },
    DisableLogging,
}

#[derive(Default)]
struct ActiveWork {
    count: Mutex<usize>,
    idle: Condvar,
}

impl ActiveWork {
    fn begin(&self) {
        *self.count.lock() += 1;
    }

    fn end(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.idle.notify_all();
        }
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.idle.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }
}

struct Inner {
    next_handle: AtomicUsize,
    scripts: DashMap<String, Script>,
    default_script: Mutex<Script>,
    engine_failure: Mutex<Option<ResponseCode>>,
    session_failure: Mutex<Option<ResponseCode>>,
    sync_output: Mutex<HashMap<String, String>>,

    session_engines: DashMap<usize, EngineHandle>,
    destroyed_engines: DashMap<usize, ()>,
    destroyed_sessions: DashMap<usize, ()>,
    events: DashMap<usize, Arc<dyn NativeEvents>>,
    busy: DashMap<usize, ()>,
    cancels: DashMap<usize, Sender<()>>,
    release: Mutex<Option<(Sender<()>, Receiver<()>)>>,

    active: ActiveWork,
    calls: Mutex<Vec<NativeCall>>,
    overlapping_starts: AtomicUsize,
    misuse: AtomicUsize,
}

/// Scriptable [`NativeApi`] implementation
#[derive(Clone)]
pub struct FakeNative {
    inner: Arc<Inner>,
}

impl Default for FakeNative {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FakeNative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeNative")
            .field("calls", &self.inner.calls.lock().len())
            .finish()
    }
}

impl FakeNative {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                next_handle: AtomicUsize::new(0x1000),
                scripts: DashMap::new(),
                default_script: Mutex::new(Script::default()),
                engine_failure: Mutex::new(None),
                session_failure: Mutex::new(None),
                sync_output: Mutex::new(HashMap::new()),
                session_engines: DashMap::new(),
                destroyed_engines: DashMap::new(),
                destroyed_sessions: DashMap::new(),
                events: DashMap::new(),
                busy: DashMap::new(),
                cancels: DashMap::new(),
                release: Mutex::new(Some(channel::unbounded())),
                active: ActiveWork::default(),
                calls: Mutex::new(Vec::new()),
                overlapping_starts: AtomicUsize::new(0),
                misuse: AtomicUsize::new(0),
            }),
        }
    }

    /// Shared handle as the trait object the engine builder expects
    pub fn api(&self) -> Arc<dyn NativeApi> {
        Arc::new(self.clone())
    }

    pub fn script(&self, prompt: impl Into<String>, script: Script) {
        self.inner.scripts.insert(prompt.into(), script);
    }

    pub fn set_default_script(&self, script: Script) {
        *self.inner.default_script.lock() = script;
    }

    pub fn fail_engine_creation(&self, code: ResponseCode) {
        *self.inner.engine_failure.lock() = Some(code);
    }

    pub fn fail_session_creation(&self, code: ResponseCode) {
        *self.inner.session_failure.lock() = Some(code);
    }

    /// Text written by blocking generation for `prompt`
    pub fn sync_output(&self, prompt: impl Into<String>, text: impl Into<String>) {
        self.inner.sync_output.lock().insert(prompt.into(), text.into());
    }

    pub fn calls(&self) -> Vec<NativeCall> {
        self.inner.calls.lock().clone()
    }

    pub fn count_calls(&self, predicate: impl Fn(&NativeCall) -> bool) -> usize {
        self.inner.calls.lock().iter().filter(|call| predicate(call)).count()
    }

    /// Starts issued while another operation on the same session was running
    pub fn overlapping_starts(&self) -> usize {
        self.inner.overlapping_starts.load(Ordering::SeqCst)
    }

    /// Calls made on a destroyed handle, or on a session whose engine was destroyed
    pub fn misuse_count(&self) -> usize {
        self.inner.misuse.load(Ordering::SeqCst)
    }

    pub fn is_busy(&self, session: SessionHandle) -> bool {
        self.inner.busy.contains_key(&session.as_raw())
    }

    /// Let every unresponsive operation finish with a (late) cancelled final
    pub fn release_unresponsive(&self) {
        self.inner.release.lock().take();
    }

    /// Emit a token for a session running a manual script
    pub fn emit_token(&self, session: SessionHandle, fragment: &[u8]) {
        if let Some(events) = self.events_for(session) {
            let fragment = fragment.to_vec();
            let _ = thread::spawn(move || events.on_token(session, &fragment)).join();
        }
    }

    /// Emit a final callback for a session running a manual script
    pub fn emit_final(&self, session: SessionHandle, code: ResponseCode) {
        self.inner.finish(session);
        if let Some(events) = self.events_for(session) {
            let _ = thread::spawn(move || events.on_final(session, code.as_raw())).join();
        }
        self.inner.active.end();
    }

    fn events_for(&self, session: SessionHandle) -> Option<Arc<dyn NativeEvents>> {
        self.inner
            .events
            .get(&session.as_raw())
            .map(|entry| entry.value().clone())
    }

    fn record(&self, call: NativeCall) {
        self.inner.calls.lock().push(call);
    }

    fn script_for(&self, prompt: &str) -> Script {
        self.inner
            .scripts
            .get(prompt)
            .map(|entry| entry.value().clone())
            .unwrap_or_else(|| self.inner.default_script.lock().clone())
    }

    fn check_session(&self, session: SessionHandle) {
        let raw = session.as_raw();
        let engine_gone = self
            .inner
            .session_engines
            .get(&raw)
            .map(|engine| self.inner.destroyed_engines.contains_key(&engine.as_raw()))
            .unwrap_or(true);
        if session.is_null() || engine_gone || self.inner.destroyed_sessions.contains_key(&raw) {
            self.inner.misuse.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn mark_busy(&self, session: SessionHandle) {
        if self.inner.busy.insert(session.as_raw(), ()).is_some() {
            self.inner.overlapping_starts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn run(&self, session: SessionHandle, script: Script, events: Arc<dyn NativeEvents>) {
        self.mark_busy(session);
        self.inner.events.insert(session.as_raw(), events.clone());
        self.inner.active.begin();
        if script.manual {
            return;
        }

        let (cancel_tx, cancel_rx) = channel::bounded::<()>(1);
        self.inner.cancels.insert(session.as_raw(), cancel_tx);
        let release = self
            .inner
            .release
            .lock()
            .as_ref()
            .map(|(_, rx)| rx.clone());
        let inner = self.inner.clone();

        thread::spawn(move || {
            let mut cancelled = false;
            for fragment in &script.fragments {
                if !script.unresponsive && cancel_rx.try_recv().is_ok() {
                    cancelled = true;
                    break;
                }
                if !script.fragment_delay.is_zero() {
                    match cancel_rx.recv_timeout(script.fragment_delay) {
                        Ok(()) if !script.unresponsive => {
                            cancelled = true;
                            break;
                        }
                        Ok(()) | Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => {}
                    }
                }
                if script.spread_threads {
                    let events = events.clone();
                    let fragment = fragment.clone();
                    let _ = thread::spawn(move || events.on_token(session, &fragment)).join();
                } else {
                    events.on_token(session, fragment);
                }
            }

            if script.unresponsive {
                if let Some(release) = release {
                    // Disconnects when the fake releases unresponsive work
                    let _ = release.recv_timeout(Duration::from_secs(10));
                }
                cancelled = true;
            } else if !cancelled && script.hold_until_cancel {
                let _ = cancel_rx.recv_timeout(Duration::from_secs(10));
                cancelled = true;
            }

            let code = if cancelled {
                ResponseCode::Cancelled
            } else {
                script.final_code
            };
            inner.finish(session);
            events.on_final(session, code.as_raw());
            if script.duplicate_final {
                events.on_final(session, ResponseCode::Ok.as_raw());
            }
            inner.active.end();
        });
    }
}

impl Inner {
    fn finish(&self, session: SessionHandle) {
        self.cancels.remove(&session.as_raw());
        self.busy.remove(&session.as_raw());
    }
}

impl NativeApi for FakeNative {
    fn create_engine(
        &self,
        model_path: &str,
        num_threads: i32,
        _max_num_tokens: i32,
    ) -> Result<EngineHandle, ResponseCode> {
        self.record(NativeCall::CreateEngine {
            model_path: model_path.to_string(),
            num_threads,
        });
        if let Some(code) = *self.inner.engine_failure.lock() {
            return Err(code);
        }
        Ok(EngineHandle::from_raw(
            self.inner.next_handle.fetch_add(0x10, Ordering::SeqCst),
        ))
    }

    fn create_session(
        &self,
        engine: EngineHandle,
        _params: &SessionParams,
    ) -> Result<SessionHandle, ResponseCode> {
        self.record(NativeCall::CreateSession { engine });
        if self.inner.destroyed_engines.contains_key(&engine.as_raw()) {
            self.inner.misuse.fetch_add(1, Ordering::SeqCst);
        }
        if let Some(code) = *self.inner.session_failure.lock() {
            return Err(code);
        }
        let session =
            SessionHandle::from_raw(self.inner.next_handle.fetch_add(0x10, Ordering::SeqCst));
        self.inner.session_engines.insert(session.as_raw(), engine);
        Ok(session)
    }

    fn generate_async(
        &self,
        session: SessionHandle,
        prompt: &str,
        options: GenerateOptions,
        events: Arc<dyn NativeEvents>,
    ) {
        self.record(NativeCall::GenerateAsync {
            session,
            prompt: prompt.to_string(),
            options,
        });
        self.check_session(session);
        let script = self.script_for(prompt);
        self.run(session, script, events);
    }

    fn prefill_system_prompt(
        &self,
        session: SessionHandle,
        text: &str,
        events: Arc<dyn NativeEvents>,
    ) -> ResponseCode {
        self.record(NativeCall::Prefill {
            session,
            text: text.to_string(),
        });
        self.check_session(session);
        let script = self.script_for(text);
        if !script.start_code.is_ok() {
            return script.start_code;
        }
        let script = Script {
            fragments: Vec::new(),
            ..script
        };
        self.run(session, script, events);
        ResponseCode::Ok
    }

    fn generate_text_sync(
        &self,
        session: SessionHandle,
        prompt: &str,
        buffer: &mut [u8],
    ) -> ResponseCode {
        self.record(NativeCall::GenerateSync {
            session,
            prompt: prompt.to_string(),
        });
        self.check_session(session);
        let script = self.script_for(prompt);
        if !script.start_code.is_ok() {
            return script.start_code;
        }
        self.mark_busy(session);

        let output = self
            .inner
            .sync_output
            .lock()
            .get(prompt)
            .map(|text| text.as_bytes().to_vec())
            .unwrap_or_else(|| script.text());
        let written = output.len().min(buffer.len().saturating_sub(1));
        buffer[..written].copy_from_slice(&output[..written]);
        if let Some(terminator) = buffer.get_mut(written) {
            *terminator = 0;
        }

        self.inner.finish(session);
        script.final_code
    }

    fn cancel_generation(&self, session: SessionHandle) {
        self.record(NativeCall::Cancel { session });
        if let Some(cancel) = self.inner.cancels.get(&session.as_raw()) {
            let _ = cancel.try_send(());
        }
    }

    fn wait_until_done(&self, engine: EngineHandle, timeout: Duration) -> bool {
        self.record(NativeCall::WaitUntilDone { engine });
        self.inner.active.wait_idle(timeout)
    }

    fn destroy_session(&self, session: SessionHandle) {
        self.record(NativeCall::DestroySession { session });
        self.check_session(session);
        self.inner.destroyed_sessions.insert(session.as_raw(), ());
        self.inner.events.remove(&session.as_raw());
    }

    fn destroy_engine(&self, engine: EngineHandle) {
        self.record(NativeCall::DestroyEngine { engine });
        if engine.is_null()
            || self
                .inner
                .destroyed_engines
                .insert(engine.as_raw(), ())
                .is_some()
        {
            self.inner.misuse.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn number_of_tokens(&self, engine: EngineHandle, text: &str) -> i32 {
        self.record(NativeCall::NumberOfTokens { engine });
        i32::try_from(text.split_whitespace().count()).unwrap_or(i32::MAX)
    }

    fn set_min_log_level(&self, level: NativeLogLevel) {
        self.record(NativeCall::SetLogLevel { level });
    }

    fn disable_logging(&self) {
        self.record(NativeCall::DisableLogging);
    }
}
