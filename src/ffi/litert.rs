//! # LiteRT-LM C Bindings
//!
//! `extern "C"` declarations for the `litert_lm_llm_unity` library and the
//! [`NativeApi`] implementation on top of them.
//!
//! The C callbacks carry only the session pointer, so the trampolines look the
//! session up in a process-wide route table to find the [`NativeEvents`] sink
//! that started the operation. Routes are installed when an operation starts
//! and removed when the session is destroyed. Neither trampoline lets a panic
//! cross back into native code.
//!
//! The table is process-wide rather than per engine because the C callback
//! signatures have no user-data pointer to carry an instance through.

use std::ffi::{c_char, c_int, c_void, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::ptr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, error};

use super::native::{NativeApi, NativeEvents};
use super::types::{
    EngineHandle, GenerateOptions, NativeLogLevel, ResponseCode, SessionHandle, SessionParams,
};

mod sys {
    use super::{c_char, c_int, c_void, SessionParams};

    pub type TokenCallback = extern "C" fn(session: *mut c_void, data: *const c_char, len: c_int);
    pub type FinalCallback = extern "C" fn(session: *mut c_void, code: c_int);

    #[link(name = "litert_lm_llm_unity")]
    extern "C" {
        pub fn create_engine(
            model_path: *const c_char,
            num_threads: c_int,
            out_engine: *mut *mut c_void,
            max_num_tokens: c_int,
        ) -> c_int;

        pub fn create_session(
            engine: *mut c_void,
            out_session: *mut *mut c_void,
            params: *const SessionParams,
        ) -> c_int;

        pub fn generate_text_sync_buffer(
            input: *const c_char,
            session: *mut c_void,
            output: *mut u8,
            buffer_size: c_int,
        ) -> c_int;

        pub fn generate_text_async(
            input: *const c_char,
            session: *mut c_void,
            ignore_eos: bool,
            max_num_tokens: c_int,
            on_token: TokenCallback,
            on_final: FinalCallback,
        );

        pub fn prefill_system_prompt(
            session: *mut c_void,
            text: *const c_char,
            on_final: FinalCallback,
        ) -> c_int;

        pub fn cancel_generation(session: *mut c_void);

        pub fn wait_until_done(engine: *mut c_void, timeout_ms: c_int) -> bool;

        pub fn destroy_engine(engine: *mut c_void);

        pub fn destroy_session(session: *mut c_void);

        pub fn number_of_tokens(input: *const c_char, engine: *mut c_void) -> c_int;

        pub fn set_min_logging_level(level: c_int);

        pub fn disable_logging();
    }
}

fn routes() -> &'static DashMap<usize, Arc<dyn NativeEvents>> {
    static ROUTES: OnceLock<DashMap<usize, Arc<dyn NativeEvents>>> = OnceLock::new();
    ROUTES.get_or_init(DashMap::new)
}

fn route_for(session: *mut c_void) -> Option<Arc<dyn NativeEvents>> {
    routes()
        .get(&(session as usize))
        .map(|entry| entry.value().clone())
}

extern "C" fn token_trampoline(session: *mut c_void, data: *const c_char, len: c_int) {
    let outcome = catch_unwind(AssertUnwindSafe(|| {
        if data.is_null() || len < 0 {
            return;
        }
        let Some(events) = route_for(session) else {
            return;
        };
        // SAFETY: the library guarantees `data` points at `len` readable bytes
        // for the duration of the callback.
        let bytes = unsafe { std::slice::from_raw_parts(data.cast::<u8>(), len as usize) };
        events.on_token(SessionHandle::from_raw(session as usize), bytes);
    }));
    if outcome.is_err() {
        error!(session = session as usize, "panic in token callback suppressed");
    }
}

extern "C" fn final_trampoline(session: *mut c_void, code: c_int) {
    let outcome = catch_unwind(AssertUnwindSafe(|| match route_for(session) {
        Some(events) => events.on_final(SessionHandle::from_raw(session as usize), code),
        None => debug!(
            session = session as usize,
            code, "final callback for unrouted session ignored"
        ),
    }));
    if outcome.is_err() {
        error!(session = session as usize, "panic in final callback suppressed");
    }
}

fn as_ptr(raw: usize) -> *mut c_void {
    raw as *mut c_void
}

/// [`NativeApi`] backed by the linked `litert_lm_llm_unity` library
#[derive(Debug, Default, Clone, Copy)]
pub struct LiteRtNative;

impl LiteRtNative {
    pub fn new() -> Self {
        Self
    }
}

impl NativeApi for LiteRtNative {
    fn create_engine(
        &self,
        model_path: &str,
        num_threads: i32,
        max_num_tokens: i32,
    ) -> Result<EngineHandle, ResponseCode> {
        let path = CString::new(model_path).map_err(|_| ResponseCode::InvalidArgument)?;
        let mut engine: *mut c_void = ptr::null_mut();
        // SAFETY: `path` is a valid C string and `engine` a valid out-pointer.
        let code = unsafe {
            sys::create_engine(path.as_ptr(), num_threads, &mut engine, max_num_tokens)
        };
        if code != 0 {
            return Err(ResponseCode::from_raw(code));
        }
        if engine.is_null() {
            return Err(ResponseCode::Internal);
        }
        Ok(EngineHandle::from_raw(engine as usize))
    }

    fn create_session(
        &self,
        engine: EngineHandle,
        params: &SessionParams,
    ) -> Result<SessionHandle, ResponseCode> {
        let mut session: *mut c_void = ptr::null_mut();
        // SAFETY: `engine` is a live engine handle owned by the caller and
        // `params` outlives the call.
        let code = unsafe {
            sys::create_session(as_ptr(engine.as_raw()), &mut session, params as *const _)
        };
        if code != 0 {
            return Err(ResponseCode::from_raw(code));
        }
        if session.is_null() {
            return Err(ResponseCode::NullSession);
        }
        Ok(SessionHandle::from_raw(session as usize))
    }

    fn generate_async(
        &self,
        session: SessionHandle,
        prompt: &str,
        options: GenerateOptions,
        events: Arc<dyn NativeEvents>,
    ) {
        let Ok(input) = CString::new(prompt) else {
            events.on_final(session, ResponseCode::InvalidArgument.as_raw());
            return;
        };
        routes().insert(session.as_raw(), events);
        // SAFETY: `session` is live and gated by the caller; the library copies
        // `input` before returning.
        unsafe {
            sys::generate_text_async(
                input.as_ptr(),
                as_ptr(session.as_raw()),
                options.ignore_eos,
                options.max_num_tokens,
                token_trampoline,
                final_trampoline,
            );
        }
    }

    fn prefill_system_prompt(
        &self,
        session: SessionHandle,
        text: &str,
        events: Arc<dyn NativeEvents>,
    ) -> ResponseCode {
        let Ok(input) = CString::new(text) else {
            return ResponseCode::InvalidArgument;
        };
        routes().insert(session.as_raw(), events);
        // SAFETY: `session` is live and gated by the caller.
        let code = unsafe {
            sys::prefill_system_prompt(as_ptr(session.as_raw()), input.as_ptr(), final_trampoline)
        };
        ResponseCode::from_raw(code)
    }

    fn generate_text_sync(
        &self,
        session: SessionHandle,
        prompt: &str,
        buffer: &mut [u8],
    ) -> ResponseCode {
        let Ok(input) = CString::new(prompt) else {
            return ResponseCode::InvalidArgument;
        };
        let size = c_int::try_from(buffer.len()).unwrap_or(c_int::MAX);
        // SAFETY: `buffer` is writable for `size` bytes and `session` is gated.
        let code = unsafe {
            sys::generate_text_sync_buffer(
                input.as_ptr(),
                as_ptr(session.as_raw()),
                buffer.as_mut_ptr(),
                size,
            )
        };
        ResponseCode::from_raw(code)
    }

    fn cancel_generation(&self, session: SessionHandle) {
        // SAFETY: cancellation is defined for any live session at any time.
        unsafe { sys::cancel_generation(as_ptr(session.as_raw())) }
    }

    fn wait_until_done(&self, engine: EngineHandle, timeout: Duration) -> bool {
        let timeout_ms = c_int::try_from(timeout.as_millis()).unwrap_or(c_int::MAX);
        // SAFETY: `engine` is live for the duration of the call.
        unsafe { sys::wait_until_done(as_ptr(engine.as_raw()), timeout_ms) }
    }

    fn destroy_session(&self, session: SessionHandle) {
        routes().remove(&session.as_raw());
        // SAFETY: the lifecycle manager destroys each session exactly once.
        unsafe { sys::destroy_session(as_ptr(session.as_raw())) }
    }

    fn destroy_engine(&self, engine: EngineHandle) {
        // SAFETY: the lifecycle manager destroys each engine exactly once.
        unsafe { sys::destroy_engine(as_ptr(engine.as_raw())) }
    }

    fn number_of_tokens(&self, engine: EngineHandle, text: &str) -> i32 {
        let Ok(input) = CString::new(text) else {
            return -1;
        };
        // SAFETY: `engine` is live and `input` is a valid C string.
        unsafe { sys::number_of_tokens(input.as_ptr(), as_ptr(engine.as_raw())) }
    }

    fn set_min_log_level(&self, level: NativeLogLevel) {
        // SAFETY: plain value call with no pointers.
        unsafe { sys::set_min_logging_level(level.as_raw()) }
    }

    fn disable_logging(&self) {
        // SAFETY: no arguments.
        unsafe { sys::disable_logging() }
    }
}
