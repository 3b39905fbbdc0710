//! # Native Boundary Types
//!
//! Plain data exchanged with the native engine: opaque handles, result codes,
//! sampling parameters and log levels. Layouts marked `#[repr(C)]` are passed
//! by pointer across the C ABI and must not be reordered.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque identifier for a loaded model instance. Zero is the "not loaded" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct EngineHandle(usize);

impl EngineHandle {
    pub const NULL: EngineHandle = EngineHandle(0);

    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> usize {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for EngineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "engine@{:#x}", self.0)
    }
}

/// Opaque identifier for one generation context. Zero is the "destroyed" sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct SessionHandle(usize);

impl SessionHandle {
    pub const NULL: SessionHandle = SessionHandle(0);

    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub fn as_raw(self) -> usize {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session@{:#x}", self.0)
    }
}

/// Terminal and start codes reported by the native library.
///
/// Values 0..=16 follow the standard status taxonomy; the two negative codes
/// are rejections the binding library issues before touching the engine.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseCode {
    EmptyInput = -1,
    NullSession = -2,
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl ResponseCode {
    /// Map a raw native code; anything outside the known set is `Unknown`
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            -1 => ResponseCode::EmptyInput,
            -2 => ResponseCode::NullSession,
            0 => ResponseCode::Ok,
            1 => ResponseCode::Cancelled,
            3 => ResponseCode::InvalidArgument,
            4 => ResponseCode::DeadlineExceeded,
            5 => ResponseCode::NotFound,
            6 => ResponseCode::AlreadyExists,
            7 => ResponseCode::PermissionDenied,
            8 => ResponseCode::ResourceExhausted,
            9 => ResponseCode::FailedPrecondition,
            10 => ResponseCode::Aborted,
            11 => ResponseCode::OutOfRange,
            12 => ResponseCode::Unimplemented,
            13 => ResponseCode::Internal,
            14 => ResponseCode::Unavailable,
            15 => ResponseCode::DataLoss,
            16 => ResponseCode::Unauthenticated,
            _ => ResponseCode::Unknown,
        }
    }

    pub fn as_raw(self) -> i32 {
        self as i32
    }

    pub fn is_ok(self) -> bool {
        self == ResponseCode::Ok
    }

    pub fn is_cancelled(self) -> bool {
        self == ResponseCode::Cancelled
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ResponseCode::EmptyInput => "empty_input",
            ResponseCode::NullSession => "null_session",
            ResponseCode::Ok => "ok",
            ResponseCode::Cancelled => "cancelled",
            ResponseCode::Unknown => "unknown",
            ResponseCode::InvalidArgument => "invalid_argument",
            ResponseCode::DeadlineExceeded => "deadline_exceeded",
            ResponseCode::NotFound => "not_found",
            ResponseCode::AlreadyExists => "already_exists",
            ResponseCode::PermissionDenied => "permission_denied",
            ResponseCode::ResourceExhausted => "resource_exhausted",
            ResponseCode::FailedPrecondition => "failed_precondition",
            ResponseCode::Aborted => "aborted",
            ResponseCode::OutOfRange => "out_of_range",
            ResponseCode::Unimplemented => "unimplemented",
            ResponseCode::Internal => "internal",
            ResponseCode::Unavailable => "unavailable",
            ResponseCode::DataLoss => "data_loss",
            ResponseCode::Unauthenticated => "unauthenticated",
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sampling strategy tag understood by the engine
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SamplingType {
    /// Let the engine pick its configured sampler
    #[default]
    Default = 0,
    TopK = 1,
    TopP = 2,
    Greedy = 3,
}

/// Sampling configuration fixed at session creation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub top_k: i32,
    pub top_p: f32,
    pub seed: i32,
    pub temperature: i32,
    /// Validated and configurable only; the native session parameters have no
    /// field for it, so it is not forwarded to the engine.
    pub sampling_type: SamplingType,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            top_k: 40,
            top_p: 0.9,
            seed: 0,
            temperature: 1,
            sampling_type: SamplingType::Default,
        }
    }
}

impl SamplingParams {
    pub fn with_top_k(mut self, top_k: i32) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_seed(mut self, seed: i32) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_temperature(mut self, temperature: i32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_sampling_type(mut self, sampling_type: SamplingType) -> Self {
        self.sampling_type = sampling_type;
        self
    }

    /// Reject values the engine cannot sample with
    pub fn validate(&self) -> Result<(), String> {
        if self.top_k <= 0 {
            return Err(format!("top_k must be positive, got {}", self.top_k));
        }
        if !(self.top_p > 0.0 && self.top_p <= 1.0) {
            return Err(format!("top_p must be in (0, 1], got {}", self.top_p));
        }
        if self.temperature < 0 {
            return Err(format!(
                "temperature must not be negative, got {}",
                self.temperature
            ));
        }
        Ok(())
    }
}

/// Wire layout of the session parameters struct passed to `create_session`
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SessionParams {
    pub top_k: i32,
    pub top_p: f32,
    pub seed: i32,
    pub temperature: i32,
}

impl From<&SamplingParams> for SessionParams {
    fn from(params: &SamplingParams) -> Self {
        Self {
            top_k: params.top_k,
            top_p: params.top_p,
            seed: params.seed,
            temperature: params.temperature,
        }
    }
}

/// Minimum severity of messages the native library writes to its own log
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NativeLogLevel {
    Debug = -1,
    Info = 0,
    Verbose = 1,
    Warning = 2,
    Error = 3,
    Fatal = 4,
    #[serde(alias = "none")]
    Off = 5,
}

impl NativeLogLevel {
    pub fn as_raw(self) -> i32 {
        self as i32
    }
}

/// Per-request knobs for `generate_text_async`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerateOptions {
    /// Keep sampling past end-of-sequence
    pub ignore_eos: bool,
    /// Token cap, -1 for the engine default
    pub max_num_tokens: i32,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            ignore_eos: false,
            max_num_tokens: -1,
        }
    }
}

impl GenerateOptions {
    pub fn ignore_eos(max_num_tokens: i32) -> Self {
        Self {
            ignore_eos: true,
            max_num_tokens,
        }
    }
}
