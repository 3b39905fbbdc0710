//! # FFI Boundary
//!
//! Types, traits and C declarations for the native LiteRT-LM engine.

#[cfg(feature = "litert")]
pub mod litert;
pub mod native;
pub mod types;

#[cfg(feature = "litert")]
pub use litert::LiteRtNative;
pub use native::{NativeApi, NativeEvents};
pub use types::*;
