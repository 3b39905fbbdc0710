//! Test support: a scriptable fake of the native engine.

pub mod fake_native;

pub use fake_native::{FakeNative, NativeCall, Script};
