//! # Lifecycle Manager
//!
//! Engine and session ownership, ordered disposal and the state machines
//! behind `status()`.

pub mod engine;
pub mod session;
pub mod state;

pub use engine::{Engine, EngineBuilder, EngineCore};
pub use session::{Session, SessionCore};
pub use state::{EngineStatus, SessionStatus};
