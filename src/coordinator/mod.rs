//! # Session Generation Coordinator
//!
//! Registry, exclusion gate, callback bridge and the coordinator that drives
//! them for each generation or prefill request.

pub mod bridge;
pub mod context;
pub mod gate;
pub mod generation;
pub mod registry;

pub use bridge::{CallbackBridge, DeliveryReport, PendingOperation, SessionState, TokenCallback};
pub use context::{default_diagnostics, ConsumerContext, DiagnosticSink, TokioContext, TracingDiagnosticSink};
pub use gate::{ExclusionGate, GateError, GatePermit};
pub use generation::{Completion, GenerationCoordinator, TerminalOutcome};
pub use registry::{HandleRegistry, RegistryError};
