//! # Callback Bridge
//!
//! Turns native callbacks into ordered, consumer-side deliveries.
//!
//! ## Architecture
//!
//! ```text
//! native thread(s)                       consumer context
//!
//! on_token(session, bytes)
//!   └─→ registry.peek ─→ queue.send(Token) ──┐
//!                                            ├─→ DrainWorker (one per operation)
//! on_final(session, code)                    │     ├─→ user token callback
//!   └─→ registry.take ─→ queue.send(Final) ──┘     ├─→ completion slot
//!                                                  └─→ gate permit dropped
//! ```
//!
//! A callback's only job is to enqueue. Tokens and the terminal event share one
//! FIFO per operation, so the outcome can never overtake a fragment. Token
//! enqueue happens while the registry entry is read-locked, which makes a
//! concurrent `take` wait for it. The gate permit travels inside the terminal
//! event and is dropped by the drain worker after the completion is handed
//! over, so an abandoned caller still sees the gate released when the native
//! side finishes.
//!
//! Entries are keyed by session handle alone because the C callbacks carry
//! nothing else. This relies on the engine emitting every token of an
//! operation before that operation's final callback; a token arriving after
//! its final would be attributed to whatever operation the session runs next.

use std::any::Any;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};
use uuid::Uuid;

use super::context::{ConsumerContext, DiagnosticSink};
use super::gate::GatePermit;
use super::registry::HandleRegistry;
use crate::error::{InternalViolation, OperationKind};
use crate::ffi::native::NativeEvents;
use crate::ffi::types::{ResponseCode, SessionHandle};

/// User sink for generated text fragments, always invoked on the consumer context
pub type TokenCallback = Box<dyn FnMut(&str) + Send + 'static>;

enum BridgeEvent {
    Token(String),
    Final {
        code: ResponseCode,
        permit: Option<GatePermit>,
    },
}

/// Registry entry for one in-flight operation
pub struct SessionState {
    operation_id: Uuid,
    kind: OperationKind,
    started_at: Instant,
    queue: mpsc::UnboundedSender<BridgeEvent>,
    fragments_enqueued: AtomicU64,
    permit: Option<GatePermit>,
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("operation_id", &self.operation_id)
            .field("kind", &self.kind)
            .field("fragments_enqueued", &self.fragments_enqueued())
            .finish()
    }
}

impl SessionState {
    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn fragments_enqueued(&self) -> u64 {
        self.fragments_enqueued.load(Ordering::Acquire)
    }

    fn enqueue_token(&self, fragment: String) -> bool {
        self.fragments_enqueued.fetch_add(1, Ordering::AcqRel);
        self.queue.send(BridgeEvent::Token(fragment)).is_ok()
    }

    fn resolve(mut self, code: ResponseCode) {
        let permit = self.permit.take();
        debug!(
            operation_id = %self.operation_id,
            operation = %self.kind,
            code = %code,
            fragments = self.fragments_enqueued(),
            elapsed_ms = self.started_at.elapsed().as_millis() as u64,
            "operation reached terminal state"
        );
        if self.queue.send(BridgeEvent::Final { code, permit }).is_err() {
            debug!(operation_id = %self.operation_id, "drain worker gone before terminal event");
        }
    }
}

/// Summary handed to the awaiting caller when an operation ends
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub operation_id: Uuid,
    pub code: ResponseCode,
    /// All delivered fragments, concatenated in order
    pub text: String,
    pub fragment_count: usize,
    pub callback_panics: usize,
}

/// Caller-side half of an operation registered with the bridge
#[derive(Debug)]
pub struct PendingOperation {
    session: SessionHandle,
    operation_id: Uuid,
    kind: OperationKind,
    completion: oneshot::Receiver<DeliveryReport>,
}

impl PendingOperation {
    pub fn operation_id(&self) -> Uuid {
        self.operation_id
    }

    pub fn session(&self) -> SessionHandle {
        self.session
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Suspend until the terminal event has been delivered
    pub async fn wait(self) -> Result<DeliveryReport, InternalViolation> {
        let operation_id = self.operation_id;
        self.completion
            .await
            .map_err(|_| InternalViolation::CompletionDropped { operation_id }.report())
    }
}

struct DrainWorker {
    session: SessionHandle,
    operation_id: Uuid,
    queue: mpsc::UnboundedReceiver<BridgeEvent>,
    on_token: Option<TokenCallback>,
    completion: oneshot::Sender<DeliveryReport>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl DrainWorker {
    async fn run(mut self) {
        let mut text = String::new();
        let mut fragment_count = 0usize;
        let mut callback_panics = 0usize;

        while let Some(event) = self.queue.recv().await {
            match event {
                BridgeEvent::Token(fragment) => {
                    fragment_count += 1;
                    if let Some(callback) = self.on_token.as_mut() {
                        let delivered = catch_unwind(AssertUnwindSafe(|| callback(&fragment)));
                        if let Err(payload) = delivered {
                            callback_panics += 1;
                            self.diagnostics.report_callback_panic(
                                self.session,
                                self.operation_id,
                                &panic_message(payload.as_ref()),
                            );
                        }
                    }
                    text.push_str(&fragment);
                }
                BridgeEvent::Final { code, permit } => {
                    let report = DeliveryReport {
                        operation_id: self.operation_id,
                        code,
                        text,
                        fragment_count,
                        callback_panics,
                    };
                    if self.completion.send(report).is_err() {
                        debug!(
                            session = %self.session,
                            operation_id = %self.operation_id,
                            "caller abandoned operation before completion"
                        );
                    }
                    drop(permit);
                    return;
                }
            }
        }

        trace!(
            session = %self.session,
            operation_id = %self.operation_id,
            "operation rolled back before it started"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Receives native callbacks and redelivers them on the consumer context
pub struct CallbackBridge {
    registry: HandleRegistry<SessionState>,
    context: Arc<dyn ConsumerContext>,
    diagnostics: Arc<dyn DiagnosticSink>,
}

impl fmt::Debug for CallbackBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackBridge")
            .field("context", &self.context.name())
            .field("in_flight", &self.registry.len())
            .finish()
    }
}

impl CallbackBridge {
    pub fn new(context: Arc<dyn ConsumerContext>, diagnostics: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            registry: HandleRegistry::new(),
            context,
            diagnostics,
        }
    }

    /// Register a new operation and start its drain worker.
    ///
    /// The permit is held until the operation's terminal event is delivered.
    pub fn begin(
        &self,
        session: SessionHandle,
        kind: OperationKind,
        on_token: Option<TokenCallback>,
        permit: GatePermit,
    ) -> Result<PendingOperation, InternalViolation> {
        let operation_id = Uuid::new_v4();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = oneshot::channel();

        let state = SessionState {
            operation_id,
            kind,
            started_at: Instant::now(),
            queue: queue_tx,
            fragments_enqueued: AtomicU64::new(0),
            permit: Some(permit),
        };
        self.registry
            .register(session, state)
            .map_err(|_| InternalViolation::DuplicateRegistration { session }.report())?;

        let worker = DrainWorker {
            session,
            operation_id,
            queue: queue_rx,
            on_token,
            completion: completion_tx,
            diagnostics: self.diagnostics.clone(),
        };
        self.context.spawn(worker.run().boxed());

        debug!(
            session = %session,
            operation_id = %operation_id,
            operation = %kind,
            "operation registered"
        );

        Ok(PendingOperation {
            session,
            operation_id,
            kind,
            completion: completion_rx,
        })
    }

    /// Roll back an operation whose native start was rejected.
    ///
    /// No terminal callback will arrive for it, so the entry is taken here and
    /// dropped, which releases the gate and stops the drain worker.
    pub fn abort_start(&self, session: SessionHandle, operation_id: Uuid) -> bool {
        let rolled_back = self
            .registry
            .take_if(session, |state| state.operation_id == operation_id)
            .is_some();
        if rolled_back {
            debug!(session = %session, operation_id = %operation_id, "operation start rolled back");
        }
        rolled_back
    }

    /// Resolve whatever is in flight without waiting for the native layer
    pub fn force_terminal(&self, session: SessionHandle, code: ResponseCode) -> bool {
        match self.registry.take(session) {
            Some(state) => {
                warn!(
                    session = %session,
                    operation_id = %state.operation_id(),
                    code = %code,
                    "forcing terminal state without native confirmation"
                );
                state.resolve(code);
                true
            }
            None => false,
        }
    }

    pub fn is_in_flight(&self, session: SessionHandle) -> bool {
        self.registry.contains(session)
    }

    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }

    /// Sessions with an operation in flight right now
    pub fn in_flight_sessions(&self) -> Vec<SessionHandle> {
        self.registry.handles()
    }

    pub fn current_operation(&self, session: SessionHandle) -> Option<Uuid> {
        self.registry.peek(session).map(|state| state.operation_id())
    }

    /// Token callback body. Malformed UTF-8 and late fragments are dropped.
    pub fn deliver_token(&self, session: SessionHandle, bytes: &[u8]) {
        let fragment = match std::str::from_utf8(bytes) {
            Ok(fragment) => fragment,
            Err(err) => {
                trace!(session = %session, error = %err, "malformed UTF-8 fragment dropped");
                return;
            }
        };
        if fragment.is_empty() {
            return;
        }

        match self.registry.peek(session) {
            Some(state) => {
                if !state.enqueue_token(fragment.to_owned()) {
                    trace!(session = %session, "drain worker gone; fragment dropped");
                }
            }
            None => trace!(session = %session, "fragment for idle session dropped"),
        }
    }

    /// Final callback body. Only the first terminal signal per operation counts.
    pub fn deliver_final(&self, session: SessionHandle, raw_code: i32) {
        let code = ResponseCode::from_raw(raw_code);
        match self.registry.take(session) {
            Some(state) => state.resolve(code),
            None => debug!(
                session = %session,
                code = %code,
                "duplicate or late final callback ignored"
            ),
        }
    }
}

impl NativeEvents for CallbackBridge {
    fn on_token(&self, session: SessionHandle, fragment: &[u8]) {
        self.deliver_token(session, fragment);
    }

    fn on_final(&self, session: SessionHandle, code: i32) {
        self.deliver_final(session, code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::context::{TokioContext, TracingDiagnosticSink};
    use crate::coordinator::gate::ExclusionGate;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn session() -> SessionHandle {
        SessionHandle::from_raw(0x40)
    }

    fn bridge() -> Arc<CallbackBridge> {
        let context = TokioContext::try_current().expect("runtime");
        Arc::new(CallbackBridge::new(
            Arc::new(context),
            Arc::new(TracingDiagnosticSink),
        ))
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, TokenCallback) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, Box::new(move |t: &str| sink.lock().push(t.to_string())))
    }

    #[derive(Default)]
    struct RecordingSink {
        panics: Mutex<Vec<String>>,
    }

    impl DiagnosticSink for RecordingSink {
        fn report_callback_panic(&self, _: SessionHandle, _: Uuid, message: &str) {
            self.panics.lock().push(message.to_string());
        }
    }

    #[tokio::test]
    async fn test_tokens_delivered_in_order_before_terminal() {
        let bridge = bridge();
        let gate = ExclusionGate::new(session());
        let (seen, callback) = recorder();

        let pending = bridge
            .begin(
                session(),
                OperationKind::Generate,
                Some(callback),
                gate.acquire().await.unwrap(),
            )
            .unwrap();

        bridge.on_token(session(), b"A");
        bridge.on_token(session(), b"B");
        bridge.on_token(session(), b"C");
        bridge.on_final(session(), 0);

        let report = pending.wait().await.unwrap();
        assert_eq!(report.code, ResponseCode::Ok);
        assert_eq!(report.text, "ABC");
        assert_eq!(report.fragment_count, 3);
        assert_eq!(*seen.lock(), vec!["A", "B", "C"]);
        assert!(gate.is_free());
        assert!(!bridge.is_in_flight(session()));
    }

    #[tokio::test]
    async fn test_tokens_from_many_threads_keep_emission_order() {
        let bridge = bridge();
        let gate = ExclusionGate::new(session());
        let (seen, callback) = recorder();
        let pending = bridge
            .begin(
                session(),
                OperationKind::Generate,
                Some(callback),
                gate.acquire().await.unwrap(),
            )
            .unwrap();

        // Each fragment comes from a different OS thread, one after another
        let expected: Vec<String> = (0..32).map(|i| format!("t{i} ")).collect();
        for fragment in expected.clone() {
            let bridge = bridge.clone();
            std::thread::spawn(move || bridge.on_token(session(), fragment.as_bytes()))
                .join()
                .unwrap();
        }
        let finisher = bridge.clone();
        std::thread::spawn(move || finisher.on_final(session(), 0))
            .join()
            .unwrap();

        let report = pending.wait().await.unwrap();
        assert_eq!(*seen.lock(), expected);
        assert_eq!(report.text, expected.concat());
    }

    #[tokio::test]
    async fn test_duplicate_final_resolves_once() {
        let bridge = bridge();
        let gate = ExclusionGate::new(session());
        let pending = bridge
            .begin(
                session(),
                OperationKind::Generate,
                None,
                gate.acquire().await.unwrap(),
            )
            .unwrap();

        bridge.on_final(session(), ResponseCode::Internal.as_raw());
        bridge.on_final(session(), ResponseCode::Ok.as_raw());

        let report = pending.wait().await.unwrap();
        assert_eq!(report.code, ResponseCode::Internal);
        assert_eq!(bridge.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_malformed_utf8_fragment_is_dropped() {
        let bridge = bridge();
        let gate = ExclusionGate::new(session());
        let (seen, callback) = recorder();
        let pending = bridge
            .begin(
                session(),
                OperationKind::Generate,
                Some(callback),
                gate.acquire().await.unwrap(),
            )
            .unwrap();

        bridge.on_token(session(), "hé".as_bytes());
        bridge.on_token(session(), &[0xE2, 0x82]);
        bridge.on_token(session(), b"llo");
        bridge.on_final(session(), 0);

        let report = pending.wait().await.unwrap();
        assert_eq!(*seen.lock(), vec!["hé", "llo"]);
        assert_eq!(report.fragment_count, 2);
    }

    #[tokio::test]
    async fn test_panicking_callback_is_reported_not_propagated() {
        let context = TokioContext::try_current().unwrap();
        let sink = Arc::new(RecordingSink::default());
        let bridge = CallbackBridge::new(Arc::new(context), sink.clone());
        let gate = ExclusionGate::new(session());

        let mut calls = 0;
        let callback: TokenCallback = Box::new(move |_: &str| {
            calls += 1;
            if calls == 1 {
                panic!("consumer blew up");
            }
        });
        let pending = bridge
            .begin(
                session(),
                OperationKind::Generate,
                Some(callback),
                gate.acquire().await.unwrap(),
            )
            .unwrap();

        bridge.on_token(session(), b"x");
        bridge.on_token(session(), b"y");
        bridge.on_final(session(), 0);

        let report = pending.wait().await.unwrap();
        assert_eq!(report.callback_panics, 1);
        assert_eq!(report.text, "xy");
        assert_eq!(*sink.panics.lock(), vec!["consumer blew up"]);
    }

    #[tokio::test]
    async fn test_tokens_after_terminal_are_dropped() {
        let bridge = bridge();
        let gate = ExclusionGate::new(session());
        let pending = bridge
            .begin(
                session(),
                OperationKind::Generate,
                None,
                gate.acquire().await.unwrap(),
            )
            .unwrap();
        bridge.on_final(session(), 0);
        bridge.on_token(session(), b"late");

        let report = pending.wait().await.unwrap();
        assert_eq!(report.text, "");
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_internal_violation() {
        let bridge = bridge();
        let first_gate = ExclusionGate::new(session());
        let second_gate = ExclusionGate::new(session());
        let _pending = bridge
            .begin(
                session(),
                OperationKind::Generate,
                None,
                first_gate.acquire().await.unwrap(),
            )
            .unwrap();

        let err = bridge
            .begin(
                session(),
                OperationKind::Prefill,
                None,
                second_gate.acquire().await.unwrap(),
            )
            .unwrap_err();
        assert_eq!(
            err,
            InternalViolation::DuplicateRegistration { session: session() }
        );
        // The refused permit was released, the original entry is untouched
        assert!(second_gate.is_free());
        assert!(!first_gate.is_free());
        assert_eq!(bridge.in_flight(), 1);
    }

    #[tokio::test]
    async fn test_abort_start_releases_gate_and_drops_completion() {
        let bridge = bridge();
        let gate = ExclusionGate::new(session());
        let pending = bridge
            .begin(
                session(),
                OperationKind::Prefill,
                None,
                gate.acquire().await.unwrap(),
            )
            .unwrap();

        assert!(bridge.abort_start(session(), pending.operation_id()));
        assert!(gate.is_free());
        assert!(!bridge.abort_start(session(), pending.operation_id()));

        let err = pending.wait().await.unwrap_err();
        assert!(matches!(err, InternalViolation::CompletionDropped { .. }));
    }

    #[tokio::test]
    async fn test_abandoned_caller_still_releases_gate_on_final() {
        let bridge = bridge();
        let gate = ExclusionGate::new(session());
        let pending = bridge
            .begin(
                session(),
                OperationKind::Generate,
                None,
                gate.acquire().await.unwrap(),
            )
            .unwrap();
        drop(pending);
        assert!(!gate.is_free());

        bridge.on_final(session(), 0);
        let permit = tokio::time::timeout(Duration::from_secs(1), gate.acquire())
            .await
            .expect("gate released after terminal callback")
            .unwrap();
        drop(permit);
    }

    #[tokio::test]
    async fn test_force_terminal_resolves_pending() {
        let bridge = bridge();
        let gate = ExclusionGate::new(session());
        let pending = bridge
            .begin(
                session(),
                OperationKind::Generate,
                None,
                gate.acquire().await.unwrap(),
            )
            .unwrap();

        assert!(bridge.force_terminal(session(), ResponseCode::Cancelled));
        assert!(!bridge.force_terminal(session(), ResponseCode::Cancelled));
        assert_eq!(pending.wait().await.unwrap().code, ResponseCode::Cancelled);
        assert!(!bridge.is_in_flight(session()));
    }
}
