//! Engine and session creation, status and ordered disposal

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use litert_lm::test_helpers::{FakeNative, NativeCall, Script};
use litert_lm::{
    CoordinatorConfig, Engine, EngineStatus, InternalViolation, LiteRtError, NativeLogLevel,
    ResponseCode, SamplingParams, SessionStatus,
};

use common::{
    engine, engine_with, is_cancel, is_destroy_engine, is_destroy_session, session,
    wait_for_status,
};

#[tokio::test]
async fn test_engine_and_session_report_status() {
    let fake = FakeNative::new();
    let engine = engine(&fake);
    assert_eq!(engine.status(), EngineStatus::Loaded);
    assert!(engine.is_valid());

    let session = session(&engine);
    assert_eq!(session.status(), SessionStatus::Idle);
    assert!(session.is_valid());
    assert_eq!(engine.live_sessions(), 1);

    session.dispose().unwrap();
    assert_eq!(session.status(), SessionStatus::Destroyed);
    assert!(!session.is_valid());
    assert_eq!(engine.live_sessions(), 0);
}

#[tokio::test]
async fn test_dispose_idle_session_is_clean_and_idempotent() {
    let fake = FakeNative::new();
    let engine = engine(&fake);
    let session = session(&engine);

    session.dispose().unwrap();
    session.dispose().unwrap();

    assert_eq!(fake.count_calls(is_cancel), 0);
    assert_eq!(fake.count_calls(is_destroy_session), 1);
    assert!(!fake
        .calls()
        .iter()
        .any(|call| matches!(call, NativeCall::WaitUntilDone { .. })));
    assert_eq!(
        session.generate("after", None).await.unwrap_err(),
        LiteRtError::SessionDisposed
    );
    assert_eq!(
        session.prefill_system_prompt("after").await.unwrap_err(),
        LiteRtError::SessionDisposed
    );
    assert_eq!(session.generate_blocking("after").unwrap_err(), LiteRtError::SessionDisposed);
    session.cancel();
    assert_eq!(fake.misuse_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispose_in_flight_cancels_waits_then_destroys() {
    let fake = FakeNative::new();
    fake.script("long", Script::tokens(["a"]).hold_until_cancel());
    let engine = engine(&fake);
    let session = Arc::new(session(&engine));

    let running = tokio::spawn({
        let session = session.clone();
        async move { session.generate("long", None).await }
    });
    wait_for_status(&session, SessionStatus::InFlight).await;

    session.dispose().unwrap();
    let err = running.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(session.status(), SessionStatus::Destroyed);

    let calls = fake.calls();
    let position = |predicate: fn(&NativeCall) -> bool| calls.iter().position(predicate).unwrap();
    let cancel = position(is_cancel);
    let wait = position(|call| matches!(call, NativeCall::WaitUntilDone { .. }));
    let destroy = position(is_destroy_session);
    assert!(cancel < wait && wait < destroy);
    assert_eq!(fake.misuse_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispose_fails_queued_callers() {
    let fake = FakeNative::new();
    fake.script("long", Script::tokens(["a"]).hold_until_cancel());
    let engine = engine(&fake);
    let session = Arc::new(session(&engine));

    let running = tokio::spawn({
        let session = session.clone();
        async move { session.generate("long", None).await }
    });
    wait_for_status(&session, SessionStatus::InFlight).await;
    let queued = tokio::spawn({
        let session = session.clone();
        async move { session.generate("queued", None).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    session.dispose().unwrap();
    assert!(running.await.unwrap().unwrap_err().is_cancelled());
    assert_eq!(
        queued.await.unwrap().unwrap_err(),
        LiteRtError::SessionDisposed
    );
    assert!(!fake
        .calls()
        .iter()
        .any(|call| matches!(call, NativeCall::GenerateAsync { prompt, .. } if prompt == "queued")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispose_forces_cancelled_when_native_never_finishes() {
    let fake = FakeNative::new();
    fake.script("stuck", Script::tokens(["s"]).unresponsive());
    let mut config = CoordinatorConfig::default();
    config.dispose.wait_timeout_ms = 50;
    let engine = engine_with(&fake, config);
    let session = Arc::new(session(&engine));

    let running = tokio::spawn({
        let session = session.clone();
        async move { session.generate("stuck", None).await }
    });
    wait_for_status(&session, SessionStatus::InFlight).await;

    session.dispose().unwrap();
    assert!(running.await.unwrap().unwrap_err().is_cancelled());
    assert_eq!(engine.in_flight(), 0);

    // The native side finishing late changes nothing
    fake.release_unresponsive();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(session.status(), SessionStatus::Destroyed);
}

#[tokio::test]
async fn test_session_disposed_after_engine_reports_violation() {
    let fake = FakeNative::new();
    let engine = engine(&fake);
    let session = session(&engine);

    engine.dispose();
    assert_eq!(engine.status(), EngineStatus::Destroyed);

    let err = session.dispose().unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(
        err,
        LiteRtError::Internal(InternalViolation::SessionOutlivedEngine { .. })
    ));
    // No native call touched the stale session
    assert_eq!(fake.count_calls(is_destroy_session), 0);
    assert_eq!(fake.misuse_count(), 0);
    assert_eq!(session.status(), SessionStatus::Destroyed);

    // Later calls are ordinary precondition failures
    session.dispose().unwrap();
    assert_eq!(
        session.generate("x", None).await.unwrap_err(),
        LiteRtError::SessionDisposed
    );
}

#[tokio::test]
async fn test_generate_after_engine_dispose_fails_without_native_call() {
    let fake = FakeNative::new();
    let engine = engine(&fake);
    let session = session(&engine);
    engine.dispose();

    assert_eq!(
        session.generate("x", None).await.unwrap_err(),
        LiteRtError::EngineDisposed
    );
    assert_eq!(engine.create_session(SamplingParams::default()).unwrap_err(), LiteRtError::EngineDisposed);
    assert_eq!(engine.number_of_tokens("a b").unwrap_err(), LiteRtError::EngineDisposed);
    assert!(!session.is_valid());
    assert_eq!(fake.misuse_count(), 0);
    let _ = session.dispose();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_engine_dispose_cancels_in_flight_generation() {
    let fake = FakeNative::new();
    fake.script("long", Script::tokens(["a"]).hold_until_cancel());
    let mut config = CoordinatorConfig::default();
    config.dispose.wait_timeout_ms = 2_000;
    let engine = engine_with(&fake, config);
    let session = Arc::new(session(&engine));
    assert!(session.current_operation().is_none());

    let running = tokio::spawn({
        let session = session.clone();
        async move { session.generate("long", None).await }
    });
    wait_for_status(&session, SessionStatus::InFlight).await;
    assert!(session.current_operation().is_some());

    let started = Instant::now();
    engine.dispose();
    assert!(started.elapsed() < Duration::from_millis(1_000));

    let outcome = tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .expect("generation resolves once the engine is disposed")
        .unwrap();
    assert!(outcome.unwrap_err().is_cancelled());
    assert_eq!(engine.in_flight(), 0);
    assert!(session.current_operation().is_none());
    assert_ne!(session.status(), SessionStatus::InFlight);

    let calls = fake.calls();
    let cancel = calls.iter().position(is_cancel).unwrap();
    let destroy = calls.iter().position(is_destroy_engine).unwrap();
    assert!(cancel < destroy);
    assert_eq!(fake.misuse_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_engine_dispose_forces_cancelled_when_native_never_finishes() {
    let fake = FakeNative::new();
    fake.script("stuck", Script::tokens(["s"]).unresponsive());
    let mut config = CoordinatorConfig::default();
    config.dispose.wait_timeout_ms = 50;
    let engine = engine_with(&fake, config);
    let session = Arc::new(session(&engine));

    let running = tokio::spawn({
        let session = session.clone();
        async move { session.generate("stuck", None).await }
    });
    wait_for_status(&session, SessionStatus::InFlight).await;

    engine.dispose();
    let outcome = tokio::time::timeout(Duration::from_secs(1), running)
        .await
        .expect("forced terminal state reaches the caller")
        .unwrap();
    assert!(outcome.unwrap_err().is_cancelled());
    assert_eq!(engine.in_flight(), 0);

    // A late native final is ignored
    fake.release_unresponsive();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fake.misuse_count(), 0);
}

#[tokio::test]
async fn test_engine_dispose_is_idempotent() {
    let fake = FakeNative::new();
    let engine = engine(&fake);
    engine.dispose();
    engine.dispose();
    drop(engine);
    assert_eq!(fake.count_calls(is_destroy_engine), 1);
    assert_eq!(fake.misuse_count(), 0);
}

#[tokio::test]
async fn test_dropping_handles_releases_native_resources() {
    let fake = FakeNative::new();
    {
        let engine = engine(&fake);
        let _session = session(&engine);
    }
    assert_eq!(fake.count_calls(is_destroy_session), 1);
    assert_eq!(fake.count_calls(is_destroy_engine), 1);
    let calls = fake.calls();
    let session_gone = calls.iter().position(is_destroy_session).unwrap();
    let engine_gone = calls.iter().position(is_destroy_engine).unwrap();
    assert!(session_gone < engine_gone);
}

#[tokio::test]
async fn test_creation_failures_carry_native_code() {
    let fake = FakeNative::new();
    fake.fail_engine_creation(ResponseCode::NotFound);
    let err = Engine::load(fake.api(), "missing.task").unwrap_err();
    assert_eq!(
        err,
        LiteRtError::EngineCreation {
            code: ResponseCode::NotFound
        }
    );

    let fake = FakeNative::new();
    fake.fail_session_creation(ResponseCode::ResourceExhausted);
    let engine = engine(&fake);
    assert_eq!(
        engine.create_session(SamplingParams::default()).unwrap_err(),
        LiteRtError::SessionCreation {
            code: ResponseCode::ResourceExhausted
        }
    );
    assert_eq!(engine.live_sessions(), 0);
}

#[tokio::test]
async fn test_invalid_sampling_params_rejected() {
    let fake = FakeNative::new();
    let engine = engine(&fake);
    let err = engine
        .create_session(SamplingParams::default().with_top_p(0.0))
        .unwrap_err();
    assert!(err.is_precondition());
    assert!(!fake
        .calls()
        .iter()
        .any(|call| matches!(call, NativeCall::CreateSession { .. })));
}

#[tokio::test]
async fn test_default_session_uses_configured_params() {
    let fake = FakeNative::new();
    let mut config = CoordinatorConfig::default();
    config.session.default_params = SamplingParams::default().with_top_k(8).with_seed(42);
    let engine = engine_with(&fake, config);

    let session = engine.create_default_session().unwrap();
    assert_eq!(session.params().top_k, 8);
    assert_eq!(session.params().seed, 42);
}

#[tokio::test]
async fn test_engine_config_reaches_native_layer() {
    let fake = FakeNative::new();
    let mut config = CoordinatorConfig::default();
    config.engine.num_threads = 2;
    config.logging.native_level = Some(NativeLogLevel::Off);
    let engine = engine_with(&fake, config);

    let calls = fake.calls();
    assert_eq!(calls[0], NativeCall::DisableLogging);
    assert_eq!(
        calls[1],
        NativeCall::CreateEngine {
            model_path: "models/gemma.task".to_string(),
            num_threads: 2
        }
    );
    assert_eq!(engine.model_path().to_str(), Some("models/gemma.task"));
}

#[tokio::test]
async fn test_number_of_tokens() {
    let fake = FakeNative::new();
    let engine = engine(&fake);
    let session = session(&engine);
    assert_eq!(engine.number_of_tokens("one two three").unwrap(), 3);
    assert_eq!(session.number_of_tokens("one").unwrap(), 1);
}

#[test]
fn test_load_outside_runtime_requires_context() {
    let fake = FakeNative::new();
    let err = Engine::load(fake.api(), "model.task").unwrap_err();
    assert!(matches!(err, LiteRtError::Configuration { .. }));
    assert!(fake.calls().is_empty());
}
