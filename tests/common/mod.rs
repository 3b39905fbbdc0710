//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use litert_lm::test_helpers::{FakeNative, NativeCall};
use litert_lm::{CoordinatorConfig, Engine, SamplingParams, Session, SessionStatus};
use parking_lot::Mutex;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("litert_lm=debug")
        .with_test_writer()
        .try_init();
}

pub fn engine_with(fake: &FakeNative, config: CoordinatorConfig) -> Engine {
    init_tracing();
    Engine::builder(fake.api())
        .config(config)
        .load("models/gemma.task")
        .expect("engine loads")
}

pub fn engine(fake: &FakeNative) -> Engine {
    engine_with(fake, CoordinatorConfig::default())
}

pub fn session(engine: &Engine) -> Session {
    engine
        .create_session(SamplingParams::default())
        .expect("session created")
}

/// Poll until the session reports `status`, failing after a second
pub async fn wait_for_status(session: &Session, status: SessionStatus) {
    for _ in 0..200 {
        if session.status() == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("session never reached {status}, still {}", session.status());
}

pub fn recorder() -> (Arc<Mutex<Vec<String>>>, impl FnMut(&str) + Send + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |fragment: &str| sink.lock().push(fragment.to_string()))
}

pub fn is_generate(call: &NativeCall) -> bool {
    matches!(call, NativeCall::GenerateAsync { .. })
}

pub fn is_cancel(call: &NativeCall) -> bool {
    matches!(call, NativeCall::Cancel { .. })
}

pub fn is_destroy_session(call: &NativeCall) -> bool {
    matches!(call, NativeCall::DestroySession { .. })
}

pub fn is_destroy_engine(call: &NativeCall) -> bool {
    matches!(call, NativeCall::DestroyEngine { .. })
}
