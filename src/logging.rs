//! # Structured Logging Module
//!
//! Environment-aware structured logging for the binding and its native
//! boundary. Initialization is idempotent and never replaces a subscriber the
//! host application already installed.

use std::sync::OnceLock;

use chrono::Utc;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingConfig;
use crate::ffi::native::NativeApi;
use crate::ffi::types::{NativeLogLevel, SessionHandle};

static LOGGER_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize structured logging with environment-derived defaults
pub fn init_structured_logging() {
    init_with_config(&LoggingConfig::default());
}

/// Initialize structured logging from a [`LoggingConfig`].
///
/// Only the first call in a process has any effect.
pub fn init_with_config(config: &LoggingConfig) {
    LOGGER_INITIALIZED.get_or_init(|| {
        let environment = get_environment();
        let directive = config
            .level
            .clone()
            .or_else(|| std::env::var("RUST_LOG").ok())
            .unwrap_or_else(|| get_log_level(&environment).to_string());

        let console = if config.json {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_ansi(false)
                .json()
                .with_filter(EnvFilter::new(&directive))
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_filter(EnvFilter::new(&directive))
                .boxed()
        };

        if tracing_subscriber::registry().with(console).try_init().is_err() {
            tracing::debug!("global tracing subscriber already set; keeping it");
        }

        tracing::info!(
            pid = std::process::id(),
            environment = %environment,
            level = %directive,
            json = config.json,
            "structured logging initialized"
        );
    });
}

/// Apply the native library's own log threshold
pub fn apply_native_log_level(native: &dyn NativeApi, level: NativeLogLevel) {
    match level {
        NativeLogLevel::Off => native.disable_logging(),
        level => native.set_min_log_level(level),
    }
    log_native_operation("set_log_level", "ok", Some(&format!("{level:?}")));
}

fn get_environment() -> String {
    std::env::var("LITERT_LM_ENV")
        .or_else(|_| std::env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
}

fn get_log_level(environment: &str) -> &'static str {
    match environment {
        "production" => "info",
        "test" => "warn",
        _ => "debug",
    }
}

/// Log structured data for calls across the native boundary
pub fn log_native_operation(operation: &str, status: &str, details: Option<&str>) {
    tracing::info!(
        operation = %operation,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "NATIVE_OPERATION"
    );
}

/// Log structured data for session-level operations
pub fn log_session_operation(
    operation: &str,
    session: SessionHandle,
    operation_id: Option<&str>,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        session = %session,
        operation_id = operation_id,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "SESSION_OPERATION"
    );
}
