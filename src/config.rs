//! # Configuration
//!
//! Layered configuration for engines, sessions and the coordinator.
//!
//! Sources, later ones winning:
//!
//! 1. Built-in defaults (every struct is `#[serde(default)]`)
//! 2. `config/litert-lm.{toml,yaml,json}` or an explicit file
//! 3. Environment variables `LITERT_LM__<SECTION>__<KEY>`, e.g.
//!    `LITERT_LM__DISPOSE__WAIT_TIMEOUT_MS=250`
//!
//! ```rust,no_run
//! use litert_lm::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ConfigManager::load()?;
//! println!("threads: {}", config.engine.num_threads);
//! # Ok(())
//! # }
//! ```

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{LiteRtError, LiteRtResult};
use crate::ffi::types::{NativeLogLevel, SamplingParams};

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub engine: EngineConfig,
    pub session: SessionConfig,
    pub dispose: DisposeConfig,
    pub generation: GenerationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker threads the native engine may use
    pub num_threads: u32,
    /// Engine-wide token cap, -1 for the model default
    pub max_num_tokens: i32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_threads: 4,
            max_num_tokens: -1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Parameters used by `Engine::create_default_session`
    pub default_params: SamplingParams,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DisposeConfig {
    /// Upper bound on waiting for the engine to drain native work during disposal
    pub wait_timeout_ms: u64,
}

impl Default for DisposeConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: 5_000,
        }
    }
}

impl DisposeConfig {
    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Output buffer for blocking generation, including the NUL terminator
    pub sync_buffer_size: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            sync_buffer_size: 4096,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; falls back to the environment-derived level
    pub level: Option<String>,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
    /// Minimum level for the native library's own log; untouched when unset
    pub native_level: Option<NativeLogLevel>,
}

impl CoordinatorConfig {
    pub fn validate(&self) -> LiteRtResult<()> {
        if self.engine.num_threads == 0 {
            return Err(LiteRtError::configuration(
                "engine.num_threads must be at least 1",
            ));
        }
        if i32::try_from(self.engine.num_threads).is_err() {
            return Err(LiteRtError::configuration(format!(
                "engine.num_threads {} exceeds i32::MAX",
                self.engine.num_threads
            )));
        }
        if self.dispose.wait_timeout_ms == 0 {
            return Err(LiteRtError::configuration(
                "dispose.wait_timeout_ms must be greater than zero",
            ));
        }
        if self.generation.sync_buffer_size == 0 {
            return Err(LiteRtError::configuration(
                "generation.sync_buffer_size must be greater than zero",
            ));
        }
        self.session
            .default_params
            .validate()
            .map_err(|reason| LiteRtError::configuration(format!("session.default_params: {reason}")))
    }
}

/// Loads [`CoordinatorConfig`] from files and the environment
pub struct ConfigManager;

impl ConfigManager {
    pub const ENV_PREFIX: &'static str = "LITERT_LM";
    pub const FILE_STEM: &'static str = "litert-lm";

    /// Load from `./config` plus the environment
    pub fn load() -> LiteRtResult<CoordinatorConfig> {
        Self::load_from_directory(Path::new("config"))
    }

    /// Load `<dir>/litert-lm.*` if present, plus the environment
    pub fn load_from_directory(dir: &Path) -> LiteRtResult<CoordinatorConfig> {
        let stem = dir.join(Self::FILE_STEM);
        debug!(directory = %dir.display(), "loading coordinator configuration");
        let file = File::with_name(&stem.to_string_lossy()).required(false);
        Self::build(Config::builder().add_source(file))
    }

    /// Load an explicit file, which must exist, plus the environment
    pub fn load_from_file(path: &Path) -> LiteRtResult<CoordinatorConfig> {
        debug!(file = %path.display(), "loading coordinator configuration");
        let file = File::from(path).required(true);
        Self::build(Config::builder().add_source(file))
    }

    /// Defaults plus the environment only
    pub fn load_from_env() -> LiteRtResult<CoordinatorConfig> {
        Self::build(Config::builder())
    }

    fn build(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> LiteRtResult<CoordinatorConfig> {
        let config: CoordinatorConfig = builder
            .add_source(
                Environment::with_prefix(Self::ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;

        debug!(
            config = %serde_json::to_string(&config).unwrap_or_else(|_| "[serialization error]".to_string()),
            "coordinator configuration loaded"
        );
        Ok(config)
    }
}
