use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Upper bound on command-queue slots per device.
pub const MAX_SLOTS: usize = 128;

/// Upper bound on compute units per device.
pub const MAX_CUS: usize = 128;

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_opt(key).and_then(|v| v.parse().ok())
}

fn env_bool(key: &str) -> Option<bool> {
    env_opt(key).map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

// ── Dispatch mode ─────────────────────────────────────────────

/// Which engine drives command dispatch.
///
/// Only the host-side software scheduler is implemented. `Embedded` exists so
/// that configurations naming the on-device microcontroller are rejected
/// explicitly instead of silently running in software.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    #[default]
    Software,
    Embedded,
}

impl std::str::FromStr for DispatchMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "software" | "kds" => Ok(Self::Software),
            "embedded" | "ert" => Ok(Self::Embedded),
            other => Err(ConfigError::Invalid(format!("unknown dispatch mode '{other}'"))),
        }
    }
}

// ── Scheduler config ──────────────────────────────────────────

/// Per-device scheduler settings.
///
/// Layering: defaults, then TOML (if loaded from a file), then `KDS_*`
/// environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Name used for the worker thread and log fields.
    #[serde(default = "default_device_name")]
    pub device_name: String,

    #[serde(default)]
    pub mode: DispatchMode,

    /// Bytes of command-queue space carved into slots at configure time.
    #[serde(default = "default_queue_space")]
    pub queue_space: u32,

    /// Slot count used before the first CONFIGURE.
    #[serde(default = "default_slots")]
    pub default_slots: usize,

    /// Poll CU status registers instead of waiting for interrupts.
    #[serde(default = "default_polling")]
    pub polling: bool,

    /// Sleep between polling passes while commands are in flight (0 = spin).
    #[serde(default = "default_poll_interval_us")]
    pub poll_interval_us: u64,

    /// Ceiling on live command records.
    #[serde(default = "default_max_commands")]
    pub max_commands: usize,

    /// How long a stopping scheduler keeps draining in-flight work.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    /// How long to wait for a CU to acknowledge reset.
    #[serde(default = "default_cu_reset_timeout_ms")]
    pub cu_reset_timeout_ms: u64,
}

fn default_device_name() -> String {
    "kds0".to_string()
}

fn default_queue_space() -> u32 {
    0x10000
}

fn default_slots() -> usize {
    16
}

fn default_polling() -> bool {
    true
}

fn default_poll_interval_us() -> u64 {
    100
}

fn default_max_commands() -> usize {
    4096
}

fn default_shutdown_grace_ms() -> u64 {
    2000
}

fn default_cu_reset_timeout_ms() -> u64 {
    1000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            mode: DispatchMode::default(),
            queue_space: default_queue_space(),
            default_slots: default_slots(),
            polling: default_polling(),
            poll_interval_us: default_poll_interval_us(),
            max_commands: default_max_commands(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
            cu_reset_timeout_ms: default_cu_reset_timeout_ms(),
        }
    }
}

impl SchedulerConfig {
    /// Build config from defaults plus environment (call `load_dotenv()` first).
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(toml_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml(&content)
    }

    pub(crate) fn apply_env_overrides(&mut self) {
        if let Some(v) = env_opt("KDS_DEVICE_NAME") {
            self.device_name = v;
        }
        if let Some(v) = env_opt("KDS_MODE").and_then(|v| v.parse().ok()) {
            self.mode = v;
        }
        if let Some(v) = env_parse("KDS_QUEUE_SPACE") {
            self.queue_space = v;
        }
        if let Some(v) = env_parse("KDS_DEFAULT_SLOTS") {
            self.default_slots = v;
        }
        if let Some(v) = env_bool("KDS_POLLING") {
            self.polling = v;
        }
        if let Some(v) = env_parse("KDS_POLL_INTERVAL_US") {
            self.poll_interval_us = v;
        }
        if let Some(v) = env_parse("KDS_MAX_COMMANDS") {
            self.max_commands = v;
        }
        if let Some(v) = env_parse("KDS_SHUTDOWN_GRACE_MS") {
            self.shutdown_grace_ms = v;
        }
        if let Some(v) = env_parse("KDS_CU_RESET_TIMEOUT_MS") {
            self.cu_reset_timeout_ms = v;
        }
    }

    /// Validate the config, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device_name.is_empty() {
            return Err(ConfigError::Invalid("device_name must not be empty".into()));
        }
        if self.queue_space == 0 {
            return Err(ConfigError::Invalid("queue_space must be non-zero".into()));
        }
        if self.default_slots == 0 || self.default_slots > MAX_SLOTS {
            return Err(ConfigError::Invalid(format!(
                "default_slots must be in 1..={MAX_SLOTS}, got {}",
                self.default_slots
            )));
        }
        if self.max_commands == 0 {
            return Err(ConfigError::Invalid("max_commands must be non-zero".into()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn cu_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.cu_reset_timeout_ms)
    }

    pub fn log_summary(&self) {
        tracing::info!("Scheduler config loaded ({}):", self.device_name);
        tracing::info!("  mode:        {:?}", self.mode);
        tracing::info!("  queue:       space={:#x}, default_slots={}", self.queue_space, self.default_slots);
        tracing::info!("  polling:     enabled={}, interval={}us", self.polling, self.poll_interval_us);
        tracing::info!("  limits:      max_commands={}", self.max_commands);
        tracing::info!(
            "  timeouts:    shutdown_grace={}ms, cu_reset={}ms",
            self.shutdown_grace_ms,
            self.cu_reset_timeout_ms
        );
    }
}
