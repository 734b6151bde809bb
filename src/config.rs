use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatch::{DispatchConfig, Readiness};
use crate::pool::PoolConfig;
use crate::provision::DEFAULT_IMAGE_PREFIX;
use crate::reaper::ReaperConfig;
use crate::runtime::DockerRuntimeConfig;
use crate::{Error, Result};

/// Service configuration loaded from `modeldock.toml`, then overridden by
/// environment variables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub server: ServerSection,
    pub engine: EngineSection,
    pub pool: PoolSection,
    pub dispatch: DispatchSection,
    pub registry: RegistrySection,
    pub events: EventsSection,
    pub provision: ProvisionSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
    /// Stop every running container when the service shuts down.
    pub release_on_shutdown: bool,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8002,
            release_on_shutdown: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSection {
    /// Docker endpoint; local defaults when unset.
    pub docker_host: Option<String>,
    /// Host the containers' published ports are reached on.
    pub host: String,
    /// Host interface published ports bind to; all interfaces when unset.
    pub bind_address: Option<String>,
    pub stop_timeout_secs: u64,
}

impl Default for EngineSection {
    fn default() -> Self {
        Self {
            docker_host: None,
            host: "localhost".to_string(),
            bind_address: None,
            stop_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSection {
    pub max_running: usize,
    pub startup_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

impl Default for PoolSection {
    fn default() -> Self {
        Self {
            max_running: 10,
            startup_timeout_secs: 30,
            idle_timeout_secs: 300,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadinessMode {
    Probe,
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub request_timeout_secs: u64,
    pub readiness: ReadinessMode,
    /// Settling delay for `readiness = "fixed"`.
    pub settle_delay_ms: u64,
    pub probe_path: String,
    pub predict_path: String,
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            request_timeout_secs: 30,
            readiness: ReadinessMode::Probe,
            settle_delay_ms: 3000,
            probe_path: "/".to_string(),
            predict_path: "/predict".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySection {
    /// `sqlite://path`, `sqlite::memory:` or `memory` for a non-durable
    /// in-process catalog.
    pub database_url: String,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            database_url: "sqlite://modeldock.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsSection {
    pub log_path: PathBuf,
    pub poll_interval_ms: u64,
}

impl Default for EventsSection {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("model_events.log"),
            poll_interval_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionSection {
    pub image_prefix: String,
}

impl Default for ProvisionSection {
    fn default() -> Self {
        Self {
            image_prefix: DEFAULT_IMAGE_PREFIX.to_string(),
        }
    }
}

const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

impl ServiceConfig {
    pub const FILE_NAME: &'static str = "modeldock.toml";

    /// Load `path`, or `modeldock.toml` from the current directory or its
    /// ancestors when no path is given, then apply environment overrides and
    /// validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path.map(Path::to_path_buf).or_else(Self::find_config_path) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::InvalidConfig {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::parse(&content).map_err(|e| Error::InvalidConfig {
            reason: format!("invalid config in {}: {e}", path.display()),
        })
    }

    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    pub fn find_config_path() -> Option<PathBuf> {
        let cwd = std::env::current_dir().ok()?;
        cwd.ancestors()
            .map(|dir| dir.join(Self::FILE_NAME))
            .find(|candidate| candidate.is_file())
    }

    /// Apply the deployment environment's variables on top of the file.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
            value.trim().parse().map_err(|_| Error::InvalidConfig {
                reason: format!("{key} must be a non-negative integer, got '{value}'"),
            })
        }

        if let Some(v) = lookup("MAX_RUNNING_CONTAINERS") {
            self.pool.max_running = number("MAX_RUNNING_CONTAINERS", &v)?;
        }
        if let Some(v) = lookup("CONTAINER_IDLE_TIMEOUT") {
            self.pool.idle_timeout_secs = number("CONTAINER_IDLE_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("CONTAINER_STARTUP_TIMEOUT") {
            self.pool.startup_timeout_secs = number("CONTAINER_STARTUP_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("PORT") {
            self.server.port = number("PORT", &v)?;
        }
        if let Some(v) = lookup("DOCKER_HOST").filter(|v| !v.is_empty()) {
            self.engine.docker_host = Some(v);
        }
        if let Some(v) = lookup("ENGINE_HOST").filter(|v| !v.is_empty()) {
            self.engine.host = v;
        }
        if let Some(v) = lookup("DATABASE_URL").filter(|v| !v.is_empty()) {
            self.registry.database_url = v;
        }
        if let Some(v) = lookup("EVENT_LOG").filter(|v| !v.is_empty()) {
            self.events.log_path = PathBuf::from(v);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| {
            Err(Error::InvalidConfig {
                reason: reason.to_string(),
            })
        };
        if self.pool.max_running == 0 {
            return invalid("pool.max_running must be at least 1");
        }
        if self.pool.startup_timeout_secs == 0 {
            return invalid("pool.startup_timeout_secs must be positive");
        }
        if self.pool.startup_timeout_secs > MAX_TIMEOUT_SECS
            || self.pool.idle_timeout_secs > MAX_TIMEOUT_SECS
            || self.dispatch.request_timeout_secs > MAX_TIMEOUT_SECS
        {
            return invalid("timeouts must not exceed one day");
        }
        if self.pool.sweep_interval_secs == 0 {
            return invalid("pool.sweep_interval_secs must be positive");
        }
        if self.dispatch.request_timeout_secs == 0 {
            return invalid("dispatch.request_timeout_secs must be positive");
        }
        if self.events.poll_interval_ms == 0 {
            return invalid("events.poll_interval_ms must be positive");
        }
        if !self.dispatch.predict_path.starts_with('/') || !self.dispatch.probe_path.starts_with('/') {
            return invalid("dispatch paths must start with '/'");
        }
        Ok(())
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_running: self.pool.max_running,
            start_timeout: Duration::from_secs(self.pool.startup_timeout_secs),
        }
    }

    pub fn reaper_config(&self) -> ReaperConfig {
        ReaperConfig {
            sweep_interval: Duration::from_secs(self.pool.sweep_interval_secs),
            idle_timeout: Duration::from_secs(self.pool.idle_timeout_secs),
        }
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        let readiness = match self.dispatch.readiness {
            ReadinessMode::Fixed => {
                Readiness::FixedDelay(Duration::from_millis(self.dispatch.settle_delay_ms))
            }
            ReadinessMode::Probe => Readiness::Probe {
                path: self.dispatch.probe_path.clone(),
                initial_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(1),
                max_wait: Duration::from_secs(self.pool.startup_timeout_secs),
            },
        };
        DispatchConfig {
            engine_host: self.engine.host.clone(),
            request_timeout: Duration::from_secs(self.dispatch.request_timeout_secs),
            readiness,
            predict_path: self.dispatch.predict_path.clone(),
        }
    }

    pub fn docker_config(&self) -> DockerRuntimeConfig {
        DockerRuntimeConfig {
            docker_host: self.engine.docker_host.clone(),
            stop_timeout: Duration::from_secs(self.engine.stop_timeout_secs),
            bind_address: self.engine.bind_address.clone(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.events.poll_interval_ms)
    }

    pub fn serialize(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}
