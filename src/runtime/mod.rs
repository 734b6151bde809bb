//! Container Runtime
//!
//! Mechanism-only bridge to the container engine. Builds images, creates one
//! container per model and starts/stops it on request. Holds no policy and no
//! state beyond the engine connection; scheduling lives in [`crate::pool`].

mod docker;
pub mod mock;

pub use docker::{DockerRuntime, DockerRuntimeConfig};
pub use mock::MockRuntime;

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Port every model server listens on inside its container.
pub const SERVICE_PORT: u16 = 8080;

/// Engine key for the service port mapping (`8080/tcp`).
pub fn service_port_key() -> String {
    format!("{}/tcp", SERVICE_PORT)
}

/// Opaque container handle assigned by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitRef(String);

impl UnitRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First twelve characters, the form `docker ps` prints.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(12) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for UnitRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Image tag or id as understood by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageRef(String);

impl ImageRef {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Operations the orchestrator needs from a container engine.
///
/// Every method fails with [`crate::Error::EngineUnreachable`] when the engine
/// connection is down. `start` and `stop` are idempotent.
#[async_trait]
pub trait RuntimeAdapter: Send + Sync {
    /// Round-trip to the engine; used by health reporting.
    async fn ping(&self) -> Result<()>;

    async fn build_image(&self, source: &Path, tag: &str) -> Result<ImageRef>;

    /// Create (not start) a container with [`SERVICE_PORT`] published on an
    /// engine-chosen host port.
    async fn create_unit(&self, image: &ImageRef, name: &str) -> Result<UnitRef>;

    /// Start the container and return the host port currently mapped to
    /// [`SERVICE_PORT`]. The port is re-read on every call; it is not stable
    /// across stop/start cycles.
    async fn start(&self, unit: &UnitRef) -> Result<u16>;

    async fn stop(&self, unit: &UnitRef) -> Result<()>;

    async fn get_port(&self, unit: &UnitRef) -> Result<Option<u16>>;

    async fn is_running(&self, unit: &UnitRef) -> Result<bool>;

    async fn remove_unit(&self, unit: &UnitRef) -> Result<()>;

    async fn remove_image(&self, image: &ImageRef) -> Result<()>;
}
