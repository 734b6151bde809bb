//! Model Registry
//!
//! Durable catalog of deployable models: which image and container belong to
//! a model, and the last status the orchestrator reported for it. The pool is
//! authoritative for "is it running right now"; the registry is authoritative
//! for "does this model exist and which container serves it".

mod memory;
mod sqlite;

pub use memory::MemoryRegistry;
pub use sqlite::SqliteRegistry;

use crate::runtime::{ImageRef, UnitRef};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Registry-assigned model identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(pub i64);

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Available,
    Running,
    Stopped,
    Failed,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitStatus::Available => "available",
            UnitStatus::Running => "running",
            UnitStatus::Stopped => "stopped",
            UnitStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "available" => Ok(UnitStatus::Available),
            "running" => Ok(UnitStatus::Running),
            "stopped" => Ok(UnitStatus::Stopped),
            "failed" => Ok(UnitStatus::Failed),
            other => Err(Error::Registry(format!("unknown status '{}'", other))),
        }
    }
}

/// Payload of the "model uploaded" notification; everything needed to make a
/// model schedulable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewModel {
    pub upload_id: i64,
    pub username: String,
    pub model_name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "docker_image")]
    pub image: ImageRef,
    #[serde(rename = "docker_container_id")]
    pub unit: UnitRef,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub id: ModelId,
    pub upload_id: i64,
    pub username: String,
    pub model_name: String,
    pub description: Option<String>,
    #[serde(rename = "docker_image")]
    pub image: ImageRef,
    #[serde(rename = "docker_container_id")]
    pub unit: UnitRef,
    pub status: UnitStatus,
    pub external_port: Option<u16>,
    pub last_used: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait UnitRegistry: Send + Sync {
    /// Insert a model. Idempotent on `upload_id`: a repeated notification
    /// returns the existing record untouched.
    async fn register(&self, model: NewModel) -> Result<ModelRecord>;

    async fn lookup(&self, id: ModelId) -> Result<Option<ModelRecord>>;

    async fn list(&self) -> Result<Vec<ModelRecord>>;

    /// Record a status transition. `external_port` overwrites the last known
    /// port when present; `Running` also stamps `last_used`. Unknown ids are
    /// ignored.
    async fn set_status(
        &self,
        id: ModelId,
        status: UnitStatus,
        external_port: Option<u16>,
    ) -> Result<()>;

    /// Returns whether a record was removed.
    async fn unregister(&self, id: ModelId) -> Result<bool>;
}

#[cfg(test)]
pub(crate) fn sample_model(upload_id: i64, name: &str) -> NewModel {
    NewModel {
        upload_id,
        username: "alice".to_string(),
        model_name: name.to_string(),
        description: None,
        image: ImageRef::new(format!("ml-models/alice/{}:latest", name)),
        unit: UnitRef::new(format!("unit-{}", name)),
    }
}
