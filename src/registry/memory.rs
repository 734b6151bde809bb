//! In-process registry, lost on restart.

use super::{ModelId, ModelRecord, NewModel, UnitRegistry, UnitStatus};
use crate::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

#[derive(Debug, Default)]
struct Catalog {
    next_id: i64,
    records: BTreeMap<ModelId, ModelRecord>,
}

#[derive(Debug, Default)]
pub struct MemoryRegistry {
    catalog: RwLock<Catalog>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UnitRegistry for MemoryRegistry {
    async fn register(&self, model: NewModel) -> Result<ModelRecord> {
        let mut catalog = self.catalog.write().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = catalog
            .records
            .values()
            .find(|r| r.upload_id == model.upload_id)
        {
            return Ok(existing.clone());
        }

        catalog.next_id += 1;
        let record = ModelRecord {
            id: ModelId(catalog.next_id),
            upload_id: model.upload_id,
            username: model.username,
            model_name: model.model_name,
            description: model.description,
            image: model.image,
            unit: model.unit,
            status: UnitStatus::Available,
            external_port: None,
            last_used: None,
            created_at: Utc::now(),
        };
        catalog.records.insert(record.id, record.clone());
        Ok(record)
    }

    async fn lookup(&self, id: ModelId) -> Result<Option<ModelRecord>> {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        Ok(catalog.records.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<ModelRecord>> {
        let catalog = self.catalog.read().unwrap_or_else(PoisonError::into_inner);
        Ok(catalog.records.values().cloned().collect())
    }

    async fn set_status(
        &self,
        id: ModelId,
        status: UnitStatus,
        external_port: Option<u16>,
    ) -> Result<()> {
        let mut catalog = self.catalog.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(record) = catalog.records.get_mut(&id) {
            record.status = status;
            if external_port.is_some() {
                record.external_port = external_port;
            }
            if status == UnitStatus::Running {
                record.last_used = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn unregister(&self, id: ModelId) -> Result<bool> {
        let mut catalog = self.catalog.write().unwrap_or_else(PoisonError::into_inner);
        Ok(catalog.records.remove(&id).is_some())
    }
}
