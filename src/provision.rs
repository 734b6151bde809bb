//! Provisioning
//!
//! Turns a model source directory into a schedulable model: image, stopped
//! container and a `model.uploaded` announcement. Deprovisioning undoes all
//! of it.

use crate::events::{EventPublisher, ModelEvent};
use crate::pool::PoolManager;
use crate::registry::{ModelId, NewModel, UnitRegistry};
use crate::runtime::{RuntimeAdapter, SERVICE_PORT};
use crate::{Error, Result};
use chrono::Utc;
use std::path::Path;
use std::sync::Arc;

pub const DEFAULT_IMAGE_PREFIX: &str = "ml-models";

/// Serving image used when the upload brings no Dockerfile of its own.
pub fn default_dockerfile() -> String {
    format!(
        "FROM python:3.10-slim\n\
         \n\
         WORKDIR /app\n\
         \n\
         COPY . /app/\n\
         \n\
         RUN pip install --no-cache-dir -r requirements.txt\n\
         \n\
         EXPOSE {port}\n\
         \n\
         CMD [\"python\", \"app.py\"]\n",
        port = SERVICE_PORT
    )
}

/// `{prefix}/{username}/{model_name}:latest`, lowercased, with characters
/// image references reject replaced by `-`.
pub fn image_tag(prefix: &str, username: &str, model_name: &str) -> String {
    let clean = |s: &str| -> String {
        s.to_lowercase()
            .chars()
            .map(|c| match c {
                'a'..='z' | '0'..='9' | '.' | '_' | '-' | '/' => c,
                _ => '-',
            })
            .collect()
    };
    format!("{}/{}/{}:latest", clean(prefix), clean(username), clean(model_name))
}

/// Container name `{username}_{model_name}` restricted to `[A-Za-z0-9_.-]`.
pub fn unit_name(username: &str, model_name: &str) -> String {
    format!("{}_{}", username, model_name)
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    pub username: String,
    pub model_name: String,
    pub description: Option<String>,
}

pub struct Provisioner {
    runtime: Arc<dyn RuntimeAdapter>,
    registry: Arc<dyn UnitRegistry>,
    pool: Arc<PoolManager>,
    publisher: Arc<dyn EventPublisher>,
    image_prefix: String,
}

impl Provisioner {
    pub fn new(
        runtime: Arc<dyn RuntimeAdapter>,
        registry: Arc<dyn UnitRegistry>,
        pool: Arc<PoolManager>,
        publisher: Arc<dyn EventPublisher>,
        image_prefix: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            registry,
            pool,
            publisher,
            image_prefix: image_prefix.into(),
        }
    }

    /// Build and create the model's container, then announce it. The model
    /// becomes schedulable once the event consumer registers it.
    pub async fn provision(&self, source: &Path, request: ProvisionRequest) -> Result<NewModel> {
        let tag = image_tag(&self.image_prefix, &request.username, &request.model_name);

        if !tokio::fs::metadata(source)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            return Err(Error::BuildFailed {
                tag,
                reason: format!("{} is not a directory", source.display()),
            });
        }

        let dockerfile = source.join("Dockerfile");
        if tokio::fs::metadata(&dockerfile).await.is_err() {
            tokio::fs::write(&dockerfile, default_dockerfile()).await?;
            tracing::info!(path = %dockerfile.display(), "wrote default Dockerfile");
        }

        tracing::info!(%tag, source = %source.display(), "building model image");
        let image = self.runtime.build_image(source, &tag).await?;

        let name = unit_name(&request.username, &request.model_name);
        let unit = self.runtime.create_unit(&image, &name).await?;
        tracing::info!(unit = %unit.short(), %name, "created model container");

        let model = NewModel {
            upload_id: Utc::now().timestamp_millis(),
            username: request.username,
            model_name: request.model_name,
            description: request.description,
            image,
            unit,
        };
        self.publisher
            .publish(&ModelEvent::ModelUploaded(model.clone()))
            .await?;

        Ok(model)
    }

    /// Stop, remove and forget a model. A container that refuses to stop
    /// aborts the removal and leaves the model registered; later cleanup
    /// failures are logged and the registry row is removed regardless.
    pub async fn deprovision(&self, model_id: ModelId) -> Result<()> {
        let record = self
            .registry
            .lookup(model_id)
            .await?
            .ok_or(Error::ModelNotFound(model_id))?;

        self.pool.retire(model_id, &record.unit).await?;
        if let Err(err) = self.runtime.remove_image(&record.image).await {
            tracing::warn!(image = %record.image, error = %err, "failed to remove image");
        }

        self.registry.unregister(model_id).await?;
        tracing::info!(model_id = %model_id, model_name = %record.model_name, "model deprovisioned");
        Ok(())
    }
}
