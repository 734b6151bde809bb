//! SQLite-backed registry.

use super::{ModelId, ModelRecord, NewModel, UnitRegistry, UnitStatus};
use crate::runtime::{ImageRef, UnitRef};
use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;

const SELECT_COLUMNS: &str = "SELECT id, upload_id, username, model_name, description, docker_image, \
     docker_container_id, status, external_port, last_used, created_at FROM model_registry";

#[derive(Debug, Clone)]
pub struct SqliteRegistry {
    db: SqlitePool,
}

impl SqliteRegistry {
    /// Open (creating if needed) the database at `url` and ensure the schema
    /// exists. Accepts `sqlite://path` and `sqlite::memory:`.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        // Every pooled connection to `:memory:` would see its own empty database.
        let in_memory = url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let registry = Self { db: pool };
        registry.init_schema().await?;
        tracing::debug!(url, "registry database ready");
        Ok(registry)
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS model_registry (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                upload_id INTEGER NOT NULL UNIQUE,
                username TEXT NOT NULL,
                model_name TEXT NOT NULL,
                description TEXT,
                docker_image TEXT NOT NULL,
                docker_container_id TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'available',
                external_port INTEGER,
                last_used INTEGER,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn fetch_by_upload(&self, upload_id: i64) -> Result<Option<ModelRecord>> {
        let row = sqlx::query(&format!("{} WHERE upload_id = ?", SELECT_COLUMNS))
            .bind(upload_id)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }
}

fn millis_to_time(millis: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| Error::Registry(format!("timestamp out of range: {}", millis)))
}

fn record_from_row(row: &SqliteRow) -> Result<ModelRecord> {
    let status: String = row.try_get("status")?;
    let external_port: Option<i64> = row.try_get("external_port")?;
    let last_used: Option<i64> = row.try_get("last_used")?;
    let created_at: i64 = row.try_get("created_at")?;

    Ok(ModelRecord {
        id: ModelId(row.try_get("id")?),
        upload_id: row.try_get("upload_id")?,
        username: row.try_get("username")?,
        model_name: row.try_get("model_name")?,
        description: row.try_get("description")?,
        image: ImageRef::new(row.try_get::<String, _>("docker_image")?),
        unit: UnitRef::new(row.try_get::<String, _>("docker_container_id")?),
        status: status.parse()?,
        external_port: external_port.and_then(|p| u16::try_from(p).ok()),
        last_used: last_used.map(millis_to_time).transpose()?,
        created_at: millis_to_time(created_at)?,
    })
}

#[async_trait]
impl UnitRegistry for SqliteRegistry {
    async fn register(&self, model: NewModel) -> Result<ModelRecord> {
        sqlx::query(
            "INSERT INTO model_registry
                (upload_id, username, model_name, description, docker_image, docker_container_id, status, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(upload_id) DO NOTHING",
        )
        .bind(model.upload_id)
        .bind(&model.username)
        .bind(&model.model_name)
        .bind(&model.description)
        .bind(model.image.as_str())
        .bind(model.unit.as_str())
        .bind(UnitStatus::Available.as_str())
        .bind(Utc::now().timestamp_millis())
        .execute(&self.db)
        .await?;

        self.fetch_by_upload(model.upload_id)
            .await?
            .ok_or_else(|| Error::Registry(format!("upload {} vanished after insert", model.upload_id)))
    }

    async fn lookup(&self, id: ModelId) -> Result<Option<ModelRecord>> {
        let row = sqlx::query(&format!("{} WHERE id = ?", SELECT_COLUMNS))
            .bind(id.0)
            .fetch_optional(&self.db)
            .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn list(&self) -> Result<Vec<ModelRecord>> {
        let rows = sqlx::query(&format!("{} ORDER BY id", SELECT_COLUMNS))
            .fetch_all(&self.db)
            .await?;
        rows.iter().map(record_from_row).collect()
    }

    async fn set_status(
        &self,
        id: ModelId,
        status: UnitStatus,
        external_port: Option<u16>,
    ) -> Result<()> {
        let last_used = (status == UnitStatus::Running).then(|| Utc::now().timestamp_millis());
        sqlx::query(
            "UPDATE model_registry
             SET status = ?,
                 external_port = COALESCE(?, external_port),
                 last_used = COALESCE(?, last_used)
             WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(external_port.map(i64::from))
        .bind(last_used)
        .bind(id.0)
        .execute(&self.db)
        .await?;
        Ok(())
    }

    async fn unregister(&self, id: ModelId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM model_registry WHERE id = ?")
            .bind(id.0)
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
