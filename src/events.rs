//! Event Log
//!
//! Append-only JSON-lines log carrying "model uploaded" notifications from the
//! build side to the serving side. The consumer tails the file by byte offset
//! and registers every announced model; registration is idempotent, so a
//! replayed line is harmless.

use crate::registry::{ModelRecord, NewModel, UnitRegistry};
use crate::shutdown::{BackgroundTask, signalled};
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

pub const MODEL_UPLOADED: &str = "model.uploaded";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ModelEvent {
    #[serde(rename = "model.uploaded")]
    ModelUploaded(NewModel),
}

impl ModelEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ModelEvent::ModelUploaded(_) => MODEL_UPLOADED,
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &ModelEvent) -> Result<()>;
}

/// Publisher appending one JSON object per line to a local file.
pub struct FileEventLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileEventLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl EventPublisher for FileEventLog {
    async fn publish(&self, event: &ModelEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::EventLog(format!("{}: {}", self.path.display(), e)))?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        tracing::info!(event = event.name(), path = %self.path.display(), "published event");
        Ok(())
    }
}

/// Tails an event log file and registers announced models.
pub struct EventConsumer {
    path: PathBuf,
    registry: Arc<dyn UnitRegistry>,
    poll_interval: Duration,
    offset: u64,
}

impl EventConsumer {
    pub fn new(
        path: impl Into<PathBuf>,
        registry: Arc<dyn UnitRegistry>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            path: path.into(),
            registry,
            poll_interval,
            offset: 0,
        }
    }

    /// Bytes of the log consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read every complete line appended since the last poll. Returns the
    /// number of models registered. A missing file is not an error; a file
    /// shorter than the consumed offset was truncated and is read from the
    /// start.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let metadata = match tokio::fs::metadata(&self.path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        if metadata.len() < self.offset {
            tracing::warn!(path = %self.path.display(), "event log truncated, rereading from start");
            self.offset = 0;
        }
        if metadata.len() == self.offset {
            return Ok(0);
        }

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        let mut registered = 0;
        let mut consumed = 0usize;
        while let Some(newline) = buf[consumed..].iter().position(|b| *b == b'\n') {
            let line_end = consumed + newline + 1;
            let line = String::from_utf8_lossy(&buf[consumed..line_end]);
            if self.handle_line(line.trim()).await?.is_some() {
                registered += 1;
            }
            consumed = line_end;
            self.offset += (newline + 1) as u64;
        }

        Ok(registered)
    }

    /// Registration errors propagate so the line is retried on the next
    /// poll; malformed or foreign lines are skipped.
    async fn handle_line(&self, line: &str) -> Result<Option<ModelRecord>> {
        if line.is_empty() {
            return Ok(None);
        }

        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(error = %e, "invalid JSON in event log");
                return Ok(None);
            }
        };

        match value.get("event").and_then(Value::as_str) {
            Some(MODEL_UPLOADED) => {}
            other => {
                tracing::debug!(event = ?other, "ignoring event");
                return Ok(None);
            }
        }

        let event: ModelEvent = match serde_json::from_value(value) {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "malformed model.uploaded event");
                return Ok(None);
            }
        };

        let ModelEvent::ModelUploaded(model) = event;
        let record = self.registry.register(model).await?;
        tracing::info!(
            model_id = %record.id,
            upload_id = record.upload_id,
            model_name = %record.model_name,
            "model registered"
        );
        Ok(Some(record))
    }

    /// Poll on `poll_interval` until shut down.
    pub fn spawn(mut self) -> BackgroundTask {
        BackgroundTask::spawn("event-consumer", move |mut shutdown| async move {
            tracing::info!(path = %self.path.display(), "event consumer started");
            loop {
                if let Err(err) = self.poll_once().await {
                    tracing::error!(error = %err, "error reading event log");
                }
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = signalled(&mut shutdown) => break,
                }
            }
            tracing::info!("event consumer stopped");
        })
    }
}
