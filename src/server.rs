//! HTTP API
//!
//! Inference, explicit start/stop, catalog listing, pool statistics and
//! health, served with axum.

use crate::dispatch::{Dispatcher, InferenceOutcome};
use crate::pool::PoolSnapshot;
use crate::provision::Provisioner;
use crate::registry::{ModelId, ModelRecord, UnitRegistry};
use crate::runtime::RuntimeAdapter;
use crate::{Error, Result};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub const SERVICE_NAME: &str = "modeldock";

#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<dyn UnitRegistry>,
    pub runtime: Arc<dyn RuntimeAdapter>,
    pub dispatcher: Arc<Dispatcher>,
    pub provisioner: Arc<Provisioner>,
}

#[derive(Debug, Deserialize)]
pub struct InferenceRequest {
    pub input_data: Value,
}

#[derive(Serialize)]
struct ModelList {
    models: Vec<ModelRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ContainerStats {
    pub container_id: String,
    pub model_id: ModelId,
    pub port: u16,
    pub last_used: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PoolStats {
    pub running_containers: usize,
    pub max_containers: usize,
    pub containers: Vec<ContainerStats>,
}

impl From<PoolSnapshot> for PoolStats {
    fn from(snapshot: PoolSnapshot) -> Self {
        Self {
            running_containers: snapshot.running_count,
            max_containers: snapshot.max_running,
            containers: snapshot
                .entries
                .into_iter()
                .map(|e| ContainerStats {
                    container_id: e.unit.short().to_string(),
                    model_id: e.model_id,
                    port: e.external_port,
                    last_used: e.last_used_at,
                })
                .collect(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(error = %self, kind = self.kind(), "request failed");
        } else {
            tracing::debug!(error = %self, kind = self.kind(), "request rejected");
        }
        let body = json!({
            "error": self.kind(),
            "detail": self.to_string(),
            "retryable": self.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/models", get(list_models))
        .route("/api/models/:id", get(get_model).delete(delete_model))
        .route("/api/models/:id/start", post(start_model))
        .route("/api/models/:id/stop", post(stop_model))
        .route("/api/models/:id/infer", post(run_inference))
        .route("/api/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let engine_reachable = state.runtime.ping().await.is_ok();
    Json(json!({
        "status": if engine_reachable { "healthy" } else { "degraded" },
        "service": SERVICE_NAME,
        "engine_reachable": engine_reachable,
    }))
}

async fn list_models(State(state): State<AppState>) -> Result<Json<ModelList>> {
    let models = state.registry.list().await?;
    Ok(Json(ModelList { models }))
}

async fn get_model(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ModelRecord>> {
    let model_id = ModelId(id);
    state
        .registry
        .lookup(model_id)
        .await?
        .map(Json)
        .ok_or(Error::ModelNotFound(model_id))
}

async fn start_model(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<Value>> {
    let started = state.dispatcher.start_model(ModelId(id)).await?;
    Ok(Json(json!({
        "status": "success",
        "message": if started.cold_start { "Model container started" } else { "Model container already running" },
        "model_id": started.model_id,
        "external_port": started.external_port,
    })))
}

async fn stop_model(State(state): State<AppState>, Path(id): Path<i64>) -> Result<Json<Value>> {
    let stopped = state.dispatcher.stop_model(ModelId(id)).await?;
    Ok(Json(json!({
        "status": "success",
        "message": if stopped { "Model container stopped" } else { "Model container was not running" },
        "model_id": id,
    })))
}

async fn run_inference(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<InferenceRequest>,
) -> Result<Json<InferenceOutcome>> {
    let outcome = state
        .dispatcher
        .infer(ModelId(id), request.input_data)
        .await?;
    Ok(Json(outcome))
}

async fn delete_model(State(state): State<AppState>, Path(id): Path<i64>) -> Result<StatusCode> {
    state.provisioner.deprovision(ModelId(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_stats(State(state): State<AppState>) -> Json<PoolStats> {
    Json(state.dispatcher.pool().snapshot().into())
}
