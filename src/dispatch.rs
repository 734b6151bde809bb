//! Inference Dispatcher
//!
//! Per-request protocol: look the model up, make sure its container is
//! running, wait for a freshly started container to answer, forward the
//! payload and record the use.

use crate::pool::PoolManager;
use crate::registry::{ModelId, ModelRecord, UnitRegistry, UnitStatus};
use crate::{Error, Result};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Ceiling on a readiness wait whose configured limit would overflow the clock.
const MAX_PROBE_WAIT: Duration = Duration::from_secs(24 * 60 * 60);

/// How to decide a cold-started container is ready for traffic.
#[derive(Debug, Clone, PartialEq)]
pub enum Readiness {
    /// Sleep a fixed settling delay.
    FixedDelay(Duration),

    /// Poll `path` until the container answers with any HTTP response,
    /// doubling the pause between attempts up to `max_backoff`. Gives up
    /// after `max_wait` and lets the forwarded request report the failure.
    Probe {
        path: String,
        initial_backoff: Duration,
        max_backoff: Duration,
        max_wait: Duration,
    },
}

impl Default for Readiness {
    fn default() -> Self {
        Readiness::Probe {
            path: "/".to_string(),
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            max_wait: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Host the containers' published ports are reachable on.
    pub engine_host: String,
    pub request_timeout: Duration,
    pub readiness: Readiness,
    pub predict_path: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            engine_host: "localhost".to_string(),
            request_timeout: Duration::from_secs(30),
            readiness: Readiness::default(),
            predict_path: "/predict".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InferenceOutcome {
    pub model_id: ModelId,
    pub model_name: String,
    pub result: Value,
    #[serde(rename = "inference_time")]
    pub elapsed_seconds: f64,
    pub status: &'static str,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct StartedModel {
    pub model_id: ModelId,
    pub external_port: u16,
    pub cold_start: bool,
}

pub struct Dispatcher {
    registry: Arc<dyn UnitRegistry>,
    pool: Arc<PoolManager>,
    config: DispatchConfig,
    http: reqwest::Client,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<dyn UnitRegistry>,
        pool: Arc<PoolManager>,
        config: DispatchConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("modeldock/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            registry,
            pool,
            config,
            http,
        })
    }

    pub fn pool(&self) -> &Arc<PoolManager> {
        &self.pool
    }

    async fn find(&self, model_id: ModelId) -> Result<ModelRecord> {
        self.registry
            .lookup(model_id)
            .await?
            .ok_or(Error::ModelNotFound(model_id))
    }

    /// Run one inference call against the model's container, starting it
    /// first if needed.
    pub async fn infer(&self, model_id: ModelId, input: Value) -> Result<InferenceOutcome> {
        let started = Instant::now();
        let model = self.find(model_id).await?;

        let lease = self.pool.ensure_running(model_id, &model.unit).await?;
        if lease.cold_start {
            self.wait_ready(model_id, lease.external_port).await;
        }

        let url = self.endpoint(lease.external_port, &self.config.predict_path);
        tracing::debug!(model_id = %model_id, %url, "forwarding inference request");

        let response = self
            .http
            .post(&url)
            .json(&input)
            .timeout(self.config.request_timeout)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(model_id = %model_id, error = %e, "inference request failed");
                Error::UpstreamUnavailable {
                    reason: e.to_string(),
                }
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| Error::UpstreamUnavailable {
            reason: format!("failed to read response body: {}", e),
        })?;

        if !status.is_success() {
            tracing::warn!(model_id = %model_id, status = status.as_u16(), "model returned an error");
            return Err(Error::UpstreamError {
                status: status.as_u16(),
                body,
            });
        }

        let result = serde_json::from_str(&body).unwrap_or(Value::String(body));

        self.pool.touch(model_id);
        self.record_status(model_id, UnitStatus::Running, Some(lease.external_port));

        let elapsed_seconds = started.elapsed().as_secs_f64();
        tracing::info!(
            model_id = %model_id,
            cold_start = lease.cold_start,
            elapsed_ms = (elapsed_seconds * 1000.0) as u64,
            "inference complete"
        );

        Ok(InferenceOutcome {
            model_id,
            model_name: model.model_name,
            result,
            elapsed_seconds,
            status: "success",
        })
    }

    /// Start the model's container without sending it any traffic.
    pub async fn start_model(&self, model_id: ModelId) -> Result<StartedModel> {
        let model = self.find(model_id).await?;
        let lease = self.pool.ensure_running(model_id, &model.unit).await?;
        Ok(StartedModel {
            model_id,
            external_port: lease.external_port,
            cold_start: lease.cold_start,
        })
    }

    /// Stop the model's container. Returns whether one was running.
    pub async fn stop_model(&self, model_id: ModelId) -> Result<bool> {
        self.find(model_id).await?;
        let stopped = self.pool.release(model_id).await?;
        if !stopped {
            // Nothing live; make sure a stale registry row is corrected.
            self.record_status(model_id, UnitStatus::Available, None);
        }
        Ok(stopped)
    }

    fn endpoint(&self, port: u16, path: &str) -> String {
        format!("http://{}:{}{}", self.config.engine_host, port, path)
    }

    async fn wait_ready(&self, model_id: ModelId, port: u16) {
        match &self.config.readiness {
            Readiness::FixedDelay(delay) => tokio::time::sleep(*delay).await,
            Readiness::Probe {
                path,
                initial_backoff,
                max_backoff,
                max_wait,
            } => {
                let url = self.endpoint(port, path);
                let deadline = Instant::now()
                    .checked_add(*max_wait)
                    .unwrap_or_else(|| Instant::now() + MAX_PROBE_WAIT);
                let mut backoff = *initial_backoff;
                let mut attempts = 0u32;

                loop {
                    attempts += 1;
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    let probe_timeout = remaining.min(*max_backoff).max(Duration::from_millis(50));

                    if self.http.get(&url).timeout(probe_timeout).send().await.is_ok() {
                        tracing::debug!(model_id = %model_id, attempts, "container ready");
                        return;
                    }

                    let now = Instant::now();
                    if now >= deadline {
                        tracing::warn!(
                            model_id = %model_id,
                            attempts,
                            max_wait_ms = max_wait.as_millis() as u64,
                            "container did not answer readiness probe"
                        );
                        return;
                    }
                    tokio::time::sleep(backoff.min(deadline - now)).await;
                    backoff = (backoff * 2).min(*max_backoff);
                }
            }
        }
    }

    fn record_status(&self, model_id: ModelId, status: UnitStatus, port: Option<u16>) {
        let registry = self.registry.clone();
        tokio::spawn(async move {
            if let Err(err) = registry.set_status(model_id, status, port).await {
                tracing::warn!(model_id = %model_id, %status, error = %err, "failed to record model status");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;
    use crate::registry::{MemoryRegistry, sample_model};
    use crate::runtime::{MockRuntime, UnitRef};
    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::post;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn predict(axum::Json(input): axum::Json<Value>) -> (StatusCode, String) {
        if let Some(ms) = input.get("sleep_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        if input.get("fail").is_some() {
            return (StatusCode::UNPROCESSABLE_ENTITY, "bad input".to_string());
        }
        if input.get("plain").is_some() {
            return (StatusCode::OK, "not json".to_string());
        }
        (StatusCode::OK, json!({ "echo": input }).to_string())
    }

    /// Stand-in model server that counts `/predict` calls.
    async fn spawn_counting_model_server() -> (u16, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let app = Router::new().route(
            "/predict",
            post(move |body: axum::Json<Value>| {
                counter.fetch_add(1, Ordering::SeqCst);
                predict(body)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (port, hits)
    }

    async fn spawn_model_server() -> u16 {
        spawn_counting_model_server().await.0
    }

    async fn closed_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    struct Harness {
        runtime: Arc<MockRuntime>,
        registry: Arc<MemoryRegistry>,
        dispatcher: Dispatcher,
        model_id: ModelId,
        unit: UnitRef,
    }

    async fn harness(port: u16, readiness: Readiness) -> Harness {
        let runtime = Arc::new(MockRuntime::new());
        let registry = Arc::new(MemoryRegistry::new());
        let record = registry.register(sample_model(1, "echo")).await.unwrap();
        runtime.add_unit(&record.unit);
        runtime.pin_port(&record.unit, port);

        let pool = Arc::new(PoolManager::new(runtime.clone(), PoolConfig::default()));
        let config = DispatchConfig {
            engine_host: "127.0.0.1".to_string(),
            request_timeout: Duration::from_millis(500),
            readiness,
            predict_path: "/predict".to_string(),
        };
        let dispatcher = Dispatcher::new(registry.clone(), pool, config).unwrap();

        Harness {
            runtime,
            registry,
            dispatcher,
            model_id: record.id,
            unit: record.unit,
        }
    }

    async fn wait_for_status(registry: &MemoryRegistry, id: ModelId, status: UnitStatus) {
        for _ in 0..50 {
            if registry.lookup(id).await.unwrap().map(|r| r.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("model {} never reached status {}", id, status);
    }

    #[tokio::test]
    async fn test_cold_start_then_warm_reuse() {
        let (port, hits) = spawn_counting_model_server().await;
        let settle = Duration::from_millis(20);
        let h = harness(port, Readiness::FixedDelay(settle)).await;

        let before = Instant::now();
        let outcome = h
            .dispatcher
            .infer(h.model_id, json!({ "x": [1, 2, 3] }))
            .await
            .unwrap();
        assert_eq!(outcome.result, json!({ "echo": { "x": [1, 2, 3] } }));
        assert_eq!(outcome.model_name, "echo");
        assert_eq!(outcome.status, "success");
        assert!(outcome.elapsed_seconds >= 0.02);
        assert_eq!(h.runtime.start_calls(&h.unit), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        // The entry was created at start and touched after the settle delay.
        let snapshot = h.dispatcher.pool().snapshot();
        let entry = snapshot.get(h.model_id).unwrap();
        assert!(entry.last_used >= before + settle);

        h.dispatcher.infer(h.model_id, json!({})).await.unwrap();
        assert_eq!(h.runtime.start_calls(&h.unit), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        wait_for_status(&h.registry, h.model_id, UnitStatus::Running).await;
        let record = h.registry.lookup(h.model_id).await.unwrap().unwrap();
        assert_eq!(record.external_port, Some(port));
    }

    #[tokio::test]
    async fn test_probe_readiness_reaches_live_server() {
        let port = spawn_model_server().await;
        let h = harness(port, Readiness::default()).await;

        let outcome = h.dispatcher.infer(h.model_id, json!({ "a": 1 })).await.unwrap();
        assert_eq!(outcome.result["echo"]["a"], 1);
    }

    #[tokio::test]
    async fn test_unbounded_probe_wait_does_not_overflow() {
        let port = spawn_model_server().await;
        let readiness = Readiness::Probe {
            path: "/".to_string(),
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            max_wait: Duration::MAX,
        };
        let h = harness(port, readiness).await;

        let outcome = h.dispatcher.infer(h.model_id, json!({ "a": 2 })).await.unwrap();
        assert_eq!(outcome.result["echo"]["a"], 2);
    }

    #[tokio::test]
    async fn test_upstream_error_passes_status_through() {
        let port = spawn_model_server().await;
        let h = harness(port, Readiness::FixedDelay(Duration::ZERO)).await;

        let err = h
            .dispatcher
            .infer(h.model_id, json!({ "fail": true }))
            .await
            .unwrap_err();
        match err {
            Error::UpstreamError { status, body } => {
                assert_eq!(status, 422);
                assert_eq!(body, "bad input");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_json_body_is_returned_as_text() {
        let port = spawn_model_server().await;
        let h = harness(port, Readiness::FixedDelay(Duration::ZERO)).await;

        let outcome = h
            .dispatcher
            .infer(h.model_id, json!({ "plain": true }))
            .await
            .unwrap();
        assert_eq!(outcome.result, Value::String("not json".to_string()));
    }

    #[tokio::test]
    async fn test_timeout_keeps_container() {
        let port = spawn_model_server().await;
        let h = harness(port, Readiness::FixedDelay(Duration::ZERO)).await;

        let err = h
            .dispatcher
            .infer(h.model_id, json!({ "sleep_ms": 2000 }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UpstreamUnavailable { .. }));
        assert_eq!(err.status_code(), 503);
        assert!(h.dispatcher.pool().snapshot().get(h.model_id).is_some());
        assert_eq!(h.runtime.stop_calls(&h.unit), 0);
    }

    #[tokio::test]
    async fn test_unreachable_container() {
        let port = closed_port().await;
        let h = harness(
            port,
            Readiness::Probe {
                path: "/".to_string(),
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(50),
                max_wait: Duration::from_millis(200),
            },
        )
        .await;

        let err = h.dispatcher.infer(h.model_id, json!({})).await.unwrap_err();
        assert!(matches!(err, Error::UpstreamUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_unknown_model() {
        let h = harness(1, Readiness::FixedDelay(Duration::ZERO)).await;
        let err = h.dispatcher.infer(ModelId(42), json!({})).await.unwrap_err();
        assert!(matches!(err, Error::ModelNotFound(ModelId(42))));
        assert_eq!(h.runtime.total_start_calls(), 0);
    }

    #[tokio::test]
    async fn test_explicit_start_and_stop() {
        let port = spawn_model_server().await;
        let h = harness(port, Readiness::FixedDelay(Duration::ZERO)).await;

        let started = h.dispatcher.start_model(h.model_id).await.unwrap();
        assert!(started.cold_start);
        assert_eq!(started.external_port, port);

        assert!(h.dispatcher.stop_model(h.model_id).await.unwrap());
        assert!(!h.dispatcher.stop_model(h.model_id).await.unwrap());
        assert!(h.runtime.running_units().is_empty());

        assert!(matches!(
            h.dispatcher.stop_model(ModelId(9)).await,
            Err(Error::ModelNotFound(_))
        ));
    }
}
