use std::sync::Arc;

use anyhow::{Context, Result, bail};

use crate::cli::{Command, Invocation, ProvisionArgs};
use crate::config::ServiceConfig;
use crate::dispatch::Dispatcher;
use crate::events::{EventConsumer, FileEventLog};
use crate::pool::{EventCallback, PoolEvent, PoolManager, StopReason};
use crate::provision::{ProvisionRequest, Provisioner};
use crate::reaper::IdleReaper;
use crate::registry::{MemoryRegistry, ModelId, SqliteRegistry, UnitRegistry, UnitStatus};
use crate::runtime::{DockerRuntime, RuntimeAdapter};
use crate::server::{self, AppState};
use crate::version;

pub async fn run(invocation: Invocation) -> Result<i32> {
    if invocation.command == Command::ShowVersion {
        println!("{}", version::describe());
        return Ok(0);
    }

    let config = ServiceConfig::load(invocation.global.config.as_deref())
        .context("failed to load configuration")?;

    match invocation.command {
        Command::Serve => serve(config).await,
        Command::Provision(args) => provision(config, args).await,
        Command::Deprovision { model_id } => deprovision(config, ModelId(model_id)).await,
        Command::ListModels { json } => list_models(config, json).await,
        Command::ShowVersion => Ok(0),
    }
}

/// The wired-up core shared by every command.
pub struct Service {
    pub runtime: Arc<dyn RuntimeAdapter>,
    pub registry: Arc<dyn UnitRegistry>,
    pub pool: Arc<PoolManager>,
    pub dispatcher: Arc<Dispatcher>,
    pub provisioner: Arc<Provisioner>,
}

impl Service {
    pub async fn build(config: &ServiceConfig) -> Result<Self> {
        let runtime: Arc<dyn RuntimeAdapter> =
            Arc::new(DockerRuntime::connect(config.docker_config()).await);
        let registry = open_registry(&config.registry.database_url).await?;
        Self::assemble(config, runtime, registry)
    }

    /// Wire the core around an existing runtime and registry.
    pub fn assemble(
        config: &ServiceConfig,
        runtime: Arc<dyn RuntimeAdapter>,
        registry: Arc<dyn UnitRegistry>,
    ) -> Result<Self> {
        let pool = Arc::new(PoolManager::new(runtime.clone(), config.pool_config()));
        pool.on_event(registry_status_writer(registry.clone()));

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            pool.clone(),
            config.dispatch_config(),
        )?);
        let provisioner = Arc::new(Provisioner::new(
            runtime.clone(),
            registry.clone(),
            pool.clone(),
            Arc::new(FileEventLog::new(&config.events.log_path)),
            config.provision.image_prefix.clone(),
        ));

        Ok(Self {
            runtime,
            registry,
            pool,
            dispatcher,
            provisioner,
        })
    }

    /// Stop every running container and wait for the registry to record it.
    /// The pool listener's writes are detached and would not survive the
    /// runtime shutting down.
    pub async fn release_all(&self) -> usize {
        let stopped = self.pool.release_all().await;
        for model_id in &stopped {
            if let Err(err) = self
                .registry
                .set_status(*model_id, UnitStatus::Available, None)
                .await
            {
                tracing::warn!(model_id = %model_id, error = %err, "failed to record model status");
            }
        }
        stopped.len()
    }

    pub fn app_state(&self) -> AppState {
        AppState {
            registry: self.registry.clone(),
            runtime: self.runtime.clone(),
            dispatcher: self.dispatcher.clone(),
            provisioner: self.provisioner.clone(),
        }
    }
}

pub async fn open_registry(database_url: &str) -> Result<Arc<dyn UnitRegistry>> {
    if database_url == "memory" {
        tracing::warn!("using in-memory registry; models are forgotten on restart");
        return Ok(Arc::new(MemoryRegistry::new()));
    }
    let registry = SqliteRegistry::connect(database_url)
        .await
        .with_context(|| format!("failed to open registry at {database_url}"))?;
    Ok(Arc::new(registry))
}

/// Mirror pool transitions into the registry without holding up the pool.
pub fn registry_status_writer(registry: Arc<dyn UnitRegistry>) -> EventCallback {
    Box::new(move |event| {
        let (model_id, status, port) = match event {
            PoolEvent::Started {
                model_id,
                external_port,
                ..
            } => (*model_id, UnitStatus::Running, Some(*external_port)),
            PoolEvent::Stopped {
                model_id,
                reason: StopReason::Vanished,
                ..
            } => (*model_id, UnitStatus::Stopped, None),
            PoolEvent::Stopped { model_id, .. } => (*model_id, UnitStatus::Available, None),
            PoolEvent::StartFailed { model_id, .. } => (*model_id, UnitStatus::Failed, None),
        };
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(err) = registry.set_status(model_id, status, port).await {
                tracing::warn!(model_id = %model_id, %status, error = %err, "failed to record model status");
            }
        });
    })
}

async fn serve(config: ServiceConfig) -> Result<i32> {
    let service = Service::build(&config).await?;
    if let Err(err) = service.runtime.ping().await {
        tracing::warn!(error = %err, "container engine unavailable; serving in degraded mode");
    }

    let reaper = IdleReaper::new(service.pool.clone(), config.reaper_config()).spawn();
    let consumer = EventConsumer::new(
        &config.events.log_path,
        service.registry.clone(),
        config.poll_interval(),
    )
    .spawn();

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(
        %addr,
        max_running = config.pool.max_running,
        idle_timeout_secs = config.pool.idle_timeout_secs,
        "modeldock listening"
    );

    let served = axum::serve(listener, server::router(service.app_state()))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    reaper.shutdown().await;
    consumer.shutdown().await;
    if config.server.release_on_shutdown {
        let stopped = service.release_all().await;
        tracing::info!(stopped, "released running containers");
    }

    served.context("HTTP server failed")?;
    Ok(0)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

async fn provision(config: ServiceConfig, args: ProvisionArgs) -> Result<i32> {
    let service = Service::build(&config).await?;
    if service.runtime.ping().await.is_err() {
        bail!("container engine is unreachable; cannot build images");
    }

    let model = service
        .provisioner
        .provision(
            &args.source,
            ProvisionRequest {
                username: args.username,
                model_name: args.model_name,
                description: args.description,
            },
        )
        .await?;

    println!("image:     {}", model.image);
    println!("container: {}", model.unit.short());
    println!("upload id: {}", model.upload_id);
    println!(
        "announced on {}; a running server registers it on its next poll",
        config.events.log_path.display()
    );
    Ok(0)
}

async fn deprovision(config: ServiceConfig, model_id: ModelId) -> Result<i32> {
    let service = Service::build(&config).await?;
    service.provisioner.deprovision(model_id).await?;
    println!("removed model {model_id}");
    Ok(0)
}

async fn list_models(config: ServiceConfig, json: bool) -> Result<i32> {
    let registry = open_registry(&config.registry.database_url).await?;
    let models = registry.list().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&models)?);
        return Ok(0);
    }
    if models.is_empty() {
        println!("no models registered");
        return Ok(0);
    }

    println!(
        "{:<6} {:<16} {:<24} {:<10} {:<6}",
        "ID", "OWNER", "MODEL", "STATUS", "PORT"
    );
    for model in models {
        println!(
            "{:<6} {:<16} {:<24} {:<10} {:<6}",
            model.id,
            model.username,
            model.model_name,
            model.status,
            model
                .external_port
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::sample_model;
    use crate::runtime::MockRuntime;
    use std::time::Duration;

    async fn wait_for_status(registry: &dyn UnitRegistry, id: ModelId, status: UnitStatus) {
        for _ in 0..100 {
            if registry.lookup(id).await.unwrap().map(|r| r.status) == Some(status) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("model {} never reached {}", id, status);
    }

    #[tokio::test]
    async fn test_pool_transitions_reach_registry() {
        let runtime = Arc::new(MockRuntime::new());
        let registry: Arc<dyn UnitRegistry> = Arc::new(MemoryRegistry::new());
        let service =
            Service::assemble(&ServiceConfig::default(), runtime.clone(), registry.clone()).unwrap();

        let record = registry.register(sample_model(1, "resnet")).await.unwrap();
        runtime.add_unit(&record.unit);

        let lease = service
            .pool
            .ensure_running(record.id, &record.unit)
            .await
            .unwrap();
        wait_for_status(registry.as_ref(), record.id, UnitStatus::Running).await;
        let running = registry.lookup(record.id).await.unwrap().unwrap();
        assert_eq!(running.external_port, Some(lease.external_port));

        service.pool.release(record.id).await.unwrap();
        wait_for_status(registry.as_ref(), record.id, UnitStatus::Available).await;

        runtime.fail_start(&record.unit, true);
        assert!(service.pool.ensure_running(record.id, &record.unit).await.is_err());
        wait_for_status(registry.as_ref(), record.id, UnitStatus::Failed).await;
    }

    #[tokio::test]
    async fn test_release_all_records_status_before_returning() {
        let runtime = Arc::new(MockRuntime::new());
        let registry: Arc<dyn UnitRegistry> = Arc::new(MemoryRegistry::new());
        let service =
            Service::assemble(&ServiceConfig::default(), runtime.clone(), registry.clone()).unwrap();

        let mut ids = Vec::new();
        for (upload_id, name) in [(1, "resnet"), (2, "bert")] {
            let record = registry.register(sample_model(upload_id, name)).await.unwrap();
            runtime.add_unit(&record.unit);
            service.pool.ensure_running(record.id, &record.unit).await.unwrap();
            registry
                .set_status(record.id, UnitStatus::Running, None)
                .await
                .unwrap();
            ids.push(record.id);
        }

        assert_eq!(service.release_all().await, 2);
        assert!(runtime.running_units().is_empty());
        for id in ids {
            let record = registry.lookup(id).await.unwrap().unwrap();
            assert_eq!(record.status, UnitStatus::Available);
        }
    }

    #[tokio::test]
    async fn test_memory_registry_selector() {
        let registry = open_registry("memory").await.unwrap();
        assert!(registry.list().await.unwrap().is_empty());

        let sqlite = open_registry("sqlite::memory:").await.unwrap();
        assert!(sqlite.list().await.unwrap().is_empty());
    }
}
