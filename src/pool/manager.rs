use super::{
    EventCallback, Lease, PoolConfig, PoolEntryView, PoolEvent, PoolSnapshot, StopReason,
};
use crate::registry::ModelId;
use crate::runtime::{RuntimeAdapter, UnitRef};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct PoolEntry {
    unit: UnitRef,
    external_port: u16,
    last_used: Instant,
    last_used_at: DateTime<Utc>,
    seq: u64,
}

impl PoolEntry {
    fn touch(&mut self) {
        let now = Instant::now();
        if now > self.last_used {
            self.last_used = now;
        }
        let wall = Utc::now();
        if wall > self.last_used_at {
            self.last_used_at = wall;
        }
    }

    fn view(&self, model_id: ModelId) -> PoolEntryView {
        PoolEntryView {
            unit: self.unit.clone(),
            model_id,
            external_port: self.external_port,
            last_used: self.last_used,
            last_used_at: self.last_used_at,
            seq: self.seq,
        }
    }
}

#[derive(Debug, Default)]
struct LiveSet {
    entries: HashMap<ModelId, PoolEntry>,
    next_seq: u64,
}

impl LiveSet {
    /// Least recently used entry; start order breaks ties.
    fn lru_victim(&self) -> Option<ModelId> {
        self.entries
            .iter()
            .min_by_key(|(_, e)| (e.last_used, e.seq))
            .map(|(id, _)| *id)
    }
}

/// Owns the set of running model containers.
///
/// Map reads and touches take a short lock and never wait on the engine.
/// Anything that starts or stops a container holds `transitions` for the
/// whole engine round-trip, so capacity checks and the calls that act on
/// them cannot interleave.
pub struct PoolManager {
    runtime: Arc<dyn RuntimeAdapter>,
    config: PoolConfig,
    live: RwLock<LiveSet>,
    transitions: Mutex<()>,
    listeners: RwLock<Vec<EventCallback>>,
}

impl PoolManager {
    pub fn new(runtime: Arc<dyn RuntimeAdapter>, config: PoolConfig) -> Self {
        Self {
            runtime,
            config,
            live: RwLock::new(LiveSet::default()),
            transitions: Mutex::new(()),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn read_live(&self) -> RwLockReadGuard<'_, LiveSet> {
        self.live.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_live(&self) -> RwLockWriteGuard<'_, LiveSet> {
        self.live.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Touch and return the port of an existing entry.
    fn touch_existing(&self, model_id: ModelId) -> Option<u16> {
        let mut live = self.write_live();
        let entry = live.entries.get_mut(&model_id)?;
        entry.touch();
        Some(entry.external_port)
    }

    /// Make sure the model's container is running and return its host port.
    ///
    /// A live entry is reused without contacting the engine. Otherwise LRU
    /// entries are evicted until there is room and the container is started.
    pub async fn ensure_running(&self, model_id: ModelId, unit: &UnitRef) -> Result<Lease> {
        if let Some(port) = self.touch_existing(model_id) {
            return Ok(Lease {
                external_port: port,
                cold_start: false,
            });
        }

        let _transition = self.transitions.lock().await;

        // Another caller may have started it while we waited.
        if let Some(port) = self.touch_existing(model_id) {
            return Ok(Lease {
                external_port: port,
                cold_start: false,
            });
        }

        self.make_room().await?;

        tracing::info!(model_id = %model_id, unit = %unit.short(), "starting container");
        let started =
            tokio::time::timeout(self.config.start_timeout, self.runtime.start(unit)).await;

        let port = match started {
            Ok(Ok(port)) => port,
            Ok(Err(err)) => {
                if matches!(err, Error::NoPortAssigned { .. }) {
                    self.stop_quietly(unit).await;
                }
                return Err(self.start_failed(model_id, unit, err));
            }
            Err(_) => {
                self.stop_quietly(unit).await;
                let err = Error::StartFailed {
                    unit: unit.short().to_string(),
                    reason: format!(
                        "did not start within {}s",
                        self.config.start_timeout.as_secs_f64()
                    ),
                };
                return Err(self.start_failed(model_id, unit, err));
            }
        };

        {
            let mut live = self.write_live();
            live.next_seq += 1;
            let seq = live.next_seq;
            live.entries.insert(
                model_id,
                PoolEntry {
                    unit: unit.clone(),
                    external_port: port,
                    last_used: Instant::now(),
                    last_used_at: Utc::now(),
                    seq,
                },
            );
        }

        tracing::info!(model_id = %model_id, unit = %unit.short(), port, "container started");
        self.emit_event(PoolEvent::Started {
            model_id,
            unit: unit.clone(),
            external_port: port,
        });

        Ok(Lease {
            external_port: port,
            cold_start: true,
        })
    }

    /// Caller must hold `transitions`.
    async fn make_room(&self) -> Result<()> {
        loop {
            let victim = {
                let live = self.read_live();
                if live.entries.len() < self.config.max_running {
                    return Ok(());
                }
                live.lru_victim()
            };
            // max_running is validated to be at least one, so a full set has a victim.
            let Some(victim) = victim else {
                return Ok(());
            };

            tracing::info!(model_id = %victim, "evicting least recently used container");
            if let Err(err) = self.stop_entry(victim, StopReason::Evicted).await {
                tracing::warn!(model_id = %victim, error = %err, "eviction failed");
                return Err(Error::CapacityEvictionFailed {
                    model_id: victim,
                    reason: err.to_string(),
                });
            }
        }
    }

    fn start_failed(&self, model_id: ModelId, unit: &UnitRef, err: Error) -> Error {
        tracing::error!(model_id = %model_id, unit = %unit.short(), error = %err, "container start failed");
        self.emit_event(PoolEvent::StartFailed {
            model_id,
            unit: unit.clone(),
            error: err.to_string(),
        });
        err
    }

    async fn stop_quietly(&self, unit: &UnitRef) {
        if let Err(err) = self.runtime.stop(unit).await {
            tracing::warn!(unit = %unit.short(), error = %err, "cleanup stop failed");
        }
    }

    /// Remove the entry, stop its container and put the entry back if the
    /// stop fails. Caller must hold `transitions`.
    async fn stop_entry(&self, model_id: ModelId, reason: StopReason) -> Result<bool> {
        let Some(entry) = self.write_live().entries.remove(&model_id) else {
            return Ok(false);
        };

        if let Err(err) = self.runtime.stop(&entry.unit).await {
            self.write_live().entries.insert(model_id, entry);
            return Err(err);
        }

        tracing::info!(model_id = %model_id, unit = %entry.unit.short(), %reason, "container stopped");
        self.emit_event(PoolEvent::Stopped {
            model_id,
            unit: entry.unit,
            reason,
        });
        Ok(true)
    }

    /// Refresh the model's last-used time. No-op when it is not running.
    pub fn touch(&self, model_id: ModelId) {
        self.touch_existing(model_id);
    }

    /// Stop the model's container. Returns `false` when it was not running.
    pub async fn release(&self, model_id: ModelId) -> Result<bool> {
        let _transition = self.transitions.lock().await;
        self.stop_entry(model_id, StopReason::Requested).await
    }

    /// Stop the model's container and delete it from the engine under one
    /// transition, so no start for the same unit can land in between. A failed
    /// stop keeps both the entry and the container.
    pub async fn retire(&self, model_id: ModelId, unit: &UnitRef) -> Result<()> {
        let _transition = self.transitions.lock().await;
        self.stop_entry(model_id, StopReason::Requested).await?;
        if let Err(err) = self.runtime.remove_unit(unit).await {
            tracing::warn!(model_id = %model_id, unit = %unit.short(), error = %err, "failed to remove container");
        }
        Ok(())
    }

    /// Stop the model's container only if it has not been used since `cutoff`.
    /// The check and the stop happen under the same transition, so a request
    /// that lands between the reaper's snapshot and this call keeps the
    /// container alive.
    pub async fn release_if_idle(&self, model_id: ModelId, cutoff: Instant) -> Result<bool> {
        let _transition = self.transitions.lock().await;
        let idle = self
            .read_live()
            .entries
            .get(&model_id)
            .is_some_and(|e| e.last_used < cutoff);
        if !idle {
            return Ok(false);
        }
        self.stop_entry(model_id, StopReason::Idle).await
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let live = self.read_live();
        let mut entries: Vec<PoolEntryView> = live
            .entries
            .iter()
            .map(|(id, e)| e.view(*id))
            .collect();
        entries.sort_by_key(|e| e.seq);
        PoolSnapshot {
            running_count: entries.len(),
            max_running: self.config.max_running,
            entries,
        }
    }

    /// Drop entries whose container the engine no longer reports running.
    /// Returns the models that were dropped.
    pub async fn reconcile(&self) -> Result<Vec<ModelId>> {
        let _transition = self.transitions.lock().await;
        let tracked: Vec<(ModelId, UnitRef)> = self
            .read_live()
            .entries
            .iter()
            .map(|(id, e)| (*id, e.unit.clone()))
            .collect();

        let mut vanished = Vec::new();
        for (model_id, unit) in tracked {
            if self.runtime.is_running(&unit).await? {
                continue;
            }
            if self.write_live().entries.remove(&model_id).is_some() {
                tracing::warn!(model_id = %model_id, unit = %unit.short(), "container no longer running");
                self.emit_event(PoolEvent::Stopped {
                    model_id,
                    unit,
                    reason: StopReason::Vanished,
                });
                vanished.push(model_id);
            }
        }
        vanished.sort();
        Ok(vanished)
    }

    /// Stop every running container. Failures are logged; returns the models
    /// whose containers were stopped.
    pub async fn release_all(&self) -> Vec<ModelId> {
        let _transition = self.transitions.lock().await;
        let mut ids: Vec<ModelId> = self.read_live().entries.keys().copied().collect();
        ids.sort();

        let mut stopped = Vec::new();
        for model_id in ids {
            match self.stop_entry(model_id, StopReason::Shutdown).await {
                Ok(true) => stopped.push(model_id),
                Ok(false) => {}
                Err(err) => {
                    tracing::error!(model_id = %model_id, error = %err, "failed to stop container on shutdown");
                }
            }
        }
        stopped
    }

    pub fn on_event(&self, callback: EventCallback) {
        let mut listeners = self.listeners.write().unwrap_or_else(PoisonError::into_inner);
        listeners.push(callback);
    }

    fn emit_event(&self, event: PoolEvent) {
        let listeners = self.listeners.read().unwrap_or_else(PoisonError::into_inner);
        for listener in listeners.iter() {
            listener(&event);
        }
    }
}
