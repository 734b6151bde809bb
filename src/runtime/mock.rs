//! In-memory runtime for unit and integration tests.
//!
//! Tracks container state without an engine, counts every call and lets a
//! test script failures per container.

use super::{ImageRef, RuntimeAdapter, UnitRef};
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

const FIRST_EPHEMERAL_PORT: u16 = 32768;

#[derive(Debug, Default)]
struct MockState {
    units: HashMap<UnitRef, MockUnit>,
    images: HashSet<ImageRef>,
    pinned_ports: HashMap<UnitRef, u16>,
    next_port: u16,
    next_unit: u64,

    unreachable: bool,
    start_delay: Option<Duration>,
    failing_starts: HashSet<UnitRef>,
    failing_stops: HashSet<UnitRef>,
    portless: HashSet<UnitRef>,

    start_calls: HashMap<UnitRef, usize>,
    stop_calls: HashMap<UnitRef, usize>,
    builds: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
struct MockUnit {
    running: bool,
    port: Option<u16>,
}

/// Scriptable [`RuntimeAdapter`].
#[derive(Debug, Default)]
pub struct MockRuntime {
    state: Mutex<MockState>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an existing (created, stopped) container.
    pub fn add_unit(&self, unit: &UnitRef) {
        self.state().units.insert(
            unit.clone(),
            MockUnit {
                running: false,
                port: None,
            },
        );
    }

    /// Always hand out `port` when `unit` starts.
    pub fn pin_port(&self, unit: &UnitRef, port: u16) {
        self.state().pinned_ports.insert(unit.clone(), port);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    pub fn set_start_delay(&self, delay: Option<Duration>) {
        self.state().start_delay = delay;
    }

    pub fn fail_start(&self, unit: &UnitRef, fail: bool) {
        toggle(&mut self.state().failing_starts, unit, fail);
    }

    pub fn fail_stop(&self, unit: &UnitRef, fail: bool) {
        toggle(&mut self.state().failing_stops, unit, fail);
    }

    /// Start succeeds but publishes no port.
    pub fn without_port(&self, unit: &UnitRef, portless: bool) {
        toggle(&mut self.state().portless, unit, portless);
    }

    /// Simulate a container that died behind the orchestrator's back.
    pub fn crash(&self, unit: &UnitRef) {
        if let Some(entry) = self.state().units.get_mut(unit) {
            entry.running = false;
            entry.port = None;
        }
    }

    pub fn start_calls(&self, unit: &UnitRef) -> usize {
        self.state().start_calls.get(unit).copied().unwrap_or(0)
    }

    pub fn stop_calls(&self, unit: &UnitRef) -> usize {
        self.state().stop_calls.get(unit).copied().unwrap_or(0)
    }

    pub fn total_start_calls(&self) -> usize {
        self.state().start_calls.values().sum()
    }

    pub fn running_units(&self) -> Vec<UnitRef> {
        let mut units: Vec<UnitRef> = self
            .state()
            .units
            .iter()
            .filter(|(_, u)| u.running)
            .map(|(id, _)| id.clone())
            .collect();
        units.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        units
    }

    pub fn has_unit(&self, unit: &UnitRef) -> bool {
        self.state().units.contains_key(unit)
    }

    pub fn has_image(&self, image: &ImageRef) -> bool {
        self.state().images.contains(image)
    }

    /// `(tag, source path)` of every build request.
    pub fn builds(&self) -> Vec<(String, String)> {
        self.state().builds.clone()
    }

    fn check_reachable(&self) -> Result<()> {
        if self.state().unreachable {
            return Err(Error::unreachable("mock engine offline"));
        }
        Ok(())
    }
}

fn toggle(set: &mut HashSet<UnitRef>, unit: &UnitRef, on: bool) {
    if on {
        set.insert(unit.clone());
    } else {
        set.remove(unit);
    }
}

#[async_trait]
impl RuntimeAdapter for MockRuntime {
    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn build_image(&self, source: &Path, tag: &str) -> Result<ImageRef> {
        self.check_reachable()?;
        let image = ImageRef::new(tag);
        let mut state = self.state();
        state
            .builds
            .push((tag.to_string(), source.display().to_string()));
        state.images.insert(image.clone());
        Ok(image)
    }

    async fn create_unit(&self, image: &ImageRef, name: &str) -> Result<UnitRef> {
        self.check_reachable()?;
        let mut state = self.state();
        if !state.images.contains(image) {
            return Err(Error::EngineOperation {
                operation: "create container".to_string(),
                reason: format!("404 No such image: {}", image),
            });
        }
        state.next_unit += 1;
        let unit = UnitRef::new(format!("{:0>12x}{}", state.next_unit, name));
        state.units.insert(
            unit.clone(),
            MockUnit {
                running: false,
                port: None,
            },
        );
        Ok(unit)
    }

    async fn start(&self, unit: &UnitRef) -> Result<u16> {
        self.check_reachable()?;
        let delay = {
            let mut state = self.state();
            *state.start_calls.entry(unit.clone()).or_insert(0) += 1;
            state.start_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state();
        if state.failing_starts.contains(unit) {
            return Err(Error::StartFailed {
                unit: unit.short().to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        if !state.units.contains_key(unit) {
            return Err(Error::StartFailed {
                unit: unit.short().to_string(),
                reason: "404 No such container".to_string(),
            });
        }

        let portless = state.portless.contains(unit);
        let pinned = state.pinned_ports.get(unit).copied();
        let already = state.units.get(unit).and_then(|u| u.port);
        let port = match (portless, already, pinned) {
            (true, _, _) => None,
            (false, Some(port), _) => Some(port),
            (false, None, Some(port)) => Some(port),
            (false, None, None) => {
                let port = FIRST_EPHEMERAL_PORT + state.next_port;
                state.next_port += 1;
                Some(port)
            }
        };

        if let Some(entry) = state.units.get_mut(unit) {
            entry.running = true;
            entry.port = port;
        }

        port.ok_or_else(|| Error::NoPortAssigned {
            unit: unit.short().to_string(),
        })
    }

    async fn stop(&self, unit: &UnitRef) -> Result<()> {
        self.check_reachable()?;
        let mut state = self.state();
        *state.stop_calls.entry(unit.clone()).or_insert(0) += 1;
        if state.failing_stops.contains(unit) {
            return Err(Error::EngineOperation {
                operation: "stop container".to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        if let Some(entry) = state.units.get_mut(unit) {
            entry.running = false;
            entry.port = None;
        }
        Ok(())
    }

    async fn get_port(&self, unit: &UnitRef) -> Result<Option<u16>> {
        self.check_reachable()?;
        Ok(self.state().units.get(unit).and_then(|u| u.port))
    }

    async fn is_running(&self, unit: &UnitRef) -> Result<bool> {
        self.check_reachable()?;
        Ok(self.state().units.get(unit).is_some_and(|u| u.running))
    }

    async fn remove_unit(&self, unit: &UnitRef) -> Result<()> {
        self.check_reachable()?;
        self.state().units.remove(unit);
        Ok(())
    }

    async fn remove_image(&self, image: &ImageRef) -> Result<()> {
        self.check_reachable()?;
        self.state().images.remove(image);
        Ok(())
    }
}
