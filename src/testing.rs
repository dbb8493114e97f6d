//! Scripted fakes for the Docker seams and dependency discovery

use crate::discovery::{DependencyMap, DependencyMapProvider};
use crate::docker::{ContainerInfo, EventSource, Gateway, Health, Inspection, Inventory, LifecycleEvent};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct FakeState {
    containers: Vec<ContainerInfo>,
    restarts: Vec<String>,
    inspects: Vec<String>,
    /// Per-id health answers, consumed front to back; the last one sticks
    health: HashMap<String, VecDeque<Health>>,
    default_health: Health,
    restart_errors: HashMap<String, String>,
    inspect_errors: HashMap<String, String>,
    list_error: Option<String>,
}

/// In-memory Docker: a container list, scripted health and recorded restarts
#[derive(Default)]
pub struct FakeDocker {
    state: Mutex<FakeState>,
}

impl FakeDocker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Health reported for ids without a script
    pub fn with_default_health(self, health: Health) -> Self {
        self.state.lock().unwrap().default_health = health;
        self
    }

    pub fn add_container(&self, container: ContainerInfo) {
        self.state.lock().unwrap().containers.push(container);
    }

    /// Replace the container named `name` (simulates a recreate)
    pub fn replace_container(&self, name: &str, container: ContainerInfo) {
        let mut state = self.state.lock().unwrap();
        state.containers.retain(|c| c.name != name);
        state.containers.push(container);
    }

    /// Queue health answers for an id
    pub fn script_health(&self, id: &str, answers: impl IntoIterator<Item = Health>) {
        self.state
            .lock()
            .unwrap()
            .health
            .entry(id.to_string())
            .or_default()
            .extend(answers);
    }

    pub fn fail_restart(&self, id: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .restart_errors
            .insert(id.to_string(), message.to_string());
    }

    pub fn fail_inspect(&self, id: &str, message: &str) {
        self.state
            .lock()
            .unwrap()
            .inspect_errors
            .insert(id.to_string(), message.to_string());
    }

    pub fn fail_list(&self, message: &str) {
        self.state.lock().unwrap().list_error = Some(message.to_string());
    }

    /// Ids restarted so far, in call order
    pub fn restarts(&self) -> Vec<String> {
        self.state.lock().unwrap().restarts.clone()
    }

    pub fn inspect_count(&self, id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .inspects
            .iter()
            .filter(|i| *i == id)
            .count()
    }
}

#[async_trait]
impl Gateway for FakeDocker {
    async fn restart(&self, id: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.restarts.push(id.to_string());
        match state.restart_errors.get(id) {
            Some(message) => Err(Error::Gateway(message.clone())),
            None => Ok(()),
        }
    }

    async fn inspect_health(&self, id: &str) -> Result<Inspection> {
        let mut state = self.state.lock().unwrap();
        state.inspects.push(id.to_string());
        if let Some(message) = state.inspect_errors.get(id) {
            return Err(Error::Gateway(message.clone()));
        }

        let default_health = state.default_health;
        let health = match state.health.get_mut(id) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap_or(default_health),
            Some(queue) => queue.front().copied().unwrap_or(default_health),
            None => default_health,
        };
        let labels = state
            .containers
            .iter()
            .find(|c| c.id == id)
            .map(|c| c.labels.clone())
            .unwrap_or_default();

        Ok(Inspection { health, labels })
    }
}

#[async_trait]
impl Inventory for FakeDocker {
    async fn list_containers(&self, include_stopped: bool) -> Result<Vec<ContainerInfo>> {
        let state = self.state.lock().unwrap();
        if let Some(message) = &state.list_error {
            return Err(Error::Gateway(message.clone()));
        }
        Ok(state
            .containers
            .iter()
            .filter(|c| include_stopped || c.is_running())
            .cloned()
            .collect())
    }
}

/// Dependency map provider returning a fixed map, optionally failing the first N builds
#[derive(Default)]
pub struct StaticDiscovery {
    map: Mutex<DependencyMap>,
    failures_left: AtomicUsize,
    builds: AtomicUsize,
}

impl StaticDiscovery {
    pub fn new(map: DependencyMap) -> Self {
        Self {
            map: Mutex::new(map),
            ..Default::default()
        }
    }

    pub fn failing_first(self, failures: usize) -> Self {
        self.failures_left.store(failures, Ordering::SeqCst);
        self
    }

    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DependencyMapProvider for StaticDiscovery {
    async fn build_dependency_map(&self) -> Result<DependencyMap> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(Error::Gateway("compose file unavailable".to_string()));
        }
        Ok(self.map.lock().unwrap().clone())
    }
}

/// One scripted subscription: the events it delivers, then whether it stays open
pub struct Subscription {
    pub events: Vec<LifecycleEvent>,
    pub stay_open: bool,
}

/// Event source handing out scripted subscriptions in order
///
/// Once the script runs out, subscriptions stay open and silent until cancelled.
#[derive(Default)]
pub struct ScriptedEvents {
    script: Mutex<VecDeque<Subscription>>,
    subscriptions: AtomicUsize,
}

impl ScriptedEvents {
    pub fn new(script: impl IntoIterator<Item = Subscription>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            subscriptions: AtomicUsize::new(0),
        }
    }

    pub fn subscriptions(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }
}

impl EventSource for ScriptedEvents {
    fn subscribe(&self, cancel: CancellationToken) -> mpsc::Receiver<LifecycleEvent> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front().unwrap_or(Subscription {
            events: Vec::new(),
            stay_open: true,
        });

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for event in next.events {
                if tx.send(event).await.is_err() {
                    return;
                }
            }
            if next.stay_open {
                cancel.cancelled().await;
            }
        });
        rx
    }
}
