//! The Warden - parent container supervisor
//!
//! Feeds recovery from three sources, all held back until the initial
//! discovery phase ends:
//! - Live lifecycle events (main loop, resubscribed with backoff if the stream drops)
//! - A fixed-interval polling fallback
//! - One startup reconciliation pass when the phase ends
//!
//! Every trigger rebuilds the dependency map, lists containers, prunes the
//! unrestartable set and runs proactive restart detection before recovering.

pub mod gate;
pub mod lookout;

pub use gate::DiscoveryGate;
pub use lookout::LastKnownParents;

use std::sync::Arc;
use std::time::Duration;

use chrono_machines::{BackoffStrategy, ExponentialBackoff};
use rand::rng;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::discovery::{DependencyMap, DependencyMapProvider, FleetSnapshot};
use crate::docker::{EventSource, Gateway, Health, Inventory, LifecycleEvent, short_id};
use crate::error::Result;
use crate::sickbay::{RecoveryCooldown, RecoveryFlow, RecoveryOutcome};

/// Interval of the polling fallback
pub const POLL_INTERVAL: Duration = Duration::from_secs(60);

/// Attempts at building the dependency map for startup reconciliation
const RECONCILE_ATTEMPTS: u8 = 5;

/// Delay before retrying a failed startup discovery
fn reconcile_backoff() -> ExponentialBackoff {
    ExponentialBackoff::new()
        .base_delay_ms(2_000)
        .max_delay_ms(30_000)
        .multiplier(2.0)
        .max_attempts(RECONCILE_ATTEMPTS)
        .jitter_factor(0.0)
}

/// Delay before resubscribing to a closed event stream
fn resubscribe_backoff() -> ExponentialBackoff {
    ExponentialBackoff::new()
        .base_delay_ms(1_000)
        .max_delay_ms(60_000)
        .multiplier(2.0)
        .max_attempts(u8::MAX)
        .jitter_factor(0.5)
}

fn backoff_delay(backoff: &ExponentialBackoff, attempt: u8, fallback: Duration) -> Duration {
    let mut rng = rng();
    backoff
        .delay(attempt, &mut rng)
        .map(Duration::from_millis)
        .unwrap_or(fallback)
}

/// What started a recovery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Event,
    Polling,
    Startup,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Event => "event",
            Trigger::Polling => "polling",
            Trigger::Startup => "startup",
        }
    }
}

/// Supervises parent containers and drives their recovery
pub struct Warden {
    inventory: Arc<dyn Inventory>,
    gateway: Arc<dyn Gateway>,
    discovery: Arc<dyn DependencyMapProvider>,
    flow: RecoveryFlow,
    cooldown: RecoveryCooldown,
    last_known: LastKnownParents,
    gate: DiscoveryGate,
}

impl Warden {
    pub fn new(
        inventory: Arc<dyn Inventory>,
        gateway: Arc<dyn Gateway>,
        discovery: Arc<dyn DependencyMapProvider>,
        flow: RecoveryFlow,
        recovery_cooldown: Duration,
        gate: DiscoveryGate,
    ) -> Self {
        Self {
            inventory,
            gateway,
            discovery,
            flow,
            cooldown: RecoveryCooldown::new(recovery_cooldown),
            last_known: LastKnownParents::new(),
            gate,
        }
    }

    /// Main loop: consume lifecycle events until cancelled
    ///
    /// A closed stream is resubscribed after a backoff; polling covers the gap.
    pub async fn run(&self, source: Arc<dyn EventSource>, cancel: CancellationToken) {
        let backoff = resubscribe_backoff();
        let mut failures: u8 = 0;

        loop {
            let mut events = source.subscribe(cancel.clone());
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => event,
                };
                let Some(event) = event else {
                    break;
                };
                failures = 0;
                self.handle_event(&event, &cancel).await;
            }

            if cancel.is_cancelled() {
                return;
            }
            failures = failures.saturating_add(1);
            let delay = backoff_delay(&backoff, failures, Duration::from_secs(60));
            tracing::warn!(
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                "event stream closed, resubscribing"
            );
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Handle one lifecycle event; `None` when it did not lead to a recovery attempt
    pub async fn handle_event(&self, event: &LifecycleEvent, cancel: &CancellationToken) -> Option<RecoveryOutcome> {
        if !self.gate.is_open() {
            tracing::debug!(
                container = %event.name,
                action = %event.action,
                remaining_secs = self.gate.remaining().as_secs(),
                "initial discovery in progress, ignoring event"
            );
            return None;
        }

        let dependencies = match self.discovery.build_dependency_map().await {
            Ok(map) => map,
            Err(e) => {
                tracing::error!(error = %e, "refresh discovery");
                return None;
            }
        };
        if !dependencies.is_parent(&event.name) {
            return None;
        }

        let snapshot = match self.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "event: list containers");
                return None;
            }
        };
        self.proactive_restart(&dependencies, &snapshot).await;

        self.try_recover(
            &event.name,
            &event.id,
            &event.action,
            Trigger::Event,
            &dependencies,
            &snapshot,
            cancel,
        )
        .await
    }

    /// Polling fallback: re-check every parent every `POLL_INTERVAL`
    pub async fn run_poller(&self, cancel: CancellationToken) {
        let start = tokio::time::Instant::now() + POLL_INTERVAL;
        let mut ticker = tokio::time::interval_at(start, POLL_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            self.poll_once(&cancel).await;
        }
    }

    /// One polling pass
    pub async fn poll_once(&self, cancel: &CancellationToken) {
        if !self.gate.is_open() {
            return;
        }
        let dependencies = match self.discovery.build_dependency_map().await {
            Ok(map) => map,
            Err(e) => {
                tracing::debug!(error = %e, "polling: build discovery");
                return;
            }
        };
        let snapshot = match self.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::debug!(error = %e, "polling: list containers");
                return;
            }
        };
        self.proactive_restart(&dependencies, &snapshot).await;
        self.check_parents(&dependencies, &snapshot, Trigger::Polling, cancel).await;
    }

    /// Wait out the discovery phase, then run startup reconciliation once
    pub async fn run_startup(&self, cancel: CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("shutdown during initial discovery wait, skipping startup reconciliation");
                return;
            }
            _ = self.gate.opened() => {}
        }
        tracing::info!("initial discovery complete, recovery enabled");

        let backoff = reconcile_backoff();
        for attempt in 1..=RECONCILE_ATTEMPTS {
            if cancel.is_cancelled() {
                return;
            }
            match self.discovery.build_dependency_map().await {
                Ok(dependencies) => {
                    self.reconcile(&dependencies, &cancel).await;
                    return;
                }
                Err(e) => {
                    tracing::error!(error = %e, attempt, "startup reconciliation: build discovery");
                    if attempt == RECONCILE_ATTEMPTS {
                        tracing::error!(
                            error = %e,
                            "startup reconciliation: gave up after retries, skipping reconciliation"
                        );
                        return;
                    }
                }
            }

            let delay = backoff_delay(&backoff, attempt, Duration::from_secs(30));
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Recover every parent that is already stopped or unhealthy
    pub async fn reconcile(&self, dependencies: &DependencyMap, cancel: &CancellationToken) {
        let snapshot = match self.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                tracing::error!(error = %e, "startup list containers");
                return;
            }
        };
        self.proactive_restart(dependencies, &snapshot).await;
        self.check_parents(dependencies, &snapshot, Trigger::Startup, cancel).await;
    }

    async fn check_parents(
        &self,
        dependencies: &DependencyMap,
        snapshot: &FleetSnapshot,
        trigger: Trigger,
        cancel: &CancellationToken,
    ) {
        for parent in dependencies.parent_names() {
            if cancel.is_cancelled() {
                return;
            }
            let Some(id) = snapshot.id_of(parent) else {
                continue;
            };

            let state = snapshot.state_of(parent).unwrap_or_default();
            if state != "running" {
                self.try_recover(parent, id, state, trigger, dependencies, snapshot, cancel)
                    .await;
                continue;
            }

            match self.gateway.inspect_health(id).await {
                Ok(inspection) if inspection.health == Health::Unhealthy => {
                    self.try_recover(parent, id, "unhealthy", trigger, dependencies, snapshot, cancel)
                        .await;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::debug!(parent, error = %e, "{}: inspect failed", trigger.as_str());
                }
            }
        }
    }

    /// Run the recovery flow if the parent is neither in flight nor cooling down
    #[allow(clippy::too_many_arguments)]
    async fn try_recover(
        &self,
        parent: &str,
        parent_id: &str,
        reason: &str,
        trigger: Trigger,
        dependencies: &DependencyMap,
        snapshot: &FleetSnapshot,
        cancel: &CancellationToken,
    ) -> Option<RecoveryOutcome> {
        let Some(_permit) = self.cooldown.acquire(parent) else {
            if self.cooldown.is_in_flight(parent) {
                tracing::debug!(parent, id_short = short_id(parent_id), "skipping recovery, already in flight");
            } else {
                tracing::debug!(parent, id_short = short_id(parent_id), "skipping recovery, in cooldown");
            }
            return None;
        };

        let reason = if reason.is_empty() { "unknown" } else { reason };
        tracing::info!(
            parent,
            reason,
            id_short = short_id(parent_id),
            trigger = trigger.as_str(),
            "recovery: attempting recovery for parent"
        );

        let outcome = self
            .flow
            .run(parent, parent_id, Some(dependencies), snapshot, cancel)
            .await;
        tracing::debug!(parent, outcome = outcome.as_str(), "recovery: attempt finished");
        Some(outcome)
    }

    /// Cascade to the dependents of parents replaced behind our back
    async fn proactive_restart(&self, dependencies: &DependencyMap, snapshot: &FleetSnapshot) {
        let replaced = self
            .last_known
            .detect(self.gateway.as_ref(), dependencies, snapshot)
            .await;

        for parent in replaced {
            tracing::info!(
                parent = %parent,
                id_short = snapshot.id_of(&parent).map(short_id).unwrap_or_default(),
                "recovery: parent has new id, proactively restarting dependents"
            );
            self.flow
                .restart_dependents(&parent, Some(dependencies), snapshot)
                .await;
        }
    }

    /// List all containers and drop unrestartable ids that no longer exist
    async fn snapshot(&self) -> Result<FleetSnapshot> {
        let containers = self.inventory.list_containers(true).await?;
        let snapshot = FleetSnapshot::from_containers(&containers);
        let unrestartable = self.flow.unrestartable();
        let pruned = unrestartable.prune(snapshot.live_ids());
        if pruned > 0 {
            tracing::debug!(
                pruned,
                remaining = unrestartable.len(),
                capacity = unrestartable.capacity(),
                "pruned unrestartable ids no longer present"
            );
        }
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::docker::ContainerInfo;
    use crate::sickbay::{DependentCooldown, UnrestartableSet};
    use crate::testing::{FakeDocker, ScriptedEvents, StaticDiscovery, Subscription};

    const WAIT: Duration = Duration::from_secs(60);

    fn fleet(vpn_state: &str) -> Arc<FakeDocker> {
        let docker = Arc::new(FakeDocker::new().with_default_health(Health::Healthy));
        docker.add_container(ContainerInfo::new("vpn-1", "vpn", vpn_state));
        docker.add_container(ContainerInfo::new("app-1", "app", "running"));
        docker.add_container(ContainerInfo::new("db-1", "db", "running"));
        docker.add_container(ContainerInfo::new("api-1", "api", "running"));
        docker
    }

    fn dependencies() -> DependencyMap {
        DependencyMap::new()
            .with_parent("vpn", ["app"])
            .with_parent("db", ["api"])
    }

    fn warden_with(docker: &Arc<FakeDocker>, discovery: Arc<StaticDiscovery>, wait: Duration) -> Warden {
        let flow = RecoveryFlow::new(
            docker.clone(),
            Arc::new(UnrestartableSet::default()),
            Arc::new(DependentCooldown::new(Duration::from_secs(90))),
        );
        Warden::new(
            docker.clone(),
            docker.clone(),
            discovery,
            flow,
            Duration::from_secs(120),
            DiscoveryGate::starting_now(wait),
        )
    }

    fn warden(docker: &Arc<FakeDocker>, wait: Duration) -> Warden {
        warden_with(docker, Arc::new(StaticDiscovery::new(dependencies())), wait)
    }

    fn die(id: &str, name: &str) -> LifecycleEvent {
        LifecycleEvent::new(id, name, "die")
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_dropped_during_discovery_phase() {
        let docker = fleet("running");
        let warden = warden(&docker, WAIT);
        let cancel = CancellationToken::new();

        assert!(warden.handle_event(&die("vpn-1", "vpn"), &cancel).await.is_none());
        tokio::time::advance(WAIT - Duration::from_millis(1)).await;
        assert!(warden.handle_event(&die("vpn-1", "vpn"), &cancel).await.is_none());
        assert!(docker.restarts().is_empty());

        tokio::time::advance(Duration::from_millis(2)).await;
        let outcome = warden.handle_event(&die("vpn-1", "vpn"), &cancel).await;
        assert!(matches!(outcome, Some(RecoveryOutcome::Recovered(_))));
        assert_eq!(docker.restarts(), vec!["vpn-1", "app-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_parent_event_ignored() {
        let docker = fleet("running");
        let warden = warden(&docker, Duration::ZERO);

        let outcome = warden
            .handle_event(&die("app-1", "app"), &CancellationToken::new())
            .await;
        assert!(outcome.is_none());
        assert!(docker.restarts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_events_recover_once() {
        let docker = fleet("running");
        let warden = warden(&docker, Duration::ZERO);
        let cancel = CancellationToken::new();

        let stop = LifecycleEvent::new("vpn-1", "vpn", "stop");
        assert!(warden.handle_event(&stop, &cancel).await.is_some());
        assert!(warden.handle_event(&die("vpn-1", "vpn"), &cancel).await.is_none());
        assert_eq!(docker.restarts(), vec!["vpn-1", "app-1"]);

        // Cooldown measured from the first start
        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(warden.handle_event(&die("vpn-1", "vpn"), &cancel).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_failure_skips_event() {
        let docker = fleet("running");
        let discovery = Arc::new(StaticDiscovery::new(dependencies()).failing_first(1));
        let warden = warden_with(&docker, discovery, Duration::ZERO);
        let cancel = CancellationToken::new();

        assert!(warden.handle_event(&die("vpn-1", "vpn"), &cancel).await.is_none());
        assert!(warden.handle_event(&die("vpn-1", "vpn"), &cancel).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_list_failure_skips_event() {
        let docker = fleet("running");
        docker.fail_list("daemon busy");
        let warden = warden(&docker, Duration::ZERO);

        let outcome = warden
            .handle_event(&die("vpn-1", "vpn"), &CancellationToken::new())
            .await;
        assert!(outcome.is_none());
        assert!(docker.restarts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_recovers_stopped_parent() {
        let docker = fleet("exited");
        let warden = warden(&docker, Duration::ZERO);

        warden.poll_once(&CancellationToken::new()).await;
        assert_eq!(docker.restarts(), vec!["vpn-1", "app-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_recovers_unhealthy_parent_only() {
        let docker = fleet("running");
        docker.script_health("db-1", [Health::Unhealthy, Health::Healthy]);
        let warden = warden(&docker, Duration::ZERO);

        warden.poll_once(&CancellationToken::new()).await;
        assert_eq!(docker.restarts(), vec!["db-1", "api-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_respects_gate() {
        let docker = fleet("exited");
        let warden = warden(&docker, WAIT);

        warden.poll_once(&CancellationToken::new()).await;
        assert!(docker.restarts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_proactive_cascade_on_replaced_parent() {
        let docker = fleet("running");
        let warden = warden(&docker, Duration::ZERO);
        let cancel = CancellationToken::new();

        warden.poll_once(&cancel).await;
        assert!(docker.restarts().is_empty());

        docker.replace_container("vpn", ContainerInfo::new("vpn-2", "vpn", "running"));
        warden.poll_once(&cancel).await;

        // Dependents only, the parent itself is left alone
        assert_eq!(docker.restarts(), vec!["app-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrestartable_pruned_when_container_disappears() {
        let docker = fleet("running");
        let warden = warden(&docker, Duration::ZERO);
        warden.flow.unrestartable().add("ghost-1", None);
        warden.flow.unrestartable().add("vpn-1", None);

        warden.poll_once(&CancellationToken::new()).await;
        assert!(!warden.flow.unrestartable().contains("ghost-1"));
        assert!(warden.flow.unrestartable().contains("vpn-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_reconciliation_retries_discovery() {
        let docker = fleet("exited");
        let discovery = Arc::new(StaticDiscovery::new(dependencies()).failing_first(2));
        let warden = warden_with(&docker, discovery.clone(), WAIT);
        let start = tokio::time::Instant::now();

        warden.run_startup(CancellationToken::new()).await;

        // Discovery wait, then 2s and 4s between the failed builds
        assert_eq!(start.elapsed(), WAIT + Duration::from_secs(2 + 4));
        assert_eq!(discovery.builds(), 3);
        assert_eq!(docker.restarts(), vec!["vpn-1", "app-1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_reconciliation_gives_up() {
        let docker = fleet("exited");
        let discovery = Arc::new(StaticDiscovery::new(dependencies()).failing_first(10));
        let warden = warden_with(&docker, discovery.clone(), Duration::ZERO);
        let start = tokio::time::Instant::now();

        warden.run_startup(CancellationToken::new()).await;

        // No sleep after the last attempt
        assert_eq!(start.elapsed(), Duration::from_secs(2 + 4 + 8 + 16));

        assert_eq!(discovery.builds(), RECONCILE_ATTEMPTS as usize);
        assert!(docker.restarts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_startup_cancelled_during_wait() {
        let docker = fleet("exited");
        let discovery = Arc::new(StaticDiscovery::new(dependencies()));
        let warden = warden_with(&docker, discovery.clone(), WAIT);
        let cancel = CancellationToken::new();
        cancel.cancel();

        warden.run_startup(cancel).await;
        assert_eq!(discovery.builds(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poller_first_tick_after_interval() {
        let docker = fleet("exited");
        let warden = Arc::new(warden(&docker, Duration::ZERO));
        let cancel = CancellationToken::new();

        let task = tokio::spawn({
            let warden = warden.clone();
            let cancel = cancel.clone();
            async move { warden.run_poller(cancel).await }
        });

        tokio::time::sleep(POLL_INTERVAL - Duration::from_secs(1)).await;
        assert!(docker.restarts().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(docker.restarts(), vec!["vpn-1", "app-1"]);

        cancel.cancel();
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_resubscribes_after_stream_closes() {
        let docker = fleet("running");
        let warden = warden(&docker, Duration::ZERO);
        let source = Arc::new(ScriptedEvents::new([
            Subscription {
                events: vec![die("vpn-1", "vpn")],
                stay_open: false,
            },
            Subscription {
                events: vec![die("db-1", "db")],
                stay_open: true,
            },
        ]));
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(600)).await;
            canceller.cancel();
        });

        warden.run(source.clone(), cancel).await;

        assert_eq!(source.subscriptions(), 2);
        assert_eq!(docker.restarts(), vec!["vpn-1", "app-1", "db-1", "api-1"]);
    }
}
