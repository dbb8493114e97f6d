//! Recovery flow: restart a parent, wait for it to turn healthy, then restart
//! its dependents one at a time.
//!
//! Each attempt is tracked with a `RecoveryMachine` (dynamic mode) so the
//! outcome can only be reached through legal transitions:
//!
//! ```text
//! Pending -> Skipped
//! Pending -> RestartingParent -> WaitingHealthy -> CascadingDependents -> Done
//!                  |                  |-> TimedOut
//!                  |                  |-> Cancelled
//!                  '------------------'-> Failed
//! ```

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use state_machines::state_machine;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::cooldown::DependentCooldown;
use super::triage::{Unrestartable, classify};
use super::unrestartable::UnrestartableSet;
use crate::discovery::{DependencyMap, FleetSnapshot};
use crate::docker::{Gateway, Health, short_id};
use crate::error::Error;
use crate::hooks::ParentGoneHook;

/// Default time a restarted parent gets to report healthy
pub const DEFAULT_HEALTHY_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Interval between health inspections while waiting
pub const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(2);

state_machine! {
    name: RecoveryMachine,
    dynamic: true,
    initial: Pending,
    states: [Pending, Skipped, RestartingParent, WaitingHealthy, CascadingDependents, Done, TimedOut, Failed, Cancelled],
    events {
        skip {
            transition: { from: Pending, to: Skipped }
        }
        restart {
            transition: { from: Pending, to: RestartingParent }
        }
        restarted {
            transition: { from: RestartingParent, to: WaitingHealthy }
        }
        healthy {
            transition: { from: WaitingHealthy, to: CascadingDependents }
        }
        timeout {
            transition: { from: WaitingHealthy, to: TimedOut }
        }
        fail {
            transition: { from: [RestartingParent, WaitingHealthy], to: Failed }
        }
        finish {
            transition: { from: CascadingDependents, to: Done }
        }
        abort {
            transition: { from: WaitingHealthy, to: Cancelled }
        }
    }
}

/// What happened to one dependent during a cascade
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CascadeReport {
    /// Dependents restarted, in order
    pub restarted: Vec<String>,
    /// Dependents skipped (unresolved, unrestartable or in cooldown)
    pub skipped: Vec<String>,
    /// Dependents whose restart failed
    pub failed: Vec<String>,
}

/// How a recovery attempt ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Parent id already known to be unrestartable; nothing was called
    Skipped,
    /// Parent healthy again and the cascade ran
    Recovered(CascadeReport),
    /// Parent never reported healthy; dependents untouched
    TimedOut,
    /// Restart or inspect failed; `Some` when the id is now memoized as unrestartable
    Failed(Option<Unrestartable>),
    /// Shutdown arrived while waiting for health
    Cancelled,
}

impl RecoveryOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryOutcome::Skipped => "skipped",
            RecoveryOutcome::Recovered(_) => "recovered",
            RecoveryOutcome::TimedOut => "timed_out",
            RecoveryOutcome::Failed(_) => "failed",
            RecoveryOutcome::Cancelled => "cancelled",
        }
    }
}

enum Wait {
    Healthy,
    TimedOut,
    Cancelled,
    Failed(Error),
}

/// Runs the restart -> wait -> cascade sequence against a `Gateway`
pub struct RecoveryFlow {
    gateway: Arc<dyn Gateway>,
    unrestartable: Arc<UnrestartableSet>,
    dependent_cooldown: Arc<DependentCooldown>,
    on_parent_gone: Option<Arc<dyn ParentGoneHook>>,
    healthy_timeout: Duration,
    poll_interval: Duration,
    self_name: Option<String>,
}

impl RecoveryFlow {
    pub fn new(
        gateway: Arc<dyn Gateway>,
        unrestartable: Arc<UnrestartableSet>,
        dependent_cooldown: Arc<DependentCooldown>,
    ) -> Self {
        Self {
            gateway,
            unrestartable,
            dependent_cooldown,
            on_parent_gone: None,
            healthy_timeout: DEFAULT_HEALTHY_TIMEOUT,
            poll_interval: HEALTH_POLL_INTERVAL,
            self_name: None,
        }
    }

    pub fn healthy_timeout(mut self, timeout: Duration) -> Self {
        if !timeout.is_zero() {
            self.healthy_timeout = timeout;
        }
        self
    }

    /// This process's own container name; restarted last in any cascade
    pub fn self_name(mut self, name: Option<String>) -> Self {
        self.self_name = name.filter(|n| !n.is_empty());
        self
    }

    pub fn on_parent_gone(mut self, hook: Arc<dyn ParentGoneHook>) -> Self {
        self.on_parent_gone = Some(hook);
        self
    }

    pub fn unrestartable(&self) -> &UnrestartableSet {
        &self.unrestartable
    }

    /// Run a full recovery for `parent` (container `parent_id`)
    ///
    /// `dependencies` of `None` means no cascade. `snapshot` resolves dependent
    /// names to ids and supplies the live ids used when memoizing failures.
    pub async fn run(
        &self,
        parent: &str,
        parent_id: &str,
        dependencies: Option<&DependencyMap>,
        snapshot: &FleetSnapshot,
        cancel: &CancellationToken,
    ) -> RecoveryOutcome {
        self.run_with_timeout(parent, parent_id, dependencies, snapshot, cancel, self.healthy_timeout)
            .await
    }

    pub async fn run_with_timeout(
        &self,
        parent: &str,
        parent_id: &str,
        dependencies: Option<&DependencyMap>,
        snapshot: &FleetSnapshot,
        cancel: &CancellationToken,
        healthy_timeout: Duration,
    ) -> RecoveryOutcome {
        let mut machine = RecoveryMachine::new(()).into_dynamic();

        if self.unrestartable.contains(parent_id) {
            advance(&mut machine, RecoveryMachineEvent::Skip);
            tracing::info!(
                parent,
                id_short = short_id(parent_id),
                "recovery: skipping parent, container unrestartable (will retry when a new instance appears)"
            );
            return RecoveryOutcome::Skipped;
        }

        advance(&mut machine, RecoveryMachineEvent::Restart);
        if let Err(e) = self.gateway.restart(parent_id).await {
            advance(&mut machine, RecoveryMachineEvent::Fail);
            let reason = self.memoize_failure(parent, parent_id, snapshot, &e);
            match reason {
                Some(reason) => tracing::error!(
                    parent,
                    id_short = short_id(parent_id),
                    reason = %reason,
                    error = %e,
                    "recovery: failed to restart parent, will not retry this container id"
                ),
                None => tracing::error!(parent, error = %e, "recovery: failed to restart parent"),
            }
            return RecoveryOutcome::Failed(reason);
        }

        advance(&mut machine, RecoveryMachineEvent::Restarted);
        tracing::info!(parent, "recovery: restarted parent, waiting for healthy");

        let timeout = if healthy_timeout.is_zero() {
            DEFAULT_HEALTHY_TIMEOUT
        } else {
            healthy_timeout
        };
        match self.wait_until_healthy(parent_id, timeout, cancel).await {
            Wait::Healthy => {}
            Wait::TimedOut => {
                advance(&mut machine, RecoveryMachineEvent::Timeout);
                tracing::warn!(
                    parent,
                    timeout_secs = timeout.as_secs(),
                    "recovery: parent did not become healthy in time; not restarting dependents"
                );
                return RecoveryOutcome::TimedOut;
            }
            Wait::Cancelled => {
                advance(&mut machine, RecoveryMachineEvent::Abort);
                tracing::info!(parent, "recovery: shutdown while waiting for parent health");
                return RecoveryOutcome::Cancelled;
            }
            Wait::Failed(e) => {
                advance(&mut machine, RecoveryMachineEvent::Fail);
                let reason = self.memoize_failure(parent, parent_id, snapshot, &e);
                match reason {
                    Some(reason) => tracing::error!(
                        parent,
                        id_short = short_id(parent_id),
                        reason = %reason,
                        error = %e,
                        "recovery: inspect failed, container unrestartable (will not retry this id)"
                    ),
                    None => tracing::error!(parent, error = %e, "recovery: inspect after restart failed"),
                }
                return RecoveryOutcome::Failed(reason);
            }
        }

        advance(&mut machine, RecoveryMachineEvent::Healthy);
        tracing::info!(parent, "recovery: parent healthy, restarting dependents");
        let report = self.restart_dependents(parent, dependencies, snapshot).await;
        advance(&mut machine, RecoveryMachineEvent::Finish);

        tracing::info!(
            parent,
            restarted = report.restarted.len(),
            skipped = report.skipped.len(),
            failed = report.failed.len(),
            state = machine.current_state(),
            "recovery: sequence complete"
        );
        RecoveryOutcome::Recovered(report)
    }

    /// Restart the dependents of `parent` in cascade order
    ///
    /// Also used on its own when a parent was replaced and is already healthy.
    pub async fn restart_dependents(
        &self,
        parent: &str,
        dependencies: Option<&DependencyMap>,
        snapshot: &FleetSnapshot,
    ) -> CascadeReport {
        let mut report = CascadeReport::default();
        let Some(dependencies) = dependencies else {
            tracing::debug!(parent, "no dependency map available, skipping restart of dependents");
            return report;
        };

        for dependent in cascade_order(dependencies.dependents(parent), self.self_name.as_deref()) {
            let Some(id) = snapshot.id_of(&dependent) else {
                tracing::warn!(
                    dependent = %dependent,
                    parent,
                    "recovery: no container id for dependent, skipping"
                );
                report.skipped.push(dependent);
                continue;
            };

            if self.unrestartable.contains(id) {
                tracing::info!(
                    dependent = %dependent,
                    parent,
                    id_short = short_id(id),
                    "recovery: skipping dependent, container unrestartable"
                );
                report.skipped.push(dependent);
                continue;
            }

            if !self.dependent_cooldown.try_claim(&dependent) {
                tracing::debug!(dependent = %dependent, parent, "skip dependent restart, within cooldown");
                report.skipped.push(dependent);
                continue;
            }

            match self.gateway.restart(id).await {
                Ok(()) => {
                    tracing::info!(dependent = %dependent, parent, "recovery: restarted dependent");
                    report.restarted.push(dependent);
                }
                Err(e) => {
                    match classify(&e) {
                        Some(reason) => {
                            self.unrestartable.add(id, Some(snapshot.live_ids()));
                            tracing::error!(
                                dependent = %dependent,
                                parent,
                                id_short = short_id(id),
                                reason = %reason,
                                error = %e,
                                "recovery: failed to restart dependent, will not retry this container id"
                            );
                        }
                        None => {
                            tracing::error!(dependent = %dependent, parent, error = %e, "recovery: failed to restart dependent");
                        }
                    }
                    self.dependent_cooldown.clear(&dependent);
                    report.failed.push(dependent);
                }
            }
        }

        report
    }

    /// Poll health until healthy, timeout, cancellation or an inspect error
    async fn wait_until_healthy(&self, id: &str, timeout: Duration, cancel: &CancellationToken) -> Wait {
        let deadline = Instant::now() + timeout;
        let mut ticker = tokio::time::interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            match self.gateway.inspect_health(id).await {
                Ok(inspection) if inspection.health == Health::Healthy => return Wait::Healthy,
                Ok(inspection) => {
                    tracing::debug!(id_short = short_id(id), health = %inspection.health, "waiting for healthy");
                }
                Err(e) => return Wait::Failed(e),
            }

            if Instant::now() >= deadline {
                return Wait::TimedOut;
            }

            tokio::select! {
                _ = cancel.cancelled() => return Wait::Cancelled,
                _ = tokio::time::sleep_until(deadline) => return Wait::TimedOut,
                _ = ticker.tick() => {}
            }
        }
    }

    /// Memoize a classified failure on the parent and fire the parent-gone hook
    fn memoize_failure(
        &self,
        parent: &str,
        parent_id: &str,
        snapshot: &FleetSnapshot,
        err: &Error,
    ) -> Option<Unrestartable> {
        let reason = classify(err)?;
        self.unrestartable.add(parent_id, Some(snapshot.live_ids()));
        if reason.parent_gone() {
            self.notify_parent_gone(parent);
        }
        Some(reason)
    }

    fn notify_parent_gone(&self, parent: &str) {
        let Some(hook) = &self.on_parent_gone else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| hook.parent_gone(parent))).is_err() {
            tracing::error!(parent, "parent-gone hook panicked");
        }
    }
}

/// Sorted, de-duplicated dependents with `self_name` moved to the end
pub fn cascade_order(dependents: &[String], self_name: Option<&str>) -> Vec<String> {
    let mut ordered = dependents.to_vec();
    ordered.sort();
    ordered.dedup();
    if let Some(pos) = self_name.and_then(|me| ordered.iter().position(|d| d == me)) {
        let own = ordered.remove(pos);
        ordered.push(own);
    }
    ordered
}

fn advance(machine: &mut DynamicRecoveryMachine<()>, event: RecoveryMachineEvent) {
    if machine.handle(event).is_err() {
        tracing::debug!(state = machine.current_state(), "recovery: unexpected transition");
    }
}
