//! Proactive restart detection
//!
//! Remembers the container id last seen for each parent name. When a parent
//! turns up under a new id and is already healthy, something outside the
//! watchdog replaced it, and its dependents still hold the old one.

use crate::discovery::{DependencyMap, FleetSnapshot};
use crate::docker::{Gateway, Health};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
pub struct LastKnownParents {
    ids: Mutex<HashMap<String, String>>,
}

impl LastKnownParents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parents replaced by a healthy new instance since the last call
    ///
    /// First sightings are only recorded. A new id that is not healthy yet is
    /// left for a later pass.
    pub async fn detect(
        &self,
        gateway: &dyn Gateway,
        dependencies: &DependencyMap,
        snapshot: &FleetSnapshot,
    ) -> Vec<String> {
        let mut replaced = Vec::new();

        for parent in dependencies.parent_names() {
            let Some(current) = snapshot.id_of(parent) else {
                continue;
            };

            let previous = {
                let mut ids = self.lock();
                match ids.get(parent) {
                    None => {
                        ids.insert(parent.to_string(), current.to_string());
                        continue;
                    }
                    Some(last) if last == current => continue,
                    Some(last) => last.clone(),
                }
            };

            let healthy = matches!(
                gateway.inspect_health(current).await,
                Ok(inspection) if inspection.health == Health::Healthy
            );

            // Another task may have handled this replacement while we inspected
            let mut ids = self.lock();
            if healthy && ids.get(parent) == Some(&previous) {
                ids.insert(parent.to_string(), current.to_string());
                replaced.push(parent.to_string());
            }
        }

        replaced
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.ids.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
impl LastKnownParents {
    pub fn get(&self, parent: &str) -> Option<String> {
        self.lock().get(parent).cloned()
    }
}
