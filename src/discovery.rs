//! Parent/dependent discovery
//!
//! Provides:
//! - `DependencyMap`, the parent container name -> dependent container names snapshot
//! - `FleetSnapshot`, one listing of live containers (name -> id/state, live ids)
//! - `DependencyMapProvider`, rebuilt fresh on every call
//! - Compose-file based discovery (see `compose`)

pub mod compose;

pub use compose::ComposeDiscovery;

use crate::docker::ContainerInfo;
use crate::error::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Parent container name -> dependent container names
///
/// Keys whose dependent list is empty are not parents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct DependencyMap {
    parents: BTreeMap<String, Vec<String>>,
}

impl DependencyMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append dependents to a parent's list
    pub fn extend<I, S>(&mut self, parent: impl Into<String>, dependents: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.parents
            .entry(parent.into())
            .or_default()
            .extend(dependents.into_iter().map(Into::into));
    }

    /// Dependents of a parent (empty if unknown)
    pub fn dependents(&self, parent: &str) -> &[String] {
        self.parents.get(parent).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Check if a container name is a parent (has at least one dependent)
    pub fn is_parent(&self, name: &str) -> bool {
        !self.dependents(name).is_empty()
    }

    /// Parent names in sorted order
    pub fn parent_names(&self) -> Vec<&str> {
        self.parents
            .iter()
            .filter(|(_, deps)| !deps.is_empty())
            .map(|(name, _)| name.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.parent_names().is_empty()
    }
}

#[cfg(test)]
impl DependencyMap {
    /// Add dependents for a parent (builder style)
    pub fn with_parent<I, S>(mut self, parent: impl Into<String>, dependents: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extend(parent, dependents);
        self
    }
}

/// Builds a dependency map on demand
#[async_trait]
pub trait DependencyMapProvider: Send + Sync {
    async fn build_dependency_map(&self) -> Result<DependencyMap>;
}

/// One listing of containers, indexed for recovery lookups
#[derive(Debug, Clone, Default)]
pub struct FleetSnapshot {
    ids: HashMap<String, String>,
    states: HashMap<String, String>,
    live: HashSet<String>,
}

impl FleetSnapshot {
    pub fn from_containers(containers: &[ContainerInfo]) -> Self {
        let mut snapshot = Self::default();
        for c in containers {
            snapshot.ids.insert(c.name.clone(), c.id.clone());
            snapshot.states.insert(c.name.clone(), c.state.clone());
            snapshot.live.insert(c.id.clone());
        }
        snapshot
    }

    /// Container id currently carrying this name
    pub fn id_of(&self, name: &str) -> Option<&str> {
        self.ids.get(name).map(String::as_str)
    }

    /// Lifecycle state of the named container
    pub fn state_of(&self, name: &str) -> Option<&str> {
        self.states.get(name).map(String::as_str)
    }

    /// Every container id in the listing
    pub fn live_ids(&self) -> &HashSet<String> {
        &self.live
    }
}
