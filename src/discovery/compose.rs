//! Compose-file discovery
//!
//! Reads root-level `depends_on` from a compose file, builds a service graph,
//! then maps services onto live containers through the
//! `com.docker.compose.service` label. The result is keyed by container name.

use super::{DependencyMap, DependencyMapProvider};
use crate::docker::Inventory;
use crate::error::{Error, Result};
use async_trait::async_trait;
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Label compose puts on every container it creates
pub const LABEL_COMPOSE_SERVICE: &str = "com.docker.compose.service";

/// The parts of a compose file discovery reads
#[derive(Debug, Default, Deserialize)]
pub struct ComposeFile {
    #[serde(default)]
    pub services: BTreeMap<String, ComposeService>,
}

/// A single compose service
#[derive(Debug, Default, Deserialize)]
pub struct ComposeService {
    /// Short form (list) or long form (mapping)
    #[serde(default)]
    pub depends_on: Option<DependsOn>,

    #[serde(default)]
    pub container_name: Option<String>,
}

/// `depends_on` in either compose syntax
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum DependsOn {
    Short(Vec<String>),
    Long(BTreeMap<String, serde_yaml::Value>),
}

impl DependsOn {
    /// Parent service names, trimmed, without blanks or duplicates
    pub fn parents(&self) -> Vec<String> {
        let names: Vec<&str> = match self {
            DependsOn::Short(list) => list.iter().map(String::as_str).collect(),
            DependsOn::Long(map) => map.keys().map(String::as_str).collect(),
        };

        let mut seen = HashSet::new();
        names
            .into_iter()
            .map(str::trim)
            .filter(|n| !n.is_empty() && seen.insert(*n))
            .map(str::to_string)
            .collect()
    }
}

impl ComposeFile {
    /// Load and parse a compose file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::ComposeRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::parse(&content).map_err(|e| Error::ComposeParse {
            path: path.to_path_buf(),
            source: e,
        })
    }

    pub fn parse(content: &str) -> std::result::Result<Self, serde_yaml::Error> {
        // An empty document deserializes to unit, not to an empty mapping
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }

    /// Container name -> service name for every service that sets `container_name`
    pub fn container_services(&self) -> Result<HashMap<String, String>> {
        let mut out: HashMap<String, String> = HashMap::new();
        for (service, def) in &self.services {
            let Some(container) = def.container_name.as_deref().map(str::trim) else {
                continue;
            };
            if container.is_empty() {
                continue;
            }
            if let Some(existing) = out.get(container) {
                return Err(Error::DuplicateContainerName {
                    container: container.to_string(),
                    first: existing.clone(),
                    second: service.clone(),
                });
            }
            out.insert(container.to_string(), service.clone());
        }
        Ok(out)
    }
}

/// Service-level dependency graph (edge parent -> dependent)
pub struct ServiceGraph {
    graph: DiGraph<String, ()>,
    nodes: HashMap<String, NodeIndex>,
}

impl ServiceGraph {
    pub fn from_compose(file: &ComposeFile) -> Self {
        let mut graph = DiGraph::new();
        let mut nodes = HashMap::new();

        for name in file.services.keys() {
            let idx = graph.add_node(name.clone());
            nodes.insert(name.clone(), idx);
        }

        for (dependent, def) in &file.services {
            let Some(depends_on) = &def.depends_on else {
                continue;
            };
            let to = nodes[dependent];
            for parent in depends_on.parents() {
                // Parents must be defined as services
                if let Some(&from) = nodes.get(&parent) {
                    graph.add_edge(from, to, ());
                }
            }
        }

        Self { graph, nodes }
    }

    /// Services that declare a dependency on `service`, sorted
    pub fn dependents_of(&self, service: &str) -> Vec<&str> {
        let Some(&idx) = self.nodes.get(service) else {
            return Vec::new();
        };
        let mut out: Vec<&str> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .map(|n| self.graph[n].as_str())
            .collect();
        out.sort_unstable();
        out.dedup();
        out
    }

    /// Services with at least one dependent, sorted
    pub fn parents(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self
            .nodes
            .iter()
            .filter(|(_, idx)| {
                self.graph
                    .neighbors_directed(**idx, Direction::Outgoing)
                    .next()
                    .is_some()
            })
            .map(|(name, _)| name.as_str())
            .collect();
        out.sort_unstable();
        out
    }
}

/// Map service-level dependencies onto container names using compose labels
pub fn resolve_containers(
    graph: &ServiceGraph,
    containers: &[crate::docker::ContainerInfo],
) -> DependencyMap {
    // One service can have several replicas
    let mut by_service: HashMap<&str, Vec<&str>> = HashMap::new();
    for c in containers {
        if let Some(service) = c.labels.get(LABEL_COMPOSE_SERVICE).filter(|s| !s.is_empty()) {
            by_service.entry(service.as_str()).or_default().push(c.name.as_str());
        }
    }

    let mut map = DependencyMap::new();
    for parent in graph.parents() {
        let Some(parent_containers) = by_service.get(parent) else {
            continue;
        };
        let dependent_containers: Vec<&str> = graph
            .dependents_of(parent)
            .into_iter()
            .filter_map(|svc| by_service.get(svc))
            .flatten()
            .copied()
            .collect();
        if dependent_containers.is_empty() {
            continue;
        }
        for parent_container in parent_containers {
            map.extend(*parent_container, dependent_containers.iter().copied());
        }
    }
    map
}

/// Dependency map provider backed by a compose file and the container inventory
pub struct ComposeDiscovery {
    path: Option<PathBuf>,
    inventory: Arc<dyn Inventory>,
}

impl ComposeDiscovery {
    pub fn new(path: Option<PathBuf>, inventory: Arc<dyn Inventory>) -> Self {
        Self { path, inventory }
    }
}

#[async_trait]
impl DependencyMapProvider for ComposeDiscovery {
    async fn build_dependency_map(&self) -> Result<DependencyMap> {
        let Some(path) = &self.path else {
            return Ok(DependencyMap::new());
        };

        let file = ComposeFile::load(path)?;
        let graph = ServiceGraph::from_compose(&file);
        if graph.parents().is_empty() {
            return Ok(DependencyMap::new());
        }

        // Include stopped containers so a stopped parent is still seen
        let containers = self.inventory.list_containers(true).await?;
        Ok(resolve_containers(&graph, &containers))
    }
}
