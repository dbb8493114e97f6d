//! Docker Engine access
//!
//! Provides:
//! - The `Gateway`, `Inventory` and `EventSource` seams the recovery engine talks through
//! - `DockerClient`, the bollard-backed implementation of all three
//! - Minimal container and health types shared with discovery

pub mod events;

pub use events::{EventSource, LifecycleEvent};

use crate::error::Result;
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{InspectContainerOptions, ListContainersOptions, RestartContainerOptions};
use bollard::models::{ContainerSummary, HealthStatusEnum};
use std::collections::HashMap;

/// Seconds Docker waits for a container to stop before killing it on restart
const RESTART_STOP_TIMEOUT: isize = 10;

/// Shorten a container id for logging
pub fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

/// Health reported by a container's healthcheck
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Health {
    /// No healthcheck configured
    #[default]
    None,
    Starting,
    Healthy,
    Unhealthy,
}

impl std::fmt::Display for Health {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Health::None => write!(f, ""),
            Health::Starting => write!(f, "starting"),
            Health::Healthy => write!(f, "healthy"),
            Health::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Result of inspecting one container
#[derive(Debug, Clone, Default)]
pub struct Inspection {
    pub health: Health,
    /// Container labels, carried for callers that resolve compose metadata from an inspect
    #[allow(dead_code)]
    pub labels: HashMap<String, String>,
}

/// Minimal container data used for discovery and snapshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Daemon-assigned container id
    pub id: String,
    /// Container name without the leading slash
    pub name: String,
    pub labels: HashMap<String, String>,
    /// Lifecycle state ("running", "exited", ...)
    pub state: String,
}

impl ContainerInfo {
    /// Convert a daemon listing entry; entries without a name are dropped
    fn from_summary(summary: ContainerSummary) -> Option<Self> {
        let name = summary.names.as_ref()?.first()?.trim_start_matches('/').to_string();
        Some(Self {
            id: summary.id.unwrap_or_default(),
            name,
            labels: summary.labels.unwrap_or_default(),
            state: summary.state.unwrap_or_default(),
        })
    }
}

#[cfg(test)]
impl ContainerInfo {
    pub fn new(id: impl Into<String>, name: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            labels: HashMap::new(),
            state: state.into(),
        }
    }

    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Restart and health inspection, the only calls recovery makes against a container
#[async_trait]
pub trait Gateway: Send + Sync {
    /// Restart a container (safe on an already-running container)
    async fn restart(&self, id: &str) -> Result<()>;

    /// Fetch the current health of a container
    async fn inspect_health(&self, id: &str) -> Result<Inspection>;
}

/// Listing of known containers
#[async_trait]
pub trait Inventory: Send + Sync {
    async fn list_containers(&self, include_stopped: bool) -> Result<Vec<ContainerInfo>>;
}

/// Docker Engine client
#[derive(Debug, Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connect using local defaults (honours DOCKER_HOST) and verify the daemon answers
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        docker.ping().await?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl Gateway for DockerClient {
    async fn restart(&self, id: &str) -> Result<()> {
        let options = RestartContainerOptions {
            t: RESTART_STOP_TIMEOUT,
        };
        self.docker.restart_container(id, Some(options)).await?;
        Ok(())
    }

    async fn inspect_health(&self, id: &str) -> Result<Inspection> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;

        let health = info
            .state
            .as_ref()
            .and_then(|s| s.health.as_ref())
            .and_then(|h| h.status.as_ref())
            .map(health_from_status)
            .unwrap_or_default();
        let labels = info
            .config
            .and_then(|c| c.labels)
            .unwrap_or_default();

        Ok(Inspection { health, labels })
    }
}

#[async_trait]
impl Inventory for DockerClient {
    async fn list_containers(&self, include_stopped: bool) -> Result<Vec<ContainerInfo>> {
        let options = ListContainersOptions::<String> {
            all: include_stopped,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(options)).await?;

        Ok(containers
            .into_iter()
            .filter_map(ContainerInfo::from_summary)
            .collect())
    }
}

fn health_from_status(status: &HealthStatusEnum) -> Health {
    match status {
        HealthStatusEnum::STARTING => Health::Starting,
        HealthStatusEnum::HEALTHY => Health::Healthy,
        HealthStatusEnum::UNHEALTHY => Health::Unhealthy,
        _ => Health::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_id() {
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
        assert_eq!(short_id("abc"), "abc");
    }

    #[test]
    fn test_health_from_docker_enum() {
        assert_eq!(health_from_status(&HealthStatusEnum::HEALTHY), Health::Healthy);
        assert_eq!(health_from_status(&HealthStatusEnum::UNHEALTHY), Health::Unhealthy);
        assert_eq!(health_from_status(&HealthStatusEnum::STARTING), Health::Starting);
        assert_eq!(health_from_status(&HealthStatusEnum::NONE), Health::None);
        assert_eq!(health_from_status(&HealthStatusEnum::EMPTY), Health::None);
    }

    #[test]
    fn test_container_from_summary_keeps_state() {
        let summary = ContainerSummary {
            id: Some("0123456789abcdef".to_string()),
            names: Some(vec!["/gluetun".to_string()]),
            state: Some("running".to_string()),
            ..Default::default()
        };
        let info = ContainerInfo::from_summary(summary).unwrap();
        assert_eq!(info.name, "gluetun");
        assert_eq!(info.state, "running");
        assert!(info.is_running());

        let exited = ContainerSummary {
            id: Some("fedcba".to_string()),
            names: Some(vec!["/app".to_string()]),
            state: Some("exited".to_string()),
            ..Default::default()
        };
        assert_eq!(ContainerInfo::from_summary(exited).unwrap().state, "exited");
    }

    #[test]
    fn test_container_from_summary_without_name() {
        let summary = ContainerSummary {
            id: Some("abc".to_string()),
            names: Some(Vec::new()),
            ..Default::default()
        };
        assert!(ContainerInfo::from_summary(summary).is_none());
    }

    #[test]
    fn test_container_info_running() {
        let running = ContainerInfo::new("abc", "vpn", "running");
        let exited = ContainerInfo::new("def", "app", "exited").label("com.docker.compose.service", "app");
        assert!(running.is_running());
        assert!(!exited.is_running());
        assert_eq!(exited.labels["com.docker.compose.service"], "app");
    }
}
