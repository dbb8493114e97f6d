//! Container lifecycle event subscription
//!
//! Forwards the Docker events that can break a dependency chain (a container
//! turning unhealthy, exiting, stopping or being removed) onto a channel.
//! The channel closes when the subscription ends for any reason.

use super::DockerClient;
use bollard::models::{EventMessage, EventMessageTypeEnum};
use bollard::system::EventsOptions;
use futures::StreamExt;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Buffered events between the reader task and the warden
const EVENT_BUFFER: usize = 8;

/// Event actions that trigger recovery
pub const RECOVERY_ACTIONS: &[&str] = &["health_status: unhealthy", "die", "stop", "destroy"];

/// A lifecycle change on one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub id: String,
    /// Container name, or the id when the daemon did not report one
    pub name: String,
    /// Docker action, e.g. "die" or "health_status: unhealthy"
    pub action: String,
}

#[cfg(test)]
impl LifecycleEvent {
    pub fn new(id: impl Into<String>, name: impl Into<String>, action: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            action: action.into(),
        }
    }
}

/// Source of lifecycle events
pub trait EventSource: Send + Sync {
    /// Start a subscription; the receiver closes when `cancel` fires or the stream ends
    fn subscribe(&self, cancel: CancellationToken) -> mpsc::Receiver<LifecycleEvent>;
}

/// Check if an action should trigger recovery
pub fn is_recovery_action(action: &str) -> bool {
    RECOVERY_ACTIONS.contains(&action)
}

/// Convert a daemon event message into a lifecycle event, if it is one we act on
pub fn lifecycle_event(message: EventMessage) -> Option<LifecycleEvent> {
    if message.typ != Some(EventMessageTypeEnum::CONTAINER) {
        return None;
    }

    let action = message.action?;
    if !is_recovery_action(&action) {
        return None;
    }

    let actor = message.actor?;
    let id = actor.id?;
    let name = actor
        .attributes
        .and_then(|mut attrs| attrs.remove("name"))
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| id.clone());

    Some(LifecycleEvent { id, name, action })
}

fn recovery_filters() -> HashMap<String, Vec<String>> {
    let mut filters = HashMap::new();
    filters.insert("type".to_string(), vec!["container".to_string()]);
    filters.insert(
        "event".to_string(),
        ["health_status", "die", "stop", "destroy"]
            .iter()
            .map(|e| e.to_string())
            .collect(),
    );
    filters
}

impl EventSource for DockerClient {
    fn subscribe(&self, cancel: CancellationToken) -> mpsc::Receiver<LifecycleEvent> {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let docker = self.docker.clone();

        tokio::spawn(async move {
            let options = EventsOptions::<String> {
                filters: recovery_filters(),
                ..Default::default()
            };
            let mut stream = Box::pin(docker.events(Some(options)));

            loop {
                let message = tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = stream.next() => next,
                };

                let event = match message {
                    Some(Ok(message)) => lifecycle_event(message),
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "docker events");
                        break;
                    }
                    None => break,
                };

                if let Some(event) = event {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        sent = tx.send(event) => {
                            if sent.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            // Dropping tx closes the channel
        });

        rx
    }
}
