//! Parent-gone notification
//!
//! Provides:
//! - The `ParentGoneHook` strategy invoked when a parent container is gone for good
//! - `ComposeRecreate`, which asks compose to bring the parent's service back up
//!
//! Hooks run on their own; nothing they do flows back into recovery state.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::task::TaskTracker;

/// Maximum time for a single `compose up` run
const COMPOSE_UP_TIMEOUT: Duration = Duration::from_secs(60);

/// Exit code docker uses when a subcommand or plugin is unavailable
const DOCKER_USAGE_EXIT: i32 = 125;

/// Called with the parent's container name when its container is gone or marked for removal
pub trait ParentGoneHook: Send + Sync {
    fn parent_gone(&self, parent: &str);
}

/// Output of one compose invocation
#[derive(Debug)]
struct ComposeRun {
    success: bool,
    code: Option<i32>,
    output: String,
}

/// Recreates a vanished parent with `docker compose up -d <service>`
///
/// Runs are tracked so shutdown can wait for them (see `drain`).
#[derive(Debug, Clone)]
pub struct ComposeRecreate {
    compose_path: PathBuf,
    /// container_name -> service name
    services: HashMap<String, String>,
    timeout: Duration,
    docker: String,
    runtime: tokio::runtime::Handle,
    tasks: TaskTracker,
}

impl ComposeRecreate {
    /// Create a recreate hook; must be called from within a tokio runtime
    pub fn new(compose_path: PathBuf, services: HashMap<String, String>) -> Self {
        Self {
            compose_path,
            services,
            timeout: COMPOSE_UP_TIMEOUT,
            docker: "docker".to_string(),
            runtime: tokio::runtime::Handle::current(),
            tasks: TaskTracker::new(),
        }
    }

    /// Recreate runs still in progress
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Stop accepting runs and wait up to `grace` for the ones in progress
    ///
    /// Runs still going after `grace` are killed with the runtime.
    pub async fn drain(&self, grace: Duration) {
        self.tasks.close();
        let pending = self.pending();
        if pending == 0 {
            return;
        }
        tracing::info!(pending, "auto-recreate: waiting for compose runs to finish");
        if tokio::time::timeout(grace, self.tasks.wait()).await.is_err() {
            tracing::warn!(
                pending = self.pending(),
                grace_secs = grace.as_secs(),
                "auto-recreate: abandoning compose runs still in progress at shutdown"
            );
        }
    }

    /// Compose service for a container name (the name itself when no container_name maps it)
    pub fn service_for<'a>(&'a self, parent: &'a str) -> &'a str {
        self.services
            .get(parent)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
            .unwrap_or(parent)
    }

    /// Directory compose runs in: the compose file's directory, else the cwd
    pub fn working_dir(&self) -> PathBuf {
        match self.compose_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() && dir != Path::new(".") => dir.to_path_buf(),
            _ => std::env::current_dir().unwrap_or_else(|e| {
                tracing::warn!(
                    compose_path = %self.compose_path.display(),
                    error = %e,
                    "auto-recreate: could not get working directory, using \".\""
                );
                PathBuf::from(".")
            }),
        }
    }

    /// Arguments for `docker compose` (v2 plugin)
    pub fn compose_v2_args(&self, service: &str) -> Vec<String> {
        vec![
            "compose".to_string(),
            "-f".to_string(),
            self.compose_path.display().to_string(),
            "up".to_string(),
            "-d".to_string(),
            service.to_string(),
        ]
    }

    /// Arguments for standalone `docker-compose` (v1)
    pub fn compose_v1_args(&self, service: &str) -> Vec<String> {
        vec![
            "-f".to_string(),
            self.compose_path.display().to_string(),
            "up".to_string(),
            "-d".to_string(),
            service.to_string(),
        ]
    }

    async fn recreate(&self, parent: &str) {
        let service = self.service_for(parent);
        let dir = self.working_dir();

        tracing::info!(
            parent,
            service,
            compose_path = %self.compose_path.display(),
            "auto-recreate: triggering docker compose up for parent (monitor will re-discover on next cycle)"
        );

        let v2 = run_compose(&self.docker, &self.compose_v2_args(service), &dir, self.timeout).await;
        let (program, result) = match v2 {
            Ok(run) if !run.success && should_fallback_to_v1(run.code, &run.output) => {
                tracing::info!(parent, service, "auto-recreate: docker compose unavailable, trying docker-compose");
                (
                    "docker-compose",
                    run_compose("docker-compose", &self.compose_v1_args(service), &dir, self.timeout).await,
                )
            }
            other => ("docker compose", other),
        };

        match result {
            Ok(run) if run.success => {
                tracing::info!(parent, service, dir = %dir.display(), output = %run.output.trim(), "auto-recreate: {} up succeeded", program);
            }
            Ok(run) => {
                tracing::error!(parent, service, dir = %dir.display(), code = ?run.code, output = %run.output.trim(), "auto-recreate: {} up failed", program);
            }
            Err(e) => {
                tracing::error!(parent, service, dir = %dir.display(), error = %e, "auto-recreate: {} up failed", program);
            }
        }
    }
}

impl ParentGoneHook for ComposeRecreate {
    fn parent_gone(&self, parent: &str) {
        if self.tasks.is_closed() {
            tracing::warn!(parent, "auto-recreate: shutting down, not recreating parent");
            return;
        }
        let hook = self.clone();
        let parent = parent.to_string();
        self.tasks.spawn_on(
            async move {
                hook.recreate(&parent).await;
            },
            &self.runtime,
        );
    }
}

/// Decide whether a failed `docker compose` means the v2 plugin is missing
///
/// Docker exits 125 for a missing plugin as well as for other CLI errors, so
/// the output must also look like a usage error.
pub fn should_fallback_to_v1(code: Option<i32>, output: &str) -> bool {
    code == Some(DOCKER_USAGE_EXIT)
        && (output.contains("unknown shorthand flag")
            || output.contains("Usage:")
            || output.contains("is not a docker command"))
}

async fn run_compose(program: &str, args: &[String], dir: &Path, timeout: Duration) -> Result<ComposeRun> {
    let command_line = format!("{} {}", program, args.join(" "));

    let child = Command::new(program)
        .args(args)
        .current_dir(dir)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = tokio::time::timeout(timeout, child)
        .await
        .map_err(|_| Error::HookTimeout(timeout.as_secs()))?
        .map_err(|e| Error::HookFailed {
            command: command_line,
            message: e.to_string(),
        })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));

    Ok(ComposeRun {
        success: output.status.success(),
        code: output.status.code(),
        output: combined,
    })
}
