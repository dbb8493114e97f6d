//! Lookout - dependency-aware container recovery
//!
//! Watches "parent" containers (the ones others share a network namespace
//! with through `network_mode: service:<parent>`) and, once a parent has been
//! restarted and is healthy again, restarts its dependents so they reattach.

mod cli;
mod discovery;
mod docker;
mod duration;
mod error;
mod hooks;
mod logging;
mod manifest;
mod sickbay;
mod warden;

#[cfg(test)]
mod testing;

use cli::{Cli, Commands};
use discovery::compose::ComposeFile;
use discovery::{ComposeDiscovery, DependencyMap, DependencyMapProvider};
use docker::{DockerClient, Gateway};
use duration::format_duration;
use error::Result;
use hooks::ComposeRecreate;
use manifest::{LookoutConfig, Settings};
use sickbay::{DependentCooldown, RecoveryFlow, UnrestartableSet};
use warden::{DiscoveryGate, Warden};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long shutdown waits for auto-recreate runs in progress
const RECREATE_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse_args();

    if let Commands::Completion { shell } = cli.action() {
        Cli::generate_completion(*shell);
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    let settings = Settings::from_env(&config);
    logging::init(settings.log_level, settings.log_format, cli.verbose);
    // Resolve again so invalid environment values get logged
    let settings = Settings::from_env(&config);

    let rt = tokio::runtime::Runtime::new()?;
    match cli.action() {
        Commands::Check { json } => rt.block_on(check(&settings, *json)),
        Commands::Watch | Commands::Completion { .. } => rt.block_on(watch(settings)),
    }
}

/// Explicit `--config`, else `lookout.toml` in the working directory if present
fn load_config(path: Option<&Path>) -> Result<LookoutConfig> {
    if let Some(path) = path {
        return manifest::load(path);
    }
    let default = Path::new(manifest::DEFAULT_CONFIG_FILE);
    if default.exists() {
        manifest::load(default)
    } else {
        Ok(LookoutConfig::default())
    }
}

/// Run the watchdog until SIGINT/SIGTERM
async fn watch(settings: Settings) -> Result<()> {
    settings.warn_unset();

    let client = DockerClient::connect().await?;
    tracing::info!("connected to docker daemon");

    let discovery = Arc::new(ComposeDiscovery::new(
        settings.compose_path.clone(),
        Arc::new(client.clone()),
    ));
    let dependencies = discovery.build_dependency_map().await?;
    log_dependencies(&dependencies);

    let gateway: Arc<dyn Gateway> = Arc::new(client.clone());
    let mut flow = RecoveryFlow::new(
        gateway.clone(),
        Arc::new(UnrestartableSet::new(settings.unrestartable_capacity)),
        Arc::new(DependentCooldown::new(settings.dependent_restart_cooldown)),
    )
    .healthy_timeout(settings.healthy_timeout)
    .self_name(settings.self_name.clone());
    let recreate = recreate_hook(&settings);
    if let Some(hook) = &recreate {
        flow = flow.on_parent_gone(hook.clone());
    }

    let gate = DiscoveryGate::starting_now(settings.initial_discovery_wait);
    tracing::info!(
        wait = %format_duration(settings.initial_discovery_wait),
        recovery_cooldown = %format_duration(settings.recovery_cooldown),
        healthy_timeout = %format_duration(settings.healthy_timeout),
        "initial discovery phase started, recovery disabled until it ends"
    );

    let warden = Arc::new(Warden::new(
        Arc::new(client.clone()),
        gateway,
        discovery,
        flow,
        settings.recovery_cooldown,
        gate,
    ));

    let cancel = CancellationToken::new();
    let signals = tokio::spawn(shutdown_signal(cancel.clone()));
    let startup = tokio::spawn({
        let warden = Arc::clone(&warden);
        let cancel = cancel.clone();
        async move { warden.run_startup(cancel).await }
    });
    let poller = tokio::spawn({
        let warden = Arc::clone(&warden);
        let cancel = cancel.clone();
        async move { warden.run_poller(cancel).await }
    });

    warden.run(Arc::new(client), cancel.clone()).await;
    tracing::info!("shutting down");

    for task in [startup, poller, signals] {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "background task failed");
        }
    }
    if let Some(hook) = recreate {
        hook.drain(RECREATE_SHUTDOWN_GRACE).await;
    }
    Ok(())
}

/// Build the dependency map once and print it
async fn check(settings: &Settings, json: bool) -> Result<()> {
    let client = DockerClient::connect().await?;
    let discovery = ComposeDiscovery::new(settings.compose_path.clone(), Arc::new(client));
    let dependencies = discovery.build_dependency_map().await?;

    if json {
        let report = serde_json::json!({
            "settings": settings,
            "dependencies": dependencies,
        });
        let rendered = serde_json::to_string_pretty(&report).map_err(std::io::Error::from)?;
        println!("{}", rendered);
        return Ok(());
    }

    match &settings.compose_path {
        Some(path) => println!("Compose file: {}", path.display()),
        None => println!("Compose file: (none)"),
    }
    println!();
    if dependencies.is_empty() {
        println!("No parents found");
    } else {
        println!("{:<30} DEPENDENTS", "PARENT");
        for parent in dependencies.parent_names() {
            println!("{:<30} {}", parent, dependencies.dependents(parent).join(", "));
        }
    }

    println!();
    println!("Settings:");
    println!("  recovery_cooldown:          {}", format_duration(settings.recovery_cooldown));
    println!("  initial_discovery_wait:     {}", format_duration(settings.initial_discovery_wait));
    println!("  dependent_restart_cooldown: {}", format_duration(settings.dependent_restart_cooldown));
    println!("  healthy_timeout:            {}", format_duration(settings.healthy_timeout));
    println!("  unrestartable_capacity:     {}", settings.unrestartable_capacity);
    println!("  self_name:                  {}", settings.self_name.as_deref().unwrap_or("(unset)"));
    println!("  auto_recreate:              {}", settings.auto_recreate);
    Ok(())
}

fn log_dependencies(dependencies: &DependencyMap) {
    if dependencies.is_empty() {
        tracing::warn!("no parents discovered; nothing to watch until the compose file declares dependencies");
        return;
    }
    for parent in dependencies.parent_names() {
        tracing::info!(
            parent,
            dependents = %dependencies.dependents(parent).join(", "),
            "watching parent"
        );
    }
}

/// Compose auto-recreate, when enabled and a compose file is configured
fn recreate_hook(settings: &Settings) -> Option<Arc<ComposeRecreate>> {
    if !settings.auto_recreate {
        return None;
    }
    let path = settings.compose_path.as_ref()?;

    let services = match ComposeFile::load(path).and_then(|file| file.container_services()) {
        Ok(services) => services,
        Err(e) => {
            tracing::warn!(error = %e, "auto-recreate: cannot map container names to services, using names as-is");
            HashMap::new()
        }
    };
    tracing::info!(path = %path.display(), "auto-recreate enabled");
    Some(Arc::new(ComposeRecreate::new(path.clone(), services)))
}

/// Cancel `cancel` on SIGINT or SIGTERM
async fn shutdown_signal(cancel: CancellationToken) {
    use tokio::signal::unix::{SignalKind, signal};

    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => return,
        _ = interrupt => {}
        _ = terminate => {}
    }
    tracing::info!("received shutdown signal");
    cancel.cancel();
}
