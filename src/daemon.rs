use crate::background::Background;
use crate::config;
use crate::control::ControlServer;
use crate::paths::{APP_NAME, Paths};
use crate::process::{ExitNotice, Launcher};
use crate::registry::Registry;
use crate::service::{ExitAction, Service};
use crate::watch::ConfigWatcher;
use color_eyre::eyre::{WrapErr, bail};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Runs the supervisor until SIGINT or SIGTERM.
pub async fn run(paths: Paths) -> color_eyre::Result<()> {
    if !nix::unistd::Uid::effective().is_root() {
        bail!("{APP_NAME} daemon must be run as root");
    }
    let shutdown = shutdown_signal().wrap_err("failed to install signal handlers")?;
    run_until(paths, shutdown).await
}

/// Boots every configured service, serves until `shutdown` resolves, then
/// tears everything down in reverse priority order.
pub async fn run_until<F>(paths: Paths, shutdown: F) -> color_eyre::Result<()>
where
    F: Future<Output = ()>,
{
    std::fs::create_dir_all(paths.log_dir())
        .wrap_err_with(|| format!("failed to create {}", paths.log_dir().display()))?;
    let configs = config::load_dir(paths.config_dir(), config::is_ignored_file)?;

    let (launcher, exits) = Launcher::new(paths.clone());
    let registry = Registry::new();
    {
        let mut services = registry.lock().await;
        for config in configs {
            if let Err(e) = services.add(Service::new(config, launcher.clone())) {
                tracing::error!("{e}");
            }
        }
        tracing::info!(services = services.len(), "configuration loaded");
    }

    let mut tasks = vec![spawn_exit_handler(registry.clone(), exits)];

    let watcher = ConfigWatcher::new(
        paths.config_dir().to_path_buf(),
        registry.clone(),
        launcher.clone(),
    );
    match watcher.spawn() {
        Ok(task) => tasks.push(task),
        Err(e) => tracing::error!("failed to watch configuration, hot reload is disabled: {e}"),
    }

    match ControlServer::bind(paths.socket_file(), registry.clone()) {
        Ok(server) => tasks.push(server.spawn()),
        Err(e) => tracing::error!(
            socket = %paths.socket_file().display(),
            "failed to start control server: {e}"
        ),
    }

    start_all(&registry).await;

    shutdown.await;
    tracing::info!("shutting down");

    for task in &tasks {
        task.stop();
    }
    for task in tasks {
        task.stopped().await;
    }

    let stopped = stop_all(&registry).await;
    tracing::info!(?stopped, "all services stopped");
    Ok(())
}

fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(async move {
        tokio::select! {
            _ = sigint.recv() => tracing::info!("received SIGINT"),
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
        }
    })
}

// ---------------------------------------------------------------------------
// Ordered start/stop
// ---------------------------------------------------------------------------

/// Starts services in ascending priority. A failure only affects that
/// service. Services already active (started by the watcher or a client in
/// the meantime) are left alone. Returns the names it tried to start.
pub async fn start_all(registry: &Registry) -> Vec<String> {
    let mut services = registry.lock().await;
    let mut order = Vec::new();
    for service in services.iter_mut() {
        if service.state().is_active() {
            continue;
        }
        order.push(service.name().to_string());
        if let Err(e) = service.start().await {
            tracing::error!("{e}");
        }
    }
    order
}

/// Stops every running service. Stops are dispatched from the highest
/// priority value down and then run concurrently; this returns once all of
/// them have finished. Returns the names in dispatch order.
pub async fn stop_all(registry: &Registry) -> Vec<String> {
    let mut services = registry.lock().await;
    let mut order = Vec::new();
    let mut stops = JoinSet::new();

    for (index, service) in services.iter_mut().enumerate().rev() {
        service.cancel_restart();
        if !service.is_running() {
            continue;
        }
        match service.begin_stop() {
            Ok(pending) => {
                order.push(service.name().to_string());
                stops.spawn(async move { (index, pending.run().await) });
            }
            Err(e) => tracing::error!("{e}"),
        }
    }

    while let Some(joined) = stops.join_next().await {
        match joined {
            Ok((index, outcome)) => {
                if let Some(service) = services.get_mut(index)
                    && let Err(e) = service.finish_stop(outcome)
                {
                    tracing::error!("{e}");
                }
            }
            Err(e) => tracing::error!("stop task failed: {e}"),
        }
    }
    order
}

// ---------------------------------------------------------------------------
// Exit handling
// ---------------------------------------------------------------------------

fn spawn_exit_handler(
    registry: Registry,
    mut exits: mpsc::UnboundedReceiver<ExitNotice>,
) -> Background {
    Background::spawn("exit-handler", move |token| async move {
        loop {
            let notice = tokio::select! {
                _ = token.cancelled() => break,
                notice = exits.recv() => match notice {
                    Some(notice) => notice,
                    None => break,
                },
            };

            let action = {
                let mut services = registry.lock().await;
                services
                    .find_by_run_mut(notice.run_id)
                    .and_then(|s| s.handle_exit(notice.run_id, notice.exit_code))
            };
            if let Some(ExitAction::Restart { id, delay }) = action {
                tokio::spawn(delayed_restart(registry.clone(), token.clone(), id, delay));
            }
        }
    })
}

async fn delayed_restart(registry: Registry, token: CancellationToken, id: u64, delay: Duration) {
    tokio::select! {
        _ = token.cancelled() => return,
        _ = tokio::time::sleep(delay) => {}
    }

    let mut services = registry.lock().await;
    if token.is_cancelled() {
        return;
    }
    if let Some(service) = services.find_by_pending_restart_mut(id)
        && let Err(e) = service.resume_restart(id).await
    {
        tracing::error!("{e}");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
