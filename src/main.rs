//! app-manager - Supervise the applications of the APP partition
//!
//! Reads the application manifests, starts every app in priority order,
//! keeps their health up to date and serves a control socket until SIGTERM,
//! then stops the apps in reverse order.

#![allow(dead_code)] // Some accessors exist for the tests and the control API

mod control;
mod core;
mod platform;

use std::fs::OpenOptions;
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::Parser;
use single_instance::SingleInstance;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::control::{server, ControlState};
use crate::core::health::{spawn_health_monitors, HealthProber};
use crate::core::process::ProcessManager;
use crate::core::{AppManager, Registry, Settings};

/// Application name constant
pub const APP_NAME: &str = "app-manager";

/// Application version
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    let mut settings = Settings::parse();
    settings.validate();

    let log_file_error = init_logging(&settings);
    info!("{} v{} starting...", APP_NAME, APP_VERSION);
    if let Some(e) = log_file_error {
        warn!("Logging to stdout only: {}", e);
    }

    // Two supervisors would fight over the same PID files
    let instance = SingleInstance::new(APP_NAME).context("Failed to create single instance lock")?;
    if !instance.is_single() {
        error!("Another instance of {} is already running!", APP_NAME);
        anyhow::bail!("{} is already running", APP_NAME);
    }

    let layout = settings.layout();
    layout
        .ensure_base_dirs()
        .context("Failed to create runtime directories")?;

    let registry = Registry::load(&settings.manifest_path)
        .with_context(|| format!("Failed to load {}", settings.manifest_path.display()))?;
    if let Some(version) = registry.version() {
        info!("Manifest version {}", version);
    }

    let prober = HealthProber::new(layout.clone()).context("Failed to build health probe client")?;
    let process = Arc::new(ProcessManager::new(layout.clone()));
    let manager = Arc::new(AppManager::new(registry, process, prober, layout));

    let signals = shutdown_signal().context("Failed to install signal handlers")?;

    let socket_path = settings.get_socket_path();
    let listener = server::bind(&socket_path)
        .with_context(|| format!("Failed to bind {}", socket_path.display()))?;
    let shutdown = CancellationToken::new();
    let app = control::router(ControlState {
        manager: Arc::clone(&manager),
        max_log_lines: settings.max_log_lines,
    });
    let server = tokio::spawn(server::serve(listener, app, shutdown.clone().cancelled_owned()));

    manager.start_all().await;
    let monitors = spawn_health_monitors(Arc::clone(&manager), shutdown.clone());
    info!("{} ready, supervising {} app(s)", APP_NAME, manager.registry().len());

    signals.await;

    manager.begin_shutdown();
    shutdown.cancel();
    for monitor in monitors {
        if let Err(e) = monitor.await {
            warn!("Health loop ended abnormally: {}", e);
        }
    }

    manager.shutdown_all().await;

    if let Err(e) = server.await {
        error!("Control server ended abnormally: {}", e);
    }
    server::remove(&socket_path);

    info!("{} shutting down", APP_NAME);
    Ok(())
}

/// Initialize the logging system.
///
/// Returns why the supervisor's own log file could not be used, if it could not.
fn init_logging(settings: &Settings) -> Option<std::io::Error> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("app_manager={}", settings.log_level)));

    let (file_layer, file_error) = match open_log_file(&settings.get_manager_log_file()) {
        Ok(file) => (
            Some(fmt::layer().with_ansi(false).with_writer(Mutex::new(file))),
            None,
        ),
        Err(e) => (None, Some(e)),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    file_error
}

fn open_log_file(path: &Path) -> std::io::Result<std::fs::File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

/// Resolves on SIGTERM or SIGINT. Handlers are installed immediately.
fn shutdown_signal() -> std::io::Result<impl Future<Output = ()>> {
    let mut term = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;

    Ok(async move {
        tokio::select! {
            _ = term.recv() => info!("Received SIGTERM"),
            _ = interrupt.recv() => info!("Received SIGINT"),
        }
    })
}
