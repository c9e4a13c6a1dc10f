//! Health evaluation - Probes and the per-app check loop

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::app::HealthReport;
use super::error::HealthCheckError;
use super::lifecycle::AppManager;
use super::manifest::{AppDescriptor, HealthCheck};
use super::process::{ProcessControl, ProcessHandle};
use super::settings::Layout;

/// Runs one health probe against an app
pub struct HealthProber {
    client: reqwest::Client,
    layout: Layout,
}

impl HealthProber {
    pub fn new(layout: Layout) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().no_proxy().build()?;
        Ok(Self { client, layout })
    }

    /// Probe an app whose process is `handle`.
    ///
    /// Never fails: every problem becomes an unhealthy report.
    pub async fn probe(
        &self,
        app: &AppDescriptor,
        process: &dyn ProcessControl,
        handle: &ProcessHandle,
    ) -> HealthReport {
        let timeout = app.health.timeout;
        match &app.health.check {
            HealthCheck::Http {
                port,
                endpoint,
                expected_status,
            } => self.probe_http(*port, endpoint, *expected_status, timeout).await,
            HealthCheck::Tcp { port } => probe_tcp(*port, timeout).await,
            HealthCheck::Process => {
                if process.is_alive(handle) {
                    HealthReport::healthy(None, None)
                } else {
                    failure(HealthCheckError::ProcessGone, None, None)
                }
            }
            HealthCheck::Script { command, args } => {
                self.probe_script(app, command, args, timeout).await
            }
        }
    }

    async fn probe_http(
        &self,
        port: u16,
        endpoint: &str,
        expected_status: u16,
        timeout: Duration,
    ) -> HealthReport {
        let url = format!("http://localhost:{}{}", port, endpoint);
        let started = Instant::now();
        let response = tokio::time::timeout(timeout, self.client.get(&url).send()).await;
        let elapsed = Some(elapsed_ms(started));

        match response {
            Err(_) => failure(HealthCheckError::Timeout(timeout), elapsed, None),
            Ok(Err(e)) => failure(HealthCheckError::Connect(e.to_string()), elapsed, None),
            Ok(Ok(response)) => {
                let actual = response.status().as_u16();
                if actual == expected_status {
                    HealthReport::healthy(elapsed, Some(actual))
                } else {
                    failure(
                        HealthCheckError::UnexpectedStatus {
                            expected: expected_status,
                            actual,
                        },
                        elapsed,
                        Some(actual),
                    )
                }
            }
        }
    }

    async fn probe_script(
        &self,
        app: &AppDescriptor,
        command: &std::path::Path,
        args: &[String],
        timeout: Duration,
    ) -> HealthReport {
        let program = self.layout.resolve_command(&app.name, command);
        let mut cmd = tokio::process::Command::new(&program);
        cmd.args(args)
            .envs(&app.env)
            .env("APP_NAME", &app.name)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let work_dir = self.layout.working_dir(app);
        if work_dir.is_dir() {
            cmd.current_dir(work_dir);
        }

        let started = Instant::now();
        let status = tokio::time::timeout(timeout, cmd.status()).await;
        let elapsed = Some(elapsed_ms(started));

        match status {
            Err(_) => failure(HealthCheckError::Timeout(timeout), elapsed, None),
            Ok(Err(e)) => failure(
                HealthCheckError::ScriptFailed(format!("{}: {}", program.display(), e)),
                elapsed,
                None,
            ),
            Ok(Ok(status)) if status.success() => HealthReport::healthy(elapsed, None),
            Ok(Ok(status)) => failure(HealthCheckError::ScriptFailed(status.to_string()), elapsed, None),
        }
    }
}

async fn probe_tcp(port: u16, timeout: Duration) -> HealthReport {
    let started = Instant::now();
    let result = tokio::time::timeout(timeout, TcpStream::connect(("localhost", port))).await;
    let elapsed = Some(elapsed_ms(started));

    match result {
        Err(_) => failure(HealthCheckError::Timeout(timeout), elapsed, None),
        Ok(Err(e)) => failure(HealthCheckError::Connect(e.to_string()), elapsed, None),
        Ok(Ok(_stream)) => HealthReport::healthy(elapsed, None),
    }
}

fn failure(error: HealthCheckError, response_time_ms: Option<f64>, status_code: Option<u16>) -> HealthReport {
    HealthReport::unhealthy(error.to_string(), response_time_ms, status_code)
}

/// Milliseconds since `started`, rounded to two decimals
fn elapsed_ms(started: Instant) -> f64 {
    (started.elapsed().as_secs_f64() * 100_000.0).round() / 100.0
}

/// Start one check loop per registered app.
///
/// Each loop ticks at its app's interval, first tick one interval from now.
/// Loops are independent, so a slow check only delays its own app. Cancelling
/// `shutdown` ends every loop, abandoning any check in flight.
pub fn spawn_health_monitors(manager: Arc<AppManager>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
    manager
        .registry()
        .iter()
        .map(|app| {
            let manager = Arc::clone(&manager);
            let shutdown = shutdown.clone();
            let name = app.name.clone();
            let interval = app.health.interval.max(Duration::from_millis(100));
            tokio::spawn(async move {
                run_health_loop(manager, name, interval, shutdown).await;
            })
        })
        .collect()
}

async fn run_health_loop(
    manager: Arc<AppManager>,
    name: String,
    interval: Duration,
    shutdown: CancellationToken,
) {
    debug!("Health loop for '{}' every {:?}", name, interval);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = manager.check_health(&name) => {}
                }
            }
        }
    }
    info!("Health loop for '{}' stopped", name);
}
