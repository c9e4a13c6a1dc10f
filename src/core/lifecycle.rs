//! Lifecycle controller - Ordered startup, stop escalation and crash detection
//!
//! Every app has two locks. `transition` serialises start/stop/restart and is
//! held across the whole operation; `state` guards the runtime record and is
//! only ever held for a few statements. Health evaluation never takes
//! `transition`: it probes without a lock and applies its verdict only if the
//! pid it probed is still the current one and no stop is underway.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use super::app::{AppStatus, HealthReport, HealthVerdict, RuntimeState};
use super::error::{ControlError, ShutdownTimeoutError, SignalError, SpawnError};
use super::health::HealthProber;
use super::manifest::{AppDescriptor, AppKind, Registry};
use super::monitor::SharedResourceMonitor;
use super::process::{ProcessControl, ProcessHandle, WaitOutcome};
use super::settings::Layout;
use crate::platform::Signal;

/// How long to wait for the kernel after SIGKILL
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

struct AppEntry {
    state: Mutex<RuntimeState>,
    transition: tokio::sync::Mutex<()>,
}

impl AppEntry {
    fn new() -> Self {
        Self {
            state: Mutex::new(RuntimeState::default()),
            transition: tokio::sync::Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Point-in-time view of one app
#[derive(Debug, Clone, Serialize)]
pub struct AppSnapshot {
    pub name: String,
    pub version: String,
    pub description: String,
    #[serde(rename = "type")]
    pub kind: AppKind,
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url_path: Option<String>,
    pub status: AppStatus,
    pub pid: Option<u32>,
    pub health: HealthVerdict,
    pub uptime_seconds: u64,
    pub uptime_human: String,
    pub memory_bytes: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub start_count: u32,
}

/// Latest health detail of one app
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub app: String,
    pub check: &'static str,
    pub app_status: AppStatus,
    pub consecutive_failures: u32,
    #[serde(flatten)]
    pub report: HealthReport,
}

/// Owns the runtime state of every registered app
pub struct AppManager {
    registry: Registry,
    entries: HashMap<String, AppEntry>,
    process: Arc<dyn ProcessControl>,
    prober: HealthProber,
    layout: Layout,
    resource_monitor: SharedResourceMonitor,
    shutting_down: AtomicBool,
    kill_grace: Duration,
}

impl AppManager {
    pub fn new(
        registry: Registry,
        process: Arc<dyn ProcessControl>,
        prober: HealthProber,
        layout: Layout,
    ) -> Self {
        let entries = registry
            .startup_order()
            .iter()
            .map(|name| (name.clone(), AppEntry::new()))
            .collect();
        Self {
            registry,
            entries,
            process,
            prober,
            layout,
            resource_monitor: SharedResourceMonitor::new(),
            shutting_down: AtomicBool::new(false),
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    pub fn with_kill_grace(mut self, kill_grace: Duration) -> Self {
        self.kill_grace = kill_grace;
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Refuse mutating requests from now on
    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    fn entry(&self, name: &str) -> Result<(&AppDescriptor, &AppEntry), ControlError> {
        match (self.registry.get(name), self.entries.get(name)) {
            (Some(app), Some(entry)) => Ok((app, entry)),
            _ => Err(ControlError::NotFound(name.to_string())),
        }
    }

    /// Look up an app and claim its transition lock without waiting
    fn claim(
        &self,
        name: &str,
    ) -> Result<(&AppDescriptor, &AppEntry, tokio::sync::MutexGuard<'_, ()>), ControlError> {
        if self.is_shutting_down() {
            return Err(ControlError::ShuttingDown);
        }
        let (app, entry) = self.entry(name)?;
        let guard = entry
            .transition
            .try_lock()
            .map_err(|_| ControlError::Busy(name.to_string()))?;
        // Shutdown may have begun while we were taking the lock
        if self.is_shutting_down() {
            return Err(ControlError::ShuttingDown);
        }
        Ok((app, entry, guard))
    }

    // ---- queries -----------------------------------------------------------

    pub fn snapshot(&self, name: &str) -> Result<AppSnapshot, ControlError> {
        let (app, entry) = self.entry(name)?;
        let state = entry.state();
        Ok(snapshot_of(app, &state))
    }

    /// All apps in startup order
    pub fn list(&self) -> Vec<AppSnapshot> {
        self.registry
            .iter()
            .filter_map(|app| {
                self.entries
                    .get(&app.name)
                    .map(|entry| snapshot_of(app, &entry.state()))
            })
            .collect()
    }

    pub fn health(&self, name: &str) -> Result<HealthSnapshot, ControlError> {
        let (app, entry) = self.entry(name)?;
        let state = entry.state();
        Ok(HealthSnapshot {
            app: app.name.clone(),
            check: app.health.check.kind(),
            app_status: state.status,
            consecutive_failures: state.consecutive_failures,
            report: state.last_health.clone(),
        })
    }

    pub fn log_path(&self, name: &str) -> Result<PathBuf, ControlError> {
        let (app, _) = self.entry(name)?;
        Ok(self.layout.log_file(app))
    }

    // ---- system-initiated --------------------------------------------------

    /// Start every app in registry order without waiting for health
    pub async fn start_all(&self) {
        info!("Starting {} app(s)", self.registry.len());
        for app in self.registry.iter() {
            let Some(entry) = self.entries.get(&app.name) else {
                continue;
            };
            let _guard = entry.transition.lock().await;
            if let Err(e) = self.start_locked(app, entry) {
                error!("Failed to start '{}': {}", app.name, e);
            }
        }
    }

    /// Stop every app in reverse startup order, one at a time
    pub async fn shutdown_all(&self) {
        self.begin_shutdown();
        info!("Stopping {} app(s)", self.registry.len());
        for name in self.registry.startup_order().iter().rev() {
            let Ok((app, entry)) = self.entry(name) else {
                continue;
            };
            let _guard = entry.transition.lock().await;
            match self.stop_locked(app, entry).await {
                Ok(status) => info!("Shutdown of '{}' finished: {}", name, status),
                Err(e) => error!("Shutdown of '{}' failed: {}", name, e),
            }
        }
        info!("All apps stopped");
    }

    // ---- operator-initiated ------------------------------------------------

    pub async fn start(&self, name: &str) -> Result<AppStatus, ControlError> {
        let (app, entry, _guard) = self.claim(name)?;
        Ok(self.start_locked(app, entry)?)
    }

    pub async fn stop(&self, name: &str) -> Result<AppStatus, ControlError> {
        let (app, entry, _guard) = self.claim(name)?;
        Ok(self.stop_locked(app, entry).await?)
    }

    pub async fn restart(&self, name: &str) -> Result<AppStatus, ControlError> {
        let (app, entry, _guard) = self.claim(name)?;
        info!("Restarting '{}'", name);
        self.stop_locked(app, entry).await?;
        Ok(self.start_locked(app, entry)?)
    }

    // ---- transitions (caller holds the transition lock) --------------------

    fn start_locked(&self, app: &AppDescriptor, entry: &AppEntry) -> Result<AppStatus, SpawnError> {
        let (status, pid) = {
            let state = entry.state();
            (state.status, state.pid)
        };
        if let (true, Some(pid)) = (status.is_active(), pid) {
            if self.process.is_alive(&handle_for(app, pid)) {
                debug!("'{}' already {} (PID {})", app.name, status, pid);
                return Ok(status);
            }
        }

        match self.prepare_app_dirs(app).and_then(|()| self.process.spawn(app)) {
            Ok(handle) => {
                entry.state().mark_starting(handle.pid);
                info!("Started '{}' (PID {})", app.name, handle.pid);
                Ok(AppStatus::Starting)
            }
            Err(e) => {
                error!("Failed to spawn '{}': {}", app.name, e);
                entry.state().mark_failed(e.to_string());
                Err(e)
            }
        }
    }

    async fn stop_locked(&self, app: &AppDescriptor, entry: &AppEntry) -> Result<AppStatus, SignalError> {
        let pid = {
            let mut state = entry.state();
            match state.pid {
                Some(pid) => {
                    state.stopping = true;
                    pid
                }
                None => {
                    if state.status != AppStatus::Stopped {
                        state.mark_stopped();
                        info!("Marked '{}' stopped", app.name);
                    }
                    return Ok(AppStatus::Stopped);
                }
            }
        };

        let handle = handle_for(app, pid);
        if self.process.is_alive(&handle) {
            if let Err(e) = self.terminate(app, &handle).await {
                entry.state().stopping = false;
                return Err(e);
            }
        } else {
            info!("'{}' (PID {}) had already exited", app.name, pid);
        }

        self.process.release(&handle);
        entry.state().mark_stopped();
        info!("Stopped '{}'", app.name);
        Ok(AppStatus::Stopped)
    }

    /// Configured signal, bounded wait, then exactly one SIGKILL
    async fn terminate(&self, app: &AppDescriptor, handle: &ProcessHandle) -> Result<(), SignalError> {
        let signal = app.shutdown.signal;
        let timeout = app.shutdown.timeout;
        info!(
            "Stopping '{}' (PID {}) with {}, timeout {:?}",
            app.name, handle.pid, signal, timeout
        );
        self.process.signal(handle, signal)?;
        if self.process.wait(handle, timeout).await == WaitOutcome::Exited {
            return Ok(());
        }

        let timed_out = ShutdownTimeoutError {
            name: app.name.clone(),
            signal: signal.to_string(),
            timeout,
        };
        warn!("{}, sending SIGKILL", timed_out);
        self.process.signal(handle, Signal::Kill)?;
        if self.process.wait(handle, self.kill_grace).await == WaitOutcome::TimedOut {
            warn!("'{}' (PID {}) still present after SIGKILL", app.name, handle.pid);
        }
        Ok(())
    }

    /// Create the data and config dirs and seed config templates once
    fn prepare_app_dirs(&self, app: &AppDescriptor) -> Result<(), SpawnError> {
        let data_dir = self.layout.app_data_dir(&app.name);
        create_dir(&data_dir)?;
        for sub in &app.data_dirs {
            create_dir(&data_dir.join(sub))?;
        }

        let config_dir = self.layout.app_config_dir(&app.name);
        create_dir(&config_dir)?;
        for file in &app.config_files {
            let dest = config_dir.join(&file.dest);
            if dest.exists() {
                continue;
            }
            let source = self.layout.resolve(&app.name, &file.source);
            if !source.is_file() {
                warn!("Config template {} for '{}' not found", source.display(), app.name);
                continue;
            }
            if let Some(parent) = dest.parent() {
                create_dir(parent)?;
            }
            std::fs::copy(&source, &dest).map_err(|source| SpawnError::Prepare {
                path: dest.clone(),
                source,
            })?;
            info!("Seeded {} for '{}'", dest.display(), app.name);
        }
        Ok(())
    }

    // ---- health --------------------------------------------------------------

    /// Evaluate one app: crash detection first, then its declared probe
    pub async fn check_health(&self, name: &str) {
        let Ok((app, entry)) = self.entry(name) else {
            return;
        };
        let pid = {
            let state = entry.state();
            if state.stopping || !state.status.is_active() {
                return;
            }
            match state.pid {
                Some(pid) => pid,
                None => return,
            }
        };

        let handle = handle_for(app, pid);
        if !self.process.is_alive(&handle) {
            let mut state = entry.state();
            if state.pid == Some(pid) && !state.stopping && state.status.is_active() {
                error!("'{}' (PID {}) exited unexpectedly", name, pid);
                state.mark_failed("process exited unexpectedly");
                state.last_health = HealthReport::stopped();
            }
            return;
        }

        let report = self.prober.probe(app, self.process.as_ref(), &handle).await;
        let memory = self.resource_monitor.memory_bytes(pid);

        let mut state = entry.state();
        if state.pid != Some(pid) || state.stopping || !state.status.is_active() {
            debug!("Discarding stale health result for '{}'", name);
            return;
        }
        if let Some(memory) = memory {
            state.memory_bytes = memory;
        }
        let previous = state.status;
        let error = report.error.clone();
        state.record_health(report);

        match state.status {
            AppStatus::Running if previous != AppStatus::Running => {
                info!("'{}' is healthy", name)
            }
            AppStatus::Unhealthy if previous != AppStatus::Unhealthy => warn!(
                "'{}' is unhealthy: {}",
                name,
                error.as_deref().unwrap_or("check failed")
            ),
            status => debug!(
                "'{}' still {} ({} consecutive failures)",
                name, status, state.consecutive_failures
            ),
        }
    }
}

fn handle_for(app: &AppDescriptor, pid: u32) -> ProcessHandle {
    ProcessHandle {
        name: app.name.clone(),
        pid,
    }
}

fn create_dir(path: &Path) -> Result<(), SpawnError> {
    std::fs::create_dir_all(path).map_err(|source| SpawnError::Prepare {
        path: path.to_path_buf(),
        source,
    })
}

fn snapshot_of(app: &AppDescriptor, state: &RuntimeState) -> AppSnapshot {
    AppSnapshot {
        name: app.name.clone(),
        version: app.version.clone(),
        description: app.description.clone(),
        kind: app.kind,
        port: app.port,
        url_path: app.url_path.clone(),
        status: state.status,
        pid: state.pid,
        health: state.last_health.status,
        uptime_seconds: state.uptime_seconds(),
        uptime_human: state.uptime_string(),
        memory_bytes: state.memory_bytes,
        consecutive_failures: state.consecutive_failures,
        last_error: state.last_error.clone(),
        started_at: state.started_at,
        stopped_at: state.stopped_at,
        start_count: state.start_count,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::manifest::{ConfigFile, HealthCheck, HealthSpec, ShutdownSpec};
    use crate::core::process::ProcessManager;
    use httpmock::prelude::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    /// In-memory processes: pids are never reused, signals are recorded
    #[derive(Default)]
    pub(crate) struct FakeProcesses {
        inner: Mutex<FakeState>,
    }

    #[derive(Default)]
    struct FakeState {
        next_pid: u32,
        alive: HashSet<u32>,
        spawned: Vec<String>,
        signals: Vec<(String, Signal)>,
        ignores_term: HashSet<String>,
        broken: HashSet<String>,
    }

    impl FakeProcesses {
        fn state(&self) -> MutexGuard<'_, FakeState> {
            self.inner.lock().unwrap()
        }

        pub(crate) fn spawned(&self) -> Vec<String> {
            self.state().spawned.clone()
        }

        pub(crate) fn signals(&self) -> Vec<(String, Signal)> {
            self.state().signals.clone()
        }

        pub(crate) fn ignore_term(&self, name: &str) {
            self.state().ignores_term.insert(name.to_string());
        }

        fn break_executable(&self, name: &str) {
            self.state().broken.insert(name.to_string());
        }

        /// Kill a process behind the supervisor's back
        pub(crate) fn crash(&self, pid: u32) {
            self.state().alive.remove(&pid);
        }
    }

    impl ProcessControl for FakeProcesses {
        fn spawn(&self, app: &AppDescriptor) -> Result<ProcessHandle, SpawnError> {
            let mut state = self.state();
            if state.broken.contains(&app.name) {
                return Err(SpawnError::MissingExecutable(app.startup.command.clone()));
            }
            state.next_pid += 1;
            let pid = 1000 + state.next_pid;
            state.alive.insert(pid);
            state.spawned.push(app.name.clone());
            Ok(handle_for(app, pid))
        }

        fn is_alive(&self, handle: &ProcessHandle) -> bool {
            self.state().alive.contains(&handle.pid)
        }

        fn signal(&self, handle: &ProcessHandle, signal: Signal) -> Result<(), SignalError> {
            let mut state = self.state();
            state.signals.push((handle.name.clone(), signal));
            if signal == Signal::Kill || !state.ignores_term.contains(&handle.name) {
                state.alive.remove(&handle.pid);
            }
            Ok(())
        }

        fn release(&self, _handle: &ProcessHandle) {}

    }

    pub(crate) fn layout(dir: &TempDir) -> Layout {
        Layout {
            bundle_dir: dir.path().join("app"),
            data_dir: dir.path().join("data"),
            run_dir: dir.path().join("run"),
            log_dir: dir.path().join("log"),
        }
    }

    pub(crate) fn manager_with(
        dir: &TempDir,
        apps: Vec<AppDescriptor>,
        startup_order: &[&str],
    ) -> (AppManager, Arc<FakeProcesses>) {
        let order: Vec<String> = startup_order.iter().map(|s| s.to_string()).collect();
        let registry = Registry::from_descriptors(apps, &order).unwrap();
        let processes = Arc::new(FakeProcesses::default());
        let layout = layout(dir);
        let prober = HealthProber::new(layout.clone()).unwrap();
        let manager = AppManager::new(registry, processes.clone(), prober, layout)
            .with_kill_grace(Duration::from_millis(300));
        (manager, processes)
    }

    fn http_app(name: &str, priority: u32, port: u16) -> AppDescriptor {
        AppDescriptor::new(name, "bin/server", priority)
            .with_port(port)
            .with_health(HealthSpec {
                check: HealthCheck::Http {
                    port,
                    endpoint: "/health".to_string(),
                    expected_status: 200,
                },
                interval: Duration::from_secs(10),
                timeout: Duration::from_secs(2),
            })
    }

    fn pid_of(manager: &AppManager, name: &str) -> u32 {
        manager.snapshot(name).unwrap().pid.unwrap()
    }

    #[tokio::test]
    async fn starts_in_priority_order() {
        let dir = tempfile::tempdir().unwrap();
        let apps = vec![
            AppDescriptor::new("web", "bin/web", 60),
            AppDescriptor::new("db", "bin/db", 10),
            AppDescriptor::new("cache", "bin/cache", 30),
        ];
        let (manager, processes) = manager_with(&dir, apps, &[]);

        manager.start_all().await;

        assert_eq!(processes.spawned(), vec!["db", "cache", "web"]);
        for app in manager.list() {
            assert_eq!(app.status, AppStatus::Starting);
            assert_eq!(app.health, HealthVerdict::Unknown);
        }
        assert!(dir.path().join("data/app-data/db").is_dir());
        assert!(dir.path().join("data/app-config/web").is_dir());
    }

    #[tokio::test]
    async fn starting_until_first_check() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager_with(&dir, vec![AppDescriptor::new("svc", "bin/svc", 50)], &[]);

        assert_eq!(manager.start("svc").await.unwrap(), AppStatus::Starting);
        assert_eq!(manager.snapshot("svc").unwrap().status, AppStatus::Starting);
        // A second start is a no-op
        assert_eq!(manager.start("svc").await.unwrap(), AppStatus::Starting);

        manager.check_health("svc").await;
        let snapshot = manager.snapshot("svc").unwrap();
        assert_eq!(snapshot.status, AppStatus::Running);
        assert_eq!(snapshot.health, HealthVerdict::Healthy);
        assert_eq!(snapshot.start_count, 1);
    }

    #[tokio::test]
    async fn stopping_a_stopped_app_sends_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, processes) = manager_with(&dir, vec![AppDescriptor::new("svc", "bin/svc", 50)], &[]);

        assert_eq!(manager.stop("svc").await.unwrap(), AppStatus::Stopped);
        assert_eq!(manager.stop("svc").await.unwrap(), AppStatus::Stopped);
        assert!(processes.signals().is_empty());
        assert_eq!(manager.snapshot("svc").unwrap().stopped_at, None);
    }

    #[tokio::test]
    async fn stop_sends_configured_signal() {
        let dir = tempfile::tempdir().unwrap();
        let app = AppDescriptor::new("svc", "bin/svc", 50).with_shutdown(ShutdownSpec {
            timeout: Duration::from_secs(5),
            signal: Signal::Int,
        });
        let (manager, processes) = manager_with(&dir, vec![app], &[]);

        manager.start("svc").await.unwrap();
        assert_eq!(manager.stop("svc").await.unwrap(), AppStatus::Stopped);
        assert_eq!(processes.signals(), vec![("svc".to_string(), Signal::Int)]);

        let snapshot = manager.snapshot("svc").unwrap();
        assert_eq!(snapshot.pid, None);
        assert_eq!(snapshot.uptime_human, "N/A");
    }

    #[tokio::test]
    async fn escalates_to_a_single_sigkill() {
        let dir = tempfile::tempdir().unwrap();
        let app = AppDescriptor::new("api", "bin/api", 20).with_shutdown(ShutdownSpec {
            timeout: Duration::from_millis(300),
            signal: Signal::Term,
        });
        let (manager, processes) = manager_with(&dir, vec![app], &[]);
        processes.ignore_term("api");

        manager.start("api").await.unwrap();
        assert_eq!(manager.stop("api").await.unwrap(), AppStatus::Stopped);

        assert_eq!(
            processes.signals(),
            vec![
                ("api".to_string(), Signal::Term),
                ("api".to_string(), Signal::Kill)
            ]
        );
        let snapshot = manager.snapshot("api").unwrap();
        assert_eq!(snapshot.status, AppStatus::Stopped);
        assert_eq!(snapshot.pid, None);
    }

    #[tokio::test]
    async fn failing_check_marks_unhealthy_without_killing() {
        let server = MockServer::start_async().await;
        let dir = tempfile::tempdir().unwrap();
        let (manager, processes) = manager_with(&dir, vec![http_app("api", 20, server.port())], &[]);
        manager.start("api").await.unwrap();

        let ok = server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(200);
            })
            .await;
        manager.check_health("api").await;
        assert_eq!(manager.snapshot("api").unwrap().status, AppStatus::Running);
        ok.delete_async().await;

        let failing = server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(503);
            })
            .await;
        manager.check_health("api").await;
        manager.check_health("api").await;
        let snapshot = manager.snapshot("api").unwrap();
        assert_eq!(snapshot.status, AppStatus::Unhealthy);
        assert_eq!(snapshot.consecutive_failures, 2);
        assert!(snapshot.pid.is_some());
        assert!(processes.signals().is_empty());

        let health = manager.health("api").unwrap();
        assert_eq!(health.check, "http");
        assert_eq!(health.report.status_code, Some(503));
        failing.delete_async().await;

        server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(200);
            })
            .await;
        manager.check_health("api").await;
        let snapshot = manager.snapshot("api").unwrap();
        assert_eq!(snapshot.status, AppStatus::Running);
        assert_eq!(snapshot.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn shutdown_runs_in_reverse_order() {
        let dir = tempfile::tempdir().unwrap();
        let apps = vec![
            AppDescriptor::new("db", "bin/db", 10),
            AppDescriptor::new("api", "bin/api", 20),
            AppDescriptor::new("web", "bin/web", 30),
        ];
        let (manager, processes) = manager_with(&dir, apps, &["db", "api", "web"]);

        manager.start_all().await;
        manager.shutdown_all().await;

        let stopped: Vec<String> = processes.signals().into_iter().map(|(name, _)| name).collect();
        assert_eq!(stopped, vec!["web", "api", "db"]);
        assert!(manager
            .list()
            .iter()
            .all(|app| app.status == AppStatus::Stopped));
        assert!(matches!(
            manager.start("db").await,
            Err(ControlError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn db_and_api_boot_then_api_crashes() {
        let server = MockServer::start_async().await;
        let health = server
            .mock_async(|when, then| {
                when.method(GET).path("/health");
                then.status(200).body("ok");
            })
            .await;
        let dir = tempfile::tempdir().unwrap();
        let apps = vec![
            http_app("api", 20, server.port()),
            AppDescriptor::new("db", "bin/db", 10),
        ];
        let (manager, processes) = manager_with(&dir, apps, &["db", "api"]);

        manager.start_all().await;
        assert_eq!(processes.spawned(), vec!["db", "api"]);

        manager.check_health("api").await;
        health.assert_async().await;
        assert_eq!(manager.snapshot("api").unwrap().status, AppStatus::Running);

        processes.crash(pid_of(&manager, "api"));
        manager.check_health("api").await;
        let snapshot = manager.snapshot("api").unwrap();
        assert_eq!(snapshot.status, AppStatus::Failed);
        assert_eq!(snapshot.pid, None);
        assert_eq!(snapshot.health, HealthVerdict::Stopped);
        assert!(processes.signals().is_empty());

        // Failed apps stay failed until an operator acts
        manager.check_health("api").await;
        assert_eq!(manager.snapshot("api").unwrap().status, AppStatus::Failed);
        assert_eq!(manager.restart("api").await.unwrap(), AppStatus::Starting);
        assert_eq!(processes.spawned(), vec!["db", "api", "api"]);
        assert_eq!(manager.snapshot("db").unwrap().status, AppStatus::Starting);
    }

    #[tokio::test]
    async fn declared_order_drives_boot_and_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let apps = vec![
            AppDescriptor::new("cache", "bin/cache", 10),
            AppDescriptor::new("api", "bin/api", 30),
            AppDescriptor::new("db", "bin/db", 20),
        ];
        let (manager, processes) = manager_with(&dir, apps, &["db", "api"]);

        manager.start_all().await;
        assert_eq!(processes.spawned(), vec!["db", "api", "cache"]);

        manager.shutdown_all().await;
        let stopped: Vec<String> = processes.signals().into_iter().map(|(name, _)| name).collect();
        assert_eq!(stopped, vec!["cache", "api", "db"]);
    }

    #[tokio::test]
    async fn leftover_pid_file_is_never_adopted() {
        let dir = tempfile::tempdir().unwrap();
        let layout = layout(&dir);
        layout.ensure_base_dirs().unwrap();
        std::fs::create_dir_all(layout.app_bundle_dir("svc")).unwrap();
        let app = AppDescriptor::new("svc", "/bin/sh", 50)
            .with_args(vec!["-c".to_string(), "exec sleep 30".to_string()]);
        let registry = Registry::from_descriptors(vec![app], &[]).unwrap();
        let process = Arc::new(ProcessManager::new(layout.clone()));
        let prober = HealthProber::new(layout.clone()).unwrap();
        let manager = AppManager::new(registry, process, prober, layout.clone());

        // Whatever the file names is not ours, alive or not
        let mut bystander = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        std::fs::write(layout.pid_file("svc"), format!("{}\n", bystander.id())).unwrap();

        assert_eq!(manager.start("svc").await.unwrap(), AppStatus::Starting);
        let pid = pid_of(&manager, "svc");
        assert_ne!(pid, bystander.id());
        assert_eq!(manager.snapshot("svc").unwrap().start_count, 1);

        assert_eq!(manager.stop("svc").await.unwrap(), AppStatus::Stopped);
        assert!(bystander.try_wait().unwrap().is_none());

        bystander.kill().unwrap();
        bystander.wait().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn no_start_slips_past_shutdown() {
        for _ in 0..50 {
            let dir = tempfile::tempdir().unwrap();
            let (manager, processes) =
                manager_with(&dir, vec![AppDescriptor::new("svc", "bin/svc", 50)], &[]);
            let manager = Arc::new(manager);

            let operator = {
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    for _ in 0..20 {
                        let _ = manager.start("svc").await;
                        tokio::task::yield_now().await;
                    }
                })
            };
            tokio::task::yield_now().await;
            manager.begin_shutdown();
            manager.shutdown_all().await;
            operator.await.unwrap();

            assert_eq!(manager.snapshot("svc").unwrap().status, AppStatus::Stopped);
            let spawned = processes.spawned().len();
            assert!(matches!(
                manager.start("svc").await,
                Err(ControlError::ShuttingDown)
            ));
            assert_eq!(processes.spawned().len(), spawned);
        }
    }

    #[tokio::test]
    async fn spawn_failure_does_not_block_others() {
        let dir = tempfile::tempdir().unwrap();
        let apps = vec![
            AppDescriptor::new("broken", "bin/broken", 10),
            AppDescriptor::new("fine", "bin/fine", 20),
        ];
        let (manager, processes) = manager_with(&dir, apps, &[]);
        processes.break_executable("broken");

        manager.start_all().await;

        let broken = manager.snapshot("broken").unwrap();
        assert_eq!(broken.status, AppStatus::Failed);
        assert!(broken.last_error.unwrap().contains("bin/broken"));
        assert_eq!(manager.snapshot("fine").unwrap().status, AppStatus::Starting);

        assert!(matches!(
            manager.start("broken").await,
            Err(ControlError::Spawn(SpawnError::MissingExecutable(_)))
        ));
        assert_eq!(manager.stop("broken").await.unwrap(), AppStatus::Stopped);
        assert_eq!(manager.snapshot("broken").unwrap().status, AppStatus::Stopped);
    }

    #[tokio::test]
    async fn rejects_busy_and_unknown_apps() {
        let dir = tempfile::tempdir().unwrap();
        let (manager, _) = manager_with(&dir, vec![AppDescriptor::new("svc", "bin/svc", 50)], &[]);

        assert!(matches!(
            manager.start("nope").await,
            Err(ControlError::NotFound(name)) if name == "nope"
        ));

        let _guard = manager.entries["svc"].transition.lock().await;
        assert!(matches!(
            manager.stop("svc").await,
            Err(ControlError::Busy(_))
        ));
        // Reads never wait on transitions
        assert_eq!(manager.snapshot("svc").unwrap().status, AppStatus::Stopped);
    }

    #[tokio::test]
    async fn seeds_config_templates_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = AppDescriptor::new("svc", "bin/svc", 50);
        app.data_dirs = vec!["uploads".into(), "cache/thumbs".into()];
        app.config_files = vec![ConfigFile {
            source: "defaults/settings.toml".into(),
            dest: "settings.toml".into(),
        }];
        let (manager, processes) = manager_with(&dir, vec![app], &[]);

        let template = manager.layout().app_bundle_dir("svc").join("defaults");
        std::fs::create_dir_all(&template).unwrap();
        std::fs::write(template.join("settings.toml"), "port = 1\n").unwrap();

        manager.start("svc").await.unwrap();
        let data_dir = manager.layout().app_data_dir("svc");
        assert!(data_dir.join("uploads").is_dir());
        assert!(data_dir.join("cache/thumbs").is_dir());
        let config = manager.layout().app_config_dir("svc").join("settings.toml");
        assert_eq!(std::fs::read_to_string(&config).unwrap(), "port = 1\n");

        // Operator edits survive a restart
        std::fs::write(&config, "port = 2\n").unwrap();
        manager.restart("svc").await.unwrap();
        assert_eq!(std::fs::read_to_string(&config).unwrap(), "port = 2\n");
        assert_eq!(processes.spawned().len(), 2);
    }
}
