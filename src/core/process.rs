//! Process supervision - Spawning, signalling and reaping one child per app

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use super::error::{SignalError, SpawnError};
use super::manifest::AppDescriptor;
use super::settings::Layout;
use crate::platform::{self, Signal};

/// How often `wait` re-checks liveness
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A child process owned by the supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub name: String,
    pub pid: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Exited,
    TimedOut,
}

/// The narrow OS interface the lifecycle controller drives
#[async_trait]
pub trait ProcessControl: Send + Sync {
    /// Launch the app's process
    fn spawn(&self, app: &AppDescriptor) -> Result<ProcessHandle, SpawnError>;

    /// Non-blocking liveness probe; a vanished process counts as dead
    fn is_alive(&self, handle: &ProcessHandle) -> bool;

    /// Deliver a signal; a process that is already gone is not an error
    fn signal(&self, handle: &ProcessHandle, signal: Signal) -> Result<(), SignalError>;

    /// Forget the process and remove its PID file
    fn release(&self, handle: &ProcessHandle);

    /// Wait up to `timeout` for the process to exit
    async fn wait(&self, handle: &ProcessHandle, timeout: Duration) -> WaitOutcome {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if !self.is_alive(handle) {
                return WaitOutcome::Exited;
            }
            if tokio::time::Instant::now() >= deadline {
                return WaitOutcome::TimedOut;
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
    }
}

/// Real processes, with stdout/stderr appended to per-app log files
pub struct ProcessManager {
    layout: Layout,
    /// Children we spawned, keyed by app name, so they can be reaped
    children: Mutex<HashMap<String, Child>>,
}

impl ProcessManager {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            children: Mutex::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    fn open_log(&self, path: &Path) -> Result<std::fs::File, SpawnError> {
        let prepare = |source| SpawnError::Prepare {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(prepare)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(prepare)
    }

    fn remove_pid_file(&self, name: &str) {
        let pid_file = self.layout.pid_file(name);
        match std::fs::remove_file(&pid_file) {
            Ok(()) => debug!("Removed PID file {}", pid_file.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove PID file {}: {}", pid_file.display(), e),
        }
    }

    /// Read the PID recorded for an app, if any
    pub fn read_pid_file(&self, name: &str) -> Option<u32> {
        std::fs::read_to_string(self.layout.pid_file(name))
            .ok()
            .and_then(|contents| contents.trim().parse().ok())
    }
}

#[async_trait]
impl ProcessControl for ProcessManager {
    fn spawn(&self, app: &AppDescriptor) -> Result<ProcessHandle, SpawnError> {
        let command = self.layout.resolve_command(&app.name, &app.startup.command);
        info!("Spawning '{}' from {}", app.name, command.display());

        if command.components().count() > 1 && !command.exists() {
            return Err(SpawnError::MissingExecutable(command));
        }

        let work_dir = self.layout.working_dir(app);
        if !work_dir.is_dir() {
            return Err(SpawnError::MissingWorkingDir(work_dir));
        }

        // A PID file we did not write this run names nothing we own
        if let Some(pid) = self.read_pid_file(&app.name) {
            warn!("Discarding leftover PID file for '{}' (PID {})", app.name, pid);
            self.remove_pid_file(&app.name);
        }

        let log_path = self.layout.log_file(app);
        let stdout = self.open_log(&log_path)?;
        let stderr = stdout.try_clone().map_err(|source| SpawnError::Prepare {
            path: log_path.clone(),
            source,
        })?;

        let mut cmd = Command::new(&command);
        cmd.args(&app.startup.args)
            .current_dir(&work_dir)
            .envs(&app.env)
            .env("APP_NAME", &app.name)
            .env("APP_DATA_DIR", self.layout.app_data_dir(&app.name))
            .env("APP_CONFIG_DIR", self.layout.app_config_dir(&app.name))
            .env("APP_LOG_FILE", &log_path)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        if let Some(port) = app.port {
            cmd.env("APP_PORT", port.to_string());
        }

        // Own process group: a ^C aimed at the supervisor must not reach the
        // children before the ordered shutdown does.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let mut child = cmd.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                SpawnError::MissingExecutable(command.clone())
            } else {
                SpawnError::Exec {
                    command: command.clone(),
                    source,
                }
            }
        })?;

        let pid = child.id();
        let pid_file = self.layout.pid_file(&app.name);
        if let Err(source) = std::fs::write(&pid_file, format!("{}\n", pid)) {
            error!("Failed to write PID file {}: {}", pid_file.display(), source);
            let _ = child.kill();
            let _ = child.wait();
            return Err(SpawnError::Prepare { path: pid_file, source });
        }
        info!("Spawned '{}' with PID {}", app.name, pid);

        if let Ok(mut children) = self.children.lock() {
            children.insert(app.name.clone(), child);
        }

        Ok(ProcessHandle {
            name: app.name.clone(),
            pid,
        })
    }

    fn is_alive(&self, handle: &ProcessHandle) -> bool {
        if let Ok(mut children) = self.children.lock() {
            if let Some(child) = children.get_mut(&handle.name) {
                if child.id() == handle.pid {
                    match child.try_wait() {
                        Ok(None) => return true,
                        Ok(Some(status)) => {
                            debug!("'{}' (PID {}) exited: {}", handle.name, handle.pid, status);
                            children.remove(&handle.name);
                            drop(children);
                            self.remove_pid_file(&handle.name);
                            return false;
                        }
                        Err(e) => {
                            warn!("Error checking '{}' status: {}", handle.name, e);
                        }
                    }
                }
            }
        }

        // Not our child (or try_wait failed): fall back to signal 0
        if platform::is_process_running(handle.pid) {
            true
        } else {
            self.remove_pid_file(&handle.name);
            false
        }
    }

    fn signal(&self, handle: &ProcessHandle, signal: Signal) -> Result<(), SignalError> {
        debug!("Sending {} to '{}' (PID {})", signal, handle.name, handle.pid);
        match platform::send_signal(handle.pid, signal) {
            Ok(()) => Ok(()),
            Err(e) if platform::is_no_such_process(&e) => {
                debug!("'{}' (PID {}) already gone", handle.name, handle.pid);
                Ok(())
            }
            Err(source) => Err(SignalError {
                pid: handle.pid,
                signal: signal.to_string(),
                source,
            }),
        }
    }

    fn release(&self, handle: &ProcessHandle) {
        if let Ok(mut children) = self.children.lock() {
            let ours = children
                .get(&handle.name)
                .map(|child| child.id() == handle.pid)
                .unwrap_or(false);
            if ours {
                if let Some(mut child) = children.remove(&handle.name) {
                    // Reap if it has exited; otherwise it is orphaned here
                    if let Ok(None) = child.try_wait() {
                        warn!("Releasing '{}' (PID {}) while still alive", handle.name, handle.pid);
                    }
                }
            }
        }
        self.remove_pid_file(&handle.name);
    }
}
