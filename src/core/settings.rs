//! Supervisor settings and the filesystem layout derived from them

use std::path::{Path, PathBuf};

use clap::Parser;

use super::manifest::AppDescriptor;

/// Supervisor settings, from flags or environment
#[derive(Debug, Clone, Parser)]
#[command(name = "app-manager", version, about = "Supervise the applications of the APP partition")]
pub struct Settings {
    /// Path to the global manifest; app bundles live next to it
    #[arg(
        long = "manifest",
        env = "APP_MANAGER_MANIFEST",
        default_value = "/app/manifest.json"
    )]
    pub manifest_path: PathBuf,

    /// Root of the writable data partition
    #[arg(long, env = "APP_MANAGER_DATA_DIR", default_value = "/data")]
    pub data_dir: PathBuf,

    /// Directory holding PID files and the control socket
    #[arg(long, env = "APP_MANAGER_RUN_DIR", default_value = "/run/app")]
    pub run_dir: PathBuf,

    /// Directory holding per-app logs and the supervisor's own log
    #[arg(long, env = "APP_MANAGER_LOG_DIR", default_value = "/var/log/app")]
    pub log_dir: PathBuf,

    /// Control socket path (defaults to `<run-dir>/app-manager.sock`)
    #[arg(long = "socket", env = "APP_MANAGER_SOCKET")]
    pub socket_path: Option<PathBuf>,

    /// Default log level when RUST_LOG is not set
    #[arg(long, env = "APP_MANAGER_LOG", default_value = "info")]
    pub log_level: String,

    /// Upper bound on lines returned by a single log read
    #[arg(long, env = "APP_MANAGER_MAX_LOG_LINES", default_value_t = 1000)]
    pub max_log_lines: usize,
}

impl Settings {
    /// Validate settings and fix any invalid values
    pub fn validate(&mut self) {
        self.max_log_lines = self.max_log_lines.max(1);
        if self.log_level.trim().is_empty() {
            self.log_level = "info".to_string();
        }
    }

    /// Get the control socket path
    pub fn get_socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| self.run_dir.join("app-manager.sock"))
    }

    /// Get the supervisor's own log file
    pub fn get_manager_log_file(&self) -> PathBuf {
        self.log_dir.join("app-manager.log")
    }

    /// Get the application bundle directory
    pub fn get_bundle_directory(&self) -> PathBuf {
        self.manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("/app"))
    }

    pub fn layout(&self) -> Layout {
        Layout {
            bundle_dir: self.get_bundle_directory(),
            data_dir: self.data_dir.clone(),
            run_dir: self.run_dir.clone(),
            log_dir: self.log_dir.clone(),
        }
    }
}

/// Where per-app files live
#[derive(Debug, Clone)]
pub struct Layout {
    pub bundle_dir: PathBuf,
    pub data_dir: PathBuf,
    pub run_dir: PathBuf,
    pub log_dir: PathBuf,
}

impl Layout {
    /// Read-only bundle of an app (`/app/<name>`)
    pub fn app_bundle_dir(&self, name: &str) -> PathBuf {
        self.bundle_dir.join(name)
    }

    pub fn app_data_dir(&self, name: &str) -> PathBuf {
        self.data_dir.join("app-data").join(name)
    }

    pub fn app_config_dir(&self, name: &str) -> PathBuf {
        self.data_dir.join("app-config").join(name)
    }

    pub fn pid_file(&self, name: &str) -> PathBuf {
        self.run_dir.join(format!("{}.pid", name))
    }

    /// Log file of an app: its manifest's choice or `<log-dir>/<name>.log`
    pub fn log_file(&self, app: &AppDescriptor) -> PathBuf {
        match &app.log_file {
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.log_dir.join(path),
            None => self.log_dir.join(format!("{}.log", app.name)),
        }
    }

    /// Resolve a path from an app manifest against its bundle directory
    pub fn resolve(&self, name: &str, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.app_bundle_dir(name).join(path)
        }
    }

    /// Bare names go through PATH; anything with a slash is a bundle path
    pub fn resolve_command(&self, name: &str, command: &Path) -> PathBuf {
        if command.is_absolute() || command.components().count() > 1 {
            self.resolve(name, command)
        } else {
            command.to_path_buf()
        }
    }

    pub fn working_dir(&self, app: &AppDescriptor) -> PathBuf {
        match &app.startup.working_dir {
            Some(dir) => self.resolve(&app.name, dir),
            None => self.app_bundle_dir(&app.name),
        }
    }

    /// Create the directories the supervisor writes into
    pub fn ensure_base_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.run_dir)?;
        std::fs::create_dir_all(&self.log_dir)?;
        std::fs::create_dir_all(self.data_dir.join("app-data"))?;
        std::fs::create_dir_all(self.data_dir.join("app-config"))?;
        Ok(())
    }
}
