//! Runtime state - What the supervisor knows about one application right now

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of an application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppStatus {
    /// Spawned, not yet probed
    Starting,
    /// Last health check passed
    Running,
    /// Process alive, last health check failed
    Unhealthy,
    /// Not running
    Stopped,
    /// Spawn failed or the process exited without being asked to
    Failed,
}

impl AppStatus {
    /// Statuses that imply a live child
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Starting | Self::Running | Self::Unhealthy)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Unhealthy => "unhealthy",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for AppStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Outcome of a single health evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthVerdict {
    Healthy,
    Unhealthy,
    Stopped,
    Unknown,
}

/// Detail of the most recent health evaluation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_check: Option<DateTime<Utc>>,
}

impl HealthReport {
    pub fn unknown() -> Self {
        Self {
            status: HealthVerdict::Unknown,
            response_time_ms: None,
            status_code: None,
            error: None,
            last_check: None,
        }
    }

    pub fn healthy(response_time_ms: Option<f64>, status_code: Option<u16>) -> Self {
        Self {
            status: HealthVerdict::Healthy,
            response_time_ms,
            status_code,
            error: None,
            last_check: Some(Utc::now()),
        }
    }

    pub fn unhealthy(error: impl Into<String>, response_time_ms: Option<f64>, status_code: Option<u16>) -> Self {
        Self {
            status: HealthVerdict::Unhealthy,
            response_time_ms,
            status_code,
            error: Some(error.into()),
            last_check: Some(Utc::now()),
        }
    }

    pub fn stopped() -> Self {
        Self {
            status: HealthVerdict::Stopped,
            response_time_ms: None,
            status_code: None,
            error: None,
            last_check: Some(Utc::now()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthVerdict::Healthy
    }
}

/// Mutable per-app state. Only the lifecycle controller writes it.
///
/// `pid` is `Some` exactly while the status is active; every transition to
/// stopped or failed clears it.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    pub status: AppStatus,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_health: HealthReport,
    pub consecutive_failures: u32,
    pub memory_bytes: u64,
    pub last_error: Option<String>,
    /// An operator or shutdown stop is underway; exits are expected
    pub stopping: bool,
    pub start_count: u32,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            status: AppStatus::Stopped,
            pid: None,
            started_at: None,
            stopped_at: None,
            last_health: HealthReport::unknown(),
            consecutive_failures: 0,
            memory_bytes: 0,
            last_error: None,
            stopping: false,
            start_count: 0,
        }
    }
}

impl RuntimeState {
    /// Get uptime duration if running
    pub fn uptime(&self) -> Option<chrono::Duration> {
        if !self.status.is_active() {
            return None;
        }
        self.started_at.map(|started| Utc::now() - started)
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.uptime()
            .map(|duration| duration.num_seconds().max(0) as u64)
            .unwrap_or(0)
    }

    /// Format uptime as human-readable string
    pub fn uptime_string(&self) -> String {
        match self.uptime() {
            Some(duration) => format_uptime(duration.num_seconds().max(0)),
            None => "N/A".to_string(),
        }
    }

    /// Mark app as starting
    pub fn mark_starting(&mut self, pid: u32) {
        self.status = AppStatus::Starting;
        self.pid = Some(pid);
        self.started_at = Some(Utc::now());
        self.stopped_at = None;
        self.last_health = HealthReport::unknown();
        self.consecutive_failures = 0;
        self.memory_bytes = 0;
        self.last_error = None;
        self.stopping = false;
        self.start_count += 1;
    }

    /// Mark app as stopped
    pub fn mark_stopped(&mut self) {
        self.status = AppStatus::Stopped;
        self.pid = None;
        self.stopped_at = Some(Utc::now());
        self.memory_bytes = 0;
        self.stopping = false;
    }

    /// Mark app as failed
    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = AppStatus::Failed;
        self.pid = None;
        self.stopped_at = Some(Utc::now());
        self.last_error = Some(error.into());
        self.memory_bytes = 0;
        self.stopping = false;
    }

    /// Apply a health report for the current child
    pub fn record_health(&mut self, report: HealthReport) {
        if report.is_healthy() {
            self.status = AppStatus::Running;
            self.consecutive_failures = 0;
        } else {
            self.status = AppStatus::Unhealthy;
            self.consecutive_failures += 1;
        }
        self.last_health = report;
    }
}

/// Format seconds the way the dashboard shows them
pub fn format_uptime(secs: i64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h", secs / 86400, (secs % 86400) / 3600)
    }
}
