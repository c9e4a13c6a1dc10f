//! Resource monitoring - Per-process memory tracking

use std::sync::{Arc, Mutex};

use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::trace;

/// Samples resource usage of managed processes
pub struct ResourceMonitor {
    system: System,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self {
            system: System::new(),
        }
    }

    /// Resident memory of a process in bytes, refreshed on every call
    pub fn memory_bytes(&mut self, pid: u32) -> Option<u64> {
        let pid = Pid::from_u32(pid);
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::new().with_memory(),
        );
        let memory = self.system.process(pid).map(|process| process.memory());
        trace!("Memory of PID {}: {:?}", pid, memory);
        memory
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Thread-safe wrapper for ResourceMonitor
pub struct SharedResourceMonitor {
    inner: Arc<Mutex<ResourceMonitor>>,
}

impl SharedResourceMonitor {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ResourceMonitor::new())),
        }
    }

    pub fn memory_bytes(&self, pid: u32) -> Option<u64> {
        self.inner.lock().ok()?.memory_bytes(pid)
    }
}

impl Default for SharedResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for SharedResourceMonitor {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn measures_own_memory() {
        let monitor = SharedResourceMonitor::new();
        let memory = monitor.memory_bytes(std::process::id());
        assert!(memory.unwrap_or(0) > 0);
        assert_eq!(monitor.memory_bytes(2_147_483_000), None);
    }
}
