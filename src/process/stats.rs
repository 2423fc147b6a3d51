use parking_lot::Mutex;
use serde::Serialize;
use sysinfo::{Pid, Signal, System};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    pub cpu_usage: f32,
    /// Resident memory in bytes.
    pub memory_usage: u64,
}

/// Shared `sysinfo` handle. CPU usage is computed between two refreshes, so the
/// same `System` is kept around for the daemon's lifetime.
pub struct ProcessProbe {
    system: Mutex<System>,
}

impl Default for ProcessProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    pub fn usage(&self, pid: u32) -> Option<ResourceUsage> {
        let pid = Pid::from_u32(pid);
        let mut sys = self.system.lock();
        if !sys.refresh_process(pid) {
            debug!(pid = %pid, "Process not found while sampling usage");
            return None;
        }
        sys.process(pid).map(|process| ResourceUsage {
            cpu_usage: process.cpu_usage(),
            memory_usage: process.memory(),
        })
    }

    /// Sends SIGTERM (or the platform equivalent). Returns whether the signal was delivered.
    pub fn terminate(&self, pid: u32) -> bool {
        let pid = Pid::from_u32(pid);
        let mut sys = self.system.lock();
        if !sys.refresh_process(pid) {
            return false;
        }
        match sys.process(pid).and_then(|process| process.kill_with(Signal::Term)) {
            Some(delivered) => delivered,
            None => {
                warn!(pid = %pid, "SIGTERM is not supported on this platform, killing instead");
                sys.process(pid).map(|process| process.kill()).unwrap_or(false)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn samples_own_process() {
        let probe = ProcessProbe::new();
        let usage = probe.usage(std::process::id()).expect("own process is visible");
        assert!(usage.memory_usage > 0);
    }

    #[test]
    fn unknown_pid_has_no_usage() {
        let probe = ProcessProbe::new();
        assert!(probe.usage(u32::MAX - 1).is_none());
        assert!(!probe.terminate(u32::MAX - 1));
    }
}
