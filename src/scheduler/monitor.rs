//! Resource Pressure Probe
//!
//! The admission gate refuses to dispatch while the host is "hot": CPU
//! utilization above a configured threshold, or too many OS processes
//! matching a configured name (e.g. capping how many `ollama` instances the
//! box runs). The probe sits behind a trait so the scheduler never makes OS
//! calls directly and tests can substitute a fixed reading.

use std::ffi::OsStr;
use std::sync::Mutex;
use sysinfo::{ProcessesToUpdate, System};

pub trait ResourceMonitor: Send + Sync {
    /// Whole-system CPU utilization, 0.0–100.0.
    fn cpu_percent(&self) -> f64;

    /// Number of running processes whose name matches `name`.
    fn process_count(&self, name: &str) -> usize;
}

/// Live probe backed by `sysinfo`.
pub struct SystemMonitor {
    system: Mutex<System>,
}

impl SystemMonitor {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for SystemMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceMonitor for SystemMonitor {
    fn cpu_percent(&self) -> f64 {
        let mut system = self.system.lock().unwrap();
        system.refresh_cpu_usage();
        system.global_cpu_usage() as f64
    }

    fn process_count(&self, name: &str) -> usize {
        let mut system = self.system.lock().unwrap();
        system.refresh_processes(ProcessesToUpdate::All, true);
        system.processes_by_name(OsStr::new(name)).count()
    }
}

/// Fixed readings, for tests and for disabling the gate outright.
pub struct StaticMonitor {
    pub cpu: f64,
    pub processes: usize,
}

impl StaticMonitor {
    /// A probe that never reports pressure.
    pub fn idle() -> Self {
        Self {
            cpu: 0.0,
            processes: 0,
        }
    }
}

impl ResourceMonitor for StaticMonitor {
    fn cpu_percent(&self) -> f64 {
        self.cpu
    }

    fn process_count(&self, _name: &str) -> usize {
        self.processes
    }
}
