//! Available-memory probes used to size caches and search batches

use std::sync::Mutex;
use sysinfo::{Pid, System};

/// Source of the currently available memory, in bytes
pub trait MemoryProbe: Send + Sync {
    fn available_bytes(&self) -> u64;

    /// Share of total memory held by this process, in percent
    fn process_usage_percent(&self) -> u8 {
        0
    }
}

/// Reads available memory from the operating system
pub struct SystemMemoryProbe {
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl SystemMemoryProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }
}

impl Default for SystemMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemoryProbe {
    fn available_bytes(&self) -> u64 {
        match self.system.lock() {
            Ok(mut system) => {
                system.refresh_memory();
                system.available_memory()
            }
            Err(_) => 0,
        }
    }

    fn process_usage_percent(&self) -> u8 {
        let (Some(pid), Ok(mut system)) = (self.pid, self.system.lock()) else {
            return 0;
        };
        system.refresh_memory();
        if !system.refresh_process(pid) {
            return 0;
        }
        let total = system.total_memory();
        let used = system.process(pid).map_or(0, |process| process.memory());
        percent_of(used, total)
    }
}

fn percent_of(part: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    (part.saturating_mul(100) / total).min(100) as u8
}

/// Constant probe for tests and constrained hosts
pub struct FixedMemoryProbe(pub u64);

impl MemoryProbe for FixedMemoryProbe {
    fn available_bytes(&self) -> u64 {
        self.0
    }
}

/// Number of records that fit in `fraction` of the available memory
///
/// Never returns less than one so that a search always makes progress.
pub fn records_for_budget(probe: &dyn MemoryProbe, fraction: f64, record_bytes: f64) -> usize {
    let budget = probe.available_bytes() as f64 * fraction;
    let records = (budget / record_bytes).floor();
    if records.is_finite() && records >= 1.0 {
        records as usize
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_for_budget() {
        let probe = FixedMemoryProbe(14_000_000);
        assert_eq!(records_for_budget(&probe, 0.1, 14_000.0), 100);
    }

    #[test]
    fn test_percent_of() {
        assert_eq!(percent_of(15, 100), 15);
        assert_eq!(percent_of(1, 0), 0);
        assert_eq!(percent_of(300, 100), 100);
    }

    #[test]
    fn test_records_for_budget_never_zero() {
        let probe = FixedMemoryProbe(0);
        assert_eq!(records_for_budget(&probe, 0.1, 14_000.0), 1);
    }
}
