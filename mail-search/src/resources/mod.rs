//! Host resource conditions

pub mod memory;
pub mod monitor;

pub use memory::{records_for_budget, FixedMemoryProbe, MemoryProbe, SystemMemoryProbe};
pub use monitor::{ResourceMonitor, ResourceSignal, ThermalState};
