//! Aggregation of host resource signals into pause reasons

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ResourceConfig;
use crate::state::PauseReasons;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThermalState {
    Nominal,
    Fair,
    Serious,
    Critical,
}

/// One observation reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceSignal {
    Network { connected: bool, metered: bool },
    Thermal(ThermalState),
    LowPower(bool),
    FreeStorage(u64),
    /// User allowed or forbade indexing over metered connections
    MobileDataAllowed(bool),
}

/// Latest known host conditions
#[derive(Debug, Clone)]
pub struct ResourceMonitor {
    low_storage_bytes: u64,
    mobile_data_allowed: bool,
    connected: bool,
    metered: bool,
    thermal: ThermalState,
    low_power: bool,
    free_storage: Option<u64>,
}

impl ResourceMonitor {
    pub fn new(config: &ResourceConfig) -> Self {
        Self {
            low_storage_bytes: config.low_storage_bytes,
            mobile_data_allowed: !config.wifi_only,
            connected: true,
            metered: false,
            thermal: ThermalState::Nominal,
            low_power: false,
            free_storage: None,
        }
    }

    /// Record `signal` and return the resulting reasons
    ///
    /// The user pause flag is not a resource condition and is always false.
    pub fn apply(&mut self, signal: ResourceSignal) -> PauseReasons {
        debug!("Resource signal {:?}", signal);
        match signal {
            ResourceSignal::Network { connected, metered } => {
                self.connected = connected;
                self.metered = metered;
            }
            ResourceSignal::Thermal(state) => self.thermal = state,
            ResourceSignal::LowPower(on) => self.low_power = on,
            ResourceSignal::FreeStorage(bytes) => self.free_storage = Some(bytes),
            ResourceSignal::MobileDataAllowed(allowed) => self.mobile_data_allowed = allowed,
        }
        self.reasons()
    }

    pub fn reasons(&self) -> PauseReasons {
        let (network, wifi) = if !self.connected {
            (true, true)
        } else if self.metered && !self.mobile_data_allowed {
            (false, true)
        } else {
            (false, false)
        };

        PauseReasons {
            network,
            wifi,
            battery: self.low_power,
            thermal: matches!(self.thermal, ThermalState::Serious | ThermalState::Critical),
            storage: self
                .free_storage
                .map_or(false, |free| free < self.low_storage_bytes),
            user: false,
        }
    }
}
