//! Serializable point-in-time view of the inventory.

use chrono::{DateTime, Utc};
use parking_lot::MutexGuard;
use serde::Serialize;

use super::{BankSet, HardwareInventory, Kernel, SessionRecord};
use crate::error::Result;

#[derive(Debug, Clone, Serialize)]
pub struct CuSnapshot {
    pub cu_index: u32,
    pub name: String,
    pub in_use: bool,
    pub banks: BankSet,
    pub default_bank: u32,
    pub soft_kernel: bool,
    pub max_channel_id: Option<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub dev_index: u32,
    pub handle: u64,
    pub cus: Vec<CuSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InventorySnapshot {
    pub initialized: bool,
    pub num_devices: u32,
    pub devices: Vec<DeviceSnapshot>,
    pub total_sessions: u32,
    pub decoder_sessions: u32,
    pub active_sessions: Vec<SessionRecord>,
    pub started_at: DateTime<Utc>,
    pub uptime_sec: u64,
}

impl From<&Kernel> for CuSnapshot {
    fn from(k: &Kernel) -> Self {
        Self {
            cu_index: k.cu_index(),
            name: k.name().to_string(),
            in_use: k.in_use(),
            banks: *k.banks(),
            default_bank: k.default_bank(),
            soft_kernel: k.is_soft_kernel(),
            max_channel_id: k.channels().map(|c| c.max_channel_id),
        }
    }
}

impl HardwareInventory {
    /// Read the whole inventory under the lock.
    pub fn snapshot(&self) -> Result<InventorySnapshot> {
        let state = self.lock()?;
        let devices = state
            .devices
            .iter()
            .map(|d| DeviceSnapshot {
                dev_index: d.dev_index(),
                handle: d.handle().0,
                cus: d.kernels().iter().map(|k| CuSnapshot::from(k.as_ref())).collect(),
            })
            .collect();

        let snapshot = InventorySnapshot {
            initialized: self.is_initialized(),
            num_devices: state.num_devices,
            devices,
            total_sessions: state.total_sessions,
            decoder_sessions: state.decoder_sessions,
            active_sessions: state.sessions.values().cloned().collect(),
            started_at: self.started_at,
            uptime_sec: (Utc::now() - self.started_at).num_seconds().max(0) as u64,
        };
        MutexGuard::unlock_fair(state);
        Ok(snapshot)
    }
}
