//! Hardware inventory -- devices, compute units and the exclusive-access lock.
//!
//! The inventory is the only state shared between sessions. Every mutation
//! (`create`, `destroy`, initialization) happens while holding its lock, which
//! is acquired with a bounded wait so contention surfaces as
//! [`SessionError::LockTimeout`] instead of an unbounded spin.

pub mod bank;
pub mod snapshot;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, error, info, warn};

pub use bank::{BankSet, MAX_DDR_MAP};
pub use snapshot::{CuSnapshot, DeviceSnapshot, InventorySnapshot};

use crate::error::{Result, SessionError};
use crate::session::SessionKind;

/// Opaque device token handed to plugins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DeviceHandle(pub u64);

/// Channel support declared by a dataflow CU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelCapability {
    pub max_channel_id: u32,
}

// ---------------------------------------------------------------------------
// Layout (bootstrap input)
// ---------------------------------------------------------------------------

/// Description of one CU, as discovered by the bootstrap.
#[derive(Debug, Clone)]
pub struct KernelSpec {
    pub name: String,
    pub banks: BankSet,
    pub default_bank: u32,
    pub soft_kernel: bool,
    pub channels: Option<ChannelCapability>,
}

/// Description of one device loaded with a hardware image.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub dev_index: u32,
    pub handle: DeviceHandle,
    pub kernels: Vec<KernelSpec>,
}

/// Everything the bootstrap discovered. `num_devices` counts every device
/// present on the host; `devices` only lists the ones carrying an image.
#[derive(Debug, Clone, Default)]
pub struct InventoryLayout {
    pub num_devices: u32,
    pub devices: Vec<DeviceSpec>,
}

// ---------------------------------------------------------------------------
// Kernel / Device
// ---------------------------------------------------------------------------

/// A compute unit on a device.
#[derive(Debug)]
pub struct Kernel {
    name: String,
    cu_index: u32,
    in_use: AtomicBool,
    banks: BankSet,
    default_bank: u32,
    soft_kernel: bool,
    channels: Option<ChannelCapability>,
}

impl Kernel {
    pub(crate) fn from_spec(cu_index: u32, spec: KernelSpec) -> Self {
        Self {
            name: spec.name,
            cu_index,
            in_use: AtomicBool::new(false),
            banks: spec.banks,
            default_bank: spec.default_bank,
            soft_kernel: spec.soft_kernel,
            channels: spec.channels,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cu_index(&self) -> u32 {
        self.cu_index
    }

    /// True once any session has ever been committed to this CU.
    pub fn in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn banks(&self) -> &BankSet {
        &self.banks
    }

    pub fn default_bank(&self) -> u32 {
        self.default_bank
    }

    pub fn is_soft_kernel(&self) -> bool {
        self.soft_kernel
    }

    pub fn channels(&self) -> Option<ChannelCapability> {
        self.channels
    }

    /// Only called with the inventory lock held.
    pub(crate) fn claim(&self) {
        self.in_use.store(true, Ordering::Release);
    }
}

/// A device loaded with a hardware image.
#[derive(Debug)]
pub struct Device {
    dev_index: u32,
    handle: DeviceHandle,
    kernels: Vec<Arc<Kernel>>,
}

impl Device {
    fn from_spec(spec: DeviceSpec) -> Self {
        let kernels = spec
            .kernels
            .into_iter()
            .enumerate()
            .map(|(cu_index, k)| Arc::new(Kernel::from_spec(cu_index as u32, k)))
            .collect();
        Self {
            dev_index: spec.dev_index,
            handle: spec.handle,
            kernels,
        }
    }

    pub fn dev_index(&self) -> u32 {
        self.dev_index
    }

    pub fn handle(&self) -> DeviceHandle {
        self.handle
    }

    pub fn kernels(&self) -> &[Arc<Kernel>] {
        &self.kernels
    }

    pub fn kernel(&self, cu_index: u32) -> Option<&Arc<Kernel>> {
        self.kernels.get(cu_index as usize)
    }

    /// Exact-match lookup by CU name.
    pub fn find_kernel(&self, name: &str) -> Option<&Arc<Kernel>> {
        self.kernels.iter().find(|k| k.name == name)
    }
}

// ---------------------------------------------------------------------------
// Session table
// ---------------------------------------------------------------------------

/// Inventory-side record of a committed session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub session_id: u32,
    pub kind: SessionKind,
    pub dev_index: u32,
    pub cu_index: u32,
    pub cu_name: String,
    pub bank_index: u32,
    pub channel_id: u32,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// HardwareInventory
// ---------------------------------------------------------------------------

/// State guarded by the inventory lock.
#[derive(Debug, Default)]
pub(crate) struct InventoryState {
    pub(crate) num_devices: u32,
    pub(crate) devices: Vec<Device>,
    /// Cumulative; also the id of the most recently committed session.
    pub(crate) total_sessions: u32,
    pub(crate) decoder_sessions: u32,
    pub(crate) sessions: BTreeMap<u32, SessionRecord>,
}

impl InventoryState {
    pub(crate) fn device(&self, dev_index: u32) -> Option<&Device> {
        self.devices.iter().find(|d| d.dev_index == dev_index)
    }
}

/// Process-wide registry of devices and CUs.
pub struct HardwareInventory {
    state: Mutex<InventoryState>,
    initialized: AtomicBool,
    lock_timeout: Duration,
    salt: u64,
    started_at: DateTime<Utc>,
}

impl HardwareInventory {
    pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

    /// An empty, uninitialized inventory. `create` is rejected until
    /// [`initialize`](Self::initialize) runs.
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(InventoryState::default()),
            initialized: AtomicBool::new(false),
            lock_timeout,
            salt: rand::random(),
            started_at: Utc::now(),
        }
    }

    /// Shorthand for `new` followed by `initialize`.
    pub fn with_layout(layout: InventoryLayout, lock_timeout: Duration) -> Result<Self> {
        let inventory = Self::new(lock_timeout);
        inventory.initialize(layout)?;
        Ok(inventory)
    }

    /// Install the devices discovered by the bootstrap and mark the inventory
    /// ready. Session counters survive a re-initialization. A non-soft CU
    /// whose default bank is not in its bank set is rejected and the
    /// inventory is left untouched.
    pub fn initialize(&self, layout: InventoryLayout) -> Result<()> {
        for kernel in layout.devices.iter().flat_map(|d| d.kernels.iter()) {
            if !kernel.soft_kernel && !kernel.banks.contains(kernel.default_bank) {
                error!(
                    cu = %kernel.name,
                    default_bank = kernel.default_bank,
                    banks = ?kernel.banks,
                    "default ddr bank is outside the CU's bank map"
                );
                return Err(SessionError::InvalidBank {
                    cu: kernel.name.clone(),
                    bank: kernel.default_bank,
                    valid: kernel.banks.to_vec(),
                });
            }
        }

        let mut state = self.lock()?;
        if self.is_initialized() {
            warn!("re-initializing hardware inventory");
        }

        state.num_devices = layout.num_devices;
        state.devices = layout.devices.into_iter().map(Device::from_spec).collect();
        self.initialized.store(true, Ordering::Release);

        for device in &state.devices {
            debug!(
                dev_index = device.dev_index,
                cus = device.kernels.len(),
                "device registered"
            );
        }
        info!(
            num_devices = state.num_devices,
            loaded = state.devices.len(),
            "hardware inventory initialized"
        );

        MutexGuard::unlock_fair(state);
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Lock-free; set once the bootstrap has installed a layout.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn total_sessions(&self) -> Result<u32> {
        Ok(self.lock()?.total_sessions)
    }

    pub fn decoder_sessions(&self) -> Result<u32> {
        Ok(self.lock()?.decoder_sessions)
    }

    pub fn active_sessions(&self) -> Result<Vec<SessionRecord>> {
        Ok(self.lock()?.sessions.values().cloned().collect())
    }

    /// `None` when the device or CU does not exist.
    pub fn kernel_in_use(&self, dev_index: u32, cu_index: u32) -> Result<Option<bool>> {
        let state = self.lock()?;
        Ok(state
            .device(dev_index)
            .and_then(|d| d.kernel(cu_index))
            .map(|k| k.in_use()))
    }

    pub(crate) fn salt(&self) -> u64 {
        self.salt
    }

    /// Acquire exclusive access, waiting at most `lock_timeout`.
    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, InventoryState>> {
        self.state
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| {
                warn!(
                    timeout_ms = self.lock_timeout.as_millis() as u64,
                    "inventory lock wait timed out"
                );
                SessionError::LockTimeout {
                    waited_ms: self.lock_timeout.as_millis() as u64,
                }
            })
    }
}

impl std::fmt::Debug for HardwareInventory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareInventory")
            .field("lock_timeout", &self.lock_timeout)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}
