//! TOML configuration for medialloc.
//!
//! Holds runtime knobs (lock timeout, plugin runtime library), logging, and an
//! inventory description used to bootstrap a [`HardwareInventory`] when no
//! device discovery layer is present.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::hw::{
    BankSet, ChannelCapability, DeviceHandle, DeviceSpec, HardwareInventory, InventoryLayout,
    KernelSpec,
};
use crate::plugin::{PluginLoader, DEFAULT_PLUGIN_RUNTIME_LIB};

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MediallocConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub inventory: InventoryConfig,
}

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "MEDIALLOC_CONFIG";

/// Config file read when neither `--config` nor [`CONFIG_ENV`] is set.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/medialloc/medialloc.toml";

/// Config file to read when the caller names none: [`CONFIG_ENV`] if set,
/// otherwise [`SYSTEM_CONFIG_PATH`] if it exists.
pub fn default_path() -> Option<PathBuf> {
    match std::env::var_os(CONFIG_ENV) {
        Some(path) if !path.is_empty() => Some(PathBuf::from(path)),
        _ => {
            let system = Path::new(SYSTEM_CONFIG_PATH);
            system.exists().then(|| system.to_path_buf())
        }
    }
}

impl MediallocConfig {
    /// Parse a TOML document and check the inventory section up front, so a
    /// bad layout is reported against the file rather than on first use.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.inventory.layout()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config =
            Self::from_toml(&content).with_context(|| format!("in {}", path.display()))?;
        info!(
            path = %path.display(),
            devices = config.inventory.devices.len(),
            "configuration loaded"
        );
        Ok(config)
    }

    /// Load `explicit` if given, else the file from [`default_path`], else
    /// compiled-in defaults. A file that is named but unreadable is an error.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit.map(Path::to_path_buf).or_else(default_path) {
            Some(path) => Self::load(&path),
            None => {
                debug!("no configuration file, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn plugin_loader(&self) -> PluginLoader {
        PluginLoader::new(self.runtime.plugin_runtime_lib.clone())
    }

    /// Validate the inventory section and build an initialized inventory.
    pub fn build_inventory(&self) -> Result<HardwareInventory> {
        let layout = self.inventory.layout()?;
        let inventory = HardwareInventory::with_layout(layout, self.runtime.lock_timeout())?;
        Ok(inventory)
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Longest wait for exclusive inventory access (milliseconds).
    pub lock_timeout_ms: u64,
    /// Shared runtime loaded before any plugin library. `None` skips it.
    pub plugin_runtime_lib: Option<PathBuf>,
}

impl RuntimeConfig {
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            lock_timeout_ms: HardwareInventory::DEFAULT_LOCK_TIMEOUT.as_millis() as u64,
            plugin_runtime_lib: Some(PathBuf::from(DEFAULT_PLUGIN_RUNTIME_LIB)),
        }
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Minimum tracing level (`trace`, `debug`, `info`, `warn`, `error`).
    pub level: String,
    /// Emit JSON lines instead of the human-readable format.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Inventory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    /// Devices present on the host. Defaults to one past the highest
    /// configured `dev_index`.
    pub num_devices: Option<u32>,
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub dev_index: u32,
    #[serde(default)]
    pub handle: u64,
    #[serde(default)]
    pub kernels: Vec<KernelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    pub name: String,
    #[serde(default)]
    pub banks: Vec<u32>,
    /// Defaults to the lowest entry of `banks`.
    #[serde(default)]
    pub default_bank: Option<u32>,
    #[serde(default)]
    pub soft_kernel: bool,
    /// Set for dataflow CUs with channel support.
    #[serde(default)]
    pub max_channel_id: Option<u32>,
}

impl InventoryConfig {
    pub fn layout(&self) -> Result<InventoryLayout> {
        let num_devices = match self.num_devices {
            Some(n) => n,
            None => self.devices.iter().try_fold(0u32, |n, d| {
                d.dev_index
                    .checked_add(1)
                    .map(|next| n.max(next))
                    .with_context(|| format!("device index {} is out of range", d.dev_index))
            })?,
        };

        let mut seen_devices = HashSet::new();
        let mut devices = Vec::with_capacity(self.devices.len());
        for dev in &self.devices {
            if dev.dev_index >= num_devices {
                bail!(
                    "device {} is outside num_devices ({})",
                    dev.dev_index,
                    num_devices
                );
            }
            if !seen_devices.insert(dev.dev_index) {
                bail!("device {} is configured more than once", dev.dev_index);
            }
            devices.push(dev.spec()?);
        }

        Ok(InventoryLayout {
            num_devices,
            devices,
        })
    }
}

impl DeviceConfig {
    fn spec(&self) -> Result<DeviceSpec> {
        let mut names = HashSet::new();
        let mut kernels = Vec::with_capacity(self.kernels.len());
        for k in &self.kernels {
            if !names.insert(k.name.as_str()) {
                bail!("device {}: duplicate CU name '{}'", self.dev_index, k.name);
            }
            kernels.push(
                k.spec()
                    .with_context(|| format!("device {}: CU '{}'", self.dev_index, k.name))?,
            );
        }
        Ok(DeviceSpec {
            dev_index: self.dev_index,
            handle: DeviceHandle(self.handle),
            kernels,
        })
    }
}

impl KernelConfig {
    fn spec(&self) -> Result<KernelSpec> {
        let banks = BankSet::from_banks(&self.banks)
            .map_err(|bank| anyhow::anyhow!("bank {} exceeds the bank map", bank))?;

        if banks.is_empty() && !self.soft_kernel {
            bail!("CU has no memory banks; list one in `banks` or set soft_kernel");
        }

        let default_bank = match (self.default_bank, banks.lowest()) {
            (Some(bank), _) if self.soft_kernel || banks.contains(bank) => bank,
            (Some(bank), _) => bail!("default bank {} is not in {:?}", bank, banks),
            (None, Some(lowest)) => lowest,
            (None, None) => 0,
        };

        Ok(KernelSpec {
            name: self.name.clone(),
            banks,
            default_bank,
            soft_kernel: self.soft_kernel,
            channels: self
                .max_channel_id
                .map(|max_channel_id| ChannelCapability { max_channel_id }),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
