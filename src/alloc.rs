//! Allocator -- matches a session request against the inventory.
//!
//! Runs with the inventory lock held and never mutates it: marking the CU
//! `in_use` and bumping counters happens only after the plugin's `init`
//! succeeds.

use std::fmt;

use bytes::Bytes;
use tracing::{debug, error, warn};

use crate::error::{Result, SessionError};
use crate::hw::{InventoryState, Kernel};
use crate::plugin::{DecoderPlugin, PluginSource, PluginVersion, MIN_PLUGIN_VERSION};
use crate::session::Assignment;

/// How a request names its CU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CuSelector {
    Index(u32),
    /// Exact-match CU name.
    Name(String),
}

impl fmt::Display for CuSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Index(i) => write!(f, "#{}", i),
            Self::Name(n) => f.write_str(n),
        }
    }
}

/// Client-supplied parameters for a new decoder session.
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub dev_index: u32,
    pub cu: CuSelector,
    /// `None` selects the CU's default bank.
    pub ddr_bank: Option<u32>,
    pub channel_id: u32,
    pub plugin: PluginSource,
    /// Opaque configuration forwarded to the plugin.
    pub properties: Bytes,
}

impl SessionRequest {
    pub fn new(dev_index: u32, cu: CuSelector, plugin: PluginSource) -> Self {
        Self {
            dev_index,
            cu,
            ddr_bank: None,
            channel_id: 0,
            plugin,
            properties: Bytes::new(),
        }
    }

    pub fn with_bank(mut self, bank: u32) -> Self {
        self.ddr_bank = Some(bank);
        self
    }

    pub fn with_channel(mut self, channel_id: u32) -> Self {
        self.channel_id = channel_id;
        self
    }

    pub fn with_properties(mut self, properties: impl Into<Bytes>) -> Self {
        self.properties = properties.into();
        self
    }
}

/// Validate `request` against the inventory and the resolved plugin.
pub(crate) fn allocate(
    state: &InventoryState,
    request: &SessionRequest,
    plugin: &dyn DecoderPlugin,
) -> Result<Assignment> {
    let dev_index = request.dev_index;

    // 1. Device
    if dev_index >= state.num_devices {
        error!(
            dev_index,
            num_devices = state.num_devices,
            "session creation failed: dev_index not found"
        );
        return Err(SessionError::InvalidDevice {
            dev_index,
            detail: "dev_index not found",
        });
    }
    let device = state.device(dev_index).ok_or_else(|| {
        error!(dev_index, "session creation failed: device has no hardware image loaded");
        SessionError::InvalidDevice {
            dev_index,
            detail: "no hardware image loaded",
        }
    })?;

    // 2. CU
    let kernel = match &request.cu {
        CuSelector::Index(cu_index) => device.kernel(*cu_index).ok_or_else(|| {
            error!(dev_index, cu_index, "session creation failed: invalid cu_index");
            SessionError::InvalidCu {
                dev_index,
                cu_index: *cu_index,
                num_cus: device.kernels().len(),
            }
        })?,
        CuSelector::Name(name) => device.find_kernel(name).ok_or_else(|| {
            error!(dev_index, cu = %name, "session creation failed: CU not found");
            SessionError::CuNotFound {
                dev_index,
                name: name.clone(),
            }
        })?,
    };
    if kernel.in_use() {
        debug!(cu = kernel.name(), "session sharing CU");
    } else {
        debug!(cu = kernel.name(), "session with CU");
    }

    // 3. Bank
    let bank_index = resolve_bank(kernel, request.ddr_bank)?;

    // 4. Channel
    if let Some(channels) = kernel.channels() {
        if request.channel_id > channels.max_channel_id {
            error!(
                cu = kernel.name(),
                max_channel_id = channels.max_channel_id,
                channel_id = request.channel_id,
                "session creation failed: channel_id above CU limit"
            );
            return Err(SessionError::InvalidChannel {
                cu: kernel.name().to_string(),
                channel_id: request.channel_id,
                max_channel_id: channels.max_channel_id,
            });
        }
    }

    // 5. Plugin ABI
    check_plugin_version(plugin)?;

    Ok(Assignment::new(
        device.dev_index(),
        bank_index,
        device.handle(),
        kernel.clone(),
    ))
}

fn resolve_bank(kernel: &Kernel, requested: Option<u32>) -> Result<u32> {
    if kernel.is_soft_kernel() {
        if matches!(requested, Some(bank) if bank != 0) {
            warn!(cu = kernel.name(), "soft kernel only allows ddr bank 0");
        }
        debug!(cu = kernel.name(), bank = 0, "soft kernel ddr bank");
        return Ok(0);
    }

    let (bank, source) = match requested {
        None => (kernel.default_bank(), "default"),
        Some(bank) => (bank, "user supplied"),
    };
    if kernel.banks().contains(bank) {
        debug!(cu = kernel.name(), bank, source, "ddr bank");
        return Ok(bank);
    }
    error!(
        cu = kernel.name(),
        bank,
        source,
        valid = ?kernel.banks(),
        "ddr bank is not in the CU's bank map"
    );
    Err(SessionError::InvalidBank {
        cu: kernel.name().to_string(),
        bank,
        valid: kernel.banks().to_vec(),
    })
}

fn check_plugin_version(plugin: &dyn DecoderPlugin) -> Result<PluginVersion> {
    let found = plugin.version().unwrap_or(PluginVersion::UNKNOWN);
    if !found.is_compatible() {
        error!(
            plugin = plugin.name(),
            found = %found,
            required = %MIN_PLUGIN_VERSION,
            "plugin is incompatible with this runtime"
        );
        return Err(SessionError::IncompatiblePlugin {
            found,
            required: MIN_PLUGIN_VERSION,
        });
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::hw::tests::layout;
    use crate::hw::HardwareInventory;
    use crate::plugin::{Frame, FrameProperties, PluginStatus, DataBuffer, PLUGIN_SUCCESS};
    use crate::session::DecoderSession;

    struct Versioned(std::result::Result<PluginVersion, PluginStatus>);

    impl DecoderPlugin for Versioned {
        fn name(&self) -> &str {
            "versioned"
        }
        fn version(&self) -> std::result::Result<PluginVersion, PluginStatus> {
            self.0
        }
        fn plugin_data_size(&self) -> usize {
            0
        }
        fn init(&self, _: &mut DecoderSession) -> PluginStatus {
            PLUGIN_SUCCESS
        }
        fn close(&self, _: &mut DecoderSession) -> PluginStatus {
            PLUGIN_SUCCESS
        }
        fn send_data(&self, _: &mut DecoderSession, _: &DataBuffer, _: &mut usize) -> PluginStatus {
            PLUGIN_SUCCESS
        }
        fn get_properties(&self, _: &mut DecoderSession, _: &mut FrameProperties) -> PluginStatus {
            PLUGIN_SUCCESS
        }
        fn recv_frame(&self, _: &mut DecoderSession, _: &mut Frame) -> PluginStatus {
            PLUGIN_SUCCESS
        }
    }

    fn good() -> Versioned {
        Versioned(Ok(PluginVersion::new(2019, 2)))
    }

    fn request(dev_index: u32, cu: CuSelector) -> SessionRequest {
        SessionRequest::new(dev_index, cu, PluginSource::Static(Arc::new(good())))
    }

    fn run(req: &SessionRequest, plugin: &dyn DecoderPlugin) -> Result<Assignment> {
        let inv = HardwareInventory::with_layout(layout(), Duration::from_millis(50)).unwrap();
        let state = inv.lock().unwrap();
        allocate(&state, req, plugin)
    }

    #[test]
    fn test_device_out_of_range() {
        let err = run(&request(3, CuSelector::Index(0)), &good()).unwrap_err();
        assert!(matches!(err, SessionError::InvalidDevice { dev_index: 3, .. }));
    }

    #[test]
    fn test_device_without_image() {
        let err = run(&request(1, CuSelector::Index(0)), &good()).unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidDevice { dev_index: 1, detail: "no hardware image loaded" }
        ));
    }

    #[test]
    fn test_cu_index_out_of_range() {
        let err = run(&request(0, CuSelector::Index(3)), &good()).unwrap_err();
        assert!(matches!(err, SessionError::InvalidCu { cu_index: 3, num_cus: 3, .. }));
    }

    #[test]
    fn test_cu_lookup_by_name() {
        let a = run(&request(0, CuSelector::Name("decoder:dataflow".into())), &good()).unwrap();
        assert_eq!(a.cu_index(), 2);
        assert_eq!(a.bank_index(), 1);

        let err = run(&request(0, CuSelector::Name("decoder:dataflo".into())), &good()).unwrap_err();
        assert!(matches!(err, SessionError::CuNotFound { .. }));
    }

    #[test]
    fn test_default_bank_is_used_when_omitted() {
        let a = run(&request(2, CuSelector::Index(0)), &good()).unwrap();
        assert_eq!(a.dev_index(), 2);
        assert_eq!(a.bank_index(), 3);
    }

    #[test]
    fn test_explicit_bank_must_be_in_map() {
        let a = run(&request(0, CuSelector::Index(0)).with_bank(1), &good()).unwrap();
        assert_eq!(a.bank_index(), 1);

        let err = run(&request(0, CuSelector::Index(0)).with_bank(2), &good()).unwrap_err();
        match err {
            SessionError::InvalidBank { bank, valid, .. } => {
                assert_eq!(bank, 2);
                assert_eq!(valid, vec![0, 1]);
            }
            other => panic!("unexpected error: {other}"),
        }

        let err = run(&request(0, CuSelector::Index(0)).with_bank(200), &good()).unwrap_err();
        assert!(matches!(err, SessionError::InvalidBank { bank: 200, .. }));
    }

    #[test]
    fn test_default_bank_is_checked_against_map() {
        let banks = crate::hw::BankSet::from_banks(&[1]).unwrap();
        let kernel = Kernel::from_spec(
            0,
            crate::hw::KernelSpec {
                name: "decoder:decoder_1".into(),
                banks,
                default_bank: 5,
                soft_kernel: false,
                channels: None,
            },
        );
        let err = resolve_bank(&kernel, None).unwrap_err();
        assert!(matches!(err, SessionError::InvalidBank { bank: 5, .. }));
        assert_eq!(resolve_bank(&kernel, Some(1)).unwrap(), 1);
    }

    #[test]
    fn test_soft_kernel_forces_bank_zero() {
        let a = run(&request(0, CuSelector::Index(1)), &good()).unwrap();
        assert_eq!(a.bank_index(), 0);
        let a = run(&request(0, CuSelector::Index(1)).with_bank(5), &good()).unwrap();
        assert_eq!(a.bank_index(), 0);
    }

    #[test]
    fn test_channel_limit() {
        assert!(run(&request(0, CuSelector::Index(2)).with_channel(3), &good()).is_ok());
        let err = run(&request(0, CuSelector::Index(2)).with_channel(4), &good()).unwrap_err();
        assert!(matches!(
            err,
            SessionError::InvalidChannel { channel_id: 4, max_channel_id: 3, .. }
        ));
        // CUs without channel support accept any id.
        assert!(run(&request(0, CuSelector::Index(0)).with_channel(99), &good()).is_ok());
    }

    #[test]
    fn test_plugin_version_gate() {
        let req = request(0, CuSelector::Index(0));
        let old = Versioned(Ok(PluginVersion::new(2019, 1)));
        assert!(matches!(
            run(&req, &old),
            Err(SessionError::IncompatiblePlugin { .. })
        ));
        assert!(run(&req, &Versioned(Ok(PluginVersion::new(2020, 0)))).is_ok());

        let failing = Versioned(Err(-1));
        match run(&req, &failing).unwrap_err() {
            SessionError::IncompatiblePlugin { found, .. } => {
                assert_eq!(found, PluginVersion::UNKNOWN)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_device_checked_before_plugin() {
        let old = Versioned(Ok(PluginVersion::new(2018, 0)));
        let err = run(&request(9, CuSelector::Index(0)), &old).unwrap_err();
        assert!(matches!(err, SessionError::InvalidDevice { .. }));
    }

    #[test]
    fn test_allocation_does_not_claim_cu() {
        let inv = HardwareInventory::with_layout(layout(), Duration::from_millis(50)).unwrap();
        {
            let state = inv.lock().unwrap();
            allocate(&state, &request(0, CuSelector::Index(0)), &good()).unwrap();
        }
        assert_eq!(inv.kernel_in_use(0, 0).unwrap(), Some(false));
    }
}
