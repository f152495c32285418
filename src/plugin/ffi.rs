//! C ABI for decoder plugins built as shared libraries.
//!
//! A plugin library exports a static [`RawDecoderPlugin`] under the symbol
//! `decoder_plugin`. Every callback receives a [`RawSession`] view rebuilt
//! from the owning [`DecoderSession`] for the duration of the call; the
//! `plugin_data` pointer always addresses the session's private block.

use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use bytes::Bytes;
use libloading::Library;
use tracing::{debug, warn};

use super::{
    DataBuffer, DecoderPlugin, Frame, FrameFormat, FrameProperties, PluginStatus, PluginVersion,
    PLUGIN_ERROR,
};
use crate::error::{Result, SessionError};
use crate::session::DecoderSession;

/// Exported symbol holding the callback table.
pub const DECODER_PLUGIN_SYMBOL: &[u8] = b"decoder_plugin\0";

pub const RAW_MAX_PLANES: usize = 3;

#[repr(C)]
#[derive(Debug)]
pub struct RawSession {
    pub session_id: u32,
    pub channel_id: u32,
    pub dev_index: u32,
    pub cu_index: u32,
    pub bank_index: u32,
    pub device_handle: u64,
    pub plugin_data: *mut u8,
    pub plugin_data_size: usize,
    pub properties: *const u8,
    pub properties_len: usize,
}

#[repr(C)]
#[derive(Debug)]
pub struct RawDataBuffer {
    pub data: *const u8,
    pub len: usize,
    pub pts: i64,
    pub is_eof: i32,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
pub struct RawFrameProperties {
    pub format: i32,
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
}

/// Planes point into plugin-owned memory and are copied out after the call.
#[repr(C)]
#[derive(Debug)]
pub struct RawFrame {
    pub properties: RawFrameProperties,
    pub num_planes: u32,
    pub planes: [*const u8; RAW_MAX_PLANES],
    pub plane_sizes: [usize; RAW_MAX_PLANES],
    pub pts: i64,
}

impl Default for RawFrame {
    fn default() -> Self {
        Self {
            properties: RawFrameProperties::default(),
            num_planes: 0,
            planes: [ptr::null(); RAW_MAX_PLANES],
            plane_sizes: [0; RAW_MAX_PLANES],
            pts: 0,
        }
    }
}

pub type VersionFn = unsafe extern "C" fn(major: *mut i32, minor: *mut i32) -> i32;
pub type SessionFn = unsafe extern "C" fn(session: *mut RawSession) -> i32;
pub type SendDataFn =
    unsafe extern "C" fn(session: *mut RawSession, data: *const RawDataBuffer, used: *mut i32) -> i32;
pub type GetPropertiesFn =
    unsafe extern "C" fn(session: *mut RawSession, props: *mut RawFrameProperties) -> i32;
pub type RecvFrameFn = unsafe extern "C" fn(session: *mut RawSession, frame: *mut RawFrame) -> i32;

/// Callback table exported by a plugin library.
#[repr(C)]
pub struct RawDecoderPlugin {
    pub version: Option<VersionFn>,
    pub plugin_data_size: usize,
    pub init: Option<SessionFn>,
    pub close: Option<SessionFn>,
    pub send_data: Option<SendDataFn>,
    pub get_properties: Option<GetPropertiesFn>,
    pub recv_frame: Option<RecvFrameFn>,
}

impl From<RawFrameProperties> for FrameProperties {
    fn from(raw: RawFrameProperties) -> Self {
        Self {
            format: FrameFormat::from_raw(raw.format),
            width: raw.width,
            height: raw.height,
            bits_per_pixel: raw.bits_per_pixel,
        }
    }
}

fn raw_session(session: &mut DecoderSession) -> RawSession {
    let (dev_index, cu_index, bank_index, device_handle) = session
        .assignment()
        .map(|a| (a.dev_index(), a.cu_index(), a.bank_index(), a.device_handle().0))
        .unwrap_or_default();
    let session_id = session.session_id();
    let channel_id = session.channel_id();
    let properties = session.properties().as_ptr();
    let properties_len = session.properties().len();
    let data = session.plugin_data_mut();

    RawSession {
        session_id,
        channel_id,
        dev_index,
        cu_index,
        bank_index,
        device_handle,
        plugin_data: data.as_mut_ptr(),
        plugin_data_size: data.len(),
        properties,
        properties_len,
    }
}

// ---------------------------------------------------------------------------
// DynamicPlugin
// ---------------------------------------------------------------------------

/// A decoder plugin resolved from a shared library.
pub struct DynamicPlugin {
    name: String,
    table: NonNull<RawDecoderPlugin>,
    // Field order matters: the plugin unloads before the runtime it links.
    _library: Library,
    _runtime: Option<Arc<Library>>,
}

// The table is immutable static data inside `_library`, which lives as long
// as `self`.
unsafe impl Send for DynamicPlugin {}
unsafe impl Sync for DynamicPlugin {}

impl DynamicPlugin {
    /// Load `path` and resolve its callback table. `runtime` is the already
    /// loaded shared runtime the plugin links against.
    pub fn open(path: &Path, runtime: Option<Arc<Library>>) -> Result<Self> {
        let load_failure = |reason: String| SessionError::PluginLoadFailure {
            reference: path.display().to_string(),
            reason,
        };

        let library = unsafe { Library::new(path) }
            .map_err(|e| load_failure(format!("failed to open library: {}", e)))?;

        let table = {
            let symbol = unsafe { library.get::<*mut RawDecoderPlugin>(DECODER_PLUGIN_SYMBOL) }
                .map_err(|e| load_failure(format!("missing decoder_plugin symbol: {}", e)))?;
            NonNull::new(*symbol)
                .ok_or_else(|| load_failure("decoder_plugin symbol is null".to_string()))?
        };

        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        // SAFETY: `table` was exported by `library`, which moves into the
        // returned plugin and outlives every access.
        unsafe { Self::from_table(name, table, library, runtime) }
            .map_err(|reason| load_failure(reason.to_string()))
    }

    /// Wrap a callback table that lives inside `library`.
    ///
    /// # Safety
    ///
    /// `table` must point to a valid [`RawDecoderPlugin`] that stays alive and
    /// unmodified for as long as `library` is loaded.
    pub(crate) unsafe fn from_table(
        name: String,
        table: NonNull<RawDecoderPlugin>,
        library: Library,
        runtime: Option<Arc<Library>>,
    ) -> std::result::Result<Self, &'static str> {
        if table.as_ref().version.is_none() {
            return Err("decoder plugin must provide a version function");
        }
        debug!(plugin = %name, "decoder plugin resolved");

        Ok(Self {
            name,
            table,
            _library: library,
            _runtime: runtime,
        })
    }

    fn table(&self) -> &RawDecoderPlugin {
        unsafe { self.table.as_ref() }
    }

    fn missing(&self, call: &str) -> PluginStatus {
        warn!(plugin = %self.name, call, "plugin does not implement callback");
        PLUGIN_ERROR
    }
}

impl DecoderPlugin for DynamicPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> std::result::Result<PluginVersion, PluginStatus> {
        let Some(f) = self.table().version else {
            return Err(self.missing("version"));
        };
        let (mut major, mut minor) = (-1, -1);
        let rc = unsafe { f(&mut major, &mut minor) };
        if rc < 0 {
            return Err(rc);
        }
        Ok(PluginVersion::new(major, minor))
    }

    fn plugin_data_size(&self) -> usize {
        self.table().plugin_data_size
    }

    fn init(&self, session: &mut DecoderSession) -> PluginStatus {
        let Some(f) = self.table().init else {
            return self.missing("init");
        };
        let mut raw = raw_session(session);
        unsafe { f(&mut raw) }
    }

    fn close(&self, session: &mut DecoderSession) -> PluginStatus {
        let Some(f) = self.table().close else {
            return self.missing("close");
        };
        let mut raw = raw_session(session);
        unsafe { f(&mut raw) }
    }

    fn send_data(
        &self,
        session: &mut DecoderSession,
        data: &DataBuffer,
        consumed: &mut usize,
    ) -> PluginStatus {
        let Some(f) = self.table().send_data else {
            return self.missing("send_data");
        };
        let mut raw = raw_session(session);
        let buffer = RawDataBuffer {
            data: data.data.as_ptr(),
            len: data.data.len(),
            pts: data.pts,
            is_eof: i32::from(data.is_eof),
        };
        let mut used: i32 = 0;
        let rc = unsafe { f(&mut raw, &buffer, &mut used) };
        *consumed = usize::try_from(used).unwrap_or(0).min(data.data.len());
        rc
    }

    fn get_properties(
        &self,
        session: &mut DecoderSession,
        properties: &mut FrameProperties,
    ) -> PluginStatus {
        let Some(f) = self.table().get_properties else {
            return self.missing("get_properties");
        };
        let mut raw = raw_session(session);
        let mut props = RawFrameProperties::default();
        let rc = unsafe { f(&mut raw, &mut props) };
        if rc >= 0 {
            *properties = props.into();
        }
        rc
    }

    fn recv_frame(&self, session: &mut DecoderSession, frame: &mut Frame) -> PluginStatus {
        let Some(f) = self.table().recv_frame else {
            return self.missing("recv_frame");
        };
        let mut raw = raw_session(session);
        let mut out = RawFrame::default();
        let rc = unsafe { f(&mut raw, &mut out) };
        if rc < 0 {
            return rc;
        }

        frame.properties = out.properties.into();
        frame.pts = out.pts;
        frame.planes = out
            .planes
            .iter()
            .zip(out.plane_sizes.iter())
            .take((out.num_planes as usize).min(RAW_MAX_PLANES))
            .filter(|(p, _)| !p.is_null())
            .map(|(&p, &len)| Bytes::copy_from_slice(unsafe { std::slice::from_raw_parts(p, len) }))
            .collect();
        rc
    }
}

impl std::fmt::Debug for DynamicPlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DynamicPlugin")
            .field("name", &self.name)
            .field("plugin_data_size", &self.plugin_data_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_missing_library_is_load_failure() {
        let err = DynamicPlugin::open(Path::new("/nonexistent/libnot_a_plugin.so"), None).unwrap_err();
        match err {
            SessionError::PluginLoadFailure { reference, .. } => {
                assert!(reference.contains("libnot_a_plugin.so"))
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_library_without_table_symbol_is_load_failure() {
        let err = DynamicPlugin::open(Path::new("libm.so.6"), None).unwrap_err();
        match err {
            SessionError::PluginLoadFailure { reference, reason } => {
                assert_eq!(reference, "libm.so.6");
                assert!(reason.contains("decoder_plugin"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_raw_properties_conversion() {
        let raw = RawFrameProperties {
            format: 1,
            width: 1280,
            height: 720,
            bits_per_pixel: 8,
        };
        let props = FrameProperties::from(raw);
        assert_eq!(props.format, FrameFormat::Nv12);
        assert_eq!(props.width, 1280);
        assert_eq!(props.height, 720);
    }

    /// Callback table implemented in this module and driven through the same
    /// C ABI a shared library would use.
    #[cfg(unix)]
    mod table {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        use std::time::Duration;

        use super::*;
        use crate::alloc::{CuSelector, SessionRequest};
        use crate::hw::tests::layout;
        use crate::hw::HardwareInventory;
        use crate::plugin::{PluginLoader, PluginSource};
        use crate::session::DecoderSessions;

        const DATA_SIZE: usize = 16;
        static LUMA: [u8; 4] = [16, 17, 18, 19];
        static CHROMA: [u8; 2] = [128, 129];
        static CLOSES: AtomicUsize = AtomicUsize::new(0);

        unsafe extern "C" fn version(major: *mut i32, minor: *mut i32) -> i32 {
            *major = 2019;
            *minor = 2;
            0
        }

        unsafe extern "C" fn init(session: *mut RawSession) -> i32 {
            let s = &mut *session;
            if s.plugin_data_size != DATA_SIZE {
                return -10;
            }
            let data = std::slice::from_raw_parts_mut(s.plugin_data, s.plugin_data_size);
            data[..4].copy_from_slice(&s.session_id.to_le_bytes());
            data[4..8].copy_from_slice(&s.bank_index.to_le_bytes());
            data[8] = s.properties_len as u8;
            0
        }

        unsafe extern "C" fn close(_session: *mut RawSession) -> i32 {
            CLOSES.fetch_add(1, Ordering::SeqCst);
            -4
        }

        unsafe extern "C" fn send_data(
            _session: *mut RawSession,
            data: *const RawDataBuffer,
            used: *mut i32,
        ) -> i32 {
            let data = &*data;
            if data.is_eof != 0 {
                *used = -1;
                return 1;
            }
            // Over-reports so the caller has to clamp.
            *used = data.len as i32 * 2;
            0
        }

        unsafe extern "C" fn get_properties(
            session: *mut RawSession,
            props: *mut RawFrameProperties,
        ) -> i32 {
            let s = &*session;
            *props = RawFrameProperties {
                format: 1,
                width: 1000 + s.cu_index,
                height: 500 + s.dev_index,
                bits_per_pixel: 10,
            };
            0
        }

        unsafe extern "C" fn recv_frame(session: *mut RawSession, frame: *mut RawFrame) -> i32 {
            let s = &*session;
            let f = &mut *frame;
            f.num_planes = 3;
            f.planes = [LUMA.as_ptr(), CHROMA.as_ptr(), ptr::null()];
            f.plane_sizes = [LUMA.len(), CHROMA.len(), 99];
            f.pts = i64::from(*s.plugin_data);
            0
        }

        static TABLE: RawDecoderPlugin = RawDecoderPlugin {
            version: Some(version),
            plugin_data_size: DATA_SIZE,
            init: Some(init),
            close: Some(close),
            send_data: Some(send_data),
            get_properties: Some(get_properties),
            recv_frame: Some(recv_frame),
        };

        static NO_VERSION: RawDecoderPlugin = RawDecoderPlugin {
            version: None,
            plugin_data_size: 0,
            init: None,
            close: None,
            send_data: None,
            get_properties: None,
            recv_frame: None,
        };

        fn this_process() -> Library {
            libloading::os::unix::Library::this().into()
        }

        fn plugin(
            table: &'static RawDecoderPlugin,
        ) -> std::result::Result<DynamicPlugin, &'static str> {
            let table = NonNull::from(table);
            unsafe { DynamicPlugin::from_table("table".into(), table, this_process(), None) }
        }

        fn manager() -> DecoderSessions {
            let inv = HardwareInventory::with_layout(layout(), Duration::from_millis(100)).unwrap();
            DecoderSessions::new(Arc::new(inv), PluginLoader::new(None))
        }

        #[test]
        fn test_table_without_version_is_rejected() {
            let err = plugin(&NO_VERSION).unwrap_err();
            assert!(err.contains("version"));
        }

        #[test]
        fn test_missing_callbacks_report_plugin_error() {
            // Bypasses the version requirement to reach the other slots.
            let plugin = DynamicPlugin {
                name: "empty".into(),
                table: NonNull::from(&NO_VERSION),
                _library: this_process(),
                _runtime: None,
            };
            assert_eq!(plugin.version(), Err(PLUGIN_ERROR));
            assert_eq!(plugin.plugin_data_size(), 0);
        }

        #[test]
        fn test_callbacks_round_trip_through_c_abi() {
            let plugin = Arc::new(plugin(&TABLE).unwrap());
            assert_eq!(plugin.version(), Ok(PluginVersion::new(2019, 2)));

            let mgr = manager();
            let req = SessionRequest::new(0, CuSelector::Index(2), PluginSource::Static(plugin))
                .with_bank(2)
                .with_properties(&b"cfg-bytes"[..]);
            let mut s = mgr.create(&req).unwrap();

            // init saw the session view rebuilt from the assignment.
            let data = s.plugin_data();
            assert_eq!(&data[..4], &s.session_id().to_le_bytes());
            assert_eq!(&data[4..8], &2u32.to_le_bytes());
            assert_eq!(data[8], 9);

            let out = s.send_data(&DataBuffer::new(&b"abcde"[..], 3)).unwrap();
            assert_eq!(out.consumed, 5);
            let out = s.send_data(&DataBuffer::eof()).unwrap();
            assert_eq!(out, crate::session::SendOutcome { status: 1, consumed: 0 });

            let props = s.get_properties().unwrap();
            assert_eq!(props.format, FrameFormat::Nv12);
            assert_eq!((props.width, props.height), (1002, 500));

            let frame = s.recv_frame().unwrap();
            assert_eq!(frame.planes.len(), 2);
            assert_eq!(&frame.planes[0][..], &LUMA[..]);
            assert_eq!(&frame.planes[1][..], &CHROMA[..]);
            assert_eq!(frame.pts, i64::from(s.session_id() as u8));

            let before = CLOSES.load(Ordering::SeqCst);
            mgr.destroy(&mut s).unwrap();
            assert!(CLOSES.load(Ordering::SeqCst) > before);
        }
    }
}
