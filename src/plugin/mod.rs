//! Decoder plugin ABI.
//!
//! A plugin is a callback table: a version query, `init`/`close`, and the
//! three data-plane calls. [`DecoderPlugin`] is the safe form of that table.
//! Plugins built as shared libraries are wrapped by [`ffi::DynamicPlugin`];
//! embedders can also hand an in-process implementation straight to the
//! [`loader::PluginLoader`].
//!
//! Status codes follow the C contract: zero is success, negative is failure.

pub mod ffi;
pub mod loader;

use std::fmt;

use bytes::Bytes;
use serde::Serialize;

pub use loader::{PluginLoader, PluginProbe, PluginSource, DEFAULT_PLUGIN_RUNTIME_LIB};

use crate::session::DecoderSession;

pub type PluginStatus = i32;

pub const PLUGIN_SUCCESS: PluginStatus = 0;
pub const PLUGIN_ERROR: PluginStatus = -1;

/// Oldest plugin ABI this runtime accepts.
pub const MIN_PLUGIN_VERSION: PluginVersion = PluginVersion::new(2019, 2);

/// `(major, minor)` ABI version reported by a plugin. Ordered
/// lexicographically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct PluginVersion {
    pub major: i32,
    pub minor: i32,
}

impl PluginVersion {
    /// Placeholder for a plugin whose version query failed.
    pub const UNKNOWN: PluginVersion = PluginVersion::new(-1, -1);

    pub const fn new(major: i32, minor: i32) -> Self {
        Self { major, minor }
    }

    pub fn is_compatible(&self) -> bool {
        *self >= MIN_PLUGIN_VERSION
    }
}

impl fmt::Display for PluginVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::UNKNOWN {
            return f.write_str("unknown");
        }
        write!(f, "{}.{}", self.major, self.minor)
    }
}

// ---------------------------------------------------------------------------
// Data-plane payloads
// ---------------------------------------------------------------------------

/// Compressed input handed to `send_data`.
#[derive(Debug, Clone, Default)]
pub struct DataBuffer {
    pub data: Bytes,
    pub pts: i64,
    pub is_eof: bool,
}

impl DataBuffer {
    pub fn new(data: impl Into<Bytes>, pts: i64) -> Self {
        Self {
            data: data.into(),
            pts,
            is_eof: false,
        }
    }

    /// Empty end-of-stream marker.
    pub fn eof() -> Self {
        Self {
            data: Bytes::new(),
            pts: 0,
            is_eof: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum FrameFormat {
    #[default]
    Yuv420,
    Nv12,
    Rgb888,
    Other(i32),
}

impl FrameFormat {
    pub fn from_raw(raw: i32) -> Self {
        match raw {
            0 => Self::Yuv420,
            1 => Self::Nv12,
            2 => Self::Rgb888,
            other => Self::Other(other),
        }
    }

    pub fn to_raw(self) -> i32 {
        match self {
            Self::Yuv420 => 0,
            Self::Nv12 => 1,
            Self::Rgb888 => 2,
            Self::Other(raw) => raw,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrameProperties {
    pub format: FrameFormat,
    pub width: u32,
    pub height: u32,
    pub bits_per_pixel: u32,
}

/// Decoded output returned by `recv_frame`.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    pub properties: FrameProperties,
    pub planes: Vec<Bytes>,
    pub pts: i64,
}

// ---------------------------------------------------------------------------
// DecoderPlugin
// ---------------------------------------------------------------------------

/// Callback table every decoder plugin exposes.
///
/// The session passed to each call carries the resource assignment and the
/// zero-initialised plugin-private block sized by [`plugin_data_size`]. Calls
/// on one session are not serialized by this crate.
///
/// [`plugin_data_size`]: DecoderPlugin::plugin_data_size
pub trait DecoderPlugin: Send + Sync {
    /// Human-readable identifier, used in logs.
    fn name(&self) -> &str;

    /// ABI version, or the failing status of the version query.
    fn version(&self) -> Result<PluginVersion, PluginStatus>;

    fn plugin_data_size(&self) -> usize;

    fn init(&self, session: &mut DecoderSession) -> PluginStatus;

    fn close(&self, session: &mut DecoderSession) -> PluginStatus;

    fn send_data(
        &self,
        session: &mut DecoderSession,
        data: &DataBuffer,
        consumed: &mut usize,
    ) -> PluginStatus;

    fn get_properties(
        &self,
        session: &mut DecoderSession,
        properties: &mut FrameProperties,
    ) -> PluginStatus;

    fn recv_frame(&self, session: &mut DecoderSession, frame: &mut Frame) -> PluginStatus;
}
