//! Error taxonomy for session allocation and dispatch.

use thiserror::Error;

use crate::plugin::PluginVersion;

/// Every way a lifecycle or dispatch call can fail.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session creation must happen after inventory initialization")]
    NotInitialized,

    #[error("device {dev_index} rejected: {detail}")]
    InvalidDevice { dev_index: u32, detail: &'static str },

    #[error("invalid cu_index {cu_index}; device {dev_index} has {num_cus} CU(s)")]
    InvalidCu {
        dev_index: u32,
        cu_index: u32,
        num_cus: usize,
    },

    #[error("CU '{name}' not found on device {dev_index}")]
    CuNotFound { dev_index: u32, name: String },

    #[error("ddr bank {bank} is not valid for CU '{cu}'; valid banks: {valid:?}")]
    InvalidBank {
        cu: String,
        bank: u32,
        valid: Vec<u32>,
    },

    #[error("CU '{cu}' supports channel ids up to {max_channel_id}; requested {channel_id}")]
    InvalidChannel {
        cu: String,
        channel_id: u32,
        max_channel_id: u32,
    },

    #[error("failed to load plugin {reference}: {reason}")]
    PluginLoadFailure { reference: String, reason: String },

    #[error("plugin version {found} is incompatible; requires at least {required}")]
    IncompatiblePlugin {
        found: PluginVersion,
        required: PluginVersion,
    },

    #[error("plugin init failed with status {code}")]
    PluginInitFailed { code: i32 },

    #[error("failed to allocate {bytes} byte(s) of plugin data")]
    AllocationFailure { bytes: usize },

    #[error("session is corrupted: {detail}")]
    CorruptedSession { detail: &'static str },

    #[error("plugin {call} returned status {code}")]
    PluginRuntimeError { call: &'static str, code: i32 },

    #[error("timed out after {waited_ms} ms waiting for exclusive inventory access")]
    LockTimeout { waited_ms: u64 },
}

pub type Result<T> = std::result::Result<T, SessionError>;
