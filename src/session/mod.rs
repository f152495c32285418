//! Decoder sessions -- resource assignment, integrity signature and the
//! lock-free dispatch path.

pub mod decoder;

use std::any::Any;
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, error};

pub use decoder::DecoderSessions;

use crate::error::{Result, SessionError};
use crate::hw::{DeviceHandle, Kernel};
use crate::plugin::{DataBuffer, DecoderPlugin, Frame, FrameProperties, PluginStatus};

/// Signature value of a released session.
const RELEASED_SIGNATURE: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    Decoder,
}

// ---------------------------------------------------------------------------
// Assignment
// ---------------------------------------------------------------------------

/// Concrete hardware resources chosen by the allocator.
#[derive(Debug, Clone)]
pub struct Assignment {
    dev_index: u32,
    bank_index: u32,
    device_handle: DeviceHandle,
    kernel: Arc<Kernel>,
}

impl Assignment {
    pub(crate) fn new(
        dev_index: u32,
        bank_index: u32,
        device_handle: DeviceHandle,
        kernel: Arc<Kernel>,
    ) -> Self {
        Self {
            dev_index,
            bank_index,
            device_handle,
            kernel,
        }
    }

    pub fn dev_index(&self) -> u32 {
        self.dev_index
    }

    pub fn bank_index(&self) -> u32 {
        self.bank_index
    }

    pub fn cu_index(&self) -> u32 {
        self.kernel.cu_index()
    }

    pub fn device_handle(&self) -> DeviceHandle {
        self.device_handle
    }

    pub fn kernel(&self) -> &Arc<Kernel> {
        &self.kernel
    }

    /// Keyed hash over the assignment identity, including the address of the
    /// inventory's kernel entry. Never equal to [`RELEASED_SIGNATURE`].
    fn signature(&self, salt: u64, session_id: u32) -> u64 {
        let mut hasher = DefaultHasher::new();
        salt.hash(&mut hasher);
        session_id.hash(&mut hasher);
        self.dev_index.hash(&mut hasher);
        self.kernel.cu_index().hash(&mut hasher);
        self.bank_index.hash(&mut hasher);
        (Arc::as_ptr(&self.kernel) as usize).hash(&mut hasher);
        match hasher.finish() {
            RELEASED_SIGNATURE => 1,
            sig => sig,
        }
    }
}

// ---------------------------------------------------------------------------
// DecoderSession
// ---------------------------------------------------------------------------

/// Result of a successful `send_data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOutcome {
    /// Non-negative plugin status.
    pub status: PluginStatus,
    /// Bytes of the input buffer the plugin accepted.
    pub consumed: usize,
}

/// A decode session bound to one CU.
///
/// Owned by the caller between `create` and `destroy`. After `destroy` the
/// value stays around in a released state and every dispatch call on it fails
/// with [`SessionError::CorruptedSession`].
pub struct DecoderSession {
    session_id: u32,
    channel_id: u32,
    kind: SessionKind,
    assignment: Option<Assignment>,
    signature: u64,
    salt: u64,
    plugin: Option<Arc<dyn DecoderPlugin>>,
    plugin_data: Vec<u8>,
    properties: Bytes,
    host_data: Option<Box<dyn Any + Send>>,
}

impl DecoderSession {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        session_id: u32,
        channel_id: u32,
        kind: SessionKind,
        assignment: Assignment,
        salt: u64,
        plugin: Arc<dyn DecoderPlugin>,
        plugin_data: Vec<u8>,
        properties: Bytes,
    ) -> Self {
        let signature = assignment.signature(salt, session_id);
        Self {
            session_id,
            channel_id,
            kind,
            assignment: Some(assignment),
            signature,
            salt,
            plugin: Some(plugin),
            plugin_data,
            properties,
            host_data: None,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    pub fn channel_id(&self) -> u32 {
        self.channel_id
    }

    pub fn kind(&self) -> SessionKind {
        self.kind
    }

    /// `None` once the session has been destroyed.
    pub fn assignment(&self) -> Option<&Assignment> {
        self.assignment.as_ref()
    }

    /// Plugin-specific configuration supplied with the request.
    pub fn properties(&self) -> &Bytes {
        &self.properties
    }

    pub fn plugin_data(&self) -> &[u8] {
        &self.plugin_data
    }

    pub fn plugin_data_mut(&mut self) -> &mut [u8] {
        &mut self.plugin_data
    }

    /// Slot reserved for the host application; never read by this crate.
    pub fn host_data(&self) -> Option<&(dyn Any + Send)> {
        self.host_data.as_deref()
    }

    pub fn host_data_mut(&mut self) -> Option<&mut (dyn Any + Send)> {
        self.host_data.as_deref_mut()
    }

    pub fn set_host_data(&mut self, data: Box<dyn Any + Send>) {
        self.host_data = Some(data);
    }

    /// True while the session holds a verifiable assignment and plugin.
    pub fn is_live(&self) -> bool {
        match (&self.assignment, &self.plugin) {
            (Some(a), Some(_)) => a.signature(self.salt, self.session_id) == self.signature,
            _ => false,
        }
    }

    /// Salt of the inventory that committed this session.
    pub(crate) fn salt(&self) -> u64 {
        self.salt
    }

    pub(crate) fn plugin(&self) -> Option<&Arc<dyn DecoderPlugin>> {
        self.plugin.as_ref()
    }

    /// Drop the plugin-private block and clear the plugin reference,
    /// assignment and signature.
    pub(crate) fn release(&mut self) {
        self.plugin_data = Vec::new();
        self.plugin = None;
        self.assignment = None;
        self.signature = RELEASED_SIGNATURE;
    }

    /// Re-derive the signature and hand back the plugin to dispatch to.
    fn verify(&self, call: &'static str) -> Result<Arc<dyn DecoderPlugin>> {
        let Some(assignment) = &self.assignment else {
            error!(session_id = self.session_id, call, "session is already released");
            return Err(SessionError::CorruptedSession {
                detail: "resource assignment is missing",
            });
        };
        if assignment.signature(self.salt, self.session_id) != self.signature {
            error!(session_id = self.session_id, call, "session signature mismatch");
            return Err(SessionError::CorruptedSession {
                detail: "signature does not match resource assignment",
            });
        }
        self.plugin.clone().ok_or_else(|| {
            error!(session_id = self.session_id, call, "session has no plugin");
            SessionError::CorruptedSession {
                detail: "plugin reference is missing",
            }
        })
    }

    // -- Dispatch ------------------------------------------------------------

    /// Feed compressed data to the plugin.
    pub fn send_data(&mut self, data: &DataBuffer) -> Result<SendOutcome> {
        debug!(session_id = self.session_id, len = data.data.len(), "send_data");
        let plugin = self.verify("send_data")?;
        let mut consumed = 0;
        let status = plugin.send_data(self, data, &mut consumed);
        passthrough("send_data", status).map(|status| SendOutcome { status, consumed })
    }

    /// Ask the plugin for the properties of the next output frame.
    pub fn get_properties(&mut self) -> Result<FrameProperties> {
        debug!(session_id = self.session_id, "get_properties");
        let plugin = self.verify("get_properties")?;
        let mut properties = FrameProperties::default();
        let status = plugin.get_properties(self, &mut properties);
        passthrough("get_properties", status).map(|_| properties)
    }

    /// Pull one decoded frame from the plugin.
    pub fn recv_frame(&mut self) -> Result<Frame> {
        debug!(session_id = self.session_id, "recv_frame");
        let plugin = self.verify("recv_frame")?;
        let mut frame = Frame::default();
        let status = plugin.recv_frame(self, &mut frame);
        passthrough("recv_frame", status).map(|_| frame)
    }
}

impl fmt::Debug for DecoderSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderSession")
            .field("session_id", &self.session_id)
            .field("channel_id", &self.channel_id)
            .field("kind", &self.kind)
            .field("assignment", &self.assignment)
            .field("plugin", &self.plugin.as_ref().map(|p| p.name().to_string()))
            .field("plugin_data_len", &self.plugin_data.len())
            .field("has_host_data", &self.host_data.is_some())
            .finish()
    }
}

fn passthrough(call: &'static str, status: PluginStatus) -> Result<PluginStatus> {
    if status < 0 {
        return Err(SessionError::PluginRuntimeError { call, code: status });
    }
    Ok(status)
}

/// Zero-filled plugin-private block.
pub(crate) fn plugin_data_block(size: usize) -> Result<Vec<u8>> {
    let mut block = Vec::new();
    block
        .try_reserve_exact(size)
        .map_err(|_| SessionError::AllocationFailure { bytes: size })?;
    block.resize(size, 0);
    Ok(block)
}
