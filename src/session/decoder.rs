//! Decoder session lifecycle: create and destroy.
//!
//! Both calls serialize on the inventory lock. `create` resolves the plugin
//! before taking the lock, then allocates, runs the plugin's `init`, and only
//! commits to the inventory once `init` succeeds. Any failure leaves the
//! inventory exactly as it was.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::MutexGuard;
use tracing::{debug, error, info};

use super::{plugin_data_block, DecoderSession, SessionKind};
use crate::alloc::{self, SessionRequest};
use crate::error::{Result, SessionError};
use crate::hw::{HardwareInventory, InventoryState, SessionRecord};
use crate::plugin::{DecoderPlugin, PluginLoader};

// ---------------------------------------------------------------------------
// DecoderSessions
// ---------------------------------------------------------------------------

/// Entry point for creating and destroying decoder sessions against one
/// inventory. Cheap to share across threads.
#[derive(Debug, Clone)]
pub struct DecoderSessions {
    inventory: Arc<HardwareInventory>,
    loader: PluginLoader,
}

impl DecoderSessions {
    pub fn new(inventory: Arc<HardwareInventory>, loader: PluginLoader) -> Self {
        Self { inventory, loader }
    }

    pub fn inventory(&self) -> &Arc<HardwareInventory> {
        &self.inventory
    }

    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    /// Allocate a CU for `request`, initialize the plugin and commit the
    /// session to the inventory.
    pub fn create(&self, request: &SessionRequest) -> Result<DecoderSession> {
        debug!(
            dev_index = request.dev_index,
            cu = %request.cu,
            bank = ?request.ddr_bank,
            channel_id = request.channel_id,
            "create decoder session"
        );

        if !self.inventory.is_initialized() {
            error!("session creation must happen after inventory initialization");
            return Err(SessionError::NotInitialized);
        }

        let plugin = self.loader.resolve(&request.plugin)?;

        let mut state = self.inventory.lock()?;
        let result = self.create_locked(&mut state, request, plugin);
        MutexGuard::unlock_fair(state);
        result
    }

    fn create_locked(
        &self,
        state: &mut InventoryState,
        request: &SessionRequest,
        plugin: Arc<dyn DecoderPlugin>,
    ) -> Result<DecoderSession> {
        let assignment = alloc::allocate(state, request, plugin.as_ref())?;
        let plugin_data = plugin_data_block(plugin.plugin_data_size())?;

        let session_id = state.total_sessions + 1;
        let mut session = DecoderSession::new(
            session_id,
            request.channel_id,
            SessionKind::Decoder,
            assignment,
            self.inventory.salt(),
            plugin.clone(),
            plugin_data,
            request.properties.clone(),
        );

        let rc = plugin.init(&mut session);
        if rc != 0 {
            error!(
                plugin = plugin.name(),
                session_id,
                code = rc,
                "plugin init failed"
            );
            // Dropping `session` releases the plugin block; nothing was
            // committed yet.
            return Err(SessionError::PluginInitFailed { code: rc });
        }

        let Some(assignment) = session.assignment() else {
            return Err(SessionError::CorruptedSession {
                detail: "resource assignment is missing",
            });
        };
        assignment.kernel().claim();
        state.decoder_sessions += 1;
        state.total_sessions = session_id;
        state.sessions.insert(
            session_id,
            SessionRecord {
                session_id,
                kind: session.kind(),
                dev_index: assignment.dev_index(),
                cu_index: assignment.cu_index(),
                cu_name: assignment.kernel().name().to_string(),
                bank_index: assignment.bank_index(),
                channel_id: session.channel_id(),
                created_at: Utc::now(),
            },
        );

        info!(
            session_id,
            channel_id = session.channel_id(),
            cu = assignment.kernel().name(),
            bank = assignment.bank_index(),
            "decoder session created"
        );
        Ok(session)
    }

    /// Close the plugin and release the session. The CU keeps its `in_use`
    /// mark; other sessions may still be bound to it.
    pub fn destroy(&self, session: &mut DecoderSession) -> Result<()> {
        debug!(session_id = session.session_id(), "destroy decoder session");

        let mut state = self.inventory.lock()?;
        let result = self.destroy_locked(&mut state, session);
        MutexGuard::unlock_fair(state);
        result
    }

    fn destroy_locked(
        &self,
        state: &mut InventoryState,
        session: &mut DecoderSession,
    ) -> Result<()> {
        let session_id = session.session_id();
        if session.salt() != self.inventory.salt() {
            error!(session_id, "session belongs to a different inventory");
            return Err(SessionError::CorruptedSession {
                detail: "session was created by a different inventory",
            });
        }
        if session.assignment().is_none() {
            error!(session_id, "session is already released or corrupted");
            return Err(SessionError::CorruptedSession {
                detail: "resource assignment is missing",
            });
        }
        let Some(plugin) = session.plugin().cloned() else {
            error!(session_id, "session is corrupted");
            return Err(SessionError::CorruptedSession {
                detail: "plugin reference is missing",
            });
        };

        let rc = plugin.close(session);
        if rc != 0 {
            error!(session_id, code = rc, "error closing decoder plugin");
        }

        state.sessions.remove(&session_id);
        session.release();
        info!(session_id, "decoder session destroyed");
        Ok(())
    }
}
