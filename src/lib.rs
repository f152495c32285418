//! medialloc -- compute-unit allocation and session lifecycle for
//! accelerator decode plugins.
//!
//! This crate matches decode session requests against a fixed inventory of
//! devices and compute units, loads the vendor plugin that drives the chosen
//! CU, and dispatches data-plane calls to it.

pub mod alloc;
pub mod config;
pub mod error;
pub mod hw;
pub mod plugin;
pub mod session;

pub use alloc::{CuSelector, SessionRequest};
pub use error::{Result, SessionError};
pub use hw::HardwareInventory;
pub use plugin::{DecoderPlugin, PluginLoader, PluginSource, PluginVersion};
pub use session::{DecoderSession, DecoderSessions, SendOutcome};

/// Install the global tracing subscriber from the logging config. `RUST_LOG`
/// takes precedence over the configured level.
pub fn init_tracing(logging: &config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}
