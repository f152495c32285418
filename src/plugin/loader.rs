//! Plugin loader -- resolves a plugin reference to a callback table.
//!
//! Every call resolves fresh; nothing is cached between sessions.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use libloading::Library;
use serde::Serialize;
use tracing::{debug, error};

use super::ffi::DynamicPlugin;
use super::{DecoderPlugin, PluginVersion, MIN_PLUGIN_VERSION};
use crate::error::{Result, SessionError};

/// Shared runtime every plugin library links against.
pub const DEFAULT_PLUGIN_RUNTIME_LIB: &str = "libxma2plugin.so";

/// Where a session's plugin comes from.
#[derive(Clone)]
pub enum PluginSource {
    /// Shared library exporting `decoder_plugin`.
    Library(PathBuf),
    /// In-process implementation registered by the embedder.
    Static(Arc<dyn DecoderPlugin>),
}

impl PluginSource {
    pub fn library(path: impl Into<PathBuf>) -> Self {
        Self::Library(path.into())
    }
}

impl fmt::Debug for PluginSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Library(path) => f.debug_tuple("Library").field(path).finish(),
            Self::Static(plugin) => f.debug_tuple("Static").field(&plugin.name()).finish(),
        }
    }
}

/// Compatibility report for a plugin library.
#[derive(Debug, Clone, Serialize)]
pub struct PluginProbe {
    pub name: String,
    pub version: PluginVersion,
    pub required: PluginVersion,
    pub compatible: bool,
    pub plugin_data_size: usize,
}

#[derive(Debug, Clone)]
pub struct PluginLoader {
    runtime_lib: Option<PathBuf>,
}

impl Default for PluginLoader {
    fn default() -> Self {
        Self::new(Some(PathBuf::from(DEFAULT_PLUGIN_RUNTIME_LIB)))
    }
}

impl PluginLoader {
    /// `runtime_lib` is loaded globally before any plugin library; `None`
    /// skips that step.
    pub fn new(runtime_lib: Option<PathBuf>) -> Self {
        Self { runtime_lib }
    }

    pub fn runtime_lib(&self) -> Option<&Path> {
        self.runtime_lib.as_deref()
    }

    pub fn resolve(&self, source: &PluginSource) -> Result<Arc<dyn DecoderPlugin>> {
        match source {
            PluginSource::Static(plugin) => {
                debug!(plugin = plugin.name(), "using in-process decoder plugin");
                Ok(plugin.clone())
            }
            PluginSource::Library(path) => {
                let plugin = self.load_library(path)?;
                Ok(Arc::new(plugin))
            }
        }
    }

    /// Load `path` and report whether it meets the minimum ABI version.
    pub fn probe(&self, path: &Path) -> Result<PluginProbe> {
        let plugin = self.load_library(path)?;
        let version = plugin.version().unwrap_or(PluginVersion::UNKNOWN);
        Ok(PluginProbe {
            name: plugin.name().to_string(),
            version,
            required: MIN_PLUGIN_VERSION,
            compatible: version.is_compatible(),
            plugin_data_size: plugin.plugin_data_size(),
        })
    }

    fn load_library(&self, path: &Path) -> Result<DynamicPlugin> {
        if path.as_os_str().is_empty() {
            error!("decoder properties must set a plugin library");
            return Err(SessionError::PluginLoadFailure {
                reference: String::new(),
                reason: "no plugin library given".to_string(),
            });
        }

        let runtime = self.load_runtime()?;
        DynamicPlugin::open(path, runtime).map_err(|e| {
            error!(path = %path.display(), error = %e, "failed to load decoder plugin");
            e
        })
    }

    fn load_runtime(&self) -> Result<Option<Arc<Library>>> {
        let Some(runtime) = &self.runtime_lib else {
            return Ok(None);
        };
        let library = unsafe { open_global(runtime) }.map_err(|e| {
            error!(path = %runtime.display(), error = %e, "failed to open plugin runtime");
            SessionError::PluginLoadFailure {
                reference: runtime.display().to_string(),
                reason: format!("prerequisite runtime could not be loaded: {}", e),
            }
        })?;
        Ok(Some(Arc::new(library)))
    }
}

/// Symbols of the runtime must be visible to plugins loaded afterwards.
#[cfg(unix)]
unsafe fn open_global(path: &Path) -> std::result::Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_GLOBAL, RTLD_LAZY};
    UnixLibrary::open(Some(path), RTLD_LAZY | RTLD_GLOBAL).map(Library::from)
}

#[cfg(not(unix))]
unsafe fn open_global(path: &Path) -> std::result::Result<Library, libloading::Error> {
    Library::new(path)
}
