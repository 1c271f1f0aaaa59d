//! Plugin architecture.
//!
//! A plugin is a bundle of metadata, templates and served files targeting
//! a device family, identified by its installed directory name. Plugin
//! behaviour is provided by a compiled-in *driver* named by the bundle's
//! `plugin-info` entry; the `standard` template driver ships with the
//! core and covers ordinary vendor bundles.
//!
//! Capabilities are optional: a plugin exposes only the slots it
//! implements (per-protocol device info extractors, an HTTP or TFTP file
//! service, an associator, parameterization services). The pipeline
//! tests for presence before use.

pub mod archive;
pub mod info;
pub mod manager;
pub mod standard;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::device::Device;
use crate::error::Result;
use crate::http::HttpFileService;
use crate::ident::DeviceInfoExtractor;
use crate::pgasso::PluginAssociator;
use crate::services::{ConfigureService, InstallService};
use crate::synchronize::SynchronizeService;
use crate::tftp::TftpReadService;

pub use info::{InstallablePluginInfo, PluginInfo, PLUGIN_IFACE_VERSION};
pub use manager::{PluginEvent, PluginManager};
pub use standard::StandardPluginDriver;

/// Everything a driver needs to build a plugin instance.
pub struct PluginContext {
    /// Plugin id, which is also the installed directory name.
    pub id: String,
    /// Root of the installed plugin tree.
    pub plugin_dir: PathBuf,
    /// Parsed `plugin-info` metadata.
    pub info: PluginInfo,
    /// General configuration parameters, same for every plugin.
    pub general_config: Value,
    /// Plugin-specific configuration parameters.
    pub specific_config: Value,
    /// Synchronization service boundary, when one is registered.
    pub sync_service: Option<Arc<dyn SynchronizeService>>,
}

/// The plugin contract.
///
/// `configure` and `deconfigure` are synchronous and non-blocking: they
/// write local files. `synchronize` is asynchronous and may fail without
/// affecting the device's files.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Plugin id, assigned at load time.
    fn id(&self) -> &str;

    /// Plugin metadata.
    fn info(&self) -> &PluginInfo;

    /// Per-plugin parameterization service.
    fn configure_service(&self) -> Option<&dyn ConfigureService> {
        None
    }

    /// Per-plugin sub-package install service.
    fn install_service(&self) -> Option<&dyn InstallService> {
        None
    }

    fn dhcp_dev_info_extractor(&self) -> Option<&dyn DeviceInfoExtractor> {
        None
    }

    fn http_dev_info_extractor(&self) -> Option<&dyn DeviceInfoExtractor> {
        None
    }

    fn tftp_dev_info_extractor(&self) -> Option<&dyn DeviceInfoExtractor> {
        None
    }

    /// File subtree answering the plugin's HTTP requests.
    fn http_service(&self) -> Option<&dyn HttpFileService> {
        None
    }

    /// Handler answering the plugin's TFTP read requests.
    fn tftp_service(&self) -> Option<&dyn TftpReadService> {
        None
    }

    fn pg_associator(&self) -> Option<&dyn PluginAssociator> {
        None
    }

    /// Write plugin-global files (shared templates) from the base raw
    /// config.
    fn configure_common(&self, _raw_config: &Value) -> Result<()> {
        Ok(())
    }

    /// Write the per-device files for `device` from its materialized raw
    /// config.
    fn configure(&self, device: &Device, raw_config: &Value) -> Result<()>;

    /// Remove the per-device files of `device`.
    fn deconfigure(&self, device: &Device) -> Result<()>;

    /// Push the new configuration to the device out-of-band.
    async fn synchronize(&self, device: &Device, raw_config: &Value) -> Result<()>;

    /// The file the device will fetch next once its configuration is
    /// applied; used to close the remote-state feedback loop.
    fn get_remote_state_trigger_filename(&self, _device: &Device) -> Option<String> {
        None
    }

    /// Governs security-event logging of file requests.
    fn is_sensitive_filename(&self, _filename: &str) -> bool {
        false
    }

    /// Release plugin resources. Called once at unload.
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Factory for plugin instances, registered by name in the manager.
pub trait PluginDriver: Send + Sync {
    /// Driver name matched against `plugin-info`'s `entry`.
    fn name(&self) -> &str;

    /// Build a plugin instance for an installed bundle.
    fn create(&self, context: PluginContext) -> Result<Arc<dyn Plugin>>;
}
