//! Provisioning engine for telephony endpoints.
//!
//! This library identifies IP phones reaching out over TFTP, HTTP or
//! DHCP, binds each to a manufacturer-specific plugin producing the
//! firmware and configuration files it expects, and keeps the on-wire
//! configuration synchronized with a structured configuration model.

pub mod app;
pub mod config;
pub mod device;
pub mod dhcp;
pub mod download;
pub mod http;
pub mod ident;
pub mod operation;
pub mod persist;
pub mod pgasso;
pub mod plugin;
pub mod security;
pub mod services;
pub mod synchronize;
pub mod tftp;
pub mod util;

mod error;

// Re-export the types most callers need
pub use app::{ApplicationParams, ProvisioningApplication};
pub use config::{Config, ConfigCollection};
pub use device::{Added, Device, DeviceCollection, DeviceInfo};
pub use error::{ProvdError, Result};
pub use ident::{RequestInfo, RequestProcessingService, RequestType};
pub use operation::{OipState, OperationInProgress};
pub use persist::{DocumentCollection, IdGenerator};
pub use plugin::{Plugin, PluginInfo, PluginManager};
pub use services::{ApplicationConfigureService, ConfigureService, ServiceConfigStore};
pub use synchronize::SynchronizeService;

/// Version of the plugin interface implemented by this runtime.
pub const PLUGIN_IFACE_VERSION: &str = "0.2";
