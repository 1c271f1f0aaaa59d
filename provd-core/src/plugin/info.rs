//! Plugin metadata.
//!
//! Every installed plugin directory carries a `plugin-info` JSON file.
//! The remote repository publishes a `plugins.db` JSON index mapping
//! plugin ids to installable metadata.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::{ProvdError, Result};

/// Name of the plugin information file in each plugin directory.
pub const INFO_FILENAME: &str = "plugin-info";
/// Name of the plugin definition file on the remote and local server.
pub const DB_FILENAME: &str = "plugins.db";

/// Version of the plugin interface implemented by this runtime.
pub const PLUGIN_IFACE_VERSION: (u32, u32) = (0, 2);

/// Metadata of an installed plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub version: String,
    pub description: String,

    /// Localized descriptions, keyed by locale (`description_fr`, ... are
    /// flattened into this map at load time).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub localized_descriptions: BTreeMap<String, String>,

    /// Supported devices: `"vendor,model,version"` to capability details.
    #[serde(default)]
    pub capabilities: BTreeMap<String, Value>,

    /// Name of the compiled-in driver to instantiate; `standard` when
    /// absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_iface_version_min: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_iface_version_max: Option<String>,
}

impl PluginInfo {
    /// Read and parse a `plugin-info` file from a plugin directory.
    pub fn read_from_dir(plugin_dir: &Path) -> Result<Self> {
        let path = plugin_dir.join(INFO_FILENAME);
        let data = std::fs::read(&path).map_err(|e| {
            ProvdError::Plugin(format!("missing or unreadable {}: {e}", path.display()))
        })?;
        let raw: Value = serde_json::from_slice(&data)
            .map_err(|e| ProvdError::Plugin(format!("invalid {}: {e}", path.display())))?;
        Self::from_value(raw)
    }

    /// Parse plugin info from a JSON value, collecting localized
    /// `description_<locale>` keys.
    pub fn from_value(raw: Value) -> Result<Self> {
        let Value::Object(map) = raw else {
            return Err(ProvdError::Plugin("plugin info is not an object".to_string()));
        };
        let mut info: PluginInfo = serde_json::from_value(Value::Object(map.clone()))?;
        for (key, value) in &map {
            if let Some(locale) = key.strip_prefix("description_") {
                if let Some(text) = value.as_str() {
                    info.localized_descriptions
                        .insert(locale.to_string(), text.to_string());
                }
            }
        }
        Ok(info)
    }

    /// The driver name used to instantiate this plugin.
    pub fn entry_name(&self) -> &str {
        self.entry.as_deref().unwrap_or("standard")
    }

    /// Check runtime compatibility against declared interface bounds.
    pub fn check_compat(&self, check_min: bool, check_max: bool) -> Result<()> {
        if check_min {
            if let Some(min) = &self.plugin_iface_version_min {
                if let Some(min_version) = parse_iface_version(min) {
                    if PLUGIN_IFACE_VERSION < min_version {
                        return Err(ProvdError::Plugin(format!(
                            "plugin min compat not satisfied: {min} required"
                        )));
                    }
                }
            }
        }
        if check_max {
            if let Some(max) = &self.plugin_iface_version_max {
                if let Some(max_version) = parse_iface_version(max) {
                    if PLUGIN_IFACE_VERSION > max_version {
                        return Err(ProvdError::Plugin(format!(
                            "plugin max compat not satisfied: {max} allowed"
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

fn parse_iface_version(version: &str) -> Option<(u32, u32)> {
    let (major, minor) = version.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Metadata of an installable plugin, from the repository index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstallablePluginInfo {
    pub filename: String,
    pub version: String,
    pub description: String,
    #[serde(default)]
    pub capabilities: BTreeMap<String, Value>,
    /// Download size of the package, in bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsize: Option<u64>,
    /// Hex SHA1 digest of the package.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1sum: Option<String>,
}

/// Parse a `plugins.db` index.
///
/// An absent or corrupted index yields an empty installable set; a broken
/// repository must not prevent the server from running.
pub fn parse_plugins_db(path: &Path) -> BTreeMap<String, InstallablePluginInfo> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(_) => return BTreeMap::new(),
    };
    match serde_json::from_slice(&data) {
        Ok(db) => db,
        Err(e) => {
            warn!("Invalid plugin definition file {}: {}", path.display(), e);
            BTreeMap::new()
        }
    }
}
