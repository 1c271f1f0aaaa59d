//! Daemon configuration.
//!
//! Configuration comes from a TOML file merged with command-line
//! overrides. The `[general]` table drives the servers and storage
//! layout; `[general.base_raw_config]` seeds the raw-config defaults
//! merged under every device config; `[plugin_config.<id>]` tables carry
//! plugin-specific parameters.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Default configuration file, relative to the config dir.
pub const CONFIG_FILENAME: &str = "provd.toml";

/// Daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    /// Plugin-specific configuration, keyed by plugin id.
    #[serde(default)]
    pub plugin_config: toml::Table,
}

/// The `[general]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Durable state: device/config stores, plugins, app.json.
    #[serde(default = "default_base_storage_dir")]
    pub base_storage_dir: PathBuf,

    /// Downloaded plugin packages; may be purged post-extract.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    #[serde(default = "default_tftp_port")]
    pub tftp_port: u16,

    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Hostname of the provisioning server advertised to phones.
    #[serde(default = "default_advertised_host")]
    pub advertised_host: String,

    /// HTTP port advertised to phones, when it differs from `http_port`.
    #[serde(default)]
    pub advertised_http_port: Option<u16>,

    /// Full HTTP URL advertised to phones; overrides host and port.
    #[serde(default)]
    pub advertised_http_url: Option<String>,

    /// Number of X-Forwarded-For hops to believe.
    #[serde(default)]
    pub num_http_proxies: usize,

    /// `url_key` enables provisioning-key authentication.
    #[serde(default)]
    pub http_auth_strategy: Option<String>,

    #[serde(default = "default_true")]
    pub check_compat_min: bool,

    #[serde(default = "default_true")]
    pub check_compat_max: bool,

    /// Raw-config defaults merged under every device config.
    #[serde(default)]
    pub base_raw_config: toml::Table,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty general config must deserialize")
    }
}

fn default_base_storage_dir() -> PathBuf {
    PathBuf::from("/var/lib/provd")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/cache/provd")
}

fn default_tftp_port() -> u16 {
    69
}

fn default_http_port() -> u16 {
    8667
}

fn default_advertised_host() -> String {
    "127.0.0.1".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load the configuration from an explicit file, a config dir, or
    /// fall back to defaults when no file exists.
    pub fn load(config_file: Option<&Path>, config_dir: Option<&Path>) -> Result<Self> {
        if let Some(file) = config_file {
            anyhow::ensure!(file.is_file(), "config file {} does not exist", file.display());
        }
        let path = match (config_file, config_dir) {
            (Some(file), _) => Some(file.to_path_buf()),
            (None, Some(dir)) => Some(dir.join(CONFIG_FILENAME)),
            (None, None) => dirs::config_dir().map(|dir| dir.join("provd").join(CONFIG_FILENAME)),
        };
        match path {
            Some(path) if path.is_file() => {
                let content = std::fs::read_to_string(&path)
                    .with_context(|| format!("could not read {}", path.display()))?;
                let config: Config = toml::from_str(&content)
                    .with_context(|| format!("could not parse {}", path.display()))?;
                Ok(config)
            }
            _ => Ok(Config::default()),
        }
    }

    pub fn plugins_dir(&self) -> PathBuf {
        self.general.base_storage_dir.join("plugins")
    }

    pub fn app_state_file(&self) -> PathBuf {
        self.general.base_storage_dir.join("app.json")
    }

    pub fn devices_file(&self) -> PathBuf {
        self.general.base_storage_dir.join("devices.json")
    }

    pub fn configs_file(&self) -> PathBuf {
        self.general.base_storage_dir.join("configs.json")
    }

    pub fn use_provisioning_key(&self) -> bool {
        self.general.http_auth_strategy.as_deref() == Some("url_key")
    }

    /// Create the storage directories.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            &self.general.base_storage_dir,
            &self.general.cache_dir,
            &self.plugins_dir(),
        ] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("could not create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Advertised HTTP port, falling back to the bound port.
    pub fn advertised_http_port(&self) -> u16 {
        self.general.advertised_http_port.unwrap_or(self.general.http_port)
    }

    /// Build the base raw config handed to the provisioning engine.
    ///
    /// The configured `[general.base_raw_config]` table is enriched with
    /// the advertised address and ports.
    pub fn base_raw_config(&self) -> Result<Value> {
        let mut base = serde_json::to_value(&self.general.base_raw_config)
            .context("base_raw_config is not representable as JSON")?;
        let map = base
            .as_object_mut()
            .context("base_raw_config must be a table")?;
        map.insert("http_port".to_string(), json!(self.advertised_http_port()));
        map.insert("tftp_port".to_string(), json!(self.general.tftp_port));
        let http_base_url = match &self.general.advertised_http_url {
            Some(url) => url.clone(),
            None => format!(
                "http://{}:{}",
                self.general.advertised_host,
                self.advertised_http_port()
            ),
        };
        map.insert("http_base_url".to_string(), json!(http_base_url));
        if !map.contains_key("ip") {
            map.insert("ip".to_string(), json!(self.general.advertised_host));
        }
        Ok(base)
    }

    /// Plugin-specific configuration as JSON, keyed by plugin id.
    pub fn plugin_specific_configs(&self) -> Result<Value> {
        serde_json::to_value(&self.plugin_config)
            .context("plugin_config is not representable as JSON")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.general.tftp_port, 69);
        assert_eq!(config.general.http_port, 8667);
        assert_eq!(config.general.advertised_host, "127.0.0.1");
        assert!(config.general.check_compat_min);
        assert!(!config.use_provisioning_key());
    }

    #[test]
    fn test_parse_and_base_raw_config() {
        let content = r#"
[general]
base_storage_dir = "/tmp/provd-test"
tftp_port = 10069
http_port = 10667
advertised_host = "10.0.0.1"
http_auth_strategy = "url_key"

[general.base_raw_config]
ntp_enabled = true
ntp_ip = "10.0.0.5"

[plugin_config.acme-spark]
locale = "fr_FR"
"#;
        let config: Config = toml::from_str(content).unwrap();
        assert_eq!(config.general.tftp_port, 10069);
        assert!(config.use_provisioning_key());

        let base = config.base_raw_config().unwrap();
        assert_eq!(base["ip"], "10.0.0.1");
        assert_eq!(base["http_port"], 10667);
        assert_eq!(base["tftp_port"], 10069);
        assert_eq!(base["http_base_url"], "http://10.0.0.1:10667");
        assert_eq!(base["ntp_ip"], "10.0.0.5");

        let plugin_configs = config.plugin_specific_configs().unwrap();
        assert_eq!(plugin_configs["acme-spark"]["locale"], "fr_FR");
    }

    #[test]
    fn test_advertised_url_wins() {
        let content = r#"
[general]
advertised_http_url = "https://phones.example.org/provd"
"#;
        let config: Config = toml::from_str(content).unwrap();
        let base = config.base_raw_config().unwrap();
        assert_eq!(base["http_base_url"], "https://phones.example.org/provd");
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        assert!(Config::load(Some(Path::new("/nonexistent/provd.toml")), None).is_err());
    }

    #[test]
    fn test_load_missing_dir_gives_defaults() {
        let config = Config::load(None, Some(Path::new("/nonexistent"))).unwrap();
        assert_eq!(config.general.tftp_port, 69);
    }
}
