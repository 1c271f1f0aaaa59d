//! Configuration services.
//!
//! A configure service exposes named parameters with get/set/describe
//! semantics; the application-wide one drives the plugin repository URL,
//! download proxies, locale, NAT mode and per-tenant provisioning keys.
//! The backing record is a singleton persisted write-through to a JSON
//! file and reloaded on restart.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, OnceLock, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::download::ProxyConfig;
use crate::error::{ProvdError, Result};

/// Per-plugin sub-package management, exposed by plugins carrying
/// downloadable firmware or language packs.
#[async_trait::async_trait]
pub trait InstallService: Send + Sync {
    async fn install(&self, pkg_id: &str) -> Result<()>;

    async fn uninstall(&self, pkg_id: &str) -> Result<()>;

    /// `(pkg_id, description)` pairs of the installable sub-packages.
    fn list_installable(&self) -> Vec<(String, String)>;

    /// `(pkg_id, version)` pairs of the installed sub-packages.
    fn list_installed(&self) -> Vec<(String, String)>;
}

/// Get/set/describe access to named parameters.
pub trait ConfigureService: Send + Sync {
    /// Current value of a parameter, or `None` when unset.
    fn get(&self, name: &str) -> Result<Option<String>>;

    /// Set or unset a parameter.
    fn set(&self, name: &str, value: Option<String>) -> Result<()>;

    /// `(name, description)` pairs of the supported parameters.
    fn description(&self) -> Vec<(&'static str, &'static str)>;

    /// Localized descriptions, when available for the locale.
    fn description_localized(&self, _locale: &str) -> Option<Vec<(&'static str, &'static str)>> {
        None
    }
}

/// Per-tenant persisted configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TenantConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provisioning_key: Option<String>,
}

/// The persisted service-wide configuration record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub https_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ftp_proxy: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    #[serde(default)]
    pub nat_enabled: bool,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tenants: BTreeMap<String, TenantConfig>,
}

/// Durable store for the service configuration.
///
/// Mutations update the in-memory copy first, then persist; readers
/// always see the in-memory copy.
pub struct ServiceConfigStore {
    state: RwLock<ServiceConfig>,
    path: Option<PathBuf>,
}

impl ServiceConfigStore {
    pub fn new_memory(initial: ServiceConfig) -> Self {
        Self {
            state: RwLock::new(initial),
            path: None,
        }
    }

    /// Open the store, loading the previous record when the file exists.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let state = if tokio::fs::try_exists(&path).await? {
            let data = tokio::fs::read(&path).await?;
            let config: ServiceConfig = serde_json::from_slice(&data)?;
            info!("Loaded service configuration from {:?}", path);
            config
        } else {
            ServiceConfig::default()
        };
        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
        })
    }

    pub fn snapshot(&self) -> ServiceConfig {
        self.state.read().expect("service config lock poisoned").clone()
    }

    /// Flush the in-memory copy to the backing file.
    pub async fn persist(&self) -> Result<()> {
        if let Some(path) = &self.path {
            let data = {
                let state = self.state.read().expect("service config lock poisoned");
                serde_json::to_vec_pretty(&*state)?
            };
            tokio::fs::write(path, data).await?;
            debug!("Persisted service configuration to {:?}", path);
        }
        Ok(())
    }

    pub async fn mutate(&self, f: impl FnOnce(&mut ServiceConfig)) -> Result<()> {
        {
            let mut state = self.state.write().expect("service config lock poisoned");
            f(&mut state);
        }
        self.persist().await
    }

    pub fn nat_enabled(&self) -> bool {
        self.state
            .read()
            .expect("service config lock poisoned")
            .nat_enabled
    }

    pub fn plugin_server(&self) -> Option<String> {
        self.state
            .read()
            .expect("service config lock poisoned")
            .plugin_server
            .clone()
    }

    pub fn proxies(&self) -> ProxyConfig {
        let state = self.state.read().expect("service config lock poisoned");
        ProxyConfig {
            http: state.http_proxy.clone(),
            https: state.https_proxy.clone(),
            ftp: state.ftp_proxy.clone(),
        }
    }

    pub fn provisioning_key(&self, tenant_uuid: &str) -> Option<String> {
        self.state
            .read()
            .expect("service config lock poisoned")
            .tenants
            .get(tenant_uuid)
            .and_then(|t| t.provisioning_key.clone())
    }

    /// Tenant holding the given provisioning key, when any.
    pub fn tenant_from_provisioning_key(&self, provisioning_key: &str) -> Option<String> {
        let state = self.state.read().expect("service config lock poisoned");
        state
            .tenants
            .iter()
            .find(|(_, config)| config.provisioning_key.as_deref() == Some(provisioning_key))
            .map(|(tenant, _)| tenant.clone())
    }

    /// Set a tenant's provisioning key, enforcing format and uniqueness.
    pub async fn set_provisioning_key(
        &self,
        tenant_uuid: &str,
        provisioning_key: Option<String>,
    ) -> Result<()> {
        if let Some(key) = &provisioning_key {
            check_provisioning_key(key)?;
            let state = self.state.read().expect("service config lock poisoned");
            let conflict = state.tenants.iter().any(|(tenant, config)| {
                tenant != tenant_uuid && config.provisioning_key.as_deref() == Some(key)
            });
            if conflict {
                return Err(ProvdError::InvalidParameter(
                    "provisioning_key already in use".to_string(),
                ));
            }
        }
        self.mutate(|state| {
            state.tenants.entry(tenant_uuid.to_string()).or_default().provisioning_key =
                provisioning_key;
        })
        .await
    }

    pub async fn remove_tenant(&self, tenant_uuid: &str) -> Result<()> {
        self.mutate(|state| {
            state.tenants.remove(tenant_uuid);
        })
        .await
    }
}

fn provisioning_key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9\-$~.]+$").unwrap())
}

fn locale_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z]{2}_[A-Z]{2}$").unwrap())
}

/// Validate a provisioning key: 8 to 256 url-safe characters.
pub fn check_provisioning_key(key: &str) -> Result<()> {
    if key.len() < 8 || key.len() > 256 {
        return Err(ProvdError::InvalidParameter(
            "`provisioning_key` should be [8, 256] characters long.".to_string(),
        ));
    }
    if !provisioning_key_re().is_match(key) {
        return Err(ProvdError::InvalidParameter(
            "`provisioning_key` contains invalid characters".to_string(),
        ));
    }
    Ok(())
}

fn split_scheme(value: &str) -> Option<(&str, &str)> {
    value.split_once("://")
}

fn check_is_server_url(value: &str) -> Result<()> {
    let Some((scheme, rest)) = split_scheme(value) else {
        return Err(ProvdError::InvalidParameter(format!("no scheme: {value}")));
    };
    if scheme.is_empty() {
        return Err(ProvdError::InvalidParameter(format!("no scheme: {value}")));
    }
    if rest.is_empty() {
        return Err(ProvdError::InvalidParameter(format!("no hostname: {value}")));
    }
    Ok(())
}

fn check_is_proxy(value: &str) -> Result<()> {
    check_is_server_url(value)?;
    let (_, rest) = split_scheme(value).expect("checked above");
    if rest.trim_end_matches('/').contains('/') {
        return Err(ProvdError::InvalidParameter(format!("path: {value}")));
    }
    Ok(())
}

fn check_is_https_proxy(value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(ProvdError::InvalidParameter("zero-length value".to_string()));
    }
    if split_scheme(value).is_some() {
        return Err(ProvdError::InvalidParameter(format!(
            "scheme and hostname: {value}"
        )));
    }
    Ok(())
}

fn check_locale(value: &str) -> Result<()> {
    if locale_re().is_match(value) {
        return Ok(());
    }
    Err(ProvdError::InvalidParameter(format!("invalid locale: {value}")))
}

/// The application-wide configure service.
pub struct ApplicationConfigureService {
    store: Arc<ServiceConfigStore>,
}

impl ApplicationConfigureService {
    pub fn new(store: Arc<ServiceConfigStore>) -> Self {
        Self { store }
    }

    /// Tenant-scoped access to the provisioning key parameter.
    pub fn get_provisioning_key(&self, tenant_uuid: &str) -> Option<String> {
        self.store.provisioning_key(tenant_uuid)
    }

    pub async fn set_provisioning_key(
        &self,
        tenant_uuid: &str,
        provisioning_key: Option<String>,
    ) -> Result<()> {
        self.store
            .set_provisioning_key(tenant_uuid, provisioning_key)
            .await
    }

    fn set_validated(&self, name: &str, value: &Option<String>) -> Result<()> {
        if let Some(value) = value {
            match name {
                "plugin_server" => check_is_server_url(value)?,
                "http_proxy" | "ftp_proxy" => check_is_proxy(value)?,
                "https_proxy" => check_is_https_proxy(value)?,
                "locale" => check_locale(value)?,
                "NAT" => {
                    if value != "0" && value != "1" {
                        return Err(ProvdError::InvalidParameter(value.clone()));
                    }
                }
                _ => return Err(ProvdError::InvalidParameter(format!("unknown: {name}"))),
            }
        }
        Ok(())
    }
}

impl ConfigureService for ApplicationConfigureService {
    fn get(&self, name: &str) -> Result<Option<String>> {
        let state = self.store.snapshot();
        let value = match name {
            "plugin_server" => state.plugin_server,
            "http_proxy" => state.http_proxy,
            "ftp_proxy" => state.ftp_proxy,
            "https_proxy" => state.https_proxy,
            "locale" => state.locale,
            "NAT" => Some(if state.nat_enabled { "1" } else { "0" }.to_string()),
            _ => return Err(ProvdError::InvalidParameter(format!("unknown: {name}"))),
        };
        Ok(value)
    }

    fn set(&self, name: &str, value: Option<String>) -> Result<()> {
        self.set_validated(name, &value)?;
        let mut state = self.store.state.write().expect("service config lock poisoned");
        match name {
            "plugin_server" => state.plugin_server = value,
            "http_proxy" => state.http_proxy = value,
            "ftp_proxy" => state.ftp_proxy = value,
            "https_proxy" => state.https_proxy = value,
            "locale" => state.locale = value,
            "NAT" => state.nat_enabled = value.as_deref() == Some("1"),
            _ => return Err(ProvdError::InvalidParameter(format!("unknown: {name}"))),
        }
        Ok(())
    }

    fn description(&self) -> Vec<(&'static str, &'static str)> {
        vec![
            ("plugin_server", "The plugins repository URL"),
            (
                "http_proxy",
                "The proxy for HTTP requests. Format is \"http://[user:password@]host:port\"",
            ),
            (
                "ftp_proxy",
                "The proxy for FTP requests. Format is \"http://[user:password@]host:port\"",
            ),
            ("https_proxy", "The proxy for HTTPS requests. Format is \"host:port\""),
            ("locale", "The current locale. Example: fr_FR"),
            ("NAT", "Set to 1 if all the devices are behind a NAT."),
            (
                "provisioning_key",
                "The provisioning key for the tenant. [min: 8, max: 256]",
            ),
        ]
    }

    fn description_localized(&self, locale: &str) -> Option<Vec<(&'static str, &'static str)>> {
        if !locale.starts_with("fr") {
            return None;
        }
        Some(vec![
            ("plugin_server", "L'addresse (URL) du dépôt de plugins"),
            (
                "http_proxy",
                "Le proxy pour les requêtes HTTP. Le format est \"http://[user:password@]host:port\"",
            ),
            (
                "ftp_proxy",
                "Le proxy pour les requêtes FTP. Le format est \"http://[user:password@]host:port\"",
            ),
            ("https_proxy", "Le proxy pour les requêtes HTTPS. Le format est \"host:port\""),
            ("locale", "La locale courante. Exemple: en_CA"),
            ("NAT", "Mettre à 1 si toutes les terminaisons sont derrière un NAT."),
            (
                "provisioning_key",
                "La clé de provisioning pour le tenant. [min: 8, max: 256]",
            ),
        ])
    }
}
