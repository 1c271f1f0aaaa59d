//! Main logic used to provision devices.
//!
//! Restrictions on the devices/configs/plugins stored here:
//! - devices can reference unknown configs or plugins
//! - configs can reference unknown configs
//! - a plugin can be uninstalled even if devices reference it
//! - a config can be removed even if devices or configs reference it
//!
//! This type enforces the plugin contract: every mutating public
//! operation runs under the application write lock, synchronization runs
//! under the read lock and pure lookups take no lock at all. Plugin
//! hooks are exception-isolated: a failing `configure` or `deconfigure`
//! marks the device unconfigured and never tears the server down.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::config::{
    check_common_raw_config, check_raw_config, selector, set_raw_config_defaults, Config,
    ConfigCollection,
};
use crate::device::{needs_reconfiguration, Device, DeviceCollection};
use crate::error::{ProvdError, Result};
use crate::operation::{OipState, OperationInProgress};
use crate::persist::{Document, FindOptions, Selector};
use crate::plugin::{Plugin, PluginManager};
use crate::services::ServiceConfigStore;

/// Hook invoked just before a device is persisted by `dev_update`.
pub type PreUpdateHook = dyn Fn(&mut Device, Option<&Config>) + Send + Sync;

/// Construction parameters for [`ProvisioningApplication`].
pub struct ApplicationParams {
    pub cfg_collection: ConfigCollection,
    pub dev_collection: DeviceCollection,
    pub pg_mgr: Arc<PluginManager>,
    pub service_config: Arc<ServiceConfigStore>,
    /// Service-wide raw-config defaults, merged under every config.
    pub base_raw_config: Value,
    /// General configuration handed to every plugin at load time.
    pub general_config: Value,
    /// Plugin-specific configuration, keyed by plugin id.
    pub plugin_specific_configs: Value,
    /// URL-key authentication mode.
    pub use_provisioning_key: bool,
}

pub struct ProvisioningApplication {
    cfg_collection: ConfigCollection,
    dev_collection: DeviceCollection,
    pg_mgr: Arc<PluginManager>,
    service_config: Arc<ServiceConfigStore>,
    base_raw_config: Value,
    general_config: Value,
    plugin_specific_configs: Value,
    use_provisioning_key: bool,
    tenant_uuid: std::sync::RwLock<Option<String>>,
    rw_lock: RwLock<()>,
}

impl ProvisioningApplication {
    pub fn new(params: ApplicationParams) -> Result<Self> {
        check_common_raw_config(&params.base_raw_config)?;
        info!("Using base raw config {}", params.base_raw_config);
        Ok(Self {
            cfg_collection: params.cfg_collection,
            dev_collection: params.dev_collection,
            pg_mgr: params.pg_mgr,
            service_config: params.service_config,
            base_raw_config: params.base_raw_config,
            general_config: params.general_config,
            plugin_specific_configs: params.plugin_specific_configs,
            use_provisioning_key: params.use_provisioning_key,
            tenant_uuid: std::sync::RwLock::new(None),
            rw_lock: RwLock::new(()),
        })
    }

    pub fn pg_mgr(&self) -> Arc<PluginManager> {
        self.pg_mgr.clone()
    }

    pub fn service_config(&self) -> Arc<ServiceConfigStore> {
        self.service_config.clone()
    }

    pub fn nat_enabled(&self) -> bool {
        self.service_config.nat_enabled()
    }

    pub fn use_provisioning_key(&self) -> bool {
        self.use_provisioning_key
    }

    pub fn tenant_from_provisioning_key(&self, provisioning_key: &str) -> Option<String> {
        self.service_config
            .tenant_from_provisioning_key(provisioning_key)
    }

    pub fn base_raw_config(&self) -> &Value {
        &self.base_raw_config
    }

    /// Tenant of the current session, used as default owner of new
    /// devices.
    pub fn tenant_uuid(&self) -> Option<String> {
        self.tenant_uuid
            .read()
            .expect("tenant lock poisoned")
            .clone()
    }

    pub fn set_tenant_uuid(&self, tenant_uuid: Option<String>) {
        *self.tenant_uuid.write().expect("tenant lock poisoned") = tenant_uuid;
    }

    /// Declare the usual device lookup indexes.
    pub async fn ensure_indexes(&self) -> Result<()> {
        for key in ["mac", "ip", "sn", "uuid", "config", "plugin", "tenant_uuid"] {
            self.dev_collection.ensure_index(key).await?;
        }
        Ok(())
    }

    // device helpers

    fn dev_get_plugin(&self, device: &Device) -> Option<Arc<dyn Plugin>> {
        device.plugin.as_deref().and_then(|id| self.pg_mgr.get(id))
    }

    async fn dev_get_raw_config(&self, device: &Device) -> Result<Option<Value>> {
        match &device.config {
            Some(config_id) => {
                self.cfg_collection
                    .get_raw_config(config_id, &self.base_raw_config)
                    .await
            }
            None => Ok(None),
        }
    }

    async fn dev_get_plugin_and_raw_config(
        &self,
        device: &Device,
    ) -> Result<Option<(Arc<dyn Plugin>, Value)>> {
        if let Some(plugin) = self.dev_get_plugin(device) {
            if let Some(raw_config) = self.dev_get_raw_config(device).await? {
                return Ok(Some((plugin, raw_config)));
            }
        }
        Ok(None)
    }

    /// Configure a device through its plugin. True on success; failures
    /// are logged and absorbed.
    fn dev_configure(&self, device: &Device, plugin: &Arc<dyn Plugin>, raw_config: Value) -> bool {
        info!(
            "Configuring device {:?} with plugin {}",
            device.id,
            plugin.id()
        );
        let mut raw_config = raw_config;
        if self.use_provisioning_key {
            match self.service_config.provisioning_key(&device.tenant_uuid) {
                Some(provisioning_key) => {
                    if let Some(http_base_url) =
                        raw_config.get("http_base_url").and_then(Value::as_str)
                    {
                        let with_key = format!("{http_base_url}/{provisioning_key}");
                        raw_config["http_base_url"] = Value::String(with_key);
                    }
                }
                None => {
                    warn!(
                        "Device {:?} uses url-key auth but tenant {} has no provisioning key",
                        device.id, device.tenant_uuid
                    );
                }
            }
        }
        if let Err(e) = check_raw_config(&raw_config) {
            error!("Error while configuring device {:?}: {}", device.id, e);
            return false;
        }
        set_raw_config_defaults(&mut raw_config);
        if let Err(e) = plugin.configure(device, &raw_config) {
            error!("Error while configuring device {:?}: {}", device.id, e);
            return false;
        }
        true
    }

    async fn dev_configure_if_possible(&self, device: &Device) -> Result<bool> {
        match self.dev_get_plugin_and_raw_config(device).await? {
            Some((plugin, raw_config)) => Ok(self.dev_configure(device, &plugin, raw_config)),
            None => Ok(false),
        }
    }

    fn dev_deconfigure(&self, device: &Device, plugin: &Arc<dyn Plugin>) -> bool {
        info!(
            "Deconfiguring device {:?} with plugin {}",
            device.id,
            plugin.id()
        );
        if let Err(e) = plugin.deconfigure(device) {
            error!("Error while deconfiguring device {:?}: {}", device.id, e);
            return false;
        }
        true
    }

    fn dev_deconfigure_if_possible(&self, device: &Device) -> bool {
        match self.dev_get_plugin(device) {
            Some(plugin) => self.dev_deconfigure(device, &plugin),
            None => false,
        }
    }

    async fn dev_synchronize_if_possible(&self, device: &Device) -> Result<()> {
        let Some((plugin, mut raw_config)) = self.dev_get_plugin_and_raw_config(device).await?
        else {
            // rare case: the device is marked configured but its plugin
            // was uninstalled or unloaded manually
            return Err(ProvdError::Synchronize(format!(
                "plugin {:?} is not installed/loaded",
                device.plugin
            )));
        };
        info!(
            "Synchronizing device {:?} with plugin {}",
            device.id,
            plugin.id()
        );
        set_raw_config_defaults(&mut raw_config);
        plugin.synchronize(device, &raw_config).await
    }

    async fn dev_get_or_raise(&self, device_id: &str) -> Result<Device> {
        self.dev_collection
            .retrieve(device_id)
            .await?
            .ok_or_else(|| ProvdError::InvalidId(format!("invalid device ID \"{device_id}\"")))
    }

    // device operations

    /// Insert a new device, configuring it when enough information is
    /// available. Returns the device id; the passed device is updated in
    /// place (id, tenant, configured flag).
    pub async fn dev_insert(&self, device: &mut Device) -> Result<String> {
        let _guard = self.rw_lock.write().await;
        info!("Inserting new device");
        // new devices are never configured
        device.configured = false;
        if device.tenant_uuid.is_empty() {
            device.tenant_uuid = self.tenant_uuid().unwrap_or_default();
        }
        device.is_new = self
            .tenant_uuid()
            .map(|tenant| device.tenant_uuid == tenant)
            .unwrap_or(false);
        let device_id = self.dev_collection.insert(device).await?;
        device.id = Some(device_id.clone());
        if self.dev_configure_if_possible(device).await? {
            device.configured = true;
            self.dev_collection.update(device).await?;
        }
        Ok(device_id)
    }

    /// Update a device, deconfiguring/reconfiguring as needed.
    pub async fn dev_update(&self, device: &mut Device) -> Result<()> {
        self.dev_update_with_hook(device, None).await
    }

    /// Update a device; `pre_update_hook` runs with the device and its
    /// config just before persisting.
    pub async fn dev_update_with_hook(
        &self,
        device: &mut Device,
        pre_update_hook: Option<&PreUpdateHook>,
    ) -> Result<()> {
        let _guard = self.rw_lock.write().await;
        let device_id = device
            .id
            .clone()
            .ok_or_else(|| ProvdError::InvalidId("no id key for device".to_string()))?;
        info!("Updating device {}", device_id);
        let old_device = self.dev_get_or_raise(&device_id).await?;
        if needs_reconfiguration(&old_device, device) {
            if old_device.configured {
                self.dev_deconfigure_if_possible(&old_device);
            }
            device.configured = self.dev_configure_if_possible(device).await?;
        } else {
            device.configured = old_device.configured;
        }
        if let Some(hook) = pre_update_hook {
            let config = match &device.config {
                Some(config_id) => self.cfg_collection.retrieve(config_id).await?,
                None => None,
            };
            hook(device, config.as_ref());
        }
        if *device != old_device {
            device.is_new = self
                .tenant_uuid()
                .map(|tenant| device.tenant_uuid == tenant)
                .unwrap_or(device.is_new);
            self.dev_collection.update(device).await?;
            // check if the old device was using a transient config that
            // is no longer in use
            if let Some(old_cfg_id) = old_device.config.as_deref() {
                if device.config.as_deref() != Some(old_cfg_id) {
                    self.collect_transient_config(old_cfg_id).await?;
                }
            }
        } else {
            info!("Not updating device {}: not changed", device_id);
        }
        Ok(())
    }

    async fn collect_transient_config(&self, config_id: &str) -> Result<()> {
        let Some(config) = self.cfg_collection.retrieve(config_id).await? else {
            return Ok(());
        };
        if !config.transient {
            return Ok(());
        }
        let still_referenced = self
            .dev_collection
            .find_one(&selector(json!({"config": config_id})))
            .await?
            .is_some();
        if !still_referenced {
            info!("Deleting unused transient config {}", config_id);
            if let Err(e) = self.cfg_collection.delete(config_id).await {
                warn!("Could not delete transient config {}: {}", config_id, e);
            }
        }
        Ok(())
    }

    /// Delete a device, deconfiguring it and collecting its transient
    /// config when it was the last referrer.
    pub async fn dev_delete(&self, device_id: &str) -> Result<()> {
        let _guard = self.rw_lock.write().await;
        info!("Deleting device {}", device_id);
        let device = self.dev_get_or_raise(device_id).await?;
        self.dev_collection.delete(device_id).await?;
        if let Some(config_id) = device.config.as_deref() {
            self.collect_transient_config(config_id).await?;
        }
        if device.configured {
            self.dev_deconfigure_if_possible(&device);
        }
        Ok(())
    }

    pub async fn dev_retrieve(&self, device_id: &str) -> Result<Option<Device>> {
        self.dev_collection.retrieve(device_id).await
    }

    pub async fn dev_find(&self, selector: &Selector) -> Result<Vec<Device>> {
        self.dev_collection.find(selector).await
    }

    pub async fn dev_find_documents(
        &self,
        selector: &Selector,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        self.dev_collection.find_documents(selector, options).await
    }

    pub async fn dev_find_one(&self, selector: &Selector) -> Result<Option<Device>> {
        self.dev_collection.find_one(selector).await
    }

    /// Force the reconfiguration of a device. True when the device ends
    /// up configured.
    pub async fn dev_reconfigure(&self, device_id: &str) -> Result<bool> {
        let _guard = self.rw_lock.write().await;
        info!("Reconfiguring device {}", device_id);
        let mut device = self.dev_get_or_raise(device_id).await?;
        if device.configured {
            self.dev_deconfigure_if_possible(&device);
        }
        let configured = self.dev_configure_if_possible(&device).await?;
        if device.configured != configured {
            device.configured = configured;
            self.dev_collection.update(&device).await?;
        }
        Ok(configured)
    }

    /// Synchronize the physical device with its config.
    pub async fn dev_synchronize(&self, device_id: &str) -> Result<()> {
        let _guard = self.rw_lock.read().await;
        info!("Synchronizing device {}", device_id);
        let device = self.dev_get_or_raise(device_id).await?;
        if !device.configured {
            return Err(ProvdError::Synchronize(format!(
                "can't synchronize not configured device {device_id}"
            )));
        }
        self.dev_synchronize_if_possible(&device).await
    }

    // config helpers

    async fn cfg_get_or_raise(&self, config_id: &str) -> Result<Config> {
        self.cfg_collection
            .retrieve(config_id)
            .await?
            .ok_or_else(|| ProvdError::InvalidId(format!("invalid config ID \"{config_id}\"")))
    }

    /// Reconfigure every device whose config belongs to `affected_cfg_ids`.
    ///
    /// `deleted_cfg_id` marks the config whose materialization no longer
    /// exists; its direct devices are simply flagged unconfigured.
    async fn reconfigure_affected_devices(
        &self,
        affected_cfg_ids: HashSet<String>,
        deleted_cfg_id: Option<&str>,
    ) -> Result<()> {
        let mut raw_configs: HashMap<String, Option<Value>> = HashMap::new();
        for affected_cfg_id in &affected_cfg_ids {
            let raw_config = self
                .cfg_collection
                .get_raw_config(affected_cfg_id, &self.base_raw_config)
                .await?;
            raw_configs.insert(affected_cfg_id.clone(), raw_config);
        }
        let cfg_ids: Vec<Value> = affected_cfg_ids
            .iter()
            .map(|id| Value::String(id.clone()))
            .collect();
        let affected_devices = self
            .dev_collection
            .find(&selector(json!({"config": {"$in": cfg_ids}})))
            .await?;
        for mut device in affected_devices {
            let device_cfg_id = device.config.clone().unwrap_or_default();
            let plugin = self.dev_get_plugin(&device);
            let holds_deleted_cfg = deleted_cfg_id == Some(device_cfg_id.as_str());
            if plugin.is_none() && !holds_deleted_cfg {
                continue;
            }
            if let Some(plugin) = &plugin {
                if device.configured {
                    self.dev_deconfigure(&device, plugin);
                }
            }
            let configured = if holds_deleted_cfg {
                // no replacement config to feed the device
                false
            } else {
                let plugin = plugin.as_ref().expect("checked above");
                match raw_configs.get(&device_cfg_id).cloned().flatten() {
                    Some(raw_config) => self.dev_configure(&device, plugin, raw_config),
                    None => false,
                }
            };
            if device.configured != configured {
                device.configured = configured;
                self.dev_collection.update(&device).await?;
            }
        }
        Ok(())
    }

    // config operations

    /// Insert a new config and reconfigure every dependent device.
    pub async fn cfg_insert(&self, config: &mut Config) -> Result<String> {
        let _guard = self.rw_lock.write().await;
        info!("Inserting config {:?}", config.id);
        let config_id = self.cfg_collection.insert(config.clone()).await?;
        config.id = Some(config_id.clone());
        let mut affected_cfg_ids = self.cfg_collection.get_descendants(&config_id).await?;
        affected_cfg_ids.insert(config_id.clone());
        self.reconfigure_affected_devices(affected_cfg_ids, None)
            .await?;
        Ok(config_id)
    }

    /// Update a config and reconfigure every dependent device.
    pub async fn cfg_update(&self, config: &Config) -> Result<()> {
        let _guard = self.rw_lock.write().await;
        let config_id = config
            .id
            .clone()
            .ok_or_else(|| ProvdError::InvalidId("no id key for config".to_string()))?;
        info!("Updating config {}", config_id);
        let old_config = self.cfg_get_or_raise(&config_id).await?;
        if old_config == *config {
            info!("config has not changed, ignoring update");
            return Ok(());
        }
        self.cfg_collection.update(config.clone()).await?;
        let mut affected_cfg_ids = self.cfg_collection.get_descendants(&config_id).await?;
        affected_cfg_ids.insert(config_id);
        self.reconfigure_affected_devices(affected_cfg_ids, None)
            .await?;
        Ok(())
    }

    /// Delete a config. Devices holding exactly this config become
    /// unconfigured; descendants are reconfigured against the spliced
    /// forest.
    pub async fn cfg_delete(&self, config_id: &str) -> Result<()> {
        let _guard = self.rw_lock.write().await;
        info!("Deleting config {}", config_id);
        let mut affected_cfg_ids = self.cfg_collection.get_descendants(config_id).await?;
        affected_cfg_ids.insert(config_id.to_string());
        self.cfg_collection.delete(config_id).await?;
        self.reconfigure_affected_devices(affected_cfg_ids, Some(config_id))
            .await?;
        Ok(())
    }

    pub async fn cfg_retrieve(&self, config_id: &str) -> Result<Option<Config>> {
        self.cfg_collection.retrieve(config_id).await
    }

    /// Materialized raw config of a node, with documented defaults
    /// applied.
    pub async fn cfg_retrieve_raw_config(&self, config_id: &str) -> Result<Option<Value>> {
        let raw_config = self
            .cfg_collection
            .get_raw_config(config_id, &self.base_raw_config)
            .await?;
        Ok(raw_config.map(|mut raw_config| {
            set_raw_config_defaults(&mut raw_config);
            raw_config
        }))
    }

    pub async fn cfg_find(
        &self,
        selector: &Selector,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        self.cfg_collection.find(selector, options).await
    }

    pub async fn cfg_find_one(&self, selector: &Selector) -> Result<Option<Document>> {
        self.cfg_collection.find_one(selector).await
    }

    /// Create a new config from the config with the autocreate role.
    pub async fn cfg_create_new(&self) -> Result<Option<String>> {
        let _guard = self.rw_lock.write().await;
        info!("Creating new config");
        self.cfg_collection.create_from_autocreate().await
    }

    // plugin helpers

    fn pg_load_internal(&self, plugin_id: &str) -> Result<()> {
        let mut gen_cfg = self.general_config.clone();
        if let Some(map) = gen_cfg.as_object_mut() {
            let proxies = self.service_config.proxies();
            map.insert(
                "proxies".to_string(),
                json!({
                    "http": proxies.http,
                    "https": proxies.https,
                    "ftp": proxies.ftp,
                }),
            );
        }
        let spec_cfg = self
            .plugin_specific_configs
            .get(plugin_id)
            .cloned()
            .unwrap_or_else(|| json!({}));
        self.pg_mgr.load(plugin_id, gen_cfg, spec_cfg)?;
        self.pg_configure_common(plugin_id)
    }

    fn pg_configure_common(&self, plugin_id: &str) -> Result<()> {
        let plugin = self
            .pg_mgr
            .get(plugin_id)
            .ok_or_else(|| ProvdError::PluginNotLoaded(plugin_id.to_string()))?;
        info!("Configuring plugin {} with common config", plugin_id);
        let common_config = self.base_raw_config.clone();
        if let Err(e) = plugin.configure_common(&common_config) {
            error!("Error while configuring plugin {}: {}", plugin_id, e);
            return Err(e);
        }
        Ok(())
    }

    fn pg_unload_internal(&self, plugin_id: &str) {
        match self.pg_mgr.unload(plugin_id) {
            Ok(()) => {}
            Err(ProvdError::PluginNotLoaded(_)) => {
                // an incompatible/bogus plugin was installed successfully
                // but was never loadable
                info!("Plugin {} was not loaded", plugin_id);
            }
            Err(e) => warn!("Error while unloading plugin {}: {}", plugin_id, e),
        }
    }

    async fn pg_configure_all_devices(&self, plugin_id: &str) -> Result<()> {
        info!("Reconfiguring all devices using plugin {}", plugin_id);
        let devices = self
            .dev_collection
            .find(&selector(json!({"plugin": plugin_id})))
            .await?;
        for mut device in devices {
            if device.configured {
                self.dev_deconfigure_if_possible(&device);
            }
            let configured = self.dev_configure_if_possible(&device).await?;
            if device.configured != configured {
                device.configured = configured;
                self.dev_collection.update(&device).await?;
            }
        }
        Ok(())
    }

    // plugin operations

    /// Load every installed plugin, logging failures without aborting.
    pub async fn load_all_plugins(&self) {
        let _guard = self.rw_lock.write().await;
        info!("Loading all plugins");
        let installed = match self.pg_mgr.list_installed() {
            Ok(installed) => installed,
            Err(e) => {
                error!("Could not list installed plugins: {}", e);
                return;
            }
        };
        let mut loaded_plugins = 0;
        for plugin_id in installed.keys() {
            match self.pg_load_internal(plugin_id) {
                Ok(()) => loaded_plugins += 1,
                Err(e) => error!("Could not load plugin {}: {}", plugin_id, e),
            }
        }
        info!("Loaded {} plugins.", loaded_plugins);
    }

    /// Install, load and configure a plugin, reconfiguring its devices.
    ///
    /// Returns the operation future and its operation-in-progress
    /// monitor. The download/extract phase runs without the write lock;
    /// loading and device configuration take it.
    pub fn pg_install(
        self: Arc<Self>,
        plugin_id: &str,
    ) -> Result<(BoxFuture<'static, Result<()>>, OperationInProgress)> {
        info!("Installing and loading plugin {}", plugin_id);
        if self.pg_mgr.is_installed(plugin_id) {
            return Err(ProvdError::InvalidState(format!(
                "plugin {plugin_id} is already installed"
            )));
        }
        let (install_future, oip) = self.pg_mgr.install(plugin_id)?;
        let app = self;
        let plugin_id = plugin_id.to_string();
        let top_oip = oip.clone();
        let future: BoxFuture<'static, Result<()>> = Box::pin(async move {
            install_future.await?;
            // back to in-progress for the load/configure phase
            top_oip.set_state(OipState::Progress);
            let result = {
                let _guard = app.rw_lock.write().await;
                match app.pg_load_internal(&plugin_id) {
                    Ok(()) => app.pg_configure_all_devices(&plugin_id).await,
                    Err(e) => Err(e),
                }
            };
            match &result {
                Ok(()) => top_oip.set_state(OipState::Success),
                Err(_) => top_oip.set_state(OipState::Fail),
            }
            result
        });
        Ok((future, oip))
    }

    /// Upgrade an installed plugin, reloading it and reconfiguring its
    /// devices. Same contract as [`Self::pg_install`].
    pub fn pg_upgrade(
        self: Arc<Self>,
        plugin_id: &str,
    ) -> Result<(BoxFuture<'static, Result<()>>, OperationInProgress)> {
        info!("Upgrading and reloading plugin {}", plugin_id);
        if !self.pg_mgr.is_installed(plugin_id) {
            return Err(ProvdError::InvalidState(format!(
                "plugin {plugin_id} is not already installed"
            )));
        }
        let (upgrade_future, oip) = self.pg_mgr.upgrade(plugin_id)?;
        let app = self;
        let plugin_id = plugin_id.to_string();
        let top_oip = oip.clone();
        let future: BoxFuture<'static, Result<()>> = Box::pin(async move {
            upgrade_future.await?;
            top_oip.set_state(OipState::Progress);
            let result = {
                let _guard = app.rw_lock.write().await;
                if app.pg_mgr.contains(&plugin_id) {
                    app.pg_unload_internal(&plugin_id);
                }
                match app.pg_load_internal(&plugin_id) {
                    Ok(()) => app.pg_configure_all_devices(&plugin_id).await,
                    Err(e) => Err(e),
                }
            };
            match &result {
                Ok(()) => top_oip.set_state(OipState::Success),
                Err(_) => top_oip.set_state(OipState::Fail),
            }
            result
        });
        Ok((future, oip))
    }

    /// Uninstall and unload a plugin; its devices are soft-deconfigured.
    ///
    /// There is no point in calling `deconfigure` for those devices
    /// since the plugin tree is removed anyway.
    pub async fn pg_uninstall(&self, plugin_id: &str) -> Result<()> {
        let _guard = self.rw_lock.write().await;
        info!("Uninstalling and unloading plugin {}", plugin_id);
        self.pg_mgr.uninstall(plugin_id)?;
        self.pg_unload_internal(plugin_id);
        let affected_devices = self
            .dev_collection
            .find(&selector(json!({"plugin": plugin_id, "configured": true})))
            .await?;
        for mut device in affected_devices {
            device.configured = false;
            self.dev_collection.update(&device).await?;
        }
        Ok(())
    }

    /// Reload a plugin from disk, reconfiguring every device using it.
    /// The plugin is loaded even if it was not loaded before.
    pub async fn pg_reload(&self, plugin_id: &str) -> Result<()> {
        let _guard = self.rw_lock.write().await;
        info!("Reloading plugin {}", plugin_id);
        if !self.pg_mgr.is_installed(plugin_id) {
            return Err(ProvdError::InvalidState(format!(
                "plugin {plugin_id} is not installed"
            )));
        }
        let devices = self
            .dev_collection
            .find(&selector(json!({"plugin": plugin_id})))
            .await?;

        if let Some(plugin) = self.pg_mgr.get(plugin_id) {
            for device in &devices {
                if device.configured {
                    self.dev_deconfigure(device, &plugin);
                }
            }
            self.pg_unload_internal(plugin_id);
        }

        if let Err(e) = self.pg_load_internal(plugin_id) {
            // mark every device as not configured and surface the error
            for mut device in devices {
                if device.configured {
                    device.configured = false;
                    self.dev_collection.update(&device).await?;
                }
            }
            return Err(e);
        }

        for mut device in devices {
            let configured = self.dev_configure_if_possible(&device).await?;
            if device.configured != configured {
                device.configured = configured;
                self.dev_collection.update(&device).await?;
            }
        }
        Ok(())
    }

    pub fn pg_retrieve(&self, plugin_id: &str) -> Result<Arc<dyn Plugin>> {
        self.pg_mgr
            .get(plugin_id)
            .ok_or_else(|| ProvdError::PluginNotLoaded(plugin_id.to_string()))
    }

    // tenant events

    /// Delete every device of a tenant and drop its provisioning key.
    /// Driven by the bus consumer on `auth_tenant_deleted`.
    pub async fn handle_tenant_deleted(&self, tenant_uuid: &str) -> Result<()> {
        info!("Removing devices of deleted tenant {}", tenant_uuid);
        let devices = self
            .dev_find(&selector(json!({"tenant_uuid": tenant_uuid})))
            .await?;
        for device in devices {
            if let Some(device_id) = device.id.as_deref() {
                if let Err(e) = self.dev_delete(device_id).await {
                    warn!("Could not delete device {}: {}", device_id, e);
                }
            }
        }
        self.service_config.remove_tenant(tenant_uuid).await?;
        Ok(())
    }

    /// Close the application: unload plugins and flush the stores.
    pub async fn close(&self) -> Result<()> {
        let _guard = self.rw_lock.write().await;
        info!("Closing provisioning application...");
        self.pg_mgr.close();
        self.dev_collection.close().await?;
        self.cfg_collection.close().await?;
        self.service_config.persist().await?;
        info!("Provisioning application closed");
        Ok(())
    }
}
