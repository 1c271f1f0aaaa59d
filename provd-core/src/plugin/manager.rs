//! Plugin lifecycle management.
//!
//! The manager tracks installed plugin bundles on disk and currently
//! loaded plugin instances in memory. Install and upgrade download
//! packages from the configured repository, verify them against the
//! index digest and extract them atomically; load instantiates a
//! compiled-in driver over the installed bundle.
//!
//! State machine per plugin id:
//! `absent -> installing -> installed (unloaded) -> loaded -> unloaded
//! -> uninstalling -> absent`. Everything except plugin usage is
//! serialized under the application write lock.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::download::{Downloader, ProxyConfig};
use crate::error::{ProvdError, Result};
use crate::operation::{OipState, OperationInProgress};
use crate::synchronize::SynchronizeService;

use super::archive::extract_plugin;
use super::info::{parse_plugins_db, InstallablePluginInfo, PluginInfo, DB_FILENAME};
use super::{Plugin, PluginContext, PluginDriver};

const INSTALL_LABEL: &str = "install";
const DOWNLOAD_LABEL: &str = "download";
const UPDATE_LABEL: &str = "update";

/// Load/unload notifications sent to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginEvent {
    Load(String),
    Unload(String),
}

/// Manage the life cycle of plugins in the plugin ecosystem.
pub struct PluginManager {
    plugins_dir: PathBuf,
    cache_dir: PathBuf,
    check_compat_min: bool,
    check_compat_max: bool,
    /// Base address of the plugins repository.
    server: RwLock<Option<String>>,
    downloader: RwLock<Downloader>,
    drivers: HashMap<String, Box<dyn PluginDriver>>,
    plugins: RwLock<HashMap<String, Arc<dyn Plugin>>>,
    in_install: Arc<Mutex<HashSet<String>>>,
    in_update: Arc<AtomicBool>,
    sync_service: RwLock<Option<Arc<dyn SynchronizeService>>>,
    events: broadcast::Sender<PluginEvent>,
}

impl PluginManager {
    pub fn new(plugins_dir: impl Into<PathBuf>, cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let (events, _) = broadcast::channel(16);
        Ok(Self {
            plugins_dir: plugins_dir.into(),
            cache_dir: cache_dir.into(),
            check_compat_min: true,
            check_compat_max: true,
            server: RwLock::new(None),
            downloader: RwLock::new(Downloader::new(&ProxyConfig::default())?),
            drivers: HashMap::new(),
            plugins: RwLock::new(HashMap::new()),
            in_install: Arc::new(Mutex::new(HashSet::new())),
            in_update: Arc::new(AtomicBool::new(false)),
            sync_service: RwLock::new(None),
            events,
        })
    }

    pub fn with_compat_checks(mut self, check_min: bool, check_max: bool) -> Self {
        self.check_compat_min = check_min;
        self.check_compat_max = check_max;
        self
    }

    /// Register a compiled-in driver. Drivers are fixed once the manager
    /// is shared.
    pub fn register_driver(&mut self, driver: Box<dyn PluginDriver>) {
        debug!("Registering plugin driver {}", driver.name());
        self.drivers.insert(driver.name().to_string(), driver);
    }

    pub fn plugins_dir(&self) -> &PathBuf {
        &self.plugins_dir
    }

    pub fn set_server(&self, server: Option<String>) {
        *self.server.write().expect("server lock poisoned") = server;
    }

    pub fn server(&self) -> Option<String> {
        self.server.read().expect("server lock poisoned").clone()
    }

    /// Rebuild the downloader with new proxy settings.
    pub fn set_proxies(&self, proxies: &ProxyConfig) -> Result<()> {
        let downloader = Downloader::new(proxies)?;
        *self.downloader.write().expect("downloader lock poisoned") = downloader;
        Ok(())
    }

    pub fn set_sync_service(&self, sync_service: Option<Arc<dyn SynchronizeService>>) {
        *self
            .sync_service
            .write()
            .expect("sync service lock poisoned") = sync_service;
    }

    /// Subscribe to load/unload notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.events.subscribe()
    }

    fn notify(&self, event: PluginEvent) {
        debug!("Notifying observers: {:?}", event);
        let _ = self.events.send(event);
    }

    fn db_pathname(&self) -> PathBuf {
        self.plugins_dir.join(DB_FILENAME)
    }

    fn join_server_url(&self, filename: &str) -> Result<String> {
        let Some(server) = self.server() else {
            return Err(ProvdError::InvalidParameter(
                "'server' has no value set".to_string(),
            ));
        };
        if server.ends_with('/') {
            Ok(format!("{server}{filename}"))
        } else {
            Ok(format!("{server}/{filename}"))
        }
    }

    /// Installable plugins, from the local copy of the repository index.
    pub fn list_installable(&self) -> BTreeMap<String, InstallablePluginInfo> {
        parse_plugins_db(&self.db_pathname())
    }

    /// Installed plugins, from the plugins directory.
    ///
    /// Fails when a plugin directory has a missing or invalid info file.
    pub fn list_installed(&self) -> Result<BTreeMap<String, PluginInfo>> {
        let mut installed = BTreeMap::new();
        if !self.plugins_dir.is_dir() {
            return Ok(installed);
        }
        for entry in std::fs::read_dir(&self.plugins_dir)? {
            let entry = entry?;
            if !entry.path().is_dir() {
                continue;
            }
            let plugin_id = entry.file_name().to_string_lossy().into_owned();
            let info = PluginInfo::read_from_dir(&entry.path())?;
            installed.insert(plugin_id, info);
        }
        Ok(installed)
    }

    pub fn is_installed(&self, plugin_id: &str) -> bool {
        self.plugins_dir.join(plugin_id).is_dir()
    }

    /// Install a plugin.
    ///
    /// This does not check whether the plugin is already installed and
    /// does not load the newly installed plugin. Returns the install
    /// future and its operation in progress; the caller decides when to
    /// drive it.
    pub fn install(
        &self,
        plugin_id: &str,
    ) -> Result<(BoxFuture<'static, Result<()>>, OperationInProgress)> {
        info!("Installing plugin \"{}\"", plugin_id);
        {
            let mut in_install = self.in_install.lock().expect("in_install lock poisoned");
            if !in_install.insert(plugin_id.to_string()) {
                return Err(ProvdError::InvalidState(format!(
                    "an install/upgrade operation for plugin '{plugin_id}' is already in progress"
                )));
            }
        }

        let setup = self.install_setup(plugin_id);
        let (pg_info, url) = match setup {
            Ok(setup) => setup,
            Err(e) => {
                self.in_install
                    .lock()
                    .expect("in_install lock poisoned")
                    .remove(plugin_id);
                return Err(e);
            }
        };

        let oip = OperationInProgress::new(INSTALL_LABEL, OipState::Progress);
        let worker = InstallWorker {
            in_install: self.in_install.clone(),
            downloader: self
                .downloader
                .read()
                .expect("downloader lock poisoned")
                .clone(),
            cache_dir: self.cache_dir.clone(),
            plugins_dir: self.plugins_dir.clone(),
        };
        let plugin_id = plugin_id.to_string();
        let top_oip = oip.clone();
        let future: BoxFuture<'static, Result<()>> = Box::pin(async move {
            let result = worker
                .fetch_and_extract(&plugin_id, &pg_info, url, &top_oip)
                .await;
            worker
                .in_install
                .lock()
                .expect("in_install lock poisoned")
                .remove(&plugin_id);
            match &result {
                Ok(()) => top_oip.set_state(OipState::Success),
                Err(_) => top_oip.set_state(OipState::Fail),
            }
            result
        });
        Ok((future, oip))
    }

    fn install_setup(&self, plugin_id: &str) -> Result<(InstallablePluginInfo, Option<String>)> {
        let pg_info = self
            .list_installable()
            .remove(plugin_id)
            .ok_or_else(|| ProvdError::EntryNotFound(format!("no installable plugin {plugin_id}")))?;
        let cache_filename = self.cache_dir.join(&pg_info.filename);
        let url = if cache_filename.is_file() {
            None
        } else {
            Some(self.join_server_url(&pg_info.filename)?)
        };
        Ok((pg_info, url))
    }

    /// Upgrade a plugin. Right now there is no difference between
    /// calling this method and calling `install`.
    pub fn upgrade(
        &self,
        plugin_id: &str,
    ) -> Result<(BoxFuture<'static, Result<()>>, OperationInProgress)> {
        info!("Upgrading plugin \"{}\"", plugin_id);
        self.install(plugin_id)
    }

    /// Uninstall a plugin. This does not unload the plugin; callers
    /// unload first.
    pub fn uninstall(&self, plugin_id: &str) -> Result<()> {
        info!("Uninstalling plugin \"{}\"", plugin_id);
        if !self.is_installed(plugin_id) {
            return Err(ProvdError::EntryNotFound(format!(
                "plugin {plugin_id} not found"
            )));
        }
        std::fs::remove_dir_all(self.plugins_dir.join(plugin_id))?;
        Ok(())
    }

    /// Download a fresh copy of the plugin definition file.
    ///
    /// An incomplete download never replaces the local copy.
    pub fn update(&self) -> Result<(BoxFuture<'static, Result<()>>, OperationInProgress)> {
        info!("Updating the plugin definition file");
        if self.in_update.swap(true, Ordering::SeqCst) {
            return Err(ProvdError::InvalidState(
                "an update operation is already in progress".to_string(),
            ));
        }
        let url = match self.join_server_url(DB_FILENAME) {
            Ok(url) => url,
            Err(e) => {
                self.in_update.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let oip = OperationInProgress::new(UPDATE_LABEL, OipState::Waiting);
        let downloader = self
            .downloader
            .read()
            .expect("downloader lock poisoned")
            .clone();
        let db_pathname = self.db_pathname();
        let in_update = self.in_update.clone();
        let dl_oip = oip.clone();
        let future: BoxFuture<'static, Result<()>> = Box::pin(async move {
            let result = downloader
                .download_file(&url, &db_pathname, &dl_oip, None)
                .await;
            in_update.store(false, Ordering::SeqCst);
            result
        });
        Ok((future, oip))
    }

    /// Load a plugin.
    ///
    /// No more than one instance of a plugin id is active at any time.
    pub fn load(&self, plugin_id: &str, gen_cfg: Value, spec_cfg: Value) -> Result<()> {
        info!("Loading plugin \"{}\"", plugin_id);
        {
            let plugins = self.plugins.read().expect("plugins lock poisoned");
            if plugins.contains_key(plugin_id) {
                return Err(ProvdError::InvalidState(format!(
                    "plugin '{plugin_id}' is already loaded"
                )));
            }
        }
        let plugin_dir = self.plugins_dir.join(plugin_id);
        let plugin_info = PluginInfo::read_from_dir(&plugin_dir)?;
        plugin_info.check_compat(self.check_compat_min, self.check_compat_max)?;

        let driver_name = plugin_info.entry_name().to_string();
        let driver = self.drivers.get(&driver_name).ok_or_else(|| {
            ProvdError::Plugin(format!(
                "pg '{plugin_id}': no driver named '{driver_name}' registered"
            ))
        })?;
        let context = PluginContext {
            id: plugin_id.to_string(),
            plugin_dir,
            info: plugin_info,
            general_config: gen_cfg,
            specific_config: spec_cfg,
            sync_service: self
                .sync_service
                .read()
                .expect("sync service lock poisoned")
                .clone(),
        };
        let plugin = driver.create(context)?;
        self.plugins
            .write()
            .expect("plugins lock poisoned")
            .insert(plugin_id.to_string(), plugin);
        self.notify(PluginEvent::Load(plugin_id.to_string()));
        Ok(())
    }

    /// Unload a plugin, tolerating close failures.
    pub fn unload(&self, plugin_id: &str) -> Result<()> {
        info!("Unloading plugin \"{}\"", plugin_id);
        let plugin = self
            .plugins
            .write()
            .expect("plugins lock poisoned")
            .remove(plugin_id)
            .ok_or_else(|| ProvdError::PluginNotLoaded(plugin_id.to_string()))?;
        if let Err(e) = plugin.close() {
            warn!("Error while closing plugin {}: {}", plugin_id, e);
        }
        self.notify(PluginEvent::Unload(plugin_id.to_string()));
        Ok(())
    }

    /// Unload every loaded plugin.
    pub fn close(&self) {
        info!("Closing plugin manager...");
        let plugin_ids: Vec<String> = self
            .plugins
            .read()
            .expect("plugins lock poisoned")
            .keys()
            .cloned()
            .collect();
        for plugin_id in plugin_ids {
            if let Err(e) = self.unload(&plugin_id) {
                warn!("Error while unloading plugin {}: {}", plugin_id, e);
            }
        }
    }

    pub fn get(&self, plugin_id: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins
            .read()
            .expect("plugins lock poisoned")
            .get(plugin_id)
            .cloned()
    }

    pub fn contains(&self, plugin_id: &str) -> bool {
        self.plugins
            .read()
            .expect("plugins lock poisoned")
            .contains_key(plugin_id)
    }

    /// Loaded plugins, sorted by id.
    pub fn loaded_plugins(&self) -> Vec<(String, Arc<dyn Plugin>)> {
        let plugins = self.plugins.read().expect("plugins lock poisoned");
        let mut loaded: Vec<(String, Arc<dyn Plugin>)> = plugins
            .iter()
            .map(|(id, plugin)| (id.clone(), plugin.clone()))
            .collect();
        loaded.sort_by(|(a, _), (b, _)| a.cmp(b));
        loaded
    }

    pub fn loaded_count(&self) -> usize {
        self.plugins.read().expect("plugins lock poisoned").len()
    }
}

/// State moved into a running install operation.
struct InstallWorker {
    in_install: Arc<Mutex<HashSet<String>>>,
    downloader: Downloader,
    cache_dir: PathBuf,
    plugins_dir: PathBuf,
}

impl InstallWorker {
    async fn fetch_and_extract(
        &self,
        plugin_id: &str,
        pg_info: &InstallablePluginInfo,
        url: Option<String>,
        top_oip: &OperationInProgress,
    ) -> Result<()> {
        let cache_filename = self.cache_dir.join(&pg_info.filename);
        if let Some(url) = url {
            let dl_oip = OperationInProgress::new(DOWNLOAD_LABEL, OipState::Waiting);
            dl_oip.set_end(pg_info.dsize);
            top_oip.push_sub_oip(dl_oip.clone());
            self.downloader
                .download_file(&url, &cache_filename, &dl_oip, pg_info.sha1sum.as_deref())
                .await?;
        }

        let plugins_dir = self.plugins_dir.clone();
        let extracted =
            tokio::task::spawn_blocking(move || extract_plugin(&cache_filename, &plugins_dir))
                .await
                .map_err(|e| ProvdError::Plugin(format!("extraction task failed: {e}")))??;
        if !extracted.iter().any(|name| name == plugin_id) {
            warn!(
                "Package for plugin {} extracted trees {:?}",
                plugin_id, extracted
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::StandardPluginDriver;
    use flate2::{write::GzEncoder, Compression};
    use serde_json::json;
    use std::path::Path;

    fn write_plugin_info(plugin_dir: &Path, capabilities: Value) {
        std::fs::create_dir_all(plugin_dir).unwrap();
        std::fs::write(
            plugin_dir.join("plugin-info"),
            serde_json::to_vec(&json!({
                "version": "1.0",
                "description": "test plugin",
                "capabilities": capabilities,
            }))
            .unwrap(),
        )
        .unwrap();
    }

    fn new_manager(dir: &Path) -> Arc<PluginManager> {
        let plugins_dir = dir.join("plugins");
        let cache_dir = dir.join("cache");
        std::fs::create_dir_all(&plugins_dir).unwrap();
        std::fs::create_dir_all(&cache_dir).unwrap();
        let mut manager = PluginManager::new(plugins_dir, cache_dir).unwrap();
        manager.register_driver(Box::new(StandardPluginDriver));
        Arc::new(manager)
    }

    #[tokio::test]
    async fn test_load_unload_notifies() {
        let dir = tempfile::tempdir().unwrap();
        let manager = new_manager(dir.path());
        write_plugin_info(&dir.path().join("plugins/acme-spark"), json!({}));

        let mut events = manager.subscribe();
        manager.load("acme-spark", json!({}), json!({})).unwrap();
        assert!(manager.contains("acme-spark"));
        assert_eq!(
            events.try_recv().unwrap(),
            PluginEvent::Load("acme-spark".to_string())
        );

        // loading twice is an error
        assert!(manager.load("acme-spark", json!({}), json!({})).is_err());

        manager.unload("acme-spark").unwrap();
        assert!(!manager.contains("acme-spark"));
        assert_eq!(
            events.try_recv().unwrap(),
            PluginEvent::Unload("acme-spark".to_string())
        );
        assert!(matches!(
            manager.unload("acme-spark").unwrap_err(),
            ProvdError::PluginNotLoaded(_)
        ));
    }

    #[tokio::test]
    async fn test_load_incompatible_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let manager = new_manager(dir.path());
        let plugin_dir = dir.path().join("plugins/acme-spark");
        std::fs::create_dir_all(&plugin_dir).unwrap();
        std::fs::write(
            plugin_dir.join("plugin-info"),
            serde_json::to_vec(&json!({
                "version": "1.0",
                "description": "too new",
                "capabilities": {},
                "plugin_iface_version_min": "9.9",
            }))
            .unwrap(),
        )
        .unwrap();
        assert!(manager.load("acme-spark", json!({}), json!({})).is_err());
        assert!(!manager.contains("acme-spark"));
    }

    #[tokio::test]
    async fn test_install_from_cache_and_uninstall() {
        let dir = tempfile::tempdir().unwrap();
        let manager = new_manager(dir.path());

        // seed the index and a cached package
        std::fs::write(
            dir.path().join("plugins").join(DB_FILENAME),
            serde_json::to_vec(&json!({
                "acme-spark": {
                    "filename": "acme-spark-1.0.tar.gz",
                    "version": "1.0",
                    "description": "test plugin",
                }
            }))
            .unwrap(),
        )
        .unwrap();
        let package = dir.path().join("cache/acme-spark-1.0.tar.gz");
        let file = std::fs::File::create(&package).unwrap();
        let encoder = GzEncoder::new(file, Compression::default());
        let mut builder = tar::Builder::new(encoder);
        let info = serde_json::to_vec(&json!({
            "version": "1.0",
            "description": "test plugin",
            "capabilities": {},
        }))
        .unwrap();
        let mut header = tar::Header::new_gnu();
        header.set_size(info.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "acme-spark/plugin-info", info.as_slice())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let (future, oip) = manager.install("acme-spark").unwrap();
        future.await.unwrap();
        assert_eq!(oip.state(), OipState::Success);
        assert!(manager.is_installed("acme-spark"));
        assert!(manager.list_installed().unwrap().contains_key("acme-spark"));

        manager.uninstall("acme-spark").unwrap();
        assert!(!manager.is_installed("acme-spark"));
        assert!(matches!(
            manager.uninstall("acme-spark").unwrap_err(),
            ProvdError::EntryNotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_install_unknown_plugin() {
        let dir = tempfile::tempdir().unwrap();
        let manager = new_manager(dir.path());
        assert!(matches!(
            manager.install("nope").err().unwrap(),
            ProvdError::EntryNotFound(_)
        ));
        // the in-progress marker was cleaned up
        assert!(matches!(
            manager.install("nope").err().unwrap(),
            ProvdError::EntryNotFound(_)
        ));
    }
}
