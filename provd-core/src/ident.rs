//! Request processing service.
//!
//! Turns an incoming HTTP/TFTP/DHCP request into a `(device, plugin id)`
//! pair through three composable stages: extract device info, retrieve a
//! device, update the device. Each stage is exception-isolated so a
//! faulty extractor or plugin cannot take unrelated phones down with it.
//!
//! DHCP requests are not served by the provisioning server per se; they
//! are only mined for information (for example to keep the IP <-> MAC
//! association of a device up to date).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::app::ProvisioningApplication;
use crate::config::{selector, Config};
use crate::device::{Added, Device, DeviceInfo};
use crate::error::Result;
use crate::pgasso::{ConflictSolver, DeviceSupport, PluginAssociator};
use crate::plugin::PluginManager;
use crate::security::log_security_msg;

/// Protocol of an incoming request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Http,
    Tftp,
    Dhcp,
}

/// Protocol-specific request data exposed to extractors.
#[derive(Debug, Clone)]
pub enum RequestInfo {
    Http {
        /// Client IP, already normalized.
        ip: String,
        /// Request path.
        path: String,
    },
    Tftp {
        ip: String,
        filename: String,
    },
    Dhcp {
        ip: String,
        mac: String,
        /// Raw DHCP options, keyed by option code.
        options: HashMap<u8, String>,
    },
}

impl RequestInfo {
    pub fn request_type(&self) -> RequestType {
        match self {
            RequestInfo::Http { .. } => RequestType::Http,
            RequestInfo::Tftp { .. } => RequestType::Tftp,
            RequestInfo::Dhcp { .. } => RequestType::Dhcp,
        }
    }

    pub fn ip(&self) -> &str {
        match self {
            RequestInfo::Http { ip, .. }
            | RequestInfo::Tftp { ip, .. }
            | RequestInfo::Dhcp { ip, .. } => ip,
        }
    }

    /// Base name of the requested file, when the protocol carries one.
    pub fn filename(&self) -> Option<&str> {
        let path = match self {
            RequestInfo::Http { path, .. } => path,
            RequestInfo::Tftp { filename, .. } => filename,
            RequestInfo::Dhcp { .. } => return None,
        };
        Some(path.rsplit('/').next().unwrap_or(path))
    }
}

/// Extract device information from a request.
#[async_trait]
pub trait DeviceInfoExtractor: Send + Sync {
    /// Return extracted info, or `None` when nothing could be extracted.
    async fn extract(&self, request: &RequestInfo) -> Option<DeviceInfo>;
}

/// Extractor returning standard, readily available information: the
/// client IP, plus the MAC for DHCP requests.
pub struct StandardDeviceInfoExtractor;

#[async_trait]
impl DeviceInfoExtractor for StandardDeviceInfoExtractor {
    async fn extract(&self, request: &RequestInfo) -> Option<DeviceInfo> {
        let mut dev_info = DeviceInfo {
            ip: Some(request.ip().to_string()),
            ..Default::default()
        };
        if let RequestInfo::Dhcp { mac, .. } = request {
            dev_info.mac = Some(mac.clone());
        }
        Some(dev_info)
    }
}

/// How a collaborating extractor merges the info its children produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// On conflict, the last seen value wins.
    LastSeen,
    /// Per key, the most frequent value wins; ties break toward the
    /// lexicographically smallest value so one call is deterministic.
    Voting,
}

fn merge_infos(strategy: MergeStrategy, infos: Vec<DeviceInfo>) -> DeviceInfo {
    match strategy {
        MergeStrategy::LastSeen => {
            let mut result = DeviceInfo::default();
            for info in &infos {
                result.update_from(info);
            }
            result
        }
        MergeStrategy::Voting => {
            let mut votes: BTreeMap<&str, BTreeMap<String, u32>> = BTreeMap::new();
            for info in &infos {
                for key in DeviceInfo::KEYS {
                    if let Some(value) = info.get(key) {
                        *votes
                            .entry(key)
                            .or_default()
                            .entry(value.to_string())
                            .or_insert(0) += 1;
                    }
                }
            }
            let mut result = DeviceInfo::default();
            for (key, pool) in votes {
                // max count; BTreeMap iteration makes the smallest value
                // win ties
                if let Some((value, _)) = pool
                    .iter()
                    .max_by(|(va, ca), (vb, cb)| ca.cmp(cb).then(vb.cmp(va)))
                {
                    result.set(key, value.clone());
                }
            }
            result
        }
    }
}

/// Composite extractor returning the merged result of its children.
pub struct CollaboratingDeviceInfoExtractor {
    strategy: MergeStrategy,
    extractors: Vec<Arc<dyn DeviceInfoExtractor>>,
}

impl CollaboratingDeviceInfoExtractor {
    pub fn new(strategy: MergeStrategy, extractors: Vec<Arc<dyn DeviceInfoExtractor>>) -> Self {
        Self {
            strategy,
            extractors,
        }
    }
}

#[async_trait]
impl DeviceInfoExtractor for CollaboratingDeviceInfoExtractor {
    async fn extract(&self, request: &RequestInfo) -> Option<DeviceInfo> {
        let mut extracted = Vec::new();
        for extractor in &self.extractors {
            if let Some(info) = extractor.extract(request).await {
                if !info.is_empty() {
                    debug!("extract result: {:?}", info);
                    extracted.push(info);
                }
            }
        }
        let merged = merge_infos(self.strategy, extracted);
        if merged.is_empty() {
            None
        } else {
            Some(merged)
        }
    }
}

/// Composite extractor forwarding to the extractors of every loaded
/// plugin. The plugin set is re-read on every call, so plugin loads and
/// unloads take effect immediately.
pub struct AllPluginsDeviceInfoExtractor {
    strategy: MergeStrategy,
    pg_mgr: Arc<PluginManager>,
}

impl AllPluginsDeviceInfoExtractor {
    pub fn new(strategy: MergeStrategy, pg_mgr: Arc<PluginManager>) -> Self {
        Self { strategy, pg_mgr }
    }
}

#[async_trait]
impl DeviceInfoExtractor for AllPluginsDeviceInfoExtractor {
    async fn extract(&self, request: &RequestInfo) -> Option<DeviceInfo> {
        let request_type = request.request_type();
        let mut extracted = Vec::new();
        for (pg_id, plugin) in self.pg_mgr.loaded_plugins() {
            let extractor = match request_type {
                RequestType::Http => plugin.http_dev_info_extractor(),
                RequestType::Tftp => plugin.tftp_dev_info_extractor(),
                RequestType::Dhcp => plugin.dhcp_dev_info_extractor(),
            };
            if let Some(extractor) = extractor {
                debug!("Using {:?} extractor from {}", request_type, pg_id);
                if let Some(info) = extractor.extract(request).await {
                    if !info.is_empty() {
                        extracted.push(info);
                    }
                }
            }
        }
        let merged = merge_infos(self.strategy, extracted);
        if merged.is_empty() {
            None
        } else {
            Some(merged)
        }
    }
}

/// Retrieve a device object from device information.
///
/// Implementations may have side effects on the application, like adding
/// a new device.
#[async_trait]
pub trait DeviceRetriever: Send + Sync {
    async fn retrieve(&self, dev_info: &DeviceInfo) -> Result<Option<Device>>;
}

/// Look up the first device whose `key` field equals the device info
/// value.
pub struct SearchDeviceRetriever {
    app: Arc<ProvisioningApplication>,
    key: &'static str,
}

impl SearchDeviceRetriever {
    pub fn new(app: Arc<ProvisioningApplication>, key: &'static str) -> Self {
        Self { app, key }
    }

    pub fn mac(app: Arc<ProvisioningApplication>) -> Self {
        Self::new(app, "mac")
    }

    pub fn serial_number(app: Arc<ProvisioningApplication>) -> Self {
        Self::new(app, "sn")
    }

    pub fn uuid(app: Arc<ProvisioningApplication>) -> Self {
        Self::new(app, "uuid")
    }
}

#[async_trait]
impl DeviceRetriever for SearchDeviceRetriever {
    async fn retrieve(&self, dev_info: &DeviceInfo) -> Result<Option<Device>> {
        match dev_info.get(self.key) {
            Some(value) => {
                let mut search = crate::persist::Selector::new();
                search.insert(self.key.to_string(), json!(value));
                self.app.dev_find_one(&search).await
            }
            None => Ok(None),
        }
    }
}

/// Look up a device by IP, narrowing multiple matches by MAC, vendor and
/// model. An ambiguous result yields no device.
pub struct IpDeviceRetriever {
    app: Arc<ProvisioningApplication>,
}

impl IpDeviceRetriever {
    pub fn new(app: Arc<ProvisioningApplication>) -> Self {
        Self { app }
    }

    fn matching_device(devices: Vec<Device>, dev_info: &DeviceInfo) -> Option<Device> {
        let mut candidates = devices;
        for key in ["mac", "vendor", "model"] {
            if let Some(info_value) = dev_info.get(key) {
                candidates.retain(|device| match device.get_info_field(key) {
                    Some(device_value) => device_value == info_value,
                    None => true,
                });
            }
        }
        match candidates.len() {
            1 => candidates.pop(),
            0 => None,
            _ => {
                warn!(
                    "Multiple device match in IP device retriever: {:?}",
                    candidates.iter().filter_map(|d| d.id.as_deref()).collect::<Vec<_>>()
                );
                None
            }
        }
    }
}

#[async_trait]
impl DeviceRetriever for IpDeviceRetriever {
    async fn retrieve(&self, dev_info: &DeviceInfo) -> Result<Option<Device>> {
        let Some(ip) = &dev_info.ip else {
            return Ok(None);
        };
        let devices = self.app.dev_find(&selector(json!({"ip": ip}))).await?;
        Ok(Self::matching_device(devices, dev_info))
    }
}

/// Retriever that always inserts a new device, marked `added=auto`.
///
/// Useful at the end of a first-match composite so it only fires when
/// every lookup failed.
pub struct AddDeviceRetriever {
    app: Arc<ProvisioningApplication>,
}

impl AddDeviceRetriever {
    pub fn new(app: Arc<ProvisioningApplication>) -> Self {
        Self { app }
    }
}

#[async_trait]
impl DeviceRetriever for AddDeviceRetriever {
    async fn retrieve(&self, dev_info: &DeviceInfo) -> Result<Option<Device>> {
        let tenant_uuid = self.app.tenant_uuid().unwrap_or_default();
        let mut device = Device::from_device_info(dev_info, tenant_uuid);
        device.added = Some(Added::Auto);
        match self.app.dev_insert(&mut device).await {
            Ok(device_id) => {
                if let Some(device_ip) = &device.ip {
                    log_security_msg(&format!(
                        "New device created automatically from {device_ip}: {device_id}"
                    ));
                }
                Ok(Some(device))
            }
            Err(e) => {
                warn!("Could not auto-create device: {}", e);
                Ok(None)
            }
        }
    }
}

/// Composite retriever returning the first device a child finds.
pub struct FirstCompositeDeviceRetriever {
    pub retrievers: Vec<Arc<dyn DeviceRetriever>>,
}

impl FirstCompositeDeviceRetriever {
    pub fn new(retrievers: Vec<Arc<dyn DeviceRetriever>>) -> Self {
        Self { retrievers }
    }

    /// The typical chain: MAC, IP, UUID, serial number, then auto-add.
    pub fn standard_chain(app: Arc<ProvisioningApplication>) -> Self {
        Self::new(vec![
            Arc::new(SearchDeviceRetriever::mac(app.clone())),
            Arc::new(IpDeviceRetriever::new(app.clone())),
            Arc::new(SearchDeviceRetriever::uuid(app.clone())),
            Arc::new(SearchDeviceRetriever::serial_number(app.clone())),
            Arc::new(AddDeviceRetriever::new(app)),
        ])
    }
}

#[async_trait]
impl DeviceRetriever for FirstCompositeDeviceRetriever {
    async fn retrieve(&self, dev_info: &DeviceInfo) -> Result<Option<Device>> {
        for retriever in &self.retrievers {
            match retriever.retrieve(dev_info).await {
                Ok(Some(device)) => return Ok(Some(device)),
                Ok(None) => {}
                Err(e) => warn!("Device retriever failed: {}", e),
            }
        }
        Ok(None)
    }
}

/// Update a device object from an info object.
///
/// This stage exists for its side effects: field enrichment, config
/// auto-attachment, stale IP eviction, plugin association.
#[async_trait]
pub trait DeviceUpdater: Send + Sync {
    async fn update(
        &self,
        device: &mut Device,
        dev_info: &DeviceInfo,
        request: &RequestInfo,
    ) -> Result<()>;
}

/// Updater that updates nothing.
pub struct NullDeviceUpdater;

#[async_trait]
impl DeviceUpdater for NullDeviceUpdater {
    async fn update(
        &self,
        _device: &mut Device,
        _dev_info: &DeviceInfo,
        _request: &RequestInfo,
    ) -> Result<()> {
        Ok(())
    }
}

/// Copy selected device info keys into the device. A key already present
/// in the device is only overwritten when `force_update` is set.
pub struct DynamicDeviceUpdater {
    keys: Vec<&'static str>,
    force_update: bool,
}

impl DynamicDeviceUpdater {
    pub fn new(keys: Vec<&'static str>, force_update: bool) -> Self {
        Self { keys, force_update }
    }
}

#[async_trait]
impl DeviceUpdater for DynamicDeviceUpdater {
    async fn update(
        &self,
        device: &mut Device,
        dev_info: &DeviceInfo,
        _request: &RequestInfo,
    ) -> Result<()> {
        for key in &self.keys {
            if let Some(value) = dev_info.get(key) {
                if self.force_update || device.get_info_field(key).is_none() {
                    device.set_info_field(key, value.to_string());
                }
            }
        }
        Ok(())
    }
}

/// Add any missing information to the device from the device info.
pub struct AddInfoDeviceUpdater;

#[async_trait]
impl DeviceUpdater for AddInfoDeviceUpdater {
    async fn update(
        &self,
        device: &mut Device,
        dev_info: &DeviceInfo,
        _request: &RequestInfo,
    ) -> Result<()> {
        for key in DeviceInfo::KEYS {
            if let Some(value) = dev_info.get(key) {
                if device.get_info_field(key).is_none() {
                    device.set_info_field(key, value.to_string());
                }
            }
        }
        Ok(())
    }
}

/// Attach a freshly autocreated config to a device that has none.
pub struct AutocreateConfigDeviceUpdater {
    app: Arc<ProvisioningApplication>,
}

impl AutocreateConfigDeviceUpdater {
    pub fn new(app: Arc<ProvisioningApplication>) -> Self {
        Self { app }
    }
}

#[async_trait]
impl DeviceUpdater for AutocreateConfigDeviceUpdater {
    async fn update(
        &self,
        device: &mut Device,
        _dev_info: &DeviceInfo,
        _request: &RequestInfo,
    ) -> Result<()> {
        if device.config.is_none() {
            if let Some(new_config_id) = self.app.cfg_create_new().await? {
                device.config = Some(new_config_id);
            }
        }
        Ok(())
    }
}

/// Evict the `ip` field from any other device claiming the same IP, when
/// NAT mode is off.
pub struct RemoveOutdatedIpDeviceUpdater {
    app: Arc<ProvisioningApplication>,
}

impl RemoveOutdatedIpDeviceUpdater {
    pub fn new(app: Arc<ProvisioningApplication>) -> Self {
        Self { app }
    }
}

#[async_trait]
impl DeviceUpdater for RemoveOutdatedIpDeviceUpdater {
    async fn update(
        &self,
        device: &mut Device,
        dev_info: &DeviceInfo,
        _request: &RequestInfo,
    ) -> Result<()> {
        if self.app.nat_enabled() {
            return Ok(());
        }
        let Some(ip) = &dev_info.ip else {
            return Ok(());
        };
        let device_id = device.id.clone().unwrap_or_default();
        let outdated = self
            .app
            .dev_find(&selector(json!({"ip": ip, "id": {"$ne": device_id}})))
            .await?;
        for mut outdated_device in outdated {
            outdated_device.ip = None;
            self.app.dev_update(&mut outdated_device).await?;
        }
        Ok(())
    }
}

/// Associate a plugin by polling every loaded plugin's associator and
/// keeping the best candidate above the probable threshold.
pub struct PluginAssociatorDeviceUpdater {
    pg_mgr: Arc<PluginManager>,
    solver: Arc<dyn ConflictSolver>,
    pub min_level: DeviceSupport,
    pub force_update: bool,
}

impl PluginAssociatorDeviceUpdater {
    pub fn new(pg_mgr: Arc<PluginManager>, solver: Arc<dyn ConflictSolver>) -> Self {
        Self {
            pg_mgr,
            solver,
            min_level: DeviceSupport::Probable,
            force_update: false,
        }
    }

    fn best_plugin(&self, dev_info: &DeviceInfo) -> Option<String> {
        let mut scores: BTreeMap<DeviceSupport, Vec<String>> = BTreeMap::new();
        for (pg_id, plugin) in self.pg_mgr.loaded_plugins() {
            if let Some(associator) = plugin.pg_associator() {
                let score = associator.associate(dev_info);
                debug!("Associator: {} = score {:?}", pg_id, score);
                scores.entry(score).or_default().push(pg_id);
            }
        }
        let (max_score, pg_ids) = scores.iter().next_back()?;
        if *max_score < self.min_level {
            return None;
        }
        if pg_ids.len() == 1 {
            return pg_ids.first().cloned();
        }
        match self.solver.solve(pg_ids) {
            Some(pg_id) => Some(pg_id),
            None => {
                warn!("Conflict resolution yielded nothing for plugins: {:?}", pg_ids);
                None
            }
        }
    }
}

#[async_trait]
impl DeviceUpdater for PluginAssociatorDeviceUpdater {
    async fn update(
        &self,
        device: &mut Device,
        dev_info: &DeviceInfo,
        _request: &RequestInfo,
    ) -> Result<()> {
        if self.force_update || device.plugin.is_none() {
            if let Some(pg_id) = self.best_plugin(dev_info) {
                device.plugin = Some(pg_id);
            }
        }
        Ok(())
    }
}

/// Run several updaters in sequence, isolating each one's failures.
pub struct CompositeDeviceUpdater {
    pub updaters: Vec<Arc<dyn DeviceUpdater>>,
}

impl CompositeDeviceUpdater {
    pub fn new(updaters: Vec<Arc<dyn DeviceUpdater>>) -> Self {
        Self { updaters }
    }

    /// The typical chain: missing-info enrichment, IP freshening,
    /// autocreated config, stale IP eviction, then plugin association.
    pub fn standard_chain(
        app: Arc<ProvisioningApplication>,
        solver: Arc<dyn ConflictSolver>,
    ) -> Self {
        let pg_mgr = app.pg_mgr();
        Self::new(vec![
            Arc::new(AddInfoDeviceUpdater),
            Arc::new(DynamicDeviceUpdater::new(vec!["ip"], true)),
            Arc::new(AutocreateConfigDeviceUpdater::new(app.clone())),
            Arc::new(RemoveOutdatedIpDeviceUpdater::new(app)),
            Arc::new(PluginAssociatorDeviceUpdater::new(pg_mgr, solver)),
        ])
    }
}

#[async_trait]
impl DeviceUpdater for CompositeDeviceUpdater {
    async fn update(
        &self,
        device: &mut Device,
        dev_info: &DeviceInfo,
        request: &RequestInfo,
    ) -> Result<()> {
        for updater in &self.updaters {
            if let Err(e) = updater.update(device, dev_info, request).await {
                warn!("Device updater failed: {}", e);
            }
        }
        Ok(())
    }
}

/// The object responsible for dynamically modifying the process state
/// when processing a request from a device.
pub struct RequestProcessingService {
    app: Arc<ProvisioningApplication>,
    dev_info_extractor: Arc<dyn DeviceInfoExtractor>,
    dev_retriever: Arc<dyn DeviceRetriever>,
    dev_updater: Arc<dyn DeviceUpdater>,
    request_counter: AtomicU32,
}

impl RequestProcessingService {
    pub fn new(
        app: Arc<ProvisioningApplication>,
        dev_info_extractor: Arc<dyn DeviceInfoExtractor>,
        dev_retriever: Arc<dyn DeviceRetriever>,
        dev_updater: Arc<dyn DeviceUpdater>,
    ) -> Self {
        Self {
            app,
            dev_info_extractor,
            dev_retriever,
            dev_updater,
            request_counter: AtomicU32::new(0),
        }
    }

    /// The standard pipeline wiring over an application.
    pub fn standard(app: Arc<ProvisioningApplication>, solver: Arc<dyn ConflictSolver>) -> Self {
        let extractor = Arc::new(CollaboratingDeviceInfoExtractor::new(
            MergeStrategy::LastSeen,
            vec![
                Arc::new(StandardDeviceInfoExtractor),
                Arc::new(AllPluginsDeviceInfoExtractor::new(
                    MergeStrategy::Voting,
                    app.pg_mgr(),
                )),
            ],
        ));
        let retriever = Arc::new(FirstCompositeDeviceRetriever::standard_chain(app.clone()));
        let updater = Arc::new(CompositeDeviceUpdater::standard_chain(app.clone(), solver));
        Self::new(app, extractor, retriever, updater)
    }

    fn new_request_id(&self) -> u32 {
        self.request_counter.fetch_add(1, Ordering::Relaxed) % 100
    }

    /// Process a request, returning the device doing the request (if
    /// identified) and the plugin that should continue processing it.
    pub async fn process(&self, request: &RequestInfo) -> (Option<Device>, Option<String>) {
        let request_id = self.new_request_id();

        let dev_info = self.extract_device_info(request_id, request).await;
        let device = self.retrieve_device(request_id, &dev_info).await;
        let device = match device {
            Some(device) => Some(self.update_device(request_id, device, &dev_info, request).await),
            None => None,
        };

        let pg_id = device.as_ref().and_then(|d| d.plugin.clone());
        match &pg_id {
            Some(pg_id) => info!("<{}> Routing request to plugin {}", request_id, pg_id),
            None => info!("<{}> No route found", request_id),
        }
        (device, pg_id)
    }

    async fn extract_device_info(&self, request_id: u32, request: &RequestInfo) -> DeviceInfo {
        match self.dev_info_extractor.extract(request).await {
            Some(dev_info) => {
                info!("<{}> Extracted device info: {:?}", request_id, dev_info);
                dev_info
            }
            None => {
                info!("<{}> No device info extracted", request_id);
                DeviceInfo::default()
            }
        }
    }

    async fn retrieve_device(&self, request_id: u32, dev_info: &DeviceInfo) -> Option<Device> {
        match self.dev_retriever.retrieve(dev_info).await {
            Ok(Some(device)) => {
                info!("<{}> Retrieved device id: {:?}", request_id, device.id);
                Some(device)
            }
            Ok(None) => {
                info!("<{}> No device retrieved", request_id);
                None
            }
            Err(e) => {
                warn!("<{}> Error while retrieving device: {}", request_id, e);
                None
            }
        }
    }

    async fn update_device(
        &self,
        request_id: u32,
        mut device: Device,
        dev_info: &DeviceInfo,
        request: &RequestInfo,
    ) -> Device {
        let orig_device = device.clone();
        if let Err(e) = self.dev_updater.update(&mut device, dev_info, request).await {
            warn!("<{}> Error while updating device: {}", request_id, e);
        }
        if device == orig_device {
            if let Err(e) = self.update_device_on_no_change(&mut device, request).await {
                warn!("<{}> Error in remote state update: {}", request_id, e);
            }
        } else {
            info!("<{}> Device has been updated", request_id);
            if let Err(e) = self.update_device_on_change(&mut device, request).await {
                warn!("<{}> Error while persisting device: {}", request_id, e);
            }
        }
        device
    }

    async fn update_device_on_no_change(
        &self,
        device: &mut Device,
        request: &RequestInfo,
    ) -> Result<()> {
        if !device.configured {
            return Ok(());
        }
        if !self.should_update_remote_state(device, request).await {
            return Ok(());
        }
        let Some(config_id) = &device.config else {
            return Ok(());
        };
        let Some(config) = self.app.cfg_retrieve(config_id).await? else {
            return Ok(());
        };
        if update_remote_state_sip_username(device, &config) {
            self.app.dev_update(device).await?;
        }
        Ok(())
    }

    async fn update_device_on_change(
        &self,
        device: &mut Device,
        request: &RequestInfo,
    ) -> Result<()> {
        if self.should_update_remote_state(device, request).await {
            self.app
                .dev_update_with_hook(device, Some(&pre_update_remote_state_hook))
                .await
        } else {
            self.app.dev_update(device).await
        }
    }

    async fn should_update_remote_state(&self, device: &Device, request: &RequestInfo) -> bool {
        let Some(filename) = request.filename() else {
            return false;
        };
        let Some(plugin_id) = &device.plugin else {
            return false;
        };
        let Some(plugin) = self.app.pg_mgr().get(plugin_id) else {
            return false;
        };
        let Some(trigger_filename) = plugin.get_remote_state_trigger_filename(device) else {
            return false;
        };
        if trigger_filename != filename {
            return false;
        }
        device.config.is_some()
    }
}

/// TFTP read service running the pipeline and routing to the matched
/// plugin's TFTP service.
pub struct TftpRequestProcessingService {
    app: Arc<ProvisioningApplication>,
    process_service: Arc<RequestProcessingService>,
}

impl TftpRequestProcessingService {
    pub fn new(
        app: Arc<ProvisioningApplication>,
        process_service: Arc<RequestProcessingService>,
    ) -> Self {
        Self {
            app,
            process_service,
        }
    }
}

#[async_trait]
impl crate::tftp::TftpReadService for TftpRequestProcessingService {
    async fn handle_read_request(
        &self,
        request: &crate::tftp::TftpRequest,
    ) -> crate::tftp::TftpResponse {
        info!("Processing TFTP request: {}", request.packet.filename);
        let request_info = RequestInfo::Tftp {
            ip: request.peer.ip().to_string(),
            filename: request.packet.filename.clone(),
        };
        let (_device, pg_id) = self.process_service.process(&request_info).await;
        let Some(pg_id) = pg_id else {
            return crate::tftp::TftpResponse::reject(
                crate::tftp::packet::ERR_FNF,
                "Nowhere to route this request",
            );
        };
        let Some(plugin) = self.app.pg_mgr().get(&pg_id) else {
            return crate::tftp::TftpResponse::reject(
                crate::tftp::packet::ERR_FNF,
                "Nowhere to route this request",
            );
        };
        let Some(service) = plugin.tftp_service() else {
            return crate::tftp::TftpResponse::reject(
                crate::tftp::packet::ERR_FNF,
                "Nowhere to route this request",
            );
        };
        if let Some(filename) = request_info.filename() {
            if plugin.is_sensitive_filename(filename) {
                log_security_msg(&format!(
                    "Sensitive file requested from {}: {}",
                    request_info.ip(),
                    filename
                ));
            }
        }
        service.handle_read_request(request).await
    }
}

/// Record the first SIP line username of the config into the device's
/// remote state. True when the device changed.
fn update_remote_state_sip_username(device: &mut Device, config: &Config) -> bool {
    let Some(sip_username) = config
        .raw_config
        .pointer("/sip_lines/1/username")
        .and_then(serde_json::Value::as_str)
    else {
        return false;
    };
    if device.remote_state_sip_username.as_deref() == Some(sip_username) {
        return false;
    }
    device.remote_state_sip_username = Some(sip_username.to_string());
    debug!("Remote state SIP username updated");
    true
}

/// Pre-update hook carrying the remote-state policy into `dev_update`.
pub fn pre_update_remote_state_hook(device: &mut Device, config: Option<&Config>) {
    let Some(config) = config else {
        return;
    };
    if !device.configured {
        return;
    }
    update_remote_state_sip_username(device, config);
}
