//! Device objects and the device collection.
//!
//! Device info objects carry what a request told us about a device (IP,
//! MAC, vendor, model, ...). Device objects add identity and lifecycle
//! state: the owning tenant, the plugin and config references, and the
//! `configured` flag which is the authoritative truth about whether the
//! plugin has successfully written this device's files.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ProvdError, Result};
use crate::persist::{Document, DocumentCollection, FindOptions, Selector};
use crate::util::{is_normed_ip, is_normed_mac};

/// How a device entered the collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Added {
    Auto,
    Manual,
}

/// Information extracted about a device from a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl DeviceInfo {
    pub fn is_empty(&self) -> bool {
        *self == DeviceInfo::default()
    }

    /// Known keys, in a stable order.
    pub const KEYS: [&'static str; 7] = ["ip", "mac", "sn", "uuid", "vendor", "model", "version"];

    pub fn get(&self, key: &str) -> Option<&str> {
        match key {
            "ip" => self.ip.as_deref(),
            "mac" => self.mac.as_deref(),
            "sn" => self.sn.as_deref(),
            "uuid" => self.uuid.as_deref(),
            "vendor" => self.vendor.as_deref(),
            "model" => self.model.as_deref(),
            "version" => self.version.as_deref(),
            _ => None,
        }
    }

    pub fn set(&mut self, key: &str, value: String) {
        match key {
            "ip" => self.ip = Some(value),
            "mac" => self.mac = Some(value),
            "sn" => self.sn = Some(value),
            "uuid" => self.uuid = Some(value),
            "vendor" => self.vendor = Some(value),
            "model" => self.model = Some(value),
            "version" => self.version = Some(value),
            _ => {}
        }
    }

    /// Overlay `other` on top of this info (later keys win).
    pub fn update_from(&mut self, other: &DeviceInfo) {
        for key in Self::KEYS {
            if let Some(value) = other.get(key) {
                self.set(key, value.to_string());
            }
        }
    }
}

/// A provisioned (or provisionable) device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub tenant_uuid: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Id of the plugin managing this device; may dangle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plugin: Option<String>,

    /// Id of the config of this device; may dangle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<String>,

    /// True when the plugin wrote files matching the current materialized
    /// raw config.
    #[serde(default)]
    pub configured: bool,

    /// True iff the device was created by the tenant owning the session.
    #[serde(default)]
    pub is_new: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub added: Option<Added>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Map<String, Value>>,

    /// Last SIP username observed as published to the device.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_state_sip_username: Option<String>,
}

impl Device {
    pub fn new(tenant_uuid: impl Into<String>) -> Self {
        Self {
            id: None,
            tenant_uuid: tenant_uuid.into(),
            mac: None,
            ip: None,
            sn: None,
            uuid: None,
            vendor: None,
            model: None,
            version: None,
            description: None,
            plugin: None,
            config: None,
            configured: false,
            is_new: false,
            added: None,
            options: None,
            remote_state_sip_username: None,
        }
    }

    /// Build a device from extracted request info.
    pub fn from_device_info(info: &DeviceInfo, tenant_uuid: impl Into<String>) -> Self {
        let mut device = Device::new(tenant_uuid);
        device.ip = info.ip.clone();
        device.mac = info.mac.clone();
        device.sn = info.sn.clone();
        device.uuid = info.uuid.clone();
        device.vendor = info.vendor.clone();
        device.model = info.model.clone();
        device.version = info.version.clone();
        device
    }

    pub fn get_info_field(&self, key: &str) -> Option<&str> {
        match key {
            "ip" => self.ip.as_deref(),
            "mac" => self.mac.as_deref(),
            "sn" => self.sn.as_deref(),
            "uuid" => self.uuid.as_deref(),
            "vendor" => self.vendor.as_deref(),
            "model" => self.model.as_deref(),
            "version" => self.version.as_deref(),
            _ => None,
        }
    }

    pub fn set_info_field(&mut self, key: &str, value: String) {
        match key {
            "ip" => self.ip = Some(value),
            "mac" => self.mac = Some(value),
            "sn" => self.sn = Some(value),
            "uuid" => self.uuid = Some(value),
            "vendor" => self.vendor = Some(value),
            "model" => self.model = Some(value),
            "version" => self.version = Some(value),
            _ => {}
        }
    }

    pub fn to_document(&self) -> Result<Document> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(ProvdError::InvalidDocument(
                "device did not serialize to an object".to_string(),
            )),
        }
    }

    pub fn from_document(document: Document) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(document))?)
    }
}

/// Keys whose change forces the device to be reconfigured.
const RECONF_KEYS: [&str; 8] = [
    "plugin", "config", "mac", "uuid", "vendor", "model", "version", "options",
];

/// True if updating `old_device` to `new_device` requires the plugin to
/// rewrite the device's files. Changes to `ip` alone do not.
pub fn needs_reconfiguration(old_device: &Device, new_device: &Device) -> bool {
    for key in RECONF_KEYS {
        let differs = match key {
            "plugin" => old_device.plugin != new_device.plugin,
            "config" => old_device.config != new_device.config,
            "options" => old_device.options != new_device.options,
            _ => old_device.get_info_field(key) != new_device.get_info_field(key),
        };
        if differs {
            return true;
        }
    }
    false
}

fn device_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9a-z]+$").unwrap())
}

fn check_device_validity(device: &Device) -> Result<()> {
    if let Some(id) = &device.id {
        if !device_id_re().is_match(id) {
            return Err(ProvdError::InvalidDocument(format!(
                "invalid device id: {id}"
            )));
        }
    }
    if let Some(mac) = &device.mac {
        if !is_normed_mac(mac) {
            return Err(ProvdError::InvalidDocument(format!(
                "non-normalized MAC address {mac}"
            )));
        }
    }
    if let Some(ip) = &device.ip {
        if !is_normed_ip(ip) {
            return Err(ProvdError::InvalidDocument(format!(
                "non-normalized IP address {ip}"
            )));
        }
    }
    if device.tenant_uuid.is_empty() {
        return Err(ProvdError::InvalidDocument(
            "tenant UUID not specified".to_string(),
        ));
    }
    Ok(())
}

/// Collection of devices, validating on every write.
pub struct DeviceCollection {
    collection: DocumentCollection,
}

impl DeviceCollection {
    pub fn new(collection: DocumentCollection) -> Self {
        Self { collection }
    }

    pub async fn insert(&self, device: &Device) -> Result<String> {
        check_device_validity(device)?;
        self.collection.insert(device.to_document()?).await
    }

    pub async fn update(&self, device: &Device) -> Result<()> {
        check_device_validity(device)?;
        self.collection.update(device.to_document()?).await
    }

    pub async fn delete(&self, device_id: &str) -> Result<()> {
        self.collection.delete(device_id).await
    }

    pub async fn retrieve(&self, device_id: &str) -> Result<Option<Device>> {
        match self.collection.retrieve(device_id).await? {
            Some(document) => Ok(Some(Device::from_document(document)?)),
            None => Ok(None),
        }
    }

    pub async fn find_documents(
        &self,
        selector: &Selector,
        options: &FindOptions,
    ) -> Result<Vec<Document>> {
        self.collection.find(selector, options).await
    }

    pub async fn find(&self, selector: &Selector) -> Result<Vec<Device>> {
        let documents = self
            .collection
            .find(selector, &FindOptions::default())
            .await?;
        documents.into_iter().map(Device::from_document).collect()
    }

    pub async fn find_one(&self, selector: &Selector) -> Result<Option<Device>> {
        match self.collection.find_one(selector).await? {
            Some(document) => Ok(Some(Device::from_document(document)?)),
            None => Ok(None),
        }
    }

    pub async fn ensure_index(&self, complex_key: &str) -> Result<()> {
        self.collection.ensure_index(complex_key).await
    }

    pub async fn close(&self) -> Result<()> {
        self.collection.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::IdGenerator;
    use serde_json::json;

    fn device_with_mac(mac: &str) -> Device {
        let mut device = Device::new("tenant1");
        device.mac = Some(mac.to_string());
        device
    }

    #[test]
    fn test_needs_reconfiguration_on_reconf_keys() {
        let old = device_with_mac("00:11:22:33:44:55");
        let mut new = old.clone();
        assert!(!needs_reconfiguration(&old, &new));

        new.plugin = Some("acme".to_string());
        assert!(needs_reconfiguration(&old, &new));

        let mut new = old.clone();
        new.config = Some("cfg1".to_string());
        assert!(needs_reconfiguration(&old, &new));

        let mut new = old.clone();
        new.vendor = Some("Acme".to_string());
        assert!(needs_reconfiguration(&old, &new));
    }

    #[test]
    fn test_ip_change_does_not_need_reconfiguration() {
        let old = device_with_mac("00:11:22:33:44:55");
        let mut new = old.clone();
        new.ip = Some("10.0.0.42".to_string());
        assert!(!needs_reconfiguration(&old, &new));
    }

    #[test]
    fn test_device_validity() {
        let device = Device::new("tenant1");
        check_device_validity(&device).unwrap();

        let mut bad_mac = device.clone();
        bad_mac.mac = Some("0011223344AA".to_string());
        assert!(check_device_validity(&bad_mac).is_err());

        let mut bad_ip = device.clone();
        bad_ip.ip = Some("10.0.0".to_string());
        assert!(check_device_validity(&bad_ip).is_err());

        let mut bad_id = device.clone();
        bad_id.id = Some("ABC".to_string());
        assert!(check_device_validity(&bad_id).is_err());

        let mut no_tenant = device;
        no_tenant.tenant_uuid = String::new();
        assert!(check_device_validity(&no_tenant).is_err());
    }

    #[test]
    fn test_device_info_update_from() {
        let mut base = DeviceInfo {
            ip: Some("10.0.0.1".to_string()),
            vendor: Some("Acme".to_string()),
            ..Default::default()
        };
        let overlay = DeviceInfo {
            ip: Some("10.0.0.2".to_string()),
            model: Some("X1".to_string()),
            ..Default::default()
        };
        base.update_from(&overlay);
        assert_eq!(base.ip.as_deref(), Some("10.0.0.2"));
        assert_eq!(base.vendor.as_deref(), Some("Acme"));
        assert_eq!(base.model.as_deref(), Some("X1"));
    }

    #[tokio::test]
    async fn test_collection_validates_on_write() {
        let collection =
            DeviceCollection::new(DocumentCollection::new_memory(IdGenerator::default()));
        let mut device = Device::new("tenant1");
        device.mac = Some("not a mac".to_string());
        assert!(collection.insert(&device).await.is_err());
    }

    #[tokio::test]
    async fn test_collection_roundtrip() {
        let collection =
            DeviceCollection::new(DocumentCollection::new_memory(IdGenerator::default()));
        let mut device = device_with_mac("00:11:22:33:44:55");
        let id = collection.insert(&device).await.unwrap();
        device.id = Some(id.clone());
        let stored = collection.retrieve(&id).await.unwrap().unwrap();
        assert_eq!(stored, device);
        let found = collection
            .find_one(&crate::config::selector(json!({"mac": "00:11:22:33:44:55"})))
            .await
            .unwrap();
        assert!(found.is_some());
    }
}
