//! Config objects and the config collection.
//!
//! Configs form a directed forest: each config lists its parents and the
//! materialized "raw config" of a node is the recursive deep-merge of its
//! ancestors, furthest first, finished by the node's own leaf.
//!
//! Standardized config fields:
//! - `id` -- the id of the config (mandatory once stored)
//! - `parent_ids` -- ids of parent configs (mandatory)
//! - `raw_config` -- the configuration parameters of this config (mandatory)
//! - `role` -- `default` (used for devices with no config) or `autocreate`
//!   (template for spawned per-device configs); at most one of each per
//!   collection
//! - `transient` -- the config is deleted automatically once no device
//!   references it; a transient config must not be a parent
//! - `deletable` -- `false` protects the config from deletion

use std::collections::{HashMap, HashSet};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ProvdError, Result};
use crate::persist::{Document, DocumentCollection, FindOptions, Selector};

/// Role markers a config may carry.
pub const ROLE_DEFAULT: &str = "default";
pub const ROLE_AUTOCREATE: &str = "autocreate";

/// A config object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    pub parent_ids: Vec<String>,

    /// Raw configuration parameters; always a JSON object.
    pub raw_config: Value,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub transient: bool,

    /// Absent means deletable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deletable: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    #[serde(rename = "X_type", skip_serializing_if = "Option::is_none")]
    pub x_type: Option<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Config {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            parent_ids: Vec::new(),
            raw_config: json!({}),
            role: None,
            transient: false,
            deletable: None,
            label: None,
            x_type: None,
        }
    }

    pub fn to_document(&self) -> Result<Document> {
        match serde_json::to_value(self)? {
            Value::Object(map) => Ok(map),
            _ => Err(ProvdError::InvalidDocument(
                "config did not serialize to an object".to_string(),
            )),
        }
    }

    pub fn from_document(document: Document) -> Result<Self> {
        Ok(serde_json::from_value(Value::Object(document))?)
    }
}

/// Recursively merge `overlay` into `base`.
///
/// Objects merge key-wise; any other value overwrites.
pub fn rec_update(base: &mut Value, overlay: &Value) {
    let Value::Object(overlay_map) = overlay else {
        *base = overlay.clone();
        return;
    };
    if !base.is_object() {
        *base = json!({});
    }
    let base_map = base.as_object_mut().expect("base forced to object above");
    for (key, overlay_value) in overlay_map {
        if overlay_value.is_object() {
            let slot = base_map.entry(key.clone()).or_insert(json!({}));
            if !slot.is_object() {
                *slot = json!({});
            }
            rec_update(slot, overlay_value);
        } else {
            base_map.insert(key.clone(), overlay_value.clone());
        }
    }
}

/// Strip null values at every depth.
fn remove_none_values(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .filter(|(_, v)| !v.is_null())
                .map(|(k, v)| (k.clone(), remove_none_values(v)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(remove_none_values).collect()),
        other => other.clone(),
    }
}

// Device-granularity configs historically carry explicit nulls from the
// REST layer; plugins test presence via containment, so nulls are
// stripped before the config is stored.
fn remove_none_values_for_device(config: &mut Config) {
    if config.x_type.as_deref() == Some("device") {
        config.raw_config = remove_none_values(&config.raw_config);
    }
}

fn check_config_validity(config: &Config) -> Result<()> {
    if !config.raw_config.is_object() {
        return Err(ProvdError::InvalidDocument(
            "\"raw_config\" field must be an object".to_string(),
        ));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct GraphIndexes {
    // parent id -> child ids
    child: HashMap<String, Vec<String>>,
    // child id -> parent ids
    parent: HashMap<String, Vec<String>>,
}

impl GraphIndexes {
    fn add(&mut self, config_id: &str, parent_ids: &[String]) {
        for parent_id in parent_ids {
            self.child
                .entry(parent_id.clone())
                .or_default()
                .push(config_id.to_string());
        }
        self.parent
            .insert(config_id.to_string(), parent_ids.to_vec());
    }

    fn remove(&mut self, config_id: &str) {
        if let Some(old_parent_ids) = self.parent.remove(config_id) {
            for parent_id in &old_parent_ids {
                if let Some(children) = self.child.get_mut(parent_id) {
                    children.retain(|c| c != config_id);
                    if children.is_empty() {
                        self.child.remove(parent_id);
                    }
                }
            }
        }
    }

    fn replace(&mut self, config_id: &str, parent_ids: &[String]) {
        self.remove(config_id);
        self.add(config_id, parent_ids);
    }

    fn ancestors(&self, config_id: &str) -> HashSet<String> {
        let mut visited = HashSet::new();
        let mut stack = vec![config_id.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(parent_ids) = self.parent.get(&current) {
                for parent_id in parent_ids {
                    if visited.insert(parent_id.clone()) {
                        stack.push(parent_id.clone());
                    }
                }
            }
        }
        visited
    }

    fn descendants(&self, config_id: &str) -> HashSet<String> {
        let mut visited = HashSet::new();
        let mut stack = vec![config_id.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(child_ids) = self.child.get(&current) {
                for child_id in child_ids {
                    if visited.insert(child_id.clone()) {
                        stack.push(child_id.clone());
                    }
                }
            }
        }
        visited
    }

    /// Ancestors a config would have with the given parents, ignoring any
    /// current edge from the config itself.
    fn would_be_ancestors(&self, config_id: &str, parent_ids: &[String]) -> HashSet<String> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut stack: Vec<String> = parent_ids.to_vec();
        while let Some(current) = stack.pop() {
            if current == config_id {
                visited.insert(current);
                continue;
            }
            if !visited.insert(current.clone()) {
                continue;
            }
            if let Some(parents) = self.parent.get(&current) {
                stack.extend(parents.iter().cloned());
            }
        }
        visited
    }
}

/// Collection of configs with parent/child graph maintenance.
pub struct ConfigCollection {
    collection: DocumentCollection,
    indexes: Mutex<Option<GraphIndexes>>,
}

impl ConfigCollection {
    pub fn new(collection: DocumentCollection) -> Self {
        Self {
            collection,
            indexes: Mutex::new(None),
        }
    }

    async fn with_indexes<T>(
        &self,
        f: impl FnOnce(&mut GraphIndexes) -> T,
    ) -> Result<T> {
        let mut guard = self.indexes.lock().await;
        if guard.is_none() {
            debug!("Building child and parent indexes");
            let mut indexes = GraphIndexes::default();
            let documents = self
                .collection
                .find(&Selector::new(), &FindOptions::default())
                .await?;
            for document in documents {
                let config = Config::from_document(document)?;
                if let Some(id) = &config.id {
                    indexes.add(id, &config.parent_ids);
                }
            }
            *guard = Some(indexes);
        }
        Ok(f(guard.as_mut().expect("indexes built above")))
    }

    fn check_no_cycle(
        indexes: &mut GraphIndexes,
        config_id: &str,
        parent_ids: &[String],
    ) -> Result<()> {
        if parent_ids.iter().any(|p| p == config_id)
            || indexes
                .would_be_ancestors(config_id, parent_ids)
                .contains(config_id)
        {
            return Err(ProvdError::InvalidDocument(format!(
                "config {config_id} would create a parent cycle"
            )));
        }
        Ok(())
    }

    /// A role may be held by at most one config per collection.
    async fn check_role_unique(&self, config: &Config) -> Result<()> {
        let Some(role) = config.role.as_deref() else {
            return Ok(());
        };
        if role != ROLE_DEFAULT && role != ROLE_AUTOCREATE {
            return Ok(());
        }
        let Some(holder) = self.find_one(&selector(json!({"role": role}))).await? else {
            return Ok(());
        };
        if holder.get("id").and_then(Value::as_str) != config.id.as_deref() {
            return Err(ProvdError::InvalidDocument(format!(
                "a config with role {role} already exists"
            )));
        }
        Ok(())
    }

    /// Transient configs must not be used as parents.
    async fn check_parents_not_transient(&self, config: &Config) -> Result<()> {
        for parent_id in &config.parent_ids {
            if let Some(parent) = self.retrieve(parent_id).await? {
                if parent.transient {
                    return Err(ProvdError::InvalidDocument(format!(
                        "transient config {parent_id} cannot be a parent"
                    )));
                }
            }
        }
        Ok(())
    }

    /// Insert a config, returning its id.
    pub async fn insert(&self, mut config: Config) -> Result<String> {
        remove_none_values_for_device(&mut config);
        check_config_validity(&config)?;
        self.check_role_unique(&config).await?;
        self.check_parents_not_transient(&config).await?;
        if let Some(id) = &config.id {
            self.with_indexes(|indexes| Self::check_no_cycle(indexes, id, &config.parent_ids))
                .await??;
        }
        let document = config.to_document()?;
        let config_id = self.collection.insert(document).await?;
        self.with_indexes(|indexes| indexes.add(&config_id, &config.parent_ids))
            .await?;
        Ok(config_id)
    }

    /// Update a config in place.
    pub async fn update(&self, mut config: Config) -> Result<()> {
        remove_none_values_for_device(&mut config);
        check_config_validity(&config)?;
        self.check_role_unique(&config).await?;
        self.check_parents_not_transient(&config).await?;
        let config_id = config
            .id
            .clone()
            .ok_or_else(|| ProvdError::InvalidDocument("no id key in config".to_string()))?;
        self.with_indexes(|indexes| Self::check_no_cycle(indexes, &config_id, &config.parent_ids))
            .await??;
        let document = config.to_document()?;
        self.collection.update(document).await?;
        self.with_indexes(|indexes| indexes.replace(&config_id, &config.parent_ids))
            .await?;
        Ok(())
    }

    /// Delete a config and splice its children onto its parents.
    ///
    /// Every direct child has the deleted id replaced, in place, by the
    /// deleted config's own parents (order-preserving, deduplicated).
    pub async fn delete(&self, config_id: &str) -> Result<()> {
        let config = self
            .retrieve(config_id)
            .await?
            .ok_or_else(|| ProvdError::invalid_id(config_id))?;
        self.collection.delete(config_id).await?;
        let child_ids = self
            .with_indexes(|indexes| {
                let child_ids = indexes
                    .child
                    .get(config_id)
                    .cloned()
                    .unwrap_or_default();
                indexes.remove(config_id);
                child_ids
            })
            .await?;
        for child_id in child_ids {
            let Some(mut child) = self.retrieve(&child_id).await? else {
                continue;
            };
            let mut new_parent_ids: Vec<String> = Vec::new();
            for parent_id in &child.parent_ids {
                if parent_id == config_id {
                    for replacement in &config.parent_ids {
                        if !new_parent_ids.contains(replacement) {
                            new_parent_ids.push(replacement.clone());
                        }
                    }
                } else if !new_parent_ids.contains(parent_id) {
                    new_parent_ids.push(parent_id.clone());
                }
            }
            child.parent_ids = new_parent_ids;
            self.collection.update(child.to_document()?).await?;
            self.with_indexes(|indexes| indexes.replace(&child_id, &child.parent_ids))
                .await?;
        }
        Ok(())
    }

    /// Return the config with the given id, or `None`.
    pub async fn retrieve(&self, config_id: &str) -> Result<Option<Config>> {
        match self.collection.retrieve(config_id).await? {
            Some(document) => Ok(Some(Config::from_document(document)?)),
            None => Ok(None),
        }
    }

    pub async fn find(&self, selector: &Selector, options: &FindOptions) -> Result<Vec<Document>> {
        self.collection.find(selector, options).await
    }

    pub async fn find_one(&self, selector: &Selector) -> Result<Option<Document>> {
        self.collection.find_one(selector).await
    }

    /// Flush the collection to its backing file, when one is configured.
    pub async fn close(&self) -> Result<()> {
        self.collection.close().await
    }

    /// Ids the given config depends on, directly or indirectly.
    pub async fn get_ancestors(&self, config_id: &str) -> Result<HashSet<String>> {
        self.with_indexes(|indexes| indexes.ancestors(config_id)).await
    }

    /// Ids depending on the given config, directly or indirectly.
    pub async fn get_descendants(&self, config_id: &str) -> Result<HashSet<String>> {
        self.with_indexes(|indexes| indexes.descendants(config_id))
            .await
    }

    /// Materialize the flattened raw config of a node.
    ///
    /// Starts from a deep copy of `base_raw_config`, deep-merges every
    /// ancestor leaf from furthest to nearest and finishes with the node's
    /// own leaf. Returns `None` when the id is unknown.
    pub async fn get_raw_config(
        &self,
        config_id: &str,
        base_raw_config: &Value,
    ) -> Result<Option<Value>> {
        let mut accumulator: Option<Value> = None;
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(config_id.to_string());
        self.flatten_into(config_id, base_raw_config, &mut accumulator, &mut visited)
            .await?;
        Ok(accumulator)
    }

    fn flatten_into<'a>(
        &'a self,
        config_id: &'a str,
        base_raw_config: &'a Value,
        accumulator: &'a mut Option<Value>,
        visited: &'a mut HashSet<String>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let Some(config) = self.retrieve(config_id).await? else {
                return Ok(());
            };
            if accumulator.is_none() {
                *accumulator = Some(base_raw_config.clone());
            }
            for parent_id in &config.parent_ids {
                if !visited.contains(parent_id) {
                    visited.insert(parent_id.clone());
                    self.flatten_into(parent_id, base_raw_config, accumulator, visited)
                        .await?;
                }
            }
            if let Some(acc) = accumulator.as_mut() {
                rec_update(acc, &config.raw_config);
            }
            Ok(())
        })
    }

    /// Spawn a transient config from the autocreate template, or `None`
    /// when no template exists or it carries no first-line SIP username.
    pub async fn create_from_autocreate(&self) -> Result<Option<String>> {
        let Some(document) = self
            .find_one(&selector(json!({"role": ROLE_AUTOCREATE})))
            .await?
        else {
            debug!("No config with the autocreate role found");
            return Ok(None);
        };
        let mut template = Config::from_document(document)?;
        // drop the role so the spawned config is an ordinary one
        template.role = None;
        let Some(template_id) = template.id.clone() else {
            return Ok(None);
        };
        let Some(username) = template
            .raw_config
            .pointer("/sip_lines/1/username")
            .and_then(Value::as_str)
        else {
            debug!("Autocreate template has no first-line SIP username");
            return Ok(None);
        };
        let new_id = format!("{}{}", template_id, uuid::Uuid::new_v4().simple());
        let new_config = Config {
            id: Some(new_id),
            parent_ids: vec![template_id],
            raw_config: json!({"sip_lines": {"1": {"username": username}}}),
            role: None,
            transient: true,
            deletable: None,
            label: None,
            x_type: None,
        };
        info!("Creating new autocreated config {:?}", new_config.id);
        let new_config_id = self.insert(new_config).await?;
        Ok(Some(new_config_id))
    }
}

/// Build a selector from a JSON literal. Panics when not an object, which
/// is a programming error at the call site.
pub fn selector(value: Value) -> Selector {
    match value {
        Value::Object(map) => map,
        _ => panic!("selector literal must be a JSON object"),
    }
}

/// Check that a raw config carries the parameters every device needs.
pub fn check_common_raw_config(raw_config: &Value) -> Result<()> {
    for param in ["ip", "http_port", "tftp_port"] {
        if raw_config.get(param).is_none() {
            return Err(ProvdError::RawConfig(format!("missing {param} parameter")));
        }
    }
    Ok(())
}

fn is_enabled(raw_config: &Value, key: &str) -> bool {
    raw_config
        .get(key)
        .map(|v| v.as_bool().unwrap_or(false))
        .unwrap_or(false)
}

/// Validate a fully-merged raw config before handing it to a plugin.
pub fn check_raw_config(raw_config: &Value) -> Result<()> {
    check_common_raw_config(raw_config)?;
    if is_enabled(raw_config, "dns_enabled") && raw_config.get("dns_ip").is_none() {
        return Err(ProvdError::RawConfig("missing dns_ip parameter".to_string()));
    }
    if is_enabled(raw_config, "ntp_enabled") && raw_config.get("ntp_ip").is_none() {
        return Err(ProvdError::RawConfig("missing ntp_ip parameter".to_string()));
    }
    if is_enabled(raw_config, "vlan_enabled") {
        match raw_config.get("vlan_id").and_then(Value::as_u64) {
            None => {
                return Err(ProvdError::RawConfig("missing vlan_id parameter".to_string()));
            }
            Some(vlan_id) if vlan_id > 4094 => {
                return Err(ProvdError::RawConfig(format!(
                    "vlan_id out of range: {vlan_id}"
                )));
            }
            Some(_) => {}
        }
        if let Some(priority) = raw_config.get("vlan_priority").and_then(Value::as_u64) {
            if priority > 7 {
                return Err(ProvdError::RawConfig(format!(
                    "vlan_priority out of range: {priority}"
                )));
            }
        }
    }
    if is_enabled(raw_config, "syslog_enabled") && raw_config.get("syslog_ip").is_none() {
        return Err(ProvdError::RawConfig(
            "missing syslog_ip parameter".to_string(),
        ));
    }
    if let Some(sip_lines) = raw_config.get("sip_lines").and_then(Value::as_object) {
        let sip_protocol = raw_config.get("protocol").and_then(Value::as_str) == Some("SIP");
        for (line_no, line) in sip_lines {
            if line.get("proxy_ip").is_none() && raw_config.get("sip_proxy_ip").is_none() {
                return Err(ProvdError::RawConfig(format!(
                    "missing proxy_ip parameter for line {line_no}"
                )));
            }
            if sip_protocol {
                for param in ["username", "password", "display_name"] {
                    if line.get(param).is_none() {
                        return Err(ProvdError::RawConfig(format!(
                            "missing {param} parameter for line {line_no}"
                        )));
                    }
                }
            }
        }
    }
    if let Some(call_managers) = raw_config.get("sccp_call_managers").and_then(Value::as_object) {
        for (priority, call_manager) in call_managers {
            if call_manager.get("ip").is_none() {
                return Err(ProvdError::RawConfig(format!(
                    "missing ip parameter for call manager {priority}"
                )));
            }
        }
    }
    if let Some(funckeys) = raw_config.get("funckeys").and_then(Value::as_object) {
        for (funckey_no, funckey) in funckeys {
            match funckey.get("type").and_then(Value::as_str) {
                None => {
                    return Err(ProvdError::RawConfig(format!(
                        "missing type parameter for funckey {funckey_no}"
                    )));
                }
                Some(type_) if type_ == "speeddial" || type_ == "blf" => {
                    if funckey.get("value").is_none() {
                        return Err(ProvdError::RawConfig(format!(
                            "missing value parameter for funckey {funckey_no}"
                        )));
                    }
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

/// Fill the documented raw-config defaults in place.
pub fn set_raw_config_defaults(raw_config: &mut Value) {
    let Some(map) = raw_config.as_object_mut() else {
        return;
    };
    if map
        .get("syslog_enabled")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        map.entry("syslog_port").or_insert(json!(514));
        map.entry("syslog_level").or_insert(json!("warning"));
    }
    if let Some(proxy_ip) = map.get("sip_proxy_ip").cloned() {
        map.entry("sip_registrar_ip").or_insert(proxy_ip);
    }
    map.entry("sip_srtp_mode").or_insert(json!("disabled"));
    map.entry("sip_transport").or_insert(json!("udp"));
    let sip_lines = map.entry("sip_lines").or_insert(json!({}));
    if let Some(lines) = sip_lines.as_object_mut() {
        for line in lines.values_mut() {
            let Some(line_map) = line.as_object_mut() else {
                continue;
            };
            if let Some(proxy_ip) = line_map.get("proxy_ip").cloned() {
                line_map.entry("registrar_ip").or_insert(proxy_ip);
            }
            if let Some(username) = line_map.get("username").cloned() {
                line_map.entry("auth_username").or_insert(username);
            }
        }
    }
    map.entry("sccp_call_managers").or_insert(json!({}));
    map.entry("funckeys").or_insert(json!({}));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::IdGenerator;

    fn new_collection() -> ConfigCollection {
        ConfigCollection::new(DocumentCollection::new_memory(IdGenerator::default()))
    }

    fn config(id: &str, parent_ids: &[&str], raw_config: Value) -> Config {
        Config {
            id: Some(id.to_string()),
            parent_ids: parent_ids.iter().map(|s| s.to_string()).collect(),
            raw_config,
            role: None,
            transient: false,
            deletable: None,
            label: None,
            x_type: None,
        }
    }

    #[test]
    fn test_rec_update_scalar_overwrite() {
        let mut base = json!({"a": 1, "b": 2});
        rec_update(&mut base, &json!({"b": 3, "c": 4}));
        assert_eq!(base, json!({"a": 1, "b": 3, "c": 4}));
    }

    #[test]
    fn test_rec_update_nested_merge() {
        let mut base = json!({"sip_lines": {"1": {"proxy_ip": "10.0.0.1"}}});
        rec_update(&mut base, &json!({"sip_lines": {"1": {"username": "u"}}}));
        assert_eq!(
            base,
            json!({"sip_lines": {"1": {"proxy_ip": "10.0.0.1", "username": "u"}}})
        );
    }

    #[test]
    fn test_rec_update_object_replaces_scalar() {
        let mut base = json!({"a": 1});
        rec_update(&mut base, &json!({"a": {"b": 2}}));
        assert_eq!(base, json!({"a": {"b": 2}}));
    }

    #[tokio::test]
    async fn test_get_raw_config_unknown_id() {
        let collection = new_collection();
        let result = collection.get_raw_config("nope", &json!({})).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_get_raw_config_inheritance() {
        let collection = new_collection();
        collection
            .insert(config(
                "base",
                &[],
                json!({"ntp_ip": "10.0.0.1", "sip_lines": {"1": {"proxy_ip": "10.0.0.1"}}}),
            ))
            .await
            .unwrap();
        collection
            .insert(config(
                "child",
                &["base"],
                json!({"sip_lines": {"1": {"username": "alice"}}}),
            ))
            .await
            .unwrap();
        let raw = collection
            .get_raw_config("child", &json!({}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            raw,
            json!({
                "ntp_ip": "10.0.0.1",
                "sip_lines": {"1": {"proxy_ip": "10.0.0.1", "username": "alice"}}
            })
        );
    }

    #[tokio::test]
    async fn test_get_raw_config_parent_precedence() {
        let collection = new_collection();
        collection
            .insert(config("left", &[], json!({"k": "left", "l": 1})))
            .await
            .unwrap();
        collection
            .insert(config("right", &[], json!({"k": "right", "r": 2})))
            .await
            .unwrap();
        collection
            .insert(config("child", &["left", "right"], json!({})))
            .await
            .unwrap();
        let raw = collection
            .get_raw_config("child", &json!({}))
            .await
            .unwrap()
            .unwrap();
        // the rightmost parent is merged nearest, so it wins conflicts
        assert_eq!(raw, json!({"k": "right", "l": 1, "r": 2}));
    }

    #[tokio::test]
    async fn test_ancestors_descendants() {
        let collection = new_collection();
        collection.insert(config("a", &[], json!({}))).await.unwrap();
        collection.insert(config("b", &["a"], json!({}))).await.unwrap();
        collection.insert(config("c", &["b"], json!({}))).await.unwrap();
        let ancestors = collection.get_ancestors("c").await.unwrap();
        assert_eq!(ancestors, ["a", "b"].iter().map(|s| s.to_string()).collect());
        let descendants = collection.get_descendants("a").await.unwrap();
        assert_eq!(
            descendants,
            ["b", "c"].iter().map(|s| s.to_string()).collect()
        );
    }

    #[tokio::test]
    async fn test_delete_splices_children() {
        let collection = new_collection();
        collection
            .insert(config("base", &[], json!({"a": 1})))
            .await
            .unwrap();
        collection
            .insert(config("mid", &["base"], json!({"b": 2})))
            .await
            .unwrap();
        collection
            .insert(config("leaf", &["mid"], json!({"c": 3})))
            .await
            .unwrap();
        collection.delete("mid").await.unwrap();
        let leaf = collection.retrieve("leaf").await.unwrap().unwrap();
        assert_eq!(leaf.parent_ids, vec!["base".to_string()]);
        let raw = collection
            .get_raw_config("leaf", &json!({}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(raw, json!({"a": 1, "c": 3}));
    }

    #[tokio::test]
    async fn test_cycle_rejected() {
        let collection = new_collection();
        collection.insert(config("a", &[], json!({}))).await.unwrap();
        collection.insert(config("b", &["a"], json!({}))).await.unwrap();
        // direct self-parent
        let err = collection
            .insert(config("x", &["x"], json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvdError::InvalidDocument(_)));
        // indirect cycle through an update of the root
        let mut root = collection.retrieve("a").await.unwrap().unwrap();
        root.parent_ids = vec!["b".to_string()];
        let err = collection.update(root).await.unwrap_err();
        assert!(matches!(err, ProvdError::InvalidDocument(_)));
    }

    #[tokio::test]
    async fn test_autocreate() {
        let collection = new_collection();
        let mut template = config(
            "ap",
            &[],
            json!({"sip_lines": {"1": {"username": "anonymous"}}}),
        );
        template.role = Some(ROLE_AUTOCREATE.to_string());
        collection.insert(template).await.unwrap();

        let new_id = collection.create_from_autocreate().await.unwrap().unwrap();
        assert!(new_id.starts_with("ap"));
        assert_eq!(new_id.len(), "ap".len() + 32);
        let created = collection.retrieve(&new_id).await.unwrap().unwrap();
        assert!(created.transient);
        assert_eq!(created.parent_ids, vec!["ap".to_string()]);
        assert_eq!(
            created.raw_config,
            json!({"sip_lines": {"1": {"username": "anonymous"}}})
        );
        assert!(created.role.is_none());
    }

    #[tokio::test]
    async fn test_role_uniqueness() {
        let collection = new_collection();
        let mut first = config("a", &[], json!({}));
        first.role = Some(ROLE_DEFAULT.to_string());
        collection.insert(first).await.unwrap();

        let mut second = config("b", &[], json!({}));
        second.role = Some(ROLE_DEFAULT.to_string());
        let err = collection.insert(second).await.unwrap_err();
        assert!(matches!(err, ProvdError::InvalidDocument(_)));

        // re-saving the holder itself is fine
        let holder = collection.retrieve("a").await.unwrap().unwrap();
        collection.update(holder).await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_config_cannot_be_parent() {
        let collection = new_collection();
        let mut transient = config("t", &[], json!({}));
        transient.transient = true;
        collection.insert(transient).await.unwrap();

        let err = collection
            .insert(config("child", &["t"], json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ProvdError::InvalidDocument(_)));
    }

    #[tokio::test]
    async fn test_autocreate_without_template() {
        let collection = new_collection();
        assert!(collection.create_from_autocreate().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_autocreate_without_username() {
        let collection = new_collection();
        let mut template = config("ap", &[], json!({}));
        template.role = Some(ROLE_AUTOCREATE.to_string());
        collection.insert(template).await.unwrap();
        assert!(collection.create_from_autocreate().await.unwrap().is_none());
    }

    #[test]
    fn test_check_raw_config_mandatory() {
        let raw = json!({"ip": "10.0.0.1", "http_port": 8667});
        let err = check_raw_config(&raw).unwrap_err();
        assert!(err.to_string().contains("tftp_port"));
    }

    fn valid_base() -> Value {
        json!({"ip": "10.0.0.1", "http_port": 8667, "tftp_port": 69})
    }

    #[test]
    fn test_check_raw_config_vlan_range() {
        let mut raw = valid_base();
        rec_update(&mut raw, &json!({"vlan_enabled": true, "vlan_id": 0}));
        check_raw_config(&raw).unwrap();
        rec_update(&mut raw, &json!({"vlan_id": 4094}));
        check_raw_config(&raw).unwrap();
        rec_update(&mut raw, &json!({"vlan_id": 4095}));
        assert!(check_raw_config(&raw).is_err());
        rec_update(&mut raw, &json!({"vlan_id": 100, "vlan_priority": 8}));
        assert!(check_raw_config(&raw).is_err());
    }

    #[test]
    fn test_check_raw_config_sip_lines() {
        let mut raw = valid_base();
        rec_update(
            &mut raw,
            &json!({"protocol": "SIP", "sip_lines": {"1": {"proxy_ip": "10.0.0.2"}}}),
        );
        let err = check_raw_config(&raw).unwrap_err();
        assert!(err.to_string().contains("username"));
    }

    #[test]
    fn test_check_raw_config_funckeys() {
        let mut raw = valid_base();
        rec_update(&mut raw, &json!({"funckeys": {"1": {"type": "speeddial"}}}));
        assert!(check_raw_config(&raw).is_err());
        rec_update(&mut raw, &json!({"funckeys": {"1": {"value": "123"}}}));
        check_raw_config(&raw).unwrap();
        rec_update(&mut raw, &json!({"funckeys": {"2": {"type": "park"}}}));
        check_raw_config(&raw).unwrap();
    }

    #[test]
    fn test_set_raw_config_defaults() {
        let mut raw = json!({
            "sip_proxy_ip": "10.0.0.1",
            "sip_lines": {
                "1": {"proxy_ip": "10.0.0.2", "username": "alice"}
            },
            "syslog_enabled": true
        });
        set_raw_config_defaults(&mut raw);
        assert_eq!(raw.get("sip_registrar_ip"), Some(&json!("10.0.0.1")));
        assert_eq!(raw.get("sip_srtp_mode"), Some(&json!("disabled")));
        assert_eq!(raw.get("sip_transport"), Some(&json!("udp")));
        assert_eq!(raw.get("syslog_port"), Some(&json!(514)));
        assert_eq!(raw.get("syslog_level"), Some(&json!("warning")));
        assert_eq!(
            raw.pointer("/sip_lines/1/registrar_ip"),
            Some(&json!("10.0.0.2"))
        );
        assert_eq!(
            raw.pointer("/sip_lines/1/auth_username"),
            Some(&json!("alice"))
        );
        assert_eq!(raw.get("sccp_call_managers"), Some(&json!({})));
        assert_eq!(raw.get("funckeys"), Some(&json!({})));
    }

    #[test]
    fn test_remove_none_values_for_device() {
        let mut cfg = config("d", &[], json!({"a": null, "b": {"c": null, "d": 1}}));
        cfg.x_type = Some("device".to_string());
        remove_none_values_for_device(&mut cfg);
        assert_eq!(cfg.raw_config, json!({"b": {"d": 1}}));
    }

    #[test]
    fn test_config_document_roundtrip() {
        let mut cfg = config("a", &["p"], json!({"k": 1}));
        cfg.transient = true;
        cfg.deletable = Some(false);
        let document = cfg.to_document().unwrap();
        assert_eq!(document.get("transient"), Some(&json!(true)));
        assert_eq!(document.get("deletable"), Some(&json!(false)));
        let back = Config::from_document(document).unwrap();
        assert_eq!(back, cfg);
    }
}
