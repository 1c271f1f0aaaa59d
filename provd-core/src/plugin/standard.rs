//! Standard template-driven plugin.
//!
//! Most vendor bundles need the same behaviour: render a template per
//! device into the bundle's `var/tftpboot/` tree, serve that tree over
//! HTTP and TFTP, recognize devices from MAC-named file requests and
//! score candidates from the declared capabilities. The `standard`
//! driver provides exactly that; bundles only ship metadata and
//! templates.
//!
//! Template lookup order for a device: `templates/dev/<mac>.tpl`,
//! `templates/<model>.tpl`, `templates/base.tpl`. Templates reference
//! context values as `{{ dotted.path }}` over `{"device": ..,
//! "raw_config": ..}`. Without any template, the materialized raw config
//! is written out as JSON.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::device::{Device, DeviceInfo};
use crate::error::{ProvdError, Result};
use crate::http::{DirectoryHttpService, HttpFileService};
use crate::ident::{DeviceInfoExtractor, RequestInfo};
use crate::pgasso::{DeviceSupport, PluginAssociator};
use crate::synchronize::{standard_sip_synchronize, SynchronizeService, SYNC_EVENT_CHECK_SYNC};
use crate::tftp::{TftpFileService, TftpReadService};
use crate::util::{format_mac, norm_mac};

use super::{Plugin, PluginContext, PluginDriver, PluginInfo};

/// Extract a MAC address from a `<mac>.cfg`-style requested filename.
pub struct MacFilenameExtractor;

#[async_trait]
impl DeviceInfoExtractor for MacFilenameExtractor {
    async fn extract(&self, request: &RequestInfo) -> Option<DeviceInfo> {
        let filename = request.filename()?;
        let stem = filename.strip_suffix(".cfg")?;
        if stem.len() != 12 || !stem.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        let mac = norm_mac(stem).ok()?;
        Some(DeviceInfo {
            mac: Some(mac),
            ..Default::default()
        })
    }
}

/// One `"vendor,model,version"` capability entry.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Capability {
    vendor: String,
    model: Option<String>,
    version: Option<String>,
}

/// Associator scoring devices against the declared capabilities.
pub struct CapabilitiesAssociator {
    capabilities: Vec<Capability>,
}

impl CapabilitiesAssociator {
    pub fn from_info(info: &PluginInfo) -> Self {
        let capabilities = info
            .capabilities
            .keys()
            .map(|key| {
                let mut parts = key.split(',');
                Capability {
                    vendor: parts.next().unwrap_or_default().to_string(),
                    model: parts.next().map(str::to_string).filter(|s| !s.is_empty()),
                    version: parts.next().map(str::to_string).filter(|s| !s.is_empty()),
                }
            })
            .collect();
        Self { capabilities }
    }
}

impl PluginAssociator for CapabilitiesAssociator {
    fn associate(&self, dev_info: &DeviceInfo) -> DeviceSupport {
        let Some(vendor) = dev_info.vendor.as_deref() else {
            return DeviceSupport::Unknown;
        };
        let mut best = DeviceSupport::None;
        for capability in &self.capabilities {
            if capability.vendor != vendor {
                continue;
            }
            let score = match (capability.model.as_deref(), dev_info.model.as_deref()) {
                (Some(cap_model), Some(model)) if cap_model == model => {
                    match (capability.version.as_deref(), dev_info.version.as_deref()) {
                        (Some(cap_version), Some(version)) if cap_version == version => {
                            DeviceSupport::Exact
                        }
                        _ => DeviceSupport::Complete,
                    }
                }
                (None, _) => DeviceSupport::Probable,
                _ => DeviceSupport::Probable,
            };
            best = best.max(score);
        }
        best
    }
}

/// Replace `{{ dotted.path }}` references by context values.
fn render_template(template: &str, context: &Value) -> String {
    let mut result = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                result.push_str(&lookup(context, key));
                rest = &after[end + 2..];
            }
            None => {
                result.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    result.push_str(rest);
    result
}

fn lookup(context: &Value, dotted_key: &str) -> String {
    let mut current = context;
    for token in dotted_key.split('.') {
        match current.get(token) {
            Some(value) => current = value,
            None => return String::new(),
        }
    }
    match current {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// The standard plugin instance.
pub struct StandardPlugin {
    id: String,
    info: PluginInfo,
    templates_dir: PathBuf,
    tftpboot_dir: PathBuf,
    http_service: DirectoryHttpService,
    tftp_service: TftpFileService,
    associator: CapabilitiesAssociator,
    extractor: MacFilenameExtractor,
    sync_service: Option<Arc<dyn SynchronizeService>>,
}

impl StandardPlugin {
    fn new(context: PluginContext) -> Result<Self> {
        let tftpboot_dir = context.plugin_dir.join("var").join("tftpboot");
        std::fs::create_dir_all(&tftpboot_dir)?;
        let associator = CapabilitiesAssociator::from_info(&context.info);
        Ok(Self {
            id: context.id,
            info: context.info,
            templates_dir: context.plugin_dir.join("templates"),
            http_service: DirectoryHttpService::new(&tftpboot_dir),
            tftp_service: TftpFileService::new(&tftpboot_dir),
            tftpboot_dir,
            associator,
            extractor: MacFilenameExtractor,
            sync_service: context.sync_service,
        })
    }

    /// Name of the per-device file the phone fetches.
    fn device_filename(&self, device: &Device) -> Option<String> {
        if let Some(mac) = &device.mac {
            if let Ok(compact) = format_mac(mac, "", false) {
                return Some(format!("{compact}.cfg"));
            }
        }
        device.id.as_ref().map(|id| format!("{id}.cfg"))
    }

    fn device_template(&self, device: &Device) -> Option<PathBuf> {
        let mut candidates = Vec::new();
        if let Some(mac) = &device.mac {
            if let Ok(compact) = format_mac(mac, "", false) {
                candidates.push(self.templates_dir.join("dev").join(format!("{compact}.tpl")));
            }
        }
        if let Some(model) = &device.model {
            candidates.push(self.templates_dir.join(format!("{model}.tpl")));
        }
        candidates.push(self.templates_dir.join("base.tpl"));
        candidates.into_iter().find(|path| path.is_file())
    }

    fn write_rendered(&self, template_path: &Path, context: &Value, dest: &Path) -> Result<()> {
        let template = std::fs::read_to_string(template_path)?;
        let rendered = render_template(&template, context);
        std::fs::write(dest, rendered)?;
        Ok(())
    }
}

#[async_trait]
impl Plugin for StandardPlugin {
    fn id(&self) -> &str {
        &self.id
    }

    fn info(&self) -> &PluginInfo {
        &self.info
    }

    fn http_dev_info_extractor(&self) -> Option<&dyn DeviceInfoExtractor> {
        Some(&self.extractor)
    }

    fn tftp_dev_info_extractor(&self) -> Option<&dyn DeviceInfoExtractor> {
        Some(&self.extractor)
    }

    fn http_service(&self) -> Option<&dyn HttpFileService> {
        Some(&self.http_service)
    }

    fn tftp_service(&self) -> Option<&dyn TftpReadService> {
        Some(&self.tftp_service)
    }

    fn pg_associator(&self) -> Option<&dyn PluginAssociator> {
        Some(&self.associator)
    }

    fn configure_common(&self, raw_config: &Value) -> Result<()> {
        let base_template = self.templates_dir.join("base.tpl");
        if base_template.is_file() {
            let context = json!({"raw_config": raw_config});
            self.write_rendered(
                &base_template,
                &context,
                &self.tftpboot_dir.join("base.cfg"),
            )?;
        }
        Ok(())
    }

    fn configure(&self, device: &Device, raw_config: &Value) -> Result<()> {
        let Some(filename) = self.device_filename(device) else {
            return Err(ProvdError::Plugin(
                "device has neither mac nor id".to_string(),
            ));
        };
        let dest = self.tftpboot_dir.join(&filename);
        let context = json!({
            "device": serde_json::to_value(device)?,
            "raw_config": raw_config,
        });
        match self.device_template(device) {
            Some(template_path) => {
                debug!(
                    "Rendering {} for device {:?}",
                    template_path.display(),
                    device.id
                );
                self.write_rendered(&template_path, &context, &dest)?;
            }
            None => {
                std::fs::write(&dest, serde_json::to_vec_pretty(raw_config)?)?;
            }
        }
        info!("Wrote device file {}", dest.display());
        Ok(())
    }

    fn deconfigure(&self, device: &Device) -> Result<()> {
        let Some(filename) = self.device_filename(device) else {
            return Ok(());
        };
        match std::fs::remove_file(self.tftpboot_dir.join(&filename)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn synchronize(&self, device: &Device, _raw_config: &Value) -> Result<()> {
        standard_sip_synchronize(self.sync_service.as_ref(), device, SYNC_EVENT_CHECK_SYNC).await
    }

    fn get_remote_state_trigger_filename(&self, device: &Device) -> Option<String> {
        self.device_filename(device)
    }

    fn is_sensitive_filename(&self, filename: &str) -> bool {
        // device files carry SIP credentials
        filename.ends_with(".cfg")
    }
}

/// Driver building [`StandardPlugin`] instances.
pub struct StandardPluginDriver;

impl PluginDriver for StandardPluginDriver {
    fn name(&self) -> &str {
        "standard"
    }

    fn create(&self, context: PluginContext) -> Result<Arc<dyn Plugin>> {
        Ok(Arc::new(StandardPlugin::new(context)?))
    }
}
