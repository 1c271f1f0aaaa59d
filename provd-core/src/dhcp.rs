//! DHCP information sink.
//!
//! The provisioning server does not speak DHCP on the wire; an external
//! agent pushes transaction summaries (`op=commit`) which are only mined
//! for device information. There is no route step: the pipeline runs
//! extract/retrieve/update and the affected device is refreshed.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{ProvdError, Result};
use crate::ident::{RequestInfo, RequestProcessingService};
use crate::util::{norm_ip, norm_mac};

/// Operation carried by a DHCP info record.
pub const DHCP_OP_COMMIT: &str = "commit";

/// A DHCP transaction summary pushed by an external agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DhcpInfo {
    /// Operation; only `commit` is processed, other values are accepted
    /// but ignored.
    pub op: String,
    pub ip: String,
    pub mac: String,
    /// Client options, keyed by option code, values as raw strings.
    #[serde(default)]
    pub options: HashMap<u8, String>,
}

/// DHCP request processing service.
pub struct DhcpRequestProcessingService {
    process_service: Arc<RequestProcessingService>,
}

impl DhcpRequestProcessingService {
    pub fn new(process_service: Arc<RequestProcessingService>) -> Self {
        Self { process_service }
    }

    /// Handle a pushed DHCP info record.
    pub async fn handle_dhcp_info(&self, dhcp_info: DhcpInfo) -> Result<()> {
        if dhcp_info.op != DHCP_OP_COMMIT {
            debug!("Ignoring DHCP info with op {}", dhcp_info.op);
            return Ok(());
        }
        let ip = norm_ip(&dhcp_info.ip)
            .map_err(|_| ProvdError::InvalidParameter(format!("invalid ip: {}", dhcp_info.ip)))?;
        let mac = norm_mac(&dhcp_info.mac)
            .map_err(|_| ProvdError::InvalidParameter(format!("invalid mac: {}", dhcp_info.mac)))?;
        info!("Processing DHCP request: {}", ip);
        let request = RequestInfo::Dhcp {
            ip,
            mac,
            options: dhcp_info.options,
        };
        let (_device, _pg_id) = self.process_service.process(&request).await;
        Ok(())
    }
}
