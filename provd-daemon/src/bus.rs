//! Message-bus event consumer.
//!
//! The actual bus client lives outside the daemon; events are fed in
//! through a channel. The only event the core reacts to is
//! `auth_tenant_deleted`, which removes every device of the tenant and
//! drops its provisioning key.

use std::sync::Arc;

use provd_core::ProvisioningApplication;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

pub const EVENT_TENANT_DELETED: &str = "auth_tenant_deleted";

/// An event delivered by the bus client.
#[derive(Debug, Clone, Deserialize)]
pub struct BusEvent {
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

/// Consume bus events until the channel closes.
pub async fn run_consumer(app: Arc<ProvisioningApplication>, mut events: mpsc::Receiver<BusEvent>) {
    while let Some(event) = events.recv().await {
        dispatch(&app, event).await;
    }
    debug!("Bus consumer channel closed");
}

async fn dispatch(app: &ProvisioningApplication, event: BusEvent) {
    if event.name != EVENT_TENANT_DELETED {
        debug!("Ignoring bus event {}", event.name);
        return;
    }
    let Some(tenant_uuid) = event.data.get("uuid").and_then(Value::as_str) else {
        warn!("Tenant deleted event without uuid: {:?}", event);
        return;
    };
    if let Err(e) = app.handle_tenant_deleted(tenant_uuid).await {
        warn!("Error while handling deleted tenant {}: {}", tenant_uuid, e);
    }
}
