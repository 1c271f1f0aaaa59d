//! Synchronization services for devices.
//!
//! The concrete notifier (an Asterisk AMI client sending `PJSIPNotify`
//! actions) lives outside the core; the core only depends on this
//! boundary. The preferred path notifies by SIP endpoint name, falling
//! back to the device IP when no usable peer is known.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::device::Device;
use crate::error::{ProvdError, Result};

/// Event name pushed to devices to make them re-fetch their files.
pub const SYNC_EVENT_CHECK_SYNC: &str = "check-sync";

/// Out-of-band notification boundary.
#[async_trait]
pub trait SynchronizeService: Send + Sync {
    /// Send a SIP NOTIFY to `sip:anonymous@<ip>`.
    async fn sip_notify_by_ip(&self, ip: &str, event: &str) -> Result<()>;

    /// Send a SIP NOTIFY to an endpoint by name.
    async fn sip_notify_by_peer(&self, peer: &str, event: &str) -> Result<()>;
}

fn usable_peer(device: &Device) -> Option<&str> {
    let peer = device.remote_state_sip_username.as_deref()?;
    // all devices in autoprov share a placeholder peer starting with
    // "ap"; use the ip instead to avoid restarting every phone
    if peer.starts_with("ap") && peer.len() == 10 {
        return None;
    }
    Some(peer)
}

/// Ask the device to resynchronize, preferring its SIP endpoint.
pub async fn standard_sip_synchronize(
    sync_service: Option<&Arc<dyn SynchronizeService>>,
    device: &Device,
    event: &str,
) -> Result<()> {
    let Some(sync_service) = sync_service else {
        return Err(ProvdError::Synchronize(
            "no synchronize service registered".to_string(),
        ));
    };
    if let Some(peer) = usable_peer(device) {
        debug!("Synchronizing device {:?} by peer {}", device.id, peer);
        return sync_service.sip_notify_by_peer(peer, event).await;
    }
    if let Some(ip) = device.ip.as_deref() {
        debug!("Synchronizing device {:?} by ip {}", device.id, ip);
        return sync_service.sip_notify_by_ip(ip, event).await;
    }
    Err(ProvdError::Synchronize(
        "not enough information to synchronize device".to_string(),
    ))
}

pub mod testing {
    //! Recording stub used by the test suites.

    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Notify {
        ByIp { ip: String, event: String },
        ByPeer { peer: String, event: String },
    }

    #[derive(Default)]
    pub struct RecordingSyncService {
        pub notifications: Mutex<Vec<Notify>>,
    }

    #[async_trait]
    impl SynchronizeService for RecordingSyncService {
        async fn sip_notify_by_ip(&self, ip: &str, event: &str) -> Result<()> {
            self.notifications
                .lock()
                .expect("notifications lock poisoned")
                .push(Notify::ByIp {
                    ip: ip.to_string(),
                    event: event.to_string(),
                });
            Ok(())
        }

        async fn sip_notify_by_peer(&self, peer: &str, event: &str) -> Result<()> {
            self.notifications
                .lock()
                .expect("notifications lock poisoned")
                .push(Notify::ByPeer {
                    peer: peer.to_string(),
                    event: event.to_string(),
                });
            Ok(())
        }
    }
}
