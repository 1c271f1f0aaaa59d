//! Security event logging.
//!
//! Security-relevant events (automatic device creation, sensitive file
//! fetches) are emitted on a dedicated `security` tracing target so the
//! daemon can route them to a separate sink, typically consumed by
//! fail2ban.

use tracing::info;

/// Log a security-relevant message.
pub fn log_security_msg(msg: &str) {
    info!(target: "security", "{}", msg);
}
