//! Error handling for the provisioning engine.
//!
//! This module provides one error type for all engine operations. Errors
//! from underlying libraries are converted using `thiserror`.
//!
//! ## Error Categories
//!
//! ### Store Errors
//! `InvalidId` (referenced id does not exist where it must, or an insert
//! reuses an existing id), `NonDeletable` (delete attempted on a protected
//! record), `EntryNotFound` (lookup miss surfaced to a caller that
//! required a hit).
//!
//! ### Configuration Errors
//! `RawConfig` (a materialized raw config violates the schema; the message
//! names the offending field), `InvalidParameter` (a configure-service set
//! request rejected the value).
//!
//! ### Protocol Errors
//! `Packet` (a TFTP datagram failed to parse or build).
//!
//! ### Multi-tenant Errors
//! `DeviceNotInProvdTenant` / `TenantInvalidForDevice` — authorization
//! rejections carrying the offending tenant uuid.
//!
//! ### Plugin Errors
//! `PluginNotLoaded`, `Plugin` (lifecycle and hook failures),
//! `Synchronize` (device synchronization cannot proceed).

use thiserror::Error;

/// Result type for provisioning operations.
pub type Result<T> = std::result::Result<T, ProvdError>;

/// Errors that can occur during provisioning operations.
#[derive(Error, Debug)]
pub enum ProvdError {
    /// I/O error (file system, network, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error (plugin index/package downloads)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A referenced id does not exist in a store operation where it must,
    /// or an insert specified an id that already exists.
    #[error("invalid id: {0}")]
    InvalidId(String),

    /// Delete attempted on a record carrying `deletable=false`.
    #[error("non-deletable document: {0}")]
    NonDeletable(String),

    /// Persistence lookup miss where the caller required a hit.
    #[error("entry not found: {0}")]
    EntryNotFound(String),

    /// The id generator could not produce a fresh id.
    #[error("id generation exhausted after {0} attempts")]
    IdGeneration(usize),

    /// A document failed validation before reaching the store.
    #[error("invalid document: {0}")]
    InvalidDocument(String),

    /// A materialized raw config violates the schema.
    #[error("invalid raw config: {0}")]
    RawConfig(String),

    /// A configure-service set request rejected the value.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A TFTP datagram failed to parse or build.
    #[error("packet error: {0}")]
    Packet(String),

    /// The caller tenant does not own the device.
    #[error("device not in provd tenant: {0}")]
    DeviceNotInProvdTenant(String),

    /// The caller tenant may not act on the device.
    #[error("tenant invalid for device: {0}")]
    TenantInvalidForDevice(String),

    /// Unload/use of a plugin that is not loaded.
    #[error("plugin not loaded: {0}")]
    PluginNotLoaded(String),

    /// Plugin lifecycle or hook failure.
    #[error("plugin error: {0}")]
    Plugin(String),

    /// Synchronization cannot proceed (missing service, missing device
    /// info, remote failure).
    #[error("synchronize error: {0}")]
    Synchronize(String),

    /// Download integrity failure (digest mismatch against the index).
    #[error("integrity error for {filename}: expected sha1 {expected}")]
    Integrity { filename: String, expected: String },

    /// Catch-all for operations that cannot proceed in the current state.
    #[error("{0}")]
    InvalidState(String),
}

impl ProvdError {
    /// Build an `InvalidId` from anything displayable.
    pub fn invalid_id(id: impl std::fmt::Display) -> Self {
        ProvdError::InvalidId(id.to_string())
    }

    /// True if the error denotes a missing record rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ProvdError::InvalidId(_) | ProvdError::EntryNotFound(_)
        )
    }
}
