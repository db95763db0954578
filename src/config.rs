//! Static configuration supplied by the embedding platform.
//!
//! The CDM does not read platform properties itself; the host constructs a
//! [`CdmConfig`] once at startup and hands it to the engine. Per-session
//! overrides arrive through a [`PropertySet`].

use std::path::PathBuf;

use crate::crypto::RequestedLevel;

/// Device identity properties included in every client identification block.
///
/// These become fixed name/value pairs on outbound license requests, next to
/// any caller-supplied application parameters.
#[derive(Debug, Clone, Default)]
pub struct DeviceProperties {
    pub company_name: String,
    pub model_name: String,
    pub architecture_name: String,
    pub device_name: String,
    pub product_name: String,
    pub build_info: String,
}

impl DeviceProperties {
    /// Flatten into the name/value pairs carried on the wire.
    pub(crate) fn client_info(&self) -> Vec<(String, String)> {
        vec![
            ("company_name".to_string(), self.company_name.clone()),
            ("model_name".to_string(), self.model_name.clone()),
            (
                "architecture_name".to_string(),
                self.architecture_name.clone(),
            ),
            ("device_name".to_string(), self.device_name.clone()),
            ("product_name".to_string(), self.product_name.clone()),
            ("build_info".to_string(), self.build_info.clone()),
        ]
    }
}

/// Engine-wide configuration.
#[derive(Debug, Clone)]
pub struct CdmConfig {
    /// Device identity pairs for client identification blocks.
    pub properties: DeviceProperties,
    /// Encrypt the client identification with a service certificate.
    pub privacy_mode: bool,
    /// Start the playback clock when a license is received rather than on the
    /// first decrypt.
    pub begin_usage_on_receipt: bool,
    /// Reject implicit renewal routing; the caller must request renewals
    /// explicitly.
    pub require_explicit_renewal: bool,
    /// Identify with a provisioned device certificate instead of the factory
    /// token. Requires a persisted certificate record.
    pub certificate_identity: bool,
    /// Root directory for persisted licenses and certificates. Records are
    /// stored under a security-level-scoped subdirectory.
    pub storage_root: PathBuf,
    /// Default license server URL returned with key requests when the init
    /// data does not carry one.
    pub license_server_url: String,
}

impl Default for CdmConfig {
    fn default() -> Self {
        Self {
            properties: DeviceProperties::default(),
            privacy_mode: false,
            begin_usage_on_receipt: false,
            require_explicit_renewal: false,
            certificate_identity: false,
            storage_root: PathBuf::from("."),
            license_server_url: String::new(),
        }
    }
}

/// Per-session property overrides supplied by the host at `open_session`.
#[derive(Debug, Clone, Default)]
pub struct PropertySet {
    /// Force a specific security tier instead of the probed default.
    pub security_level: Option<RequestedLevel>,
    /// Request a session-sharing id for this session.
    pub session_sharing: bool,
    /// Opaque application id recorded with the session.
    pub app_id: String,
}
