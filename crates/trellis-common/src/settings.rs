//! Runtime settings shared by every controller
//!
//! Parsed from the command line and environment by the operator binary and
//! handed to components by `Arc`. `Default` gives values suitable for tests.

use std::time::Duration;

use crate::keyed_lock::{DEFAULT_LOCK_CAPACITY, DEFAULT_LOCK_TTL};

/// Default bounded wait for a handshake record to be resolved
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(120);

/// Default number of consecutive transient failures before "Waiting" is shown
pub const DEFAULT_WAITING_THRESHOLD: u32 = 5;

/// Default number of agent failures on one plan before a machine is Failed
pub const DEFAULT_PLAN_FAILURE_THRESHOLD: u32 = 3;

/// Settings for the provisioning controllers and config server
#[derive(Clone, Debug)]
pub struct Settings {
    /// Externally reachable URL of this control plane (e.g. https://trellis.example.com)
    pub server_url: String,
    /// PEM CA bundle agents should trust for `server_url`; empty for public CAs
    pub ca_certs: String,
    /// Namespace for control-plane owned records (kubeconfig users, apply indexes)
    pub system_namespace: String,
    /// Bounded wait for a handshake record to be matched
    pub handshake_timeout: Duration,
    /// Age after which an unmatched handshake record is swept
    pub handshake_record_ttl: Duration,
    /// Store derived tokens hashed instead of in plain text
    pub token_hashing: bool,
    /// Image prefix for the runtime installer (suffix is `-<runtime>:<version>`)
    pub installer_image_prefix: String,
    /// URL the install script downloads the node agent installer from
    pub agent_install_url: String,
    /// Maximum idle entries in the per-key lock store
    pub lock_capacity: usize,
    /// Idle time before a per-key lock entry is dropped
    pub lock_ttl: Duration,
    /// Consecutive transient failures before a "Waiting" condition appears
    pub waiting_threshold: u32,
    /// Agent failures on the current plan before a machine is marked Failed
    pub plan_failure_threshold: u32,
    /// Attach ownerReferences to applied objects in the owner's namespace
    pub owner_references: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_url: "https://trellis.local".to_string(),
            ca_certs: String::new(),
            system_namespace: crate::SYSTEM_NAMESPACE.to_string(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            handshake_record_ttl: Duration::from_secs(3600),
            token_hashing: false,
            installer_image_prefix: "trellis/system-agent-installer".to_string(),
            agent_install_url: "https://trellis.local/system-agent-install.sh".to_string(),
            lock_capacity: DEFAULT_LOCK_CAPACITY,
            lock_ttl: DEFAULT_LOCK_TTL,
            waiting_threshold: DEFAULT_WAITING_THRESHOLD,
            plan_failure_threshold: DEFAULT_PLAN_FAILURE_THRESHOLD,
            owner_references: true,
        }
    }
}

impl Settings {
    /// SHA-256 hex checksum of the CA bundle, empty when no bundle is configured
    pub fn ca_checksum(&self) -> String {
        if self.ca_certs.trim().is_empty() {
            return String::new();
        }
        crate::naming::sha256_hex(self.ca_certs.as_bytes())
    }

    /// Server URL without a trailing slash
    pub fn server_url(&self) -> &str {
        self.server_url.trim_end_matches('/')
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ca_checksum_empty_without_bundle() {
        let settings = Settings::default();
        assert_eq!(settings.ca_checksum(), "");
    }

    #[test]
    fn test_ca_checksum_hashes_bundle() {
        let settings = Settings {
            ca_certs: "-----BEGIN CERTIFICATE-----\nabc\n-----END CERTIFICATE-----\n".into(),
            ..Default::default()
        };
        assert_eq!(settings.ca_checksum().len(), 64);
    }

    #[test]
    fn test_server_url_trims_slash() {
        let settings = Settings {
            server_url: "https://trellis.example.com/".into(),
            ..Default::default()
        };
        assert_eq!(settings.server_url(), "https://trellis.example.com");
    }
}
