//! Controller flags and their mapping onto [`Settings`]
//!
//! Every flag can also be set through a `TRELLIS_*` environment variable so
//! the operator Deployment can be configured without editing its args.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use trellis_common::settings::{
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_PLAN_FAILURE_THRESHOLD, DEFAULT_WAITING_THRESHOLD,
};
use trellis_common::keyed_lock::{DEFAULT_LOCK_CAPACITY, DEFAULT_LOCK_TTL};
use trellis_common::{Settings, DEFAULT_CONFIG_SERVER_PORT, SYSTEM_NAMESPACE};

/// Flags for `trellis-operator controller`
#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Externally reachable URL of this control plane
    #[arg(long, env = "TRELLIS_SERVER_URL", default_value = "https://trellis.local")]
    pub server_url: String,

    /// PEM CA bundle agents should trust for the server URL
    #[arg(long, env = "TRELLIS_CA_CERTS_FILE")]
    pub ca_certs_file: Option<PathBuf>,

    /// Namespace for control-plane owned records
    #[arg(long, env = "TRELLIS_SYSTEM_NAMESPACE", default_value = SYSTEM_NAMESPACE)]
    pub system_namespace: String,

    /// Bind address of the node config server
    #[arg(long, env = "TRELLIS_CONFIG_SERVER_ADDR", default_value_t = default_config_server_addr())]
    pub config_server_addr: SocketAddr,

    /// Seconds a handshake request waits for its record to be matched
    #[arg(long, env = "TRELLIS_HANDSHAKE_TIMEOUT_SECS", default_value_t = DEFAULT_HANDSHAKE_TIMEOUT.as_secs())]
    pub handshake_timeout_secs: u64,

    /// Seconds after which an unmatched handshake record is swept
    #[arg(long, env = "TRELLIS_HANDSHAKE_RECORD_TTL_SECS", default_value_t = 3600)]
    pub handshake_record_ttl_secs: u64,

    /// Store derived tokens hashed instead of in plain text
    #[arg(long, env = "TRELLIS_TOKEN_HASHING", default_value_t = false)]
    pub token_hashing: bool,

    /// Image prefix for the runtime installer
    #[arg(
        long,
        env = "TRELLIS_INSTALLER_IMAGE_PREFIX",
        default_value = "trellis/system-agent-installer"
    )]
    pub installer_image_prefix: String,

    /// URL the install script downloads the node agent installer from
    #[arg(long, env = "TRELLIS_AGENT_INSTALL_URL")]
    pub agent_install_url: Option<String>,

    /// Maximum idle entries kept in the per-key lock store
    #[arg(long, env = "TRELLIS_LOCK_CAPACITY", default_value_t = DEFAULT_LOCK_CAPACITY)]
    pub lock_capacity: usize,

    /// Seconds before an idle per-key lock is dropped
    #[arg(long, env = "TRELLIS_LOCK_TTL_SECS", default_value_t = DEFAULT_LOCK_TTL.as_secs())]
    pub lock_ttl_secs: u64,

    /// Consecutive transient failures before a "Waiting" condition is shown
    #[arg(long, env = "TRELLIS_WAITING_THRESHOLD", default_value_t = DEFAULT_WAITING_THRESHOLD)]
    pub waiting_threshold: u32,

    /// Agent failures on one plan before its machine is marked Failed
    #[arg(long, env = "TRELLIS_PLAN_FAILURE_THRESHOLD", default_value_t = DEFAULT_PLAN_FAILURE_THRESHOLD)]
    pub plan_failure_threshold: u32,

    /// Skip ownerReferences on applied objects
    #[arg(long, env = "TRELLIS_DISABLE_OWNER_REFERENCES", default_value_t = false)]
    pub disable_owner_references: bool,

    /// Human readable logs instead of JSON lines
    #[arg(long, env = "TRELLIS_LOG_PLAIN", default_value_t = false)]
    pub log_plain: bool,
}

impl Default for ControllerArgs {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            server_url: settings.server_url,
            ca_certs_file: None,
            system_namespace: settings.system_namespace,
            config_server_addr: default_config_server_addr(),
            handshake_timeout_secs: settings.handshake_timeout.as_secs(),
            handshake_record_ttl_secs: settings.handshake_record_ttl.as_secs(),
            token_hashing: settings.token_hashing,
            installer_image_prefix: settings.installer_image_prefix,
            agent_install_url: None,
            lock_capacity: settings.lock_capacity,
            lock_ttl_secs: settings.lock_ttl.as_secs(),
            waiting_threshold: settings.waiting_threshold,
            plan_failure_threshold: settings.plan_failure_threshold,
            disable_owner_references: !settings.owner_references,
            log_plain: false,
        }
    }
}

fn default_config_server_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_CONFIG_SERVER_PORT))
}

impl ControllerArgs {
    /// Build settings, reading the CA bundle from disk when one is configured
    pub fn settings(&self) -> anyhow::Result<Settings> {
        let ca_certs = match &self.ca_certs_file {
            Some(path) => std::fs::read_to_string(path).map_err(|e| {
                anyhow::anyhow!("failed to read CA bundle {}: {}", path.display(), e)
            })?,
            None => String::new(),
        };
        Ok(self.settings_with_ca(ca_certs))
    }

    fn settings_with_ca(&self, ca_certs: String) -> Settings {
        let server_url = self.server_url.trim_end_matches('/').to_string();
        let agent_install_url = self
            .agent_install_url
            .clone()
            .unwrap_or_else(|| format!("{}/system-agent-install.sh", server_url));
        Settings {
            server_url,
            ca_certs,
            system_namespace: self.system_namespace.clone(),
            handshake_timeout: Duration::from_secs(self.handshake_timeout_secs),
            handshake_record_ttl: Duration::from_secs(self.handshake_record_ttl_secs),
            token_hashing: self.token_hashing,
            installer_image_prefix: self.installer_image_prefix.clone(),
            agent_install_url,
            lock_capacity: self.lock_capacity,
            lock_ttl: Duration::from_secs(self.lock_ttl_secs),
            waiting_threshold: self.waiting_threshold,
            plan_failure_threshold: self.plan_failure_threshold,
            owner_references: !self.disable_owner_references,
        }
    }

    /// How often stale handshake records are swept
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs((self.handshake_record_ttl_secs / 4).clamp(30, 600))
    }
}
