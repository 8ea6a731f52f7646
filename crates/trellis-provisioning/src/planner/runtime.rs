//! Kubernetes distribution specifics
//!
//! Clusters run either rke2 or k3s, chosen by the Kubernetes version
//! string. The runtime decides the supervisor port nodes join on and
//! where configuration and data live on disk.

/// Node configuration file name under the runtime's drop-in directory
const CONFIG_FILE: &str = "50-trellis.yaml";

/// Config keys only a server node understands
const SERVER_ONLY_KEYS: &[&str] = &[
    "cluster-init",
    "cluster-cidr",
    "service-cidr",
    "cluster-dns",
    "cluster-domain",
    "disable-etcd",
    "disable-apiserver",
    "disable-controller-manager",
    "disable-scheduler",
    "etcd-snapshot-schedule-cron",
    "etcd-snapshot-retention",
    "tls-san",
    "kube-apiserver-arg",
    "kube-controller-manager-arg",
    "kube-scheduler-arg",
];

/// Kubernetes distribution run on provisioned nodes
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Runtime {
    /// RKE2
    Rke2,
    /// K3s
    K3s,
}

impl Runtime {
    /// Runtime for a Kubernetes version such as `v1.30.4+rke2r1`
    pub fn for_version(version: &str) -> Self {
        if version.contains("rke2") {
            Self::Rke2
        } else {
            Self::K3s
        }
    }

    /// Runtime name as used in paths and installer variables
    pub fn name(&self) -> &'static str {
        match self {
            Self::Rke2 => "rke2",
            Self::K3s => "k3s",
        }
    }

    /// Port new nodes join the cluster on
    pub fn supervisor_port(&self) -> u16 {
        match self {
            Self::Rke2 => 9345,
            Self::K3s => 6443,
        }
    }

    /// Drop-in config file the plan writes
    pub fn config_path(&self) -> String {
        format!("/etc/rancher/{}/config.yaml.d/{}", self.name(), CONFIG_FILE)
    }

    /// Private registry configuration file
    pub fn registries_path(&self) -> String {
        format!("/etc/rancher/{}/registries.yaml", self.name())
    }

    /// Runtime data directory
    pub fn data_dir(&self) -> String {
        format!("/var/lib/rancher/{}", self.name())
    }

    /// Directory for a registry's TLS and CA files
    ///
    /// Registry hosts may carry ports or paths; those characters are
    /// replaced so each registry maps to exactly one directory.
    pub fn registry_tls_dir(&self, registry: &str) -> String {
        let safe: String = registry
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        format!("{}/etc/tls/registries/{}", self.data_dir(), safe)
    }

    /// Installer environment variable prefix, e.g. `INSTALL_RKE2`
    pub fn install_env_prefix(&self) -> String {
        format!("INSTALL_{}", self.name().to_uppercase())
    }

    /// Whether a config key applies only to servers
    pub fn is_server_only_key(key: &str) -> bool {
        SERVER_ONLY_KEYS.contains(&key)
    }
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
