//! Shared types used across CRD specs

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to another object by apiVersion, kind and name
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    /// API version of the referent; empty means the default for its kind
    #[serde(default)]
    pub api_version: String,
    /// Kind of the referent
    #[serde(default)]
    pub kind: String,
    /// Name of the referent
    #[serde(default)]
    pub name: String,
    /// Namespace of the referent; defaults to the referrer's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ResourceRef {
    /// Reference with the given apiVersion, kind and name
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            name: name.into(),
            namespace: None,
        }
    }
}

/// Environment variable passed through to node agents
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct EnvVar {
    /// Variable name
    pub name: String,
    /// Variable value
    #[serde(default)]
    pub value: String,
}

/// Node taint applied when a machine registers
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub struct Taint {
    /// Taint key
    pub key: String,
    /// Taint value
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    /// NoSchedule, PreferNoSchedule or NoExecute
    pub effect: String,
}

impl Taint {
    /// Render as `key=value:effect` (or `key:effect` without a value)
    pub fn to_arg(&self) -> String {
        if self.value.is_empty() {
            format!("{}:{}", self.key, self.effect)
        } else {
            format!("{}={}:{}", self.key, self.value, self.effect)
        }
    }
}

/// Rolling update bounds for replacing machines
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RollingUpdate {
    /// Machines that may be unavailable during an update (count or percent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_unavailable: Option<IntOrString>,
    /// Machines that may be created above the desired count (count or percent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_surge: Option<IntOrString>,
}

/// Private registry configuration rendered into every node plan
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    /// Registry mirrors keyed by upstream registry host
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub mirrors: BTreeMap<String, Mirror>,
    /// Per-registry auth and TLS settings keyed by registry host
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub configs: BTreeMap<String, RegistryConfig>,
}

/// A registry mirror
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Mirror {
    /// Mirror endpoints in priority order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<String>,
    /// Repository rewrite rules
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub rewrites: BTreeMap<String, String>,
}

/// Auth and TLS for one registry
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Secret of type `rke.trellis.dev/auth-config` with username/password or auth
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_config_secret_name: Option<String>,
    /// Secret of type `kubernetes.io/tls` holding a client certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_secret_name: Option<String>,
    /// PEM CA bundle for the registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_bundle: Option<String>,
    /// Skip TLS verification
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// Request to restore etcd from a snapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdSnapshotRestore {
    /// Snapshot name
    pub name: String,
    /// Bump to request another restore of the same snapshot
    #[serde(default)]
    pub generation: i64,
    /// What to restore besides etcd ("none", "kubernetesVersion", "all")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restore_rke_config: Option<String>,
}

/// Request to take an etcd snapshot
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdSnapshotCreate {
    /// Bump to request another snapshot
    #[serde(default)]
    pub generation: i64,
}

/// Cluster networking; rendered into the server configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Networking {
    /// Pod network CIDR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_cidr: Option<String>,
    /// Service network CIDR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_cidr: Option<String>,
    /// Cluster DNS service address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_dns: Option<String>,
}

impl Networking {
    /// Render as runtime configuration keys
    pub fn to_config(&self) -> BTreeMap<String, serde_json::Value> {
        let mut config = BTreeMap::new();
        let fields = [
            ("cluster-cidr", &self.cluster_cidr),
            ("service-cidr", &self.service_cidr),
            ("cluster-dns", &self.cluster_dns),
        ];
        for (key, value) in fields {
            if let Some(value) = value {
                config.insert(key.to_string(), serde_json::Value::String(value.clone()));
            }
        }
        config
    }
}
