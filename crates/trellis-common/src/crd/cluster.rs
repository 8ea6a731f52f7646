//! Cluster and ClusterRegistrationToken custom resources
//!
//! A Cluster is the single high-level object a user writes. Everything else
//! in the provisioning tree is derived from it by the cluster reconciler.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    EnvVar, EtcdSnapshotCreate, EtcdSnapshotRestore, Networking, Registry, ResourceRef,
    RollingUpdate, Taint,
};
use crate::condition::{Condition, HasConditions};

/// Specification for a provisioned cluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "provisioning.trellis.dev",
    version = "v1",
    kind = "Cluster",
    plural = "clusters",
    status = "ClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".status.clusterName"}"#,
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".spec.kubernetesVersion"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Kubernetes version, e.g. `v1.30.4+rke2r1`; required for RKE clusters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,

    /// Provisioning configuration; clusters without it are not provisioned here
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rke_config: Option<RkeConfig>,

    /// Import an existing cluster-api cluster instead of provisioning one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_api_config: Option<ClusterApiConfig>,

    /// Environment variables passed to every node agent
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent_env_vars: Vec<EnvVar>,

    /// Default cloud credential secret (`namespace:name` or `name`) for pools
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_credential_secret_name: Option<String>,
}

/// Reference to an externally managed cluster-api cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterApiConfig {
    /// Name of the cluster-api Cluster in the same namespace
    pub cluster_name: String,
}

/// Provisioning configuration
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RkeConfig {
    /// Node pools
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub machine_pools: Vec<MachinePool>,

    /// Runtime configuration applied to every server node
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub machine_global_config: BTreeMap<String, serde_json::Value>,

    /// Private registry configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registries: Option<Registry>,

    /// Cluster networking
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub networking: Option<Networking>,

    /// Restore request forwarded to the control plane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_snapshot_restore: Option<EtcdSnapshotRestore>,

    /// Snapshot request forwarded to the control plane
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_snapshot_create: Option<EtcdSnapshotCreate>,

    /// Externally managed infrastructure cluster; a default one is created when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ResourceRef>,
}

/// A named group of machines within a cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachinePool {
    /// Pool name, unique within the cluster
    #[serde(default)]
    pub name: String,

    /// Machines in this pool run etcd
    #[serde(default)]
    pub etcd_role: bool,

    /// Machines in this pool run the control plane
    #[serde(default)]
    pub control_plane_role: bool,

    /// Machines in this pool run workloads
    #[serde(default)]
    pub worker_role: bool,

    /// Desired replica count (defaults to 1)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<i32>,

    /// Infrastructure template or node config for the pool's machines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_config: Option<ResourceRef>,

    /// Stop creating and deleting machines for this pool
    #[serde(default)]
    pub paused: bool,

    /// Rolling update policy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rolling_update: Option<RollingUpdate>,

    /// Kubernetes node labels applied on registration
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Kubernetes node taints applied on registration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,

    /// Labels copied onto the produced deployment
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub machine_deployment_labels: BTreeMap<String, String>,

    /// Annotations copied onto the produced deployment
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub machine_deployment_annotations: BTreeMap<String, String>,

    /// Cloud credential secret overriding the cluster default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cloud_credential_secret_name: Option<String>,
}

impl MachinePool {
    /// Desired replicas, defaulting to 1 when unset
    pub fn replicas(&self) -> i32 {
        self.quantity.unwrap_or(1)
    }

    /// Whether the pool has at least one role
    pub fn has_role(&self) -> bool {
        self.etcd_role || self.control_plane_role || self.worker_role
    }
}

/// Observed state of a Cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Conditions: Provisioned, Updated, Waiting, Ready
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Management cluster name assigned on first reconcile (`c-m-<hash>`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,

    /// Snapshot of the spec the current object tree was built from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_spec: Option<ClusterSpec>,

    /// The control-plane object produced for this cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane_ref: Option<ResourceRef>,

    /// Secret holding the cluster's kubeconfig bundle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_name: Option<String>,

    /// Generation last reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Cluster is provisioned and a kubeconfig is available
    #[serde(default)]
    pub ready: bool,
}

impl HasConditions for ClusterStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }
    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}

/// Shared secret a not-yet-identified node presents to start a handshake
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "provisioning.trellis.dev",
    version = "v1",
    kind = "ClusterRegistrationToken",
    plural = "clusterregistrationtokens",
    status = "ClusterRegistrationTokenStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistrationTokenSpec {
    /// Name of the provisioning Cluster in the same namespace
    pub cluster_name: String,
}

/// Issued token
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterRegistrationTokenStatus {
    /// The bearer value nodes present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}
