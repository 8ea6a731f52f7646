//! Subordinate resources produced for a provisioned cluster
//!
//! None of these are written by users. The cluster reconciler produces the
//! control plane, infrastructure cluster, bootstrap template and node
//! deployments; the node deployment controller produces machines and their
//! bootstrap requests.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{
    EnvVar, EtcdSnapshotCreate, EtcdSnapshotRestore, Registry, ResourceRef, RollingUpdate,
};
use crate::condition::{Condition, HasConditions};

/// Control plane for one cluster; the plan distributor works from this object
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "rke.trellis.dev",
    version = "v1",
    kind = "ControlPlane",
    plural = "controlplanes",
    status = "ControlPlaneStatus",
    namespaced,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#,
    printcolumn = r#"{"name":"Nodes","type":"integer","jsonPath":".status.readyNodes"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    /// Provisioning cluster this control plane belongs to
    pub cluster_name: String,
    /// Management cluster name used for proxied addresses
    pub management_cluster_name: String,
    /// Kubernetes version, including the runtime suffix
    pub kubernetes_version: String,
    /// Environment variables passed to every node agent
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub agent_env_vars: Vec<EnvVar>,
    /// Runtime configuration applied to every server node
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub machine_global_config: BTreeMap<String, serde_json::Value>,
    /// Private registry configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registries: Option<Registry>,
    /// Restore request copied from the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_snapshot_restore: Option<EtcdSnapshotRestore>,
    /// Snapshot request copied from the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etcd_snapshot_create: Option<EtcdSnapshotCreate>,
    /// Infrastructure cluster backing the machines
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_ref: Option<ResourceRef>,
}

/// Observed state of a control plane
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneStatus {
    /// Conditions: Provisioned
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// All nodes have applied their current plan
    #[serde(default)]
    pub ready: bool,
    /// Nodes whose current plan is applied
    #[serde(default)]
    pub ready_nodes: i32,
    /// Nodes known to the control plane
    #[serde(default)]
    pub total_nodes: i32,
    /// Generation last reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl HasConditions for ControlPlaneStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }
    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}

/// Default infrastructure cluster used when the cluster references none
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "rke.trellis.dev",
    version = "v1",
    kind = "InfraCluster",
    plural = "infraclusters",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct InfraClusterSpec {
    /// Provisioning cluster this belongs to
    pub cluster_name: String,
}

/// Template every bootstrap request of the cluster is stamped from
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "rke.trellis.dev",
    version = "v1",
    kind = "BootstrapTemplate",
    plural = "bootstraptemplates",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapTemplateSpec {
    /// Provisioning cluster this belongs to
    pub cluster_name: String,
}

/// A replicated group of machines produced from one node pool
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "rke.trellis.dev",
    version = "v1",
    kind = "NodeDeployment",
    plural = "nodedeployments",
    status = "NodeDeploymentStatus",
    namespaced,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Ready","type":"integer","jsonPath":".status.readyReplicas"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NodeDeploymentSpec {
    /// Provisioning cluster this belongs to
    pub cluster_name: String,
    /// Desired machine count
    pub replicas: i32,
    /// Stop creating and deleting machines
    #[serde(default)]
    pub paused: bool,
    /// Rolling update bounds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<RollingUpdate>,
    /// Template for produced machines
    pub template: MachineTemplateSpec,
}

/// Template section of a node deployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplateSpec {
    /// Labels stamped onto every machine (role labels included)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations stamped onto every machine
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    /// Bootstrap template machines are bootstrapped from
    pub bootstrap_template_ref: ResourceRef,
    /// Infrastructure template or direct infrastructure reference
    pub infrastructure_ref: ResourceRef,
}

/// Observed state of a node deployment
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeDeploymentStatus {
    /// Machines currently owned
    #[serde(default)]
    pub replicas: i32,
    /// Machines in the Running phase
    #[serde(default)]
    pub ready_replicas: i32,
    /// Machines built from the current template
    #[serde(default)]
    pub updated_replicas: i32,
    /// Generation last reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Machine lifecycle phase
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum MachinePhase {
    /// Waiting for bootstrap data
    #[default]
    Pending,
    /// Bootstrap data assigned, plan not yet applied
    Provisioning,
    /// Current plan applied
    Running,
    /// Being removed
    Deleting,
    /// The agent gave up on the current plan
    Failed,
}

impl std::fmt::Display for MachinePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Provisioning => write!(f, "Provisioning"),
            Self::Running => write!(f, "Running"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// One running or pending compute instance
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "rke.trellis.dev",
    version = "v1",
    kind = "Machine",
    plural = "machines",
    status = "MachineStatus",
    namespaced,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Provisioning cluster this belongs to
    pub cluster_name: String,
    /// Bootstrap request for this machine
    pub bootstrap: MachineBootstrap,
    /// Infrastructure template or direct infrastructure reference
    pub infrastructure_ref: ResourceRef,
    /// Provider-assigned node identifier once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

/// Bootstrap reference of a machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineBootstrap {
    /// The BootstrapRequest for this machine
    pub config_ref: ResourceRef,
}

/// Observed state of a machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Lifecycle phase
    #[serde(default)]
    pub phase: MachinePhase,
    /// Conditions: Provisioned
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Bootstrap data secret has been issued
    #[serde(default)]
    pub bootstrap_ready: bool,
    /// Name of the issued bootstrap data secret
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,
}

impl HasConditions for MachineStatus {
    fn conditions(&self) -> &[Condition] {
        &self.conditions
    }
    fn conditions_mut(&mut self) -> &mut Vec<Condition> {
        &mut self.conditions
    }
}

/// Request for one machine's bootstrap data and scoped identity
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "rke.trellis.dev",
    version = "v1",
    kind = "BootstrapRequest",
    plural = "bootstraprequests",
    status = "BootstrapRequestStatus",
    namespaced,
    printcolumn = r#"{"name":"Machine","type":"string","jsonPath":".spec.machineName"}"#,
    printcolumn = r#"{"name":"Ready","type":"boolean","jsonPath":".status.ready"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapRequestSpec {
    /// Provisioning cluster this belongs to
    pub cluster_name: String,
    /// The machine this request bootstraps
    pub machine_name: String,
}

/// Observed state of a bootstrap request
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapRequestStatus {
    /// Bootstrap data has been issued
    #[serde(default)]
    pub ready: bool,
    /// Immutable secret holding the install script, set once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_secret_name: Option<String>,
    /// Plan secret the node's agent watches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_secret_name: Option<String>,
}
