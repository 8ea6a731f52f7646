//! Custom Resource Definitions for trellis
//!
//! This module contains all CRD definitions used by the provisioning
//! controllers.

mod cluster;
mod management;
mod rke;
mod types;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::CustomResourceExt;

pub use cluster::{
    Cluster, ClusterApiConfig, ClusterRegistrationToken, ClusterRegistrationTokenSpec,
    ClusterRegistrationTokenStatus, ClusterSpec, ClusterStatus, MachinePool, RkeConfig,
};
pub use management::{
    DynamicSchema, DynamicSchemaSpec, SchemaField, Token, TokenSpec, User, UserSpec,
};
pub use rke::{
    BootstrapRequest, BootstrapRequestSpec, BootstrapRequestStatus, BootstrapTemplate,
    BootstrapTemplateSpec, ControlPlane, ControlPlaneSpec, ControlPlaneStatus, InfraCluster,
    InfraClusterSpec, Machine, MachineBootstrap, MachinePhase, MachineSpec, MachineStatus,
    MachineTemplateSpec, NodeDeployment, NodeDeploymentSpec, NodeDeploymentStatus,
};
pub use types::{
    EnvVar, EtcdSnapshotCreate, EtcdSnapshotRestore, Mirror, Networking, Registry,
    RegistryConfig, ResourceRef, RollingUpdate, Taint,
};

/// Every CRD served by the operator, in install order
pub fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        Cluster::crd(),
        ClusterRegistrationToken::crd(),
        ControlPlane::crd(),
        InfraCluster::crd(),
        BootstrapTemplate::crd(),
        NodeDeployment::crd(),
        Machine::crd(),
        BootstrapRequest::crd(),
        User::crd(),
        Token::crd(),
        DynamicSchema::crd(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_crds_have_unique_names() {
        let crds = all_crds();
        let mut names: Vec<_> = crds.iter().filter_map(|c| c.metadata.name.clone()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), crds.len());
    }
}
