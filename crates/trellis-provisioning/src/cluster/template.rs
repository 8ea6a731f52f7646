//! Desired object tree for a provisioning cluster
//!
//! Pure translation from a [`Cluster`] to the objects the apply engine
//! should keep in place: an infrastructure cluster (unless one is
//! referenced), the control plane, a bootstrap template, and per node pool
//! an optional machine template plus a node deployment. Every name is
//! derived from the cluster and pool names, so unchanged input always
//! produces identical output.

use std::collections::{BTreeMap, HashSet};

use k8s_openapi::api::core::v1::Secret;
use kube::core::{DynamicObject, ObjectMeta, TypeMeta};
use kube::{Resource, ResourceExt};
use serde_json::Value;
use trellis_common::crd::{
    BootstrapTemplate, BootstrapTemplateSpec, Cluster, ControlPlane, ControlPlaneSpec,
    InfraCluster, InfraClusterSpec, MachinePool, MachineTemplateSpec, NodeDeployment,
    NodeDeploymentSpec, ResourceRef, RkeConfig,
};
use trellis_common::labels::{
    CLUSTER_NAME_LABEL, CONTROL_PLANE_ROLE_LABEL, DEPLOYMENT_NAME_LABEL, ETCD_ROLE_LABEL,
    LABELS_ANNOTATION, TAINTS_ANNOTATION, WORKER_ROLE_LABEL,
};
use trellis_common::naming::{build_api_resource, deterministic_hash, safe_concat_name};
use trellis_common::store::{typed, ObjectStore};
use trellis_common::{Error, Result};

use crate::schema::SchemaRegistry;

/// API group of driver node configs
pub const MACHINE_CONFIG_GROUP: &str = "rke-machine-config.trellis.dev";
/// Default apiVersion for node config references without one
pub const MACHINE_CONFIG_API_VERSION: &str = "rke-machine-config.trellis.dev/v1";
/// apiVersion of generated machine templates
pub const MACHINE_TEMPLATE_API_VERSION: &str = "rke-machine.trellis.dev/v1";

/// Check a cluster spec before anything is produced from it
///
/// Every failure is permanent: the user has to edit the spec.
pub fn validate(cluster: &Cluster) -> Result<()> {
    let name = cluster.name_any();
    if cluster
        .spec
        .kubernetes_version
        .as_deref()
        .map_or(true, |v| v.trim().is_empty())
    {
        return Err(Error::validation_for_field(
            &name,
            "spec.kubernetesVersion",
            format!(
                "kubernetesVersion not set on {}/{}",
                cluster.namespace().unwrap_or_default(),
                name
            ),
        ));
    }

    let Some(rke) = &cluster.spec.rke_config else {
        return Ok(());
    };

    let mut seen = HashSet::new();
    for (i, pool) in rke.machine_pools.iter().enumerate() {
        let field = format!("spec.rkeConfig.machinePools[{}]", i);
        let config_ok = pool
            .node_config
            .as_ref()
            .is_some_and(|r| !r.name.is_empty() && !r.kind.is_empty());
        if pool.name.is_empty() || !config_ok {
            return Err(Error::validation_for_field(
                &name,
                field,
                format!(
                    "invalid machinePool [{}] missing name or valid config",
                    pool.name
                ),
            ));
        }
        if !pool.has_role() {
            return Err(Error::validation_for_field(
                &name,
                field,
                format!(
                    "at least one role of etcd, control-plane or worker must be assigned to machinePool [{}]",
                    pool.name
                ),
            ));
        }
        if !seen.insert(pool.name.as_str()) {
            return Err(Error::validation_for_field(
                &name,
                field,
                format!("duplicate machinePool name [{}] used", pool.name),
            ));
        }
        if pool.quantity.is_some_and(|q| q < 0) {
            return Err(Error::validation_for_field(
                &name,
                format!("{}.quantity", field),
                format!("machinePool [{}] quantity must not be negative", pool.name),
            ));
        }
    }
    Ok(())
}

/// Management cluster name assigned to a provisioning cluster
pub fn management_cluster_name(namespace: &str, name: &str) -> String {
    format!("c-m-{}", &deterministic_hash(&format!("{}/{}", namespace, name))[..8])
}

/// Name of the control plane produced for a cluster
pub fn control_plane_name(cluster: &Cluster) -> String {
    cluster.name_any()
}

/// Name of the node deployment produced for a pool
pub fn deployment_name(cluster: &str, pool: &str) -> String {
    safe_concat_name(&[cluster, pool])
}

/// Name of the cluster's bootstrap template
pub fn bootstrap_template_name(cluster: &str) -> String {
    safe_concat_name(&[cluster, "bootstrap", "template"])
}

fn reference_to<K: Resource<DynamicType = ()>>(name: &str, namespace: &str) -> ResourceRef {
    ResourceRef {
        namespace: Some(namespace.to_string()),
        ..ResourceRef::new(K::api_version(&()), K::kind(&()), name)
    }
}

fn meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(BTreeMap::new()),
        ..Default::default()
    }
}

/// Build the desired object tree for a validated cluster
///
/// Reads node configs, registered schemas and cloud credential secrets
/// from the store; a missing node config or credential is a transient
/// not-found so the cluster is retried once it appears.
pub async fn desired_objects(
    store: &dyn ObjectStore,
    cluster: &Cluster,
    management_name: &str,
) -> Result<Vec<DynamicObject>> {
    let Some(rke) = &cluster.spec.rke_config else {
        return Ok(Vec::new());
    };
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    let mut result = Vec::new();

    let infra_ref = match &rke.infrastructure_ref {
        Some(r) => r.clone(),
        None => {
            let mut infra = InfraCluster::new(
                &name,
                InfraClusterSpec {
                    cluster_name: name.clone(),
                },
            );
            infra.metadata = meta(&name, &namespace);
            result.push(typed::to_dynamic(&infra)?);
            reference_to::<InfraCluster>(&name, &namespace)
        }
    };

    let control_plane = control_plane(cluster, rke, management_name, infra_ref);
    result.push(typed::to_dynamic(&control_plane)?);

    if rke.machine_pools.is_empty() {
        return Ok(result);
    }

    let bootstrap_name = bootstrap_template_name(&name);
    let mut bootstrap = BootstrapTemplate::new(
        &bootstrap_name,
        BootstrapTemplateSpec {
            cluster_name: name.clone(),
        },
    );
    bootstrap.metadata = meta(&bootstrap_name, &namespace);
    result.push(typed::to_dynamic(&bootstrap)?);
    let bootstrap_ref = reference_to::<BootstrapTemplate>(&bootstrap_name, &namespace);

    let schemas = SchemaRegistry::new(store);
    for pool in &rke.machine_pools {
        // Scale-to-zero produces nothing, pruning the deployment and its machines
        if pool.quantity == Some(0) {
            continue;
        }
        let pool_name = deployment_name(&name, &pool.name);
        let Some(node_config) = &pool.node_config else {
            continue;
        };

        let infrastructure_ref = if in_machine_config_group(node_config) {
            let template =
                machine_template(store, &schemas, cluster, pool, node_config, &pool_name).await?;
            let types = template.types.clone().unwrap_or_default();
            result.push(template);
            ResourceRef {
                namespace: Some(namespace.clone()),
                ..ResourceRef::new(types.api_version, types.kind, &pool_name)
            }
        } else {
            node_config.clone()
        };

        let deployment = node_deployment(
            cluster,
            pool,
            &pool_name,
            bootstrap_ref.clone(),
            infrastructure_ref,
        )?;
        result.push(typed::to_dynamic(&deployment)?);
    }

    Ok(result)
}

fn control_plane(
    cluster: &Cluster,
    rke: &RkeConfig,
    management_name: &str,
    infra_ref: ResourceRef,
) -> ControlPlane {
    let name = control_plane_name(cluster);
    let namespace = cluster.namespace().unwrap_or_default();

    let mut global = rke.machine_global_config.clone();
    if let Some(networking) = &rke.networking {
        for (key, value) in networking.to_config() {
            global.entry(key).or_insert(value);
        }
    }

    let mut cp = ControlPlane::new(
        &name,
        ControlPlaneSpec {
            cluster_name: cluster.name_any(),
            management_cluster_name: management_name.to_string(),
            kubernetes_version: cluster.spec.kubernetes_version.clone().unwrap_or_default(),
            agent_env_vars: cluster.spec.agent_env_vars.clone(),
            machine_global_config: global,
            registries: rke.registries.clone(),
            etcd_snapshot_restore: rke.etcd_snapshot_restore.clone(),
            etcd_snapshot_create: rke.etcd_snapshot_create.clone(),
            infrastructure_ref: Some(infra_ref),
        },
    );
    cp.metadata = meta(&name, &namespace);
    cp
}

fn in_machine_config_group(node_config: &ResourceRef) -> bool {
    node_config.api_version.is_empty() || node_config.api_version == MACHINE_CONFIG_API_VERSION
}

/// `DigitaloceanConfig` → `DigitaloceanMachineTemplate`
pub fn machine_template_kind(config_kind: &str) -> String {
    format!(
        "{}MachineTemplate",
        config_kind.strip_suffix("Config").unwrap_or(config_kind)
    )
}

/// Split `namespace:name` (or bare `name`) into its parts
fn split_secret_name<'a>(value: &'a str, default_namespace: &'a str) -> (&'a str, &'a str) {
    match value.split_once(':') {
        Some((namespace, name)) => (namespace, name),
        None => (default_namespace, value),
    }
}

async fn machine_template(
    store: &dyn ObjectStore,
    schemas: &SchemaRegistry<'_>,
    cluster: &Cluster,
    pool: &MachinePool,
    node_config: &ResourceRef,
    name: &str,
) -> Result<DynamicObject> {
    let namespace = cluster.namespace().unwrap_or_default();
    let api_version = if node_config.api_version.is_empty() {
        MACHINE_CONFIG_API_VERSION
    } else {
        node_config.api_version.as_str()
    };
    let config_namespace = node_config.namespace.as_deref().unwrap_or(&namespace);

    let config = store
        .get(
            &build_api_resource(api_version, &node_config.kind),
            config_namespace,
            &node_config.name,
        )
        .await?
        .ok_or_else(|| {
            Error::not_found(
                &node_config.kind,
                format!("{}/{}", config_namespace, node_config.name),
            )
        })?;

    let mut data = schemas.prune(&node_config.kind, &config.data).await?;

    let mut common = serde_json::Map::new();
    if !pool.labels.is_empty() {
        common.insert("labels".into(), serde_json::to_value(&pool.labels)?);
    }
    if !pool.taints.is_empty() {
        common.insert("taints".into(), serde_json::to_value(&pool.taints)?);
    }

    let secret_name = pool
        .cloud_credential_secret_name
        .as_deref()
        .or(cluster.spec.cloud_credential_secret_name.as_deref())
        .filter(|s| !s.is_empty());
    if let Some(secret_name) = secret_name {
        let (secret_namespace, secret) = split_secret_name(secret_name, &namespace);
        if typed::get::<Secret>(store, secret_namespace, secret).await?.is_none() {
            return Err(Error::not_found(
                "Secret",
                format!("{}/{}", secret_namespace, secret),
            ));
        }
        common.insert(
            "cloudCredentialSecretName".into(),
            Value::String(secret_name.to_string()),
        );
    }
    data.insert("common".into(), Value::Object(common));

    let mut template = DynamicObject {
        types: Some(TypeMeta {
            api_version: MACHINE_TEMPLATE_API_VERSION.to_string(),
            kind: machine_template_kind(&node_config.kind),
        }),
        metadata: meta(name, &namespace),
        data: Value::Null,
    };
    template.data = serde_json::json!({
        "spec": { "template": { "spec": Value::Object(data) } }
    });
    Ok(template)
}

fn node_deployment(
    cluster: &Cluster,
    pool: &MachinePool,
    name: &str,
    bootstrap_template_ref: ResourceRef,
    infrastructure_ref: ResourceRef,
) -> Result<NodeDeployment> {
    let cluster_name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();

    let mut labels = BTreeMap::from([
        (CLUSTER_NAME_LABEL.to_string(), cluster_name.clone()),
        (DEPLOYMENT_NAME_LABEL.to_string(), name.to_string()),
    ]);
    for (enabled, label) in [
        (pool.etcd_role, ETCD_ROLE_LABEL),
        (pool.control_plane_role, CONTROL_PLANE_ROLE_LABEL),
        (pool.worker_role, WORKER_ROLE_LABEL),
    ] {
        if enabled {
            labels.insert(label.to_string(), "true".to_string());
        }
    }

    let mut annotations = BTreeMap::new();
    if !pool.labels.is_empty() {
        annotations.insert(
            LABELS_ANNOTATION.to_string(),
            serde_json::to_string(&pool.labels)?,
        );
    }
    if !pool.taints.is_empty() {
        annotations.insert(
            TAINTS_ANNOTATION.to_string(),
            serde_json::to_string(&pool.taints)?,
        );
    }

    let mut deployment = NodeDeployment::new(
        name,
        NodeDeploymentSpec {
            cluster_name: cluster_name.clone(),
            replicas: pool.replicas(),
            paused: pool.paused,
            strategy: pool.rolling_update.clone(),
            template: MachineTemplateSpec {
                labels,
                annotations,
                bootstrap_template_ref,
                infrastructure_ref,
            },
        },
    );
    let mut deployment_labels = pool.machine_deployment_labels.clone();
    deployment_labels.insert(CLUSTER_NAME_LABEL.to_string(), cluster_name);
    deployment.metadata = ObjectMeta {
        labels: Some(deployment_labels),
        annotations: (!pool.machine_deployment_annotations.is_empty())
            .then(|| pool.machine_deployment_annotations.clone()),
        ..meta(name, &namespace)
    };
    Ok(deployment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use trellis_common::crd::{ClusterSpec, EnvVar, Taint};
    use trellis_common::store::MemoryStore;

    fn pool(name: &str, etcd: bool, cp: bool, worker: bool) -> MachinePool {
        MachinePool {
            name: name.into(),
            etcd_role: etcd,
            control_plane_role: cp,
            worker_role: worker,
            quantity: Some(1),
            node_config: Some(ResourceRef::new(
                "",
                "DigitaloceanConfig",
                format!("nc-{}", name),
            )),
            ..Default::default()
        }
    }

    fn cluster(pools: Vec<MachinePool>) -> Cluster {
        let mut cluster = Cluster::new(
            "prod",
            ClusterSpec {
                kubernetes_version: Some("v1.30.4+rke2r1".into()),
                rke_config: Some(RkeConfig {
                    machine_pools: pools,
                    ..Default::default()
                }),
                agent_env_vars: vec![EnvVar {
                    name: "HTTP_PROXY".into(),
                    value: "http://proxy:3128".into(),
                }],
                ..Default::default()
            },
        );
        cluster.metadata.namespace = Some("default".into());
        cluster
    }

    async fn store_with_node_configs(names: &[&str]) -> MemoryStore {
        let store = MemoryStore::new();
        let api = build_api_resource(MACHINE_CONFIG_API_VERSION, "DigitaloceanConfig");
        for name in names {
            let mut config = DynamicObject::new(&format!("nc-{}", name), &api).within("default");
            config.data = serde_json::json!({"region": "nyc3", "size": "s-2vcpu-4gb"});
            store.create(&api, &config).await.unwrap();
        }
        store
    }

    fn kinds(objects: &[DynamicObject]) -> Vec<String> {
        objects
            .iter()
            .map(|o| o.types.as_ref().map(|t| t.kind.clone()).unwrap_or_default())
            .collect()
    }

    // ==========================================================================
    // Validation
    // ==========================================================================

    #[rstest]
    #[case::no_roles(vec![pool("a", false, false, false)], "at least one role")]
    #[case::duplicate(vec![pool("a", true, true, true), pool("a", false, false, true)], "duplicate machinePool")]
    #[case::no_name(vec![pool("", true, true, true)], "missing name or valid config")]
    #[case::no_config(vec![MachinePool { node_config: None, ..pool("a", true, true, true) }], "missing name or valid config")]
    fn test_invalid_pools_are_permanent(#[case] pools: Vec<MachinePool>, #[case] message: &str) {
        let err = validate(&cluster(pools)).unwrap_err();
        assert!(err.is_permanent());
        assert!(err.to_string().contains(message), "{}", err);
    }

    #[test]
    fn test_zero_quantity_pool_still_needs_a_role() {
        let mut empty = pool("a", false, false, false);
        empty.quantity = Some(0);
        assert!(validate(&cluster(vec![empty])).is_err());
    }

    #[test]
    fn test_missing_version_is_permanent() {
        let mut c = cluster(vec![pool("a", true, true, true)]);
        c.spec.kubernetes_version = None;
        let err = validate(&c).unwrap_err();
        assert!(err.is_permanent());
        assert!(err.to_string().contains("kubernetesVersion not set on default/prod"));
    }

    #[test]
    fn test_valid_cluster_passes() {
        let c = cluster(vec![pool("cp", true, true, false), pool("workers", false, false, true)]);
        assert!(validate(&c).is_ok());
    }

    // ==========================================================================
    // Desired tree
    // ==========================================================================

    #[tokio::test]
    async fn test_tree_for_single_pool() {
        let store = store_with_node_configs(&["a"]).await;
        let objects = desired_objects(&store, &cluster(vec![pool("a", true, true, true)]), "c-m-1")
            .await
            .unwrap();
        assert_eq!(
            kinds(&objects),
            vec![
                "InfraCluster",
                "ControlPlane",
                "BootstrapTemplate",
                "DigitaloceanMachineTemplate",
                "NodeDeployment"
            ]
        );
    }

    #[tokio::test]
    async fn test_tree_is_deterministic() {
        let store = store_with_node_configs(&["a", "b"]).await;
        let c = cluster(vec![pool("a", true, true, false), pool("b", false, false, true)]);
        let first = desired_objects(&store, &c, "c-m-1").await.unwrap();
        let second = desired_objects(&store, &c, "c-m-1").await.unwrap();
        assert_eq!(
            serde_json::to_value(&first).unwrap(),
            serde_json::to_value(&second).unwrap()
        );
    }

    #[tokio::test]
    async fn test_control_plane_copies_cluster_fields() {
        let store = store_with_node_configs(&["a"]).await;
        let objects = desired_objects(&store, &cluster(vec![pool("a", true, true, true)]), "c-m-1")
            .await
            .unwrap();
        let cp: ControlPlane = typed::from_dynamic(objects[1].clone()).unwrap();
        assert_eq!(cp.spec.management_cluster_name, "c-m-1");
        assert_eq!(cp.spec.agent_env_vars[0].name, "HTTP_PROXY");
        assert_eq!(cp.spec.infrastructure_ref.unwrap().kind, "InfraCluster");
    }

    #[tokio::test]
    async fn test_deployment_carries_roles_and_node_metadata() {
        let store = store_with_node_configs(&["a"]).await;
        let mut p = pool("a", true, false, true);
        p.quantity = Some(3);
        p.labels = BTreeMap::from([("tier".to_string(), "db".to_string())]);
        p.taints = vec![Taint {
            key: "dedicated".into(),
            value: "db".into(),
            effect: "NoSchedule".into(),
        }];
        let objects = desired_objects(&store, &cluster(vec![p]), "c-m-1").await.unwrap();

        let deployment: NodeDeployment = typed::from_dynamic(objects[4].clone()).unwrap();
        assert_eq!(deployment.name_any(), "prod-a");
        assert_eq!(deployment.spec.replicas, 3);
        let labels = &deployment.spec.template.labels;
        assert_eq!(labels[ETCD_ROLE_LABEL], "true");
        assert_eq!(labels[WORKER_ROLE_LABEL], "true");
        assert!(!labels.contains_key(CONTROL_PLANE_ROLE_LABEL));
        assert_eq!(
            deployment.spec.template.annotations[LABELS_ANNOTATION],
            r#"{"tier":"db"}"#
        );
        assert_eq!(
            deployment.spec.template.infrastructure_ref.kind,
            "DigitaloceanMachineTemplate"
        );
    }

    #[tokio::test]
    async fn test_zero_quantity_pool_produces_nothing() {
        let store = store_with_node_configs(&["a", "b"]).await;
        let mut zero = pool("b", false, false, true);
        zero.quantity = Some(0);
        let objects = desired_objects(&store, &cluster(vec![pool("a", true, true, true), zero]), "c-m-1")
            .await
            .unwrap();
        assert_eq!(kinds(&objects).iter().filter(|k| *k == "NodeDeployment").count(), 1);
    }

    #[tokio::test]
    async fn test_foreign_node_config_is_referenced_directly() {
        let store = MemoryStore::new();
        let mut p = pool("a", true, true, true);
        p.node_config = Some(ResourceRef::new(
            "infrastructure.cluster.x-k8s.io/v1beta1",
            "Metal3MachineTemplate",
            "metal",
        ));
        let objects = desired_objects(&store, &cluster(vec![p]), "c-m-1").await.unwrap();
        let deployment: NodeDeployment = typed::from_dynamic(objects[3].clone()).unwrap();
        assert_eq!(deployment.spec.template.infrastructure_ref.name, "metal");
    }

    #[tokio::test]
    async fn test_machine_template_injects_common_and_credentials() {
        let store = store_with_node_configs(&["a"]).await;
        let mut secret = Secret::default();
        secret.metadata.name = Some("do-creds".into());
        secret.metadata.namespace = Some("default".into());
        typed::create(&store, &secret).await.unwrap();

        let mut c = cluster(vec![pool("a", true, true, true)]);
        c.spec.cloud_credential_secret_name = Some("do-creds".into());
        let objects = desired_objects(&store, &c, "c-m-1").await.unwrap();

        let spec = &objects[3].data["spec"]["template"]["spec"];
        assert_eq!(spec["region"], "nyc3");
        assert_eq!(spec["common"]["cloudCredentialSecretName"], "do-creds");
        assert!(spec.get("metadata").is_none());
    }

    #[tokio::test]
    async fn test_missing_credential_secret_is_transient() {
        let store = store_with_node_configs(&["a"]).await;
        let mut c = cluster(vec![pool("a", true, true, true)]);
        c.spec.cloud_credential_secret_name = Some("missing".into());
        let err = desired_objects(&store, &c, "c-m-1").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_names() {
        assert_eq!(machine_template_kind("DigitaloceanConfig"), "DigitaloceanMachineTemplate");
        assert_eq!(machine_template_kind("Custom"), "CustomMachineTemplate");
        assert_eq!(bootstrap_template_name("prod"), "prod-bootstrap-template");
        assert!(management_cluster_name("default", "prod").starts_with("c-m-"));
        assert_eq!(management_cluster_name("default", "prod").len(), 12);
    }
}
