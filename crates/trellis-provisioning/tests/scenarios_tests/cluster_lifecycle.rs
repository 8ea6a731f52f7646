//! Scenarios for a cluster going from an empty spec to a ready control plane
//!
//! These tests follow one provisioning cluster through pool expansion,
//! plan rollout and completion the way the operator's controllers would
//! see it.

use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::Role;
use kube::ResourceExt;
use serde_json::Value;

use trellis_common::condition::{PROVISIONED, READY};
use trellis_common::crd::{BootstrapRequest, ControlPlane, Machine, MachinePhase, NodeDeployment};
use trellis_common::labels::{JOIN_URL_ANNOTATION, WORKER_ROLE_LABEL};
use trellis_common::store::typed;
use trellis_provisioning::bootstrap::plan_secret_name;
use trellis_provisioning::planner::is_init_node;
use trellis_provisioning::planner::record::PlanRecord;

use super::helpers::{server_pool, worker_pool, Harness, MEMBER_LIST, NAMESPACE};

fn config_of(plan: &trellis_provisioning::planner::plan::NodePlan) -> serde_yaml::Value {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    let file = plan
        .file("/etc/rancher/rke2/config.yaml.d/50-trellis.yaml")
        .unwrap();
    serde_yaml::from_slice(&STANDARD.decode(&file.content).unwrap()).unwrap()
}

/// Bring a cluster with one server and `workers` workers to ready
async fn provision(workers: i32) -> Harness {
    let harness = Harness::new(vec![server_pool("cp", 1), worker_pool("workers", workers)]).await;
    harness.converge().await;

    let init = harness
        .machines()
        .await
        .into_iter()
        .find(is_init_node)
        .unwrap();
    harness.apply_plan(&init, Some(MEMBER_LIST)).await;
    harness.converge().await;

    for machine in harness.machines().await {
        if machine_is_worker(&machine) {
            harness.apply_plan(&machine, None).await;
        }
    }
    harness.converge().await;
    harness.converge().await;
    harness
}

fn machine_is_worker(machine: &Machine) -> bool {
    machine.labels().get(WORKER_ROLE_LABEL).is_some_and(|v| v == "true")
}

// =============================================================================
// Provisioning Stories
// =============================================================================

/// Story: pools expand into machines, the init node goes first, workers
/// follow its join URL, and the cluster ends ready with a kubeconfig
#[tokio::test]
async fn story_cluster_provisions_end_to_end() {
    let harness = Harness::new(vec![server_pool("cp", 1), worker_pool("workers", 2)]).await;
    harness.converge().await;

    let machines = harness.machines().await;
    assert_eq!(machines.len(), 3);
    let init: Vec<&Machine> = machines.iter().filter(|m| is_init_node(m)).collect();
    assert_eq!(init.len(), 1);
    let init = init[0].clone();
    assert!(!machine_is_worker(&init));

    // Only the init node has a plan until the join URL is known
    let init_plan = harness.published(&init).await.unwrap();
    assert_eq!(config_of(&init_plan)["cluster-init"], serde_yaml::Value::Bool(true));
    for worker in machines.iter().filter(|m| machine_is_worker(m)) {
        assert!(harness.published(worker).await.is_none());
        let status = worker.status.clone().unwrap_or_default();
        assert!(status.bootstrap_ready);
        assert_eq!(status.phase, MachinePhase::Provisioning);
    }
    assert!(!harness.cluster().await.status.unwrap().ready);

    // The init node reports its etcd member list
    harness.apply_plan(&init, Some(MEMBER_LIST)).await;
    harness.converge().await;

    let init = harness.machine(&init.name_any()).await;
    assert_eq!(init.annotations()[JOIN_URL_ANNOTATION], "https://10.0.0.5:9345");
    assert_eq!(init.status.clone().unwrap().phase, MachinePhase::Running);
    assert!(PROVISIONED.is_true(harness.control_plane().await.status.as_ref().unwrap()));

    for worker in harness.machines().await.iter().filter(|m| machine_is_worker(m)) {
        let plan = harness.published(worker).await.unwrap();
        let config = config_of(&plan);
        assert_eq!(config["server"], serde_yaml::Value::from("https://10.0.0.5:9345"));
        assert!(config.get("cluster-init").is_none());
        // Server-only keys never reach agents
        assert!(config.get("disable-etcd").is_none());
        assert!(config.get("token").is_some());
        harness.apply_plan(worker, None).await;
    }
    harness.converge().await;
    harness.converge().await;

    let cp = harness.control_plane().await.status.unwrap();
    assert!(cp.ready);
    assert_eq!(cp.ready_nodes, 3);
    assert_eq!(cp.total_nodes, 3);

    let status = harness.cluster().await.status.unwrap();
    assert!(status.ready);
    assert!(READY.is_true(&status));
    assert_eq!(status.client_secret_name.as_deref(), Some("prod-kubeconfig"));
    for machine in harness.machines().await {
        assert_eq!(machine.status.unwrap().phase, MachinePhase::Running);
    }
}

/// Story: once converged, another pass of every controller writes nothing
#[tokio::test]
async fn story_converged_cluster_is_idempotent() {
    let harness = provision(2).await;
    assert!(harness.cluster().await.status.unwrap().ready);

    let writes = harness.store().writes();
    harness.converge().await;
    assert_eq!(harness.store().writes(), writes);
}

/// Story: a changed plan is not done until the agent applies that exact plan
#[tokio::test]
async fn story_plan_change_requires_fresh_apply() {
    let harness = provision(1).await;
    let before: Vec<String> = {
        let mut sums = Vec::new();
        for machine in harness.machines().await {
            sums.push(PlanRecord::from_secret(&harness.plan_secret(&machine).await).unwrap().plan_checksum);
        }
        sums
    };

    let mut cluster = harness.cluster().await;
    if let Some(rke) = cluster.spec.rke_config.as_mut() {
        rke.machine_global_config
            .insert("profile".into(), Value::String("cis".into()));
    }
    typed::replace(harness.store(), &cluster).await.unwrap();
    harness.converge().await;

    let mut after = Vec::new();
    for machine in harness.machines().await {
        let record = PlanRecord::from_secret(&harness.plan_secret(&machine).await).unwrap();
        assert!(!record.is_done());
        after.push(record.plan_checksum);
    }
    assert!(before.iter().zip(&after).all(|(b, a)| b != a));

    let cp = harness.control_plane().await.status.unwrap();
    assert!(!cp.ready);
    assert_eq!(cp.ready_nodes, 0);
    // Provisioned is sticky across plan changes
    assert!(PROVISIONED.is_true(&cp));

    // Every node still reporting the old plan is working again, not done
    for machine in harness.machines().await {
        let status = machine.status.unwrap();
        assert_eq!(status.phase, MachinePhase::Provisioning);
        assert!(PROVISIONED.is_false(&status));
        assert_eq!(PROVISIONED.reason(&status), "Applying");
    }

    for machine in harness.machines().await {
        harness.apply_plan(&machine, None).await;
    }
    harness.converge().await;
    assert!(harness.control_plane().await.status.unwrap().ready);

    let mut completed = Vec::new();
    for machine in harness.machines().await {
        let status = machine.status.unwrap();
        assert_eq!(status.phase, MachinePhase::Running);
        let provisioned = PROVISIONED.get(&status).unwrap().clone();
        assert_eq!(provisioned.reason, "PlanApplied");
        completed.push(provisioned);
    }

    // The fresh report completes each node exactly once
    harness.converge().await;
    let writes = harness.store().writes();
    harness.converge().await;
    assert_eq!(harness.store().writes(), writes);
    for (machine, before) in harness.machines().await.into_iter().zip(&completed) {
        let status = machine.status.unwrap();
        assert_eq!(PROVISIONED.get(&status), Some(before));
    }
}

/// Story: scaling a pool up adds machines with their own identity and plan record
#[tokio::test]
async fn story_scale_up_adds_scoped_machines() {
    let harness = provision(1).await;
    harness
        .set_pools(vec![server_pool("cp", 1), worker_pool("workers", 3)])
        .await;
    harness.converge().await;

    let machines = harness.machines().await;
    assert_eq!(machines.len(), 4);
    assert_eq!(
        harness.store().count(&typed::api_resource::<BootstrapRequest>()).await,
        4
    );
    // Each machine has one bootstrap account and one plan account
    assert_eq!(
        harness.store().count(&typed::api_resource::<ServiceAccount>()).await,
        8
    );
    assert_eq!(harness.store().count(&typed::api_resource::<Role>()).await, 4);

    let mut pending = 0;
    for machine in &machines {
        let secret = typed::get::<Secret>(
            harness.store(),
            NAMESPACE,
            &plan_secret_name(&machine.spec.bootstrap.config_ref.name),
        )
        .await
        .unwrap()
        .unwrap();
        let record = PlanRecord::from_secret(&secret).unwrap();
        assert!(record.is_published());
        if !record.is_done() {
            pending += 1;
        }
    }
    assert_eq!(pending, 2);

    let cp = harness.control_plane().await.status.unwrap();
    assert!(!cp.ready);
    assert_eq!(cp.ready_nodes, 2);
    assert_eq!(cp.total_nodes, 4);
}

/// Story: a pool without roles is rejected before anything is created
#[tokio::test]
async fn story_invalid_pool_creates_nothing() {
    let mut pool = worker_pool("workers", 2);
    pool.worker_role = false;
    let harness = Harness::new(vec![server_pool("cp", 1), pool]).await;

    let err = harness.reconcile_cluster().await.unwrap_err();
    assert!(err.is_permanent());

    let status = harness.cluster().await.status.unwrap();
    assert!(!status.ready);
    assert!(!READY.is_true(&status));
    for count in [
        harness.store().count(&typed::api_resource::<ControlPlane>()).await,
        harness.store().count(&typed::api_resource::<NodeDeployment>()).await,
        harness.store().count(&typed::api_resource::<Machine>()).await,
    ] {
        assert_eq!(count, 0);
    }
}
