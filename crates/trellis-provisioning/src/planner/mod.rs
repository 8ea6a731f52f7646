//! Plan distribution
//!
//! The control plane cannot call into nodes. Work is published instead:
//! every machine has a plan secret its agent watches with credentials that
//! reach nothing else, and the planner writes the machine's desired plan
//! there whenever it differs from what is already published. The agent
//! applies the plan and reports the checksum it applied; only a report
//! for the currently published checksum counts as done.
//!
//! Rollout order follows the cluster's bootstrap needs:
//!
//! 1. The first etcd machine (by name) is elected init node, gets
//!    `cluster-init` and a `capture-address` instruction whose output
//!    yields the join URL.
//! 2. Other etcd and control plane machines wait for that join URL.
//! 3. Worker-only machines additionally wait until a control plane machine
//!    has applied its plan.

pub mod plan;
pub mod record;
pub mod registry;
pub mod runtime;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::core::ObjectMeta;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use trellis_common::condition::PROVISIONED;
use trellis_common::crd::{ClusterRegistrationToken, ControlPlane, Machine};
use trellis_common::labels::{CLUSTER_NAME_LABEL, INIT_NODE_LABEL, JOIN_URL_ANNOTATION};
use trellis_common::naming::{sha256_hex, safe_concat_name};
use trellis_common::store::{selector, typed, ObjectStore};
use trellis_common::{Error, Result, Settings};

use crate::bootstrap::{machine_roles, node_labels_and_taints, plan_secret_name};
use crate::context::{action_for_error, Context};
use crate::token::generate_token;
use plan::{Instruction, NodePlan, PlanFile};
use record::PlanRecord;
use registry::{registry_files, RegistryFiles};
use runtime::Runtime;

/// Key of the cluster join token in the state secret
pub const JOIN_TOKEN_KEY: &str = "serverToken";

/// Instruction installing the runtime
pub const INSTALL_INSTRUCTION: &str = "install";

/// Instruction whose saved output carries the etcd member list
pub const CAPTURE_ADDRESS_INSTRUCTION: &str = "capture-address";

/// Requeue interval while nodes are still applying plans
const PLANNING_REQUEUE: Duration = Duration::from_secs(15);

/// Per-cluster secret holding the join token
pub fn state_secret_name(control_plane: &str) -> String {
    safe_concat_name(&[control_plane, "rke", "state"])
}

/// Plan secret of a machine
pub fn machine_plan_secret(machine: &Machine) -> String {
    let request = &machine.spec.bootstrap.config_ref.name;
    if request.is_empty() {
        plan_secret_name(&machine.name_any())
    } else {
        plan_secret_name(request)
    }
}

/// Whether a machine was elected init node
pub fn is_init_node(machine: &Machine) -> bool {
    machine
        .labels()
        .get(INIT_NODE_LABEL)
        .is_some_and(|v| v == "true")
}

/// Everything a node plan is built from that is shared across machines
struct PlanInputs<'a> {
    control_plane: &'a ControlPlane,
    settings: &'a Settings,
    runtime: Runtime,
    join_token: &'a str,
    join_url: Option<&'a str>,
    registry: Option<&'a RegistryFiles>,
    agent_manifest: &'a str,
}

impl PlanInputs<'_> {
    /// Runtime configuration for one machine
    fn node_config(&self, machine: &Machine, is_init: bool) -> Result<BTreeMap<String, Value>> {
        let roles = machine_roles(machine);
        let server = roles.etcd || roles.control_plane;
        let mut config = self.control_plane.spec.machine_global_config.clone();

        config.insert("token".into(), Value::String(self.join_token.to_string()));
        if is_init {
            config.insert("cluster-init".into(), Value::Bool(true));
        } else if let Some(url) = self.join_url {
            config.insert("server".into(), Value::String(url.to_string()));
        }
        if !roles.etcd {
            config.insert("disable-etcd".into(), Value::Bool(true));
        }
        if !roles.control_plane {
            for key in ["disable-apiserver", "disable-controller-manager", "disable-scheduler"] {
                config.insert(key.into(), Value::Bool(true));
            }
        }

        let (labels, taints) = node_labels_and_taints(machine)?;
        if !labels.is_empty() {
            let labels: Vec<Value> = labels
                .iter()
                .map(|(k, v)| Value::String(format!("{}={}", k, v)))
                .collect();
            config.insert("node-label".into(), Value::Array(labels));
        }
        if !taints.is_empty() {
            let taints: Vec<Value> = taints.iter().map(|t| Value::String(t.to_arg())).collect();
            config.insert("node-taint".into(), Value::Array(taints));
        }
        if let Some(registry) = self.registry {
            config.insert(
                "private-registry".into(),
                Value::String(registry.config_path.clone()),
            );
        }

        config.retain(|key, value| !value.is_null() && (server || !Runtime::is_server_only_key(key)));
        Ok(config)
    }

    /// The full plan for one machine
    fn plan_for(&self, machine: &Machine, is_init: bool) -> Result<NodePlan> {
        let roles = machine_roles(machine);
        let server = roles.etcd || roles.control_plane;
        let config = serde_yaml::to_string(&self.node_config(machine, is_init)?)
            .map_err(|e| Error::serialization_for_kind("node config", e.to_string()))?;

        let mut files = vec![PlanFile::new(self.runtime.config_path(), config).with_permissions("0600")];
        if let Some(registry) = self.registry {
            files.extend(registry.files.iter().cloned());
        }
        if roles.control_plane {
            files.push(PlanFile::new(
                format!("{}/server/manifests/trellis-cluster-agent.yaml", self.runtime.data_dir()),
                self.agent_manifest,
            ));
        }

        // Any file change must restart the runtime, so the stamp covers them all
        let stamp = sha256_hex(
            files
                .iter()
                .map(|f| f.hash.as_str())
                .collect::<Vec<_>>()
                .join(",")
                .as_bytes(),
        );
        let version = &self.control_plane.spec.kubernetes_version;
        let prefix = self.runtime.install_env_prefix();
        let mut instructions = vec![Instruction {
            name: INSTALL_INSTRUCTION.to_string(),
            image: format!(
                "{}-{}:{}",
                self.settings.installer_image_prefix,
                self.runtime,
                version.replace('+', "-")
            ),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "run.sh".to_string()],
            env: vec![
                format!("{}_EXEC={}", prefix, if server { "server" } else { "agent" }),
                format!("{}_VERSION={}", prefix, version),
                format!("RESTART_STAMP={}", stamp),
            ],
            save_output: false,
        }];
        if is_init {
            let data = self.runtime.data_dir();
            instructions.push(Instruction {
                name: CAPTURE_ADDRESS_INSTRUCTION.to_string(),
                command: "sh".to_string(),
                args: vec![
                    "-c".to_string(),
                    format!(
                        "{data}/bin/etcdctl --cacert={data}/server/tls/etcd/server-ca.crt \
                         --cert={data}/server/tls/etcd/client.crt \
                         --key={data}/server/tls/etcd/client.key member list -w json",
                        data = data
                    ),
                ],
                save_output: true,
                ..Default::default()
            });
        }

        Ok(NodePlan {
            files,
            instructions,
        })
    }
}

/// Reconcile a control plane: publish plans and aggregate node completion
#[instrument(skip(control_plane, ctx), fields(control_plane = %control_plane.name_any()))]
pub async fn reconcile(control_plane: Arc<ControlPlane>, ctx: Arc<Context>) -> Result<Action> {
    if control_plane.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let store = ctx.store.as_ref();
    let namespace = control_plane.namespace().unwrap_or_default();
    let runtime = Runtime::for_version(&control_plane.spec.kubernetes_version);

    let mut machines = typed::list::<Machine>(
        store,
        &namespace,
        &selector(&[(CLUSTER_NAME_LABEL, &control_plane.spec.cluster_name)]),
    )
    .await?;
    machines.retain(|m| m.metadata.deletion_timestamp.is_none());
    machines.sort_by_key(|m| m.name_any());

    let mut status = control_plane.status.clone().unwrap_or_default();
    status.observed_generation = control_plane.metadata.generation;
    status.total_nodes = count_i32(machines.len());

    let Some(init) = elect_init_node(store, &machines).await? else {
        status.ready_nodes = 0;
        status.ready = false;
        if !PROVISIONED.is_true(&status) {
            PROVISIONED.set_false(&mut status, "Waiting", "waiting for an etcd machine");
        }
        write_status(store, &control_plane, status).await?;
        return Ok(Action::requeue(PLANNING_REQUEUE));
    };

    let join_token = ensure_join_token(store, &control_plane).await?;
    let join_url = init.annotations().get(JOIN_URL_ANNOTATION).cloned();
    let registry = match &control_plane.spec.registries {
        Some(registries) => Some(registry_files(store, &namespace, runtime, registries).await?),
        None => None,
    };
    let agent_manifest = cluster_agent_manifest(store, &ctx.settings, &control_plane).await?;

    let inputs = PlanInputs {
        control_plane: &control_plane,
        settings: &ctx.settings,
        runtime,
        join_token: &join_token,
        join_url: join_url.as_deref(),
        registry: registry.as_ref(),
        agent_manifest: &agent_manifest,
    };

    let mut entries = Vec::with_capacity(machines.len());
    for machine in &machines {
        let secret = typed::get::<Secret>(store, &namespace, &machine_plan_secret(machine)).await?;
        let record = match secret.as_ref().map(PlanRecord::from_secret).transpose() {
            Ok(record) => record.unwrap_or_default(),
            Err(e) => {
                warn!(machine = %machine.name_any(), error = %e, "unreadable plan record, treating as not done");
                PlanRecord::default()
            }
        };
        entries.push((machine, secret, record));
    }
    let control_plane_done = entries
        .iter()
        .any(|(m, _, r)| machine_roles(m).control_plane && r.is_done());

    let mut done = 0usize;
    let mut servers_done = true;
    for (machine, secret, record) in entries {
        let roles = machine_roles(machine);
        let server = roles.etcd || roles.control_plane;
        let is_init = machine.name_any() == init.name_any();

        let Some(mut secret) = secret else {
            debug!(machine = %machine.name_any(), "plan secret not created yet");
            servers_done &= !server;
            continue;
        };
        let gate = if is_init {
            None
        } else if join_url.is_none() {
            Some("waiting for the init node to report its join URL")
        } else if !server && !control_plane_done {
            Some("waiting for a control plane node")
        } else {
            None
        };
        if let Some(reason) = gate {
            debug!(machine = %machine.name_any(), reason, "plan held back");
            servers_done &= !server;
            continue;
        }

        let plan = inputs.plan_for(machine, is_init)?;
        if record::publish(&mut secret, &plan)? {
            typed::replace(store, &secret).await?;
            info!(machine = %machine.name_any(), checksum = %plan.checksum()?, "published plan");
            servers_done &= !server;
        } else if record.is_done() {
            done += 1;
        } else {
            servers_done &= !server;
        }
    }

    status.ready_nodes = count_i32(done);
    status.ready = !machines.is_empty() && done == machines.len();
    if !PROVISIONED.is_true(&status) {
        if join_url.is_some() && servers_done {
            info!("control plane provisioned");
            PROVISIONED.set_true(&mut status, "Provisioned");
        } else {
            PROVISIONED.set_false(
                &mut status,
                "Provisioning",
                "waiting for etcd and control plane nodes to apply their plans",
            );
        }
    }
    let ready = status.ready;
    write_status(store, &control_plane, status).await?;

    Ok(if ready {
        Action::await_change()
    } else {
        Action::requeue(PLANNING_REQUEUE)
    })
}

/// Decide what to do after a failed reconciliation
pub fn error_policy(control_plane: Arc<ControlPlane>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(control_plane = %control_plane.name_any(), ?error, "plan distribution failed");
    action_for_error(error)
}

fn count_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

async fn write_status(
    store: &dyn ObjectStore,
    control_plane: &ControlPlane,
    status: trellis_common::crd::ControlPlaneStatus,
) -> Result<()> {
    if control_plane.status.as_ref() == Some(&status) {
        return Ok(());
    }
    let mut updated = control_plane.clone();
    updated.status = Some(status);
    typed::replace_status(store, &updated).await?;
    Ok(())
}

/// The machine that initializes etcd, electing one if none is recorded
///
/// Once labelled the choice is stable; otherwise the first etcd machine by
/// name wins.
pub async fn elect_init_node(store: &dyn ObjectStore, machines: &[Machine]) -> Result<Option<Machine>> {
    if let Some(init) = machines.iter().find(|m| is_init_node(m)) {
        return Ok(Some(init.clone()));
    }
    let Some(candidate) = machines.iter().find(|m| machine_roles(m).etcd) else {
        return Ok(None);
    };
    let mut labelled = candidate.clone();
    labelled
        .labels_mut()
        .insert(INIT_NODE_LABEL.to_string(), "true".to_string());
    let labelled = typed::replace(store, &labelled).await?;
    info!(machine = %labelled.name_any(), "elected init node");
    Ok(Some(labelled))
}

/// Get-or-create the token nodes join the cluster with
pub async fn ensure_join_token(store: &dyn ObjectStore, control_plane: &ControlPlane) -> Result<String> {
    let namespace = control_plane.namespace().unwrap_or_default();
    let name = state_secret_name(&control_plane.name_any());

    let existing = typed::get::<Secret>(store, &namespace, &name).await?;
    if let Some(token) = existing
        .as_ref()
        .and_then(|s| s.data.as_ref())
        .and_then(|d| d.get(JOIN_TOKEN_KEY))
        .filter(|t| !t.0.is_empty())
    {
        return String::from_utf8(token.0.clone())
            .map_err(|_| Error::internal_with_context("planner", "join token is not valid UTF-8"));
    }

    let token = generate_token(32)?;
    let data = BTreeMap::from([(
        JOIN_TOKEN_KEY.to_string(),
        ByteString(token.clone().into_bytes()),
    )]);
    match existing {
        Some(mut secret) => {
            secret.data.get_or_insert_with(BTreeMap::new).extend(data);
            typed::replace(store, &secret).await?;
        }
        None => {
            let secret = Secret {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    namespace: Some(namespace.clone()),
                    labels: Some(BTreeMap::from([(
                        CLUSTER_NAME_LABEL.to_string(),
                        control_plane.spec.cluster_name.clone(),
                    )])),
                    owner_references: control_plane.controller_owner_ref(&()).map(|o| vec![o]),
                    ..Default::default()
                },
                data: Some(data),
                ..Default::default()
            };
            if let Err(e) = typed::create(store, &secret).await {
                if e.is_already_exists() {
                    return Err(Error::conflict("Secret", format!("{}/{}", namespace, name)));
                }
                return Err(e);
            }
        }
    }
    info!(secret = %name, "created cluster join token");
    Ok(token)
}

/// Manifest deploying the cluster agent credentials onto control plane nodes
async fn cluster_agent_manifest(
    store: &dyn ObjectStore,
    settings: &Settings,
    control_plane: &ControlPlane,
) -> Result<String> {
    let namespace = control_plane.namespace().unwrap_or_default();
    let mut tokens = typed::list::<ClusterRegistrationToken>(
        store,
        &namespace,
        &selector(&[(CLUSTER_NAME_LABEL, &control_plane.spec.cluster_name)]),
    )
    .await?;
    tokens.sort_by_key(|t| t.name_any());
    let token = tokens
        .into_iter()
        .find_map(|t| t.status.and_then(|s| s.token))
        .ok_or_else(|| {
            Error::not_found(
                "ClusterRegistrationToken",
                format!("{}/{}", namespace, control_plane.spec.cluster_name),
            )
        })?;

    let secret = Secret {
        metadata: ObjectMeta {
            name: Some("trellis-cluster-agent".to_string()),
            namespace: Some(settings.system_namespace.clone()),
            ..Default::default()
        },
        string_data: Some(BTreeMap::from([
            ("url".to_string(), settings.server_url().to_string()),
            ("token".to_string(), token),
            ("ca-checksum".to_string(), settings.ca_checksum()),
        ])),
        ..Default::default()
    };
    serde_yaml::to_string(&secret)
        .map_err(|e| Error::serialization_for_kind("Secret", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use trellis_common::crd::{
        ClusterRegistrationTokenSpec, ClusterRegistrationTokenStatus, ControlPlaneSpec,
        MachineBootstrap, MachineSpec, ResourceRef,
    };
    use trellis_common::labels::{
        CONTROL_PLANE_ROLE_LABEL, ETCD_ROLE_LABEL, PLAN_SECRET_TYPE, WORKER_ROLE_LABEL,
    };
    use trellis_common::store::MemoryStore;

    use record::{APPLIED_CHECKSUM_KEY, PLAN_CHECKSUM_KEY};

    const SERVER: &[&str] = &[ETCD_ROLE_LABEL, CONTROL_PLANE_ROLE_LABEL];
    const ALL_ROLES: &[&str] = &[ETCD_ROLE_LABEL, CONTROL_PLANE_ROLE_LABEL, WORKER_ROLE_LABEL];
    const WORKER: &[&str] = &[WORKER_ROLE_LABEL];
    const ETCD: &[&str] = &[ETCD_ROLE_LABEL];

    async fn setup(machines: &[(&str, &[&str])]) -> (Arc<MemoryStore>, Arc<Context>) {
        let store = Arc::new(MemoryStore::new());

        let mut cp = ControlPlane::new(
            "prod",
            ControlPlaneSpec {
                cluster_name: "prod".into(),
                kubernetes_version: "v1.30.4+rke2r1".into(),
                machine_global_config: BTreeMap::from([(
                    "cluster-cidr".to_string(),
                    Value::String("10.42.0.0/16".into()),
                )]),
                ..Default::default()
            },
        );
        cp.metadata.namespace = Some("default".into());
        typed::create(store.as_ref(), &cp).await.unwrap();

        let mut token = ClusterRegistrationToken::new(
            "prod-registration",
            ClusterRegistrationTokenSpec {
                cluster_name: "prod".into(),
            },
        );
        token.metadata.namespace = Some("default".into());
        token.metadata.labels = Some(BTreeMap::from([(
            CLUSTER_NAME_LABEL.to_string(),
            "prod".to_string(),
        )]));
        let mut token = typed::create(store.as_ref(), &token).await.unwrap();
        token.status = Some(ClusterRegistrationTokenStatus {
            token: Some("registration-token".into()),
        });
        typed::replace_status(store.as_ref(), &token).await.unwrap();

        for (name, roles) in machines {
            let mut labels = BTreeMap::from([(CLUSTER_NAME_LABEL.to_string(), "prod".to_string())]);
            for role in roles.iter() {
                labels.insert(role.to_string(), "true".to_string());
            }
            let mut machine = Machine::new(
                name,
                MachineSpec {
                    cluster_name: "prod".into(),
                    bootstrap: MachineBootstrap {
                        config_ref: ResourceRef::new("rke.trellis.dev/v1", "BootstrapRequest", *name),
                    },
                    ..Default::default()
                },
            );
            machine.metadata.namespace = Some("default".into());
            machine.metadata.labels = Some(labels);
            typed::create(store.as_ref(), &machine).await.unwrap();

            let mut secret = Secret {
                type_: Some(PLAN_SECRET_TYPE.to_string()),
                ..Default::default()
            };
            secret.metadata.name = Some(plan_secret_name(name));
            secret.metadata.namespace = Some("default".into());
            typed::create(store.as_ref(), &secret).await.unwrap();
        }

        let ctx = Arc::new(Context::new(store.clone(), Settings::default()));
        (store, ctx)
    }

    async fn control_plane(store: &MemoryStore) -> Arc<ControlPlane> {
        Arc::new(
            typed::get::<ControlPlane>(store, "default", "prod")
                .await
                .unwrap()
                .unwrap(),
        )
    }

    async fn plan_secret(store: &MemoryStore, machine: &str) -> Secret {
        typed::get::<Secret>(store, "default", &plan_secret_name(machine))
            .await
            .unwrap()
            .unwrap()
    }

    async fn published(store: &MemoryStore, machine: &str) -> Option<NodePlan> {
        record::published_plan(&plan_secret(store, machine).await).unwrap()
    }

    fn config_of(plan: &NodePlan) -> serde_yaml::Value {
        let file = plan
            .file("/etc/rancher/rke2/config.yaml.d/50-trellis.yaml")
            .unwrap();
        serde_yaml::from_slice(&STANDARD.decode(&file.content).unwrap()).unwrap()
    }

    /// Stand in for the node agent reporting the published plan as applied
    async fn apply_plan(store: &MemoryStore, machine: &str) {
        let mut secret = plan_secret(store, machine).await;
        let data = secret.data.get_or_insert_with(BTreeMap::new);
        let checksum = data[PLAN_CHECKSUM_KEY].clone();
        data.insert(APPLIED_CHECKSUM_KEY.to_string(), checksum);
        typed::replace(store, &secret).await.unwrap();
    }

    async fn set_join_url(store: &MemoryStore, machine: &str, url: &str) {
        let mut m = typed::get::<Machine>(store, "default", machine)
            .await
            .unwrap()
            .unwrap();
        m.annotations_mut()
            .insert(JOIN_URL_ANNOTATION.to_string(), url.to_string());
        typed::replace(store, &m).await.unwrap();
    }

    // ==========================================================================
    // Story Tests: Plan rollout order
    // ==========================================================================

    /// Story: the first etcd machine initializes the cluster, the rest wait
    #[tokio::test]
    async fn story_init_node_goes_first() {
        let (store, ctx) = setup(&[("m-a", SERVER), ("m-b", SERVER), ("m-w", WORKER)]).await;
        reconcile(control_plane(&store).await, ctx.clone()).await.unwrap();

        let init = typed::get::<Machine>(store.as_ref(), "default", "m-a")
            .await
            .unwrap()
            .unwrap();
        assert!(is_init_node(&init));

        let plan = published(&store, "m-a").await.unwrap();
        let config = config_of(&plan);
        assert_eq!(config["cluster-init"].as_bool(), Some(true));
        assert_eq!(config["cluster-cidr"].as_str(), Some("10.42.0.0/16"));
        assert!(config["token"].as_str().is_some());
        let names: Vec<&str> = plan.instructions.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec![INSTALL_INSTRUCTION, CAPTURE_ADDRESS_INSTRUCTION]);
        assert!(plan.instructions[1].save_output);
        assert!(plan
            .file("/var/lib/rancher/rke2/server/manifests/trellis-cluster-agent.yaml")
            .is_some());

        assert!(published(&store, "m-b").await.is_none());
        assert!(published(&store, "m-w").await.is_none());

        let status = control_plane(&store).await.status.clone().unwrap();
        assert!(PROVISIONED.is_false(&status));
        assert_eq!(status.total_nodes, 3);
    }

    /// Story: joiners get the captured URL, workers wait for a control plane node
    #[tokio::test]
    async fn story_joiners_follow_the_join_url() {
        let (store, ctx) = setup(&[("m-a", SERVER), ("m-b", SERVER), ("m-w", WORKER)]).await;
        reconcile(control_plane(&store).await, ctx.clone()).await.unwrap();
        set_join_url(&store, "m-a", "https://10.0.0.5:9345").await;

        reconcile(control_plane(&store).await, ctx.clone()).await.unwrap();
        let joiner = config_of(&published(&store, "m-b").await.unwrap());
        assert_eq!(joiner["server"].as_str(), Some("https://10.0.0.5:9345"));
        assert!(joiner.get("cluster-init").is_none());
        assert!(published(&store, "m-w").await.is_none());

        // Once a control plane node is done the worker is released
        apply_plan(&store, "m-a").await;
        reconcile(control_plane(&store).await, ctx.clone()).await.unwrap();
        let worker_plan = published(&store, "m-w").await.unwrap();
        let worker = config_of(&worker_plan);
        assert_eq!(worker["server"].as_str(), Some("https://10.0.0.5:9345"));
        assert!(worker.get("cluster-cidr").is_none());
        assert!(worker.get("disable-etcd").is_none());
        assert!(worker_plan.instructions[0]
            .env
            .contains(&"INSTALL_RKE2_EXEC=agent".to_string()));
    }

    /// Story: all nodes done marks the control plane provisioned and ready
    #[tokio::test]
    async fn story_all_nodes_done_provisions() {
        let (store, ctx) = setup(&[("m-a", ALL_ROLES)]).await;
        reconcile(control_plane(&store).await, ctx.clone()).await.unwrap();
        set_join_url(&store, "m-a", "https://10.0.0.5:9345").await;
        apply_plan(&store, "m-a").await;

        let action = reconcile(control_plane(&store).await, ctx.clone()).await.unwrap();
        assert_eq!(action, Action::await_change());
        let status = control_plane(&store).await.status.clone().unwrap();
        assert!(PROVISIONED.is_true(&status));
        assert!(status.ready);
        assert_eq!(status.ready_nodes, 1);

        // Nothing changed: no plan republished, no status rewritten
        let writes = store.writes();
        reconcile(control_plane(&store).await, ctx).await.unwrap();
        assert_eq!(store.writes(), writes);
    }

    #[tokio::test]
    async fn test_no_etcd_machine_waits() {
        let (store, ctx) = setup(&[("m-w", WORKER)]).await;
        let action = reconcile(control_plane(&store).await, ctx).await.unwrap();
        assert_eq!(action, Action::requeue(PLANNING_REQUEUE));
        let status = control_plane(&store).await.status.clone().unwrap();
        assert_eq!(PROVISIONED.message(&status), "waiting for an etcd machine");
    }

    #[tokio::test]
    async fn test_join_token_is_stable() {
        let (store, _) = setup(&[]).await;
        let cp = control_plane(&store).await;
        let first = ensure_join_token(store.as_ref(), &cp).await.unwrap();
        let second = ensure_join_token(store.as_ref(), &cp).await.unwrap();
        assert_eq!(first, second);
        assert!(typed::get::<Secret>(store.as_ref(), "default", "prod-rke-state")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_missing_registration_token_is_transient() {
        let (store, ctx) = setup(&[("m-a", ETCD)]).await;
        typed::delete::<ClusterRegistrationToken>(store.as_ref(), "default", "prod-registration")
            .await
            .unwrap();
        let err = reconcile(control_plane(&store).await, ctx).await.unwrap_err();
        assert!(err.is_not_found());
    }
}
