//! Node deployment controller
//!
//! Expands a [`NodeDeployment`] into one [`Machine`] and one
//! [`BootstrapRequest`] per replica. Machine names are
//! `<deployment>-<templatehash>-<index>`, so an unchanged template keeps
//! producing the same names and re-applying the set is a no-op.
//!
//! A template change starts a rolling update. Machines built from an older
//! template are retained (not recreated) and replaced at most `maxSurge` at
//! a time, removing an old machine only once enough new ones are running to
//! honor `maxUnavailable`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::core::DynamicObject;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};
use trellis_common::crd::{
    BootstrapRequest, BootstrapRequestSpec, Machine, MachineBootstrap, MachinePhase, MachineSpec,
    NodeDeployment, NodeDeploymentStatus, ResourceRef, RollingUpdate,
};
use trellis_common::labels::{DEPLOYMENT_NAME_LABEL, TEMPLATE_HASH_LABEL};
use trellis_common::naming::{deterministic_hash, safe_concat_name};
use trellis_common::store::{selector, typed};
use trellis_common::{Error, Result};

use crate::apply::{ObjectIdentity, OwnerKey};
use crate::context::{action_for_error, Context};

/// Apply set holding a deployment's machines and bootstrap requests
pub const APPLY_SET: &str = "machines";

/// Requeue interval while a rollout is in progress
const ROLLOUT_REQUEUE: Duration = Duration::from_secs(10);

/// Hash of a deployment's machine template, 5 characters
pub fn template_hash(deployment: &NodeDeployment) -> Result<String> {
    let encoded = serde_json::to_string(&deployment.spec.template)?;
    Ok(deterministic_hash(&encoded)[..5].to_string())
}

/// Machine name for replica `index` of a template
pub fn machine_name(deployment: &str, hash: &str, index: usize) -> String {
    safe_concat_name(&[deployment, hash, &index.to_string()])
}

/// Resolve an int-or-percent rollout bound against the replica count
fn resolve_bound(value: Option<&IntOrString>, replicas: usize, default: usize, round_up: bool) -> usize {
    match value {
        None => default,
        Some(IntOrString::Int(n)) => usize::try_from(*n).unwrap_or(0),
        Some(IntOrString::String(s)) => {
            let percent = s
                .trim()
                .trim_end_matches('%')
                .parse::<usize>()
                .unwrap_or(0);
            let scaled = percent.saturating_mul(replicas);
            if round_up {
                scaled.div_ceil(100)
            } else {
                scaled / 100
            }
        }
    }
}

/// How many machines of each template generation to keep
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RolloutPlan {
    /// Machines from the current template, indices `0..current`
    pub current: usize,
    /// Old-template machines to keep for availability
    pub retained: usize,
}

impl RolloutPlan {
    /// Plan the next rollout step
    ///
    /// `old` machines run an outdated template; `ready_current` of the
    /// current-template machines are running. Surge and unavailability
    /// default to 1 and 0; both zero would stall, so surge is raised to 1.
    pub fn compute(
        replicas: usize,
        strategy: Option<&RollingUpdate>,
        old: usize,
        ready_current: usize,
    ) -> Self {
        let mut surge = resolve_bound(strategy.and_then(|s| s.max_surge.as_ref()), replicas, 1, true);
        let unavailable = resolve_bound(
            strategy.and_then(|s| s.max_unavailable.as_ref()),
            replicas,
            0,
            false,
        );
        if surge == 0 && unavailable == 0 {
            surge = 1;
        }

        let min_available = replicas.saturating_sub(unavailable);
        let retained = old.min(min_available.saturating_sub(ready_current));
        let current = replicas.min(replicas.saturating_add(surge).saturating_sub(retained));
        Self { current, retained }
    }

    /// Whether old machines remain or new ones are still missing
    pub fn in_progress(&self, replicas: usize) -> bool {
        self.retained > 0 || self.current < replicas
    }
}

/// Reconcile a node deployment
#[instrument(skip(deployment, ctx), fields(deployment = %deployment.name_any()))]
pub async fn reconcile(deployment: Arc<NodeDeployment>, ctx: Arc<Context>) -> Result<Action> {
    if deployment.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    if deployment.spec.paused {
        debug!("deployment paused");
        return Ok(Action::await_change());
    }

    let store = ctx.store.as_ref();
    let name = deployment.name_any();
    let namespace = deployment.namespace().unwrap_or_default();
    let replicas = usize::try_from(deployment.spec.replicas).unwrap_or(0);
    let hash = template_hash(&deployment)?;

    let machines = typed::list::<Machine>(
        store,
        &namespace,
        &selector(&[(DEPLOYMENT_NAME_LABEL, &name)]),
    )
    .await?;
    let (current, mut old): (Vec<_>, Vec<_>) = machines
        .iter()
        .partition(|m| m.labels().get(TEMPLATE_HASH_LABEL) == Some(&hash));
    old.retain(|m| m.metadata.deletion_timestamp.is_none());
    old.sort_by_key(|m| m.name_any());

    let ready_current = current.iter().filter(|m| is_running(m)).count();
    let plan = RolloutPlan::compute(
        replicas,
        deployment.spec.strategy.as_ref(),
        old.len(),
        ready_current,
    );

    let mut desired = Vec::with_capacity(plan.current * 2);
    for index in 0..plan.current {
        let (machine, request) = machine_objects(&deployment, &hash, index)?;
        desired.push(machine);
        desired.push(request);
    }
    let retain: BTreeSet<ObjectIdentity> = old
        .iter()
        .take(plan.retained)
        .flat_map(|m| {
            let machine = m.name_any();
            [
                ObjectIdentity::new(
                    Machine::api_version(&()),
                    Machine::kind(&()),
                    &namespace,
                    &machine,
                ),
                ObjectIdentity::new(
                    BootstrapRequest::api_version(&()),
                    BootstrapRequest::kind(&()),
                    &namespace,
                    &machine,
                ),
            ]
        })
        .collect();

    let report = ctx
        .apply
        .apply_retaining(&OwnerKey::of(deployment.as_ref()), APPLY_SET, desired, &retain)
        .await?;
    if !report.is_noop() {
        info!(
            created = report.created,
            deleted = report.deleted,
            current = plan.current,
            retained = plan.retained,
            "machines applied"
        );
    }

    let kept: Vec<&Machine> = machines
        .iter()
        .filter(|m| {
            let name = m.name_any();
            retain.iter().any(|id| id.name == name)
                || (0..plan.current).any(|i| machine_name(&deployment.name_any(), &hash, i) == name)
        })
        .collect();
    let status = NodeDeploymentStatus {
        replicas: count_i32(plan.current + plan.retained),
        ready_replicas: count_i32(kept.iter().filter(|m| is_running(m)).count()),
        updated_replicas: count_i32(ready_current.min(plan.current)),
        observed_generation: deployment.metadata.generation,
    };
    if deployment.status.as_ref() != Some(&status) {
        let mut updated = (*deployment).clone();
        updated.status = Some(status);
        typed::replace_status(store, &updated).await?;
    }

    Ok(if plan.in_progress(replicas) {
        Action::requeue(ROLLOUT_REQUEUE)
    } else {
        Action::await_change()
    })
}

/// Decide what to do after a failed reconciliation
pub fn error_policy(deployment: Arc<NodeDeployment>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(deployment = %deployment.name_any(), ?error, "node deployment reconciliation failed");
    action_for_error(error)
}

fn count_i32(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

fn is_running(machine: &Machine) -> bool {
    machine
        .status
        .as_ref()
        .is_some_and(|s| s.phase == MachinePhase::Running)
}

/// The machine and bootstrap request for one replica
fn machine_objects(
    deployment: &NodeDeployment,
    hash: &str,
    index: usize,
) -> Result<(DynamicObject, DynamicObject)> {
    let namespace = deployment.namespace().unwrap_or_default();
    let template = &deployment.spec.template;
    let name = machine_name(&deployment.name_any(), hash, index);

    let mut labels: BTreeMap<String, String> = template.labels.clone();
    labels.insert(TEMPLATE_HASH_LABEL.to_string(), hash.to_string());

    let mut request = BootstrapRequest::new(
        &name,
        BootstrapRequestSpec {
            cluster_name: deployment.spec.cluster_name.clone(),
            machine_name: name.clone(),
        },
    );
    request.metadata.namespace = Some(namespace.clone());
    request.metadata.labels = Some(labels.clone());

    let mut machine = Machine::new(
        &name,
        MachineSpec {
            cluster_name: deployment.spec.cluster_name.clone(),
            bootstrap: MachineBootstrap {
                config_ref: ResourceRef {
                    namespace: Some(namespace.clone()),
                    ..ResourceRef::new(
                        BootstrapRequest::api_version(&()),
                        BootstrapRequest::kind(&()),
                        &name,
                    )
                },
            },
            infrastructure_ref: template.infrastructure_ref.clone(),
            provider_id: None,
        },
    );
    machine.metadata.namespace = Some(namespace);
    machine.metadata.labels = Some(labels);
    if !template.annotations.is_empty() {
        machine.metadata.annotations = Some(template.annotations.clone());
    }

    Ok((typed::to_dynamic(&machine)?, typed::to_dynamic(&request)?))
}
