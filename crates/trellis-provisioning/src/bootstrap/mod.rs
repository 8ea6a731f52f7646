//! Machine bootstrap controller
//!
//! For every [`BootstrapRequest`] this controller materializes the
//! machine's scoped identity and its bootstrap credentials:
//!
//! - the plan secret the node agent watches for work
//! - a plan service account, its token secret, and a Role plus RoleBinding
//!   granting `get`, `update`, `watch` and `list` on the plan secret by name
//! - a bootstrap service account and token secret whose bearer value is
//!   baked into the install script
//! - the immutable bootstrap data secret holding the install script
//!
//! Token secrets are filled in by the API server's token controller. Once
//! the bootstrap token exists its secret is stamped with the bearer hash
//! label, which is how the config server maps an agent's bearer back to
//! its machine.

pub mod installer;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::ByteString;
use kube::core::{DynamicObject, ObjectMeta};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};
use trellis_common::crd::{
    BootstrapRequest, ControlPlane, Machine, MachinePhase, Taint,
};
use trellis_common::labels::{
    BEARER_HASH_LABEL, BOOTSTRAP_NAME_LABEL, BOOTSTRAP_SECRET_TYPE, CLUSTER_NAME_LABEL,
    CONTROL_PLANE_ROLE_LABEL, ETCD_ROLE_LABEL, LABELS_ANNOTATION, MACHINE_NAME_LABEL,
    PLAN_SECRET_TYPE, ROLE_BOOTSTRAP, ROLE_PLAN, SERVICE_ACCOUNT_NAME_ANNOTATION,
    SERVICE_ACCOUNT_ROLE_LABEL, SERVICE_ACCOUNT_TOKEN_SECRET_TYPE, TAINTS_ANNOTATION,
    WORKER_ROLE_LABEL,
};
use trellis_common::naming::{deterministic_hash, safe_concat_name};
use trellis_common::store::typed;
use trellis_common::{Error, Result};

use crate::apply::{ObjectIdentity, OwnerKey};
use crate::context::{action_for_error, Context};
use crate::token::bearer_for;
use installer::{InstallScript, NodeRoles};

/// Apply set holding a request's identity objects
pub const APPLY_SET: &str = "bootstrap";

/// Key of the service account token in a token secret
pub const SERVICE_ACCOUNT_TOKEN_KEY: &str = "token";

/// Key of the install script in the bootstrap data secret
pub const BOOTSTRAP_DATA_KEY: &str = "value";

/// Verbs the plan service account holds on its plan secret
pub const PLAN_VERBS: [&str; 4] = ["get", "update", "watch", "list"];

/// Requeue interval while waiting for the token controller
const TOKEN_REQUEUE: Duration = Duration::from_secs(5);

/// Plan secret (and plan service account, Role and RoleBinding) name
pub fn plan_secret_name(request: &str) -> String {
    safe_concat_name(&[request, "machine", "plan"])
}

/// Token secret of the plan service account
pub fn plan_token_secret_name(request: &str) -> String {
    safe_concat_name(&[request, "machine", "plan", "token"])
}

/// Bootstrap service account name
pub fn bootstrap_service_account_name(request: &str) -> String {
    safe_concat_name(&[request, "machine", "bootstrap"])
}

/// Token secret of the bootstrap service account
pub fn bootstrap_token_secret_name(request: &str) -> String {
    safe_concat_name(&[request, "machine", "bootstrap", "token"])
}

/// Immutable secret holding the install script
pub fn bootstrap_data_secret_name(request: &str) -> String {
    safe_concat_name(&[request, "machine", "bootstrap"])
}

/// Token stored in a service account token secret, if issued yet
pub fn service_account_token(secret: &Secret) -> Option<&[u8]> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(SERVICE_ACCOUNT_TOKEN_KEY))
        .map(|b| b.0.as_slice())
        .filter(|b| !b.is_empty())
}

/// Phases in which bootstrap data may still be assigned
fn assignable(phase: MachinePhase) -> bool {
    matches!(
        phase,
        MachinePhase::Pending
            | MachinePhase::Provisioning
            | MachinePhase::Deleting
            | MachinePhase::Failed
    )
}

/// Roles of a machine, read from its labels
pub fn machine_roles(machine: &Machine) -> NodeRoles {
    let labels = machine.labels();
    let has = |label: &str| labels.get(label).is_some_and(|v| v == "true");
    NodeRoles {
        etcd: has(ETCD_ROLE_LABEL),
        control_plane: has(CONTROL_PLANE_ROLE_LABEL),
        worker: has(WORKER_ROLE_LABEL),
    }
}

/// Node labels and taints carried on a machine's annotations
pub fn node_labels_and_taints(machine: &Machine) -> Result<(BTreeMap<String, String>, Vec<Taint>)> {
    let annotations = machine.annotations();
    let labels = match annotations.get(LABELS_ANNOTATION) {
        Some(raw) => serde_json::from_str(raw)?,
        None => BTreeMap::new(),
    };
    let taints = match annotations.get(TAINTS_ANNOTATION) {
        Some(raw) => serde_json::from_str(raw)?,
        None => Vec::new(),
    };
    Ok((labels, taints))
}

fn identity_labels(request: &BootstrapRequest, role: Option<&str>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([
        (BOOTSTRAP_NAME_LABEL.to_string(), request.name_any()),
        (MACHINE_NAME_LABEL.to_string(), request.spec.machine_name.clone()),
        (CLUSTER_NAME_LABEL.to_string(), request.spec.cluster_name.clone()),
    ]);
    if let Some(role) = role {
        labels.insert(SERVICE_ACCOUNT_ROLE_LABEL.to_string(), role.to_string());
    }
    labels
}

fn meta(name: &str, namespace: &str, labels: BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels),
        ..Default::default()
    }
}

fn token_secret(
    name: &str,
    namespace: &str,
    service_account: &str,
    mut labels: BTreeMap<String, String>,
    bearer: Option<&str>,
) -> Secret {
    if let Some(bearer) = bearer {
        labels.insert(BEARER_HASH_LABEL.to_string(), deterministic_hash(bearer));
    }
    let mut metadata = meta(name, namespace, labels);
    metadata.annotations = Some(BTreeMap::from([(
        SERVICE_ACCOUNT_NAME_ANNOTATION.to_string(),
        service_account.to_string(),
    )]));
    Secret {
        metadata,
        type_: Some(SERVICE_ACCOUNT_TOKEN_SECRET_TYPE.to_string()),
        ..Default::default()
    }
}

/// Plan secret, plan service account with its token, Role and RoleBinding
pub fn scoped_identity(request: &BootstrapRequest) -> Result<Vec<DynamicObject>> {
    let name = request.name_any();
    let namespace = request.namespace().unwrap_or_default();
    let plan = plan_secret_name(&name);
    let labels = identity_labels(request, Some(ROLE_PLAN));

    let plan_secret = Secret {
        metadata: meta(&plan, &namespace, identity_labels(request, None)),
        type_: Some(PLAN_SECRET_TYPE.to_string()),
        ..Default::default()
    };
    let service_account = ServiceAccount {
        metadata: meta(&plan, &namespace, labels.clone()),
        ..Default::default()
    };
    let token = token_secret(
        &plan_token_secret_name(&name),
        &namespace,
        &plan,
        labels.clone(),
        None,
    );
    let role = Role {
        metadata: meta(&plan, &namespace, labels.clone()),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["secrets".to_string()]),
            resource_names: Some(vec![plan.clone()]),
            verbs: PLAN_VERBS.iter().map(|v| v.to_string()).collect(),
            ..Default::default()
        }]),
    };
    let binding = RoleBinding {
        metadata: meta(&plan, &namespace, labels),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: plan.clone(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: plan.clone(),
            namespace: Some(namespace.clone()),
            ..Default::default()
        }]),
    };

    Ok(vec![
        typed::to_dynamic(&plan_secret)?,
        typed::to_dynamic(&service_account)?,
        typed::to_dynamic(&token)?,
        typed::to_dynamic(&role)?,
        typed::to_dynamic(&binding)?,
    ])
}

/// Bootstrap service account and its token secret
fn bootstrap_identity(request: &BootstrapRequest, bearer: Option<&str>) -> Result<Vec<DynamicObject>> {
    let name = request.name_any();
    let namespace = request.namespace().unwrap_or_default();
    let service_account_name = bootstrap_service_account_name(&name);
    let labels = identity_labels(request, Some(ROLE_BOOTSTRAP));

    let service_account = ServiceAccount {
        metadata: meta(&service_account_name, &namespace, labels.clone()),
        ..Default::default()
    };
    let token = token_secret(
        &bootstrap_token_secret_name(&name),
        &namespace,
        &service_account_name,
        labels,
        bearer,
    );
    Ok(vec![
        typed::to_dynamic(&service_account)?,
        typed::to_dynamic(&token)?,
    ])
}

/// Reconcile a bootstrap request
#[instrument(skip(request, ctx), fields(request = %request.name_any()))]
pub async fn reconcile(request: Arc<BootstrapRequest>, ctx: Arc<Context>) -> Result<Action> {
    if request.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }
    let store = ctx.store.as_ref();
    let name = request.name_any();
    let namespace = request.namespace().unwrap_or_default();

    let Some(machine) = typed::get::<Machine>(store, &namespace, &request.spec.machine_name).await?
    else {
        debug!(machine = %request.spec.machine_name, "machine gone, nothing to bootstrap");
        return Ok(Action::await_change());
    };
    let phase = machine.status.as_ref().map(|s| s.phase).unwrap_or_default();

    let bearer = typed::get::<Secret>(store, &namespace, &bootstrap_token_secret_name(&name))
        .await?
        .as_ref()
        .and_then(service_account_token)
        .map(bearer_for);

    let data_name = bootstrap_data_secret_name(&name);
    let data_exists = typed::get::<Secret>(store, &namespace, &data_name)
        .await?
        .is_some();

    let mut desired = scoped_identity(&request)?;
    desired.extend(bootstrap_identity(&request, bearer.as_deref())?);

    let mut retain = BTreeSet::new();
    let mut data_available = data_exists;
    if data_exists {
        retain.insert(ObjectIdentity::new("v1", "Secret", &namespace, &data_name));
    } else if let (Some(bearer), true) = (&bearer, assignable(phase)) {
        desired.push(typed::to_dynamic(
            &bootstrap_data_secret(&ctx, &request, &machine, bearer).await?,
        )?);
        data_available = true;
    }

    let report = ctx
        .apply
        .apply_retaining(&OwnerKey::of(request.as_ref()), APPLY_SET, desired, &retain)
        .await?;
    if !report.is_noop() {
        info!(created = report.created, updated = report.updated, "bootstrap objects applied");
    }

    let mut status = request.status.clone().unwrap_or_default();
    status.plan_secret_name = Some(plan_secret_name(&name));
    if status.data_secret_name.is_none() && data_available && assignable(phase) {
        info!(secret = %data_name, machine = %machine.name_any(), "bootstrap data assigned");
        status.data_secret_name = Some(data_name);
        status.ready = true;
    }
    if request.status.as_ref() != Some(&status) {
        let mut updated = (*request).clone();
        updated.status = Some(status.clone());
        typed::replace_status(store, &updated).await?;
    }

    Ok(if bearer.is_none() && !status.ready {
        Action::requeue(TOKEN_REQUEUE)
    } else {
        Action::await_change()
    })
}

/// Decide what to do after a failed reconciliation
pub fn error_policy(request: Arc<BootstrapRequest>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(request = %request.name_any(), ?error, "bootstrap reconciliation failed");
    action_for_error(error)
}

async fn bootstrap_data_secret(
    ctx: &Context,
    request: &BootstrapRequest,
    machine: &Machine,
    bearer: &str,
) -> Result<Secret> {
    let namespace = request.namespace().unwrap_or_default();
    let control_plane =
        typed::get::<ControlPlane>(ctx.store.as_ref(), &namespace, &request.spec.cluster_name)
            .await?
            .ok_or_else(|| {
                Error::not_found(
                    "ControlPlane",
                    format!("{}/{}", namespace, request.spec.cluster_name),
                )
            })?;
    let (labels, taints) = node_labels_and_taints(machine)?;
    let ca_checksum = ctx.settings.ca_checksum();

    let script = InstallScript {
        server_url: ctx.settings.server_url(),
        token: bearer,
        ca_checksum: &ca_checksum,
        install_url: &ctx.settings.agent_install_url,
        roles: machine_roles(machine),
        labels,
        taints,
        env: &control_plane.spec.agent_env_vars,
    }
    .render();

    Ok(Secret {
        metadata: meta(
            &bootstrap_data_secret_name(&request.name_any()),
            &namespace,
            identity_labels(request, None),
        ),
        type_: Some(BOOTSTRAP_SECRET_TYPE.to_string()),
        immutable: Some(true),
        data: Some(BTreeMap::from([(
            BOOTSTRAP_DATA_KEY.to_string(),
            ByteString(script.into_bytes()),
        )])),
        ..Default::default()
    })
}
