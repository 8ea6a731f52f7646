//! Cluster reconciler
//!
//! Turns a provisioning [`Cluster`] into its subordinate object tree and
//! keeps the tree in place through the apply engine. Validation failures
//! freeze the cluster with the message on its `Updated` condition; every
//! other failure is transient and requeued. The control plane's
//! `Provisioned` condition is mirrored back, and once it is true the
//! cluster's kubeconfig is issued and the cluster marked ready.

pub mod template;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, instrument, warn};
use trellis_common::condition::{PROVISIONED, READY, UPDATED, WAITING};
use trellis_common::crd::{
    Cluster, ClusterRegistrationToken, ClusterRegistrationTokenSpec,
    ClusterRegistrationTokenStatus, ClusterStatus, ControlPlane, ResourceRef, Token, User,
};
use trellis_common::labels::{CLUSTER_NAME_LABEL, REGISTRATION_TOKEN_HASH_LABEL};
use trellis_common::naming::{deterministic_hash, safe_concat_name};
use trellis_common::store::{typed, ObjectStore};
use trellis_common::{Error, Result};

use crate::apply::OwnerKey;
use crate::context::{action_for_error, Context};
use crate::kubeconfig::{kubeconfig_secret_name, principal_id, user_name_for_principal, KubeconfigManager};
use crate::token::generate_token;

/// Finalizer that lets the reconciler purge the object tree before deletion
pub const CLUSTER_FINALIZER: &str = "provisioning.trellis.dev/cleanup";

/// Apply set holding a cluster's object tree
pub const APPLY_SET: &str = "rke-cluster";

/// Requeue interval while the cluster is still provisioning
const PROVISIONING_REQUEUE: Duration = Duration::from_secs(30);

/// Name of the registration token created for a cluster
pub fn registration_token_name(cluster_name: &str) -> String {
    safe_concat_name(&[cluster_name, "registration"])
}

fn object_key(cluster: &Cluster) -> String {
    format!(
        "{}/{}",
        cluster.namespace().unwrap_or_default(),
        cluster.name_any()
    )
}

/// Reconcile a provisioning cluster
#[instrument(skip(cluster, ctx), fields(cluster = %cluster.name_any()))]
pub async fn reconcile(cluster: Arc<Cluster>, ctx: Arc<Context>) -> Result<Action> {
    let key = object_key(&cluster);
    match reconcile_cluster(&cluster, &ctx).await {
        Ok(action) => {
            ctx.failures.reset(&key);
            Ok(action)
        }
        Err(e) if e.is_retryable() => {
            let failures = ctx.failures.record(&key);
            if failures >= ctx.settings.waiting_threshold {
                mark_waiting(&cluster, &ctx, &e).await;
            }
            Err(e)
        }
        Err(e) => Err(e),
    }
}

/// Decide what to do after a failed reconciliation
pub fn error_policy(cluster: Arc<Cluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_permanent() {
        warn!(cluster = %cluster.name_any(), error = %error, "cluster spec rejected");
    } else {
        warn!(cluster = %cluster.name_any(), ?error, "cluster reconciliation failed");
    }
    action_for_error(error)
}

async fn reconcile_cluster(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    let store = ctx.store.as_ref();

    if cluster.metadata.deletion_timestamp.is_some() {
        return cleanup(cluster, ctx).await;
    }
    if cluster.spec.rke_config.is_none() {
        debug!("no rkeConfig, nothing to provision");
        return Ok(Action::await_change());
    }

    let cluster = ensure_finalizer(store, cluster).await?;
    let mut status = cluster.status.clone().unwrap_or_default();

    if let Err(e) = template::validate(&cluster) {
        if let Error::Validation { message, .. } = &e {
            UPDATED.set_false(&mut status, "InvalidSpec", message.clone());
            READY.set_false(&mut status, "InvalidSpec", message.clone());
        }
        status.ready = false;
        write_status(store, &cluster, status).await?;
        return Err(e);
    }

    let namespace = cluster.namespace().unwrap_or_default();
    let management_name = status
        .cluster_name
        .clone()
        .unwrap_or_else(|| template::management_cluster_name(&namespace, &cluster.name_any()));
    status.cluster_name = Some(management_name.clone());

    let desired = template::desired_objects(store, &cluster, &management_name).await?;
    let report = ctx
        .apply
        .apply(&OwnerKey::of(&cluster), APPLY_SET, desired)
        .await?;
    if !report.is_noop() {
        info!(
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            "cluster objects applied"
        );
    }

    status.applied_spec = Some(cluster.spec.clone());
    status.observed_generation = cluster.metadata.generation;
    status.control_plane_ref = Some(ResourceRef {
        namespace: Some(namespace.clone()),
        ..ResourceRef::new(
            ControlPlane::api_version(&()),
            ControlPlane::kind(&()),
            template::control_plane_name(&cluster),
        )
    });
    UPDATED.set_true(&mut status, "Applied");
    WAITING.clear(&mut status);

    mirror_control_plane(store, &cluster, &mut status).await?;
    ensure_registration_token(store, &cluster).await?;

    if PROVISIONED.is_true(&status) {
        let secret = KubeconfigManager::new(ctx)
            .get_kubeconfig(&cluster, &management_name)
            .await?;
        status.client_secret_name = secret.metadata.name.clone();
        status.ready = true;
        READY.set_true(&mut status, "Provisioned");
    } else {
        status.ready = false;
        READY.set_false(
            &mut status,
            "Provisioning",
            "waiting for the control plane to be provisioned",
        );
    }

    let ready = status.ready;
    write_status(store, &cluster, status).await?;

    Ok(if ready {
        Action::await_change()
    } else {
        Action::requeue(PROVISIONING_REQUEUE)
    })
}

async fn ensure_finalizer(store: &dyn ObjectStore, cluster: &Cluster) -> Result<Cluster> {
    if cluster.finalizers().iter().any(|f| f == CLUSTER_FINALIZER) {
        return Ok(cluster.clone());
    }
    let mut updated = cluster.clone();
    updated.finalizers_mut().push(CLUSTER_FINALIZER.to_string());
    debug!("adding cleanup finalizer");
    typed::replace(store, &updated).await
}

async fn write_status(store: &dyn ObjectStore, cluster: &Cluster, status: ClusterStatus) -> Result<()> {
    if cluster.status.as_ref() == Some(&status) {
        return Ok(());
    }
    let mut updated = cluster.clone();
    updated.status = Some(status);
    typed::replace_status(store, &updated).await?;
    Ok(())
}

/// Copy the control plane's Provisioned condition onto the cluster
async fn mirror_control_plane(
    store: &dyn ObjectStore,
    cluster: &Cluster,
    status: &mut ClusterStatus,
) -> Result<()> {
    let control_plane = typed::get::<ControlPlane>(
        store,
        &cluster.namespace().unwrap_or_default(),
        &template::control_plane_name(cluster),
    )
    .await?;

    let mirrored = control_plane
        .as_ref()
        .and_then(|cp| cp.status.as_ref())
        .and_then(|s| PROVISIONED.get(s));
    match mirrored {
        Some(condition) => {
            PROVISIONED.set(
                status,
                condition.status.clone(),
                condition.reason.clone(),
                condition.message.clone(),
            );
        }
        None => {
            PROVISIONED.set_unknown(status, "Pending", "waiting for the control plane");
        }
    }
    Ok(())
}

/// Get-or-create the shared token not-yet-identified nodes handshake with
pub async fn ensure_registration_token(
    store: &dyn ObjectStore,
    cluster: &Cluster,
) -> Result<ClusterRegistrationToken> {
    let namespace = cluster.namespace().unwrap_or_default();
    let cluster_name = cluster.name_any();
    let name = registration_token_name(&cluster_name);

    let existing = typed::get::<ClusterRegistrationToken>(store, &namespace, &name).await?;
    let token = match existing {
        Some(token) if token.status.as_ref().and_then(|s| s.token.as_ref()).is_some() => {
            return Ok(token)
        }
        Some(token) => token,
        None => {
            let mut token = ClusterRegistrationToken::new(
                &name,
                ClusterRegistrationTokenSpec {
                    cluster_name: cluster_name.clone(),
                },
            );
            token.metadata.namespace = Some(namespace.clone());
            token.metadata.labels = Some(BTreeMap::from([(
                CLUSTER_NAME_LABEL.to_string(),
                cluster_name.clone(),
            )]));
            if let Some(owner) = cluster.controller_owner_ref(&()) {
                token.metadata.owner_references = Some(vec![owner]);
            }
            match typed::create(store, &token).await {
                Ok(created) => created,
                Err(e) if e.is_already_exists() => {
                    return Err(Error::conflict("ClusterRegistrationToken", name))
                }
                Err(e) => return Err(e),
            }
        }
    };

    // The hash label is the index the config server finds the token by
    let value = generate_token(40)?;
    let mut labelled = token;
    labelled
        .labels_mut()
        .insert(REGISTRATION_TOKEN_HASH_LABEL.to_string(), deterministic_hash(&value));
    let mut labelled = typed::replace(store, &labelled).await?;
    labelled.status = Some(ClusterRegistrationTokenStatus { token: Some(value) });
    info!(token = %name, "issued cluster registration token");
    typed::replace_status(store, &labelled).await
}

/// Purge the object tree and per-cluster credentials, then release the finalizer
async fn cleanup(cluster: &Cluster, ctx: &Context) -> Result<Action> {
    // Failures from before deletion must not outlive the object
    ctx.failures.reset(&object_key(cluster));
    if !cluster.finalizers().iter().any(|f| f == CLUSTER_FINALIZER) {
        return Ok(Action::await_change());
    }
    let store = ctx.store.as_ref();
    let namespace = cluster.namespace().unwrap_or_default();
    let name = cluster.name_any();

    let deleted = ctx.apply.purge(&OwnerKey::of(cluster)).await?;
    typed::delete::<ClusterRegistrationToken>(store, &namespace, &registration_token_name(&name))
        .await?;
    typed::delete::<k8s_openapi::api::core::v1::Secret>(
        store,
        &namespace,
        &kubeconfig_secret_name(&name),
    )
    .await?;
    let user = user_name_for_principal(&principal_id(&namespace, &name));
    typed::delete::<Token>(store, "", &user).await?;
    typed::delete::<User>(store, "", &user).await?;
    info!(deleted, "cluster objects removed");

    let mut released = cluster.clone();
    released.finalizers_mut().retain(|f| f != CLUSTER_FINALIZER);
    typed::replace(store, &released).await?;
    Ok(Action::await_change())
}

/// Surface a persisting transient failure as a Waiting condition
async fn mark_waiting(cluster: &Cluster, ctx: &Context, error: &Error) {
    let store = ctx.store.as_ref();
    let namespace = cluster.namespace().unwrap_or_default();
    let latest = match typed::get::<Cluster>(store, &namespace, &cluster.name_any()).await {
        Ok(Some(latest)) => latest,
        Ok(None) => return,
        Err(e) => {
            warn!(error = %e, "could not read cluster to record waiting state");
            return;
        }
    };
    let mut status = latest.status.clone().unwrap_or_default();
    if WAITING.set(
        &mut status,
        trellis_common::condition::ConditionStatus::True,
        "Waiting",
        format!("waiting: {}", error),
    ) {
        if let Err(e) = write_status(store, &latest, status).await {
            warn!(error = %e, "could not record waiting state");
        }
    }
}
