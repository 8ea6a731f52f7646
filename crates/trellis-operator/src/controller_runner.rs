//! Controller runner - builds the provisioning controller futures
//!
//! Each controller watches its primary resource plus the objects whose
//! changes should wake it, mapped back by name or by the labels the
//! reconcilers stamp on what they create.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, Resource, ResourceExt};

use trellis_common::crd::{BootstrapRequest, Cluster, ControlPlane, Machine, NodeDeployment};
use trellis_common::labels::{
    BOOTSTRAP_NAME_LABEL, CLUSTER_NAME_LABEL, DEPLOYMENT_NAME_LABEL, MACHINE_NAME_LABEL,
};
use trellis_provisioning::{bootstrap, cluster, machine_status, nodepool, planner, Context};

/// Watcher timeout (seconds) - must be less than client read_timeout (30s)
/// This forces the API server to close the watch before the client times out,
/// preventing "body read timed out" errors on idle watches.
const WATCH_TIMEOUT_SECS: u32 = 25;

type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Watch only objects carrying `label`
fn labelled(label: &str) -> WatcherConfig {
    watcher_config().labels(label)
}

/// Map a watched object to `K` named by one of its labels, in its namespace
fn by_label<K, W>(label: &'static str) -> impl Fn(W) -> Option<ObjectRef<K>> + Clone
where
    K: Resource<DynamicType = ()>,
    W: ResourceExt,
{
    move |obj: W| {
        let name = obj.labels().get(label)?;
        let namespace = obj.namespace()?;
        Some(ObjectRef::new(name).within(&namespace))
    }
}

/// Build every provisioning controller
pub fn build_provisioning_controllers(client: Client, ctx: Arc<Context>) -> Vec<ControllerFuture> {
    tracing::info!("- Cluster controller");
    tracing::info!("- NodeDeployment controller");
    tracing::info!("- BootstrapRequest controller");
    tracing::info!("- ControlPlane planner");
    tracing::info!("- Machine status controller");

    vec![
        build_cluster_controller(client.clone(), ctx.clone()),
        build_node_deployment_controller(client.clone(), ctx.clone()),
        build_bootstrap_controller(client.clone(), ctx.clone()),
        build_planner_controller(client.clone(), ctx.clone()),
        build_machine_controller(client, ctx),
    ]
}

/// Clusters, woken when their control plane status changes
fn build_cluster_controller(client: Client, ctx: Arc<Context>) -> ControllerFuture {
    let clusters: Api<Cluster> = Api::all(client.clone());
    let control_planes: Api<ControlPlane> = Api::all(client);

    Box::pin(
        Controller::new(clusters, watcher_config())
            .watches(control_planes, watcher_config(), |cp: ControlPlane| {
                let namespace = cp.namespace()?;
                Some(ObjectRef::<Cluster>::new(&cp.spec.cluster_name).within(&namespace))
            })
            .shutdown_on_signal()
            .run(cluster::reconcile, cluster::error_policy, ctx)
            .for_each(log_reconcile_result("Cluster")),
    )
}

/// Node deployments, woken when one of their machines changes
fn build_node_deployment_controller(client: Client, ctx: Arc<Context>) -> ControllerFuture {
    let deployments: Api<NodeDeployment> = Api::all(client.clone());
    let machines: Api<Machine> = Api::all(client);

    Box::pin(
        Controller::new(deployments, watcher_config())
            .watches(
                machines,
                labelled(DEPLOYMENT_NAME_LABEL),
                by_label::<NodeDeployment, Machine>(DEPLOYMENT_NAME_LABEL),
            )
            .shutdown_on_signal()
            .run(nodepool::reconcile, nodepool::error_policy, ctx)
            .for_each(log_reconcile_result("NodeDeployment")),
    )
}

/// Bootstrap requests, woken when the token controller fills their secrets
fn build_bootstrap_controller(client: Client, ctx: Arc<Context>) -> ControllerFuture {
    let requests: Api<BootstrapRequest> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client);

    Box::pin(
        Controller::new(requests, watcher_config())
            .watches(
                secrets,
                labelled(BOOTSTRAP_NAME_LABEL),
                by_label::<BootstrapRequest, Secret>(BOOTSTRAP_NAME_LABEL),
            )
            .shutdown_on_signal()
            .run(bootstrap::reconcile, bootstrap::error_policy, ctx)
            .for_each(log_reconcile_result("BootstrapRequest")),
    )
}

/// Control planes, woken by machine changes and agent reports on plan secrets
fn build_planner_controller(client: Client, ctx: Arc<Context>) -> ControllerFuture {
    let control_planes: Api<ControlPlane> = Api::all(client.clone());
    let machines: Api<Machine> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client);

    Box::pin(
        Controller::new(control_planes, watcher_config())
            .watches(machines, watcher_config(), |machine: Machine| {
                let namespace = machine.namespace()?;
                Some(ObjectRef::<ControlPlane>::new(&machine.spec.cluster_name).within(&namespace))
            })
            .watches(
                secrets,
                labelled(CLUSTER_NAME_LABEL),
                by_label::<ControlPlane, Secret>(CLUSTER_NAME_LABEL),
            )
            .shutdown_on_signal()
            .run(planner::reconcile, planner::error_policy, ctx)
            .for_each(log_reconcile_result("ControlPlane")),
    )
}

/// Machines, woken when their plan secret changes
fn build_machine_controller(client: Client, ctx: Arc<Context>) -> ControllerFuture {
    let machines: Api<Machine> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::all(client);

    Box::pin(
        Controller::new(machines, watcher_config())
            .watches(
                secrets,
                labelled(MACHINE_NAME_LABEL),
                by_label::<Machine, Secret>(MACHINE_NAME_LABEL),
            )
            .shutdown_on_signal()
            .run(machine_status::reconcile, machine_status::error_policy, ctx)
            .for_each(log_reconcile_result("Machine")),
    )
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn secret(labels: &[(&str, &str)], namespace: Option<&str>) -> Secret {
        let mut secret = Secret::default();
        secret.metadata.name = Some("s".into());
        secret.metadata.namespace = namespace.map(str::to_string);
        secret.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        );
        secret
    }

    #[test]
    fn test_by_label_maps_to_named_owner() {
        let map = by_label::<Machine, Secret>(MACHINE_NAME_LABEL);
        let target = map(secret(&[(MACHINE_NAME_LABEL, "m-a")], Some("fleet"))).unwrap();
        assert_eq!(target.name, "m-a");
        assert_eq!(target.namespace.as_deref(), Some("fleet"));
    }

    #[test]
    fn test_by_label_ignores_unlabelled_objects() {
        let map = by_label::<Machine, Secret>(MACHINE_NAME_LABEL);
        assert!(map(secret(&[(CLUSTER_NAME_LABEL, "prod")], Some("fleet"))).is_none());
        assert!(map(secret(&[(MACHINE_NAME_LABEL, "m-a")], None)).is_none());
    }

    #[test]
    fn test_watch_timeout_is_below_client_read_timeout() {
        assert!(WATCH_TIMEOUT_SECS < 30);
    }
}
