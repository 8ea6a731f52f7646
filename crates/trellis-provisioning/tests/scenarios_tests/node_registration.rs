//! Scenarios for node agents fetching their plans from the config server
//!
//! Machines are provisioned through the controllers first, so every
//! credential an agent presents here was issued the same way it would be
//! in a live cluster.

use std::time::Duration;

use axum::body::Body;
use axum::http::header::{AUTHORIZATION, RETRY_AFTER};
use axum::http::{Request, StatusCode};
use axum::response::Response;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::api::rbac::v1::Role;
use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use trellis_common::crd::{ClusterRegistrationToken, Machine};
use trellis_common::labels::MACHINE_NAME_LABEL;
use trellis_common::store::typed;
use trellis_common::Settings;
use trellis_provisioning::bootstrap::{
    bootstrap_token_secret_name, plan_secret_name, plan_token_secret_name,
};
use trellis_provisioning::cluster::registration_token_name;
use trellis_provisioning::configserver::handshake::{record_name, stamp, MACHINE_ID_HEADER};
use trellis_provisioning::configserver::matcher::MachineIdentity;
use trellis_provisioning::configserver::{router, ConfigServerState, ConnectResponse};
use trellis_provisioning::kubeconfig::Kubeconfig;
use trellis_provisioning::token::bearer_for;

use super::helpers::{server_pool, worker_pool, Harness, CLUSTER, NAMESPACE};

async fn provisioned(handshake_timeout: Duration) -> (Harness, ConfigServerState) {
    let settings = Settings {
        handshake_timeout,
        ..Settings::default()
    };
    let harness =
        Harness::with_settings(vec![server_pool("cp", 1), worker_pool("workers", 2)], settings).await;
    harness.converge().await;
    let state = ConfigServerState::new(harness.ctx.clone(), CancellationToken::new());
    (harness, state)
}

/// Bearer the install script of `machine` carries
fn bootstrap_bearer(machine: &Machine) -> String {
    let request = &machine.spec.bootstrap.config_ref.name;
    bearer_for(format!("sa-token-{}", bootstrap_token_secret_name(request)).as_bytes())
}

async fn registration_token(harness: &Harness) -> String {
    typed::get::<ClusterRegistrationToken>(
        harness.store(),
        NAMESPACE,
        &registration_token_name(CLUSTER),
    )
    .await
    .unwrap()
    .unwrap()
    .status
    .unwrap()
    .token
    .unwrap()
}

fn connect(bearer: &str, machine_id: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder()
        .uri("/v3/connect/agent")
        .header(AUTHORIZATION, format!("Bearer {}", bearer));
    if let Some(id) = machine_id {
        builder = builder.header(MACHINE_ID_HEADER, id);
    }
    builder.body(Body::empty()).unwrap()
}

async fn connect_response(response: Response) -> ConnectResponse {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

// =============================================================================
// Scoped Identity Stories
// =============================================================================

/// Story: each node's install bearer yields its own plan secret and nothing else
#[tokio::test]
async fn story_each_node_gets_only_its_own_plan() {
    let (harness, state) = provisioned(Duration::from_secs(5)).await;

    let mut seen = Vec::new();
    for machine in harness.machines().await {
        let request = machine.spec.bootstrap.config_ref.name.clone();
        let response = router(state.clone())
            .oneshot(connect(&bootstrap_bearer(&machine), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = connect_response(response).await;
        assert_eq!(body.namespace, NAMESPACE);
        assert_eq!(body.secret_name, plan_secret_name(&request));
        let kubeconfig: Kubeconfig = serde_yaml::from_str(&body.kubeconfig).unwrap();
        assert_eq!(
            kubeconfig.users[0].user.token,
            format!("sa-token-{}", plan_token_secret_name(&request))
        );

        // The plan credential can touch exactly one secret
        let role = typed::get::<Role>(harness.store(), NAMESPACE, &body.secret_name)
            .await
            .unwrap()
            .unwrap();
        let rules = role.rules.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(
            rules[0].resource_names.as_deref(),
            Some(&[body.secret_name.clone()][..])
        );
        seen.push(body.secret_name);
    }
    seen.sort();
    seen.dedup();
    assert_eq!(seen.len(), 3);
}

/// Story: a token secret relabelled to another machine is refused outright
#[tokio::test]
async fn story_relabelled_credential_is_forbidden() {
    let (harness, state) = provisioned(Duration::from_secs(5)).await;
    let machines = harness.machines().await;
    let (victim, attacker) = (&machines[0], &machines[1]);

    let name = bootstrap_token_secret_name(&attacker.spec.bootstrap.config_ref.name);
    let mut secret = typed::get::<Secret>(harness.store(), NAMESPACE, &name)
        .await
        .unwrap()
        .unwrap();
    secret
        .labels_mut()
        .insert(MACHINE_NAME_LABEL.to_string(), victim.name_any());
    typed::replace(harness.store(), &secret).await.unwrap();

    let response = router(state)
        .oneshot(connect(&bootstrap_bearer(attacker), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

// =============================================================================
// Handshake Stories
// =============================================================================

/// Story: a handshake record is consumed by the request it resolves
#[tokio::test]
async fn story_handshake_record_is_single_use() {
    let (harness, state) = provisioned(Duration::from_millis(100)).await;
    let token = registration_token(&harness).await;
    let machine = harness.machines().await.remove(0);
    let matcher = state.matcher.clone();

    let pending = tokio::spawn(router(state.clone()).oneshot(connect(&token, Some("node-7"))));
    for _ in 0..200 {
        if matcher.handshakes().waiters(NAMESPACE, "node-7") == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    stamp(
        harness.store(),
        NAMESPACE,
        "node-7",
        &MachineIdentity {
            namespace: NAMESPACE.into(),
            name: machine.name_any(),
        },
    )
    .await
    .unwrap();

    let response = pending.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = connect_response(response).await;
    assert_eq!(
        body.secret_name,
        plan_secret_name(&machine.spec.bootstrap.config_ref.name)
    );
    assert!(typed::get::<Secret>(harness.store(), NAMESPACE, &record_name("node-7"))
        .await
        .unwrap()
        .is_none());

    // The same id again starts over and is not matched
    let response = router(state)
        .oneshot(connect(&token, Some("node-7")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.headers()[RETRY_AFTER], "5");
    assert!(typed::get::<Secret>(harness.store(), NAMESPACE, &record_name("node-7"))
        .await
        .unwrap()
        .is_some());
}

/// Story: a handshake stamped into another cluster's machine is refused
#[tokio::test]
async fn story_handshake_outside_cluster_is_forbidden() {
    let (harness, state) = provisioned(Duration::from_secs(5)).await;
    let token = registration_token(&harness).await;

    let mut foreign = harness.machines().await.remove(0);
    foreign.metadata = kube::core::ObjectMeta {
        name: Some("other-machine".into()),
        namespace: Some(NAMESPACE.into()),
        ..Default::default()
    };
    foreign.spec.cluster_name = "other".into();
    foreign.status = None;
    typed::create(harness.store(), &foreign).await.unwrap();

    let matcher = state.matcher.clone();
    let pending = tokio::spawn(router(state).oneshot(connect(&token, Some("node-9"))));
    for _ in 0..200 {
        if matcher.handshakes().waiters(NAMESPACE, "node-9") == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    stamp(
        harness.store(),
        NAMESPACE,
        "node-9",
        &MachineIdentity {
            namespace: NAMESPACE.into(),
            name: "other-machine".into(),
        },
    )
    .await
    .unwrap();

    let response = pending.await.unwrap().unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}
