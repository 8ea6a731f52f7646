//! Agent config server
//!
//! Node agents call `GET /v3/connect/agent` with whatever credential they
//! were provisioned with. Once the request is matched to a machine the
//! response carries the machine's plan secret and a kubeconfig for the plan
//! service account, which can do nothing but read and update that one
//! secret.

pub mod handshake;
pub mod matcher;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use k8s_openapi::api::core::v1::Secret;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use trellis_common::crd::Machine;
use trellis_common::store::typed;
use trellis_common::{Error, Result};

use crate::bootstrap::{plan_secret_name, plan_token_secret_name, service_account_token};
use crate::context::Context;
use crate::kubeconfig::Kubeconfig;
use matcher::{IdentityMatcher, MachineIdentity, MatchError};

/// Seconds an agent should wait before retrying a transient failure
pub const RETRY_AFTER_SECONDS: u64 = 5;

/// Successful connect response
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectResponse {
    /// Namespace of the plan secret
    pub namespace: String,
    /// Plan secret the agent watches
    pub secret_name: String,
    /// Kubeconfig for the plan service account
    pub kubeconfig: String,
}

/// Shared state for handlers
#[derive(Clone)]
pub struct ConfigServerState {
    /// Controller context
    pub ctx: Arc<Context>,
    /// Request to machine resolution
    pub matcher: Arc<IdentityMatcher>,
}

impl ConfigServerState {
    /// State over `ctx`; pending handshakes end when `cancel` fires
    pub fn new(ctx: Arc<Context>, cancel: CancellationToken) -> Self {
        let matcher = Arc::new(IdentityMatcher::new(ctx.clone(), cancel));
        Self { ctx, matcher }
    }
}

impl IntoResponse for MatchError {
    fn into_response(self) -> Response {
        let status = match &self {
            MatchError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            MatchError::Provisioning(e) if e.is_security() => StatusCode::FORBIDDEN,
            MatchError::Provisioning(e) if e.is_retryable() => StatusCode::SERVICE_UNAVAILABLE,
            MatchError::Provisioning(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        // K8s-style Status body
        let body = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": self.to_string(),
            "code": status.as_u16()
        });

        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECONDS));
        }
        response
    }
}

/// Routes served to node agents
pub fn router(state: ConfigServerState) -> Router {
    Router::new()
        .route("/v3/connect/agent", get(connect_agent))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
}

async fn connect_agent(
    State(state): State<ConfigServerState>,
    headers: HeaderMap,
) -> std::result::Result<Json<ConnectResponse>, MatchError> {
    let identity = state.matcher.resolve(&headers).await?;
    let response = connect_response(&state.ctx, &identity).await?;
    info!(machine = %identity.name, namespace = %identity.namespace, "agent connected");
    Ok(Json(response))
}

/// Plan secret and plan credentials for a matched machine
pub async fn connect_response(ctx: &Context, identity: &MachineIdentity) -> Result<ConnectResponse> {
    let store = ctx.store.as_ref();
    let machine = typed::get::<Machine>(store, &identity.namespace, &identity.name)
        .await?
        .ok_or_else(|| {
            Error::not_found("Machine", format!("{}/{}", identity.namespace, identity.name))
        })?;
    let request = &machine.spec.bootstrap.config_ref.name;

    let token_secret_name = plan_token_secret_name(request);
    let token_secret = typed::get::<Secret>(store, &identity.namespace, &token_secret_name)
        .await?
        .ok_or_else(|| {
            Error::not_found("Secret", format!("{}/{}", identity.namespace, token_secret_name))
        })?;
    let token = service_account_token(&token_secret).ok_or_else(|| {
        Error::not_found(
            "service account token",
            format!("{}/{}", identity.namespace, token_secret_name),
        )
    })?;
    let token = String::from_utf8(token.to_vec())
        .map_err(|_| Error::internal_with_context("configserver", "plan token is not valid UTF-8"))?;

    let settings = &ctx.settings;
    let kubeconfig = Kubeconfig::with_token(settings.server_url(), &settings.ca_certs, token).to_yaml()?;

    Ok(ConnectResponse {
        namespace: identity.namespace.clone(),
        secret_name: plan_secret_name(request),
        kubeconfig,
    })
}

/// Serve agents on `addr` until `cancel` fires
pub async fn serve(addr: SocketAddr, state: ConfigServerState, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::internal_with_context("configserver", format!("bind {}: {}", addr, e)))?;
    info!(%addr, "config server listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| {
            warn!(error = %e, "config server stopped");
            Error::internal_with_context("configserver", e.to_string())
        })
}
