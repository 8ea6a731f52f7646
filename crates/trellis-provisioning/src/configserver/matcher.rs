//! Machine identity matching
//!
//! An agent request is resolved to exactly one machine by the credential
//! it presents:
//!
//! - a bootstrap bearer maps through the bearer-hash index to its token
//!   secret, whose service account names the machine directly
//! - a cluster registration token plus `X-Cattle-*` headers goes through
//!   the handshake
//!
//! Any mismatch between the objects a credential links together is a
//! security error and is never retried.

use std::sync::Arc;

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use kube::{Resource, ResourceExt};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use trellis_common::crd::{ClusterRegistrationToken, Machine};
use trellis_common::labels::{
    BEARER_HASH_LABEL, BOOTSTRAP_NAME_LABEL, MACHINE_NAME_LABEL,
    REGISTRATION_TOKEN_HASH_LABEL, ROLE_BOOTSTRAP, SERVICE_ACCOUNT_NAME_ANNOTATION,
    SERVICE_ACCOUNT_ROLE_LABEL, SERVICE_ACCOUNT_UID_ANNOTATION,
};
use trellis_common::naming::deterministic_hash;
use trellis_common::store::{selector, typed};
use trellis_common::{Error, Result};

use super::handshake::{HandshakeRequest, Handshakes};
use crate::bootstrap::service_account_token;
use crate::context::Context;
use crate::token::{bearer_for, secure_eq};

/// The machine an agent request belongs to
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MachineIdentity {
    /// Machine namespace
    pub namespace: String,
    /// Machine name
    pub name: String,
}

/// Outcome of matching a request that did not yield a machine
#[derive(Debug, thiserror::Error)]
pub enum MatchError {
    /// No usable credential was presented
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Lookup or verification failed
    #[error(transparent)]
    Provisioning(#[from] Error),
}

/// Bearer value of an `Authorization` header
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

fn label<'a, K: Resource>(obj: &'a K, key: &str) -> Option<&'a str> {
    obj.meta()
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

/// Resolves agent requests to machines
pub struct IdentityMatcher {
    ctx: Arc<Context>,
    handshakes: Handshakes,
}

impl IdentityMatcher {
    /// Matcher over the context's store, handshakes stop when `cancel` fires
    pub fn new(ctx: Arc<Context>, cancel: CancellationToken) -> Self {
        let handshakes = Handshakes::new(ctx.store.clone(), ctx.settings.handshake_timeout, cancel);
        Self { ctx, handshakes }
    }

    /// In-flight handshakes
    pub fn handshakes(&self) -> &Handshakes {
        &self.handshakes
    }

    /// Resolve a request's credential to its machine
    pub async fn resolve(&self, headers: &HeaderMap) -> std::result::Result<MachineIdentity, MatchError> {
        let bearer = bearer_token(headers)
            .ok_or_else(|| MatchError::Unauthorized("missing bearer token".into()))?;

        if let Some(identity) = self.by_scoped_identity(bearer).await? {
            debug!(machine = %identity.name, "matched by scoped identity");
            return Ok(identity);
        }
        if let Some(identity) = self.by_handshake(bearer, headers).await? {
            return Ok(identity);
        }
        Err(MatchError::Unauthorized(
            "credential does not identify a machine".into(),
        ))
    }

    /// Scoped identity strategy: bearer → token secret → service account → machine
    pub async fn by_scoped_identity(&self, bearer: &str) -> Result<Option<MachineIdentity>> {
        let store = self.ctx.store.as_ref();
        let secrets = typed::list::<Secret>(
            store,
            "",
            &selector(&[(BEARER_HASH_LABEL, &deterministic_hash(bearer))]),
        )
        .await?;
        let Some(secret) = secrets.into_iter().next() else {
            return Ok(None);
        };
        let namespace = secret.namespace().unwrap_or_default();
        let secret_name = secret.name_any();

        let presented = service_account_token(&secret)
            .map(bearer_for)
            .is_some_and(|expected| secure_eq(&expected, bearer));
        if !presented {
            return Err(reject(format!(
                "bearer does not match token secret {}/{}",
                namespace, secret_name
            )));
        }
        if label(&secret, SERVICE_ACCOUNT_ROLE_LABEL) != Some(ROLE_BOOTSTRAP) {
            return Err(reject(format!(
                "token secret {}/{} is not a bootstrap credential",
                namespace, secret_name
            )));
        }

        let account_name = secret
            .annotations()
            .get(SERVICE_ACCOUNT_NAME_ANNOTATION)
            .cloned()
            .unwrap_or_default();
        let account = typed::get::<ServiceAccount>(store, &namespace, &account_name)
            .await?
            .ok_or_else(|| Error::not_found("ServiceAccount", format!("{}/{}", namespace, account_name)))?;
        if label(&account, SERVICE_ACCOUNT_ROLE_LABEL) != Some(ROLE_BOOTSTRAP) {
            return Err(reject(format!(
                "service account {}/{} is not a bootstrap account",
                namespace, account_name
            )));
        }
        if let Some(uid) = secret.annotations().get(SERVICE_ACCOUNT_UID_ANNOTATION) {
            if account.uid().as_deref() != Some(uid.as_str()) {
                return Err(reject(format!(
                    "token secret {}/{} was issued to a different service account",
                    namespace, secret_name
                )));
            }
        }

        let machine_name = label(&account, MACHINE_NAME_LABEL).unwrap_or_default().to_string();
        if label(&secret, MACHINE_NAME_LABEL) != Some(machine_name.as_str()) {
            return Err(reject(format!(
                "token secret {}/{} does not belong to machine {}",
                namespace, secret_name, machine_name
            )));
        }
        let machine = typed::get::<Machine>(store, &namespace, &machine_name)
            .await?
            .ok_or_else(|| Error::not_found("Machine", format!("{}/{}", namespace, machine_name)))?;
        if label(&account, BOOTSTRAP_NAME_LABEL) != Some(machine.spec.bootstrap.config_ref.name.as_str()) {
            return Err(reject(format!(
                "service account {}/{} is not owned by machine {}",
                namespace, account_name, machine_name
            )));
        }

        Ok(Some(MachineIdentity {
            namespace,
            name: machine_name,
        }))
    }

    /// Handshake strategy: registration token plus identifying headers
    pub async fn by_handshake(&self, token: &str, headers: &HeaderMap) -> Result<Option<MachineIdentity>> {
        let Some(request) = HandshakeRequest::from_headers(headers) else {
            return Ok(None);
        };
        let store = self.ctx.store.as_ref();
        let registrations = typed::list::<ClusterRegistrationToken>(
            store,
            "",
            &selector(&[(REGISTRATION_TOKEN_HASH_LABEL, &deterministic_hash(token))]),
        )
        .await?;
        let Some(registration) = registrations.into_iter().find(|r| {
            r.status
                .as_ref()
                .and_then(|s| s.token.as_deref())
                .is_some_and(|stored| secure_eq(stored, token))
        }) else {
            return Ok(None);
        };
        let namespace = registration.namespace().unwrap_or_default();

        let identity = self.handshakes.resolve(&namespace, &request).await?;

        let machine = typed::get::<Machine>(store, &identity.namespace, &identity.name)
            .await?
            .ok_or_else(|| {
                Error::not_found("Machine", format!("{}/{}", identity.namespace, identity.name))
            })?;
        if identity.namespace != namespace || machine.spec.cluster_name != registration.spec.cluster_name {
            return Err(reject(format!(
                "handshake {} resolved to machine {}/{} outside cluster {}",
                request.id, identity.namespace, identity.name, registration.spec.cluster_name
            )));
        }
        Ok(Some(identity))
    }
}

fn reject(message: String) -> Error {
    warn!(%message, "rejecting agent credential");
    Error::security(message)
}
