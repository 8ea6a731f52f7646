//! Per-cluster kubeconfig issuance
//!
//! Every provisioned cluster gets a dedicated low-privilege user whose
//! derived token is embedded in a kubeconfig pointing at the cluster's
//! proxied address. The bundle and the raw token are persisted together in
//! `<cluster>-kubeconfig`, so later reads never re-derive anything.
//!
//! Issuance is the only read path here with a side effect: on a cache miss
//! the user's previous token is rotated out. Concurrent callers for the
//! same cluster are collapsed by a per-cluster lock plus a re-check of the
//! secret under that lock; across processes the create of the secret is
//! the arbiter and the loser reads the winner's bundle.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::core::ObjectMeta;
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use trellis_common::crd::{Cluster, Token, TokenSpec, User, UserSpec};
use trellis_common::keyed_lock::KeyedLocks;
use trellis_common::naming::{base32, base32_hex, sha256};
use trellis_common::store::{typed, ObjectStore};
use trellis_common::{Error, Result, Settings};

use crate::context::Context;
use crate::token::{generate_token, hash_token};

/// Token label naming the owning user
pub const TOKEN_USER_ID_LABEL: &str = "authn.management.trellis.dev/token-user-id";
/// Token label naming the kind of token
pub const TOKEN_KIND_LABEL: &str = "authn.management.trellis.dev/kind";
/// Annotation set when the stored token value is hashed
pub const TOKEN_HASHED_ANNOTATION: &str = "authn.management.trellis.dev/token-hashed";

/// Key of the assembled kubeconfig in the bundle secret
pub const KUBECONFIG_VALUE_KEY: &str = "value";
/// Key of the raw credential in the bundle secret
pub const KUBECONFIG_TOKEN_KEY: &str = "token";

/// Kubeconfig document with a single cluster, user and context
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    /// API version
    pub api_version: String,
    /// Kind (always "Config")
    pub kind: String,
    /// Clusters
    pub clusters: Vec<NamedCluster>,
    /// Users
    pub users: Vec<NamedUser>,
    /// Contexts
    pub contexts: Vec<NamedContext>,
    /// Current context
    pub current_context: String,
}

/// Cluster entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedCluster {
    /// Entry name
    pub name: String,
    /// Cluster settings
    pub cluster: ClusterEntry,
}

/// Cluster settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterEntry {
    /// API server URL
    pub server: String,
    /// CA certificate (base64 encoded PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authority_data: Option<String>,
}

/// User entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedUser {
    /// Entry name
    pub name: String,
    /// User settings
    pub user: UserEntry,
}

/// User settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UserEntry {
    /// Bearer token
    pub token: String,
}

/// Context entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NamedContext {
    /// Entry name
    pub name: String,
    /// Context settings
    pub context: ContextEntry,
}

/// Context settings
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ContextEntry {
    /// Cluster entry name
    pub cluster: String,
    /// User entry name
    pub user: String,
}

impl Kubeconfig {
    /// Kubeconfig for `server` authenticating with a bearer token
    ///
    /// Entries are named `cluster`, `user` and `default`.
    pub fn with_token(server: impl Into<String>, ca_pem: &str, token: impl Into<String>) -> Self {
        let ca = ca_pem.trim();
        Self {
            api_version: "v1".into(),
            kind: "Config".into(),
            clusters: vec![NamedCluster {
                name: "cluster".into(),
                cluster: ClusterEntry {
                    server: server.into(),
                    certificate_authority_data: (!ca.is_empty()).then(|| STANDARD.encode(ca)),
                },
            }],
            users: vec![NamedUser {
                name: "user".into(),
                user: UserEntry {
                    token: token.into(),
                },
            }],
            contexts: vec![NamedContext {
                name: "default".into(),
                context: ContextEntry {
                    cluster: "cluster".into(),
                    user: "user".into(),
                },
            }],
            current_context: "default".into(),
        }
    }

    /// Render as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self)
            .map_err(|e| Error::serialization_for_kind("Kubeconfig", e.to_string()))
    }
}

/// Name of the bundle secret for a cluster
pub fn kubeconfig_secret_name(cluster_name: &str) -> String {
    format!("{}-kubeconfig", cluster_name)
}

/// Principal the per-cluster user represents
pub fn principal_id(namespace: &str, name: &str) -> String {
    format!("system://provisioning/{}/{}", namespace, name)
}

/// Deterministic user name for a principal: `u-` + 10 base32 chars of its hash
pub fn user_name_for_principal(principal: &str) -> String {
    let encoded = base32(&sha256(principal.as_bytes()), false);
    format!("u-{}", encoded[..10].to_lowercase())
}

fn labels_for_user(principal: &str) -> BTreeMap<String, String> {
    let mut encoded = base32_hex(principal.as_bytes(), false);
    encoded.truncate(63);
    BTreeMap::from([(encoded, "hashed-principal-name".to_string())])
}

/// Issues and caches kubeconfig bundles
pub struct KubeconfigManager<'a> {
    store: &'a dyn ObjectStore,
    settings: &'a Settings,
    locks: &'a KeyedLocks,
}

impl<'a> KubeconfigManager<'a> {
    /// Manager using the context's store, settings and lock store
    pub fn new(ctx: &'a Context) -> Self {
        Self {
            store: ctx.store.as_ref(),
            settings: ctx.settings.as_ref(),
            locks: ctx.locks.as_ref(),
        }
    }

    /// The kubeconfig bundle for a cluster, issuing one on first use
    pub async fn get_kubeconfig(&self, cluster: &Cluster, management_name: &str) -> Result<Secret> {
        let namespace = cluster.namespace().unwrap_or_default();

        // Imported clusters bring their own kubeconfig
        if let Some(capi) = &cluster.spec.cluster_api_config {
            let name = kubeconfig_secret_name(&capi.cluster_name);
            return typed::get::<Secret>(self.store, &namespace, &name)
                .await?
                .ok_or_else(|| Error::not_found("Secret", format!("{}/{}", namespace, name)));
        }

        let cluster_name = cluster.name_any();
        let secret_name = kubeconfig_secret_name(&cluster_name);
        if let Some(secret) = typed::get::<Secret>(self.store, &namespace, &secret_name).await? {
            return Ok(secret);
        }

        let _guard = self
            .locks
            .lock(&format!("{}/{}", namespace, cluster_name))
            .await;

        // Another caller may have issued while we waited for the lock
        if let Some(secret) = typed::get::<Secret>(self.store, &namespace, &secret_name).await? {
            debug!(cluster = %cluster_name, "kubeconfig issued concurrently");
            return Ok(secret);
        }

        let user = self.ensure_user(&namespace, &cluster_name).await?;
        let credential = self.rotate_token(&user, &cluster_name).await?;

        let server = format!(
            "{}/k8s/clusters/{}",
            self.settings.server_url(),
            management_name
        );
        let value = Kubeconfig::with_token(server, &self.settings.ca_certs, &credential).to_yaml()?;

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(secret_name.clone()),
                namespace: Some(namespace.clone()),
                ..Default::default()
            },
            data: Some(BTreeMap::from([
                (
                    KUBECONFIG_VALUE_KEY.to_string(),
                    ByteString(value.into_bytes()),
                ),
                (
                    KUBECONFIG_TOKEN_KEY.to_string(),
                    ByteString(credential.into_bytes()),
                ),
            ])),
            ..Default::default()
        };
        match typed::create(self.store, &secret).await {
            Ok(created) => {
                info!(cluster = %cluster_name, user = %user, "issued kubeconfig");
                Ok(created)
            }
            Err(e) if e.is_already_exists() => typed::get::<Secret>(self.store, &namespace, &secret_name)
                .await?
                .ok_or_else(|| Error::not_found("Secret", format!("{}/{}", namespace, secret_name))),
            Err(e) => Err(e),
        }
    }

    /// Get-or-create the cluster's dedicated user, returning its name
    pub async fn ensure_user(&self, namespace: &str, cluster_name: &str) -> Result<String> {
        let principal = principal_id(namespace, cluster_name);
        let name = user_name_for_principal(&principal);
        if typed::get::<User>(self.store, "", &name).await?.is_some() {
            return Ok(name);
        }

        let mut user = User::new(
            &name,
            UserSpec {
                display_name: principal.clone(),
                principal_ids: vec![principal.clone()],
            },
        );
        user.metadata.labels = Some(labels_for_user(&principal));
        match typed::create(self.store, &user).await {
            Ok(_) => Ok(name),
            Err(e) if e.is_already_exists() => Ok(name),
            Err(e) => Err(e),
        }
    }

    /// Replace the user's token with a fresh one, returning `user:token`
    async fn rotate_token(&self, user: &str, cluster_name: &str) -> Result<String> {
        if typed::delete::<Token>(self.store, "", user).await? {
            debug!(user = %user, "rotated out previous token");
        }

        let value = generate_token(40)?;
        let mut token = Token::new(
            user,
            TokenSpec {
                user_id: user.to_string(),
                auth_provider: "local".to_string(),
                token: value.clone(),
                is_derived: true,
                cluster_name: None,
                description: format!("kubeconfig for {}", cluster_name),
            },
        );
        token.metadata.labels = Some(BTreeMap::from([
            (TOKEN_USER_ID_LABEL.to_string(), user.to_string()),
            (TOKEN_KIND_LABEL.to_string(), "provisioning".to_string()),
        ]));
        if self.settings.token_hashing {
            token.spec.token = hash_token(&value)?;
            token.metadata.annotations = Some(BTreeMap::from([(
                TOKEN_HASHED_ANNOTATION.to_string(),
                "true".to_string(),
            )]));
        }
        typed::create(self.store, &token).await?;
        Ok(format!("{}:{}", user, value))
    }
}
