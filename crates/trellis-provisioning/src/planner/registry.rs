//! Private registry configuration for nodes
//!
//! Mirrors and per-registry settings from the control plane become a
//! `registries.yaml` plus the TLS material it points at. TLS keypairs and
//! CA bundles are written under a per-registry directory so two registries
//! never overwrite each other's files.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use serde::Serialize;
use trellis_common::crd::{Mirror, Registry};
use trellis_common::labels::{AUTH_CONFIG_SECRET_TYPE, TLS_SECRET_TYPE};
use trellis_common::store::{typed, ObjectStore};
use trellis_common::{Error, Result};

use super::plan::PlanFile;
use super::runtime::Runtime;

/// Username key of an auth-config secret
pub const USERNAME_KEY: &str = "username";
/// Password key of an auth-config secret
pub const PASSWORD_KEY: &str = "password";
/// Pre-encoded auth key of an auth-config secret
pub const AUTH_KEY: &str = "auth";
/// Identity token key of an auth-config secret
pub const IDENTITY_TOKEN_KEY: &str = "identityToken";

const TLS_CERT_KEY: &str = "tls.crt";
const TLS_KEY_KEY: &str = "tls.key";

#[derive(Debug, Default, Serialize, PartialEq)]
struct RegistriesFile {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    mirrors: BTreeMap<String, MirrorEntry>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    configs: BTreeMap<String, ConfigEntry>,
}

#[derive(Debug, Default, Serialize, PartialEq)]
struct MirrorEntry {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    endpoint: Vec<String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    rewrite: BTreeMap<String, String>,
}

impl From<&Mirror> for MirrorEntry {
    fn from(mirror: &Mirror) -> Self {
        Self {
            endpoint: mirror.endpoints.clone(),
            rewrite: mirror.rewrites.clone(),
        }
    }
}

#[derive(Debug, Default, Serialize, PartialEq)]
struct ConfigEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<AuthEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls: Option<TlsEntry>,
}

#[derive(Debug, Default, Serialize, PartialEq)]
struct AuthEntry {
    #[serde(skip_serializing_if = "String::is_empty")]
    username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    password: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    auth: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    identity_token: String,
}

#[derive(Debug, Default, Serialize, PartialEq)]
struct TlsEntry {
    #[serde(skip_serializing_if = "String::is_empty")]
    cert_file: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    key_file: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    ca_file: String,
    insecure_skip_verify: bool,
}

/// Files realizing a registry configuration on a node
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RegistryFiles {
    /// Path of the generated `registries.yaml`, for the `private-registry` key
    pub config_path: String,
    /// `registries.yaml` followed by TLS and CA files
    pub files: Vec<PlanFile>,
}

fn secret_value(secret: &Secret, key: &str) -> String {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| String::from_utf8_lossy(&v.0).into_owned())
        .unwrap_or_default()
}

fn secret_bytes<'a>(secret: &'a Secret, key: &str) -> Option<&'a [u8]> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| v.0.as_slice())
        .filter(|b| !b.is_empty())
}

async fn typed_secret(
    store: &dyn ObjectStore,
    namespace: &str,
    name: &str,
    expected_type: &str,
) -> Result<Secret> {
    let secret = typed::get::<Secret>(store, namespace, name)
        .await?
        .ok_or_else(|| Error::not_found("Secret", format!("{}/{}", namespace, name)))?;
    if secret.type_.as_deref() != Some(expected_type) {
        return Err(Error::validation(format!(
            "secret [{}] must be of type [{}]",
            name, expected_type
        )));
    }
    Ok(secret)
}

/// Build the registry files for a control plane's registry settings
///
/// Referenced secrets are read from `namespace`. A missing secret is a
/// transient not-found; a secret of the wrong type is a permanent error.
pub async fn registry_files(
    store: &dyn ObjectStore,
    namespace: &str,
    runtime: Runtime,
    registry: &Registry,
) -> Result<RegistryFiles> {
    let mut document = RegistriesFile {
        mirrors: registry
            .mirrors
            .iter()
            .map(|(name, mirror)| (name.clone(), MirrorEntry::from(mirror)))
            .collect(),
        ..Default::default()
    };
    let mut files = Vec::new();

    for (name, config) in &registry.configs {
        let dir = runtime.registry_tls_dir(name);
        let mut entry = ConfigEntry::default();

        if let Some(tls_secret) = config.tls_secret_name.as_deref().filter(|s| !s.is_empty()) {
            let secret = typed_secret(store, namespace, tls_secret, TLS_SECRET_TYPE).await?;
            let tls = entry.tls.get_or_insert_with(TlsEntry::default);
            if let Some(cert) = secret_bytes(&secret, TLS_CERT_KEY) {
                let file = PlanFile::new(format!("{}/tls.crt", dir), cert);
                tls.cert_file = file.path.clone();
                files.push(file);
            }
            if let Some(key) = secret_bytes(&secret, TLS_KEY_KEY) {
                let file = PlanFile::new(format!("{}/tls.key", dir), key).with_permissions("0600");
                tls.key_file = file.path.clone();
                files.push(file);
            }
        }

        if let Some(ca) = config.ca_bundle.as_deref().filter(|s| !s.is_empty()) {
            let file = PlanFile::new(format!("{}/ca.crt", dir), ca);
            entry.tls.get_or_insert_with(TlsEntry::default).ca_file = file.path.clone();
            files.push(file);
        }

        if config.insecure_skip_verify {
            entry.tls.get_or_insert_with(TlsEntry::default).insecure_skip_verify = true;
        }

        if let Some(auth_secret) = config
            .auth_config_secret_name
            .as_deref()
            .filter(|s| !s.is_empty())
        {
            let secret = typed_secret(store, namespace, auth_secret, AUTH_CONFIG_SECRET_TYPE).await?;
            entry.auth = Some(AuthEntry {
                username: secret_value(&secret, USERNAME_KEY),
                password: secret_value(&secret, PASSWORD_KEY),
                auth: secret_value(&secret, AUTH_KEY),
                identity_token: secret_value(&secret, IDENTITY_TOKEN_KEY),
            });
        }

        document.configs.insert(name.clone(), entry);
    }

    let config_path = runtime.registries_path();
    let yaml = serde_yaml::to_string(&document)
        .map_err(|e| Error::serialization_for_kind("registries.yaml", e.to_string()))?;
    files.insert(0, PlanFile::new(&config_path, yaml).with_permissions("0600"));

    Ok(RegistryFiles { config_path, files })
}
