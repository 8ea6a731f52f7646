//! Management resources: users, tokens and registered schemas
//!
//! All of these are cluster-scoped.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A principal that can hold tokens
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "management.trellis.dev",
    version = "v1",
    kind = "User",
    plural = "users"
)]
#[serde(rename_all = "camelCase")]
pub struct UserSpec {
    /// Human readable name
    #[serde(default)]
    pub display_name: String,
    /// Principals this user represents
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub principal_ids: Vec<String>,
}

/// A bearer credential issued to a user
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "management.trellis.dev",
    version = "v1",
    kind = "Token",
    plural = "tokens"
)]
#[serde(rename_all = "camelCase")]
pub struct TokenSpec {
    /// Owning user
    pub user_id: String,
    /// Provider that authenticated the user
    pub auth_provider: String,
    /// Token secret, or `$2:<salt>:<hash>` when hashing is enabled
    pub token: String,
    /// Issued by the control plane rather than by a login
    #[serde(default)]
    pub is_derived: bool,
    /// Cluster the token is scoped to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_name: Option<String>,
    /// Human readable description
    #[serde(default)]
    pub description: String,
}

/// Allow-list of fields for a dynamically registered kind
///
/// Named after the lowercased kind (for example `digitaloceanconfig`).
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "management.trellis.dev",
    version = "v1",
    kind = "DynamicSchema",
    plural = "dynamicschemas"
)]
#[serde(rename_all = "camelCase")]
pub struct DynamicSchemaSpec {
    /// Known fields keyed by JSON field name
    #[serde(default)]
    pub resource_fields: BTreeMap<String, SchemaField>,
}

/// One field of a dynamic schema
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchemaField {
    /// Field type (string, int, boolean, array[string], ...)
    #[serde(rename = "type", default)]
    pub type_: String,
    /// Description shown in UIs
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn test_management_crds_are_cluster_scoped() {
        assert_eq!(User::crd().spec.scope, "Cluster");
        assert_eq!(Token::crd().spec.scope, "Cluster");
        assert_eq!(DynamicSchema::crd().spec.scope, "Cluster");
    }
}
