//! Backing store abstraction
//!
//! Controllers talk to the store through [`ObjectStore`], which works on
//! untyped [`DynamicObject`]s so dynamic kinds (node configs, machine
//! templates) flow through the same code as built-in ones. The [`typed`]
//! helpers convert to and from concrete resource types.
//!
//! Namespaces are passed as `&str`; an empty namespace means a
//! cluster-scoped object, or all namespaces for `list`.

mod kube_store;
mod memory;
pub mod typed;

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use kube::core::{ApiResource, DynamicObject};
#[cfg(test)]
use mockall::automock;

use crate::Result;

pub use kube_store::KubeStore;
pub use memory::MemoryStore;

/// A change observed on a watched object
#[derive(Clone, Debug)]
pub enum WatchEvent {
    /// Object was created or updated
    Applied(DynamicObject),
    /// Object was removed
    Deleted(DynamicObject),
}

/// CRUD and watch over a Kubernetes-shaped object store
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch an object; `Ok(None)` when it does not exist
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>>;

    /// List objects matching an equality-based label selector (`a=b,c`)
    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>>;

    /// Create an object; fails with `AlreadyExists` when the name is taken
    async fn create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace an object's content; status is left untouched
    ///
    /// Fails with `Conflict` when the object's resourceVersion is set and
    /// does not match the stored one.
    async fn replace(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Replace only the status of an object, with the same concurrency check
    async fn replace_status(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject>;

    /// Delete an object; returns false when it did not exist
    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<bool>;

    /// Watch a single object by name
    ///
    /// The current state is delivered first when the object exists.
    async fn watch(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent>>>;
}

/// `namespace/name` display form used in errors and logs
pub fn display_name(namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", namespace, name)
    }
}

/// Namespace of an object, empty for cluster-scoped objects
pub fn namespace_of(obj: &DynamicObject) -> &str {
    obj.metadata.namespace.as_deref().unwrap_or("")
}

/// Name of an object, empty when unset
pub fn name_of(obj: &DynamicObject) -> &str {
    obj.metadata.name.as_deref().unwrap_or("")
}

/// Build a selector string from label pairs
pub fn selector(labels: &[(&str, &str)]) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Evaluate an equality-based label selector against a label map
///
/// Supports `k=v`, `k==v`, `k!=v`, `k` (exists) and `!k` (absent).
pub fn matches_selector(labels: &BTreeMap<String, String>, label_selector: &str) -> bool {
    label_selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| {
            if let Some((key, value)) = term.split_once("!=") {
                labels.get(key.trim()).map(String::as_str) != Some(value.trim())
            } else if let Some((key, value)) = term.split_once("==") {
                labels.get(key.trim()).map(String::as_str) == Some(value.trim())
            } else if let Some((key, value)) = term.split_once('=') {
                labels.get(key.trim()).map(String::as_str) == Some(value.trim())
            } else if let Some(key) = term.strip_prefix('!') {
                !labels.contains_key(key.trim())
            } else {
                labels.contains_key(term)
            }
        })
}
