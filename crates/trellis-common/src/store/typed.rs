//! Typed access on top of [`ObjectStore`]
//!
//! Converts between concrete resource types and [`DynamicObject`] through
//! their JSON form, so any `k8s-openapi` type or CRD works unchanged.

use kube::core::{ApiResource, DynamicObject, TypeMeta};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::ObjectStore;
use crate::Result;

/// The ApiResource for a statically known type
pub fn api_resource<K: Resource<DynamicType = ()>>() -> ApiResource {
    ApiResource::erase::<K>(&())
}

/// Convert a typed object to its untyped form, filling in apiVersion/kind
pub fn to_dynamic<K>(obj: &K) -> Result<DynamicObject>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let mut dynamic: DynamicObject = serde_json::from_value(serde_json::to_value(obj)?)?;
    if dynamic.types.is_none() {
        dynamic.types = Some(TypeMeta {
            api_version: K::api_version(&()).to_string(),
            kind: K::kind(&()).to_string(),
        });
    }
    Ok(dynamic)
}

/// Convert an untyped object into a concrete type
pub fn from_dynamic<K: DeserializeOwned>(obj: DynamicObject) -> Result<K> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// Fetch a typed object; `Ok(None)` when absent
pub async fn get<K>(store: &dyn ObjectStore, namespace: &str, name: &str) -> Result<Option<K>>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    store
        .get(&api_resource::<K>(), namespace, name)
        .await?
        .map(from_dynamic)
        .transpose()
}

/// List typed objects matching a label selector
pub async fn list<K>(store: &dyn ObjectStore, namespace: &str, label_selector: &str) -> Result<Vec<K>>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    store
        .list(&api_resource::<K>(), namespace, label_selector)
        .await?
        .into_iter()
        .map(from_dynamic)
        .collect()
}

/// Create a typed object
pub async fn create<K>(store: &dyn ObjectStore, obj: &K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    let created = store.create(&api_resource::<K>(), &to_dynamic(obj)?).await?;
    from_dynamic(created)
}

/// Replace a typed object's content
pub async fn replace<K>(store: &dyn ObjectStore, obj: &K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    let replaced = store.replace(&api_resource::<K>(), &to_dynamic(obj)?).await?;
    from_dynamic(replaced)
}

/// Replace a typed object's status
pub async fn replace_status<K>(store: &dyn ObjectStore, obj: &K) -> Result<K>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
{
    let replaced = store
        .replace_status(&api_resource::<K>(), &to_dynamic(obj)?)
        .await?;
    from_dynamic(replaced)
}

/// Delete a typed object; returns false when it did not exist
pub async fn delete<K>(store: &dyn ObjectStore, namespace: &str, name: &str) -> Result<bool>
where
    K: Resource<DynamicType = ()>,
{
    store.delete(&api_resource::<K>(), namespace, name).await
}
