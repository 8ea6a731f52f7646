//! [`ObjectStore`] backed by the Kubernetes API server

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::core::{ApiResource, DynamicObject};
use kube::runtime::watcher;
use kube::Client;

use super::{display_name, name_of, namespace_of, ObjectStore, WatchEvent};
use crate::{Error, Result};

/// Store that forwards every call to the API server
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), resource)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, resource)
        }
    }
}

/// Map API status codes onto the store's error taxonomy
fn map_write_error(err: kube::Error, kind: &str, name: String) -> Error {
    match &err {
        kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists" => {
            Error::already_exists(kind, name)
        }
        kube::Error::Api(ae) if ae.code == 409 => Error::conflict(kind, name),
        kube::Error::Api(ae) if ae.code == 404 => Error::not_found(kind, name),
        _ => Error::from(err),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        Ok(self.api(resource, namespace).get_opt(name).await?)
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let mut params = ListParams::default();
        if !label_selector.is_empty() {
            params = params.labels(label_selector);
        }
        let list = self.api(resource, namespace).list(&params).await?;
        Ok(list.items)
    }

    async fn create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let namespace = namespace_of(obj);
        self.api(resource, namespace)
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| map_write_error(e, &resource.kind, display_name(namespace, name_of(obj))))
    }

    async fn replace(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let namespace = namespace_of(obj);
        let name = name_of(obj);
        self.api(resource, namespace)
            .replace(name, &PostParams::default(), obj)
            .await
            .map_err(|e| map_write_error(e, &resource.kind, display_name(namespace, name)))
    }

    async fn replace_status(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let namespace = namespace_of(obj);
        let name = name_of(obj);
        // resourceVersion in a merge patch is a precondition on the write
        let patch = serde_json::json!({
            "metadata": { "resourceVersion": obj.metadata.resource_version },
            "status": obj.data.get("status"),
        });
        self.api(resource, namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| map_write_error(e, &resource.kind, display_name(namespace, name)))
    }

    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<bool> {
        match self
            .api(resource, namespace)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn watch(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent>>> {
        let config = watcher::Config::default().fields(&format!("metadata.name={}", name));
        let stream = watcher(self.api(resource, namespace), config)
            .map_err(|e| Error::internal_with_context("watcher", e.to_string()))
            .try_filter_map(|event| async move {
                Ok(match event {
                    watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                        Some(WatchEvent::Applied(obj))
                    }
                    watcher::Event::Delete(obj) => Some(WatchEvent::Deleted(obj)),
                    watcher::Event::Init | watcher::Event::InitDone => None,
                })
            });
        Ok(stream.boxed())
    }
}
