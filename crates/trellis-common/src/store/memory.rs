//! In-memory [`ObjectStore`] with API-server semantics
//!
//! Used by tests and local runs. Emulates the parts of the API server the
//! controllers rely on: resource versions and optimistic concurrency,
//! status subresource separation, label selectors, finalizers with
//! deletion timestamps, and per-object watches. Every successful write is
//! counted so tests can assert that a reconciliation was a no-op.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::core::{ApiResource, DynamicObject};
use tokio::sync::{broadcast, RwLock};

use super::{display_name, matches_selector, name_of, namespace_of, ObjectStore, WatchEvent};
use crate::{Error, Result};

/// Identity of a stored object, independent of API version
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct StoreKey {
    group: String,
    kind: String,
    namespace: String,
    name: String,
}

impl StoreKey {
    fn new(resource: &ApiResource, namespace: &str, name: &str) -> Self {
        Self {
            group: resource.group.clone(),
            kind: resource.kind.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Default)]
struct State {
    objects: BTreeMap<StoreKey, DynamicObject>,
    next_version: u64,
}

impl State {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

/// Thread-safe in-memory object store
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
    events: broadcast::Sender<(StoreKey, WatchEvent)>,
    writes: Arc<AtomicU64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            state: Arc::new(RwLock::new(State::default())),
            events,
            writes: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Number of successful writes (create, replace, status, delete) so far
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of stored objects of the given kind
    pub async fn count(&self, resource: &ApiResource) -> usize {
        let state = self.state.read().await;
        state
            .objects
            .keys()
            .filter(|k| k.group == resource.group && k.kind == resource.kind)
            .count()
    }

    fn record(&self, key: StoreKey, event: WatchEvent) {
        self.writes.fetch_add(1, Ordering::SeqCst);
        // No receivers is fine
        let _ = self.events.send((key, event));
    }

    fn check_version(stored: &DynamicObject, incoming: &DynamicObject, kind: &str) -> Result<()> {
        match &incoming.metadata.resource_version {
            Some(version) if Some(version) != stored.metadata.resource_version.as_ref() => Err(
                Error::conflict(kind, display_name(namespace_of(stored), name_of(stored))),
            ),
            _ => Ok(()),
        }
    }
}

fn without_status(obj: &DynamicObject) -> serde_json::Value {
    let mut data = obj.data.clone();
    if let Some(map) = data.as_object_mut() {
        map.remove("status");
    }
    data
}

fn set_status(obj: &mut DynamicObject, status: Option<serde_json::Value>) {
    if !obj.data.is_object() {
        obj.data = serde_json::json!({});
    }
    if let Some(map) = obj.data.as_object_mut() {
        match status {
            Some(status) if !status.is_null() => {
                map.insert("status".to_string(), status);
            }
            _ => {
                map.remove("status");
            }
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<DynamicObject>> {
        let state = self.state.read().await;
        Ok(state
            .objects
            .get(&StoreKey::new(resource, namespace, name))
            .cloned())
    }

    async fn list(
        &self,
        resource: &ApiResource,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        let state = self.state.read().await;
        let empty = BTreeMap::new();
        Ok(state
            .objects
            .iter()
            .filter(|(k, _)| k.group == resource.group && k.kind == resource.kind)
            .filter(|(k, _)| namespace.is_empty() || k.namespace == namespace)
            .filter(|(_, obj)| {
                matches_selector(obj.metadata.labels.as_ref().unwrap_or(&empty), label_selector)
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }

    async fn create(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let namespace = namespace_of(obj);
        let name = name_of(obj);
        if name.is_empty() {
            return Err(Error::validation(format!(
                "{} without a name cannot be created",
                resource.kind
            )));
        }
        let key = StoreKey::new(resource, namespace, name);

        let mut state = self.state.write().await;
        if state.objects.contains_key(&key) {
            return Err(Error::already_exists(
                &resource.kind,
                display_name(namespace, name),
            ));
        }

        let mut stored = obj.clone();
        let version = state.bump();
        stored.metadata.resource_version = Some(version.clone());
        stored.metadata.uid = Some(format!("uid-{}", version));
        stored.metadata.generation = Some(1);
        stored.metadata.creation_timestamp = Some(Time(Utc::now()));
        stored.metadata.deletion_timestamp = None;
        if stored.types.is_none() {
            stored.types = Some(kube::core::TypeMeta {
                api_version: resource.api_version.clone(),
                kind: resource.kind.clone(),
            });
        }
        state.objects.insert(key.clone(), stored.clone());
        drop(state);

        self.record(key, WatchEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn replace(&self, resource: &ApiResource, obj: &DynamicObject) -> Result<DynamicObject> {
        let namespace = namespace_of(obj);
        let name = name_of(obj);
        let key = StoreKey::new(resource, namespace, name);

        let mut state = self.state.write().await;
        let current = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found(&resource.kind, display_name(namespace, name)))?;
        Self::check_version(&current, obj, &resource.kind)?;

        let mut stored = obj.clone();
        set_status(&mut stored, current.data.get("status").cloned());
        stored.metadata.uid = current.metadata.uid.clone();
        stored.metadata.creation_timestamp = current.metadata.creation_timestamp.clone();
        stored.metadata.deletion_timestamp = current.metadata.deletion_timestamp.clone();
        let generation = current.metadata.generation.unwrap_or(1);
        stored.metadata.generation = Some(if without_status(&current) != without_status(&stored) {
            generation + 1
        } else {
            generation
        });
        stored.metadata.resource_version = Some(state.bump());
        if stored.types.is_none() {
            stored.types = current.types.clone();
        }

        let finalized = stored.metadata.deletion_timestamp.is_some()
            && stored
                .metadata
                .finalizers
                .as_ref()
                .map_or(true, |f| f.is_empty());
        if finalized {
            state.objects.remove(&key);
            drop(state);
            self.record(key, WatchEvent::Deleted(stored.clone()));
        } else {
            state.objects.insert(key.clone(), stored.clone());
            drop(state);
            self.record(key, WatchEvent::Applied(stored.clone()));
        }
        Ok(stored)
    }

    async fn replace_status(
        &self,
        resource: &ApiResource,
        obj: &DynamicObject,
    ) -> Result<DynamicObject> {
        let namespace = namespace_of(obj);
        let name = name_of(obj);
        let key = StoreKey::new(resource, namespace, name);

        let mut state = self.state.write().await;
        let mut stored = state
            .objects
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found(&resource.kind, display_name(namespace, name)))?;
        Self::check_version(&stored, obj, &resource.kind)?;

        set_status(&mut stored, obj.data.get("status").cloned());
        stored.metadata.resource_version = Some(state.bump());
        state.objects.insert(key.clone(), stored.clone());
        drop(state);

        self.record(key, WatchEvent::Applied(stored.clone()));
        Ok(stored)
    }

    async fn delete(&self, resource: &ApiResource, namespace: &str, name: &str) -> Result<bool> {
        let key = StoreKey::new(resource, namespace, name);

        let mut state = self.state.write().await;
        let Some(mut stored) = state.objects.get(&key).cloned() else {
            return Ok(false);
        };

        let has_finalizers = stored
            .metadata
            .finalizers
            .as_ref()
            .is_some_and(|f| !f.is_empty());
        if has_finalizers {
            if stored.metadata.deletion_timestamp.is_some() {
                return Ok(true);
            }
            stored.metadata.deletion_timestamp = Some(Time(Utc::now()));
            stored.metadata.resource_version = Some(state.bump());
            state.objects.insert(key.clone(), stored.clone());
            drop(state);
            self.record(key, WatchEvent::Applied(stored));
        } else {
            state.objects.remove(&key);
            drop(state);
            self.record(key, WatchEvent::Deleted(stored));
        }
        Ok(true)
    }

    async fn watch(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent>>> {
        let key = StoreKey::new(resource, namespace, name);
        // Subscribe before reading so no change between the two is lost
        let receiver = self.events.subscribe();
        let current = self.get(resource, namespace, name).await?;

        let initial = stream::iter(current.map(|obj| Ok(WatchEvent::Applied(obj))));
        let updates = stream::unfold((receiver, key), |(mut receiver, key)| async move {
            loop {
                match receiver.recv().await {
                    Ok((event_key, event)) if event_key == key => {
                        return Some((Ok(event), (receiver, key)))
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(initial.chain(updates).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::build_api_resource;
    use std::time::Duration;

    fn secrets() -> ApiResource {
        build_api_resource("v1", "Secret")
    }

    fn secret(name: &str, labels: &[(&str, &str)]) -> DynamicObject {
        let mut obj = DynamicObject::new(name, &secrets()).within("default");
        obj.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        obj.data = serde_json::json!({ "type": "Opaque" });
        obj
    }

    #[tokio::test]
    async fn test_create_assigns_metadata_and_rejects_duplicates() {
        let store = MemoryStore::new();
        let created = store.create(&secrets(), &secret("a", &[])).await.unwrap();
        assert!(created.metadata.resource_version.is_some());
        assert!(created.metadata.uid.is_some());

        let err = store.create(&secrets(), &secret("a", &[])).await.unwrap_err();
        assert!(err.is_already_exists());
        assert_eq!(store.writes(), 1);
    }

    #[tokio::test]
    async fn test_replace_with_stale_version_conflicts() {
        let store = MemoryStore::new();
        let created = store.create(&secrets(), &secret("a", &[])).await.unwrap();

        let mut first = created.clone();
        first.data["data"] = serde_json::json!({"k": "djE="});
        store.replace(&secrets(), &first).await.unwrap();

        let mut stale = created;
        stale.data["data"] = serde_json::json!({"k": "djI="});
        let err = store.replace(&secrets(), &stale).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_status_is_separate_from_content() {
        let store = MemoryStore::new();
        let created = store.create(&secrets(), &secret("a", &[])).await.unwrap();

        let mut with_status = created.clone();
        with_status.data["status"] = serde_json::json!({"ready": true});
        let updated = store.replace_status(&secrets(), &with_status).await.unwrap();
        assert_eq!(updated.data["status"]["ready"], true);

        // A content replace without status keeps the stored status
        let mut content = updated.clone();
        content.data.as_object_mut().unwrap().remove("status");
        content.data["immutable"] = serde_json::json!(true);
        let replaced = store.replace(&secrets(), &content).await.unwrap();
        assert_eq!(replaced.data["status"]["ready"], true);
        assert_eq!(replaced.metadata.generation, Some(2));
    }

    #[tokio::test]
    async fn test_list_filters_by_selector_and_namespace() {
        let store = MemoryStore::new();
        store.create(&secrets(), &secret("a", &[("role", "plan")])).await.unwrap();
        store.create(&secrets(), &secret("b", &[("role", "bootstrap")])).await.unwrap();
        let other = secret("c", &[("role", "plan")]).within("other");
        store.create(&secrets(), &other).await.unwrap();

        assert_eq!(store.list(&secrets(), "default", "role=plan").await.unwrap().len(), 1);
        assert_eq!(store.list(&secrets(), "", "role=plan").await.unwrap().len(), 2);
        assert_eq!(store.list(&secrets(), "default", "").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_finalizers_defer_deletion() {
        let store = MemoryStore::new();
        let mut obj = secret("a", &[]);
        obj.metadata.finalizers = Some(vec!["trellis.dev/cleanup".into()]);
        store.create(&secrets(), &obj).await.unwrap();

        assert!(store.delete(&secrets(), "default", "a").await.unwrap());
        let pending = store.get(&secrets(), "default", "a").await.unwrap().unwrap();
        assert!(pending.metadata.deletion_timestamp.is_some());

        let mut released = pending;
        released.metadata.finalizers = Some(vec![]);
        store.replace(&secrets(), &released).await.unwrap();
        assert!(store.get(&secrets(), "default", "a").await.unwrap().is_none());
        assert!(!store.delete(&secrets(), "default", "a").await.unwrap());
    }

    #[tokio::test]
    async fn test_watch_delivers_current_then_changes() {
        let store = MemoryStore::new();
        let created = store.create(&secrets(), &secret("a", &[])).await.unwrap();
        let mut events = store.watch(&secrets(), "default", "a").await.unwrap();

        let first = events.next().await.unwrap().unwrap();
        assert!(matches!(first, WatchEvent::Applied(_)));

        store.create(&secrets(), &secret("unrelated", &[])).await.unwrap();
        let mut labelled = created;
        labelled.metadata.labels = Some([("x".to_string(), "y".to_string())].into());
        store.replace(&secrets(), &labelled).await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(1), events.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        match next {
            WatchEvent::Applied(obj) => assert_eq!(name_of(&obj), "a"),
            WatchEvent::Deleted(_) => panic!("expected an update"),
        }
    }
}
