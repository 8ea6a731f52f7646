//! Prune-on-apply materialization of desired object sets
//!
//! An [`ApplyEngine`] makes the live set of objects owned by
//! `(owner, set_id)` match a desired list exactly: missing objects are
//! created, changed ones updated, and objects no longer desired deleted.
//!
//! Ownership is tracked by an explicit index record (a ConfigMap named
//! `apply-<hash>`) listing every object in the set together with the hash
//! of the content last applied. Unchanged input therefore costs one read
//! of the index plus one read per object, and no writes.
//!
//! The batch is not transactional. The index is widened to include new
//! objects before they are created and narrowed only after every
//! operation succeeded, so a retried batch always finds what an aborted
//! one left behind.
//!
//! Change detection trusts the applied-hash annotation. An object whose
//! annotation matches the desired hash is left alone even if another actor
//! edited its managed fields; such drift is corrected on the next change to
//! the desired content, or when the object is deleted and recreated. Live
//! content is never compared field by field, since the API server rewrites
//! some fields (`stringData`, defaults) and the comparison would never settle.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::core::{DynamicObject, ObjectMeta};
use kube::Resource;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use trellis_common::naming::{build_api_resource, deterministic_hash};
use trellis_common::store::{self, typed, ObjectStore};
use trellis_common::{Error, Result};

/// Label on applied objects and indexes: hash of the owner identity
pub const OWNER_HASH_LABEL: &str = "apply.trellis.dev/owner-hash";
/// Label on applied objects and indexes: hash of `(owner, set_id)`
pub const SET_HASH_LABEL: &str = "apply.trellis.dev/set-hash";
/// Annotation on applied objects: readable owner identity
pub const OWNER_ANNOTATION: &str = "apply.trellis.dev/owner";
/// Annotation on applied objects: set identifier
pub const SET_ID_ANNOTATION: &str = "apply.trellis.dev/set-id";
/// Annotation on applied objects: hash of the normalized desired content
pub const APPLIED_HASH_ANNOTATION: &str = "apply.trellis.dev/applied-hash";
/// Annotation on applied objects: label and annotation keys the engine wrote
pub const MANAGED_METADATA_ANNOTATION: &str = "apply.trellis.dev/managed-metadata";

const INDEX_OBJECTS_KEY: &str = "objects";
const INDEX_OWNER_KEY: &str = "owner";
const INDEX_SET_KEY: &str = "set-id";

/// Identity of the object that owns an apply set
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerKey {
    /// Owner apiVersion
    pub api_version: String,
    /// Owner kind
    pub kind: String,
    /// Owner namespace, empty for cluster-scoped owners
    pub namespace: String,
    /// Owner name
    pub name: String,
    /// Owner UID, needed for ownerReferences
    pub uid: Option<String>,
}

impl OwnerKey {
    /// Owner key for a typed object
    pub fn of<K: Resource<DynamicType = ()>>(obj: &K) -> Self {
        let meta = obj.meta();
        Self {
            api_version: K::api_version(&()).to_string(),
            kind: K::kind(&()).to_string(),
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
            uid: meta.uid.clone(),
        }
    }

    /// Owner key for an object identity, used when cascading deletes
    pub fn from_identity(id: &ObjectIdentity) -> Self {
        Self {
            api_version: id.api_version.clone(),
            kind: id.kind.clone(),
            namespace: id.namespace.clone(),
            name: id.name.clone(),
            uid: None,
        }
    }

    /// Readable identity, `apiVersion/Kind namespace/name`
    pub fn id(&self) -> String {
        format!(
            "{}/{} {}",
            self.api_version,
            self.kind,
            store::display_name(&self.namespace, &self.name)
        )
    }

    /// Stable hash of the identity, safe for label values
    pub fn hash(&self) -> String {
        deterministic_hash(&self.id())
    }

    fn set_hash(&self, set_id: &str) -> String {
        deterministic_hash(&format!("{}#{}", self.id(), set_id))
    }
}

/// Identity of an applied object
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectIdentity {
    /// apiVersion of the object
    pub api_version: String,
    /// Kind of the object
    pub kind: String,
    /// Namespace, empty for cluster-scoped objects
    #[serde(default)]
    pub namespace: String,
    /// Name of the object
    pub name: String,
}

impl ObjectIdentity {
    /// Identity with the given fields
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    fn of(obj: &DynamicObject) -> Result<Self> {
        let types = obj
            .types
            .as_ref()
            .ok_or_else(|| Error::internal_with_context("apply", "desired object has no kind"))?;
        let name = store::name_of(obj);
        if name.is_empty() {
            return Err(Error::internal_with_context(
                "apply",
                format!("desired {} has no name", types.kind),
            ));
        }
        Ok(Self::new(
            &types.api_version,
            &types.kind,
            store::namespace_of(obj),
            name,
        ))
    }

    fn display(&self) -> String {
        format!(
            "{} {}",
            self.kind,
            store::display_name(&self.namespace, &self.name)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct IndexEntry {
    #[serde(flatten)]
    id: ObjectIdentity,
    #[serde(default)]
    hash: String,
}

/// What an apply call changed
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Objects created
    pub created: usize,
    /// Objects updated
    pub updated: usize,
    /// Objects deleted, cascaded children included
    pub deleted: usize,
    /// Desired objects that already matched
    pub unchanged: usize,
}

impl ApplyReport {
    /// Whether nothing was written
    pub fn is_noop(&self) -> bool {
        self.created == 0 && self.updated == 0 && self.deleted == 0
    }
}

/// Materializes desired object sets against an [`ObjectStore`]
pub struct ApplyEngine {
    store: Arc<dyn ObjectStore>,
    system_namespace: String,
    owner_references: bool,
}

impl ApplyEngine {
    /// Create an engine; indexes of cluster-scoped owners live in `system_namespace`
    pub fn new(
        store: Arc<dyn ObjectStore>,
        system_namespace: impl Into<String>,
        owner_references: bool,
    ) -> Self {
        Self {
            store,
            system_namespace: system_namespace.into(),
            owner_references,
        }
    }

    /// Make the objects owned by `(owner, set_id)` match `desired` exactly
    pub async fn apply(
        &self,
        owner: &OwnerKey,
        set_id: &str,
        desired: Vec<DynamicObject>,
    ) -> Result<ApplyReport> {
        self.apply_retaining(owner, set_id, desired, &BTreeSet::new())
            .await
    }

    /// Like [`apply`](Self::apply), but leaves the listed existing members untouched
    ///
    /// Retained objects stay in the set without being compared or rewritten,
    /// which lets a caller keep objects it can no longer reproduce exactly
    /// (for example machines built from a previous template).
    pub async fn apply_retaining(
        &self,
        owner: &OwnerKey,
        set_id: &str,
        desired: Vec<DynamicObject>,
        retain: &BTreeSet<ObjectIdentity>,
    ) -> Result<ApplyReport> {
        let desired = self.normalize(owner, set_id, desired)?;
        let index_name = format!("apply-{}", owner.set_hash(set_id));
        let index_namespace = self.index_namespace(owner);

        let index = typed::get::<ConfigMap>(self.store.as_ref(), &index_namespace, &index_name)
            .await?;
        let previous = match &index {
            Some(cm) => read_index(cm)?,
            None => BTreeMap::new(),
        };

        let mut report = ApplyReport::default();
        let mut to_create = Vec::new();
        let mut to_update = Vec::new();

        for (id, (hash, obj)) in &desired {
            match previous.get(id) {
                Some(previous_hash) if previous_hash == hash => {
                    let live = self
                        .store
                        .get(&build_api_resource(&id.api_version, &id.kind), &id.namespace, &id.name)
                        .await?;
                    if live.is_some() {
                        report.unchanged += 1;
                    } else {
                        to_create.push((id, obj));
                    }
                }
                Some(_) => to_update.push((id, obj)),
                None => to_create.push((id, obj)),
            }
        }
        let to_delete: Vec<&ObjectIdentity> = previous
            .keys()
            .filter(|id| !desired.contains_key(*id) && !retain.contains(*id))
            .collect();

        if to_create.is_empty() && to_update.is_empty() && to_delete.is_empty() {
            return Ok(report);
        }

        // Widen the index first so an aborted batch never loses a created object
        if to_create.iter().any(|(id, _)| !previous.contains_key(*id)) {
            let mut widened = previous.clone();
            for (id, _) in &to_create {
                widened.entry((*id).clone()).or_default();
            }
            self.write_index(owner, set_id, &index_namespace, &index_name, &widened)
                .await?;
        }

        for (id, obj) in to_create {
            let api = build_api_resource(&id.api_version, &id.kind);
            match self.store.create(&api, obj).await {
                Ok(_) => {
                    debug!(object = %id.display(), set = set_id, "created");
                    report.created += 1;
                }
                Err(e) if e.is_already_exists() => {
                    if self.update_live(id, obj).await? {
                        report.updated += 1;
                    } else {
                        report.unchanged += 1;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        for (id, obj) in to_update {
            if self.update_live(id, obj).await? {
                debug!(object = %id.display(), set = set_id, "updated");
                report.updated += 1;
            } else {
                report.unchanged += 1;
            }
        }

        for id in to_delete {
            report.deleted += self.delete_cascading(id).await?;
        }

        let mut narrowed: BTreeMap<ObjectIdentity, String> = desired
            .iter()
            .map(|(id, (hash, _))| (id.clone(), hash.clone()))
            .collect();
        for id in retain {
            if let Some(hash) = previous.get(id) {
                narrowed.insert(id.clone(), hash.clone());
            }
        }
        self.write_index(owner, set_id, &index_namespace, &index_name, &narrowed)
            .await?;

        info!(
            owner = %owner.id(),
            set = set_id,
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            "applied object set"
        );
        Ok(report)
    }

    /// Delete every object owned by `owner` in any set, cascading to their children
    pub async fn purge(&self, owner: &OwnerKey) -> Result<usize> {
        let mut deleted = 0;
        let selector = store::selector(&[(OWNER_HASH_LABEL, &owner.hash())]);
        for index in typed::list::<ConfigMap>(self.store.as_ref(), "", &selector).await? {
            for id in read_index(&index)?.keys() {
                deleted += self.delete_cascading(id).await?;
            }
            self.delete_index(&index).await?;
        }
        Ok(deleted)
    }

    /// The current members of a set, as recorded in its index
    #[cfg(test)]
    pub async fn members(&self, owner: &OwnerKey, set_id: &str) -> Result<Vec<ObjectIdentity>> {
        let index = typed::get::<ConfigMap>(
            self.store.as_ref(),
            &self.index_namespace(owner),
            &format!("apply-{}", owner.set_hash(set_id)),
        )
        .await?;
        Ok(match index {
            Some(cm) => read_index(&cm)?.into_keys().collect(),
            None => Vec::new(),
        })
    }

    fn index_namespace(&self, owner: &OwnerKey) -> String {
        if owner.namespace.is_empty() {
            self.system_namespace.clone()
        } else {
            owner.namespace.clone()
        }
    }

    /// Default namespaces, hash content and stamp ownership metadata
    fn normalize(
        &self,
        owner: &OwnerKey,
        set_id: &str,
        desired: Vec<DynamicObject>,
    ) -> Result<BTreeMap<ObjectIdentity, (String, DynamicObject)>> {
        let mut out = BTreeMap::new();
        for mut obj in desired {
            if obj.metadata.namespace.is_none() && !owner.namespace.is_empty() {
                obj.metadata.namespace = Some(owner.namespace.clone());
            }
            let id = ObjectIdentity::of(&obj)?;
            let hash = content_hash(&obj)?;
            let managed = serde_json::to_string(&ManagedMetadata::of(&obj))?;

            let labels = obj.metadata.labels.get_or_insert_with(BTreeMap::new);
            labels.insert(OWNER_HASH_LABEL.to_string(), owner.hash());
            labels.insert(SET_HASH_LABEL.to_string(), owner.set_hash(set_id));

            let annotations = obj.metadata.annotations.get_or_insert_with(BTreeMap::new);
            annotations.insert(OWNER_ANNOTATION.to_string(), owner.id());
            annotations.insert(SET_ID_ANNOTATION.to_string(), set_id.to_string());
            annotations.insert(APPLIED_HASH_ANNOTATION.to_string(), hash.clone());
            annotations.insert(MANAGED_METADATA_ANNOTATION.to_string(), managed);

            if self.owner_references && id.namespace == owner.namespace {
                if let Some(uid) = &owner.uid {
                    obj.metadata.owner_references = Some(vec![OwnerReference {
                        api_version: owner.api_version.clone(),
                        kind: owner.kind.clone(),
                        name: owner.name.clone(),
                        uid: uid.clone(),
                        controller: Some(true),
                        block_owner_deletion: Some(true),
                    }]);
                }
            }

            if out.insert(id.clone(), (hash, obj)).is_some() {
                return Err(Error::internal_with_context(
                    "apply",
                    format!("duplicate desired object {}", id.display()),
                ));
            }
        }
        Ok(out)
    }

    /// Bring a live object to the desired content; returns whether it wrote
    ///
    /// A live object already carrying the desired applied hash is not rewritten.
    async fn update_live(&self, id: &ObjectIdentity, desired: &DynamicObject) -> Result<bool> {
        let api = build_api_resource(&id.api_version, &id.kind);
        let Some(live) = self.store.get(&api, &id.namespace, &id.name).await? else {
            self.store.create(&api, desired).await?;
            return Ok(true);
        };
        if applied_hash(&live) == applied_hash(desired) {
            return Ok(false);
        }
        self.store.replace(&api, &merge_for_update(&live, desired)).await?;
        Ok(true)
    }

    /// Delete one object and everything applied under it as owner
    async fn delete_cascading(&self, root: &ObjectIdentity) -> Result<usize> {
        let mut deleted = 0;
        let mut pending = vec![root.clone()];
        while let Some(id) = pending.pop() {
            let api = build_api_resource(&id.api_version, &id.kind);
            if self.store.delete(&api, &id.namespace, &id.name).await? {
                debug!(object = %id.display(), "deleted");
                deleted += 1;
            }
            let owner = OwnerKey::from_identity(&id);
            let selector = store::selector(&[(OWNER_HASH_LABEL, &owner.hash())]);
            for index in typed::list::<ConfigMap>(self.store.as_ref(), "", &selector).await? {
                pending.extend(read_index(&index)?.into_keys());
                self.delete_index(&index).await?;
            }
        }
        Ok(deleted)
    }

    async fn write_index(
        &self,
        owner: &OwnerKey,
        set_id: &str,
        namespace: &str,
        name: &str,
        entries: &BTreeMap<ObjectIdentity, String>,
    ) -> Result<()> {
        let existing = typed::get::<ConfigMap>(self.store.as_ref(), namespace, name).await?;

        if entries.is_empty() {
            if existing.is_some() {
                typed::delete::<ConfigMap>(self.store.as_ref(), namespace, name).await?;
            }
            return Ok(());
        }

        let objects: Vec<IndexEntry> = entries
            .iter()
            .map(|(id, hash)| IndexEntry {
                id: id.clone(),
                hash: hash.clone(),
            })
            .collect();
        let data = BTreeMap::from([
            (INDEX_OWNER_KEY.to_string(), owner.id()),
            (INDEX_SET_KEY.to_string(), set_id.to_string()),
            (INDEX_OBJECTS_KEY.to_string(), serde_json::to_string(&objects)?),
        ]);

        match existing {
            Some(mut cm) => {
                if cm.data.as_ref() == Some(&data) {
                    return Ok(());
                }
                cm.data = Some(data);
                typed::replace(self.store.as_ref(), &cm).await?;
            }
            None => {
                let cm = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(name.to_string()),
                        namespace: Some(namespace.to_string()),
                        labels: Some(BTreeMap::from([
                            (OWNER_HASH_LABEL.to_string(), owner.hash()),
                            (SET_HASH_LABEL.to_string(), owner.set_hash(set_id)),
                        ])),
                        ..Default::default()
                    },
                    data: Some(data),
                    ..Default::default()
                };
                typed::create(self.store.as_ref(), &cm).await?;
            }
        }
        Ok(())
    }

    async fn delete_index(&self, index: &ConfigMap) -> Result<()> {
        let namespace = index.metadata.namespace.as_deref().unwrap_or("");
        let name = index.metadata.name.as_deref().unwrap_or("");
        typed::delete::<ConfigMap>(self.store.as_ref(), namespace, name).await?;
        Ok(())
    }
}

fn read_index(cm: &ConfigMap) -> Result<BTreeMap<ObjectIdentity, String>> {
    let Some(raw) = cm.data.as_ref().and_then(|d| d.get(INDEX_OBJECTS_KEY)) else {
        return Ok(BTreeMap::new());
    };
    let entries: Vec<IndexEntry> = serde_json::from_str(raw).map_err(|e| {
        Error::internal_with_context("apply", format!("unreadable apply index: {}", e))
    })?;
    Ok(entries.into_iter().map(|e| (e.id, e.hash)).collect())
}

/// Hash of the parts of an object the engine manages
fn content_hash(obj: &DynamicObject) -> Result<String> {
    let mut data = obj.data.clone();
    if let Some(map) = data.as_object_mut() {
        map.remove("status");
    }
    let normalized = serde_json::json!({
        "types": obj.types,
        "labels": obj.metadata.labels,
        "annotations": obj.metadata.annotations,
        "data": data,
    });
    Ok(deterministic_hash(&serde_json::to_string(&normalized)?))
}

fn applied_hash(obj: &DynamicObject) -> Option<&str> {
    obj.metadata
        .annotations
        .as_ref()
        .and_then(|a| a.get(APPLIED_HASH_ANNOTATION))
        .map(String::as_str)
}

/// Label and annotation keys that came from the desired object
#[derive(Debug, Default, Serialize, Deserialize)]
struct ManagedMetadata {
    #[serde(default)]
    labels: BTreeSet<String>,
    #[serde(default)]
    annotations: BTreeSet<String>,
}

impl ManagedMetadata {
    fn of(obj: &DynamicObject) -> Self {
        let keys = |map: &Option<BTreeMap<String, String>>| -> BTreeSet<String> {
            map.iter().flat_map(|m| m.keys().cloned()).collect()
        };
        Self {
            labels: keys(&obj.metadata.labels),
            annotations: keys(&obj.metadata.annotations),
        }
    }

    /// Keys recorded on a previously applied object; unreadable means none
    fn recorded(obj: &DynamicObject) -> Self {
        obj.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(MANAGED_METADATA_ANNOTATION))
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default()
    }
}

/// Overlay desired content onto the live object
///
/// Labels and annotations are merged, and keys the engine wrote last time
/// but no longer desires are removed. Top-level fields present in the
/// desired object replace the live ones, and everything else (status,
/// fields written by other actors) is kept. The live resourceVersion is
/// carried so a concurrent writer causes a conflict instead of a lost update.
fn merge_for_update(live: &DynamicObject, desired: &DynamicObject) -> DynamicObject {
    let mut merged = live.clone();
    merged.types = desired.types.clone();

    let previous = ManagedMetadata::recorded(live);
    let current = ManagedMetadata::of(desired);
    if let Some(labels) = merged.metadata.labels.as_mut() {
        labels.retain(|k, _| !previous.labels.contains(k) || current.labels.contains(k));
    }
    if let Some(annotations) = merged.metadata.annotations.as_mut() {
        annotations
            .retain(|k, _| !previous.annotations.contains(k) || current.annotations.contains(k));
    }

    if let Some(labels) = &desired.metadata.labels {
        merged
            .metadata
            .labels
            .get_or_insert_with(BTreeMap::new)
            .extend(labels.clone());
    }
    if let Some(annotations) = &desired.metadata.annotations {
        merged
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .extend(annotations.clone());
    }
    if desired.metadata.owner_references.is_some() {
        merged.metadata.owner_references = desired.metadata.owner_references.clone();
    }

    if !merged.data.is_object() {
        merged.data = serde_json::json!({});
    }
    if let (Some(target), Some(source)) = (merged.data.as_object_mut(), desired.data.as_object()) {
        for (key, value) in source {
            if key != "status" {
                target.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}
