//! Allow-list pruning against registered dynamic schemas
//!
//! Node configs are arbitrary objects defined by infrastructure drivers.
//! Before their parameters are copied into a machine template, unknown
//! fields are dropped using the `DynamicSchema` registered for the kind
//! (named after the lowercased kind). Kinds without a registered schema
//! pass through unmodified.

use serde_json::{Map, Value};
use trellis_common::crd::DynamicSchema;
use trellis_common::store::{typed, ObjectStore};
use trellis_common::Result;

/// Fields every node config carries that are never driver parameters
const OBJECT_FIELDS: &[&str] = &["apiVersion", "kind", "metadata", "status"];

/// Registered schemas, looked up through the store
pub struct SchemaRegistry<'a> {
    store: &'a dyn ObjectStore,
}

impl<'a> SchemaRegistry<'a> {
    /// Registry reading schemas from `store`
    pub fn new(store: &'a dyn ObjectStore) -> Self {
        Self { store }
    }

    /// Schema registered for `kind`, if any
    pub async fn lookup(&self, kind: &str) -> Result<Option<DynamicSchema>> {
        typed::get::<DynamicSchema>(self.store, "", &kind.to_lowercase()).await
    }

    /// Driver parameters of a node config, pruned to the registered fields
    ///
    /// Object bookkeeping (`apiVersion`, `kind`, `metadata`, `status`) is
    /// always removed.
    pub async fn prune(&self, kind: &str, data: &Value) -> Result<Map<String, Value>> {
        let mut fields: Map<String, Value> = data.as_object().cloned().unwrap_or_default();
        for key in OBJECT_FIELDS {
            fields.remove(*key);
        }

        if let Some(schema) = self.lookup(kind).await? {
            fields.retain(|key, _| schema.spec.resource_fields.contains_key(key));
        }
        Ok(fields)
    }
}
