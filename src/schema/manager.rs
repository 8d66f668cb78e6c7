use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::Schema;
use crate::Error;
use crate::Result;

/// Registry of schemas, passed explicitly to every component that needs it.
#[derive(Debug, Default)]
pub struct SchemaManager {
    ordered: Vec<Arc<Schema>>,
    by_id: HashMap<String, Arc<Schema>>,
}

impl SchemaManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns `Error::InvalidConfig` when a schema with the same id is already registered.
    pub fn register(
        &mut self,
        schema: Schema,
    ) -> Result<Arc<Schema>> {
        if self.by_id.contains_key(&schema.id) {
            return Err(Error::InvalidConfig(format!("duplicate schema id {}", schema.id)));
        }
        debug!(schema = %schema.id, url = %schema.url, "registered schema");
        let schema = Arc::new(schema);
        self.by_id.insert(schema.id.clone(), schema.clone());
        self.ordered.push(schema.clone());
        Ok(schema)
    }

    pub fn schema(
        &self,
        id: &str,
    ) -> Option<Arc<Schema>> {
        self.by_id.get(id).cloned()
    }

    /// Schemas in registration order.
    pub fn schemas(&self) -> impl Iterator<Item = &Arc<Schema>> {
        self.ordered.iter()
    }

    /// Schema whose collection URL is `path` or a segment-aligned prefix of it.
    pub fn schema_by_url_path(
        &self,
        path: &str,
    ) -> Option<Arc<Schema>> {
        let path = format!("{}/", path);
        self.ordered
            .iter()
            .find(|s| path.starts_with(&format!("{}/", s.url)))
            .cloned()
    }

    /// Schema owning a mirrored path (prefix already stripped); schemas with
    /// a sync key template match by template shape only.
    pub fn schema_by_sync_path(
        &self,
        path: &str,
    ) -> Option<Arc<Schema>> {
        self.ordered
            .iter()
            .find(|s| match s.sync_key_template() {
                Some(_) => s.matches_sync_key_template(path),
                None => format!("{}/", path).starts_with(&format!("{}/", s.url)),
            })
            .cloned()
    }
}
