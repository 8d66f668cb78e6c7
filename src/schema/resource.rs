use serde::Deserialize;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;

use super::Schema;
use crate::Error;
use crate::Result;

/// A record conforming to a registered schema.
///
/// `data` is the full property bag, including `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    schema_id: String,
    id: String,
    path: String,
    data: Map<String, Value>,
}

impl Resource {
    /// # Errors
    /// Returns `Error::Validation` when `data` has no string `id`.
    pub fn new(
        schema: &Schema,
        data: Map<String, Value>,
    ) -> Result<Self> {
        let id = match data.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.clone(),
            _ => {
                return Err(Error::Validation(format!(
                    "resource of schema {} has no id",
                    schema.id
                )))
            }
        };
        Ok(Self {
            schema_id: schema.id.clone(),
            path: format!("{}/{}", schema.url, id),
            id,
            data,
        })
    }

    pub fn schema_id(&self) -> &str {
        &self.schema_id
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Canonical path: schema URL followed by the id
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    pub fn into_data(self) -> Map<String, Value> {
        self.data
    }

    pub fn get(
        &self,
        property: &str,
    ) -> Option<&Value> {
        self.data.get(property)
    }

    /// Value of `<parent>_id` for child schemas.
    pub fn parent_id(
        &self,
        schema: &Schema,
    ) -> Option<&str> {
        let parent = schema.parent.as_ref()?;
        self.data.get(&format!("{}_id", parent)).and_then(Value::as_str)
    }

    pub fn tenant_id(&self) -> Option<&str> {
        self.data.get("tenant_id").and_then(Value::as_str)
    }

    pub fn domain_id(&self) -> Option<&str> {
        self.data.get("domain_id").and_then(Value::as_str)
    }

    /// JSON snapshot written into event rows.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.data)?)
    }
}

/// Per-resource reconciliation record of state-versioned schemas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceState {
    pub config_version: i64,
    pub state_version: i64,
    pub error: String,
    pub state: String,
    pub monitoring: String,
}

impl ResourceState {
    /// State of a freshly created resource.
    pub fn initial() -> Self {
        Self {
            config_version: 1,
            ..Default::default()
        }
    }

    pub fn is_reconciled(&self) -> bool {
        self.config_version == self.state_version
    }
}
