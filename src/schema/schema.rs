use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Map;
use serde_json::Value;

use crate::Error;
use crate::Result;

lazy_static! {
    static ref TEMPLATE_VARIABLE: Regex =
        Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("template regex is valid");
}

const ID_PLACEHOLDER: &str = "{{id}}";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replication-related schema metadata
#[derive(Debug, Clone, Default)]
pub struct SyncMetadata {
    /// Mutations are not logged to the event table
    pub nosync: bool,
    /// Write the raw body (or projected property) instead of `{body, version}`
    pub sync_plain: bool,
    /// Project only this top-level property of the body
    pub sync_property: Option<String>,
    /// Resources own a `ResourceState` and take part in state reconciliation
    pub state_versioning: bool,
    /// Custom coordination store path, e.g. `/agents/{{agent_id}}/ports/{{id}}`
    pub sync_key_template: Option<String>,
    /// Omit the `/config` prefix of mirrored keys
    pub skip_config_prefix: bool,
}

/// Extension time limit for events whose name matches `event`.
#[derive(Debug, Clone)]
pub struct EventTimeLimit {
    pub event: Regex,
    pub limit: Duration,
}

#[derive(Debug, Clone)]
pub struct Schema {
    pub id: String,
    pub plural: String,
    /// Collection URL, e.g. `/v2.0/networks`
    pub url: String,
    pub parent: Option<String>,
    pub is_abstract: bool,
    pub metadata: SyncMetadata,
    isolation_levels: HashMap<String, IsolationLevel>,
    time_limits: Vec<EventTimeLimit>,
}

impl Schema {
    pub fn new(
        id: impl Into<String>,
        plural: impl Into<String>,
        url: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            plural: plural.into(),
            url: url.into(),
            parent: None,
            is_abstract: false,
            metadata: SyncMetadata::default(),
            isolation_levels: HashMap::new(),
            time_limits: vec![],
        }
    }

    pub fn with_metadata(
        mut self,
        metadata: SyncMetadata,
    ) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_parent(
        mut self,
        parent: impl Into<String>,
    ) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn with_isolation_level(
        mut self,
        action: impl Into<String>,
        level: IsolationLevel,
    ) -> Self {
        self.isolation_levels.insert(action.into(), level);
        self
    }

    /// # Errors
    /// Returns `Error::InvalidConfig` when `event_pattern` is not a valid regex.
    pub fn with_time_limit(
        mut self,
        event_pattern: &str,
        limit: Duration,
    ) -> Result<Self> {
        let event = Regex::new(event_pattern).map_err(|e| {
            Error::InvalidConfig(format!("invalid event pattern `{}`: {}", event_pattern, e))
        })?;
        self.time_limits.push(EventTimeLimit { event, limit });
        Ok(self)
    }

    pub fn abstract_schema(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    pub fn state_versioning(&self) -> bool {
        self.metadata.state_versioning
    }

    pub fn sync_key_template(&self) -> Option<&str> {
        self.metadata.sync_key_template.as_deref()
    }

    pub fn skip_config_prefix(&self) -> bool {
        self.metadata.skip_config_prefix
    }

    /// Isolation level declared for `action`; reads default to
    /// REPEATABLE READ, everything else to SERIALIZABLE.
    pub fn isolation_level(
        &self,
        action: &str,
    ) -> IsolationLevel {
        match self.isolation_levels.get(action) {
            Some(level) => *level,
            None if action == "read" => IsolationLevel::RepeatableRead,
            None => IsolationLevel::Serializable,
        }
    }

    /// First declared time limit whose pattern matches `event`.
    pub fn time_limit(
        &self,
        event: &str,
    ) -> Option<Duration> {
        self.time_limits
            .iter()
            .find(|t| t.event.is_match(event))
            .map(|t| t.limit)
    }

    /// Renders the sync key template with the resource body.
    ///
    /// # Errors
    /// Fails when the schema has no template or the body lacks a variable.
    pub fn generate_custom_path(
        &self,
        data: &Map<String, Value>,
    ) -> Result<String> {
        let template = self.sync_key_template().ok_or_else(|| {
            Error::Validation(format!("schema {} has no sync_key_template", self.url))
        })?;

        let mut missing = None;
        let path = TEMPLATE_VARIABLE.replace_all(template, |caps: &regex::Captures| {
            let name = &caps[1];
            match data.get(name) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => {
                    missing.get_or_insert_with(|| name.to_string());
                    String::new()
                }
                Some(other) => other.to_string(),
            }
        });

        if let Some(name) = missing {
            return Err(Error::Validation(format!(
                "sync_key_template of {} references missing property `{}`",
                self.id, name
            )));
        }
        Ok(path.into_owned())
    }

    /// Extracts the resource id from a (possibly templated) schema path.
    pub fn resource_id_from_path(
        &self,
        schema_path: &str,
    ) -> String {
        let trimmed = || {
            schema_path
                .strip_prefix(&format!("{}/", self.url))
                .unwrap_or(schema_path)
                .to_string()
        };

        let Some(template) = self.sync_key_template() else {
            return trimmed();
        };

        let template_parts: Vec<&str> = template.split('/').collect();
        let path_parts: Vec<&str> = schema_path.split('/').collect();
        if path_parts.len() < template_parts.len() {
            return trimmed();
        }
        template_parts
            .iter()
            .position(|part| *part == ID_PLACEHOLDER)
            .map(|idx| path_parts[idx].to_string())
            .unwrap_or_default()
    }

    /// Whether `path` has the shape of the sync key template: same number of
    /// segments and equal literal segments.
    pub fn matches_sync_key_template(
        &self,
        path: &str,
    ) -> bool {
        let Some(template) = self.sync_key_template() else {
            return false;
        };
        let template_parts: Vec<&str> = template.split('/').collect();
        let path_parts: Vec<&str> = path.split('/').collect();
        template_parts.len() == path_parts.len()
            && template_parts
                .iter()
                .zip(path_parts.iter())
                .all(|(t, p)| t.starts_with("{{") || t == p)
    }
}
