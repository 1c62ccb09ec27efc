use crate::{CoreError, Priority, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use uuid::Uuid;

/// Source-assigned identifier of a work item
pub type MessageId = String;

/// What happened to the element or property the item refers to
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ElementStatus {
    #[default]
    New,
    Update,
    Delete,
}

impl ElementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementStatus::New => "NEW",
            ElementStatus::Update => "UPDATE",
            ElementStatus::Delete => "DELETE",
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, ElementStatus::Delete)
    }
}

impl fmt::Display for ElementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reference to one graph element in the backing store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ElementRef {
    Vertex(String),
    Edge(String),
}

impl ElementRef {
    pub fn id(&self) -> &str {
        match self {
            ElementRef::Vertex(id) | ElementRef::Edge(id) => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ElementRef::Vertex(_) => "vertex",
            ElementRef::Edge(_) => "edge",
        }
    }
}

impl fmt::Display for ElementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind(), self.id())
    }
}

/// A reference to a property on an element. Properties without a key are
/// looked up by name alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PropertyRef {
    pub key: Option<String>,
    pub name: String,
}

impl PropertyRef {
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        PropertyRef {
            key: Some(key.into()),
            name: name.into(),
        }
    }

    pub fn named(name: impl Into<String>) -> Self {
        PropertyRef {
            key: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for PropertyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{}:{}", key, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}

/// Element ids carried by a work item
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElementRefs {
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub vertex_ids: Vec<String>,

    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub edge_ids: Vec<String>,
}

impl ElementRefs {
    pub fn is_empty(&self) -> bool {
        self.vertex_ids.is_empty() && self.edge_ids.is_empty()
    }

    /// Vertices first, then edges, each in message order
    pub fn iter(&self) -> impl Iterator<Item = ElementRef> + '_ {
        self.vertex_ids
            .iter()
            .cloned()
            .map(ElementRef::Vertex)
            .chain(self.edge_ids.iter().cloned().map(ElementRef::Edge))
    }

    pub fn len(&self) -> usize {
        self.vertex_ids.len() + self.edge_ids.len()
    }
}

/// Accepts `"id"` as well as `["id", ...]`
fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match Option::<OneOrMany>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::One(id)) => vec![id],
        Some(OneOrMany::Many(ids)) => ids,
    })
}

fn new_message_id() -> MessageId {
    Uuid::new_v4().to_string()
}

/// One unit of routed work pulled from the queue.
///
/// The dispatch loop reads it and never mutates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkItem {
    #[serde(default = "new_message_id")]
    pub message_id: MessageId,

    #[serde(default)]
    pub element_refs: ElementRefs,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_key: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub property_name: Option<String>,

    /// Security visibility label, opaque to the loop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility_source: Option<String>,

    pub priority: Priority,

    /// Milliseconds since the epoch; elements are read as of this instant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before_action_timestamp: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,

    #[serde(default)]
    pub trace_enabled: bool,

    #[serde(default)]
    pub status: ElementStatus,
}

impl WorkItem {
    pub fn builder() -> WorkItemBuilder {
        WorkItemBuilder::new()
    }

    /// Decode and validate an item from its JSON document
    pub fn from_json(data: &[u8]) -> Result<Self> {
        let item: WorkItem = serde_json::from_slice(data)?;
        item.validate()?;
        Ok(item)
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(CoreError::from)
    }

    pub fn validate(&self) -> Result<()> {
        if self.element_refs.is_empty() {
            return Err(CoreError::InvalidItem(format!(
                "message {} references no vertexIds or edgeIds",
                self.message_id
            )));
        }
        Ok(())
    }

    /// The single property this item is about, if any.
    ///
    /// `None` means the item covers whole elements. A key given without a
    /// name yields an empty name, which no stored property matches.
    pub fn property_ref(&self) -> Option<PropertyRef> {
        let key = self.property_key.clone().filter(|k| !k.is_empty());
        let name = self.property_name.clone().filter(|n| !n.is_empty());
        if key.is_none() && name.is_none() {
            return None;
        }
        Some(PropertyRef {
            key,
            name: name.unwrap_or_default(),
        })
    }

    pub fn before_action_time(&self) -> Option<DateTime<Utc>> {
        self.before_action_timestamp
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
    }
}

/// Builder for creating work items in code and tests
pub struct WorkItemBuilder {
    item: WorkItem,
}

impl WorkItemBuilder {
    pub fn new() -> Self {
        WorkItemBuilder {
            item: WorkItem {
                message_id: new_message_id(),
                element_refs: ElementRefs::default(),
                property_key: None,
                property_name: None,
                visibility_source: None,
                priority: Priority::default(),
                before_action_timestamp: None,
                workspace_id: None,
                trace_enabled: false,
                status: ElementStatus::default(),
            },
        }
    }

    pub fn message_id(mut self, message_id: impl Into<String>) -> Self {
        self.item.message_id = message_id.into();
        self
    }

    pub fn vertex(mut self, id: impl Into<String>) -> Self {
        self.item.element_refs.vertex_ids.push(id.into());
        self
    }

    pub fn edge(mut self, id: impl Into<String>) -> Self {
        self.item.element_refs.edge_ids.push(id.into());
        self
    }

    pub fn property(mut self, key: impl Into<String>, name: impl Into<String>) -> Self {
        self.item.property_key = Some(key.into());
        self.item.property_name = Some(name.into());
        self
    }

    pub fn property_name(mut self, name: impl Into<String>) -> Self {
        self.item.property_name = Some(name.into());
        self
    }

    pub fn visibility_source(mut self, visibility: impl Into<String>) -> Self {
        self.item.visibility_source = Some(visibility.into());
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.item.priority = priority;
        self
    }

    pub fn before_action_timestamp(mut self, millis: i64) -> Self {
        self.item.before_action_timestamp = Some(millis);
        self
    }

    pub fn workspace_id(mut self, workspace_id: impl Into<String>) -> Self {
        self.item.workspace_id = Some(workspace_id.into());
        self
    }

    pub fn trace_enabled(mut self, trace_enabled: bool) -> Self {
        self.item.trace_enabled = trace_enabled;
        self
    }

    pub fn status(mut self, status: ElementStatus) -> Self {
        self.item.status = status;
        self
    }

    pub fn build(self) -> Result<WorkItem> {
        self.item.validate()?;
        Ok(self.item)
    }
}

impl Default for WorkItemBuilder {
    fn default() -> Self {
        Self::new()
    }
}
