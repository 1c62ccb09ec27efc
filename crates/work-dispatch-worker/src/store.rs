use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::io::Cursor;
use tokio::io::AsyncRead;
use work_dispatch_core::{ElementRef, PropertyRef, WorkItem};

/// Streamed property content
pub struct Content {
    /// Original file name, used to pick the staged file's extension
    pub file_name: Option<String>,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl Content {
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static, file_name: Option<String>) -> Self {
        Content {
            file_name,
            reader: Box::new(reader),
        }
    }

    pub fn from_bytes(bytes: Bytes, file_name: Option<String>) -> Self {
        Content::new(Cursor::new(bytes), file_name)
    }
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Content")
            .field("file_name", &self.file_name)
            .finish_non_exhaustive()
    }
}

/// Per-element restriction on which processing units may run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitFilter {
    /// When non-empty, only these units are considered
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

impl UnitFilter {
    pub fn permits(&self, unit: &str) -> bool {
        if !self.allow.is_empty() && !self.allow.iter().any(|u| u == unit) {
            return false;
        }
        !self.deny.iter().any(|u| u == unit)
    }
}

/// Read access to the backing store the items refer to.
///
/// Errors are opaque to the dispatch loop and fail the item.
#[async_trait]
pub trait ElementStore: Send + Sync {
    /// Properties of `element` as seen by `item`, or `None` when the element
    /// does not exist
    async fn properties(
        &self,
        element: &ElementRef,
        item: &WorkItem,
    ) -> anyhow::Result<Option<Vec<PropertyRef>>>;

    async fn unit_filter(&self, _element: &ElementRef) -> anyhow::Result<UnitFilter> {
        Ok(UnitFilter::default())
    }

    /// Content of one property, or `None` when it has no streamable value
    async fn open_content(
        &self,
        element: &ElementRef,
        property: &PropertyRef,
    ) -> anyhow::Result<Option<Content>>;
}

/// Store with no data: every element exists and has no properties or content
pub struct NullElementStore;

#[async_trait]
impl ElementStore for NullElementStore {
    async fn properties(
        &self,
        _element: &ElementRef,
        _item: &WorkItem,
    ) -> anyhow::Result<Option<Vec<PropertyRef>>> {
        Ok(Some(Vec::new()))
    }

    async fn open_content(
        &self,
        _element: &ElementRef,
        _property: &PropertyRef,
    ) -> anyhow::Result<Option<Content>> {
        Ok(None)
    }
}

#[derive(Default, Clone)]
struct StoredElement {
    properties: Vec<(PropertyRef, Option<StoredContent>)>,
    filter: UnitFilter,
}

#[derive(Clone)]
struct StoredContent {
    bytes: Bytes,
    file_name: Option<String>,
}

/// In-process element store for local runs and tests
#[derive(Default)]
pub struct MemoryElementStore {
    elements: RwLock<HashMap<ElementRef, StoredElement>>,
}

impl MemoryElementStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make sure `element` exists, without properties
    pub fn add_element(&self, element: ElementRef) {
        self.elements.write().entry(element).or_default();
    }

    pub fn add_property(&self, element: ElementRef, property: PropertyRef) {
        self.upsert(element, property, None);
    }

    pub fn add_content(
        &self,
        element: ElementRef,
        property: PropertyRef,
        bytes: impl Into<Bytes>,
        file_name: Option<&str>,
    ) {
        let content = StoredContent {
            bytes: bytes.into(),
            file_name: file_name.map(str::to_string),
        };
        self.upsert(element, property, Some(content));
    }

    pub fn set_filter(&self, element: ElementRef, filter: UnitFilter) {
        self.elements.write().entry(element).or_default().filter = filter;
    }

    fn upsert(&self, element: ElementRef, property: PropertyRef, content: Option<StoredContent>) {
        let mut elements = self.elements.write();
        let stored = elements.entry(element).or_default();
        match stored.properties.iter_mut().find(|(p, _)| *p == property) {
            Some(slot) => slot.1 = content,
            None => stored.properties.push((property, content)),
        }
    }
}

#[async_trait]
impl ElementStore for MemoryElementStore {
    async fn properties(
        &self,
        element: &ElementRef,
        _item: &WorkItem,
    ) -> anyhow::Result<Option<Vec<PropertyRef>>> {
        let elements = self.elements.read();
        Ok(elements
            .get(element)
            .map(|stored| stored.properties.iter().map(|(p, _)| p.clone()).collect()))
    }

    async fn unit_filter(&self, element: &ElementRef) -> anyhow::Result<UnitFilter> {
        let elements = self.elements.read();
        Ok(elements
            .get(element)
            .map(|stored| stored.filter.clone())
            .unwrap_or_default())
    }

    async fn open_content(
        &self,
        element: &ElementRef,
        property: &PropertyRef,
    ) -> anyhow::Result<Option<Content>> {
        let elements = self.elements.read();
        let content = elements
            .get(element)
            .and_then(|stored| stored.properties.iter().find(|(p, _)| p == property))
            .and_then(|(_, content)| content.clone());
        Ok(content.map(|c| Content::from_bytes(c.bytes, c.file_name)))
    }
}
