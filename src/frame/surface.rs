use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::document::SandboxDocument;
use crate::protocol::HostMessage;

/// Identity of one sandboxed window.
///
/// Inbound events are matched against the surface's id by identity, never
/// by URL or origin string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SourceId(u64);

impl SourceId {
    /// Allocate an id no other window in this process shares.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "window#{}", self.0)
    }
}

/// Backing resource for a loaded document (a blob URL in a browser host).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DocumentHandle {
    id: Uuid,
    url: String,
}

impl DocumentHandle {
    pub fn new(scheme_prefix: &str) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            url: format!("{scheme_prefix}{id}"),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

/// A message event observed by the host, before any validation.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEvent {
    pub source: SourceId,
    pub data: Value,
}

impl InboundEvent {
    pub fn new(source: SourceId, data: Value) -> Self {
        Self { source, data }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SurfaceError {
    #[error("surface has no document loaded")]
    NotLoaded,
    #[error("failed to load sandbox document: {0}")]
    Load(String),
    #[error("failed to deliver message: {0}")]
    Delivery(String),
}

/// An isolated window the host can load a document into and post to.
///
/// Implementations must apply [`SandboxDocument::sandbox_attributes`] when
/// loading, and report events from the loaded window tagged with
/// [`OutputSurface::source`].
pub trait OutputSurface {
    fn source(&self) -> SourceId;

    fn load(&mut self, document: &SandboxDocument) -> Result<DocumentHandle, SurfaceError>;

    fn post(&mut self, message: &HostMessage) -> Result<(), SurfaceError>;

    /// Release the document resource and stop listening for events.
    fn release(&mut self, handle: DocumentHandle);
}
