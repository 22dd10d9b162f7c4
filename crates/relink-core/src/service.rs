use crate::error::ApiError;
use crate::model::{Block, BlockBody, Document};
use crate::registry::RegistryEntry;
use async_trait::async_trait;
use serde::Serialize;

// ---------------------------------------------------------------------------
// External collaborators
// ---------------------------------------------------------------------------

/// One page of a paginated directory enumeration.
#[derive(Debug, Clone)]
pub struct DirectoryPage {
    /// `(id, title)` pairs in discovery order.
    pub entries: Vec<(String, String)>,
    /// Opaque cursor for the next page; `None` when enumeration is complete.
    pub next_cursor: Option<String>,
}

/// Paginated enumeration of every document the engine may reference.
///
/// Implementations own pagination, auth, and rate-limit pacing. The cursor is
/// opaque to the engine and only ever round-tripped back verbatim.
#[async_trait]
pub trait DirectoryService: Send + Sync {
    async fn list_page(
        &self,
        cursor: Option<&str>,
        batch_size: usize,
    ) -> Result<DirectoryPage, ApiError>;
}

/// Read/write access to document content trees in the destination.
///
/// All calls are bounded, possibly slow, possibly transiently failing; the
/// implementation is solely responsible for retry/backoff. The engine never
/// throttles beyond its worker-count ceiling.
#[async_trait]
pub trait ContentAccess: Send + Sync {
    /// Fetch a document's content tree, nested children resolved.
    async fn get_content_tree(&self, document_id: &str) -> Result<Document, ApiError>;
    /// Replace a container's payload in place.
    async fn update_container(&self, container_id: &str, body: BlockBody) -> Result<(), ApiError>;
    /// Append overflow containers as new children of `parent_id`.
    async fn append_siblings(&self, parent_id: &str, containers: Vec<Block>)
        -> Result<(), ApiError>;
    /// Liveness check for a resolved target id.
    async fn target_exists(&self, document_id: &str) -> Result<bool, ApiError>;
}

#[async_trait]
impl<T: ContentAccess + ?Sized> ContentAccess for std::sync::Arc<T> {
    async fn get_content_tree(&self, document_id: &str) -> Result<Document, ApiError> {
        (**self).get_content_tree(document_id).await
    }
    async fn update_container(&self, container_id: &str, body: BlockBody) -> Result<(), ApiError> {
        (**self).update_container(container_id, body).await
    }
    async fn append_siblings(
        &self,
        parent_id: &str,
        containers: Vec<Block>,
    ) -> Result<(), ApiError> {
        (**self).append_siblings(parent_id, containers).await
    }
    async fn target_exists(&self, document_id: &str) -> Result<bool, ApiError> {
        (**self).target_exists(document_id).await
    }
}

// ---------------------------------------------------------------------------
// Review sink
// ---------------------------------------------------------------------------

/// Structured record pushed to the review sink for human follow-up.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReviewRecord {
    /// A duplicate-titled group purged from the canonical registry.
    /// `title` is `None` for the blank-title group.
    DuplicateTitles {
        title: Option<String>,
        ids: Vec<String>,
    },
    UnresolvedReference {
        document_id: String,
        document_title: String,
        container_id: String,
        display_text: String,
        raw_target: String,
    },
    AmbiguousReference {
        document_id: String,
        document_title: String,
        container_id: String,
        display_text: String,
        raw_target: String,
        candidates: Vec<RegistryEntry>,
    },
    TargetMissing {
        document_id: String,
        document_title: String,
        container_id: String,
        display_text: String,
        target_id: String,
    },
}

/// Destination for records a human must review. Implementations decide the
/// medium (file, database, console).
pub trait ReviewSink: Send + Sync {
    fn record(&self, record: &ReviewRecord) -> anyhow::Result<()>;
}

/// Sink that drops every record. Used by dry runs.
pub struct NullReviewSink;

impl ReviewSink for NullReviewSink {
    fn record(&self, _record: &ReviewRecord) -> anyhow::Result<()> {
        Ok(())
    }
}
