use async_trait::async_trait;
use relink_core::error::ApiError;
use relink_core::model::{Block, BlockBody, Document};
use relink_core::service::{ContentAccess, DirectoryPage, DirectoryService};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// On-disk workspace snapshot: the destination's documents as one JSON file.
#[derive(Debug, Serialize, Deserialize)]
pub struct Workspace {
    pub documents: Vec<Document>,
}

struct WorkspaceState {
    /// Document ids in discovery order.
    order: Vec<String>,
    docs: HashMap<String, Document>,
}

/// Snapshot-backed implementation of the directory and content-access
/// collaborators. Serves enumeration and content trees from a workspace
/// file, applies container updates in memory, and writes the workspace back
/// on [`SnapshotStore::persist`].
///
/// This is the local/test stand-in for the destination API; the engine only
/// ever sees the service traits.
pub struct SnapshotStore {
    path: Option<PathBuf>,
    inner: Mutex<WorkspaceState>,
}

impl SnapshotStore {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)?;
        let workspace: Workspace = serde_json::from_slice(&bytes)?;
        Ok(Self::from_documents_at(workspace.documents, Some(path.to_path_buf())))
    }

    pub fn in_memory(documents: Vec<Document>) -> Self {
        Self::from_documents_at(documents, None)
    }

    fn from_documents_at(documents: Vec<Document>, path: Option<PathBuf>) -> Self {
        let order = documents.iter().map(|d| d.id.clone()).collect();
        let docs = documents.into_iter().map(|d| (d.id.clone(), d)).collect();
        Self {
            path,
            inner: Mutex::new(WorkspaceState { order, docs }),
        }
    }

    /// Write the (possibly rewritten) workspace back to its snapshot file.
    pub fn persist(&self) -> anyhow::Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let documents: Vec<Document> = state
            .order
            .iter()
            .filter_map(|id| state.docs.get(id).cloned())
            .collect();
        let bytes = serde_json::to_vec_pretty(&Workspace { documents })?;
        std::fs::write(path, bytes)?;
        Ok(())
    }

    /// Current state of one document, for tests and reporting.
    pub fn document(&self, id: &str) -> Option<Document> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .docs
            .get(id)
            .cloned()
    }
}

fn find_block_mut<'a>(blocks: &'a mut [Block], id: &str) -> Option<&'a mut Block> {
    for block in blocks.iter_mut() {
        if block.id == id {
            return Some(block);
        }
        if let Some(found) = find_block_mut(&mut block.children, id) {
            return Some(found);
        }
    }
    None
}

#[async_trait]
impl DirectoryService for SnapshotStore {
    async fn list_page(
        &self,
        cursor: Option<&str>,
        batch_size: usize,
    ) -> Result<DirectoryPage, ApiError> {
        let offset: usize = match cursor {
            Some(c) => c
                .parse()
                .map_err(|_| ApiError::Permanent(format!("bad cursor: {c}")))?,
            None => 0,
        };
        let state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let entries: Vec<(String, String)> = state
            .order
            .iter()
            .skip(offset)
            .take(batch_size)
            .filter_map(|id| state.docs.get(id).map(|d| (d.id.clone(), d.title.clone())))
            .collect();
        let next = offset + entries.len();
        let next_cursor = (next < state.order.len()).then(|| next.to_string());
        Ok(DirectoryPage {
            entries,
            next_cursor,
        })
    }
}

#[async_trait]
impl ContentAccess for SnapshotStore {
    async fn get_content_tree(&self, document_id: &str) -> Result<Document, ApiError> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .docs
            .get(document_id)
            .cloned()
            .ok_or_else(|| ApiError::Permanent(format!("document not found: {document_id}")))
    }

    async fn update_container(&self, container_id: &str, body: BlockBody) -> Result<(), ApiError> {
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        for doc in state.docs.values_mut() {
            if let Some(block) = find_block_mut(&mut doc.blocks, container_id) {
                block.body = body;
                return Ok(());
            }
        }
        Err(ApiError::Permanent(format!(
            "container not found: {container_id}"
        )))
    }

    async fn append_siblings(
        &self,
        parent_id: &str,
        containers: Vec<Block>,
    ) -> Result<(), ApiError> {
        let mut with_ids = containers;
        for block in &mut with_ids {
            if block.id.is_empty() {
                block.id = nanoid::nanoid!();
            }
        }
        let mut state = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(doc) = state.docs.get_mut(parent_id) {
            doc.blocks.extend(with_ids);
            return Ok(());
        }
        for doc in state.docs.values_mut() {
            if let Some(block) = find_block_mut(&mut doc.blocks, parent_id) {
                block.children.extend(with_ids);
                return Ok(());
            }
        }
        Err(ApiError::Permanent(format!("parent not found: {parent_id}")))
    }

    async fn target_exists(&self, document_id: &str) -> Result<bool, ApiError> {
        Ok(self
            .inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .docs
            .contains_key(document_id))
    }
}
