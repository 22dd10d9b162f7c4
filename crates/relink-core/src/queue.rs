use crate::error::QueueError;
use crate::model::DocumentStatus;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Write `bytes` to `path` via a temp file in the same directory plus an
/// atomic rename, so a crash mid-write never leaves a torn file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use std::io::Write;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(bytes)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Queue entries
// ---------------------------------------------------------------------------

/// A document waiting to be processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    #[serde(default)]
    pub title: String,
}

/// A processed document with its final status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletedEntry {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub status: DocumentStatus,
}

struct QueueState {
    unfinished: Vec<QueueEntry>,
    completed: Vec<CompletedEntry>,
}

// ---------------------------------------------------------------------------
// Durable queue
// ---------------------------------------------------------------------------

/// Durable per-document progress tracking across `unfinished.json` and
/// `completed.json`.
///
/// Invariant: every id lives in exactly one of the two sets at any durable
/// checkpoint. Both files are updated under one mutex so concurrent
/// completions cannot interleave their writes; each file write is
/// temp-then-rename. Completion persists the completed file first, so the
/// worst crash outcome is an id present in both files, which reconciliation
/// resolves on the next load (completed wins).
pub struct DurableQueue {
    unfinished_path: PathBuf,
    completed_path: PathBuf,
    state: Mutex<QueueState>,
}

impl DurableQueue {
    /// Open (or create) the queue files under `dir`.
    pub fn open(dir: &Path) -> Result<Self, QueueError> {
        std::fs::create_dir_all(dir)?;
        let unfinished_path = dir.join("unfinished.json");
        let completed_path = dir.join("completed.json");

        let mut unfinished: Vec<QueueEntry> = read_json_array(&unfinished_path)?;
        let completed: Vec<CompletedEntry> = read_json_array(&completed_path)?;

        // Reconcile a crash between the two completion writes.
        let done: std::collections::HashSet<&str> =
            completed.iter().map(|e| e.id.as_str()).collect();
        let before = unfinished.len();
        unfinished.retain(|e| !done.contains(e.id.as_str()));
        if unfinished.len() != before {
            tracing::warn!(
                reconciled = before - unfinished.len(),
                "dropped unfinished entries already present in completed"
            );
        }

        Ok(Self {
            unfinished_path,
            completed_path,
            state: Mutex::new(QueueState {
                unfinished,
                completed,
            }),
        })
    }

    /// Seed the unfinished set from the registry, in registry order. A no-op
    /// when any prior state exists, so restarted runs keep their progress.
    pub fn seed_if_empty<I>(&self, entries: I) -> Result<usize, QueueError>
    where
        I: IntoIterator<Item = QueueEntry>,
    {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.unfinished.is_empty() || !state.completed.is_empty() {
            return Ok(0);
        }
        state.unfinished = entries.into_iter().collect();
        persist(&self.unfinished_path, &state.unfinished)?;
        persist(&self.completed_path, &state.completed)?;
        Ok(state.unfinished.len())
    }

    /// Read up to `limit` unfinished entries without removing them. A
    /// claimed document only leaves the queue on `complete`, so a crashed
    /// worker's document is naturally retried on the next run.
    pub fn claim(&self, limit: Option<usize>) -> Vec<QueueEntry> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let take = limit.unwrap_or(state.unfinished.len());
        state.unfinished.iter().take(take).cloned().collect()
    }

    /// Atomically move `id` from unfinished to completed with `status`.
    /// Idempotent: completing an id that is already completed is a no-op.
    pub fn complete(&self, id: &str, status: DocumentStatus) -> Result<(), QueueError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.completed.iter().any(|e| e.id == id) {
            return Ok(());
        }
        let Some(pos) = state.unfinished.iter().position(|e| e.id == id) else {
            tracing::warn!(id, "complete called for unknown document id");
            return Ok(());
        };
        let entry = state.unfinished[pos].clone();
        state.completed.push(CompletedEntry {
            id: entry.id,
            title: entry.title,
            status,
        });
        // Completed first: a crash here leaves the id in both files, which
        // load-time reconciliation resolves in favor of completed.
        persist(&self.completed_path, &state.completed)?;
        state.unfinished.remove(pos);
        persist(&self.unfinished_path, &state.unfinished)?;
        Ok(())
    }

    pub fn unfinished_len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unfinished
            .len()
    }

    pub fn completed_len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .completed
            .len()
    }

    /// Snapshot of the completed set, for reporting.
    pub fn completed(&self) -> Vec<CompletedEntry> {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .completed
            .clone()
    }
}

fn read_json_array<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>, QueueError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

fn persist<T: Serialize>(path: &Path, items: &[T]) -> Result<(), QueueError> {
    let bytes = serde_json::to_vec_pretty(items)?;
    write_atomic(path, &bytes)?;
    Ok(())
}
