use crate::error::RegistryError;
use crate::service::DirectoryService;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

// ---------------------------------------------------------------------------
// Title normalization
// ---------------------------------------------------------------------------

/// Normalize a title for matching: collapse all whitespace runs (including
/// NBSP) to single spaces, trim, and case-fold.
///
/// Example: `normalize_title("  Getting\u{00A0}Started ")` → `"getting started"`
pub fn normalize_title(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

// ---------------------------------------------------------------------------
// Canonical registry
// ---------------------------------------------------------------------------

/// One registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub id: String,
    pub title: String,
}

/// A group of ids sharing one exact title (or all blank-titled when `title`
/// is `None`), purged from the registry before matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DuplicateGroup {
    pub title: Option<String>,
    pub ids: Vec<String>,
}

/// The authoritative id→title map of all destination documents, with a
/// derived normalized-title index for matching.
///
/// Built once per run (or loaded from a prior run's snapshot) and immutable
/// afterwards. Duplicate-titled and blank-titled entries are removed at build
/// time so they can never corrupt matching.
pub struct CanonicalRegistry {
    /// Entries sorted by case-insensitive title.
    entries: Vec<RegistryEntry>,
    by_id: HashMap<String, usize>,
    normalized: HashMap<String, Vec<usize>>,
}

impl CanonicalRegistry {
    /// Build a registry from raw `(id, title)` pairs, purging duplicate and
    /// blank titles. Returns the purged groups for the review sink.
    pub fn from_entries(raw: Vec<(String, String)>) -> (Self, Vec<DuplicateGroup>) {
        let mut by_title: HashMap<String, Vec<String>> = HashMap::new();
        let mut blank_ids: Vec<String> = Vec::new();
        for (id, title) in &raw {
            if title.trim().is_empty() {
                blank_ids.push(id.clone());
            } else {
                by_title.entry(title.clone()).or_default().push(id.clone());
            }
        }

        let mut groups: Vec<DuplicateGroup> = Vec::new();
        let mut removed: std::collections::HashSet<String> = std::collections::HashSet::new();
        if !blank_ids.is_empty() {
            removed.extend(blank_ids.iter().cloned());
            groups.push(DuplicateGroup {
                title: None,
                ids: blank_ids,
            });
        }
        let mut dup_titles: Vec<(String, Vec<String>)> = by_title
            .into_iter()
            .filter(|(_, ids)| ids.len() > 1)
            .collect();
        dup_titles.sort_by(|a, b| a.0.cmp(&b.0));
        for (title, ids) in dup_titles {
            removed.extend(ids.iter().cloned());
            groups.push(DuplicateGroup {
                title: Some(title),
                ids,
            });
        }

        let mut entries: Vec<RegistryEntry> = raw
            .into_iter()
            .filter(|(id, _)| !removed.contains(id))
            .map(|(id, title)| RegistryEntry { id, title })
            .collect();
        entries.sort_by_key(|e| e.title.to_lowercase());

        let mut by_id = HashMap::new();
        let mut normalized: HashMap<String, Vec<usize>> = HashMap::new();
        for (idx, entry) in entries.iter().enumerate() {
            by_id.insert(entry.id.clone(), idx);
            normalized
                .entry(normalize_title(&entry.title))
                .or_default()
                .push(idx);
        }

        (
            Self {
                entries,
                by_id,
                normalized,
            },
            groups,
        )
    }

    /// Collect the full directory enumeration and build the registry.
    ///
    /// A page failure after at least one successful page is non-fatal:
    /// collection stops with a logged gap and the registry is built from
    /// what was collected. A failure before any entries arrive is fatal.
    pub async fn build(
        directory: &dyn DirectoryService,
        batch_size: usize,
    ) -> Result<(Self, Vec<DuplicateGroup>), RegistryError> {
        let mut raw: Vec<(String, String)> = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            match directory.list_page(cursor.as_deref(), batch_size).await {
                Ok(page) => {
                    raw.extend(page.entries);
                    tracing::debug!(collected = raw.len(), "directory page collected");
                    match page.next_cursor {
                        Some(next) => cursor = Some(next),
                        None => break,
                    }
                }
                Err(err) if raw.is_empty() => {
                    return Err(RegistryError::InitialListing(err));
                }
                Err(err) => {
                    tracing::warn!(
                        collected = raw.len(),
                        error = %err,
                        "directory enumeration failed mid-stream; continuing with partial registry"
                    );
                    break;
                }
            }
        }
        tracing::info!(total = raw.len(), "directory enumeration complete");
        Ok(Self::from_entries(raw))
    }

    /// Load a registry from a persisted `canonical.json` snapshot. The purge
    /// is re-applied, so a hand-edited file that reintroduces duplicates is
    /// still cleaned (and the groups reported again).
    pub fn load(path: &Path) -> Result<(Self, Vec<DuplicateGroup>), RegistryError> {
        let bytes = std::fs::read(path)?;
        let map: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&bytes)?;
        let raw = map
            .into_iter()
            .map(|(id, title)| (id, title.as_str().unwrap_or_default().to_string()))
            .collect();
        Ok(Self::from_entries(raw))
    }

    /// Persist as a human-diffable id→title JSON object, keys ordered by
    /// case-insensitive title.
    pub fn save(&self, path: &Path) -> Result<(), RegistryError> {
        let mut map = serde_json::Map::new();
        for entry in &self.entries {
            map.insert(entry.id.clone(), serde_json::Value::String(entry.title.clone()));
        }
        let bytes = serde_json::to_vec_pretty(&serde_json::Value::Object(map))?;
        crate::queue::write_atomic(path, &bytes)?;
        Ok(())
    }

    /// Candidates whose normalized title equals `normalized`.
    pub fn lookup_normalized(&self, normalized: &str) -> Vec<&RegistryEntry> {
        self.normalized
            .get(normalized)
            .map(|idxs| idxs.iter().map(|&i| &self.entries[i]).collect())
            .unwrap_or_default()
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn title_for(&self, id: &str) -> Option<&str> {
        self.by_id
            .get(id)
            .map(|&i| self.entries[i].title.as_str())
    }

    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
