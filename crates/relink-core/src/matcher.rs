use crate::error::ApiError;
use crate::registry::{normalize_title, CanonicalRegistry, RegistryEntry};
use crate::service::ContentAccess;
use dashmap::DashMap;

// ---------------------------------------------------------------------------
// Match results
// ---------------------------------------------------------------------------

/// Outcome of resolving one display text against the canonical registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchResult {
    /// Exactly one candidate.
    Resolved(String),
    /// More than one candidate; all are carried for human review.
    Ambiguous(Vec<RegistryEntry>),
    /// No candidate.
    Unresolved,
    /// Exactly one candidate, but the liveness probe says it is gone.
    /// Treated as unresolved for rewriting, reported separately.
    TargetMissing(String),
}

/// Matching strategy. A closed set so dispatch is exhaustiveness-checked;
/// every policy preserves the Resolved/Ambiguous/Unresolved contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchPolicy {
    /// Case-fold, collapse whitespace, trim, then exact. The baseline.
    #[default]
    NormalizedExact,
    /// Byte-exact title comparison.
    CaseSensitiveExact,
}

/// Resolve a display text against the registry. Pure: repeated calls with
/// the same inputs return the identical result.
pub fn match_display_text(
    display: &str,
    registry: &CanonicalRegistry,
    policy: MatchPolicy,
) -> MatchResult {
    let normalized = normalize_title(display);
    let candidates = registry.lookup_normalized(&normalized);
    let filtered: Vec<&RegistryEntry> = match policy {
        MatchPolicy::NormalizedExact => candidates,
        MatchPolicy::CaseSensitiveExact => candidates
            .into_iter()
            .filter(|entry| entry.title == display)
            .collect(),
    };
    match filtered.len() {
        0 => MatchResult::Unresolved,
        1 => MatchResult::Resolved(filtered[0].id.clone()),
        _ => MatchResult::Ambiguous(filtered.into_iter().cloned().collect()),
    }
}

// ---------------------------------------------------------------------------
// Liveness validation
// ---------------------------------------------------------------------------

/// Read-through cache for target liveness probes, at most one probe per id.
///
/// Shared across workers; concurrent misses for the same id may race to
/// populate, which is fine because the probe is idempotent.
#[derive(Default)]
pub struct ValidationCache {
    probed: DashMap<String, bool>,
}

impl ValidationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `target_id` still exists in the destination. A transient
    /// probe failure counts as alive so a flaky probe cannot degrade an
    /// otherwise clean resolution.
    pub async fn is_live(&self, target_id: &str, content: &dyn ContentAccess) -> bool {
        if let Some(cached) = self.probed.get(target_id) {
            return *cached;
        }
        let live = match content.target_exists(target_id).await {
            Ok(exists) => exists,
            Err(ApiError::Transient(msg)) => {
                tracing::warn!(target_id, %msg, "liveness probe failed transiently; assuming alive");
                true
            }
            Err(ApiError::Permanent(_)) => false,
        };
        self.probed.insert(target_id.to_string(), live);
        live
    }

    #[cfg(test)]
    pub fn probe_count(&self) -> usize {
        self.probed.len()
    }
}

/// Resolve a display text, then degrade a resolved hit to `TargetMissing`
/// when the (cached) liveness probe fails.
pub async fn match_with_validation(
    display: &str,
    registry: &CanonicalRegistry,
    policy: MatchPolicy,
    validation: Option<(&ValidationCache, &dyn ContentAccess)>,
) -> MatchResult {
    let result = match_display_text(display, registry, policy);
    if let (MatchResult::Resolved(target_id), Some((cache, content))) = (&result, validation) {
        if !cache.is_live(target_id, content).await {
            return MatchResult::TargetMissing(target_id.clone());
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Block, BlockBody, Document};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry(entries: &[(&str, &str)]) -> CanonicalRegistry {
        let raw = entries
            .iter()
            .map(|(id, title)| (id.to_string(), title.to_string()))
            .collect();
        CanonicalRegistry::from_entries(raw).0
    }

    #[test]
    fn resolves_single_candidate_case_insensitively() {
        let reg = registry(&[("d3", "Beta"), ("d4", "Gamma")]);
        assert_eq!(
            match_display_text("beta", &reg, MatchPolicy::NormalizedExact),
            MatchResult::Resolved("d3".into())
        );
        assert_eq!(
            match_display_text("  BETA ", &reg, MatchPolicy::NormalizedExact),
            MatchResult::Resolved("d3".into())
        );
    }

    #[test]
    fn unmatched_display_is_unresolved() {
        let reg = registry(&[("d3", "Beta")]);
        assert_eq!(
            match_display_text("Delta", &reg, MatchPolicy::NormalizedExact),
            MatchResult::Unresolved
        );
    }

    #[test]
    fn multiple_candidates_are_ambiguous_with_all_carried() {
        // "Beta" and "beta" have distinct exact titles, so the duplicate
        // purge keeps both; normalized lookup then sees two candidates.
        let reg = registry(&[("d1", "Beta"), ("d2", "beta")]);
        match match_display_text("BETA", &reg, MatchPolicy::NormalizedExact) {
            MatchResult::Ambiguous(candidates) => {
                let ids: Vec<&str> = candidates.iter().map(|c| c.id.as_str()).collect();
                assert!(ids.contains(&"d1") && ids.contains(&"d2"));
            }
            other => panic!("expected ambiguous, got {other:?}"),
        }
    }

    #[test]
    fn case_sensitive_policy_filters_candidates() {
        let reg = registry(&[("d1", "Beta"), ("d2", "beta")]);
        assert_eq!(
            match_display_text("Beta", &reg, MatchPolicy::CaseSensitiveExact),
            MatchResult::Resolved("d1".into())
        );
        assert_eq!(
            match_display_text("BETA", &reg, MatchPolicy::CaseSensitiveExact),
            MatchResult::Unresolved
        );
    }

    #[test]
    fn matching_is_deterministic() {
        let reg = registry(&[("d3", "Beta"), ("d1", "Alpha"), ("d2", "Alpha")]);
        for _ in 0..10 {
            assert_eq!(
                match_display_text("beta", &reg, MatchPolicy::NormalizedExact),
                MatchResult::Resolved("d3".into())
            );
            assert_eq!(
                match_display_text("alpha", &reg, MatchPolicy::NormalizedExact),
                MatchResult::Unresolved, // duplicates were purged at build
            );
        }
    }

    struct CountingProbe {
        alive: bool,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ContentAccess for CountingProbe {
        async fn get_content_tree(&self, _id: &str) -> Result<Document, ApiError> {
            Err(ApiError::Permanent("not used".into()))
        }
        async fn update_container(&self, _id: &str, _body: BlockBody) -> Result<(), ApiError> {
            Err(ApiError::Permanent("not used".into()))
        }
        async fn append_siblings(&self, _id: &str, _c: Vec<Block>) -> Result<(), ApiError> {
            Err(ApiError::Permanent("not used".into()))
        }
        async fn target_exists(&self, _id: &str) -> Result<bool, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.alive)
        }
    }

    #[tokio::test]
    async fn validation_probes_each_id_at_most_once() {
        let probe = CountingProbe {
            alive: true,
            calls: AtomicUsize::new(0),
        };
        let cache = ValidationCache::new();
        assert!(cache.is_live("d3", &probe).await);
        assert!(cache.is_live("d3", &probe).await);
        assert!(cache.is_live("d3", &probe).await);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.probe_count(), 1);
    }

    #[tokio::test]
    async fn dead_target_degrades_to_target_missing() {
        let probe = CountingProbe {
            alive: false,
            calls: AtomicUsize::new(0),
        };
        let cache = ValidationCache::new();
        let reg = registry(&[("d3", "Beta")]);
        let result = match_with_validation(
            "Beta",
            &reg,
            MatchPolicy::NormalizedExact,
            Some((&cache, &probe)),
        )
        .await;
        assert_eq!(result, MatchResult::TargetMissing("d3".into()));
    }
}
