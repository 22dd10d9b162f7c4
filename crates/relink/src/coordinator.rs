use relink_core::matcher::{match_with_validation, MatchPolicy, MatchResult, ValidationCache};
use relink_core::model::{Block, Document, DocumentStatus, Limits, LinkEncoding, LinkReference};
use relink_core::pack::{needs_normalization, plan_normalization};
use relink_core::queue::{DurableQueue, QueueEntry};
use relink_core::registry::CanonicalRegistry;
use relink_core::rewrite::{rewrite_block, MatchLookup};
use relink_core::scan::{census, scan_document};
use relink_core::service::{ContentAccess, ReviewRecord, ReviewSink};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

// ---------------------------------------------------------------------------
// Run configuration and statistics
// ---------------------------------------------------------------------------

/// Knobs for one resolution run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub workers: usize,
    pub dry_run: bool,
    /// Probe resolved targets for liveness before rewriting.
    pub validate: bool,
    pub limits: Limits,
    pub policy: MatchPolicy,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            dry_run: false,
            validate: false,
            limits: Limits::default(),
            policy: MatchPolicy::default(),
        }
    }
}

/// External collaborators a run writes through.
pub struct Services {
    pub content: Arc<dyn ContentAccess>,
    pub review: Arc<dyn ReviewSink>,
}

#[derive(Default)]
struct RunStats {
    documents_processed: AtomicU64,
    documents_with_links: AtomicU64,
    documents_abandoned: AtomicU64,
    links_found: AtomicU64,
    links_resolved: AtomicU64,
    links_ambiguous: AtomicU64,
    links_unresolved: AtomicU64,
    links_target_missing: AtomicU64,
    containers_normalized: AtomicU64,
    containers_rewritten: AtomicU64,
    update_failures: AtomicU64,
}

/// Aggregate counts for one run, snapshotted after all workers drain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub documents_processed: u64,
    pub documents_with_links: u64,
    pub documents_abandoned: u64,
    pub links_found: u64,
    pub links_resolved: u64,
    pub links_ambiguous: u64,
    pub links_unresolved: u64,
    pub links_target_missing: u64,
    pub containers_normalized: u64,
    pub containers_rewritten: u64,
    pub update_failures: u64,
}

impl RunStats {
    fn snapshot(&self) -> RunSummary {
        RunSummary {
            documents_processed: self.documents_processed.load(Ordering::SeqCst),
            documents_with_links: self.documents_with_links.load(Ordering::SeqCst),
            documents_abandoned: self.documents_abandoned.load(Ordering::SeqCst),
            links_found: self.links_found.load(Ordering::SeqCst),
            links_resolved: self.links_resolved.load(Ordering::SeqCst),
            links_ambiguous: self.links_ambiguous.load(Ordering::SeqCst),
            links_unresolved: self.links_unresolved.load(Ordering::SeqCst),
            links_target_missing: self.links_target_missing.load(Ordering::SeqCst),
            containers_normalized: self.containers_normalized.load(Ordering::SeqCst),
            containers_rewritten: self.containers_rewritten.load(Ordering::SeqCst),
            update_failures: self.update_failures.load(Ordering::SeqCst),
        }
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

struct Ctx {
    content: Arc<dyn ContentAccess>,
    review: Arc<dyn ReviewSink>,
    registry: Arc<CanonicalRegistry>,
    queue: Arc<DurableQueue>,
    config: RunConfig,
    stats: RunStats,
    validation: ValidationCache,
}

/// Process `entries` with a pool of worker tasks.
///
/// Each worker pulls the next document from a shared deque, so no two workers
/// ever hold the same document. Failed documents stay in the unfinished set
/// and are retried on the next run; the `shutdown` flag stops workers between
/// documents, never mid-document.
pub async fn run(
    services: Services,
    registry: Arc<CanonicalRegistry>,
    queue: Arc<DurableQueue>,
    entries: Vec<QueueEntry>,
    config: RunConfig,
    shutdown: Arc<AtomicBool>,
) -> RunSummary {
    let workers = config.workers.max(1);
    let ctx = Arc::new(Ctx {
        content: services.content,
        review: services.review,
        registry,
        queue,
        config,
        stats: RunStats::default(),
        validation: ValidationCache::new(),
    });
    let work = Arc::new(Mutex::new(VecDeque::from(entries)));

    let mut handles = Vec::with_capacity(workers);
    for worker_id in 0..workers {
        let ctx = Arc::clone(&ctx);
        let work = Arc::clone(&work);
        let shutdown = Arc::clone(&shutdown);
        handles.push(tokio::spawn(async move {
            loop {
                if shutdown.load(Ordering::SeqCst) {
                    tracing::info!(worker_id, "shutdown requested; worker stopping");
                    break;
                }
                let entry = {
                    let mut work = work.lock().unwrap_or_else(|e| e.into_inner());
                    work.pop_front()
                };
                let Some(entry) = entry else { break };
                process_document(&ctx, &entry).await;
            }
        }));
    }
    for handle in handles {
        if let Err(err) = handle.await {
            tracing::error!(error = %err, "worker task failed");
        }
    }
    ctx.stats.snapshot()
}

async fn process_document(ctx: &Ctx, entry: &QueueEntry) {
    let mut tree = match ctx.content.get_content_tree(&entry.id).await {
        Ok(tree) => tree,
        Err(err) => {
            tracing::warn!(document_id = %entry.id, error = %err, "content tree fetch failed; leaving document unfinished");
            ctx.stats.documents_abandoned.fetch_add(1, Ordering::SeqCst);
            return;
        }
    };

    // Normalize oversized containers first, so the later rewrite always
    // starts from a tree that respects the destination limits.
    let normalized = normalize_tree(ctx, &tree).await;
    if normalized > 0 && !ctx.config.dry_run {
        tree = match ctx.content.get_content_tree(&entry.id).await {
            Ok(tree) => tree,
            Err(err) => {
                tracing::warn!(document_id = %entry.id, error = %err, "re-fetch after normalization failed; leaving document unfinished");
                ctx.stats.documents_abandoned.fetch_add(1, Ordering::SeqCst);
                return;
            }
        };
    }

    let refs = scan_document(&tree);
    let embedded = refs
        .iter()
        .filter(|r| matches!(r.encoding, LinkEncoding::EmbeddedMarkup))
        .count();
    let expected = census(&tree);
    if embedded != expected {
        tracing::warn!(
            document_id = %entry.id,
            detected = embedded,
            expected,
            "embedded link census disagrees with scan"
        );
    }
    ctx.stats
        .links_found
        .fetch_add(refs.len() as u64, Ordering::SeqCst);

    if refs.is_empty() {
        finish(ctx, entry, DocumentStatus::NoLinks);
        return;
    }
    ctx.stats.documents_with_links.fetch_add(1, Ordering::SeqCst);

    // Resolve every reference before touching the tree.
    let mut lookup = MatchLookup::new();
    let mut results = Vec::with_capacity(refs.len());
    for link in &refs {
        let validation = ctx
            .config
            .validate
            .then(|| (&ctx.validation, ctx.content.as_ref()));
        let result = match_with_validation(
            &link.display_text,
            &ctx.registry,
            ctx.config.policy,
            validation,
        )
        .await;
        lookup.insert(&link.display_text, &result);
        results.push(result);
    }

    let parents = index_parents(&tree);
    let mut containers: Vec<&str> = Vec::new();
    for link in &refs {
        let id = link.address.block_id.as_str();
        if !containers.contains(&id) {
            containers.push(id);
        }
    }
    let mut missing: HashSet<&str> = HashSet::new();
    for container_id in &containers {
        if find_block(&tree.blocks, container_id).is_none() {
            tracing::warn!(document_id = %entry.id, container_id, "referenced container vanished between scan and rewrite");
            missing.insert(container_id);
        }
    }

    let mut resolved = 0usize;
    let mut ambiguous = 0usize;
    let mut unresolved = 0usize;
    for (link, result) in effective_results(&refs, results, &missing) {
        match &result {
            MatchResult::Resolved(_) => {
                resolved += 1;
                ctx.stats.links_resolved.fetch_add(1, Ordering::SeqCst);
            }
            MatchResult::Ambiguous(_) => {
                ambiguous += 1;
                ctx.stats.links_ambiguous.fetch_add(1, Ordering::SeqCst);
            }
            MatchResult::Unresolved => {
                unresolved += 1;
                ctx.stats.links_unresolved.fetch_add(1, Ordering::SeqCst);
            }
            MatchResult::TargetMissing(_) => {
                unresolved += 1;
                ctx.stats
                    .links_target_missing
                    .fetch_add(1, Ordering::SeqCst);
            }
        }
        if !ctx.config.dry_run {
            report(ctx, link, &result);
        }
    }

    // Rewrite each container that holds at least one reference.
    for container_id in containers {
        if missing.contains(container_id) {
            continue;
        }
        let Some(block) = find_block(&tree.blocks, container_id) else {
            continue;
        };
        let Some(plan) = rewrite_block(block, &lookup, &ctx.config.limits) else {
            continue;
        };
        ctx.stats.containers_rewritten.fetch_add(1, Ordering::SeqCst);
        if ctx.config.dry_run {
            continue;
        }
        if let Err(err) = ctx.content.update_container(container_id, plan.body).await {
            tracing::warn!(document_id = %entry.id, container_id, error = %err, "container update failed; leaving document unfinished");
            ctx.stats.update_failures.fetch_add(1, Ordering::SeqCst);
            ctx.stats.documents_abandoned.fetch_add(1, Ordering::SeqCst);
            return;
        }
        if !plan.overflow.is_empty() {
            let parent_id = parents
                .get(container_id)
                .map(String::as_str)
                .unwrap_or(tree.id.as_str());
            if let Err(err) = ctx.content.append_siblings(parent_id, plan.overflow).await {
                tracing::warn!(document_id = %entry.id, container_id, error = %err, "overflow append failed; leaving document unfinished");
                ctx.stats.update_failures.fetch_add(1, Ordering::SeqCst);
                ctx.stats.documents_abandoned.fetch_add(1, Ordering::SeqCst);
                return;
            }
        }
    }

    finish(
        ctx,
        entry,
        DocumentStatus::classify(resolved, ambiguous, unresolved),
    );
}

fn finish(ctx: &Ctx, entry: &QueueEntry, status: DocumentStatus) {
    ctx.stats.documents_processed.fetch_add(1, Ordering::SeqCst);
    if ctx.config.dry_run {
        tracing::info!(document_id = %entry.id, ?status, "dry run: document left in queue");
        return;
    }
    if let Err(err) = ctx.queue.complete(&entry.id, status) {
        tracing::error!(document_id = %entry.id, error = %err, "failed to record completion");
    }
}

fn report(ctx: &Ctx, link: &LinkReference, result: &MatchResult) {
    let record = match result {
        MatchResult::Resolved(_) => return,
        MatchResult::Ambiguous(candidates) => ReviewRecord::AmbiguousReference {
            document_id: link.document_id.clone(),
            document_title: link.document_title.clone(),
            container_id: link.address.block_id.clone(),
            display_text: link.display_text.clone(),
            raw_target: link.raw_target.clone(),
            candidates: candidates.clone(),
        },
        MatchResult::Unresolved => ReviewRecord::UnresolvedReference {
            document_id: link.document_id.clone(),
            document_title: link.document_title.clone(),
            container_id: link.address.block_id.clone(),
            display_text: link.display_text.clone(),
            raw_target: link.raw_target.clone(),
        },
        MatchResult::TargetMissing(target_id) => ReviewRecord::TargetMissing {
            document_id: link.document_id.clone(),
            document_title: link.document_title.clone(),
            container_id: link.address.block_id.clone(),
            display_text: link.display_text.clone(),
            target_id: target_id.clone(),
        },
    };
    if let Err(err) = ctx.review.record(&record) {
        tracing::error!(error = %err, "review sink write failed");
    }
}

/// Split every over-limit container in `tree`, applying the plans unless this
/// is a dry run. Returns the number of containers that needed splitting.
async fn normalize_tree(ctx: &Ctx, tree: &Document) -> usize {
    let mut plans = Vec::new();
    let mut stack: Vec<(&str, &Block)> = tree
        .blocks
        .iter()
        .rev()
        .map(|b| (tree.id.as_str(), b))
        .collect();
    while let Some((parent_id, block)) = stack.pop() {
        if needs_normalization(block, &ctx.config.limits) {
            if let Some(plan) = plan_normalization(block, &ctx.config.limits) {
                plans.push((parent_id.to_string(), block.id.clone(), plan));
            }
        }
        for child in block.children.iter().rev() {
            stack.push((block.id.as_str(), child));
        }
    }

    let count = plans.len();
    for (parent_id, block_id, plan) in plans {
        ctx.stats
            .containers_normalized
            .fetch_add(1, Ordering::SeqCst);
        if ctx.config.dry_run {
            continue;
        }
        if let Err(err) = ctx.content.update_container(&block_id, plan.body).await {
            tracing::warn!(container_id = %block_id, error = %err, "normalization update failed");
            ctx.stats.update_failures.fetch_add(1, Ordering::SeqCst);
            continue;
        }
        if !plan.overflow.is_empty() {
            if let Err(err) = ctx.content.append_siblings(&parent_id, plan.overflow).await {
                tracing::warn!(container_id = %block_id, error = %err, "normalization overflow append failed");
                ctx.stats.update_failures.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
    count
}

/// Per-reference outcomes after accounting for containers that vanished
/// between scan and rewrite. Such a reference cannot be rewritten, so it is
/// tallied and reported as unresolved whatever its match said.
fn effective_results<'a>(
    refs: &'a [LinkReference],
    results: Vec<MatchResult>,
    missing: &HashSet<&str>,
) -> Vec<(&'a LinkReference, MatchResult)> {
    refs.iter()
        .zip(results)
        .map(|(link, result)| {
            if missing.contains(link.address.block_id.as_str()) {
                (link, MatchResult::Unresolved)
            } else {
                (link, result)
            }
        })
        .collect()
}

fn index_parents(tree: &Document) -> HashMap<String, String> {
    let mut parents = HashMap::new();
    let mut stack: Vec<(&str, &Block)> = tree
        .blocks
        .iter()
        .map(|b| (tree.id.as_str(), b))
        .collect();
    while let Some((parent_id, block)) = stack.pop() {
        parents.insert(block.id.clone(), parent_id.to_string());
        for child in &block.children {
            stack.push((block.id.as_str(), child));
        }
    }
    parents
}

fn find_block<'a>(blocks: &'a [Block], id: &str) -> Option<&'a Block> {
    for block in blocks {
        if block.id == id {
            return Some(block);
        }
        if let Some(found) = find_block(&block.children, id) {
            return Some(found);
        }
    }
    None
}
