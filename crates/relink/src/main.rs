use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use relink_core::matcher::MatchPolicy;
use relink_core::model::Limits;
use relink_core::queue::{DurableQueue, QueueEntry};
use relink_core::registry::CanonicalRegistry;
use relink_core::service::{ContentAccess, NullReviewSink, ReviewRecord, ReviewSink};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod coordinator;
mod retry;
mod review;
mod snapshot;

use coordinator::{run, RunConfig, Services};
use retry::{Retrying, RetryPolicy};
use review::JsonlReviewSink;
use snapshot::SnapshotStore;

/// Resolve legacy pointers left behind by a bulk content migration.
#[derive(Parser, Debug)]
#[command(name = "relink", version)]
struct Args {
    /// Workspace snapshot file to resolve links in.
    #[arg(long, env = "RELINK_SNAPSHOT")]
    snapshot: PathBuf,

    /// Directory holding canonical.json, the progress queue, and review
    /// output. Created on first run; reusing it resumes prior progress.
    #[arg(long, default_value = "state")]
    state_dir: PathBuf,

    /// Number of concurrent document workers.
    #[arg(long, default_value_t = 4)]
    workers: usize,

    /// Process at most this many documents this run.
    #[arg(long)]
    limit: Option<usize>,

    /// Resolve one document by id instead of draining the queue.
    #[arg(long)]
    document_id: Option<String>,

    /// Directory enumeration page size.
    #[arg(long, default_value_t = 500)]
    batch_size: usize,

    /// Plan and report without writing content, queue, or review output.
    #[arg(long)]
    dry_run: bool,

    /// Probe each resolved target for liveness before rewriting.
    #[arg(long)]
    validate: bool,

    /// Require byte-exact title matches instead of normalized matches.
    #[arg(long)]
    case_sensitive: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let store = Arc::new(
        SnapshotStore::load(&args.snapshot)
            .with_context(|| format!("loading snapshot {}", args.snapshot.display()))?,
    );
    let content: Arc<dyn ContentAccess> =
        Arc::new(Retrying::new(Arc::clone(&store), RetryPolicy::default()));
    let review: Arc<dyn ReviewSink> = if args.dry_run {
        Arc::new(NullReviewSink)
    } else {
        std::fs::create_dir_all(&args.state_dir)?;
        Arc::new(JsonlReviewSink::open(&args.state_dir.join("review.jsonl"))?)
    };

    // Canonical registry: reuse a prior snapshot when present, otherwise
    // enumerate the directory and persist the result.
    let canonical_path = args.state_dir.join("canonical.json");
    let (registry, duplicates) = if canonical_path.exists() {
        tracing::info!(path = %canonical_path.display(), "reusing canonical registry");
        CanonicalRegistry::load(&canonical_path)?
    } else {
        let built = CanonicalRegistry::build(store.as_ref(), args.batch_size).await?;
        if !args.dry_run {
            std::fs::create_dir_all(&args.state_dir)?;
            built.0.save(&canonical_path)?;
        }
        built
    };
    tracing::info!(
        entries = registry.len(),
        purged_groups = duplicates.len(),
        "canonical registry ready"
    );
    for group in &duplicates {
        review.record(&ReviewRecord::DuplicateTitles {
            title: group.title.clone(),
            ids: group.ids.clone(),
        })?;
    }
    let registry = Arc::new(registry);

    let queue = Arc::new(DurableQueue::open(&args.state_dir)?);
    let seeded = queue.seed_if_empty(registry.entries().iter().map(|e| QueueEntry {
        id: e.id.clone(),
        title: e.title.clone(),
    }))?;
    if seeded > 0 {
        tracing::info!(seeded, "seeded work queue from registry");
    }

    let entries = match &args.document_id {
        Some(id) => vec![QueueEntry {
            id: id.clone(),
            title: registry.title_for(id).unwrap_or_default().to_string(),
        }],
        None => queue.claim(args.limit),
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received; finishing in-flight documents");
                shutdown.store(true, Ordering::SeqCst);
            }
        });
    }

    let config = RunConfig {
        workers: args.workers,
        dry_run: args.dry_run,
        validate: args.validate,
        limits: Limits::default(),
        policy: if args.case_sensitive {
            MatchPolicy::CaseSensitiveExact
        } else {
            MatchPolicy::NormalizedExact
        },
    };
    let summary = run(
        Services {
            content,
            review,
        },
        Arc::clone(&registry),
        Arc::clone(&queue),
        entries,
        config,
        shutdown,
    )
    .await;

    if !args.dry_run {
        store.persist().context("writing snapshot back")?;
    }

    let header = if args.dry_run {
        "dry run complete".yellow().bold()
    } else {
        "run complete".green().bold()
    };
    println!("{header}");
    println!("  documents processed   {}", summary.documents_processed);
    println!("  documents with links  {}", summary.documents_with_links);
    println!(
        "  links resolved        {}",
        summary.links_resolved.to_string().green()
    );
    if summary.links_ambiguous > 0 {
        println!(
            "  links ambiguous       {}",
            summary.links_ambiguous.to_string().yellow()
        );
    }
    if summary.links_unresolved + summary.links_target_missing > 0 {
        println!(
            "  links unresolved      {}",
            (summary.links_unresolved + summary.links_target_missing)
                .to_string()
                .red()
        );
    }
    println!("  containers normalized {}", summary.containers_normalized);
    println!("  containers rewritten  {}", summary.containers_rewritten);
    if summary.documents_abandoned > 0 {
        println!(
            "  documents abandoned   {}",
            summary.documents_abandoned.to_string().red()
        );
    }
    if summary.update_failures > 0 {
        println!(
            "  update failures       {}",
            summary.update_failures.to_string().red()
        );
    }
    println!("  remaining in queue    {}", queue.unfinished_len());

    Ok(())
}
