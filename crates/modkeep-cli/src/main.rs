use std::{fs, path::PathBuf, process, str::FromStr, sync::Arc};

use anyhow::{anyhow, Context};
use clap::{ArgAction, Parser, Subcommand};
use color_eyre::eyre::eyre;
use tracing::info;

use indexmap::IndexMap;
use modkeep_core::{
    AuditLog, CancelToken, Config, ContentChangeOutcome, ContentStore, GcOutcome, ManifestPool,
    NotificationSink, OperationReport, ProfileStore, Reconciler, ReconciliationEvent,
    ReplacementRequest,
};
use modkeep_domain::{ContentManifest, ManifestId};

#[derive(Parser)]
#[command(
    name = "modkeep",
    version,
    about = "Local library of game content backed by a content-addressable store"
)]
struct ModkeepCli {
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[arg(long, global = true)]
    trace: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a manifest descriptor, ingesting its local files first.
    Add {
        manifest: PathBuf,
        /// Files to ingest into the content store before tracking.
        #[arg(long = "blob")]
        blobs: Vec<PathBuf>,
    },
    /// Replace installed manifests with their successors.
    Replace {
        /// `old-id=new-id` pairs, applied in order.
        #[arg(required = true)]
        pairs: Vec<String>,
        /// Keep the old manifests installed after repointing profiles.
        #[arg(long)]
        keep_old: bool,
        /// Skip the garbage-collection pass.
        #[arg(long)]
        no_gc: bool,
    },
    /// Remove manifests and collect content nothing references anymore.
    Remove {
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Swap one manifest for an updated descriptor.
    Update { old_id: String, manifest: PathBuf },
    /// Run a garbage-collection pass over the content store.
    Gc {
        #[arg(long)]
        force: bool,
    },
    /// Show recent operations from the audit log.
    History {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
        #[arg(long)]
        manifest: Option<String>,
        #[arg(long)]
        profile: Option<String>,
    },
    /// Delete audit files older than the retention window.
    AuditPrune,
    /// Summarize the manifest pool and content store.
    Status,
}

fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;

    let cli = ModkeepCli::parse();
    init_tracing(cli.trace, cli.verbose);

    let code = run(&cli).map_err(|err| eyre!("{err:#}"))?;
    if code != 0 {
        process::exit(code);
    }
    Ok(())
}

fn init_tracing(trace: bool, verbose: u8) {
    let level = if trace {
        "trace"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = format!("modkeep={level},modkeep_core={level},modkeep_cli={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

/// Sink that narrates orchestrator events through the log.
struct EventLogger;

impl NotificationSink for EventLogger {
    fn publish(&self, event: &ReconciliationEvent) {
        match event {
            ReconciliationEvent::Started {
                operation,
                manifests,
            } => info!(
                operation = operation.as_str(),
                manifests = manifests.len(),
                "reconciliation started"
            ),
            ReconciliationEvent::ContentRemoving { manifest } => {
                info!(%manifest, "removing content");
            }
            ReconciliationEvent::Completed {
                operation,
                operation_id,
                success,
            } => info!(
                operation = operation.as_str(),
                %operation_id,
                success,
                "reconciliation completed"
            ),
        }
    }
}

fn run(cli: &ModkeepCli) -> anyhow::Result<i32> {
    let config = Config::from_env()?;
    let store = ContentStore::with_policy(
        Some(config.store_root.clone()),
        config.gc_cooldown,
        config.gc_grace,
    )?;
    let pool = ManifestPool::new(config.manifests_root.clone(), store.clone())?;
    let profiles = ProfileStore::new(config.profiles_root.clone(), store.clone())?;
    let audit = AuditLog::new(config.audit_root.clone())?;

    match &cli.command {
        Command::Add { manifest, blobs } => cmd_add(&store, &pool, manifest, blobs),
        Command::Replace {
            pairs,
            keep_old,
            no_gc,
        } => {
            let reconciler = build_reconciler(profiles, pool, store, audit);
            cmd_replace(&reconciler, pairs, *keep_old, *no_gc)
        }
        Command::Remove { ids } => {
            let reconciler = build_reconciler(profiles, pool, store, audit);
            cmd_remove(&reconciler, ids)
        }
        Command::Update { old_id, manifest } => {
            let reconciler = build_reconciler(profiles, pool.clone(), store, audit);
            cmd_update(&reconciler, &pool, old_id, manifest)
        }
        Command::Gc { force } => cmd_gc(&store, *force),
        Command::History {
            limit,
            manifest,
            profile,
        } => cmd_history(&audit, *limit, manifest.as_deref(), profile.as_deref()),
        Command::AuditPrune => {
            let removed = audit.prune(config.audit_retention_days)?;
            println!("pruned {removed} audit file(s)");
            Ok(0)
        }
        Command::Status => cmd_status(&store, &pool),
    }
}

fn build_reconciler(
    profiles: ProfileStore,
    pool: ManifestPool,
    store: ContentStore,
    audit: AuditLog,
) -> Reconciler {
    Reconciler::new(
        Arc::new(profiles),
        Arc::new(pool),
        Arc::new(store),
        audit,
        Arc::new(EventLogger),
    )
}

fn cmd_add(
    store: &ContentStore,
    pool: &ManifestPool,
    manifest_path: &PathBuf,
    blobs: &[PathBuf],
) -> anyhow::Result<i32> {
    for blob in blobs {
        let bytes = fs::read(blob)
            .with_context(|| format!("failed to read blob {}", blob.display()))?;
        let stored = store.put(&bytes)?;
        println!("ingested {} as {}", blob.display(), stored.oid);
    }
    let raw = fs::read_to_string(manifest_path)
        .with_context(|| format!("failed to read manifest {}", manifest_path.display()))?;
    let manifest: ContentManifest = serde_json::from_str(&raw)
        .with_context(|| format!("failed to decode manifest {}", manifest_path.display()))?;
    pool.add(&manifest)?;
    println!("added {}", manifest.id);
    Ok(0)
}

fn cmd_replace(
    reconciler: &Reconciler,
    pairs: &[String],
    keep_old: bool,
    no_gc: bool,
) -> anyhow::Result<i32> {
    let mut mapping = IndexMap::new();
    for pair in pairs {
        let (old, new) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("expected old-id=new-id, got '{pair}'"))?;
        mapping.insert(
            ManifestId::from_str(old.trim())?,
            ManifestId::from_str(new.trim())?,
        );
    }
    let request = ReplacementRequest {
        mapping,
        remove_old_manifests: !keep_old,
        run_garbage_collection: !no_gc,
        source: "cli".to_string(),
    };
    let report = reconciler.execute_content_replacement(&request, &CancelToken::new())?;
    Ok(print_change_report("replace", &report))
}

fn cmd_remove(reconciler: &Reconciler, ids: &[String]) -> anyhow::Result<i32> {
    let ids = ids
        .iter()
        .map(|raw| ManifestId::from_str(raw).map_err(Into::into))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let report = reconciler.execute_content_removal(&ids, &CancelToken::new())?;
    Ok(print_change_report("remove", &report))
}

fn cmd_update(
    reconciler: &Reconciler,
    pool: &ManifestPool,
    old_id: &str,
    manifest_path: &PathBuf,
) -> anyhow::Result<i32> {
    let old_id = ManifestId::from_str(old_id)?;
    let raw = fs::read_to_string(manifest_path)
        .with_context(|| format!("failed to read manifest {}", manifest_path.display()))?;
    let manifest: ContentManifest = serde_json::from_str(&raw)
        .with_context(|| format!("failed to decode manifest {}", manifest_path.display()))?;
    pool.add(&manifest)?;
    let report = reconciler.execute_content_update(&old_id, &manifest, &CancelToken::new())?;
    println!(
        "update: profiles updated {}, workspaces invalidated {}",
        report.data.profiles_updated, report.data.workspaces_invalidated
    );
    for warning in &report.errors {
        eprintln!("warning: {warning}");
    }
    if report.success {
        Ok(0)
    } else {
        eprintln!(
            "operation failed: {}",
            report.first_error().unwrap_or("unknown error")
        );
        Ok(1)
    }
}

fn cmd_gc(store: &ContentStore, force: bool) -> anyhow::Result<i32> {
    match store.collect_garbage(force)? {
        GcOutcome::Completed(stats) => {
            println!(
                "gc: scanned {}, deleted {}, freed {} bytes",
                stats.scanned, stats.deleted, stats.bytes_freed
            );
            for item in &stats.errors {
                eprintln!("warning: gc {}: {}", item.oid, item.error);
            }
        }
        GcOutcome::Throttled => println!("gc skipped: inside the cooldown window (use --force)"),
        GcOutcome::Busy => println!("gc skipped: a pass is already running"),
    }
    Ok(0)
}

fn cmd_history(
    audit: &AuditLog,
    limit: usize,
    manifest: Option<&str>,
    profile: Option<&str>,
) -> anyhow::Result<i32> {
    let mut entries = if let Some(raw) = manifest {
        audit.for_manifest(&ManifestId::from_str(raw)?)?
    } else if let Some(name) = profile {
        audit.for_profile(name)?
    } else {
        audit.recent(limit)?
    };
    entries.truncate(limit);
    if entries.is_empty() {
        println!("no recorded operations");
        return Ok(0);
    }
    for entry in &entries {
        println!(
            "{} {} {} [{}] {}",
            entry.timestamp,
            entry.operation.as_str(),
            if entry.success { "ok" } else { "failed" },
            entry.operation_id,
            entry.affected_manifests.join(", ")
        );
        if let Some(error) = &entry.error {
            println!("  error: {error}");
        }
    }
    Ok(0)
}

fn cmd_status(store: &ContentStore, pool: &ManifestPool) -> anyhow::Result<i32> {
    let manifests = pool.list()?;
    let objects = store.list()?;
    println!("manifests installed: {}", manifests.len());
    println!(
        "cas objects: {} ({} bytes)",
        objects.len(),
        store.total_bytes()?
    );
    println!("referenced objects: {}", store.referenced_oids()?.len());
    Ok(0)
}

fn print_change_report(op: &str, report: &OperationReport<ContentChangeOutcome>) -> i32 {
    let data = &report.data;
    println!(
        "{op}: profiles updated {}, workspaces invalidated {}, manifests removed {}, objects collected {} ({} bytes freed)",
        data.profiles_updated,
        data.workspaces_invalidated,
        data.manifests_removed,
        data.cas_objects_collected,
        data.cas_bytes_freed
    );
    for warning in &report.errors {
        eprintln!("warning: {warning}");
    }
    if report.success {
        0
    } else {
        eprintln!(
            "operation failed: {}",
            report.first_error().unwrap_or("unknown error")
        );
        1
    }
}
