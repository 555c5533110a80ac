/*!
DeltaVault CLI - Command-line interface for DeltaVault snapshot directories.

This CLI provides utilities for inspecting, verifying, tagging and moving
snapshots stored in a local vault directory.
*/

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use deltavault_core::{
    observability::{default_filter, init_observability_with_filter},
    open_manager, DependentPolicy, SnapshotManager, SnapshotMetadata, StorageAdapter, VaultConfig,
};
use std::path::{Path, PathBuf};
use tabled::{Table, Tabled};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

type Vault = SnapshotManager<Box<dyn StorageAdapter>>;

#[derive(Parser)]
#[command(name = "deltavault")]
#[command(about = "CLI for DeltaVault snapshot directories")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Vault directory
    #[arg(short, long, global = true, env = "DELTAVAULT_PATH", default_value = "./snapshots")]
    path: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List all snapshots, oldest first
    List {
        /// Show additional details
        #[arg(short, long)]
        detailed: bool,
        /// Only snapshots carrying this tag
        #[arg(short, long)]
        tag: Option<String>,
    },
    /// Show details of a specific snapshot
    Show {
        /// Snapshot version
        version: String,
        /// Also print the reconstructed state
        #[arg(long)]
        data: bool,
    },
    /// Verify one snapshot, or every snapshot when no version is given
    Verify {
        /// Snapshot version
        version: Option<String>,
    },
    /// Add tags to a snapshot
    Tag {
        version: String,
        #[arg(required = true)]
        tags: Vec<String>,
    },
    /// Remove tags from a snapshot
    Untag {
        version: String,
        #[arg(required = true)]
        tags: Vec<String>,
    },
    /// Delete a snapshot
    Delete {
        /// Snapshot version
        version: String,
        /// Rewrite dependent delta snapshots as full snapshots first
        #[arg(long)]
        materialize: bool,
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
    /// Compare two snapshots key by key
    Diff { from: String, to: String },
    /// Write a self-contained copy of a snapshot to a file
    Export { version: String, output: PathBuf },
    /// Register an exported snapshot in this vault
    Import {
        input: PathBuf,
        /// Version id for the imported snapshot (a UUID by default)
        #[arg(long)]
        version: Option<String>,
    },
    /// Show vault statistics
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Tabled)]
struct SnapshotRow {
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Tags")]
    tags: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "Size")]
    size: String,
}

#[derive(Tabled)]
struct DetailedRow {
    #[tabled(rename = "Version")]
    version: String,
    #[tabled(rename = "Seq")]
    sequence: u64,
    #[tabled(rename = "Base")]
    base: String,
    #[tabled(rename = "Depth")]
    depth: u32,
    #[tabled(rename = "Tags")]
    tags: String,
    #[tabled(rename = "Created")]
    created: String,
    #[tabled(rename = "State")]
    state_size: String,
    #[tabled(rename = "Stored")]
    stored_size: String,
    #[tabled(rename = "Description")]
    description: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.json_logs)?;

    let path = cli.path;
    match cli.command {
        Commands::List { detailed, tag } => list_snapshots(path, detailed, tag).await?,
        Commands::Show { version, data } => show_snapshot(path, version, data).await?,
        Commands::Verify { version } => verify_snapshots(path, version).await?,
        Commands::Tag { version, tags } => tag_snapshot(path, version, tags, true).await?,
        Commands::Untag { version, tags } => tag_snapshot(path, version, tags, false).await?,
        Commands::Delete {
            version,
            materialize,
            force,
        } => delete_snapshot(path, version, materialize, force).await?,
        Commands::Diff { from, to } => diff_snapshots(path, from, to).await?,
        Commands::Export { version, output } => export_snapshot(path, version, output).await?,
        Commands::Import { input, version } => import_snapshot(path, input, version).await?,
        Commands::Stats { json } => show_stats(path, json).await?,
    }

    Ok(())
}

fn init_logging(verbose: bool, json: bool) -> Result<(), anyhow::Error> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("deltavault=debug"))
    } else {
        default_filter()?
    };
    init_observability_with_filter(filter, json)?;
    Ok(())
}

fn open_vault(path: &Path) -> Result<Vault, anyhow::Error> {
    let config = VaultConfig::local(path).apply_env()?;
    open_manager(config).with_context(|| format!("Failed to open vault at {}", path.display()))
}

/// Open the vault and run `op` off the async runtime
async fn with_vault<T, F>(path: PathBuf, op: F) -> Result<T, anyhow::Error>
where
    T: Send + 'static,
    F: FnOnce(&Vault) -> Result<T, anyhow::Error> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let vault = open_vault(&path)?;
        op(&vault)
    })
    .await?
}

async fn list_snapshots(
    path: PathBuf,
    detailed: bool,
    tag: Option<String>,
) -> Result<(), anyhow::Error> {
    if !path.exists() {
        println!("No vault directory found at: {}", path.display());
        return Ok(());
    }
    info!("Listing snapshots from {}", path.display());

    let snapshots = with_vault(path, move |vault| {
        Ok(vault
            .list_snapshots()
            .into_iter()
            .filter(|m| tag.as_deref().map_or(true, |t| m.has_tag(t)))
            .collect::<Vec<_>>())
    })
    .await?;

    if snapshots.is_empty() {
        println!("No snapshots found");
    } else if detailed {
        let rows: Vec<DetailedRow> = snapshots.iter().map(detailed_row).collect();
        println!("{}", Table::new(rows));
    } else {
        let rows: Vec<SnapshotRow> = snapshots.iter().map(snapshot_row).collect();
        println!("{}", Table::new(rows));
    }

    Ok(())
}

async fn show_snapshot(path: PathBuf, version: String, data: bool) -> Result<(), anyhow::Error> {
    info!("Showing snapshot: {}", version);

    let (metadata, state) = with_vault(path, move |vault| {
        if data {
            let (state, metadata) = vault.get_snapshot(&version)?;
            Ok((metadata, Some(state)))
        } else {
            Ok((vault.get_metadata(&version)?, None))
        }
    })
    .await?;

    println!("Snapshot Details:");
    println!("  Version: {}", metadata.version);
    println!("  Sequence: {}", metadata.sequence);
    println!("  Created: {}", format_timestamp(metadata.created_at));
    match &metadata.base_version {
        Some(base) => println!("  Kind: delta of {base} (depth {})", metadata.chain_depth),
        None => println!("  Kind: full"),
    }
    if !metadata.tags.is_empty() {
        println!("  Tags: {}", metadata.tags.join(", "));
    }
    if let Some(description) = &metadata.description {
        println!("  Description: {description}");
    }
    println!("  Format Version: {}", metadata.format_version);
    println!("  Compression: {}", metadata.compression_algorithm);
    println!("  State Checksum: {}", metadata.checksum);
    println!("  State Size: {}", format_size(metadata.size_bytes));
    println!("  Payload Checksum: {}", metadata.payload_checksum);
    println!("  Stored Size: {}", format_size(metadata.stored_size));
    if !metadata.user_info.is_empty() {
        println!(
            "  User Info: {}",
            serde_json::to_string(&metadata.user_info)?
        );
    }

    if let Some(state) = state {
        println!("{}", serde_json::to_string_pretty(&state)?);
    }

    Ok(())
}

async fn verify_snapshots(path: PathBuf, version: Option<String>) -> Result<(), anyhow::Error> {
    match version {
        Some(version) => {
            info!("Verifying snapshot: {}", version);
            let target = version.clone();
            match with_vault(path, move |vault| Ok(vault.verify_snapshot(&target)?)).await {
                Ok(()) => println!("✓ Snapshot {version} is valid and integrity check passed"),
                Err(e) => {
                    error!("✗ Failed to verify snapshot {}: {}", version, e);
                    return Err(e);
                }
            }
        }
        None => {
            info!("Verifying all snapshots");
            let report = with_vault(path, |vault| Ok(vault.verify_all())).await?;
            for (version, reason) in &report.failures {
                error!("✗ {}: {}", version, reason);
            }
            println!(
                "{} checked, {} valid, {} failed",
                report.checked,
                report.valid.len(),
                report.failures.len()
            );
            if !report.is_ok() {
                bail!("Integrity check failed for {} snapshot(s)", report.failures.len());
            }
        }
    }

    Ok(())
}

async fn tag_snapshot(
    path: PathBuf,
    version: String,
    tags: Vec<String>,
    add: bool,
) -> Result<(), anyhow::Error> {
    let metadata = with_vault(path, move |vault| {
        if add {
            vault.tag_snapshot(&version, tags)?;
        } else {
            vault.untag_snapshot(&version, tags)?;
        }
        Ok(vault.get_metadata(&version)?)
    })
    .await?;

    let tags = if metadata.tags.is_empty() {
        "(none)".to_string()
    } else {
        metadata.tags.join(", ")
    };
    println!("✓ {} tags: {}", metadata.version, tags);
    Ok(())
}

async fn delete_snapshot(
    path: PathBuf,
    version: String,
    materialize: bool,
    force: bool,
) -> Result<(), anyhow::Error> {
    if !force {
        print!("Are you sure you want to delete snapshot '{version}'? (y/N): ");
        use std::io::{self, Write};
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().to_lowercase().starts_with('y') {
            println!("Deletion cancelled");
            return Ok(());
        }
    }

    let policy = if materialize {
        DependentPolicy::Materialize
    } else {
        DependentPolicy::Forbid
    };
    let target = version.clone();
    with_vault(path, move |vault| {
        Ok(vault.delete_snapshot_with(&target, policy)?)
    })
    .await?;

    println!("✓ Snapshot {version} deleted successfully");
    Ok(())
}

async fn diff_snapshots(path: PathBuf, from: String, to: String) -> Result<(), anyhow::Error> {
    let diff = with_vault(path, move |vault| Ok(vault.compare_snapshots(&from, &to)?)).await?;

    if diff.is_identical() {
        println!(
            "{} and {} are identical ({} keys)",
            diff.from_version, diff.to_version, diff.unchanged
        );
        return Ok(());
    }

    println!("--- {}", diff.from_version);
    println!("+++ {}", diff.to_version);
    for (key, value) in &diff.removed {
        println!("- {key}: {value}");
    }
    for (key, change) in &diff.changed {
        println!("~ {key}: {} -> {}", change.old, change.new);
    }
    for (key, value) in &diff.added {
        println!("+ {key}: {value}");
    }
    println!(
        "{} change(s), {} unchanged key(s)",
        diff.change_count(),
        diff.unchanged
    );
    Ok(())
}

async fn export_snapshot(
    path: PathBuf,
    version: String,
    output: PathBuf,
) -> Result<(), anyhow::Error> {
    let destination = output.clone();
    let source = version.clone();
    with_vault(path, move |vault| {
        Ok(vault.export_snapshot(&source, &destination)?)
    })
    .await?;

    println!("✓ Exported {version} to {}", output.display());
    Ok(())
}

async fn import_snapshot(
    path: PathBuf,
    input: PathBuf,
    version: Option<String>,
) -> Result<(), anyhow::Error> {
    let source = input.clone();
    let imported = with_vault(path, move |vault| {
        Ok(vault.import_snapshot(&source, version.as_deref())?)
    })
    .await?;

    println!("✓ Imported {} as {imported}", input.display());
    Ok(())
}

async fn show_stats(path: PathBuf, json: bool) -> Result<(), anyhow::Error> {
    let stats = with_vault(path, |vault| Ok(vault.get_statistics())).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Vault Statistics:");
    println!(
        "  Snapshots: {} ({} full, {} delta, {} tagged)",
        stats.snapshot_count, stats.full_snapshots, stats.delta_snapshots, stats.tagged_snapshots
    );
    if !stats.tags.is_empty() {
        println!("  Tags: {}", stats.tags.join(", "));
    }
    println!("  State Size: {}", format_size(stats.total_state_bytes));
    println!("  Stored Size: {}", format_size(stats.total_stored_bytes));
    println!("  Space Savings: {:.1}%", stats.space_savings * 100.0);
    println!("  Longest Chain: {}", stats.max_chain_depth);
    if let (Some(oldest), Some(newest)) = (stats.oldest_created_at, stats.newest_created_at) {
        println!("  Oldest: {}", format_timestamp(oldest));
        println!("  Newest: {}", format_timestamp(newest));
    }
    Ok(())
}

fn snapshot_row(metadata: &SnapshotMetadata) -> SnapshotRow {
    SnapshotRow {
        version: metadata.version.clone(),
        kind: if metadata.is_delta() { "delta" } else { "full" }.to_string(),
        tags: metadata.tags.join(","),
        created: format_timestamp(metadata.created_at),
        size: format_size(metadata.size_bytes),
    }
}

fn detailed_row(metadata: &SnapshotMetadata) -> DetailedRow {
    DetailedRow {
        version: metadata.version.clone(),
        sequence: metadata.sequence,
        base: metadata.base_version.clone().unwrap_or_else(|| "-".to_string()),
        depth: metadata.chain_depth,
        tags: metadata.tags.join(","),
        created: format_timestamp(metadata.created_at),
        state_size: format_size(metadata.size_bytes),
        stored_size: format_size(metadata.stored_size),
        description: metadata.description.clone().unwrap_or_default(),
    }
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

/// Render a UNIX timestamp with fractional seconds in local time
fn format_timestamp(timestamp: f64) -> String {
    use chrono::{Local, TimeZone};

    let seconds = timestamp.trunc() as i64;
    let nanos = (timestamp.fract() * 1e9) as u32;
    match Local.timestamp_opt(seconds, nanos) {
        chrono::LocalResult::Single(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        _ => format!("{timestamp:.3}"),
    }
}
