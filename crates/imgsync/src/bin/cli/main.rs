//! imgsync: command-line front end for the partition reconciler
//!
//! Syncs a mounted disk partition to the contents of a tar archive, or lists
//! what is currently on the partition.
//!
//! The archive is usually produced by a disk-image tool exporting a container
//! root filesystem and is read from a file or from standard input:
//!
//! ```bash
//! imgsync sync /mnt/rootfs --tar rootfs.tar
//! podman export ctr | imgsync sync /mnt/rootfs -v
//! ```
//!
//! Logging goes to stderr and is controlled by `RUST_LOG` (default `warn`;
//! `-v` raises it to `debug`). Change records and summaries go to stdout.

mod output;

use std::cell::RefCell;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imgsync::*;
use output::{InventoryRow, OutputFormat, SyncReport, output_json};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "imgsync")]
#[command(about = "Sync a mounted disk partition to a tar archive", long_about = None)]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log and print every change
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile a partition against an archive
    Sync {
        /// Mount point of the partition (default: `disk.root` from the config)
        root: Option<PathBuf>,
        /// Tar archive to apply, `-` for standard input
        #[arg(long, default_value = "-")]
        tar: PathBuf,
        /// What to do when a directory is listed after its contents
        #[arg(long, value_enum)]
        order_check: Option<OrderCheck>,
        /// Sync into a directory even if nothing is mounted there
        #[arg(long)]
        allow_non_mountpoint: bool,
        /// Output format (table or json)
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },

    /// List every path on a partition
    #[command(visible_alias = "ls")]
    Inventory {
        /// Mount point of the partition (default: `disk.root` from the config)
        root: Option<PathBuf>,
        /// List a directory even if nothing is mounted there
        #[arg(long)]
        allow_non_mountpoint: bool,
        /// Output format (table or json)
        #[arg(long, value_enum, default_value = "table")]
        format: OutputFormat,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SyncConfig::default(),
    };

    match cli.command {
        Commands::Sync {
            root,
            tar,
            order_check,
            allow_non_mountpoint,
            format,
        } => {
            let root = resolve_root(root, &config)?;
            let options = SyncOptions {
                order_check: order_check.unwrap_or(config.sync.order_check),
            };
            let mut disk = open_disk(&root, &config, allow_non_mountpoint)?;
            sync(&mut disk, &tar, options, cli.verbose, format)?
        }
        Commands::Inventory {
            root,
            allow_non_mountpoint,
            format,
        } => {
            let root = resolve_root(root, &config)?;
            let disk = open_disk(&root, &config, allow_non_mountpoint)?;
            list_inventory(&disk, format)?
        }
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn resolve_root(root: Option<PathBuf>, config: &SyncConfig) -> Result<PathBuf> {
    root.or_else(|| config.disk.root.clone())
        .context("No partition root given on the command line or in the config")
}

fn open_disk(root: &Path, config: &SyncConfig, allow_non_mountpoint: bool) -> Result<DirFs> {
    let disk = if config.disk.require_mountpoint && !allow_non_mountpoint {
        DirFs::open_mountpoint(root)
    } else {
        DirFs::open(root)
    };
    disk.with_context(|| format!("Failed to open partition at {}", root.display()))
}

fn open_archive(tar: &Path) -> Result<Box<dyn Read>> {
    if tar == Path::new("-") {
        return Ok(Box::new(BufReader::new(io::stdin().lock())));
    }
    let file = File::open(tar).with_context(|| format!("Failed to open {}", tar.display()))?;
    Ok(Box::new(BufReader::new(file)))
}

fn sync(
    disk: &mut DirFs,
    tar: &Path,
    options: SyncOptions,
    verbose: bool,
    format: OutputFormat,
) -> Result<()> {
    let archive = open_archive(tar)?;
    let changes = RefCell::new(Vec::new());

    let stats = Reconciler::new(disk)
        .with_options(options)
        .with_observer(|u: &PathUpdate| match format {
            OutputFormat::Json => changes.borrow_mut().push(u.clone()),
            OutputFormat::Table if verbose => println!("{u}"),
            OutputFormat::Table => {}
        })
        .run(archive)
        .context("Sync failed")?;

    match format {
        OutputFormat::Json => {
            let report = SyncReport {
                changes: changes.into_inner(),
                stats,
            };
            output_json(&report).context("Failed to output report")?;
        }
        OutputFormat::Table if verbose => println!("{}", output::stats_table(&stats)),
        OutputFormat::Table => println!("{stats}"),
    }

    Ok(())
}

fn list_inventory(disk: &DirFs, format: OutputFormat) -> Result<()> {
    let inventory = disk
        .enumerate_all_paths()
        .context("Failed to enumerate partition")?;

    let mut rows = Vec::with_capacity(inventory.len());
    for path in inventory.iter() {
        let meta = disk
            .lstat(path)
            .with_context(|| format!("Failed to stat {}", path.display()))?;
        rows.push(InventoryRow::new(path, meta.as_ref()));
    }

    match format {
        OutputFormat::Json => output_json(&rows).context("Failed to output inventory")?,
        OutputFormat::Table => println!("{}", output::inventory_table(&rows)),
    }

    Ok(())
}
