//! Output formatting utilities for the CLI.
//!
//! Commands print either human-readable tables (comfy-table) or JSON for
//! scripting. Timestamps are rendered in UTC with chrono.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use comfy_table::{Cell, CellAlignment, ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use imgsync::{FileKind, Metadata, PathUpdate, SyncStats};
use serde::Serialize;

/// Output format for CLI commands.
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable table format.
    #[default]
    Table,
    /// Machine-parseable JSON format.
    Json,
}

/// JSON document printed by `imgsync sync --format json`.
#[derive(Debug, Serialize)]
pub struct SyncReport {
    /// Every change, in the order it was applied.
    pub changes: Vec<PathUpdate>,
    /// Run counters.
    pub stats: SyncStats,
}

/// One line of `imgsync inventory`.
#[derive(Debug, Serialize)]
pub struct InventoryRow {
    pub path: PathBuf,
    /// "file", "dir", "symlink", "other", or "unreadable" for paths the
    /// partition lists but cannot stat.
    #[serde(rename = "type")]
    pub kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified: Option<DateTime<Utc>>,
}

impl InventoryRow {
    pub fn new(path: &Path, meta: Option<&Metadata>) -> Self {
        let kind = match meta.map(|m| m.kind) {
            Some(FileKind::File) => "file",
            Some(FileKind::Dir) => "dir",
            Some(FileKind::Symlink) => "symlink",
            Some(FileKind::Other) => "other",
            None => "unreadable",
        };
        InventoryRow {
            path: path.to_path_buf(),
            kind,
            mode: meta.map(|m| m.mode),
            uid: meta.map(|m| m.uid),
            gid: meta.map(|m| m.gid),
            size: meta.map(|m| m.size),
            modified: meta.map(|m| DateTime::<Utc>::from(m.mtime)),
        }
    }
}

/// Format a byte count as human-readable size.
///
/// Uses binary units (GB, MB, KB) with one decimal place.
pub fn format_size(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a timestamp for table display, e.g. `2025-01-01 00:00:00`.
pub fn format_time(t: SystemTime) -> String {
    DateTime::<Utc>::from(t).format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Create a styled table with consistent formatting.
pub fn create_styled_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Key/value table of run counters.
pub fn stats_table(stats: &SyncStats) -> Table {
    let mut table = create_styled_table();
    table.set_header(vec!["Counter", "Value"]);
    let rows = [
        ("Entries", stats.entries.to_string()),
        ("Added", stats.added.to_string()),
        ("Modified", stats.modified.to_string()),
        ("Deleted", stats.deleted.to_string()),
        ("Unchanged", stats.unchanged.to_string()),
        ("Unreadable skipped", stats.skipped_unreadable.to_string()),
        ("Written", format_size(stats.bytes_written)),
        ("Out-of-order dirs", stats.out_of_order_dirs.to_string()),
    ];
    for (name, value) in rows {
        table.add_row(vec![
            Cell::new(name),
            Cell::new(value).set_alignment(CellAlignment::Right),
        ]);
    }
    table
}

/// Columnar table of inventory rows.
pub fn inventory_table(rows: &[InventoryRow]) -> Table {
    let mut table = create_styled_table();
    table.set_header(vec!["PATH", "TYPE", "MODE", "OWNER", "SIZE", "MODIFIED"]);
    for row in rows {
        let owner = match (row.uid, row.gid) {
            (Some(uid), Some(gid)) => format!("{uid}:{gid}"),
            _ => String::new(),
        };
        table.add_row(vec![
            Cell::new(row.path.display()),
            Cell::new(row.kind),
            Cell::new(row.mode.map(|m| format!("{m:04o}")).unwrap_or_default()),
            Cell::new(owner),
            Cell::new(row.size.map(format_size).unwrap_or_default())
                .set_alignment(CellAlignment::Right),
            Cell::new(
                row.modified
                    .map(|t| format_time(t.into()))
                    .unwrap_or_default(),
            ),
        ]);
    }
    table
}

/// Print a value as a single line of JSON.
pub fn output_json<T: Serialize + ?Sized>(item: &T) -> Result<(), serde_json::Error> {
    let json = serde_json::to_string(item)?;
    println!("{}", json);
    Ok(())
}
