//! Configuration parsing for sync runs.
//!
//! Settings live in a small TOML file, conventionally `imgsync.toml`:
//!
//! ```toml
//! [disk]
//! root = "/mnt/rootfs"
//! require_mountpoint = true
//!
//! [sync]
//! order_check = "warn"
//! ```
//!
//! Every key is optional. Command-line flags take precedence over file
//! values.
//!
//! # Usage Example
//!
//! ```
//! use imgsync::config::{OrderCheck, SyncConfig};
//!
//! let config = SyncConfig::from_toml("[sync]\norder_check = \"error\"\n")?;
//! assert_eq!(config.sync.order_check, OrderCheck::Error);
//! assert!(config.disk.require_mountpoint);
//! # Ok::<(), imgsync::SyncError>(())
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncConfig {
    /// Target partition settings.
    #[serde(default)]
    pub disk: DiskConfig,

    /// Reconciler settings.
    #[serde(default)]
    pub sync: SyncSection,
}

/// The `[disk]` table.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DiskConfig {
    /// Host directory where the partition is mounted.
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// Refuse to sync into a directory that is not a mount point.
    #[serde(default = "default_true")]
    pub require_mountpoint: bool,
}

impl Default for DiskConfig {
    fn default() -> Self {
        DiskConfig {
            root: None,
            require_mountpoint: true,
        }
    }
}

/// The `[sync]` table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncSection {
    /// What to do when a directory is listed after its contents.
    #[serde(default)]
    pub order_check: OrderCheck,
}

/// Handling of archives that list a directory after entries nested in it.
///
/// Parent mtime preservation assumes every directory precedes its contents.
/// When that does not hold, the directory's final mtime may be off.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum OrderCheck {
    /// Do not track ordering.
    Ignore,
    /// Log a warning and count the directory in the run statistics.
    #[default]
    Warn,
    /// Abort the run with [`SyncError::OutOfOrder`].
    Error,
}

fn default_true() -> bool {
    true
}

impl SyncConfig {
    /// Parse configuration from TOML content.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Read and parse a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(SyncError::Io)?;
        Self::from_toml(&content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_defaults() {
        let config = SyncConfig::from_toml("").unwrap();
        assert_eq!(config, SyncConfig::default());
        assert_eq!(config.disk.root, None);
        assert!(config.disk.require_mountpoint);
        assert_eq!(config.sync.order_check, OrderCheck::Warn);
    }

    #[test]
    fn test_full_config() {
        let config = SyncConfig::from_toml(
            r#"
            [disk]
            root = "/mnt/rootfs"
            require_mountpoint = false

            [sync]
            order_check = "ignore"
            "#,
        )
        .unwrap();
        assert_eq!(config.disk.root, Some(PathBuf::from("/mnt/rootfs")));
        assert!(!config.disk.require_mountpoint);
        assert_eq!(config.sync.order_check, OrderCheck::Ignore);
    }

    #[test]
    fn test_invalid_order_check() {
        let err = SyncConfig::from_toml("[sync]\norder_check = \"sometimes\"\n").unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(SyncConfig::from_toml("[disk]\nmountpoint = true\n").is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = SyncConfig::load("/nonexistent/imgsync.toml").unwrap_err();
        assert!(matches!(err, SyncError::Io(_)));
    }
}
