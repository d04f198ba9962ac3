//! Change records emitted by the reconciler.
//!
//! Every path the reconciler touches produces at most one [`PathUpdate`].
//! Unchanged paths produce none. Observers receive records synchronously, in
//! the order the changes were made.

use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Serialize, Serializer};

/// What changed about a single path.
///
/// A record is either an addition (`added`, plus whichever metadata had to be
/// adjusted on the freshly created node), a deletion (`deleted`, no
/// metadata) or a modification carrying only the fields that changed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Update {
    /// The path did not exist (or had the wrong type) and was created.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub added: bool,
    /// The path was removed because the archive does not list it.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
    /// New permission bits.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perm: Option<u32>,
    /// New owning user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,
    /// New owning group.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,
    /// New modification time.
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_mtime"
    )]
    pub mtime: Option<SystemTime>,
}

impl Update {
    /// Record for a path that was created.
    pub fn added() -> Self {
        Update {
            added: true,
            ..Default::default()
        }
    }

    /// Record for a path that was removed.
    pub fn deleted() -> Self {
        Update {
            deleted: true,
            ..Default::default()
        }
    }

    /// Returns true if nothing changed.
    pub fn is_empty(&self) -> bool {
        *self == Update::default()
    }

    /// Short change marker: `+`, `-` or `~`.
    pub fn marker(&self) -> char {
        if self.added {
            '+'
        } else if self.deleted {
            '-'
        } else {
            '~'
        }
    }
}

/// An [`Update`] together with the path it applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathUpdate {
    /// Absolute partition path.
    pub path: PathBuf,
    /// What changed.
    #[serde(flatten)]
    pub update: Update,
}

impl fmt::Display for PathUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.update.marker(), self.path.display())?;
        let u = &self.update;
        if let Some(perm) = u.perm {
            write!(f, " mode={perm:04o}")?;
        }
        if let Some(uid) = u.uid {
            write!(f, " uid={uid}")?;
        }
        if let Some(gid) = u.gid {
            write!(f, " gid={gid}")?;
        }
        if let Some(mtime) = u.mtime {
            write!(f, " mtime={}", format_time(mtime))?;
        }
        Ok(())
    }
}

/// Receiver of change records.
///
/// Closures taking `&PathUpdate` implement this trait, so a plain
/// `|u| println!("{u}")` can be registered.
pub trait SyncObserver {
    /// Called once per changed path.
    fn notify(&mut self, update: &PathUpdate);
}

impl<F: FnMut(&PathUpdate)> SyncObserver for F {
    fn notify(&mut self, update: &PathUpdate) {
        self(update)
    }
}

/// Format a timestamp as RFC 3339 in UTC, with sub-second digits only when
/// they are non-zero.
pub fn format_time(t: SystemTime) -> String {
    DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

fn serialize_mtime<S: Serializer>(mtime: &Option<SystemTime>, s: S) -> Result<S::Ok, S::Error> {
    match mtime {
        Some(t) => s.serialize_str(&format_time(*t)),
        None => s.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    #[test]
    fn test_display_added() {
        let u = PathUpdate {
            path: PathBuf::from("/etc/test.txt"),
            update: Update {
                added: true,
                perm: Some(0o644),
                uid: Some(0),
                gid: Some(0),
                mtime: Some(UNIX_EPOCH + Duration::from_secs(1735689600)),
                ..Default::default()
            },
        };
        assert_eq!(
            u.to_string(),
            "+ /etc/test.txt mode=0644 uid=0 gid=0 mtime=2025-01-01T00:00:00Z"
        );
    }

    #[test]
    fn test_display_modified_and_deleted() {
        let chmod = PathUpdate {
            path: PathBuf::from("/bin/sh"),
            update: Update {
                perm: Some(0o4755),
                ..Default::default()
            },
        };
        assert_eq!(chmod.to_string(), "~ /bin/sh mode=4755");

        let del = PathUpdate {
            path: PathBuf::from("/tmp/x"),
            update: Update::deleted(),
        };
        assert_eq!(del.to_string(), "- /tmp/x");
    }

    #[test]
    fn test_is_empty() {
        assert!(Update::default().is_empty());
        assert!(!Update::added().is_empty());
        let u = Update {
            gid: Some(5),
            ..Default::default()
        };
        assert!(!u.is_empty());
    }

    #[test]
    fn test_json_skips_unset_fields() {
        let u = PathUpdate {
            path: PathBuf::from("/etc/hosts"),
            update: Update {
                mtime: Some(UNIX_EPOCH + Duration::new(1, 500_000_000)),
                ..Default::default()
            },
        };
        let json = serde_json::to_value(&u).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "path": "/etc/hosts",
                "mtime": "1970-01-01T00:00:01.500Z",
            })
        );
    }

    #[test]
    fn test_closure_observer() {
        let mut seen = Vec::new();
        {
            let mut obs = |u: &PathUpdate| seen.push(u.path.clone());
            let record = PathUpdate {
                path: PathBuf::from("/a"),
                update: Update::added(),
            };
            SyncObserver::notify(&mut obs, &record);
        }
        assert_eq!(seen, vec![PathBuf::from("/a")]);
    }
}
