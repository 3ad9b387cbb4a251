//! Naming of backup artifacts and their age based retention.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use derive_more::{Display, Error};
use regex::Regex;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

/// Timestamp format of artifact file names.
pub const ARTIFACT_TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M-%S";

static ARTIFACT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^.+_\d{4}-\d{2}-\d{2}_\d{2}-\d{2}-\d{2}\.sql\.gz$").expect("valid regex")
});

/// File name of the artifact of `database` created at `at`:
/// `<database>_<YYYY-MM-DD_HH-MM-SS>.sql.gz`.
pub fn artifact_file_name(database: &str, at: DateTime<Utc>) -> String {
    format!("{database}_{}.sql.gz", at.format(ARTIFACT_TIMESTAMP_FORMAT))
}

/// Whether `file_name` follows the artifact naming convention.
pub fn is_artifact_name(file_name: &str) -> bool {
    ARTIFACT_NAME.is_match(file_name)
}

/// Keep artifacts for a number of days.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Retention {
    days: u32,
}

impl Retention {
    pub fn new(days: u32) -> Self {
        Self { days }
    }

    /// `0` days disables the cleanup.
    pub fn enabled(&self) -> bool {
        self.days > 0
    }

    /// Artifacts modified strictly before the cutoff are expired.
    pub fn cutoff(&self, now: SystemTime) -> SystemTime {
        now.checked_sub(Duration::from_secs(u64::from(self.days) * SECS_PER_DAY))
            .unwrap_or(SystemTime::UNIX_EPOCH)
    }

    pub fn is_expired(&self, modified: SystemTime, now: SystemTime) -> bool {
        modified < self.cutoff(now)
    }
}

#[derive(Debug, Display, Error)]
/// Errors of [cleanup_old_backups].
pub enum RetentionError {
    /// The directory can't be listed.
    #[display("Reading {} failed: {error}", path.display())]
    ReadDir {
        path: PathBuf,
        #[error(source)]
        error: io::Error,
    },
    /// An expired artifact can't be removed.
    #[display("Removing old backup {} failed: {error}", path.display())]
    Remove {
        path: PathBuf,
        #[error(source)]
        error: io::Error,
    },
}

/// Deletes the artifacts in `dir` that expired according to `retention`.
///
/// Only regular files following the artifact naming convention are
/// considered. The first failed deletion aborts the cleanup; artifacts
/// deleted before stay deleted. Returns the deleted files.
pub fn cleanup_old_backups(
    dir: &Path,
    retention: Retention,
    now: SystemTime,
) -> Result<Vec<PathBuf>, RetentionError> {
    let read_dir_err = |error| RetentionError::ReadDir {
        path: dir.to_path_buf(),
        error,
    };

    let mut deleted = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(read_dir_err)? {
        let entry = entry.map_err(read_dir_err)?;

        let is_file = entry.file_type().is_ok_and(|t| t.is_file());
        let is_artifact = entry.file_name().to_str().is_some_and(is_artifact_name);
        if !is_file || !is_artifact {
            continue;
        }

        let Ok(modified) = entry.metadata().and_then(|m| m.modified()) else {
            log::debug!(target: "retention", "Skipping {}: modification time unknown", entry.path().display());
            continue;
        };
        if !retention.is_expired(modified, now) {
            continue;
        }

        let path = entry.path();
        log::debug!(target: "retention", "Removing old backup {}", path.display());
        if let Err(error) = std::fs::remove_file(&path) {
            return Err(RetentionError::Remove { path, error });
        }
        deleted.push(path);
    }

    Ok(deleted)
}
