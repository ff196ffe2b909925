//! Reading and disposing of the worker's completion record.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::io::atomic::remove_if_exists;
use crate::io::layout::DuetPaths;

/// Raw flag contents, or `None` when no worker has written one.
pub fn read_flag(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some(raw)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        // Non-UTF-8 bytes still count as a record; validation rejects them.
        Err(err) if err.kind() == ErrorKind::InvalidData => {
            let bytes = fs::read(path).with_context(|| format!("read {}", path.display()))?;
            Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
        }
        Err(err) => Err(err).with_context(|| format!("read flag {}", path.display())),
    }
}

/// Delete a consumed or rejected flag.
///
/// Returns `false` when the flag was already gone, i.e. another invocation
/// claimed it first.
pub fn discard_flag(path: &Path) -> Result<bool> {
    let removed = remove_if_exists(path)?;
    if removed {
        debug!(path = %path.display(), "flag removed");
    }
    Ok(removed)
}

/// Move a flag that produced an unknown transition aside for inspection.
pub fn quarantine_flag(paths: &DuetPaths, now: DateTime<Utc>) -> Result<Option<PathBuf>> {
    if !paths.flag_path.exists() {
        return Ok(None);
    }
    fs::create_dir_all(&paths.quarantine_dir)
        .with_context(|| format!("create {}", paths.quarantine_dir.display()))?;
    let target = paths
        .quarantine_dir
        .join(format!("flag-{}.json", now.format("%Y%m%dT%H%M%SZ")));
    fs::rename(&paths.flag_path, &target).with_context(|| {
        format!(
            "move {} to {}",
            paths.flag_path.display(),
            target.display()
        )
    })?;
    warn!(path = %target.display(), "flag quarantined");
    Ok(Some(target))
}
