//! Lock marker and liveness record.
//!
//! The lock (`.duet/state/lock.json`) exists exactly while a worker is believed
//! to be running; it is the only mutual-exclusion mechanism across controller
//! invocations. The liveness record (`.duet/state/worker.pid`) holds the pid
//! of the spawned watchdog.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::step_id::StepId;
use crate::core::types::{Agent, Phase};
use crate::io::atomic::{remove_if_exists, write_atomic};
use crate::io::layout::DuetPaths;

/// Contents of the lock marker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockMarker {
    pub created_at: DateTime<Utc>,
    pub step: StepId,
    pub phase: Phase,
    pub agent: Agent,
}

/// Lock as observed on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeldLock {
    pub created_at: DateTime<Utc>,
    /// `None` when the marker exists but its contents are unreadable.
    pub marker: Option<LockMarker>,
    pub pid: Option<u32>,
}

impl HeldLock {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.created_at)
    }
}

#[derive(Debug, Clone)]
pub struct LockFiles {
    lock_path: PathBuf,
    pid_path: PathBuf,
}

impl LockFiles {
    pub fn new(paths: &DuetPaths) -> Self {
        Self {
            lock_path: paths.lock_path.clone(),
            pid_path: paths.pid_path.clone(),
        }
    }

    /// Create the lock marker exclusively.
    ///
    /// Returns `false` if a lock already exists.
    pub fn acquire(&self, marker: &LockMarker) -> Result<bool> {
        if let Some(parent) = self.lock_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create lock dir {}", parent.display()))?;
        }
        let mut file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                debug!(path = %self.lock_path.display(), "lock already held");
                return Ok(false);
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("create lock {}", self.lock_path.display()));
            }
        };
        let mut buf = serde_json::to_string_pretty(marker).context("serialize lock marker")?;
        buf.push('\n');
        file.write_all(buf.as_bytes())
            .with_context(|| format!("write lock {}", self.lock_path.display()))?;
        debug!(step = %marker.step, phase = %marker.phase, agent = %marker.agent, "lock acquired");
        Ok(true)
    }

    /// Read the lock and liveness record, if a lock is held.
    pub fn read(&self) -> Result<Option<HeldLock>> {
        let contents = match fs::read_to_string(&self.lock_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("read lock {}", self.lock_path.display()));
            }
        };
        let marker: Option<LockMarker> = match serde_json::from_str(&contents) {
            Ok(marker) => Some(marker),
            Err(err) => {
                warn!(err = %err, "unreadable lock marker, using file mtime");
                None
            }
        };
        let created_at = match &marker {
            Some(marker) => marker.created_at,
            None => self.lock_mtime()?,
        };
        Ok(Some(HeldLock {
            created_at,
            marker,
            pid: self.read_pid()?,
        }))
    }

    /// Record the pid of the spawned watchdog.
    pub fn record_pid(&self, pid: u32) -> Result<()> {
        write_atomic(&self.pid_path, &format!("{pid}\n"))
    }

    pub fn read_pid(&self) -> Result<Option<u32>> {
        let contents = match fs::read_to_string(&self.pid_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.pid_path.display()));
            }
        };
        match contents.trim().parse::<u32>() {
            Ok(pid) if pid > 0 => Ok(Some(pid)),
            _ => {
                warn!(contents = %contents.trim(), "ignoring unreadable liveness record");
                Ok(None)
            }
        }
    }

    /// Remove the liveness record and the lock marker.
    pub fn release(&self) -> Result<()> {
        remove_if_exists(&self.pid_path)?;
        if remove_if_exists(&self.lock_path)? {
            debug!(path = %self.lock_path.display(), "lock released");
        }
        Ok(())
    }

    fn lock_mtime(&self) -> Result<DateTime<Utc>> {
        let modified = fs::metadata(&self.lock_path)
            .and_then(|meta| meta.modified())
            .with_context(|| format!("stat lock {}", self.lock_path.display()))?;
        Ok(DateTime::<Utc>::from(modified))
    }
}
