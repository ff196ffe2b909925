//! Append-only transition history (`.duet/history.jsonl`).
//!
//! Product artifact, independent of `RUST_LOG`: one JSON line per applied
//! transition, resume, recovery, or manual correction.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::step_id::StepId;
use crate::core::types::PhaseSnapshot;

/// What caused a recorded state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cause {
    Flag,
    Resume,
    Advance,
    Recovery,
    Correction,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    /// Step the change was applied to (the finished step on `advance`).
    pub step: StepId,
    /// `None` when a corrupt state was rebuilt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PhaseSnapshot>,
    pub to: PhaseSnapshot,
    pub cause: Cause,
}

pub fn append_history(path: &Path, entry: &HistoryEntry) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let mut line = serde_json::to_string(entry).context("serialize history entry")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}

/// Read all entries, oldest first. A missing file is an empty history.
pub fn read_history(path: &Path) -> Result<Vec<HistoryEntry>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), idx + 1))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Phase, Status};
    use crate::test_support::{fixed_now, step};

    #[test]
    fn appends_one_line_per_entry() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("history.jsonl");
        let snapshot = |phase, status, round| PhaseSnapshot {
            phase,
            status,
            round,
        };
        let first = HistoryEntry {
            at: fixed_now(),
            step: step("2"),
            from: Some(snapshot(Phase::Propose, Status::Starting, 1)),
            to: snapshot(Phase::Review, Status::Proposed, 1),
            cause: Cause::Flag,
        };
        let second = HistoryEntry {
            from: None,
            cause: Cause::Correction,
            ..first.clone()
        };
        append_history(&path, &first).expect("append");
        append_history(&path, &second).expect("append");

        let raw = fs::read_to_string(&path).expect("read");
        assert_eq!(raw.lines().count(), 2);
        assert!(raw.contains("\"cause\":\"flag\""));
        assert_eq!(read_history(&path).expect("parse"), vec![first, second]);
    }
}
