//! Controller bookkeeping that must survive between invocations.
//!
//! Stored at `.duet/state/ledger.json`. Tracks consecutive rejected records,
//! automatic crash recoveries, and the hold marker that pauses the loop until
//! a human intervenes.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::step_id::StepId;
use crate::core::types::{EscalationKind, Phase};
use crate::io::atomic::write_atomic;

/// Per step/phase counter; resets when the step or phase changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Counter {
    pub step: StepId,
    pub phase: Phase,
    pub count: u32,
}

/// Marker that stops the controller from triggering workers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Hold {
    pub kind: EscalationKind,
    pub reason: String,
    pub since: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Ledger {
    pub rejections: Option<Counter>,
    pub recoveries: Option<Counter>,
    pub hold: Option<Hold>,
}

impl Ledger {
    /// Count one more rejected record for `step`/`phase` and return the streak.
    pub fn record_rejection(&mut self, step: &StepId, phase: Phase) -> u32 {
        bump(&mut self.rejections, step, phase)
    }

    /// Count one more automatic recovery for `step`/`phase` and return the total.
    pub fn record_recovery(&mut self, step: &StepId, phase: Phase) -> u32 {
        bump(&mut self.recoveries, step, phase)
    }

    pub fn recoveries_for(&self, step: &StepId, phase: Phase) -> u32 {
        match &self.recoveries {
            Some(c) if c.step == *step && c.phase == phase => c.count,
            _ => 0,
        }
    }

    /// Forget rejection and recovery streaks (a record was accepted).
    pub fn clear_counters(&mut self) {
        self.rejections = None;
        self.recoveries = None;
    }
}

fn bump(slot: &mut Option<Counter>, step: &StepId, phase: Phase) -> u32 {
    match slot {
        Some(c) if c.step == *step && c.phase == phase => {
            c.count += 1;
            c.count
        }
        _ => {
            *slot = Some(Counter {
                step: step.clone(),
                phase,
                count: 1,
            });
            1
        }
    }
}

/// Load the ledger; a missing file is an empty ledger.
pub fn load_ledger(path: &Path) -> Result<Ledger> {
    if !path.exists() {
        return Ok(Ledger::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let ledger: Ledger =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    debug!(?ledger, "ledger loaded");
    Ok(ledger)
}

/// Atomically write the ledger.
pub fn write_ledger(path: &Path, ledger: &Ledger) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(ledger).context("serialize ledger")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixed_now, step};

    #[test]
    fn streak_resets_on_new_phase() {
        let mut ledger = Ledger::default();
        assert_eq!(ledger.record_rejection(&step("2"), Phase::Review), 1);
        assert_eq!(ledger.record_rejection(&step("2"), Phase::Review), 2);
        assert_eq!(ledger.record_rejection(&step("2"), Phase::Execute), 1);
        assert_eq!(ledger.record_rejection(&step("3"), Phase::Execute), 1);
    }

    #[test]
    fn recoveries_are_scoped_to_step_and_phase() {
        let mut ledger = Ledger::default();
        ledger.record_recovery(&step("2"), Phase::Verify);
        assert_eq!(ledger.recoveries_for(&step("2"), Phase::Verify), 1);
        assert_eq!(ledger.recoveries_for(&step("2"), Phase::Review), 0);
        ledger.clear_counters();
        assert_eq!(ledger.recoveries_for(&step("2"), Phase::Verify), 0);
    }

    #[test]
    fn missing_file_is_empty_and_writes_round_trip() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("ledger.json");
        assert_eq!(load_ledger(&path).expect("load"), Ledger::default());

        let mut ledger = Ledger::default();
        ledger.record_rejection(&step("9"), Phase::Propose);
        ledger.hold = Some(Hold {
            kind: EscalationKind::RepeatedRejection,
            reason: "three bad records".to_string(),
            since: fixed_now(),
        });
        write_ledger(&path, &ledger).expect("write");
        assert_eq!(load_ledger(&path).expect("load"), ledger);
    }
}
