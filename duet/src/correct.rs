//! Orchestration for `duet correct`, the audited manual correction tool.
//!
//! This is the only sanctioned way to change loop state outside the
//! transition path. It also releases a hold and resets the ledger counters,
//! so the next tick starts from a clean slate.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::io::flag::discard_flag;
use crate::io::history::{Cause, HistoryEntry, append_history};
use crate::io::layout::DuetPaths;
use crate::io::ledger::{Hold, Ledger, load_ledger, write_ledger};
use crate::io::lock::LockFiles;
use crate::io::state_store::{Correction, Overrides, StateStore};

#[derive(Debug, Clone, Default)]
pub struct CorrectOptions {
    /// Mandatory justification, recorded into `injectionNote`.
    pub reason: String,
    pub overrides: Overrides,
    pub clear_lock: bool,
    pub clear_flag: bool,
}

#[derive(Debug, Clone)]
pub struct CorrectReport {
    pub correction: Correction,
    pub released_hold: Option<Hold>,
}

#[instrument(skip_all, fields(clear_lock = options.clear_lock, clear_flag = options.clear_flag))]
pub fn run_correct(
    paths: &DuetPaths,
    options: &CorrectOptions,
    now: DateTime<Utc>,
) -> Result<CorrectReport> {
    let reason = options.reason.trim();
    if reason.is_empty() {
        return Err(anyhow!("a non-empty --reason is required"));
    }
    let mut actions = Vec::new();
    if options.clear_lock {
        actions.push("cleared lock");
    }
    if options.clear_flag {
        actions.push("cleared flag");
    }
    let audited = if actions.is_empty() {
        reason.to_string()
    } else {
        format!("{reason} ({})", actions.join(", "))
    };

    let correction = StateStore::new(paths).correct(now, &audited, &options.overrides)?;

    if options.clear_lock {
        LockFiles::new(paths).release()?;
    }
    if options.clear_flag {
        discard_flag(&paths.flag_path)?;
    }

    let mut ledger = match load_ledger(&paths.ledger_path) {
        Ok(ledger) => ledger,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "unreadable ledger replaced");
            Ledger::default()
        }
    };
    let released_hold = ledger.hold.take();
    ledger.clear_counters();
    write_ledger(&paths.ledger_path, &ledger)?;
    if let Some(hold) = &released_hold {
        info!(kind = %hold.kind, "hold released");
    }

    append_history(
        &paths.history_path,
        &HistoryEntry {
            at: now,
            step: correction.after.current_step.clone(),
            from: correction.before.as_ref().map(|state| state.snapshot()),
            to: correction.after.snapshot(),
            cause: Cause::Correction,
        },
    )?;

    Ok(CorrectReport {
        correction,
        released_hold,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::core::types::{EscalationKind, Phase, Status};
    use crate::io::history::read_history;
    use crate::io::lock::LockMarker;
    use crate::test_support::{TestWorkspace, fixed_now, loop_state};

    #[test]
    fn releases_hold_and_audits_cleared_lock() {
        let ws = TestWorkspace::with_state(loop_state("4", Phase::Execute, Status::Approved, 1));
        let mut ledger = ws.ledger();
        ledger.hold = Some(Hold {
            kind: EscalationKind::RepeatedCrash,
            reason: "worker keeps dying".to_string(),
            since: fixed_now(),
        });
        write_ledger(&ws.paths.ledger_path, &ledger).expect("write ledger");
        LockFiles::new(&ws.paths)
            .acquire(&LockMarker {
                created_at: fixed_now(),
                step: crate::test_support::step("4"),
                phase: Phase::Execute,
                agent: crate::core::types::Agent::Implementer,
            })
            .expect("lock");

        let report = run_correct(
            &ws.paths,
            &CorrectOptions {
                reason: "implementer binary was missing".to_string(),
                clear_lock: true,
                ..CorrectOptions::default()
            },
            fixed_now(),
        )
        .expect("correct");

        assert_eq!(
            report.released_hold.map(|hold| hold.kind),
            Some(EscalationKind::RepeatedCrash)
        );
        assert!(report.correction.note.contains("(cleared lock)"));
        assert!(!ws.paths.lock_path.exists());
        assert_eq!(ws.ledger(), Ledger::default());
        assert_eq!(ws.state().injection_note, Some(report.correction.note));

        let history = read_history(&ws.paths.history_path).expect("history");
        assert_eq!(history.last().map(|entry| entry.cause), Some(Cause::Correction));
    }

    #[test]
    fn empty_reason_changes_nothing() {
        let ws = TestWorkspace::with_state(loop_state("4", Phase::Execute, Status::Approved, 1));
        fs::write(&ws.paths.flag_path, "{}").expect("flag");
        let before = ws.state();

        let err = run_correct(
            &ws.paths,
            &CorrectOptions {
                reason: "   ".to_string(),
                clear_flag: true,
                ..CorrectOptions::default()
            },
            fixed_now(),
        )
        .expect_err("reason");
        assert!(err.to_string().contains("--reason"));
        assert!(ws.paths.flag_path.exists());
        assert_eq!(ws.state(), before);
    }
}
