//! `duet status`: a read-only snapshot of the loop.

use std::fmt;

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::core::types::LoopState;
use crate::io::config::DuetConfig;
use crate::io::history::{HistoryEntry, read_history};
use crate::io::layout::DuetPaths;
use crate::io::ledger::{Ledger, load_ledger};
use crate::io::lock::HeldLock;
use crate::io::state_store::{Integrity, StateStore};
use crate::io::supervisor::{Launcher, Liveness, LivenessProbe, ProcessSupervisor};

#[derive(Debug, Clone)]
pub struct StatusReport {
    /// Loaded state, or the reason it could not be loaded.
    pub state: Result<(LoopState, Integrity), String>,
    pub lock: Option<HeldLock>,
    pub liveness: Liveness,
    pub ledger: Ledger,
    pub flag_present: bool,
    pub last_transition: Option<HistoryEntry>,
}

/// Gather status without writing anything.
pub fn collect_status<L: Launcher, P: LivenessProbe>(
    paths: &DuetPaths,
    config: &DuetConfig,
    supervisor: &ProcessSupervisor<L, P>,
    now: DateTime<Utc>,
) -> Result<StatusReport> {
    let state = StateStore::new(paths)
        .load_checked()
        .map_err(|err| format!("{err:#}"));
    Ok(StatusReport {
        state,
        lock: supervisor.locks().read()?,
        liveness: supervisor.poll_liveness(now, config.stale_lock_after())?,
        ledger: load_ledger(&paths.ledger_path)?,
        flag_present: paths.flag_path.exists(),
        last_transition: read_history(&paths.history_path)?.pop(),
    })
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            Ok((state, integrity)) => {
                writeln!(f, "step:      {}", state.current_step)?;
                writeln!(f, "position:  {}", state.snapshot())?;
                writeln!(f, "agent:     {}", state.active_agent)?;
                let complete: Vec<&str> =
                    state.steps_complete.iter().map(|s| s.as_str()).collect();
                writeln!(f, "complete:  [{}]", complete.join(", "))?;
                writeln!(f, "updated:   {}", state.last_updated.to_rfc3339())?;
                if let Some(note) = &state.injection_note {
                    writeln!(f, "note:      {note}")?;
                }
                if *integrity == Integrity::Tampered {
                    writeln!(f, "integrity: changed outside the controller")?;
                }
            }
            Err(err) => writeln!(f, "state:     unreadable ({err})")?,
        }
        match &self.lock {
            Some(lock) => {
                let owner = lock
                    .marker
                    .as_ref()
                    .map(|m| format!("{} {} for step {}", m.agent, m.phase, m.step))
                    .unwrap_or_else(|| "unreadable marker".to_string());
                writeln!(f, "lock:      {owner} since {}", lock.created_at.to_rfc3339())?;
            }
            None => writeln!(f, "lock:      none")?,
        }
        let liveness = match self.liveness {
            Liveness::Idle => "idle".to_string(),
            Liveness::Running { pid } => format!("running (pid {pid})"),
            Liveness::CrashedNoOutput { pid } => format!("worker gone (pid {pid})"),
            Liveness::AwaitingPid { age } => {
                format!("no liveness record yet ({}s)", age.num_seconds())
            }
            Liveness::StaleUnknownOwner { age } => {
                format!("stale lock, unknown owner ({} min)", age.num_minutes())
            }
        };
        writeln!(f, "worker:    {liveness}")?;
        writeln!(
            f,
            "flag:      {}",
            if self.flag_present { "present" } else { "none" }
        )?;
        if let Some(hold) = &self.ledger.hold {
            writeln!(
                f,
                "hold:      {} since {}: {}",
                hold.kind,
                hold.since.to_rfc3339(),
                hold.reason
            )?;
        }
        if let Some(rejections) = &self.ledger.rejections {
            writeln!(
                f,
                "rejected:  {} in {} of step {}",
                rejections.count, rejections.phase, rejections.step
            )?;
        }
        if let Some(entry) = &self.last_transition {
            let from = entry
                .from
                .map(|snapshot| snapshot.to_string())
                .unwrap_or_else(|| "-".to_string());
            write!(
                f,
                "last:      {:?} {} -> {} at {}",
                entry.cause,
                from,
                entry.to,
                entry.at.to_rfc3339()
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{EscalationKind, Phase, Status};
    use crate::io::ledger::{Hold, write_ledger};
    use crate::test_support::{TestWorkspace, fixed_now, loop_state};

    #[test]
    fn reports_position_and_hold() {
        let ws = TestWorkspace::with_state(loop_state("9", Phase::Verify, Status::Executed, 2));
        let mut ledger = ws.ledger();
        ledger.hold = Some(Hold {
            kind: EscalationKind::UnknownTransition,
            reason: "no transition".to_string(),
            since: fixed_now(),
        });
        write_ledger(&ws.paths.ledger_path, &ledger).expect("ledger");

        let supervisor = ws.supervisor();
        let report =
            collect_status(&ws.paths, &DuetConfig::default(), &supervisor, fixed_now())
                .expect("status");
        assert_eq!(report.liveness, Liveness::Idle);
        let text = report.to_string();
        assert!(text.contains("step:      9"));
        assert!(text.contains("verify/executed r2"));
        assert!(text.contains("hold:      UnknownTransition"));
    }

    #[test]
    fn corrupt_state_is_reported_not_fatal() {
        let ws = TestWorkspace::new();
        std::fs::write(&ws.paths.state_path, "{").expect("corrupt");
        let supervisor = ws.supervisor();
        let report =
            collect_status(&ws.paths, &DuetConfig::default(), &supervisor, fixed_now())
                .expect("status");
        assert!(report.state.is_err());
        assert!(report.to_string().contains("unreadable"));
    }
}
