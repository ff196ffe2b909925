//! Orchestration for a single `duet tick`.
//!
//! One invocation does exactly one of: consume a completion record, wait on a
//! live worker, recover a dead one, or re-trigger the current phase of an
//! idle loop. The external driver calls this on a fixed cadence.

use std::fmt;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::core::flag_rules::{FlagRejection, validate_flag};
use crate::core::step_id::{StepId, Successor};
use crate::core::transitions::{Applied, Target, apply_completion, apply_resume};
use crate::core::types::{
    Agent, CompletionRecord, EscalationKind, LoopState, NextAgent, Phase, PromptTier,
};
use crate::exit_codes;
use crate::io::config::DuetConfig;
use crate::io::escalation::{Escalation, Escalator};
use crate::io::flag::{discard_flag, quarantine_flag, read_flag};
use crate::io::history::{Cause, HistoryEntry, append_history};
use crate::io::layout::DuetPaths;
use crate::io::ledger::{Hold, Ledger, load_ledger, write_ledger};
use crate::io::mandate::load_mandate;
use crate::io::state_store::{Integrity, StateStore};
use crate::io::supervisor::{
    Launcher, Liveness, LivenessProbe, ProcessSupervisor, Triggered, WorkerJob,
};
use crate::validate::self_check;

/// Automatic dead-worker recoveries allowed per step/phase before escalating.
const MAX_AUTO_RECOVERIES: u32 = 1;

/// What one tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A hold is in place; nothing was touched.
    Held { kind: EscalationKind, reason: String },
    /// A worker is (or is believed to be) running.
    Waiting { pid: Option<u32> },
    Triggered {
        agent: Agent,
        phase: Phase,
        tier: PromptTier,
        pid: u32,
    },
    /// The step finished; the next tick starts the successor.
    Advanced {
        from: StepId,
        to: StepId,
        held: bool,
    },
    /// The completion record was discarded; `next` is what followed.
    Rejected {
        rejection: FlagRejection,
        streak: u32,
        next: Box<TickOutcome>,
    },
    Escalated {
        kind: EscalationKind,
        reason: String,
        held: bool,
    },
}

impl TickOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            TickOutcome::Held { .. }
            | TickOutcome::Escalated { held: true, .. }
            | TickOutcome::Advanced { held: true, .. } => exit_codes::HELD,
            TickOutcome::Rejected { next, .. } if next.exit_code() == exit_codes::HELD => {
                exit_codes::HELD
            }
            TickOutcome::Rejected { .. } => exit_codes::REJECTED,
            TickOutcome::Waiting { .. }
            | TickOutcome::Triggered { .. }
            | TickOutcome::Advanced { held: false, .. }
            | TickOutcome::Escalated { held: false, .. } => exit_codes::OK,
        }
    }
}

impl fmt::Display for TickOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TickOutcome::Held { kind, reason } => write!(f, "held ({kind}): {reason}"),
            TickOutcome::Waiting { pid: Some(pid) } => write!(f, "waiting on worker pid {pid}"),
            TickOutcome::Waiting { pid: None } => {
                write!(f, "waiting on worker (pid not yet recorded)")
            }
            TickOutcome::Triggered {
                agent,
                phase,
                tier,
                pid,
            } => write!(f, "triggered {agent} for {phase} ({tier} prompt), pid {pid}"),
            TickOutcome::Advanced { from, to, held } => {
                write!(f, "advanced step {from} -> {to}")?;
                if *held {
                    write!(f, " (held for confirmation)")?;
                }
                Ok(())
            }
            TickOutcome::Rejected {
                rejection,
                streak,
                next,
            } => write!(f, "rejected flag ({rejection}), streak {streak}; then {next}"),
            TickOutcome::Escalated { kind, reason, held } => {
                write!(f, "escalated {kind}: {reason}")?;
                if *held {
                    write!(f, " (loop held)")?;
                }
                Ok(())
            }
        }
    }
}

/// The loop controller: composes the store, supervisor, and escalator.
pub struct Controller<L, P> {
    paths: DuetPaths,
    config: DuetConfig,
    store: StateStore,
    supervisor: ProcessSupervisor<L, P>,
    escalator: Escalator,
}

impl<L: Launcher, P: LivenessProbe> Controller<L, P> {
    pub fn new(
        paths: &DuetPaths,
        config: DuetConfig,
        launcher: L,
        probe: P,
        escalator: Escalator,
    ) -> Self {
        Self {
            paths: paths.clone(),
            config,
            store: StateStore::new(paths),
            supervisor: ProcessSupervisor::new(paths, launcher, probe),
            escalator,
        }
    }

    /// Run one controller invocation at time `now`.
    ///
    /// Fails only on fatal conditions: a self-check gap, corrupt state, or
    /// an I/O error. Anomalies in the loop itself are escalated instead.
    #[instrument(skip_all, fields(root = %self.paths.root.display()))]
    pub fn tick(&self, now: DateTime<Utc>) -> Result<TickOutcome> {
        self_check(&self.paths)?;

        let mut ledger = load_ledger(&self.paths.ledger_path)?;
        if let Some(hold) = &ledger.hold {
            info!(
                kind = %hold.kind,
                since = %hold.since,
                reason = %hold.reason,
                "loop held; run `duet correct` to release"
            );
            return Ok(TickOutcome::Held {
                kind: hold.kind,
                reason: hold.reason.clone(),
            });
        }

        let (state, integrity) = self.store.load_checked()?;
        match integrity {
            Integrity::Sealed => {}
            Integrity::Unsealed => {
                debug!("no seal on record, sealing current state");
                self.store.reseal()?;
            }
            Integrity::AcknowledgedEdit { note } => {
                warn!(note = %note, "accepting out-of-band edit with a new injectionNote");
                self.store.reseal()?;
            }
            Integrity::Tampered => {
                let escalation = Escalation::new(
                    EscalationKind::UnauthorizedMutation,
                    "loop state changed outside the controller without a new injectionNote",
                    now,
                )
                .with_state(&state);
                return self.escalate(&mut ledger, escalation);
            }
        }

        if let Some(raw) = read_flag(&self.paths.flag_path)? {
            return match validate_flag(
                &raw,
                &state.current_step,
                now,
                self.config.flag_max_age(),
            ) {
                Ok(record) => self.accept(state, &mut ledger, record, now),
                Err(rejection) => self.reject(state, &mut ledger, rejection, now),
            };
        }

        self.supervise(state, &mut ledger, now)
    }

    fn accept(
        &self,
        state: LoopState,
        ledger: &mut Ledger,
        record: CompletionRecord,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        let applied = match apply_completion(&state, record.status, now) {
            Ok(applied) => applied,
            Err(unknown) => {
                let quarantined = quarantine_flag(&self.paths, now)?;
                self.supervisor.release()?;
                let mut reason = format!("{unknown} (reported by {})", record.agent);
                if let Some(path) = quarantined {
                    reason.push_str(&format!("; flag moved to {}", path.display()));
                }
                let escalation =
                    Escalation::new(EscalationKind::UnknownTransition, reason, now)
                        .with_state(&state);
                return self.escalate(ledger, escalation);
            }
        };

        let routed = match applied.target {
            Target::Run { agent, .. } => NextAgent::from(agent),
            Target::Advance => NextAgent::Advance,
        };
        if record.next_agent != routed {
            warn!(
                requested = record.next_agent.as_str(),
                routed = routed.as_str(),
                "flag nextAgent disagrees with the transition table; following the table"
            );
        }

        // The record is consumed before the state write; it is never applied twice.
        if !discard_flag(&self.paths.flag_path)? {
            warn!("completion record already consumed by another invocation");
            return Ok(TickOutcome::Waiting { pid: None });
        }
        ledger.clear_counters();
        write_ledger(&self.paths.ledger_path, ledger)?;
        self.supervisor.release()?;
        info!(agent = %record.agent, status = %record.status, "completion record accepted");
        self.follow(state, applied, ledger, now, Cause::Flag)
    }

    fn reject(
        &self,
        state: LoopState,
        ledger: &mut Ledger,
        rejection: FlagRejection,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        if !discard_flag(&self.paths.flag_path)? {
            warn!("rejected record already discarded by another invocation");
            return Ok(TickOutcome::Waiting { pid: None });
        }
        let streak = ledger.record_rejection(&state.current_step, state.phase);
        write_ledger(&self.paths.ledger_path, ledger)?;
        warn!(kind = rejection.kind(), streak, reason = %rejection, "completion record rejected");

        let next = if streak >= self.config.rejection_limit {
            let escalation = Escalation::new(
                EscalationKind::RepeatedRejection,
                format!("{streak} consecutive rejected records; last: {rejection}"),
                now,
            )
            .with_state(&state);
            self.escalate(ledger, escalation)?
        } else {
            match self
                .supervisor
                .poll_liveness(now, self.config.stale_lock_after())?
            {
                Liveness::Running { pid } => TickOutcome::Waiting { pid: Some(pid) },
                Liveness::AwaitingPid { .. } => TickOutcome::Waiting { pid: None },
                Liveness::StaleUnknownOwner { .. } => self.supervise(state, ledger, now)?,
                Liveness::Idle | Liveness::CrashedNoOutput { .. } => {
                    // The worker is gone and its only output was rejected; rerun the phase.
                    self.supervisor.release()?;
                    self.resume(state, ledger, now, Cause::Resume)?
                }
            }
        };
        Ok(TickOutcome::Rejected {
            rejection,
            streak,
            next: Box::new(next),
        })
    }

    /// No completion record: decide from the lock and liveness record.
    fn supervise(
        &self,
        state: LoopState,
        ledger: &mut Ledger,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        match self
            .supervisor
            .poll_liveness(now, self.config.stale_lock_after())?
        {
            Liveness::Running { pid } => {
                debug!(pid, "worker still running");
                Ok(TickOutcome::Waiting { pid: Some(pid) })
            }
            Liveness::AwaitingPid { age } => {
                info!(age_secs = age.num_seconds(), "lock held without liveness record; waiting");
                Ok(TickOutcome::Waiting { pid: None })
            }
            Liveness::CrashedNoOutput { pid } => self.recover(state, ledger, pid, now),
            Liveness::StaleUnknownOwner { age } => {
                let escalation = Escalation::new(
                    EscalationKind::StaleLockUnknownOwner,
                    format!(
                        "lock is {} minutes old with no liveness record; clearing and re-triggering",
                        age.num_minutes()
                    ),
                    now,
                )
                .with_state(&state);
                self.raise(ledger, &escalation)?;
                self.supervisor.release()?;
                self.resume(state, ledger, now, Cause::Resume)
            }
            Liveness::Idle => self.resume(state, ledger, now, Cause::Resume),
        }
    }

    fn recover(
        &self,
        state: LoopState,
        ledger: &mut Ledger,
        pid: u32,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        self.supervisor.release()?;
        if ledger.recoveries_for(&state.current_step, state.phase) >= MAX_AUTO_RECOVERIES {
            let escalation = Escalation::new(
                EscalationKind::RepeatedCrash,
                format!("worker (pid {pid}) died without output again after an automatic recovery"),
                now,
            )
            .with_state(&state);
            return self.escalate(ledger, escalation);
        }
        let recoveries = ledger.record_recovery(&state.current_step, state.phase);
        write_ledger(&self.paths.ledger_path, ledger)?;
        warn!(
            pid,
            recoveries,
            snapshot = %state.snapshot(),
            "worker died without output; re-triggering"
        );
        self.resume(state, ledger, now, Cause::Recovery)
    }

    /// Re-enter the current `(phase, status)` with no live worker.
    fn resume(
        &self,
        state: LoopState,
        ledger: &mut Ledger,
        now: DateTime<Utc>,
        cause: Cause,
    ) -> Result<TickOutcome> {
        match apply_resume(&state, now) {
            Ok(applied) => self.follow(state, applied, ledger, now, cause),
            Err(unknown) => {
                let escalation =
                    Escalation::new(EscalationKind::UnknownTransition, unknown.to_string(), now)
                        .with_state(&state);
                self.escalate(ledger, escalation)
            }
        }
    }

    /// Persist an applied transition and act on its target.
    fn follow(
        &self,
        prior: LoopState,
        applied: Applied,
        ledger: &mut Ledger,
        now: DateTime<Utc>,
        cause: Cause,
    ) -> Result<TickOutcome> {
        let cause = match applied.target {
            Target::Advance => Cause::Advance,
            Target::Run { .. } => cause,
        };
        let next = if cause == Cause::Flag || moved(&prior, &applied.state) {
            let replacement = applied.state.clone();
            let (next, ()) = self.store.update(now, move |state| {
                *state = replacement;
                Ok(())
            })?;
            append_history(
                &self.paths.history_path,
                &HistoryEntry {
                    at: now,
                    step: prior.current_step.clone(),
                    from: Some(prior.snapshot()),
                    to: next.snapshot(),
                    cause,
                },
            )?;
            info!(
                step = %prior.current_step,
                from = %prior.snapshot(),
                to = %next.snapshot(),
                agent = %next.active_agent,
                ?cause,
                "state updated"
            );
            next
        } else {
            prior.clone()
        };

        match applied.target {
            Target::Run { phase, agent, tier } => self.trigger(&next, phase, agent, tier, now),
            Target::Advance => {
                let from = prior.current_step;
                info!(from = %from, to = %next.current_step, "step advanced");
                let held = match &applied.successor {
                    Some(Successor::Ambiguous { next: id, reason }) => {
                        let escalation = Escalation::new(
                            EscalationKind::AmbiguousSuccessor,
                            format!(
                                "advanced {from} -> {id}: {reason}; confirm with `duet correct`"
                            ),
                            now,
                        )
                        .with_state(&next);
                        self.raise(ledger, &escalation)?
                    }
                    Some(Successor::Certain(_)) | None => false,
                };
                Ok(TickOutcome::Advanced {
                    from,
                    to: next.current_step,
                    held,
                })
            }
        }
    }

    fn trigger(
        &self,
        state: &LoopState,
        phase: Phase,
        agent: Agent,
        tier: PromptTier,
        now: DateTime<Utc>,
    ) -> Result<TickOutcome> {
        let mandate = load_mandate(&self.paths.mandate_path)?;
        let job = WorkerJob {
            step: state.current_step.clone(),
            phase,
            round: state.current_round,
            agent,
            tier,
            timeout: self.config.timeouts.for_phase(phase),
            owner_mandate: mandate.contains(&state.current_step),
        };
        match self.supervisor.trigger(&job, now)? {
            Triggered::Launched { pid } => {
                info!(
                    step = %job.step,
                    snapshot = %state.snapshot(),
                    agent = %agent,
                    tier = %tier,
                    pid,
                    "worker triggered"
                );
                Ok(TickOutcome::Triggered {
                    agent,
                    phase,
                    tier,
                    pid,
                })
            }
            Triggered::LockHeld => Ok(TickOutcome::Waiting { pid: None }),
        }
    }

    fn escalate(&self, ledger: &mut Ledger, escalation: Escalation) -> Result<TickOutcome> {
        let held = self.raise(ledger, &escalation)?;
        Ok(TickOutcome::Escalated {
            kind: escalation.kind,
            reason: escalation.reason,
            held,
        })
    }

    /// Notify every sink and place a hold when the kind calls for one.
    fn raise(&self, ledger: &mut Ledger, escalation: &Escalation) -> Result<bool> {
        self.escalator.raise(escalation);
        if !escalation.kind.holds_loop() {
            return Ok(false);
        }
        ledger.hold = Some(Hold {
            kind: escalation.kind,
            reason: escalation.reason.clone(),
            since: escalation.at,
        });
        write_ledger(&self.paths.ledger_path, ledger)?;
        warn!(kind = %escalation.kind, "loop held until `duet correct`");
        Ok(true)
    }
}

/// Whether the loop position (not just `lastUpdated`) differs.
fn moved(prior: &LoopState, next: &LoopState) -> bool {
    prior.current_step != next.current_step
        || prior.snapshot() != next.snapshot()
        || prior.active_agent != next.active_agent
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Status;
    use crate::test_support::{TestWorkspace, fixed_now, flag_json, loop_state, step};

    #[test]
    fn exit_codes_follow_outcome() {
        let waiting = TickOutcome::Waiting { pid: Some(7) };
        assert_eq!(waiting.exit_code(), exit_codes::OK);

        let rejected_then_wait = TickOutcome::Rejected {
            rejection: FlagRejection::UnknownStatus("banana".to_string()),
            streak: 1,
            next: Box::new(waiting),
        };
        assert_eq!(rejected_then_wait.exit_code(), exit_codes::REJECTED);

        let rejected_then_held = TickOutcome::Rejected {
            rejection: FlagRejection::UnknownStatus("banana".to_string()),
            streak: 3,
            next: Box::new(TickOutcome::Escalated {
                kind: EscalationKind::RepeatedRejection,
                reason: "3 rejections".to_string(),
                held: true,
            }),
        };
        assert_eq!(rejected_then_held.exit_code(), exit_codes::HELD);
    }

    #[test]
    fn record_consumed_by_another_tick_is_not_applied() {
        let ws = TestWorkspace::with_state(loop_state("1", Phase::Review, Status::Proposed, 1));
        let controller = ws.controller();
        let now = fixed_now();
        let raw = flag_json("1", "approved", "implementer", now);
        let record =
            validate_flag(&raw, &step("1"), now, ws.config.flag_max_age()).expect("valid");

        // Read and validated, but the file is already gone when this tick claims it.
        assert!(!ws.paths.flag_path.exists());
        let mut ledger = ws.ledger();
        let outcome = controller
            .accept(ws.state(), &mut ledger, record, now)
            .expect("accept");

        assert_eq!(outcome, TickOutcome::Waiting { pid: None });
        let state = ws.state();
        assert_eq!((state.phase, state.status), (Phase::Review, Status::Proposed));
        assert!(ws.launcher.jobs().is_empty());
    }

    #[test]
    fn moved_ignores_last_updated() {
        let state = loop_state("2", Phase::Review, Status::Proposed, 1);
        let mut later = state.clone();
        later.last_updated = later.last_updated + chrono::Duration::minutes(3);
        assert!(!moved(&state, &later));
        later.phase = Phase::Execute;
        assert!(moved(&state, &later));
    }
}
