//! The transition table and the pure state updates it drives.
//!
//! Both lookups are exhaustive matches over `(Phase, Status)` with no wildcard
//! arm: adding a status or phase fails to compile until every combination is
//! routed or explicitly marked as an anomaly.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::core::step_id::Successor;
use crate::core::types::{Agent, LoopState, Phase, PromptTier, Status};

/// Where a `(phase, status)` pair leads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Stay in (or move to) `phase` and trigger `agent` with `tier`.
    Run {
        phase: Phase,
        agent: Agent,
        tier: PromptTier,
    },
    /// The step is finished; fold back into `propose` for the next step.
    Advance,
}

/// A `(phase, status)` pair with no table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownTransition {
    pub phase: Phase,
    pub status: Status,
}

impl fmt::Display for UnknownTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "no transition for phase={} status={}",
            self.phase, self.status
        )
    }
}

impl std::error::Error for UnknownTransition {}

fn run(phase: Phase, agent: Agent, tier: PromptTier) -> Option<Target> {
    Some(Target::Run { phase, agent, tier })
}

/// Look up the table entry for a worker-reported `status` in `phase`.
pub fn transition(phase: Phase, status: Status) -> Option<Target> {
    match phase {
        Phase::Propose => match status {
            Status::Starting => run(Phase::Propose, Agent::Implementer, PromptTier::Propose),
            Status::Proposed => run(Phase::Review, Agent::Reviewer, PromptTier::Review),
            Status::Approved
            | Status::Reviewed
            | Status::NotApproved
            | Status::Executed
            | Status::VerifiedClean => None,
        },
        Phase::Review => match status {
            Status::Approved => run(Phase::Execute, Agent::Implementer, PromptTier::Execute),
            Status::Reviewed | Status::NotApproved => {
                run(Phase::Review, Agent::Implementer, PromptTier::Revise)
            }
            Status::Starting | Status::Proposed | Status::Executed | Status::VerifiedClean => None,
        },
        Phase::Execute => match status {
            Status::Executed => run(Phase::Verify, Agent::Reviewer, PromptTier::Verify),
            Status::Starting
            | Status::Proposed
            | Status::Approved
            | Status::Reviewed
            | Status::NotApproved
            | Status::VerifiedClean => None,
        },
        Phase::Verify => match status {
            Status::VerifiedClean => Some(Target::Advance),
            Status::Reviewed | Status::NotApproved => {
                run(Phase::Verify, Agent::Implementer, PromptTier::Fix)
            }
            Status::Starting | Status::Proposed | Status::Approved | Status::Executed => None,
        },
    }
}

/// Decide what to (re)trigger for a persisted `(phase, status)` when no worker is live.
///
/// Table keys follow the table. Pairs the table produces as a resting state
/// (for example `review/proposed` after a proposal) re-run the agent the table
/// assigned on entry. Everything else is an anomaly.
pub fn resume(phase: Phase, status: Status) -> Option<Target> {
    match phase {
        Phase::Propose => transition(phase, status),
        Phase::Review => match status {
            Status::Proposed => run(Phase::Review, Agent::Reviewer, PromptTier::Review),
            Status::Approved | Status::Reviewed | Status::NotApproved => {
                transition(phase, status)
            }
            Status::Starting | Status::Executed | Status::VerifiedClean => None,
        },
        Phase::Execute => match status {
            Status::Approved => run(Phase::Execute, Agent::Implementer, PromptTier::Execute),
            Status::Executed => transition(phase, status),
            Status::Starting
            | Status::Proposed
            | Status::Reviewed
            | Status::NotApproved
            | Status::VerifiedClean => None,
        },
        Phase::Verify => match status {
            Status::Executed => run(Phase::Verify, Agent::Reviewer, PromptTier::Verify),
            Status::VerifiedClean | Status::Reviewed | Status::NotApproved => {
                transition(phase, status)
            }
            Status::Starting | Status::Proposed | Status::Approved => None,
        },
    }
}

/// New state plus what the controller must do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub state: LoopState,
    pub target: Target,
    /// Set when the step advanced; carries the successor classification.
    pub successor: Option<Successor>,
}

/// Apply a validated worker `status` to `state`.
///
/// Correction statuses increment the round. The result depends only on the
/// current state, the status, and `now` (used for `lastUpdated`).
pub fn apply_completion(
    state: &LoopState,
    status: Status,
    now: DateTime<Utc>,
) -> Result<Applied, UnknownTransition> {
    let target = transition(state.phase, status).ok_or(UnknownTransition {
        phase: state.phase,
        status,
    })?;
    let mut next = state.clone();
    next.last_updated = now;
    match target {
        Target::Run { phase, agent, .. } => {
            next.phase = phase;
            next.status = status;
            next.active_agent = agent;
            if status.is_correction() {
                next.current_round += 1;
            }
            Ok(Applied {
                state: next,
                target,
                successor: None,
            })
        }
        Target::Advance => {
            let successor = advance(&mut next);
            Ok(Applied {
                state: next,
                target,
                successor: Some(successor),
            })
        }
    }
}

/// Re-enter the current `(phase, status)` of an idle loop.
///
/// Moves to the target phase and records the agent; status and round are kept.
pub fn apply_resume(state: &LoopState, now: DateTime<Utc>) -> Result<Applied, UnknownTransition> {
    let target = resume(state.phase, state.status).ok_or(UnknownTransition {
        phase: state.phase,
        status: state.status,
    })?;
    let mut next = state.clone();
    next.last_updated = now;
    match target {
        Target::Run { phase, agent, .. } => {
            next.phase = phase;
            next.active_agent = agent;
            Ok(Applied {
                state: next,
                target,
                successor: None,
            })
        }
        Target::Advance => {
            let successor = advance(&mut next);
            Ok(Applied {
                state: next,
                target,
                successor: Some(successor),
            })
        }
    }
}

fn advance(state: &mut LoopState) -> Successor {
    let successor = state.current_step.successor();
    state.steps_complete.push(state.current_step.clone());
    state.current_step = successor.step().clone();
    state.current_round = 1;
    state.phase = Phase::Propose;
    state.status = Status::Starting;
    state.active_agent = Agent::Implementer;
    successor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{fixed_now, loop_state};

    #[test]
    fn table_matches_documented_routes() {
        let cases = [
            (Phase::Propose, Status::Starting, Phase::Propose, Agent::Implementer),
            (Phase::Propose, Status::Proposed, Phase::Review, Agent::Reviewer),
            (Phase::Review, Status::Approved, Phase::Execute, Agent::Implementer),
            (Phase::Review, Status::Reviewed, Phase::Review, Agent::Implementer),
            (Phase::Review, Status::NotApproved, Phase::Review, Agent::Implementer),
            (Phase::Execute, Status::Executed, Phase::Verify, Agent::Reviewer),
            (Phase::Verify, Status::Reviewed, Phase::Verify, Agent::Implementer),
            (Phase::Verify, Status::NotApproved, Phase::Verify, Agent::Implementer),
        ];
        for (phase, status, next_phase, next_agent) in cases {
            match transition(phase, status) {
                Some(Target::Run { phase, agent, .. }) => {
                    assert_eq!((phase, agent), (next_phase, next_agent));
                }
                other => panic!("unexpected route for {phase}/{status}: {other:?}"),
            }
        }
        assert_eq!(
            transition(Phase::Verify, Status::VerifiedClean),
            Some(Target::Advance)
        );
    }

    #[test]
    fn unlisted_pairs_have_no_entry() {
        assert_eq!(transition(Phase::Propose, Status::VerifiedClean), None);
        assert_eq!(transition(Phase::Execute, Status::Approved), None);
        assert_eq!(transition(Phase::Verify, Status::Executed), None);
        assert_eq!(transition(Phase::Review, Status::Proposed), None);
    }

    #[test]
    fn apply_is_deterministic_for_every_entry() {
        for phase in Phase::ALL {
            for status in Status::ALL {
                let state = loop_state("4", phase, Status::Starting, 2);
                let first = apply_completion(&state, status, fixed_now());
                let second = apply_completion(&state, status, fixed_now());
                assert_eq!(first, second, "{phase}/{status}");
                assert_eq!(first.is_ok(), transition(phase, status).is_some());
            }
        }
    }

    #[test]
    fn correction_increments_round() {
        let state = loop_state("3", Phase::Review, Status::Proposed, 1);
        let applied = apply_completion(&state, Status::NotApproved, fixed_now()).expect("apply");
        assert_eq!(applied.state.phase, Phase::Review);
        assert_eq!(applied.state.status, Status::NotApproved);
        assert_eq!(applied.state.current_round, 2);
        assert_eq!(applied.state.active_agent, Agent::Implementer);
    }

    #[test]
    fn approval_keeps_round() {
        let state = loop_state("3", Phase::Review, Status::Reviewed, 3);
        let applied = apply_completion(&state, Status::Approved, fixed_now()).expect("apply");
        assert_eq!(applied.state.phase, Phase::Execute);
        assert_eq!(applied.state.current_round, 3);
    }

    #[test]
    fn verified_clean_advances_step() {
        let mut state = loop_state("7", Phase::Verify, Status::Executed, 2);
        state.steps_complete = vec![crate::test_support::step("6")];
        let applied = apply_completion(&state, Status::VerifiedClean, fixed_now()).expect("apply");

        assert_eq!(applied.target, Target::Advance);
        assert_eq!(applied.state.current_step.as_str(), "8");
        assert_eq!(applied.state.phase, Phase::Propose);
        assert_eq!(applied.state.status, Status::Starting);
        assert_eq!(applied.state.current_round, 1);
        let complete: Vec<&str> = applied
            .state
            .steps_complete
            .iter()
            .map(|s| s.as_str())
            .collect();
        assert_eq!(complete, vec!["6", "7"]);
        assert!(matches!(applied.successor, Some(Successor::Certain(_))));
    }

    #[test]
    fn resume_from_review_approved_moves_to_execute() {
        let state = loop_state("5", Phase::Review, Status::Approved, 2);
        let applied = apply_resume(&state, fixed_now()).expect("resume");
        assert_eq!(applied.state.phase, Phase::Execute);
        assert_eq!(applied.state.status, Status::Approved);
        assert_eq!(applied.state.active_agent, Agent::Implementer);
        assert_eq!(applied.state.current_round, 2);
        assert_eq!(
            applied.target,
            Target::Run {
                phase: Phase::Execute,
                agent: Agent::Implementer,
                tier: PromptTier::Execute
            }
        );
    }

    #[test]
    fn resume_reruns_resting_states() {
        for (phase, status, agent) in [
            (Phase::Review, Status::Proposed, Agent::Reviewer),
            (Phase::Execute, Status::Approved, Agent::Implementer),
            (Phase::Verify, Status::Executed, Agent::Reviewer),
        ] {
            match resume(phase, status) {
                Some(Target::Run {
                    phase: next,
                    agent: next_agent,
                    ..
                }) => {
                    assert_eq!(next, phase);
                    assert_eq!(next_agent, agent);
                }
                other => panic!("unexpected resume for {phase}/{status}: {other:?}"),
            }
        }
    }

    #[test]
    fn resume_rejects_impossible_pairs() {
        let state = loop_state("5", Phase::Propose, Status::VerifiedClean, 1);
        let err = apply_resume(&state, fixed_now()).expect_err("anomaly");
        assert_eq!(err.to_string(), "no transition for phase=propose status=verified-clean");
    }
}
