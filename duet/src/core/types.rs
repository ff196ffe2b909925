//! Shared deterministic types for the control core.
//!
//! These types define the closed vocabularies of the loop: phases, statuses,
//! agents, and prompt tiers. Serialized spellings are part of the on-disk
//! contract with workers and must remain stable.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::step_id::StepId;

/// One of the four stages a step passes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Propose,
    Review,
    Execute,
    Verify,
}

impl Phase {
    pub const ALL: [Phase; 4] = [Phase::Propose, Phase::Review, Phase::Execute, Phase::Verify];

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Propose => "propose",
            Phase::Review => "review",
            Phase::Execute => "execute",
            Phase::Verify => "verify",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|phase| phase.as_str() == raw)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker-declared status. Closed set; every value is routed by the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Starting,
    Proposed,
    Approved,
    Reviewed,
    NotApproved,
    Executed,
    VerifiedClean,
}

impl Status {
    pub const ALL: [Status; 7] = [
        Status::Starting,
        Status::Proposed,
        Status::Approved,
        Status::Reviewed,
        Status::NotApproved,
        Status::Executed,
        Status::VerifiedClean,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Starting => "starting",
            Status::Proposed => "proposed",
            Status::Approved => "approved",
            Status::Reviewed => "reviewed",
            Status::NotApproved => "not-approved",
            Status::Executed => "executed",
            Status::VerifiedClean => "verified-clean",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == raw)
    }

    /// Phases in which a worker may legally report this status.
    pub fn legal_phases(self) -> &'static [Phase] {
        match self {
            Status::Starting | Status::Proposed => &[Phase::Propose],
            Status::Approved => &[Phase::Review],
            Status::Reviewed | Status::NotApproved => &[Phase::Review, Phase::Verify],
            Status::Executed => &[Phase::Execute],
            Status::VerifiedClean => &[Phase::Verify],
        }
    }

    /// `reviewed` and `not-approved` both send work back for another round.
    pub fn is_correction(self) -> bool {
        matches!(self, Status::Reviewed | Status::NotApproved)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two external workers driven by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Agent {
    Implementer,
    Reviewer,
}

impl Agent {
    pub const ALL: [Agent; 2] = [Agent::Implementer, Agent::Reviewer];

    pub fn as_str(self) -> &'static str {
        match self {
            Agent::Implementer => "implementer",
            Agent::Reviewer => "reviewer",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|agent| agent.as_str() == raw)
    }
}

impl fmt::Display for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Routing hint a worker writes into its completion record.
///
/// Informational only: the transition table decides who runs next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NextAgent {
    Implementer,
    Reviewer,
    Orchestrator,
    Advance,
}

impl NextAgent {
    pub const ALL: [NextAgent; 4] = [
        NextAgent::Implementer,
        NextAgent::Reviewer,
        NextAgent::Orchestrator,
        NextAgent::Advance,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            NextAgent::Implementer => "implementer",
            NextAgent::Reviewer => "reviewer",
            NextAgent::Orchestrator => "orchestrator",
            NextAgent::Advance => "advance",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|agent| agent.as_str() == raw)
    }
}

impl From<Agent> for NextAgent {
    fn from(agent: Agent) -> Self {
        match agent {
            Agent::Implementer => NextAgent::Implementer,
            Agent::Reviewer => NextAgent::Reviewer,
        }
    }
}

/// Selects which prompt the triggered worker receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptTier {
    Propose,
    Review,
    Revise,
    Execute,
    Verify,
    Fix,
}

impl PromptTier {
    pub const ALL: [PromptTier; 6] = [
        PromptTier::Propose,
        PromptTier::Review,
        PromptTier::Revise,
        PromptTier::Execute,
        PromptTier::Verify,
        PromptTier::Fix,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PromptTier::Propose => "propose",
            PromptTier::Review => "review",
            PromptTier::Revise => "revise",
            PromptTier::Execute => "execute",
            PromptTier::Verify => "verify",
            PromptTier::Fix => "fix",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tier| tier.as_str() == raw)
    }

    /// Prompt template file name under `.duet/prompts/`.
    pub fn file_name(self) -> String {
        format!("{}.md", self.as_str())
    }
}

impl fmt::Display for PromptTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conditions the control core refuses to resolve on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EscalationKind {
    /// `(phase, status)` has no table entry.
    UnknownTransition,
    /// Too many consecutive rejected records for one step/phase.
    RepeatedRejection,
    /// Lock aged past the threshold with no liveness record.
    StaleLockUnknownOwner,
    /// State changed outside the controller's write path.
    UnauthorizedMutation,
    /// Worker died without output again after the one automatic recovery.
    RepeatedCrash,
    /// Next step id came from the composite-id heuristic.
    AmbiguousSuccessor,
}

impl EscalationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EscalationKind::UnknownTransition => "UnknownTransition",
            EscalationKind::RepeatedRejection => "RepeatedRejection",
            EscalationKind::StaleLockUnknownOwner => "StaleLockUnknownOwner",
            EscalationKind::UnauthorizedMutation => "UnauthorizedMutation",
            EscalationKind::RepeatedCrash => "RepeatedCrash",
            EscalationKind::AmbiguousSuccessor => "AmbiguousSuccessor",
        }
    }

    /// Whether the loop stops triggering workers until a manual correction.
    pub fn holds_loop(self) -> bool {
        !matches!(self, EscalationKind::StaleLockUnknownOwner)
    }
}

impl fmt::Display for EscalationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted loop state (`.duet/state/loop_state.json`).
///
/// Only the controller and the manual correction path write this record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoopState {
    pub current_step: StepId,
    pub phase: Phase,
    pub status: Status,
    /// Correction cycles within the current step (1-indexed).
    pub current_round: u32,
    pub active_agent: Agent,
    pub steps_complete: Vec<StepId>,
    pub last_updated: DateTime<Utc>,
    /// Audit trail of the most recent out-of-band correction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub injection_note: Option<String>,
}

impl LoopState {
    /// Fresh state for the first step of a loop.
    pub fn initial(step: StepId, now: DateTime<Utc>) -> Self {
        Self {
            current_step: step,
            phase: Phase::Propose,
            status: Status::Starting,
            current_round: 1,
            active_agent: Agent::Implementer,
            steps_complete: Vec::new(),
            last_updated: now,
            injection_note: None,
        }
    }

    pub fn snapshot(&self) -> PhaseSnapshot {
        PhaseSnapshot {
            phase: self.phase,
            status: self.status,
            round: self.current_round,
        }
    }
}

/// `(phase, status, round)` triple used for traceability in logs and history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseSnapshot {
    pub phase: Phase,
    pub status: Status,
    pub round: u32,
}

impl fmt::Display for PhaseSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} r{}", self.phase, self.status, self.round)
    }
}

/// A completion record that passed every validation check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRecord {
    pub agent: String,
    pub step: StepId,
    pub status: Status,
    pub next_agent: NextAgent,
    pub timestamp: DateTime<Utc>,
}
