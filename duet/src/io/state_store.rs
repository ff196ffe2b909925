//! Single-writer store for the persisted loop state.
//!
//! Every sanctioned write goes through [`StateStore::update`] or
//! [`StateStore::correct`]. Both write atomically and seal the written bytes
//! (SHA-256 digest plus the `injectionNote` at that moment) so a later load
//! can tell controller writes apart from out-of-band edits.

use std::fmt;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use jsonschema::validator_for;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use crate::core::step_id::StepId;
use crate::core::transitions::{Target, resume};
use crate::core::types::{LoopState, Phase, Status};
use crate::io::atomic::write_atomic;
use crate::io::layout::{DuetPaths, LOOP_STATE_SCHEMA};

/// The persisted state is missing or fails validation. Fatal; never auto-repaired.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateCorrupt {
    pub path: PathBuf,
    pub detail: String,
}

impl fmt::Display for StateCorrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "state corrupt at {}: {} (run `duet correct` to repair)",
            self.path.display(),
            self.detail
        )
    }
}

impl std::error::Error for StateCorrupt {}

/// How the on-disk state relates to the last sanctioned write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Integrity {
    /// Bytes match the seal.
    Sealed,
    /// No seal recorded yet (freshly scaffolded by hand).
    Unsealed,
    /// Bytes changed and the editor left a new `injectionNote`.
    AcknowledgedEdit { note: String },
    /// Bytes changed with no new `injectionNote`.
    Tampered,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct Seal {
    digest: String,
    injection_note: Option<String>,
}

/// Targeted overrides accepted by the manual correction path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Overrides {
    pub step: Option<StepId>,
    pub phase: Option<Phase>,
    pub status: Option<Status>,
    pub round: Option<u32>,
}

impl Overrides {
    fn is_complete(&self) -> bool {
        self.step.is_some() && self.phase.is_some() && self.status.is_some()
    }
}

/// Result of a manual correction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Correction {
    /// State before the correction; `None` when a corrupt record was rebuilt.
    pub before: Option<LoopState>,
    pub after: LoopState,
    pub note: String,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    state_path: PathBuf,
    seal_path: PathBuf,
}

impl StateStore {
    pub fn new(paths: &DuetPaths) -> Self {
        Self {
            state_path: paths.state_path.clone(),
            seal_path: paths.seal_path.clone(),
        }
    }

    /// Load and validate the state record.
    ///
    /// Fails with [`StateCorrupt`] if the record is missing or invalid.
    pub fn load(&self) -> Result<LoopState> {
        let (state, _) = self.read()?;
        Ok(state)
    }

    /// Load the state and compare it against the seal of the last sanctioned write.
    #[instrument(skip_all)]
    pub fn load_checked(&self) -> Result<(LoopState, Integrity)> {
        let (state, contents) = self.read()?;
        let digest = digest_hex(&contents);
        let integrity = match self.read_seal()? {
            None => Integrity::Unsealed,
            Some(seal) if seal.digest == digest => Integrity::Sealed,
            Some(seal) => match &state.injection_note {
                Some(note) if seal.injection_note.as_ref() != Some(note) => {
                    Integrity::AcknowledgedEdit { note: note.clone() }
                }
                _ => Integrity::Tampered,
            },
        };
        debug!(?integrity, "state integrity");
        Ok((state, integrity))
    }

    /// Write a brand-new state record (used by `duet init`).
    pub fn create(&self, state: &LoopState) -> Result<()> {
        self.write(state)
    }

    /// Re-seal the current on-disk bytes, accepting them as sanctioned.
    pub fn reseal(&self) -> Result<()> {
        let (state, contents) = self.read()?;
        self.write_seal(&contents, &state)
    }

    /// Atomic read-modify-write. Stamps `lastUpdated` and seals the result.
    ///
    /// The closure may fail, in which case nothing is written.
    #[instrument(skip_all)]
    pub fn update<T>(
        &self,
        now: DateTime<Utc>,
        mutate: impl FnOnce(&mut LoopState) -> Result<T>,
    ) -> Result<(LoopState, T)> {
        let (mut state, _) = self.read()?;
        let out = mutate(&mut state)?;
        state.last_updated = now;
        self.write(&state)?;
        Ok((state, out))
    }

    /// Audited out-of-band correction.
    ///
    /// `reason` is mandatory. The prior and new values are recorded into
    /// `injectionNote`. A corrupt record can only be rebuilt when the step,
    /// phase, and status are all supplied.
    #[instrument(skip_all, fields(reason))]
    pub fn correct(
        &self,
        now: DateTime<Utc>,
        reason: &str,
        overrides: &Overrides,
    ) -> Result<Correction> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(anyhow!("a non-empty reason is required for manual correction"));
        }

        let before = match self.read() {
            Ok((state, _)) => Some(state),
            Err(err) if err.downcast_ref::<StateCorrupt>().is_some() => {
                if !overrides.is_complete() {
                    return Err(err.context(
                        "state is corrupt; supply --step, --phase and --status to rebuild it",
                    ));
                }
                warn!(err = %err, "rebuilding corrupt state from overrides");
                None
            }
            Err(err) => return Err(err),
        };

        let mut after = match &before {
            Some(state) => state.clone(),
            None => self.salvage(overrides, now)?,
        };
        apply_overrides(&mut after, overrides);

        let changes = describe_changes(before.as_ref(), &after);
        let note = format!(
            "{} manual correction: {} [{}]",
            now.to_rfc3339_opts(SecondsFormat::Secs, true),
            reason,
            changes
        );
        after.injection_note = Some(note.clone());
        after.last_updated = now;
        self.write(&after)?;
        info!(note = %note, "state corrected");

        Ok(Correction {
            before,
            after,
            note,
        })
    }

    fn read(&self) -> Result<(LoopState, String)> {
        let corrupt = |detail: String| StateCorrupt {
            path: self.state_path.clone(),
            detail,
        };
        let contents = match fs::read_to_string(&self.state_path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(corrupt("state record is missing".to_string()).into());
            }
            Err(err) => {
                return Err(err).with_context(|| format!("read {}", self.state_path.display()));
            }
        };
        let value: Value = serde_json::from_str(&contents)
            .map_err(|err| corrupt(format!("invalid JSON: {err}")))?;
        let errors = schema_errors(&value)?;
        if !errors.is_empty() {
            return Err(corrupt(format!("schema validation failed: {}", errors.join("; "))).into());
        }
        let state: LoopState =
            serde_json::from_value(value).map_err(|err| corrupt(format!("deserialize: {err}")))?;
        Ok((state, contents))
    }

    fn write(&self, state: &LoopState) -> Result<()> {
        let value = serde_json::to_value(state).context("serialize loop state")?;
        let errors = schema_errors(&value)?;
        if !errors.is_empty() {
            return Err(anyhow!(
                "refusing to write invalid loop state: {}",
                errors.join("; ")
            ));
        }
        let mut buf = serde_json::to_string_pretty(&value).context("serialize loop state")?;
        buf.push('\n');
        debug!(
            path = %self.state_path.display(),
            step = %state.current_step,
            snapshot = %state.snapshot(),
            "writing loop state"
        );
        write_atomic(&self.state_path, &buf)?;
        self.write_seal(&buf, state)
    }

    fn read_seal(&self) -> Result<Option<Seal>> {
        if !self.seal_path.exists() {
            return Ok(None);
        }
        let contents = fs::read_to_string(&self.seal_path)
            .with_context(|| format!("read {}", self.seal_path.display()))?;
        match serde_json::from_str(&contents) {
            Ok(seal) => Ok(Some(seal)),
            Err(err) => {
                // An unreadable seal cannot vouch for the state.
                warn!(err = %err, "ignoring unreadable seal");
                Ok(Some(Seal {
                    digest: String::new(),
                    injection_note: None,
                }))
            }
        }
    }

    fn write_seal(&self, contents: &str, state: &LoopState) -> Result<()> {
        let seal = Seal {
            digest: digest_hex(contents),
            injection_note: state.injection_note.clone(),
        };
        let mut buf = serde_json::to_string_pretty(&seal).context("serialize seal")?;
        buf.push('\n');
        write_atomic(&self.seal_path, &buf)
    }

    /// Rebuild a state from a corrupt record, keeping `stepsComplete` if it is readable.
    fn salvage(&self, overrides: &Overrides, now: DateTime<Utc>) -> Result<LoopState> {
        let step = overrides
            .step
            .clone()
            .ok_or_else(|| anyhow!("rebuilding state requires --step"))?;
        let mut state = LoopState::initial(step, now);
        let raw = fs::read_to_string(&self.state_path).unwrap_or_default();
        if let Ok(value) = serde_json::from_str::<Value>(&raw)
            && let Some(items) = value.get("stepsComplete").and_then(Value::as_array)
        {
            state.steps_complete = items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|s| StepId::parse(s).ok())
                .collect();
        }
        Ok(state)
    }
}

fn apply_overrides(state: &mut LoopState, overrides: &Overrides) {
    if let Some(step) = &overrides.step
        && *step != state.current_step
    {
        state.current_step = step.clone();
        state.current_round = 1;
    }
    if let Some(phase) = overrides.phase {
        state.phase = phase;
    }
    if let Some(status) = overrides.status {
        state.status = status;
    }
    if let Some(round) = overrides.round {
        state.current_round = round.max(1);
    }
    if let Some(Target::Run { agent, .. }) = resume(state.phase, state.status) {
        state.active_agent = agent;
    }
}

fn describe_changes(before: Option<&LoopState>, after: &LoopState) -> String {
    let Some(before) = before else {
        return format!(
            "rebuilt: step={} phase={} status={} round={}",
            after.current_step, after.phase, after.status, after.current_round
        );
    };
    let mut changes = Vec::new();
    if before.current_step != after.current_step {
        changes.push(format!(
            "step {} -> {}",
            before.current_step, after.current_step
        ));
    }
    if before.phase != after.phase {
        changes.push(format!("phase {} -> {}", before.phase, after.phase));
    }
    if before.status != after.status {
        changes.push(format!("status {} -> {}", before.status, after.status));
    }
    if before.current_round != after.current_round {
        changes.push(format!(
            "round {} -> {}",
            before.current_round, after.current_round
        ));
    }
    if before.active_agent != after.active_agent {
        changes.push(format!(
            "agent {} -> {}",
            before.active_agent, after.active_agent
        ));
    }
    if changes.is_empty() {
        format!(
            "no field changes; step={} phase={} status={} round={}",
            after.current_step, after.phase, after.status, after.current_round
        )
    } else {
        changes.join(", ")
    }
}

fn schema_errors(instance: &Value) -> Result<Vec<String>> {
    let schema: Value = serde_json::from_str(LOOP_STATE_SCHEMA).context("parse state schema")?;
    let compiled = validator_for(&schema).map_err(|err| anyhow!("invalid schema: {}", err))?;
    Ok(compiled
        .iter_errors(instance)
        .map(|err| err.to_string())
        .collect())
}

fn digest_hex(contents: &str) -> String {
    hex::encode(Sha256::digest(contents.as_bytes()))
}
