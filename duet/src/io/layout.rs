//! Canonical paths within `.duet/` for a project root.

use std::path::PathBuf;

use crate::core::step_id::StepId;
use crate::core::types::{Phase, PromptTier};

pub const LOOP_STATE_SCHEMA: &str = include_str!("../../schemas/loop_state.schema.json");
pub const FLAG_SCHEMA: &str = include_str!("../../schemas/flag.schema.json");

/// All canonical paths within `.duet/` for a project root.
#[derive(Debug, Clone)]
pub struct DuetPaths {
    pub root: PathBuf,
    pub duet_dir: PathBuf,
    pub state_dir: PathBuf,
    pub prompts_dir: PathBuf,
    pub context_dir: PathBuf,
    pub logs_dir: PathBuf,
    pub quarantine_dir: PathBuf,
    pub gitignore_path: PathBuf,
    pub config_path: PathBuf,
    pub mandate_path: PathBuf,
    pub state_path: PathBuf,
    pub state_schema_path: PathBuf,
    pub flag_schema_path: PathBuf,
    pub seal_path: PathBuf,
    pub ledger_path: PathBuf,
    pub lock_path: PathBuf,
    pub pid_path: PathBuf,
    pub flag_path: PathBuf,
    pub history_path: PathBuf,
    pub escalations_path: PathBuf,
}

impl DuetPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let duet_dir = root.join(".duet");
        let state_dir = duet_dir.join("state");
        Self {
            root: root.clone(),
            duet_dir: duet_dir.clone(),
            state_dir: state_dir.clone(),
            prompts_dir: duet_dir.join("prompts"),
            context_dir: duet_dir.join("context"),
            logs_dir: duet_dir.join("logs"),
            quarantine_dir: duet_dir.join("quarantine"),
            gitignore_path: duet_dir.join(".gitignore"),
            config_path: duet_dir.join("config.toml"),
            mandate_path: duet_dir.join("owner_mandate.json"),
            state_path: state_dir.join("loop_state.json"),
            state_schema_path: state_dir.join("loop_state.schema.json"),
            flag_schema_path: state_dir.join("flag.schema.json"),
            seal_path: state_dir.join("seal.json"),
            ledger_path: state_dir.join("ledger.json"),
            lock_path: state_dir.join("lock.json"),
            pid_path: state_dir.join("worker.pid"),
            flag_path: duet_dir.join("flag.json"),
            history_path: duet_dir.join("history.jsonl"),
            escalations_path: duet_dir.join("escalations.jsonl"),
        }
    }

    /// Prompt template for a tier (`.duet/prompts/<tier>.md`).
    pub fn prompt_path(&self, tier: PromptTier) -> PathBuf {
        self.prompts_dir.join(tier.file_name())
    }

    /// Rendered prompt handed to the currently triggered worker.
    pub fn rendered_prompt_path(&self) -> PathBuf {
        self.context_dir.join("prompt.md")
    }

    /// Worker output log for one phase attempt.
    pub fn worker_log_path(&self, step: &StepId, phase: Phase, round: u32) -> PathBuf {
        self.logs_dir.join(format!("{step}-{phase}-r{round}.log"))
    }
}
