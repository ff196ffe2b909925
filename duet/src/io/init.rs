//! Scaffolding for `.duet/`.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::info;

use crate::core::step_id::StepId;
use crate::core::types::{LoopState, PromptTier};
use crate::io::atomic::remove_if_exists;
use crate::io::config::{DuetConfig, write_config};
use crate::io::layout::{DuetPaths, FLAG_SCHEMA, LOOP_STATE_SCHEMA};
use crate::io::ledger::{Ledger, write_ledger};
use crate::io::lock::LockFiles;
use crate::io::mandate::OwnerMandate;
use crate::io::prompt::PLACEHOLDER_TEMPLATE;
use crate::io::state_store::StateStore;

const DUET_GITIGNORE: &str = "state/lock.json\nstate/worker.pid\ncontext/\nlogs/\nflag.json\n";

#[derive(Debug, Clone)]
pub struct InitOptions {
    /// First step of the loop.
    pub step: StepId,
    /// Reset controller-owned files when `.duet/` already exists.
    pub force: bool,
}

/// Create `.duet/` in `root` with a fresh loop state at `options.step`.
///
/// With `force`, controller-owned files are reset; human-owned files
/// (config, mandate, prompts) are kept when present.
pub fn init_duet(root: &Path, options: &InitOptions, now: DateTime<Utc>) -> Result<DuetPaths> {
    let paths = DuetPaths::new(root);
    if paths.duet_dir.exists() && !paths.duet_dir.is_dir() {
        return Err(anyhow!("duet init: .duet exists but is not a directory"));
    }
    if paths.duet_dir.exists() && !options.force {
        return Err(anyhow!(
            "duet init: .duet already exists (use --force to reset)"
        ));
    }

    for dir in [
        &paths.duet_dir,
        &paths.state_dir,
        &paths.prompts_dir,
        &paths.context_dir,
        &paths.logs_dir,
        &paths.quarantine_dir,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }

    write_file(&paths.gitignore_path, DUET_GITIGNORE)?;
    write_file(&paths.state_schema_path, LOOP_STATE_SCHEMA)?;
    write_file(&paths.flag_schema_path, FLAG_SCHEMA)?;

    if !paths.config_path.exists() {
        write_config(&paths.config_path, &DuetConfig::default())?;
    }
    if !paths.mandate_path.exists() {
        let mut buf = serde_json::to_string_pretty(&OwnerMandate::default())
            .context("serialize owner mandate")?;
        buf.push('\n');
        write_file(&paths.mandate_path, &buf)?;
    }
    for tier in PromptTier::ALL {
        let path = paths.prompt_path(tier);
        if !path.exists() {
            write_file(&path, PLACEHOLDER_TEMPLATE)?;
        }
    }

    LockFiles::new(&paths).release()?;
    remove_if_exists(&paths.flag_path)?;
    write_ledger(&paths.ledger_path, &Ledger::default())?;
    StateStore::new(&paths).create(&LoopState::initial(options.step.clone(), now))?;

    info!(root = %root.display(), step = %options.step, "initialized .duet");
    Ok(paths)
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Phase, Status};
    use crate::io::config::load_config;
    use crate::io::state_store::Integrity;
    use crate::test_support::{fixed_now, step};

    fn options(force: bool) -> InitOptions {
        InitOptions {
            step: step("1"),
            force,
        }
    }

    #[test]
    fn scaffolds_sealed_initial_state() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_duet(temp.path(), &options(false), fixed_now()).expect("init");

        let (state, integrity) = StateStore::new(&paths).load_checked().expect("load");
        assert_eq!(integrity, Integrity::Sealed);
        assert_eq!(state.current_step, step("1"));
        assert_eq!((state.phase, state.status), (Phase::Propose, Status::Starting));
        assert_eq!(load_config(&paths.config_path).expect("config"), DuetConfig::default());
        for tier in PromptTier::ALL {
            assert!(paths.prompt_path(tier).exists(), "{tier} prompt");
        }
        assert!(paths.flag_schema_path.exists());
    }

    #[test]
    fn refuses_existing_dir_without_force() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_duet(temp.path(), &options(false), fixed_now()).expect("init");
        let err = init_duet(temp.path(), &options(false), fixed_now()).expect_err("exists");
        assert!(err.to_string().contains("--force"));
    }

    #[test]
    fn force_resets_state_but_keeps_human_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_duet(temp.path(), &options(false), fixed_now()).expect("init");
        fs::write(paths.prompt_path(PromptTier::Review), "custom review").expect("write");
        fs::write(&paths.flag_path, "{}").expect("write flag");

        let reset = InitOptions {
            step: step("12"),
            force: true,
        };
        init_duet(temp.path(), &reset, fixed_now()).expect("force");
        assert_eq!(
            fs::read_to_string(paths.prompt_path(PromptTier::Review)).expect("read"),
            "custom review"
        );
        assert!(!paths.flag_path.exists());
        let state = StateStore::new(&paths).load().expect("load");
        assert_eq!(state.current_step, step("12"));
    }
}
