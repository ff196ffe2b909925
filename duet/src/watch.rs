//! The watchdog behind the hidden `duet watch` subcommand.
//!
//! Spawned detached by the launcher. Holds the worker's native process
//! handle, feeds it the rendered prompt, kills it when the phase budget runs
//! out, and exits. It never touches loop state: the next tick sees either a
//! completion record or a dead liveness record.

use std::fs;
use std::process::Command;

use anyhow::{Context, Result, anyhow};
use tracing::{info, instrument, warn};

use crate::io::config::load_config;
use crate::io::layout::DuetPaths;
use crate::io::process::{CommandOutcome, run_with_timeout};
use crate::io::supervisor::WorkerJob;

#[instrument(
    skip_all,
    fields(step = %job.step, phase = %job.phase, round = job.round, agent = %job.agent)
)]
pub fn run_watch(paths: &DuetPaths, job: &WorkerJob) -> Result<CommandOutcome> {
    let config = load_config(&paths.config_path)?;
    let command = config.workers.for_agent(job.agent);
    let (program, args) = command
        .split_first()
        .ok_or_else(|| anyhow!("workers.{} is empty", job.agent))?;
    let prompt_path = paths.rendered_prompt_path();
    let prompt = fs::read(&prompt_path)
        .with_context(|| format!("read rendered prompt {}", prompt_path.display()))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&paths.root)
        .envs(job.worker_env(paths));
    let log_path = paths.worker_log_path(&job.step, job.phase, job.round);
    info!(program = %program, log = %log_path.display(), "starting worker");

    let outcome = run_with_timeout(
        cmd,
        Some(&prompt),
        job.timeout,
        config.worker_output_limit_bytes,
        &log_path,
    )?;
    if outcome.timed_out {
        warn!(timeout_secs = job.timeout.as_secs(), "worker exceeded its phase budget");
    } else if !outcome.status.success() {
        warn!(exit_code = ?outcome.status.code(), "worker exited unsuccessfully");
    } else {
        info!("worker exited");
    }
    if !paths.flag_path.exists() {
        warn!("worker left no completion record");
    }
    Ok(outcome)
}
