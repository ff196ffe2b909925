//! Loop configuration stored under `.duet/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::{Agent, Phase};

/// Loop configuration (TOML).
///
/// This file is intended to be edited by humans. Missing fields default to
/// the values the control loop was designed around.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DuetConfig {
    /// Completion records older than this are rejected as stale.
    pub flag_max_age_secs: u64,

    /// A lock with no liveness record is treated as stale after this long.
    pub stale_lock_secs: u64,

    /// Consecutive rejected records for one step/phase before escalating.
    pub rejection_limit: u32,

    /// Truncate worker stdout/stderr logs beyond this many bytes.
    pub worker_output_limit_bytes: usize,

    pub timeouts: PhaseTimeouts,
    pub workers: WorkerCommands,
    pub notify: NotifyConfig,
}

/// Hard wall-clock budget per phase, enforced by the watchdog.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PhaseTimeouts {
    pub propose_secs: u64,
    pub review_secs: u64,
    pub execute_secs: u64,
    pub verify_secs: u64,
}

/// Command lines used to start each worker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerCommands {
    pub implementer: Vec<String>,
    pub reviewer: Vec<String>,
}

/// Optional external escalation command (receives the escalation JSON on stdin).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct NotifyConfig {
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for DuetConfig {
    fn default() -> Self {
        Self {
            flag_max_age_secs: 30 * 60,
            stale_lock_secs: 45 * 60,
            rejection_limit: 3,
            worker_output_limit_bytes: 1_000_000,
            timeouts: PhaseTimeouts::default(),
            workers: WorkerCommands::default(),
            notify: NotifyConfig::default(),
        }
    }
}

impl Default for PhaseTimeouts {
    fn default() -> Self {
        Self {
            propose_secs: 30 * 60,
            review_secs: 20 * 60,
            execute_secs: 60 * 60,
            verify_secs: 30 * 60,
        }
    }
}

impl Default for WorkerCommands {
    fn default() -> Self {
        Self {
            implementer: vec!["claude".to_string(), "-p".to_string()],
            reviewer: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
        }
    }
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 30,
        }
    }
}

impl PhaseTimeouts {
    pub fn for_phase(&self, phase: Phase) -> Duration {
        let secs = match phase {
            Phase::Propose => self.propose_secs,
            Phase::Review => self.review_secs,
            Phase::Execute => self.execute_secs,
            Phase::Verify => self.verify_secs,
        };
        Duration::from_secs(secs)
    }
}

impl WorkerCommands {
    pub fn for_agent(&self, agent: Agent) -> &[String] {
        match agent {
            Agent::Implementer => &self.implementer,
            Agent::Reviewer => &self.reviewer,
        }
    }
}

impl DuetConfig {
    pub fn validate(&self) -> Result<()> {
        if self.flag_max_age_secs == 0 {
            return Err(anyhow!("flag_max_age_secs must be > 0"));
        }
        if self.stale_lock_secs == 0 {
            return Err(anyhow!("stale_lock_secs must be > 0"));
        }
        if self.rejection_limit == 0 {
            return Err(anyhow!("rejection_limit must be >= 1"));
        }
        if self.worker_output_limit_bytes == 0 {
            return Err(anyhow!("worker_output_limit_bytes must be > 0"));
        }
        for phase in Phase::ALL {
            if self.timeouts.for_phase(phase).is_zero() {
                return Err(anyhow!("timeouts.{phase}_secs must be > 0"));
            }
        }
        for agent in Agent::ALL {
            let command = self.workers.for_agent(agent);
            if command.is_empty() || command[0].trim().is_empty() {
                return Err(anyhow!("workers.{agent} must be a non-empty array"));
            }
        }
        if !self.notify.command.is_empty() && self.notify.timeout_secs == 0 {
            return Err(anyhow!("notify.timeout_secs must be > 0"));
        }
        Ok(())
    }

    pub fn flag_max_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.flag_max_age_secs).unwrap_or(i64::MAX))
    }

    pub fn stale_lock_after(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.stale_lock_secs).unwrap_or(i64::MAX))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `DuetConfig::default()`.
pub fn load_config(path: &Path) -> Result<DuetConfig> {
    if !path.exists() {
        let cfg = DuetConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: DuetConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &DuetConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    crate::io::atomic::write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, DuetConfig::default());
        assert_eq!(cfg.flag_max_age(), chrono::Duration::minutes(30));
        assert_eq!(cfg.stale_lock_after(), chrono::Duration::minutes(45));
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let cfg = DuetConfig {
            rejection_limit: 5,
            ..DuetConfig::default()
        };
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[timeouts]\nexecute_secs = 90\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.timeouts.for_phase(Phase::Execute), Duration::from_secs(90));
        assert_eq!(cfg.timeouts.for_phase(Phase::Review), Duration::from_secs(1200));
    }

    #[test]
    fn rejects_empty_worker_command() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(&path, "[workers]\nreviewer = []\n").expect("write");
        let err = load_config(&path).expect_err("invalid");
        assert!(err.to_string().contains("workers.reviewer"));
    }
}
