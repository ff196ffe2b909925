//! Human-directed alerts.
//!
//! The escalator only reports. It never touches loop state and never picks a
//! transition; holding the loop is the controller's decision. Sinks are
//! pluggable and a failing sink is logged, never propagated.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};
use wait_timeout::ChildExt;

use crate::core::step_id::StepId;
use crate::core::types::{EscalationKind, LoopState, Phase, Status};
use crate::io::config::DuetConfig;
use crate::io::layout::DuetPaths;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Escalation {
    pub kind: EscalationKind,
    pub reason: String,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<StepId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<u32>,
}

impl Escalation {
    pub fn new(kind: EscalationKind, reason: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            at,
            step: None,
            phase: None,
            status: None,
            round: None,
        }
    }

    /// Attach the loop position the escalation refers to.
    pub fn with_state(mut self, state: &LoopState) -> Self {
        self.step = Some(state.current_step.clone());
        self.phase = Some(state.phase);
        self.status = Some(state.status);
        self.round = Some(state.current_round);
        self
    }
}

/// A notification channel for escalations.
pub trait EscalationSink {
    fn name(&self) -> &'static str;
    fn notify(&self, escalation: &Escalation) -> Result<()>;
}

/// Emits the escalation at `error` level.
pub struct LogSink;

impl EscalationSink for LogSink {
    fn name(&self) -> &'static str {
        "log"
    }

    fn notify(&self, escalation: &Escalation) -> Result<()> {
        error!(
            kind = %escalation.kind,
            step = escalation.step.as_ref().map(StepId::as_str),
            phase = escalation.phase.map(Phase::as_str),
            status = escalation.status.map(Status::as_str),
            round = escalation.round,
            reason = %escalation.reason,
            "escalation"
        );
        Ok(())
    }
}

/// Appends one JSON line per escalation.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl EscalationSink for FileSink {
    fn name(&self) -> &'static str {
        "file"
    }

    fn notify(&self, escalation: &Escalation) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create directory {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(escalation).context("serialize escalation")?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("append {}", self.path.display()))
    }
}

/// Runs an external command with the escalation JSON on stdin.
pub struct CommandSink {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandSink {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

impl EscalationSink for CommandSink {
    fn name(&self) -> &'static str {
        "command"
    }

    fn notify(&self, escalation: &Escalation) -> Result<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("notify command is empty"))?;
        let payload = serde_json::to_vec(escalation).context("serialize escalation")?;
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("spawn notify command {program}"))?;
        if let Some(mut stdin) = child.stdin.take()
            && let Err(err) = stdin.write_all(&payload)
        {
            warn!(err = %err, "notify command did not read its input");
        }
        match child.wait_timeout(self.timeout).context("wait for notify command")? {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(anyhow!("notify command exited with {:?}", status.code())),
            None => {
                child.kill().context("kill notify command")?;
                child.wait().context("reap notify command")?;
                Err(anyhow!(
                    "notify command timed out after {}s",
                    self.timeout.as_secs()
                ))
            }
        }
    }
}

/// Fans an escalation out to every configured sink.
pub struct Escalator {
    sinks: Vec<Box<dyn EscalationSink>>,
}

impl Escalator {
    pub fn new(sinks: Vec<Box<dyn EscalationSink>>) -> Self {
        Self { sinks }
    }

    /// Log sink, escalation file, and the notify command when one is configured.
    pub fn from_config(paths: &DuetPaths, config: &DuetConfig) -> Self {
        let mut sinks: Vec<Box<dyn EscalationSink>> = vec![
            Box::new(LogSink),
            Box::new(FileSink::new(paths.escalations_path.clone())),
        ];
        if !config.notify.command.is_empty() {
            sinks.push(Box::new(CommandSink::new(
                config.notify.command.clone(),
                Duration::from_secs(config.notify.timeout_secs),
            )));
        }
        Self::new(sinks)
    }

    /// Deliver to every sink. Never fails.
    pub fn raise(&self, escalation: &Escalation) {
        for sink in &self.sinks {
            match sink.notify(escalation) {
                Ok(()) => {
                    debug!(sink = sink.name(), kind = %escalation.kind, "escalation delivered");
                }
                Err(err) => {
                    warn!(sink = sink.name(), err = %format!("{err:#}"), "escalation sink failed");
                }
            }
        }
    }
}
