//! Worker launch, mutual exclusion, and liveness.
//!
//! [`ProcessSupervisor::trigger`] takes the lock, renders the prompt, and
//! starts a detached watchdog (`duet watch`) that owns the worker's native
//! process handle and enforces the phase timeout. The controller returns
//! immediately; later invocations observe the outcome through the lock, the
//! liveness record, and the completion record.
//!
//! [`Launcher`] and [`LivenessProbe`] are seams so tests never spawn real
//! processes.

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::process::{Command, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tracing::{debug, info, instrument, warn};

use crate::core::step_id::StepId;
use crate::core::types::{Agent, Phase, PromptTier};
use crate::io::layout::DuetPaths;
use crate::io::lock::{LockFiles, LockMarker};
use crate::io::prompt::{PromptInputs, write_prompt};

/// Everything the watchdog needs to run one worker attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerJob {
    pub step: StepId,
    pub phase: Phase,
    pub round: u32,
    pub agent: Agent,
    pub tier: PromptTier,
    pub timeout: Duration,
    pub owner_mandate: bool,
}

impl WorkerJob {
    /// Arguments for the hidden `duet watch` subcommand.
    pub fn watch_args(&self) -> Vec<String> {
        let mut args = vec![
            "--step".to_string(),
            self.step.to_string(),
            "--phase".to_string(),
            self.phase.to_string(),
            "--round".to_string(),
            self.round.to_string(),
            "--agent".to_string(),
            self.agent.to_string(),
            "--tier".to_string(),
            self.tier.to_string(),
            "--timeout-secs".to_string(),
            self.timeout.as_secs().to_string(),
        ];
        if self.owner_mandate {
            args.push("--owner-mandate".to_string());
        }
        args
    }

    /// Environment handed to the worker process.
    pub fn worker_env(&self, paths: &DuetPaths) -> Vec<(&'static str, OsString)> {
        vec![
            ("DUET_ROOT", paths.root.clone().into_os_string()),
            ("DUET_STEP", self.step.as_str().into()),
            ("DUET_PHASE", self.phase.as_str().into()),
            ("DUET_ROUND", self.round.to_string().into()),
            ("DUET_AGENT", self.agent.as_str().into()),
            ("DUET_PROMPT_TIER", self.tier.as_str().into()),
            (
                "DUET_PROMPT_PATH",
                paths.rendered_prompt_path().into_os_string(),
            ),
            ("DUET_FLAG_PATH", paths.flag_path.clone().into_os_string()),
            (
                "DUET_FLAG_SCHEMA",
                paths.flag_schema_path.clone().into_os_string(),
            ),
            (
                "DUET_OWNER_MANDATE",
                if self.owner_mandate { "1" } else { "0" }.into(),
            ),
        ]
    }
}

/// Starts a worker attempt detached from the caller. Returns the pid to track.
pub trait Launcher {
    fn launch(&self, paths: &DuetPaths, job: &WorkerJob) -> Result<u32>;
}

/// Re-invokes the current executable as `duet watch` in its own process group.
pub struct DetachedLauncher;

impl Launcher for DetachedLauncher {
    #[instrument(skip_all, fields(step = %job.step, phase = %job.phase, agent = %job.agent))]
    fn launch(&self, paths: &DuetPaths, job: &WorkerJob) -> Result<u32> {
        let exe = std::env::current_exe().context("locate duet executable")?;
        fs::create_dir_all(&paths.logs_dir)
            .with_context(|| format!("create {}", paths.logs_dir.display()))?;
        let watchdog_log = paths.logs_dir.join("watchdog.log");
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&watchdog_log)
            .with_context(|| format!("open {}", watchdog_log.display()))?;
        let log_err = log.try_clone().context("clone watchdog log handle")?;

        let mut cmd = Command::new(exe);
        cmd.arg("--root")
            .arg(&paths.root)
            .arg("watch")
            .args(job.watch_args())
            .current_dir(&paths.root)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err);
        // Detach from the controller's process group so the driver's
        // session ending does not take the worker down with it.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }

        let child = cmd.spawn().context("spawn watchdog")?;
        debug!(pid = child.id(), "watchdog spawned");
        Ok(child.id())
    }
}

/// Answers whether a recorded process id still exists.
pub trait LivenessProbe {
    fn is_alive(&self, pid: u32) -> bool;
}

/// `kill(pid, 0)`; a process we may not signal still exists.
pub struct SignalProbe;

impl LivenessProbe for SignalProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        match kill(Pid::from_raw(raw), None) {
            Ok(()) | Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }
}

/// What the lock and liveness record say about the current worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    /// No lock held.
    Idle,
    /// Lock held and the recorded process exists.
    Running { pid: u32 },
    /// Lock held, recorded process gone. Only meaningful when no flag exists.
    CrashedNoOutput { pid: u32 },
    /// Lock held with no liveness record, younger than the stale threshold.
    AwaitingPid { age: chrono::Duration },
    /// Lock held with no liveness record past the stale threshold.
    StaleUnknownOwner { age: chrono::Duration },
}

/// Result of [`ProcessSupervisor::trigger`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Triggered {
    Launched { pid: u32 },
    /// Another invocation holds the lock; nothing was started.
    LockHeld,
}

pub struct ProcessSupervisor<L, P> {
    paths: DuetPaths,
    locks: LockFiles,
    launcher: L,
    probe: P,
}

impl<L: Launcher, P: LivenessProbe> ProcessSupervisor<L, P> {
    pub fn new(paths: &DuetPaths, launcher: L, probe: P) -> Self {
        Self {
            paths: paths.clone(),
            locks: LockFiles::new(paths),
            launcher,
            probe,
        }
    }

    pub fn locks(&self) -> &LockFiles {
        &self.locks
    }

    /// Acquire the lock and start `job` detached.
    ///
    /// Any failure after the lock is taken releases it again.
    #[instrument(
        skip_all,
        fields(step = %job.step, phase = %job.phase, agent = %job.agent, tier = %job.tier)
    )]
    pub fn trigger(&self, job: &WorkerJob, now: DateTime<Utc>) -> Result<Triggered> {
        let marker = LockMarker {
            created_at: now,
            step: job.step.clone(),
            phase: job.phase,
            agent: job.agent,
        };
        if !self.locks.acquire(&marker)? {
            warn!("lock already held, not triggering");
            return Ok(Triggered::LockHeld);
        }
        match self.start(job) {
            Ok(pid) => {
                info!(pid, timeout_secs = job.timeout.as_secs(), "worker triggered");
                Ok(Triggered::Launched { pid })
            }
            Err(err) => {
                if let Err(release_err) = self.locks.release() {
                    warn!(err = %release_err, "failed to release lock after launch failure");
                }
                Err(err)
            }
        }
    }

    fn start(&self, job: &WorkerJob) -> Result<u32> {
        write_prompt(
            &self.paths,
            &PromptInputs {
                step: &job.step,
                phase: job.phase,
                round: job.round,
                agent: job.agent,
                tier: job.tier,
                owner_mandate: job.owner_mandate,
            },
        )?;
        let pid = self.launcher.launch(&self.paths, job)?;
        self.locks.record_pid(pid)?;
        Ok(pid)
    }

    /// Classify the current lock. Does not modify anything on disk.
    pub fn poll_liveness(
        &self,
        now: DateTime<Utc>,
        stale_after: chrono::Duration,
    ) -> Result<Liveness> {
        let Some(held) = self.locks.read()? else {
            return Ok(Liveness::Idle);
        };
        let liveness = match held.pid {
            Some(pid) if self.probe.is_alive(pid) => Liveness::Running { pid },
            Some(pid) => Liveness::CrashedNoOutput { pid },
            None => {
                let age = held.age(now);
                if age >= stale_after {
                    Liveness::StaleUnknownOwner { age }
                } else {
                    Liveness::AwaitingPid { age }
                }
            }
        };
        debug!(?liveness, "liveness polled");
        Ok(liveness)
    }

    /// Clear the lock and liveness record.
    pub fn release(&self) -> Result<()> {
        self.locks.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::prompt::PLACEHOLDER_TEMPLATE;
    use crate::test_support::{FakeProbe, ScriptedLauncher, fixed_now, step};

    fn job() -> WorkerJob {
        WorkerJob {
            step: step("3"),
            phase: Phase::Review,
            round: 2,
            agent: Agent::Reviewer,
            tier: PromptTier::Review,
            timeout: Duration::from_secs(1200),
            owner_mandate: false,
        }
    }

    fn workspace() -> (tempfile::TempDir, DuetPaths) {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = DuetPaths::new(temp.path());
        fs::create_dir_all(&paths.prompts_dir).expect("mkdir");
        for tier in PromptTier::ALL {
            fs::write(paths.prompt_path(tier), PLACEHOLDER_TEMPLATE).expect("write");
        }
        (temp, paths)
    }

    #[test]
    fn trigger_takes_lock_and_records_pid() {
        let (_temp, paths) = workspace();
        let launcher = ScriptedLauncher::default();
        let probe = FakeProbe::default();
        let supervisor = ProcessSupervisor::new(&paths, launcher.clone(), probe.clone());

        let outcome = supervisor.trigger(&job(), fixed_now()).expect("trigger");
        let Triggered::Launched { pid } = outcome else {
            panic!("expected launch, got {outcome:?}");
        };
        assert_eq!(launcher.jobs(), vec![job()]);
        assert!(paths.rendered_prompt_path().exists());

        probe.set_alive(pid, true);
        assert_eq!(
            supervisor
                .poll_liveness(fixed_now(), chrono::Duration::minutes(45))
                .expect("poll"),
            Liveness::Running { pid }
        );
        assert_eq!(
            supervisor.trigger(&job(), fixed_now()).expect("second"),
            Triggered::LockHeld
        );
        assert_eq!(launcher.jobs().len(), 1);

        probe.set_alive(pid, false);
        assert_eq!(
            supervisor
                .poll_liveness(fixed_now(), chrono::Duration::minutes(45))
                .expect("poll"),
            Liveness::CrashedNoOutput { pid }
        );
    }

    #[test]
    fn launch_failure_releases_lock() {
        let (_temp, paths) = workspace();
        let launcher = ScriptedLauncher::failing();
        let supervisor = ProcessSupervisor::new(&paths, launcher, FakeProbe::default());

        assert!(supervisor.trigger(&job(), fixed_now()).is_err());
        assert!(!paths.lock_path.exists());
        assert!(!paths.pid_path.exists());
    }

    #[test]
    fn lock_without_pid_ages_into_stale() {
        let (_temp, paths) = workspace();
        let supervisor =
            ProcessSupervisor::new(&paths, ScriptedLauncher::default(), FakeProbe::default());
        let created = fixed_now() - chrono::Duration::minutes(50);
        supervisor
            .locks()
            .acquire(&LockMarker {
                created_at: created,
                step: step("3"),
                phase: Phase::Review,
                agent: Agent::Reviewer,
            })
            .expect("acquire");

        let stale = chrono::Duration::minutes(45);
        assert_eq!(
            supervisor
                .poll_liveness(created + chrono::Duration::minutes(10), stale)
                .expect("poll"),
            Liveness::AwaitingPid {
                age: chrono::Duration::minutes(10)
            }
        );
        assert_eq!(
            supervisor.poll_liveness(fixed_now(), stale).expect("poll"),
            Liveness::StaleUnknownOwner {
                age: chrono::Duration::minutes(50)
            }
        );
    }

    #[test]
    fn worker_env_marks_mandated_steps() {
        let paths = DuetPaths::new("/work");
        let mut mandated = job();
        mandated.owner_mandate = true;
        let env = mandated.worker_env(&paths);
        let lookup = |key: &str| {
            env.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| v.to_string_lossy().into_owned())
        };
        assert_eq!(lookup("DUET_OWNER_MANDATE").as_deref(), Some("1"));
        assert_eq!(lookup("DUET_PHASE").as_deref(), Some("review"));
        assert_eq!(lookup("DUET_FLAG_PATH").as_deref(), Some("/work/.duet/flag.json"));
        assert!(mandated.watch_args().contains(&"--owner-mandate".to_string()));
    }

    #[test]
    fn signal_probe_sees_own_process() {
        assert!(SignalProbe.is_alive(std::process::id()));
        assert!(!SignalProbe.is_alive(u32::MAX));
    }
}
