//! Test-only helpers: a fixed clock, state builders, and scripted process seams.

use std::collections::HashSet;
use std::fs;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::json;

use crate::core::step_id::StepId;
use crate::core::transitions::{Target, resume};
use crate::core::types::{Agent, EscalationKind, LoopState, Phase, Status};
use crate::io::config::DuetConfig;
use crate::io::escalation::{Escalation, EscalationSink, Escalator, FileSink};
use crate::io::init::{InitOptions, init_duet};
use crate::io::layout::DuetPaths;
use crate::io::ledger::{Ledger, load_ledger};
use crate::io::state_store::StateStore;
use crate::io::supervisor::{Launcher, LivenessProbe, ProcessSupervisor, WorkerJob};
use crate::tick::Controller;

/// Deterministic "now" shared by tests.
pub fn fixed_now() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-03-14T09:00:00Z")
        .expect("fixed timestamp")
        .with_timezone(&Utc)
}

pub fn step(raw: &str) -> StepId {
    StepId::parse(raw).expect("valid step id")
}

/// Loop state at `(phase, status)` with the agent the table assigns there.
pub fn loop_state(step_id: &str, phase: Phase, status: Status, round: u32) -> LoopState {
    let mut state = LoopState::initial(step(step_id), fixed_now());
    state.phase = phase;
    state.status = status;
    state.current_round = round;
    state.active_agent = match resume(phase, status) {
        Some(Target::Run { agent, .. }) => agent,
        Some(Target::Advance) | None => Agent::Implementer,
    };
    state
}

/// Serialized completion record.
pub fn flag_json(step: &str, status: &str, next_agent: &str, timestamp: DateTime<Utc>) -> String {
    json!({
        "agent": "test-worker",
        "step": step,
        "status": status,
        "nextAgent": next_agent,
        "timestamp": timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
    })
    .to_string()
}

/// Launcher that records jobs and hands out sequential pids.
#[derive(Clone)]
pub struct ScriptedLauncher {
    jobs: Arc<Mutex<Vec<WorkerJob>>>,
    next_pid: Arc<AtomicU32>,
    fail: bool,
}

impl Default for ScriptedLauncher {
    fn default() -> Self {
        Self {
            jobs: Arc::default(),
            next_pid: Arc::new(AtomicU32::new(1000)),
            fail: false,
        }
    }
}

impl ScriptedLauncher {
    /// Launcher whose every launch fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn jobs(&self) -> Vec<WorkerJob> {
        self.jobs.lock().expect("jobs lock").clone()
    }
}

impl Launcher for ScriptedLauncher {
    fn launch(&self, _paths: &DuetPaths, job: &WorkerJob) -> Result<u32> {
        if self.fail {
            return Err(anyhow!("scripted launch failure"));
        }
        self.jobs.lock().expect("jobs lock").push(job.clone());
        Ok(self.next_pid.fetch_add(1, Ordering::SeqCst))
    }
}

/// Liveness probe driven by the test. Pids are dead unless marked alive.
#[derive(Clone, Default)]
pub struct FakeProbe {
    alive: Arc<Mutex<HashSet<u32>>>,
    all_alive: bool,
}

impl FakeProbe {
    /// Probe that reports every pid as running.
    pub fn all_alive() -> Self {
        Self {
            all_alive: true,
            ..Self::default()
        }
    }

    pub fn set_alive(&self, pid: u32, alive: bool) {
        let mut set = self.alive.lock().expect("probe lock");
        if alive {
            set.insert(pid);
        } else {
            set.remove(&pid);
        }
    }
}

impl LivenessProbe for FakeProbe {
    fn is_alive(&self, pid: u32) -> bool {
        self.all_alive || self.alive.lock().expect("probe lock").contains(&pid)
    }
}

/// Escalation sink that keeps everything it receives.
#[derive(Clone, Default)]
pub struct RecordingSink {
    received: Arc<Mutex<Vec<Escalation>>>,
}

impl RecordingSink {
    pub fn escalations(&self) -> Vec<Escalation> {
        self.received.lock().expect("sink lock").clone()
    }

    pub fn kinds(&self) -> Vec<EscalationKind> {
        self.escalations().iter().map(|e| e.kind).collect()
    }
}

impl EscalationSink for RecordingSink {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn notify(&self, escalation: &Escalation) -> Result<()> {
        self.received
            .lock()
            .expect("sink lock")
            .push(escalation.clone());
        Ok(())
    }
}

/// An initialized `.duet/` in a temp dir plus the fakes wired to it.
pub struct TestWorkspace {
    _temp: tempfile::TempDir,
    pub paths: DuetPaths,
    pub config: DuetConfig,
    pub launcher: ScriptedLauncher,
    pub probe: FakeProbe,
    pub sink: RecordingSink,
}

impl TestWorkspace {
    /// Fresh loop at step 1, every worker pid reported dead.
    pub fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let options = InitOptions {
            step: step("1"),
            force: false,
        };
        let paths = init_duet(temp.path(), &options, fixed_now()).expect("init");
        Self {
            _temp: temp,
            paths,
            config: DuetConfig::default(),
            launcher: ScriptedLauncher::default(),
            probe: FakeProbe::default(),
            sink: RecordingSink::default(),
        }
    }

    /// Workspace whose persisted state is `state` (sealed, as a controller write).
    pub fn with_state(state: LoopState) -> Self {
        let ws = Self::new();
        StateStore::new(&ws.paths).create(&state).expect("write state");
        ws
    }

    pub fn with_probe(mut self, probe: FakeProbe) -> Self {
        self.probe = probe;
        self
    }

    pub fn controller(&self) -> Controller<ScriptedLauncher, FakeProbe> {
        let escalator = Escalator::new(vec![
            Box::new(self.sink.clone()),
            Box::new(FileSink::new(self.paths.escalations_path.clone())),
        ]);
        Controller::new(
            &self.paths,
            self.config.clone(),
            self.launcher.clone(),
            self.probe.clone(),
            escalator,
        )
    }

    pub fn supervisor(&self) -> ProcessSupervisor<ScriptedLauncher, FakeProbe> {
        ProcessSupervisor::new(&self.paths, self.launcher.clone(), self.probe.clone())
    }

    pub fn state(&self) -> LoopState {
        StateStore::new(&self.paths).load().expect("load state")
    }

    pub fn ledger(&self) -> Ledger {
        load_ledger(&self.paths.ledger_path).expect("load ledger")
    }

    pub fn write_flag(&self, contents: &str) {
        fs::write(&self.paths.flag_path, contents).expect("write flag");
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}
