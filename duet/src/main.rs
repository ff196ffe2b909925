//! Command-line entry point for the duet control loop.
//!
//! The external driver runs `duet tick` on a fixed cadence. Everything else
//! is for humans: scaffolding, inspection, validation, and audited repair.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use duet::core::step_id::StepId;
use duet::core::types::{Agent, Phase, PromptTier, Status};
use duet::correct::{CorrectOptions, run_correct};
use duet::exit_codes;
use duet::io::config::load_config;
use duet::io::escalation::Escalator;
use duet::io::init::{InitOptions, init_duet};
use duet::io::layout::DuetPaths;
use duet::io::state_store::Overrides;
use duet::io::supervisor::{DetachedLauncher, ProcessSupervisor, SignalProbe, WorkerJob};
use duet::logging::Sink;
use duet::status::collect_status;
use duet::tick::Controller;
use duet::validate::{self_check, validate_flag_file};
use duet::watch::run_watch;

#[derive(Parser)]
#[command(
    name = "duet",
    version,
    about = "Deterministic control loop for an implementer/reviewer worker pair"
)]
struct Cli {
    /// Project root containing `.duet/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create `.duet/` with a fresh loop state.
    Init {
        /// First step id.
        #[arg(long, default_value = "1", value_parser = parse_step)]
        step: StepId,
        /// Reset controller-owned files if `.duet/` exists.
        #[arg(short, long)]
        force: bool,
    },
    /// Run one controller invocation.
    Tick,
    /// Print state, lock, liveness, and hold.
    Status,
    /// Check a completion record against the expected step.
    ValidateFlag {
        path: PathBuf,
        #[arg(long, value_parser = parse_step)]
        step: StepId,
    },
    /// Audited manual correction of the loop state. Releases any hold.
    Correct {
        /// Justification, recorded into `injectionNote`.
        #[arg(long)]
        reason: String,
        #[arg(long, value_parser = parse_step)]
        step: Option<StepId>,
        #[arg(long, value_parser = parse_phase)]
        phase: Option<Phase>,
        #[arg(long, value_parser = parse_status)]
        status: Option<Status>,
        #[arg(long)]
        round: Option<u32>,
        /// Remove the lock and liveness record.
        #[arg(long)]
        clear_lock: bool,
        /// Remove a pending completion record.
        #[arg(long)]
        clear_flag: bool,
    },
    /// Check the transition table against the flag schema.
    SelfCheck,
    /// Run one worker under its phase timeout (started by `tick`).
    #[command(hide = true)]
    Watch {
        #[arg(long, value_parser = parse_step)]
        step: StepId,
        #[arg(long, value_parser = parse_phase)]
        phase: Phase,
        #[arg(long)]
        round: u32,
        #[arg(long, value_parser = parse_agent)]
        agent: Agent,
        #[arg(long, value_parser = parse_tier)]
        tier: PromptTier,
        #[arg(long)]
        timeout_secs: u64,
        #[arg(long)]
        owner_mandate: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    let sink = match cli.command {
        Command::Watch { .. } => Sink::WatchdogLog,
        _ => Sink::Console,
    };
    duet::logging::init(sink);
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::INVALID
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    if let Command::Init { step, force } = &cli.command {
        let options = InitOptions {
            step: step.clone(),
            force: *force,
        };
        let paths = init_duet(&cli.root, &options, Utc::now())?;
        println!("initialized {}", paths.duet_dir.display());
        return Ok(exit_codes::OK);
    }

    let root = fs::canonicalize(&cli.root)
        .with_context(|| format!("resolve root {}", cli.root.display()))?;
    let paths = DuetPaths::new(root);

    match cli.command {
        Command::Init { .. } => Ok(exit_codes::OK),
        Command::Tick => cmd_tick(&paths),
        Command::Status => cmd_status(&paths),
        Command::ValidateFlag { path, step } => cmd_validate_flag(&paths, &path, &step),
        Command::Correct {
            reason,
            step,
            phase,
            status,
            round,
            clear_lock,
            clear_flag,
        } => {
            let options = CorrectOptions {
                reason,
                overrides: Overrides {
                    step,
                    phase,
                    status,
                    round,
                },
                clear_lock,
                clear_flag,
            };
            let report = run_correct(&paths, &options, Utc::now())?;
            println!("{}", report.correction.note);
            if let Some(hold) = report.released_hold {
                println!("released hold: {} ({})", hold.kind, hold.reason);
            }
            Ok(exit_codes::OK)
        }
        Command::SelfCheck => {
            self_check(&paths)?;
            println!("self-check ok");
            Ok(exit_codes::OK)
        }
        Command::Watch {
            step,
            phase,
            round,
            agent,
            tier,
            timeout_secs,
            owner_mandate,
        } => {
            let job = WorkerJob {
                step,
                phase,
                round,
                agent,
                tier,
                timeout: Duration::from_secs(timeout_secs),
                owner_mandate,
            };
            run_watch(&paths, &job)?;
            Ok(exit_codes::OK)
        }
    }
}

fn cmd_tick(paths: &DuetPaths) -> Result<i32> {
    let config = load_config(&paths.config_path)?;
    let escalator = Escalator::from_config(paths, &config);
    let controller = Controller::new(paths, config, DetachedLauncher, SignalProbe, escalator);
    let outcome = controller.tick(Utc::now())?;
    println!("{outcome}");
    Ok(outcome.exit_code())
}

fn cmd_status(paths: &DuetPaths) -> Result<i32> {
    let config = load_config(&paths.config_path)?;
    let supervisor = ProcessSupervisor::new(paths, DetachedLauncher, SignalProbe);
    let report = collect_status(paths, &config, &supervisor, Utc::now())?;
    println!("{report}");
    Ok(exit_codes::OK)
}

fn cmd_validate_flag(
    paths: &DuetPaths,
    path: &std::path::Path,
    step: &StepId,
) -> Result<i32> {
    let config = load_config(&paths.config_path)?;
    match validate_flag_file(path, step, Utc::now(), config.flag_max_age())? {
        Ok(record) => {
            println!(
                "valid: agent={} status={} nextAgent={}",
                record.agent,
                record.status,
                record.next_agent.as_str()
            );
            Ok(exit_codes::OK)
        }
        Err(rejection) => {
            println!("invalid: {rejection}");
            Ok(exit_codes::REJECTED)
        }
    }
}

fn parse_step(raw: &str) -> Result<StepId, String> {
    StepId::parse(raw)
}

fn parse_phase(raw: &str) -> Result<Phase, String> {
    Phase::parse(raw).ok_or_else(|| format!("unknown phase '{raw}'"))
}

fn parse_status(raw: &str) -> Result<Status, String> {
    Status::parse(raw).ok_or_else(|| format!("unknown status '{raw}'"))
}

fn parse_agent(raw: &str) -> Result<Agent, String> {
    Agent::parse(raw).ok_or_else(|| format!("unknown agent '{raw}'"))
}

fn parse_tier(raw: &str) -> Result<PromptTier, String> {
    PromptTier::parse(raw).ok_or_else(|| format!("unknown prompt tier '{raw}'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_defaults_to_step_one() {
        let cli = Cli::parse_from(["duet", "init"]);
        match cli.command {
            Command::Init { step, force } => {
                assert_eq!(step.as_str(), "1");
                assert!(!force);
            }
            _ => panic!("expected init"),
        }
    }

    #[test]
    fn parse_correct_overrides() {
        let cli = Cli::parse_from([
            "duet",
            "--root",
            "/tmp/project",
            "correct",
            "--reason",
            "restart verify",
            "--phase",
            "verify",
            "--status",
            "executed",
            "--clear-lock",
        ]);
        assert_eq!(cli.root, PathBuf::from("/tmp/project"));
        match cli.command {
            Command::Correct {
                reason,
                phase,
                status,
                clear_lock,
                clear_flag,
                ..
            } => {
                assert_eq!(reason, "restart verify");
                assert_eq!(phase, Some(Phase::Verify));
                assert_eq!(status, Some(Status::Executed));
                assert!(clear_lock);
                assert!(!clear_flag);
            }
            _ => panic!("expected correct"),
        }
    }

    #[test]
    fn watch_args_round_trip_through_the_parser() {
        let job = WorkerJob {
            step: StepId::parse("11b").expect("step"),
            phase: Phase::Verify,
            round: 3,
            agent: Agent::Reviewer,
            tier: PromptTier::Verify,
            timeout: Duration::from_secs(1800),
            owner_mandate: true,
        };
        let mut argv = vec!["duet".to_string(), "watch".to_string()];
        argv.extend(job.watch_args());
        let cli = Cli::parse_from(argv);
        match cli.command {
            Command::Watch {
                step,
                phase,
                round,
                agent,
                tier,
                timeout_secs,
                owner_mandate,
            } => {
                assert_eq!(step, job.step);
                assert_eq!(
                    (phase, round, agent, tier),
                    (Phase::Verify, 3, Agent::Reviewer, PromptTier::Verify)
                );
                assert_eq!(timeout_secs, 1800);
                assert!(owner_mandate);
            }
            _ => panic!("expected watch"),
        }
    }

    #[test]
    fn rejects_bad_step_ids() {
        assert!(Cli::try_parse_from(["duet", "init", "--step", "step-one"]).is_err());
    }
}
