//! Helpers for running the worker child process under a hard timeout.
//!
//! Used by the watchdog (`duet watch`), which is itself detached from the
//! controller. Output is streamed to a log file while the child runs so a
//! long-running worker never blocks on a full pipe.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Outcome of a supervised child process.
#[derive(Debug)]
pub struct CommandOutcome {
    pub status: ExitStatus,
    pub timed_out: bool,
    /// Bytes of output discarded after the log limit was reached.
    pub truncated: usize,
}

/// Run `cmd` with `stdin` piped in, killing it once `timeout` elapses.
///
/// stdout and stderr are both copied into `log_path`, bounded by `output_limit_bytes`.
#[instrument(
    skip_all,
    fields(timeout_secs = timeout.as_secs(), output_limit_bytes, log = %log_path.display())
)]
pub fn run_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    log_path: &Path,
) -> Result<CommandOutcome> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    // Own process group so a timeout also takes down anything the worker spawned.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    if let Some(parent) = log_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create log dir {}", parent.display()))?;
    }
    let log = File::create(log_path)
        .with_context(|| format!("create worker log {}", log_path.display()))?;
    let log = std::sync::Arc::new(std::sync::Mutex::new(LimitedLog {
        writer: BufWriter::new(log),
        remaining: output_limit_bytes,
        truncated: 0,
    }));

    debug!("spawning worker process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn worker");
            return Err(e).context("spawn worker");
        }
    };

    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            // Written off-thread: the timeout must hold even if the worker never reads.
            Some(thread::spawn(move || {
                if let Err(e) = child_stdin.write_all(&input) {
                    warn!(err = %e, "failed to write worker stdin");
                }
            }))
        }
        None => None,
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_log = log.clone();
    let stderr_log = log.clone();
    let stdout_handle = thread::spawn(move || copy_into_log(stdout, &stdout_log));
    let stderr_handle = thread::spawn(move || copy_into_log(stderr, &stderr_log));

    let mut timed_out = false;
    let status = match child.wait_timeout(timeout).context("wait for worker")? {
        Some(status) => {
            // Anything the worker left running would hold the output pipes open
            // and keep this watchdog alive past the phase budget.
            if kill_group(child.id()) {
                warn!("worker exited but left processes behind; killed its process group");
            }
            status
        }
        None => {
            warn!(timeout_secs = timeout.as_secs(), "worker timed out, killing");
            timed_out = true;
            kill_process_group(&mut child).context("kill worker")?;
            child.wait().context("wait worker after kill")?
        }
    };

    if let Some(handle) = stdin_handle
        && handle.join().is_err()
    {
        warn!("worker stdin writer panicked");
    }
    join_reader(stdout_handle).context("join stdout")?;
    join_reader(stderr_handle).context("join stderr")?;

    let truncated = {
        let mut guard = log
            .lock()
            .map_err(|_| anyhow!("worker log mutex poisoned"))?;
        if timed_out {
            let notice = format!("\n[worker killed after {}s timeout]\n", timeout.as_secs());
            guard.writer.write_all(notice.as_bytes()).ok();
        }
        if guard.truncated > 0 {
            let notice = format!("\n[worker output truncated {} bytes]\n", guard.truncated);
            guard.writer.write_all(notice.as_bytes()).ok();
        }
        guard.writer.flush().context("flush worker log")?;
        guard.truncated
    };

    if truncated > 0 {
        warn!(truncated, "worker output truncated");
    }
    debug!(exit_code = ?status.code(), timed_out, "worker finished");
    Ok(CommandOutcome {
        status,
        timed_out,
        truncated,
    })
}

fn kill_process_group(child: &mut Child) -> Result<()> {
    kill_group(child.id());
    child.kill().context("kill worker process")
}

/// SIGKILL the process group led by `pid`. Returns whether any member was left.
#[cfg(unix)]
fn kill_group(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let Ok(pgid) = i32::try_from(pid) else {
        return false;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) => true,
        Err(Errno::ESRCH) => false,
        Err(err) => {
            warn!(err = %err, "failed to kill worker process group");
            false
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pid: u32) -> bool {
    false
}

struct LimitedLog {
    writer: BufWriter<File>,
    remaining: usize,
    truncated: usize,
}

fn copy_into_log<R: Read>(
    mut reader: R,
    log: &std::sync::Mutex<LimitedLog>,
) -> Result<()> {
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let mut guard = log
            .lock()
            .map_err(|_| anyhow!("worker log mutex poisoned"))?;
        let keep = n.min(guard.remaining);
        if keep > 0 {
            guard
                .writer
                .write_all(&chunk[..keep])
                .context("write worker log")?;
            guard.writer.flush().context("flush worker log")?;
            guard.remaining -= keep;
        }
        guard.truncated += n - keep;
    }
    Ok(())
}

fn join_reader(handle: thread::JoinHandle<Result<()>>) -> Result<()> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Instant;

    use super::*;

    #[test]
    fn captures_output_into_log() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log_path = temp.path().join("logs/worker.log");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("cat; echo done >&2");

        let outcome = run_with_timeout(
            cmd,
            Some(b"hello prompt\n"),
            Duration::from_secs(10),
            10_000,
            &log_path,
        )
        .expect("run");
        assert!(outcome.status.success());
        assert!(!outcome.timed_out);

        let log = std::fs::read_to_string(&log_path).expect("read log");
        assert!(log.contains("hello prompt"));
        assert!(log.contains("done"));
    }

    #[test]
    fn kills_worker_after_timeout() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log_path = temp.path().join("worker.log");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 5");

        let outcome = run_with_timeout(cmd, None, Duration::from_millis(200), 1000, &log_path)
            .expect("run");
        assert!(outcome.timed_out);
        assert!(!outcome.status.success());
        let log = std::fs::read_to_string(&log_path).expect("read log");
        assert!(log.contains("timeout"));
    }

    #[test]
    fn background_children_do_not_outlive_the_worker() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log_path = temp.path().join("worker.log");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 30 & echo started; exit 0");

        let started = Instant::now();
        let outcome = run_with_timeout(cmd, None, Duration::from_secs(10), 1000, &log_path)
            .expect("run");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!outcome.timed_out);
        assert!(outcome.status.success());
        let log = std::fs::read_to_string(&log_path).expect("read log");
        assert!(log.contains("started"));
    }

    #[test]
    fn bounds_log_size() {
        let temp = tempfile::tempdir().expect("tempdir");
        let log_path = temp.path().join("worker.log");
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("printf '0123456789'");

        let outcome =
            run_with_timeout(cmd, None, Duration::from_secs(10), 4, &log_path).expect("run");
        assert_eq!(outcome.truncated, 6);
        let log = std::fs::read_to_string(&log_path).expect("read log");
        assert!(log.starts_with("0123"));
        assert!(log.contains("truncated 6 bytes"));
    }
}
