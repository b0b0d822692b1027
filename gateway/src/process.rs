//! Process execution — subprocess runner with timeout and tracker recovery
//!
//! - `SystemRunner` spawns one child per call, captures both streams and
//!   kills the child when the timeout elapses
//! - `ProcessExecutor` wraps a runner with the bounded recovery loop for the
//!   "tracker already exists" failure left behind by an interrupted run

use async_trait::async_trait;
use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::pkg::command::recovery_command;
use crate::pkg::ManagerIdentity;

/// Environment applied to every child: no prompts, no telemetry, no ads
pub const NON_INTERACTIVE_ENV: &[(&str, &str)] = &[
    ("CI", "true"),
    ("npm_config_yes", "true"),
    ("npm_config_fund", "false"),
    ("npm_config_update_notifier", "false"),
    ("YARN_ENABLE_TELEMETRY", "0"),
    ("DISABLE_OPENCOLLECTIVE", "1"),
];

/// Captured result of running one argv
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionOutcome {
    /// -1 when the process could not be spawned, timed out or was signalled
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    /// Attempts made by the recovery loop (1 for a plain run)
    pub attempts: u32,
}

impl ExecutionOutcome {
    /// An outcome for a run that never produced an exit status
    pub fn failure(message: impl Into<String>, duration: Duration) -> Self {
        Self {
            exit_code: -1,
            stdout: String::new(),
            stderr: message.into(),
            duration_ms: duration.as_millis() as u64,
            attempts: 1,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn has_output(&self) -> bool {
        !self.stdout.trim().is_empty() || !self.stderr.trim().is_empty()
    }
}

/// Runs a single argv. Implementations never fail: spawn errors and
/// timeouts are reported as failed outcomes.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, argv: &[String], working_dir: &Path, timeout: Duration) -> ExecutionOutcome;
}

/// Runs commands as real OS subprocesses
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, argv: &[String], working_dir: &Path, timeout: Duration) -> ExecutionOutcome {
        let start = Instant::now();

        let Some((program, args)) = argv.split_first() else {
            return ExecutionOutcome::failure("Empty command line", start.elapsed());
        };

        debug!("Executing: {} in {}", argv.join(" "), working_dir.display());

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        for (key, value) in NON_INTERACTIVE_ENV {
            cmd.env(key, value);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                warn!("Failed to spawn {program}: {e}");
                return ExecutionOutcome::failure(
                    format!("Failed to execute {program}: {e}"),
                    start.elapsed(),
                );
            }
        };

        let stdout_buf = Captured::default();
        let stderr_buf = Captured::default();
        let mut readers = tokio::spawn({
            let (stdout, stderr) = (child.stdout.take(), child.stderr.take());
            let (out, err) = (stdout_buf.clone(), stderr_buf.clone());
            let program = program.clone();
            async move {
                let (out_res, err_res) = tokio::join!(drain(stdout, out), drain(stderr, err));
                for (stream, res) in [("stdout", out_res), ("stderr", err_res)] {
                    if let Err(e) = res {
                        warn!("Reading {program} {stream} failed, output may be truncated: {e}");
                    }
                }
            }
        });

        // One deadline covers the exit and draining both pipes
        let deadline = tokio::time::Instant::now() + timeout;

        let status = match tokio::time::timeout_at(deadline, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                readers.abort();
                return ExecutionOutcome::failure(
                    format!("Failed to wait for {program}: {e}"),
                    start.elapsed(),
                );
            }
            Err(_) => {
                warn!("{program} timed out after {:?}, killing it", timeout);
                if let Err(e) = child.kill().await {
                    warn!("Failed to kill timed out {program}: {e}");
                }
                readers.abort();
                return ExecutionOutcome::failure(
                    format!("{} timed out after {}ms", argv.join(" "), timeout.as_millis()),
                    start.elapsed(),
                );
            }
        };

        if tokio::time::timeout_at(deadline, &mut readers).await.is_err() {
            // A background process it started still holds the pipes
            warn!(
                "{program} exited but its output was still open after {:?}, keeping what was read",
                timeout
            );
            readers.abort();
        }

        ExecutionOutcome {
            exit_code: status.code().unwrap_or(-1),
            stdout: stdout_buf.take_string(),
            stderr: stderr_buf.take_string(),
            duration_ms: start.elapsed().as_millis() as u64,
            attempts: 1,
        }
    }
}

/// Output collected from a child pipe as it arrives
#[derive(Clone, Default)]
struct Captured(Arc<Mutex<Vec<u8>>>);

impl Captured {
    fn extend(&self, bytes: &[u8]) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).extend_from_slice(bytes);
    }

    fn take_string(&self) -> String {
        let bytes = std::mem::take(&mut *self.0.lock().unwrap_or_else(|e| e.into_inner()));
        String::from_utf8_lossy(&bytes).into_owned()
    }
}

/// Copy `pipe` into `sink` until EOF. Bytes read before an error are kept.
async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>, sink: Captured) -> std::io::Result<()> {
    let Some(mut pipe) = pipe else {
        return Ok(());
    };
    let mut chunk = [0u8; 8192];
    loop {
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        sink.extend(&chunk[..n]);
    }
}

/// Whether stderr carries the stale tracker signature, e.g.
/// `npm ERR! Tracker "idealTree" already exists`.
pub fn is_recoverable_failure(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("already exists") && (lower.contains("tracker") || lower.contains("idealtree"))
}

/// Retry bounds for `ProcessExecutor::execute_with_recovery`
#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    /// Per-attempt timeout
    pub timeout: Duration,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(1000),
            timeout: Duration::from_secs(120),
        }
    }
}

/// Runs package manager commands, recovering from stale tracker state
#[derive(Clone)]
pub struct ProcessExecutor {
    runner: Arc<dyn CommandRunner>,
    policy: RecoveryPolicy,
}

impl ProcessExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>, policy: RecoveryPolicy) -> Self {
        Self { runner, policy }
    }

    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    /// Run once, no recovery.
    pub async fn execute(&self, argv: &[String], working_dir: &Path, timeout: Duration) -> ExecutionOutcome {
        self.runner.run(argv, working_dir, timeout).await
    }

    /// Run with up to `max_attempts` sequential attempts.
    ///
    /// Only the tracker signature is retried; before each retry the
    /// manager's cache/store is cleared and the fixed backoff elapses.
    /// When attempts run out the last outcome is returned as is.
    pub async fn execute_with_recovery(&self, argv: &[String], working_dir: &Path) -> ExecutionOutcome {
        let max_attempts = self.policy.max_attempts.max(1);
        let manager = argv
            .first()
            .and_then(|program| Path::new(program).file_name())
            .and_then(|name| name.to_str())
            .and_then(ManagerIdentity::from_name);

        let mut attempt = 1;
        loop {
            let mut outcome = self.runner.run(argv, working_dir, self.policy.timeout).await;
            outcome.attempts = attempt;

            if outcome.success() || !is_recoverable_failure(&outcome.stderr) {
                return outcome;
            }

            let Some(manager) = manager else {
                return outcome;
            };

            if attempt >= max_attempts {
                warn!(
                    "{} still reports a stale tracker after {} attempts, giving up",
                    manager, attempt
                );
                return outcome;
            }

            warn!(
                "{} hit a stale tracker (attempt {}/{}), clearing local state",
                manager, attempt, max_attempts
            );
            self.clear_state(manager, working_dir).await;
            tokio::time::sleep(self.policy.backoff).await;
            attempt += 1;
        }
    }

    /// Side effect only: the outcome is logged and dropped.
    async fn clear_state(&self, manager: ManagerIdentity, working_dir: &Path) {
        let argv = recovery_command(manager);
        let outcome = self.runner.run(&argv, working_dir, self.policy.timeout).await;
        if outcome.success() {
            info!("Cleared {} state with `{}`", manager, argv.join(" "));
        } else {
            warn!(
                "`{}` failed with exit code {}: {}",
                argv.join(" "),
                outcome.exit_code,
                outcome.stderr.trim()
            );
        }
    }
}
