/// Single supervised run: spawn the command, pump its output into the run log,
/// race natural exit against the timeout and the abort sentinel, and publish
/// the exit record.
use crate::config::{format_duration, TimingConfig};
use crate::kill_tree::{killer_for, ProcessTreeKiller};
use crate::log_writer::{LogError, LogWriter};
use crate::platform::OsFamily;
use crate::resource_usage::ResourceSampler;
use crate::status::{ExitRecord, LocalContext, StatusChannel, StatusError};
use crate::status_dir::{LockError, StatusDir};
use crate::watchdog::Watchdog;
use chrono::Utc;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// Immutable description of one run.
#[derive(Debug, Clone)]
pub struct RunRequest {
    command: Vec<String>,
    stderr_is_error: bool,
    timeout: Duration,
    record_resource_usage: bool,
    status_dir: StatusDir,
}

impl RunRequest {
    /// `command` is the executable followed by its arguments.
    pub fn new(command: Vec<String>, status_dir: StatusDir) -> Result<Self, SupervisorError> {
        if command.first().map_or(true, |c| c.trim().is_empty()) {
            return Err(SupervisorError::EmptyCommand);
        }
        Ok(Self {
            command,
            stderr_is_error: false,
            timeout: Duration::ZERO,
            record_resource_usage: false,
            status_dir,
        })
    }

    /// Treat any stderr output as a failure.
    pub fn stderr_is_error(mut self, yes: bool) -> Self {
        self.stderr_is_error = yes;
        self
    }

    /// Kill the command after `timeout`. Zero disables the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn record_resource_usage(mut self, yes: bool) -> Self {
        self.record_resource_usage = yes;
        self
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn status_dir(&self) -> &StatusDir {
        &self.status_dir
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Completed,
    TimedOut,
    Aborted,
    StartFailed,
}

/// Final result of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub termination: Termination,
    /// Real exit code, or -1 when none could be confirmed or a policy failed.
    pub exit_code: i32,
    pub error: Option<String>,
    pub timed_out: bool,
    pub aborted: bool,
    pub had_stderr_lines: bool,
    pub duration: Duration,
}

/// Outcome plus the status of the terminal record.
#[derive(Debug)]
pub struct RunReport {
    pub outcome: ExecutionOutcome,
    /// Set when the exit record could not be written. The outcome is unaffected.
    pub exit_record_error: Option<StatusError>,
}

/// Which side won the race.
#[derive(Debug)]
enum Finish {
    StartFailed(std::io::Error),
    Exited(Option<i32>),
    WaitFailed(std::io::Error),
    TimedOut,
    Aborted,
}

pub struct Supervisor {
    request: RunRequest,
    timing: TimingConfig,
    os: OsFamily,
    killer: Arc<dyn ProcessTreeKiller>,
}

impl Supervisor {
    pub fn new(request: RunRequest, timing: TimingConfig, os: OsFamily) -> Self {
        Self {
            request,
            timing,
            os,
            killer: killer_for(os),
        }
    }

    /// Replace the tree-kill strategy.
    pub fn with_killer(mut self, killer: Arc<dyn ProcessTreeKiller>) -> Self {
        self.killer = killer;
        self
    }

    /// Execute the run. Only setup failures (lock, stale-file cleanup, log
    /// creation) are returned as errors; everything after that ends in an
    /// [`ExecutionOutcome`].
    pub async fn run(&self) -> Result<RunReport, SupervisorError> {
        let dir = &self.request.status_dir;
        let _lock = dir.acquire_lock().map_err(SupervisorError::Lock)?;

        let status = StatusChannel::new(dir.clone());
        status.reset().map_err(SupervisorError::Reset)?;
        let log = Arc::new(
            LogWriter::create(dir.log(), self.os.line_ending()).map_err(SupervisorError::Log)?,
        );

        log.line(&format!(
            "Calling commandline: {}",
            join_command_line(&self.request.command)
        ));

        let start = Instant::now();
        let finish = self.execute(&status, &log).await;
        let outcome = build_outcome(
            finish,
            self.request.timeout,
            self.request.stderr_is_error,
            log.had_error_lines(),
            start.elapsed(),
        );

        let exit_msg = format!("Command exited with code {}", outcome.exit_code);
        if outcome.exit_code != 0 {
            log.error_line(&exit_msg);
        } else {
            log.line(&exit_msg);
        }
        if let Some(error) = &outcome.error {
            log.error_line(&format!("Unable to run command, error: {error}"));
        }

        let record = ExitRecord {
            exit_code: outcome.exit_code,
            error: outcome.error.clone().unwrap_or_default(),
            exit_time: Utc::now(),
            duration: format_duration(outcome.duration),
        };
        let exit_record_error = match status.write_exit(&record) {
            Ok(()) => None,
            Err(e) => {
                tracing::error!(error = %e, "failed to write exit record");
                log.error_line(&format!("Unable to write exit record, error: {e}"));
                Some(e)
            }
        };

        tracing::info!(
            exit_code = outcome.exit_code,
            termination = ?outcome.termination,
            duration_ms = outcome.duration.as_millis() as u64,
            "run finished"
        );
        Ok(RunReport {
            outcome,
            exit_record_error,
        })
    }

    async fn execute(&self, status: &StatusChannel, log: &Arc<LogWriter>) -> Finish {
        let command = &self.request.command;
        let mut child = match Command::new(&command[0])
            .args(&command[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(command = %command[0], error = %e, "failed to spawn command");
                return Finish::StartFailed(e);
            }
        };
        let Some(pid) = child.id() else {
            return Finish::StartFailed(std::io::Error::other(
                "child exited before its pid could be read",
            ));
        };
        tracing::info!(pid, command = %command[0], "command started");

        if let Err(e) = status.write_local_context(&LocalContext::capture()) {
            log.warning(&format!("Unable to write local context, error: {e}"));
        }

        let sampler = self
            .request
            .record_resource_usage
            .then(|| ResourceSampler::new(self.os));
        let (watchdog, abort_rx) =
            Watchdog::start(status.clone(), Arc::clone(log), &self.timing, pid, sampler);

        let pumps: Vec<JoinHandle<()>> = [
            child
                .stdout
                .take()
                .map(|out| tokio::spawn(pump(out, Arc::clone(log), Stream::Stdout))),
            child
                .stderr
                .take()
                .map(|err| tokio::spawn(pump(err, Arc::clone(log), Stream::Stderr))),
        ]
        .into_iter()
        .flatten()
        .collect();

        let timeout = self.request.timeout;
        if timeout.is_zero() {
            log.line("No timeout set for process");
        } else {
            log.line(&format!(
                "Using timeout of '{}' for process",
                format_duration(timeout)
            ));
        }
        let deadline = async move {
            if timeout.is_zero() {
                std::future::pending::<()>().await
            } else {
                tokio::time::sleep(timeout).await
            }
        };

        let finish = tokio::select! {
            exited = child.wait() => match exited {
                Ok(s) => Finish::Exited(s.code()),
                Err(e) => Finish::WaitFailed(e),
            },
            _ = deadline => {
                log.line(&format!(
                    "Timeout of {} reached, now aborting",
                    format_duration(timeout)
                ));
                self.abort_process(log, pid).await;
                Finish::TimedOut
            }
            Ok(()) = abort_rx => {
                self.abort_process(log, pid).await;
                Finish::Aborted
            }
        };

        // Let in-flight lines from the kill path land.
        tokio::time::sleep(self.timing.settle_delay()).await;
        watchdog.stop().await;

        match finish {
            Finish::TimedOut | Finish::Aborted => {
                // A forcibly killed tree may keep the pipes open; do not wait on them.
                let _ = child.try_wait();
                for pump in pumps {
                    pump.abort();
                }
            }
            _ => {
                for pump in pumps {
                    if let Err(e) = pump.await {
                        tracing::warn!(error = %e, "output pump ended abnormally");
                    }
                }
            }
        }
        finish
    }

    /// Force-kill the child's tree. Called from exactly one race branch.
    async fn abort_process(&self, log: &LogWriter, pid: u32) {
        let killer = Arc::clone(&self.killer);
        tracing::info!(pid, strategy = killer.name(), "killing process tree");
        match tokio::task::spawn_blocking(move || killer.kill_tree(pid, true)).await {
            Ok(Ok(report)) => {
                for warning in &report.warnings {
                    log.warning(warning);
                }
                log.line(&format!("Successfully killed process with PID {pid}"));
            }
            Ok(Err(e)) => {
                log.error_line(&format!("Cannot kill process with PID {pid}, error: {e}"))
            }
            Err(e) => log.warning(&format!("Kill process attempt recovered, recovery: {e}")),
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Longest line kept whole. Longer output is split into several log lines.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Forward one child stream into the log, line by line, until EOF.
async fn pump<R: AsyncRead + Unpin>(reader: R, log: Arc<LogWriter>, stream: Stream) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut warned_split = false;
    loop {
        buf.clear();
        let mut limited = (&mut reader).take(MAX_LINE_BYTES as u64);
        match limited.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if buf.len() == MAX_LINE_BYTES && buf.last() != Some(&b'\n') && !warned_split {
                    warned_split = true;
                    log.warning(&format!(
                        "Output line on {stream:?} exceeded {MAX_LINE_BYTES} bytes and was split"
                    ));
                }
                let text = String::from_utf8_lossy(&buf);
                let line = text.trim_end_matches(&['\r', '\n'][..]);
                match stream {
                    Stream::Stdout => log.line(line),
                    Stream::Stderr => log.error_line(line),
                }
            }
            Err(e) => {
                tracing::warn!(?stream, error = %e, "failed to read child output");
                break;
            }
        }
    }
}

/// Turn the race result into the final outcome, applying the stderr policy.
fn build_outcome(
    finish: Finish,
    timeout: Duration,
    stderr_is_error: bool,
    had_stderr_lines: bool,
    duration: Duration,
) -> ExecutionOutcome {
    let (termination, exit_code, error) = match finish {
        Finish::StartFailed(e) => (
            Termination::StartFailed,
            -1,
            Some(format!("failed to start command: {e}")),
        ),
        Finish::WaitFailed(e) => (
            Termination::Completed,
            -1,
            Some(format!("failed waiting for command: {e}")),
        ),
        Finish::Exited(Some(0)) => (Termination::Completed, 0, None),
        Finish::Exited(Some(code)) => (
            Termination::Completed,
            code,
            Some(format!("The command exited with code {code}")),
        ),
        Finish::Exited(None) => (
            Termination::Completed,
            -1,
            Some("The command was terminated by a signal".to_string()),
        ),
        Finish::TimedOut => (
            Termination::TimedOut,
            -1,
            Some(format!(
                "The command timed out after '{}'",
                format_duration(timeout)
            )),
        ),
        Finish::Aborted => (
            Termination::Aborted,
            -1,
            Some("The command was aborted by an external abort request".to_string()),
        ),
    };

    let (exit_code, error) =
        if termination == Termination::Completed && stderr_is_error && had_stderr_lines {
            (
                -1,
                Some(
                    "The command finished running but had error lines (written to stderr)."
                        .to_string(),
                ),
            )
        } else {
            (exit_code, error)
        };

    ExecutionOutcome {
        termination,
        exit_code,
        error,
        timed_out: termination == Termination::TimedOut,
        aborted: termination == Termination::Aborted,
        had_stderr_lines,
        duration,
    }
}

/// Render a command line for the log, quoting arguments that contain spaces.
pub fn join_command_line(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            let trimmed = arg.trim_matches(&[' ', '\'', '"'][..]);
            if trimmed.contains(' ') {
                format!("\"{trimmed}\"")
            } else {
                trimmed.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Errors that stop a run before the command starts.
#[derive(Debug)]
pub enum SupervisorError {
    EmptyCommand,
    Lock(LockError),
    Reset(StatusError),
    Log(LogError),
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::EmptyCommand => write!(f, "no command given to run"),
            SupervisorError::Lock(e) => write!(f, "cannot lock status directory: {e}"),
            SupervisorError::Reset(e) => write!(f, "cannot clear stale status files: {e}"),
            SupervisorError::Log(e) => write!(f, "cannot prepare log file: {e}"),
        }
    }
}

impl std::error::Error for SupervisorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SupervisorError::EmptyCommand => None,
            SupervisorError::Lock(e) => Some(e),
            SupervisorError::Reset(e) => Some(e),
            SupervisorError::Log(e) => Some(e),
        }
    }
}
