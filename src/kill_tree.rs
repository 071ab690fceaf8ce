//! Forced termination of a process and all of its descendants.
//!
//! Two strategies exist, one per OS family:
//!
//! - [`TaskkillKiller`] hands the whole tree to `TASKKILL /T` on Windows.
//! - [`TreeWalkKiller`] discovers the tree and signals every node itself,
//!   descendants first and the root last, on Linux and macOS.
//!
//! A node that exits between discovery and signalling is reported as a
//! warning in the [`KillReport`], not as a failure.

use crate::platform::OsFamily;
use crate::process_tree::{ProcessTree, TreeError};
use std::process::Command;
use std::sync::Arc;

/// Kills a process tree.
pub trait ProcessTreeKiller: Send + Sync {
    /// Short strategy name for diagnostics.
    fn name(&self) -> &'static str;

    /// Terminate `root_pid` and every descendant. `force` selects the
    /// non-catchable variant (SIGKILL, `/F`).
    fn kill_tree(&self, root_pid: u32, force: bool) -> Result<KillReport, KillError>;
}

/// What happened during a kill attempt that did not fail.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KillReport {
    /// Pids that were signalled successfully.
    pub signalled: Vec<u32>,
    /// Non-fatal oddities, e.g. processes that had already exited.
    pub warnings: Vec<String>,
}

/// Pick the killer for the detected OS family.
pub fn killer_for(os: OsFamily) -> Arc<dyn ProcessTreeKiller> {
    match os {
        OsFamily::Windows => Arc::new(TaskkillKiller),
        OsFamily::Linux | OsFamily::Darwin => Arc::new(TreeWalkKiller),
    }
}

/// Windows: one `TASKKILL /PID <pid> /T [/F]` call.
pub struct TaskkillKiller;

impl TaskkillKiller {
    fn args(root_pid: u32, force: bool) -> Vec<String> {
        let mut args = vec!["/PID".to_string(), root_pid.to_string(), "/T".to_string()];
        if force {
            args.push("/F".to_string());
        }
        args
    }
}

impl ProcessTreeKiller for TaskkillKiller {
    fn name(&self) -> &'static str {
        "taskkill"
    }

    fn kill_tree(&self, root_pid: u32, force: bool) -> Result<KillReport, KillError> {
        let output = Command::new("TASKKILL")
            .args(Self::args(root_pid, force))
            .output()
            .map_err(|e| KillError::Command {
                pid: root_pid,
                reason: e.to_string(),
                output: String::new(),
            })?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
            return Err(KillError::Command {
                pid: root_pid,
                reason: output.status.to_string(),
                output: combined.trim().to_string(),
            });
        }

        tracing::debug!(pid = root_pid, "TASKKILL terminated process tree");
        Ok(KillReport {
            signalled: vec![root_pid],
            warnings: Vec::new(),
        })
    }
}

/// Linux/macOS: signal every node of a freshly discovered tree.
pub struct TreeWalkKiller;

/// Outcome of signalling one pid.
enum SignalFailure {
    Gone,
    Failed(String),
}

impl TreeWalkKiller {
    #[cfg(unix)]
    fn signal(pid: u32, force: bool) -> Result<(), SignalFailure> {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let raw = i32::try_from(pid)
            .map_err(|_| SignalFailure::Failed(format!("pid {pid} out of range")))?;
        let sig = if force {
            Signal::SIGKILL
        } else {
            Signal::SIGTERM
        };
        match kill(Pid::from_raw(raw), sig) {
            Ok(()) => Ok(()),
            Err(Errno::ESRCH) => Err(SignalFailure::Gone),
            Err(e) => Err(SignalFailure::Failed(e.to_string())),
        }
    }

    #[cfg(not(unix))]
    fn signal(_pid: u32, _force: bool) -> Result<(), SignalFailure> {
        Err(SignalFailure::Failed(
            "signals are not available on this platform".to_string(),
        ))
    }

    /// Signal every pid in `order`. A failure on one node never stops the
    /// walk; all failures are returned together.
    fn walk(
        root_pid: u32,
        order: &[u32],
        mut report: KillReport,
        mut signal: impl FnMut(u32) -> Result<(), SignalFailure>,
    ) -> Result<KillReport, KillError> {
        let mut errors = Vec::new();
        for &pid in order {
            match signal(pid) {
                Ok(()) => report.signalled.push(pid),
                Err(SignalFailure::Gone) => report
                    .warnings
                    .push(format!("Process pid {pid} had already exited")),
                Err(SignalFailure::Failed(reason)) if pid == root_pid => {
                    errors.push(format!("Unable to kill main process pid {pid}, error: {reason}"))
                }
                Err(SignalFailure::Failed(reason)) => errors.push(format!(
                    "Could not kill child process (pid {pid}) of parent process (pid {root_pid}), error: {reason}"
                )),
            }
        }

        if !errors.is_empty() {
            return Err(KillError::Combined {
                pid: root_pid,
                errors,
            });
        }
        tracing::debug!(
            pid = root_pid,
            signalled = report.signalled.len(),
            "process tree signalled"
        );
        Ok(report)
    }
}

impl ProcessTreeKiller for TreeWalkKiller {
    fn name(&self) -> &'static str {
        "tree-walk"
    }

    fn kill_tree(&self, root_pid: u32, force: bool) -> Result<KillReport, KillError> {
        let mut report = KillReport::default();

        let order = match ProcessTree::load(root_pid) {
            Ok(tree) => tree.kill_order(),
            Err(TreeError::NotFound { .. }) => {
                report
                    .warnings
                    .push(format!("Process pid {root_pid} not found, it may have already exited"));
                vec![root_pid]
            }
        };

        Self::walk(root_pid, &order, report, |pid| Self::signal(pid, force))
    }
}

#[derive(Debug)]
pub enum KillError {
    /// The native tree-kill command failed.
    Command {
        pid: u32,
        reason: String,
        output: String,
    },
    /// One or more nodes could not be signalled.
    Combined { pid: u32, errors: Vec<String> },
}

impl std::fmt::Display for KillError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KillError::Command {
                pid,
                reason,
                output,
            } => write!(
                f,
                "Cannot call TASKKILL for pid {pid}. Error: {reason}. Output: {output}"
            ),
            KillError::Combined { pid, errors } => write!(
                f,
                "Combined {} errors in attempt to kill process pid {pid} with its children: {}",
                errors.len(),
                errors.join("\n")
            ),
        }
    }
}

impl std::error::Error for KillError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_taskkill_args() {
        assert_eq!(
            TaskkillKiller::args(42, true),
            vec!["/PID", "42", "/T", "/F"]
        );
        assert_eq!(TaskkillKiller::args(42, false), vec!["/PID", "42", "/T"]);
    }

    #[test]
    fn test_killer_selection() {
        assert_eq!(killer_for(OsFamily::Windows).name(), "taskkill");
        assert_eq!(killer_for(OsFamily::Linux).name(), "tree-walk");
        assert_eq!(killer_for(OsFamily::Darwin).name(), "tree-walk");
    }

    #[test]
    fn test_combined_error_display() {
        let err = KillError::Combined {
            pid: 10,
            errors: vec!["a".to_string(), "b".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.starts_with("Combined 2 errors in attempt to kill process pid 10"));
        assert!(msg.contains("a\nb"));
    }

    #[cfg(unix)]
    #[test]
    fn test_out_of_range_root_is_an_error() {
        let report = TreeWalkKiller.kill_tree(u32::MAX - 1, true);
        // pid is out of i32 range on purpose: the tree lookup warns, the
        // signal fails, and that failure is attributed to the root.
        let err = report.unwrap_err();
        assert!(err.to_string().contains("Unable to kill main process"));
    }

    #[test]
    fn test_walk_continues_past_failed_child() {
        let mut attempted = Vec::new();
        let result = TreeWalkKiller::walk(1, &[4, 2, 3, 1], KillReport::default(), |pid| {
            attempted.push(pid);
            match pid {
                2 => Err(SignalFailure::Failed("EPERM".to_string())),
                3 => Err(SignalFailure::Gone),
                _ => Ok(()),
            }
        });

        assert_eq!(attempted, vec![4, 2, 3, 1]);
        match result.unwrap_err() {
            KillError::Combined { pid, errors } => {
                assert_eq!(pid, 1);
                assert_eq!(errors.len(), 1);
                assert!(errors[0].contains("child process (pid 2)"));
                assert!(errors[0].contains("EPERM"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_walk_aggregates_child_and_root_failures() {
        let result = TreeWalkKiller::walk(1, &[5, 6, 1], KillReport::default(), |pid| {
            if pid == 6 {
                Ok(())
            } else {
                Err(SignalFailure::Failed("denied".to_string()))
            }
        });

        let err = result.unwrap_err();
        let msg = err.to_string();
        assert!(msg.starts_with("Combined 2 errors"));
        assert!(msg.contains("child process (pid 5)"));
        assert!(msg.contains("Unable to kill main process pid 1"));
    }

    #[test]
    fn test_walk_gone_nodes_are_warnings() {
        let report = TreeWalkKiller::walk(1, &[2, 1], KillReport::default(), |pid| {
            if pid == 2 {
                Err(SignalFailure::Gone)
            } else {
                Ok(())
            }
        })
        .unwrap();
        assert_eq!(report.signalled, vec![1]);
        assert_eq!(report.warnings, vec!["Process pid 2 had already exited"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_exited_root_reports_warning() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();

        let report = TreeWalkKiller.kill_tree(pid, true).unwrap();
        assert!(report.signalled.is_empty());
        assert!(!report.warnings.is_empty());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_kills_child_and_grandchild() {
        use std::io::BufRead;
        use std::process::Stdio;

        let mut child = std::process::Command::new("sh")
            .args(["-c", "sleep 30 & echo $!; wait"])
            .stdout(Stdio::piped())
            .spawn()
            .unwrap();
        let mut first = String::new();
        std::io::BufReader::new(child.stdout.take().unwrap())
            .read_line(&mut first)
            .unwrap();
        let grandchild: u32 = first.trim().parse().unwrap();

        let report = TreeWalkKiller.kill_tree(child.id(), true).unwrap();
        assert!(report.signalled.contains(&child.id()));
        assert!(report.signalled.contains(&grandchild));

        let status = child.wait().unwrap();
        assert!(!status.success());

        // The grandchild ends up either reaped or a zombie waiting for init.
        let dead = (0..40).any(|_| {
            let state = std::fs::read_to_string(format!("/proc/{grandchild}/stat"))
                .ok()
                .and_then(|stat| stat.rsplit(')').next()?.trim_start().chars().next());
            if matches!(state, None | Some('Z') | Some('X')) {
                return true;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
            false
        });
        assert!(dead, "grandchild {grandchild} still running");
    }
}
