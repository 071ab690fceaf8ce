/// File-based control protocol between a run and its external monitor.
///
/// Overwritten files (alive, exit record, local context) go through a temp
/// file in the same directory and a rename, so readers never see a partial
/// write. The resource-usage stream is appended one JSON line at a time.
use crate::resource_usage::ResourceUsageRecord;
use crate::status_dir::StatusDir;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Terminal record of a run, written once to the exit file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitRecord {
    pub exit_code: i32,
    pub error: String,
    pub exit_time: DateTime<Utc>,
    pub duration: String,
}

impl ExitRecord {
    pub fn has_error(&self) -> bool {
        !self.error.trim().is_empty()
    }
}

/// Who ran the command and where.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalContext {
    pub user_name: String,
    pub host_name: String,
}

impl LocalContext {
    /// Capture user and host. Failures are recorded in the field itself.
    pub fn capture() -> Self {
        let user_name = current_user_name()
            .unwrap_or_else(|e| format!("ERROR: Cannot obtain UserName - error '{e}'"));
        let host_name = sysinfo::System::host_name().unwrap_or_else(|| {
            "ERROR: Cannot obtain HostName - error 'host name unavailable'".to_string()
        });
        Self {
            user_name,
            host_name,
        }
    }
}

#[cfg(unix)]
fn current_user_name() -> Result<String, String> {
    use nix::unistd::{getuid, User};

    let uid = getuid();
    match User::from_uid(uid) {
        Ok(Some(user)) => Ok(user.name),
        Ok(None) => Err(format!("no passwd entry for uid {uid}")),
        Err(e) => Err(e.to_string()),
    }
}

#[cfg(not(unix))]
fn current_user_name() -> Result<String, String> {
    std::env::var("USERNAME").map_err(|e| e.to_string())
}

/// Heartbeat timestamps: RFC 3339, UTC, second precision.
pub fn format_alive(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Reads and writes the status files of one status directory.
#[derive(Debug, Clone)]
pub struct StatusChannel {
    dir: StatusDir,
}

impl StatusChannel {
    pub fn new(dir: StatusDir) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &StatusDir {
        &self.dir
    }

    /// Delete every run-scoped file. Files that do not exist are fine.
    pub fn reset(&self) -> Result<(), StatusError> {
        for path in self.dir.run_scoped_files() {
            match std::fs::remove_file(path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed stale status file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(StatusError::Remove {
                        path: path.to_path_buf(),
                        source: e,
                    })
                }
            }
        }
        Ok(())
    }

    /// Overwrite the alive file with the current UTC time.
    pub fn write_alive(&self) -> Result<(), StatusError> {
        write_atomic(self.dir.alive(), format_alive(Utc::now()).as_bytes())
    }

    /// Last heartbeat written to the alive file.
    pub fn read_alive(&self) -> Result<DateTime<Utc>, StatusError> {
        let path = self.dir.alive();
        let text = read_text(path)?;
        DateTime::parse_from_rfc3339(text.trim())
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| StatusError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    /// Whether the monitor has asked for the run to be aborted.
    pub fn abort_requested(&self) -> Result<bool, StatusError> {
        let path = self.dir.must_abort();
        path.try_exists().map_err(|e| StatusError::Read {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Create the abort sentinel. Only the monitor side calls this.
    pub fn request_abort(&self) -> Result<(), StatusError> {
        write_atomic(self.dir.must_abort(), b"abort")
    }

    pub fn write_exit(&self, record: &ExitRecord) -> Result<(), StatusError> {
        let json = serde_json::to_vec(record).map_err(|e| StatusError::Serialize { source: e })?;
        write_atomic(self.dir.exited(), &json)
    }

    /// The exit record, or `None` while the run has not finished.
    pub fn read_exit(&self) -> Result<Option<ExitRecord>, StatusError> {
        let path = self.dir.exited();
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StatusError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| StatusError::Parse {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    pub fn write_local_context(&self, context: &LocalContext) -> Result<(), StatusError> {
        let json =
            serde_json::to_vec(context).map_err(|e| StatusError::Serialize { source: e })?;
        write_atomic(self.dir.local_context(), &json)
    }

    /// Append one record to the resource-usage stream.
    ///
    /// Sampling warnings turn a successful write into an error too, so they
    /// are never silently lost; the record stays on disk in that case.
    pub fn write_resource_usage(
        &self,
        record: &ResourceUsageRecord,
        warnings: &[String],
    ) -> Result<(), StatusError> {
        let mut line = serde_json::to_string(record).map_err(|e| StatusError::UsageWrite {
            path: self.dir.resource_usage().to_path_buf(),
            reason: format!("cannot serialize record: {e}"),
            warnings: warnings.to_vec(),
        })?;
        line.push('\n');

        if let Err(e) = append(self.dir.resource_usage(), line.as_bytes()) {
            return Err(StatusError::UsageWrite {
                path: self.dir.resource_usage().to_path_buf(),
                reason: e.to_string(),
                warnings: warnings.to_vec(),
            });
        }
        if !warnings.is_empty() {
            return Err(StatusError::UsageWarnings {
                warnings: warnings.to_vec(),
            });
        }
        Ok(())
    }

    /// Every record appended so far.
    pub fn read_resource_usage(&self) -> Result<Vec<ResourceUsageRecord>, StatusError> {
        let path = self.dir.resource_usage();
        read_text(path)?
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| {
                serde_json::from_str(l).map_err(|e| StatusError::Parse {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })
            })
            .collect()
    }
}

fn ensure_parent(path: &Path) -> Result<&Path, StatusError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| StatusError::CreateDir {
        path: parent.to_path_buf(),
        source: e,
    })?;
    Ok(parent)
}

fn write_atomic(path: &Path, content: &[u8]) -> Result<(), StatusError> {
    let dir = ensure_parent(path)?;
    let write_err = |source| StatusError::Write {
        path: path.to_path_buf(),
        source,
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(content).map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

fn append(path: &Path, content: &[u8]) -> Result<(), StatusError> {
    ensure_parent(path)?;
    std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| f.write_all(content))
        .map_err(|e| StatusError::Write {
            path: path.to_path_buf(),
            source: e,
        })
}

fn read_text(path: &Path) -> Result<String, StatusError> {
    std::fs::read_to_string(path).map_err(|e| StatusError::Read {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Errors from status file operations.
#[derive(Debug)]
pub enum StatusError {
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Serialize {
        source: serde_json::Error,
    },
    Parse {
        path: PathBuf,
        reason: String,
    },
    /// The resource record could not be written.
    UsageWrite {
        path: PathBuf,
        reason: String,
        warnings: Vec<String>,
    },
    /// The resource record was written, but sampling was incomplete.
    UsageWarnings {
        warnings: Vec<String>,
    },
}

fn warnings_suffix(warnings: &[String]) -> String {
    if warnings.is_empty() {
        String::new()
    } else {
        format!(
            ". Warnings while fetching resource usages: {}",
            warnings.join("\n")
        )
    }
}

impl std::fmt::Display for StatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusError::CreateDir { path, source } => write!(
                f,
                "cannot create status directory {}: {source}",
                path.display()
            ),
            StatusError::Write { path, source } => {
                write!(f, "failed to write status file {}: {source}", path.display())
            }
            StatusError::Remove { path, source } => {
                write!(f, "cannot remove status file {}: {source}", path.display())
            }
            StatusError::Read { path, source } => {
                write!(f, "cannot read status file {}: {source}", path.display())
            }
            StatusError::Serialize { source } => write!(f, "failed to serialize status: {source}"),
            StatusError::Parse { path, reason } => {
                write!(f, "malformed status file {}: {reason}", path.display())
            }
            StatusError::UsageWrite {
                path,
                reason,
                warnings,
            } => write!(
                f,
                "unable to write resource-usage file {}: {reason}{}",
                path.display(),
                warnings_suffix(warnings)
            ),
            StatusError::UsageWarnings { warnings } => write!(
                f,
                "resource usage recorded with {} warning(s){}",
                warnings.len(),
                warnings_suffix(warnings)
            ),
        }
    }
}

impl std::error::Error for StatusError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StatusError::CreateDir { source, .. }
            | StatusError::Write { source, .. }
            | StatusError::Remove { source, .. }
            | StatusError::Read { source, .. } => Some(source),
            StatusError::Serialize { source } => Some(source),
            StatusError::Parse { .. }
            | StatusError::UsageWrite { .. }
            | StatusError::UsageWarnings { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource_usage::ProcessResourceUsage;
    use tempfile::tempdir;

    fn channel(root: &Path) -> StatusChannel {
        StatusChannel::new(StatusDir::new(root.join("status")))
    }

    fn usage_record(pid: u32) -> ResourceUsageRecord {
        ResourceUsageRecord {
            time: Utc::now(),
            cpu_percentage: Some(5),
            free_physical_memory_kb: Some(1024),
            free_virtual_memory_kb: Some(2048),
            processes_resource_usage: vec![ProcessResourceUsage {
                pid,
                memory_kb: 64,
                cpu_seconds: 1,
            }],
            process_tree: None,
        }
    }

    #[test]
    fn test_alive_roundtrip_creates_dir() {
        let dir = tempdir().unwrap();
        let ch = channel(dir.path());

        let before = Utc::now() - chrono::Duration::seconds(1);
        ch.write_alive().unwrap();
        let alive = ch.read_alive().unwrap();
        assert!(alive >= before);

        let text = std::fs::read_to_string(ch.dir().alive()).unwrap();
        assert!(text.ends_with('Z'));
    }

    #[test]
    fn test_alive_is_overwritten() {
        let dir = tempdir().unwrap();
        let ch = channel(dir.path());
        ch.write_alive().unwrap();
        ch.write_alive().unwrap();

        let text = std::fs::read_to_string(ch.dir().alive()).unwrap();
        assert_eq!(text.len(), "2024-01-01T00:00:00Z".len());
    }

    #[test]
    fn test_abort_sentinel() {
        let dir = tempdir().unwrap();
        let ch = channel(dir.path());
        assert!(!ch.abort_requested().unwrap());

        ch.request_abort().unwrap();
        assert!(ch.abort_requested().unwrap());
    }

    #[test]
    fn test_exit_record_json_shape() {
        let dir = tempdir().unwrap();
        let ch = channel(dir.path());
        let record = ExitRecord {
            exit_code: 0,
            error: String::new(),
            exit_time: Utc::now(),
            duration: "1.5s".to_string(),
        };
        ch.write_exit(&record).unwrap();

        let contents = std::fs::read_to_string(ch.dir().exited()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed["exitCode"], 0);
        assert_eq!(parsed["error"], "");
        assert_eq!(parsed["duration"], "1.5s");
        assert!(parsed["exitTime"].is_string());

        let back = ch.read_exit().unwrap().unwrap();
        assert_eq!(back, record);
        assert!(!back.has_error());
    }

    #[test]
    fn test_read_exit_before_finish() {
        let dir = tempdir().unwrap();
        assert!(channel(dir.path()).read_exit().unwrap().is_none());
    }

    #[test]
    fn test_local_context_json_shape() {
        let dir = tempdir().unwrap();
        let ch = channel(dir.path());
        ch.write_local_context(&LocalContext::capture()).unwrap();

        let contents = std::fs::read_to_string(ch.dir().local_context()).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert!(!parsed["userName"].as_str().unwrap().is_empty());
        assert!(!parsed["hostName"].as_str().unwrap().is_empty());
    }

    #[test]
    fn test_resource_usage_appends_json_lines() {
        let dir = tempdir().unwrap();
        let ch = channel(dir.path());
        ch.write_resource_usage(&usage_record(1), &[]).unwrap();
        ch.write_resource_usage(&usage_record(2), &[]).unwrap();

        let records = ch.read_resource_usage().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].processes_resource_usage[0].pid, 1);
        assert_eq!(records[1].processes_resource_usage[0].pid, 2);
    }

    #[test]
    fn test_resource_usage_warnings_surface_after_write() {
        let dir = tempdir().unwrap();
        let ch = channel(dir.path());
        let warnings = vec!["Cannot get CPU percentage".to_string()];

        let err = ch
            .write_resource_usage(&usage_record(1), &warnings)
            .unwrap_err();
        assert!(matches!(err, StatusError::UsageWarnings { .. }));
        assert!(err.to_string().contains("Cannot get CPU percentage"));
        assert_eq!(ch.read_resource_usage().unwrap().len(), 1);
    }

    #[test]
    fn test_resource_usage_write_failure_keeps_warnings() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("status");
        std::fs::write(&blocker, "not a dir").unwrap();
        let ch = channel(dir.path());
        let warnings = vec!["pid 7 exited".to_string()];

        let err = ch
            .write_resource_usage(&usage_record(1), &warnings)
            .unwrap_err();
        assert!(matches!(err, StatusError::UsageWrite { .. }));
        assert!(err.to_string().contains("pid 7 exited"));
    }

    #[test]
    fn test_reset_removes_run_files_only() {
        let dir = tempdir().unwrap();
        let ch = channel(dir.path());
        ch.write_alive().unwrap();
        ch.request_abort().unwrap();
        ch.write_local_context(&LocalContext::capture()).unwrap();
        ch.write_resource_usage(&usage_record(1), &[]).unwrap();
        ch.write_exit(&ExitRecord {
            exit_code: 3,
            error: "x".to_string(),
            exit_time: Utc::now(),
            duration: "1s".to_string(),
        })
        .unwrap();
        std::fs::write(ch.dir().log(), "keep me").unwrap();

        ch.reset().unwrap();
        for path in ch.dir().run_scoped_files() {
            assert!(!path.exists(), "{} should be gone", path.display());
        }
        assert!(ch.dir().log().exists());

        // Second reset on a clean directory is fine.
        ch.reset().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_reset_fails_on_non_notfound_error() {
        let dir = tempdir().unwrap();
        let ch = channel(dir.path());
        // A directory where a file is expected cannot be removed with remove_file.
        std::fs::create_dir_all(ch.dir().alive()).unwrap();

        let err = ch.reset().unwrap_err();
        assert!(matches!(err, StatusError::Remove { .. }));
    }
}
