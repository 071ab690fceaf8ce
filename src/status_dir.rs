use crate::config::PathsConfig;
use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Resolved layout of the status directory shared with the external monitor.
///
/// Every control-plane file of a run lives here. File names from the config
/// are resolved against the directory unless they are already absolute.
#[derive(Debug, Clone)]
pub struct StatusDir {
    root: PathBuf,
    log: PathBuf,
    alive: PathBuf,
    exited: PathBuf,
    must_abort: PathBuf,
    local_context: PathBuf,
    resource_usage: PathBuf,
}

impl StatusDir {
    /// Default layout under the given root.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self::from_config(root, &PathsConfig::default())
    }

    /// Layout under `root` using the file names from `paths`.
    pub fn from_config(root: impl Into<PathBuf>, paths: &PathsConfig) -> Self {
        let root = root.into();
        let resolve = |name: &Path| {
            if name.is_absolute() {
                name.to_path_buf()
            } else {
                root.join(name)
            }
        };
        Self {
            log: resolve(&paths.log_file),
            alive: resolve(&paths.alive_file),
            exited: resolve(&paths.exit_file),
            must_abort: resolve(&paths.abort_file),
            local_context: resolve(&paths.local_context_file),
            resource_usage: resolve(&paths.resource_usage_file),
            root,
        }
    }

    /// Replace the log file location (e.g. from `--log-file`).
    pub fn with_log_file(mut self, log: impl Into<PathBuf>) -> Self {
        self.log = log.into();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the run log.
    pub fn log(&self) -> &Path {
        &self.log
    }

    /// Heartbeat file, overwritten every tick.
    pub fn alive(&self) -> &Path {
        &self.alive
    }

    /// Terminal exit record.
    pub fn exited(&self) -> &Path {
        &self.exited
    }

    /// Abort-request sentinel.
    pub fn must_abort(&self) -> &Path {
        &self.must_abort
    }

    pub fn local_context(&self) -> &Path {
        &self.local_context
    }

    /// JSON-lines resource usage stream.
    pub fn resource_usage(&self) -> &Path {
        &self.resource_usage
    }

    /// Path to the run lock file.
    pub fn lock(&self) -> PathBuf {
        self.root.join("lock")
    }

    /// Files that belong to a single run and must not survive into the next one.
    pub fn run_scoped_files(&self) -> [&Path; 5] {
        [
            &self.alive,
            &self.exited,
            &self.must_abort,
            &self.local_context,
            &self.resource_usage,
        ]
    }

    /// Create the directory and take the exclusive run lock.
    ///
    /// The lock is released when the returned guard is dropped.
    pub fn acquire_lock(&self) -> Result<RunLock, LockError> {
        std::fs::create_dir_all(&self.root).map_err(|e| LockError::Io {
            path: self.root.clone(),
            source: e,
        })?;
        let path = self.lock();
        let file = File::create(&path).map_err(|e| LockError::Io {
            path: path.clone(),
            source: e,
        })?;
        file.try_lock_exclusive()
            .map_err(|e| LockError::Held { path, source: e })?;
        Ok(RunLock { file })
    }
}

/// Guard for the exclusive status-directory lock.
#[derive(Debug)]
pub struct RunLock {
    file: File,
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug)]
pub enum LockError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Another supervisor holds the lock.
    Held {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Io { path, source } => {
                write!(f, "cannot open lock file {}: {source}", path.display())
            }
            LockError::Held { path, source } => write!(
                f,
                "status directory is in use by another run (lock {}): {source}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Io { source, .. } => Some(source),
            LockError::Held { source, .. } => Some(source),
        }
    }
}
