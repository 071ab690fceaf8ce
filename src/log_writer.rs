//! Timestamped, append-only run log.
//!
//! Every worker of a run (output pumps, pollers, the supervisor itself) writes
//! through one `LogWriter`. A single mutex around the sink keeps lines whole;
//! each line is `[YYYY-MM-DD HH:MM:SS] <text>` in local time.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Token placed in front of every error line. The log replay classifier keys on it.
pub const ERROR_MARKER: &str = "EASY_EXEC_ERROR: ";

/// Prefix for telemetry warnings. These never count as error lines.
pub const WARNING_PREFIX: &str = "WARNING: ";

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub struct LogWriter {
    sink: Mutex<Box<dyn Write + Send>>,
    line_ending: &'static str,
    had_error: AtomicBool,
}

impl LogWriter {
    /// Truncate or create the log file, creating its parent directory first.
    pub fn create(path: &Path, line_ending: &'static str) -> Result<Self, LogError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| LogError::CreateDir {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }
        let file: File = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|e| LogError::Open {
                path: path.to_path_buf(),
                source: e,
            })?;
        Ok(Self::from_writer(file, line_ending))
    }

    /// Wrap an arbitrary sink.
    pub fn from_writer(sink: impl Write + Send + 'static, line_ending: &'static str) -> Self {
        Self {
            sink: Mutex::new(Box::new(sink)),
            line_ending,
            had_error: AtomicBool::new(false),
        }
    }

    /// Append a normal line.
    pub fn line(&self, text: &str) {
        let timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT);
        let formatted = format!("[{timestamp}] {text}{}", self.line_ending);

        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = sink.write_all(formatted.as_bytes()).and_then(|_| sink.flush()) {
            tracing::error!(error = %e, "cannot write to run log");
        }
    }

    /// Append an error-tagged line. Blank input is dropped and does not count.
    pub fn error_line(&self, text: &str) {
        if text.trim().is_empty() {
            return;
        }
        self.had_error.store(true, Ordering::SeqCst);
        self.line(&format!("{ERROR_MARKER}{text}"));
    }

    /// Append a telemetry warning. Mirrored to tracing.
    pub fn warning(&self, text: &str) {
        tracing::warn!("{text}");
        self.line(&format!("{WARNING_PREFIX}{text}"));
    }

    /// Whether at least one error line has been written this run.
    pub fn had_error_lines(&self) -> bool {
        self.had_error.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub enum LogError {
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogError::CreateDir { path, source } => {
                write!(f, "cannot create log directory {}: {source}", path.display())
            }
            LogError::Open { path, source } => {
                write!(f, "cannot open log file {}: {source}", path.display())
            }
        }
    }
}

impl std::error::Error for LogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LogError::CreateDir { source, .. } => Some(source),
            LogError::Open { source, .. } => Some(source),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use regex::Regex;
    use std::sync::Arc;
    use tempfile::tempdir;

    /// In-memory sink shared between the writer and the test.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuf(pub Arc<Mutex<Vec<u8>>>);

    impl SharedBuf {
        pub(crate) fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn line_re() -> Regex {
        Regex::new(r"^\[\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\] (.*)$").unwrap()
    }

    #[test]
    fn test_line_has_timestamp_prefix() {
        let buf = SharedBuf::default();
        let log = LogWriter::from_writer(buf.clone(), "\n");
        log.line("hello world");

        let contents = buf.contents();
        assert!(contents.ends_with('\n'));
        let caps = line_re().captures(contents.trim_end()).unwrap();
        assert_eq!(&caps[1], "hello world");
        assert!(!log.had_error_lines());
    }

    #[test]
    fn test_error_line_is_tagged_and_flagged() {
        let buf = SharedBuf::default();
        let log = LogWriter::from_writer(buf.clone(), "\n");
        log.error_line("boom");

        let contents = buf.contents();
        let caps = line_re().captures(contents.trim_end()).unwrap();
        assert_eq!(&caps[1], "EASY_EXEC_ERROR: boom");
        assert!(log.had_error_lines());
    }

    #[test]
    fn test_blank_error_line_dropped() {
        let buf = SharedBuf::default();
        let log = LogWriter::from_writer(buf.clone(), "\n");
        log.error_line("   \t ");
        log.error_line("");

        assert!(buf.contents().is_empty());
        assert!(!log.had_error_lines());
    }

    #[test]
    fn test_warning_does_not_flag_error() {
        let buf = SharedBuf::default();
        let log = LogWriter::from_writer(buf.clone(), "\n");
        log.warning("heartbeat write failed");

        assert!(buf.contents().contains("WARNING: heartbeat write failed"));
        assert!(!log.had_error_lines());
    }

    #[test]
    fn test_windows_line_ending() {
        let buf = SharedBuf::default();
        let log = LogWriter::from_writer(buf.clone(), "\r\n");
        log.line("a");
        log.line("b");

        let contents = buf.contents();
        assert_eq!(contents.matches("\r\n").count(), 2);
    }

    #[test]
    fn test_concurrent_writers_never_interleave() {
        let buf = SharedBuf::default();
        let log = Arc::new(LogWriter::from_writer(buf.clone(), "\n"));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let log = Arc::clone(&log);
                std::thread::spawn(move || {
                    for i in 0..100 {
                        log.line(&format!("thread-{t}-line-{i}-{}", "x".repeat(64)));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let contents = buf.contents();
        let re = Regex::new(r"^\[[^\]]+\] thread-\d-line-\d+-x{64}$").unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 800);
        assert!(lines.iter().all(|l| re.is_match(l)));
    }

    #[test]
    fn test_create_truncates_and_makes_parent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/dir/log.log");

        let log = LogWriter::create(&path, "\n").unwrap();
        log.line("first run");
        drop(log);

        let log = LogWriter::create(&path, "\n").unwrap();
        log.line("second run");
        drop(log);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("first run"));
        assert!(contents.contains("second run"));
    }

    #[test]
    fn test_create_fails_when_parent_is_a_file() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();

        let err = LogWriter::create(&blocker.join("log.log"), "\n")
            .err()
            .unwrap();
        assert!(matches!(err, LogError::CreateDir { .. }));
    }
}
