use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration loaded from easy-exec.toml.
#[derive(Debug, Deserialize)]
#[serde(default)]
#[derive(Default)]
pub struct ExecConfig {
    pub paths: PathsConfig,
    pub timing: TimingConfig,
}

/// Where the log and the status files live. Relative file names resolve
/// inside `status_dir`.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub status_dir: PathBuf,
    pub log_file: PathBuf,
    pub alive_file: PathBuf,
    pub exit_file: PathBuf,
    pub abort_file: PathBuf,
    pub local_context_file: PathBuf,
    pub resource_usage_file: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub heartbeat_interval_ms: u64,
    pub abort_poll_interval_ms: u64,
    pub resource_sample_interval_ms: u64,
    pub settle_delay_ms: u64,
}

// --- Default implementations ---

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            status_dir: PathBuf::from("exec-logger"),
            log_file: PathBuf::from("log.log"),
            alive_file: PathBuf::from("alive.txt"),
            exit_file: PathBuf::from("exited.json"),
            abort_file: PathBuf::from("must-abort.txt"),
            local_context_file: PathBuf::from("local-context.json"),
            resource_usage_file: PathBuf::from("resource-usage.jsonl"),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 2000,
            abort_poll_interval_ms: 2000,
            resource_sample_interval_ms: 10_000,
            settle_delay_ms: 500,
        }
    }
}

impl TimingConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn abort_poll_interval(&self) -> Duration {
        Duration::from_millis(self.abort_poll_interval_ms)
    }

    pub fn resource_sample_interval(&self) -> Duration {
        Duration::from_millis(self.resource_sample_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl ExecConfig {
    /// Load the config file. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let config: ExecConfig = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the pollers spin.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let t = &self.timing;
        for (field, value) in [
            ("timing.heartbeat_interval_ms", t.heartbeat_interval_ms),
            ("timing.abort_poll_interval_ms", t.abort_poll_interval_ms),
            (
                "timing.resource_sample_interval_ms",
                t.resource_sample_interval_ms,
            ),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than 0".to_string(),
                });
            }
        }
        if self.paths.status_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "paths.status_dir",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Parse a duration like `500ms`, `30s`, `1m30s`, `2h` or a bare number of seconds.
pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("duration is empty".to_string());
    }
    if let Ok(secs) = s.parse::<f64>() {
        return secs_to_duration(secs, input);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        if num_len == 0 {
            return Err(format!("invalid duration '{input}': expected a number"));
        }
        let value: f64 = rest[..num_len]
            .parse()
            .map_err(|_| format!("invalid duration '{input}': bad number"))?;
        rest = &rest[num_len..];

        let unit_len = rest
            .find(|c: char| !c.is_ascii_alphabetic())
            .unwrap_or(rest.len());
        let scale = match &rest[..unit_len] {
            "ms" => 0.001,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            "" => return Err(format!("invalid duration '{input}': missing unit")),
            unit => return Err(format!("invalid duration '{input}': unknown unit '{unit}'")),
        };
        rest = &rest[unit_len..];
        total = total
            .checked_add(secs_to_duration(value * scale, input)?)
            .ok_or_else(|| format!("invalid duration '{input}': too large"))?;
    }
    Ok(total)
}

fn secs_to_duration(secs: f64, input: &str) -> Result<Duration, String> {
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("invalid duration '{input}': must be non-negative"));
    }
    Duration::try_from_secs_f64(secs)
        .map_err(|_| format!("invalid duration '{input}': too large"))
}

/// Render a duration compactly: `750ms`, `2s`, `1.5s`, `1m30s`, `1h0m5s`.
pub fn format_duration(d: Duration) -> String {
    let total_ms = d.as_millis();
    if total_ms < 1000 {
        return format!("{total_ms}ms");
    }
    let hours = total_ms / 3_600_000;
    let mins = (total_ms / 60_000) % 60;
    let secs = (total_ms % 60_000) as f64 / 1000.0;

    let mut out = String::new();
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if hours > 0 || mins > 0 {
        out.push_str(&format!("{mins}m"));
    }
    out.push_str(&format!("{secs}s"));
    out
}

/// Errors from loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    Invalid {
        field: &'static str,
        reason: String,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {source}", path.display())
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {source}", path.display())
            }
            ConfigError::Invalid { field, reason } => {
                write!(f, "invalid config value {field}: {reason}")
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
            ConfigError::Invalid { .. } => None,
        }
    }
}
