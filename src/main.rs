mod config;
mod kill_tree;
mod log_writer;
mod parselog;
mod platform;
mod process_tree;
mod resource_usage;
mod status;
mod status_dir;
mod supervisor;
mod watchdog;

use clap::{Parser, Subcommand};
use config::{ConfigError, ExecConfig};
use parselog::LogClassifier;
use platform::{OsFamily, PlatformError};
use status::{format_alive, StatusChannel, StatusError};
use status_dir::StatusDir;
use std::io::BufReader;
use std::path::PathBuf;
use std::time::Duration;
use supervisor::{RunRequest, Supervisor, SupervisorError};

/// Run a command under supervision: timestamped log, heartbeat, file-based
/// abort, exit record and optional resource sampling.
#[derive(Parser, Debug)]
#[command(name = "easy-exec", version, about)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true, default_value = "easy-exec.toml")]
    config: PathBuf,

    /// Debug-level diagnostics on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Only warnings and errors on stderr
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Execute a command and record its run in the status directory
    Exec {
        /// Treat any stderr output as a failure
        #[arg(long)]
        stderr_is_error: bool,

        /// Kill the command tree after this long (0 = never)
        #[arg(long, value_name = "DURATION", default_value = "0", value_parser = config::parse_duration)]
        timeout_kill: Duration,

        /// Append periodic resource-usage samples
        #[arg(long)]
        record_resource_usage: bool,

        /// Status directory (overrides config)
        #[arg(long)]
        status_dir: Option<PathBuf>,

        /// Log file path (overrides config)
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Command and its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },

    /// Replay a run log, error lines to stderr and the rest to stdout
    Parselog {
        /// Log file path (overrides config)
        #[arg(long)]
        log_file: Option<PathBuf>,

        /// Status directory (overrides config)
        #[arg(long)]
        status_dir: Option<PathBuf>,

        /// Extra error patterns, separated by `[{|}]`
        #[arg(long, value_name = "PATTERNS")]
        parse_patterns: Option<String>,
    },

    /// Show heartbeat age, pending abort and exit record
    Status {
        /// Status directory (overrides config)
        #[arg(long)]
        status_dir: Option<PathBuf>,
    },

    /// Ask a running supervisor to kill its command
    Abort {
        /// Status directory (overrides config)
        #[arg(long)]
        status_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "easy_exec=debug"
    } else if cli.quiet {
        "easy_exec=warn"
    } else {
        "easy_exec=info"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter)),
        )
        .init();
    tracing::debug!(?cli, "parsed CLI arguments");

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "easy-exec failed");
            eprintln!("Error: {e}");
            e.exit_code()
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32, CliError> {
    let config = ExecConfig::load(&cli.config)?;

    match cli.command {
        Commands::Exec {
            stderr_is_error,
            timeout_kill,
            record_resource_usage,
            status_dir,
            log_file,
            command,
        } => {
            let os = OsFamily::detect()?;
            let dir = resolve_dir(&config, status_dir, log_file);
            let request = RunRequest::new(command, dir)?
                .stderr_is_error(stderr_is_error)
                .timeout(timeout_kill)
                .record_resource_usage(record_resource_usage);
            tracing::info!(
                os = %os,
                command = %request.command().join(" "),
                status_dir = %request.status_dir().root().display(),
                "starting supervised run"
            );

            let report = Supervisor::new(request, config.timing, os).run().await?;
            if let Some(e) = &report.exit_record_error {
                eprintln!("Warning: exit record was not written: {e}");
            }
            println!("exit code was {}", report.outcome.exit_code);
            Ok(report.outcome.exit_code)
        }
        Commands::Parselog {
            log_file,
            status_dir,
            parse_patterns,
        } => {
            let patterns = match parse_patterns.as_deref() {
                Some(p) => parselog::parse_patterns(p).map_err(CliError::Pattern)?,
                None => Vec::new(),
            };
            for pattern in &patterns {
                tracing::info!(pattern = %pattern, "additional error pattern added");
            }
            let dir = resolve_dir(&config, status_dir, log_file);
            let path = dir.log().to_path_buf();
            let file = std::fs::File::open(&path).map_err(|e| CliError::Io {
                path: path.clone(),
                source: e,
            })?;

            let classifier = LogClassifier::new(patterns);
            let summary = classifier
                .replay(
                    BufReader::new(file),
                    &mut std::io::stdout().lock(),
                    &mut std::io::stderr().lock(),
                )
                .map_err(|e| CliError::Io { path, source: e })?;
            tracing::debug!(
                lines = summary.lines,
                error_lines = summary.error_lines,
                "log replayed"
            );
            Ok(0)
        }
        Commands::Status { status_dir } => {
            let status = StatusChannel::new(resolve_dir(&config, status_dir, None));
            print_status(&status)?;
            Ok(0)
        }
        Commands::Abort { status_dir } => {
            let status = StatusChannel::new(resolve_dir(&config, status_dir, None));
            status.request_abort()?;
            println!(
                "Abort requested: {}",
                status.dir().must_abort().display()
            );
            Ok(0)
        }
    }
}

/// Status directory from the config, with CLI overrides applied.
fn resolve_dir(
    config: &ExecConfig,
    status_dir: Option<PathBuf>,
    log_file: Option<PathBuf>,
) -> StatusDir {
    let root = status_dir.unwrap_or_else(|| config.paths.status_dir.clone());
    let dir = StatusDir::from_config(root, &config.paths);
    match log_file {
        Some(log) => dir.with_log_file(log),
        None => dir,
    }
}

fn print_status(status: &StatusChannel) -> Result<(), StatusError> {
    println!("Status directory: {}", status.dir().root().display());

    if status.dir().alive().exists() {
        let alive = status.read_alive()?;
        let age = chrono::Utc::now().signed_duration_since(alive);
        println!(
            "Last heartbeat: {} ({}s ago)",
            format_alive(alive),
            age.num_seconds().max(0)
        );
    } else {
        println!("Last heartbeat: none");
    }

    let pending = status.abort_requested()?;
    println!("Abort pending: {}", if pending { "yes" } else { "no" });

    match status.read_exit()? {
        Some(record) => {
            println!(
                "Exited: code {} at {} after {}",
                record.exit_code,
                format_alive(record.exit_time),
                record.duration
            );
            if record.has_error() {
                println!("Error: {}", record.error);
            }
        }
        None => println!("Exited: not yet"),
    }
    Ok(())
}

#[derive(Debug)]
enum CliError {
    Config(ConfigError),
    Platform(PlatformError),
    Supervisor(SupervisorError),
    Status(StatusError),
    Pattern(regex::Error),
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl CliError {
    /// Process exit code: 2 for bad arguments, 1 for everything else.
    fn exit_code(&self) -> i32 {
        match self {
            CliError::Pattern(_) | CliError::Supervisor(SupervisorError::EmptyCommand) => 2,
            _ => 1,
        }
    }
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::Config(e) => write!(f, "{e}"),
            CliError::Platform(e) => write!(f, "{e}"),
            CliError::Supervisor(e) => write!(f, "{e}"),
            CliError::Status(e) => write!(f, "{e}"),
            CliError::Pattern(e) => write!(f, "invalid parse pattern: {e}"),
            CliError::Io { path, source } => write!(f, "{}: {source}", path.display()),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Config(e) => Some(e),
            CliError::Platform(e) => Some(e),
            CliError::Supervisor(e) => Some(e),
            CliError::Status(e) => Some(e),
            CliError::Pattern(e) => Some(e),
            CliError::Io { source, .. } => Some(source),
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e)
    }
}

impl From<PlatformError> for CliError {
    fn from(e: PlatformError) -> Self {
        CliError::Platform(e)
    }
}

impl From<SupervisorError> for CliError {
    fn from(e: SupervisorError) -> Self {
        CliError::Supervisor(e)
    }
}

impl From<StatusError> for CliError {
    fn from(e: StatusError) -> Self {
        CliError::Status(e)
    }
}
