//! Point-in-time CPU and memory sampling of the host and of a process tree.
//!
//! Host figures and per-process memory come from `sysinfo`. Consumed CPU time
//! per process comes from the platform's own tool, selected once per OS
//! family through [`CpuTimeProbe`].

use crate::platform::OsFamily;
use crate::process_tree::ProcessTree;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::process::Command;
use std::time::Duration;
use sysinfo::{Pid, System};

/// One sampling tick. Fields that could not be measured are left out.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsageRecord {
    pub time: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub cpu_percentage: Option<u32>,
    #[serde(
        rename = "freePhysicalMemoryKB",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub free_physical_memory_kb: Option<u64>,
    #[serde(
        rename = "freeVirtualMemoryKB",
        skip_serializing_if = "Option::is_none",
        default
    )]
    pub free_virtual_memory_kb: Option<u64>,
    pub processes_resource_usage: Vec<ProcessResourceUsage>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub process_tree: Option<ProcessTree>,
}

/// Usage of a single process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessResourceUsage {
    pub pid: u32,
    #[serde(rename = "memoryKB")]
    pub memory_kb: u64,
    pub cpu_seconds: u64,
}

impl ResourceUsageRecord {
    /// Sum memory and CPU seconds over every sampled process.
    pub fn summed_usage(&self) -> ProcessResourceUsage {
        self.processes_resource_usage
            .iter()
            .fold(ProcessResourceUsage::default(), |mut acc, p| {
                acc.memory_kb += p.memory_kb;
                acc.cpu_seconds += p.cpu_seconds;
                acc
            })
    }
}

/// Reads the CPU time a process has consumed so far.
pub trait CpuTimeProbe: Send {
    fn name(&self) -> &'static str;
    fn cpu_time(&self, pid: u32) -> Result<Duration, String>;
}

/// Pick the CPU-time probe for the detected OS family.
pub fn probe_for(os: OsFamily) -> Box<dyn CpuTimeProbe> {
    match os {
        OsFamily::Windows => Box::new(TasklistProbe),
        OsFamily::Linux | OsFamily::Darwin => Box::new(PsProbe),
    }
}

/// Linux/macOS: `ps -o time= -p <pid>`.
pub struct PsProbe;

impl CpuTimeProbe for PsProbe {
    fn name(&self) -> &'static str {
        "ps"
    }

    fn cpu_time(&self, pid: u32) -> Result<Duration, String> {
        let output = run_exec("ps", &["-o", "time=", "-p", &pid.to_string()])?;
        let text = output.trim();
        if text.is_empty() {
            return Err(format!("no ps entry for pid {pid}"));
        }
        parse_cpu_time(text)
    }
}

/// Windows: the "CPU Time" column of `tasklist /V /FO csv`.
pub struct TasklistProbe;

impl CpuTimeProbe for TasklistProbe {
    fn name(&self) -> &'static str {
        "tasklist"
    }

    fn cpu_time(&self, pid: u32) -> Result<Duration, String> {
        let filter = format!("PID eq {pid}");
        let output = run_exec("tasklist", &["/FI", &filter, "/FO", "csv", "/V"])?;
        parse_tasklist_cpu_time(&output)
    }
}

fn run_exec(program: &str, args: &[&str]) -> Result<String, String> {
    let output = Command::new(program).args(args).output().map_err(|e| {
        format!(
            "Cannot run command (cmdline '{program} {}'), error: {e}",
            args.join(" ")
        )
    })?;
    if !output.status.success() {
        return Err(format!(
            "Command '{program} {}' failed with {}",
            args.join(" "),
            output.status
        ));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse `[DD-]HH:MM:SS`, `H:MM:SS` or `MM:SS.ss` CPU time text.
pub fn parse_cpu_time(text: &str) -> Result<Duration, String> {
    let text = text.trim();
    let (days, clock) = match text.split_once('-') {
        Some((d, rest)) => (
            d.parse::<u64>()
                .map_err(|_| format!("Unexpected cpu time string '{text}'"))?,
            rest,
        ),
        None => (0, text),
    };

    let parts: Vec<&str> = clock.split(':').collect();
    let (hours, mins, secs) = match parts.as_slice() {
        [h, m, s] => (*h, *m, *s),
        [m, s] => ("0", *m, *s),
        _ => {
            return Err(format!(
                "Unexpected cpu time string '{text}' (must be in format HH:MM:SS)"
            ))
        }
    };

    let bad = |what: &str| format!("Cannot parse {what} of cpu time string '{text}'");
    let hours: u64 = hours.parse().map_err(|_| bad("hours"))?;
    let mins: u64 = mins.parse().map_err(|_| bad("minutes"))?;
    let secs: f64 = secs.parse().map_err(|_| bad("seconds"))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(bad("seconds"));
    }

    let whole = days * 86_400 + hours * 3600 + mins * 60;
    Ok(Duration::from_secs(whole) + Duration::from_secs_f64(secs))
}

/// Extract the CPU time from verbose tasklist CSV output (header row first).
pub fn parse_tasklist_cpu_time(output: &str) -> Result<Duration, String> {
    const CPU_TIME_HEADER: &str = "CPU Time";

    let body = output.trim_start();
    if !body.starts_with('"') {
        return Err(format!(
            "Invalid csv data (no rows). CSV response was: {output}"
        ));
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(body.as_bytes());
    let column = reader
        .headers()
        .map_err(|e| format!("Invalid csv header, error: {e}. CSV response was: {output}"))?
        .iter()
        .position(|h| h.trim() == CPU_TIME_HEADER)
        .ok_or_else(|| format!("Missing CPU Time column. CSV response was: {output}"))?;
    let row = reader
        .records()
        .next()
        .ok_or_else(|| format!("Invalid csv data (no rows). CSV response was: {output}"))?
        .map_err(|e| format!("Invalid csv row, error: {e}. CSV response was: {output}"))?;
    let cpu = row
        .get(column)
        .ok_or_else(|| format!("Missing CPU Time column. CSV response was: {output}"))?;
    parse_cpu_time(cpu)
        .map_err(|e| format!("Unable to determine CPU Time (from string '{cpu}'), error: {e}"))
}

/// Samples host and process-tree usage. Keeps one `System` so CPU
/// percentages are measured between consecutive ticks.
pub struct ResourceSampler {
    system: System,
    probe: Box<dyn CpuTimeProbe>,
}

impl ResourceSampler {
    pub fn new(os: OsFamily) -> Self {
        Self::with_probe(probe_for(os))
    }

    pub fn with_probe(probe: Box<dyn CpuTimeProbe>) -> Self {
        let mut system = System::new();
        // Prime the counters; the first real reading comes one tick later.
        system.refresh_cpu_usage();
        Self { system, probe }
    }

    /// Take one sample. Never fails: every measurement that cannot be taken
    /// is left out of the record and explained in the returned warnings.
    pub fn sample(&mut self, root_pid: u32) -> (ResourceUsageRecord, Vec<String>) {
        let mut warnings = Vec::new();

        self.system.refresh_processes();
        let process_tree = match ProcessTree::from_system(&self.system, root_pid) {
            Ok(tree) => Some(tree),
            Err(e) => {
                warnings.push(format!(
                    "Cannot get resource usage of pid {root_pid}, error: {e}"
                ));
                None
            }
        };

        let cpu_percentage = self.cpu_percentage();
        if cpu_percentage.is_none() {
            warnings.push("Cannot get CPU percentage".to_string());
        }

        self.system.refresh_memory();
        let (free_physical_memory_kb, free_virtual_memory_kb) = if self.system.total_memory() == 0
        {
            warnings.push("Cannot get free physical memory".to_string());
            warnings.push("Cannot get free virtual memory".to_string());
            (None, None)
        } else {
            let physical = self.system.available_memory() / 1024;
            (Some(physical), Some(physical + self.system.free_swap() / 1024))
        };

        let mut processes_resource_usage = Vec::new();
        if let Some(tree) = &process_tree {
            for pid in tree.flattened_pids() {
                match self.process_usage(pid) {
                    Ok(usage) => processes_resource_usage.push(usage),
                    Err(e) => warnings.push(format!("Cannot get CPU+Mem for pid {pid}, error: {e}")),
                }
            }
        }

        let record = ResourceUsageRecord {
            time: Utc::now(),
            cpu_percentage,
            free_physical_memory_kb,
            free_virtual_memory_kb,
            processes_resource_usage,
            process_tree,
        };
        (record, warnings)
    }

    fn cpu_percentage(&mut self) -> Option<u32> {
        self.system.refresh_cpu_usage();
        let cpus = self.system.cpus();
        if cpus.is_empty() {
            return None;
        }
        let total: f32 = cpus.iter().map(|cpu| cpu.cpu_usage()).sum();
        let avg = total / cpus.len() as f32;
        avg.is_finite().then(|| avg.round().clamp(0.0, 100.0) as u32)
    }

    fn process_usage(&self, pid: u32) -> Result<ProcessResourceUsage, String> {
        let process = self
            .system
            .process(Pid::from_u32(pid))
            .ok_or_else(|| format!("process {pid} has exited"))?;
        let memory_kb = process.memory() / 1024;
        let cpu = self.probe.cpu_time(pid)?;
        Ok(ProcessResourceUsage {
            pid,
            memory_kb,
            cpu_seconds: cpu.as_secs(),
        })
    }
}
