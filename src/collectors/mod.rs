pub mod catalog;
pub mod gpu;
pub mod network;
pub mod parse;
pub mod system;

use crate::report::{Category, CheckResult, CheckStatus, Report};
use std::io::ErrorKind;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    EthtoolSpeedMbps,
    InfinibandRateGbps,
    SpeedtestDownloadMbps,
    SpeedtestUploadMbps,
    NcclBusBandwidthGbps,
    FreeDiskPercent,
}

impl Metric {
    pub fn label(self) -> &'static str {
        match self {
            Metric::EthtoolSpeedMbps => "link speed (Mb/s)",
            Metric::InfinibandRateGbps => "IB rate (Gb/s)",
            Metric::SpeedtestDownloadMbps => "download (Mbit/s)",
            Metric::SpeedtestUploadMbps => "upload (Mbit/s)",
            Metric::NcclBusBandwidthGbps => "NCCL bus bandwidth (GB/s)",
            Metric::FreeDiskPercent => "free disk (%)",
        }
    }

    pub fn extract(self, output: &str) -> Option<f64> {
        match self {
            Metric::EthtoolSpeedMbps => parse::ethtool_speed_mbps(output),
            Metric::InfinibandRateGbps => parse::min_ib_rate_gbps(output),
            Metric::SpeedtestDownloadMbps => parse::speedtest_simple(output, "Download"),
            Metric::SpeedtestUploadMbps => parse::speedtest_simple(output, "Upload"),
            Metric::NcclBusBandwidthGbps => parse::nccl_avg_busbw(output),
            Metric::FreeDiskPercent => parse::df_min_free_percent(output),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Threshold {
    pub metric: Metric,
    pub minimum: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdOutcome {
    Disabled,
    Met(f64),
    Below(f64),
    Unparsed,
}

impl Threshold {
    pub fn evaluate(&self, value: Option<f64>) -> ThresholdOutcome {
        if self.minimum <= 0.0 {
            return ThresholdOutcome::Disabled;
        }
        match value {
            Some(v) if v < self.minimum => ThresholdOutcome::Below(v),
            Some(v) => ThresholdOutcome::Met(v),
            None => ThresholdOutcome::Unparsed,
        }
    }
}

/// Downgrades a PASS according to the thresholds. FAIL and PARTIAL stay as they are.
pub fn apply_thresholds(
    status: CheckStatus,
    output: &str,
    thresholds: &[Threshold],
) -> (CheckStatus, Vec<String>) {
    if status != CheckStatus::Pass {
        return (status, Vec::new());
    }

    let mut status = status;
    let mut notes = Vec::new();
    for threshold in thresholds {
        let metric = threshold.metric;
        match threshold.evaluate(metric.extract(output)) {
            ThresholdOutcome::Disabled => {}
            ThresholdOutcome::Met(v) => {
                debug!(metric = metric.label(), value = v, minimum = threshold.minimum, "порог выполнен");
            }
            ThresholdOutcome::Below(v) => {
                status = CheckStatus::Fail;
                notes.push(format!(
                    "{} {} below minimum {}",
                    metric.label(),
                    v,
                    threshold.minimum
                ));
            }
            ThresholdOutcome::Unparsed => {
                if status == CheckStatus::Pass {
                    status = CheckStatus::Partial;
                }
                notes.push(format!("could not parse {}", metric.label()));
            }
        }
    }
    (status, notes)
}

pub fn classify(exit_code: i32, output: &str) -> (CheckStatus, String) {
    if exit_code != 0 {
        (CheckStatus::Fail, format!("Exit code {exit_code}"))
    } else if output.trim().is_empty() {
        (CheckStatus::Partial, "No output".to_string())
    } else {
        (CheckStatus::Pass, String::new())
    }
}

#[derive(Debug, Clone)]
pub struct CheckSpec {
    pub category: Category,
    pub name: String,
    pub argv: Vec<String>,
    pub filter: Option<String>,
    pub thresholds: Vec<Threshold>,
    pub timeout: Option<Duration>,
}

impl CheckSpec {
    pub fn new<S: AsRef<str>>(category: Category, name: impl Into<String>, argv: &[S]) -> Self {
        Self {
            category,
            name: name.into(),
            argv: argv.iter().map(|a| a.as_ref().to_string()).collect(),
            filter: None,
            thresholds: Vec::new(),
            timeout: None,
        }
    }

    /// Keeps only output lines containing `needle` (case-insensitive).
    pub fn filter(mut self, needle: impl Into<String>) -> Self {
        self.filter = Some(needle.into());
        self
    }

    pub fn threshold(mut self, metric: Metric, minimum: f64) -> Self {
        self.thresholds.push(Threshold { metric, minimum });
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> Option<&str> {
        self.argv.first().map(String::as_str)
    }

    pub fn command_line(&self) -> String {
        display_command(&self.argv)
    }
}

pub fn display_command(argv: &[String]) -> String {
    argv.iter()
        .map(|a| {
            if a.is_empty() || a.contains(char::is_whitespace) {
                format!("'{a}'")
            } else {
                a.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Exited { code: i32, output: String },
    Signaled { output: String },
    NotFound,
    SpawnFailed(String),
    TimedOut(Duration),
}

/// Runs argv without a shell; stdout then stderr, trailing whitespace trimmed.
pub async fn execute(argv: &[String], timeout: Option<Duration>) -> CommandOutcome {
    let Some((program, args)) = argv.split_first() else {
        return CommandOutcome::SpawnFailed("empty command".to_string());
    };

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output();

    let result = match timeout {
        Some(limit) => match time::timeout(limit, child).await {
            Ok(result) => result,
            Err(_elapsed) => return CommandOutcome::TimedOut(limit),
        },
        None => child.await,
    };

    let output = match result {
        Ok(output) => output,
        Err(err) if err.kind() == ErrorKind::NotFound => return CommandOutcome::NotFound,
        Err(err) => return CommandOutcome::SpawnFailed(err.to_string()),
    };

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        if !text.is_empty() && !text.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(&stderr);
    }
    let text = text.trim_end().to_string();

    match output.status.code() {
        Some(code) => CommandOutcome::Exited { code, output: text },
        None => CommandOutcome::Signaled { output: text },
    }
}

pub async fn run_check(spec: &CheckSpec) -> CheckResult {
    let outcome = execute(&spec.argv, spec.timeout).await;
    debug!(check = %spec.name, outcome = ?outcome, "команда завершена");

    let (output, status, note) = match outcome {
        CommandOutcome::Exited { code, output } => {
            let output = apply_filter(output, spec.filter.as_deref());
            let (status, note) = classify(code, &output);
            (output, status, note)
        }
        CommandOutcome::Signaled { output } => {
            (output, CheckStatus::Fail, "Terminated by signal".to_string())
        }
        CommandOutcome::NotFound => (
            String::new(),
            CheckStatus::Fail,
            format!("Command not found: {}", spec.program().unwrap_or_default()),
        ),
        CommandOutcome::SpawnFailed(err) => {
            (String::new(), CheckStatus::Fail, format!("Failed to start: {err}"))
        }
        CommandOutcome::TimedOut(limit) => (
            String::new(),
            CheckStatus::Fail,
            format!("Timed out after {}", humantime::format_duration(limit)),
        ),
    };

    let (status, threshold_notes) = apply_thresholds(status, &output, &spec.thresholds);
    let notes = join_notes(note, threshold_notes);
    CheckResult::new(&spec.name, spec.command_line(), output, status, notes)
}

/// Runs the check, logs one console line and appends the row.
pub async fn run_into(report: &mut Report, spec: &CheckSpec) -> CheckStatus {
    let result = run_check(spec).await;
    record(report, spec.category, result)
}

pub fn record(report: &mut Report, category: Category, result: CheckResult) -> CheckStatus {
    let status = result.status();
    match status {
        CheckStatus::Pass => info!(
            category = category.title(),
            check = %result.name(),
            status = status.label(),
            "проверка выполнена"
        ),
        CheckStatus::Fail | CheckStatus::Partial => warn!(
            category = category.title(),
            check = %result.name(),
            status = status.label(),
            notes = %result.notes(),
            "проверка выполнена с замечаниями"
        ),
    }
    report.push(category, result);
    status
}

fn apply_filter(output: String, needle: Option<&str>) -> String {
    let Some(needle) = needle else {
        return output;
    };
    let needle = needle.to_lowercase();
    output
        .lines()
        .filter(|line| line.to_lowercase().contains(&needle))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn join_notes(first: String, rest: Vec<String>) -> String {
    std::iter::once(first)
        .chain(rest)
        .filter(|n| !n.is_empty())
        .collect::<Vec<_>>()
        .join("; ")
}
