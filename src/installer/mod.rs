pub mod deps;
pub mod nccl;

use crate::collectors::{execute, record, run_check, CheckSpec, CommandOutcome};
use crate::config::InstallerConfig;
use crate::report::{Category, CheckResult, CheckStatus, Report};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

const STACK_CHECK: &str = "GPU driver stack";
const STATE_RECORD_CHECK: &str = "GPU state record";
const DRIVER_CHECK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstallState {
    NotChecked,
    Missing,
    InstallPending,
    Installed,
    RebootRequired,
    Recovered,
}

impl InstallState {
    pub fn label(self) -> &'static str {
        match self {
            InstallState::NotChecked => "NOT_CHECKED",
            InstallState::Missing => "MISSING",
            InstallState::InstallPending => "INSTALL_PENDING",
            InstallState::Installed => "INSTALLED",
            InstallState::RebootRequired => "REBOOT_REQUIRED",
            InstallState::Recovered => "RECOVERED",
        }
    }

    pub fn allows_benchmarks(self) -> bool {
        matches!(self, InstallState::Installed | InstallState::Recovered)
    }
}

/// Persisted between runs so the flow can resume after a reboot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRecord {
    pub state: InstallState,
    pub updated_at_unix: i64,
    #[serde(default)]
    pub driver_version: Option<String>,
    #[serde(default)]
    pub fabricmanager_version: Option<String>,
}

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("не удалось прочитать {path}: {source}")]
    Read { path: String, source: io::Error },
    #[error("не удалось записать {path}: {source}")]
    Write { path: String, source: io::Error },
    #[error("повреждённая запись состояния {path}: {source}")]
    Corrupt {
        path: String,
        source: serde_json::Error,
    },
    #[error("для установки пакетов нужны права root (или запустите с --noinstall)")]
    NotRoot,
    #[error("установка зависимостей отклонена: {}", .0.join(" "))]
    Declined(Vec<String>),
    #[error("команда перезагрузки {command} завершилась ошибкой: {reason}")]
    Reboot { command: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct StateStore {
    state_file: PathBuf,
    legacy_marker: PathBuf,
}

impl StateStore {
    pub fn new(state_file: impl Into<PathBuf>, legacy_marker: impl Into<PathBuf>) -> Self {
        Self {
            state_file: state_file.into(),
            legacy_marker: legacy_marker.into(),
        }
    }

    pub fn from_config(cfg: &InstallerConfig) -> Self {
        Self::new(&cfg.state_file, &cfg.legacy_marker)
    }

    pub fn load(&self) -> Result<Option<InstallRecord>, InstallError> {
        let path = self.state_file.display().to_string();
        let text = match fs::read_to_string(&self.state_file) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(InstallError::Read { path, source }),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| InstallError::Corrupt { path, source })
    }

    pub fn save(&self, record: &InstallRecord) -> Result<(), InstallError> {
        let path = self.state_file.display().to_string();
        if let Some(parent) = self.state_file.parent() {
            fs::create_dir_all(parent).map_err(|source| InstallError::Write {
                path: path.clone(),
                source,
            })?;
        }
        let body = serde_json::to_string_pretty(record).map_err(|source| InstallError::Corrupt {
            path: path.clone(),
            source,
        })?;
        fs::write(&self.state_file, body).map_err(|source| InstallError::Write { path, source })
    }

    pub fn marker_exists(&self) -> bool {
        self.legacy_marker.exists()
    }

    pub fn write_marker(&self, now_unix: i64) -> Result<(), InstallError> {
        let path = self.legacy_marker.display().to_string();
        if let Some(parent) = self.legacy_marker.parent() {
            fs::create_dir_all(parent).map_err(|source| InstallError::Write {
                path: path.clone(),
                source,
            })?;
        }
        fs::write(&self.legacy_marker, format!("{now_unix}\n"))
            .map_err(|source| InstallError::Write { path, source })
    }
}

/// Boot facts needed to tell whether a reboot happened since the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootInfo {
    pub uptime: Duration,
    pub boot_time_unix: i64,
}

/// Start state for this run. Pure; persisting a transition is the caller's job.
pub fn resolve_start_state(
    record: Option<&InstallRecord>,
    legacy_marker_exists: bool,
    boot: BootInfo,
    min_uptime: Duration,
) -> InstallState {
    let settled = boot.uptime >= min_uptime;
    match record {
        Some(r) => match r.state {
            InstallState::Installed | InstallState::Recovered => r.state,
            InstallState::RebootRequired => {
                if boot.boot_time_unix > r.updated_at_unix && settled {
                    InstallState::Recovered
                } else {
                    InstallState::RebootRequired
                }
            }
            // An interrupted install is retried from scratch.
            InstallState::NotChecked | InstallState::Missing | InstallState::InstallPending => {
                InstallState::NotChecked
            }
        },
        None if legacy_marker_exists => {
            if settled {
                InstallState::Recovered
            } else {
                InstallState::RebootRequired
            }
        }
        None => InstallState::NotChecked,
    }
}

pub trait Confirm {
    fn confirm(&mut self, question: &str) -> bool;
}

/// `--headless`: every question is answered with the given value.
pub struct AutoConfirm(pub bool);

impl Confirm for AutoConfirm {
    fn confirm(&mut self, question: &str) -> bool {
        info!(question, answer = self.0, "ответ без запроса (headless)");
        self.0
    }
}

pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&mut self, question: &str) -> bool {
        ask(&mut io::stdout(), &mut io::stdin().lock(), question)
    }
}

/// Only `y`/`yes` agree. A prompt that cannot be printed is still answered.
fn ask(out: &mut impl Write, input: &mut impl BufRead, question: &str) -> bool {
    if let Err(err) = write!(out, "{question} [y/N] ").and_then(|()| out.flush()) {
        debug!(error = %err, "вопрос не выведен");
    }
    let mut line = String::new();
    match input.read_line(&mut line) {
        Ok(_) => matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"),
        Err(err) => {
            warn!(error = %err, "не удалось прочитать ответ, считаем его отказом");
            false
        }
    }
}

/// Package manager command; `apt-get install -y` in production.
#[derive(Debug, Clone)]
pub struct PackageInstaller {
    argv_prefix: Vec<String>,
}

impl Default for PackageInstaller {
    fn default() -> Self {
        Self::with_command(&["apt-get", "install", "-y"])
    }
}

impl PackageInstaller {
    pub fn with_command<S: AsRef<str>>(argv_prefix: &[S]) -> Self {
        Self {
            argv_prefix: argv_prefix.iter().map(|a| a.as_ref().to_string()).collect(),
        }
    }

    pub async fn install(&self, category: Category, name: &str, packages: &[String]) -> CheckResult {
        let mut argv = self.argv_prefix.clone();
        argv.extend(packages.iter().cloned());
        info!(packages = %packages.join(" "), "установка пакетов");
        let result = run_check(&CheckSpec::new(category, name, argv.as_slice())).await;
        // apt prints nothing on some no-op installs; only the exit code matters here.
        if result.status() == CheckStatus::Partial {
            return CheckResult::new(
                result.name(),
                result.command(),
                result.result(),
                CheckStatus::Pass,
                "",
            );
        }
        result
    }
}

pub fn effective_uid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

pub fn running_as_root() -> bool {
    fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|s| effective_uid(&s))
        .is_some_and(|uid| uid == 0)
}

pub fn gpu_stack_packages(cfg: &InstallerConfig) -> Option<Vec<String>> {
    let driver = cfg.driver_version.as_deref()?;
    let mut packages = vec![format!("nvidia-driver-{driver}")];
    if let Some(fm) = cfg.fabricmanager_version.as_deref() {
        packages.push(format!("nvidia-fabricmanager-{fm}"));
    }
    packages.extend(cfg.extra_gpu_packages.iter().cloned());
    Some(packages)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuStackOutcome {
    pub state: InstallState,
    pub reboot_requested: bool,
}

pub struct GpuStackFlow<'a> {
    pub cfg: &'a InstallerConfig,
    pub store: &'a StateStore,
    pub installer: &'a PackageInstaller,
    pub allow_install: bool,
}

impl GpuStackFlow<'_> {
    /// Resolves the start state, installs when needed and appends one row
    /// to the GPU section describing where the stack ended up. State record
    /// failures are reported as rows; the resolved state still drives the run.
    pub async fn run(
        &self,
        report: &mut Report,
        confirm: &mut dyn Confirm,
        boot: BootInfo,
        min_uptime: Duration,
        now_unix: i64,
    ) -> GpuStackOutcome {
        let stored = match self.store.load() {
            Ok(stored) => stored,
            Err(err) => {
                warn!(error = %err, "запись состояния не читается, начинаем заново");
                None
            }
        };
        let state = resolve_start_state(stored.as_ref(), self.store.marker_exists(), boot, min_uptime);
        info!(state = state.label(), "состояние GPU-стека");

        match state {
            InstallState::Installed | InstallState::Recovered => {
                let recovered_now = stored.as_ref().map(|r| r.state) != Some(state);
                let notes = if recovered_now {
                    "Recovered after reboot"
                } else {
                    ""
                };
                self.row(report, state, CheckStatus::Pass, notes);
                if recovered_now {
                    self.persist(report, state, now_unix, stored.as_ref());
                }
                return GpuStackOutcome {
                    state,
                    reboot_requested: false,
                };
            }
            InstallState::RebootRequired => {
                self.row(
                    report,
                    state,
                    CheckStatus::Partial,
                    format!(
                        "Waiting for reboot; uptime {} (minimum {})",
                        humantime::format_duration(boot.uptime),
                        humantime::format_duration(min_uptime)
                    ),
                );
                return GpuStackOutcome {
                    state,
                    reboot_requested: false,
                };
            }
            InstallState::NotChecked | InstallState::Missing | InstallState::InstallPending => {}
        }

        if self.driver_present().await {
            info!("драйвер уже работает, установка не нужна");
            self.row(report, InstallState::Installed, CheckStatus::Pass, "Driver already present");
            self.persist(report, InstallState::Installed, now_unix, None);
            return GpuStackOutcome {
                state: InstallState::Installed,
                reboot_requested: false,
            };
        }

        info!("GPU-стек не установлен");
        let missing = GpuStackOutcome {
            state: InstallState::Missing,
            reboot_requested: false,
        };
        if !self.allow_install {
            warn!("установка GPU-стека отключена (--noinstall)");
            self.row(report, InstallState::Missing, CheckStatus::Fail, "Not installed; installation disabled");
            return missing;
        }
        let Some(packages) = gpu_stack_packages(self.cfg) else {
            self.row(report, InstallState::Missing, CheckStatus::Fail, "NVIDIA_DRIVER_VERSION is not set");
            return missing;
        };
        if !confirm.confirm(&format!("Установить GPU-стек ({})?", packages.join(" "))) {
            self.row(report, InstallState::Missing, CheckStatus::Fail, "Installation declined");
            return missing;
        }

        // no install without a record to resume from
        if !self.persist(report, InstallState::InstallPending, now_unix, None) {
            self.row(report, InstallState::Missing, CheckStatus::Fail, "Installation skipped: state record is not writable");
            return missing;
        }
        let result = self
            .installer
            .install(Category::Gpu, "GPU driver stack install", &packages)
            .await;
        if result.status() == CheckStatus::Fail {
            record(report, Category::Gpu, result);
            self.persist(report, InstallState::Missing, now_unix, None);
            return missing;
        }
        record(report, Category::Gpu, result);

        self.row(report, InstallState::RebootRequired, CheckStatus::Partial, "Installed; reboot required");
        self.persist(report, InstallState::RebootRequired, now_unix, None);
        if let Err(err) = self.store.write_marker(now_unix) {
            self.store_failure(report, &err);
        }
        GpuStackOutcome {
            state: InstallState::RebootRequired,
            reboot_requested: true,
        }
    }

    async fn driver_present(&self) -> bool {
        match execute(&self.cfg.driver_check, Some(DRIVER_CHECK_TIMEOUT)).await {
            CommandOutcome::Exited { code: 0, .. } => true,
            other => {
                debug!(command = %self.cfg.driver_check.join(" "), outcome = ?other, "драйвер не отвечает");
                false
            }
        }
    }

    fn persist(
        &self,
        report: &mut Report,
        state: InstallState,
        now_unix: i64,
        previous: Option<&InstallRecord>,
    ) -> bool {
        let (driver_version, fabricmanager_version) = match previous {
            Some(r) => (r.driver_version.clone(), r.fabricmanager_version.clone()),
            None => (
                self.cfg.driver_version.clone(),
                self.cfg.fabricmanager_version.clone(),
            ),
        };
        let saved = self.store.save(&InstallRecord {
            state,
            updated_at_unix: now_unix,
            driver_version,
            fabricmanager_version,
        });
        match saved {
            Ok(()) => true,
            Err(err) => {
                self.store_failure(report, &err);
                false
            }
        }
    }

    fn store_failure(&self, report: &mut Report, err: &InstallError) {
        warn!(error = %err, "состояние GPU-стека не сохранено");
        let result = CheckResult::new(
            STATE_RECORD_CHECK,
            format!("write {}", self.store.state_file.display()),
            "",
            CheckStatus::Fail,
            format!("State not saved: {err}"),
        );
        record(report, Category::Gpu, result);
    }

    fn row(&self, report: &mut Report, state: InstallState, status: CheckStatus, notes: impl Into<String>) {
        let result = CheckResult::new(
            STACK_CHECK,
            format!("state record {}", self.store.state_file.display()),
            format!("State: {}", state.label()),
            status,
            notes,
        );
        record(report, Category::Gpu, result);
    }
}

/// Runs the configured reboot command. Called only after the report is on disk.
pub async fn request_reboot(command: &[String]) -> Result<(), InstallError> {
    let joined = command.join(" ");
    warn!(command = %joined, "перезагрузка узла");
    match execute(command, None).await {
        CommandOutcome::Exited { code: 0, .. } => Ok(()),
        CommandOutcome::Exited { code, output } => Err(InstallError::Reboot {
            command: joined,
            reason: format!("exit code {code}: {output}"),
        }),
        other => Err(InstallError::Reboot {
            command: joined,
            reason: format!("{other:?}"),
        }),
    }
}

pub fn unix_now() -> i64 {
    chrono::Utc::now().timestamp()
}
