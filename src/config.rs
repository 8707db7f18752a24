use crate::report::Category;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_output_dir")]
    pub output_dir: String,
    #[serde(default)]
    pub checks: CheckSwitches,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default = "default_services")]
    pub services: Vec<String>,
    #[serde(default = "default_packages")]
    pub packages: Vec<String>,
    #[serde(default)]
    pub installer: InstallerConfig,
    #[serde(default)]
    pub benchmarks: BenchmarkConfig,
}

/// Per-category opt-in switches. Everything is off unless asked for.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CheckSwitches {
    #[serde(default)]
    pub run_system_check: bool,
    #[serde(default)]
    pub run_cpu_check: bool,
    #[serde(default)]
    pub run_ram_check: bool,
    #[serde(default)]
    pub run_storage_check: bool,
    #[serde(default)]
    pub run_gpu_check: bool,
    #[serde(default)]
    pub run_ethernet_check: bool,
    #[serde(default)]
    pub run_infiniband_check: bool,
    #[serde(default)]
    pub run_security_check: bool,
    #[serde(default)]
    pub run_network_speed_check: bool,
    #[serde(default)]
    pub run_software_check: bool,
    #[serde(default)]
    pub run_services_check: bool,
    #[serde(default)]
    pub run_benchmarks_check: bool,
}

/// Minimum values; 0 disables the corresponding comparison.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Thresholds {
    #[serde(default = "default_min_link_speed_mbps")]
    pub min_link_speed_mbps: f64,
    #[serde(default)]
    pub min_ib_rate_gbps: f64,
    #[serde(default = "default_min_download_mbps")]
    pub min_download_mbps: f64,
    #[serde(default = "default_min_upload_mbps")]
    pub min_upload_mbps: f64,
    #[serde(default = "default_min_free_disk_percent")]
    pub min_free_disk_percent: f64,
    #[serde(default)]
    pub min_nccl_busbw_gbps: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NetworkConfig {
    /// Interface name prefixes excluded from ethernet link checks.
    #[serde(default = "default_skip_interface_prefixes")]
    pub skip_interface_prefixes: Vec<String>,
    #[serde(default)]
    pub speedtest_server_nearby: Option<String>,
    #[serde(default)]
    pub speedtest_server_eu: Option<String>,
    #[serde(default = "default_ping_target")]
    pub ping_target: String,
    #[serde(default = "default_http_speedtest")]
    pub http_speedtest: bool,
    #[serde(default = "default_tcp_checks")]
    pub tcp_checks: Vec<TcpCheckConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TcpCheckConfig {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InstallerConfig {
    #[serde(default = "default_state_file")]
    pub state_file: String,
    #[serde(default = "default_legacy_marker")]
    pub legacy_marker: String,
    #[serde(default = "default_min_uptime")]
    pub min_uptime: String,
    #[serde(default)]
    pub driver_version: Option<String>,
    #[serde(default)]
    pub fabricmanager_version: Option<String>,
    #[serde(default = "default_extra_gpu_packages")]
    pub extra_gpu_packages: Vec<String>,
    #[serde(default = "default_reboot_command")]
    pub reboot_command: Vec<String>,
    /// Exits 0 when a working driver is already present.
    #[serde(default = "default_driver_check")]
    pub driver_check: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BenchmarkConfig {
    #[serde(default = "default_nccl_tests_dir")]
    pub nccl_tests_dir: String,
    #[serde(default = "default_nccl_tests_repo")]
    pub nccl_tests_repo: String,
    #[serde(default = "default_cuda_home")]
    pub cuda_home: String,
    #[serde(default = "default_nccl_max_bytes")]
    pub nccl_max_bytes: String,
    #[serde(default)]
    pub gpu_count: Option<u32>,
    #[serde(default = "default_gpu_burn_image")]
    pub gpu_burn_image: String,
    #[serde(default = "default_gpu_burn_seconds")]
    pub gpu_burn_seconds: u64,
    #[serde(default = "default_cuda_image")]
    pub cuda_image: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: default_output_dir(),
            checks: CheckSwitches::default(),
            thresholds: Thresholds::default(),
            network: NetworkConfig::default(),
            services: default_services(),
            packages: default_packages(),
            installer: InstallerConfig::default(),
            benchmarks: BenchmarkConfig::default(),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            min_link_speed_mbps: default_min_link_speed_mbps(),
            min_ib_rate_gbps: 0.0,
            min_download_mbps: default_min_download_mbps(),
            min_upload_mbps: default_min_upload_mbps(),
            min_free_disk_percent: default_min_free_disk_percent(),
            min_nccl_busbw_gbps: 0.0,
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            skip_interface_prefixes: default_skip_interface_prefixes(),
            speedtest_server_nearby: None,
            speedtest_server_eu: None,
            ping_target: default_ping_target(),
            http_speedtest: default_http_speedtest(),
            tcp_checks: default_tcp_checks(),
        }
    }
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            state_file: default_state_file(),
            legacy_marker: default_legacy_marker(),
            min_uptime: default_min_uptime(),
            driver_version: None,
            fabricmanager_version: None,
            extra_gpu_packages: default_extra_gpu_packages(),
            reboot_command: default_reboot_command(),
            driver_check: default_driver_check(),
        }
    }
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            nccl_tests_dir: default_nccl_tests_dir(),
            nccl_tests_repo: default_nccl_tests_repo(),
            cuda_home: default_cuda_home(),
            nccl_max_bytes: default_nccl_max_bytes(),
            gpu_count: None,
            gpu_burn_image: default_gpu_burn_image(),
            gpu_burn_seconds: default_gpu_burn_seconds(),
            cuda_image: default_cuda_image(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("переменная окружения {name}='{value}' не является числом")]
    Env { name: String, value: String },
    #[error("неизвестный параметр '{0}': ожидается run_<категория>_check=true|false")]
    ExtraVar(String),
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg: Config = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |name: &str| -> Result<Option<f64>, ConfigError> {
            match lookup(name) {
                Some(raw) if !raw.trim().is_empty() => raw
                    .trim()
                    .parse::<f64>()
                    .map(Some)
                    .map_err(|_| ConfigError::Env {
                        name: name.to_string(),
                        value: raw,
                    }),
                _ => Ok(None),
            }
        };
        let text = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(v) = number("MIN_LINK_SPEED_MBPS")? {
            self.thresholds.min_link_speed_mbps = v;
        }
        if let Some(v) = number("MIN_IB_RATE_GBPS")? {
            self.thresholds.min_ib_rate_gbps = v;
        }
        if let Some(v) = number("MIN_DOWNLOAD_MBPS")? {
            self.thresholds.min_download_mbps = v;
        }
        if let Some(v) = number("MIN_UPLOAD_MBPS")? {
            self.thresholds.min_upload_mbps = v;
        }
        if let Some(v) = number("MIN_FREE_DISK_PERCENT")? {
            self.thresholds.min_free_disk_percent = v;
        }
        if let Some(v) = number("MIN_NCCL_BUSBW_GBPS")? {
            self.thresholds.min_nccl_busbw_gbps = v;
        }
        if let Some(v) = text("NVIDIA_DRIVER_VERSION") {
            self.installer.driver_version = Some(v);
        }
        if let Some(v) = text("NVIDIA_FABRICMANAGER_VERSION") {
            self.installer.fabricmanager_version = Some(v);
        }
        if let Some(v) = text("SPEEDTEST_SERVER_NEARBY") {
            self.network.speedtest_server_nearby = Some(v);
        }
        if let Some(v) = text("SPEEDTEST_SERVER_EU") {
            self.network.speedtest_server_eu = Some(v);
        }
        Ok(())
    }

    /// Ansible-style `run_<category>_check=true` assignment.
    pub fn apply_extra_var(&mut self, assignment: &str) -> Result<(), ConfigError> {
        let (key, value) = assignment
            .split_once('=')
            .ok_or_else(|| ConfigError::ExtraVar(assignment.to_string()))?;
        let category = Category::from_flag_key(key.trim())
            .ok_or_else(|| ConfigError::ExtraVar(assignment.to_string()))?;
        let enabled = match value.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" | "on" => true,
            "false" | "no" | "0" | "off" => false,
            _ => return Err(ConfigError::ExtraVar(assignment.to_string())),
        };
        self.checks.set(category, enabled);
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.output_dir.trim().is_empty() {
            return Err(ConfigError::Validation(
                "поле output_dir не должно быть пустым".to_string(),
            ));
        }
        validate_thresholds(&self.thresholds)?;
        validate_tcp_checks(&self.network.tcp_checks)?;
        validate_installer(&self.installer)?;
        validate_benchmarks(&self.benchmarks)?;
        Ok(())
    }

    pub fn min_uptime(&self) -> Result<Duration, ConfigError> {
        humantime::parse_duration(self.installer.min_uptime.trim()).map_err(|err| {
            ConfigError::Validation(format!(
                "installer.min_uptime '{}' не является длительностью: {err}",
                self.installer.min_uptime
            ))
        })
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

impl CheckSwitches {
    pub fn enabled(&self, category: Category) -> bool {
        match category {
            Category::System => self.run_system_check,
            Category::Cpu => self.run_cpu_check,
            Category::Ram => self.run_ram_check,
            Category::Storage => self.run_storage_check,
            Category::Gpu => self.run_gpu_check,
            Category::Ethernet => self.run_ethernet_check,
            Category::Infiniband => self.run_infiniband_check,
            Category::Security => self.run_security_check,
            Category::NetworkSpeed => self.run_network_speed_check,
            Category::Software => self.run_software_check,
            Category::Services => self.run_services_check,
            Category::Benchmarks => self.run_benchmarks_check,
        }
    }

    pub fn set(&mut self, category: Category, enabled: bool) {
        let slot = match category {
            Category::System => &mut self.run_system_check,
            Category::Cpu => &mut self.run_cpu_check,
            Category::Ram => &mut self.run_ram_check,
            Category::Storage => &mut self.run_storage_check,
            Category::Gpu => &mut self.run_gpu_check,
            Category::Ethernet => &mut self.run_ethernet_check,
            Category::Infiniband => &mut self.run_infiniband_check,
            Category::Security => &mut self.run_security_check,
            Category::NetworkSpeed => &mut self.run_network_speed_check,
            Category::Software => &mut self.run_software_check,
            Category::Services => &mut self.run_services_check,
            Category::Benchmarks => &mut self.run_benchmarks_check,
        };
        *slot = enabled;
    }

    pub fn enable_all(&mut self) {
        for category in Category::ALL {
            self.set(category, true);
        }
    }

    pub fn enabled_categories(&self) -> Vec<Category> {
        Category::ALL
            .into_iter()
            .filter(|c| self.enabled(*c))
            .collect()
    }
}

fn validate_thresholds(t: &Thresholds) -> Result<(), ConfigError> {
    let values = [
        ("thresholds.min_link_speed_mbps", t.min_link_speed_mbps),
        ("thresholds.min_ib_rate_gbps", t.min_ib_rate_gbps),
        ("thresholds.min_download_mbps", t.min_download_mbps),
        ("thresholds.min_upload_mbps", t.min_upload_mbps),
        ("thresholds.min_free_disk_percent", t.min_free_disk_percent),
        ("thresholds.min_nccl_busbw_gbps", t.min_nccl_busbw_gbps),
    ];
    for (name, value) in values {
        if !value.is_finite() || value < 0.0 {
            return Err(ConfigError::Validation(format!(
                "{name} должно быть >= 0"
            )));
        }
    }
    if t.min_free_disk_percent > 100.0 {
        return Err(ConfigError::Validation(
            "thresholds.min_free_disk_percent должно быть в диапазоне 0..100".to_string(),
        ));
    }
    Ok(())
}

fn validate_tcp_checks(checks: &[TcpCheckConfig]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for check in checks {
        if check.name.trim().is_empty() {
            return Err(ConfigError::Validation(
                "network.tcp_checks[*].name не должен быть пустым".to_string(),
            ));
        }
        if !names.insert(check.name.clone()) {
            return Err(ConfigError::Validation(format!(
                "имя TCP-проверки '{}' должно быть уникальным",
                check.name
            )));
        }
        if check.host.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "tcp_checks '{}' host не должен быть пустым",
                check.name
            )));
        }
        if check.port == 0 {
            return Err(ConfigError::Validation(format!(
                "tcp_checks '{}' port должен быть в диапазоне 1..65535",
                check.name
            )));
        }
        if check.timeout_ms == 0 {
            return Err(ConfigError::Validation(format!(
                "tcp_checks '{}' timeout_ms должен быть > 0",
                check.name
            )));
        }
    }
    Ok(())
}

fn validate_installer(cfg: &InstallerConfig) -> Result<(), ConfigError> {
    if cfg.state_file.trim().is_empty() || cfg.legacy_marker.trim().is_empty() {
        return Err(ConfigError::Validation(
            "installer.state_file и installer.legacy_marker обязательны".to_string(),
        ));
    }
    if cfg.reboot_command.is_empty() {
        return Err(ConfigError::Validation(
            "installer.reboot_command не должен быть пустым".to_string(),
        ));
    }
    if cfg.driver_check.is_empty() {
        return Err(ConfigError::Validation(
            "installer.driver_check не должен быть пустым".to_string(),
        ));
    }
    if humantime::parse_duration(cfg.min_uptime.trim()).is_err() {
        return Err(ConfigError::Validation(format!(
            "installer.min_uptime '{}' не является длительностью",
            cfg.min_uptime
        )));
    }
    Ok(())
}

fn validate_benchmarks(cfg: &BenchmarkConfig) -> Result<(), ConfigError> {
    if cfg.gpu_burn_seconds == 0 {
        return Err(ConfigError::Validation(
            "benchmarks.gpu_burn_seconds должно быть > 0".to_string(),
        ));
    }
    if cfg.gpu_count == Some(0) {
        return Err(ConfigError::Validation(
            "benchmarks.gpu_count должно быть >= 1".to_string(),
        ));
    }
    Ok(())
}

fn default_output_dir() -> String {
    "reports".to_string()
}

fn default_services() -> Vec<String> {
    ["ssh", "docker", "nvidia-persistenced", "nvidia-fabricmanager"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_packages() -> Vec<String> {
    [
        "docker-ce",
        "nvidia-container-toolkit",
        "cuda-toolkit",
        "infiniband-diags",
        "rdma-core",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

const fn default_min_link_speed_mbps() -> f64 {
    10_000.0
}

const fn default_min_download_mbps() -> f64 {
    100.0
}

const fn default_min_upload_mbps() -> f64 {
    100.0
}

const fn default_min_free_disk_percent() -> f64 {
    10.0
}

fn default_skip_interface_prefixes() -> Vec<String> {
    ["lo", "docker", "veth", "br-", "virbr", "ib"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_ping_target() -> String {
    "8.8.8.8".to_string()
}

const fn default_http_speedtest() -> bool {
    true
}

fn default_tcp_checks() -> Vec<TcpCheckConfig> {
    vec![TcpCheckConfig {
        name: "ssh".to_string(),
        host: "127.0.0.1".to_string(),
        port: 22,
        timeout_ms: 3000,
    }]
}

fn default_state_file() -> String {
    "/var/lib/nodeaudit/gpu_install_state.json".to_string()
}

fn default_legacy_marker() -> String {
    "/etc/ansible_gpu_install_complete".to_string()
}

fn default_min_uptime() -> String {
    "5m".to_string()
}

fn default_extra_gpu_packages() -> Vec<String> {
    ["cuda-toolkit", "nvidia-container-toolkit"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_reboot_command() -> Vec<String> {
    vec!["systemctl".to_string(), "reboot".to_string()]
}

fn default_driver_check() -> Vec<String> {
    vec!["nvidia-smi".to_string()]
}

fn default_nccl_tests_dir() -> String {
    "/opt/nccl-tests".to_string()
}

fn default_nccl_tests_repo() -> String {
    "https://github.com/NVIDIA/nccl-tests.git".to_string()
}

fn default_cuda_home() -> String {
    "/usr/local/cuda".to_string()
}

fn default_nccl_max_bytes() -> String {
    "8G".to_string()
}

fn default_gpu_burn_image() -> String {
    "oguzpastirmaci/gpu-burn:latest".to_string()
}

const fn default_gpu_burn_seconds() -> u64 {
    60
}

fn default_cuda_image() -> String {
    "nvidia/cuda:12.4.1-base-ubuntu22.04".to_string()
}
