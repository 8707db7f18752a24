use crate::collectors::{apply_thresholds, join_notes, Metric, Threshold};
use crate::report::{CheckResult, CheckStatus};
use std::time::Duration;
use sysinfo::{CpuExt, DiskExt, System, SystemExt};

/// Facts read once at start-up; the installer flow needs uptime and boot time.
#[derive(Debug, Clone)]
pub struct HostFacts {
    pub host_name: Option<String>,
    pub os_name: Option<String>,
    pub os_version: Option<String>,
    pub kernel_version: Option<String>,
    pub uptime_seconds: u64,
    pub boot_time_unix: i64,
    pub cpu_brand: Option<String>,
    pub cpu_logical_count: usize,
    pub cpu_physical_count: Option<usize>,
    pub load_average: (f64, f64, f64),
    pub memory_total_bytes: u64,
    pub memory_used_bytes: u64,
    pub memory_available_bytes: u64,
    pub swap_total_bytes: u64,
    pub swap_used_bytes: u64,
    pub disks: Vec<DiskUsage>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiskUsage {
    pub mount: String,
    pub file_system: String,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl DiskUsage {
    pub fn used_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let used = self.total_bytes.saturating_sub(self.available_bytes);
        (used as f64 / self.total_bytes as f64) * 100.0
    }
}

pub fn collect_host_facts(system: &mut System) -> HostFacts {
    system.refresh_cpu();
    system.refresh_memory();
    system.refresh_disks_list();
    system.refresh_disks();

    let load = system.load_average();
    let disks = system
        .disks()
        .iter()
        .map(|d| DiskUsage {
            mount: d.mount_point().to_string_lossy().to_string(),
            file_system: String::from_utf8_lossy(d.file_system()).to_string(),
            total_bytes: d.total_space(),
            available_bytes: d.available_space(),
        })
        .filter(|d| d.total_bytes > 0)
        .collect();

    HostFacts {
        host_name: system.host_name(),
        os_name: system.name(),
        os_version: system.os_version(),
        kernel_version: system.kernel_version(),
        uptime_seconds: system.uptime(),
        boot_time_unix: system.boot_time() as i64,
        cpu_brand: system.cpus().first().map(|c| c.brand().trim().to_string()),
        cpu_logical_count: system.cpus().len(),
        cpu_physical_count: system.physical_core_count(),
        load_average: (load.one, load.five, load.fifteen),
        memory_total_bytes: system.total_memory(),
        memory_used_bytes: system.used_memory(),
        memory_available_bytes: system.available_memory(),
        swap_total_bytes: system.total_swap(),
        swap_used_bytes: system.used_swap(),
        disks,
    }
}

pub fn host_summary(facts: &HostFacts) -> CheckResult {
    let text = [
        format!("Host: {}", or_na(&facts.host_name)),
        format!(
            "OS: {} {}",
            or_na(&facts.os_name),
            facts.os_version.clone().unwrap_or_default()
        ),
        format!("Kernel: {}", or_na(&facts.kernel_version)),
        format!(
            "Uptime: {}",
            humantime::format_duration(Duration::from_secs(facts.uptime_seconds))
        ),
    ]
    .join("\n");
    native_result("Host summary", "sysinfo: host", text)
}

pub fn cpu_summary(facts: &HostFacts) -> CheckResult {
    let text = [
        format!("Model: {}", or_na(&facts.cpu_brand)),
        format!("Logical CPUs: {}", facts.cpu_logical_count),
        format!(
            "Physical cores: {}",
            facts
                .cpu_physical_count
                .map(|v| v.to_string())
                .unwrap_or_else(|| "n/a".to_string())
        ),
        format!(
            "Load average: {:.2} {:.2} {:.2}",
            facts.load_average.0, facts.load_average.1, facts.load_average.2
        ),
    ]
    .join("\n");
    if facts.cpu_logical_count == 0 {
        return CheckResult::new(
            "CPU summary",
            "sysinfo: cpu",
            text,
            CheckStatus::Partial,
            "No CPUs reported",
        );
    }
    native_result("CPU summary", "sysinfo: cpu", text)
}

pub fn memory_summary(facts: &HostFacts) -> CheckResult {
    let text = [
        format!("Total: {:.1} GiB", bytes_to_gib(facts.memory_total_bytes)),
        format!("Used: {:.1} GiB", bytes_to_gib(facts.memory_used_bytes)),
        format!(
            "Available: {:.1} GiB",
            bytes_to_gib(facts.memory_available_bytes)
        ),
        format!(
            "Swap: {:.1}/{:.1} GiB",
            bytes_to_gib(facts.swap_used_bytes),
            bytes_to_gib(facts.swap_total_bytes)
        ),
    ]
    .join("\n");
    if facts.memory_total_bytes == 0 {
        return CheckResult::new(
            "Memory summary",
            "sysinfo: memory",
            text,
            CheckStatus::Partial,
            "No memory reported",
        );
    }
    native_result("Memory summary", "sysinfo: memory", text)
}

/// Per-mount usage laid out like `df --output=target,pcent` so the same
/// free-space threshold applies to both.
pub fn disk_usage(facts: &HostFacts, min_free_percent: f64) -> CheckResult {
    let mut text = String::from("Mounted on Use%");
    for d in &facts.disks {
        text.push_str(&format!(
            "\n{} {:.0}% ({}, {:.1}/{:.1} GiB free)",
            d.mount,
            d.used_percent(),
            d.file_system,
            bytes_to_gib(d.available_bytes),
            bytes_to_gib(d.total_bytes),
        ));
    }

    let (status, note) = if facts.disks.is_empty() {
        (CheckStatus::Partial, "No output".to_string())
    } else {
        (CheckStatus::Pass, String::new())
    };
    let threshold = Threshold {
        metric: Metric::FreeDiskPercent,
        minimum: min_free_percent,
    };
    let (status, notes) = apply_thresholds(status, &disk_table(&facts.disks), &[threshold]);
    CheckResult::new(
        "Filesystem free space",
        "sysinfo: disks",
        text,
        status,
        join_notes(note, notes),
    )
}

fn disk_table(disks: &[DiskUsage]) -> String {
    let mut out = String::from("Mounted on Use%");
    for d in disks {
        out.push_str(&format!("\n{} {}%", d.mount, d.used_percent()));
    }
    out
}

fn native_result(name: &str, command: &str, text: String) -> CheckResult {
    CheckResult::new(name, command, text, CheckStatus::Pass, "")
}

fn or_na(value: &Option<String>) -> String {
    value.clone().unwrap_or_else(|| "n/a".to_string())
}

fn bytes_to_gib(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0 / 1024.0
}

#[cfg(test)]
mod tests {
    use super::*;

    const GIB: u64 = 1024 * 1024 * 1024;

    fn facts(disks: Vec<DiskUsage>) -> HostFacts {
        HostFacts {
            host_name: Some("node01".to_string()),
            os_name: Some("Ubuntu".to_string()),
            os_version: Some("22.04".to_string()),
            kernel_version: Some("6.5.0".to_string()),
            uptime_seconds: 3700,
            boot_time_unix: 1_700_000_000,
            cpu_brand: Some("AMD EPYC 9654".to_string()),
            cpu_logical_count: 192,
            cpu_physical_count: Some(96),
            load_average: (1.0, 0.5, 0.25),
            memory_total_bytes: 1024 * GIB,
            memory_used_bytes: 100 * GIB,
            memory_available_bytes: 900 * GIB,
            swap_total_bytes: 0,
            swap_used_bytes: 0,
            disks,
        }
    }

    fn disk(mount: &str, total_gib: u64, available_gib: u64) -> DiskUsage {
        DiskUsage {
            mount: mount.to_string(),
            file_system: "ext4".to_string(),
            total_bytes: total_gib * GIB,
            available_bytes: available_gib * GIB,
        }
    }

    #[test]
    fn summaries_pass_with_populated_facts() {
        let f = facts(vec![disk("/", 100, 50)]);
        let host = host_summary(&f);
        assert_eq!(host.status(), CheckStatus::Pass);
        assert!(host.result().contains("Uptime: 1h 1m 40s"));
        assert_eq!(cpu_summary(&f).status(), CheckStatus::Pass);
        assert!(memory_summary(&f).result().contains("Total: 1024.0 GiB"));
    }

    #[test]
    fn disk_threshold_uses_fullest_mount() {
        let f = facts(vec![disk("/", 100, 50), disk("/scratch", 100, 5)]);
        let result = disk_usage(&f, 10.0);
        assert_eq!(result.status(), CheckStatus::Fail);
        assert!(result.notes().contains("below minimum 10"));

        let result = disk_usage(&f, 0.0);
        assert_eq!(result.status(), CheckStatus::Pass);

        let result = disk_usage(&f, 4.0);
        assert_eq!(result.status(), CheckStatus::Pass);
    }

    #[test]
    fn missing_disks_are_partial() {
        let result = disk_usage(&facts(Vec::new()), 10.0);
        assert_eq!(result.status(), CheckStatus::Partial);
        assert_eq!(result.notes(), "No output");
    }

    #[test]
    fn collects_real_host_facts() {
        let mut system = System::new();
        let f = collect_host_facts(&mut system);
        assert!(f.cpu_logical_count > 0);
        assert!(f.memory_total_bytes > 0);
    }
}
