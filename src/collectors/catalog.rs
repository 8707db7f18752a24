use crate::collectors::{CheckSpec, Metric};
use crate::config::Config;
use crate::report::Category;

#[derive(Debug, Clone, Default)]
pub struct CatalogContext {
    pub ethernet_interfaces: Vec<String>,
    pub speedtest_nearby: Option<String>,
}

/// Subprocess checks for one category, in report order. Native probes
/// (sysinfo, TCP, HTTP) and benchmarks are added by the orchestrator.
pub fn command_checks(category: Category, cfg: &Config, ctx: &CatalogContext) -> Vec<CheckSpec> {
    let c = category;
    match category {
        Category::System => vec![
            CheckSpec::new(c, "Kernel", &["uname", "-a"]),
            CheckSpec::new(c, "OS release", &["cat", "/etc/os-release"]).filter("PRETTY_NAME"),
            CheckSpec::new(c, "Host identity", &["hostnamectl"]),
            CheckSpec::new(c, "Time synchronisation", &["timedatectl", "show"]).filter("NTPSynchronized"),
        ],
        Category::Cpu => vec![
            CheckSpec::new(c, "CPU topology", &["lscpu"]),
            CheckSpec::new(c, "NUMA layout", &["numactl", "--hardware"]),
            CheckSpec::new(
                c,
                "CPU frequency governor",
                &["cat", "/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor"],
            ),
        ],
        Category::Ram => vec![
            CheckSpec::new(c, "Memory usage", &["free", "-h"]),
            CheckSpec::new(c, "DIMM sizes", &["dmidecode", "-t", "memory"]).filter("Size:"),
            CheckSpec::new(c, "Huge pages", &["cat", "/proc/meminfo"]).filter("HugePages_"),
        ],
        Category::Storage => vec![
            CheckSpec::new(
                c,
                "Block devices",
                &["lsblk", "-o", "NAME,SIZE,TYPE,MOUNTPOINT,MODEL"],
            ),
            CheckSpec::new(
                c,
                "Disk usage",
                &[
                    "df",
                    "--output=target,pcent",
                    "-x",
                    "tmpfs",
                    "-x",
                    "devtmpfs",
                    "-x",
                    "overlay",
                    "-x",
                    "squashfs",
                ],
            )
            .threshold(Metric::FreeDiskPercent, cfg.thresholds.min_free_disk_percent),
            CheckSpec::new(c, "NVMe devices", &["nvme", "list"]),
        ],
        Category::Gpu => vec![
            CheckSpec::new(c, "nvidia-smi", &["nvidia-smi"]),
            CheckSpec::new(c, "GPU topology", &["nvidia-smi", "topo", "-m"]),
            CheckSpec::new(
                c,
                "Persistence mode",
                &[
                    "nvidia-smi",
                    "--query-gpu=index,persistence_mode",
                    "--format=csv,noheader",
                ],
            ),
            CheckSpec::new(c, "NVLink status", &["nvidia-smi", "nvlink", "--status"]),
            CheckSpec::new(c, "CUDA compiler", &["nvcc", "--version"]).filter("release"),
            CheckSpec::new(
                c,
                "Fabric manager",
                &["systemctl", "is-active", "nvidia-fabricmanager"],
            ),
        ],
        Category::Ethernet => {
            let mut specs = vec![
                CheckSpec::new(c, "Link state", &["ip", "-brief", "link"]),
                CheckSpec::new(c, "Addresses", &["ip", "-brief", "addr"]),
            ];
            specs.extend(ctx.ethernet_interfaces.iter().map(|iface| {
                CheckSpec::new(c, format!("Link speed {iface}"), &["ethtool", iface.as_str()])
                    .threshold(Metric::EthtoolSpeedMbps, cfg.thresholds.min_link_speed_mbps)
            }));
            specs
        }
        Category::Infiniband => vec![
            CheckSpec::new(c, "Port status", &["ibstatus"])
                .threshold(Metric::InfinibandRateGbps, cfg.thresholds.min_ib_rate_gbps),
            CheckSpec::new(c, "HCA details", &["ibstat"]),
            CheckSpec::new(c, "Verbs devices", &["ibv_devinfo", "-l"]),
            CheckSpec::new(c, "RDMA links", &["rdma", "link", "show"]),
        ],
        Category::Security => vec![
            CheckSpec::new(c, "Firewall", &["ufw", "status"]),
            CheckSpec::new(c, "SSH root login", &["sshd", "-T"]).filter("permitrootlogin"),
            CheckSpec::new(c, "SSH password auth", &["sshd", "-T"]).filter("passwordauthentication"),
            CheckSpec::new(c, "AppArmor", &["aa-enabled"]),
            CheckSpec::new(c, "Fail2ban", &["systemctl", "is-active", "fail2ban"]),
            CheckSpec::new(
                c,
                "Unattended upgrades",
                &["systemctl", "is-enabled", "unattended-upgrades"],
            ),
        ],
        Category::NetworkSpeed => {
            let mut specs = vec![CheckSpec::new(
                c,
                "Ping",
                &["ping", "-c", "4", cfg.network.ping_target.as_str()],
            )];
            specs.push(speedtest_spec(
                "Speedtest (nearby)",
                ctx.speedtest_nearby.as_deref(),
                cfg,
            ));
            if let Some(eu) = cfg.network.speedtest_server_eu.as_deref() {
                specs.push(speedtest_spec("Speedtest (EU)", Some(eu), cfg));
            }
            specs
        }
        Category::Software => {
            let mut specs: Vec<CheckSpec> = cfg
                .packages
                .iter()
                .map(|pkg| {
                    CheckSpec::new(
                        c,
                        format!("Package {pkg}"),
                        &["dpkg-query", "-W", "-f=${Status} ${Version}", pkg.as_str()],
                    )
                })
                .collect();
            specs.push(CheckSpec::new(c, "Docker", &["docker", "--version"]));
            specs.push(CheckSpec::new(c, "NVIDIA container toolkit", &["nvidia-ctk", "--version"]));
            specs.push(CheckSpec::new(c, "Python", &["python3", "--version"]));
            specs.push(CheckSpec::new(c, "GCC", &["gcc", "--version"]).filter("gcc"));
            specs
        }
        Category::Services => cfg
            .services
            .iter()
            .map(|svc| {
                CheckSpec::new(c, format!("Service {svc}"), &["systemctl", "is-active", svc.as_str()])
            })
            .collect(),
        Category::Benchmarks => Vec::new(),
    }
}

fn speedtest_spec(name: &str, server: Option<&str>, cfg: &Config) -> CheckSpec {
    let mut argv = vec!["speedtest-cli".to_string(), "--simple".to_string()];
    if let Some(id) = server {
        argv.push("--server".to_string());
        argv.push(id.to_string());
    }
    CheckSpec::new(Category::NetworkSpeed, name, argv.as_slice())
        .threshold(Metric::SpeedtestDownloadMbps, cfg.thresholds.min_download_mbps)
        .threshold(Metric::SpeedtestUploadMbps, cfg.thresholds.min_upload_mbps)
}

pub fn package_for(program: &str) -> Option<&'static str> {
    let pkg = match program {
        "lscpu" | "lsblk" => "util-linux",
        "numactl" => "numactl",
        "dmidecode" => "dmidecode",
        "nvme" => "nvme-cli",
        "ip" => "iproute2",
        "rdma" => "iproute2",
        "ethtool" => "ethtool",
        "ibstatus" | "ibstat" => "infiniband-diags",
        "ibv_devinfo" => "ibverbs-utils",
        "ufw" => "ufw",
        "sshd" => "openssh-server",
        "aa-enabled" => "apparmor",
        "ping" => "iputils-ping",
        "speedtest-cli" => "speedtest-cli",
        "python3" => "python3",
        "gcc" => "gcc",
        "git" => "git",
        "make" => "make",
        _ => return None,
    };
    Some(pkg)
}
