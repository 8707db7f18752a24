mod collectors;
mod config;
mod installer;
mod report;

use chrono::Local;
use clap::Parser;
use collectors::catalog::{self, CatalogContext};
use collectors::network::{discover_interfaces, http_throughput, resolve_nearby_server, tcp_liveness};
use collectors::system::{collect_host_facts, cpu_summary, disk_usage, host_summary, memory_summary, HostFacts};
use collectors::{gpu, record, run_into};
use config::{Config, ConfigError};
use installer::deps::{self, DependencyMode};
use installer::nccl::{self, BenchmarkOptions};
use installer::{
    AutoConfirm, BootInfo, Confirm, GpuStackFlow, GpuStackOutcome, InstallError, PackageInstaller,
    StateStore, StdinConfirm,
};
use report::{Category, CheckResult, CheckStatus, Report, ReportError};
use reqwest::Client;
use sysinfo::SystemExt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_CONFIG: &str = "./config.yaml";
const SYS_CLASS_NET: &str = "/sys/class/net";

#[derive(Parser, Debug)]
#[command(name = "nodeaudit")]
#[command(version)]
#[command(about = "Аудит HPC-узла: проверки, HTML-отчёт, установка GPU-стека и NCCL")]
struct Cli {
    /// YAML config; ./config.yaml is used when present
    #[arg(long)]
    config: Option<String>,
    #[arg(long)]
    print_default_config: bool,
    /// Install missing tools without asking
    #[arg(long)]
    headless: bool,
    /// Skip the GPU burn and Docker GPU runtime checks
    #[arg(long)]
    noburn: bool,
    /// Never install anything
    #[arg(long)]
    noinstall: bool,
    /// Skip the PATH lookup for required tools
    #[arg(long)]
    nocheck: bool,
    /// Never reboot, even when the driver install asks for it
    #[arg(long)]
    noreboot: bool,
    /// Enable every check category
    #[arg(long)]
    all: bool,
    /// run_<category>_check=true|false, repeatable
    #[arg(short = 'e', long = "extra-var", value_name = "KEY=VALUE")]
    extra_vars: Vec<String>,
    #[arg(long)]
    output_dir: Option<String>,
    /// Also write the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Error)]
enum RunError {
    #[error(transparent)]
    Install(#[from] InstallError),
    #[error(transparent)]
    Report(#[from] ReportError),
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    if !cli.noinstall && !installer::running_as_root() {
        error!(error = %InstallError::NotRoot, "недостаточно прав");
        std::process::exit(1);
    }

    if let Err(err) = run(&cli, &cfg).await {
        error!(error = %err, "аудит прерван");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// File (or defaults), then environment, then command line.
fn load_config(cli: &Cli) -> Result<Config, ConfigError> {
    let mut cfg = match cli.config.as_deref() {
        Some(path) => Config::load_from_file(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => Config::load_from_file(DEFAULT_CONFIG)?,
        None => Config::default(),
    };
    cfg.apply_env_overrides(|name| std::env::var(name).ok())?;
    if cli.all {
        cfg.checks.enable_all();
    }
    for assignment in &cli.extra_vars {
        cfg.apply_extra_var(assignment)?;
    }
    if let Some(dir) = cli.output_dir.as_ref() {
        cfg.output_dir = dir.clone();
    }
    cfg.validate()?;
    Ok(cfg)
}

async fn run(cli: &Cli, cfg: &Config) -> Result<(), RunError> {
    let categories = cfg.checks.enabled_categories();
    if categories.is_empty() {
        warn!("ни одна категория не включена: используйте --all или -e run_<категория>_check=true");
    }

    let mut system = sysinfo::System::new();
    let facts = collect_host_facts(&mut system);
    let host = facts.host_name.clone().unwrap_or_else(|| "unknown".to_string());
    info!(host = %host, categories = categories.len(), "запуск аудита");

    let mut report = Report::new(host, Local::now());
    let apt = PackageInstaller::default();
    let mut confirm: Box<dyn Confirm> = if cli.headless {
        Box::new(AutoConfirm(true))
    } else {
        Box::new(StdinConfirm)
    };

    let mut ctx = CatalogContext {
        ethernet_interfaces: if categories.contains(&Category::Ethernet) {
            discover_interfaces(Path::new(SYS_CLASS_NET), &cfg.network.skip_interface_prefixes)
        } else {
            Vec::new()
        },
        speedtest_nearby: None,
    };

    if cli.nocheck {
        info!("проверка зависимостей пропущена (--nocheck)");
    } else {
        let mut specs: Vec<_> = categories
            .iter()
            .flat_map(|c| catalog::command_checks(*c, cfg, &ctx))
            .collect();
        if categories.contains(&Category::Benchmarks) {
            specs.extend(nccl::build_specs(&cfg.benchmarks));
        }
        let path = std::env::var_os("PATH").unwrap_or_default();
        let missing = deps::missing_tools(&specs, &path);
        let mode = if cli.noinstall {
            DependencyMode::Skip
        } else if cli.headless {
            DependencyMode::Auto
        } else {
            DependencyMode::Ask
        };
        deps::ensure_dependencies(&mut report, &missing, mode, confirm.as_mut(), &apt).await?;
    }

    if categories.contains(&Category::NetworkSpeed) {
        ctx.speedtest_nearby = resolve_nearby_server(&cfg.network).await;
    }

    let client = Client::builder()
        .user_agent(concat!("nodeaudit/", env!("CARGO_PKG_VERSION")))
        .build()
        .unwrap_or_else(|_| Client::new());

    let store = StateStore::from_config(&cfg.installer);
    let flow = GpuStackFlow {
        cfg: &cfg.installer,
        store: &store,
        installer: &apt,
        allow_install: !cli.noinstall,
    };
    let boot = BootInfo {
        uptime: Duration::from_secs(facts.uptime_seconds),
        boot_time_unix: facts.boot_time_unix,
    };
    // validate() already rejected an unparseable value
    let min_uptime = cfg.min_uptime().unwrap_or_default();

    let mut stack: Option<GpuStackOutcome> = None;
    for category in categories {
        info!(category = category.title(), "категория проверок");
        run_category(&mut report, category, cfg, &ctx, &facts, &client).await;

        if matches!(category, Category::Gpu | Category::Benchmarks) && stack.is_none() {
            let outcome = flow
                .run(&mut report, confirm.as_mut(), boot, min_uptime, installer::unix_now())
                .await;
            stack = Some(outcome);
        }
        if let (Category::Benchmarks, Some(outcome)) = (category, stack) {
            let options = BenchmarkOptions {
                noburn: cli.noburn,
                min_busbw_gbps: cfg.thresholds.min_nccl_busbw_gbps,
            };
            nccl::run_benchmarks(&mut report, &cfg.benchmarks, outcome.state, options).await;
        }
    }

    let path = report.write_to_dir(Path::new(&cfg.output_dir), cli.json)?;
    let totals = report.totals();
    info!(
        path = %path.display(),
        pass = totals.pass,
        fail = totals.fail,
        partial = totals.partial,
        "отчёт записан"
    );

    if stack.is_some_and(|s| s.reboot_requested) {
        if cli.noreboot {
            warn!("требуется перезагрузка, пропущена (--noreboot)");
        } else {
            installer::request_reboot(&cfg.installer.reboot_command).await?;
        }
    }
    Ok(())
}

async fn run_category(
    report: &mut Report,
    category: Category,
    cfg: &Config,
    ctx: &CatalogContext,
    facts: &HostFacts,
    client: &Client,
) {
    match category {
        Category::System => {
            record(report, category, host_summary(facts));
        }
        Category::Cpu => {
            record(report, category, cpu_summary(facts));
        }
        Category::Ram => {
            record(report, category, memory_summary(facts));
        }
        Category::Storage => {
            record(
                report,
                category,
                disk_usage(facts, cfg.thresholds.min_free_disk_percent),
            );
        }
        Category::Gpu => {
            let (row, gpus) = gpu::collect_gpu_inventory().await;
            info!(gpus = gpus.len(), "инвентаризация GPU");
            record(report, category, row);
        }
        Category::Ethernet if ctx.ethernet_interfaces.is_empty() => {
            record(
                report,
                category,
                CheckResult::new(
                    "Ethernet interfaces",
                    SYS_CLASS_NET,
                    "",
                    CheckStatus::Partial,
                    "No interfaces left after filtering",
                ),
            );
        }
        Category::NetworkSpeed if cfg.network.http_speedtest => {
            let row = http_throughput(
                client,
                cfg.thresholds.min_download_mbps,
                cfg.thresholds.min_upload_mbps,
            )
            .await;
            record(report, category, row);
        }
        Category::Services => {
            for check in &cfg.network.tcp_checks {
                record(report, category, tcp_liveness(check).await);
            }
        }
        _ => {}
    }

    for spec in catalog::command_checks(category, cfg, ctx) {
        run_into(report, &spec).await;
    }

    if category == Category::NetworkSpeed && cfg.network.speedtest_server_eu.is_none() {
        record(
            report,
            category,
            CheckResult::new(
                "Speedtest (EU)",
                "speedtest-cli --simple --server <id>",
                "",
                CheckStatus::Partial,
                "SPEEDTEST_SERVER_EU is not set",
            ),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_accepts_ansible_style_extra_vars() {
        let cli = Cli::try_parse_from([
            "nodeaudit",
            "--headless",
            "--noreboot",
            "-e",
            "run_gpu_check=true",
            "--extra-var",
            "run_cpu_check=true",
            "--output-dir",
            "/tmp/out",
        ])
        .expect("valid args");
        assert!(cli.headless && cli.noreboot && !cli.noinstall);
        assert_eq!(cli.extra_vars.len(), 2);
        assert_eq!(cli.output_dir.as_deref(), Some("/tmp/out"));
    }

    #[test]
    fn command_line_wins_over_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "output_dir: from-file\nchecks:\n  run_cpu_check: true\n  run_gpu_check: true\n",
        )
        .expect("write");

        let cli = Cli::try_parse_from([
            "nodeaudit",
            "--config",
            path.to_str().expect("utf-8 path"),
            "-e",
            "run_gpu_check=false",
            "--output-dir",
            "from-cli",
        ])
        .expect("valid args");
        let cfg = load_config(&cli).expect("config");
        assert_eq!(cfg.output_dir, "from-cli");
        assert_eq!(cfg.checks.enabled_categories(), vec![Category::Cpu]);
    }

    #[test]
    fn config_errors_surface_from_load() {
        let cli = Cli::try_parse_from(["nodeaudit", "--config", "/nonexistent/x.yaml"])
            .expect("valid args");
        assert!(matches!(load_config(&cli), Err(ConfigError::Read { .. })));

        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "{}\n").expect("write");
        let cli = Cli::try_parse_from([
            "nodeaudit",
            "--config",
            path.to_str().expect("utf-8 path"),
            "-e",
            "run_toaster_check=true",
        ])
        .expect("valid args");
        assert!(matches!(load_config(&cli), Err(ConfigError::ExtraVar(_))));
    }

    #[tokio::test]
    async fn echo_false_true_end_to_end_into_html() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut report = Report::new("node01", crate::report::tests::fixed_time());
        for argv in [&["echo", "hello"][..], &["false"], &["true"]] {
            let spec = collectors::CheckSpec::new(Category::System, argv[0], argv);
            run_into(&mut report, &spec).await;
        }

        let path = report.write_to_dir(dir.path(), true).expect("report written");
        let html = std::fs::read_to_string(&path).expect("read html");
        assert!(path
            .display()
            .to_string()
            .ends_with("system_test_report_node01_20261019_143005.html"));
        assert_eq!(html.matches("class=\"result-row\"").count(), 3);
        assert!(html.contains("Exit code 1"));
        assert!(html.contains("No output"));
        assert!(dir
            .path()
            .join("system_test_report_node01_20261019_143005.json")
            .exists());
    }
}
