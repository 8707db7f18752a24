use crate::collectors::gpu::gpu_count;
use crate::collectors::{execute, record, run_into, CheckSpec, CommandOutcome, Metric};
use crate::config::BenchmarkConfig;
use crate::installer::{unix_now, InstallState};
use crate::report::{Category, CheckResult, CheckStatus, Report};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

// image pull and container start on top of the burn itself
const BURN_GRACE_SECS: u64 = 600;
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, Default)]
pub struct BenchmarkOptions {
    pub noburn: bool,
    pub min_busbw_gbps: f64,
}

pub fn all_reduce_binary(cfg: &BenchmarkConfig) -> PathBuf {
    Path::new(&cfg.nccl_tests_dir).join("build").join("all_reduce_perf")
}

pub fn build_specs(cfg: &BenchmarkConfig) -> Vec<CheckSpec> {
    let c = Category::Benchmarks;
    let mut specs = Vec::new();
    if !Path::new(&cfg.nccl_tests_dir).join("Makefile").exists() {
        specs.push(CheckSpec::new(
            c,
            "Clone nccl-tests",
            &[
                "git",
                "clone",
                "--depth",
                "1",
                cfg.nccl_tests_repo.as_str(),
                cfg.nccl_tests_dir.as_str(),
            ],
        ));
    }
    specs.push(CheckSpec::new(
        c,
        "Build nccl-tests",
        &[
            "make".to_string(),
            "-C".to_string(),
            cfg.nccl_tests_dir.clone(),
            "MPI=0".to_string(),
            format!("CUDA_HOME={}", cfg.cuda_home),
        ],
    ));
    specs
}

pub fn all_reduce_spec(cfg: &BenchmarkConfig, gpus: u32, min_busbw_gbps: f64) -> CheckSpec {
    let binary = all_reduce_binary(cfg).display().to_string();
    CheckSpec::new(
        Category::Benchmarks,
        format!("NCCL all_reduce ({gpus} GPU)"),
        &[
            binary,
            "-b".to_string(),
            "8".to_string(),
            "-e".to_string(),
            cfg.nccl_max_bytes.clone(),
            "-f".to_string(),
            "2".to_string(),
            "-g".to_string(),
            gpus.to_string(),
        ],
    )
    .threshold(Metric::NcclBusBandwidthGbps, min_busbw_gbps)
}

pub fn docker_gpu_spec(cfg: &BenchmarkConfig) -> CheckSpec {
    CheckSpec::new(
        Category::Benchmarks,
        "Docker GPU runtime",
        &[
            "docker",
            "run",
            "--rm",
            "--gpus",
            "all",
            cfg.cuda_image.as_str(),
            "nvidia-smi",
            "-L",
        ],
    )
}

pub fn burn_container_name(now_unix: i64) -> String {
    format!("nodeaudit-burn-{now_unix}")
}

pub fn gpu_burn_spec(cfg: &BenchmarkConfig, container: &str) -> CheckSpec {
    CheckSpec::new(
        Category::Benchmarks,
        format!("GPU burn ({}s)", cfg.gpu_burn_seconds),
        &[
            "docker".to_string(),
            "run".to_string(),
            "--rm".to_string(),
            "--init".to_string(),
            "--name".to_string(),
            container.to_string(),
            "--gpus".to_string(),
            "all".to_string(),
            cfg.gpu_burn_image.clone(),
            cfg.gpu_burn_seconds.to_string(),
        ],
    )
    // progress lines are dropped, the per-GPU OK/FAULTY summary stays
    .filter("GPU ")
    .timeout(Duration::from_secs(cfg.gpu_burn_seconds + BURN_GRACE_SECS))
}

pub fn remove_container_argv(container: &str) -> Vec<String> {
    ["docker", "rm", "-f", container]
        .iter()
        .map(|a| a.to_string())
        .collect()
}

/// Killing the docker client on timeout leaves the container running.
async fn remove_container(container: &str) {
    match execute(&remove_container_argv(container), Some(CLEANUP_TIMEOUT)).await {
        CommandOutcome::Exited { code: 0, .. } => info!(container, "контейнер GPU burn удалён"),
        other => debug!(container, outcome = ?other, "контейнер GPU burn не удалён"),
    }
}

/// Benchmarks section. Runs nothing unless the GPU stack is usable.
pub async fn run_benchmarks(
    report: &mut Report,
    cfg: &BenchmarkConfig,
    stack: InstallState,
    options: BenchmarkOptions,
) {
    let c = Category::Benchmarks;
    if !stack.allows_benchmarks() {
        warn!(state = stack.label(), "бенчмарки пропущены: GPU-стек не готов");
        record(
            report,
            c,
            CheckResult::new(
                "Benchmarks",
                "",
                format!("GPU stack state: {}", stack.label()),
                CheckStatus::Partial,
                "Skipped until the GPU stack is installed and the node has rebooted",
            ),
        );
        return;
    }

    run_nccl(report, cfg, options.min_busbw_gbps).await;

    if options.noburn {
        info!("GPU burn и проверка Docker пропущены (--noburn)");
        return;
    }
    if run_into(report, &docker_gpu_spec(cfg)).await == CheckStatus::Pass {
        let container = burn_container_name(unix_now());
        if run_into(report, &gpu_burn_spec(cfg, &container)).await != CheckStatus::Pass {
            remove_container(&container).await;
        }
    } else {
        warn!("Docker не видит GPU, GPU burn пропущен");
    }
}

async fn run_nccl(report: &mut Report, cfg: &BenchmarkConfig, min_busbw_gbps: f64) {
    let c = Category::Benchmarks;
    if !all_reduce_binary(cfg).exists() {
        for spec in build_specs(cfg) {
            if run_into(report, &spec).await == CheckStatus::Fail {
                warn!(step = %spec.name, "сборка nccl-tests не удалась");
                return;
            }
        }
    }

    let gpus = match cfg.gpu_count {
        Some(n) => Some(n),
        None => gpu_count().await,
    };
    let Some(gpus) = gpus else {
        record(
            report,
            c,
            CheckResult::new(
                "NCCL all_reduce",
                all_reduce_binary(cfg).display().to_string(),
                "",
                CheckStatus::Fail,
                "No GPUs detected",
            ),
        );
        return;
    };
    run_into(report, &all_reduce_spec(cfg, gpus, min_busbw_gbps)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::tests::fixed_time;

    fn cfg_in(dir: &Path) -> BenchmarkConfig {
        BenchmarkConfig {
            nccl_tests_dir: dir.join("nccl-tests").display().to_string(),
            ..BenchmarkConfig::default()
        }
    }

    #[test]
    fn all_reduce_command_line() {
        let cfg = BenchmarkConfig::default();
        let spec = all_reduce_spec(&cfg, 8, 350.0);
        assert_eq!(
            spec.command_line(),
            "/opt/nccl-tests/build/all_reduce_perf -b 8 -e 8G -f 2 -g 8"
        );
        assert_eq!(spec.thresholds[0].metric, Metric::NcclBusBandwidthGbps);
        assert_eq!(spec.thresholds[0].minimum, 350.0);
    }

    #[test]
    fn build_clones_only_when_checkout_is_missing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = cfg_in(dir.path());

        let specs = build_specs(&cfg);
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].program(), Some("git"));
        assert!(specs[1].command_line().ends_with("MPI=0 CUDA_HOME=/usr/local/cuda"));

        std::fs::create_dir_all(dir.path().join("nccl-tests")).expect("mkdir");
        std::fs::write(dir.path().join("nccl-tests/Makefile"), "").expect("write");
        let specs = build_specs(&cfg);
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].program(), Some("make"));
    }

    #[test]
    fn docker_specs_use_configured_images() {
        let cfg = BenchmarkConfig::default();
        assert_eq!(
            gpu_burn_spec(&cfg, "nodeaudit-burn-7").command_line(),
            "docker run --rm --init --name nodeaudit-burn-7 --gpus all oguzpastirmaci/gpu-burn:latest 60"
        );
        assert!(docker_gpu_spec(&cfg)
            .command_line()
            .contains("nvidia/cuda:12.4.1-base-ubuntu22.04 nvidia-smi"));
    }

    #[test]
    fn timed_out_burn_container_can_be_removed_by_name() {
        let mut cfg = BenchmarkConfig::default();
        cfg.gpu_burn_seconds = 120;
        let container = burn_container_name(1_700_000_000);
        assert_eq!(container, "nodeaudit-burn-1700000000");

        let spec = gpu_burn_spec(&cfg, &container);
        let name_at = spec.argv.iter().position(|a| a == "--name").expect("--name");
        assert_eq!(spec.argv[name_at + 1], container);
        assert_eq!(spec.timeout, Some(Duration::from_secs(120 + BURN_GRACE_SECS)));
        assert_eq!(
            remove_container_argv(&container).join(" "),
            "docker rm -f nodeaudit-burn-1700000000"
        );
    }

    #[tokio::test]
    async fn benchmarks_wait_for_a_ready_stack() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cfg = cfg_in(dir.path());
        for state in [
            InstallState::NotChecked,
            InstallState::Missing,
            InstallState::RebootRequired,
        ] {
            let mut report = Report::new("node01", fixed_time());
            run_benchmarks(&mut report, &cfg, state, BenchmarkOptions::default()).await;
            let rows = report.results(Category::Benchmarks);
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].status(), CheckStatus::Partial);
        }
    }
}
