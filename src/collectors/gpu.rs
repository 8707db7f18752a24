use crate::collectors::{execute, run_check, CheckSpec, CommandOutcome};
use crate::report::{Category, CheckResult, CheckStatus};

const QUERY: &str = "--query-gpu=index,name,driver_version,memory.used,memory.total,temperature.gpu,utilization.gpu";

#[derive(Debug, Clone, PartialEq)]
pub struct GpuStat {
    pub id: String,
    pub name: String,
    pub driver_version: String,
    pub memory_used_bytes: Option<u64>,
    pub memory_total_bytes: Option<u64>,
    pub temperature_celsius: Option<f64>,
    pub utilization_percent: Option<f64>,
}

fn query_argv() -> Vec<String> {
    vec![
        "nvidia-smi".to_string(),
        QUERY.to_string(),
        "--format=csv,noheader,nounits".to_string(),
    ]
}

/// GPU inventory row plus the parsed list (empty when nvidia-smi is unusable).
pub async fn collect_gpu_inventory() -> (CheckResult, Vec<GpuStat>) {
    let spec = CheckSpec::new(Category::Gpu, "GPU inventory", query_argv().as_slice());
    let raw = run_check(&spec).await;
    if raw.status() != CheckStatus::Pass {
        return (raw, Vec::new());
    }

    let gpus = parse_gpu_stats(raw.result());
    if gpus.is_empty() {
        let result = CheckResult::new(
            raw.name(),
            raw.command(),
            raw.result(),
            CheckStatus::Partial,
            "No GPUs reported",
        );
        return (result, gpus);
    }

    let text = gpus.iter().map(format_gpu).collect::<Vec<_>>().join("\n");
    let result = CheckResult::new(
        raw.name(),
        raw.command(),
        text,
        CheckStatus::Pass,
        format!("{} GPU(s)", gpus.len()),
    );
    (result, gpus)
}

pub async fn gpu_count() -> Option<u32> {
    match execute(&query_argv(), None).await {
        CommandOutcome::Exited { code: 0, output } => {
            let n = parse_gpu_stats(&output).len() as u32;
            (n > 0).then_some(n)
        }
        _ => None,
    }
}

pub fn parse_gpu_stats(text: &str) -> Vec<GpuStat> {
    text.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(|v| v.trim()).collect();
            if parts.len() < 7 {
                return None;
            }

            Some(GpuStat {
                id: parts[0].to_string(),
                name: parts[1].to_string(),
                driver_version: parts[2].to_string(),
                memory_used_bytes: parse_u64_loose(parts[3]).map(|v| v.saturating_mul(1024 * 1024)),
                memory_total_bytes: parse_u64_loose(parts[4]).map(|v| v.saturating_mul(1024 * 1024)),
                temperature_celsius: parse_f64_loose(parts[5]),
                utilization_percent: parse_f64_loose(parts[6]),
            })
        })
        .collect()
}

fn format_gpu(g: &GpuStat) -> String {
    let mem = match (g.memory_used_bytes, g.memory_total_bytes) {
        (Some(u), Some(t)) => format!(
            "{:.1}/{:.1} GiB",
            u as f64 / 1024.0 / 1024.0 / 1024.0,
            t as f64 / 1024.0 / 1024.0 / 1024.0
        ),
        _ => "n/a".to_string(),
    };
    format!(
        "GPU {}: {} | driver {} | mem {} | temp {} | util {}",
        g.id,
        g.name,
        g.driver_version,
        mem,
        g.temperature_celsius
            .map(|v| format!("{v:.0}°C"))
            .unwrap_or_else(|| "n/a".to_string()),
        g.utilization_percent
            .map(|v| format!("{v:.0}%"))
            .unwrap_or_else(|| "n/a".to_string()),
    )
}

// "[N/A]" and "[Not Supported]" come back as None.
fn parse_f64_loose(input: &str) -> Option<f64> {
    input.trim().parse::<f64>().ok()
}

fn parse_u64_loose(input: &str) -> Option<u64> {
    parse_f64_loose(input).map(|v| v.max(0.0).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nvidia_smi_csv() {
        let text = "0, NVIDIA H100 80GB HBM3, 550.54.15, 1024, 81559, 34, 0\n\
1, NVIDIA H100 80GB HBM3, 550.54.15, [N/A], 81559, [N/A], 12\n";
        let gpus = parse_gpu_stats(text);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].name, "NVIDIA H100 80GB HBM3");
        assert_eq!(gpus[0].memory_used_bytes, Some(1024 * 1024 * 1024));
        assert_eq!(gpus[1].memory_used_bytes, None);
        assert_eq!(gpus[1].temperature_celsius, None);
        assert_eq!(gpus[1].utilization_percent, Some(12.0));
    }

    #[test]
    fn short_lines_are_ignored() {
        assert!(parse_gpu_stats("No devices were found").is_empty());
        assert!(parse_gpu_stats("").is_empty());
    }

    #[test]
    fn formats_one_line_per_gpu() {
        let gpus = parse_gpu_stats("3, A100, 535.1, 0, 40960, 40, 5");
        let line = format_gpu(&gpus[0]);
        assert!(line.starts_with("GPU 3: A100 | driver 535.1"));
        assert!(line.contains("0.0/40.0 GiB"));
    }
}
