use crate::collectors::{apply_thresholds, execute, join_notes, parse, CommandOutcome, Metric, Threshold};
use crate::config::{NetworkConfig, TcpCheckConfig};
use crate::report::{CheckResult, CheckStatus};
use reqwest::Client;
use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time;
use tracing::{debug, warn};

const SPEED_HOST: &str = "https://speed.cloudflare.com";

/// Interfaces under `/sys/class/net` that are worth an ethtool check.
pub fn discover_interfaces(sys_class_net: &Path, skip_prefixes: &[String]) -> Vec<String> {
    let Ok(entries) = fs::read_dir(sys_class_net) else {
        return Vec::new();
    };

    let mut names: Vec<String> = entries
        .flatten()
        .filter_map(|e| e.file_name().to_str().map(str::to_string))
        .filter(|name| !skip_prefixes.iter().any(|p| name.starts_with(p.as_str())))
        .collect();
    names.sort();
    names
}

pub async fn tcp_liveness(cfg: &TcpCheckConfig) -> CheckResult {
    let start = Instant::now();
    let addr = format!("{}:{}", cfg.host, cfg.port);
    let name = format!("TCP port {} ({})", cfg.port, cfg.name);
    let command = format!("connect {addr} (timeout {}ms)", cfg.timeout_ms);

    let (status, notes) = match time::timeout(
        Duration::from_millis(cfg.timeout_ms),
        TcpStream::connect(&addr),
    )
    .await
    {
        Ok(Ok(_stream)) => (CheckStatus::Pass, String::new()),
        Ok(Err(err)) => {
            warn!(check = %cfg.name, address = %addr, error = %err, "tcp check failed");
            (CheckStatus::Fail, format!("Connection failed: {err}"))
        }
        Err(_elapsed) => {
            warn!(check = %cfg.name, address = %addr, "tcp check timeout");
            (
                CheckStatus::Fail,
                format!("Timed out after {}ms", cfg.timeout_ms),
            )
        }
    };

    let result = match status {
        CheckStatus::Pass => format!(
            "{addr} reachable in {} ms",
            start.elapsed().as_millis()
        ),
        _ => String::new(),
    };
    CheckResult::new(name, command, result, status, notes)
}

#[derive(Debug, Clone, PartialEq)]
pub struct InternetSpeedStat {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency_ms: f64,
}

impl InternetSpeedStat {
    /// Same layout as `speedtest-cli --simple`, so the same thresholds apply.
    pub fn to_simple_text(&self) -> String {
        format!(
            "Ping: {:.2} ms\nDownload: {:.2} Mbit/s\nUpload: {:.2} Mbit/s",
            self.latency_ms, self.download_mbps, self.upload_mbps
        )
    }
}

pub async fn measure_http_speed(client: &Client) -> Result<InternetSpeedStat, reqwest::Error> {
    const DOWNLOAD_BYTES: usize = 25_000_000;
    const UPLOAD_BYTES: usize = 5_000_000;

    let ping_start = Instant::now();
    let _ = client
        .head(format!("{SPEED_HOST}/"))
        .timeout(Duration::from_secs(6))
        .send()
        .await?;
    let latency_ms = ping_start.elapsed().as_secs_f64() * 1000.0;

    let down_url = format!("{SPEED_HOST}/__down?bytes={DOWNLOAD_BYTES}");
    let down_start = Instant::now();
    let down = client
        .get(down_url)
        .timeout(Duration::from_secs(60))
        .send()
        .await?
        .error_for_status()?;
    let down_bytes = down.bytes().await?;
    let down_secs = down_start.elapsed().as_secs_f64().max(0.001);
    let download_mbps = ((down_bytes.len() as f64) * 8.0 / 1_000_000.0) / down_secs;

    let upload_buf = vec![0_u8; UPLOAD_BYTES];
    let up_start = Instant::now();
    let _ = client
        .post(format!("{SPEED_HOST}/__up"))
        .timeout(Duration::from_secs(60))
        .body(upload_buf)
        .send()
        .await?
        .error_for_status()?;
    let up_secs = up_start.elapsed().as_secs_f64().max(0.001);
    let upload_mbps = ((UPLOAD_BYTES as f64) * 8.0 / 1_000_000.0) / up_secs;

    Ok(InternetSpeedStat {
        download_mbps,
        upload_mbps,
        latency_ms,
    })
}

pub fn speed_result(
    name: &str,
    command: &str,
    measured: Result<InternetSpeedStat, String>,
    min_download_mbps: f64,
    min_upload_mbps: f64,
) -> CheckResult {
    match measured {
        Ok(stat) => {
            let text = stat.to_simple_text();
            let thresholds = [
                Threshold {
                    metric: Metric::SpeedtestDownloadMbps,
                    minimum: min_download_mbps,
                },
                Threshold {
                    metric: Metric::SpeedtestUploadMbps,
                    minimum: min_upload_mbps,
                },
            ];
            let (status, notes) = apply_thresholds(CheckStatus::Pass, &text, &thresholds);
            CheckResult::new(name, command, text, status, join_notes(String::new(), notes))
        }
        Err(err) => CheckResult::new(
            name,
            command,
            "",
            CheckStatus::Fail,
            format!("Request failed: {err}"),
        ),
    }
}

pub async fn http_throughput(client: &Client, min_download_mbps: f64, min_upload_mbps: f64) -> CheckResult {
    let measured = measure_http_speed(client).await.map_err(|e| e.to_string());
    speed_result(
        "HTTP throughput (Cloudflare)",
        &format!("GET/POST {SPEED_HOST}"),
        measured,
        min_download_mbps,
        min_upload_mbps,
    )
}

/// Explicit id wins; otherwise the closest entry of `speedtest-cli --list`.
pub async fn resolve_nearby_server(cfg: &NetworkConfig) -> Option<String> {
    if let Some(id) = cfg.speedtest_server_nearby.as_ref() {
        return Some(id.clone());
    }

    let argv = vec!["speedtest-cli".to_string(), "--list".to_string()];
    match execute(&argv, None).await {
        CommandOutcome::Exited { code: 0, output } => {
            let servers = parse::speedtest_servers(&output);
            let nearest = parse::nearest_server(&servers);
            debug!(
                servers = servers.len(),
                nearest = ?nearest.map(|s| &s.description),
                "список серверов speedtest"
            );
            nearest.map(|s| s.id.clone())
        }
        other => {
            warn!(outcome = ?other, "не удалось получить список серверов speedtest");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn interface_discovery_skips_prefixes_and_sorts() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["lo", "eth1", "docker0", "eno1", "ib0", "veth12ab"] {
            fs::create_dir(dir.path().join(name)).expect("mkdir");
        }
        let skip: Vec<String> = ["lo", "docker", "veth", "ib"]
            .into_iter()
            .map(String::from)
            .collect();

        let found = discover_interfaces(dir.path(), &skip);
        assert_eq!(found, vec!["eno1".to_string(), "eth1".to_string()]);
        assert!(discover_interfaces(&dir.path().join("missing"), &skip).is_empty());
    }

    #[tokio::test]
    async fn tcp_liveness_passes_for_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let cfg = TcpCheckConfig {
            name: "local".to_string(),
            host: "127.0.0.1".to_string(),
            port,
            timeout_ms: 1000,
        };

        let result = tcp_liveness(&cfg).await;
        assert_eq!(result.status(), CheckStatus::Pass);
        assert!(result.result().contains("reachable"));
    }

    #[tokio::test]
    async fn tcp_liveness_fails_for_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let port = listener.local_addr().expect("addr").port();
        drop(listener);
        let cfg = TcpCheckConfig {
            name: "closed".to_string(),
            host: "127.0.0.1".to_string(),
            port,
            timeout_ms: 1000,
        };

        let result = tcp_liveness(&cfg).await;
        assert_eq!(result.status(), CheckStatus::Fail);
        assert!(!result.notes().is_empty());
    }

    #[test]
    fn speed_result_applies_both_minimums() {
        let stat = InternetSpeedStat {
            download_mbps: 500.0,
            upload_mbps: 1500.0,
            latency_ms: 3.0,
        };
        let result = speed_result("speed", "x", Ok(stat.clone()), 1000.0, 1000.0);
        assert_eq!(result.status(), CheckStatus::Fail);
        assert!(result.notes().contains("download (Mbit/s) 500 below minimum 1000"));

        let result = speed_result("speed", "x", Ok(stat), 0.0, 0.0);
        assert_eq!(result.status(), CheckStatus::Pass);

        let result = speed_result("speed", "x", Err("dns".to_string()), 0.0, 0.0);
        assert_eq!(result.status(), CheckStatus::Fail);
    }

    #[tokio::test]
    async fn configured_nearby_server_skips_listing() {
        let cfg = NetworkConfig {
            speedtest_server_nearby: Some("4120".to_string()),
            ..NetworkConfig::default()
        };
        assert_eq!(resolve_nearby_server(&cfg).await.as_deref(), Some("4120"));
    }
}
