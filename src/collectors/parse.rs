//! Small extractors for the numbers that thresholds compare against.
//! Values are kept as floats; nothing is truncated before comparison.

/// `ethtool <iface>`: `Speed: 25000Mb/s`. `Speed: Unknown!` yields `None`.
pub fn ethtool_speed_mbps(output: &str) -> Option<f64> {
    output.lines().find_map(|line| {
        let value = line.trim().strip_prefix("Speed:")?.trim();
        let digits = value.strip_suffix("Mb/s")?;
        digits.trim().parse::<f64>().ok()
    })
}

/// Smallest `rate:` across all ports in `ibstatus` / `ibstat` output.
pub fn min_ib_rate_gbps(output: &str) -> Option<f64> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (key, value) = line.split_once(':')?;
            if !key.trim().eq_ignore_ascii_case("rate") {
                return None;
            }
            leading_number(value)
        })
        .min_by(|a, b| a.total_cmp(b))
}

/// `speedtest-cli --simple`: `Download: 934.21 Mbit/s`.
pub fn speedtest_simple(output: &str, key: &str) -> Option<f64> {
    output.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        if k.trim() != key {
            return None;
        }
        leading_number(v)
    })
}

/// nccl-tests summary line: `# Avg bus bandwidth    : 185.421`.
pub fn nccl_avg_busbw(output: &str) -> Option<f64> {
    output.lines().find_map(|line| {
        let (k, v) = line.split_once(':')?;
        if !k.contains("Avg bus bandwidth") {
            return None;
        }
        leading_number(v)
    })
}

/// `df --output=target,pcent`: free space of the fullest filesystem.
pub fn df_min_free_percent(output: &str) -> Option<f64> {
    output
        .lines()
        .skip(1)
        .filter_map(|line| {
            let pcent = line.split_whitespace().last()?;
            let used = pcent.strip_suffix('%')?.parse::<f64>().ok()?;
            Some(100.0 - used)
        })
        .min_by(|a, b| a.total_cmp(b))
}

/// Rows of `speedtest-cli --list`: `  1234) Provider (City, Country) [12.34 km]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SpeedtestServer {
    pub id: String,
    pub description: String,
    pub distance_km: Option<f64>,
}

pub fn speedtest_servers(output: &str) -> Vec<SpeedtestServer> {
    output
        .lines()
        .filter_map(|line| {
            let (id, rest) = line.trim().split_once(')')?;
            let id = id.trim();
            if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit()) {
                return None;
            }
            let rest = rest.trim();
            let distance_km = rest
                .rfind('[')
                .and_then(|start| leading_number(&rest[start + 1..]));
            let description = match rest.rfind('[') {
                Some(start) => rest[..start].trim().to_string(),
                None => rest.to_string(),
            };
            Some(SpeedtestServer {
                id: id.to_string(),
                description,
                distance_km,
            })
        })
        .collect()
}

/// Closest server by reported distance; the list order is not trusted.
pub fn nearest_server(servers: &[SpeedtestServer]) -> Option<&SpeedtestServer> {
    servers
        .iter()
        .filter(|s| s.distance_km.is_some())
        .min_by(|a, b| {
            a.distance_km
                .unwrap_or(f64::MAX)
                .total_cmp(&b.distance_km.unwrap_or(f64::MAX))
        })
        .or_else(|| servers.first())
}

fn leading_number(input: &str) -> Option<f64> {
    let trimmed = input.trim_start();
    let end = trimmed
        .char_indices()
        .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    trimmed[..end].parse::<f64>().ok()
}
