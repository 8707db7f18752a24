pub mod html;

use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Category {
    System,
    Cpu,
    Ram,
    Storage,
    Gpu,
    Ethernet,
    Infiniband,
    Security,
    NetworkSpeed,
    Software,
    Services,
    Benchmarks,
}

impl Category {
    pub const ALL: [Category; 12] = [
        Category::System,
        Category::Cpu,
        Category::Ram,
        Category::Storage,
        Category::Gpu,
        Category::Ethernet,
        Category::Infiniband,
        Category::Security,
        Category::NetworkSpeed,
        Category::Software,
        Category::Services,
        Category::Benchmarks,
    ];

    pub fn title(self) -> &'static str {
        match self {
            Category::System => "System",
            Category::Cpu => "CPU",
            Category::Ram => "RAM",
            Category::Storage => "Storage",
            Category::Gpu => "GPU",
            Category::Ethernet => "Ethernet",
            Category::Infiniband => "InfiniBand",
            Category::Security => "Security",
            Category::NetworkSpeed => "Network Speed",
            Category::Software => "Software",
            Category::Services => "Services",
            Category::Benchmarks => "Benchmarks",
        }
    }

    pub fn slug(self) -> &'static str {
        match self {
            Category::System => "system",
            Category::Cpu => "cpu",
            Category::Ram => "ram",
            Category::Storage => "storage",
            Category::Gpu => "gpu",
            Category::Ethernet => "ethernet",
            Category::Infiniband => "infiniband",
            Category::Security => "security",
            Category::NetworkSpeed => "network_speed",
            Category::Software => "software",
            Category::Services => "services",
            Category::Benchmarks => "benchmarks",
        }
    }

    /// Name of the opt-in switch, e.g. `run_gpu_check`.
    pub fn flag_key(self) -> String {
        format!("run_{}_check", self.slug())
    }

    pub fn from_flag_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.flag_key() == key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CheckStatus {
    Pass,
    Fail,
    Partial,
}

impl CheckStatus {
    pub fn label(self) -> &'static str {
        match self {
            CheckStatus::Pass => "PASS",
            CheckStatus::Fail => "FAIL",
            CheckStatus::Partial => "PARTIAL",
        }
    }
}

/// One report row. Built once and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    name: String,
    command: String,
    result: String,
    status: CheckStatus,
    notes: String,
}

impl CheckResult {
    pub fn new(
        name: impl Into<String>,
        command: impl Into<String>,
        result: impl Into<String>,
        status: CheckStatus,
        notes: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            result: result.into(),
            status,
            notes: notes.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn result(&self) -> &str {
        &self.result
    }

    pub fn status(&self) -> CheckStatus {
        self.status
    }

    pub fn notes(&self) -> &str {
        &self.notes
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusTotals {
    pub pass: usize,
    pub fail: usize,
    pub partial: usize,
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("не удалось создать каталог отчётов {path}: {source}")]
    CreateDir {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось записать отчёт {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось сериализовать отчёт в JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Append-only collector handed to every check as `&mut Report`.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    host: String,
    generated_at: DateTime<Local>,
    sections: BTreeMap<Category, Vec<CheckResult>>,
}

impl Report {
    pub fn new(host: impl Into<String>, generated_at: DateTime<Local>) -> Self {
        Self {
            host: host.into(),
            generated_at,
            sections: BTreeMap::new(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn generated_at(&self) -> DateTime<Local> {
        self.generated_at
    }

    pub fn push(&mut self, category: Category, result: CheckResult) {
        self.sections.entry(category).or_default().push(result);
    }

    pub fn sections(&self) -> impl Iterator<Item = (Category, &[CheckResult])> {
        self.sections
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(c, rows)| (*c, rows.as_slice()))
    }

    pub fn results(&self, category: Category) -> &[CheckResult] {
        self.sections
            .get(&category)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn totals(&self) -> StatusTotals {
        let mut totals = StatusTotals::default();
        for rows in self.sections.values() {
            for row in rows {
                match row.status {
                    CheckStatus::Pass => totals.pass += 1,
                    CheckStatus::Fail => totals.fail += 1,
                    CheckStatus::Partial => totals.partial += 1,
                }
            }
        }
        totals
    }

    pub fn file_stem(&self) -> String {
        let host: String = self
            .host
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!(
            "system_test_report_{}_{}",
            host,
            self.generated_at.format("%Y%m%d_%H%M%S")
        )
    }

    /// Writes the HTML report (and optionally its JSON twin) into `dir`.
    pub fn write_to_dir(&self, dir: &Path, with_json: bool) -> Result<PathBuf, ReportError> {
        fs::create_dir_all(dir).map_err(|source| ReportError::CreateDir {
            path: dir.display().to_string(),
            source,
        })?;

        let html_path = dir.join(format!("{}.html", self.file_stem()));
        write_file(&html_path, html::render(self).as_bytes())?;

        if with_json {
            let json_path = dir.join(format!("{}.json", self.file_stem()));
            let body = serde_json::to_vec_pretty(self)?;
            write_file(&json_path, &body)?;
        }

        Ok(html_path)
    }
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<(), ReportError> {
    fs::write(path, bytes).map_err(|source| ReportError::Write {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;

    pub(crate) fn fixed_time() -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2026, 10, 19, 14, 30, 5)
            .single()
            .expect("valid local time")
    }

    fn row(name: &str, status: CheckStatus) -> CheckResult {
        CheckResult::new(name, "cmd", "out", status, "")
    }

    #[test]
    fn sections_follow_declaration_order_and_skip_empty() {
        let mut report = Report::new("node01", fixed_time());
        report.push(Category::Gpu, row("nvidia-smi", CheckStatus::Pass));
        report.push(Category::System, row("uname", CheckStatus::Pass));
        report.push(Category::Gpu, row("topology", CheckStatus::Fail));

        let order: Vec<Category> = report.sections().map(|(c, _)| c).collect();
        assert_eq!(order, vec![Category::System, Category::Gpu]);

        let gpu: Vec<&str> = report
            .results(Category::Gpu)
            .iter()
            .map(|r| r.name())
            .collect();
        assert_eq!(gpu, vec!["nvidia-smi", "topology"]);
        assert!(report.results(Category::Ram).is_empty());
    }

    #[test]
    fn totals_count_each_status() {
        let mut report = Report::new("node01", fixed_time());
        report.push(Category::Cpu, row("a", CheckStatus::Pass));
        report.push(Category::Cpu, row("b", CheckStatus::Fail));
        report.push(Category::Ram, row("c", CheckStatus::Partial));
        report.push(Category::Ram, row("d", CheckStatus::Pass));

        assert_eq!(
            report.totals(),
            StatusTotals {
                pass: 2,
                fail: 1,
                partial: 1
            }
        );
    }

    #[test]
    fn flag_keys_round_trip() {
        assert_eq!(Category::NetworkSpeed.flag_key(), "run_network_speed_check");
        assert_eq!(
            Category::from_flag_key("run_infiniband_check"),
            Some(Category::Infiniband)
        );
        assert_eq!(Category::from_flag_key("run_toaster_check"), None);
        assert_eq!(Category::from_flag_key("gpu"), None);
    }

    #[test]
    fn file_stem_sanitizes_host_and_uses_timestamp() {
        let report = Report::new("gpu node/7", fixed_time());
        assert_eq!(
            report.file_stem(),
            "system_test_report_gpu_node_7_20261019_143005"
        );
    }

    #[test]
    fn write_to_dir_creates_html_and_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out_dir = dir.path().join("reports");
        let mut report = Report::new("node01", fixed_time());
        report.push(Category::System, row("uname", CheckStatus::Pass));

        let path = report.write_to_dir(&out_dir, true).expect("write report");
        assert!(path.exists());
        assert!(path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".html")));

        let json_path = path.with_extension("json");
        let json = fs::read_to_string(json_path).expect("json written");
        assert!(json.contains("\"PASS\""));
        assert!(json.contains("\"System\""));
    }
}
