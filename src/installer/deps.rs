use crate::collectors::catalog::package_for;
use crate::collectors::{record, CheckSpec};
use crate::installer::{Confirm, InstallError, PackageInstaller};
use crate::report::{Category, CheckStatus, Report};
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsStr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyMode {
    /// `--noinstall`: missing tools simply make their checks fail.
    Skip,
    /// `--headless`
    Auto,
    Ask,
}

/// Tools an enabled category needs but PATH does not have.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MissingTools {
    /// apt package -> categories that need it
    pub packages: BTreeMap<String, BTreeSet<Category>>,
    /// Programs with no known package; left to fail at check time.
    pub unknown: BTreeSet<String>,
}

impl MissingTools {
    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }

    pub fn package_list(&self) -> Vec<String> {
        self.packages.keys().cloned().collect()
    }
}

pub fn find_on_path(program: &str, path_var: &OsStr) -> Option<PathBuf> {
    if program.contains('/') {
        let p = Path::new(program);
        return is_executable(p).then(|| p.to_path_buf());
    }
    std::env::split_paths(path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

pub fn missing_tools(specs: &[CheckSpec], path_var: &OsStr) -> MissingTools {
    let mut missing = MissingTools::default();
    let mut seen = BTreeSet::new();
    for spec in specs {
        let Some(program) = spec.program() else {
            continue;
        };
        if !seen.insert((spec.category, program.to_string())) {
            continue;
        }
        if find_on_path(program, path_var).is_some() {
            continue;
        }
        match package_for(program) {
            Some(pkg) => {
                missing
                    .packages
                    .entry(pkg.to_string())
                    .or_default()
                    .insert(spec.category);
            }
            None => {
                missing.unknown.insert(program.to_string());
            }
        }
    }
    missing
}

/// Installs what is missing according to `mode`. Declining is fatal; a
/// failed install becomes a FAIL row in every affected category.
pub async fn ensure_dependencies(
    report: &mut Report,
    missing: &MissingTools,
    mode: DependencyMode,
    confirm: &mut dyn Confirm,
    installer: &PackageInstaller,
) -> Result<(), InstallError> {
    if !missing.unknown.is_empty() {
        warn!(
            programs = %missing.unknown.iter().cloned().collect::<Vec<_>>().join(" "),
            "нет пакета для установки программ"
        );
    }
    if missing.is_empty() {
        info!("все необходимые программы найдены");
        return Ok(());
    }

    let packages = missing.package_list();
    match mode {
        DependencyMode::Skip => {
            warn!(packages = %packages.join(" "), "зависимости не установлены (--noinstall)");
            return Ok(());
        }
        DependencyMode::Auto => {}
        DependencyMode::Ask => {
            let question = format!("Установить недостающие пакеты: {}?", packages.join(" "));
            if !confirm.confirm(&question) {
                return Err(InstallError::Declined(packages));
            }
        }
    }

    let result = installer
        .install(Category::Software, "Install dependencies", &packages)
        .await;
    if result.status() != CheckStatus::Fail {
        info!(packages = %packages.join(" "), "зависимости установлены");
        return Ok(());
    }

    let affected: BTreeSet<Category> = missing.packages.values().flatten().copied().collect();
    for category in affected {
        record(report, category, result.clone());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::installer::AutoConfirm;
    use crate::report::tests::fixed_time;
    use std::ffi::OsString;
    use std::fs;

    struct Refuse(usize);

    impl Confirm for Refuse {
        fn confirm(&mut self, _question: &str) -> bool {
            self.0 += 1;
            false
        }
    }

    fn fake_bin(dir: &Path, name: &str, mode: u32) {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\n").expect("write");
        fs::set_permissions(&path, fs::Permissions::from_mode(mode)).expect("chmod");
    }

    fn specs() -> Vec<CheckSpec> {
        vec![
            CheckSpec::new(Category::Ethernet, "speed", &["ethtool", "eth0"]),
            CheckSpec::new(Category::Infiniband, "ports", &["ibstatus"]),
            CheckSpec::new(Category::Infiniband, "hca", &["ibstat"]),
            CheckSpec::new(Category::Cpu, "lscpu", &["lscpu"]),
            CheckSpec::new(Category::Gpu, "smi", &["nvidia-smi"]),
        ]
    }

    #[test]
    fn path_lookup_requires_the_executable_bit() {
        let dir = tempfile::tempdir().expect("tempdir");
        fake_bin(dir.path(), "ethtool", 0o755);
        fake_bin(dir.path(), "ibstat", 0o644);
        let path = OsString::from(dir.path());

        assert!(find_on_path("ethtool", &path).is_some());
        assert!(find_on_path("ibstat", &path).is_none());
        assert!(find_on_path("lscpu", &path).is_none());
    }

    #[test]
    fn missing_programs_group_by_package() {
        let dir = tempfile::tempdir().expect("tempdir");
        fake_bin(dir.path(), "lscpu", 0o755);
        let missing = missing_tools(&specs(), &OsString::from(dir.path()));

        assert_eq!(
            missing.package_list(),
            vec!["ethtool".to_string(), "infiniband-diags".to_string()]
        );
        assert_eq!(
            missing.packages["infiniband-diags"],
            BTreeSet::from([Category::Infiniband])
        );
        assert!(missing.unknown.contains("nvidia-smi"));
    }

    #[tokio::test]
    async fn declining_is_fatal() {
        let mut missing = MissingTools::default();
        missing
            .packages
            .insert("ethtool".to_string(), BTreeSet::from([Category::Ethernet]));
        let mut report = Report::new("node01", fixed_time());
        let mut refuse = Refuse(0);

        let err = ensure_dependencies(
            &mut report,
            &missing,
            DependencyMode::Ask,
            &mut refuse,
            &PackageInstaller::with_command(&["true"]),
        )
        .await
        .expect_err("declined");
        assert!(matches!(err, InstallError::Declined(ref p) if p == &vec!["ethtool".to_string()]));
        assert_eq!(refuse.0, 1);
    }

    #[tokio::test]
    async fn skip_mode_never_asks_or_installs() {
        let mut missing = MissingTools::default();
        missing
            .packages
            .insert("ethtool".to_string(), BTreeSet::from([Category::Ethernet]));
        let mut report = Report::new("node01", fixed_time());
        let mut refuse = Refuse(0);

        ensure_dependencies(
            &mut report,
            &missing,
            DependencyMode::Skip,
            &mut refuse,
            &PackageInstaller::with_command(&["false"]),
        )
        .await
        .expect("skip is fine");
        assert_eq!(refuse.0, 0);
        assert_eq!(report.sections().count(), 0);
    }

    #[tokio::test]
    async fn failed_install_lands_in_each_affected_category() {
        let mut missing = MissingTools::default();
        missing.packages.insert(
            "infiniband-diags".to_string(),
            BTreeSet::from([Category::Infiniband]),
        );
        missing
            .packages
            .insert("ethtool".to_string(), BTreeSet::from([Category::Ethernet]));
        let mut report = Report::new("node01", fixed_time());

        ensure_dependencies(
            &mut report,
            &missing,
            DependencyMode::Auto,
            &mut AutoConfirm(true),
            &PackageInstaller::with_command(&["false"]),
        )
        .await
        .expect("install failure is not fatal");

        for category in [Category::Ethernet, Category::Infiniband] {
            let rows = report.results(category);
            assert_eq!(rows.len(), 1);
            assert_eq!(rows[0].status(), CheckStatus::Fail);
            assert_eq!(rows[0].command(), "false ethtool infiniband-diags");
        }
    }
}
