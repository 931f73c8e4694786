//! Startup readiness probe.
//!
//! The agent refuses to start unless the host's cgroup plumbing is in
//! place and no pending reboot involves the agent's own package: quota
//! enforcement silently degrades otherwise. The probe checks that
//!
//! 1. the cgroup rules engine service is active,
//! 2. the `cpu` and `memory` cgroup mounts exist,
//! 3. `/etc/cgrules.conf` carries the sashiuser rule, and
//! 4. `/run/reboot-required.pkgs` does not list the agent package.

use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;
use tracing::info;

use super::{HostError, run_command};

/// Rule the cgroup rules config must contain. The exact expression is
/// load-bearing: the install tooling writes this line and the probe must
/// accept precisely what it writes.
const CGRULES_PATTERN: &str = r"(^|\n)(\s*)@sashiuser(\s+)cpu,memory(\s+)%u-cg(\s*)($|\n)";

/// Package tag that marks a pending reboot as ours.
const REBOOT_PATTERN: &str = r"(^|\n)(\s*)sashimono(\s*)($|\n)";

/// Why the host is not ready.
#[derive(Debug, Error)]
pub enum ReadinessError {
    /// No cgroup rules engine service was found or it is not active.
    #[error("cgroup rules service is not active")]
    RulesServiceInactive,

    /// A required cgroup mount is missing.
    #[error("cgroup mount {0} does not exist")]
    CgroupMountMissing(PathBuf),

    /// The cgroup rules config lacks the sashiuser rule.
    #[error("cgrules config {0} does not carry the sashiuser rule")]
    CgrulesRuleMissing(PathBuf),

    /// A reboot involving the agent package is pending.
    #[error("a pending reboot lists the agent package")]
    RebootPending,

    /// A probe step could not read the host state.
    #[error("probe I/O failure: {0}")]
    Io(#[from] std::io::Error),

    /// Running a probe command failed.
    #[error("probe command failure: {0}")]
    Command(#[from] HostError),
}

/// Host paths consulted by the probe. Defaults are the real locations;
/// tests point them into a scratch directory.
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    /// Directory scanned for the rules-engine unit file.
    pub systemd_dir: PathBuf,
    /// The cgroup cpu mount.
    pub cgroup_cpu_dir: PathBuf,
    /// The cgroup memory mount.
    pub cgroup_mem_dir: PathBuf,
    /// The cgroup rules config file.
    pub cgrules_conf: PathBuf,
    /// The pending-reboot marker file.
    pub reboot_file: PathBuf,
}

impl Default for ReadinessProbe {
    fn default() -> Self {
        Self {
            systemd_dir: PathBuf::from("/etc/systemd/system"),
            cgroup_cpu_dir: PathBuf::from("/sys/fs/cgroup/cpu"),
            cgroup_mem_dir: PathBuf::from("/sys/fs/cgroup/memory"),
            cgrules_conf: PathBuf::from("/etc/cgrules.conf"),
            reboot_file: PathBuf::from("/run/reboot-required.pkgs"),
        }
    }
}

impl ReadinessProbe {
    /// Runs every readiness condition, failing on the first violation.
    ///
    /// # Errors
    ///
    /// Returns the first failed condition as a [`ReadinessError`].
    pub async fn check(&self) -> Result<(), ReadinessError> {
        let service =
            find_cgrules_service(&self.systemd_dir)?.ok_or(ReadinessError::RulesServiceInactive)?;
        let output = run_command("systemctl", ["is-active", service.as_str()], &[], None).await?;
        if output.stdout.trim() != "active" {
            return Err(ReadinessError::RulesServiceInactive);
        }

        for mount in [&self.cgroup_cpu_dir, &self.cgroup_mem_dir] {
            if !mount.is_dir() {
                return Err(ReadinessError::CgroupMountMissing(mount.clone()));
            }
        }

        let rules = std::fs::read_to_string(&self.cgrules_conf)
            .map_err(|_| ReadinessError::CgrulesRuleMissing(self.cgrules_conf.clone()))?;
        if !cgrules_rule_present(&rules) {
            return Err(ReadinessError::CgrulesRuleMissing(self.cgrules_conf.clone()));
        }

        if self.reboot_file.exists() {
            let pending = std::fs::read_to_string(&self.reboot_file)?;
            if reboot_pending_for_agent(&pending) {
                return Err(ReadinessError::RebootPending);
            }
        }

        info!("host readiness probe passed");
        Ok(())
    }
}

/// Scans the systemd unit directory for a service whose `ExecStart` runs
/// `cgrulesengd`, returning the unit name.
///
/// # Errors
///
/// Returns an I/O error when the directory cannot be read.
pub fn find_cgrules_service(systemd_dir: &Path) -> Result<Option<String>, std::io::Error> {
    let exec_line = Regex::new(r"ExecStart.*=.*/cgrulesengd$").unwrap();
    let mut entries: Vec<PathBuf> = std::fs::read_dir(systemd_dir)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "service"))
        .collect();
    entries.sort();

    for path in entries {
        let Ok(contents) = std::fs::read_to_string(&path) else {
            continue;
        };
        if contents.lines().any(|line| exec_line.is_match(line.trim())) {
            let name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());
            return Ok(name);
        }
    }
    Ok(None)
}

/// True when the cgroup rules config carries the sashiuser rule.
#[must_use]
pub fn cgrules_rule_present(contents: &str) -> bool {
    Regex::new(CGRULES_PATTERN).unwrap().is_match(contents)
}

/// True when the pending-reboot marker lists the agent package.
#[must_use]
pub fn reboot_pending_for_agent(contents: &str) -> bool {
    Regex::new(REBOOT_PATTERN).unwrap().is_match(contents)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_matcher_accepts_the_installed_line() {
        assert!(cgrules_rule_present("@sashiuser cpu,memory %u-cg\n"));
        assert!(cgrules_rule_present(
            "# managed\n  @sashiuser\tcpu,memory\t%u-cg  \nother dev %g\n"
        ));
    }

    #[test]
    fn rule_matcher_rejects_lookalikes() {
        assert!(!cgrules_rule_present("@sashiuser cpu %u-cg\n"));
        assert!(!cgrules_rule_present("@sashiusers cpu,memory %u-cg\n"));
        assert!(!cgrules_rule_present(""));
    }

    #[test]
    fn reboot_matcher_requires_whole_token() {
        assert!(reboot_pending_for_agent("sashimono\n"));
        assert!(reboot_pending_for_agent("libc6\n  sashimono  \n"));
        assert!(!reboot_pending_for_agent("sashimono-agent\n"));
        assert!(!reboot_pending_for_agent("libc6\n"));
    }

    #[test]
    fn finds_the_rules_engine_unit() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("other.service"),
            "[Service]\nExecStart=/usr/bin/otherd\n",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("sashimono-cgrules.service"),
            "[Service]\nExecStart=/usr/sbin/cgrulesengd\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ExecStart=/x/cgrulesengd\n").unwrap();

        let found = find_cgrules_service(dir.path()).unwrap();
        assert_eq!(found.as_deref(), Some("sashimono-cgrules.service"));
    }

    #[test]
    fn missing_unit_yields_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(find_cgrules_service(dir.path()).unwrap(), None);
    }
}
