//! apt package steps
//!
//! Detection uses dpkg-query, which needs no privileges. Installation goes
//! through the privilege provider. Neither step is parallel-safe: dpkg
//! holds a global lock.

use anyhow::Result;
use converge::{ApplyContext, ApplyReport, Step, StepState, UndoAction};
use std::path::Path;
use std::process::Command;
use std::time::{Duration, SystemTime};

/// An apt package to install
#[derive(Debug, Clone)]
pub struct AptPackage {
    pub name: String,
}

impl AptPackage {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Check the installed version via dpkg-query, None if not installed
    fn installed_version(&self) -> Option<String> {
        let output = Command::new("dpkg-query")
            .args(["-W", "-f", "${Status}\t${Version}", &self.name])
            .output()
            .ok()?;

        if !output.status.success() {
            return None;
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let (status, version) = stdout.split_once('\t')?;
        if status.trim() == "install ok installed" {
            Some(version.trim().to_string())
        } else {
            None
        }
    }
}

impl Step for AptPackage {
    fn id(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        format!("Install apt package {}", self.name)
    }

    fn step_type(&self) -> &'static str {
        "apt_package"
    }

    fn current_state(&self) -> Result<StepState> {
        match self.installed_version() {
            Some(version) => Ok(StepState::Present {
                details: Some(version),
            }),
            None => Ok(StepState::Absent),
        }
    }

    fn desired_state(&self) -> StepState {
        StepState::Present { details: None }
    }

    fn needs_apply(&self) -> Result<bool> {
        // Any installed version satisfies the step; versions aren't pinned
        Ok(self.installed_version().is_none())
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyReport> {
        if self.installed_version().is_some() {
            return Ok(ApplyReport::no_change());
        }

        if ctx.dry_run {
            return Ok(ApplyReport::skipped("dry run"));
        }

        let privilege = ctx.require_privilege()?;
        let output = privilege.run(
            "apt-get",
            &["install", "-y", "--no-install-recommends", &self.name],
        )?;
        if !output.success {
            anyhow::bail!(
                "apt-get install {} failed: {}",
                self.name,
                output.stderr_str().trim()
            );
        }

        Ok(ApplyReport::created(UndoAction::Irreversible {
            reason: "package installs are not reverted".to_string(),
        }))
    }

    fn parallel_safe(&self) -> bool {
        false
    }
}

/// Refresh the apt package index when it has gone stale
///
/// The index counts as fresh for a day; a run that installs nothing never
/// touches the network.
#[derive(Debug, Clone)]
pub struct AptCacheRefresh {
    max_age: Duration,
}

const APT_LISTS: &str = "/var/lib/apt/lists";

impl AptCacheRefresh {
    pub fn new() -> Self {
        Self {
            max_age: Duration::from_secs(24 * 60 * 60),
        }
    }

    fn index_age(&self) -> Option<Duration> {
        let modified = std::fs::metadata(APT_LISTS).ok()?.modified().ok()?;
        SystemTime::now().duration_since(modified).ok()
    }

    fn is_fresh(&self) -> bool {
        self.index_age().is_some_and(|age| age < self.max_age)
    }
}

impl Default for AptCacheRefresh {
    fn default() -> Self {
        Self::new()
    }
}

impl Step for AptCacheRefresh {
    fn id(&self) -> String {
        "index".to_string()
    }

    fn description(&self) -> String {
        "Refresh apt package index".to_string()
    }

    fn step_type(&self) -> &'static str {
        "apt_package"
    }

    fn current_state(&self) -> Result<StepState> {
        if self.is_fresh() {
            Ok(StepState::Present {
                details: Some("index fresh".to_string()),
            })
        } else {
            Ok(StepState::Drifted {
                from: "index stale".to_string(),
                to: "index fresh".to_string(),
            })
        }
    }

    fn desired_state(&self) -> StepState {
        StepState::Present {
            details: Some("index fresh".to_string()),
        }
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyReport> {
        if self.is_fresh() {
            return Ok(ApplyReport::no_change());
        }

        if ctx.dry_run {
            return Ok(ApplyReport::skipped("dry run"));
        }

        let privilege = ctx.require_privilege()?;
        let output = privilege.run("apt-get", &["update", "-q"])?;
        if !output.success {
            anyhow::bail!("apt-get update failed: {}", output.stderr_str().trim());
        }

        Ok(ApplyReport::modified(UndoAction::Irreversible {
            reason: "index refreshes are not reverted".to_string(),
        }))
    }

    fn parallel_safe(&self) -> bool {
        false
    }
}

/// Whether this host has the apt toolchain at all
pub fn apt_available() -> bool {
    Path::new("/usr/bin/apt-get").exists() || Path::new("/usr/bin/dpkg-query").exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge::StepExt;

    #[test]
    fn package_identity() {
        let pkg = AptPackage::new("nginx");
        assert_eq!(pkg.id(), "nginx");
        assert_eq!(pkg.step_type(), "apt_package");
        assert_eq!(pkg.label(), "apt_package:nginx");
        assert!(!pkg.parallel_safe());
    }

    #[test]
    fn desired_state_is_presence() {
        let pkg = AptPackage::new("python3-venv");
        assert!(pkg.desired_state().is_present());
    }

    #[test]
    fn dry_run_never_installs() {
        let pkg = AptPackage::new("deckhand-test-definitely-not-installed");
        let mut ctx = ApplyContext::new(true, false);
        let report = pkg.apply(&mut ctx).unwrap();
        assert!(matches!(
            report.result,
            converge::StepResult::Skipped { .. } | converge::StepResult::NoChange
        ));
    }

    #[test]
    fn cache_refresh_identity() {
        let refresh = AptCacheRefresh::new();
        assert_eq!(refresh.label(), "apt_package:index");
        assert!(!refresh.parallel_safe());
    }
}
