//! Scoped sudo context with deterministic classification
//!
//! Sudo is never requested for the entire process. Instead:
//! 1. Classification decides which steps need root (by type and path)
//! 2. All diffs are computed first (no sudo needed)
//! 3. Sudo is acquired once, before the first privileged batch
//! 4. Sudo is released when the context drops

use anyhow::{Context, Result, bail};
use converge::{CommandOutput, PrivilegeClassifier, PrivilegeProvider};
use std::path::Path;
use std::process::{Command, Output};

use crate::manifest::PrivilegeConfig;

/// Path-based privilege classification
///
/// Package, unit, service, and nginx steps always need root. Filesystem
/// steps need root unless their path sits under the home directory or a
/// configured unprivileged root.
#[derive(Debug, Clone, Default)]
pub struct SudoRules {
    unprivileged_roots: Vec<String>,
    home: Option<String>,
}

impl SudoRules {
    pub fn new(config: &PrivilegeConfig) -> Self {
        Self {
            unprivileged_roots: config.unprivileged_roots.clone(),
            home: dirs::home_dir().map(|p| p.to_string_lossy().to_string()),
        }
    }

    /// Check whether a filesystem path can be written without root
    pub fn path_is_unprivileged(&self, path: &str) -> bool {
        if let Some(home) = &self.home
            && Path::new(path).starts_with(home)
        {
            return true;
        }
        self.unprivileged_roots
            .iter()
            .any(|root| Path::new(path).starts_with(root))
    }
}

impl PrivilegeClassifier for SudoRules {
    fn requires_root(&self, step_type: &str, step_id: &str) -> bool {
        match step_type {
            "apt_package" | "systemd_unit" | "service" | "nginx_site" => true,
            "directory" | "file" | "app_tree" | "symlink" | "python_venv" => {
                !self.path_is_unprivileged(step_id)
            }
            _ => false,
        }
    }
}

/// Scoped sudo context - invalidates the timestamp on drop
pub struct SudoContext {
    validated: bool,
}

impl SudoContext {
    /// Acquire sudo privileges with a reason shown to the user
    pub fn acquire(reason: &str) -> Result<Self> {
        if Self::is_valid() {
            log::debug!("sudo timestamp still valid, not prompting");
            return Ok(Self { validated: true });
        }

        eprintln!();
        eprintln!("  Root required: {reason}");
        eprintln!();

        // Validate sudo (will prompt for password)
        let status = Command::new("sudo")
            .args(["-v"])
            .status()
            .context("failed to execute sudo")?;

        if !status.success() {
            bail!("failed to acquire sudo privileges");
        }

        Ok(Self { validated: true })
    }

    /// Check if sudo is currently valid (without prompting)
    pub fn is_valid() -> bool {
        Command::new("sudo")
            .args(["-n", "true"])
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    fn run_internal(&self, cmd: &str, args: &[&str]) -> Result<Output> {
        if !self.validated {
            bail!("sudo context not validated");
        }

        let output = Command::new("sudo")
            .arg(cmd)
            .args(args)
            .output()
            .with_context(|| format!("failed to execute: sudo {cmd} {args:?}"))?;

        Ok(output)
    }
}

impl PrivilegeProvider for SudoContext {
    fn run(&self, cmd: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = self.run_internal(cmd, args)?;
        Ok(output.into())
    }
}

impl Drop for SudoContext {
    fn drop(&mut self) {
        // Invalidate sudo timestamp to release privileges
        let _ = Command::new("sudo").args(["-k"]).status();
    }
}

/// Provider that runs commands directly, for processes already root
///
/// Used when deckhand itself runs as root (cloud-init, CI), where wrapping
/// every command in sudo is pointless.
pub struct DirectRoot;

impl DirectRoot {
    /// Whether the current process is already running as root
    ///
    /// Asks `id -u` rather than reading `$USER`: cloud-init and cron run
    /// with a stripped environment where that variable is unset.
    pub fn applies() -> bool {
        Command::new("id")
            .arg("-u")
            .output()
            .map(|o| o.status.success() && String::from_utf8_lossy(&o.stdout).trim() == "0")
            .unwrap_or(false)
    }
}

impl PrivilegeProvider for DirectRoot {
    fn run(&self, cmd: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(cmd)
            .args(args)
            .output()
            .with_context(|| format!("failed to execute: {cmd} {args:?}"))?;
        Ok(output.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules(unprivileged: &[&str]) -> SudoRules {
        SudoRules {
            unprivileged_roots: unprivileged.iter().map(ToString::to_string).collect(),
            home: Some("/home/ubuntu".to_string()),
        }
    }

    #[test]
    fn packages_and_services_always_need_root() {
        let r = rules(&[]);
        assert!(r.requires_root("apt_package", "nginx"));
        assert!(r.requires_root("systemd_unit", "bot.service"));
        assert!(r.requires_root("service", "bot"));
        assert!(r.requires_root("nginx_site", "bot"));
    }

    #[test]
    fn system_paths_need_root() {
        let r = rules(&[]);
        assert!(r.requires_root("directory", "/opt/app"));
        assert!(r.requires_root("file", "/etc/app.conf"));
    }

    #[test]
    fn home_paths_do_not_need_root() {
        let r = rules(&[]);
        assert!(!r.requires_root("file", "/home/ubuntu/.config/app.conf"));
        assert!(!r.requires_root("symlink", "/home/ubuntu/bin/app"));
    }

    #[test]
    fn configured_roots_do_not_need_root() {
        let r = rules(&["/tmp/deckhand-test"]);
        assert!(!r.requires_root("directory", "/tmp/deckhand-test/opt/app"));
        assert!(r.requires_root("directory", "/tmp/elsewhere"));
    }

    #[test]
    fn prefix_matching_is_component_wise() {
        let r = rules(&["/tmp/root"]);
        // /tmp/rooted is not under /tmp/root
        assert!(r.requires_root("file", "/tmp/rooted/x"));
    }

    #[test]
    fn direct_root_tracks_the_effective_uid() {
        let output = Command::new("id").arg("-u").output().unwrap();
        let is_root = String::from_utf8_lossy(&output.stdout).trim() == "0";
        assert_eq!(DirectRoot::applies(), is_root);
    }
}
