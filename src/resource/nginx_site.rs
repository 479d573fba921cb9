//! nginx site step
//!
//! One step owns both halves of the Debian nginx layout: the config under
//! sites-available and the activation symlink under sites-enabled. When
//! validation is on, `nginx -t` runs after any change and a failing config
//! is rolled back immediately rather than left for the reload to reject.

use anyhow::{Result, bail};
use converge::{ApplyContext, ApplyReport, Step, StepResult, StepState, UndoAction};
use std::fs;
use std::path::PathBuf;
use std::process::Command;

use super::file::{ensure_file_content, file_state};

const NGINX_DIR: &str = "/etc/nginx";

/// An nginx site: config file plus sites-enabled symlink
#[derive(Debug, Clone)]
pub struct NginxSite {
    pub name: String,
    pub content: String,
    pub validate: bool,
    nginx_dir: PathBuf,
}

impl NginxSite {
    pub fn new(name: impl Into<String>, content: impl Into<String>, validate: bool) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            validate,
            nginx_dir: PathBuf::from(NGINX_DIR),
        }
    }

    /// Override the nginx directory (tests, chroots)
    pub fn with_nginx_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.nginx_dir = dir.into();
        self
    }

    pub fn available_path(&self) -> PathBuf {
        self.nginx_dir.join("sites-available").join(&self.name)
    }

    pub fn enabled_path(&self) -> PathBuf {
        self.nginx_dir.join("sites-enabled").join(&self.name)
    }

    fn link_correct(&self) -> bool {
        let enabled = self.enabled_path();
        enabled.is_symlink()
            && fs::read_link(&enabled)
                .map(|t| {
                    let resolved = if t.is_absolute() {
                        t
                    } else {
                        enabled.parent().map(|p| p.join(&t)).unwrap_or(t)
                    };
                    resolved.canonicalize().ok() == self.available_path().canonicalize().ok()
                })
                .unwrap_or(false)
    }

    fn ensure_link(&self, ctx: &ApplyContext) -> Result<bool> {
        if self.link_correct() {
            return Ok(false);
        }

        let available = self.available_path();
        let enabled = self.enabled_path();

        if let Some(privilege) = ctx.privilege {
            let available = available.to_string_lossy().to_string();
            let enabled = enabled.to_string_lossy().to_string();
            let output = privilege.run("ln", &["-sfn", &available, &enabled])?;
            if !output.success {
                bail!("ln -sfn failed: {}", output.stderr_str().trim());
            }
        } else {
            if let Some(parent) = enabled.parent() {
                fs::create_dir_all(parent)?;
            }
            if enabled.is_symlink() {
                fs::remove_file(&enabled)?;
            }
            std::os::unix::fs::symlink(&available, &enabled)?;
        }
        Ok(true)
    }

    fn config_test(&self, ctx: &ApplyContext) -> Result<()> {
        let ok = if let Some(privilege) = ctx.privilege {
            privilege.run("nginx", &["-t"])?.success
        } else {
            Command::new("nginx")
                .arg("-t")
                .output()
                .map(|o| o.status.success())
                .unwrap_or(false)
        };
        if !ok {
            bail!("nginx -t rejected the configuration for site {}", self.name);
        }
        Ok(())
    }

    /// Best-effort revert of a change that nginx -t rejected
    fn revert_file(&self, ctx: &ApplyContext, undo: &UndoAction) {
        let result: Result<()> = match undo {
            UndoAction::RemovePath(path) => {
                let enabled = self.enabled_path();
                if let Some(privilege) = ctx.privilege {
                    let path = path.to_string_lossy().to_string();
                    let enabled = enabled.to_string_lossy().to_string();
                    privilege
                        .run("rm", &["-f", &path, &enabled])
                        .map(|_| ())
                } else {
                    let _ = fs::remove_file(path);
                    let _ = fs::remove_file(&enabled);
                    Ok(())
                }
            }
            UndoAction::RestoreFile { backup, target } => {
                if let Some(privilege) = ctx.privilege {
                    let backup = backup.to_string_lossy().to_string();
                    let target = target.to_string_lossy().to_string();
                    privilege
                        .run("cp", &["-p", &backup, &target])
                        .and_then(|_| privilege.run("rm", &["-f", &backup]))
                        .map(|_| ())
                } else {
                    fs::copy(backup, target)
                        .and_then(|_| fs::remove_file(backup))
                        .map(|_| ())
                        .map_err(Into::into)
                }
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            log::warn!("could not revert rejected site {}: {e}", self.name);
        }
    }
}

impl Step for NginxSite {
    fn id(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        format!("nginx site {}", self.name)
    }

    fn step_type(&self) -> &'static str {
        "nginx_site"
    }

    fn current_state(&self) -> Result<StepState> {
        let file = file_state(&self.available_path(), self.content.as_bytes(), Some(0o644))?;
        let linked = self.link_correct();

        match (file, linked) {
            (StepState::Present { .. }, true) => Ok(StepState::Present {
                details: Some("enabled".to_string()),
            }),
            (StepState::Absent, false) => Ok(StepState::Absent),
            (StepState::Present { .. }, false) => Ok(StepState::Drifted {
                from: "config present, not enabled".to_string(),
                to: "enabled".to_string(),
            }),
            (StepState::Drifted { from, .. }, _) => Ok(StepState::Drifted {
                from: format!("config {from}"),
                to: "enabled".to_string(),
            }),
            (StepState::Absent, true) => Ok(StepState::Drifted {
                from: "dangling sites-enabled link".to_string(),
                to: "enabled".to_string(),
            }),
            (StepState::Unknown, _) => Ok(StepState::Unknown),
        }
    }

    fn desired_state(&self) -> StepState {
        StepState::Present {
            details: Some("enabled".to_string()),
        }
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyReport> {
        let converged = matches!(
            file_state(&self.available_path(), self.content.as_bytes(), Some(0o644))?,
            StepState::Present { .. }
        ) && self.link_correct();
        if converged {
            return Ok(ApplyReport::no_change());
        }

        if ctx.dry_run {
            return Ok(ApplyReport::skipped("dry run"));
        }

        let file_report =
            ensure_file_content(ctx, &self.available_path(), self.content.as_bytes(), Some(0o644), None, None)?;
        let link_changed = self.ensure_link(ctx)?;

        if self.validate {
            if let Err(e) = self.config_test(ctx) {
                if let Some(undo) = &file_report.undo {
                    self.revert_file(ctx, undo);
                }
                return Err(e);
            }
        }

        let report = match (&file_report.result, &file_report.undo) {
            (StepResult::Created, _) => ApplyReport::created(UndoAction::RunCommand {
                program: "rm".to_string(),
                args: vec![
                    "-f".to_string(),
                    self.available_path().to_string_lossy().to_string(),
                    self.enabled_path().to_string_lossy().to_string(),
                ],
            }),
            (StepResult::Modified, Some(undo)) => ApplyReport::modified(undo.clone()),
            _ if link_changed => {
                ApplyReport::modified(UndoAction::RemovePath(self.enabled_path()))
            }
            _ => ApplyReport::no_change(),
        };

        Ok(report)
    }
}
