//! Symlink step

use anyhow::{Context, Result, bail};
use converge::{ApplyContext, ApplyReport, Step, StepState, UndoAction};
use std::fs;
use std::path::{Path, PathBuf};

/// A symlink to create
#[derive(Debug, Clone)]
pub struct Symlink {
    /// Where the symlink is created
    pub link: PathBuf,
    /// What the symlink points to
    pub target: PathBuf,
}

impl Symlink {
    pub fn new(link: impl AsRef<Path>, target: impl AsRef<Path>) -> Self {
        Self {
            link: link.as_ref().to_path_buf(),
            target: target.as_ref().to_path_buf(),
        }
    }

    fn check_current(&self) -> Result<LinkState> {
        if !self.link.exists() && !self.link.is_symlink() {
            return Ok(LinkState::Missing);
        }

        if self.link.is_symlink() {
            let points_at = fs::read_link(&self.link).context("failed to read symlink")?;

            // Canonicalize for comparison
            let expected = self.target.canonicalize().unwrap_or_else(|_| self.target.clone());
            let actual = if points_at.is_absolute() {
                points_at.canonicalize().unwrap_or(points_at)
            } else {
                self.link
                    .parent()
                    .map(|p| p.join(&points_at))
                    .and_then(|p| p.canonicalize().ok())
                    .unwrap_or(points_at)
            };

            if expected == actual {
                Ok(LinkState::Correct)
            } else {
                Ok(LinkState::WrongTarget(actual))
            }
        } else {
            Ok(LinkState::FileExists)
        }
    }

    fn create_local(&self) -> Result<()> {
        if !self.target.exists() {
            bail!("symlink target does not exist: {}", self.target.display());
        }

        if let Some(parent) = self.link.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        if self.link.is_symlink() {
            fs::remove_file(&self.link)
                .with_context(|| format!("failed to remove old symlink {}", self.link.display()))?;
        }

        std::os::unix::fs::symlink(&self.target, &self.link).with_context(|| {
            format!(
                "failed to create symlink {} -> {}",
                self.link.display(),
                self.target.display()
            )
        })?;

        Ok(())
    }

    fn create_privileged(&self, ctx: &ApplyContext) -> Result<()> {
        let privilege = ctx.require_privilege()?;
        let target = self.target.to_string_lossy().to_string();
        let link = self.link.to_string_lossy().to_string();

        let output = privilege.run("ln", &["-sfn", &target, &link])?;
        if !output.success {
            bail!("ln -sfn failed: {}", output.stderr_str().trim());
        }
        Ok(())
    }
}

#[derive(Debug)]
enum LinkState {
    Missing,
    Correct,
    WrongTarget(PathBuf),
    FileExists,
}

impl Step for Symlink {
    fn id(&self) -> String {
        self.link.to_string_lossy().to_string()
    }

    fn description(&self) -> String {
        format!("Symlink {} -> {}", self.link.display(), self.target.display())
    }

    fn step_type(&self) -> &'static str {
        "symlink"
    }

    fn current_state(&self) -> Result<StepState> {
        match self.check_current()? {
            LinkState::Missing => Ok(StepState::Absent),
            LinkState::Correct => Ok(StepState::Present {
                details: Some(format!("-> {}", self.target.display())),
            }),
            LinkState::WrongTarget(actual) => Ok(StepState::Drifted {
                from: actual.to_string_lossy().to_string(),
                to: self.target.to_string_lossy().to_string(),
            }),
            LinkState::FileExists => Ok(StepState::Drifted {
                from: "regular file".to_string(),
                to: format!("symlink -> {}", self.target.display()),
            }),
        }
    }

    fn desired_state(&self) -> StepState {
        StepState::Present {
            details: Some(format!("-> {}", self.target.display())),
        }
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyReport> {
        match self.check_current()? {
            LinkState::Correct => Ok(ApplyReport::no_change()),
            LinkState::Missing => {
                if ctx.dry_run {
                    return Ok(ApplyReport::skipped("dry run"));
                }
                if ctx.privilege.is_some() {
                    self.create_privileged(ctx)?;
                } else {
                    self.create_local()?;
                }
                Ok(ApplyReport::created(UndoAction::RemovePath(self.link.clone())))
            }
            LinkState::WrongTarget(_) => {
                if ctx.dry_run {
                    return Ok(ApplyReport::skipped("dry run"));
                }
                if ctx.privilege.is_some() {
                    self.create_privileged(ctx)?;
                } else {
                    self.create_local()?;
                }
                // Old link target is gone; removing the link is the best undo
                Ok(ApplyReport::modified(UndoAction::RemovePath(self.link.clone())))
            }
            // Don't overwrite existing files automatically
            LinkState::FileExists => Ok(ApplyReport::skipped(format!(
                "regular file exists at {}",
                self.link.display()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge::StepResult;

    #[test]
    fn missing_link_is_absent() {
        let dir = tempfile::tempdir().unwrap();
        let step = Symlink::new(dir.path().join("link"), dir.path().join("target"));
        assert_eq!(step.current_state().unwrap(), StepState::Absent);
    }

    #[test]
    fn creates_link_with_undo() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        fs::write(&target, "x").unwrap();
        let link = dir.path().join("link");

        let step = Symlink::new(&link, &target);
        let mut ctx = ApplyContext::new(false, false);
        let report = step.apply(&mut ctx).unwrap();

        assert_eq!(report.result, StepResult::Created);
        assert_eq!(report.undo, Some(UndoAction::RemovePath(link.clone())));
        assert_eq!(fs::read_link(&link).unwrap(), target);
    }

    #[test]
    fn correct_link_is_no_change() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        fs::write(&target, "x").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let step = Symlink::new(&link, &target);
        assert!(!step.needs_apply().unwrap());

        let mut ctx = ApplyContext::new(false, false);
        let report = step.apply(&mut ctx).unwrap();
        assert_eq!(report.result, StepResult::NoChange);
    }

    #[test]
    fn wrong_target_is_fixed() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old");
        let new = dir.path().join("new");
        fs::write(&old, "x").unwrap();
        fs::write(&new, "x").unwrap();
        let link = dir.path().join("link");
        std::os::unix::fs::symlink(&old, &link).unwrap();

        let step = Symlink::new(&link, &new);
        assert!(matches!(
            step.current_state().unwrap(),
            StepState::Drifted { .. }
        ));

        let mut ctx = ApplyContext::new(false, false);
        let report = step.apply(&mut ctx).unwrap();
        assert_eq!(report.result, StepResult::Modified);
        assert_eq!(fs::read_link(&link).unwrap(), new);
    }

    #[test]
    fn existing_file_is_not_clobbered() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        fs::write(&target, "x").unwrap();
        let link = dir.path().join("link");
        fs::write(&link, "precious").unwrap();

        let step = Symlink::new(&link, &target);
        let mut ctx = ApplyContext::new(false, false);
        let report = step.apply(&mut ctx).unwrap();

        assert!(matches!(report.result, StepResult::Skipped { .. }));
        assert_eq!(fs::read_to_string(&link).unwrap(), "precious");
    }
}
