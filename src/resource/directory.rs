//! Directory step

use anyhow::{Context, Result};
use converge::{ApplyContext, ApplyReport, Step, StepState, UndoAction};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// A directory to create with optional ownership and mode
///
/// Ownership is applied but not drift-checked: resolving uid/gid locally
/// would need root for system paths anyway, and re-applying `chown` on an
/// already-correct directory is harmless.
#[derive(Debug, Clone)]
pub struct Directory {
    pub path: PathBuf,
    pub owner: Option<String>,
    pub group: Option<String>,
    /// Octal mode, already parsed
    pub mode: Option<u32>,
}

impl Directory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            owner: None,
            group: None,
            mode: None,
        }
    }

    pub fn with_attrs(mut self, owner: Option<String>, group: Option<String>, mode: Option<u32>) -> Self {
        self.owner = owner;
        self.group = group;
        self.mode = mode;
        self
    }

    fn current_mode(&self) -> Option<u32> {
        fs::metadata(&self.path)
            .ok()
            .map(|m| m.permissions().mode() & 0o7777)
    }

    fn mode_string(&self) -> Option<String> {
        self.mode.map(|m| format!("{m:04o}"))
    }

    fn owner_spec(&self) -> Option<String> {
        match (&self.owner, &self.group) {
            (Some(o), Some(g)) => Some(format!("{o}:{g}")),
            (Some(o), None) => Some(o.clone()),
            (None, Some(g)) => Some(format!(":{g}")),
            (None, None) => None,
        }
    }

    fn create_local(&self) -> Result<()> {
        fs::create_dir_all(&self.path)
            .with_context(|| format!("could not create {}", self.path.display()))?;
        if let Some(mode) = self.mode {
            fs::set_permissions(&self.path, fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    }

    fn create_privileged(&self, ctx: &ApplyContext) -> Result<()> {
        let privilege = ctx.require_privilege()?;
        let path = self.path.to_string_lossy().to_string();

        let mode = self.mode_string();
        let mut args = vec!["-d"];
        if let Some(mode) = &mode {
            args.push("-m");
            args.push(mode);
        }
        let owner = self.owner.clone();
        let group = self.group.clone();
        if let Some(owner) = &owner {
            args.push("-o");
            args.push(owner);
        }
        if let Some(group) = &group {
            args.push("-g");
            args.push(group);
        }
        args.push(&path);

        let output = privilege.run("install", &args)?;
        if !output.success {
            anyhow::bail!(
                "install -d {} failed: {}",
                self.path.display(),
                output.stderr_str().trim()
            );
        }
        Ok(())
    }

    fn fix_mode(&self, ctx: &ApplyContext, mode: u32) -> Result<()> {
        if let Some(privilege) = ctx.privilege {
            let mode = format!("{mode:04o}");
            let path = self.path.to_string_lossy().to_string();
            let output = privilege.run("chmod", &[&mode, &path])?;
            if !output.success {
                anyhow::bail!("chmod failed: {}", output.stderr_str().trim());
            }
        } else {
            fs::set_permissions(&self.path, fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    }
}

fn exists_as_dir(path: &Path) -> bool {
    path.is_dir()
}

impl Step for Directory {
    fn id(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    fn description(&self) -> String {
        format!("Directory {}", self.path.display())
    }

    fn step_type(&self) -> &'static str {
        "directory"
    }

    fn current_state(&self) -> Result<StepState> {
        if !exists_as_dir(&self.path) {
            return Ok(StepState::Absent);
        }

        if let (Some(desired), Some(actual)) = (self.mode, self.current_mode())
            && desired != actual
        {
            return Ok(StepState::Drifted {
                from: format!("mode {actual:04o}"),
                to: format!("mode {desired:04o}"),
            });
        }

        Ok(StepState::Present {
            details: self.mode_string().map(|m| format!("mode {m}")),
        })
    }

    fn desired_state(&self) -> StepState {
        StepState::Present {
            details: self.mode_string().map(|m| format!("mode {m}")),
        }
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyReport> {
        let existed = exists_as_dir(&self.path);

        if existed {
            let desired = self.mode;
            let actual = self.current_mode();
            if let (Some(desired), Some(actual)) = (desired, actual)
                && desired != actual
            {
                if ctx.dry_run {
                    return Ok(ApplyReport::skipped("dry run"));
                }
                self.fix_mode(ctx, desired)?;
                return Ok(ApplyReport::modified(UndoAction::RunCommand {
                    program: "chmod".to_string(),
                    args: vec![
                        format!("{actual:04o}"),
                        self.path.to_string_lossy().to_string(),
                    ],
                }));
            }
            return Ok(ApplyReport::no_change());
        }

        if ctx.dry_run {
            return Ok(ApplyReport::skipped("dry run"));
        }

        if ctx.privilege.is_some() {
            self.create_privileged(ctx)?;
        } else {
            self.create_local()?;
            // chown only makes sense with privileges; locally the creator owns it
            if self.owner_spec().is_some() {
                log::debug!(
                    "skipping chown for {} (no privileges)",
                    self.path.display()
                );
            }
        }

        Ok(ApplyReport::created(UndoAction::RemoveDir(self.path.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge::StepResult;

    #[test]
    fn absent_directory_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let step = Directory::new(dir.path().join("missing"));
        assert_eq!(step.current_state().unwrap(), StepState::Absent);
        assert!(step.needs_apply().unwrap());
    }

    #[test]
    fn existing_directory_is_present() {
        let dir = tempfile::tempdir().unwrap();
        let step = Directory::new(dir.path());
        assert!(step.current_state().unwrap().is_present());
    }

    #[test]
    fn creates_directory_with_mode() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("opt").join("app");
        let step = Directory::new(&target).with_attrs(None, None, Some(0o750));

        let mut ctx = ApplyContext::new(false, false);
        let report = step.apply(&mut ctx).unwrap();

        assert_eq!(report.result, StepResult::Created);
        assert_eq!(report.undo, Some(UndoAction::RemoveDir(target.clone())));
        assert!(target.is_dir());
        let mode = fs::metadata(&target).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o750);
    }

    #[test]
    fn second_apply_is_no_change() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("app");
        let step = Directory::new(&target);

        let mut ctx = ApplyContext::new(false, false);
        step.apply(&mut ctx).unwrap();
        let report = step.apply(&mut ctx).unwrap();
        assert_eq!(report.result, StepResult::NoChange);
    }

    #[test]
    fn mode_drift_is_corrected_with_undo() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("app");
        fs::create_dir(&target).unwrap();
        fs::set_permissions(&target, fs::Permissions::from_mode(0o777)).unwrap();

        let step = Directory::new(&target).with_attrs(None, None, Some(0o755));
        assert!(matches!(
            step.current_state().unwrap(),
            StepState::Drifted { .. }
        ));

        let mut ctx = ApplyContext::new(false, false);
        let report = step.apply(&mut ctx).unwrap();
        assert_eq!(report.result, StepResult::Modified);
        assert!(matches!(
            report.undo,
            Some(UndoAction::RunCommand { ref program, .. }) if program == "chmod"
        ));
        let mode = fs::metadata(&target).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o755);
    }

    #[test]
    fn dry_run_creates_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("app");
        let step = Directory::new(&target);

        let mut ctx = ApplyContext::new(true, false);
        let report = step.apply(&mut ctx).unwrap();
        assert!(matches!(report.result, StepResult::Skipped { .. }));
        assert!(!target.exists());
    }
}
