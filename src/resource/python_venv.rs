//! Python virtualenv step
//!
//! A venv is converged when it exists and its stamp file records the hash
//! of the current requirements. `pip install -r` is only run when the
//! requirements change; an unchanged venv costs one file read per run.
//! The stamp is written after a successful install, so a failed install
//! re-runs next time.

use anyhow::{Context, Result, bail};
use converge::{ApplyContext, ApplyReport, Step, StepState, UndoAction};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

const STAMP_NAME: &str = ".deckhand-requirements";

/// A Python virtualenv with optional requirements
#[derive(Debug, Clone)]
pub struct PythonVenv {
    pub path: PathBuf,
    pub requirements: Option<PathBuf>,
    pub python: String,
}

impl PythonVenv {
    pub fn new(path: impl Into<PathBuf>, requirements: Option<PathBuf>, python: String) -> Self {
        Self {
            path: path.into(),
            requirements,
            python,
        }
    }

    fn venv_exists(&self) -> bool {
        self.path.join("pyvenv.cfg").is_file()
    }

    fn stamp_path(&self) -> PathBuf {
        self.path.join(STAMP_NAME)
    }

    /// Hash of the requirements file content, None when no requirements
    fn requirements_hash(&self) -> Result<Option<String>> {
        match &self.requirements {
            Some(reqs) => {
                let content = fs::read(reqs)
                    .with_context(|| format!("could not read {}", reqs.display()))?;
                Ok(Some(blake3::hash(&content).to_hex().to_string()))
            }
            None => Ok(None),
        }
    }

    fn recorded_hash(&self) -> Option<String> {
        fs::read_to_string(self.stamp_path())
            .ok()
            .map(|s| s.trim().to_string())
    }

    fn run_tool(&self, ctx: &ApplyContext, program: &str, args: &[&str]) -> Result<()> {
        if let Some(privilege) = ctx.privilege {
            let output = privilege.run(program, args)?;
            if !output.success {
                bail!("{program} failed: {}", output.stderr_str().trim());
            }
        } else {
            let output = Command::new(program)
                .args(args)
                .output()
                .with_context(|| format!("failed to execute {program}"))?;
            if !output.status.success() {
                bail!(
                    "{program} failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
        }
        Ok(())
    }

    fn write_stamp(&self, ctx: &ApplyContext, hash: &str) -> Result<()> {
        let stamp = self.stamp_path();
        if let Some(privilege) = ctx.privilege {
            super::file::write_privileged(
                privilege,
                &stamp,
                hash.as_bytes(),
                None,
                Some(0o644),
                None,
                None,
            )
        } else {
            super::file::write_local(&stamp, hash.as_bytes(), None, None)
        }
    }
}

impl Step for PythonVenv {
    fn id(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    fn description(&self) -> String {
        format!("Virtualenv {}", self.path.display())
    }

    fn step_type(&self) -> &'static str {
        "python_venv"
    }

    fn current_state(&self) -> Result<StepState> {
        // Hash first: a missing requirements file is a manifest error,
        // whether or not the venv exists yet
        let wanted = self.requirements_hash()?;

        if !self.venv_exists() {
            return Ok(StepState::Absent);
        }

        if let Some(wanted) = wanted {
            match self.recorded_hash() {
                Some(recorded) if recorded == wanted => {}
                _ => {
                    return Ok(StepState::Drifted {
                        from: "requirements changed".to_string(),
                        to: "requirements installed".to_string(),
                    });
                }
            }
        }

        Ok(StepState::Present {
            details: Some(self.python.clone()),
        })
    }

    fn desired_state(&self) -> StepState {
        StepState::Present {
            details: Some(self.python.clone()),
        }
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyReport> {
        let existed = self.venv_exists();
        let wanted = self.requirements_hash()?;

        let requirements_current = match (&wanted, self.recorded_hash()) {
            (None, _) => true,
            (Some(w), Some(r)) => *w == r,
            (Some(_), None) => false,
        };

        if existed && requirements_current {
            return Ok(ApplyReport::no_change());
        }

        if ctx.dry_run {
            return Ok(ApplyReport::skipped("dry run"));
        }

        if !existed {
            let path = self.path.to_string_lossy().to_string();
            self.run_tool(ctx, &self.python, &["-m", "venv", &path])?;
        }

        if let (Some(hash), Some(reqs)) = (&wanted, &self.requirements) {
            let pip = self.path.join("bin").join("pip");
            let pip = pip.to_string_lossy().to_string();
            let reqs = reqs.to_string_lossy().to_string();
            self.run_tool(ctx, &pip, &["install", "-r", &reqs])?;
            self.write_stamp(ctx, hash)?;
        }

        if existed {
            Ok(ApplyReport::modified(UndoAction::Irreversible {
                reason: "previous package set not recorded".to_string(),
            }))
        } else {
            Ok(ApplyReport::created(UndoAction::RunCommand {
                program: "rm".to_string(),
                args: vec!["-rf".to_string(), self.path.to_string_lossy().to_string()],
            }))
        }
    }
}
