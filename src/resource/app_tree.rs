//! Application tree sync step
//!
//! Mirrors a source directory into place, skipping excluded directories
//! (VCS metadata, virtualenvs, bytecode caches). Only files whose content
//! differs are copied; a converged tree is a no-op.

use anyhow::{Context, Result, bail};
use converge::{ApplyContext, ApplyReport, Step, StepState, UndoAction};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::file::short_hash;

/// A directory tree to sync from source to dest
#[derive(Debug, Clone)]
pub struct AppTree {
    pub source: PathBuf,
    pub dest: PathBuf,
    /// Directory names skipped during the walk
    pub exclude: Vec<String>,
}

impl AppTree {
    pub fn new(source: impl Into<PathBuf>, dest: impl Into<PathBuf>, exclude: Vec<String>) -> Self {
        Self {
            source: source.into(),
            dest: dest.into(),
            exclude,
        }
    }

    fn is_excluded(&self, entry: &walkdir::DirEntry) -> bool {
        entry.file_type().is_dir()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| self.exclude.iter().any(|e| e == name))
    }

    /// Walk the source and list files whose dest copy is missing or differs
    fn out_of_sync(&self) -> Result<Vec<PathBuf>> {
        if !self.source.is_dir() {
            bail!("app tree source does not exist: {}", self.source.display());
        }

        let mut stale = Vec::new();
        let walker = WalkDir::new(&self.source)
            .into_iter()
            .filter_entry(|e| !self.is_excluded(e));

        for entry in walker {
            let entry = entry.context("walk failed")?;
            if !entry.file_type().is_file() {
                continue;
            }

            let relative = entry
                .path()
                .strip_prefix(&self.source)
                .context("walk escaped source root")?;
            let dest = self.dest.join(relative);

            let differs = match fs::read(&dest) {
                Ok(existing) => {
                    let wanted = fs::read(entry.path())?;
                    short_hash(&existing) != short_hash(&wanted)
                }
                Err(_) => true,
            };
            if differs {
                stale.push(relative.to_path_buf());
            }
        }

        Ok(stale)
    }

    fn copy_one(&self, ctx: &ApplyContext, relative: &Path) -> Result<()> {
        let from = self.source.join(relative);
        let to = self.dest.join(relative);

        if let Some(privilege) = ctx.privilege {
            // Keep the source mode so scripts stay executable
            let mode = fs::metadata(&from)?.permissions().mode() & 0o7777;
            let mode = format!("{mode:04o}");
            let from = from.to_string_lossy().to_string();
            let to = to.to_string_lossy().to_string();
            // install -D creates parent directories as needed
            let output = privilege.run("install", &["-D", "-m", &mode, &from, &to])?;
            if !output.success {
                bail!("copy to {to} failed: {}", output.stderr_str().trim());
            }
        } else {
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&from, &to)
                .with_context(|| format!("could not copy to {}", to.display()))?;
        }
        Ok(())
    }
}

impl Step for AppTree {
    fn id(&self) -> String {
        self.dest.to_string_lossy().to_string()
    }

    fn description(&self) -> String {
        format!("Sync {} -> {}", self.source.display(), self.dest.display())
    }

    fn step_type(&self) -> &'static str {
        "app_tree"
    }

    fn current_state(&self) -> Result<StepState> {
        if !self.dest.is_dir() {
            return Ok(StepState::Absent);
        }

        let stale = self.out_of_sync()?;
        if stale.is_empty() {
            Ok(StepState::Present {
                details: Some("in sync".to_string()),
            })
        } else {
            Ok(StepState::Drifted {
                from: format!("{} file(s) out of sync", stale.len()),
                to: "in sync".to_string(),
            })
        }
    }

    fn desired_state(&self) -> StepState {
        StepState::Present {
            details: Some("in sync".to_string()),
        }
    }

    fn needs_apply(&self) -> Result<bool> {
        Ok(!self.dest.is_dir() || !self.out_of_sync()?.is_empty())
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyReport> {
        let existed = self.dest.is_dir();
        let stale = self.out_of_sync()?;

        if existed && stale.is_empty() {
            return Ok(ApplyReport::no_change());
        }

        if ctx.dry_run {
            return Ok(ApplyReport::skipped("dry run"));
        }

        for relative in &stale {
            self.copy_one(ctx, relative)?;
        }
        log::debug!(
            "synced {} file(s) into {}",
            stale.len(),
            self.dest.display()
        );

        let undo = UndoAction::Irreversible {
            reason: "tree syncs overwrite in place and are not reverted".to_string(),
        };
        if existed {
            Ok(ApplyReport::modified(undo))
        } else {
            Ok(ApplyReport::created(undo))
        }
    }
}
