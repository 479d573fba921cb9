//! Managed file step
//!
//! Content is resolved by the planner (inline, copied, or rendered from a
//! template) before the step is built; the step itself only knows the
//! final bytes. Idempotence is a blake3 comparison. Overwrites take a
//! timestamped backup first so the change can be rolled back.

use anyhow::{Context, Result};
use chrono::Local;
use converge::{ApplyContext, ApplyReport, Step, StepState, UndoAction};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

/// A file whose content and attributes deckhand owns
#[derive(Debug, Clone)]
pub struct ManagedFile {
    pub path: PathBuf,
    pub content: Vec<u8>,
    pub owner: Option<String>,
    pub group: Option<String>,
    pub mode: Option<u32>,
}

impl ManagedFile {
    pub fn new(path: impl Into<PathBuf>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
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
}

impl Step for ManagedFile {
    fn id(&self) -> String {
        self.path.to_string_lossy().to_string()
    }

    fn description(&self) -> String {
        format!("File {}", self.path.display())
    }

    fn step_type(&self) -> &'static str {
        "file"
    }

    fn current_state(&self) -> Result<StepState> {
        file_state(&self.path, &self.content, self.mode)
    }

    fn desired_state(&self) -> StepState {
        StepState::Present {
            details: Some(short_hash(&self.content)),
        }
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyReport> {
        ensure_file_content(
            ctx,
            &self.path,
            &self.content,
            self.mode,
            self.owner.as_deref(),
            self.group.as_deref(),
        )
    }
}

/// First 8 hex chars of the blake3 hash, used in diffs and state details
pub(crate) fn short_hash(content: &[u8]) -> String {
    blake3::hash(content).to_hex()[..8].to_string()
}

/// Detect a file's state relative to desired content and mode
///
/// An unreadable file (typically root-owned) is `Unknown`, not an error;
/// the apply pass will resolve it with privileges. Matching content with
/// the wrong mode is drift, so mode-only fixes show up in plan and status.
pub(crate) fn file_state(path: &Path, desired: &[u8], mode: Option<u32>) -> Result<StepState> {
    if !path.exists() && path.symlink_metadata().is_err() {
        return Ok(StepState::Absent);
    }

    match fs::read(path) {
        Ok(current) if current == desired => {
            if let Some(want) = mode {
                let actual = fs::metadata(path)?.permissions().mode() & 0o7777;
                if actual != want {
                    return Ok(StepState::Drifted {
                        from: format!("mode {actual:04o}"),
                        to: format!("mode {want:04o}"),
                    });
                }
            }
            Ok(StepState::Present {
                details: Some(short_hash(desired)),
            })
        }
        Ok(current) => Ok(StepState::Drifted {
            from: short_hash(&current),
            to: short_hash(desired),
        }),
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => Ok(StepState::Unknown),
        Err(e) => Err(e).with_context(|| format!("could not read {}", path.display())),
    }
}

/// Sibling backup path with a timestamp, e.g. `app.conf.20260831-142501.dkbak`
pub(crate) fn backup_path(path: &Path) -> PathBuf {
    let stamp = Local::now().format("%Y%m%d-%H%M%S");
    let name = path
        .file_name()
        .map_or_else(|| "file".to_string(), |n| n.to_string_lossy().to_string());
    path.with_file_name(format!("{name}.{stamp}.dkbak"))
}

/// Converge a path to the given content and attributes
///
/// Shared by the file, systemd unit, and nginx site steps. Routes through
/// the privilege provider when the context carries one, otherwise writes
/// directly.
pub(crate) fn ensure_file_content(
    ctx: &ApplyContext,
    path: &Path,
    content: &[u8],
    mode: Option<u32>,
    owner: Option<&str>,
    group: Option<&str>,
) -> Result<ApplyReport> {
    let existed = path.exists() || path.symlink_metadata().is_ok();
    // Content first; a mode mismatch on matching content is fixed below
    let converged = matches!(
        file_state(path, content, None)?,
        StepState::Present { .. }
    );

    if converged {
        if let Some(mode) = mode {
            let actual = fs::metadata(path)?.permissions().mode() & 0o7777;
            if actual != mode {
                if ctx.dry_run {
                    return Ok(ApplyReport::skipped("dry run"));
                }
                set_mode(ctx, path, mode)?;
                return Ok(ApplyReport::modified(UndoAction::RunCommand {
                    program: "chmod".to_string(),
                    args: vec![format!("{actual:04o}"), path.to_string_lossy().to_string()],
                }));
            }
        }
        return Ok(ApplyReport::no_change());
    }

    if ctx.dry_run {
        return Ok(ApplyReport::skipped("dry run"));
    }

    let backup = if existed { Some(backup_path(path)) } else { None };

    if let Some(privilege) = ctx.privilege {
        write_privileged(privilege, path, content, backup.as_deref(), mode, owner, group)?;
    } else {
        write_local(path, content, backup.as_deref(), mode)?;
    }

    let undo = match backup {
        Some(backup) => UndoAction::RestoreFile {
            backup,
            target: path.to_path_buf(),
        },
        None => UndoAction::RemovePath(path.to_path_buf()),
    };

    if existed {
        Ok(ApplyReport::modified(undo))
    } else {
        Ok(ApplyReport::created(undo))
    }
}

fn set_mode(ctx: &ApplyContext, path: &Path, mode: u32) -> Result<()> {
    if let Some(privilege) = ctx.privilege {
        let mode = format!("{mode:04o}");
        let target = path.to_string_lossy().to_string();
        let output = privilege.run("chmod", &[&mode, &target])?;
        if !output.success {
            anyhow::bail!("chmod {} failed: {}", path.display(), output.stderr_str().trim());
        }
    } else {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

pub(crate) fn write_local(
    path: &Path,
    content: &[u8],
    backup: Option<&Path>,
    mode: Option<u32>,
) -> Result<()> {
    if let Some(backup) = backup {
        fs::copy(path, backup)
            .with_context(|| format!("could not back up {}", path.display()))?;
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, content).with_context(|| format!("could not write {}", path.display()))?;
    if let Some(mode) = mode {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

pub(crate) fn write_privileged(
    privilege: &dyn converge::PrivilegeProvider,
    path: &Path,
    content: &[u8],
    backup: Option<&Path>,
    mode: Option<u32>,
    owner: Option<&str>,
    group: Option<&str>,
) -> Result<()> {
    let target = path.to_string_lossy().to_string();

    if let Some(backup) = backup {
        let backup = backup.to_string_lossy().to_string();
        let output = privilege.run("cp", &["-p", &target, &backup])?;
        if !output.success {
            anyhow::bail!("backup of {} failed: {}", path.display(), output.stderr_str().trim());
        }
    }

    // Stage unprivileged, install privileged
    let stage = stage_content(path, content)?;
    let stage_str = stage.to_string_lossy().to_string();

    let result = (|| -> Result<()> {
        let output = privilege.run("cp", &[&stage_str, &target])?;
        if !output.success {
            anyhow::bail!("cp to {} failed: {}", path.display(), output.stderr_str().trim());
        }
        if let Some(mode) = mode {
            let mode = format!("{mode:04o}");
            let output = privilege.run("chmod", &[&mode, &target])?;
            if !output.success {
                anyhow::bail!("chmod failed: {}", output.stderr_str().trim());
            }
        }
        let spec = match (owner, group) {
            (Some(o), Some(g)) => Some(format!("{o}:{g}")),
            (Some(o), None) => Some(o.to_string()),
            (None, Some(g)) => Some(format!(":{g}")),
            (None, None) => None,
        };
        if let Some(spec) = spec {
            let output = privilege.run("chown", &[&spec, &target])?;
            if !output.success {
                anyhow::bail!("chown failed: {}", output.stderr_str().trim());
            }
        }
        Ok(())
    })();

    let _ = fs::remove_file(&stage);
    result
}

/// Write content to a process-unique staging path under /tmp
fn stage_content(path: &Path, content: &[u8]) -> Result<PathBuf> {
    let stage = std::env::temp_dir().join(format!(
        "deckhand-stage-{}-{}",
        std::process::id(),
        short_hash(path.to_string_lossy().as_bytes()),
    ));
    fs::write(&stage, content).context("could not write staging file")?;
    Ok(stage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge::StepResult;

    #[test]
    fn absent_file_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let step = ManagedFile::new(dir.path().join("app.conf"), "hello");
        assert_eq!(step.current_state().unwrap(), StepState::Absent);
    }

    #[test]
    fn matching_content_is_present() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.conf");
        fs::write(&path, "hello").unwrap();

        let step = ManagedFile::new(&path, "hello");
        assert!(step.current_state().unwrap().is_present());
        assert!(!step.needs_apply().unwrap());
    }

    #[test]
    fn drifted_content_shows_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.conf");
        fs::write(&path, "old").unwrap();

        let step = ManagedFile::new(&path, "new");
        match step.current_state().unwrap() {
            StepState::Drifted { from, to } => {
                assert_eq!(from.len(), 8);
                assert_eq!(to, short_hash(b"new"));
            }
            other => panic!("expected drift, got {other:?}"),
        }
    }

    #[test]
    fn creates_missing_file_with_remove_undo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.conf");
        let step = ManagedFile::new(&path, "hello").with_attrs(None, None, Some(0o640));

        let mut ctx = ApplyContext::new(false, false);
        let report = step.apply(&mut ctx).unwrap();

        assert_eq!(report.result, StepResult::Created);
        assert_eq!(report.undo, Some(UndoAction::RemovePath(path.clone())));
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o640);
    }

    #[test]
    fn overwrites_with_backup_undo() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.conf");
        fs::write(&path, "old").unwrap();

        let step = ManagedFile::new(&path, "new");
        let mut ctx = ApplyContext::new(false, false);
        let report = step.apply(&mut ctx).unwrap();

        assert_eq!(report.result, StepResult::Modified);
        match report.undo {
            Some(UndoAction::RestoreFile { backup, target }) => {
                assert_eq!(target, path);
                assert_eq!(fs::read_to_string(&backup).unwrap(), "old");
            }
            other => panic!("expected backup undo, got {other:?}"),
        }
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
    }

    #[test]
    fn second_apply_is_no_change() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.conf");
        let step = ManagedFile::new(&path, "hello");

        let mut ctx = ApplyContext::new(false, false);
        step.apply(&mut ctx).unwrap();
        let report = step.apply(&mut ctx).unwrap();
        assert_eq!(report.result, StepResult::NoChange);
    }

    #[test]
    fn dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.conf");
        let step = ManagedFile::new(&path, "hello");

        let mut ctx = ApplyContext::new(true, false);
        let report = step.apply(&mut ctx).unwrap();
        assert!(matches!(report.result, StepResult::Skipped { .. }));
        assert!(!path.exists());
    }

    #[test]
    fn mode_only_drift_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.conf");
        fs::write(&path, "hello").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o666)).unwrap();

        let step = ManagedFile::new(&path, "hello").with_attrs(None, None, Some(0o600));
        assert!(matches!(
            step.current_state().unwrap(),
            StepState::Drifted { .. }
        ));
        assert!(step.needs_apply().unwrap());
    }

    #[test]
    fn mode_only_drift_is_fixed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.conf");
        fs::write(&path, "hello").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o666)).unwrap();

        let step = ManagedFile::new(&path, "hello").with_attrs(None, None, Some(0o600));
        let mut ctx = ApplyContext::new(false, false);
        let report = step.apply(&mut ctx).unwrap();

        assert_eq!(report.result, StepResult::Modified);
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode, 0o600);
        // content untouched
        assert_eq!(fs::read_to_string(&path).unwrap(), "hello");
    }
}
