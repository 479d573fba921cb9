//! Rollback coordinator - undo journal and reverse replay
//!
//! As steps succeed, the executor records their undo actions here. When a
//! step fails, the coordinator selects which journal entries to revert
//! (per policy) and replays them newest-first.

use crate::context::{PrivilegeProvider, ProgressSink};
use crate::types::UndoAction;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::process::Command;

/// What to revert when a step fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RollbackPolicy {
    /// Stop on failure but revert nothing
    None,
    /// Revert completed steps of the failing stage (default)
    #[default]
    Stage,
    /// Revert every completed step of the run
    Full,
}

impl fmt::Display for RollbackPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Stage => write!(f, "stage"),
            Self::Full => write!(f, "full"),
        }
    }
}

/// One journal entry: a completed step and how to take it back
#[derive(Debug, Clone)]
pub struct JournalEntry {
    pub step_id: String,
    pub stage: String,
    pub privileged: bool,
    pub undo: UndoAction,
}

/// Journal of completed changes, in application order
#[derive(Debug, Default)]
pub struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed step's undo action
    pub fn record(&mut self, step_id: String, stage: &str, privileged: bool, undo: UndoAction) {
        self.entries.push(JournalEntry {
            step_id,
            stage: stage.to_string(),
            privileged,
            undo,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries selected for reversal under the given policy, newest first
    ///
    /// `failed_stage` is the stage the failing step belonged to.
    pub fn select(&self, policy: RollbackPolicy, failed_stage: &str) -> Vec<&JournalEntry> {
        let mut selected: Vec<&JournalEntry> = match policy {
            RollbackPolicy::None => Vec::new(),
            RollbackPolicy::Stage => self
                .entries
                .iter()
                .filter(|e| e.stage == failed_stage)
                .collect(),
            RollbackPolicy::Full => self.entries.iter().collect(),
        };
        selected.reverse();
        selected
    }
}

/// Outcome of a rollback pass
#[derive(Debug, Default)]
pub struct RollbackReport {
    /// Steps whose changes were reverted
    pub reverted: Vec<String>,
    /// Steps that could not be reverted by design, with the reason
    pub irreversible: Vec<(String, String)>,
    /// Steps whose undo action itself failed, with the error
    pub errors: Vec<(String, String)>,
}

impl RollbackReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Replay undo actions for the selected entries
///
/// Entries must already be in reverse (newest-first) order, as returned by
/// [`Journal::select`]. Privileged entries need the provider; without one
/// they are reported as errors rather than attempted.
pub fn revert<P: ProgressSink>(
    entries: &[&JournalEntry],
    privilege: Option<&dyn PrivilegeProvider>,
    progress: &mut P,
) -> RollbackReport {
    let mut report = RollbackReport::default();

    for entry in entries {
        if let UndoAction::Irreversible { reason } = &entry.undo {
            report
                .irreversible
                .push((entry.step_id.clone(), reason.clone()));
            continue;
        }

        let result = if entry.privileged {
            match privilege {
                Some(p) => apply_undo_privileged(&entry.undo, p),
                None => Err(anyhow::anyhow!(
                    "privileged undo with no privilege provider"
                )),
            }
        } else {
            apply_undo_local(&entry.undo)
        };

        match result {
            Ok(()) => {
                progress.on_rollback(&entry.step_id);
                report.reverted.push(entry.step_id.clone());
            }
            Err(e) => report.errors.push((entry.step_id.clone(), e.to_string())),
        }
    }

    report
}

/// Execute an undo action in the current process
fn apply_undo_local(undo: &UndoAction) -> anyhow::Result<()> {
    match undo {
        UndoAction::RemovePath(path) => {
            if path.symlink_metadata().is_ok() {
                std::fs::remove_file(path)?;
            }
            Ok(())
        }
        UndoAction::RemoveDir(path) => {
            if path.is_dir() {
                std::fs::remove_dir(path)?;
            }
            Ok(())
        }
        UndoAction::RestoreFile { backup, target } => {
            std::fs::copy(backup, target)?;
            std::fs::remove_file(backup)?;
            Ok(())
        }
        UndoAction::RunCommand { program, args } => {
            let status = Command::new(program).args(args).status()?;
            if !status.success() {
                anyhow::bail!("undo command {} failed", program);
            }
            Ok(())
        }
        UndoAction::Irreversible { .. } => Ok(()),
    }
}

/// Execute an undo action through the privilege provider
fn apply_undo_privileged(undo: &UndoAction, privilege: &dyn PrivilegeProvider) -> anyhow::Result<()> {
    match undo {
        UndoAction::RemovePath(path) => {
            run_checked(privilege, "rm", &["-f", &path_str(path)])
        }
        UndoAction::RemoveDir(path) => {
            // rmdir, not rm -r: only directories we created empty are removed
            run_checked(privilege, "rmdir", &["--ignore-fail-on-non-empty", &path_str(path)])
        }
        UndoAction::RestoreFile { backup, target } => {
            run_checked(privilege, "cp", &["-p", &path_str(backup), &path_str(target)])?;
            run_checked(privilege, "rm", &["-f", &path_str(backup)])
        }
        UndoAction::RunCommand { program, args } => {
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            run_checked(privilege, program, &args)
        }
        UndoAction::Irreversible { .. } => Ok(()),
    }
}

fn run_checked(privilege: &dyn PrivilegeProvider, cmd: &str, args: &[&str]) -> anyhow::Result<()> {
    let output = privilege.run(cmd, args)?;
    if !output.success {
        anyhow::bail!("{} failed: {}", cmd, output.stderr_str().trim());
    }
    Ok(())
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
