//! Core types for staged step execution

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Output;

/// Current or desired state of a step's subject
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepState {
    /// Subject exists/is configured
    Present { details: Option<String> },
    /// Subject does not exist/is not configured
    Absent,
    /// Subject exists but differs from desired
    Drifted { from: String, to: String },
    /// State cannot be determined
    Unknown,
}

impl StepState {
    /// Check if state represents presence
    pub fn is_present(&self) -> bool {
        matches!(self, Self::Present { .. })
    }

    /// Check if state represents absence
    pub fn is_absent(&self) -> bool {
        matches!(self, Self::Absent)
    }
}

/// Result of applying a step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepResult {
    /// No changes needed
    NoChange,
    /// Subject was created
    Created,
    /// Subject was modified
    Modified,
    /// Apply failed
    Failed { error: String },
    /// Apply was skipped
    Skipped { reason: String },
}

impl StepResult {
    /// Check if the result represents success (no failure)
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    /// Check if the result represents a change
    pub fn is_change(&self) -> bool {
        matches!(self, Self::Created | Self::Modified)
    }
}

/// How to revert a step that already applied
///
/// Recorded in the journal when a step succeeds; replayed in reverse order
/// by the rollback coordinator when a later step fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UndoAction {
    /// Remove a file or symlink that the step created
    RemovePath(PathBuf),
    /// Remove a directory (only if the step created it, and only if empty)
    RemoveDir(PathBuf),
    /// Restore a backup taken before the step overwrote the target
    RestoreFile { backup: PathBuf, target: PathBuf },
    /// Run a command (e.g. `systemctl disable foo`)
    RunCommand { program: String, args: Vec<String> },
    /// The step cannot be meaningfully reverted (e.g. a package install)
    Irreversible { reason: String },
}

/// What a step did, plus how to take it back
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub result: StepResult,
    /// Undo action, present only when the step changed something
    pub undo: Option<UndoAction>,
}

impl ApplyReport {
    pub fn no_change() -> Self {
        Self {
            result: StepResult::NoChange,
            undo: None,
        }
    }

    pub fn created(undo: UndoAction) -> Self {
        Self {
            result: StepResult::Created,
            undo: Some(undo),
        }
    }

    pub fn modified(undo: UndoAction) -> Self {
        Self {
            result: StepResult::Modified,
            undo: Some(undo),
        }
    }

    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            result: StepResult::Skipped {
                reason: reason.into(),
            },
            undo: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            result: StepResult::Failed {
                error: error.into(),
            },
            undo: None,
        }
    }
}

/// Summary of run results
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunSummary {
    pub created: usize,
    pub modified: usize,
    pub skipped: usize,
    pub failed: usize,
    pub no_change: usize,
    pub rolled_back: usize,
}

impl RunSummary {
    /// Total number of actual changes made
    pub fn total_changes(&self) -> usize {
        self.created + self.modified
    }

    /// Check if the run was fully successful (no failures)
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    /// Total number of steps processed
    pub fn total(&self) -> usize {
        self.created + self.modified + self.skipped + self.failed + self.no_change
    }

    /// Add a result to the summary
    pub fn add_result(&mut self, result: &StepResult) {
        match result {
            StepResult::NoChange => self.no_change += 1,
            StepResult::Created => self.created += 1,
            StepResult::Modified => self.modified += 1,
            StepResult::Failed { .. } => self.failed += 1,
            StepResult::Skipped { .. } => self.skipped += 1,
        }
    }
}

/// Options for a run
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Don't make changes, just show what would happen
    pub dry_run: bool,
    /// Number of parallel jobs for parallel-safe unprivileged steps
    pub jobs: usize,
    /// Verbose output
    pub verbose: bool,
    /// What to revert when a step fails
    pub rollback: crate::rollback::RollbackPolicy,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            jobs: 4,
            verbose: false,
            rollback: crate::rollback::RollbackPolicy::Stage,
        }
    }
}

/// Output from a privileged command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub success: bool,
}

impl From<Output> for CommandOutput {
    fn from(output: Output) -> Self {
        Self {
            stdout: output.stdout,
            stderr: output.stderr,
            success: output.status.success(),
        }
    }
}

impl CommandOutput {
    /// Get stdout as a string
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Get stderr as a string
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_counts_results() {
        let mut summary = RunSummary::default();
        summary.add_result(&StepResult::Created);
        summary.add_result(&StepResult::Modified);
        summary.add_result(&StepResult::NoChange);
        summary.add_result(&StepResult::Failed {
            error: "boom".into(),
        });

        assert_eq!(summary.total(), 4);
        assert_eq!(summary.total_changes(), 2);
        assert!(!summary.is_success());
    }

    #[test]
    fn apply_report_constructors() {
        let report = ApplyReport::created(UndoAction::RemovePath("/tmp/x".into()));
        assert_eq!(report.result, StepResult::Created);
        assert!(report.undo.is_some());

        let report = ApplyReport::no_change();
        assert!(report.undo.is_none());
    }
}
