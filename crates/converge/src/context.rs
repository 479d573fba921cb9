//! Apply context and provider traits
//!
//! These traits let the converge crate run without depending on specific
//! implementations of sudo, progress display, or prompting.

use crate::types::{CommandOutput, StepResult};
use anyhow::Result;

/// Provider for elevated privilege operations
///
/// Implement this to provide sudo/root capabilities. The implementation
/// owns privilege acquisition and release.
pub trait PrivilegeProvider: Send + Sync {
    /// Run a command with elevated privileges
    fn run(&self, cmd: &str, args: &[&str]) -> Result<CommandOutput>;

    /// Run a command and return just success/failure
    fn run_status(&self, cmd: &str, args: &[&str]) -> Result<bool> {
        Ok(self.run(cmd, args)?.success)
    }

    /// Run a command and capture stdout, failing on non-zero exit
    fn run_capture(&self, cmd: &str, args: &[&str]) -> Result<String> {
        let output = self.run(cmd, args)?;
        if !output.success {
            anyhow::bail!("command failed: {}", output.stderr_str().trim());
        }
        Ok(output.stdout_str())
    }
}

impl PrivilegeProvider for Box<dyn PrivilegeProvider> {
    fn run(&self, cmd: &str, args: &[&str]) -> Result<CommandOutput> {
        (**self).run(cmd, args)
    }
}

/// Classifier for determining which steps need elevated privileges
pub trait PrivilegeClassifier: Send + Sync {
    /// Check if a step requires elevated privileges
    ///
    /// # Arguments
    /// * `step_type` - the type of step (e.g. "apt_package", "file")
    /// * `step_id` - the identifier of the step
    fn requires_root(&self, step_type: &str, step_id: &str) -> bool;
}

/// Classifier that never requires privileges
pub struct NoPrivilege;

impl PrivilegeClassifier for NoPrivilege {
    fn requires_root(&self, _step_type: &str, _step_id: &str) -> bool {
        false
    }
}

/// Progress callback for run operations
pub trait ProgressSink: Send {
    /// Called when a stage starts
    fn on_stage_start(&mut self, stage: &str, count: usize, privileged: bool);

    /// Called when a single step completes
    fn on_step_complete(&mut self, id: &str, result: &StepResult);

    /// Called when a stage completes
    fn on_stage_complete(&mut self, stage: &str);

    /// Called when rollback reverts a step
    fn on_rollback(&mut self, id: &str);
}

/// Confirmation callback for user interaction
pub trait ConfirmPrompt: Send {
    /// Ask the user to confirm an action; `true` means proceed
    fn confirm(&mut self, prompt: &str) -> Result<bool>;
}

/// No-op progress sink
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn on_stage_start(&mut self, _stage: &str, _count: usize, _privileged: bool) {}
    fn on_step_complete(&mut self, _id: &str, _result: &StepResult) {}
    fn on_stage_complete(&mut self, _stage: &str) {}
    fn on_rollback(&mut self, _id: &str) {}
}

/// Auto-confirm prompt (always proceeds)
pub struct AutoApprove;

impl ConfirmPrompt for AutoApprove {
    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(true)
    }
}

/// Auto-decline prompt (never proceeds)
pub struct AutoDecline;

impl ConfirmPrompt for AutoDecline {
    fn confirm(&mut self, _prompt: &str) -> Result<bool> {
        Ok(false)
    }
}

/// Context passed to step apply operations
pub struct ApplyContext<'a> {
    /// Whether this is a dry run (no actual changes)
    pub dry_run: bool,
    /// Whether to output verbose information
    pub verbose: bool,
    /// Optional privilege provider for root-only operations
    pub privilege: Option<&'a dyn PrivilegeProvider>,
}

impl<'a> ApplyContext<'a> {
    /// Create a new apply context
    pub fn new(dry_run: bool, verbose: bool) -> Self {
        Self {
            dry_run,
            verbose,
            privilege: None,
        }
    }

    /// Create a context with a privilege provider
    pub fn with_privilege(dry_run: bool, verbose: bool, privilege: &'a dyn PrivilegeProvider) -> Self {
        Self {
            dry_run,
            verbose,
            privilege: Some(privilege),
        }
    }

    /// Get the privilege provider, or error if not available
    pub fn require_privilege(&self) -> Result<&dyn PrivilegeProvider> {
        self.privilege
            .ok_or_else(|| anyhow::anyhow!("root privileges required but not available"))
    }
}
