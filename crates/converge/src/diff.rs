//! Diff computation for steps

use crate::plan::ExecutionPlan;
use crate::step::Step;
use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::types::StepState;

/// A diff between current and desired state of a step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDiff {
    /// Unique identifier of the step
    pub step_id: String,
    /// Type of the step
    pub step_type: String,
    /// Stage the step belongs to
    pub stage: String,
    /// Human-readable description
    pub description: String,
    /// Current state
    pub current: StepState,
    /// Desired state
    pub desired: StepState,
    /// Whether this step requires root
    pub requires_root: bool,
}

impl StepDiff {
    /// Create a diff from a step, returning None if no changes needed
    pub fn from_step(
        step: &dyn Step,
        stage: &str,
        requires_root: bool,
    ) -> Result<Option<Self>> {
        if !step.needs_apply()? {
            return Ok(None);
        }

        let current = step.current_state()?;
        let desired = step.desired_state();

        Ok(Some(Self {
            step_id: step.id(),
            step_type: step.step_type().to_string(),
            stage: stage.to_string(),
            description: step.description(),
            current,
            desired,
            requires_root,
        }))
    }

    /// Check if this diff represents a creation
    pub fn is_creation(&self) -> bool {
        matches!(
            (&self.current, &self.desired),
            (StepState::Absent, StepState::Present { .. })
        )
    }

    /// Check if this diff represents drift correction
    pub fn is_drift(&self) -> bool {
        matches!(&self.current, StepState::Drifted { .. })
    }
}

/// Compute diffs for every step of a plan, in execution order
///
/// Steps whose state cannot be read are reported as `Unknown` current
/// state rather than silently dropped.
pub fn compute_diffs(plan: &ExecutionPlan) -> Vec<StepDiff> {
    let mut diffs = Vec::new();

    for stage in &plan.stages {
        for step in &stage.unprivileged {
            push_diff(&mut diffs, step.as_ref(), &stage.name, false);
        }
        for step in &stage.privileged {
            push_diff(&mut diffs, step.as_ref(), &stage.name, true);
        }
    }

    diffs
}

fn push_diff(diffs: &mut Vec<StepDiff>, step: &dyn Step, stage: &str, requires_root: bool) {
    match StepDiff::from_step(step, stage, requires_root) {
        Ok(Some(diff)) => diffs.push(diff),
        Ok(None) => {}
        Err(e) => diffs.push(StepDiff {
            step_id: step.id(),
            step_type: step.step_type().to_string(),
            stage: stage.to_string(),
            description: format!("{} (state detection failed: {})", step.description(), e),
            current: StepState::Unknown,
            desired: step.desired_state(),
            requires_root,
        }),
    }
}

/// Diff summary statistics
#[derive(Debug, Clone, Default)]
pub struct DiffSummary {
    /// Number of subjects to create
    pub creations: usize,
    /// Number of drifted subjects to correct
    pub corrections: usize,
    /// Number of steps requiring root
    pub root_required: usize,
}

impl DiffSummary {
    /// Create a summary from a list of diffs
    pub fn from_diffs(diffs: &[StepDiff]) -> Self {
        let mut summary = Self::default();
        for diff in diffs {
            if diff.is_creation() {
                summary.creations += 1;
            } else {
                summary.corrections += 1;
            }
            if diff.requires_root {
                summary.root_required += 1;
            }
        }
        summary
    }

    /// Total number of changes
    pub fn total(&self) -> usize {
        self.creations + self.corrections
    }

    /// Check if there are any changes
    pub fn has_changes(&self) -> bool {
        self.total() > 0
    }
}
