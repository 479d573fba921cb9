//! Step trait for idempotent host mutations
//!
//! A Step represents one unit of desired host state: it can report the
//! state it finds, converge the host toward the state it wants, and hand
//! the executor an undo action for the journal.

use crate::context::ApplyContext;
use crate::types::{ApplyReport, StepState};
use anyhow::Result;
use std::fmt;

/// Core trait for provisioning steps
///
/// Every step in the system implements this trait, which provides:
/// - Identity (id, description, type, stage)
/// - State detection (current vs desired)
/// - State convergence (apply), reporting an undo action
///
/// Steps must check current state inside [`Step::apply`] as well: the
/// executor may run them without a prior diff, and a step applied twice
/// must report `NoChange` the second time.
pub trait Step: Send + Sync + fmt::Debug {
    /// Unique identifier for this step
    ///
    /// Stable within its type. Examples:
    /// - "nginx" for an apt package
    /// - "/etc/systemd/system/app.service" for a unit file
    /// - "/opt/app/venv" for a virtualenv
    fn id(&self) -> String;

    /// Human-readable description of what this step ensures
    fn description(&self) -> String;

    /// Step type category
    ///
    /// Used for grouping, filtering, and privilege classification.
    /// Examples: "apt_package", "file", "symlink", "service"
    fn step_type(&self) -> &'static str;

    /// Detect the current state of this step's subject
    fn current_state(&self) -> Result<StepState>;

    /// The desired state, derived from the manifest
    fn desired_state(&self) -> StepState;

    /// Check if the step needs changes to reach desired state
    ///
    /// Default implementation compares current and desired states.
    fn needs_apply(&self) -> Result<bool> {
        let current = self.current_state()?;
        let desired = self.desired_state();
        Ok(current != desired)
    }

    /// Converge the host toward the desired state
    ///
    /// Must:
    /// 1. Return `NoChange` if already converged
    /// 2. Respect `ctx.dry_run` (return `Skipped`)
    /// 3. Record an undo action on any change it makes
    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyReport>;

    /// Whether this step can run in parallel with others in its stage
    ///
    /// Override to return false for steps that contend on shared tools
    /// (package manager locks, systemd).
    fn parallel_safe(&self) -> bool {
        true
    }
}

/// A boxed step for type-erased storage
pub type BoxedStep = Box<dyn Step>;

/// Extension helpers on steps
pub trait StepExt {
    /// "type:id" label used in logs and reports
    fn label(&self) -> String;
}

impl<S: Step + ?Sized> StepExt for S {
    fn label(&self) -> String {
        format!("{}:{}", self.step_type(), self.id())
    }
}
