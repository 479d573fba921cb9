//! # Converge
//!
//! Staged, idempotent step execution for host provisioning.
//!
//! This crate provides the core abstractions for declaring desired host
//! state, detecting current state, and converging the host to match.
//!
//! ## Core Concepts
//!
//! - **Step**: a single idempotent host mutation (install package, write
//!   file, enable service) with state detection and an undo action
//! - **StepState**: the current or desired state of a step's subject
//! - **ExecutionPlan**: steps grouped into ordered stages, split by
//!   privilege level within each stage
//! - **Executor**: applies stages in order, parallelizing where safe,
//!   stopping on the first failure
//! - **Rollback**: a journal of undo actions recorded as steps succeed,
//!   replayed in reverse when a run fails
//!
//! ## Provider Traits
//!
//! The crate uses traits for dependency injection so it carries no UI or
//! sudo implementation of its own:
//!
//! - [`PrivilegeProvider`]: runs commands with elevated privileges
//! - [`PrivilegeClassifier`]: decides which steps need privileges
//! - [`ProgressSink`]: receives progress updates
//! - [`ConfirmPrompt`]: handles user confirmations

pub mod context;
pub mod diff;
pub mod executor;
pub mod plan;
pub mod rollback;
pub mod step;
pub mod types;

// Re-export main types at crate root
pub use context::{
    ApplyContext, AutoApprove, AutoDecline, ConfirmPrompt, NoPrivilege, PrivilegeClassifier,
    PrivilegeProvider, ProgressSink, SilentProgress,
};
pub use diff::{DiffSummary, StepDiff, compute_diffs};
pub use executor::{RunReport, execute, execute_simple};
pub use plan::{ExecutionPlan, PlanStage, PostAction};
pub use rollback::{Journal, JournalEntry, RollbackPolicy, RollbackReport};
pub use step::{BoxedStep, Step, StepExt};
pub use types::{
    ApplyReport, CommandOutput, RunOptions, RunSummary, StepResult, StepState, UndoAction,
};
