//! Execution engine - applies stages in order with privilege batching
//!
//! Each stage runs its unprivileged steps first (parallel where safe),
//! then its privileged steps sequentially under the privilege provider.
//! The first failure stops the run and hands the journal to the rollback
//! coordinator.

use crate::context::{ApplyContext, ConfirmPrompt, PrivilegeProvider, ProgressSink};
use crate::diff::compute_diffs;
use crate::plan::ExecutionPlan;
use crate::rollback::{Journal, RollbackReport, revert};
use crate::step::{Step, StepExt};
use crate::types::{ApplyReport, RunOptions, RunSummary, StepResult};
use anyhow::Result;
use rayon::prelude::*;
use std::sync::{Arc, Mutex};

/// Full outcome of a run
#[derive(Debug, Default)]
pub struct RunReport {
    pub summary: RunSummary,
    /// Failed steps with their errors
    pub failed: Vec<(String, String)>,
    /// Rollback outcome, present only when a failure triggered one
    pub rollback: Option<RollbackReport>,
    /// Post-actions that still need to run (empty when the run failed)
    pub pending_post_actions: Vec<String>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Execute a plan with the given options and callbacks
///
/// # Arguments
/// * `plan` - the staged execution plan
/// * `opts` - run options (dry_run, jobs, verbose, rollback policy)
/// * `privilege_provider` - factory for the privilege provider, called
///   lazily at most once, when the first privileged batch is reached
/// * `progress` - progress callback
/// * `confirm` - confirmation callback
pub fn execute<S, P, C>(
    plan: ExecutionPlan,
    opts: RunOptions,
    privilege_provider: impl FnOnce() -> Result<S>,
    progress: &mut P,
    confirm: &mut C,
) -> Result<RunReport>
where
    S: PrivilegeProvider,
    P: ProgressSink,
    C: ConfirmPrompt,
{
    let diffs = compute_diffs(&plan);

    if diffs.is_empty() {
        return Ok(RunReport::default());
    }

    if opts.dry_run {
        return Ok(RunReport::default());
    }

    if !confirm.confirm("Apply changes?")? {
        let mut report = RunReport::default();
        report.summary.skipped = diffs.len();
        return Ok(report);
    }

    let mut report = RunReport::default();
    let mut journal = Journal::new();
    let mut changed: Vec<String> = Vec::new();
    let mut provider_factory = Some(privilege_provider);
    let mut privilege: Option<S> = None;

    for stage in &plan.stages {
        // Unprivileged batch, parallel where safe
        if !stage.unprivileged.is_empty() {
            progress.on_stage_start(&stage.name, stage.unprivileged.len(), false);
            let results = run_batch(&stage.unprivileged, opts.jobs, opts.verbose, None, progress);
            collect(&mut report, &mut journal, &mut changed, &stage.name, false, results);
            progress.on_stage_complete(&stage.name);
        }

        // Privileged batch, sequential
        if report.is_success() && !stage.privileged.is_empty() {
            if privilege.is_none() {
                let factory = provider_factory
                    .take()
                    .expect("privilege factory consumed twice");
                privilege = Some(factory()?);
            }
            let provider = privilege.as_ref().map(|p| p as &dyn PrivilegeProvider);

            progress.on_stage_start(&stage.name, stage.privileged.len(), true);
            let results = run_batch(&stage.privileged, 1, opts.verbose, provider, progress);
            collect(&mut report, &mut journal, &mut changed, &stage.name, true, results);
            progress.on_stage_complete(&stage.name);
        }

        if !report.is_success() {
            let provider = privilege.as_ref().map(|p| p as &dyn PrivilegeProvider);
            let selected = journal.select(opts.rollback, &stage.name);
            let rollback = revert(&selected, provider, progress);
            report.summary.rolled_back = rollback.reverted.len();
            report.rollback = Some(rollback);
            return Ok(report);
        }
    }

    report.pending_post_actions = plan
        .post_actions
        .iter()
        .filter(|pa| {
            pa.when_changed
                .as_ref()
                .is_none_or(|trigger| changed.contains(trigger))
        })
        .map(|pa| pa.action.clone())
        .collect();
    Ok(report)
}

/// Run one batch of steps, returning (id, report) pairs
///
/// Sequential execution stops at the first failure; a parallel pass drains
/// its in-flight steps but nothing new starts after it.
fn run_batch<P: ProgressSink>(
    steps: &[Box<dyn Step>],
    jobs: usize,
    verbose: bool,
    privilege: Option<&dyn PrivilegeProvider>,
    progress: &mut P,
) -> Vec<(String, ApplyReport)> {
    if jobs <= 1 || steps.len() == 1 {
        let mut results = Vec::new();
        for step in steps {
            let report = apply_step(step.as_ref(), verbose, privilege);
            progress.on_step_complete(&step.id(), &report.result);
            let failed = matches!(report.result, StepResult::Failed { .. });
            results.push((step.label(), report));
            if failed {
                break;
            }
        }
        return results;
    }

    // Steps that contend on shared tools run after the parallel pass
    let (parallel, serial): (Vec<_>, Vec<_>) =
        steps.iter().partition(|s| s.parallel_safe());

    let mut results = run_parallel(&parallel, jobs, verbose, privilege);
    let mut failed = results
        .iter()
        .any(|(_, r)| matches!(r.result, StepResult::Failed { .. }));

    for step in serial {
        if failed {
            break;
        }
        let report = apply_step(step.as_ref(), verbose, privilege);
        failed = matches!(report.result, StepResult::Failed { .. });
        results.push((step.label(), report));
    }

    for (id, report) in &results {
        progress.on_step_complete(id, &report.result);
    }

    results
}

/// Run parallel-safe steps on a bounded rayon pool
fn run_parallel(
    steps: &[&Box<dyn Step>],
    jobs: usize,
    verbose: bool,
    privilege: Option<&dyn PrivilegeProvider>,
) -> Vec<(String, ApplyReport)> {
    let results: Arc<Mutex<Vec<(String, ApplyReport)>>> = Arc::new(Mutex::new(Vec::new()));

    let pool = match rayon::ThreadPoolBuilder::new().num_threads(jobs).build() {
        Ok(pool) => pool,
        Err(_) => {
            // Fall back to sequential if the pool cannot be built
            return steps
                .iter()
                .map(|step| (step.label(), apply_step(step.as_ref(), verbose, privilege)))
                .collect();
        }
    };

    pool.install(|| {
        steps.par_iter().for_each(|step| {
            let report = apply_step(step.as_ref(), verbose, privilege);
            push_result(&results, (step.label(), report));
        });
    });

    let mutex = match Arc::try_unwrap(results) {
        Ok(mutex) => mutex,
        Err(_) => return Vec::new(),
    };
    match mutex.into_inner() {
        Ok(collected) => collected,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn push_result(
    results: &Arc<Mutex<Vec<(String, ApplyReport)>>>,
    entry: (String, ApplyReport),
) {
    match results.lock() {
        Ok(mut locked) => locked.push(entry),
        Err(poisoned) => poisoned.into_inner().push(entry),
    }
}

/// Apply a single step, converting errors into failed reports
fn apply_step(
    step: &dyn Step,
    verbose: bool,
    privilege: Option<&dyn PrivilegeProvider>,
) -> ApplyReport {
    let mut ctx = match privilege {
        Some(p) => ApplyContext::with_privilege(false, verbose, p),
        None => ApplyContext::new(false, verbose),
    };

    match step.apply(&mut ctx) {
        Ok(report) => report,
        Err(e) => ApplyReport::failed(format!("{:#}", e)),
    }
}

/// Fold batch results into the report, journal, and changed-step list
fn collect(
    report: &mut RunReport,
    journal: &mut Journal,
    changed: &mut Vec<String>,
    stage: &str,
    privileged: bool,
    results: Vec<(String, ApplyReport)>,
) {
    for (id, apply) in results {
        report.summary.add_result(&apply.result);

        if apply.result.is_change() {
            changed.push(id.clone());
        }

        if let StepResult::Failed { error } = &apply.result {
            report.failed.push((id.clone(), error.clone()));
        } else if let Some(undo) = apply.undo {
            journal.record(id, stage, privileged, undo);
        }
    }
}

/// Simple execution without callbacks
pub fn execute_simple<S: PrivilegeProvider>(
    plan: ExecutionPlan,
    opts: RunOptions,
    privilege_provider: impl FnOnce() -> Result<S>,
) -> Result<RunReport> {
    use crate::context::{AutoApprove, SilentProgress};

    execute(
        plan,
        opts,
        privilege_provider,
        &mut SilentProgress,
        &mut AutoApprove,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{AutoApprove, NoPrivilege, SilentProgress};
    use crate::rollback::RollbackPolicy;
    use crate::types::{CommandOutput, StepState, UndoAction};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockPrivilege;

    impl PrivilegeProvider for MockPrivilege {
        fn run(&self, _cmd: &str, _args: &[&str]) -> Result<CommandOutput> {
            Ok(CommandOutput {
                stdout: Vec::new(),
                stderr: Vec::new(),
                success: true,
            })
        }
    }

    fn no_privilege() -> impl FnOnce() -> Result<MockPrivilege> {
        || Ok(MockPrivilege)
    }

    #[derive(Debug)]
    struct TestStep {
        id: String,
        needs_change: bool,
        fail: bool,
        applied: Arc<AtomicUsize>,
    }

    impl TestStep {
        fn new(id: &str, needs_change: bool, fail: bool) -> (Self, Arc<AtomicUsize>) {
            let applied = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    id: id.to_string(),
                    needs_change,
                    fail,
                    applied: Arc::clone(&applied),
                },
                applied,
            )
        }
    }

    impl Step for TestStep {
        fn id(&self) -> String {
            self.id.clone()
        }

        fn description(&self) -> String {
            format!("test step {}", self.id)
        }

        fn step_type(&self) -> &'static str {
            "test"
        }

        fn current_state(&self) -> Result<StepState> {
            if self.needs_change {
                Ok(StepState::Absent)
            } else {
                Ok(StepState::Present { details: None })
            }
        }

        fn desired_state(&self) -> StepState {
            StepState::Present { details: None }
        }

        fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyReport> {
            if ctx.dry_run {
                return Ok(ApplyReport::skipped("dry run"));
            }
            self.applied.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("induced failure");
            }
            if self.needs_change {
                Ok(ApplyReport::created(UndoAction::Irreversible {
                    reason: "test".into(),
                }))
            } else {
                Ok(ApplyReport::no_change())
            }
        }
    }

    #[test]
    fn empty_plan_is_a_noop() {
        let report = execute(
            ExecutionPlan::new(),
            RunOptions::default(),
            no_privilege(),
            &mut SilentProgress,
            &mut AutoApprove,
        )
        .unwrap();

        assert_eq!(report.summary.total(), 0);
        assert!(report.is_success());
    }

    #[test]
    fn converged_plan_executes_nothing() {
        let mut plan = ExecutionPlan::new();
        let (step, applied) = TestStep::new("a", false, false);
        plan.add_step("files", Box::new(step), &NoPrivilege);

        let report = execute_simple(plan, RunOptions::default(), no_privilege()).unwrap();

        assert_eq!(report.summary.total(), 0);
        assert_eq!(applied.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn dry_run_applies_nothing() {
        let mut plan = ExecutionPlan::new();
        let (step, applied) = TestStep::new("a", true, false);
        plan.add_step("files", Box::new(step), &NoPrivilege);

        let opts = RunOptions {
            dry_run: true,
            ..Default::default()
        };
        let report = execute_simple(plan, opts, no_privilege()).unwrap();

        assert_eq!(report.summary.total(), 0);
        assert_eq!(applied.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn changes_are_applied_and_counted() {
        let mut plan = ExecutionPlan::new();
        let (step, applied) = TestStep::new("a", true, false);
        plan.add_step("files", Box::new(step), &NoPrivilege);

        let report = execute_simple(plan, RunOptions::default(), no_privilege()).unwrap();

        assert_eq!(report.summary.created, 1);
        assert_eq!(applied.load(Ordering::SeqCst), 1);
        assert_eq!(report.pending_post_actions.len(), 0);
    }

    #[test]
    fn failure_stops_later_stages() {
        let mut plan = ExecutionPlan::new();
        let (bad, _) = TestStep::new("bad", true, true);
        let (later, later_applied) = TestStep::new("later", true, false);
        plan.add_step("files", Box::new(bad), &NoPrivilege);
        plan.add_step("services", Box::new(later), &NoPrivilege);

        let opts = RunOptions {
            jobs: 1,
            ..Default::default()
        };
        let report = execute_simple(plan, opts, no_privilege()).unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(later_applied.load(Ordering::SeqCst), 0);
        assert!(report.rollback.is_some());
    }

    #[test]
    fn stage_rollback_reverts_completed_steps_of_failing_stage() {
        let mut plan = ExecutionPlan::new();
        let (good, _) = TestStep::new("good", true, false);
        let (bad, _) = TestStep::new("bad", true, true);
        plan.add_step("files", Box::new(good), &NoPrivilege);
        plan.add_step("files", Box::new(bad), &NoPrivilege);

        let opts = RunOptions {
            jobs: 1,
            rollback: RollbackPolicy::Stage,
            ..Default::default()
        };
        let report = execute_simple(plan, opts, no_privilege()).unwrap();

        let rollback = report.rollback.expect("rollback should run");
        // The good step recorded an Irreversible undo, so it shows up there
        assert_eq!(rollback.irreversible.len(), 1);
        assert!(rollback.is_clean());
    }

    #[test]
    fn rollback_policy_none_reverts_nothing() {
        let mut plan = ExecutionPlan::new();
        let (good, _) = TestStep::new("good", true, false);
        let (bad, _) = TestStep::new("bad", true, true);
        plan.add_step("files", Box::new(good), &NoPrivilege);
        plan.add_step("files", Box::new(bad), &NoPrivilege);

        let opts = RunOptions {
            jobs: 1,
            rollback: RollbackPolicy::None,
            ..Default::default()
        };
        let report = execute_simple(plan, opts, no_privilege()).unwrap();

        let rollback = report.rollback.expect("rollback report still present");
        assert!(rollback.reverted.is_empty());
        assert!(rollback.irreversible.is_empty());
        assert_eq!(report.summary.rolled_back, 0);
    }

    #[test]
    fn declined_confirmation_skips_everything() {
        let mut plan = ExecutionPlan::new();
        let (step, applied) = TestStep::new("a", true, false);
        plan.add_step("files", Box::new(step), &NoPrivilege);

        let report = execute(
            plan,
            RunOptions::default(),
            no_privilege(),
            &mut SilentProgress,
            &mut crate::context::AutoDecline,
        )
        .unwrap();

        assert_eq!(report.summary.skipped, 1);
        assert_eq!(applied.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn post_actions_survive_successful_runs() {
        let mut plan = ExecutionPlan::new();
        let (step, _) = TestStep::new("a", true, false);
        plan.add_step("files", Box::new(step), &NoPrivilege);
        plan.add_post_action("daemon-reload".into());

        let report = execute_simple(plan, RunOptions::default(), no_privilege()).unwrap();

        assert_eq!(report.pending_post_actions, ["daemon-reload"]);
    }

    #[test]
    fn failure_stops_the_rest_of_the_stage() {
        let mut plan = ExecutionPlan::new();
        let (bad, _) = TestStep::new("bad", true, true);
        let (next, next_applied) = TestStep::new("next", true, false);
        plan.add_step("files", Box::new(bad), &NoPrivilege);
        plan.add_step("files", Box::new(next), &NoPrivilege);

        let opts = RunOptions {
            jobs: 1,
            ..Default::default()
        };
        let report = execute_simple(plan, opts, no_privilege()).unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(next_applied.load(Ordering::SeqCst), 0);
        assert!(report.rollback.is_some());
    }

    #[test]
    fn conditional_post_actions_follow_their_trigger() {
        let mut plan = ExecutionPlan::new();
        let (changing, _) = TestStep::new("unit-a", true, false);
        let (converged, _) = TestStep::new("unit-b", false, false);
        plan.add_step("units", Box::new(changing), &NoPrivilege);
        plan.add_step("units", Box::new(converged), &NoPrivilege);
        plan.add_post_action_when("restart:a".into(), "test:unit-a".into());
        plan.add_post_action_when("restart:b".into(), "test:unit-b".into());

        let report = execute_simple(plan, RunOptions::default(), no_privilege()).unwrap();

        assert_eq!(report.pending_post_actions, ["restart:a"]);
    }
}
