//! Execution plans - steps grouped into ordered stages
//!
//! Provisioning steps have hard ordering constraints (packages before
//! virtualenvs, unit files before service starts), so a plan is a sequence
//! of named stages. Stages run strictly in order; within a stage, steps are
//! split by privilege level and may run in parallel when safe.

use crate::context::PrivilegeClassifier;
use crate::step::{BoxedStep, Step};

/// A command to run once after all stages succeed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostAction {
    /// Action spec, e.g. "daemon-reload" or "restart:app.service"
    pub action: String,
    /// When set, the action only becomes pending if the step with this
    /// label reported a change during the run
    pub when_changed: Option<String>,
}

/// One ordered stage of a plan
#[derive(Debug)]
pub struct PlanStage {
    /// Stage name, e.g. "packages", "files", "services"
    pub name: String,
    /// Steps that don't need elevated privileges
    pub unprivileged: Vec<BoxedStep>,
    /// Steps that need elevated privileges
    pub privileged: Vec<BoxedStep>,
}

impl PlanStage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            unprivileged: Vec::new(),
            privileged: Vec::new(),
        }
    }

    /// Number of steps in the stage
    pub fn len(&self) -> usize {
        self.unprivileged.len() + self.privileged.len()
    }

    /// Check if the stage has no steps
    pub fn is_empty(&self) -> bool {
        self.unprivileged.is_empty() && self.privileged.is_empty()
    }
}

/// An execution plan: ordered stages plus post-actions
#[derive(Debug)]
pub struct ExecutionPlan {
    /// Stages, executed in order
    pub stages: Vec<PlanStage>,
    /// Post-apply actions, run by the caller after all stages succeed
    pub post_actions: Vec<PostAction>,
}

impl ExecutionPlan {
    /// Create a new empty plan
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            post_actions: Vec::new(),
        }
    }

    /// Get or create the stage with the given name
    ///
    /// New stages append at the end, so callers add stages in dependency
    /// order.
    pub fn stage_mut(&mut self, name: &str) -> &mut PlanStage {
        if let Some(idx) = self.stages.iter().position(|s| s.name == name) {
            &mut self.stages[idx]
        } else {
            self.stages.push(PlanStage::new(name));
            self.stages.last_mut().expect("stage just pushed")
        }
    }

    /// Add a step to a stage, classifying by privilege requirement
    pub fn add_step<C: PrivilegeClassifier>(
        &mut self,
        stage: &str,
        step: BoxedStep,
        classifier: &C,
    ) {
        let requires_root = classifier.requires_root(step.step_type(), &step.id());
        let stage = self.stage_mut(stage);

        if requires_root {
            stage.privileged.push(step);
        } else {
            stage.unprivileged.push(step);
        }
    }

    /// Add an unconditional post-apply action, deduplicating
    ///
    /// An unconditional add upgrades an existing conditional entry for the
    /// same action.
    pub fn add_post_action(&mut self, action: String) {
        match self.post_actions.iter_mut().find(|p| p.action == action) {
            Some(existing) => existing.when_changed = None,
            None => self.post_actions.push(PostAction {
                action,
                when_changed: None,
            }),
        }
    }

    /// Add a post-apply action that only fires when the given step changed
    pub fn add_post_action_when(&mut self, action: String, trigger: String) {
        if !self.post_actions.iter().any(|p| p.action == action) {
            self.post_actions.push(PostAction {
                action,
                when_changed: Some(trigger),
            });
        }
    }

    /// Filter the plan to steps matching a predicate, keeping stage order
    pub fn filter<F>(self, predicate: F) -> Self
    where
        F: Fn(&dyn Step) -> bool,
    {
        Self {
            stages: self
                .stages
                .into_iter()
                .map(|stage| PlanStage {
                    name: stage.name,
                    unprivileged: stage
                        .unprivileged
                        .into_iter()
                        .filter(|s| predicate(s.as_ref()))
                        .collect(),
                    privileged: stage
                        .privileged
                        .into_iter()
                        .filter(|s| predicate(s.as_ref()))
                        .collect(),
                })
                .filter(|stage| !stage.is_empty())
                .collect(),
            post_actions: self.post_actions,
        }
    }

    /// Filter the plan to steps matching a target pattern
    ///
    /// Target format: "type" or "type.name"
    pub fn filter_by_target(self, target: Option<&str>) -> Self {
        match target {
            None => self,
            Some(t) => {
                let (step_type, name) = parse_target(t);
                self.filter(|s| matches_filter(s, step_type.as_deref(), name.as_deref()))
            }
        }
    }

    /// Iterate all steps in execution order
    pub fn iter_steps(&self) -> impl Iterator<Item = &dyn Step> {
        self.stages.iter().flat_map(|stage| {
            stage
                .unprivileged
                .iter()
                .chain(stage.privileged.iter())
                .map(|s| s.as_ref())
        })
    }

    /// Total number of steps in the plan
    pub fn total_steps(&self) -> usize {
        self.stages.iter().map(PlanStage::len).sum()
    }

    /// Check if plan is empty
    pub fn is_empty(&self) -> bool {
        self.stages.iter().all(PlanStage::is_empty)
    }

    /// Check if plan has any privileged steps
    pub fn has_privileged(&self) -> bool {
        self.stages.iter().any(|s| !s.privileged.is_empty())
    }
}

impl Default for ExecutionPlan {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a target string like "type.name" into (type, name)
fn parse_target(target: &str) -> (Option<String>, Option<String>) {
    match target.split_once('.') {
        None => (Some(target.to_string()), None),
        Some((t, n)) => (Some(t.to_string()), Some(n.to_string())),
    }
}

/// Check if a step matches the filter criteria
fn matches_filter(step: &dyn Step, step_type: Option<&str>, name: Option<&str>) -> bool {
    if let Some(st) = step_type {
        // Allow common aliases
        let matches_type = match st {
            "packages" => step.step_type() == "apt_package",
            "files" => matches!(step.step_type(), "file" | "app_tree"),
            "symlinks" => step.step_type() == "symlink",
            "venvs" => step.step_type() == "python_venv",
            "units" => step.step_type() == "systemd_unit",
            "services" => step.step_type() == "service",
            "sites" => step.step_type() == "nginx_site",
            _ => step.step_type() == st || step.step_type().starts_with(st),
        };
        if !matches_type {
            return false;
        }
    }

    if let Some(n) = name
        && !step.id().contains(n)
    {
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::NoPrivilege;
    use crate::types::{ApplyReport, StepState};
    use anyhow::Result;

    #[derive(Debug)]
    struct DummyStep {
        id: &'static str,
        step_type: &'static str,
    }

    impl Step for DummyStep {
        fn id(&self) -> String {
            self.id.to_string()
        }

        fn description(&self) -> String {
            self.id.to_string()
        }

        fn step_type(&self) -> &'static str {
            self.step_type
        }

        fn current_state(&self) -> Result<StepState> {
            Ok(StepState::Absent)
        }

        fn desired_state(&self) -> StepState {
            StepState::Present { details: None }
        }

        fn apply(&self, _ctx: &mut crate::context::ApplyContext) -> Result<ApplyReport> {
            Ok(ApplyReport::no_change())
        }
    }

    fn boxed(id: &'static str, step_type: &'static str) -> BoxedStep {
        Box::new(DummyStep { id, step_type })
    }

    #[test]
    fn stages_preserve_insertion_order() {
        let mut plan = ExecutionPlan::new();
        plan.add_step("packages", boxed("curl", "apt_package"), &NoPrivilege);
        plan.add_step("files", boxed("/etc/app.conf", "file"), &NoPrivilege);
        plan.add_step("packages", boxed("nginx", "apt_package"), &NoPrivilege);

        let names: Vec<_> = plan.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, ["packages", "files"]);
        assert_eq!(plan.stages[0].len(), 2);
    }

    #[test]
    fn filter_by_target_keeps_stage_order() {
        let mut plan = ExecutionPlan::new();
        plan.add_step("packages", boxed("curl", "apt_package"), &NoPrivilege);
        plan.add_step("files", boxed("/etc/app.conf", "file"), &NoPrivilege);
        plan.add_step("services", boxed("app.service", "service"), &NoPrivilege);

        let filtered = plan.filter_by_target(Some("files"));
        assert_eq!(filtered.total_steps(), 1);
        assert_eq!(filtered.stages[0].name, "files");
    }

    #[test]
    fn filter_by_type_and_name() {
        let mut plan = ExecutionPlan::new();
        plan.add_step("packages", boxed("curl", "apt_package"), &NoPrivilege);
        plan.add_step("packages", boxed("nginx", "apt_package"), &NoPrivilege);

        let filtered = plan.filter_by_target(Some("packages.nginx"));
        assert_eq!(filtered.total_steps(), 1);
        assert_eq!(filtered.iter_steps().next().unwrap().id(), "nginx");
    }

    #[test]
    fn parse_target_splits_once() {
        assert_eq!(parse_target("files"), (Some("files".to_string()), None));
        assert_eq!(
            parse_target("files./etc/nginx/nginx.conf"),
            (
                Some("files".to_string()),
                Some("/etc/nginx/nginx.conf".to_string())
            )
        );
    }

    #[test]
    fn post_actions_deduplicate() {
        let mut plan = ExecutionPlan::new();
        plan.add_post_action("daemon-reload".into());
        plan.add_post_action("daemon-reload".into());
        assert_eq!(plan.post_actions.len(), 1);
        assert!(plan.post_actions[0].when_changed.is_none());
    }

    #[test]
    fn unconditional_post_action_upgrades_conditional() {
        let mut plan = ExecutionPlan::new();
        plan.add_post_action_when("restart:bot".into(), "systemd_unit:bot.service".into());
        plan.add_post_action("restart:bot".into());

        assert_eq!(plan.post_actions.len(), 1);
        assert!(plan.post_actions[0].when_changed.is_none());

        // and the reverse never demotes
        plan.add_post_action_when("restart:bot".into(), "systemd_unit:bot.service".into());
        assert!(plan.post_actions[0].when_changed.is_none());
    }

    #[test]
    fn plans_are_debug_printable() {
        let mut plan = ExecutionPlan::new();
        plan.add_step("packages", boxed("curl", "apt_package"), &NoPrivilege);
        let rendered = format!("{plan:?}");
        assert!(rendered.contains("packages"));
    }
}
