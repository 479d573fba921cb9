//! systemd service step
//!
//! Converges a service's enablement and activity. `state = "restarted"`
//! converges like `started`; the actual restart on code or unit changes is
//! queued by the planner as a post-action so an unchanged host never
//! bounces its services.

use anyhow::{Result, bail};
use converge::{ApplyContext, ApplyReport, Step, StepState, UndoAction};
use std::process::Command;

use crate::manifest::ServiceState;

/// A systemd service to enable and run
#[derive(Debug, Clone)]
pub struct Service {
    pub name: String,
    pub enabled: bool,
    pub state: ServiceState,
}

impl Service {
    pub fn new(name: impl Into<String>, enabled: bool, state: ServiceState) -> Self {
        Self {
            name: name.into(),
            enabled,
            state,
        }
    }

    fn want_active(&self) -> bool {
        matches!(self.state, ServiceState::Started | ServiceState::Restarted)
    }

    /// Query systemctl; None when systemctl itself is unavailable
    fn query(&self, verb: &str) -> Option<String> {
        let output = Command::new("systemctl")
            .args([verb, &self.name])
            .output()
            .ok()?;
        Some(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn is_enabled(&self) -> Option<bool> {
        self.query("is-enabled").map(|s| s == "enabled")
    }

    fn is_active(&self) -> Option<bool> {
        self.query("is-active").map(|s| s == "active")
    }

    fn systemctl(&self, ctx: &ApplyContext, verb: &str) -> Result<()> {
        let privilege = ctx.require_privilege()?;
        let output = privilege.run("systemctl", &[verb, &self.name])?;
        if !output.success {
            bail!(
                "systemctl {verb} {} failed: {}",
                self.name,
                output.stderr_str().trim()
            );
        }
        Ok(())
    }

    fn describe(enabled: bool, active: bool) -> String {
        format!(
            "{}, {}",
            if enabled { "enabled" } else { "disabled" },
            if active { "active" } else { "inactive" }
        )
    }
}

impl Step for Service {
    fn id(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        format!(
            "Service {} ({})",
            self.name,
            Self::describe(self.enabled, self.want_active())
        )
    }

    fn step_type(&self) -> &'static str {
        "service"
    }

    fn current_state(&self) -> Result<StepState> {
        let (Some(enabled), Some(active)) = (self.is_enabled(), self.is_active()) else {
            return Ok(StepState::Unknown);
        };

        if enabled == self.enabled && active == self.want_active() {
            Ok(StepState::Present {
                details: Some(Self::describe(enabled, active)),
            })
        } else {
            Ok(StepState::Drifted {
                from: Self::describe(enabled, active),
                to: Self::describe(self.enabled, self.want_active()),
            })
        }
    }

    fn desired_state(&self) -> StepState {
        StepState::Present {
            details: Some(Self::describe(self.enabled, self.want_active())),
        }
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyReport> {
        let enabled = self.is_enabled();
        let active = self.is_active();

        let fix_enabled = enabled != Some(self.enabled);
        let fix_active = active != Some(self.want_active());

        if !fix_enabled && !fix_active {
            return Ok(ApplyReport::no_change());
        }

        if ctx.dry_run {
            return Ok(ApplyReport::skipped("dry run"));
        }

        let mut undo = None;

        if fix_enabled {
            let verb = if self.enabled { "enable" } else { "disable" };
            self.systemctl(ctx, verb)?;
            undo = Some(UndoAction::RunCommand {
                program: "systemctl".to_string(),
                args: vec![
                    if self.enabled { "disable" } else { "enable" }.to_string(),
                    self.name.clone(),
                ],
            });
        }

        if fix_active {
            let verb = if self.want_active() { "start" } else { "stop" };
            self.systemctl(ctx, verb)?;
            // Activity undo wins: a half-started service is the worse leftover
            undo = Some(UndoAction::RunCommand {
                program: "systemctl".to_string(),
                args: vec![
                    if self.want_active() { "stop" } else { "start" }.to_string(),
                    self.name.clone(),
                ],
            });
        }

        let undo = undo.unwrap_or(UndoAction::Irreversible {
            reason: "no previous state recorded".to_string(),
        });

        if enabled == Some(false) && active == Some(false) {
            Ok(ApplyReport::created(undo))
        } else {
            Ok(ApplyReport::modified(undo))
        }
    }

    fn parallel_safe(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge::StepExt;

    #[test]
    fn identity() {
        let step = Service::new("security-bot", true, ServiceState::Started);
        assert_eq!(step.label(), "service:security-bot");
        assert!(!step.parallel_safe());
    }

    #[test]
    fn restarted_converges_like_started() {
        let step = Service::new("bot", true, ServiceState::Restarted);
        assert!(step.want_active());
        assert_eq!(step.desired_state(), StepState::Present {
            details: Some("enabled, active".to_string()),
        });
    }

    #[test]
    fn stopped_wants_inactive() {
        let step = Service::new("bot", false, ServiceState::Stopped);
        assert!(!step.want_active());
        assert_eq!(step.desired_state(), StepState::Present {
            details: Some("disabled, inactive".to_string()),
        });
    }

    #[test]
    fn describe_formats() {
        assert_eq!(Service::describe(true, false), "enabled, inactive");
    }
}
