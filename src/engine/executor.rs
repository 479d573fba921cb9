//! Apply orchestration
//!
//! Wraps the converge executor with the console: confirmation prompt,
//! per-stage progress, privilege acquisition, and post-actions. Post-
//! actions only run when the plan actually changed something, so a
//! converged host never reloads systemd or bounces nginx.

use anyhow::{Context, Result, bail};
use colored::Colorize;
use converge::{
    ConfirmPrompt, ExecutionPlan, PrivilegeProvider, ProgressSink, RunOptions, RunReport,
    StepResult,
};
use dialoguer::Confirm;
use dialoguer::theme::ColorfulTheme;

use crate::sudo::{DirectRoot, SudoContext};
use crate::ui;

/// Execute a plan with console interaction and run its post-actions
pub fn run_plan(plan: ExecutionPlan, opts: RunOptions, assume_yes: bool) -> Result<RunReport> {
    let mut progress = ConsoleProgress::default();
    let mut confirm = if assume_yes || opts.dry_run {
        ConsoleConfirm::Auto
    } else {
        ConsoleConfirm::Prompt
    };

    let report = converge::execute(plan, opts, acquire_provider, &mut progress, &mut confirm)?;

    if report.is_success()
        && report.summary.total_changes() > 0
        && !report.pending_post_actions.is_empty()
    {
        run_post_actions(&report.pending_post_actions)?;
    }

    Ok(report)
}

/// Pick the privilege provider for this process
///
/// Already-root processes (cloud-init, CI) run commands directly; everyone
/// else gets a scoped sudo session.
fn acquire_provider() -> Result<Box<dyn PrivilegeProvider>> {
    if DirectRoot::applies() {
        log::debug!("running as root, skipping sudo");
        Ok(Box::new(DirectRoot))
    } else {
        let ctx = SudoContext::acquire("apply privileged provisioning steps")?;
        Ok(Box::new(ctx))
    }
}

/// Run queued post-actions through a fresh privilege session
fn run_post_actions(actions: &[String]) -> Result<()> {
    let provider = acquire_provider().context("post-actions need privileges")?;

    for action in actions {
        let args: Vec<String> = match action.split_once(':') {
            None if action == "daemon-reload" => vec!["daemon-reload".to_string()],
            Some(("reload", unit)) => vec!["reload-or-restart".to_string(), unit.to_string()],
            Some(("restart", unit)) => vec!["restart".to_string(), unit.to_string()],
            _ => {
                log::warn!("unknown post-action {action}, skipping");
                continue;
            }
        };

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = provider.run("systemctl", &arg_refs)?;
        if output.success {
            ui::dim(&format!("post-action: systemctl {}", args.join(" ")));
        } else {
            bail!(
                "post-action systemctl {} failed: {}",
                args.join(" "),
                output.stderr_str().trim()
            );
        }
    }

    Ok(())
}

/// Console progress: stage headers, a progress bar per multi-step stage,
/// and one line per changed step
#[derive(Default)]
struct ConsoleProgress {
    bar: Option<indicatif::ProgressBar>,
}

impl ConsoleProgress {
    fn emit(&self, line: &str) {
        match &self.bar {
            Some(bar) => bar.println(line),
            None => println!("{line}"),
        }
    }
}

impl ProgressSink for ConsoleProgress {
    fn on_stage_start(&mut self, stage: &str, count: usize, privileged: bool) {
        let marker = if privileged {
            " (root)".red().to_string()
        } else {
            String::new()
        };
        println!();
        println!(
            "{} {}{} ({} step{})",
            "»".cyan().bold(),
            stage.bold(),
            marker,
            count,
            if count == 1 { "" } else { "s" }
        );

        self.bar = (count > 1).then(|| crate::progress::stage_bar(count as u64, stage));
    }

    fn on_step_complete(&mut self, id: &str, result: &StepResult) {
        if let Some(bar) = &self.bar {
            bar.inc(1);
        }
        match result {
            StepResult::Created => self.emit(&format!("  {} {}", "+".green().bold(), id)),
            StepResult::Modified => self.emit(&format!("  {} {}", "~".yellow().bold(), id)),
            StepResult::Failed { error } => {
                self.emit(&format!("  {} {}: {}", "✗".red().bold(), id, error));
            }
            StepResult::Skipped { reason } => {
                self.emit(&format!(
                    "  {} {} ({})",
                    "-".dimmed(),
                    id.dimmed(),
                    reason.dimmed()
                ));
            }
            StepResult::NoChange => {
                log::debug!("{id}: already converged");
            }
        }
    }

    fn on_stage_complete(&mut self, _stage: &str) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }

    fn on_rollback(&mut self, id: &str) {
        println!("  {} {}", "↩".yellow().bold(), id);
    }
}

/// Confirmation via dialoguer, or auto-approval for `--yes` and dry runs
enum ConsoleConfirm {
    Auto,
    Prompt,
}

impl ConfirmPrompt for ConsoleConfirm {
    fn confirm(&mut self, prompt: &str) -> Result<bool> {
        match self {
            Self::Auto => Ok(true),
            Self::Prompt => Confirm::with_theme(&ColorfulTheme::default())
                .with_prompt(prompt)
                .default(false)
                .interact()
                .context("confirmation prompt failed"),
        }
    }
}
