//! Plan and status display
//!
//! Renders step diffs grouped by stage, with a marker for steps that will
//! need root. File content changes can additionally be shown as unified
//! diffs.

use colored::Colorize;
use converge::{DiffSummary, StepDiff, StepState};
use similar::{ChangeTag, TextDiff};

use crate::ui;

/// Print diffs grouped by stage
pub fn print_diffs(diffs: &[StepDiff]) {
    let mut current_stage: Option<&str> = None;

    for diff in diffs {
        if current_stage != Some(diff.stage.as_str()) {
            ui::section(&diff.stage);
            current_stage = Some(diff.stage.as_str());
        }

        let symbol = match &diff.current {
            StepState::Absent => "+".green().bold(),
            StepState::Drifted { .. } => "~".yellow().bold(),
            _ => "?".blue().bold(),
        };
        let root = if diff.requires_root {
            " (root)".red().to_string()
        } else {
            String::new()
        };

        println!("  {} {}{}", symbol, diff.description, root);

        match &diff.current {
            StepState::Drifted { from, to } => {
                println!("      {} {} {} {}", "from".dimmed(), from, "to".dimmed(), to);
            }
            StepState::Unknown => {
                println!("      {}", "current state unknown".dimmed());
            }
            _ => {}
        }
    }
}

/// Print the plan summary line and the privilege note
pub fn print_summary(summary: &DiffSummary) {
    println!();
    println!(
        "{} to create, {} to correct",
        summary.creations.to_string().green().bold(),
        summary.corrections.to_string().yellow().bold(),
    );

    if summary.root_required > 0 {
        ui::warn(&format!(
            "{} step(s) will require root privileges",
            summary.root_required
        ));
    }
}

/// Print the outcome of an apply run
pub fn print_run_report(report: &converge::RunReport) {
    let s = &report.summary;
    println!();
    if report.is_success() {
        ui::success(&format!(
            "{} created, {} corrected, {} unchanged{}",
            s.created,
            s.modified,
            s.no_change,
            if s.skipped > 0 {
                format!(", {} skipped", s.skipped)
            } else {
                String::new()
            }
        ));
    } else {
        for (id, error) in &report.failed {
            ui::error(&format!("{id}: {error}"));
        }
        if let Some(rollback) = &report.rollback {
            if !rollback.reverted.is_empty() {
                ui::warn(&format!("rolled back {} step(s)", rollback.reverted.len()));
            }
            for (id, reason) in &rollback.irreversible {
                ui::dim(&format!("{id} not reverted: {reason}"));
            }
            for (id, error) in &rollback.errors {
                ui::error(&format!("rollback of {id} failed: {error}"));
            }
        }
    }
}

/// Render a unified diff between current and desired file content
pub fn unified_diff(current: &str, desired: &str) -> String {
    let diff = TextDiff::from_lines(current, desired);
    let mut out = String::new();

    for change in diff.iter_all_changes() {
        let line = match change.tag() {
            ChangeTag::Delete => format!("-{change}").red().to_string(),
            ChangeTag::Insert => format!("+{change}").green().to_string(),
            ChangeTag::Equal => format!(" {change}").dimmed().to_string(),
        };
        out.push_str(&line);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unified_diff_marks_changes() {
        colored::control::set_override(false);
        let out = unified_diff("port=80\nhost=a\n", "port=8080\nhost=a\n");
        assert!(out.contains("-port=80\n"));
        assert!(out.contains("+port=8080\n"));
        assert!(out.contains(" host=a\n"));
        colored::control::unset_override();
    }

    #[test]
    fn unified_diff_of_identical_text_has_no_markers() {
        colored::control::set_override(false);
        let out = unified_diff("a\nb\n", "a\nb\n");
        assert!(!out.contains("+a"));
        assert!(!out.contains("-a"));
        colored::control::unset_override();
    }
}
