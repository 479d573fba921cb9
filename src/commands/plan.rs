//! `deckhand plan` - show pending changes without applying

use anyhow::Result;
use converge::{DiffSummary, compute_diffs};

use crate::engine::{self, differ};
use crate::facts::Facts;
use crate::manifest::Manifest;
use crate::paths;
use crate::ui;

pub fn run(manifest_flag: Option<&str>, target: Option<&str>, show_diff: bool) -> Result<()> {
    let path = paths::manifest_path(manifest_flag)?;
    let manifest = Manifest::load(&path)?;
    let facts = Facts::gather()?;

    ui::header(&format!("Plan for {}", facts.hostname));
    ui::dim(&format!("manifest: {}", path.display()));

    let plan = engine::build_plan(&manifest, &facts)?.filter_by_target(target);

    let spinner = crate::progress::spinner("detecting current state");
    let diffs = compute_diffs(&plan);
    spinner.finish_and_clear();

    if diffs.is_empty() {
        ui::success("host is converged, nothing to do");
        return Ok(());
    }

    differ::print_diffs(&diffs);
    differ::print_summary(&DiffSummary::from_diffs(&diffs));

    if show_diff {
        print_file_diffs(&manifest, &facts)?;
    }

    if !plan.post_actions.is_empty() {
        let actions: Vec<&str> = plan.post_actions.iter().map(|p| p.action.as_str()).collect();
        ui::dim(&format!("post-actions: {}", actions.join(", ")));
    }

    Ok(())
}

/// Show unified content diffs for drifted managed files
fn print_file_diffs(manifest: &Manifest, facts: &Facts) -> Result<()> {
    let vars = facts.template_vars(&manifest.host.vars);

    for entry in &manifest.files {
        let desired = engine::planner::resolve_file_content(entry, &vars)?;
        let path = paths::expand(&entry.path);

        let Ok(current) = std::fs::read(&path) else {
            continue; // absent or unreadable, the step diff already covers it
        };
        if current == desired {
            continue;
        }

        let (Ok(current), Ok(desired)) =
            (String::from_utf8(current), String::from_utf8(desired))
        else {
            ui::dim(&format!("{}: binary content differs", path.display()));
            continue;
        };

        ui::section(&path.display().to_string());
        print!("{}", differ::unified_diff(&current, &desired));
    }

    Ok(())
}
