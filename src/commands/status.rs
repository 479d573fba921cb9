//! `deckhand status` - per-step convergence report

use anyhow::Result;
use colored::Colorize;
use converge::{StepExt, StepState};
use serde::Serialize;

use crate::engine;
use crate::facts::Facts;
use crate::manifest::Manifest;
use crate::paths;
use crate::ui;

#[derive(Serialize)]
struct StatusEntry {
    id: String,
    step_type: String,
    stage: String,
    converged: bool,
    current: StepState,
}

#[derive(Serialize)]
struct StatusReport {
    hostname: String,
    manifest: String,
    converged: usize,
    drifted: usize,
    entries: Vec<StatusEntry>,
}

/// Report convergence state; returns false when any step has drift
pub fn run(manifest_flag: Option<&str>, target: Option<&str>, json: bool) -> Result<bool> {
    let path = paths::manifest_path(manifest_flag)?;
    let manifest = Manifest::load(&path)?;
    let facts = Facts::gather()?;

    let plan = engine::build_plan(&manifest, &facts)?.filter_by_target(target);

    let mut entries = Vec::new();
    for stage in &plan.stages {
        for step in stage.unprivileged.iter().chain(stage.privileged.iter()) {
            let current = step.current_state().unwrap_or(StepState::Unknown);
            let converged = step.needs_apply().map(|n| !n).unwrap_or(false);
            entries.push(StatusEntry {
                id: step.label(),
                step_type: step.step_type().to_string(),
                stage: stage.name.clone(),
                converged,
                current,
            });
        }
    }

    let drifted = entries.iter().filter(|e| !e.converged).count();
    let converged = entries.len() - drifted;

    if json {
        let report = StatusReport {
            hostname: facts.hostname,
            manifest: path.display().to_string(),
            converged,
            drifted,
            entries,
        };
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(drifted == 0);
    }

    ui::header(&format!("Status of {}", facts.hostname));
    ui::dim(&format!("manifest: {}", path.display()));

    let mut current_stage = String::new();
    for entry in &entries {
        if entry.stage != current_stage {
            ui::section(&entry.stage);
            current_stage.clone_from(&entry.stage);
        }

        if entry.converged {
            println!("  {} {}", "✓".green(), entry.id);
        } else {
            let detail = match &entry.current {
                StepState::Absent => "missing".to_string(),
                StepState::Drifted { from, .. } => format!("drifted: {from}"),
                StepState::Unknown => "state unknown".to_string(),
                StepState::Present { .. } => "out of date".to_string(),
            };
            println!("  {} {} {}", "✗".red(), entry.id, detail.dimmed());
        }
    }

    println!();
    if drifted == 0 {
        ui::success(&format!("{converged} step(s) converged"));
    } else {
        ui::warn(&format!(
            "{converged} converged, {drifted} drifted - run `deckhand apply`"
        ));
    }

    Ok(drifted == 0)
}
