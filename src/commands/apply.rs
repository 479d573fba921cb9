//! `deckhand apply` - converge the host toward the manifest

use anyhow::{Result, bail};
use chrono::Local;
use converge::{DiffSummary, RollbackPolicy, RunOptions, RunReport, compute_diffs};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::engine::{self, differ};
use crate::facts::Facts;
use crate::manifest::Manifest;
use crate::paths;
use crate::ui;

pub struct ApplyOptions<'a> {
    pub target: Option<&'a str>,
    pub dry_run: bool,
    pub yes: bool,
    pub jobs: usize,
    pub rollback: Option<&'a str>,
    pub verbose: bool,
}

pub fn run(manifest_flag: Option<&str>, opts: &ApplyOptions<'_>) -> Result<()> {
    let path = paths::manifest_path(manifest_flag)?;
    let manifest = Manifest::load(&path)?;
    let facts = Facts::gather()?;

    let rollback = match opts.rollback {
        Some("none") => RollbackPolicy::None,
        Some("stage") => RollbackPolicy::Stage,
        Some("full") => RollbackPolicy::Full,
        Some(other) => bail!("unknown rollback policy '{other}' (none, stage, full)"),
        None => manifest.rollback.policy,
    };

    ui::header(&format!("Apply on {}", facts.hostname));
    ui::dim(&format!("manifest: {}", path.display()));

    let plan = engine::build_plan(&manifest, &facts)?.filter_by_target(opts.target);

    let spinner = crate::progress::spinner("detecting current state");
    let diffs = compute_diffs(&plan);
    spinner.finish_and_clear();

    if diffs.is_empty() {
        ui::success("host is converged, nothing to do");
        return Ok(());
    }

    differ::print_diffs(&diffs);
    differ::print_summary(&DiffSummary::from_diffs(&diffs));

    if opts.dry_run {
        ui::info("dry run, no changes made");
        return Ok(());
    }

    let run_options = RunOptions {
        dry_run: false,
        jobs: opts.jobs.max(1),
        verbose: opts.verbose,
        rollback,
    };

    let report = engine::run_plan(plan, run_options, opts.yes)?;
    differ::print_run_report(&report);

    match paths::state_dir().and_then(|dir| persist_report(&dir, &path, &report)) {
        Ok(saved) => log::debug!("apply report written to {}", saved.display()),
        Err(e) => log::warn!("could not write apply report: {e:#}"),
    }

    if !report.is_success() {
        bail!("apply failed on {} step(s)", report.failed.len());
    }

    Ok(())
}

/// One run's outcome, as recorded on disk
#[derive(Serialize)]
struct ApplyRecord<'a> {
    finished_at: String,
    manifest: String,
    summary: &'a converge::RunSummary,
    failed: &'a [(String, String)],
    rolled_back: &'a [String],
}

/// Write the run report to the state directory, named by completion time
fn persist_report(dir: &Path, manifest: &Path, report: &RunReport) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;

    let record = ApplyRecord {
        finished_at: Local::now().to_rfc3339(),
        manifest: manifest.display().to_string(),
        summary: &report.summary,
        failed: &report.failed,
        rolled_back: report
            .rollback
            .as_ref()
            .map_or(&[][..], |r| r.reverted.as_slice()),
    };

    let path = dir.join(format!("apply-{}.json", Local::now().format("%Y%m%d-%H%M%S")));
    fs::write(&path, serde_json::to_vec_pretty(&record)?)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_report_lands_in_the_state_dir_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = RunReport::default();
        report.summary.created = 2;
        report.summary.failed = 1;
        report.failed.push(("service:bot".to_string(), "boom".to_string()));

        let saved = persist_report(
            dir.path(),
            Path::new("/etc/deckhand/manifest.toml"),
            &report,
        )
        .unwrap();

        let name = saved.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("apply-") && name.ends_with(".json"));

        let json: serde_json::Value = serde_json::from_slice(&fs::read(&saved).unwrap()).unwrap();
        assert_eq!(json["summary"]["created"], 2);
        assert_eq!(json["failed"][0][0], "service:bot");
        assert_eq!(json["manifest"], "/etc/deckhand/manifest.toml");
    }
}
