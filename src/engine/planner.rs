//! Plan builder - turns a manifest plus facts into a staged execution plan
//!
//! Stage order encodes the hard dependencies of host provisioning:
//! packages before anything that needs their binaries, directories before
//! the files inside them, unit files before the services that run them.
//! Post-actions (daemon-reload, nginx reload, restarts) are queued on the
//! plan and run once after all stages succeed.

use anyhow::{Context, Result};
use converge::{BoxedStep, ExecutionPlan};
use std::collections::HashMap;
use std::fs;

use crate::facts::Facts;
use crate::manifest::{FileEntry, Manifest, ServiceState};
use crate::paths::expand;
use crate::resource::{
    AppTree, AptCacheRefresh, AptPackage, Directory, ManagedFile, NginxSite, PythonVenv, Service,
    Symlink, SystemdUnit,
};
use crate::sudo::SudoRules;
use crate::template;

/// Stage names in execution order
pub const STAGES: [&str; 8] = [
    "packages",
    "directories",
    "files",
    "symlinks",
    "venvs",
    "units",
    "sites",
    "services",
];

/// Build the full execution plan for a manifest
pub fn build_plan(manifest: &Manifest, facts: &Facts) -> Result<ExecutionPlan> {
    let vars = facts.template_vars(&manifest.host.vars);
    let rules = SudoRules::new(&manifest.privilege);
    let mut plan = ExecutionPlan::new();

    // Seed stages so insertion order never depends on manifest section order
    for stage in STAGES {
        plan.stage_mut(stage);
    }

    if !manifest.packages.apt.is_empty() {
        if !crate::resource::apt_package::apt_available() {
            log::warn!("apt toolchain not found on this host; package steps will fail");
        }
        plan.add_step("packages", Box::new(AptCacheRefresh::new()) as BoxedStep, &rules);
        for name in &manifest.packages.apt {
            plan.add_step("packages", Box::new(AptPackage::new(name)), &rules);
        }
    }

    for entry in &manifest.directories {
        let step = Directory::new(expand(&entry.path)).with_attrs(
            entry.owner.clone(),
            entry.group.clone(),
            parse_mode(entry.mode.as_deref())?,
        );
        plan.add_step("directories", Box::new(step), &rules);
    }

    for entry in &manifest.files {
        let content = resolve_file_content(entry, &vars)?;
        let step = ManagedFile::new(expand(&entry.path), content).with_attrs(
            entry.owner.clone(),
            entry.group.clone(),
            parse_mode(entry.mode.as_deref())?,
        );
        plan.add_step("files", Box::new(step), &rules);
    }

    for entry in &manifest.app_trees {
        let step = AppTree::new(expand(&entry.source), expand(&entry.dest), entry.exclude.clone());
        plan.add_step("files", Box::new(step), &rules);
    }

    for entry in &manifest.symlinks {
        let step = Symlink::new(expand(&entry.link), expand(&entry.target));
        plan.add_step("symlinks", Box::new(step), &rules);
    }

    for entry in &manifest.venvs {
        let requirements = entry.requirements.as_deref().map(expand);
        let step = PythonVenv::new(expand(&entry.path), requirements, entry.python.clone());
        plan.add_step("venvs", Box::new(step), &rules);
    }

    for entry in &manifest.units {
        let content = resolve_inline_or_template(
            entry.content.as_deref(),
            entry.template.as_deref(),
            &vars,
        )
        .with_context(|| format!("unit {}", entry.name))?;
        plan.add_step("units", Box::new(SystemdUnit::new(&entry.name, content)), &rules);
    }
    if !manifest.units.is_empty() {
        plan.add_post_action("daemon-reload".to_string());
    }

    for entry in &manifest.nginx_sites {
        let content = resolve_inline_or_template(
            entry.content.as_deref(),
            entry.template.as_deref(),
            &vars,
        )
        .with_context(|| format!("nginx site {}", entry.name))?;
        plan.add_step(
            "sites",
            Box::new(NginxSite::new(&entry.name, content, entry.validate)),
            &rules,
        );
    }
    if !manifest.nginx_sites.is_empty() {
        plan.add_post_action("reload:nginx".to_string());
    }

    for entry in &manifest.services {
        plan.add_step(
            "services",
            Box::new(Service::new(&entry.name, entry.enabled, entry.state)),
            &rules,
        );
        if entry.state == ServiceState::Restarted {
            plan.add_post_action(format!("restart:{}", entry.name));
        } else if entry.state != ServiceState::Stopped {
            // A changed unit file must bounce the service that runs it,
            // or the old unit keeps executing after daemon-reload
            if let Some(unit) = manifest
                .units
                .iter()
                .find(|u| unit_matches_service(&u.name, &entry.name))
            {
                plan.add_post_action_when(
                    format!("restart:{}", entry.name),
                    format!("systemd_unit:{}", unit.name),
                );
            }
        }
    }

    Ok(plan)
}

/// "bot" and "bot.service" name the same unit
fn unit_matches_service(unit: &str, service: &str) -> bool {
    let unit = unit.strip_suffix(".service").unwrap_or(unit);
    let service = service.strip_suffix(".service").unwrap_or(service);
    unit == service
}

/// Resolve a file entry's final content
///
/// Inline content and templates are rendered with the variable set, so
/// `{{listen_port}}` works the same in both. `source` files are copied
/// byte for byte.
pub fn resolve_file_content(entry: &FileEntry, vars: &HashMap<String, String>) -> Result<Vec<u8>> {
    match (&entry.content, &entry.source, &entry.template) {
        (Some(inline), None, None) => Ok(template::render(inline, vars)?.into_bytes()),
        (None, Some(source), None) => {
            let path = expand(source);
            fs::read(&path).with_context(|| format!("could not read {}", path.display()))
        }
        (None, None, Some(tpl)) => Ok(template::render_file(&expand(tpl), vars)?.into_bytes()),
        _ => anyhow::bail!("file {} needs exactly one content source", entry.path),
    }
}

fn resolve_inline_or_template(
    content: Option<&str>,
    tpl: Option<&str>,
    vars: &HashMap<String, String>,
) -> Result<String> {
    match (content, tpl) {
        (Some(inline), None) => template::render(inline, vars),
        (None, Some(tpl)) => template::render_file(&expand(tpl), vars),
        _ => anyhow::bail!("exactly one of content or template is required"),
    }
}

fn parse_mode(mode: Option<&str>) -> Result<Option<u32>> {
    mode.map(|m| {
        u32::from_str_radix(m, 8).with_context(|| format!("invalid octal mode {m}"))
    })
    .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan_for(toml: &str) -> ExecutionPlan {
        let manifest = Manifest::parse(toml).unwrap();
        manifest.validate().unwrap();
        let facts = Facts {
            hostname: "web-1".into(),
            user: "ubuntu".into(),
            os_id: "ubuntu".into(),
            os_name: "Ubuntu 24.04".into(),
            instance: None,
        };
        build_plan(&manifest, &facts).unwrap()
    }

    #[test]
    fn empty_manifest_yields_empty_plan() {
        let plan = plan_for("");
        assert!(plan.is_empty());
        assert!(plan.post_actions.is_empty());
    }

    #[test]
    fn stages_come_out_in_provisioning_order() {
        let plan = plan_for(
            r#"
[[service]]
name = "bot"

[packages]
apt = ["nginx"]

[[directory]]
path = "/opt/bot"
"#,
        );

        let names: Vec<_> = plan.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, STAGES);
    }

    #[test]
    fn packages_get_a_cache_refresh_first() {
        let plan = plan_for("[packages]\napt = [\"nginx\", \"python3\"]");
        let packages = &plan.stages[0];
        assert_eq!(packages.len(), 3);
        assert_eq!(packages.privileged[0].id(), "index");
    }

    #[test]
    fn package_steps_are_privileged() {
        let plan = plan_for("[packages]\napt = [\"nginx\"]");
        assert!(plan.has_privileged());
        assert!(plan.stages[0].unprivileged.is_empty());
    }

    #[test]
    fn inline_content_is_rendered_with_vars() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest::parse(&format!(
            r#"
[host.vars]
listen_port = "8000"

[privilege]
unprivileged_roots = ["{root}"]

[[file]]
path = "{root}/app.conf"
content = "port={{{{listen_port}}}}"
"#,
            root = dir.path().display()
        ))
        .unwrap();

        let facts = Facts::default();
        let plan = build_plan(&manifest, &facts).unwrap();
        let files = plan.stages.iter().find(|s| s.name == "files").unwrap();
        assert_eq!(files.unprivileged.len(), 1);
        assert_eq!(
            files.unprivileged[0].desired_state(),
            converge::StepState::Present {
                details: Some(crate::resource::file::short_hash(b"port=8000")),
            }
        );
    }

    #[test]
    fn undefined_variable_fails_plan_build() {
        let manifest = Manifest::parse(
            r#"
[[file]]
path = "/etc/app.conf"
content = "host={{nope}}"
"#,
        )
        .unwrap();
        let err = build_plan(&manifest, &Facts::default()).unwrap_err();
        assert!(format!("{err:#}").contains("nope"));
    }

    #[test]
    fn units_and_sites_queue_post_actions() {
        let plan = plan_for(
            r#"
[[unit]]
name = "bot.service"
content = "[Unit]"

[[nginx_site]]
name = "bot"
content = "server {}"

[[service]]
name = "bot"
state = "restarted"
"#,
        );

        let actions: Vec<_> = plan.post_actions.iter().map(|p| p.action.as_str()).collect();
        assert_eq!(actions, ["daemon-reload", "reload:nginx", "restart:bot"]);
        // restarted is unconditional, not tied to the unit file
        assert!(plan.post_actions[2].when_changed.is_none());
    }

    #[test]
    fn unit_change_restarts_the_service_that_runs_it() {
        let plan = plan_for(
            r#"
[[unit]]
name = "bot.service"
content = "[Unit]"

[[service]]
name = "bot"
state = "started"
"#,
        );

        let restart = plan
            .post_actions
            .iter()
            .find(|p| p.action == "restart:bot")
            .expect("restart queued for managed unit");
        assert_eq!(restart.when_changed.as_deref(), Some("systemd_unit:bot.service"));
    }

    #[test]
    fn stopped_service_never_queues_a_restart() {
        let plan = plan_for(
            r#"
[[unit]]
name = "bot.service"
content = "[Unit]"

[[service]]
name = "bot"
enabled = false
state = "stopped"
"#,
        );

        assert!(!plan.post_actions.iter().any(|p| p.action.starts_with("restart:")));
    }

    #[test]
    fn unprivileged_roots_declassify_file_steps() {
        let plan = plan_for(
            r#"
[privilege]
unprivileged_roots = ["/tmp/stage"]

[[directory]]
path = "/tmp/stage/opt"

[[directory]]
path = "/opt/real"
"#,
        );

        let dirs = plan.stages.iter().find(|s| s.name == "directories").unwrap();
        assert_eq!(dirs.unprivileged.len(), 1);
        assert_eq!(dirs.privileged.len(), 1);
    }

    #[test]
    fn source_files_are_copied_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("app.conf");
        fs::write(&src, "raw {{not_a_var}}").unwrap();

        let entry = FileEntry {
            path: "/etc/app.conf".into(),
            content: None,
            source: Some(src.to_string_lossy().to_string()),
            template: None,
            owner: None,
            group: None,
            mode: None,
        };
        let content = resolve_file_content(&entry, &HashMap::new()).unwrap();
        assert_eq!(content, b"raw {{not_a_var}}");
    }
}
