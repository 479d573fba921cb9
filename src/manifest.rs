//! Manifest schema - the declarative description of desired host state
//!
//! The manifest is TOML. Each section maps to one step type; the planner
//! turns entries into steps in dependency order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use converge::RollbackPolicy;

/// Errors that can occur while loading or validating a manifest
#[derive(Error, Debug)]
pub enum Error {
    /// IO error reading the manifest file
    #[error("could not read manifest {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML syntax or type error
    #[error("invalid manifest TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// A manifest entry that parsed but cannot be executed
    #[error("invalid {section} entry '{entry}': {reason}")]
    Invalid {
        section: &'static str,
        entry: String,
        reason: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;

/// The unified deckhand manifest
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Manifest {
    /// Host-level settings and template variables
    #[serde(default)]
    pub host: HostConfig,

    /// OS packages to install
    #[serde(default)]
    pub packages: PackagesConfig,

    /// Directories to create
    #[serde(default, rename = "directory")]
    pub directories: Vec<DirectoryEntry>,

    /// Managed files (inline content, copied source, or rendered template)
    #[serde(default, rename = "file")]
    pub files: Vec<FileEntry>,

    /// Application trees to sync into place
    #[serde(default, rename = "app_tree")]
    pub app_trees: Vec<AppTreeEntry>,

    /// Symlinks to create
    #[serde(default, rename = "symlink")]
    pub symlinks: Vec<SymlinkEntry>,

    /// Python virtualenvs to provision
    #[serde(default, rename = "venv")]
    pub venvs: Vec<VenvEntry>,

    /// systemd unit files
    #[serde(default, rename = "unit")]
    pub units: Vec<UnitEntry>,

    /// systemd services to enable/start
    #[serde(default, rename = "service")]
    pub services: Vec<ServiceEntry>,

    /// nginx sites (sites-available file + sites-enabled link)
    #[serde(default, rename = "nginx_site")]
    pub nginx_sites: Vec<NginxSiteEntry>,

    /// Rollback behavior on failure
    #[serde(default)]
    pub rollback: RollbackConfig,

    /// Privilege classification overrides
    #[serde(default)]
    pub privilege: PrivilegeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HostConfig {
    /// Application name, available to templates as {{app_name}}
    #[serde(default)]
    pub app_name: Option<String>,

    /// Extra template variables
    #[serde(default)]
    pub vars: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PackagesConfig {
    /// apt package names
    #[serde(default)]
    pub apt: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub path: String,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
}

/// A managed file
///
/// Exactly one of `content`, `source`, or `template` must be set;
/// `validate()` enforces this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntry {
    pub path: String,
    /// Inline literal content
    #[serde(default)]
    pub content: Option<String>,
    /// Path to copy verbatim
    #[serde(default)]
    pub source: Option<String>,
    /// Path to a template rendered with facts and vars
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub mode: Option<String>,
}

impl FileEntry {
    /// Count how many content sources are set
    fn source_count(&self) -> usize {
        [
            self.content.is_some(),
            self.source.is_some(),
            self.template.is_some(),
        ]
        .iter()
        .filter(|b| **b)
        .count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppTreeEntry {
    pub source: String,
    pub dest: String,
    /// Directory names skipped during the walk
    #[serde(default = "default_excludes")]
    pub exclude: Vec<String>,
}

fn default_excludes() -> Vec<String> {
    vec![
        ".git".to_string(),
        "venv".to_string(),
        "__pycache__".to_string(),
    ]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SymlinkEntry {
    /// Where the symlink is created
    pub link: String,
    /// What the symlink points to
    pub target: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenvEntry {
    /// Virtualenv directory
    pub path: String,
    /// requirements.txt to install
    #[serde(default)]
    pub requirements: Option<String>,
    /// Interpreter used to create the venv
    #[serde(default = "default_python")]
    pub python: String,
}

fn default_python() -> String {
    "python3".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitEntry {
    /// Unit file name, e.g. "security-bot.service"
    pub name: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceEntry {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub state: ServiceState,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    #[default]
    Started,
    Restarted,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NginxSiteEntry {
    /// Site name under sites-available/sites-enabled
    pub name: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub template: Option<String>,
    /// Run `nginx -t` before queueing the reload
    #[serde(default = "default_true")]
    pub validate: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RollbackConfig {
    #[serde(default)]
    pub policy: RollbackPolicy,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PrivilegeConfig {
    /// Path prefixes treated as unprivileged even though classification
    /// would normally require root (used for converging into test roots)
    #[serde(default)]
    pub unprivileged_roots: Vec<String>,
}

impl Manifest {
    /// Load and validate a manifest from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| Error::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let manifest: Self = toml::from_str(&content)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Parse a manifest from a TOML string (no validation)
    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Validate entries that parse but cannot be executed
    pub fn validate(&self) -> Result<()> {
        for file in &self.files {
            match file.source_count() {
                0 => {
                    return Err(invalid(
                        "file",
                        &file.path,
                        "one of content, source, or template is required",
                    ));
                }
                1 => {}
                _ => {
                    return Err(invalid(
                        "file",
                        &file.path,
                        "content, source, and template are mutually exclusive",
                    ));
                }
            }
            if !file.path.starts_with('/') && !file.path.starts_with('~') {
                return Err(invalid("file", &file.path, "path must be absolute"));
            }
            if let Some(mode) = &file.mode {
                validate_mode("file", &file.path, mode)?;
            }
        }

        for dir in &self.directories {
            if let Some(mode) = &dir.mode {
                validate_mode("directory", &dir.path, mode)?;
            }
        }

        for unit in &self.units {
            if !unit.name.contains('.') {
                return Err(invalid(
                    "unit",
                    &unit.name,
                    "unit name needs a suffix, e.g. '.service' or '.timer'",
                ));
            }
            if unit.content.is_some() == unit.template.is_some() {
                return Err(invalid(
                    "unit",
                    &unit.name,
                    "exactly one of content or template is required",
                ));
            }
        }

        for site in &self.nginx_sites {
            if site.name.contains('/') {
                return Err(invalid("nginx_site", &site.name, "name must not be a path"));
            }
            if site.content.is_some() == site.template.is_some() {
                return Err(invalid(
                    "nginx_site",
                    &site.name,
                    "exactly one of content or template is required",
                ));
            }
        }

        for venv in &self.venvs {
            if venv.path.is_empty() {
                return Err(invalid("venv", &venv.path, "path must not be empty"));
            }
        }

        for service in &self.services {
            if service.name.is_empty() {
                return Err(invalid("service", &service.name, "name must not be empty"));
            }
        }

        Ok(())
    }

    /// Total number of declared entries, for status summaries
    pub fn entry_count(&self) -> usize {
        self.packages.apt.len()
            + self.directories.len()
            + self.files.len()
            + self.app_trees.len()
            + self.symlinks.len()
            + self.venvs.len()
            + self.units.len()
            + self.services.len()
            + self.nginx_sites.len()
    }
}

fn invalid(section: &'static str, entry: &str, reason: &str) -> Error {
    Error::Invalid {
        section,
        entry: entry.to_string(),
        reason: reason.to_string(),
    }
}

fn validate_mode(section: &'static str, entry: &str, mode: &str) -> Result<()> {
    if mode.len() > 4 || u32::from_str_radix(mode, 8).is_err() {
        return Err(invalid(section, entry, "mode must be octal, e.g. \"0644\""));
    }
    Ok(())
}

/// Starter manifest written by `deckhand manifest init`
pub fn starter(app_name: &str) -> String {
    format!(
        r#"# deckhand manifest - desired state for this host

[host]
app_name = "{app_name}"

[host.vars]
listen_port = "8000"

[packages]
apt = ["python3", "python3-venv", "python3-pip", "nginx"]

[[directory]]
path = "/opt/{app_name}"
mode = "0755"

[[app_tree]]
source = "."
dest = "/opt/{app_name}"

[[venv]]
path = "/opt/{app_name}/venv"
requirements = "/opt/{app_name}/requirements.txt"

[[unit]]
name = "{app_name}.service"
content = """
[Unit]
Description={app_name}
After=network.target

[Service]
WorkingDirectory=/opt/{app_name}
ExecStart=/opt/{app_name}/venv/bin/python main.py
Restart=on-failure

[Install]
WantedBy=multi-user.target
"""

[[service]]
name = "{app_name}"
enabled = true
state = "started"

[[nginx_site]]
name = "{app_name}"
content = """
server {{
    listen 80;
    location / {{
        proxy_pass http://127.0.0.1:{{{{listen_port}}}};
        proxy_set_header Host $host;
    }}
}}
"""

[rollback]
policy = "stage"
"#
    )
}
