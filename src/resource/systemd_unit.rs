//! systemd unit file step
//!
//! Writes a unit file under /etc/systemd/system. A changed unit file needs
//! `systemctl daemon-reload` before it takes effect; the planner queues
//! that as a post-action rather than each step reloading on its own.

use anyhow::Result;
use converge::{ApplyContext, ApplyReport, Step, StepState};
use std::path::PathBuf;

use super::file::{ensure_file_content, file_state, short_hash};

const UNIT_DIR: &str = "/etc/systemd/system";

/// A systemd unit file to install
#[derive(Debug, Clone)]
pub struct SystemdUnit {
    /// Unit file name, e.g. "security-bot.service"
    pub name: String,
    pub content: String,
    unit_dir: PathBuf,
}

impl SystemdUnit {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            unit_dir: PathBuf::from(UNIT_DIR),
        }
    }

    /// Override the unit directory (tests, chroots)
    pub fn with_unit_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.unit_dir = dir.into();
        self
    }

    pub fn unit_path(&self) -> PathBuf {
        self.unit_dir.join(&self.name)
    }
}

impl Step for SystemdUnit {
    fn id(&self) -> String {
        self.name.clone()
    }

    fn description(&self) -> String {
        format!("Unit file {}", self.unit_path().display())
    }

    fn step_type(&self) -> &'static str {
        "systemd_unit"
    }

    fn current_state(&self) -> Result<StepState> {
        file_state(&self.unit_path(), self.content.as_bytes(), Some(0o644))
    }

    fn desired_state(&self) -> StepState {
        StepState::Present {
            details: Some(short_hash(self.content.as_bytes())),
        }
    }

    fn apply(&self, ctx: &mut ApplyContext) -> Result<ApplyReport> {
        ensure_file_content(
            ctx,
            &self.unit_path(),
            self.content.as_bytes(),
            Some(0o644),
            None,
            None,
        )
    }
}
