//! Path resolution for deckhand
//!
//! # Environment Variables
//!
//! - `DECKHAND_MANIFEST` - override the manifest path
//! - `DECKHAND_STATE_DIR` - override the state directory (apply reports)
//!
//! # Manifest Resolution Priority
//!
//! 1. `--manifest` flag
//! 2. `DECKHAND_MANIFEST` environment variable
//! 3. `./deckhand.toml`
//! 4. `/etc/deckhand/manifest.toml`

use anyhow::{Context, Result, bail};
use std::path::PathBuf;

/// Environment variable for manifest path override
pub const ENV_MANIFEST: &str = "DECKHAND_MANIFEST";

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "DECKHAND_STATE_DIR";

/// Default system-wide manifest location
const SYSTEM_MANIFEST: &str = "/etc/deckhand/manifest.toml";

/// Resolve the manifest path
pub fn manifest_path(flag: Option<&str>) -> Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(expand(path));
    }

    if let Ok(path) = std::env::var(ENV_MANIFEST) {
        let path = expand(&path);
        log::debug!("using manifest from {}: {}", ENV_MANIFEST, path.display());
        return Ok(path);
    }

    let local = PathBuf::from("deckhand.toml");
    if local.exists() {
        return Ok(local);
    }

    let system = PathBuf::from(SYSTEM_MANIFEST);
    if system.exists() {
        return Ok(system);
    }

    bail!(
        "no manifest found: pass --manifest, set {}, or create ./deckhand.toml",
        ENV_MANIFEST
    );
}

/// Get the state directory (apply reports land here)
///
/// Priority:
/// 1. `DECKHAND_STATE_DIR` env var
/// 2. `XDG_STATE_HOME/deckhand`
/// 3. `~/.local/state/deckhand`
pub fn state_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(ENV_STATE_DIR) {
        let path = expand(&dir);
        log::debug!("using state dir from {}: {}", ENV_STATE_DIR, path.display());
        return Ok(path);
    }

    if let Ok(xdg_state) = std::env::var("XDG_STATE_HOME") {
        return Ok(PathBuf::from(xdg_state).join("deckhand"));
    }

    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".local").join("state").join("deckhand"))
}

/// Expand ~ and environment variables in a path string
///
/// The canonical expansion function for deckhand; all modules use this
/// instead of calling shellexpand directly.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}
