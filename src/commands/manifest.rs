//! `deckhand manifest` - validate and scaffold manifests

use anyhow::{Context, Result, bail};
use std::path::Path;

use crate::manifest::{self, Manifest};
use crate::paths;
use crate::ui;

pub fn validate(manifest_flag: Option<&str>) -> Result<()> {
    let path = paths::manifest_path(manifest_flag)?;
    let manifest = Manifest::load(&path)?;

    ui::success(&format!(
        "{} is valid ({} entries)",
        path.display(),
        manifest.entry_count()
    ));

    if manifest.entry_count() == 0 {
        ui::warn("manifest declares nothing");
    }

    Ok(())
}

pub fn init(app_name: &str, path: &str, force: bool) -> Result<()> {
    let path = Path::new(path);

    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }

    std::fs::write(path, manifest::starter(app_name))
        .with_context(|| format!("could not write {}", path.display()))?;

    ui::success(&format!("wrote starter manifest to {}", path.display()));
    ui::dim("edit it, then run `deckhand plan`");
    Ok(())
}
