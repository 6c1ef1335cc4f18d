use std::path::PathBuf;

use anyhow::{Context, Result};
use directories::ProjectDirs;

/// Resolve the data directory for `vanish.db` and its key material.
///
/// `VANISH_DATA_DIR` wins; otherwise the platform data dir
/// (`~/.local/share/vanish/` on Linux).
pub fn data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("VANISH_DATA_DIR") {
        let path = PathBuf::from(dir);
        std::fs::create_dir_all(&path).context("create VANISH_DATA_DIR")?;
        return Ok(path);
    }

    let dirs = ProjectDirs::from("", "", "vanish")
        .context("could not determine platform data directory")?;

    let path = dirs.data_dir().to_owned();
    std::fs::create_dir_all(&path).context("create platform data dir")?;
    Ok(path)
}
