//! Plugin package extraction.
//!
//! Packages are gzip-compressed tarballs whose entries live under a
//! single top-level directory named after the plugin id. Extraction goes
//! through a temporary sibling of the plugins directory and the plugin
//! tree is renamed into place only once the whole archive extracted, so
//! a failure never leaves a partial tree behind.
//!
//! Guards:
//! - entries with `..` components or absolute paths are rejected
//! - only regular files and directories are extracted
//! - entry count is bounded

use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tar::Archive;
use tracing::debug;

use crate::error::{ProvdError, Result};

/// Maximum number of entries allowed in a plugin package.
const MAX_ENTRY_COUNT: usize = 10_000;

fn check_entry_path(path: &Path) -> Result<()> {
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => {
                return Err(ProvdError::Plugin(format!(
                    "unsafe path in plugin package: {}",
                    path.display()
                )));
            }
        }
    }
    Ok(())
}

fn do_extract(package: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(package)?;
    let decoder = GzDecoder::new(file);
    let mut archive = Archive::new(decoder);

    let mut entry_count = 0usize;
    for entry_result in archive.entries()? {
        let mut entry = entry_result?;
        entry_count += 1;
        if entry_count > MAX_ENTRY_COUNT {
            return Err(ProvdError::Plugin(format!(
                "plugin package exceeds {MAX_ENTRY_COUNT} entries"
            )));
        }
        let entry_type = entry.header().entry_type();
        if !entry_type.is_file() && !entry_type.is_dir() {
            return Err(ProvdError::Plugin(format!(
                "unsafe entry type in plugin package: {entry_type:?}"
            )));
        }
        let entry_path = entry.path()?.into_owned();
        check_entry_path(&entry_path)?;
        entry.unpack(dest.join(&entry_path))?;
    }
    Ok(())
}

/// Extract a plugin package into the plugins directory.
///
/// Returns the list of top-level directory names the archive populated
/// (normally a single one, the plugin id).
pub fn extract_plugin(package: &Path, plugins_dir: &Path) -> Result<Vec<String>> {
    let staging = staging_dir(plugins_dir);
    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    std::fs::create_dir_all(&staging)?;

    let result = do_extract(package, &staging);
    if let Err(e) = result {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e);
    }

    let mut extracted = Vec::new();
    for entry in std::fs::read_dir(&staging)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let target = plugins_dir.join(&name);
        if target.exists() {
            // install-over: replace the previous tree atomically enough
            std::fs::remove_dir_all(&target)?;
        }
        std::fs::rename(entry.path(), &target)?;
        debug!("Extracted plugin tree {}", target.display());
        extracted.push(name);
    }
    std::fs::remove_dir_all(&staging)?;
    Ok(extracted)
}

fn staging_dir(plugins_dir: &Path) -> PathBuf {
    plugins_dir.with_extension("extract-tmp")
}
