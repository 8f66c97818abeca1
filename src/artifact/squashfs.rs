//! Module-tree image unpacking.

use std::fs;
use std::path::{Path, PathBuf};

use super::extract::ExtractedArtifact;
use super::format::ContainerFormat;
use crate::build::host::HostTools;
use crate::cancel::CancelToken;
use crate::error::{Error, IoResultExt, Result, Stage};

/// Unpack the module-tree container into `dest` and return the tree root.
///
/// The container must be squashfs; anything else is reported with the
/// format actually found.
pub fn unpack_module_tree(
    host: &dyn HostTools,
    artifact: &ExtractedArtifact,
    dest: &Path,
    cancel: &CancelToken,
) -> Result<PathBuf> {
    if artifact.format != ContainerFormat::Squashfs {
        return Err(Error::format(
            Stage::Extract,
            &artifact.path,
            "squashfs image",
            format!(
                "'{}' has a {} signature",
                artifact.entry_name, artifact.format
            ),
        ));
    }
    if dest.exists() {
        fs::remove_dir_all(dest).io_context(|| format!("clearing {}", dest.display()))?;
    }
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
    }

    tracing::info!(image = %artifact.path.display(), dest = %dest.display(), "unpacking module tree");
    host.unsquash(&artifact.path, dest, cancel)?;

    if !dest.is_dir() {
        return Err(Error::MissingFile {
            stage: Stage::Extract,
            path: dest.to_path_buf(),
        });
    }
    Ok(dest.to_path_buf())
}
