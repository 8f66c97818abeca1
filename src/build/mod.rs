//! Build Orchestrator.
//!
//! - [`host`] - external tool access
//! - [`kernel`] - configured, header-ready kernel trees
//! - [`module`] - the out-of-tree module and static helpers
//! - [`package`] - package tree and `.txz`

pub mod host;
pub mod kernel;
pub mod module;
pub mod package;

use std::fs;
use std::path::Path;

use crate::error::{IoResultExt, Result};

pub use host::{HostTools, SystemHost};
pub use kernel::KernelSourceTree;
pub use module::{BinaryArtifact, ModuleArtifact};
pub use package::PackageArchive;

/// Recursively copy `src` into `dst`, preserving symlinks.
pub(crate) fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).io_context(|| format!("creating {}", dst.display()))?;

    for entry in fs::read_dir(src).io_context(|| format!("reading {}", src.display()))? {
        let entry = entry.io_context(|| format!("reading {}", src.display()))?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());
        let file_type = entry
            .file_type()
            .io_context(|| format!("stat {}", src_path.display()))?;

        if file_type.is_symlink() {
            let target = fs::read_link(&src_path)
                .io_context(|| format!("reading link {}", src_path.display()))?;
            if dst_path.exists() || dst_path.is_symlink() {
                fs::remove_file(&dst_path)
                    .io_context(|| format!("replacing {}", dst_path.display()))?;
            }
            std::os::unix::fs::symlink(&target, &dst_path)
                .io_context(|| format!("creating symlink {}", dst_path.display()))?;
        } else if file_type.is_dir() {
            copy_tree(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path).io_context(|| {
                format!("copying {} to {}", src_path.display(), dst_path.display())
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn copy_tree_keeps_structure_and_links() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        fs::create_dir_all(src.join("sub")).unwrap();
        fs::write(src.join("Makefile"), "obj-m := x.o\n").unwrap();
        fs::write(src.join("sub/x.c"), "int x;\n").unwrap();
        std::os::unix::fs::symlink("sub/x.c", src.join("link.c")).unwrap();

        let dst = tmp.path().join("dst");
        copy_tree(&src, &dst).unwrap();
        assert_eq!(fs::read_to_string(dst.join("sub/x.c")).unwrap(), "int x;\n");
        assert!(dst.join("Makefile").is_file());
        assert_eq!(
            fs::read_link(dst.join("link.c")).unwrap(),
            Path::new("sub/x.c")
        );
    }
}
