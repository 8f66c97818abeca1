//! Kernel version resolution from an unpacked module tree.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, IoResultExt, Result, Stage};

/// Where per-version module directories may live inside the unpacked image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleLayout {
    pub name: &'static str,
    /// Directory holding `<version>/` entries, relative to the image root.
    pub prefix: &'static str,
}

/// Probed in this order; the first layout with any match wins.
pub const MODULE_LAYOUTS: &[ModuleLayout] = &[
    ModuleLayout {
        name: "library",
        prefix: "lib/modules",
    },
    ModuleLayout {
        name: "flat",
        prefix: "modules",
    },
    // bzmodules is mounted at /lib/modules, so versions sit at its root
    ModuleLayout {
        name: "root",
        prefix: "",
    },
];

/// Files whose presence marks a real module directory.
const MARKERS: &[&str] = &["modules.dep", "kernel"];

fn version_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\d+\.").expect("Invalid kernel version regex"))
}

/// Canonical kernel release, byte-identical to the module directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KernelVersion {
    release: String,
}

impl KernelVersion {
    pub fn parse(release: &str) -> Result<Self> {
        if !version_pattern().is_match(release) || release.contains('/') {
            return Err(Error::Config(format!(
                "'{release}' is not a kernel release (expected '<digits>.…')"
            )));
        }
        Ok(Self {
            release: release.to_string(),
        })
    }

    pub fn as_str(&self) -> &str {
        &self.release
    }

    /// Release without the local-version suffix: `6.12.54-Unraid` → `6.12.54`.
    pub fn base(&self) -> &str {
        match self.release.find('-') {
            Some(i) => &self.release[..i],
            None => &self.release,
        }
    }

    /// Leading numeral: `6.12.54-Unraid` → `6`.
    pub fn major(&self) -> &str {
        self.release.split('.').next().unwrap_or(&self.release)
    }

    /// Everything from the first `-`, e.g. `-Unraid`; empty if none.
    pub fn local_suffix(&self) -> &str {
        match self.release.find('-') {
            Some(i) => &self.release[i..],
            None => "",
        }
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.release)
    }
}

/// A resolved version plus how it was found.
#[derive(Debug, Clone)]
pub struct ResolvedVersion {
    pub version: KernelVersion,
    pub layout: ModuleLayout,
    pub module_dir: PathBuf,
    /// Whether `modules.dep` or `kernel/` was present.
    pub marker_found: bool,
    /// Every candidate in the winning layout, sorted.
    pub candidates: Vec<String>,
}

/// Probe [`MODULE_LAYOUTS`] under `root` and return the kernel version.
///
/// Candidates within a layout are sorted lexicographically and the first is
/// taken, so the result does not depend on directory listing order.
pub fn resolve_kernel_version(root: &Path) -> Result<ResolvedVersion> {
    let mut probed = Vec::new();
    for layout in MODULE_LAYOUTS {
        let dir = if layout.prefix.is_empty() {
            root.to_path_buf()
        } else {
            root.join(layout.prefix)
        };
        let candidates = version_dirs(&dir)?;
        probed.push(format!(
            "    - {} layout: {} ({} match{})",
            layout.name,
            dir.display(),
            candidates.len(),
            if candidates.len() == 1 { "" } else { "es" }
        ));
        let Some(first) = candidates.first() else {
            continue;
        };

        if candidates.len() > 1 {
            tracing::warn!(
                layout = layout.name,
                chosen = %first,
                candidates = ?candidates,
                "several kernel version directories, taking the first in sorted order"
            );
        }
        let module_dir = dir.join(first);
        let marker_found = MARKERS.iter().any(|m| module_dir.join(m).exists());
        if !marker_found {
            tracing::debug!(dir = %module_dir.display(), "no modules.dep or kernel/ in version directory");
        }
        let version = KernelVersion::parse(first)?;
        tracing::info!(kernel = %version, layout = layout.name, "resolved kernel version");
        return Ok(ResolvedVersion {
            version,
            layout: *layout,
            module_dir,
            marker_found,
            candidates,
        });
    }

    Err(Error::NoKernelVersion {
        stage: Stage::ResolveVersion,
        root: root.to_path_buf(),
        probed: probed.join("\n"),
    })
}

fn version_dirs(dir: &Path) -> Result<Vec<String>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in fs::read_dir(dir).io_context(|| format!("reading {}", dir.display()))? {
        let entry = entry.io_context(|| format!("reading {}", dir.display()))?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if version_pattern().is_match(name) && entry.path().is_dir() {
            found.push(name.to_string());
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn derived_parts() {
        let kv = KernelVersion::parse("6.12.54-Unraid").unwrap();
        assert_eq!(kv.base(), "6.12.54");
        assert_eq!(kv.major(), "6");
        assert_eq!(kv.local_suffix(), "-Unraid");

        let plain = KernelVersion::parse("6.1.0").unwrap();
        assert_eq!(plain.base(), "6.1.0");
        assert_eq!(plain.local_suffix(), "");

        assert!(KernelVersion::parse("build").is_err());
    }

    #[test]
    fn library_layout() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("lib/modules/6.12.54-Unraid/kernel")).unwrap();
        let got = resolve_kernel_version(tmp.path()).unwrap();
        assert_eq!(got.version.as_str(), "6.12.54-Unraid");
        assert_eq!(got.layout.name, "library");
        assert!(got.marker_found);
    }

    #[test]
    fn flat_layout() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("modules/6.12.54-Unraid")).unwrap();
        let got = resolve_kernel_version(tmp.path()).unwrap();
        assert_eq!(got.layout.name, "flat");
        assert!(!got.marker_found);
    }

    #[test]
    fn image_root_layout_ignores_non_versions() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("6.12.54-Unraid")).unwrap();
        fs::create_dir_all(tmp.path().join("firmware")).unwrap();
        fs::write(tmp.path().join("6.0.notadir"), "").unwrap();
        let got = resolve_kernel_version(tmp.path()).unwrap();
        assert_eq!(got.version.as_str(), "6.12.54-Unraid");
        assert_eq!(got.layout.name, "root");
    }

    #[test]
    fn multiple_candidates_pick_lexicographic_first() {
        let tmp = TempDir::new().unwrap();
        for v in ["6.12.54-Unraid", "6.1.0-Unraid", "6.12.9-Unraid"] {
            fs::create_dir_all(tmp.path().join("lib/modules").join(v)).unwrap();
        }
        let first = resolve_kernel_version(tmp.path()).unwrap();
        let second = resolve_kernel_version(tmp.path()).unwrap();
        assert_eq!(first.version.as_str(), "6.1.0-Unraid");
        assert_eq!(first.version, second.version);
        assert_eq!(first.candidates.len(), 3);
    }

    #[test]
    fn nothing_found_lists_every_layout() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("lib/modules/extra")).unwrap();
        let err = resolve_kernel_version(tmp.path()).unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, Error::NoKernelVersion { .. }));
        for layout in ["library", "flat", "root"] {
            assert!(msg.contains(layout), "{msg}");
        }
    }
}
