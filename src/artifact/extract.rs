//! Locating and extracting containers from a release archive.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use zip::ZipArchive;

use super::format::{self, ContainerFormat};
use crate::cancel::CancelToken;
use crate::error::{Error, IoResultExt, Result, Stage};
use crate::release::ReleaseArchive;

/// Containers shipped inside a release archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    /// Squashfs image of `/lib/modules`.
    ModuleTree,
    /// Initramfs with the root filesystem.
    BootImage,
    KernelImage,
}

impl ArtifactKind {
    pub fn container_name(self) -> &'static str {
        match self {
            Self::ModuleTree => "bzmodules",
            Self::BootImage => "bzroot",
            Self::KernelImage => "bzimage",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let what = match self {
            Self::ModuleTree => "module tree",
            Self::BootImage => "boot image",
            Self::KernelImage => "kernel image",
        };
        write!(f, "{what} ({})", self.container_name())
    }
}

/// How an entry was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Direct,
    Scan,
}

#[derive(Debug, Clone)]
pub struct ExtractedArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub format: ContainerFormat,
    /// Entry name inside the release archive.
    pub entry_name: String,
    pub lookup: Lookup,
}

/// Find the entry holding `name`.
///
/// Direct patterns are tried first; only when none matches is every entry
/// name scanned. On failure the error lists each layout attempted.
pub fn locate_entry<R: Read + std::io::Seek>(
    zip: &mut ZipArchive<R>,
    stem: Option<&str>,
    name: &str,
) -> std::result::Result<(String, Lookup), Vec<String>> {
    let mut direct = vec![name.to_string()];
    if let Some(stem) = stem {
        direct.push(format!("{stem}/{name}"));
    }

    for candidate in &direct {
        if zip.file_names().any(|n| n == candidate.as_str()) {
            return Ok((candidate.clone(), Lookup::Direct));
        }
    }

    // file_names() has no defined order; index order is archive order
    for i in 0..zip.len() {
        let Ok(entry) = zip.by_index_raw(i) else {
            continue;
        };
        if entry.is_dir() {
            continue;
        }
        let entry_name = entry.name();
        let file_name = entry_name.rsplit('/').next().unwrap_or(entry_name);
        if file_name.eq_ignore_ascii_case(name) {
            return Ok((entry_name.to_string(), Lookup::Scan));
        }
    }

    let mut attempted: Vec<String> = direct.into_iter().map(|p| format!("direct: {p}")).collect();
    attempted.push(format!(
        "scan: any '*/{name}' (case-insensitive) across {} entries",
        zip.len()
    ));
    Err(attempted)
}

/// Extract the container for `kind` into `workdir`, detecting its format.
pub fn extract_container(
    release: &ReleaseArchive,
    kind: ArtifactKind,
    workdir: &Path,
    cancel: &CancelToken,
) -> Result<ExtractedArtifact> {
    cancel.check()?;
    let name = kind.container_name();
    let file = File::open(&release.path)
        .io_context(|| format!("opening release archive {}", release.path.display()))?;
    let mut zip = ZipArchive::new(file)
        .map_err(|e| Error::format(Stage::Extract, &release.path, "zip archive", e))?;

    let stem = archive_stem(&release.url);
    let (entry_name, lookup) =
        locate_entry(&mut zip, stem.as_deref(), name).map_err(|attempted| {
            Error::ContainerNotFound {
                stage: Stage::Extract,
                name: name.to_string(),
                archive: release.path.clone(),
                attempted: attempted
                    .iter()
                    .map(|a| format!("    - {a}"))
                    .collect::<Vec<_>>()
                    .join("\n"),
            }
        })?;
    if lookup == Lookup::Scan {
        tracing::info!(%entry_name, "{name} not at a known path, found by scanning");
    }

    fs::create_dir_all(workdir).io_context(|| format!("creating {}", workdir.display()))?;
    let dest = workdir.join(name);
    let mut member = zip
        .by_name(&entry_name)
        .map_err(|e| Error::format(Stage::Extract, &release.path, "zip archive", e))?;
    let out = File::create(&dest).io_context(|| format!("creating {}", dest.display()))?;
    let mut out = BufWriter::new(out);
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        cancel.check()?;
        let n = member.read(&mut buf).map_err(|e| {
            Error::format(
                Stage::Extract,
                &release.path,
                "zip archive",
                format!("reading '{entry_name}': {e}"),
            )
        })?;
        if n == 0 {
            break;
        }
        out.write_all(&buf[..n])
            .io_context(|| format!("writing {}", dest.display()))?;
    }
    out.flush()
        .io_context(|| format!("flushing {}", dest.display()))?;
    drop(out);

    let format = format::detect_file(&dest)?;
    tracing::info!(container = name, %entry_name, %format, "extracted");
    Ok(ExtractedArtifact {
        kind,
        path: dest,
        format,
        entry_name,
        lookup,
    })
}

/// File stem of the release URL, e.g. `unRAIDServer-7.2.4-x86_64`.
pub fn archive_stem(url: &str) -> Option<String> {
    let last = url
        .split(['?', '#'])
        .next()?
        .trim_end_matches('/')
        .rsplit('/')
        .next()?;
    let stem = last
        .strip_suffix(".zip")
        .or_else(|| last.strip_suffix(".ZIP"))
        .unwrap_or(last);
    (!stem.is_empty()).then(|| stem.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn zip_with(path: &Path, names: &[&str]) {
        let mut zip = zip::ZipWriter::new(File::create(path).unwrap());
        for name in names {
            if name.ends_with('/') {
                zip.add_directory(name.trim_end_matches('/'), zip::write::FileOptions::default())
                    .unwrap();
            } else {
                zip.start_file(*name, zip::write::FileOptions::default())
                    .unwrap();
                zip.write_all(b"hsqs-image").unwrap();
            }
        }
        zip.finish().unwrap();
    }

    fn open(path: &Path) -> ZipArchive<File> {
        ZipArchive::new(File::open(path).unwrap()).unwrap()
    }

    #[test]
    fn flat_layout_is_direct() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("r.zip");
        zip_with(&path, &["bzroot", "bzmodules"]);
        let (name, lookup) = locate_entry(&mut open(&path), Some("r"), "bzmodules").unwrap();
        assert_eq!(name, "bzmodules");
        assert_eq!(lookup, Lookup::Direct);
    }

    #[test]
    fn nested_stem_layout_is_direct() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("r.zip");
        zip_with(&path, &["unRAIDServer-7.2.4-x86_64/", "unRAIDServer-7.2.4-x86_64/bzmodules"]);
        let (name, lookup) =
            locate_entry(&mut open(&path), Some("unRAIDServer-7.2.4-x86_64"), "bzmodules").unwrap();
        assert_eq!(name, "unRAIDServer-7.2.4-x86_64/bzmodules");
        assert_eq!(lookup, Lookup::Direct);
    }

    #[test]
    fn unexpected_nesting_falls_back_to_scan() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("r.zip");
        zip_with(&path, &["release/boot/BZMODULES", "release/boot/bzroot"]);
        let (name, lookup) = locate_entry(&mut open(&path), Some("r"), "bzmodules").unwrap();
        assert_eq!(name, "release/boot/BZMODULES");
        assert_eq!(lookup, Lookup::Scan);
    }

    #[test]
    fn missing_container_lists_every_layout() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("r.zip");
        zip_with(&path, &["readme.txt"]);
        let attempted = locate_entry(&mut open(&path), Some("stem"), "bzmodules").unwrap_err();
        assert_eq!(attempted.len(), 3);
        assert!(attempted[0].contains("direct: bzmodules"));
        assert!(attempted[1].contains("stem/bzmodules"));
        assert!(attempted[2].starts_with("scan:"));
    }

    #[test]
    fn extracts_and_detects_squashfs() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("r.zip");
        zip_with(&path, &["bzmodules"]);
        let release = ReleaseArchive {
            version: "7.2.4".into(),
            url: "https://example.invalid/r.zip".into(),
            path,
            size_bytes: 0,
            validated: true,
            from_cache: false,
        };
        let work = tmp.path().join("work");
        let got =
            extract_container(&release, ArtifactKind::ModuleTree, &work, &CancelToken::new())
                .unwrap();
        assert_eq!(got.format, ContainerFormat::Squashfs);
        assert_eq!(fs::read(&got.path).unwrap(), b"hsqs-image");
    }

    #[test]
    fn stem_from_url() {
        assert_eq!(
            archive_stem("https://stable.dl.unraid.net/unRAIDServer-7.2.4-x86_64.zip?x=1").as_deref(),
            Some("unRAIDServer-7.2.4-x86_64")
        );
        assert_eq!(archive_stem("").as_deref(), None);
    }
}
