//! Kernel source tarballs: URL templates, integrity walk, unpacking.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path, PathBuf};

use tar::{Archive, EntryType};

use super::version::KernelVersion;
use crate::artifact::decompress::open_decoder;
use crate::artifact::format::{self, ContainerFormat};
use crate::cache::UPSTREAM_SOURCE;
use crate::cancel::CancelToken;
use crate::error::{Error, IoResultExt, Result, Stage};
use crate::fetch::{fetch_into_cache, Download};
use crate::pipeline::PipelineContext;

/// Where a source tarball came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceOrigin {
    /// Published for the exact kernel release, `.config` included.
    Matched,
    /// kernel.org release for the base version.
    Upstream,
}

#[derive(Debug, Clone)]
pub struct SourceTarball {
    pub origin: SourceOrigin,
    pub url: String,
    pub path: PathBuf,
    pub from_cache: bool,
}

/// Fill `{kernel_version}`, `{base}` and `{major}` in a URL template.
pub fn render_url(template: &str, version: &KernelVersion) -> String {
    template
        .replace("{kernel_version}", version.as_str())
        .replace("{base}", version.base())
        .replace("{major}", version.major())
}

/// Open a possibly compressed tarball for reading.
pub fn open_tarball(path: &Path) -> Result<Box<dyn Read>> {
    let detected = format::detect_file(path)?;
    let file = File::open(path).io_context(|| format!("opening {}", path.display()))?;
    let reader = BufReader::new(file);
    match detected {
        f if f.is_compressed() => {
            open_decoder(f, reader).io_context(|| format!("opening {} as {f}", path.display()))
        }
        ContainerFormat::Unknown => Ok(Box::new(reader)),
        other => Err(Error::format(
            Stage::LocateConfig,
            path,
            "kernel source tarball",
            format!("found a {other} container"),
        )),
    }
}

/// Walk every member to EOF. A truncated download fails here.
pub fn verify_tarball(path: &Path) -> Result<()> {
    let bad = |reason: String| Error::format(Stage::LocateConfig, path, "kernel source tarball", reason);
    let mut archive = Archive::new(open_tarball(path)?);
    let mut count = 0usize;
    let mut saw_makefile = false;
    for entry in archive.entries().map_err(|e| bad(e.to_string()))? {
        let mut entry = entry.map_err(|e| bad(e.to_string()))?;
        if let Ok(p) = entry.path() {
            saw_makefile |= strip_top(&p).is_some_and(|s| s == Path::new("Makefile"));
        }
        io::copy(&mut entry, &mut io::sink()).map_err(|e| bad(e.to_string()))?;
        count += 1;
    }
    if count == 0 {
        return Err(bad("no entries".into()));
    }
    if !saw_makefile {
        return Err(bad("no top-level Makefile".into()));
    }
    Ok(())
}

/// Contents of the tarball's top-level `.config`, if it has one.
pub fn read_top_level_config(path: &Path) -> Result<Option<String>> {
    let bad = |reason: String| Error::format(Stage::LocateConfig, path, "kernel source tarball", reason);
    let mut archive = Archive::new(open_tarball(path)?);
    for entry in archive.entries().map_err(|e| bad(e.to_string()))? {
        let mut entry = entry.map_err(|e| bad(e.to_string()))?;
        let is_config = entry
            .path()
            .ok()
            .and_then(|p| strip_top(&p))
            .is_some_and(|p| p == Path::new(".config"));
        if is_config && entry.header().entry_type().is_file() {
            let mut text = String::new();
            entry
                .read_to_string(&mut text)
                .map_err(|e| bad(format!(".config: {e}")))?;
            return Ok(Some(text));
        }
    }
    Ok(None)
}

/// Drop the leading `linux-x.y.z/` component. `None` for the top directory
/// itself, pax headers, and anything that would escape the destination.
fn strip_top(path: &Path) -> Option<PathBuf> {
    let mut components = path.components();
    match components.next()? {
        Component::Normal(_) => {}
        Component::CurDir => return strip_top(components.as_path()),
        _ => return None,
    }
    let rest = components.as_path();
    if rest.as_os_str().is_empty() {
        return None;
    }
    if !rest.components().all(|c| matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(rest.to_path_buf())
}

/// Unpack `tarball` into `dest`, stripping the top-level directory.
pub fn unpack_source(tarball: &Path, dest: &Path, cancel: &CancelToken) -> Result<()> {
    let bad = |reason: String| Error::format(Stage::PrepareTree, tarball, "kernel source tarball", reason);
    fs::create_dir_all(dest).io_context(|| format!("creating {}", dest.display()))?;
    tracing::info!(tarball = %tarball.display(), dest = %dest.display(), "unpacking kernel source");

    let mut archive = Archive::new(open_tarball(tarball)?);
    archive.set_preserve_permissions(true);
    let mut files = 0usize;
    for entry in archive.entries().map_err(|e| bad(e.to_string()))? {
        cancel.check()?;
        let mut entry = entry.map_err(|e| bad(e.to_string()))?;
        let kind = entry.header().entry_type();
        if matches!(kind, EntryType::XGlobalHeader | EntryType::XHeader) {
            continue;
        }
        let raw = entry.path().map_err(|e| bad(e.to_string()))?.into_owned();
        let Some(rel) = strip_top(&raw) else {
            if raw.components().any(|c| matches!(c, Component::ParentDir)) {
                return Err(bad(format!("unsafe member path {}", raw.display())));
            }
            continue;
        };
        let target = dest.join(&rel);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
        }

        if kind == EntryType::Link {
            // hard link targets are archive paths, not filesystem paths
            let link = entry
                .link_name()
                .map_err(|e| bad(e.to_string()))?
                .and_then(|l| strip_top(&l))
                .ok_or_else(|| bad(format!("bad hard link {}", raw.display())))?;
            fs::copy(dest.join(&link), &target)
                .io_context(|| format!("linking {}", target.display()))?;
            continue;
        }
        entry
            .unpack(&target)
            .map_err(|e| bad(format!("{}: {e}", rel.display())))?;
        files += 1;
    }
    tracing::debug!(files, "kernel source unpacked");
    if !dest.join("Makefile").is_file() {
        return Err(Error::MissingFile {
            stage: Stage::PrepareTree,
            path: dest.join("Makefile"),
        });
    }
    Ok(())
}

/// Fetch the upstream source for `version.base()` from the first mirror that
/// serves a valid tarball.
pub fn fetch_upstream_source(ctx: &PipelineContext, version: &KernelVersion) -> Result<SourceTarball> {
    let mut failures = Vec::new();
    for template in &ctx.settings.upstream_mirrors {
        let url = render_url(template, version);
        let mut meta = BTreeMap::new();
        meta.insert("url".to_string(), serde_json::json!(url));
        let attempt = fetch_into_cache(
            &ctx.cache,
            ctx.fetcher.as_ref(),
            &ctx.cancel,
            Download {
                kind: UPSTREAM_SOURCE,
                key: version.base(),
                url: &url,
                stage: Stage::LocateConfig,
            },
            meta,
            &verify_tarball,
        );
        match attempt {
            Ok(cached) => {
                return Ok(SourceTarball {
                    origin: SourceOrigin::Upstream,
                    url,
                    path: cached.entry.path,
                    from_cache: cached.from_cache,
                })
            }
            Err(Error::Cancelled(msg)) => return Err(Error::Cancelled(msg)),
            Err(e) => {
                tracing::warn!(%url, "upstream mirror failed: {e}");
                failures.push(format!("    - {url}: {e}"));
            }
        }
    }
    Err(Error::SourcesExhausted {
        stage: Stage::LocateConfig,
        what: format!("upstream kernel source linux-{}", version.base()),
        attempts: failures.join("\n"),
    })
}
