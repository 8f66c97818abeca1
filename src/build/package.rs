//! Package assembly and the final `.txz`.
//!
//! Package layout:
//!
//! ```text
//! etc/rc.d/rc.<component>                       0755
//! etc/udev/rules.d/99-<component>.rules
//! usr/local/emhttp/plugins/<component>/...      *.sh 0755
//! usr/local/sbin/<binary>                       0755
//! lib/modules/<kv>/extra/<module>.ko[.xz|...]
//! install/slack-desc
//! install/doinst.sh                             0755, when the template has one
//! ```

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tar::Builder as TarBuilder;
use walkdir::WalkDir;
use xz2::write::XzEncoder;

use super::copy_tree;
use super::module::{BinaryArtifact, ModuleArtifact};
use crate::cache::sha256_file;
use crate::config::Settings;
use crate::error::{Error, IoResultExt, Result, Stage};
use crate::kernel::KernelVersion;

const XZ_LEVEL: u32 = 6;

#[derive(Debug, Clone)]
pub struct PackageArchive {
    /// `<component>-<pluginVersion>-<arch>-<kv>`, without extension.
    pub name: String,
    pub path: PathBuf,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Deterministic package name. The plugin version becomes one dash-separated
/// field, so it may not contain dashes itself.
pub fn package_name(settings: &Settings, plugin_version: &str, version: &KernelVersion) -> Result<String> {
    check_plugin_version(plugin_version)?;
    Ok(format!(
        "{}-{}-{}-{}",
        settings.component,
        plugin_version.trim(),
        settings.arch,
        version
    ))
}

pub fn check_plugin_version(plugin_version: &str) -> Result<()> {
    let v = plugin_version.trim();
    if v.is_empty() || v.contains(['-', '/']) || v.contains(char::is_whitespace) {
        return Err(Error::Config(format!(
            "package version '{plugin_version}' must be non-empty and contain no '-', '/' or spaces"
        )));
    }
    Ok(())
}

/// Lay out the package tree under `root` from the template and build outputs.
pub fn assemble(
    settings: &Settings,
    version: &KernelVersion,
    module: &ModuleArtifact,
    binaries: &[BinaryArtifact],
    root: &Path,
) -> Result<()> {
    let component = &settings.component;
    let template = &settings.template_dir;
    if !template.is_dir() {
        return Err(missing(template.clone()));
    }
    if root.exists() {
        fs::remove_dir_all(root).io_context(|| format!("clearing {}", root.display()))?;
    }
    fs::create_dir_all(root).io_context(|| format!("creating {}", root.display()))?;

    let rc = template.join(format!("rc.{component}"));
    if !rc.is_file() {
        return Err(missing(rc));
    }
    install(&rc, &root.join(format!("etc/rc.d/rc.{component}")), 0o755)?;

    let rules = [
        template.join(format!("99-{component}.rules")),
        template.join(format!("{component}.rules")),
    ];
    let rules_src = rules
        .iter()
        .find(|p| p.is_file())
        .ok_or_else(|| missing(rules[0].clone()))?;
    install(
        rules_src,
        &root.join(format!("etc/udev/rules.d/99-{component}.rules")),
        0o644,
    )?;

    let gui = template.join("gui");
    let gui_dest = root.join(format!("usr/local/emhttp/plugins/{component}"));
    if gui.is_dir() {
        copy_tree(&gui, &gui_dest)?;
        normalize_gui_modes(&gui_dest)?;
    } else {
        tracing::warn!(path = %gui.display(), "template has no gui directory; package ships without web pages");
    }

    let slack_desc = template.join("slack-desc");
    let slack_dest = root.join("install/slack-desc");
    if slack_desc.is_file() {
        install(&slack_desc, &slack_dest, 0o644)?;
    } else {
        tracing::debug!("generating slack-desc");
        write_file(&slack_dest, generate_slack_desc(component, version).as_bytes(), 0o644)?;
    }
    let doinst = template.join("doinst.sh");
    if doinst.is_file() {
        install(&doinst, &root.join("install/doinst.sh"), 0o755)?;
    }

    for binary in binaries {
        install(
            &binary.path,
            &root.join("usr/local/sbin").join(&binary.name),
            0o755,
        )?;
    }

    let module_dest = root
        .join("lib/modules")
        .join(version.as_str())
        .join("extra")
        .join(module.file_name());
    install(&module.path, &module_dest, 0o644)?;

    tracing::info!(root = %root.display(), "package tree assembled");
    Ok(())
}

/// Archive `root` as `<output_dir>/<name>.txz` with a `.sha256` sidecar.
/// The archive only appears under its final name once complete.
pub fn write_package(root: &Path, output_dir: &Path, name: &str) -> Result<PackageArchive> {
    fs::create_dir_all(output_dir)
        .io_context(|| format!("creating {}", output_dir.display()))?;
    let path = output_dir.join(format!("{name}.txz"));
    let partial = output_dir.join(format!("{name}.txz.partial"));

    if let Err(e) = create_tar_xz(root, &partial) {
        let _ = fs::remove_file(&partial);
        return Err(e);
    }
    fs::rename(&partial, &path)
        .io_context(|| format!("moving {} into place", path.display()))?;

    let (sha256, size_bytes) = sha256_file(&path)?;
    let sidecar = output_dir.join(format!("{name}.txz.sha256"));
    fs::write(&sidecar, format!("{sha256}  {name}.txz\n"))
        .io_context(|| format!("writing {}", sidecar.display()))?;

    tracing::info!(path = %path.display(), size_bytes, "package written");
    Ok(PackageArchive {
        name: name.to_string(),
        path,
        size_bytes,
        sha256,
    })
}

fn create_tar_xz(src_dir: &Path, out_path: &Path) -> Result<()> {
    let tar_err = |e: std::io::Error| Error::io(format!("writing {}", out_path.display()), e);
    let out = File::create(out_path).io_context(|| format!("creating {}", out_path.display()))?;
    let mut builder = TarBuilder::new(XzEncoder::new(out, XZ_LEVEL));

    let mut entries: Vec<PathBuf> = vec![];
    for ent in WalkDir::new(src_dir).follow_links(false) {
        let ent = ent.map_err(|e| {
            Error::io(
                format!("walking {}", src_dir.display()),
                std::io::Error::new(std::io::ErrorKind::Other, e),
            )
        })?;
        if ent.path() != src_dir {
            entries.push(ent.path().to_path_buf());
        }
    }
    entries.sort_by(|a, b| {
        let ra = a.strip_prefix(src_dir).unwrap_or(a).to_string_lossy();
        let rb = b.strip_prefix(src_dir).unwrap_or(b).to_string_lossy();
        ra.cmp(&rb)
    });

    for p in entries {
        let rel = p.strip_prefix(src_dir).unwrap_or(&p).to_path_buf();
        let md = fs::symlink_metadata(&p).io_context(|| format!("stat {}", p.display()))?;

        let mut header = tar::Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_username("root").map_err(tar_err)?;
        header.set_groupname("root").map_err(tar_err)?;

        if md.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            header.set_cksum();
            builder
                .append_data(&mut header, &rel, std::io::empty())
                .map_err(tar_err)?;
        } else if md.file_type().is_symlink() {
            let target = fs::read_link(&p).io_context(|| format!("reading link {}", p.display()))?;
            header.set_entry_type(tar::EntryType::Symlink);
            header.set_size(0);
            header.set_mode(0o777);
            header.set_link_name(&target).map_err(tar_err)?;
            header.set_cksum();
            builder
                .append_data(&mut header, &rel, std::io::empty())
                .map_err(tar_err)?;
        } else if md.is_file() {
            let mut f = File::open(&p).io_context(|| format!("opening {}", p.display()))?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(md.len());
            header.set_mode(if is_executable(&md) { 0o755 } else { 0o644 });
            header.set_cksum();
            builder
                .append_data(&mut header, &rel, &mut f)
                .map_err(tar_err)?;
        }
    }

    let encoder = builder.into_inner().map_err(tar_err)?;
    let mut out = encoder.finish().map_err(tar_err)?;
    out.flush().map_err(tar_err)?;
    Ok(())
}

/// Slackware package description: eleven `<name>:` lines.
pub fn generate_slack_desc(component: &str, version: &KernelVersion) -> String {
    let body = [
        format!("{component} (WireView hardware monitor)"),
        String::new(),
        "Kernel hwmon driver for the WireView power monitor, with its".to_string(),
        "userspace daemon, command line tool and web dashboard.".to_string(),
        String::new(),
        format!("Built for kernel {version}."),
    ];
    let mut out = String::new();
    out.push_str(&" ".repeat(component.len()));
    out.push_str("|-----handy-ruler------------------------------------------------------|\n");
    for i in 0..11 {
        let line = body.get(i).map(String::as_str).unwrap_or("");
        if line.is_empty() {
            out.push_str(&format!("{component}:\n"));
        } else {
            out.push_str(&format!("{component}: {line}\n"));
        }
    }
    out
}

fn missing(path: PathBuf) -> Error {
    Error::MissingFile {
        stage: Stage::Assemble,
        path,
    }
}

fn install(src: &Path, dest: &Path, mode: u32) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
    }
    fs::copy(src, dest)
        .io_context(|| format!("copying {} to {}", src.display(), dest.display()))?;
    set_mode(dest, mode)
}

fn write_file(dest: &Path, data: &[u8], mode: u32) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
    }
    fs::write(dest, data).io_context(|| format!("writing {}", dest.display()))?;
    set_mode(dest, mode)
}

/// Shell hooks under the plugin directory run directly from the web UI.
fn normalize_gui_modes(dir: &Path) -> Result<()> {
    for ent in WalkDir::new(dir).into_iter().filter_map(|e| e.ok()) {
        if !ent.file_type().is_file() {
            continue;
        }
        let is_script = ent.path().extension().is_some_and(|e| e == "sh");
        set_mode(ent.path(), if is_script { 0o755 } else { 0o644 })?;
    }
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .io_context(|| format!("setting mode on {}", path.display()))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn is_executable(md: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    md.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_md: &fs::Metadata) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::io::Read;
    use tempfile::TempDir;
    use xz2::read::XzDecoder;

    fn kv() -> KernelVersion {
        KernelVersion::parse("6.12.54-Unraid").unwrap()
    }

    fn template(dir: &Path) {
        fs::create_dir_all(dir.join("gui/include")).unwrap();
        fs::write(dir.join("rc.wireview-hwmon"), "#!/bin/sh\n").unwrap();
        fs::write(dir.join("99-wireview-hwmon.rules"), "SUBSYSTEM==\"hwmon\"\n").unwrap();
        fs::write(dir.join("gui/WireView.page"), "Menu=\"Utilities\"\n").unwrap();
        fs::write(dir.join("gui/include/poll.sh"), "#!/bin/sh\n").unwrap();
    }

    fn read_entries(path: &Path) -> BTreeMap<String, (u32, u64, String)> {
        let mut archive = tar::Archive::new(XzDecoder::new(File::open(path).unwrap()));
        let mut out = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            let header = entry.header();
            out.insert(
                entry.path().unwrap().to_string_lossy().trim_end_matches('/').to_string(),
                (
                    header.mode().unwrap(),
                    header.uid().unwrap(),
                    header.username().unwrap().unwrap_or("").to_string(),
                ),
            );
        }
        out
    }

    #[test]
    fn name_is_deterministic() {
        let settings = Settings::defaults(Path::new("."));
        assert_eq!(
            package_name(&settings, "2026.02.27", &kv()).unwrap(),
            "wireview-hwmon-2026.02.27-x86_64-6.12.54-Unraid"
        );
        assert!(package_name(&settings, "2026-02-27", &kv()).is_err());
        assert!(package_name(&settings, "", &kv()).is_err());
    }

    #[test]
    fn slack_desc_has_eleven_prefixed_lines() {
        let desc = generate_slack_desc("wireview-hwmon", &kv());
        let lines: Vec<&str> = desc.lines().collect();
        assert_eq!(lines.len(), 12);
        assert!(lines[0].contains("handy-ruler"));
        assert!(lines[1..].iter().all(|l| l.starts_with("wireview-hwmon:")));
        assert!(desc.contains("6.12.54-Unraid"));
    }

    #[test]
    fn assemble_and_archive_layout() {
        let tmp = TempDir::new().unwrap();
        let mut settings = Settings::defaults(tmp.path());
        settings.template_dir = tmp.path().join("plugin");
        template(&settings.template_dir);

        let module_path = tmp.path().join("wireview_hwmon.ko");
        fs::write(&module_path, b"\x7fELF").unwrap();
        let module = ModuleArtifact {
            path: module_path,
            compressed: false,
        };
        let bin_path = tmp.path().join("wireviewd");
        fs::write(&bin_path, b"\x7fELF").unwrap();
        let binaries = vec![BinaryArtifact {
            name: "wireviewd".into(),
            path: bin_path,
        }];

        let root = tmp.path().join("pkg");
        assemble(&settings, &kv(), &module, &binaries, &root).unwrap();
        let out = tmp.path().join("dist");
        let pkg = write_package(&root, &out, "wireview-hwmon-1-x86_64-6.12.54-Unraid").unwrap();

        assert!(pkg.path.ends_with("wireview-hwmon-1-x86_64-6.12.54-Unraid.txz"));
        assert_eq!(pkg.size_bytes, fs::metadata(&pkg.path).unwrap().len());
        assert!(!out.join("wireview-hwmon-1-x86_64-6.12.54-Unraid.txz.partial").exists());
        let sidecar =
            fs::read_to_string(out.join("wireview-hwmon-1-x86_64-6.12.54-Unraid.txz.sha256"))
                .unwrap();
        assert!(sidecar.starts_with(&pkg.sha256));

        let entries = read_entries(&pkg.path);
        let mode = |p: &str| entries.get(p).map(|e| e.0 & 0o777);
        assert_eq!(mode("etc/rc.d/rc.wireview-hwmon"), Some(0o755));
        assert_eq!(mode("etc/udev/rules.d/99-wireview-hwmon.rules"), Some(0o644));
        assert_eq!(mode("usr/local/sbin/wireviewd"), Some(0o755));
        assert_eq!(
            mode("lib/modules/6.12.54-Unraid/extra/wireview_hwmon.ko"),
            Some(0o644)
        );
        assert_eq!(
            mode("usr/local/emhttp/plugins/wireview-hwmon/include/poll.sh"),
            Some(0o755)
        );
        assert_eq!(
            mode("usr/local/emhttp/plugins/wireview-hwmon/WireView.page"),
            Some(0o644)
        );
        assert!(entries.contains_key("install/slack-desc"));
        assert!(entries.values().all(|(_, uid, user)| *uid == 0 && user == "root"));
    }

    #[test]
    fn archive_bytes_are_reproducible() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        fs::create_dir_all(root.join("b")).unwrap();
        fs::write(root.join("b/z"), "z").unwrap();
        fs::write(root.join("a"), "a").unwrap();

        let first = write_package(&root, &tmp.path().join("one"), "p").unwrap();
        let second = write_package(&root, &tmp.path().join("two"), "p").unwrap();
        assert_eq!(first.sha256, second.sha256);

        let mut names = Vec::new();
        let mut archive = tar::Archive::new(XzDecoder::new(File::open(&first.path).unwrap()));
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            names.push(name.trim_end_matches('/').to_string());
            let mut sink = Vec::new();
            entry.read_to_end(&mut sink).unwrap();
        }
        assert_eq!(names, vec!["a", "b", "b/z"]);
    }

    #[test]
    fn missing_rc_script_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let mut settings = Settings::defaults(tmp.path());
        settings.template_dir = tmp.path().join("plugin");
        fs::create_dir_all(&settings.template_dir).unwrap();
        let module = ModuleArtifact {
            path: tmp.path().join("m.ko"),
            compressed: false,
        };
        let err = assemble(&settings, &kv(), &module, &[], &tmp.path().join("pkg")).unwrap_err();
        assert!(matches!(err, Error::MissingFile { stage: Stage::Assemble, .. }));
    }
}
