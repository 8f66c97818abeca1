//! Fixtures and fakes shared by the scenario tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;

use wireview_builder::build::kernel::makefile_version;
use wireview_builder::cancel::CancelToken;
use wireview_builder::kernel::kconfig::read_local_version;
use wireview_builder::process::CmdOutput;
use wireview_builder::{
    Error, Fetcher, HostTools, Pipeline, PipelineContext, Result, Settings, Stage,
};

pub const TARGET: &str = "7.2.4";
pub const KERNEL: &str = "6.12.54-Unraid";
pub const PACKAGE_VERSION: &str = "2026.02.27";
pub const PACKAGE_FILE: &str = "wireview-hwmon-2026.02.27-x86_64-6.12.54-Unraid.txz";

pub const RELEASE_URL: &str = "https://stable.dl.unraid.net/unRAIDServer-7.2.4-x86_64.zip";
pub const MATCHED_TEMPLATE: &str = "https://sources.test/linux-{kernel_version}.tar.gz";
pub const MATCHED_URL: &str = "https://sources.test/linux-6.12.54-Unraid.tar.gz";
pub const UPSTREAM_URL: &str = "https://cdn.kernel.org/pub/linux/kernel/v6.x/linux-6.12.54.tar.xz";

const MAKEFILE: &str = "VERSION = 6\nPATCHLEVEL = 12\nSUBLEVEL = 54\nEXTRAVERSION =\nNAME = Baby Opossum Posse\n";
pub const UNRAID_CONFIG: &str =
    "CONFIG_MODULES=y\nCONFIG_HWMON=y\nCONFIG_LOCALVERSION=\"-Unraid\"\nCONFIG_MODULE_SIG_FORCE=y\n";

/// Serves fixed bodies by URL and records every request.
#[derive(Clone, Default)]
pub struct FakeFetcher {
    bodies: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl FakeFetcher {
    pub fn serve(&self, url: &str, body: Vec<u8>) {
        self.bodies.lock().unwrap().insert(url.to_string(), body);
    }

    pub fn requests(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, url: &str) -> usize {
        self.requests().iter().filter(|u| u.as_str() == url).count()
    }
}

impl Fetcher for FakeFetcher {
    fn fetch(&self, url: &str, dest: &Path, stage: Stage, cancel: &CancelToken) -> Result<u64> {
        cancel.check()?;
        self.log.lock().unwrap().push(url.to_string());
        let body = self.bodies.lock().unwrap().get(url).cloned();
        match body {
            Some(body) => {
                fs::write(dest, &body).unwrap();
                Ok(body.len() as u64)
            }
            None => Err(Error::Network {
                stage,
                url: url.to_string(),
                status: Some(404),
                reason: "HTTP 404 Not Found".into(),
            }),
        }
    }
}

/// Stands in for unsquashfs, kbuild and cc.
#[derive(Clone)]
pub struct FakeHost {
    module_name: String,
    pub log: Arc<Mutex<Vec<String>>>,
}

impl FakeHost {
    pub fn new(module_name: &str) -> Self {
        Self {
            module_name: module_name.to_string(),
            log: Arc::default(),
        }
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.calls().iter().filter(|c| c.contains(needle)).count()
    }
}

impl HostTools for FakeHost {
    /// The fake image is `hsqs` followed by one version directory per line.
    fn unsquash(&self, image: &Path, dest: &Path, _cancel: &CancelToken) -> Result<()> {
        self.log.lock().unwrap().push("unsquashfs".into());
        let data = fs::read(image).unwrap();
        let listing = String::from_utf8_lossy(&data[4..]).into_owned();
        fs::create_dir_all(dest).unwrap();
        for version in listing.lines().filter(|l| !l.trim().is_empty()) {
            let dir = dest.join(version.trim());
            fs::create_dir_all(dir.join("kernel/drivers")).unwrap();
            fs::write(dir.join("modules.dep"), "").unwrap();
        }
        Ok(())
    }

    fn make(
        &self,
        dir: &Path,
        args: &[String],
        stage: Stage,
        _cancel: &CancelToken,
    ) -> Result<CmdOutput> {
        self.log.lock().unwrap().push(format!("make {}", args.join(" ")));
        let fail = |output: &str| Error::Command {
            stage,
            command: format!("make -C {} {}", dir.display(), args.join(" ")),
            status: "exit status: 2".into(),
            output: output.to_string(),
        };

        match args.last().map(String::as_str) {
            Some(target) if target.ends_with("defconfig") && target != "olddefconfig" => {
                fs::write(dir.join(".config"), "CONFIG_MODULES=y\nCONFIG_X86_64=y\n").unwrap();
            }
            Some("olddefconfig") => {
                if !dir.join(".config").is_file() {
                    return Err(fail("***\n*** Configuration file \".config\" not found!\n"));
                }
            }
            Some("modules_prepare") => {
                let makefile = fs::read_to_string(dir.join("Makefile")).unwrap();
                let config = fs::read_to_string(dir.join(".config")).unwrap();
                let release = format!(
                    "{}{}",
                    makefile_version(&makefile).unwrap(),
                    read_local_version(&config)
                );
                fs::create_dir_all(dir.join("include/config")).unwrap();
                fs::write(dir.join("include/config/kernel.release"), format!("{release}\n"))
                    .unwrap();
            }
            Some("modules") => {
                if !dir.join("include/config/kernel.release").is_file() {
                    return Err(fail("ERROR: Kernel configuration is invalid.\n"));
                }
                let module_dir = args
                    .iter()
                    .find_map(|a| a.strip_prefix("M="))
                    .map(PathBuf::from)
                    .unwrap();
                fs::write(
                    module_dir.join(format!("{}.ko", self.module_name)),
                    b"\x7fELF module",
                )
                .unwrap();
            }
            other => return Err(fail(&format!("make: *** No rule to make target {other:?}.\n"))),
        }
        Ok(CmdOutput::default())
    }

    fn compile_static(&self, source: &Path, output: &Path, _cancel: &CancelToken) -> Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("cc {}", source.display()));
        fs::write(output, b"\x7fELF static").unwrap();
        Ok(())
    }
}

/// Minimal newc archive.
pub fn newc(entries: &[(&str, &[u8])]) -> Vec<u8> {
    fn pad(out: &mut Vec<u8>) {
        while out.len() % 4 != 0 {
            out.push(0);
        }
    }
    let mut out = Vec::new();
    let mut push = |name: &str, mode: u32, data: &[u8]| {
        let header = format!(
            "070701{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}{:08x}",
            0, mode, 0, 0, 1, 0, data.len(), 0, 0, 0, 0, name.len() + 1, 0
        );
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(name.as_bytes());
        out.push(0);
        pad(&mut out);
        out.extend_from_slice(data);
        pad(&mut out);
    };
    for (name, data) in entries {
        push(name, 0o100644, data);
    }
    push("TRAILER!!!", 0, &[]);
    out
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut enc = GzEncoder::new(Vec::new(), Compression::fast());
    enc.write_all(data).unwrap();
    enc.finish().unwrap()
}

/// Release ZIP with the three kernel containers. `boot_config` is placed at
/// `boot/config-<kv>` inside bzroot when given.
pub fn release_zip(boot_config: Option<&str>) -> Vec<u8> {
    let mut modules = b"hsqs".to_vec();
    modules.extend_from_slice(format!("{KERNEL}\n").as_bytes());

    let config_name = format!("boot/config-{KERNEL}");
    let mut root_entries: Vec<(&str, &[u8])> = vec![("etc/unraid-version", &b"version=\"7.2.4\"\n"[..])];
    if let Some(config) = boot_config {
        root_entries.push((config_name.as_str(), config.as_bytes()));
    }
    let bzroot = gzip(&newc(&root_entries));

    let mut bzimage = vec![0u8; 0x400];
    bzimage[0x202..0x206].copy_from_slice(b"HdrS");

    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut zip = zip::ZipWriter::new(&mut buf);
        let opts = zip::write::FileOptions::default();
        for (name, data) in [
            ("bzimage", &bzimage[..]),
            ("bzmodules", &modules[..]),
            ("bzroot", &bzroot[..]),
            ("changes.txt", &b"release notes\n"[..]),
        ] {
            zip.start_file(name, opts).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }
    buf.into_inner()
}

fn source_tarball(with_config: bool) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut files = vec![
        ("linux-6.12.54/Makefile", MAKEFILE),
        ("linux-6.12.54/scripts/setlocalversion", "#!/bin/sh\n"),
    ];
    if with_config {
        files.push(("linux-6.12.54/.config", UNRAID_CONFIG));
    }
    for (name, body) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, body.as_bytes()).unwrap();
    }
    builder.into_inner().unwrap()
}

pub fn matched_source() -> Vec<u8> {
    gzip(&source_tarball(true))
}

pub fn upstream_source() -> Vec<u8> {
    let mut enc = xz2::write::XzEncoder::new(Vec::new(), 1);
    enc.write_all(&source_tarball(false)).unwrap();
    enc.finish().unwrap()
}

/// A project checkout plus cache, work and output directories.
pub struct Workspace {
    pub dir: TempDir,
    pub fetcher: FakeFetcher,
    pub host: FakeHost,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let base = dir.path();

        fs::create_dir_all(base.join("driver")).unwrap();
        fs::write(base.join("driver/Makefile"), "obj-m := wireview_hwmon.o\n").unwrap();
        fs::write(base.join("driver/wireview_hwmon.c"), "// driver\n").unwrap();

        fs::create_dir_all(base.join("tools")).unwrap();
        fs::write(base.join("tools/wireviewd.c"), "int main(void){return 0;}\n").unwrap();
        fs::write(base.join("tools/wireview.c"), "int main(void){return 0;}\n").unwrap();

        fs::create_dir_all(base.join("plugin/gui")).unwrap();
        fs::write(base.join("plugin/rc.wireview-hwmon"), "#!/bin/sh\n").unwrap();
        fs::write(
            base.join("plugin/99-wireview-hwmon.rules"),
            "SUBSYSTEM==\"hwmon\", RUN+=\"/etc/rc.d/rc.wireview-hwmon restart\"\n",
        )
        .unwrap();
        fs::write(base.join("plugin/gui/WireView.page"), "Menu=\"Utilities\"\n").unwrap();

        Self {
            dir,
            fetcher: FakeFetcher::default(),
            host: FakeHost::new("wireview_hwmon"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn settings(&self) -> Settings {
        let base = self.path();
        let mut settings = Settings::defaults(base);
        settings.cache_dir = base.join("cache");
        settings.output_dir = base.join("dist");
        settings.work_dir = base.join("work");
        settings
    }

    pub fn pipeline(&self, settings: Settings) -> Pipeline {
        let ctx = PipelineContext::new(
            settings,
            Box::new(self.fetcher.clone()),
            Box::new(self.host.clone()),
            CancelToken::new(),
        )
        .unwrap();
        Pipeline::new(ctx)
    }
}
