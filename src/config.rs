//! Builder settings: an optional `wireview-builder.toml` plus environment
//! overrides, resolved once at startup into a plain [`Settings`] value.
//!
//! Stages never read the environment themselves; everything they need is in
//! here.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// Conventional config file name, looked up in the current directory.
pub const DEFAULT_CONFIG_FILE: &str = "wireview-builder.toml";

pub const ENV_CACHE_DIR: &str = "WIREVIEW_CACHE_DIR";
pub const ENV_OUTPUT_DIR: &str = "WIREVIEW_OUTPUT_DIR";
pub const ENV_WORK_DIR: &str = "WIREVIEW_WORK_DIR";

/// Release archives for known Unraid versions. Entries from `[releases]`
/// in the config file take precedence.
pub const BUILTIN_RELEASES: &[(&str, &str)] = &[
    (
        "7.2.4",
        "https://stable.dl.unraid.net/unRAIDServer-7.2.4-x86_64.zip",
    ),
    (
        "7.2.3",
        "https://stable.dl.unraid.net/unRAIDServer-7.2.3-x86_64.zip",
    ),
    (
        "7.1.4",
        "https://stable.dl.unraid.net/unRAIDServer-7.1.4-x86_64.zip",
    ),
];

pub const DEFAULT_UPSTREAM_MIRRORS: &[&str] = &[
    "https://cdn.kernel.org/pub/linux/kernel/v{major}.x/linux-{base}.tar.xz",
    "https://mirrors.edge.kernel.org/pub/linux/kernel/v{major}.x/linux-{base}.tar.xz",
];

/// One userspace helper: binary name and its single C source file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BinarySource {
    pub name: String,
    pub source: PathBuf,
}

/// Fully resolved settings consumed by the pipeline.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Package component name, e.g. `wireview-hwmon`.
    pub component: String,
    pub arch: String,
    /// Kernel module base name (without `.ko`).
    pub module_name: String,
    pub module_source: PathBuf,
    pub binaries: Vec<BinarySource>,
    pub template_dir: PathBuf,
    pub releases: BTreeMap<String, String>,
    /// URL template (`{kernel_version}`, `{base}`, `{major}`) of a source
    /// tarball published for the exact kernel release, `.config` included.
    pub matched_source_url: Option<String>,
    pub upstream_mirrors: Vec<String>,
    pub defconfig_target: String,
    pub cache_dir: PathBuf,
    pub output_dir: PathBuf,
    pub work_dir: PathBuf,
    pub http_timeout: Duration,
    pub run_timeout: Option<Duration>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SettingsToml {
    package: Option<PackageToml>,
    sources: Option<SourcesToml>,
    releases: Option<BTreeMap<String, String>>,
    kernel: Option<KernelToml>,
    paths: Option<PathsToml>,
    network: Option<NetworkToml>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PackageToml {
    component: Option<String>,
    arch: Option<String>,
    module_name: Option<String>,
    template_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct SourcesToml {
    module_dir: Option<String>,
    binaries: Option<Vec<BinarySource>>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct KernelToml {
    matched_source_url: Option<String>,
    upstream_mirrors: Option<Vec<String>>,
    defconfig_target: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PathsToml {
    cache_dir: Option<String>,
    output_dir: Option<String>,
    work_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct NetworkToml {
    timeout_secs: Option<u64>,
    run_timeout_secs: Option<u64>,
}

/// Environment-level overrides, captured once by the caller.
#[derive(Debug, Clone, Default)]
pub struct EnvOverrides {
    pub cache_dir: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub work_dir: Option<PathBuf>,
}

impl EnvOverrides {
    pub fn from_env() -> Self {
        let get = |key: &str| {
            std::env::var_os(key)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from)
        };
        Self {
            cache_dir: get(ENV_CACHE_DIR),
            output_dir: get(ENV_OUTPUT_DIR),
            work_dir: get(ENV_WORK_DIR),
        }
    }
}

impl Settings {
    /// Defaults with relative paths anchored at `base_dir`.
    pub fn defaults(base_dir: &Path) -> Self {
        let cache_dir = dirs::cache_dir()
            .map(|d| d.join("wireview-builder"))
            .unwrap_or_else(|| base_dir.join(".cache"));
        Self {
            component: "wireview-hwmon".into(),
            arch: "x86_64".into(),
            module_name: "wireview_hwmon".into(),
            module_source: base_dir.join("driver"),
            binaries: vec![
                BinarySource {
                    name: "wireviewd".into(),
                    source: base_dir.join("tools/wireviewd.c"),
                },
                BinarySource {
                    name: "wireview".into(),
                    source: base_dir.join("tools/wireview.c"),
                },
            ],
            template_dir: base_dir.join("plugin"),
            releases: BUILTIN_RELEASES
                .iter()
                .map(|(v, u)| (v.to_string(), u.to_string()))
                .collect(),
            matched_source_url: None,
            upstream_mirrors: DEFAULT_UPSTREAM_MIRRORS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            defconfig_target: "x86_64_defconfig".into(),
            cache_dir,
            output_dir: base_dir.join("dist"),
            work_dir: base_dir.join(".work"),
            http_timeout: Duration::from_secs(300),
            run_timeout: None,
        }
    }

    /// Load `path` (if it exists) on top of the defaults, then apply `env`.
    ///
    /// Relative paths in the file resolve against the file's directory.
    pub fn load(path: &Path, env: &EnvOverrides) -> Result<Self> {
        let base_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();

        let mut settings = Self::defaults(&base_dir);
        if path.is_file() {
            let text = fs::read_to_string(path).map_err(|e| {
                Error::Config(format!("reading config '{}': {e}", path.display()))
            })?;
            let parsed: SettingsToml = toml::from_str(&text).map_err(|e| {
                Error::Config(format!("parsing config '{}': {e}", path.display()))
            })?;
            settings.merge(parsed, &base_dir);
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
        }

        settings.apply_env(env);
        settings.validate()?;
        Ok(settings)
    }

    fn merge(&mut self, parsed: SettingsToml, base_dir: &Path) {
        let resolve = |raw: &str| resolve_path(base_dir, raw);

        if let Some(package) = parsed.package {
            if let Some(v) = package.component {
                self.component = v;
            }
            if let Some(v) = package.arch {
                self.arch = v;
            }
            if let Some(v) = package.module_name {
                self.module_name = v;
            }
            if let Some(v) = package.template_dir {
                self.template_dir = resolve(&v);
            }
        }
        if let Some(sources) = parsed.sources {
            if let Some(v) = sources.module_dir {
                self.module_source = resolve(&v);
            }
            if let Some(bins) = sources.binaries {
                self.binaries = bins
                    .into_iter()
                    .map(|b| BinarySource {
                        source: resolve(&b.source.to_string_lossy()),
                        name: b.name,
                    })
                    .collect();
            }
        }
        if let Some(releases) = parsed.releases {
            self.releases.extend(releases);
        }
        if let Some(kernel) = parsed.kernel {
            if let Some(v) = kernel.matched_source_url {
                self.matched_source_url = Some(v).filter(|v| !v.trim().is_empty());
            }
            if let Some(v) = kernel.upstream_mirrors {
                self.upstream_mirrors = v;
            }
            if let Some(v) = kernel.defconfig_target {
                self.defconfig_target = v;
            }
        }
        if let Some(paths) = parsed.paths {
            if let Some(v) = paths.cache_dir {
                self.cache_dir = resolve(&v);
            }
            if let Some(v) = paths.output_dir {
                self.output_dir = resolve(&v);
            }
            if let Some(v) = paths.work_dir {
                self.work_dir = resolve(&v);
            }
        }
        if let Some(network) = parsed.network {
            if let Some(v) = network.timeout_secs {
                self.http_timeout = Duration::from_secs(v);
            }
            if let Some(v) = network.run_timeout_secs {
                self.run_timeout = (v > 0).then(|| Duration::from_secs(v));
            }
        }
    }

    fn apply_env(&mut self, env: &EnvOverrides) {
        if let Some(v) = &env.cache_dir {
            self.cache_dir = v.clone();
        }
        if let Some(v) = &env.output_dir {
            self.output_dir = v.clone();
        }
        if let Some(v) = &env.work_dir {
            self.work_dir = v.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("package.component", &self.component),
            ("package.arch", &self.arch),
            ("package.module_name", &self.module_name),
        ] {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("{field} must not be empty")));
            }
            if value.contains('/') || value.contains(char::is_whitespace) {
                return Err(Error::Config(format!(
                    "{field} must be a single path segment without spaces, got '{value}'"
                )));
            }
        }
        if self.binaries.is_empty() {
            return Err(Error::Config(
                "sources.binaries must list at least one userspace binary".into(),
            ));
        }
        if self.upstream_mirrors.is_empty() {
            return Err(Error::Config(
                "kernel.upstream_mirrors must list at least one mirror".into(),
            ));
        }
        Ok(())
    }

    /// Release URL for `version` from the lookup table.
    pub fn release_url(&self, version: &str) -> Option<&str> {
        self.releases.get(version).map(String::as_str)
    }
}

/// Join `raw` onto `base` unless it is already absolute.
pub fn resolve_path(base: &Path, raw: &str) -> PathBuf {
    let p = Path::new(raw.trim());
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base.join(p)
    }
}
