//! Configuration lookup.
//!
//! Tiers are tried in preference order and the first that yields a config
//! wins:
//!
//! 1. matched source: a tarball published for the exact kernel release,
//!    carrying its own `.config`
//! 2. extracted: a config found inside the release's boot image (or the
//!    kernel image's embedded ikconfig), paired with upstream source
//! 3. default: a generic fragment over the architecture defconfig, paired
//!    with upstream source; may not produce a loadable module
//!
//! Whichever tier wins, the local version is pinned to the release suffix.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;

use super::kconfig;
use super::source::{self, SourceOrigin, SourceTarball};
use super::version::KernelVersion;
use crate::artifact::cpio;
use crate::artifact::{extract_container, ArtifactKind};
use crate::cache::MATCHED_SOURCE;
use crate::error::{Error, IoResultExt, Result, Stage};
use crate::fetch::{fetch_into_cache, Download};
use crate::pipeline::PipelineContext;
use crate::release::ReleaseArchive;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigTier {
    Matched = 1,
    Extracted = 2,
    Default = 3,
}

impl ConfigTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Matched => "matched-source",
            Self::Extracted => "extracted",
            Self::Default => "default",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "matched-source" => Some(Self::Matched),
            "extracted" => Some(Self::Extracted),
            "default" => Some(Self::Default),
            _ => None,
        }
    }

    pub fn is_default(self) -> bool {
        self == Self::Default
    }
}

impl fmt::Display for ConfigTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tier {} ({})", *self as u8, self.as_str())
    }
}

/// The kernel configuration to build against.
#[derive(Debug, Clone)]
pub struct BuildConfiguration {
    pub tier: ConfigTier,
    /// A full `.config`, or for the default tier the fragment to merge over
    /// the defconfig.
    pub path: PathBuf,
    /// Contains `CONFIG_MODULES=y`.
    pub valid: bool,
    /// Human-readable provenance, e.g. `bzroot:boot/config-6.12.54-Unraid`.
    pub origin: String,
}

/// Why a tier was passed over.
#[derive(Debug, Clone)]
pub struct TierAttempt {
    pub tier: ConfigTier,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct LocatedConfig {
    pub configuration: BuildConfiguration,
    pub source: SourceTarball,
    pub attempts: Vec<TierAttempt>,
}

/// Compatibility warning attached to every default-tier build.
pub fn default_tier_warning(version: &KernelVersion) -> String {
    format!(
        "no matching kernel configuration was found for {version}; the module was built \
         against a generic defconfig and may fail to load on the target \
         (configure [kernel].matched_source_url to fix)"
    )
}

/// Stage inputs shared by every tier.
pub struct LocatorInput<'a> {
    pub ctx: &'a PipelineContext,
    pub release: &'a ReleaseArchive,
    pub version: &'a KernelVersion,
    /// Scratch directory for extracted containers and config files.
    pub workdir: &'a Path,
}

/// A tier's find: the config plus, for tier 1, its own source.
struct Found {
    config_text: String,
    origin: String,
    source: Option<SourceTarball>,
}

type Strategy = fn(&LocatorInput<'_>) -> Result<Found>;

const STRATEGIES: &[(ConfigTier, Strategy)] = &[
    (ConfigTier::Matched, matched_source as Strategy),
    (ConfigTier::Extracted, extracted_config as Strategy),
    (ConfigTier::Default, default_config as Strategy),
];

/// Run the tiers in order and return the first success, paired with the
/// kernel source it must be built with.
pub fn locate_configuration(input: &LocatorInput<'_>) -> Result<LocatedConfig> {
    let mut attempts = Vec::new();
    for (tier, strategy) in STRATEGIES {
        input.ctx.cancel.check()?;
        tracing::debug!(%tier, "trying configuration tier");
        let found = match strategy(input) {
            Ok(found) => found,
            Err(Error::Cancelled(msg)) => return Err(Error::Cancelled(msg)),
            Err(e) => {
                tracing::info!(%tier, "unavailable: {e}");
                attempts.push(TierAttempt {
                    tier: *tier,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        let configuration = finalize(input, *tier, &found)?;
        if tier.is_default() {
            tracing::warn!("{}", default_tier_warning(input.version));
        } else {
            tracing::info!(%tier, origin = %configuration.origin, "kernel configuration located");
        }
        let source = match found.source {
            Some(source) => source,
            None => source::fetch_upstream_source(input.ctx, input.version)?,
        };
        return Ok(LocatedConfig {
            configuration,
            source,
            attempts,
        });
    }

    Err(Error::SourcesExhausted {
        stage: Stage::LocateConfig,
        what: format!("a kernel configuration for {}", input.version),
        attempts: attempts
            .iter()
            .map(|a| format!("    - {}: {}", a.tier, a.reason))
            .collect::<Vec<_>>()
            .join("\n"),
    })
}

/// Write the config, pin its local version, and read it back.
fn finalize(input: &LocatorInput<'_>, tier: ConfigTier, found: &Found) -> Result<BuildConfiguration> {
    let dir = input.workdir.join("config");
    fs::create_dir_all(&dir).io_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(format!("{}.config", tier.as_str()));
    fs::write(&path, &found.config_text).io_context(|| format!("writing {}", path.display()))?;

    let suffix = input.version.local_suffix();
    kconfig::force_local_version(&path, suffix)?;
    let text = fs::read_to_string(&path).io_context(|| format!("reading {}", path.display()))?;
    let pinned = kconfig::read_local_version(&text);
    if pinned != suffix {
        return Err(Error::ReleaseMismatch {
            stage: Stage::LocateConfig,
            expected: suffix.to_string(),
            actual: pinned,
        });
    }

    let valid = kconfig::is_usable(&text);
    if !valid {
        tracing::warn!(path = %path.display(), "configuration does not enable CONFIG_MODULES");
    }
    Ok(BuildConfiguration {
        tier,
        path,
        valid,
        origin: found.origin.clone(),
    })
}

fn matched_source(input: &LocatorInput<'_>) -> Result<Found> {
    let template = input.ctx.settings.matched_source_url.as_deref().ok_or_else(|| {
        Error::Config("no matched-source URL template configured ([kernel].matched_source_url)".into())
    })?;
    let url = source::render_url(template, input.version);

    let mut meta = BTreeMap::new();
    meta.insert("url".to_string(), serde_json::json!(url));
    let cached = fetch_into_cache(
        &input.ctx.cache,
        input.ctx.fetcher.as_ref(),
        &input.ctx.cancel,
        Download {
            kind: MATCHED_SOURCE,
            key: input.version.as_str(),
            url: &url,
            stage: Stage::LocateConfig,
        },
        meta,
        &source::verify_tarball,
    )?;

    let config_text = source::read_top_level_config(&cached.entry.path)?
        .filter(|t| kconfig::looks_like_kconfig(t))
        .ok_or_else(|| Error::MissingFile {
            stage: Stage::LocateConfig,
            path: PathBuf::from(format!("{url}#.config")),
        })?;
    Ok(Found {
        config_text,
        origin: format!("{url} (.config)"),
        source: Some(SourceTarball {
            origin: SourceOrigin::Matched,
            url,
            path: cached.entry.path,
            from_cache: cached.from_cache,
        }),
    })
}

/// Candidate config locations inside the boot image, most specific first.
/// The compressed `/proc` snapshot is the last resort.
pub fn boot_config_candidates(version: &KernelVersion) -> Vec<String> {
    let kv = version.as_str();
    vec![
        format!("boot/config-{kv}"),
        "boot/config".to_string(),
        format!("lib/modules/{kv}/build/.config"),
        format!("usr/src/linux-{kv}/.config"),
        "usr/src/linux/.config".to_string(),
        "etc/kernel-config".to_string(),
        "proc/config.gz".to_string(),
    ]
}

fn extracted_config(input: &LocatorInput<'_>) -> Result<Found> {
    let cancel = &input.ctx.cancel;
    let candidates = boot_config_candidates(input.version);
    let mut misses = Vec::new();

    match extract_container(input.release, ArtifactKind::BootImage, input.workdir, cancel) {
        Ok(boot) => {
            let data = fs::read(&boot.path).io_context(|| format!("reading {}", boot.path.display()))?;
            let keep = |name: &str| candidates.iter().any(|c| c == name);
            match cpio::read_initramfs(&data, "bzroot", cancel, &keep) {
                Ok(contents) => {
                    for candidate in &candidates {
                        let Some(entry) = contents.find(candidate) else {
                            continue;
                        };
                        let text = if candidate.ends_with(".gz") {
                            let mut text = String::new();
                            if GzDecoder::new(entry.data.as_slice())
                                .read_to_string(&mut text)
                                .is_err()
                            {
                                misses.push(format!("{candidate}: not valid gzip"));
                                continue;
                            }
                            text
                        } else {
                            String::from_utf8_lossy(&entry.data).into_owned()
                        };
                        if kconfig::looks_like_kconfig(&text) {
                            return Ok(Found {
                                config_text: text,
                                origin: format!("bzroot:{candidate}"),
                                source: None,
                            });
                        }
                        misses.push(format!("{candidate}: not a kernel config"));
                    }
                    misses.push(format!("bzroot: none of {} present", candidates.join(", ")));
                }
                Err(Error::Cancelled(msg)) => return Err(Error::Cancelled(msg)),
                Err(e) => misses.push(format!("bzroot: {e}")),
            }
        }
        Err(Error::Cancelled(msg)) => return Err(Error::Cancelled(msg)),
        Err(e) => misses.push(format!("bzroot: {e}")),
    }

    match extract_container(input.release, ArtifactKind::KernelImage, input.workdir, cancel) {
        Ok(image) => {
            let data =
                fs::read(&image.path).io_context(|| format!("reading {}", image.path.display()))?;
            if let Some(text) = kconfig::extract_ikconfig(&data) {
                return Ok(Found {
                    config_text: text,
                    origin: "bzimage:ikconfig".to_string(),
                    source: None,
                });
            }
            misses.push("bzimage: no embedded ikconfig".to_string());
        }
        Err(Error::Cancelled(msg)) => return Err(Error::Cancelled(msg)),
        Err(e) => misses.push(format!("bzimage: {e}")),
    }

    Err(Error::SourcesExhausted {
        stage: Stage::LocateConfig,
        what: "a configuration inside the release images".into(),
        attempts: misses
            .iter()
            .map(|m| format!("      {m}"))
            .collect::<Vec<_>>()
            .join("\n"),
    })
}

fn default_config(input: &LocatorInput<'_>) -> Result<Found> {
    Ok(Found {
        config_text: kconfig::DEFAULT_FRAGMENT.to_string(),
        origin: format!(
            "{} + built-in fragment",
            input.ctx.settings.defconfig_target
        ),
        source: None,
    })
}
