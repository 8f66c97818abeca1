//! Kernel header preparation.
//!
//! Turns a source tarball plus a [`BuildConfiguration`] into a configured,
//! `modules_prepare`d tree whose `kernel.release` matches the target exactly.
//! Prepared trees are cached per kernel release.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::cache::KERNEL_TREE;
use crate::error::{Error, IoResultExt, Result, Stage};
use crate::kernel::kconfig::{self, DISABLE_MODULE_SIGNING};
use crate::kernel::{BuildConfiguration, ConfigTier, KernelVersion, LocatedConfig};
use crate::pipeline::PipelineContext;

/// A header-ready kernel source tree.
#[derive(Debug, Clone)]
pub struct KernelSourceTree {
    pub path: PathBuf,
    pub configuration: BuildConfiguration,
    pub prepared: bool,
    pub from_cache: bool,
}

/// Reuse a cached prepared tree for `version`, if one is still intact.
pub fn cached_tree(ctx: &PipelineContext, version: &KernelVersion) -> Result<Option<KernelSourceTree>> {
    let expected = version.as_str().to_string();
    let check = move |path: &Path| check_tree(path, &expected);
    let Some(entry) = ctx.cache.get_valid(KERNEL_TREE, version.as_str(), &check)? else {
        return Ok(None);
    };

    let tier = entry
        .meta_str("tier")
        .and_then(ConfigTier::parse)
        .unwrap_or(ConfigTier::Default);
    let origin = entry.meta_str("origin").unwrap_or("cached tree").to_string();
    let config_path = entry.path.join(".config");
    let text = fs::read_to_string(&config_path)
        .io_context(|| format!("reading {}", config_path.display()))?;
    tracing::info!(kernel = %version, %tier, path = %entry.path.display(), "reusing prepared kernel tree");
    Ok(Some(KernelSourceTree {
        configuration: BuildConfiguration {
            tier,
            path: config_path,
            valid: kconfig::is_usable(&text),
            origin,
        },
        path: entry.path,
        prepared: true,
        from_cache: true,
    }))
}

/// Unpack, configure and `modules_prepare` the located source, then move it
/// into the cache.
pub fn prepare_tree(
    ctx: &PipelineContext,
    version: &KernelVersion,
    located: &LocatedConfig,
) -> Result<KernelSourceTree> {
    let staging = ctx.cache.tmp_path(&format!("tree-{version}"));
    let result = prepare_in(ctx, version, located, &staging);
    if result.is_err() && staging.exists() {
        let _ = fs::remove_dir_all(&staging);
    }
    result?;

    let configuration = &located.configuration;
    let mut meta = BTreeMap::new();
    meta.insert("tier".to_string(), serde_json::json!(configuration.tier.as_str()));
    meta.insert("origin".to_string(), serde_json::json!(configuration.origin));
    meta.insert("source_url".to_string(), serde_json::json!(located.source.url));

    let expected = version.as_str().to_string();
    let check = move |path: &Path| check_tree(path, &expected);
    let entry = ctx
        .cache
        .put_dir(KERNEL_TREE, version.as_str(), &staging, meta, &check)?;

    Ok(KernelSourceTree {
        configuration: BuildConfiguration {
            path: entry.path.join(".config"),
            ..configuration.clone()
        },
        path: entry.path,
        prepared: true,
        from_cache: false,
    })
}

fn prepare_in(
    ctx: &PipelineContext,
    version: &KernelVersion,
    located: &LocatedConfig,
    tree: &Path,
) -> Result<()> {
    let configuration = &located.configuration;
    crate::kernel::source::unpack_source(&located.source.path, tree, &ctx.cancel)?;

    let config_path = tree.join(".config");
    if configuration.tier.is_default() {
        tracing::info!(defconfig = %ctx.settings.defconfig_target, "generating base config from defconfig");
        make(ctx, tree, &[ctx.settings.defconfig_target.as_str()])?;
        let fragment = fs::read_to_string(&configuration.path)
            .io_context(|| format!("reading {}", configuration.path.display()))?;
        kconfig::apply_kernel_config(&config_path, &fragment)?;
    } else {
        fs::copy(&configuration.path, &config_path).io_context(|| {
            format!(
                "copying {} to {}",
                configuration.path.display(),
                config_path.display()
            )
        })?;
    }

    tracing::info!("disabling module signature enforcement");
    kconfig::apply_kernel_config(&config_path, DISABLE_MODULE_SIGNING)?;

    make(ctx, tree, &["olddefconfig"])?;

    // olddefconfig must not have rewritten the pinned suffix
    let text = fs::read_to_string(&config_path)
        .io_context(|| format!("reading {}", config_path.display()))?;
    let pinned = kconfig::read_local_version(&text);
    if pinned != version.local_suffix() {
        return Err(Error::ReleaseMismatch {
            stage: Stage::PrepareTree,
            expected: version.local_suffix().to_string(),
            actual: pinned,
        });
    }

    tracing::info!("preparing kernel headers");
    make(ctx, tree, &["modules_prepare"])?;

    let release = get_kernel_version(tree)?;
    if release != version.as_str() {
        return Err(Error::ReleaseMismatch {
            stage: Stage::PrepareTree,
            expected: version.as_str().to_string(),
            actual: release,
        });
    }
    tracing::info!(kernel = %release, "kernel headers prepared");
    Ok(())
}

fn make(ctx: &PipelineContext, tree: &Path, args: &[&str]) -> Result<()> {
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
    ctx.host.make(tree, &args, Stage::PrepareTree, &ctx.cancel)?;
    Ok(())
}

/// A cached tree is intact if it has a `.config` and reports `expected`.
fn check_tree(path: &Path, expected: &str) -> Result<()> {
    if !path.join(".config").is_file() {
        return Err(Error::MissingFile {
            stage: Stage::Cache,
            path: path.join(".config"),
        });
    }
    let release = get_kernel_version(path)?;
    if release != expected {
        return Err(Error::ReleaseMismatch {
            stage: Stage::Cache,
            expected: expected.to_string(),
            actual: release,
        });
    }
    Ok(())
}

/// Kernel release of a prepared tree: `include/config/kernel.release`, or
/// the Makefile version fields when the tree has not been prepared.
pub fn get_kernel_version(tree: &Path) -> Result<String> {
    let release_path = tree.join("include/config/kernel.release");
    if release_path.exists() {
        return Ok(fs::read_to_string(&release_path)
            .io_context(|| format!("reading {}", release_path.display()))?
            .trim()
            .to_string());
    }

    let makefile = tree.join("Makefile");
    if makefile.exists() {
        let content = fs::read_to_string(&makefile)
            .io_context(|| format!("reading {}", makefile.display()))?;
        if let Some(v) = makefile_version(&content) {
            return Ok(v);
        }
    }

    Err(Error::MissingFile {
        stage: Stage::PrepareTree,
        path: release_path,
    })
}

/// `VERSION.PATCHLEVEL.SUBLEVEL EXTRAVERSION` from a kernel Makefile.
pub fn makefile_version(content: &str) -> Option<String> {
    let mut version = String::new();
    let mut patchlevel = String::new();
    let mut sublevel = String::new();
    let mut extraversion = String::new();

    for line in content.lines() {
        if let Some(v) = line.strip_prefix("VERSION = ") {
            version = v.trim().to_string();
        } else if let Some(v) = line.strip_prefix("PATCHLEVEL = ") {
            patchlevel = v.trim().to_string();
        } else if let Some(v) = line.strip_prefix("SUBLEVEL = ") {
            sublevel = v.trim().to_string();
        } else if let Some(v) = line.strip_prefix("EXTRAVERSION = ") {
            extraversion = v.trim().to_string();
        }
    }

    if version.is_empty() || patchlevel.is_empty() {
        return None;
    }
    Some(format!("{version}.{patchlevel}.{sublevel}{extraversion}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn release_file_wins_over_makefile() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("include/config")).unwrap();
        fs::write(
            tmp.path().join("include/config/kernel.release"),
            "6.12.54-Unraid\n",
        )
        .unwrap();
        fs::write(
            tmp.path().join("Makefile"),
            "VERSION = 6\nPATCHLEVEL = 12\nSUBLEVEL = 54\n",
        )
        .unwrap();
        assert_eq!(get_kernel_version(tmp.path()).unwrap(), "6.12.54-Unraid");
    }

    #[test]
    fn makefile_fallback() {
        let text = "VERSION = 6\nPATCHLEVEL = 12\nSUBLEVEL = 54\nEXTRAVERSION =\nNAME = Baby Opossum Posse\n";
        assert_eq!(makefile_version(text).as_deref(), Some("6.12.54"));
        assert_eq!(makefile_version("NAME = x\n"), None);
    }

    #[test]
    fn tree_check_requires_matching_release() {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("include/config")).unwrap();
        fs::write(tmp.path().join(".config"), "CONFIG_MODULES=y\n").unwrap();
        fs::write(
            tmp.path().join("include/config/kernel.release"),
            "6.12.54\n",
        )
        .unwrap();
        assert!(check_tree(tmp.path(), "6.12.54").is_ok());
        assert!(matches!(
            check_tree(tmp.path(), "6.12.54-Unraid"),
            Err(Error::ReleaseMismatch { .. })
        ));
    }
}
