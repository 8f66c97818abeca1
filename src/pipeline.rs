//! Stage wiring.
//!
//! ```text
//! acquire ─► extract ─► resolve version ─► locate config ─► prepare tree
//!                                                              │
//!             package ◄─ assemble ◄─ binaries ◄─ module ◄──────┘
//! ```
//!
//! Every stage takes the [`PipelineContext`] plus the previous stage's
//! result. Nothing below this module reads the environment.

use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::artifact::squashfs::unpack_module_tree;
use crate::artifact::{extract_container, ArtifactKind, ExtractedArtifact};
use crate::build::{self, HostTools, PackageArchive};
use crate::cache::CacheStore;
use crate::cancel::CancelToken;
use crate::config::Settings;
use crate::error::{IoResultExt, Result};
use crate::fetch::Fetcher;
use crate::kernel::locator::{default_tier_warning, locate_configuration, LocatorInput};
use crate::kernel::version::resolve_kernel_version;
use crate::kernel::{ConfigTier, KernelVersion, ResolvedVersion, TierAttempt};
use crate::release::{self, ReleaseArchive, TargetVersion};

/// Everything a stage may touch.
pub struct PipelineContext {
    pub settings: Settings,
    pub cache: CacheStore,
    pub fetcher: Box<dyn Fetcher>,
    pub host: Box<dyn HostTools>,
    pub cancel: CancelToken,
    /// Per-run scratch directory, removed on drop unless kept.
    pub workdir: PathBuf,
    guard: Option<TempDir>,
}

impl PipelineContext {
    pub fn new(
        settings: Settings,
        fetcher: Box<dyn Fetcher>,
        host: Box<dyn HostTools>,
        cancel: CancelToken,
    ) -> Result<Self> {
        let cache = CacheStore::open(&settings.cache_dir)?;
        std::fs::create_dir_all(&settings.work_dir)
            .io_context(|| format!("creating {}", settings.work_dir.display()))?;
        let guard = tempfile::Builder::new()
            .prefix("run-")
            .tempdir_in(&settings.work_dir)
            .io_context(|| format!("creating run directory in {}", settings.work_dir.display()))?;
        let workdir = guard.path().to_path_buf();
        tracing::debug!(workdir = %workdir.display(), cache = %cache.root().display(), "pipeline context ready");
        Ok(Self {
            settings,
            cache,
            fetcher,
            host,
            cancel,
            workdir,
            guard: Some(guard),
        })
    }

    /// Leave the run directory in place after the run, for debugging.
    pub fn keep_workdir(&mut self) {
        if let Some(guard) = self.guard.take() {
            let path = guard.into_path();
            tracing::info!(workdir = %path.display(), "keeping run directory");
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub target: TargetVersion,
    /// Plugin version field of the package name, e.g. `2026.02.27`.
    pub package_version: String,
}

/// Output of the first three stages.
#[derive(Debug, Clone)]
pub struct ResolveReport {
    pub release: ReleaseArchive,
    pub module_tree: ExtractedArtifact,
    pub resolved: ResolvedVersion,
}

#[derive(Debug, Clone)]
pub struct BuildReport {
    pub package: PackageArchive,
    pub kernel_version: KernelVersion,
    pub tier: ConfigTier,
    pub config_origin: String,
    /// Non-fatal problems the operator must see.
    pub warnings: Vec<String>,
    /// Tiers passed over before the winning one. Empty for a cached tree.
    pub attempts: Vec<TierAttempt>,
    pub release_from_cache: bool,
    pub tree_from_cache: bool,
}

pub struct Pipeline {
    ctx: PipelineContext,
}

impl Pipeline {
    pub fn new(ctx: PipelineContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &PipelineContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut PipelineContext {
        &mut self.ctx
    }

    /// Acquire the release and resolve its kernel version.
    pub fn resolve(&self, target: &TargetVersion) -> Result<ResolveReport> {
        let ctx = &self.ctx;
        let release = release::acquire(ctx, target)?;

        ctx.cancel.check()?;
        let module_tree =
            extract_container(&release, ArtifactKind::ModuleTree, &ctx.workdir, &ctx.cancel)?;
        let root = unpack_module_tree(
            ctx.host.as_ref(),
            &module_tree,
            &ctx.workdir.join("modules-root"),
            &ctx.cancel,
        )?;
        let resolved = resolve_kernel_version(&root)?;

        Ok(ResolveReport {
            release,
            module_tree,
            resolved,
        })
    }

    /// Run every stage and write the package.
    pub fn run(&self, request: &BuildRequest) -> Result<BuildReport> {
        let ctx = &self.ctx;
        // fail on a bad version before anything is downloaded
        build::package::check_plugin_version(&request.package_version)?;

        let ResolveReport {
            release, resolved, ..
        } = self.resolve(&request.target)?;
        let version = resolved.version;
        let mut warnings = Vec::new();

        ctx.cancel.check()?;
        let (tree, attempts) = match build::kernel::cached_tree(ctx, &version)? {
            Some(tree) => (tree, Vec::new()),
            None => {
                let located = locate_configuration(&LocatorInput {
                    ctx,
                    release: &release,
                    version: &version,
                    workdir: &ctx.workdir,
                })?;
                let tree = build::kernel::prepare_tree(ctx, &version, &located)?;
                (tree, located.attempts)
            }
        };
        let configuration = &tree.configuration;
        if configuration.tier.is_default() {
            let warning = default_tier_warning(&version);
            if tree.from_cache {
                tracing::warn!("{warning}");
            }
            warnings.push(warning);
        }
        if !configuration.valid {
            let warning = format!(
                "kernel configuration from {} does not enable CONFIG_MODULES",
                configuration.origin
            );
            tracing::warn!("{warning}");
            warnings.push(warning);
        }

        ctx.cancel.check()?;
        let module = build::module::build_module(ctx, &tree)?;
        let binaries = build::module::build_binaries(ctx)?;

        ctx.cancel.check()?;
        let name = build::package::package_name(&ctx.settings, &request.package_version, &version)?;
        let root = package_root(&ctx.workdir);
        build::package::assemble(&ctx.settings, &version, &module, &binaries, &root)?;
        let package = build::package::write_package(&root, &ctx.settings.output_dir, &name)?;

        Ok(BuildReport {
            package,
            kernel_version: version,
            tier: configuration.tier,
            config_origin: configuration.origin.clone(),
            warnings,
            attempts,
            release_from_cache: release.from_cache,
            tree_from_cache: tree.from_cache,
        })
    }
}

fn package_root(workdir: &Path) -> PathBuf {
    workdir.join("package-root")
}
