//! Out-of-tree module and userspace binary compilation.

use std::fs;
use std::path::{Path, PathBuf};

use super::copy_tree;
use super::kernel::KernelSourceTree;
use crate::error::{Error, IoResultExt, Result, Stage};
use crate::pipeline::PipelineContext;

/// Suffixes `make modules` may leave on the module, in lookup order.
const MODULE_SUFFIXES: &[(&str, bool)] = &[
    ("ko", false),
    ("ko.xz", true),
    ("ko.gz", true),
    ("ko.zst", true),
];

#[derive(Debug, Clone)]
pub struct ModuleArtifact {
    pub path: PathBuf,
    pub compressed: bool,
}

impl ModuleArtifact {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct BinaryArtifact {
    pub name: String,
    pub path: PathBuf,
}

/// Build the module in a private copy of its source against `tree`.
pub fn build_module(ctx: &PipelineContext, tree: &KernelSourceTree) -> Result<ModuleArtifact> {
    let source = &ctx.settings.module_source;
    if !source.is_dir() {
        return Err(Error::MissingFile {
            stage: Stage::BuildModule,
            path: source.clone(),
        });
    }

    let build_dir = ctx.workdir.join("module");
    if build_dir.exists() {
        fs::remove_dir_all(&build_dir)
            .io_context(|| format!("clearing {}", build_dir.display()))?;
    }
    copy_tree(source, &build_dir)?;

    tracing::info!(
        module = %ctx.settings.module_name,
        tree = %tree.path.display(),
        "building kernel module"
    );
    let args = vec![
        format!("M={}", build_dir.display()),
        "modules".to_string(),
    ];
    ctx.host
        .make(&tree.path, &args, Stage::BuildModule, &ctx.cancel)?;

    let module = find_module(&build_dir, &ctx.settings.module_name)?;
    tracing::info!(path = %module.path.display(), compressed = module.compressed, "module built");
    Ok(module)
}

/// Look for `<name>.ko` or a compressed variant in `dir`.
pub fn find_module(dir: &Path, name: &str) -> Result<ModuleArtifact> {
    for (suffix, compressed) in MODULE_SUFFIXES {
        let path = dir.join(format!("{name}.{suffix}"));
        if path.is_file() {
            return Ok(ModuleArtifact {
                path,
                compressed: *compressed,
            });
        }
    }
    Err(Error::MissingFile {
        stage: Stage::BuildModule,
        path: dir.join(format!("{name}.ko")),
    })
}

/// Compile each configured helper into `<workdir>/bin/<name>`.
pub fn build_binaries(ctx: &PipelineContext) -> Result<Vec<BinaryArtifact>> {
    let out_dir = ctx.workdir.join("bin");
    fs::create_dir_all(&out_dir).io_context(|| format!("creating {}", out_dir.display()))?;

    let mut built = Vec::with_capacity(ctx.settings.binaries.len());
    for binary in &ctx.settings.binaries {
        ctx.cancel.check()?;
        if !binary.source.is_file() {
            return Err(Error::MissingFile {
                stage: Stage::BuildBinaries,
                path: binary.source.clone(),
            });
        }
        let output = out_dir.join(&binary.name);
        tracing::info!(name = %binary.name, source = %binary.source.display(), "compiling static binary");
        ctx.host
            .compile_static(&binary.source, &output, &ctx.cancel)?;
        if !output.is_file() {
            return Err(Error::MissingFile {
                stage: Stage::BuildBinaries,
                path: output,
            });
        }
        built.push(BinaryArtifact {
            name: binary.name.clone(),
            path: output,
        });
    }
    Ok(built)
}
