//! Host toolchain access.
//!
//! Every external program the pipeline runs goes through [`HostTools`], so
//! the stages can be exercised without a kernel toolchain installed.

use std::path::Path;

use crate::cancel::CancelToken;
use crate::error::{Result, Stage};
use crate::process::{Cmd, CmdOutput};

pub trait HostTools {
    /// Unpack a squashfs image into `dest`.
    fn unsquash(&self, image: &Path, dest: &Path, cancel: &CancelToken) -> Result<()>;

    /// Run `make -C <dir> <args>`.
    fn make(&self, dir: &Path, args: &[String], stage: Stage, cancel: &CancelToken)
        -> Result<CmdOutput>;

    /// Compile a single C source into a statically linked executable.
    fn compile_static(&self, source: &Path, output: &Path, cancel: &CancelToken) -> Result<()>;
}

/// Runs the real tools found on `PATH`.
#[derive(Debug, Clone)]
pub struct SystemHost {
    jobs: usize,
    cc: String,
}

impl SystemHost {
    pub fn new() -> Self {
        let jobs = match std::thread::available_parallelism() {
            Ok(n) => n.get(),
            Err(e) => {
                tracing::warn!("could not detect CPU count ({e}), using 4 jobs");
                4
            }
        };
        let cc = std::env::var("CC")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "cc".to_string());
        Self { jobs, cc }
    }
}

impl Default for SystemHost {
    fn default() -> Self {
        Self::new()
    }
}

impl HostTools for SystemHost {
    fn unsquash(&self, image: &Path, dest: &Path, cancel: &CancelToken) -> Result<()> {
        Cmd::new("unsquashfs", Stage::Extract)
            .args(["-no-progress", "-no-xattrs", "-force", "-dest"])
            .arg_path(dest)
            .arg_path(image)
            .error_msg(format!("unsquashfs could not unpack {}", image.display()))
            .run(cancel)?;
        Ok(())
    }

    fn make(
        &self,
        dir: &Path,
        args: &[String],
        stage: Stage,
        cancel: &CancelToken,
    ) -> Result<CmdOutput> {
        let target = args.last().map(String::as_str).unwrap_or("all");
        Cmd::new("make", stage)
            .arg("-C")
            .arg_path(dir)
            .arg(format!("-j{}", self.jobs))
            .args(args)
            .env("LC_ALL", "C")
            .error_msg(format!("make {target} failed"))
            .run(cancel)
    }

    fn compile_static(&self, source: &Path, output: &Path, cancel: &CancelToken) -> Result<()> {
        Cmd::new(&self.cc, Stage::BuildBinaries)
            .args(["-static", "-O2", "-Wall", "-o"])
            .arg_path(output)
            .arg_path(source)
            .error_msg(format!("compiling {} failed", source.display()))
            .run(cancel)?;
        Ok(())
    }
}
