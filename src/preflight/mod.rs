//! Preflight checks for build validation.
//!
//! Validates that the host has the kernel build toolchain before any
//! download starts, so a missing `bc` shows up now and not forty minutes
//! into `modules_prepare`.
//!
//! # Example
//!
//! ```rust,no_run
//! use wireview_builder::preflight::{command_exists, check_required_tools};
//!
//! if !command_exists("unsquashfs") {
//!     println!("squashfs-tools not installed");
//! }
//!
//! let tools = &[("make", "make"), ("bc", "bc")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use crate::error::{Error, Result};

/// Check if a command exists on `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Host tools the pipeline runs, directly or through the kernel build.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("make", "make"),
    ("cc", "gcc"),
    ("unsquashfs", "squashfs-tools"),
    ("flex", "flex"),
    ("bison", "bison"),
    ("bc", "bc"),
    ("perl", "perl"),
];

/// Check that specific tools are available.
///
/// Returns a configuration error listing every missing tool and the
/// package that provides it.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<(&str, &str)> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .copied()
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        return Err(Error::Config(format!(
            "missing required host tools:\n{msg}\n(use --skip-preflight to bypass)"
        )));
    }

    Ok(())
}

/// Check everything in [`REQUIRED_TOOLS`].
pub fn check_host_tools() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)
}
