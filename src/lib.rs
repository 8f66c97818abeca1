//! Builds the WireView hwmon plugin package for a given Unraid release.
//!
//! The platform ships its kernel as opaque images inside a release ZIP, so
//! the kernel version and a matching build configuration have to be
//! recovered before an out-of-tree module can be built against it.
//!
//! # Architecture
//!
//! ```text
//! release ──► artifact ──► kernel::version ──► kernel::locator ──► build
//!    │            │                                  │               │
//!    └────────────┴──────────── cache ───────────────┴───────────────┘
//! ```
//!
//! - [`release`] - resolve a target version to a validated release archive
//! - [`artifact`] - pull containers out of the archive and decode them
//! - [`kernel`] - kernel version, `.config` handling, tiered config lookup
//! - [`build`] - header preparation, module and binary builds, packaging
//! - [`cache`] - content-addressed, per-key locked artifact cache
//! - [`pipeline`] - threads a [`PipelineContext`] through the stages
//!
//! # Example
//!
//! ```rust,no_run
//! use wireview_builder::{
//!     BuildRequest, CancelToken, EnvOverrides, HttpFetcher, Pipeline, PipelineContext,
//!     Settings, SystemHost, TargetVersion,
//! };
//! use std::path::Path;
//!
//! # fn main() -> wireview_builder::Result<()> {
//! let settings = Settings::load(Path::new("wireview-builder.toml"), &EnvOverrides::from_env())?;
//! let fetcher = HttpFetcher::new(settings.http_timeout)?;
//! let ctx = PipelineContext::new(
//!     settings,
//!     Box::new(fetcher),
//!     Box::new(SystemHost::new()),
//!     CancelToken::new(),
//! )?;
//! let report = Pipeline::new(ctx).run(&BuildRequest {
//!     target: TargetVersion::new("7.2.4"),
//!     package_version: "2026.02.27".into(),
//! })?;
//! println!("{}", report.package.path.display());
//! # Ok(())
//! # }
//! ```

pub mod artifact;
pub mod build;
pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod fetch;
pub mod kernel;
pub mod pipeline;
pub mod preflight;
pub mod process;
pub mod release;

pub use build::{HostTools, KernelSourceTree, ModuleArtifact, PackageArchive, SystemHost};
pub use cache::CacheStore;
pub use cancel::CancelToken;
pub use config::{EnvOverrides, Settings};
pub use error::{Error, ErrorClass, Result, Stage};
pub use fetch::{Fetcher, HttpFetcher};
pub use kernel::{BuildConfiguration, ConfigTier, KernelVersion};
pub use pipeline::{BuildReport, BuildRequest, Pipeline, PipelineContext, ResolveReport};
pub use release::{ReleaseArchive, TargetVersion};
