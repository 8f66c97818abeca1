//! Kernel identity and configuration.
//!
//! - [`version`] - kernel release resolution from the module tree
//! - [`kconfig`] - `.config` editing and ikconfig recovery
//! - [`locator`] - tiered configuration lookup
//! - [`source`] - kernel source tarballs

pub mod kconfig;
pub mod locator;
pub mod source;
pub mod version;

pub use locator::{BuildConfiguration, ConfigTier, LocatedConfig, TierAttempt};
pub use version::{KernelVersion, ResolvedVersion};
