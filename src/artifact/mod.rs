//! Release archive contents: locating containers, identifying their
//! formats, and reading the ones the pipeline needs.
//!
//! - [`extract`] - find and stream containers out of the release ZIP
//! - [`format`] - magic-byte signature table
//! - [`decompress`] - decoder chain with ordered fallback
//! - [`cpio`] - newc reader for (concatenated) initramfs images
//! - [`squashfs`] - module-tree unpacking

pub mod cpio;
pub mod decompress;
pub mod extract;
pub mod format;
pub mod squashfs;

pub use extract::{extract_container, ArtifactKind, ExtractedArtifact, Lookup};
pub use format::ContainerFormat;
