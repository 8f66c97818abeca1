//! Container signatures.
//!
//! Formats are identified from leading magic bytes, never from file names.

use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{IoResultExt, Result};

/// Offset of the `HdrS` boot protocol signature in an x86 bzImage.
const BZIMAGE_MAGIC_OFFSET: usize = 0x202;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Squashfs,
    Cpio,
    Gzip,
    Xz,
    Zstd,
    Lzma,
    Zip,
    BzImage,
    Unknown,
}

impl ContainerFormat {
    pub fn is_compressed(self) -> bool {
        matches!(self, Self::Gzip | Self::Xz | Self::Zstd | Self::Lzma)
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Squashfs => "squashfs",
            Self::Cpio => "cpio (newc)",
            Self::Gzip => "gzip",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
            Self::Lzma => "lzma",
            Self::Zip => "zip",
            Self::BzImage => "bzImage",
            Self::Unknown => "unknown",
        })
    }
}

pub const CPIO_NEWC_MAGIC: &[u8] = b"070701";
pub const CPIO_CRC_MAGIC: &[u8] = b"070702";

/// Signatures at offset zero, checked in order.
const SIGNATURES: &[(&[u8], ContainerFormat)] = &[
    (b"hsqs", ContainerFormat::Squashfs),
    (CPIO_NEWC_MAGIC, ContainerFormat::Cpio),
    (CPIO_CRC_MAGIC, ContainerFormat::Cpio),
    (&[0x1f, 0x8b], ContainerFormat::Gzip),
    (&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00], ContainerFormat::Xz),
    (&[0x28, 0xb5, 0x2f, 0xfd], ContainerFormat::Zstd),
    (&[0x5d, 0x00, 0x00], ContainerFormat::Lzma),
    (b"PK\x03\x04", ContainerFormat::Zip),
];

/// Bytes needed to recognise every known signature.
pub const SNIFF_LEN: usize = BZIMAGE_MAGIC_OFFSET + 4;

pub fn detect(header: &[u8]) -> ContainerFormat {
    for (magic, format) in SIGNATURES {
        if header.starts_with(magic) {
            return *format;
        }
    }
    if header.get(BZIMAGE_MAGIC_OFFSET..BZIMAGE_MAGIC_OFFSET + 4) == Some(&b"HdrS"[..]) {
        return ContainerFormat::BzImage;
    }
    ContainerFormat::Unknown
}

pub fn is_cpio(header: &[u8]) -> bool {
    header.starts_with(CPIO_NEWC_MAGIC) || header.starts_with(CPIO_CRC_MAGIC)
}

pub fn detect_file(path: &Path) -> Result<ContainerFormat> {
    let mut file = File::open(path).io_context(|| format!("opening {}", path.display()))?;
    let mut header = Vec::with_capacity(SNIFF_LEN);
    file.by_ref()
        .take(SNIFF_LEN as u64)
        .read_to_end(&mut header)
        .io_context(|| format!("reading header of {}", path.display()))?;
    Ok(detect(&header))
}
