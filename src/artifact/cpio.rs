//! Reader for `newc` cpio archives and concatenated initramfs images.
//!
//! An initramfs may be several archives back to back: typically an
//! uncompressed early archive (CPU microcode), zero padding, then the
//! compressed main archive. [`read_initramfs`] walks every segment and keeps
//! only the entries the caller asks for.

use std::io::{self, Read};

use super::decompress;
use super::format::{self, ContainerFormat};
use crate::cancel::CancelToken;
use crate::error::{Error, Result, Stage};

const HEADER_LEN: usize = 110;
const TRAILER: &str = "TRAILER!!!";
const S_IFMT: u32 = 0o170000;
const S_IFREG: u32 = 0o100000;

#[derive(Debug, Clone)]
pub struct CpioEntry {
    /// Path relative to the archive root, without a leading `./` or `/`.
    pub name: String,
    pub mode: u32,
    pub data: Vec<u8>,
}

impl CpioEntry {
    pub fn is_file(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }
}

/// Streaming reader over one newc archive.
pub struct CpioReader<R> {
    inner: R,
    label: String,
    pos: u64,
    done: bool,
}

impl<R: Read> CpioReader<R> {
    pub fn new(inner: R, label: impl Into<String>) -> Self {
        Self {
            inner,
            label: label.into(),
            pos: 0,
            done: false,
        }
    }

    /// Bytes consumed so far, trailer included once iteration has ended.
    pub fn position(&self) -> u64 {
        self.pos
    }

    fn bad(&self, reason: impl std::fmt::Display) -> Error {
        Error::format(
            Stage::LocateConfig,
            self.label.as_str(),
            "cpio archive",
            format!("at offset {}: {reason}", self.pos),
        )
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner
            .read_exact(buf)
            .map_err(|e| self.bad(format!("truncated archive ({e})")))?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn skip(&mut self, n: u64) -> Result<()> {
        let copied = io::copy(&mut (&mut self.inner).take(n), &mut io::sink())
            .map_err(|e| self.bad(e))?;
        if copied != n {
            return Err(self.bad("truncated archive"));
        }
        self.pos += n;
        Ok(())
    }

    fn skip_pad(&mut self) -> Result<()> {
        let pad = (4 - (self.pos % 4)) % 4;
        self.skip(pad)
    }

    /// Next entry, or `None` at the trailer. Data is only kept for entries
    /// whose name satisfies `keep`.
    pub fn next_entry(&mut self, keep: &dyn Fn(&str) -> bool) -> Result<Option<CpioEntry>> {
        if self.done {
            return Ok(None);
        }
        let mut header = [0u8; HEADER_LEN];
        self.read_exact(&mut header)?;
        if !format::is_cpio(&header) {
            return Err(self.bad("bad newc magic"));
        }
        let field = |i: usize| -> Result<u32> {
            let start = 6 + i * 8;
            let raw = std::str::from_utf8(&header[start..start + 8])
                .map_err(|_| self.bad("non-ascii header field"))?;
            u32::from_str_radix(raw, 16).map_err(|_| self.bad(format!("bad hex field '{raw}'")))
        };
        let mode = field(1)?;
        let file_size = u64::from(field(6)?);
        let name_size = field(11)? as usize;
        if name_size == 0 {
            return Err(self.bad("zero-length name"));
        }

        let mut name_buf = vec![0u8; name_size];
        self.read_exact(&mut name_buf)?;
        self.skip_pad()?;
        let raw_name = String::from_utf8_lossy(&name_buf[..name_size - 1]).into_owned();

        if raw_name == TRAILER {
            self.done = true;
            return Ok(None);
        }

        let name = normalize(&raw_name).to_string();
        let data = if keep(&name) {
            let mut data = vec![0u8; file_size as usize];
            self.read_exact(&mut data)?;
            data
        } else {
            self.skip(file_size)?;
            Vec::new()
        };
        self.skip_pad()?;
        Ok(Some(CpioEntry { name, mode, data }))
    }
}

fn normalize(name: &str) -> &str {
    let name = name.strip_prefix("./").unwrap_or(name);
    name.trim_start_matches('/')
}

/// Entries selected from a (possibly multi-segment) initramfs image.
#[derive(Debug, Default)]
pub struct InitramfsContents {
    pub entries: Vec<CpioEntry>,
    /// Container format of each segment in image order.
    pub segments: Vec<ContainerFormat>,
}

impl InitramfsContents {
    /// The last entry named `name`; later segments overlay earlier ones.
    pub fn find(&self, name: &str) -> Option<&CpioEntry> {
        let name = normalize(name);
        self.entries.iter().rev().find(|e| e.name == name)
    }
}

/// Walk every segment of an initramfs image.
pub fn read_initramfs(
    data: &[u8],
    label: &str,
    cancel: &CancelToken,
    keep: &dyn Fn(&str) -> bool,
) -> Result<InitramfsContents> {
    let mut contents = InitramfsContents::default();
    let mut offset = 0usize;
    loop {
        cancel.check()?;
        offset += leading_zeros(&data[offset..]);
        if offset >= data.len() {
            break;
        }
        let rest = &data[offset..];
        if format::is_cpio(rest) {
            offset += read_archive(rest, label, keep, &mut contents.entries)?;
            contents.segments.push(ContainerFormat::Cpio);
            continue;
        }

        // A compressed segment runs to the end of the image.
        let (segment_format, decoded) = decompress::sniff_and_decode(rest, label, cancel)?;
        contents.segments.push(segment_format);
        let mut inner = 0usize;
        loop {
            inner += leading_zeros(&decoded[inner..]);
            if inner >= decoded.len() || !format::is_cpio(&decoded[inner..]) {
                break;
            }
            inner += read_archive(&decoded[inner..], label, keep, &mut contents.entries)?;
        }
        break;
    }

    if contents.segments.is_empty() {
        return Err(Error::format(
            Stage::LocateConfig,
            label,
            "initramfs",
            "image is empty",
        ));
    }
    tracing::debug!(
        label,
        segments = ?contents.segments,
        kept = contents.entries.len(),
        "initramfs walked"
    );
    Ok(contents)
}

fn read_archive(
    data: &[u8],
    label: &str,
    keep: &dyn Fn(&str) -> bool,
    out: &mut Vec<CpioEntry>,
) -> Result<usize> {
    let mut reader = CpioReader::new(data, label);
    while let Some(entry) = reader.next_entry(keep)? {
        if keep(&entry.name) {
            out.push(entry);
        }
    }
    Ok(reader.position() as usize)
}

fn leading_zeros(data: &[u8]) -> usize {
    data.iter().take_while(|b| **b == 0).count()
}
