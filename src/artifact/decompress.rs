//! Decoder chain for compressed initramfs segments.

use std::io::{self, Read};

use flate2::read::MultiGzDecoder;
use xz2::read::XzDecoder;
use xz2::stream::Stream;

use super::format::{self, ContainerFormat};
use crate::cancel::CancelToken;
use crate::error::{Error, Result, Stage};

/// Order in which decoders are tried when the signature is inconclusive.
pub const FALLBACK_ORDER: &[ContainerFormat] = &[
    ContainerFormat::Gzip,
    ContainerFormat::Xz,
    ContainerFormat::Lzma,
    ContainerFormat::Zstd,
];

/// Wrap `reader` in the decoder for `format`.
pub fn open_decoder<'a, R: Read + 'a>(
    format: ContainerFormat,
    reader: R,
) -> io::Result<Box<dyn Read + 'a>> {
    Ok(match format {
        ContainerFormat::Gzip => Box::new(MultiGzDecoder::new(reader)),
        ContainerFormat::Xz => {
            let stream = Stream::new_stream_decoder(u64::MAX, xz2::stream::CONCATENATED)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            Box::new(XzDecoder::new_stream(reader, stream))
        }
        ContainerFormat::Lzma => {
            let stream = Stream::new_lzma_decoder(u64::MAX)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
            Box::new(XzDecoder::new_stream(reader, stream))
        }
        ContainerFormat::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
        other => {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{other} is not a compression format"),
            ))
        }
    })
}

/// Read `reader` to the end, checking `cancel` between chunks.
pub fn read_all_cancellable(mut reader: impl Read, cancel: &CancelToken) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        cancel.check()?;
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(Error::io("decompressing", e)),
        };
        out.extend_from_slice(&buf[..n]);
    }
    Ok(out)
}

/// Decode one compressed segment into a cpio stream.
///
/// The signature decides the decoder when it names a compression format.
/// Otherwise each decoder in [`FALLBACK_ORDER`] is tried and the first whose
/// output starts with a cpio header wins. Returns the detected format along
/// with the decoded bytes.
pub fn sniff_and_decode(
    data: &[u8],
    what: &str,
    cancel: &CancelToken,
) -> Result<(ContainerFormat, Vec<u8>)> {
    let detected = format::detect(data);
    if detected == ContainerFormat::Cpio {
        return Ok((detected, data.to_vec()));
    }
    if detected.is_compressed() {
        let decoder = open_decoder(detected, data).map_err(|e| Error::io(what, e))?;
        let out = read_all_cancellable(decoder, cancel).map_err(|e| match e {
            Error::Io { source, .. } => {
                Error::format(Stage::LocateConfig, what, "compressed cpio", source)
            }
            other => other,
        })?;
        return Ok((detected, out));
    }

    tracing::debug!(what, "signature inconclusive, trying each decoder");
    let mut tried = Vec::new();
    for &candidate in FALLBACK_ORDER {
        cancel.check()?;
        let attempt = open_decoder(candidate, data)
            .map_err(|e| Error::io(what, e))
            .and_then(|d| read_all_cancellable(d, cancel));
        match attempt {
            Ok(out) if format::is_cpio(&out) => return Ok((candidate, out)),
            Ok(_) => tried.push(format!("{candidate}: output is not cpio")),
            Err(Error::Cancelled(msg)) => return Err(Error::Cancelled(msg)),
            Err(e) => tried.push(format!("{candidate}: {e}")),
        }
    }
    Err(Error::format(
        Stage::LocateConfig,
        what,
        "initramfs segment",
        format!("no decoder produced a cpio archive ({})", tried.join("; ")),
    ))
}
