//! Kernel `.config` manipulation.

use std::fs;
use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;

use crate::artifact::decompress::open_decoder;
use crate::artifact::format::ContainerFormat;
use crate::error::{IoResultExt, Result};

const IKCFG_START: &[u8] = b"IKCFG_ST";
const IKCFG_END: &[u8] = b"IKCFG_ED";

/// Payload signatures a compressed kernel image may carry, as probed by the
/// kernel's own `scripts/extract-ikconfig`.
const PAYLOAD_MAGICS: &[(&[u8], ContainerFormat)] = &[
    (&[0x1f, 0x8b, 0x08], ContainerFormat::Gzip),
    (&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00], ContainerFormat::Xz),
    (&[0x28, 0xb5, 0x2f, 0xfd], ContainerFormat::Zstd),
    (&[0x5d, 0x00, 0x00], ContainerFormat::Lzma),
];

/// Upper bound on a decompressed vmlinux.
const MAX_VMLINUX: u64 = 512 * 1024 * 1024;

/// Options that stop the cross-built module from requiring a signature the
/// build host cannot produce. `CONFIG_MODULE_SIG` itself is left alone: it
/// changes `struct module` and therefore the module ABI.
pub const DISABLE_MODULE_SIGNING: &str = "\
# CONFIG_MODULE_SIG_FORCE is not set
# CONFIG_MODULE_SIG_ALL is not set
CONFIG_MODULE_SIG_KEY=\"\"
CONFIG_SYSTEM_TRUSTED_KEYS=\"\"
CONFIG_SYSTEM_REVOCATION_KEYS=\"\"
";

/// Fragment merged over the architecture defconfig when no matching
/// configuration exists.
pub const DEFAULT_FRAGMENT: &str = "\
CONFIG_MODULES=y
CONFIG_MODULE_UNLOAD=y
CONFIG_MODVERSIONS=y
CONFIG_HWMON=y
CONFIG_USB=y
CONFIG_USB_SUPPORT=y
CONFIG_HID=y
CONFIG_I2C=y
# CONFIG_LOCALVERSION_AUTO is not set
";

/// Key of a `.config` line: `CONFIG_X=...` or `# CONFIG_X is not set`.
fn line_key(line: &str) -> Option<&str> {
    let line = line.trim();
    if let Some(rest) = line.strip_prefix("# ") {
        return rest.strip_suffix(" is not set");
    }
    if line.starts_with('#') {
        return None;
    }
    line.split_once('=').map(|(k, _)| k.trim())
}

/// Merge `fragment` into `config`, replacing prior values of the same keys.
pub fn merge_config(config: &str, fragment: &str) -> String {
    let mut lines: Vec<String> = config.lines().map(str::to_string).collect();
    for line in fragment.lines() {
        let line = line.trim();
        let Some(key) = line_key(line) else {
            continue;
        };
        lines.retain(|l| line_key(l) != Some(key));
        lines.push(line.to_string());
    }
    let mut out = lines.join("\n");
    out.push('\n');
    out
}

/// Apply kernel configuration options from `kconfig` to the file at
/// `config_path`, creating it if absent.
pub fn apply_kernel_config(config_path: &Path, kconfig: &str) -> Result<()> {
    // An existing but unreadable config is an error, not an empty file.
    let config = if config_path.exists() {
        fs::read_to_string(config_path)
            .io_context(|| format!("reading kernel config {}", config_path.display()))?
    } else {
        String::new()
    };
    fs::write(config_path, merge_config(&config, kconfig))
        .io_context(|| format!("writing kernel config {}", config_path.display()))
}

/// Pin `CONFIG_LOCALVERSION` to `suffix` and stop the build appending its own.
pub fn force_local_version(config_path: &Path, suffix: &str) -> Result<()> {
    let fragment = format!(
        "CONFIG_LOCALVERSION=\"{}\"\n# CONFIG_LOCALVERSION_AUTO is not set\n",
        suffix.replace('"', "\\\"")
    );
    apply_kernel_config(config_path, &fragment)
}

/// Value of `CONFIG_LOCALVERSION`, empty when unset.
pub fn read_local_version(config: &str) -> String {
    config
        .lines()
        .find_map(|l| l.trim().strip_prefix("CONFIG_LOCALVERSION="))
        .map(|v| v.trim().trim_matches('"').replace("\\\"", "\""))
        .unwrap_or_default()
}

/// Value of `key`, or `None` when absent or unset.
pub fn config_value<'a>(config: &'a str, key: &str) -> Option<&'a str> {
    config.lines().find_map(|l| {
        let (k, v) = l.trim().split_once('=')?;
        (k == key).then_some(v)
    })
}

/// Cheap plausibility check for text claiming to be a kernel config.
pub fn looks_like_kconfig(text: &str) -> bool {
    text.lines().any(|l| {
        let l = l.trim();
        l.starts_with("CONFIG_") && l.contains('=')
    })
}

/// A config we can build out-of-tree modules against.
pub fn is_usable(text: &str) -> bool {
    looks_like_kconfig(text) && config_value(text, "CONFIG_MODULES") == Some("y")
}

/// Recover the configuration embedded in a kernel image by
/// `CONFIG_IKCONFIG`, stored gzip'd between `IKCFG_ST` and `IKCFG_ED`.
///
/// The markers are searched in the image itself first, then in every
/// compressed payload found inside it (a bzImage wraps vmlinux this way).
pub fn extract_ikconfig(image: &[u8]) -> Option<String> {
    if let Some(text) = ikconfig_in(image) {
        return Some(text);
    }
    for &(magic, format) in PAYLOAD_MAGICS {
        for offset in find_all(image, magic) {
            let Ok(decoder) = open_decoder(format, &image[offset..]) else {
                continue;
            };
            let mut vmlinux = Vec::new();
            // trailing bytes after the stream end in an error; keep what decoded
            let _ = decoder.take(MAX_VMLINUX).read_to_end(&mut vmlinux);
            if let Some(text) = ikconfig_in(&vmlinux) {
                tracing::debug!(%format, offset, "ikconfig found in compressed payload");
                return Some(text);
            }
        }
    }
    None
}

fn ikconfig_in(data: &[u8]) -> Option<String> {
    let start = find(data, IKCFG_START)? + IKCFG_START.len();
    let end = start + find(&data[start..], IKCFG_END)?;
    let payload = &data[start..end];

    let mut text = String::new();
    if GzDecoder::new(payload).read_to_string(&mut text).is_ok() && looks_like_kconfig(&text) {
        return Some(text);
    }
    // Some builds store it uncompressed
    let raw = std::str::from_utf8(payload).ok()?;
    looks_like_kconfig(raw).then(|| raw.to_string())
}

fn find_all<'a>(haystack: &'a [u8], needle: &'a [u8]) -> impl Iterator<Item = usize> + 'a {
    haystack
        .windows(needle.len())
        .enumerate()
        .filter(move |(_, w)| *w == needle)
        .map(|(i, _)| i)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    #[test]
    fn test_apply_kernel_config_new_options() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join(".config");
        fs::write(&config_path, "CONFIG_FOO=y\nCONFIG_BAR=n\n").unwrap();

        apply_kernel_config(&config_path, "CONFIG_BAR=y\nCONFIG_BAZ=m\n").unwrap();

        let result = fs::read_to_string(&config_path).unwrap();
        assert!(result.contains("CONFIG_FOO=y"));
        assert!(result.contains("CONFIG_BAR=y"));
        assert!(result.contains("CONFIG_BAZ=m"));
        assert_eq!(result.matches("CONFIG_BAR").count(), 1);
    }

    #[test]
    fn test_apply_kernel_config_comments_ignored() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join(".config");
        fs::write(&config_path, "").unwrap();

        apply_kernel_config(&config_path, "# This is a comment\nCONFIG_TEST=y\n\n# Another\n").unwrap();

        let result = fs::read_to_string(&config_path).unwrap();
        assert!(result.contains("CONFIG_TEST=y"));
        assert!(!result.contains("# This is a comment"));
    }

    #[test]
    fn not_set_lines_replace_values_both_ways() {
        let merged = merge_config(
            "CONFIG_MODULE_SIG_FORCE=y\n# CONFIG_HWMON is not set\n",
            DISABLE_MODULE_SIGNING,
        );
        assert!(merged.contains("# CONFIG_MODULE_SIG_FORCE is not set"));
        assert!(!merged.contains("CONFIG_MODULE_SIG_FORCE=y"));

        let merged = merge_config(&merged, "CONFIG_HWMON=y\n");
        assert!(merged.contains("CONFIG_HWMON=y"));
        assert!(!merged.contains("CONFIG_HWMON is not set"));
    }

    #[test]
    fn local_version_round_trip() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config_path = temp_dir.path().join(".config");
        fs::write(
            &config_path,
            "CONFIG_LOCALVERSION=\"-custom\"\nCONFIG_LOCALVERSION_AUTO=y\nCONFIG_MODULES=y\n",
        )
        .unwrap();

        for suffix in ["-Unraid", "", "-rc1-x"] {
            force_local_version(&config_path, suffix).unwrap();
            let text = fs::read_to_string(&config_path).unwrap();
            assert_eq!(read_local_version(&text), suffix);
            assert!(text.contains("# CONFIG_LOCALVERSION_AUTO is not set"));
            assert_eq!(text.matches("CONFIG_LOCALVERSION=").count(), 1);
        }
    }

    #[test]
    fn usable_requires_modules() {
        assert!(is_usable("CONFIG_MODULES=y\nCONFIG_X=m\n"));
        assert!(!is_usable("# CONFIG_MODULES is not set\nCONFIG_X=y\n"));
        assert!(looks_like_kconfig("CONFIG_X=y"));
        assert!(!looks_like_kconfig("<html>not found</html>"));
    }

    #[test]
    fn ikconfig_from_image() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"CONFIG_MODULES=y\nCONFIG_LOCALVERSION=\"-Unraid\"\n")
            .unwrap();
        let gz = enc.finish().unwrap();

        let mut image = vec![0xAAu8; 64];
        image.extend_from_slice(IKCFG_START);
        image.extend_from_slice(&gz);
        image.extend_from_slice(IKCFG_END);
        image.extend_from_slice(&[0u8; 32]);

        let text = extract_ikconfig(&image).unwrap();
        assert_eq!(read_local_version(&text), "-Unraid");
        assert!(extract_ikconfig(&[0u8; 128]).is_none());
    }

    fn vmlinux_with_ikconfig() -> Vec<u8> {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"CONFIG_MODULES=y\nCONFIG_LOCALVERSION=\"-Unraid\"\n")
            .unwrap();
        let mut vmlinux = b"\x7fELF".to_vec();
        vmlinux.extend_from_slice(&[0x11u8; 4096]);
        vmlinux.extend_from_slice(IKCFG_START);
        vmlinux.extend_from_slice(&enc.finish().unwrap());
        vmlinux.extend_from_slice(IKCFG_END);
        vmlinux.extend_from_slice(&[0x22u8; 512]);
        vmlinux
    }

    /// Boot sector with the `HdrS` signature, then `payload`, then padding.
    fn bzimage(payload: &[u8]) -> Vec<u8> {
        let mut image = vec![0u8; 0x4000];
        image[0x202..0x206].copy_from_slice(b"HdrS");
        image.extend_from_slice(payload);
        image.extend_from_slice(&[0u8; 256]);
        image
    }

    #[test]
    fn ikconfig_behind_gzip_payload() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&vmlinux_with_ikconfig()).unwrap();
        let image = bzimage(&enc.finish().unwrap());

        assert!(find(&image, IKCFG_START).is_none());
        let text = extract_ikconfig(&image).unwrap();
        assert_eq!(read_local_version(&text), "-Unraid");
    }

    #[test]
    fn ikconfig_behind_xz_and_zstd_payloads() {
        let mut enc = xz2::write::XzEncoder::new(Vec::new(), 6);
        enc.write_all(&vmlinux_with_ikconfig()).unwrap();
        let xz_image = bzimage(&enc.finish().unwrap());
        assert!(extract_ikconfig(&xz_image).is_some());

        let zst_image = bzimage(&zstd::encode_all(&vmlinux_with_ikconfig()[..], 3).unwrap());
        assert!(extract_ikconfig(&zst_image).is_some());
    }

    #[test]
    fn compressed_payload_without_ikconfig() {
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(&[0x33u8; 8192]).unwrap();
        assert!(extract_ikconfig(&bzimage(&enc.finish().unwrap())).is_none());
    }
}
