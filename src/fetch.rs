//! HTTP downloads.
//!
//! Stages only see the [`Fetcher`] trait; the binary wires in
//! [`HttpFetcher`] and tests substitute counting or failing fakes.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::Path;
use std::time::Duration;

use crate::cache::{CacheEntry, CacheStore, Check};
use crate::cancel::CancelToken;
use crate::error::{Error, ErrorClass, IoResultExt, Result, Stage};

const CHUNK: usize = 256 * 1024;
const FETCH_ATTEMPTS: u32 = 2;

pub trait Fetcher {
    /// Download `url` into `dest`, returning the number of bytes written.
    ///
    /// On error `dest` may hold a partial file; callers own its cleanup.
    fn fetch(&self, url: &str, dest: &Path, stage: Stage, cancel: &CancelToken) -> Result<u64>;
}

/// Blocking reqwest client with connect and overall request timeouts.
pub struct HttpFetcher {
    client: reqwest::blocking::Client,
    timeout: Duration,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(concat!("wireview-builder/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("building HTTP client: {e}")))?;
        Ok(Self { client, timeout })
    }
}

impl Fetcher for HttpFetcher {
    fn fetch(&self, url: &str, dest: &Path, stage: Stage, cancel: &CancelToken) -> Result<u64> {
        cancel.check()?;
        tracing::info!(%url, "downloading");

        let network = |status: Option<u16>, reason: String| Error::Network {
            stage,
            url: url.to_string(),
            status,
            reason,
        };

        // never outlive the run deadline
        let timeout = match cancel.remaining() {
            Some(left) => self.timeout.min(left),
            None => self.timeout,
        };
        let mut response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .map_err(|e| network(None, e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(network(Some(status.as_u16()), format!("HTTP {status}")));
        }
        let expected = response.content_length();

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).io_context(|| format!("creating {}", parent.display()))?;
        }
        let file = File::create(dest).io_context(|| format!("creating {}", dest.display()))?;
        let mut out = BufWriter::new(file);
        let mut buf = vec![0u8; CHUNK];
        let mut written = 0u64;
        loop {
            cancel.check()?;
            let n = response
                .read(&mut buf)
                .map_err(|e| network(Some(status.as_u16()), format!("reading body: {e}")))?;
            if n == 0 {
                break;
            }
            out.write_all(&buf[..n])
                .io_context(|| format!("writing {}", dest.display()))?;
            written += n as u64;
        }
        out.flush()
            .io_context(|| format!("flushing {}", dest.display()))?;

        if let Some(expected) = expected {
            if expected != written {
                return Err(network(
                    Some(status.as_u16()),
                    format!("short body: got {written} of {expected} bytes"),
                ));
            }
        }
        tracing::debug!(%url, bytes = written, "download complete");
        Ok(written)
    }
}

/// A cache entry obtained by [`fetch_into_cache`].
#[derive(Debug, Clone)]
pub struct Cached {
    pub entry: CacheEntry,
    pub from_cache: bool,
}

/// One downloadable artifact and where it lives in the cache.
#[derive(Debug, Clone, Copy)]
pub struct Download<'a> {
    pub kind: &'a str,
    pub key: &'a str,
    pub url: &'a str,
    pub stage: Stage,
}

/// Return the valid cached entry for `download`, or fetch it.
///
/// A cached entry failing `check` is purged first. Fresh downloads are staged
/// inside the cache, checked, and only then promoted. Transport failures,
/// server errors and failed checks get one retry. The final failure is
/// returned as [`Error::Download`] naming the URL and the cache entry.
pub fn fetch_into_cache(
    cache: &CacheStore,
    fetcher: &dyn Fetcher,
    cancel: &CancelToken,
    download: Download<'_>,
    meta: BTreeMap<String, serde_json::Value>,
    check: Check<'_>,
) -> Result<Cached> {
    let Download {
        kind,
        key,
        url,
        stage,
    } = download;

    if let Some(entry) = cache.get_valid(kind, key, check)? {
        tracing::info!(kind, key, path = %entry.path.display(), "cache hit");
        return Ok(Cached {
            entry,
            from_cache: true,
        });
    }

    let give_up = |attempts: u32, e: Error| match e {
        Error::Cancelled(_) => e,
        e => Error::Download {
            kind: kind.to_string(),
            key: key.to_string(),
            url: url.to_string(),
            attempts,
            source: Box::new(e),
        },
    };

    let mut attempt = 0;
    loop {
        attempt += 1;
        cancel.check()?;
        let staged = cache.tmp_path(&format!("{kind}-{key}"));
        let outcome = fetcher
            .fetch(url, &staged, stage, cancel)
            .and_then(|_| check(&staged));
        match outcome {
            Ok(()) => {
                let entry = cache.put_file(kind, key, &staged, meta, check)?;
                return Ok(Cached {
                    entry,
                    from_cache: false,
                });
            }
            Err(e) => {
                let _ = fs::remove_file(&staged);
                if attempt >= FETCH_ATTEMPTS || !is_retryable(&e) {
                    return Err(give_up(attempt, e));
                }
                tracing::warn!(kind, key, %url, attempt, "download rejected, retrying: {e}");
            }
        }
    }
}

/// A client error (4xx) will not change on retry; everything else might.
fn is_retryable(e: &Error) -> bool {
    match e {
        Error::Network {
            status: Some(code), ..
        } => *code >= 500,
        e => matches!(e.class(), ErrorClass::Network | ErrorClass::Format),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use tempfile::TempDir;

    struct Flaky {
        calls: Cell<u32>,
        good_from: u32,
    }

    impl Fetcher for Flaky {
        fn fetch(&self, _url: &str, dest: &Path, _: Stage, _: &CancelToken) -> Result<u64> {
            let n = self.calls.get() + 1;
            self.calls.set(n);
            let body: &[u8] = if n >= self.good_from { b"good" } else { b"bad" };
            fs::write(dest, body).unwrap();
            Ok(body.len() as u64)
        }
    }

    struct Refused {
        calls: Cell<u32>,
        status: Option<u16>,
    }

    impl Fetcher for Refused {
        fn fetch(&self, url: &str, _: &Path, stage: Stage, _: &CancelToken) -> Result<u64> {
            self.calls.set(self.calls.get() + 1);
            Err(Error::Network {
                stage,
                url: url.to_string(),
                status: self.status,
                reason: "refused".into(),
            })
        }
    }

    fn only_good(p: &Path) -> Result<()> {
        if fs::read(p).io_context(|| "read")? == b"good" {
            Ok(())
        } else {
            Err(Error::format(Stage::Acquire, p, "test blob", "bad bytes"))
        }
    }

    fn dl() -> Download<'static> {
        Download {
            kind: crate::cache::RELEASE_ARCHIVE,
            key: "7.2.4",
            url: "http://example.invalid/a.zip",
            stage: Stage::Acquire,
        }
    }

    #[test]
    fn retries_once_after_failed_check() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheStore::open(tmp.path()).unwrap();
        let fetcher = Flaky {
            calls: Cell::new(0),
            good_from: 2,
        };
        let got = fetch_into_cache(
            &cache,
            &fetcher,
            &CancelToken::new(),
            dl(),
            BTreeMap::new(),
            &only_good,
        )
        .unwrap();
        assert!(!got.from_cache);
        assert_eq!(fetcher.calls.get(), 2);

        let again = fetch_into_cache(
            &cache,
            &fetcher,
            &CancelToken::new(),
            dl(),
            BTreeMap::new(),
            &only_good,
        )
        .unwrap();
        assert!(again.from_cache);
        assert_eq!(fetcher.calls.get(), 2);
    }

    #[test]
    fn gives_up_after_second_failure_without_caching() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheStore::open(tmp.path()).unwrap();
        let fetcher = Flaky {
            calls: Cell::new(0),
            good_from: u32::MAX,
        };
        let err = fetch_into_cache(
            &cache,
            &fetcher,
            &CancelToken::new(),
            dl(),
            BTreeMap::new(),
            &only_good,
        )
        .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Format);
        assert_eq!(fetcher.calls.get(), 2);
        assert!(cache.get(crate::cache::RELEASE_ARCHIVE, "7.2.4").unwrap().is_none());

        let msg = err.to_string();
        assert!(msg.contains("release_archive:7.2.4"), "{msg}");
        assert!(msg.contains("http://example.invalid/a.zip"), "{msg}");
        match err {
            Error::Download {
                attempts, source, ..
            } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*source, Error::Format { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn rotted_blob_is_replaced_by_the_refetch() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheStore::open(tmp.path()).unwrap();
        let fetcher = Flaky {
            calls: Cell::new(0),
            good_from: 1,
        };
        let first = fetch_into_cache(
            &cache,
            &fetcher,
            &CancelToken::new(),
            dl(),
            BTreeMap::new(),
            &only_good,
        )
        .unwrap();
        fs::write(&first.entry.path, b"goo").unwrap();

        let again = fetch_into_cache(
            &cache,
            &fetcher,
            &CancelToken::new(),
            dl(),
            BTreeMap::new(),
            &only_good,
        )
        .unwrap();
        assert!(!again.from_cache);
        assert_eq!(fetcher.calls.get(), 2);
        assert_eq!(again.entry.path, first.entry.path);
        assert_eq!(fs::read(&again.entry.path).unwrap(), b"good");
        assert!(cache
            .validate(crate::cache::RELEASE_ARCHIVE, "7.2.4", &only_good)
            .unwrap());
    }

    #[test]
    fn client_errors_are_not_retried() {
        let tmp = TempDir::new().unwrap();
        let cache = CacheStore::open(tmp.path()).unwrap();
        let fetcher = Refused {
            calls: Cell::new(0),
            status: Some(404),
        };
        let err = fetch_into_cache(
            &cache,
            &fetcher,
            &CancelToken::new(),
            dl(),
            BTreeMap::new(),
            &only_good,
        )
        .unwrap_err();
        assert_eq!(err.class(), ErrorClass::Network);
        assert_eq!(fetcher.calls.get(), 1);
    }

    #[test]
    fn server_and_transport_errors_are_retried() {
        for status in [Some(503), None] {
            let tmp = TempDir::new().unwrap();
            let cache = CacheStore::open(tmp.path()).unwrap();
            let fetcher = Refused {
                calls: Cell::new(0),
                status,
            };
            let err = fetch_into_cache(
                &cache,
                &fetcher,
                &CancelToken::new(),
                dl(),
                BTreeMap::new(),
                &only_good,
            )
            .unwrap_err();
            assert_eq!(err.class(), ErrorClass::Network);
            assert_eq!(fetcher.calls.get(), 2, "status {status:?}");
        }
    }

    #[test]
    fn downloads_body_to_file() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("GET", "/unRAIDServer-7.2.4-x86_64.zip")
            .with_status(200)
            .with_body(b"PK\x03\x04payload")
            .expect(1)
            .create();

        let tmp = TempDir::new().unwrap();
        let dest = tmp.path().join("out.zip");
        let fetcher = HttpFetcher::new(Duration::from_secs(10)).unwrap();
        let url = format!("{}/unRAIDServer-7.2.4-x86_64.zip", server.url());
        let n = fetcher
            .fetch(&url, &dest, Stage::Acquire, &CancelToken::new())
            .unwrap();

        assert_eq!(n, 11);
        assert_eq!(fs::read(&dest).unwrap(), b"PK\x03\x04payload");
        mock.assert();
    }

    #[test]
    fn http_error_status_is_a_network_error() {
        let mut server = mockito::Server::new();
        let _mock = server.mock("GET", "/missing.tar.gz").with_status(404).create();

        let tmp = TempDir::new().unwrap();
        let fetcher = HttpFetcher::new(Duration::from_secs(10)).unwrap();
        let err = fetcher
            .fetch(
                &format!("{}/missing.tar.gz", server.url()),
                &tmp.path().join("x"),
                Stage::LocateConfig,
                &CancelToken::new(),
            )
            .unwrap_err();
        match err {
            Error::Network { status, .. } => assert_eq!(status, Some(404)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn cancelled_before_request() {
        let token = CancelToken::new();
        token.cancel();
        let tmp = TempDir::new().unwrap();
        let fetcher = HttpFetcher::new(Duration::from_secs(10)).unwrap();
        let err = fetcher
            .fetch("http://127.0.0.1:9/never", &tmp.path().join("x"), Stage::Acquire, &token)
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled(_)));
    }
}
