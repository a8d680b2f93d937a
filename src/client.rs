//! Public client surface
//!
//! `MogileFs` is the capability interface (create, read, delete, rename);
//! `PooledMogile` is the one concrete implementation, built on a bounded
//! tracker connection pool. Alternate implementations (for example a
//! non-pooled direct client) would slot in behind the same trait.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::addr::TrackerAddress;
use crate::download::FileReader;
use crate::error::{Error, Result};
use crate::pool::{ConnectionPool, PoolOptions};
use crate::storage::StorageOptions;
use crate::tracker::TrackerClient;
use crate::upload::FileWriter;

const COPY_BUF: usize = 256 * 1024;

/// Client capability interface. Object safe; sessions returned by it are
/// single-owner and not shared across threads.
pub trait MogileFs: Send + Sync {
    /// Start a new blob under `key`. `expected_size` is advisory only.
    fn new_file(&self, key: &str, class: &str, expected_size: u64) -> Result<FileWriter>;

    /// Open the blob for reading. NotFound when the key does not resolve.
    fn get_file_stream(&self, key: &str) -> Result<FileReader>;

    /// Remove the key. Idempotent: deleting an absent key succeeds.
    fn delete(&self, key: &str) -> Result<()>;

    /// Rename `from` to `to` within the domain.
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Upload a local file under `key`. Returns the byte count stored.
    fn store_file(&self, key: &str, class: &str, path: &Path) -> Result<u64> {
        let src = File::open(path)?;
        let len = src.metadata().map(|m| m.len()).unwrap_or(0);
        let mut reader = BufReader::new(src);
        let mut writer = self.new_file(key, class, len)?;
        io::copy(&mut reader, &mut writer)?;
        writer.close()
    }

    /// Download the blob into a local file. Returns the byte count fetched.
    fn fetch_file(&self, key: &str, path: &Path) -> Result<u64> {
        let mut reader = self.get_file_stream(key)?;
        let mut writer = BufWriter::with_capacity(COPY_BUF, File::create(path)?);
        let n = io::copy(&mut reader, &mut writer)?;
        writer.flush()?;
        Ok(n)
    }
}

/// Construction knobs. `Default` matches a small single-host cluster; every
/// field can be overridden before `PooledMogile::with_options`.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Namespace for every key this client touches.
    pub domain: String,
    /// Tracker endpoints; list order is the failover order.
    pub trackers: Vec<TrackerAddress>,
    /// Read/write timeout on every socket. `None` disables timeouts.
    pub sock_timeout: Option<Duration>,
    /// Hard bound on simultaneously live tracker connections.
    pub max_conns: usize,
    /// Tracker connections opened eagerly at construction, best effort.
    pub min_warm: usize,
    /// Idle tracker connections older than this are reclaimed lazily.
    pub idle_expiry: Duration,
    /// How long an operation may block waiting for a pooled connection.
    pub lease_timeout: Duration,
    /// Per-address TCP connect timeout.
    pub connect_timeout: Duration,
}

impl ClientOptions {
    pub fn new(domain: impl Into<String>, trackers: Vec<TrackerAddress>) -> ClientOptions {
        ClientOptions {
            domain: domain.into(),
            trackers,
            sock_timeout: Some(Duration::from_secs(30)),
            max_conns: 10,
            min_warm: 0,
            idle_expiry: Duration::from_secs(10),
            lease_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

/// The pooled client: one connection pool, one domain, shared freely across
/// threads (typically behind an `Arc`).
pub struct PooledMogile {
    tracker: Arc<TrackerClient>,
    storage: StorageOptions,
}

impl PooledMogile {
    /// Convenience constructor from `host:port` strings and defaults.
    pub fn connect(domain: &str, trackers: &[&str]) -> Result<PooledMogile> {
        let mut addrs = Vec::with_capacity(trackers.len());
        for t in trackers {
            addrs.push(
                TrackerAddress::parse(t)
                    .ok_or_else(|| Error::Config(format!("bad tracker address {:?}", t)))?,
            );
        }
        PooledMogile::with_options(ClientOptions::new(domain, addrs))
    }

    pub fn with_options(opts: ClientOptions) -> Result<PooledMogile> {
        if opts.domain.is_empty() {
            return Err(Error::Config("domain must not be empty".into()));
        }
        let pool = Arc::new(ConnectionPool::new(
            opts.trackers.clone(),
            PoolOptions {
                max_conns: opts.max_conns,
                min_warm: opts.min_warm,
                idle_expiry: opts.idle_expiry,
                sock_timeout: opts.sock_timeout,
                connect_timeout: opts.connect_timeout,
            },
        )?);
        debug!(domain = %opts.domain, trackers = opts.trackers.len(), "client ready");
        Ok(PooledMogile {
            tracker: Arc::new(TrackerClient::new(pool, opts.domain, opts.lease_timeout)),
            storage: StorageOptions {
                sock_timeout: opts.sock_timeout,
                connect_timeout: opts.connect_timeout,
            },
        })
    }

    pub fn domain(&self) -> &str {
        self.tracker.domain()
    }
}

impl MogileFs for PooledMogile {
    fn new_file(&self, key: &str, class: &str, expected_size: u64) -> Result<FileWriter> {
        FileWriter::open(
            Arc::clone(&self.tracker),
            key,
            class,
            expected_size,
            &self.storage,
        )
    }

    fn get_file_stream(&self, key: &str) -> Result<FileReader> {
        FileReader::open(&self.tracker, key, &self.storage)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.tracker.delete(key)
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.tracker.rename(from, to)
    }
}
