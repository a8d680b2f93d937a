//! Tracker metadata operations over the pooled connections
//!
//! Each operation leases a connection, does one round trip, and either
//! releases (clean response) or invalidates (transport failure) it. A
//! transport failure is retried once per configured tracker address; a
//! protocol-level rejection is surfaced immediately.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::addr::DevUrl;
use crate::codec::{self, CreateResolution};
use crate::error::{Error, Result};
use crate::pool::ConnectionPool;

pub struct TrackerClient {
    pool: Arc<ConnectionPool>,
    domain: String,
    lease_timeout: Duration,
}

impl TrackerClient {
    pub fn new(pool: Arc<ConnectionPool>, domain: String, lease_timeout: Duration) -> TrackerClient {
        TrackerClient {
            pool,
            domain,
            lease_timeout,
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Ask the tracker where to write a new blob.
    pub fn create_open(&self, key: &str, class: &str) -> Result<CreateResolution> {
        let args = self.exec(&codec::create_open(&self.domain, key, class))?;
        codec::decode_create_open(&args)
    }

    /// Commit a finished upload, making the blob visible to readers.
    pub fn create_close(
        &self,
        key: &str,
        fid: u64,
        devid: u64,
        path: &str,
        size: u64,
    ) -> Result<()> {
        self.exec(&codec::create_close(&self.domain, key, fid, devid, path, size))?;
        debug!(key, fid, size, "create_close committed");
        Ok(())
    }

    /// Resolve a key to its ranked replica locations. Unknown keys and empty
    /// path lists both surface as NotFound.
    pub fn get_paths(&self, key: &str) -> Result<Vec<DevUrl>> {
        let args = match self.exec(&codec::get_paths(&self.domain, key)) {
            Err(Error::Protocol { code, .. }) if code == "unknown_key" => {
                return Err(Error::NotFound(key.to_string()))
            }
            other => other?,
        };
        let paths = codec::decode_get_paths(&args)?;
        if paths.is_empty() {
            return Err(Error::NotFound(key.to_string()));
        }
        Ok(paths)
    }

    /// Mark a key for removal. Deleting an absent key is not an error.
    pub fn delete(&self, key: &str) -> Result<()> {
        match self.exec(&codec::delete(&self.domain, key)) {
            Err(Error::Protocol { code, .. }) if code == "unknown_key" => Ok(()),
            other => other.map(|_| ()),
        }
    }

    /// Rename a key in place. Fails with NotFound when the source is absent.
    pub fn rename(&self, from_key: &str, to_key: &str) -> Result<()> {
        match self.exec(&codec::rename(&self.domain, from_key, to_key)) {
            Err(Error::Protocol { code, .. }) if code == "unknown_key" => {
                Err(Error::NotFound(from_key.to_string()))
            }
            other => other.map(|_| ()),
        }
    }

    /// One logical operation: lease, round trip, decode. Retries transport
    /// failures across one full sweep of the configured address list.
    fn exec(&self, request: &str) -> Result<HashMap<String, String>> {
        let attempts = self.pool.addr_count().max(1);
        let mut last = None;
        for attempt in 0..attempts {
            let mut conn = self.pool.lease(self.lease_timeout)?;
            match conn.roundtrip(request) {
                Ok(line) => match codec::decode_response(&line) {
                    Ok(args) => {
                        self.pool.release(conn);
                        return Ok(args);
                    }
                    Err(e) if e.is_transport() => {
                        // Garbled line: the connection is desynced, drop it.
                        warn!(attempt, error = %e, "tracker response unusable");
                        self.pool.invalidate(conn);
                        last = Some(e);
                    }
                    Err(e) => {
                        // Application-level rejection; the connection is fine.
                        self.pool.release(conn);
                        return Err(e);
                    }
                },
                Err(io) => {
                    warn!(attempt, tracker = %conn.addr(), error = %io, "tracker round trip failed");
                    self.pool.invalidate(conn);
                    last = Some(Error::Io(io));
                }
            }
        }
        Err(match last {
            Some(e) => Error::TrackerUnavailable(e.to_string()),
            None => Error::TrackerUnavailable("no attempts made".into()),
        })
    }
}
