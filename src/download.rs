//! Streaming download sessions

use std::io::Read;
use tracing::warn;

use crate::error::{Error, Result};
use crate::storage::{GetStream, StorageOptions};
use crate::tracker::TrackerClient;

/// Read side of one blob: lazy, forward-only, single pass. Re-reading takes
/// a fresh open. Dropping it at any point releases the connection.
pub struct FileReader {
    key: String,
    inner: GetStream,
}

impl FileReader {
    /// Resolve the key and open the first reachable replica, in tracker
    /// preference order. NotFound when the key has no replicas at all;
    /// StorageUnavailable when every replica refused.
    pub fn open(tracker: &TrackerClient, key: &str, storage: &StorageOptions) -> Result<FileReader> {
        let paths = tracker.get_paths(key)?;
        for url in &paths {
            match GetStream::open(url, storage) {
                Ok(inner) => {
                    return Ok(FileReader {
                        key: key.to_string(),
                        inner,
                    })
                }
                Err(e) => {
                    warn!(url = %url, error = %e, "replica unreachable, trying next");
                }
            }
        }
        Err(Error::StorageUnavailable(key.to_string()))
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Bytes left to read, when the storage node declared a length.
    pub fn len(&self) -> Option<u64> {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}
