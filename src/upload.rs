//! Streaming upload sessions
//!
//! A `FileWriter` walks OPEN -> WRITING -> COMMITTING -> DONE, or FAILED
//! from any of them. Visibility is gated solely on `create_close`: a blob
//! whose writer failed or was dropped early is never committed, so readers
//! cannot observe partial writes. Cleanup of the orphaned bytes is the
//! storage tier's job.

use std::io::{BufWriter, Write};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::codec::CreateDest;
use crate::error::{Error, Result};
use crate::storage::{PutStream, StorageOptions};
use crate::tracker::TrackerClient;

const MIN_BUF: usize = 16 * 1024;
const MAX_BUF: usize = 1024 * 1024;

/// Write side of one blob. Single-owner; implements `std::io::Write`.
pub struct FileWriter {
    tracker: Arc<TrackerClient>,
    key: String,
    fid: u64,
    dest: CreateDest,
    inner: Option<BufWriter<PutStream>>,
    written: u64,
    failed: bool,
}

impl FileWriter {
    /// Resolve destinations via `create_open` and connect to the first one
    /// that accepts, in tracker preference order.
    pub fn open(
        tracker: Arc<TrackerClient>,
        key: &str,
        class: &str,
        expected_size: u64,
        storage: &StorageOptions,
    ) -> Result<FileWriter> {
        let res = tracker.create_open(key, class)?;
        let mut chosen = None;
        for dest in res.dests {
            match PutStream::open(&dest.url, storage) {
                Ok(put) => {
                    chosen = Some((dest, put));
                    break;
                }
                Err(e) => {
                    warn!(url = %dest.url, error = %e, "write destination unreachable");
                }
            }
        }
        let (dest, put) = chosen.ok_or_else(|| Error::StorageUnavailable(key.to_string()))?;

        // expected_size is advisory: it only sizes the transport buffer.
        let cap = (expected_size.min(MAX_BUF as u64) as usize).max(MIN_BUF);
        Ok(FileWriter {
            tracker,
            key: key.to_string(),
            fid: res.fid,
            dest,
            inner: Some(BufWriter::with_capacity(cap, put)),
            written: 0,
            failed: false,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Bytes accepted so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Finish the upload: drain the buffer, terminate the PUT, and commit
    /// via `create_close`. Returns the exact byte count written.
    pub fn close(mut self) -> Result<u64> {
        if self.failed {
            return Err(Error::StorageUnavailable(self.key.clone()));
        }
        let inner = self
            .inner
            .take()
            .expect("writer closed twice");
        let put = match inner.into_inner() {
            Ok(put) => put,
            Err(e) => {
                self.failed = true;
                return Err(Error::Io(e.into_error()));
            }
        };
        if let Err(e) = put.finish() {
            self.failed = true;
            return Err(e);
        }
        self.tracker.create_close(
            &self.key,
            self.fid,
            self.dest.devid,
            self.dest.url.as_str(),
            self.written,
        )?;
        debug!(key = %self.key, bytes = self.written, "upload committed");
        Ok(self.written)
    }
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.failed {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "upload already failed",
            ));
        }
        let inner = match self.inner.as_mut() {
            Some(w) => w,
            None => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "upload already closed",
                ))
            }
        };
        match inner.write(buf) {
            Ok(n) => {
                self.written += n as u64;
                Ok(n)
            }
            Err(e) => {
                self.failed = true;
                Err(e)
            }
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.inner.as_mut() {
            Some(w) => match w.flush() {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.failed = true;
                    Err(e)
                }
            },
            None => Ok(()),
        }
    }
}

impl Drop for FileWriter {
    fn drop(&mut self) {
        // Dropping without close() aborts: the socket closes mid-body and
        // create_close is never sent, so the blob stays invisible.
        if self.inner.take().is_some() && !self.failed {
            warn!(key = %self.key, "upload dropped without close; not committed");
        }
    }
}
