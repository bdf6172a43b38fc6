//! The virtual file handle.

use std::io::{self, SeekFrom};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use futures::ready;
use tokio::io::AsyncReadExt;
use tracing::instrument;

use crate::nzb::ParsedFile;
use crate::pool::PoolManager;
use crate::Error;

use super::reader::range_reader;

/// Upper bound on a single [UsenetFile::read_at] call. A pathologically slow
/// article must not wedge an archive analysis forever.
const READ_AT_DEADLINE: Duration = Duration::from_secs(5 * 60);

/// A read-only, seekable handle over one virtual file.
///
/// Sequential reads share one lazily-created stream which is torn down on any
/// position change. [UsenetFile::read_at] never touches that stream or the
/// cursor: it opens an independent bounded stream per call, so concurrent
/// `read_at`s for different offsets are safe.
pub struct UsenetFile {
    file: Arc<ParsedFile>,
    groups: Arc<Vec<String>>,
    pool: Arc<PoolManager>,
    max_workers: usize,
    max_cache_bytes: u64,

    pos: u64,
    reader: Option<Box<dyn tokio::io::AsyncRead + Send + Unpin>>,
    closed: AtomicBool,
}

impl UsenetFile {
    pub(crate) fn new(
        file: Arc<ParsedFile>,
        pool: Arc<PoolManager>,
        max_workers: usize,
        max_cache_bytes: u64,
    ) -> Self {
        let groups = Arc::new(file.groups.clone());
        UsenetFile {
            file,
            groups,
            pool,
            max_workers,
            max_cache_bytes,
            pos: 0,
            reader: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Logical size: the declared size from the NZB.
    pub fn size(&self) -> u64 {
        self.file.size.max(0) as u64
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Idempotent; every later read or seek fails with [Error::ClosedFile].
    pub fn close(&mut self) {
        self.closed.store(true, Ordering::Release);
        self.reader = None;
    }

    /// Read up to `buf.len()` bytes at `offset` without moving the cursor.
    ///
    /// Reads past EOF return `Ok(0)`; reads spanning EOF truncate. The whole
    /// call runs under a five-minute deadline.
    #[instrument(skip(self, buf), fields(file = %self.file.filename, len = buf.len()))]
    pub async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, Error> {
        if self.is_closed() {
            return Err(Error::ClosedFile);
        }
        let size = self.size();
        if buf.is_empty() || offset >= size {
            return Ok(0);
        }

        let end = (offset + buf.len() as u64).min(size) - 1;
        let n = (end + 1 - offset) as usize;

        let mut reader = range_reader(
            self.pool.clone(),
            &self.file.segments,
            self.groups.clone(),
            offset,
            end,
            self.max_workers,
            self.max_cache_bytes,
        )?;

        tokio::time::timeout(READ_AT_DEADLINE, reader.read_exact(&mut buf[..n]))
            .await
            .map_err(|_| Error::DeadlineExceeded("reading byte range"))??;
        Ok(n)
    }
}

impl tokio::io::AsyncRead for UsenetFile {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.is_closed() {
            return Poll::Ready(Err(Error::ClosedFile.into()));
        }

        let size = this.size();
        if this.pos >= size {
            return Poll::Ready(Ok(()));
        }

        if this.reader.is_none() {
            this.reader = Some(range_reader(
                this.pool.clone(),
                &this.file.segments,
                this.groups.clone(),
                this.pos,
                size - 1,
                this.max_workers,
                this.max_cache_bytes,
            )?);
        }

        let filled_before = buf.filled().len();
        let reader = this.reader.as_mut().expect("reader just created");
        ready!(Pin::new(reader).poll_read(cx, buf))?;
        this.pos += (buf.filled().len() - filled_before) as u64;
        Poll::Ready(Ok(()))
    }
}

impl tokio::io::AsyncSeek for UsenetFile {
    fn start_seek(self: Pin<&mut Self>, position: SeekFrom) -> io::Result<()> {
        let this = self.get_mut();
        if this.is_closed() {
            return Err(Error::ClosedFile.into());
        }

        let size = this.size();
        let absolute = match position {
            SeekFrom::Start(from_start) => Some(from_start),
            SeekFrom::End(from_end) => size.checked_add_signed(from_end),
            SeekFrom::Current(from_current) => this.pos.checked_add_signed(from_current),
        }
        .ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "over/underflow while seeking")
        })?;

        if absolute != this.pos {
            if absolute > size {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "seeked beyond EOF",
                ));
            }
            // Position changed: the next read reopens at the new offset.
            this.pos = absolute;
            this.reader = None;
        }
        Ok(())
    }

    fn poll_complete(self: Pin<&mut Self>, _cx: &mut std::task::Context<'_>) -> Poll<io::Result<u64>> {
        Poll::Ready(Ok(self.pos))
    }
}
