//! Construction of byte streams over segment ranges.
//!
//! A requested `[start, end]` range first maps to the sub-list of segment
//! shards holding those bytes, then each shard's article is fetched and
//! decoded in parallel while bytes are served strictly in order. The number
//! of in-flight articles is bounded both by the worker cap and by how many
//! decoded articles fit the configured cache size.

use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::AsyncReadExt;
use tokio_util::io::StreamReader;
use tracing::trace;

use crate::nzb::Segment;
use crate::pool::PoolManager;
use crate::projection;
use crate::yenc;

/// An ordered byte stream over the inclusive range `[start, end]` of the
/// file described by `segments`. Dropping the reader cancels all in-flight
/// article fetches.
pub(crate) fn range_reader(
    pool: Arc<PoolManager>,
    segments: &[Segment],
    groups: Arc<Vec<String>>,
    start: u64,
    end: u64,
    max_workers: usize,
    max_cache_bytes: u64,
) -> io::Result<Box<dyn tokio::io::AsyncRead + Send + Unpin>> {
    let length = (end + 1).saturating_sub(start);
    let (shards, _covered) =
        projection::project_range(segments, start as i64, length as i64).map_err(io::Error::from)?;

    if shards.is_empty() {
        return Ok(Box::new(std::io::Cursor::new(Vec::new())));
    }

    let workers = effective_workers(&shards, max_workers, max_cache_bytes);
    trace!(start, end, shards = shards.len(), workers, "opening range reader");

    let fetches = futures::stream::iter(shards.into_iter().map(move |shard| {
        let pool = pool.clone();
        let groups = groups.clone();
        fetch_shard(pool, groups, shard)
    }))
    .buffered(workers);

    Ok(Box::new(StreamReader::new(fetches)))
}

/// Cap parallel fetches so decoded articles held in flight stay within the
/// cache budget.
fn effective_workers(shards: &[Segment], max_workers: usize, max_cache_bytes: u64) -> usize {
    let largest = shards
        .iter()
        .map(|s| s.size.max(s.len()).max(1) as u64)
        .max()
        .unwrap_or(1);
    let by_cache = (max_cache_bytes / largest).max(1) as usize;
    max_workers.max(1).min(by_cache)
}

/// Fetch one article, decode its yEnc body and cut out the shard's payload
/// window. The pool is resolved per fetch so provider swaps are observed
/// mid-stream.
async fn fetch_shard(
    pool: Arc<PoolManager>,
    groups: Arc<Vec<String>>,
    shard: Segment,
) -> io::Result<Bytes> {
    let pool = pool.get_pool().map_err(io::Error::from)?;

    let mut body = pool.get(&shard.id, &groups).await?;
    let mut raw = Vec::with_capacity(shard.size.max(0) as usize);
    body.read_to_end(&mut raw).await?;

    let decoded = yenc::decode(&raw)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let (from, to) = (shard.start as usize, shard.end as usize);
    if decoded.len() <= to {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!(
                "article {} decoded to {} bytes, segment needs [{from}..={to}]",
                shard.id,
                decoded.len()
            ),
        ));
    }

    Ok(Bytes::copy_from_slice(&decoded[from..=to]))
}
