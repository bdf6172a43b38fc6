//! Segment validation: structural checks plus remote reachability probes.

use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use tracing::{debug, instrument};

use crate::nzb::{encrypted_size, Encryption, Segment};
use crate::pool::PoolManager;
use crate::Error;

/// Per-probe deadline for a STAT round trip.
const STAT_DEADLINE: Duration = Duration::from_secs(30);
/// Probe count when sampling instead of full validation.
const SAMPLE_LIMIT: usize = 10;

/// Checks that a file's segment list is well-formed, accounts for the
/// declared size, and that its articles are actually retrievable.
///
/// The sampling policy is part of the contract: `full_validation` probes
/// every segment, otherwise up to [SAMPLE_LIMIT] are probed. Picks are
/// evenly spaced rather than random so the same NZB always probes the same
/// articles.
pub struct SegmentValidator {
    pool: Arc<PoolManager>,
    max_concurrency: usize,
    full_validation: bool,
}

impl SegmentValidator {
    pub fn new(pool: Arc<PoolManager>, max_concurrency: usize, full_validation: bool) -> Self {
        SegmentValidator {
            pool,
            max_concurrency: max_concurrency.max(1),
            full_validation,
        }
    }

    #[instrument(skip(self, segments, groups), fields(file = filename, segments = segments.len()))]
    pub async fn validate(
        &self,
        filename: &str,
        declared_size: i64,
        segments: &[Segment],
        encryption: Encryption,
        groups: &[String],
    ) -> Result<(), Error> {
        let reject = |reason: String| Error::InvalidSegments {
            filename: filename.to_string(),
            reason,
        };

        if segments.is_empty() {
            return Err(reject("empty segment list".to_string()));
        }

        let mut total: i64 = 0;
        for (i, seg) in segments.iter().enumerate() {
            if seg.id.is_empty() {
                return Err(reject(format!("segment {i} has an empty article id")));
            }
            if seg.start < 0 || seg.end < 0 {
                return Err(reject(format!("segment {i} has negative offsets")));
            }
            if seg.start > seg.end {
                return Err(reject(format!("segment {i} has start beyond end")));
            }
            if seg.size <= 0 {
                return Err(reject(format!("segment {i} has non-positive size")));
            }
            total += seg.len();
        }

        let expected = match encryption {
            Encryption::None => declared_size,
            Encryption::Rclone => encrypted_size(declared_size),
        };
        if total != expected {
            return Err(Error::IncompleteNzb {
                expected,
                got: total,
            });
        }

        let picks = self.sample(segments);
        debug!(probes = picks.len(), "probing segment reachability");

        futures::stream::iter(picks.into_iter().map(Ok))
            .try_for_each_concurrent(self.max_concurrency, |seg| async move {
                // Resolve the pool per probe, so a provider swap mid-run
                // fails this validation instead of using a stale pool.
                let pool = self.pool.get_pool()?;
                tokio::time::timeout(STAT_DEADLINE, pool.stat(&seg.id, groups))
                    .await
                    .map_err(|_| Error::DeadlineExceeded("probing segment"))?
                    .map_err(|e| Error::SegmentUnreachable {
                        id: seg.id.clone(),
                        source: e,
                    })?;
                Ok(())
            })
            .await
    }

    /// All segments under full validation, else `min(N, 10)` evenly spaced.
    fn sample<'a>(&self, segments: &'a [Segment]) -> Vec<&'a Segment> {
        let n = segments.len();
        if self.full_validation || n <= SAMPLE_LIMIT {
            return segments.iter().collect();
        }
        (0..SAMPLE_LIMIT)
            .map(|i| &segments[i * n / SAMPLE_LIMIT])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::pool::MemoryNntpPool;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn seg(id: &str, start: i64, end: i64) -> Segment {
        Segment {
            id: id.to_string(),
            start,
            end,
            size: (end - start + 1).max(1),
        }
    }

    async fn validator(
        pool: Arc<MemoryNntpPool>,
        full: bool,
    ) -> (SegmentValidator, Arc<crate::pool::PoolManager>) {
        let manager = fixtures::manager_with(pool).await;
        (SegmentValidator::new(manager.clone(), 4, full), manager)
    }

    fn seeded(count: usize) -> (Arc<MemoryNntpPool>, Vec<Segment>) {
        let pool = Arc::new(MemoryNntpPool::default());
        let segments: Vec<Segment> = (0..count)
            .map(|i| {
                let id = format!("seg-{i}@test");
                pool.put_article(&id, b"body".to_vec());
                seg(&id, 0, 99)
            })
            .collect();
        (pool, segments)
    }

    #[tokio::test]
    async fn full_validation_probes_every_segment() {
        let (pool, segments) = seeded(25);
        let (validator, _manager) = validator(pool.clone(), true).await;

        validator
            .validate("video.mkv", 2500, &segments, Encryption::None, &[])
            .await
            .expect("validate");
        assert_eq!(25, pool.stat_count());
    }

    #[tokio::test]
    async fn sampled_validation_probes_at_most_ten() {
        let (pool, segments) = seeded(25);
        let (validator, _manager) = validator(pool.clone(), false).await;

        validator
            .validate("video.mkv", 2500, &segments, Encryption::None, &[])
            .await
            .expect("validate");
        assert_eq!(10, pool.stat_count());
    }

    #[tokio::test]
    async fn small_lists_probe_everything_even_when_sampling() {
        let (pool, segments) = seeded(5);
        let (validator, _manager) = validator(pool.clone(), false).await;

        validator
            .validate("video.mkv", 500, &segments, Encryption::None, &[])
            .await
            .expect("validate");
        assert_eq!(5, pool.stat_count());
    }

    #[rstest]
    #[case(vec![], "empty segment list")]
    #[case(vec![seg("", 0, 9)], "empty article id")]
    #[case(vec![seg("a@t", -1, 9)], "negative offsets")]
    #[case(vec![Segment { id: "a@t".into(), start: 9, end: 0, size: 10 }], "start beyond end")]
    #[case(vec![Segment { id: "a@t".into(), start: 0, end: 9, size: 0 }], "non-positive size")]
    #[tokio::test]
    async fn structural_rejects(#[case] segments: Vec<Segment>, #[case] reason_part: &str) {
        let (pool, _) = seeded(0);
        let (validator, _manager) = validator(pool, true).await;

        let err = validator
            .validate("video.mkv", 10, &segments, Encryption::None, &[])
            .await
            .expect_err("reject");
        match err {
            Error::InvalidSegments { reason, .. } => assert!(
                reason.contains(reason_part),
                "{reason} should mention {reason_part}"
            ),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn size_mismatch_is_incomplete() {
        let (pool, segments) = seeded(2);
        let (validator, _manager) = validator(pool, true).await;

        let err = validator
            .validate("video.mkv", 500, &segments, Encryption::None, &[])
            .await
            .expect_err("incomplete");
        assert!(matches!(
            err,
            Error::IncompleteNzb {
                expected: 500,
                got: 200
            }
        ));
    }

    #[tokio::test]
    async fn encrypted_files_expect_encrypted_size() {
        let pool = Arc::new(MemoryNntpPool::default());
        pool.put_article("enc@test", b"body".to_vec());
        let plain = 1000i64;
        let enc_size = encrypted_size(plain);
        let segments = vec![seg("enc@test", 0, enc_size - 1)];
        let (validator, _manager) = validator(pool, true).await;

        validator
            .validate("video.bin", plain, &segments, Encryption::Rclone, &[])
            .await
            .expect("validate");
    }

    #[tokio::test]
    async fn unreachable_segment_fails() {
        let (pool, mut segments) = seeded(3);
        segments.push(seg("missing@test", 0, 99));
        let (validator, _manager) = validator(pool, true).await;

        let err = validator
            .validate("video.mkv", 400, &segments, Encryption::None, &[])
            .await
            .expect_err("unreachable");
        assert!(matches!(
            err,
            Error::SegmentUnreachable { id, .. } if id == "missing@test"
        ));
    }

    #[tokio::test]
    async fn cleared_pool_fails_validation() {
        let (pool, segments) = seeded(3);
        let (validator, manager) = validator(pool, true).await;
        manager.clear_pool().await;

        let err = validator
            .validate("video.mkv", 300, &segments, Encryption::None, &[])
            .await
            .expect_err("no pool");
        assert!(matches!(err, Error::NoPool));
    }
}
