//! Mapping archive-internal byte layouts onto Usenet segment lists.
//!
//! A multi-part archive is a sequence of part files, each of which the NZB
//! already describes as an ordered segment list. The archive walkers
//! ([rar], [sevenzip]) report where each embedded file's bytes live inside
//! the parts; the projection here rewrites those byte ranges as shards of the
//! original segments, so the read path never has to understand the archive
//! format again.

use std::collections::HashMap;

use tracing::warn;

use crate::nzb::{ParsedFile, Segment};
use crate::Error;

pub mod parts;
pub mod rar;
pub mod sevenzip;
mod wire;

/// Largest tail shortfall that still gets patched rather than failing the
/// import. Usenet articles rarely exceed ~768 KiB, so a gap under this bound
/// is a single missing tail article, a recoverable NZB artefact.
pub const MAX_TAIL_GAP: i64 = 800_000;

/// Bytes `[data_offset, data_offset+length)` of one part file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Fragment {
    /// Part filename as listed in the NZB.
    pub part: String,
    pub data_offset: i64,
    pub length: i64,
}

/// One embedded file as reported by an archive walker, before projection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EmbeddedListing {
    /// Path inside the archive, forward-slashed.
    pub internal_path: String,
    /// Sum of the packed sizes of all fragments.
    pub size: i64,
    pub fragments: Vec<Fragment>,
}

/// An embedded file with its byte ranges rewritten onto the original
/// segment lists. This is what the import pipeline validates and persists.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveFile {
    pub internal_path: String,
    /// Base name only.
    pub filename: String,
    pub size: i64,
    pub segments: Vec<Segment>,
}

/// Project the byte range `[data_offset, data_offset+length)` of a part file
/// onto its ordered segment list.
///
/// Returns the emitted shards (in input order, ranges rewritten to the
/// overlap) and the number of bytes they cover. Coverage falls short of
/// `length` when the segment list itself does not span the range; see
/// [project_fragment] for the tail-patching policy.
pub fn project_range(
    segments: &[Segment],
    data_offset: i64,
    length: i64,
) -> Result<(Vec<Segment>, i64), Error> {
    if data_offset < 0 {
        return Err(Error::NegativeOffset(data_offset));
    }
    if length <= 0 {
        return Ok((Vec::new(), 0));
    }

    let target_start = data_offset;
    let target_end = data_offset + length - 1;

    let mut abs_pos = 0i64;
    let mut emitted = Vec::new();
    let mut covered = 0i64;

    for seg in segments {
        let seg_size = seg.len();
        if seg_size <= 0 {
            continue;
        }
        let seg_abs_start = abs_pos + seg.start;
        let seg_abs_end = abs_pos + seg.end;

        if seg_abs_end < target_start {
            abs_pos += seg_size;
            continue;
        }
        if seg_abs_start > target_end {
            break;
        }

        let overlap_start = seg_abs_start.max(target_start);
        let overlap_end = seg_abs_end.min(target_end);

        emitted.push(Segment {
            id: seg.id.clone(),
            start: seg.start + (overlap_start - seg_abs_start),
            end: seg.start + (overlap_end - seg_abs_start),
            size: seg.size,
        });
        covered += overlap_end - overlap_start + 1;

        if overlap_end == target_end {
            break;
        }
        abs_pos += seg_size;
    }

    Ok((emitted, covered))
}

/// [project_range] plus the tail-gap policy: a shortfall of at most
/// [MAX_TAIL_GAP] bytes (with at least one shard emitted) is patched by
/// re-appending the last shard re-ranged over the gap; anything larger is an
/// incomplete NZB.
pub fn project_fragment(
    segments: &[Segment],
    data_offset: i64,
    length: i64,
) -> Result<Vec<Segment>, Error> {
    let (mut emitted, covered) = project_range(segments, data_offset, length)?;

    if covered < length {
        let shortfall = length - covered;
        let last = emitted.last().cloned();
        match last {
            Some(last) if shortfall <= MAX_TAIL_GAP => {
                warn!(
                    shortfall,
                    data_offset, length, "patching segment tail gap with duplicate shard"
                );
                emitted.push(Segment {
                    id: last.id,
                    start: last.start,
                    end: last.start + shortfall - 1,
                    size: last.size,
                });
            }
            _ => {
                return Err(Error::IncompleteNzb {
                    expected: length,
                    got: covered,
                });
            }
        }
    }

    Ok(emitted)
}

/// Rewrite every embedded file of an archive listing onto the part files'
/// segment lists.
///
/// A fragment referencing a part missing from the NZB is logged and skipped;
/// a projected total disagreeing with the walker's declared size is logged
/// but not fatal (it surfaces NZB inconsistency without blocking the import).
pub fn project_listing(
    listing: Vec<EmbeddedListing>,
    parts: &HashMap<String, &ParsedFile>,
) -> Result<Vec<ArchiveFile>, Error> {
    let mut out = Vec::with_capacity(listing.len());

    for embedded in listing {
        let mut segments = Vec::new();
        for fragment in &embedded.fragments {
            let Some(part) = parts.get(fragment.part.as_str()) else {
                warn!(
                    part = %fragment.part,
                    file = %embedded.internal_path,
                    "fragment references a part not present in the nzb, skipping"
                );
                continue;
            };
            segments.extend(project_fragment(
                &part.segments,
                fragment.data_offset,
                fragment.length,
            )?);
        }

        let projected: i64 = segments.iter().map(Segment::len).sum();
        if projected != embedded.size {
            warn!(
                file = %embedded.internal_path,
                declared = embedded.size,
                projected,
                "projected segment total disagrees with archive headers"
            );
        }

        let filename = embedded
            .internal_path
            .rsplit('/')
            .next()
            .unwrap_or(&embedded.internal_path)
            .to_string();

        out.push(ArchiveFile {
            internal_path: embedded.internal_path,
            filename,
            size: embedded.size,
            segments,
        });
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn seg(id: &str, start: i64, end: i64) -> Segment {
        Segment {
            id: id.to_string(),
            start,
            end,
            size: end - start + 1,
        }
    }

    fn three_parts() -> Vec<Segment> {
        vec![seg("s0", 0, 999), seg("s1", 0, 999), seg("s2", 0, 499)]
    }

    #[test]
    fn full_range_returns_identical_ranges() {
        let segments = three_parts();
        let total: i64 = segments.iter().map(Segment::len).sum();

        let (emitted, covered) = project_range(&segments, 0, total).expect("project");
        assert_eq!(segments, emitted);
        assert_eq!(total, covered);
    }

    #[test]
    fn zero_length_is_empty() {
        let (emitted, covered) = project_range(&three_parts(), 100, 0).expect("project");
        assert!(emitted.is_empty());
        assert_eq!(0, covered);
    }

    #[test]
    fn negative_offset_rejected() {
        let err = project_range(&three_parts(), -1, 10).expect_err("negative");
        assert!(matches!(err, Error::NegativeOffset(-1)));
    }

    #[test]
    fn mid_range_spanning_parts() {
        // Bytes [500, 1499]: second half of s0 plus first half of s1.
        let (emitted, covered) = project_range(&three_parts(), 500, 1000).expect("project");
        assert_eq!(vec![seg_sized("s0", 500, 999), seg_sized("s1", 0, 499)], emitted);
        assert_eq!(1000, covered);
    }

    fn seg_sized(id: &str, start: i64, end: i64) -> Segment {
        // Shards keep the source segment's declared size.
        Segment {
            id: id.to_string(),
            start,
            end,
            size: 1000,
        }
    }

    #[test]
    fn abutting_boundary_emits_no_empty_shards() {
        // Range ends exactly at the s0/s1 boundary.
        let (emitted, covered) = project_range(&three_parts(), 0, 1000).expect("project");
        assert_eq!(1, emitted.len());
        assert_eq!("s0", emitted[0].id);
        assert_eq!(1000, covered);

        // Range starts exactly at the boundary.
        let (emitted, _) = project_range(&three_parts(), 1000, 1000).expect("project");
        assert_eq!(1, emitted.len());
        assert_eq!("s1", emitted[0].id);
        assert_eq!((0, 999), (emitted[0].start, emitted[0].end));
    }

    #[test]
    fn shards_keep_declared_segment_size() {
        // The size field is the declared full article size, not the shard
        // width; projection must carry it through untouched.
        let segments = vec![Segment {
            id: "s0".into(),
            start: 0,
            end: 499,
            size: 750_000,
        }];
        let (emitted, _) = project_range(&segments, 100, 100).expect("project");
        assert_eq!(
            vec![Segment {
                id: "s0".into(),
                start: 100,
                end: 199,
                size: 750_000
            }],
            emitted
        );
    }

    /// Spec'd three-part archive walk: fragments (part1, 20, 980),
    /// (part2, 0, 1000), (part3, 0, 500) must cover 2480 bytes.
    #[test]
    fn rar_fragment_tuples() {
        let p1 = vec![seg("p1", 0, 999)];
        let p2 = vec![seg("p2", 0, 999)];
        let p3 = vec![seg("p3", 0, 499)];

        let mut all = Vec::new();
        all.extend(project_fragment(&p1, 20, 980).expect("p1"));
        all.extend(project_fragment(&p2, 0, 1000).expect("p2"));
        all.extend(project_fragment(&p3, 0, 500).expect("p3"));

        assert_eq!(
            vec![seg_from("p1", 20, 999), seg_from("p2", 0, 999), seg_from("p3", 0, 499)],
            all
        );
        let total: i64 = all.iter().map(Segment::len).sum();
        assert_eq!(2480, total);
    }

    fn seg_from(id: &str, start: i64, end: i64) -> Segment {
        let size = match id {
            "p3" => 500,
            _ => 1000,
        };
        Segment {
            id: id.to_string(),
            start,
            end,
            size,
        }
    }

    #[test]
    fn tail_gap_patched_with_duplicate_shard() {
        // Fragment claims 500 bytes, segment covers only [0..199].
        let segments = vec![seg("p3", 0, 199)];
        let emitted = project_fragment(&segments, 0, 500).expect("patch");
        assert_eq!(
            vec![
                Segment {
                    id: "p3".into(),
                    start: 0,
                    end: 199,
                    size: 200
                },
                Segment {
                    id: "p3".into(),
                    start: 0,
                    end: 299,
                    size: 200
                },
            ],
            emitted
        );
        let total: i64 = emitted.iter().map(Segment::len).sum();
        assert_eq!(500, total);
    }

    #[test]
    fn shortfall_beyond_threshold_is_incomplete() {
        let segments = vec![seg("p", 0, 999)];
        let err = project_fragment(&segments, 0, 1000 + MAX_TAIL_GAP + 1).expect_err("too short");
        assert!(matches!(
            err,
            Error::IncompleteNzb {
                expected,
                got: 1000
            } if expected == 1000 + MAX_TAIL_GAP + 1
        ));
    }

    #[test]
    fn no_emitted_shards_cannot_be_patched() {
        let err = project_fragment(&[], 0, 100).expect_err("nothing to duplicate");
        assert!(matches!(err, Error::IncompleteNzb { expected: 100, got: 0 }));
    }

    #[rstest]
    #[case(0, 1)]
    #[case(2499, 1)]
    #[case(999, 1)]
    #[case(998, 2)]
    fn single_byte_and_boundary_reads(#[case] offset: i64, #[case] len: i64) {
        let (emitted, covered) = project_range(&three_parts(), offset, len).expect("project");
        assert_eq!(len, covered);
        let total: i64 = emitted.iter().map(Segment::len).sum();
        assert_eq!(len, total);
    }

    #[test]
    fn listing_projection_skips_missing_parts() {
        let part1 = ParsedFile {
            filename: "x.part1.rar".into(),
            size: 1000,
            segments: vec![seg("p1", 0, 999)],
            ..Default::default()
        };
        let parts: HashMap<String, &ParsedFile> =
            [("x.part1.rar".to_string(), &part1)].into_iter().collect();

        let listing = vec![EmbeddedListing {
            internal_path: "video/feature.mkv".into(),
            size: 1500,
            fragments: vec![
                Fragment {
                    part: "x.part1.rar".into(),
                    data_offset: 0,
                    length: 1000,
                },
                Fragment {
                    part: "x.part2.rar".into(),
                    data_offset: 0,
                    length: 500,
                },
            ],
        }];

        let files = project_listing(listing, &parts).expect("project");
        assert_eq!(1, files.len());
        assert_eq!("feature.mkv", files[0].filename);
        // Only the present part contributed; the mismatch is logged, not fatal.
        assert_eq!(1000, files[0].segments.iter().map(Segment::len).sum::<i64>());
    }
}
