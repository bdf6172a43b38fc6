//! Data model for parsed NZB manifests.
//!
//! An NZB describes logical files as ordered lists of Usenet articles
//! ("segments"). The XML parser delivering these structures is external to
//! the core; everything here is the in-memory shape the import pipeline
//! consumes. `ParsedNzb` is ephemeral and only lives for the duration of an
//! import.

use crate::projection::parts;

/// One unit of remote article storage.
///
/// `start` and `end` are inclusive byte offsets within the decoded article
/// payload this segment represents. Offsets are `i64` to match the persisted
/// protobuf encoding, so structural validation can reject negatives instead
/// of silently wrapping.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Opaque article address (Message-ID shaped).
    pub id: String,
    pub start: i64,
    pub end: i64,
    /// Declared full segment size.
    pub size: i64,
}

impl Segment {
    /// Number of payload bytes this segment contributes.
    pub fn len(&self) -> i64 {
        self.end - self.start + 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() <= 0
    }
}

/// Encryption applied to the stored bytes of a file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Encryption {
    #[default]
    None,
    Rclone,
}

/// On-remote size of a file of `plain` bytes under rclone-crypt framing:
/// a 32-byte file header plus a 16-byte authenticator per started 64 KiB
/// block.
pub fn encrypted_size(plain: i64) -> i64 {
    const HEADER: i64 = 32;
    const BLOCK: i64 = 64 * 1024;
    const OVERHEAD: i64 = 16;

    if plain <= 0 {
        return HEADER;
    }
    let blocks = (plain + BLOCK - 1) / BLOCK;
    HEADER + plain + blocks * OVERHEAD
}

/// One logical file described by the NZB.
#[derive(Clone, Debug, Default)]
pub struct ParsedFile {
    pub filename: String,
    /// Declared plaintext size.
    pub size: i64,
    pub encryption: Encryption,
    pub password: String,
    pub salt: String,
    /// Unix seconds; optional, the record does not persist it.
    pub release_date: Option<i64>,
    /// Newsgroups the articles were posted to.
    pub groups: Vec<String>,
    pub segments: Vec<Segment>,
}

impl ParsedFile {
    /// Sum of the payload bytes the segment list covers.
    pub fn segment_span(&self) -> i64 {
        self.segments.iter().map(Segment::len).sum()
    }

    /// The size the segments must add up to for a healthy file.
    pub fn expected_size(&self) -> i64 {
        match self.encryption {
            Encryption::None => self.size,
            Encryption::Rclone => encrypted_size(self.size),
        }
    }

    pub fn is_rar_archive(&self) -> bool {
        parts::rar_part_index(&self.filename).is_some()
    }

    pub fn is_7z_archive(&self) -> bool {
        parts::sevenzip_part_index(&self.filename).is_some()
    }

    pub fn is_par2(&self) -> bool {
        has_suffix_ignore_case(&self.filename, ".par2")
    }
}

/// The import pipeline dispatches on this.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NzbKind {
    SingleFile,
    MultiFile,
    RarArchive,
    SevenZipArchive,
}

/// A parsed NZB manifest, the input of one import.
#[derive(Clone, Debug)]
pub struct ParsedNzb {
    /// Origin NZB file on disk.
    pub path: String,
    pub filename: String,
    pub files: Vec<ParsedFile>,
    pub kind: NzbKind,
    pub password: Option<String>,
}

impl ParsedNzb {
    /// Classify a file set the way the NZB parser does: archive part files
    /// win over plain files, and PAR2 repair files never influence the kind.
    pub fn detect_kind(files: &[ParsedFile]) -> NzbKind {
        let mut regular = 0usize;
        let mut rar = 0usize;
        let mut sevenzip = 0usize;

        for file in files {
            if file.is_par2() {
                continue;
            }
            if file.is_rar_archive() {
                rar += 1;
            } else if file.is_7z_archive() {
                sevenzip += 1;
            } else {
                regular += 1;
            }
        }

        if rar > 0 {
            NzbKind::RarArchive
        } else if sevenzip > 0 {
            NzbKind::SevenZipArchive
        } else if regular > 1 {
            NzbKind::MultiFile
        } else {
            NzbKind::SingleFile
        }
    }
}

pub(crate) fn has_suffix_ignore_case(name: &str, suffix: &str) -> bool {
    name.len() >= suffix.len()
        && name[name.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
}
