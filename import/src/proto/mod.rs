//! Persisted metadata wire types.
//!
//! These mirror `protos/metadata.proto` field for field. The `prost::Message`
//! derives are written out by hand instead of running `prost-build`, so the
//! build does not need a protoc binary; the encoding is identical.

use crate::nzb;

/// Lifecycle status of a metadata record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum FileStatus {
    Healthy = 0,
    Partial = 1,
    Corrupted = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Encryption {
    None = 0,
    Rclone = 1,
}

/// One remote article range contributing bytes to the virtual file.
#[derive(Clone, PartialEq, prost::Message)]
pub struct SegmentData {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(int64, tag = "2")]
    pub start: i64,
    #[prost(int64, tag = "3")]
    pub end: i64,
    #[prost(int64, tag = "4")]
    pub size: i64,
}

/// The authoritative record a read path consumes.
#[derive(Clone, PartialEq, prost::Message)]
pub struct FileMetadata {
    #[prost(int64, tag = "1")]
    pub file_size: i64,
    #[prost(string, tag = "2")]
    pub source_nzb_path: String,
    #[prost(enumeration = "FileStatus", tag = "3")]
    pub status_raw: i32,
    #[prost(string, tag = "4")]
    pub password: String,
    #[prost(string, tag = "5")]
    pub salt: String,
    #[prost(enumeration = "Encryption", tag = "6")]
    pub encryption_raw: i32,
    #[prost(message, repeated, tag = "7")]
    pub segment_data: Vec<SegmentData>,
    /// Unix seconds.
    #[prost(int64, tag = "8")]
    pub created_at: i64,
    #[prost(int64, tag = "9")]
    pub modified_at: i64,
}

impl FileMetadata {
    /// Sum of the payload bytes the persisted segments cover.
    pub fn segment_span(&self) -> i64 {
        self.segment_data
            .iter()
            .map(|s| s.end - s.start + 1)
            .sum()
    }

    pub fn status(&self) -> FileStatus {
        FileStatus::try_from(self.status_raw).unwrap_or(FileStatus::Corrupted)
    }

    pub fn encryption(&self) -> Encryption {
        Encryption::try_from(self.encryption_raw).unwrap_or(Encryption::None)
    }
}

impl From<&nzb::Segment> for SegmentData {
    fn from(value: &nzb::Segment) -> Self {
        SegmentData {
            id: value.id.clone(),
            start: value.start,
            end: value.end,
            size: value.size,
        }
    }
}

impl From<&SegmentData> for nzb::Segment {
    fn from(value: &SegmentData) -> Self {
        nzb::Segment {
            id: value.id.clone(),
            start: value.start,
            end: value.end,
            size: value.size,
        }
    }
}

impl From<nzb::Encryption> for Encryption {
    fn from(value: nzb::Encryption) -> Self {
        match value {
            nzb::Encryption::None => Encryption::None,
            nzb::Encryption::Rclone => Encryption::Rclone,
        }
    }
}
