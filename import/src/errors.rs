use thiserror::Error;

/// Errors surfaced by the import core.
///
/// Per-file errors abort the pipeline of the file they occurred in; callers
/// decide whether to continue with the remaining files of a batch.
#[derive(Debug, Error)]
pub enum Error {
    /// No pool is configured right now. Callers retry after providers change.
    #[error("no usenet connection pool available")]
    NoPool,

    /// The requested name is not part of the virtual filesystem mapping.
    #[error("virtual file does not exist: {0}")]
    NotExist(String),

    /// Operation on a handle after [crate::vfs::UsenetFile::close].
    #[error("virtual file handle is closed")]
    ClosedFile,

    /// Write access to the virtual filesystem.
    #[error("virtual filesystem is read-only")]
    ReadOnly,

    #[error("deadline exceeded while {0}")]
    DeadlineExceeded(&'static str),

    /// The segment list cannot account for the declared file size.
    #[error("incomplete nzb: expected {expected} bytes, segments cover {got}")]
    IncompleteNzb { expected: i64, got: i64 },

    /// A reachability probe failed for the given article.
    #[error("segment {id} unreachable: {source}")]
    SegmentUnreachable {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("path mapping failed: {0}")]
    PathMatchFailed(String),

    /// First part undetected, zero files, or compressed/encrypted content.
    #[error("invalid archive: {0}")]
    InvalidArchive(String),

    /// A persisted metadata record failed to unmarshal.
    #[error("corrupted metadata record: {0}")]
    Corrupted(String),

    #[error("negative offset: {0}")]
    NegativeOffset(i64),

    /// A segment failed the structural scan before any remote probe ran.
    #[error("invalid segment list for {filename}: {reason}")]
    InvalidSegments { filename: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        use std::io::ErrorKind;

        match value {
            Error::NotExist(_) => Self::new(ErrorKind::NotFound, value),
            Error::ClosedFile => Self::new(ErrorKind::NotConnected, value),
            Error::ReadOnly => Self::new(ErrorKind::PermissionDenied, value),
            Error::DeadlineExceeded(_) => Self::new(ErrorKind::TimedOut, value),
            Error::NegativeOffset(_) => Self::new(ErrorKind::InvalidInput, value),
            Error::Io(e) => e,
            _ => Self::new(ErrorKind::Other, value),
        }
    }
}
