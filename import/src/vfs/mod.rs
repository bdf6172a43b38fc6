//! Read-only virtual filesystem backed by the Usenet pool.
//!
//! Archive walkers expect to open part files, stat them and read/seek around
//! their bytes as if they were local. [UsenetFs] provides exactly that
//! surface over a `name -> ParsedFile` mapping: every read materializes on
//! demand from the articles the NZB references. Nothing is ever written.

use std::collections::HashMap;
use std::sync::Arc;

use crate::nzb::ParsedFile;
use crate::pool::PoolManager;
use crate::Error;

mod file;
mod reader;

pub use file::UsenetFile;

/// Stat result for a virtual file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

pub struct UsenetFs {
    files: HashMap<String, Arc<ParsedFile>>,
    pool: Arc<PoolManager>,
    max_workers: usize,
    max_cache_bytes: u64,
}

impl UsenetFs {
    pub fn new(
        files: impl IntoIterator<Item = ParsedFile>,
        pool: Arc<PoolManager>,
        max_workers: usize,
        max_cache_bytes: u64,
    ) -> Self {
        UsenetFs {
            files: files
                .into_iter()
                .map(|f| (f.filename.clone(), Arc::new(f)))
                .collect(),
            pool,
            max_workers,
            max_cache_bytes,
        }
    }

    /// Open a handle whose logical size is the file's declared size.
    pub fn open(&self, name: &str) -> Result<UsenetFile, Error> {
        match self.files.get(name) {
            Some(file) => Ok(self.open_parsed(file.clone())),
            None => Err(Error::NotExist(name.to_string())),
        }
    }

    pub fn stat(&self, name: &str) -> Result<FileInfo, Error> {
        match self.files.get(name) {
            Some(file) => Ok(FileInfo {
                name: file.filename.clone(),
                size: file.size.max(0) as u64,
            }),
            None => Err(Error::NotExist(name.to_string())),
        }
    }

    /// Open a handle for a file that is not part of the mapping (the 7-Zip
    /// walker synthesizes one concatenated file over all volumes).
    pub(crate) fn open_parsed(&self, file: Arc<ParsedFile>) -> UsenetFile {
        UsenetFile::new(
            file,
            self.pool.clone(),
            self.max_workers,
            self.max_cache_bytes,
        )
    }

    /// Any mutation of the virtual filesystem.
    pub fn create(&self, _name: &str) -> Result<UsenetFile, Error> {
        Err(Error::ReadOnly)
    }

    pub fn remove(&self, _name: &str) -> Result<(), Error> {
        Err(Error::ReadOnly)
    }
}
