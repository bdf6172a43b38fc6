//! Filesystem-backed metadata store, keyed by virtual path.
//!
//! One record per virtual file at `<root>/<virtual dir>/<base>.meta`,
//! protobuf-encoded ([crate::proto::FileMetadata]). There is no index: the
//! directory tree is the directory listing, and records are self-contained,
//! so reads never consult the originating NZB.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use prost::Message;
use tokio::fs;
use tracing::instrument;
use walkdir::WalkDir;

use crate::proto::{FileMetadata, FileStatus};
use crate::Error;

const META_SUFFIX: &str = ".meta";
const TMP_SUFFIX: &str = ".meta.tmp";

/// Current time as unix seconds.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub struct MetadataStore {
    root: PathBuf,
}

impl MetadataStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        MetadataStore { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a virtual path to an on-disk path under the root. Virtual paths
    /// are POSIX-style and rooted at `/`; upward traversal is rejected.
    fn resolve(&self, virtual_path: &str) -> Result<PathBuf, Error> {
        let mut out = self.root.clone();
        for component in virtual_path.split('/') {
            match component {
                "" | "." => {}
                ".." => {
                    return Err(Error::PathMatchFailed(format!(
                        "virtual path escapes the store root: {virtual_path}"
                    )))
                }
                name => out.push(name),
            }
        }
        Ok(out)
    }

    /// The `.meta` file backing a virtual file path.
    fn record_path(&self, virtual_path: &str) -> Result<PathBuf, Error> {
        let resolved = self.resolve(virtual_path)?;
        if resolved == self.root {
            return Err(Error::PathMatchFailed(format!(
                "not a file path: {virtual_path}"
            )));
        }
        let mut name = resolved
            .file_name()
            .expect("resolved below root")
            .to_os_string();
        name.push(META_SUFFIX);
        Ok(resolved.with_file_name(name))
    }

    /// Create the on-disk directory backing a virtual directory.
    pub async fn ensure_dir(&self, virtual_dir: &str) -> Result<(), Error> {
        let path = self.resolve(virtual_dir)?;
        fs::create_dir_all(path).await?;
        Ok(())
    }

    /// Write (or replace) the record for a virtual path. The record is
    /// published with a temp-file rename, so readers never observe a torn
    /// write; the last writer wins.
    #[instrument(skip(self, meta), fields(path = virtual_path))]
    pub async fn write(&self, virtual_path: &str, meta: &FileMetadata) -> Result<(), Error> {
        let path = self.record_path(virtual_path)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut tmp = path.clone();
        tmp.set_extension(&TMP_SUFFIX[1..]);
        fs::write(&tmp, meta.encode_to_vec()).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn read(&self, virtual_path: &str) -> Result<FileMetadata, Error> {
        let path = self.record_path(virtual_path)?;
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::NotExist(virtual_path.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        FileMetadata::decode(&bytes[..])
            .map_err(|e| Error::Corrupted(format!("{virtual_path}: {e}")))
    }

    /// Idempotent: deleting an absent record is not an error.
    pub async fn delete(&self, virtual_path: &str) -> Result<(), Error> {
        let path = self.record_path(virtual_path)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn exists(&self, virtual_path: &str) -> Result<bool, Error> {
        let path = self.record_path(virtual_path)?;
        match fs::metadata(&path).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// File entries of a virtual directory, `.meta` suffix stripped, sorted.
    pub async fn list_dir(&self, virtual_path: &str) -> Result<Vec<String>, Error> {
        self.list(virtual_path, false).await
    }

    /// Immediate child directory names of a virtual directory, sorted.
    pub async fn list_subdirs(&self, virtual_path: &str) -> Result<Vec<String>, Error> {
        self.list(virtual_path, true).await
    }

    async fn list(&self, virtual_path: &str, dirs: bool) -> Result<Vec<String>, Error> {
        let path = self.resolve(virtual_path)?;
        let mut entries = match fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if dirs {
                if file_type.is_dir() {
                    out.push(name);
                }
            } else if file_type.is_file() {
                if let Some(stripped) = name.strip_suffix(META_SUFFIX) {
                    out.push(stripped.to_string());
                }
            }
        }
        out.sort();
        Ok(out)
    }

    /// Visit every record beneath the root with its reconstructed virtual
    /// path. Corrupted records abort the walk with [Error::Corrupted].
    pub fn walk(
        &self,
        mut visitor: impl FnMut(&str, FileMetadata) -> Result<(), Error>,
    ) -> Result<(), Error> {
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry = entry.map_err(|e| {
                Error::Io(e.into_io_error().unwrap_or_else(|| {
                    std::io::Error::new(std::io::ErrorKind::Other, "walk loop")
                }))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(name) = entry.file_name().to_str() else {
                continue;
            };
            let Some(base) = name.strip_suffix(META_SUFFIX) else {
                continue;
            };

            let relative = entry
                .path()
                .parent()
                .and_then(|p| p.strip_prefix(&self.root).ok())
                .unwrap_or_else(|| Path::new(""));
            let mut virtual_path = String::from("/");
            for component in relative.components() {
                virtual_path.push_str(&component.as_os_str().to_string_lossy());
                virtual_path.push('/');
            }
            virtual_path.push_str(base);

            let bytes = std::fs::read(entry.path())?;
            let meta = FileMetadata::decode(&bytes[..])
                .map_err(|e| Error::Corrupted(format!("{virtual_path}: {e}")))?;
            visitor(&virtual_path, meta)?;
        }
        Ok(())
    }

    /// Read-modify-write of the status field; bumps `modified_at`.
    pub async fn update_status(
        &self,
        virtual_path: &str,
        status: FileStatus,
    ) -> Result<(), Error> {
        let mut meta = self.read(virtual_path).await?;
        meta.status_raw = status as i32;
        meta.modified_at = unix_now();
        self.write(virtual_path, &meta).await
    }
}
