//! The import pipeline: dispatch → plan → validate → project → persist.
//!
//! One pre-built [Pipeline] per NZB kind, all sharing a [PipelineConfig].
//! A pipeline aborts on the first failing step of the file it is working on;
//! records already written for earlier files of the batch stay on disk (the
//! virtual filesystem tolerates orphans, and a re-import replaces them).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::config::Config;
use crate::metadata::{unix_now, MetadataStore};
use crate::nzb::{Encryption, NzbKind, ParsedFile, ParsedNzb};
use crate::pool::PoolManager;
use crate::projection::{rar, sevenzip, ArchiveFile};
use crate::proto::{self, FileMetadata, FileStatus};
use crate::validate::SegmentValidator;
use crate::vfs::UsenetFs;
use crate::Error;

pub mod paths;

/// Ceiling on one whole archive analysis.
const ANALYZE_DEADLINE: Duration = Duration::from_secs(10 * 60);

/// Everything the pipelines read at construction time.
pub struct PipelineConfig {
    pub metadata: Arc<MetadataStore>,
    pub pool: Arc<PoolManager>,
    pub max_validation_concurrency: usize,
    pub full_segment_validation: bool,
    pub max_workers: usize,
    pub max_cache_bytes: u64,
    pub allowed_file_extensions: Vec<String>,
}

impl PipelineConfig {
    pub fn new(metadata: Arc<MetadataStore>, pool: Arc<PoolManager>, config: &Config) -> Self {
        PipelineConfig {
            metadata,
            pool,
            max_validation_concurrency: config.importer.max_validation_concurrency,
            full_segment_validation: config.importer.full_segment_validation,
            max_workers: config.pool.max_workers,
            max_cache_bytes: config.pool.max_cache_bytes(),
            allowed_file_extensions: config.importer.allowed_file_extensions.clone(),
        }
    }
}

/// What a finished import produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportOutcome {
    pub virtual_dir: String,
    /// Virtual paths written, in write order.
    pub files: Vec<String>,
}

/// Routes every NZB to the pipeline built for its kind.
pub struct Importer {
    single_file: Pipeline,
    multi_file: Pipeline,
    rar_archive: Pipeline,
    sevenzip_archive: Pipeline,
}

impl Importer {
    pub fn new(config: PipelineConfig) -> Self {
        let config = Arc::new(config);
        let build = |kind| Pipeline {
            kind,
            config: config.clone(),
        };
        Importer {
            single_file: build(NzbKind::SingleFile),
            multi_file: build(NzbKind::MultiFile),
            rar_archive: build(NzbKind::RarArchive),
            sevenzip_archive: build(NzbKind::SevenZipArchive),
        }
    }

    /// Pure dispatch on the NZB kind.
    pub fn pipeline(&self, kind: NzbKind) -> &Pipeline {
        match kind {
            NzbKind::SingleFile => &self.single_file,
            NzbKind::MultiFile => &self.multi_file,
            NzbKind::RarArchive => &self.rar_archive,
            NzbKind::SevenZipArchive => &self.sevenzip_archive,
        }
    }

    /// Import one parsed NZB. `relative_dir` is the watched directory the
    /// NZB path is taken relative to when deriving the virtual directory.
    pub async fn import(
        &self,
        nzb: &ParsedNzb,
        relative_dir: &str,
    ) -> Result<ImportOutcome, Error> {
        self.pipeline(nzb.kind).run(nzb, relative_dir).await
    }
}

/// NZB files partitioned the way the pipelines consume them.
struct Partition<'a> {
    archive: Vec<&'a ParsedFile>,
    par2: Vec<&'a ParsedFile>,
    regular: Vec<&'a ParsedFile>,
}

fn partition(files: &[ParsedFile]) -> Partition<'_> {
    let mut out = Partition {
        archive: Vec::new(),
        par2: Vec::new(),
        regular: Vec::new(),
    };
    for file in files {
        if file.is_par2() {
            out.par2.push(file);
        } else if file.is_rar_archive() || file.is_7z_archive() {
            out.archive.push(file);
        } else {
            out.regular.push(file);
        }
    }
    out
}

pub struct Pipeline {
    kind: NzbKind,
    config: Arc<PipelineConfig>,
}

impl Pipeline {
    /// Run this pipeline over `nzb`. Handing a pipeline an NZB of another
    /// kind is a routing bug and fails outright.
    #[instrument(skip_all, fields(nzb = %nzb.filename, kind = ?nzb.kind))]
    pub async fn run(&self, nzb: &ParsedNzb, relative_dir: &str) -> Result<ImportOutcome, Error> {
        if nzb.kind != self.kind {
            return Err(Error::PathMatchFailed(format!(
                "{:?} nzb routed to the {:?} pipeline",
                nzb.kind, self.kind
            )));
        }
        match self.kind {
            NzbKind::SingleFile => self.import_single(nzb, relative_dir).await,
            NzbKind::MultiFile => self.import_multi(nzb, relative_dir).await,
            NzbKind::RarArchive | NzbKind::SevenZipArchive => {
                self.import_archive(nzb, relative_dir).await
            }
        }
    }

    fn validator(&self) -> SegmentValidator {
        SegmentValidator::new(
            self.config.pool.clone(),
            self.config.max_validation_concurrency,
            self.config.full_segment_validation,
        )
    }

    async fn import_single(
        &self,
        nzb: &ParsedNzb,
        relative_dir: &str,
    ) -> Result<ImportOutcome, Error> {
        let virtual_dir = paths::calc_virtual_dir(&nzb.path, relative_dir);
        self.config.metadata.ensure_dir(&virtual_dir).await?;

        let Some(file) = nzb.files.iter().find(|f| !f.is_par2()) else {
            return Err(Error::InvalidSegments {
                filename: nzb.filename.clone(),
                reason: "nzb contains no importable files".to_string(),
            });
        };

        debug!(stage = "validating", file = %file.filename);
        self.validator()
            .validate(
                &file.filename,
                file.size,
                &file.segments,
                file.encryption,
                &file.groups,
            )
            .await?;

        let mut taken = HashSet::new();
        let target = paths::join_virtual(&virtual_dir, &file.filename);
        let target = paths::reserve_path(&self.config.metadata, &mut taken, target).await?;
        self.config
            .metadata
            .write(&target, &file_record(nzb, file))
            .await?;
        info!(path = %target, "imported file");

        Ok(ImportOutcome {
            virtual_dir,
            files: vec![target],
        })
    }

    /// Virtual directory for a multi-file import: the NZB gets its own
    /// folder named after it.
    fn nzb_folder(&self, nzb: &ParsedNzb, relative_dir: &str) -> (String, String) {
        let parent = paths::calc_virtual_dir(&nzb.path, relative_dir);
        let folder = paths::nzb_folder_name(&nzb.filename, &self.config.allowed_file_extensions);
        (paths::join_virtual(&parent, &folder), folder)
    }

    async fn import_multi(
        &self,
        nzb: &ParsedNzb,
        relative_dir: &str,
    ) -> Result<ImportOutcome, Error> {
        let (virtual_dir, folder) = self.nzb_folder(nzb, relative_dir);
        let split = partition(&nzb.files);
        if split.regular.is_empty() {
            return Err(Error::InvalidSegments {
                filename: nzb.filename.clone(),
                reason: "nzb contains no importable files".to_string(),
            });
        }

        debug!(stage = "planning", files = split.regular.len(), par2 = split.par2.len());
        let placements: Vec<(&ParsedFile, String)> = split
            .regular
            .iter()
            .map(|file| {
                (
                    *file,
                    paths::place_file(&file.filename, &folder, &virtual_dir),
                )
            })
            .collect();
        self.make_dirs(&virtual_dir, placements.iter().map(|(_, p)| p.as_str()))
            .await?;

        let validator = self.validator();
        let mut taken = HashSet::new();
        let mut written = Vec::with_capacity(placements.len());
        for (file, target) in placements {
            debug!(stage = "validating", file = %file.filename);
            validator
                .validate(
                    &file.filename,
                    file.size,
                    &file.segments,
                    file.encryption,
                    &file.groups,
                )
                .await?;
            let target =
                paths::reserve_path(&self.config.metadata, &mut taken, target).await?;
            self.config
                .metadata
                .write(&target, &file_record(nzb, file))
                .await?;
            written.push(target);
        }

        info!(files = written.len(), dir = %virtual_dir, "imported nzb");
        Ok(ImportOutcome {
            virtual_dir,
            files: written,
        })
    }

    async fn import_archive(
        &self,
        nzb: &ParsedNzb,
        relative_dir: &str,
    ) -> Result<ImportOutcome, Error> {
        let (virtual_dir, folder) = self.nzb_folder(nzb, relative_dir);
        let split = partition(&nzb.files);
        if split.archive.is_empty() {
            return Err(Error::InvalidArchive(
                "nzb lists no archive part files".to_string(),
            ));
        }

        let part_files: Vec<ParsedFile> = split.archive.iter().map(|f| (*f).clone()).collect();
        let groups = part_files[0].groups.clone();
        let fs = UsenetFs::new(
            part_files.clone(),
            self.config.pool.clone(),
            self.config.max_workers,
            self.config.max_cache_bytes,
        );

        debug!(stage = "analyzing", parts = part_files.len());
        let analyze = async {
            match self.kind {
                NzbKind::RarArchive => rar::analyze(&fs, &part_files).await,
                NzbKind::SevenZipArchive => sevenzip::analyze(&fs, &part_files).await,
                _ => unreachable!("archive pipeline only built for archive kinds"),
            }
        };
        let embedded = tokio::time::timeout(ANALYZE_DEADLINE, analyze)
            .await
            .map_err(|_| Error::DeadlineExceeded("analyzing archive"))??;

        let placements: Vec<(&ArchiveFile, String)> = embedded
            .iter()
            .map(|file| {
                (
                    file,
                    paths::place_file(&file.internal_path, &folder, &virtual_dir),
                )
            })
            .collect();
        self.make_dirs(&virtual_dir, placements.iter().map(|(_, p)| p.as_str()))
            .await?;

        let validator = self.validator();
        let mut taken = HashSet::new();
        let mut written = Vec::new();
        for (file, target) in placements {
            debug!(stage = "validating", file = %file.filename);
            validator
                .validate(
                    &file.filename,
                    file.size,
                    &file.segments,
                    Encryption::None,
                    &groups,
                )
                .await?;
            let target =
                paths::reserve_path(&self.config.metadata, &mut taken, target).await?;
            self.config
                .metadata
                .write(&target, &archive_record(nzb, file))
                .await?;
            written.push(target);
        }

        // Plain files posted alongside the archive import as in a
        // multi-file nzb.
        for file in &split.regular {
            debug!(stage = "validating", file = %file.filename);
            validator
                .validate(
                    &file.filename,
                    file.size,
                    &file.segments,
                    file.encryption,
                    &file.groups,
                )
                .await?;
            let target = paths::place_file(&file.filename, &folder, &virtual_dir);
            let target =
                paths::reserve_path(&self.config.metadata, &mut taken, target).await?;
            self.config
                .metadata
                .write(&target, &file_record(nzb, file))
                .await?;
            written.push(target);
        }

        info!(files = written.len(), dir = %virtual_dir, "imported archive nzb");
        Ok(ImportOutcome {
            virtual_dir,
            files: written,
        })
    }

    /// Pre-create the virtual directories the placements land in.
    async fn make_dirs<'a>(
        &self,
        virtual_dir: &'a str,
        placements: impl Iterator<Item = &'a str>,
    ) -> Result<(), Error> {
        let mut dirs: HashSet<&str> = HashSet::new();
        dirs.insert(virtual_dir);
        for path in placements {
            if let Some((dir, _)) = path.rsplit_once('/') {
                if !dir.is_empty() {
                    dirs.insert(dir);
                }
            }
        }
        for dir in dirs {
            self.config.metadata.ensure_dir(dir).await?;
        }
        Ok(())
    }
}

fn base_record(nzb: &ParsedNzb) -> FileMetadata {
    let now = unix_now();
    FileMetadata {
        source_nzb_path: nzb.path.clone(),
        status_raw: FileStatus::Healthy as i32,
        password: nzb.password.clone().unwrap_or_default(),
        created_at: now,
        modified_at: now,
        ..Default::default()
    }
}

fn file_record(nzb: &ParsedNzb, file: &ParsedFile) -> FileMetadata {
    let mut meta = base_record(nzb);
    meta.file_size = file.size;
    meta.encryption_raw = proto::Encryption::from(file.encryption) as i32;
    if !file.password.is_empty() {
        meta.password = file.password.clone();
    }
    meta.salt = file.salt.clone();
    meta.segment_data = file.segments.iter().map(Into::into).collect();
    meta
}

fn archive_record(nzb: &ParsedNzb, file: &ArchiveFile) -> FileMetadata {
    let mut meta = base_record(nzb);
    meta.file_size = file.size;
    meta.segment_data = file.segments.iter().map(Into::into).collect();
    meta
}
