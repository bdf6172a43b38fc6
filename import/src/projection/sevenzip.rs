//! Store-only 7-Zip archive walker.
//!
//! Multi-volume `.7z.NNN` sets are plain byte concatenations of one archive
//! stream, so the walker synthesizes a single concatenated file over all
//! volumes, reads the end header through [UsenetFile::read_at], and projects
//! each stored file's pack range straight onto the combined segment list.
//! Folders must use the copy codec; anything else (compression, AES) is
//! rejected because the read path serves raw segment bytes.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::nzb::{ParsedFile, Segment};
use crate::vfs::UsenetFs;
use crate::Error;

use super::wire::HeaderReader;
use super::{parts, project_fragment, ArchiveFile};

const SIGNATURE: [u8; 6] = [0x37, 0x7a, 0xbc, 0xaf, 0x27, 0x1c];
const SIG_HEADER_LEN: u64 = 32;

const K_END: u64 = 0x00;
const K_HEADER: u64 = 0x01;
const K_ARCHIVE_PROPERTIES: u64 = 0x02;
const K_MAIN_STREAMS_INFO: u64 = 0x04;
const K_FILES_INFO: u64 = 0x05;
const K_PACK_INFO: u64 = 0x06;
const K_UNPACK_INFO: u64 = 0x07;
const K_SUBSTREAMS_INFO: u64 = 0x08;
const K_SIZE: u64 = 0x09;
const K_CRC: u64 = 0x0a;
const K_FOLDER: u64 = 0x0b;
const K_CODERS_UNPACK_SIZE: u64 = 0x0c;
const K_NUM_UNPACK_STREAM: u64 = 0x0d;
const K_EMPTY_STREAM: u64 = 0x0e;
const K_NAME: u64 = 0x11;
const K_ENCODED_HEADER: u64 = 0x17;

/// Pack layout of the archive: copy-codec folders, one pack stream each.
#[derive(Debug, Default)]
struct StreamsInfo {
    pack_pos: u64,
    pack_sizes: Vec<u64>,
    /// Unpacked (== packed, copy codec) size per folder.
    folder_sizes: Vec<u64>,
    folder_crc_defined: Vec<bool>,
    /// Substreams per folder; absent means one per folder.
    substream_counts: Option<Vec<u64>>,
    /// Explicit substream sizes (all but the last of each folder).
    substream_sizes: Vec<u64>,
}

#[derive(Debug, Default)]
struct FilesInfo {
    /// Per file: true when the file carries no stream (directories, empties).
    empty_stream: Vec<bool>,
    names: Vec<String>,
}

/// Analyze a (multi-volume) 7-Zip archive and return each stored file with
/// its byte range projected onto the volumes' combined segment list.
#[instrument(skip_all, fields(volumes = files.len()))]
pub async fn analyze(fs: &UsenetFs, files: &[ParsedFile]) -> Result<Vec<ArchiveFile>, Error> {
    if files.is_empty() {
        return Err(Error::InvalidArchive("no volume files".to_string()));
    }

    let mut ordered: Vec<&ParsedFile> = files.iter().collect();
    ordered.sort_by(|a, b| {
        let ka = parts::sevenzip_part_index(&a.filename).unwrap_or(usize::MAX);
        let kb = parts::sevenzip_part_index(&b.filename).unwrap_or(usize::MAX);
        ka.cmp(&kb).then_with(|| a.filename.cmp(&b.filename))
    });

    let combined = Arc::new(ParsedFile {
        filename: ordered[0].filename.clone(),
        size: ordered.iter().map(|f| f.size).sum(),
        groups: ordered[0].groups.clone(),
        segments: ordered
            .iter()
            .flat_map(|f| f.segments.iter().cloned())
            .collect(),
        ..Default::default()
    });
    debug!(stream_size = combined.size, "walking 7z volumes");

    let handle = fs.open_parsed(combined.clone());

    let mut sig = [0u8; SIG_HEADER_LEN as usize];
    if handle.read_at(&mut sig, 0).await? != sig.len() {
        return Err(Error::InvalidArchive("stream too short for a signature".to_string()));
    }
    let mut r = HeaderReader::new(&sig);
    if r.take(6)? != SIGNATURE {
        return Err(Error::InvalidArchive("not a 7z signature".to_string()));
    }
    r.skip(2)?; // format version
    r.u32_le()?; // start header crc, unchecked
    let next_header_offset = r.u64_le()?;
    let next_header_size = r.u64_le()?;

    if next_header_size == 0 {
        return Err(Error::InvalidArchive("archive contains no files".to_string()));
    }
    let stream_len = combined.size.max(0) as u64;
    if SIG_HEADER_LEN + next_header_offset + next_header_size > stream_len {
        return Err(Error::InvalidArchive("end header outside the stream".to_string()));
    }

    let mut header = vec![0u8; next_header_size as usize];
    handle
        .read_at(&mut header, SIG_HEADER_LEN + next_header_offset)
        .await?;

    let mut r = HeaderReader::new(&header);
    let (streams, files_info) = match r.sz_number()? {
        K_HEADER => parse_header(&mut r)?,
        K_ENCODED_HEADER => {
            // The header itself sits in a pack stream. Only a copy-codec
            // packing can be unwrapped without decompression.
            let streams = parse_streams_info(&mut r)?;
            let packed_len: u64 = streams.pack_sizes.iter().sum();
            let mut packed = vec![0u8; packed_len as usize];
            handle
                .read_at(&mut packed, SIG_HEADER_LEN + streams.pack_pos)
                .await?;
            let mut r = HeaderReader::new(&packed);
            if r.sz_number()? != K_HEADER {
                return Err(Error::InvalidArchive("malformed packed header".to_string()));
            }
            parse_header(&mut r)?
        }
        _ => return Err(Error::InvalidArchive("unrecognized end header".to_string())),
    };

    assemble(&combined, streams, files_info)
}

/// Turn the parsed layout into projected files.
fn assemble(
    combined: &ParsedFile,
    streams: StreamsInfo,
    files_info: FilesInfo,
) -> Result<Vec<ArchiveFile>, Error> {
    let folders = streams.folder_sizes.len();
    if streams.pack_sizes.len() != folders {
        return Err(Error::InvalidArchive(
            "pack stream / folder count mismatch".to_string(),
        ));
    }

    let counts = streams
        .substream_counts
        .clone()
        .unwrap_or_else(|| vec![1; folders]);
    if counts.len() != folders {
        return Err(Error::InvalidArchive("substream count mismatch".to_string()));
    }

    // Names of files that actually carry data, in archive order.
    let named: Vec<&String> = files_info
        .names
        .iter()
        .zip(files_info.empty_stream.iter())
        .filter(|(_, empty)| !**empty)
        .map(|(name, _)| name)
        .collect();

    let total_substreams: u64 = counts.iter().sum();
    if named.len() as u64 != total_substreams {
        return Err(Error::InvalidArchive(format!(
            "{} named streams but {} substreams",
            named.len(),
            total_substreams
        )));
    }
    if named.is_empty() {
        return Err(Error::InvalidArchive("archive contains no files".to_string()));
    }

    let mut out = Vec::with_capacity(named.len());
    let mut explicit = streams.substream_sizes.iter();
    let mut named_iter = named.into_iter();
    let mut folder_base = SIG_HEADER_LEN + streams.pack_pos;

    for f in 0..folders {
        let count = counts[f];
        let mut offset = folder_base;
        let mut remaining = streams.folder_sizes[f];

        for k in 0..count {
            let size = if k + 1 == count {
                remaining
            } else {
                let s = *explicit.next().ok_or_else(|| {
                    Error::InvalidArchive("missing substream size".to_string())
                })?;
                if s > remaining {
                    return Err(Error::InvalidArchive("substream sizes exceed folder".to_string()));
                }
                s
            };

            let internal_path = named_iter.next().expect("counted above").clone();
            let segments =
                project_fragment(&combined.segments, offset as i64, size as i64)?;
            let projected: i64 = segments.iter().map(Segment::len).sum();
            if projected != size as i64 {
                warn!(
                    file = %internal_path,
                    declared = size,
                    projected,
                    "projected segment total disagrees with archive headers"
                );
            }
            let filename = internal_path
                .rsplit('/')
                .next()
                .unwrap_or(&internal_path)
                .to_string();
            out.push(ArchiveFile {
                internal_path,
                filename,
                size: size as i64,
                segments,
            });

            offset += size;
            remaining -= size;
        }

        folder_base += streams.pack_sizes[f];
    }

    Ok(out)
}

/// `kHeader`: main streams info plus files info.
fn parse_header(r: &mut HeaderReader<'_>) -> Result<(StreamsInfo, FilesInfo), Error> {
    let mut streams = StreamsInfo::default();
    let mut files = FilesInfo::default();

    loop {
        match r.sz_number()? {
            K_END => break,
            K_ARCHIVE_PROPERTIES => loop {
                let prop = r.sz_number()?;
                if prop == K_END {
                    break;
                }
                let size = r.sz_number()? as usize;
                r.skip(size)?;
            },
            K_MAIN_STREAMS_INFO => streams = parse_streams_info(r)?,
            K_FILES_INFO => files = parse_files_info(r)?,
            other => {
                return Err(Error::InvalidArchive(format!(
                    "unsupported header property {other:#x}"
                )))
            }
        }
    }

    Ok((streams, files))
}

fn parse_streams_info(r: &mut HeaderReader<'_>) -> Result<StreamsInfo, Error> {
    let mut info = StreamsInfo::default();

    loop {
        match r.sz_number()? {
            K_END => break,
            K_PACK_INFO => {
                info.pack_pos = r.sz_number()?;
                let num_pack = r.sz_number()? as usize;
                loop {
                    match r.sz_number()? {
                        K_END => break,
                        K_SIZE => {
                            info.pack_sizes = (0..num_pack)
                                .map(|_| r.sz_number())
                                .collect::<Result<_, _>>()?;
                        }
                        K_CRC => skip_crcs(r, num_pack)?,
                        other => {
                            return Err(Error::InvalidArchive(format!(
                                "unsupported pack info property {other:#x}"
                            )))
                        }
                    }
                }
            }
            K_UNPACK_INFO => parse_unpack_info(r, &mut info)?,
            K_SUBSTREAMS_INFO => parse_substreams_info(r, &mut info)?,
            other => {
                return Err(Error::InvalidArchive(format!(
                    "unsupported streams info property {other:#x}"
                )))
            }
        }
    }

    Ok(info)
}

fn parse_unpack_info(r: &mut HeaderReader<'_>, info: &mut StreamsInfo) -> Result<(), Error> {
    if r.sz_number()? != K_FOLDER {
        return Err(Error::InvalidArchive("missing folder property".to_string()));
    }
    let num_folders = r.sz_number()? as usize;
    if r.u8()? != 0 {
        return Err(Error::InvalidArchive("external folder data".to_string()));
    }

    for _ in 0..num_folders {
        parse_copy_folder(r)?;
    }

    loop {
        match r.sz_number()? {
            K_END => break,
            K_CODERS_UNPACK_SIZE => {
                // One coder with one output stream per folder.
                info.folder_sizes = (0..num_folders)
                    .map(|_| r.sz_number())
                    .collect::<Result<_, _>>()?;
            }
            K_CRC => {
                info.folder_crc_defined = read_crc_defined(r, num_folders)?;
            }
            other => {
                return Err(Error::InvalidArchive(format!(
                    "unsupported unpack info property {other:#x}"
                )))
            }
        }
    }

    if info.folder_crc_defined.is_empty() {
        info.folder_crc_defined = vec![false; num_folders];
    }
    Ok(())
}

/// A folder must hold exactly one simple coder, and that coder must be the
/// copy codec (id 0x00).
fn parse_copy_folder(r: &mut HeaderReader<'_>) -> Result<(), Error> {
    let num_coders = r.sz_number()?;
    if num_coders != 1 {
        return Err(Error::InvalidArchive(format!(
            "folder with {num_coders} coders (compressed or encrypted)"
        )));
    }

    let flags = r.u8()?;
    let id_size = (flags & 0x0f) as usize;
    let is_complex = flags & 0x10 != 0;
    let has_attributes = flags & 0x20 != 0;

    let id = r.take(id_size)?;
    if is_complex || id != [0x00] {
        return Err(Error::InvalidArchive(format!(
            "unsupported coder {id:02x?} (compressed or encrypted)"
        )));
    }
    if has_attributes {
        let size = r.sz_number()? as usize;
        r.skip(size)?;
    }
    Ok(())
}

fn parse_substreams_info(r: &mut HeaderReader<'_>, info: &mut StreamsInfo) -> Result<(), Error> {
    loop {
        match r.sz_number()? {
            K_END => break,
            K_NUM_UNPACK_STREAM => {
                let counts: Vec<u64> = (0..info.folder_sizes.len())
                    .map(|_| r.sz_number())
                    .collect::<Result<_, _>>()?;
                info.substream_counts = Some(counts);
            }
            K_SIZE => {
                // All substream sizes except the last of each folder; that
                // one is implied by the folder size.
                let counts = info
                    .substream_counts
                    .clone()
                    .unwrap_or_else(|| vec![1; info.folder_sizes.len()]);
                let explicit: usize = counts.iter().map(|c| (*c as usize).saturating_sub(1)).sum();
                info.substream_sizes = (0..explicit)
                    .map(|_| r.sz_number())
                    .collect::<Result<_, _>>()?;
            }
            K_CRC => {
                let counts = info
                    .substream_counts
                    .clone()
                    .unwrap_or_else(|| vec![1; info.folder_sizes.len()]);
                // Digests cover substreams whose folder CRC is not already
                // known (single-substream folders with a defined CRC).
                let digests: usize = counts
                    .iter()
                    .zip(info.folder_crc_defined.iter().chain(std::iter::repeat(&false)))
                    .map(|(count, defined)| {
                        if *count == 1 && *defined {
                            0
                        } else {
                            *count as usize
                        }
                    })
                    .sum();
                skip_crcs(r, digests)?;
            }
            other => {
                return Err(Error::InvalidArchive(format!(
                    "unsupported substreams property {other:#x}"
                )))
            }
        }
    }
    Ok(())
}

fn parse_files_info(r: &mut HeaderReader<'_>) -> Result<FilesInfo, Error> {
    let num_files = r.sz_number()? as usize;
    let mut info = FilesInfo {
        empty_stream: vec![false; num_files],
        names: Vec::new(),
    };

    loop {
        let id = r.sz_number()?;
        if id == K_END {
            break;
        }
        let size = r.sz_number()? as usize;
        let mut prop = HeaderReader::new(r.take(size)?);

        match id {
            K_EMPTY_STREAM => info.empty_stream = prop.bit_vector(num_files)?,
            K_NAME => {
                if prop.u8()? != 0 {
                    return Err(Error::InvalidArchive("external file names".to_string()));
                }
                info.names = parse_utf16_names(prop.take(prop.remaining())?)?;
                if info.names.len() != num_files {
                    return Err(Error::InvalidArchive("file name count mismatch".to_string()));
                }
            }
            // Timestamps, attributes, empty-file markers and the like.
            _ => {}
        }
    }

    Ok(info)
}

/// NUL-terminated UTF-16LE names, back to back.
fn parse_utf16_names(raw: &[u8]) -> Result<Vec<String>, Error> {
    if raw.len() % 2 != 0 {
        return Err(Error::InvalidArchive("odd utf-16 name block".to_string()));
    }
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();

    units
        .split(|u| *u == 0)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| {
            String::from_utf16(chunk)
                .map(|s| s.replace('\\', "/"))
                .map_err(|_| Error::InvalidArchive("malformed utf-16 file name".to_string()))
        })
        .collect()
}

fn read_crc_defined(r: &mut HeaderReader<'_>, count: usize) -> Result<Vec<bool>, Error> {
    let defined = if r.u8()? != 0 {
        vec![true; count]
    } else {
        r.bit_vector(count)?
    };
    let known = defined.iter().filter(|d| **d).count();
    r.skip(4 * known)?;
    Ok(defined)
}

fn skip_crcs(r: &mut HeaderReader<'_>, count: usize) -> Result<(), Error> {
    read_crc_defined(r, count).map(|_| ())
}
