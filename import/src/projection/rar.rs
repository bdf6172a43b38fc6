//! Store-only RAR archive walker.
//!
//! Walks the headers of every part file over the virtual filesystem, never
//! touching file data bodies, and emits per embedded file the packed byte
//! ranges inside each part. Both the RAR 4.x and RAR 5.0 layouts are
//! understood. Compression and encryption are rejected outright: imported
//! archives must be stored, because the read path serves raw segment bytes.

use std::collections::HashMap;
use std::io::SeekFrom;

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, instrument, warn};

use crate::nzb::ParsedFile;
use crate::vfs::{UsenetFile, UsenetFs};
use crate::Error;

use super::wire::HeaderReader;
use super::{parts, project_listing, ArchiveFile, EmbeddedListing, Fragment};

const RAR4_SIGNATURE: [u8; 7] = [0x52, 0x61, 0x72, 0x21, 0x1a, 0x07, 0x00];
const RAR5_SIGNATURE: [u8; 8] = [0x52, 0x61, 0x72, 0x21, 0x1a, 0x07, 0x01, 0x00];

// RAR4 block types.
const RAR4_MAIN: u8 = 0x73;
const RAR4_FILE: u8 = 0x74;
const RAR4_ENDARC: u8 = 0x7b;

// RAR5 header types.
const RAR5_MAIN: u64 = 1;
const RAR5_FILE: u64 = 2;
const RAR5_ENCRYPTION: u64 = 4;
const RAR5_ENDARC: u64 = 5;

/// One stored file header as found in a single part.
#[derive(Debug)]
struct PartEntry {
    path: String,
    packed_size: i64,
    data_offset: i64,
    split_before: bool,
    split_after: bool,
}

/// Analyze a multi-part RAR described by `files` and return each embedded
/// file with its byte ranges projected onto the parts' segment lists.
#[instrument(skip_all, fields(parts = files.len()))]
pub async fn analyze(fs: &UsenetFs, files: &[ParsedFile]) -> Result<Vec<ArchiveFile>, Error> {
    let names: Vec<&str> = files.iter().map(|f| f.filename.as_str()).collect();
    let Some(first) = parts::find_first_part(&names) else {
        return Err(Error::InvalidArchive("no part files".to_string()));
    };
    debug!(first, "walking rar volumes");

    let ordered = parts::normalize_parts(&names);

    let mut listing: Vec<EmbeddedListing> = Vec::new();
    // Index of the file whose data continues into the next part.
    let mut open_split: Option<usize> = None;

    for part in &ordered {
        let mut handle = fs.open(&part.original)?;
        let entries = walk_part(&mut handle).await?;

        for entry in entries {
            let target = if entry.split_before {
                match open_split {
                    Some(idx) if listing[idx].internal_path == entry.path => Some(idx),
                    _ => {
                        warn!(
                            part = %part.original,
                            file = %entry.path,
                            "continuation entry without a matching head, skipping"
                        );
                        None
                    }
                }
            } else {
                listing.push(EmbeddedListing {
                    internal_path: entry.path.clone(),
                    size: 0,
                    fragments: Vec::new(),
                });
                Some(listing.len() - 1)
            };

            if let Some(idx) = target {
                listing[idx].fragments.push(Fragment {
                    part: part.original.clone(),
                    data_offset: entry.data_offset,
                    length: entry.packed_size,
                });
                listing[idx].size += entry.packed_size;
            }

            open_split = match (entry.split_after, target) {
                (true, Some(idx)) => Some(idx),
                _ => None,
            };
        }
    }

    if listing.is_empty() {
        return Err(Error::InvalidArchive("archive contains no files".to_string()));
    }

    let by_name: HashMap<String, &ParsedFile> = files
        .iter()
        .map(|f| (f.filename.clone(), f))
        .collect();
    project_listing(listing, &by_name)
}

/// Walk one part's headers and collect its stored file entries.
async fn walk_part(handle: &mut UsenetFile) -> Result<Vec<PartEntry>, Error> {
    let mut signature = [0u8; 8];
    handle
        .read_exact(&mut signature[..7])
        .await
        .map_err(|_| Error::InvalidArchive("part too short for a signature".to_string()))?;

    if signature[..7] == RAR4_SIGNATURE {
        return walk_rar4(handle).await;
    }

    handle
        .read_exact(&mut signature[7..])
        .await
        .map_err(|_| Error::InvalidArchive("part too short for a signature".to_string()))?;
    if signature == RAR5_SIGNATURE {
        return walk_rar5(handle).await;
    }

    Err(Error::InvalidArchive("not a rar signature".to_string()))
}

async fn walk_rar4(handle: &mut UsenetFile) -> Result<Vec<PartEntry>, Error> {
    let size = handle.size();
    let mut pos: u64 = RAR4_SIGNATURE.len() as u64;
    let mut out = Vec::new();

    while pos + 7 <= size {
        let mut base = [0u8; 7];
        handle.read_exact(&mut base).await?;
        let mut r = HeaderReader::new(&base);
        let _head_crc = r.u16_le()?;
        let head_type = r.u8()?;
        let head_flags = r.u16_le()?;
        let head_size = u64::from(r.u16_le()?);
        if head_size < 7 {
            return Err(Error::InvalidArchive("malformed block header".to_string()));
        }

        let mut body = vec![0u8; (head_size - 7) as usize];
        handle.read_exact(&mut body).await?;
        pos += head_size;

        let mut add_size: u64 = 0;
        match head_type {
            RAR4_MAIN => {
                // MHD_PASSWORD: the headers themselves are encrypted.
                if head_flags & 0x0080 != 0 {
                    return Err(Error::InvalidArchive("encrypted headers".to_string()));
                }
            }
            RAR4_FILE => {
                let mut b = HeaderReader::new(&body);
                let mut pack_size = u64::from(b.u32_le()?);
                let mut unp_size = u64::from(b.u32_le()?);
                let _host_os = b.u8()?;
                let _file_crc = b.u32_le()?;
                let _ftime = b.u32_le()?;
                let _unp_ver = b.u8()?;
                let method = b.u8()?;
                let name_size = b.u16_le()? as usize;
                let _attr = b.u32_le()?;
                if head_flags & 0x0100 != 0 {
                    // LHD_LARGE: 64-bit sizes.
                    pack_size |= u64::from(b.u32_le()?) << 32;
                    unp_size |= u64::from(b.u32_le()?) << 32;
                }
                let name = rar4_name(b.take(name_size)?, head_flags);
                let _ = unp_size;

                if head_flags & 0x0004 != 0 {
                    return Err(Error::InvalidArchive(format!("encrypted entry {name}")));
                }

                add_size = pack_size;
                let is_dir = head_flags & 0x00e0 == 0x00e0;
                if !is_dir {
                    // 0x30 is the store method; everything else needs
                    // decompression the read path cannot do.
                    if method != 0x30 {
                        return Err(Error::InvalidArchive(format!("compressed entry {name}")));
                    }
                    out.push(PartEntry {
                        path: name,
                        packed_size: pack_size as i64,
                        data_offset: pos as i64,
                        split_before: head_flags & 0x0001 != 0,
                        split_after: head_flags & 0x0002 != 0,
                    });
                }
            }
            RAR4_ENDARC => break,
            _ => {
                // Any other block: skip its additional data area if present.
                if head_flags & 0x8000 != 0 {
                    let mut b = HeaderReader::new(&body);
                    add_size = u64::from(b.u32_le()?);
                }
            }
        }

        if add_size > 0 {
            pos += add_size;
            // A part missing its tail articles ends mid-data; the entry is
            // already recorded, projection patches the gap.
            if pos + 7 > size {
                break;
            }
            handle.seek(SeekFrom::Current(add_size as i64)).await?;
        }
    }

    Ok(out)
}

/// RAR4 names: with LHD_UNICODE the field holds the 8-bit name, a NUL, then
/// an encoded unicode remainder we don't need; without it, the whole field.
fn rar4_name(raw: &[u8], head_flags: u16) -> String {
    let raw = if head_flags & 0x0200 != 0 {
        raw.split(|b| *b == 0).next().unwrap_or(raw)
    } else {
        raw
    };
    String::from_utf8_lossy(raw).replace('\\', "/")
}

async fn walk_rar5(handle: &mut UsenetFile) -> Result<Vec<PartEntry>, Error> {
    let size = handle.size();
    let mut pos: u64 = RAR5_SIGNATURE.len() as u64;
    let mut out = Vec::new();

    while pos + 7 <= size {
        let mut crc = [0u8; 4];
        handle.read_exact(&mut crc).await?;
        pos += 4;
        let (head_size, vint_len) = stream_vint(handle).await?;
        pos += vint_len;

        let mut body = vec![0u8; head_size as usize];
        handle.read_exact(&mut body).await?;
        pos += head_size;

        let mut b = HeaderReader::new(&body);
        let head_type = b.vint()?;
        let head_flags = b.vint()?;
        let _extra_size = if head_flags & 0x01 != 0 { b.vint()? } else { 0 };
        let data_size = if head_flags & 0x02 != 0 { b.vint()? } else { 0 };

        match head_type {
            RAR5_MAIN => {}
            RAR5_FILE => {
                let file_flags = b.vint()?;
                let _unp_size = b.vint()?;
                let _attributes = b.vint()?;
                if file_flags & 0x02 != 0 {
                    b.u32_le()?; // mtime
                }
                if file_flags & 0x04 != 0 {
                    b.u32_le()?; // data crc
                }
                let compression = b.vint()?;
                let _host_os = b.vint()?;
                let name_len = b.vint()? as usize;
                let name = String::from_utf8_lossy(b.take(name_len)?).replace('\\', "/");

                let is_dir = file_flags & 0x01 != 0;
                if !is_dir {
                    let method = (compression >> 7) & 0x07;
                    if method != 0 {
                        return Err(Error::InvalidArchive(format!("compressed entry {name}")));
                    }
                    out.push(PartEntry {
                        path: name,
                        packed_size: data_size as i64,
                        data_offset: pos as i64,
                        split_before: head_flags & 0x08 != 0,
                        split_after: head_flags & 0x10 != 0,
                    });
                }
            }
            RAR5_ENCRYPTION => {
                return Err(Error::InvalidArchive("encrypted headers".to_string()));
            }
            RAR5_ENDARC => break,
            _ => {}
        }

        if data_size > 0 {
            pos += data_size;
            if pos + 7 > size {
                break;
            }
            handle.seek(SeekFrom::Current(data_size as i64)).await?;
        }
    }

    Ok(out)
}

/// Read a RAR5 vint directly off the stream; returns (value, encoded length).
async fn stream_vint(handle: &mut UsenetFile) -> Result<(u64, u64), Error> {
    let mut value: u64 = 0;
    for i in 0..10u64 {
        let mut byte = [0u8; 1];
        handle.read_exact(&mut byte).await?;
        value |= u64::from(byte[0] & 0x7f) << (7 * i).min(63);
        if byte[0] & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(Error::InvalidArchive("overlong vint".to_string()))
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Builders producing real store-mode RAR volume bytes.

    pub struct Rar4Entry<'a> {
        pub name: &'a str,
        pub data: &'a [u8],
        pub split_before: bool,
        pub split_after: bool,
        pub method: u8,
    }

    impl<'a> Rar4Entry<'a> {
        pub fn stored(name: &'a str, data: &'a [u8]) -> Self {
            Rar4Entry {
                name,
                data,
                split_before: false,
                split_after: false,
                method: 0x30,
            }
        }
    }

    pub fn rar4_volume(entries: &[Rar4Entry<'_>]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&super::RAR4_SIGNATURE);

        // Main header: 7-byte base + 6 reserved bytes.
        out.extend_from_slice(&0u16.to_le_bytes());
        out.push(super::RAR4_MAIN);
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&13u16.to_le_bytes());
        out.extend_from_slice(&[0u8; 6]);

        for entry in entries {
            let mut flags: u16 = 0x8000; // data area follows
            if entry.split_before {
                flags |= 0x0001;
            }
            if entry.split_after {
                flags |= 0x0002;
            }
            let head_size = 7 + 25 + entry.name.len() as u16;

            out.extend_from_slice(&0u16.to_le_bytes()); // crc, unchecked
            out.push(super::RAR4_FILE);
            out.extend_from_slice(&flags.to_le_bytes());
            out.extend_from_slice(&head_size.to_le_bytes());

            out.extend_from_slice(&(entry.data.len() as u32).to_le_bytes()); // pack
            out.extend_from_slice(&(entry.data.len() as u32).to_le_bytes()); // unp
            out.push(0); // host os
            out.extend_from_slice(&0u32.to_le_bytes()); // file crc
            out.extend_from_slice(&0u32.to_le_bytes()); // ftime
            out.push(29); // unp ver
            out.push(entry.method);
            out.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());
            out.extend_from_slice(&0u32.to_le_bytes()); // attrs
            out.extend_from_slice(entry.name.as_bytes());

            out.extend_from_slice(entry.data);
        }

        // End-of-archive block.
        out.extend_from_slice(&0u16.to_le_bytes());
        out.push(super::RAR4_ENDARC);
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(&7u16.to_le_bytes());

        out
    }

    fn vint(mut value: u64) -> Vec<u8> {
        let mut out = Vec::new();
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                out.push(byte);
                break;
            }
            out.push(byte | 0x80);
        }
        out
    }

    pub struct Rar5Entry<'a> {
        pub name: &'a str,
        pub data: &'a [u8],
        pub split_before: bool,
        pub split_after: bool,
        /// Compression-info field; 0 is store.
        pub compression: u64,
    }

    impl<'a> Rar5Entry<'a> {
        pub fn stored(name: &'a str, data: &'a [u8]) -> Self {
            Rar5Entry {
                name,
                data,
                split_before: false,
                split_after: false,
                compression: 0,
            }
        }
    }

    pub fn rar5_volume(entries: &[Rar5Entry<'_>]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&super::RAR5_SIGNATURE);

        // Main header: type 1, no flags, one extra field omitted.
        push_block(&mut out, &[&vint(1)[..], &vint(0)[..], &vint(0)[..]].concat(), &[]);

        for entry in entries {
            let mut head_flags: u64 = 0x02; // data area present
            if entry.split_before {
                head_flags |= 0x08;
            }
            if entry.split_after {
                head_flags |= 0x10;
            }

            let mut body = Vec::new();
            body.extend_from_slice(&vint(2)); // file header
            body.extend_from_slice(&vint(head_flags));
            body.extend_from_slice(&vint(entry.data.len() as u64)); // data size
            body.extend_from_slice(&vint(0)); // file flags
            body.extend_from_slice(&vint(entry.data.len() as u64)); // unpacked
            body.extend_from_slice(&vint(0)); // attributes
            body.extend_from_slice(&vint(entry.compression));
            body.extend_from_slice(&vint(0)); // host os
            body.extend_from_slice(&vint(entry.name.len() as u64));
            body.extend_from_slice(entry.name.as_bytes());

            push_raw_block(&mut out, &body);
            out.extend_from_slice(entry.data);
        }

        // End of archive: type 5, no flags.
        push_block(&mut out, &[&vint(5)[..], &vint(0)[..]].concat(), &[]);
        out
    }

    fn push_block(out: &mut Vec<u8>, body: &[u8], data: &[u8]) {
        push_raw_block(out, body);
        out.extend_from_slice(data);
    }

    fn push_raw_block(out: &mut Vec<u8>, body: &[u8]) {
        out.extend_from_slice(&0u32.to_le_bytes()); // crc, unchecked
        out.extend_from_slice(&vint(body.len() as u64));
        out.extend_from_slice(body);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pretty_assertions::assert_eq;

    use super::testutil::{rar4_volume, rar5_volume, Rar4Entry, Rar5Entry};
    use super::*;
    use crate::fixtures;
    use crate::nzb::Segment;
    use crate::pool::MemoryNntpPool;

    /// Split volume bytes into articles of `chunk` bytes and register the
    /// resulting part file with the pool.
    fn part_from_bytes(
        name: &str,
        bytes: &[u8],
        chunk: usize,
        pool: &MemoryNntpPool,
    ) -> ParsedFile {
        let chunks: Vec<&[u8]> = bytes.chunks(chunk).collect();
        fixtures::file_from_chunks(name, &chunks, pool)
    }

    async fn fs_for(files: Vec<ParsedFile>, pool: Arc<MemoryNntpPool>) -> UsenetFs {
        let manager = fixtures::manager_with(pool).await;
        UsenetFs::new(files, manager, 4, 1 << 20)
    }

    #[tokio::test]
    async fn single_volume_two_stored_files() {
        let volume = rar4_volume(&[
            Rar4Entry::stored("video/feature.mkv", b"AAAAABBBBBCCCCC"),
            Rar4Entry::stored("notes.nfo", b"hello"),
        ]);

        let pool = Arc::new(MemoryNntpPool::default());
        let part = part_from_bytes("x.rar", &volume, 64, &pool);
        let segments = part.segments.clone();
        let fs = fs_for(vec![part.clone()], pool).await;

        let files = analyze(&fs, &[part]).await.expect("analyze");
        assert_eq!(2, files.len());

        assert_eq!("video/feature.mkv", files[0].internal_path);
        assert_eq!("feature.mkv", files[0].filename);
        assert_eq!(15, files[0].size);
        assert_eq!(
            15,
            files[0].segments.iter().map(Segment::len).sum::<i64>()
        );

        assert_eq!("notes.nfo", files[1].internal_path);
        assert_eq!(5, files[1].size);

        // Data offsets land where the builder put the bytes: behind the
        // 20-byte preamble plus the 49-byte file header.
        let first_data = 7 + 13 + (7 + 25 + "video/feature.mkv".len()) as i64;
        let (emitted, covered) =
            super::super::project_range(&segments, first_data, 15).expect("project");
        assert_eq!(files[0].segments, emitted);
        assert_eq!(15, covered);
    }

    #[tokio::test]
    async fn file_split_across_volumes_merges_fragments() {
        let vol1 = rar4_volume(&[Rar4Entry {
            split_after: true,
            ..Rar4Entry::stored("feature.mkv", b"0123456789")
        }]);
        let vol2 = rar4_volume(&[Rar4Entry {
            split_before: true,
            ..Rar4Entry::stored("feature.mkv", b"abcdef")
        }]);

        let pool = Arc::new(MemoryNntpPool::default());
        let part1 = part_from_bytes("x.part1.rar", &vol1, 32, &pool);
        let part2 = part_from_bytes("x.part2.rar", &vol2, 32, &pool);
        let fs = fs_for(vec![part1.clone(), part2.clone()], pool).await;

        let files = analyze(&fs, &[part1, part2]).await.expect("analyze");
        assert_eq!(1, files.len());
        assert_eq!(16, files[0].size);
        assert_eq!(
            16,
            files[0].segments.iter().map(Segment::len).sum::<i64>()
        );
        // Fragments stay in part order: first volume's shard(s) precede the
        // second volume's.
        let ids: Vec<&str> = files[0].segments.iter().map(|s| s.id.as_str()).collect();
        assert!(ids.first().expect("segments").starts_with("x.part1.rar"));
        assert!(ids.last().expect("segments").starts_with("x.part2.rar"));
    }

    #[tokio::test]
    async fn compressed_entry_is_invalid() {
        let volume = rar4_volume(&[Rar4Entry {
            method: 0x33,
            ..Rar4Entry::stored("feature.mkv", b"zz")
        }]);

        let pool = Arc::new(MemoryNntpPool::default());
        let part = part_from_bytes("x.rar", &volume, 64, &pool);
        let fs = fs_for(vec![part.clone()], pool).await;

        let err = analyze(&fs, &[part]).await.expect_err("compressed");
        assert!(matches!(err, Error::InvalidArchive(_)));
    }

    #[tokio::test]
    async fn garbage_part_is_invalid() {
        let pool = Arc::new(MemoryNntpPool::default());
        let part = part_from_bytes("x.rar", b"this is not a rar file at all", 8, &pool);
        let fs = fs_for(vec![part.clone()], pool).await;

        let err = analyze(&fs, &[part]).await.expect_err("garbage");
        assert!(matches!(err, Error::InvalidArchive(_)));
    }

    #[tokio::test]
    async fn rar5_stored_file() {
        let volume = rar5_volume(&[Rar5Entry::stored("feature.mkv", b"0123456789abcdef")]);

        let pool = Arc::new(MemoryNntpPool::default());
        let part = part_from_bytes("x.rar", &volume, 32, &pool);
        let fs = fs_for(vec![part.clone()], pool).await;

        let files = analyze(&fs, &[part]).await.expect("analyze");
        assert_eq!(1, files.len());
        assert_eq!(16, files[0].size);
        assert_eq!(
            16,
            files[0].segments.iter().map(Segment::len).sum::<i64>()
        );
    }

    #[tokio::test]
    async fn rar5_compressed_entry_is_invalid() {
        let volume = rar5_volume(&[Rar5Entry {
            compression: 3 << 7, // method 3
            ..Rar5Entry::stored("feature.mkv", b"zz")
        }]);

        let pool = Arc::new(MemoryNntpPool::default());
        let part = part_from_bytes("x.rar", &volume, 32, &pool);
        let fs = fs_for(vec![part.clone()], pool).await;

        let err = analyze(&fs, &[part]).await.expect_err("compressed");
        assert!(matches!(err, Error::InvalidArchive(_)));
    }
}
