//! Virtual-path mapping for imports.
//!
//! All paths here are POSIX-style, rooted at `/`. The mapping mirrors the
//! NZB's embedded directory structure but flattens the redundant patterns
//! release tooling produces (`Movie/Movie.mkv`, a directory repeating the
//! release name).

use std::collections::HashSet;
use std::path::Path;

use crate::metadata::MetadataStore;
use crate::Error;

/// Virtual directory an NZB imports into, derived from where the NZB sits
/// relative to the watched directory. Falls back to a normalized
/// `/relative_dir` when the NZB is not under it.
pub fn calc_virtual_dir(nzb_path: &str, relative_dir: &str) -> String {
    if relative_dir.is_empty() {
        return "/".to_string();
    }

    match Path::new(nzb_path).strip_prefix(relative_dir) {
        Ok(rel) => {
            let dir = rel.parent().unwrap_or_else(|| Path::new(""));
            let joined = dir
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if joined.is_empty() {
                "/".to_string()
            } else {
                format!("/{joined}")
            }
        }
        Err(_) => normalize_virtual(relative_dir),
    }
}

/// Collapse a path into a clean absolute virtual path, dropping empty,
/// `.` and upward components.
fn normalize_virtual(path: &str) -> String {
    let joined = path
        .replace('\\', "/")
        .split('/')
        .filter(|c| !c.is_empty() && *c != "." && *c != "..")
        .collect::<Vec<_>>()
        .join("/");
    format!("/{joined}")
}

/// Folder name derived from an NZB filename: the `.nzb` extension goes, and
/// optionally one trailing media extension (`Movie.mkv.nzb` -> `Movie`).
pub fn nzb_folder_name(nzb_filename: &str, allowed_extensions: &[String]) -> String {
    let base = strip_suffix_ignore_case(nzb_filename, ".nzb").unwrap_or(nzb_filename);

    if let Some((stem, ext)) = base.rsplit_once('.') {
        let matches = allowed_extensions
            .iter()
            .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext));
        if matches && !stem.is_empty() {
            return stem.to_string();
        }
    }
    base.to_string()
}

fn strip_suffix_ignore_case<'a>(name: &'a str, suffix: &str) -> Option<&'a str> {
    if name.len() >= suffix.len() && name[name.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
    {
        Some(&name[..name.len() - suffix.len()])
    } else {
        None
    }
}

/// Join a virtual directory and a relative path.
pub fn join_virtual(dir: &str, rest: &str) -> String {
    let dir = dir.trim_end_matches('/');
    let rest = rest.trim_matches('/');
    match (dir.is_empty(), rest.is_empty()) {
        (true, true) => "/".to_string(),
        (true, false) => format!("/{rest}"),
        (false, true) => dir.to_string(),
        (false, false) => format!("{dir}/{rest}"),
    }
}

/// Map one file of a multi-file import to its virtual path under
/// `virtual_dir`.
///
/// Flattening, in order: a directory level repeating the file's own name
/// (`Movie/Movie.mkv`, with or without extension) collapses; a leading
/// directory equal to the import folder's name collapses or is stripped.
pub fn place_file(name: &str, parent_dir_name: &str, virtual_dir: &str) -> String {
    let name = name.replace('\\', "/");
    let name = name.trim_start_matches('/');

    let (dir, base) = match name.rsplit_once('/') {
        Some((dir, base)) => (dir, base),
        None => ("", name),
    };

    let mut dir = dir.to_string();

    // Movie/Movie.mkv and Movie.mkv/Movie.mkv both flatten one level.
    if let Some(last) = dir.rsplit('/').next() {
        let stem = base.rsplit_once('.').map(|(s, _)| s).unwrap_or(base);
        if !last.is_empty() && (last == base || last == stem) {
            dir = dir[..dir.len() - last.len()]
                .trim_end_matches('/')
                .to_string();
        }
    }

    if dir == parent_dir_name {
        dir.clear();
    } else if let Some(rest) = dir.strip_prefix(&format!("{parent_dir_name}/")) {
        dir = rest.to_string();
    }

    let rest = if dir.is_empty() {
        base.to_string()
    } else {
        format!("{dir}/{base}")
    };
    join_virtual(virtual_dir, &rest)
}

/// Reserve a virtual path for the current batch.
///
/// A path already claimed by this batch gets `_1`, `_2`, ... appended before
/// the extension until it is free both in the batch and on disk. A path free
/// in the batch but holding a record from a prior import replaces that
/// record.
pub(crate) async fn reserve_path(
    store: &MetadataStore,
    taken: &mut HashSet<String>,
    target: String,
) -> Result<String, Error> {
    if !taken.contains(&target) {
        if store.exists(&target).await? {
            store.delete(&target).await?;
        }
        taken.insert(target.clone());
        return Ok(target);
    }

    let (dir, base) = match target.rsplit_once('/') {
        Some((dir, base)) => (dir, base),
        None => ("", target.as_str()),
    };
    let (stem, ext) = match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, format!(".{ext}")),
        _ => (base, String::new()),
    };

    for n in 1u32.. {
        let candidate = if dir.is_empty() {
            format!("{stem}_{n}{ext}")
        } else {
            format!("{dir}/{stem}_{n}{ext}")
        };
        if taken.contains(&candidate) || store.exists(&candidate).await? {
            continue;
        }
        taken.insert(candidate.clone());
        return Ok(candidate);
    }
    unreachable!("suffix search is unbounded")
}
