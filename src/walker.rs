//! Input traversal and entry classification.
//!
//! [`walk`] expands the user-supplied paths into archive entries: regular
//! files and symbolic links become headers, directories are descended into
//! but never stored.  The result is de-duplicated on the in-archive path
//! (first occurrence wins) and sorted by the lowercased in-archive path.
//!
//! Entries that cannot be represented are skipped with a warning, never
//! fatal: dangling symlinks, paths outside 1..=1023 bytes, names that are
//! not valid UTF-8, and special files.
//!
//! On the read side [`implicit_dirs`] rebuilds the directory records from
//! the stored paths.

use std::collections::{BTreeSet, HashSet};
use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};

use filetime::FileTime;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::Error;
use crate::frame::{check_path, clean_path, Entry, FileHeader, SymlinkHeader};

// ── Stat ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    File,
    Dir,
    Symlink,
    Other,
}

/// Attributes of one filesystem entry, symlinks not followed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    pub atime: i64,
    pub mtime: i64,
    pub mode:  u32,
    pub size:  u64,
    pub kind:  Kind,
}

impl Stat {
    fn from_metadata(meta: &Metadata) -> Self {
        let ft = meta.file_type();
        let kind = if ft.is_symlink() {
            Kind::Symlink
        } else if ft.is_dir() {
            Kind::Dir
        } else if ft.is_file() {
            Kind::File
        } else {
            Kind::Other
        };
        Self {
            atime: FileTime::from_last_access_time(meta).unix_seconds(),
            mtime: FileTime::from_last_modification_time(meta).unix_seconds(),
            mode:  mode_of(meta),
            size:  meta.len(),
            kind,
        }
    }
}

#[cfg(unix)]
fn mode_of(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode()
}

#[cfg(not(unix))]
fn mode_of(meta: &Metadata) -> u32 {
    if meta.permissions().readonly() { 0o444 } else { 0o644 }
}

pub fn stat(path: &Path) -> io::Result<Stat> {
    fs::symlink_metadata(path).map(|m| Stat::from_metadata(&m))
}

// ── Items ────────────────────────────────────────────────────────────────────

/// One entry to archive together with where its data lives on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub source: PathBuf,
    pub entry:  Entry,
}

fn archive_name(path: &Path) -> Option<String> {
    let Some(s) = path.to_str() else {
        warn!(path = %path.display(), "skipping entry: name is not valid UTF-8");
        return None;
    };
    let name = clean_path(s);
    if let Err(e) = check_path(&name) {
        warn!(path = %path.display(), error = %e, "skipping entry");
        return None;
    }
    Some(name)
}

fn file_item(path: &Path, st: &Stat) -> Option<Item> {
    let name = archive_name(path)?;
    Some(Item {
        source: path.to_path_buf(),
        entry:  Entry::File(FileHeader {
            path:  name,
            mtime: st.mtime,
            atime: st.atime,
            size:  st.size as i64,
        }),
    })
}

fn symlink_item(path: &Path) -> Option<Item> {
    let target = match fs::read_link(path) {
        Ok(t)  => t,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "skipping symlink: cannot read target");
            return None;
        }
    };
    if fs::metadata(path).is_err() {
        warn!(path = %path.display(), target = %target.display(), "skipping dangling symlink");
        return None;
    }
    let absolute = if target.is_absolute() {
        target
    } else {
        let joined = path.parent().unwrap_or_else(|| Path::new("")).join(&target);
        if joined.is_absolute() {
            joined
        } else {
            match std::env::current_dir() {
                Ok(cwd) => cwd.join(joined),
                Err(_)  => joined,
            }
        }
    };
    let Some(target) = absolute.to_str().map(str::to_owned) else {
        warn!(path = %path.display(), "skipping symlink: target is not valid UTF-8");
        return None;
    };
    if let Err(e) = check_path(&target) {
        warn!(path = %path.display(), error = %e, "skipping symlink: target");
        return None;
    }
    let name = archive_name(path)?;
    Some(Item {
        source: path.to_path_buf(),
        entry:  Entry::Symlink(SymlinkHeader { target, path: name }),
    })
}

fn classify(path: &Path, meta: &Metadata, out: &mut Vec<Item>) {
    let st = Stat::from_metadata(meta);
    let item = match st.kind {
        Kind::File    => file_item(path, &st),
        Kind::Symlink => symlink_item(path),
        Kind::Dir     => None,
        Kind::Other   => {
            warn!(path = %path.display(), "skipping special file");
            None
        }
    };
    out.extend(item);
}

// ── Walk ─────────────────────────────────────────────────────────────────────

/// True when `candidate` is the same file as `exclude` (the archive being
/// written).  Only paths with a matching file name are canonicalised.
fn is_excluded(candidate: &Path, exclude: Option<&(PathBuf, PathBuf)>) -> bool {
    let Some((name_path, canonical)) = exclude else { return false };
    if candidate.file_name() != name_path.file_name() {
        return false;
    }
    fs::canonicalize(candidate).map(|c| &c == canonical).unwrap_or(false)
}

/// Expand `inputs` into sorted, de-duplicated archive items.
///
/// `exclude` names a file never to include (normally the output archive).
/// An input path that cannot be stat'ed is an error; problems below it are
/// warnings.
pub fn walk(inputs: &[PathBuf], exclude: Option<&Path>) -> Result<Vec<Item>, Error> {
    let exclude = exclude.and_then(|p| {
        fs::canonicalize(p).ok().map(|c| (p.to_path_buf(), c))
    });
    let mut items = Vec::new();

    for input in inputs {
        let meta = fs::symlink_metadata(input).map_err(|source| Error::Open {
            path: input.clone(),
            source,
        })?;
        if !meta.file_type().is_dir() {
            if !is_excluded(input, exclude.as_ref()) {
                classify(input, &meta, &mut items);
            }
            continue;
        }
        for dent in WalkDir::new(input).follow_links(false).min_depth(1) {
            let dent = match dent {
                Ok(d)  => d,
                Err(e) => {
                    warn!(error = %e, "skipping unreadable entry");
                    continue;
                }
            };
            if dent.file_type().is_dir() || is_excluded(dent.path(), exclude.as_ref()) {
                continue;
            }
            match dent.metadata() {
                Ok(m)  => classify(dent.path(), &m, &mut items),
                Err(e) => warn!(path = %dent.path().display(), error = %e, "skipping entry"),
            }
        }
    }

    let items = dedup_and_sort(items);
    if items.is_empty() {
        return Err(Error::NoEntries);
    }
    debug!(entries = items.len(), "walk complete");
    Ok(items)
}

/// Drop later duplicates of an in-archive path, then order by the
/// lowercased path.
pub fn dedup_and_sort(items: Vec<Item>) -> Vec<Item> {
    let mut seen = HashSet::new();
    let mut unique: Vec<Item> = items
        .into_iter()
        .filter(|it| {
            let fresh = seen.insert(it.entry.path().to_owned());
            if !fresh {
                warn!(path = it.entry.path(), source = %it.source.display(), "skipping duplicate entry");
            }
            fresh
        })
        .collect();
    unique.sort_by_cached_key(|it| it.entry.path().to_lowercase());
    unique
}

// ── Directory reconstruction ─────────────────────────────────────────────────

/// Every directory prefix of the given in-archive paths, unique, ordered by
/// the lowercased path.
pub fn implicit_dirs<'a, I>(paths: I) -> Vec<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut dirs = BTreeSet::new();
    for path in paths {
        let mut end = 0;
        while let Some(pos) = path[end..].find('/') {
            end += pos;
            dirs.insert(path[..end].to_owned());
            end += 1;
        }
    }
    let mut dirs: Vec<String> = dirs.into_iter().collect();
    dirs.sort_by_cached_key(|d| d.to_lowercase());
    dirs
}
