//! Archive-level operations: compress, decompress, inspect and verify.
//!
//! ```no_run
//! use blockarc::archive::{self, CompressOptions, ExtractOptions, Silent};
//! use blockarc::codec::{CodecId, CodecOptions};
//! use std::path::PathBuf;
//!
//! let opts = CompressOptions::new(CodecOptions::new(CodecId::Flate));
//! archive::compress("out.bar".as_ref(), &[PathBuf::from("docs")], &opts, &mut Silent)?;
//!
//! let extract = ExtractOptions::new("restored");
//! archive::decompress("out.bar".as_ref(), &extract, &mut Silent)?;
//! # Ok::<(), blockarc::Error>(())
//! ```
//!
//! Every operation owns its own [`Pipeline`] for its whole duration.  User
//! facing notices go through a [`Console`]; diagnostics go to `tracing`.

use std::fs::{self, File};
use std::io::{self, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use filetime::FileTime;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codec::{CodecId, CodecOptions};
use crate::error::{Error, ResultExt};
use crate::frame::{self, clean_path, Entry, FileHeader, SymlinkHeader};
use crate::pipeline::{skip_blocks, Pipeline, PipelineConfig};
use crate::walker::{implicit_dirs, walk};
use crate::write_buffer::WriteBuffer;

// ── Console ──────────────────────────────────────────────────────────────────

/// Answer to an overwrite prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overwrite {
    Replace,
    Skip,
    /// Replace this file and every later one without asking again.
    ReplaceAll,
}

/// Receives the per-file progress lines and answers overwrite prompts.
///
/// All methods have no-op defaults; the default prompt answer is
/// [`Overwrite::Skip`].
pub trait Console {
    fn archived(&mut self, _path: &str) {}
    fn extracted(&mut self, _path: &str) {}
    /// A file was written but its checksum did not match.
    fn crc_mismatch(&mut self, _path: &str) {}
    fn verified(&mut self, _path: &str, _intact: bool) {}
    fn overwrite(&mut self, _path: &Path) -> Overwrite {
        Overwrite::Skip
    }
}

/// Console that prints nothing and never overwrites.
#[derive(Debug, Default, Clone, Copy)]
pub struct Silent;

impl Console for Silent {}

// ── Options ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct CompressOptions {
    pub codec:    CodecOptions,
    pub pipeline: PipelineConfig,
}

impl CompressOptions {
    pub fn new(codec: CodecOptions) -> Self {
        Self { codec, pipeline: PipelineConfig::default() }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub out_dir:         PathBuf,
    /// Overwrite existing files without asking.
    pub replace_all:     bool,
    /// Run a checksum-only pass first and skip files that fail it.
    pub integrity_check: bool,
    /// Preset dictionary the archive was written with, if any.
    pub dictionary:      Option<Vec<u8>>,
    pub pipeline:        PipelineConfig,
}

impl ExtractOptions {
    pub fn new<P: Into<PathBuf>>(out_dir: P) -> Self {
        Self {
            out_dir:         out_dir.into(),
            replace_all:     false,
            integrity_check: false,
            dictionary:      None,
            pipeline:        PipelineConfig::default(),
        }
    }
}

// ── Summaries ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressSummary {
    pub files:        usize,
    pub symlinks:     usize,
    pub uncompressed: u64,
    pub compressed:   u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files:    usize,
    pub symlinks: usize,
    /// Files left alone because of an overwrite answer.
    pub skipped:  usize,
    /// Files whose checksum did not match, written or not.
    pub damaged:  Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntegrityReport {
    pub checked: usize,
    pub damaged: Vec<String>,
}

impl IntegrityReport {
    pub fn is_intact(&self) -> bool {
        self.damaged.is_empty()
    }
}

// ── Listing ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Symlink,
    Dir,
}

/// One row of an archive listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub path:       String,
    pub kind:       EntryKind,
    /// Uncompressed size recorded in the header.
    pub size:       i64,
    /// Sum of the block lengths.
    pub compressed: u64,
    pub blocks:     u64,
    pub mtime:      i64,
    pub atime:      i64,
    /// Stored checksum, unverified.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crc:        Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target:     Option<String>,
}

impl EntryInfo {
    fn dir(path: String) -> Self {
        Self {
            path,
            kind:       EntryKind::Dir,
            size:       0,
            compressed: 0,
            blocks:     0,
            mtime:      0,
            atime:      0,
            crc:        None,
            target:     None,
        }
    }
}

/// Contents of an archive, stored entries and derived directories, ordered
/// by the lowercased path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Listing {
    pub codec:            &'static str,
    pub entries:          Vec<EntryInfo>,
    pub files:            usize,
    pub symlinks:         usize,
    pub dirs:             usize,
    pub total_size:       i64,
    pub total_compressed: u64,
}

impl Listing {
    /// Entries actually present in the archive, directories excluded.
    pub fn stored(&self) -> impl Iterator<Item = &EntryInfo> {
        self.entries.iter().filter(|e| e.kind != EntryKind::Dir)
    }
}

// ── Shared helpers ───────────────────────────────────────────────────────────

fn open_archive(path: &Path) -> Result<(BufReader<File>, CodecId), Error> {
    let file = File::open(path).map_err(|source| Error::Open { path: path.to_path_buf(), source })?;
    let mut input = BufReader::new(file);
    let codec = frame::read_prologue(&mut input)?;
    debug!(archive = %path.display(), codec = codec.name(), "opened archive");
    Ok((input, codec))
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

// ── Compress ─────────────────────────────────────────────────────────────────

/// Write `inputs` into a new archive at `archive`.
///
/// The entry list is built before the archive is created, so an empty input
/// set leaves no file behind.  Any later failure removes the partial
/// archive.
pub fn compress(
    archive: &Path,
    inputs: &[PathBuf],
    opts: &CompressOptions,
    console: &mut dyn Console,
) -> Result<CompressSummary, Error> {
    if let Some(input) = inputs.iter().find(|i| same_file(i, archive)) {
        return Err(Error::Argument(format!(
            "archive path {} is also an input",
            input.display()
        )));
    }
    let mut pipeline = Pipeline::new(opts.codec.clone(), opts.pipeline.clone())?;
    let items = walk(inputs, Some(archive))?;

    let file = File::create(archive).map_err(|source| Error::Open { path: archive.to_path_buf(), source })?;
    let mut out = WriteBuffer::new(file, opts.pipeline.write_buffer);

    let result = (|| -> Result<CompressSummary, Error> {
        frame::write_prologue(&mut out, opts.codec.effective_codec()).context("writing prologue")?;
        pipeline.init_writers()?;

        let mut summary = CompressSummary::default();
        for item in &items {
            item.entry.write(&mut out)?;
            match &item.entry {
                Entry::File(header) => {
                    let mut src = File::open(&item.source)
                        .map_err(|source| Error::Open { path: item.source.clone(), source })?;
                    let done = pipeline.compress_file(&mut src, &mut out)?;
                    summary.files        += 1;
                    summary.uncompressed += done.uncompressed;
                    summary.compressed   += done.compressed;
                    info!(path = %header.path, size = done.uncompressed, packed = done.compressed, blocks = done.blocks, "archived");
                }
                Entry::Symlink(link) => {
                    summary.symlinks += 1;
                    info!(path = %link.path, target = %link.target, "archived symlink");
                }
            }
            console.archived(item.entry.path());
        }
        out.flush_all()?;
        Ok(summary)
    })();

    match result {
        Ok(summary) => {
            drop(out);
            Ok(summary)
        }
        Err(e) => {
            drop(out);
            if let Err(rm) = fs::remove_file(archive) {
                warn!(archive = %archive.display(), error = %rm, "cannot remove partial archive");
            }
            Err(e)
        }
    }
}

// ── Decompress ───────────────────────────────────────────────────────────────

fn restore_symlink(link: &SymlinkHeader, dest: &Path) -> Result<bool, Error> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).context(format!("creating directory {}", parent.display()))?;
    }
    match make_symlink(Path::new(&link.target), dest) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            debug!(path = %link.path, "symlink already exists");
            Ok(false)
        }
        Err(e) => Err(Error::io(format!("creating symlink {}", dest.display()), e)),
    }
}

#[cfg(unix)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn make_symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

/// First directory of `rel` below `root` that is already a symlink.
///
/// Entries are never written through one, so a link restored earlier in the
/// same archive cannot redirect later entries outside `root`.
fn linked_ancestor(root: &Path, rel: &str) -> Option<PathBuf> {
    let mut dir = root.to_path_buf();
    let mut parts = rel.split('/').peekable();
    while let Some(part) = parts.next() {
        if parts.peek().is_none() {
            break;
        }
        dir.push(part);
        match fs::symlink_metadata(&dir) {
            Ok(meta) if meta.file_type().is_symlink() => return Some(dir),
            Ok(_) => {}
            Err(_) => return None,
        }
    }
    None
}

/// Extract every entry of `archive` below `opts.out_dir`.
///
/// Checksum mismatches are not errors: the file is reported to the console
/// and listed in the summary.  With `integrity_check` a damaged file is not
/// written at all.
pub fn decompress(archive: &Path, opts: &ExtractOptions, console: &mut dyn Console) -> Result<ExtractSummary, Error> {
    let (mut input, codec) = open_archive(archive)?;
    let mut codec_opts = CodecOptions::new(codec);
    if let Some(dict) = &opts.dictionary {
        codec_opts = codec_opts.with_dictionary(dict.clone());
    }
    let mut pipeline = Pipeline::new(codec_opts, opts.pipeline.clone())?;
    let mut replace_all = opts.replace_all;
    let mut sink: Option<WriteBuffer<File>> = None;
    let mut summary = ExtractSummary::default();

    while let Some(entry) = Entry::read(&mut input)? {
        let rel = clean_path(entry.path());
        if rel.is_empty() {
            warn!(path = entry.path(), "skipping entry with empty path");
            if let Entry::File(_) = entry {
                pipeline.skip_file(&mut input)?;
            }
            continue;
        }
        let dest = opts.out_dir.join(&rel);
        if let Some(link) = linked_ancestor(&opts.out_dir, &rel) {
            warn!(path = %rel, link = %link.display(), "skipping entry below a symlink");
            if let Entry::File(_) = entry {
                pipeline.skip_file(&mut input)?;
                summary.skipped += 1;
            }
            continue;
        }

        let header: FileHeader = match entry {
            Entry::Symlink(link) => {
                if restore_symlink(&link, &dest)? {
                    summary.symlinks += 1;
                    info!(path = %rel, target = %link.target, "restored symlink");
                }
                continue;
            }
            Entry::File(header) => header,
        };

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).context(format!("creating directory {}", parent.display()))?;
        }

        if let Ok(meta) = fs::symlink_metadata(&dest) {
            if !replace_all {
                match console.overwrite(&dest) {
                    Overwrite::Skip => {
                        pipeline.skip_file(&mut input)?;
                        summary.skipped += 1;
                        debug!(path = %rel, "kept existing file");
                        continue;
                    }
                    Overwrite::Replace    => {}
                    Overwrite::ReplaceAll => replace_all = true,
                }
            }
            if meta.file_type().is_symlink() {
                fs::remove_file(&dest).context(format!("removing {}", dest.display()))?;
            }
        }

        if opts.integrity_check {
            let start = input.stream_position().context("reading archive position")?;
            let check = pipeline.verify_file(&mut input)?;
            if !check.is_intact() {
                warn!(path = %rel, stored = check.stored, computed = check.computed, "skipping damaged file");
                console.crc_mismatch(&rel);
                summary.damaged.push(rel);
                continue;
            }
            input.seek(SeekFrom::Start(start)).context("rewinding archive")?;
        }

        let file = File::create(&dest).map_err(|source| Error::Open { path: dest.clone(), source })?;
        let out = match sink.take() {
            Some(mut wb) => {
                wb.replace_sink(file)?;
                sink.insert(wb)
            }
            None => sink.insert(WriteBuffer::new(file, opts.pipeline.write_buffer)),
        };
        let stream = pipeline.decompress_file(&mut input, out)?;
        out.flush_all()?;

        filetime::set_file_times(
            &dest,
            FileTime::from_unix_time(header.atime, 0),
            FileTime::from_unix_time(header.mtime, 0),
        )
        .context(format!("restoring times of {}", dest.display()))?;

        summary.files += 1;
        if stream.is_intact() {
            info!(path = %rel, size = stream.restored, blocks = stream.blocks, "extracted");
            console.extracted(&rel);
        } else {
            warn!(path = %rel, stored = stream.stored, computed = stream.computed, "checksum mismatch");
            console.crc_mismatch(&rel);
            summary.damaged.push(rel);
        }
    }

    Ok(summary)
}

// ── Inspect ──────────────────────────────────────────────────────────────────

/// Read every header and skip the payloads using the frame lengths.
/// Checksums are recorded, not verified.
pub fn inspect(archive: &Path) -> Result<Listing, Error> {
    let (mut input, codec) = open_archive(archive)?;
    let ceiling = PipelineConfig::default().max_block_len;
    let mut entries = Vec::new();

    while let Some(entry) = Entry::read(&mut input)? {
        match entry {
            Entry::File(h) => {
                let stream = skip_blocks(&mut input, ceiling)?;
                entries.push(EntryInfo {
                    path:       h.path,
                    kind:       EntryKind::File,
                    size:       h.size,
                    compressed: stream.compressed,
                    blocks:     stream.blocks,
                    mtime:      h.mtime,
                    atime:      h.atime,
                    crc:        Some(stream.stored),
                    target:     None,
                });
            }
            Entry::Symlink(s) => entries.push(EntryInfo {
                target: Some(s.target),
                kind:   EntryKind::Symlink,
                ..EntryInfo::dir(s.path)
            }),
        }
    }

    let dirs = implicit_dirs(entries.iter().map(|e| e.path.as_str()));
    let files = entries.iter().filter(|e| e.kind == EntryKind::File).count();
    let symlinks = entries.len() - files;
    let total_size: i64 = entries.iter().map(|e| e.size).sum();
    let total_compressed: u64 = entries.iter().map(|e| e.compressed).sum();
    let dir_count = dirs.len();
    entries.extend(dirs.into_iter().map(EntryInfo::dir));
    entries.sort_by_cached_key(|e| e.path.to_lowercase());

    Ok(Listing {
        codec: codec.name(),
        entries,
        files,
        symlinks,
        dirs: dir_count,
        total_size,
        total_compressed,
    })
}

// ── Verify ───────────────────────────────────────────────────────────────────

/// Checksum every file without decompressing.  Every file is reported to
/// the console; the call fails with [`Error::Integrity`] when any is
/// damaged.
pub fn verify(archive: &Path, config: &PipelineConfig, console: &mut dyn Console) -> Result<IntegrityReport, Error> {
    let (mut input, codec) = open_archive(archive)?;
    let mut pipeline = Pipeline::new(CodecOptions::new(codec), config.clone())?;
    let mut report = IntegrityReport::default();

    while let Some(entry) = Entry::read(&mut input)? {
        let Entry::File(header) = entry else { continue };
        let stream = pipeline.verify_file(&mut input)?;
        let intact = stream.is_intact();
        report.checked += 1;
        if intact {
            debug!(path = %header.path, blocks = stream.blocks, "verified");
        } else {
            warn!(path = %header.path, stored = stream.stored, computed = stream.computed, "damaged");
            report.damaged.push(header.path.clone());
        }
        console.verified(&header.path, intact);
    }

    if !report.is_intact() {
        return Err(Error::Integrity { damaged: report.damaged.len() });
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recorder {
        archived: Vec<String>,
        verified: Vec<(String, bool)>,
        answers:  Vec<Overwrite>,
        asked:    usize,
    }

    impl Console for Recorder {
        fn archived(&mut self, path: &str) {
            self.archived.push(path.to_owned());
        }
        fn verified(&mut self, path: &str, intact: bool) {
            self.verified.push((path.to_owned(), intact));
        }
        fn overwrite(&mut self, _: &Path) -> Overwrite {
            self.asked += 1;
            self.answers.pop().unwrap_or(Overwrite::Skip)
        }
    }

    fn small_opts(codec: CodecId) -> CompressOptions {
        let mut opts = CompressOptions::new(CodecOptions::new(codec));
        opts.pipeline.workers = 2;
        opts.pipeline.block_size = 4096;
        opts
    }

    fn tree(root: &Path) {
        fs::create_dir_all(root.join("sub")).unwrap();
        File::create(root.join("one.txt")).unwrap().write_all(&b"one ".repeat(3000)).unwrap();
        File::create(root.join("sub/two.txt")).unwrap().write_all(b"two").unwrap();
    }

    #[test]
    fn archive_cannot_be_an_input() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.bar");
        File::create(&path).unwrap();
        let err = compress(&path, &[path.clone()], &small_opts(CodecId::Nop), &mut Silent).unwrap_err();
        assert!(matches!(err, Error::Argument(_)));
    }

    #[test]
    fn missing_input_removes_nothing_and_creates_nothing() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("a.bar");
        let err = compress(&archive, &[dir.path().join("nope")], &small_opts(CodecId::Nop), &mut Silent).unwrap_err();
        assert!(matches!(err, Error::Open { .. }));
        assert!(!archive.exists());
    }

    #[test]
    fn listing_includes_derived_directories() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        tree(&src);
        let archive = dir.path().join("a.bar");
        let mut rec = Recorder::default();
        let summary = compress(&archive, &[src.clone()], &small_opts(CodecId::Flate), &mut rec).unwrap();
        assert_eq!(summary.files, 2);
        assert_eq!(rec.archived.len(), 2);

        let listing = inspect(&archive).unwrap();
        assert_eq!(listing.codec, "flate");
        assert_eq!(listing.files, 2);
        assert_eq!(listing.stored().count(), 2);
        assert!(listing.dirs >= 2);
        assert_eq!(listing.total_compressed, summary.compressed);
        assert_eq!(listing.total_size, 12_003);
        let sub = listing.entries.iter().find(|e| e.path.ends_with("src/sub")).unwrap();
        assert_eq!(sub.kind, EntryKind::Dir);
    }

    #[test]
    fn overwrite_prompt_controls_existing_files() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        tree(&src);
        let archive = dir.path().join("a.bar");
        compress(&archive, &[src], &small_opts(CodecId::GZip), &mut Silent).unwrap();

        let out = dir.path().join("out");
        let opts = ExtractOptions::new(&out);
        let first = decompress(&archive, &opts, &mut Silent).unwrap();
        assert_eq!(first.files, 2);

        let second = decompress(&archive, &opts, &mut Silent).unwrap();
        assert_eq!(second.files, 0);
        assert_eq!(second.skipped, 2);

        let mut rec = Recorder { answers: vec![Overwrite::ReplaceAll], ..Default::default() };
        let third = decompress(&archive, &opts, &mut rec).unwrap();
        assert_eq!(rec.asked, 1);
        assert_eq!(third.files, 2);
    }

    #[test]
    fn verify_reports_each_file() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src");
        tree(&src);
        let archive = dir.path().join("a.bar");
        compress(&archive, &[src], &small_opts(CodecId::Lzw), &mut Silent).unwrap();

        let mut rec = Recorder::default();
        let report = verify(&archive, &small_opts(CodecId::Lzw).pipeline, &mut rec).unwrap();
        assert_eq!(report.checked, 2);
        assert!(rec.verified.iter().all(|(_, ok)| *ok));
    }

    #[cfg(unix)]
    #[test]
    fn entries_below_a_restored_symlink_are_skipped() {
        let dir = tempdir().unwrap();
        let outside = dir.path().join("outside");
        fs::create_dir(&outside).unwrap();

        let mut bytes = Vec::new();
        frame::write_prologue(&mut bytes, CodecId::Nop).unwrap();
        let link = SymlinkHeader { target: outside.to_string_lossy().into_owned(), path: "a".into() };
        Entry::Symlink(link).write(&mut bytes).unwrap();
        let file = FileHeader { path: "a/pwned".into(), mtime: 0, atime: 0, size: 1 };
        Entry::File(file).write(&mut bytes).unwrap();
        frame::write_block(&mut bytes, b"x").unwrap();
        frame::write_end(&mut bytes, crate::checksum::koopman(b"x")).unwrap();
        let file = FileHeader { path: "b/kept".into(), mtime: 0, atime: 0, size: 1 };
        Entry::File(file).write(&mut bytes).unwrap();
        frame::write_block(&mut bytes, b"y").unwrap();
        frame::write_end(&mut bytes, crate::checksum::koopman(b"y")).unwrap();
        let archive = dir.path().join("evil.bar");
        fs::write(&archive, bytes).unwrap();

        let out = dir.path().join("out");
        let summary = decompress(&archive, &ExtractOptions::new(&out), &mut Silent).unwrap();
        assert_eq!(summary.symlinks, 1);
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.files, 1);
        assert!(!outside.join("pwned").exists());
        assert_eq!(fs::read(out.join("b/kept")).unwrap(), b"y");
    }

    #[test]
    fn bad_magic_is_a_format_error() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("junk");
        fs::write(&archive, b"PK\x03\x04").unwrap();
        let err = inspect(&archive).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Format);
    }
}
