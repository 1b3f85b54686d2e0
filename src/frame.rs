//! Binary framing of the archive stream.
//!
//! # Layout
//! ```text
//! archive  = magic:u16 (0x5717) | codec:u8 | entry* | <end of file>
//! entry    = tag:u8 (0 = symlink, 1 = file) | body
//! file     = path | mtime:i64 | atime:i64 | uc_size:i64 | block* | -1:i64 | crc:u32
//! block    = len:i64 (>= 0) | bytes[len]
//! symlink  = target path | in-archive path
//! path     = len:i16 (1..=1023) | bytes[len]
//! ```
//! Every integer is little-endian.  No padding, no alignment, no entry
//! count: the reader walks entries until the underlying stream ends.

use std::io::{self, ErrorKind, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

use crate::codec::CodecId;

pub const MAGIC: u16 = 0x5717;
/// Bytes occupied by magic + codec byte.
pub const PROLOGUE_SIZE: u64 = 3;
/// Longest path accepted on the wire, in bytes.
pub const MAX_PATH_LEN: usize = 1023;
/// Block length value that terminates a file's block stream.
pub const END_OF_BLOCKS: i64 = -1;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("invalid magic number {0:#06x}")]
    BadMagic(u16),
    #[error("unknown compressor type {0}")]
    UnknownCompressor(u8),
    #[error("unknown entry tag {0}")]
    UnknownTag(u8),
    #[error("path length {0} outside 1..={MAX_PATH_LEN}")]
    PathLength(i64),
    #[error("path is not valid UTF-8")]
    PathEncoding,
    #[error("invalid block size {0}")]
    InvalidBlockSize(i64),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Prologue ─────────────────────────────────────────────────────────────────

pub fn write_prologue<W: Write>(mut w: W, codec: CodecId) -> io::Result<()> {
    w.write_u16::<LittleEndian>(MAGIC)?;
    w.write_u8(codec.as_byte())
}

pub fn read_prologue<R: Read>(mut r: R) -> Result<CodecId, FrameError> {
    let magic = r.read_u16::<LittleEndian>()?;
    if magic != MAGIC {
        return Err(FrameError::BadMagic(magic));
    }
    let b = r.read_u8()?;
    CodecId::from_byte(b).ok_or(FrameError::UnknownCompressor(b))
}

// ── Paths ────────────────────────────────────────────────────────────────────

/// Normalise a path into its in-archive form: slash-separated, no leading
/// `/`, no `.` or empty components, `..` resolved lexically and never
/// above the root.
pub fn clean_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for part in unified.split('/') {
        match part {
            "" | "." => {}
            ".."     => { parts.pop(); }
            p        => parts.push(p),
        }
    }
    parts.join("/")
}

/// `Ok` when `path` fits the wire limits.
pub fn check_path(path: &str) -> Result<(), FrameError> {
    if path.is_empty() || path.len() > MAX_PATH_LEN {
        return Err(FrameError::PathLength(path.len() as i64));
    }
    Ok(())
}

fn write_path<W: Write>(mut w: W, path: &str) -> Result<(), FrameError> {
    check_path(path)?;
    w.write_i16::<LittleEndian>(path.len() as i16)?;
    w.write_all(path.as_bytes())?;
    Ok(())
}

fn read_path<R: Read>(mut r: R) -> Result<String, FrameError> {
    let len = r.read_i16::<LittleEndian>()?;
    if len < 1 || len as usize > MAX_PATH_LEN {
        return Err(FrameError::PathLength(len as i64));
    }
    let mut buf = vec![0u8; len as usize];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf).map_err(|_| FrameError::PathEncoding)
}

// ── Entries ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryTag {
    Symlink = 0,
    File    = 1,
}

/// Header of a regular file; the block stream follows it on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub path:  String,
    /// Modification time, unix seconds.
    pub mtime: i64,
    /// Access time, unix seconds.
    pub atime: i64,
    /// Uncompressed size when the file was stat'ed.  Informational only.
    pub size:  i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymlinkHeader {
    /// Link target as found on disk.
    pub target: String,
    pub path:   String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    File(FileHeader),
    Symlink(SymlinkHeader),
}

impl Entry {
    pub fn path(&self) -> &str {
        match self {
            Entry::File(f)    => &f.path,
            Entry::Symlink(s) => &s.path,
        }
    }

    pub fn tag(&self) -> EntryTag {
        match self {
            Entry::File(_)    => EntryTag::File,
            Entry::Symlink(_) => EntryTag::Symlink,
        }
    }

    /// Write tag and header.  For files the caller appends the block stream.
    pub fn write<W: Write>(&self, mut w: W) -> Result<(), FrameError> {
        w.write_u8(self.tag() as u8)?;
        match self {
            Entry::File(f) => {
                write_path(&mut w, &f.path)?;
                w.write_i64::<LittleEndian>(f.mtime)?;
                w.write_i64::<LittleEndian>(f.atime)?;
                w.write_i64::<LittleEndian>(f.size)?;
            }
            Entry::Symlink(s) => {
                write_path(&mut w, &s.target)?;
                write_path(&mut w, &s.path)?;
            }
        }
        Ok(())
    }

    /// Read the next tag and header.  `Ok(None)` at a clean end of stream.
    pub fn read<R: Read>(mut r: R) -> Result<Option<Self>, FrameError> {
        let mut tag = [0u8; 1];
        loop {
            match r.read(&mut tag) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        match tag[0] {
            t if t == EntryTag::File as u8 => {
                let path  = read_path(&mut r)?;
                let mtime = r.read_i64::<LittleEndian>()?;
                let atime = r.read_i64::<LittleEndian>()?;
                let size  = r.read_i64::<LittleEndian>()?;
                Ok(Some(Entry::File(FileHeader { path, mtime, atime, size })))
            }
            t if t == EntryTag::Symlink as u8 => {
                let target = read_path(&mut r)?;
                let path   = read_path(&mut r)?;
                Ok(Some(Entry::Symlink(SymlinkHeader { target, path })))
            }
            t => Err(FrameError::UnknownTag(t)),
        }
    }
}

// ── Block frames ─────────────────────────────────────────────────────────────

/// Decoded block length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockLen {
    Data(usize),
    End,
}

pub fn write_block<W: Write>(mut w: W, bytes: &[u8]) -> io::Result<()> {
    w.write_i64::<LittleEndian>(bytes.len() as i64)?;
    w.write_all(bytes)
}

/// Terminate a block stream and append the file checksum.
pub fn write_end<W: Write>(mut w: W, crc: u32) -> io::Result<()> {
    w.write_i64::<LittleEndian>(END_OF_BLOCKS)?;
    w.write_u32::<LittleEndian>(crc)
}

/// Read one length field.  Negative values other than the end sentinel and
/// lengths above `ceiling` are corruption.
pub fn read_block_len<R: Read>(mut r: R, ceiling: usize) -> Result<BlockLen, FrameError> {
    let len = r.read_i64::<LittleEndian>()?;
    if len == END_OF_BLOCKS {
        return Ok(BlockLen::End);
    }
    if len < 0 || (len >> 1) > len || len as u64 > ceiling as u64 {
        return Err(FrameError::InvalidBlockSize(len));
    }
    Ok(BlockLen::Data(len as usize))
}

pub fn read_crc<R: Read>(mut r: R) -> io::Result<u32> {
    r.read_u32::<LittleEndian>()
}
