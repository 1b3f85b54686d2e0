//! Codec registry: on-disk type bytes, compression levels and the block
//! codec interface.
//!
//! # Identity rules
//! Every archive names exactly one codec in its prologue as a single type
//! byte.  The mapping is frozen:
//!
//! | byte | codec |
//! |------|-------|
//! | 0    | GZip  |
//! | 1    | LZW   |
//! | 2    | ZLib  |
//! | 3    | Flate |
//! | 4    | Nop   |
//!
//! A reader that meets any other byte MUST fail with "unknown compressor".
//!
//! # Streams
//! A [`BlockWriter`] turns the bytes of one block into one complete codec
//! stream; a [`BlockReader`] turns one complete stream back into bytes.  Both
//! are created once per worker slot and `reset` between blocks so internal
//! state (window, hash chains) is reused rather than reallocated.

mod deflate;
mod lzw;

use std::io;
use std::sync::Arc;

use thiserror::Error;

pub use deflate::{DeflateReader, DeflateWriter, Framing, GzipReader};
pub use lzw::{LzwReader, LzwWriter};

// ── CodecId ──────────────────────────────────────────────────────────────────

/// Codec discriminant.  The `repr(u8)` value is the prologue type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CodecId {
    GZip  = 0,
    Lzw   = 1,
    ZLib  = 2,
    Flate = 3,
    Nop   = 4,
}

impl CodecId {
    /// Type byte written into the archive prologue.
    #[inline]
    pub fn as_byte(self) -> u8 {
        self as u8
    }

    /// Resolve a prologue type byte.  `None` for bytes this build does not know.
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(CodecId::GZip),
            1 => Some(CodecId::Lzw),
            2 => Some(CodecId::ZLib),
            3 => Some(CodecId::Flate),
            4 => Some(CodecId::Nop),
            _ => None,
        }
    }

    /// Human-readable name (diagnostics and CLI).
    pub fn name(self) -> &'static str {
        match self {
            CodecId::GZip  => "gzip",
            CodecId::Lzw   => "lzw",
            CodecId::ZLib  => "zlib",
            CodecId::Flate => "flate",
            CodecId::Nop   => "nop",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "gzip"            => Some(CodecId::GZip),
            "lzw"             => Some(CodecId::Lzw),
            "zlib"            => Some(CodecId::ZLib),
            "flate"|"deflate" => Some(CodecId::Flate),
            "nop"|"none"      => Some(CodecId::Nop),
            _                 => None,
        }
    }

    /// GZip, ZLib and Flate honour the level; LZW and Nop ignore it.
    pub fn uses_level(self) -> bool {
        matches!(self, CodecId::GZip | CodecId::ZLib | CodecId::Flate)
    }

    /// Preset dictionaries exist only for the zlib and raw deflate streams.
    pub fn supports_dictionary(self) -> bool {
        matches!(self, CodecId::ZLib | CodecId::Flate)
    }
}

// ── Level ────────────────────────────────────────────────────────────────────

/// Compression level in `[-2, 9]`.
///
/// `-2` requests huffman-only coding, `-1` codec default, `0` no compression
/// (selects the Nop codec), `1..=9` the usual speed/ratio scale.
///
/// `flate2` has no strategy setting, so `-2` is accepted but runs the
/// deflate codecs at level 1 with normal LZ77 matching.  Output stays a
/// valid stream for any reader; it is not huffman-only on the wire.  LZW
/// ignores the level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Level(i8);

impl Level {
    pub const HUFFMAN_ONLY: Level = Level(-2);
    pub const DEFAULT:      Level = Level(-1);
    pub const NONE:         Level = Level(0);
    pub const BEST:         Level = Level(9);

    pub fn new(level: i32) -> Result<Self, CodecError> {
        if (-2..=9).contains(&level) {
            Ok(Level(level as i8))
        } else {
            Err(CodecError::InvalidLevel(level))
        }
    }

    #[inline]
    pub fn get(self) -> i32 {
        self.0 as i32
    }

    /// Map onto the deflate engine's scale.  [`Level::HUFFMAN_ONLY`] becomes
    /// `Compression::fast()`.
    pub fn compression(self) -> flate2::Compression {
        match self.0 {
            -2 => flate2::Compression::fast(),
            -1 => flate2::Compression::default(),
            n  => flate2::Compression::new(n as u32),
        }
    }
}

impl Default for Level {
    fn default() -> Self {
        Level::DEFAULT
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("compression failed: {0}")]
    Compression(String),
    #[error("decompression failed: {0}")]
    Decompression(String),
    #[error("compression level {0} outside -2..9")]
    InvalidLevel(i32),
    #[error("unknown codec '{0}'")]
    UnknownCodec(String),
    #[error("custom dictionaries are not supported by the {0} codec")]
    DictionaryUnsupported(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Stream traits ────────────────────────────────────────────────────────────

/// Compressing half of a codec, bound to one worker slot.
///
/// Call order per block: `reset`, any number of `write`, then `close`.
/// Output is appended to the caller's sink.
pub trait BlockWriter: Send {
    /// Begin a new stream, keeping allocated codec state.
    fn reset(&mut self) -> Result<(), CodecError>;
    /// Feed uncompressed bytes.
    fn write(&mut self, data: &[u8], sink: &mut Vec<u8>) -> Result<(), CodecError>;
    /// Flush terminal codec state; `sink` then ends with a complete stream.
    fn close(&mut self, sink: &mut Vec<u8>) -> Result<(), CodecError>;
}

/// Decompressing half of a codec, bound to one worker slot.
pub trait BlockReader: Send {
    /// Begin a new stream, keeping allocated codec state.
    fn reset(&mut self) -> Result<(), CodecError>;
    /// Decode the whole of `source` into `out`.  A stream that ends early is
    /// treated as complete.
    fn read_to_end(&mut self, source: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError>;
}

// ── Nop codec ────────────────────────────────────────────────────────────────

/// Identity pass-through.
#[derive(Debug, Default)]
pub struct NopWriter;

impl BlockWriter for NopWriter {
    fn reset(&mut self) -> Result<(), CodecError> { Ok(()) }
    fn write(&mut self, data: &[u8], sink: &mut Vec<u8>) -> Result<(), CodecError> {
        sink.extend_from_slice(data);
        Ok(())
    }
    fn close(&mut self, _: &mut Vec<u8>) -> Result<(), CodecError> { Ok(()) }
}

#[derive(Debug, Default)]
pub struct NopReader;

impl BlockReader for NopReader {
    fn reset(&mut self) -> Result<(), CodecError> { Ok(()) }
    fn read_to_end(&mut self, source: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.extend_from_slice(source);
        Ok(())
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

/// Everything needed to build the writers and readers of one archive.
#[derive(Debug, Clone)]
pub struct CodecOptions {
    pub codec:      CodecId,
    pub level:      Level,
    pub dictionary: Option<Arc<[u8]>>,
}

impl CodecOptions {
    pub fn new(codec: CodecId) -> Self {
        Self { codec, level: Level::DEFAULT, dictionary: None }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_dictionary(mut self, dictionary: Vec<u8>) -> Self {
        self.dictionary = Some(dictionary.into());
        self
    }

    /// Level 0 means "store": the archive is written with the Nop codec.
    pub fn effective_codec(&self) -> CodecId {
        if self.level == Level::NONE { CodecId::Nop } else { self.codec }
    }

    pub fn validate(&self) -> Result<(), CodecError> {
        if self.dictionary.is_some() && !self.effective_codec().supports_dictionary() {
            return Err(CodecError::DictionaryUnsupported(self.effective_codec().name()));
        }
        Ok(())
    }

    pub fn make_writer(&self) -> Result<Box<dyn BlockWriter>, CodecError> {
        self.validate()?;
        let dict = self.dictionary.clone();
        Ok(match self.effective_codec() {
            CodecId::Nop   => Box::new(NopWriter),
            CodecId::Lzw   => Box::new(LzwWriter::new()),
            CodecId::GZip  => Box::new(DeflateWriter::new(Framing::Gzip, self.level, None)),
            CodecId::ZLib  => Box::new(DeflateWriter::new(Framing::Zlib, self.level, dict)),
            CodecId::Flate => Box::new(DeflateWriter::new(Framing::Raw, self.level, dict)),
        })
    }

    pub fn make_reader(&self) -> Result<Box<dyn BlockReader>, CodecError> {
        self.validate()?;
        let dict = self.dictionary.clone();
        Ok(match self.effective_codec() {
            CodecId::Nop   => Box::new(NopReader),
            CodecId::Lzw   => Box::new(LzwReader::new()),
            CodecId::GZip  => Box::new(GzipReader),
            CodecId::ZLib  => Box::new(DeflateReader::new(Framing::Zlib, dict)?),
            CodecId::Flate => Box::new(DeflateReader::new(Framing::Raw, dict)?),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [CodecId; 5] = [CodecId::GZip, CodecId::Lzw, CodecId::ZLib, CodecId::Flate, CodecId::Nop];

    fn sample() -> Vec<u8> {
        let mut v = Vec::new();
        for i in 0..20_000u32 {
            v.extend_from_slice(format!("line {} of the sample corpus\n", i % 97).as_bytes());
        }
        v
    }

    fn roundtrip(opts: &CodecOptions, data: &[u8]) -> Vec<u8> {
        let mut w = opts.make_writer().unwrap();
        let mut packed = Vec::new();
        w.reset().unwrap();
        for chunk in data.chunks(7_000) {
            w.write(chunk, &mut packed).unwrap();
        }
        w.close(&mut packed).unwrap();

        let mut r = opts.make_reader().unwrap();
        r.reset().unwrap();
        let mut out = Vec::new();
        r.read_to_end(&packed, &mut out).unwrap();
        out
    }

    #[test]
    fn type_bytes_are_frozen() {
        for id in ALL {
            assert_eq!(CodecId::from_byte(id.as_byte()), Some(id));
        }
        assert_eq!(CodecId::GZip.as_byte(), 0);
        assert_eq!(CodecId::Nop.as_byte(), 4);
        assert_eq!(CodecId::from_byte(5), None);
    }

    #[test]
    fn every_codec_restores_input() {
        let data = sample();
        for id in ALL {
            let out = roundtrip(&CodecOptions::new(id), &data);
            assert_eq!(out, data, "codec {}", id.name());
        }
    }

    #[test]
    fn writers_are_reusable_after_reset() {
        let data = sample();
        let opts = CodecOptions::new(CodecId::ZLib).with_level(Level::BEST);
        let mut w = opts.make_writer().unwrap();
        let mut first = Vec::new();
        let mut second = Vec::new();
        for sink in [&mut first, &mut second] {
            w.reset().unwrap();
            w.write(&data, sink).unwrap();
            w.close(sink).unwrap();
        }
        assert_eq!(first, second);
        assert!(first.len() < data.len() / 4);
    }

    #[test]
    fn level_bounds() {
        assert!(Level::new(-2).is_ok());
        assert!(Level::new(9).is_ok());
        assert!(matches!(Level::new(10), Err(CodecError::InvalidLevel(10))));
        assert!(matches!(Level::new(-3), Err(CodecError::InvalidLevel(-3))));
    }

    #[test]
    fn huffman_only_runs_as_fastest_level() {
        assert_eq!(Level::HUFFMAN_ONLY.compression(), flate2::Compression::fast());
        assert_eq!(Level::new(1).unwrap().compression(), flate2::Compression::fast());
        assert_eq!(Level::DEFAULT.compression(), flate2::Compression::default());

        let data = sample();
        for codec in [CodecId::GZip, CodecId::ZLib, CodecId::Flate] {
            let opts = CodecOptions::new(codec).with_level(Level::HUFFMAN_ONLY);
            assert_eq!(roundtrip(&opts, &data), data, "{}", codec.name());
        }
    }

    #[test]
    fn level_zero_selects_nop() {
        let opts = CodecOptions::new(CodecId::GZip).with_level(Level::NONE);
        assert_eq!(opts.effective_codec(), CodecId::Nop);
    }

    #[test]
    fn dictionary_rejected_for_gzip_and_lzw() {
        for id in [CodecId::GZip, CodecId::Lzw, CodecId::Nop] {
            let opts = CodecOptions::new(id).with_dictionary(b"dict".to_vec());
            assert!(matches!(opts.make_writer(), Err(CodecError::DictionaryUnsupported(_))));
        }
    }

    #[test]
    fn dictionary_roundtrip() {
        let dict = b"line of the sample corpus\n".repeat(8);
        let data = sample();
        for id in [CodecId::ZLib, CodecId::Flate] {
            let opts = CodecOptions::new(id).with_dictionary(dict.clone());
            assert_eq!(roundtrip(&opts, &data), data, "codec {}", id.name());
        }
    }

    #[test]
    fn names_parse_back() {
        for id in ALL {
            assert_eq!(CodecId::from_name(id.name()), Some(id));
        }
        assert_eq!(CodecId::from_name("GZIP"), Some(CodecId::GZip));
        assert_eq!(CodecId::from_name("zstd"), None);
    }
}
