//! GZip, ZLib and Flate adapters over one shared deflate engine.
//!
//! The three codecs differ only in the framing wrapped around the deflate
//! stream:
//!
//! | codec | framing                                          |
//! |-------|--------------------------------------------------|
//! | Flate | none (raw deflate)                               |
//! | ZLib  | 2-byte header, Adler-32 trailer (engine-written) |
//! | GZip  | 10-byte header, CRC-32 + ISIZE trailer           |
//!
//! The gzip member header and trailer are written here so that the engine
//! can run in raw mode and be `reset` between blocks instead of rebuilt.

use std::io::Read;
use std::sync::Arc;

use flate2::{Compress, Compression, Crc, Decompress, FlushCompress, FlushDecompress, Status};

use super::{BlockReader, BlockWriter, CodecError, Level};

/// Spare output capacity guaranteed before each engine call.
const MIN_SPARE: usize = 32 * 1024;

const GZIP_ID1:     u8 = 0x1f;
const GZIP_ID2:     u8 = 0x8b;
const GZIP_DEFLATE: u8 = 0x08;
const GZIP_OS_UNKNOWN: u8 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Raw,
    Zlib,
    Gzip,
}

fn ensure_spare(buf: &mut Vec<u8>) {
    if buf.capacity() - buf.len() < MIN_SPARE {
        buf.reserve(MIN_SPARE * 2);
    }
}

// ── Writer ───────────────────────────────────────────────────────────────────

pub struct DeflateWriter {
    engine:     Compress,
    framing:    Framing,
    level:      Compression,
    dictionary: Option<Arc<[u8]>>,
    /// Gzip trailer state (CRC-32 and length of the uncompressed input).
    crc:        Crc,
    started:    bool,
}

impl DeflateWriter {
    pub fn new(framing: Framing, level: Level, dictionary: Option<Arc<[u8]>>) -> Self {
        let compression = level.compression();
        Self {
            engine:     Compress::new(compression, framing == Framing::Zlib),
            framing,
            level:      compression,
            dictionary,
            crc:        Crc::new(),
            started:    false,
        }
    }

    fn gzip_header(&self) -> [u8; 10] {
        let xfl = match self.level.level() {
            9 => 2,
            1 => 4,
            _ => 0,
        };
        [GZIP_ID1, GZIP_ID2, GZIP_DEFLATE, 0, 0, 0, 0, 0, xfl, GZIP_OS_UNKNOWN]
    }

    fn begin(&mut self, sink: &mut Vec<u8>) {
        if !self.started {
            if self.framing == Framing::Gzip {
                sink.extend_from_slice(&self.gzip_header());
            }
            self.started = true;
        }
    }
}

impl BlockWriter for DeflateWriter {
    fn reset(&mut self) -> Result<(), CodecError> {
        self.engine.reset();
        self.crc.reset();
        self.started = false;
        if let Some(dict) = &self.dictionary {
            self.engine
                .set_dictionary(dict)
                .map_err(|e| CodecError::Compression(e.to_string()))?;
        }
        Ok(())
    }

    fn write(&mut self, mut data: &[u8], sink: &mut Vec<u8>) -> Result<(), CodecError> {
        self.begin(sink);
        if self.framing == Framing::Gzip {
            self.crc.update(data);
        }
        while !data.is_empty() {
            ensure_spare(sink);
            let before_in  = self.engine.total_in();
            let before_out = self.engine.total_out();
            self.engine
                .compress_vec(data, sink, FlushCompress::None)
                .map_err(|e| CodecError::Compression(e.to_string()))?;
            let consumed = (self.engine.total_in() - before_in) as usize;
            if consumed == 0 && self.engine.total_out() == before_out {
                return Err(CodecError::Compression("deflate engine made no progress".into()));
            }
            data = &data[consumed..];
        }
        Ok(())
    }

    fn close(&mut self, sink: &mut Vec<u8>) -> Result<(), CodecError> {
        self.begin(sink);
        loop {
            ensure_spare(sink);
            let before_out = self.engine.total_out();
            let status = self.engine
                .compress_vec(&[], sink, FlushCompress::Finish)
                .map_err(|e| CodecError::Compression(e.to_string()))?;
            if matches!(status, Status::StreamEnd) {
                break;
            }
            if self.engine.total_out() == before_out {
                return Err(CodecError::Compression("deflate engine stalled while finishing".into()));
            }
        }
        if self.framing == Framing::Gzip {
            sink.extend_from_slice(&self.crc.sum().to_le_bytes());
            sink.extend_from_slice(&self.crc.amount().to_le_bytes());
        }
        Ok(())
    }
}

// ── Readers ──────────────────────────────────────────────────────────────────

/// Raw deflate and zlib streams, engine reused across blocks.
pub struct DeflateReader {
    engine:     Decompress,
    framing:    Framing,
    dictionary: Option<Arc<[u8]>>,
}

impl DeflateReader {
    pub fn new(framing: Framing, dictionary: Option<Arc<[u8]>>) -> Result<Self, CodecError> {
        let mut reader = Self {
            engine: Decompress::new(framing == Framing::Zlib),
            framing,
            dictionary,
        };
        reader.preset()?;
        Ok(reader)
    }

    /// Raw streams take the dictionary up front; zlib streams ask for it.
    fn preset(&mut self) -> Result<(), CodecError> {
        if self.framing == Framing::Raw {
            if let Some(dict) = &self.dictionary {
                self.engine
                    .set_dictionary(dict)
                    .map_err(|e| CodecError::Decompression(e.to_string()))?;
            }
        }
        Ok(())
    }
}

impl BlockReader for DeflateReader {
    fn reset(&mut self) -> Result<(), CodecError> {
        self.engine.reset(self.framing == Framing::Zlib);
        self.preset()
    }

    fn read_to_end(&mut self, source: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
        loop {
            let consumed   = self.engine.total_in() as usize;
            let before_out = self.engine.total_out();
            ensure_spare(out);
            let status = match self.engine.decompress_vec(&source[consumed..], out, FlushDecompress::None) {
                Ok(status) => status,
                Err(e) if e.needs_dictionary().is_some() => {
                    let dict = self.dictionary.as_ref().ok_or_else(|| {
                        CodecError::Decompression("stream requires a preset dictionary".into())
                    })?;
                    self.engine
                        .set_dictionary(dict)
                        .map_err(|e| CodecError::Decompression(e.to_string()))?;
                    continue;
                }
                Err(e) => return Err(CodecError::Decompression(e.to_string())),
            };
            if matches!(status, Status::StreamEnd) {
                return Ok(());
            }
            let progressed = self.engine.total_in() as usize != consumed
                || self.engine.total_out() != before_out;
            if !progressed {
                if consumed >= source.len() {
                    // Stream cut short: everything available has been produced.
                    return Ok(());
                }
                return Err(CodecError::Decompression("inflate made no progress".into()));
            }
        }
    }
}

/// Gzip members; header fields are parsed by the decoder.
#[derive(Debug, Default)]
pub struct GzipReader;

impl BlockReader for GzipReader {
    fn reset(&mut self) -> Result<(), CodecError> { Ok(()) }

    fn read_to_end(&mut self, source: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
        match flate2::bufread::GzDecoder::new(source).read_to_end(out) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(()),
            Err(e) => Err(CodecError::Decompression(e.to_string())),
        }
    }
}
