//! Parallel block compressor / decompressor.
//!
//! # Slots
//! The pipeline owns N fixed worker slots (N = logical CPUs by default).
//! Each slot holds one uncompressed buffer, one compressed buffer, one codec
//! writer and one codec reader.  Buffers are allocated once and reused for
//! every file; writers and readers are `reset` between blocks.
//!
//! # Compression cycle
//! 1. **Fill** (calling thread): read up to `block_size` bytes into each
//!    slot's uncompressed buffer, in slot order.
//! 2. **Compress** (worker pool): every non-empty slot runs reset → write →
//!    close into its compressed buffer.  The phase ends when the slowest
//!    slot finishes; the lowest-numbered failing slot's error wins.
//! 3. **Drain** (calling thread): frames go to the [`WriteBuffer`] in slot
//!    order and each block's CRC is XOR-merged into the file checksum.
//!    A full write buffer is flushed in the background.
//!
//! Cycles repeat until a fill reads nothing; the stream is then closed with
//! the `-1` sentinel and the checksum.
//!
//! # Decompression cycle
//! Mirror image: **load** frames into compressed buffers (verifying lengths
//! and merging CRCs), **decompress** in parallel, **drain** in slot order.
//!
//! Frame order on disk is slot order within a cycle and cycle order within a
//! file, so output is identical for a given input, codec and slot count.

use std::io::{Read, Seek, Write};

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::checksum::BlockCrc;
use crate::codec::{BlockReader, BlockWriter, CodecError, CodecOptions};
use crate::error::{Error, ResultExt};
use crate::frame::{self, BlockLen};
use crate::write_buffer::WriteBuffer;

/// Default uncompressed block size: 1 MiB.
pub const DEFAULT_BLOCK_SIZE:   usize = 1024 * 1024;
/// Default write buffer flush threshold: 1 MiB.
pub const DEFAULT_WRITE_BUFFER: usize = 1024 * 1024;
/// Largest block size accepted by [`PipelineConfig::validate`].
pub const MAX_BLOCK_SIZE:       usize = 16 * 1024 * 1024;
/// Default ceiling on a frame length read from an archive.
pub const DEFAULT_MAX_BLOCK_LEN: usize = 64 * 1024 * 1024;

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of worker slots.
    pub workers:       usize,
    /// Uncompressed bytes per block.
    pub block_size:    usize,
    /// Write buffer flush threshold.
    pub write_buffer:  usize,
    /// Frames longer than this are treated as corruption on read.
    pub max_block_len: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers:       num_cpus::get().max(1),
            block_size:    DEFAULT_BLOCK_SIZE,
            write_buffer:  DEFAULT_WRITE_BUFFER,
            max_block_len: DEFAULT_MAX_BLOCK_LEN,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::Argument("worker count must be at least 1".into()));
        }
        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            return Err(Error::Argument(format!(
                "block size must be between 1 and {MAX_BLOCK_SIZE} bytes"
            )));
        }
        if self.write_buffer == 0 {
            return Err(Error::Argument("write buffer size must be at least 1".into()));
        }
        Ok(())
    }
}

// ── Results ──────────────────────────────────────────────────────────────────

/// Outcome of pushing one file through the compressor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedFile {
    pub uncompressed: u64,
    pub compressed:   u64,
    pub blocks:       u64,
    pub crc:          u32,
}

/// Checksum comparison for one file's block stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStream {
    /// Checksum stored after the end sentinel.
    pub stored:     u32,
    /// Checksum recomputed from the frames (equal to `stored` when skipped).
    pub computed:   u32,
    pub compressed: u64,
    pub blocks:     u64,
    /// Bytes produced by decompression; zero when only verified or skipped.
    pub restored:   u64,
}

impl BlockStream {
    pub fn is_intact(&self) -> bool {
        self.stored == self.computed
    }
}

// ── Slot ─────────────────────────────────────────────────────────────────────

struct Slot {
    plain:  Vec<u8>,
    packed: Vec<u8>,
    writer: Option<Box<dyn BlockWriter>>,
    reader: Option<Box<dyn BlockReader>>,
}

impl Slot {
    fn new(block_size: usize) -> Self {
        Self {
            plain:  Vec::with_capacity(block_size),
            packed: Vec::with_capacity(block_size),
            writer: None,
            reader: None,
        }
    }

    fn clear(&mut self) {
        self.plain.clear();
        self.packed.clear();
    }

    fn compress(&mut self) -> Result<(), CodecError> {
        if self.plain.is_empty() {
            return Ok(());
        }
        let writer = self.writer.as_mut().ok_or_else(|| {
            CodecError::Compression("slot has no codec writer".into())
        })?;
        writer.reset()?;
        writer.write(&self.plain, &mut self.packed)?;
        writer.close(&mut self.packed)
    }

    fn decompress(&mut self) -> Result<(), CodecError> {
        if self.packed.is_empty() {
            return Ok(());
        }
        let reader = self.reader.as_mut().ok_or_else(|| {
            CodecError::Decompression("slot has no codec reader".into())
        })?;
        reader.read_to_end(&self.packed, &mut self.plain)
    }
}

/// First error in slot order.
fn first_error(results: Vec<(usize, Result<(), CodecError>)>, what: &str) -> Result<(), Error> {
    for (i, r) in results {
        r.context(format!("{what} in worker slot {i}"))?;
    }
    Ok(())
}

// ── Pipeline ─────────────────────────────────────────────────────────────────

pub struct Pipeline {
    config: PipelineConfig,
    codec:  CodecOptions,
    slots:  Vec<Slot>,
    pool:   rayon::ThreadPool,
}

impl Pipeline {
    pub fn new(codec: CodecOptions, config: PipelineConfig) -> Result<Self, Error> {
        config.validate()?;
        codec.validate().context("configuring codec")?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("blockarc-worker-{i}"))
            .build()?;
        let slots = (0..config.workers).map(|_| Slot::new(config.block_size)).collect();
        debug!(workers = config.workers, block_size = config.block_size, codec = codec.effective_codec().name(), "pipeline ready");
        Ok(Self { config, codec, slots, pool })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn codec(&self) -> &CodecOptions {
        &self.codec
    }

    pub fn workers(&self) -> usize {
        self.slots.len()
    }

    /// Build every slot's codec writer up front.
    pub fn init_writers(&mut self) -> Result<(), Error> {
        for slot in &mut self.slots {
            if slot.writer.is_none() {
                slot.writer = Some(self.codec.make_writer().context("creating codec writer")?);
            }
        }
        Ok(())
    }

    // ── Compression ──────────────────────────────────────────────────────────

    /// Compress all of `input` as one file's block stream, ending with the
    /// sentinel and checksum.
    pub fn compress_file<R, W>(&mut self, input: &mut R, out: &mut WriteBuffer<W>) -> Result<CompressedFile, Error>
    where
        R: Read,
        W: Write + Send + 'static,
    {
        self.init_writers()?;
        let block_size = self.config.block_size as u64;
        let mut crc = BlockCrc::new();
        let mut uncompressed = 0u64;
        let mut cycle = 0u64;

        loop {
            // Fill.
            let mut filled = 0usize;
            for slot in &mut self.slots {
                slot.clear();
                let n = input
                    .by_ref()
                    .take(block_size)
                    .read_to_end(&mut slot.plain)
                    .context("reading input file")?;
                filled += n;
                if (n as u64) < block_size {
                    break;
                }
            }
            if filled == 0 {
                break;
            }
            uncompressed += filled as u64;
            trace!(cycle, filled, "fill done");

            // Compress.
            let Self { pool, slots, .. } = &mut *self;
            let results: Vec<(usize, Result<(), CodecError>)> = pool.install(|| {
                slots.par_iter_mut().enumerate().map(|(i, s)| (i, s.compress())).collect()
            });
            first_error(results, "compressing block")?;

            // Drain.
            for (i, slot) in self.slots.iter_mut().enumerate() {
                if slot.packed.is_empty() {
                    continue;
                }
                frame::write_block(&mut *out, &slot.packed).context("writing block frame")?;
                crc.update(&slot.packed);
                debug!(cycle, slot = i, plain = slot.plain.len(), packed = slot.packed.len(), "block");
                slot.clear();
                if out.should_flush() {
                    out.flush_async()?;
                }
            }
            cycle += 1;
        }

        out.wait()?;
        frame::write_end(&mut *out, crc.value()).context("writing block stream trailer")?;
        Ok(CompressedFile {
            uncompressed,
            compressed: crc.bytes(),
            blocks:     crc.blocks(),
            crc:        crc.value(),
        })
    }

    // ── Decompression ────────────────────────────────────────────────────────

    /// Load phase: read up to one frame per slot.  Returns true when the end
    /// sentinel was reached.
    fn load_cycle<R: Read>(&mut self, input: &mut R, crc: &mut BlockCrc, with_readers: bool) -> Result<bool, Error> {
        let ceiling = self.config.max_block_len;
        for slot in &mut self.slots {
            slot.clear();
            let len = match frame::read_block_len(&mut *input, ceiling)? {
                BlockLen::End     => return Ok(true),
                BlockLen::Data(n) => n,
            };
            let got = input
                .by_ref()
                .take(len as u64)
                .read_to_end(&mut slot.packed)
                .context("reading block payload")?;
            if got != len {
                return Err(Error::io(
                    "reading block payload",
                    std::io::Error::new(std::io::ErrorKind::UnexpectedEof, format!("block truncated: {got} of {len} bytes")),
                ));
            }
            crc.update(&slot.packed);
            if with_readers {
                match slot.reader.as_mut() {
                    Some(reader) => reader.reset().context("resetting codec reader")?,
                    None => slot.reader = Some(self.codec.make_reader().context("creating codec reader")?),
                }
            }
        }
        Ok(false)
    }

    /// Decompress one file's block stream into `out` and compare checksums.
    /// A mismatch is reported in the result, not as an error.
    pub fn decompress_file<R, W>(&mut self, input: &mut R, out: &mut WriteBuffer<W>) -> Result<BlockStream, Error>
    where
        R: Read,
        W: Write + Send + 'static,
    {
        let mut crc = BlockCrc::new();
        let mut restored = 0u64;
        loop {
            let end = self.load_cycle(input, &mut crc, true)?;

            let Self { pool, slots, .. } = &mut *self;
            let results: Vec<(usize, Result<(), CodecError>)> = pool.install(|| {
                slots.par_iter_mut().enumerate().map(|(i, s)| (i, s.decompress())).collect()
            });
            first_error(results, "decompressing block")?;

            for slot in &mut self.slots {
                if !slot.plain.is_empty() {
                    out.append(&slot.plain);
                    restored += slot.plain.len() as u64;
                }
                slot.clear();
                if out.should_flush() {
                    out.flush_async()?;
                }
            }
            if end {
                break;
            }
        }
        let stored = frame::read_crc(&mut *input).context("reading block stream checksum")?;
        Ok(BlockStream {
            stored,
            computed:   crc.value(),
            compressed: crc.bytes(),
            blocks:     crc.blocks(),
            restored,
        })
    }

    /// Integrity pass: load frames and accumulate checksums without decoding.
    pub fn verify_file<R: Read>(&mut self, input: &mut R) -> Result<BlockStream, Error> {
        let mut crc = BlockCrc::new();
        while !self.load_cycle(input, &mut crc, false)? {}
        for slot in &mut self.slots {
            slot.clear();
        }
        let stored = frame::read_crc(&mut *input).context("reading block stream checksum")?;
        Ok(BlockStream {
            stored,
            computed:   crc.value(),
            compressed: crc.bytes(),
            blocks:     crc.blocks(),
            restored:   0,
        })
    }

    /// Skip one file's block stream using the frame lengths.  The stored
    /// checksum is read but not verified.
    pub fn skip_file<R: Read + Seek>(&self, input: &mut R) -> Result<BlockStream, Error> {
        skip_blocks(input, self.config.max_block_len)
    }
}

/// Seek past a block stream without a pipeline.
pub fn skip_blocks<R: Read + Seek>(input: &mut R, ceiling: usize) -> Result<BlockStream, Error> {
    let mut compressed = 0u64;
    let mut blocks = 0u64;
    loop {
        match frame::read_block_len(&mut *input, ceiling)? {
            BlockLen::End => break,
            BlockLen::Data(n) => {
                input.seek_relative(n as i64).context("skipping block payload")?;
                compressed += n as u64;
                blocks += 1;
            }
        }
    }
    let stored = frame::read_crc(&mut *input).context("reading block stream checksum")?;
    Ok(BlockStream { stored, computed: stored, compressed, blocks, restored: 0 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::koopman;
    use crate::codec::{CodecId, Level};
    use std::io::{BufReader, Cursor, SeekFrom};

    fn config(workers: usize, block_size: usize) -> PipelineConfig {
        PipelineConfig { workers, block_size, write_buffer: 4096, max_block_len: DEFAULT_MAX_BLOCK_LEN }
    }

    fn pseudo_random(len: usize) -> Vec<u8> {
        let mut state = 0x2545_F491_4F6C_DD1Du64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect()
    }

    fn compress(p: &mut Pipeline, data: &[u8]) -> (Vec<u8>, CompressedFile) {
        let mut out = WriteBuffer::new(Vec::new(), p.config().write_buffer);
        let summary = p.compress_file(&mut Cursor::new(data), &mut out).unwrap();
        (out.into_inner().unwrap(), summary)
    }

    fn frame_lengths(stream: &[u8]) -> Vec<i64> {
        let mut r = Cursor::new(stream);
        let mut lens = Vec::new();
        loop {
            match frame::read_block_len(&mut r, usize::MAX).unwrap() {
                BlockLen::End => break,
                BlockLen::Data(n) => {
                    lens.push(n as i64);
                    r.seek(SeekFrom::Current(n as i64)).unwrap();
                }
            }
        }
        lens
    }

    #[test]
    fn empty_input_is_sentinel_and_zero_crc() {
        let mut p = Pipeline::new(CodecOptions::new(CodecId::GZip), config(2, 16)).unwrap();
        let (stream, summary) = compress(&mut p, b"");
        assert_eq!(stream, [0xFF; 8].iter().copied().chain([0, 0, 0, 0]).collect::<Vec<u8>>());
        assert_eq!(summary.blocks, 0);
        assert_eq!(summary.crc, 0);
    }

    #[test]
    fn one_byte_nop_file_is_one_block() {
        let mut p = Pipeline::new(CodecOptions::new(CodecId::Nop), config(4, 1024)).unwrap();
        let (stream, summary) = compress(&mut p, b"x");
        assert_eq!(frame_lengths(&stream), vec![1]);
        assert_eq!(summary.crc, koopman(b"x"));
    }

    #[test]
    fn frames_follow_slot_order_across_cycles() {
        let data: Vec<u8> = (0..10u8).flat_map(|b| std::iter::repeat(b).take(100)).collect();
        let mut p = Pipeline::new(CodecOptions::new(CodecId::Nop), config(3, 100)).unwrap();
        let (stream, summary) = compress(&mut p, &data);
        assert_eq!(frame_lengths(&stream), vec![100; 10]);
        assert_eq!(summary.blocks, 10);
        assert_eq!(summary.uncompressed, 1000);

        let mut r = Cursor::new(&stream);
        for b in 0..10u8 {
            frame::read_block_len(&mut r, usize::MAX).unwrap();
            let mut block = [0u8; 100];
            r.read_exact(&mut block).unwrap();
            assert!(block.iter().all(|&x| x == b));
        }
    }

    #[test]
    fn parallel_roundtrip_every_codec() {
        let data = pseudo_random(300_000);
        for id in [CodecId::GZip, CodecId::Lzw, CodecId::ZLib, CodecId::Flate, CodecId::Nop] {
            let codec = CodecOptions::new(id).with_level(Level::new(3).unwrap());
            let mut p = Pipeline::new(codec, config(4, 64 * 1024)).unwrap();
            let (stream, _) = compress(&mut p, &data);

            let mut out = WriteBuffer::new(Vec::new(), 4096);
            let result = p.decompress_file(&mut Cursor::new(&stream), &mut out).unwrap();
            assert!(result.is_intact(), "codec {}", id.name());
            assert_eq!(result.restored, data.len() as u64);
            assert_eq!(out.into_inner().unwrap(), data, "codec {}", id.name());
        }
    }

    #[test]
    fn output_is_deterministic() {
        let data = pseudo_random(200_000);
        let run = || {
            let mut p = Pipeline::new(CodecOptions::new(CodecId::Flate), config(4, 32 * 1024)).unwrap();
            compress(&mut p, &data).0
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn verify_detects_flipped_byte() {
        let data = pseudo_random(50_000);
        let mut p = Pipeline::new(CodecOptions::new(CodecId::Nop), config(2, 10_000)).unwrap();
        let (mut stream, summary) = compress(&mut p, &data);

        let ok = p.verify_file(&mut Cursor::new(&stream)).unwrap();
        assert!(ok.is_intact());
        assert_eq!(ok.stored, summary.crc);
        assert_eq!(ok.compressed, summary.compressed);

        stream[8 + 16] ^= 0x01;
        let bad = p.verify_file(&mut Cursor::new(&stream)).unwrap();
        assert!(!bad.is_intact());
    }

    #[test]
    fn skip_reports_lengths_and_stops_after_crc() {
        let data = pseudo_random(25_000);
        let mut p = Pipeline::new(CodecOptions::new(CodecId::Nop), config(2, 10_000)).unwrap();
        let (mut stream, summary) = compress(&mut p, &data);
        stream.extend_from_slice(b"next");

        let mut r = Cursor::new(&stream);
        let skipped = p.skip_file(&mut r).unwrap();
        assert_eq!(skipped.compressed, 25_000);
        assert_eq!(skipped.blocks, 3);
        assert_eq!(skipped.stored, summary.crc);
        let mut rest = Vec::new();
        r.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"next");
    }

    #[test]
    fn skip_through_bufreader_keeps_position() {
        let data = pseudo_random(25_000);
        let mut p = Pipeline::new(CodecOptions::new(CodecId::Nop), config(2, 1_000)).unwrap();
        let (mut stream, summary) = compress(&mut p, &data);
        stream.extend_from_slice(b"next");

        let mut r = BufReader::with_capacity(4096, Cursor::new(&stream));
        let skipped = p.skip_file(&mut r).unwrap();
        assert_eq!(skipped.blocks, 25);
        assert_eq!(skipped.stored, summary.crc);
        assert_eq!(r.stream_position().unwrap(), (stream.len() - 4) as u64);
        let mut rest = Vec::new();
        r.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"next");
    }

    #[test]
    fn empty_frames_leave_no_slot_data_behind() {
        let opts = CodecOptions::new(CodecId::Flate);
        let mut w = opts.make_writer().unwrap();
        w.reset().unwrap();
        let mut empty = Vec::new();
        w.close(&mut empty).unwrap();
        assert!(!empty.is_empty());

        let mut stream = Vec::new();
        let mut crc = BlockCrc::new();
        for block in [&empty[..], &empty[..], &empty[..]] {
            frame::write_block(&mut stream, block).unwrap();
            crc.update(block);
        }
        frame::write_end(&mut stream, crc.value()).unwrap();

        let mut p = Pipeline::new(opts, config(2, 16)).unwrap();
        let mut out = WriteBuffer::new(Vec::new(), 16);
        let restored = p.decompress_file(&mut Cursor::new(&stream), &mut out).unwrap();
        assert!(restored.is_intact());
        assert_eq!(restored.restored, 0);
        assert_eq!(restored.blocks, 3);
        assert!(p.slots.iter().all(|s| s.plain.is_empty() && s.packed.is_empty()));
        assert!(out.into_inner().unwrap().is_empty());
    }

    #[test]
    fn negative_length_is_rejected() {
        let mut p = Pipeline::new(CodecOptions::new(CodecId::Nop), config(2, 16)).unwrap();
        let stream = (-2i64).to_le_bytes();
        let mut out = WriteBuffer::new(Vec::new(), 16);
        let err = p.decompress_file(&mut Cursor::new(&stream[..]), &mut out).unwrap_err();
        assert!(matches!(err, Error::Format(frame::FrameError::InvalidBlockSize(-2))));
    }

    #[test]
    fn truncated_payload_is_an_io_error() {
        let mut stream = 10i64.to_le_bytes().to_vec();
        stream.extend_from_slice(b"short");
        let mut p = Pipeline::new(CodecOptions::new(CodecId::Nop), config(1, 16)).unwrap();
        let err = p.verify_file(&mut Cursor::new(&stream)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Io);
    }

    #[test]
    fn config_validation() {
        assert!(config(0, 16).validate().is_err());
        assert!(config(1, 0).validate().is_err());
        assert!(config(1, MAX_BLOCK_SIZE + 1).validate().is_err());
        assert!(PipelineConfig::default().validate().is_ok());
    }
}
