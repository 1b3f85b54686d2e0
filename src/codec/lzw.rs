//! LZW adapter: least-significant-bit-first codes over an 8-bit alphabet.
//!
//! The encoder is not incremental at the block level; input is staged until
//! `close` and then encoded as one stream ending in the end-of-information
//! code.  Blocks are bounded by the pipeline block size, so staging costs at
//! most one extra block of memory per slot.

use weezl::{decode, encode, BitOrder};

use super::{BlockReader, BlockWriter, CodecError};

const LITERAL_WIDTH: u8 = 8;

pub struct LzwWriter {
    encoder: encode::Encoder,
    staged:  Vec<u8>,
}

impl LzwWriter {
    pub fn new() -> Self {
        Self {
            encoder: encode::Encoder::new(BitOrder::Lsb, LITERAL_WIDTH),
            staged:  Vec::new(),
        }
    }
}

impl Default for LzwWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockWriter for LzwWriter {
    fn reset(&mut self) -> Result<(), CodecError> {
        self.encoder.reset();
        self.staged.clear();
        Ok(())
    }

    fn write(&mut self, data: &[u8], _: &mut Vec<u8>) -> Result<(), CodecError> {
        self.staged.extend_from_slice(data);
        Ok(())
    }

    fn close(&mut self, sink: &mut Vec<u8>) -> Result<(), CodecError> {
        let encoded = self.encoder
            .encode(&self.staged)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        sink.extend_from_slice(&encoded);
        self.staged.clear();
        Ok(())
    }
}

pub struct LzwReader {
    decoder: decode::Decoder,
}

impl LzwReader {
    pub fn new() -> Self {
        Self { decoder: decode::Decoder::new(BitOrder::Lsb, LITERAL_WIDTH) }
    }
}

impl Default for LzwReader {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockReader for LzwReader {
    fn reset(&mut self) -> Result<(), CodecError> {
        self.decoder.reset();
        Ok(())
    }

    fn read_to_end(&mut self, source: &[u8], out: &mut Vec<u8>) -> Result<(), CodecError> {
        let decoded = self.decoder
            .decode(source)
            .map_err(|e| CodecError::Decompression(e.to_string()))?;
        out.extend_from_slice(&decoded);
        Ok(())
    }
}
