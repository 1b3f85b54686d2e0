//! Parallel, block-oriented file archiver.
//!
//! Files are cut into fixed-size blocks, compressed by a pool of worker
//! slots and framed into a single container stream.  Each file carries the
//! XOR of its blocks' CRC32-Koopman checksums.

pub mod archive;
pub mod checksum;
pub mod codec;
pub mod error;
pub mod frame;
pub mod pipeline;
pub mod walker;
pub mod write_buffer;

pub use archive::{Console, CompressOptions, ExtractOptions, Listing, Overwrite, Silent};
pub use codec::{CodecId, CodecOptions, Level};
pub use error::{Error, ErrorKind, OpError, Operation};
pub use pipeline::{Pipeline, PipelineConfig};
