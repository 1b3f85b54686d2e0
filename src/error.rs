//! Error taxonomy shared by every archive operation.
//!
//! Low-level failures are wrapped with a short description of what was
//! being attempted as they bubble up ([`ResultExt::context`]).  The outermost
//! wrapper, [`OpError`], names the operation that failed and maps it to the
//! process exit code.

use std::fmt;
use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::codec::CodecError;
use crate::frame::FrameError;
use crate::write_buffer::BufferError;

// ── Kinds ────────────────────────────────────────────────────────────────────

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Argument,
    Open,
    Format,
    Io,
    Codec,
    Buffer,
    Integrity,
}

// ── Error ────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Argument(String),

    #[error("cannot open {}: {source}", path.display())]
    Open {
        path:   PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Format(#[from] FrameError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source:  io::Error,
    },

    #[error("{context}: {source}")]
    Codec {
        context: String,
        #[source]
        source:  CodecError,
    },

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error("{damaged} damaged file(s)")]
    Integrity { damaged: usize },

    #[error("no entries to compress")]
    NoEntries,

    #[error("cannot start worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Argument(_)            => ErrorKind::Argument,
            Error::Open { .. }            => ErrorKind::Open,
            Error::Format(FrameError::Io(_)) => ErrorKind::Io,
            Error::Format(_)              => ErrorKind::Format,
            Error::Io { .. }              => ErrorKind::Io,
            Error::Codec { .. }           => ErrorKind::Codec,
            Error::Buffer(_)              => ErrorKind::Buffer,
            Error::Integrity { .. }       => ErrorKind::Integrity,
            Error::NoEntries              => ErrorKind::Argument,
            Error::ThreadPool(_)          => ErrorKind::Io,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io { context: context.into(), source }
    }
}

// ── Context wrapping ─────────────────────────────────────────────────────────

/// Attach a description of the failed step to a low-level error.
pub trait ResultExt<T> {
    fn context<C: Into<String>>(self, context: C) -> Result<T, Error>;
}

impl<T> ResultExt<T> for Result<T, io::Error> {
    fn context<C: Into<String>>(self, context: C) -> Result<T, Error> {
        self.map_err(|source| Error::io(context, source))
    }
}

impl<T> ResultExt<T> for Result<T, CodecError> {
    fn context<C: Into<String>>(self, context: C) -> Result<T, Error> {
        self.map_err(|source| Error::Codec { context: context.into(), source })
    }
}

// ── Operation wrapper ────────────────────────────────────────────────────────

/// The top-level command an error escaped from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Compress,
    Decompress,
    Integrity,
    Runtime,
}

impl Operation {
    /// Process exit code reported when this operation fails.
    pub fn exit_code(self) -> u8 {
        match self {
            Operation::Runtime    => 1,
            Operation::Compress   => 2,
            Operation::Decompress => 3,
            Operation::Integrity  => 4,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Compress   => "compression error",
            Operation::Decompress => "decompression error",
            Operation::Integrity  => "integrity error",
            Operation::Runtime    => "error",
        })
    }
}

#[derive(Error, Debug)]
#[error("{op}: {source}")]
pub struct OpError {
    pub op:     Operation,
    #[source]
    pub source: Error,
}

impl OpError {
    pub fn new(op: Operation, source: Error) -> Self {
        Self { op, source }
    }

    pub fn exit_code(&self) -> u8 {
        self.op.exit_code()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_operation() {
        assert_eq!(OpError::new(Operation::Compress, Error::NoEntries).exit_code(), 2);
        assert_eq!(OpError::new(Operation::Decompress, Error::NoEntries).exit_code(), 3);
        assert_eq!(OpError::new(Operation::Integrity, Error::Integrity { damaged: 1 }).exit_code(), 4);
        assert_eq!(OpError::new(Operation::Runtime, Error::Argument("x".into())).exit_code(), 1);
    }

    #[test]
    fn context_is_prefixed() {
        let r: Result<(), io::Error> = Err(io::Error::new(io::ErrorKind::Other, "boom"));
        let e = r.context("reading block length").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Io);
        assert_eq!(e.to_string(), "reading block length: boom");
    }

    #[test]
    fn no_entries_message() {
        let e = OpError::new(Operation::Compress, Error::NoEntries);
        assert!(e.to_string().contains("no entries to compress"));
    }
}
