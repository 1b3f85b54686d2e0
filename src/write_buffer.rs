//! Bounded write coalescing with one background flush task.
//!
//! [`WriteBuffer`] accumulates frame writes and hands full buffers to a
//! flush thread, so the next cycle's compression overlaps the disk write.
//!
//! # Ownership handoff
//! `flush_async` moves the filled buffer *and* the sink into the flush
//! thread and continues appending into a second buffer.  The thread hands
//! both back on `join`.  At most one flush is in flight: a second
//! `flush_async` joins the first before starting, which also recycles its
//! buffer, so steady state uses exactly two allocations.
//!
//! A failed flush is reported at the next synchronisation point
//! (`flush_async`, `wait`, `flush_all`).

use std::io::{self, Write};
use std::mem;
use std::thread::{self, JoinHandle};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BufferError {
    #[error("flushing write buffer failed: {0}")]
    Flush(#[source] io::Error),
    #[error("write buffer flush task panicked")]
    FlushPanicked,
    #[error("write buffer lost its sink")]
    Detached,
}

struct FlushOutcome<W> {
    sink:   W,
    buf:    Vec<u8>,
    result: io::Result<()>,
}

pub struct WriteBuffer<W: Write + Send + 'static> {
    buf:       Vec<u8>,
    spare:     Option<Vec<u8>>,
    sink:      Option<W>,
    pending:   Option<JoinHandle<FlushOutcome<W>>>,
    threshold: usize,
    /// Bytes accepted by `append` since construction.
    appended:  u64,
}

impl<W: Write + Send + 'static> WriteBuffer<W> {
    /// `threshold` is the size at which [`should_flush`](Self::should_flush)
    /// turns true; it is also the initial capacity.
    pub fn new(sink: W, threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            buf:       Vec::with_capacity(threshold),
            spare:     None,
            sink:      Some(sink),
            pending:   None,
            threshold,
            appended:  0,
        }
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
        self.appended += bytes.len() as u64;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn appended(&self) -> u64 {
        self.appended
    }

    pub fn should_flush(&self) -> bool {
        self.buf.len() >= self.threshold
    }

    pub fn is_flushing(&self) -> bool {
        self.pending.is_some()
    }

    /// Hand the buffered bytes to the flush thread.  Blocks only while a
    /// previous flush is still running.
    pub fn flush_async(&mut self) -> Result<(), BufferError> {
        if self.buf.is_empty() {
            return Ok(());
        }
        self.wait()?;
        let mut sink = self.sink.take().ok_or(BufferError::Detached)?;
        let fresh = self.spare.take().unwrap_or_else(|| Vec::with_capacity(self.threshold));
        let full = mem::replace(&mut self.buf, fresh);
        self.pending = Some(thread::spawn(move || {
            let result = sink.write_all(&full);
            let mut buf = full;
            buf.clear();
            FlushOutcome { sink, buf, result }
        }));
        Ok(())
    }

    /// Join the in-flight flush, if any, and surface its error.
    pub fn wait(&mut self) -> Result<(), BufferError> {
        if let Some(handle) = self.pending.take() {
            let outcome = handle.join().map_err(|_| BufferError::FlushPanicked)?;
            self.sink  = Some(outcome.sink);
            self.spare = Some(outcome.buf);
            outcome.result.map_err(BufferError::Flush)?;
        }
        Ok(())
    }

    /// Write out everything synchronously and flush the sink.
    pub fn flush_all(&mut self) -> Result<(), BufferError> {
        self.wait()?;
        let sink = self.sink.as_mut().ok_or(BufferError::Detached)?;
        if !self.buf.is_empty() {
            sink.write_all(&self.buf).map_err(BufferError::Flush)?;
            self.buf.clear();
        }
        sink.flush().map_err(BufferError::Flush)
    }

    /// Drain completely and swap in a new sink, returning the old one.
    /// Allocations are kept for the next sink.
    pub fn replace_sink(&mut self, sink: W) -> Result<W, BufferError> {
        self.flush_all()?;
        self.sink.replace(sink).ok_or(BufferError::Detached)
    }

    /// Drain completely and return the sink.
    pub fn into_inner(mut self) -> Result<W, BufferError> {
        self.flush_all()?;
        self.sink.take().ok_or(BufferError::Detached)
    }
}

impl<W: Write + Send + 'static> Write for WriteBuffer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_all().map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

impl<W: Write + Send + 'static> Drop for WriteBuffer<W> {
    fn drop(&mut self) {
        // Never leave a detached thread writing into a sink nobody owns.
        let _ = self.wait();
    }
}
