use parking_lot::Mutex;
use std::io::{self, BufWriter, Write};

/// Serializes writes from concurrent `handle` calls onto one writer.
///
/// Each [`write`](BufferedWriter::write) appends a whole encoded record
/// under the lock, so records never interleave and never straddle a flush.
/// A capacity of zero disables buffering.
pub struct BufferedWriter<W: Write> {
    inner: Mutex<BufWriter<W>>,
}

impl<W: Write> BufferedWriter<W> {
    pub fn new(inner: W, capacity: usize) -> Self {
        BufferedWriter {
            inner: Mutex::new(BufWriter::with_capacity(capacity, inner)),
        }
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<()> {
        self.inner.lock().write_all(buf)
    }

    pub fn flush(&self) -> io::Result<()> {
        self.inner.lock().flush()
    }

    /// Flushes, then runs `f` on the underlying writer while still holding
    /// the lock.
    pub fn with_inner<R>(&self, f: impl FnOnce(&mut W) -> io::Result<R>) -> io::Result<R> {
        let mut guard = self.inner.lock();
        guard.flush()?;
        f(guard.get_mut())
    }

    /// Bytes accepted but not yet handed to the underlying writer.
    pub fn buffered(&self) -> usize {
        self.inner.lock().buffer().len()
    }
}
