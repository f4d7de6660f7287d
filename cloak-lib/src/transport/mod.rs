mod tcp;

use std::io;
use std::time::Instant;

pub use tcp::TcpTransport;

/// A byte source/sink over an already connected stream.
///
/// Reads block until at least one byte arrives or the deadline passes, in which case
/// they return `Ok(0)`. Writes may be buffered until the next flush.
pub trait RawTransport {
    /// Reads into `buf`. With `require_all` the call keeps reading until `buf` is full
    /// and fails with [`io::ErrorKind::TimedOut`] if the deadline passes first.
    fn read_bytes(&mut self, buf: &mut [u8], deadline: Instant, require_all: bool)
        -> io::Result<usize>;

    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<()>;

    fn flush(&mut self, deadline: Instant) -> io::Result<()>;

    /// Re-queues `bytes` so the next read returns them, in order, before anything else.
    fn push_back(&mut self, bytes: &[u8]);

    fn is_connected(&self) -> bool;

    fn close(&mut self) -> io::Result<()>;
}

impl<T: RawTransport + ?Sized> RawTransport for &mut T {
    fn read_bytes(
        &mut self,
        buf: &mut [u8],
        deadline: Instant,
        require_all: bool,
    ) -> io::Result<usize> {
        (**self).read_bytes(buf, deadline, require_all)
    }

    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<()> {
        (**self).write_bytes(buf)
    }

    fn flush(&mut self, deadline: Instant) -> io::Result<()> {
        (**self).flush(deadline)
    }

    fn push_back(&mut self, bytes: &[u8]) {
        (**self).push_back(bytes)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}

impl<T: RawTransport + ?Sized> RawTransport for Box<T> {
    fn read_bytes(
        &mut self,
        buf: &mut [u8],
        deadline: Instant,
        require_all: bool,
    ) -> io::Result<usize> {
        (**self).read_bytes(buf, deadline, require_all)
    }

    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<()> {
        (**self).write_bytes(buf)
    }

    fn flush(&mut self, deadline: Instant) -> io::Result<()> {
        (**self).flush(deadline)
    }

    fn push_back(&mut self, bytes: &[u8]) {
        (**self).push_back(bytes)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }

    fn close(&mut self) -> io::Result<()> {
        (**self).close()
    }
}
