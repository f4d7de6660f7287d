mod client;
mod server;

use std::io;

use crate::channel::TerminateReport;
use crate::error::Error;

pub use client::ClientSource;
pub use server::ServerSource;

/// Plaintext in, plaintext out, over a negotiated secure channel.
pub trait SecureDataSource {
    /// Negotiates the session over the already connected transport.
    fn setup(&mut self) -> Result<(), Error>;

    /// Reads whatever plaintext arrives within the read timeout; 0 means none did.
    fn get_data(&mut self, buf: &mut [u8]) -> Result<usize, Error>;

    fn put_data(&mut self, buf: &[u8]) -> Result<usize, Error>;

    fn is_connected(&self) -> bool;

    /// Closes the session, and the transport too when configured to. Never fails.
    fn terminate(&mut self) -> TerminateReport;
}

fn into_io_error(err: Error) -> io::Error {
    match err {
        Error::IONetwork(err) => err,
        err @ Error::Timeout { .. } => io::Error::new(io::ErrorKind::TimedOut, err),
        err @ Error::IncompleteData { .. } => io::Error::new(io::ErrorKind::UnexpectedEof, err),
        err => io::Error::new(io::ErrorKind::Other, err),
    }
}

// NOTE: a read that times out must not look like end of stream to `io::Read` callers,
// and a transport lost without a close notify must not look like a timeout.
macro_rules! io_bridge {
    ($source:ident) => {
        impl<T, P> std::io::Read for $source<T, P>
        where
            T: $crate::transport::RawTransport,
            P: $crate::crypto::CryptoProvider,
        {
            fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
                let count = $crate::source::SecureDataSource::get_data(self, buf)
                    .map_err($crate::source::into_io_error)?;
                if count == 0 && !buf.is_empty() && !self.channel().peer_closed() {
                    if !$crate::transport::RawTransport::is_connected(self.transport()) {
                        return Err(std::io::ErrorKind::ConnectionAborted.into());
                    }
                    return Err(std::io::ErrorKind::TimedOut.into());
                }
                Ok(count)
            }
        }

        impl<T, P> std::io::Write for $source<T, P>
        where
            T: $crate::transport::RawTransport,
            P: $crate::crypto::CryptoProvider,
        {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                $crate::source::SecureDataSource::put_data(self, buf)
                    .map_err($crate::source::into_io_error)
            }

            // NOTE: every `put_data` already flushes the transport.
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
    };
}

pub(crate) use io_bridge;
