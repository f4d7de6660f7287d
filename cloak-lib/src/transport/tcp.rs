use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use tracing::trace;

use super::RawTransport;

// NOTE: socket timeouts of zero mean "block forever", so every wait is at least this long.
const MIN_WAIT: Duration = Duration::from_millis(1);

pub struct TcpTransport {
    stream: TcpStream,
    pending: VecDeque<u8>,
    outgoing: Vec<u8>,
    connected: bool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            pending: VecDeque::new(),
            outgoing: Vec::new(),
            connected: true,
        })
    }

    pub fn connect(addr: impl ToSocketAddrs, timeout: Duration) -> io::Result<Self> {
        let mut last_err = None;
        for addr in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, timeout) {
                Ok(stream) => return Self::new(stream),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "no addresses to connect to")
        }))
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.stream.local_addr()
    }

    fn drain_pending(&mut self, buf: &mut [u8]) -> usize {
        let count = buf.len().min(self.pending.len());
        for (dst, src) in buf.iter_mut().zip(self.pending.drain(..count)) {
            *dst = src;
        }
        count
    }

    // Returns `Ok(0)` on a timeout, marking the transport disconnected on EOF.
    fn read_once(&mut self, buf: &mut [u8], deadline: Instant) -> io::Result<usize> {
        let now = Instant::now();
        if now >= deadline {
            return Ok(0);
        }
        self.stream
            .set_read_timeout(Some((deadline - now).max(MIN_WAIT)))?;

        match self.stream.read(buf) {
            Ok(0) => {
                self.connected = false;
                Ok(0)
            }
            Ok(count) => Ok(count),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                Ok(0)
            }
            Err(err) => {
                self.connected = false;
                Err(err)
            }
        }
    }

    fn send_outgoing(&mut self, deadline: Instant, sent: &mut usize) -> io::Result<()> {
        let mut attempted = false;
        while *sent < self.outgoing.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if attempted && remaining.is_zero() {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("sent {sent} of {} queued bytes", self.outgoing.len()),
                ));
            }
            attempted = true;
            self.stream.set_write_timeout(Some(remaining.max(MIN_WAIT)))?;
            match self.stream.write(&self.outgoing[*sent..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(count) => *sent += count,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
        self.stream.flush()
    }
}

impl RawTransport for TcpTransport {
    fn read_bytes(
        &mut self,
        buf: &mut [u8],
        deadline: Instant,
        require_all: bool,
    ) -> io::Result<usize> {
        let mut count = self.drain_pending(buf);
        if count > 0 && !require_all {
            return Ok(count);
        }

        while count < buf.len() {
            if !self.connected {
                break;
            }
            let read = self.read_once(&mut buf[count..], deadline)?;
            count += read;
            if !require_all && count > 0 {
                break;
            }
            if read == 0 && (Instant::now() >= deadline || !self.connected) {
                break;
            }
        }

        trace!(count, requested = buf.len(), "tcp read");
        if require_all && count < buf.len() {
            // NOTE: keep what arrived so a retry does not lose it.
            self.push_back(&buf[..count]);
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("read {count} of {} required bytes", buf.len()),
            ));
        }
        Ok(count)
    }

    fn write_bytes(&mut self, buf: &[u8]) -> io::Result<()> {
        if !self.connected {
            return Err(io::ErrorKind::NotConnected.into());
        }
        self.outgoing.extend_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self, deadline: Instant) -> io::Result<()> {
        if self.outgoing.is_empty() {
            return Ok(());
        }
        let mut sent = 0;
        let result = self.send_outgoing(deadline, &mut sent);
        self.outgoing.drain(..sent);
        trace!(sent, unsent = self.outgoing.len(), ok = result.is_ok(), "tcp flush");

        // NOTE: after a timeout the unsent tail stays queued so the next flush resumes it.
        if let Err(err) = &result {
            if !matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) {
                self.connected = false;
                self.outgoing.clear();
            }
        }
        result
    }

    fn push_back(&mut self, bytes: &[u8]) {
        for byte in bytes.iter().rev() {
            self.pending.push_front(*byte);
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close(&mut self) -> io::Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.outgoing.clear();
        self.pending.clear();
        match self.stream.shutdown(Shutdown::Both) {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err),
            _ => Ok(()),
        }
    }
}
