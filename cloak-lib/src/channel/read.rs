use std::time::Instant;

use tracing::{debug, trace};

use super::buffer::LeftoverBuffer;
use super::handshake::Negotiate;
use super::shutdown::send_close;
use super::{CancelToken, ReadMode, SecureChannel, Session, SessionState};
use crate::config::ChannelConfig;
use crate::crypto::{CryptoProvider, DecryptStatus, SecurityContext};
use crate::error::{Error, ProtocolViolation};
use crate::transport::RawTransport;

impl<P: CryptoProvider> SecureChannel<P> {
    /// Reads up to `dst.len()` plaintext bytes, decrypting records from `transport` as needed.
    ///
    /// Buffered plaintext is served without touching the transport. Returns 0 once the peer
    /// has closed and every buffered byte has been read.
    pub fn read<T: RawTransport>(
        &mut self,
        transport: &mut T,
        dst: &mut [u8],
        deadline: Instant,
        mode: ReadMode,
    ) -> Result<usize, Error> {
        match self.state {
            SessionState::Error => return Err(Error::SessionFailed(self.name.clone())),
            state if state.is_readable() => {}
            _ => return Err(Error::NotInitialized(self.name.clone())),
        }
        if dst.is_empty() {
            return Ok(0);
        }

        let Self {
            name,
            provider,
            config,
            cancel,
            state,
            session,
            leftover,
            alpn,
            ..
        } = self;
        let session = session
            .as_mut()
            .ok_or_else(|| Error::NotInitialized(name.clone()))?;
        let allow_partial = mode == ReadMode::AllowPartial;

        let mut cancelled = false;
        if !leftover.satisfies(dst.len(), allow_partial) && !session.peer_closed {
            let mut reader = RecordReader {
                channel: name.as_str(),
                config: &*config,
                cancel: &*cancel,
                alpn: alpn.as_deref(),
                max_token: provider.max_token_len(),
                state: &mut *state,
                session: &mut *session,
                leftover: &mut *leftover,
                transport: &mut *transport,
            };
            let result = reader.fill(dst.len(), deadline, allow_partial);
            cancelled = reader.park_carry(result)?;
        }

        let drained = session.peer_closed && leftover.is_empty();
        if mode == ReadMode::RequireAll && leftover.len() < dst.len() && !cancelled && !drained {
            return Err(Error::IncompleteData {
                channel: name.clone(),
                requested: dst.len(),
                available: leftover.len(),
            });
        }

        let count = leftover.consume_into(dst);
        trace!(channel = %name, count, buffered = leftover.len(), "plaintext delivered");
        Ok(count)
    }
}

/// The state a single read operates on, borrowed field by field from the channel.
struct RecordReader<'a, P: CryptoProvider, T> {
    channel: &'a str,
    config: &'a ChannelConfig,
    cancel: &'a CancelToken,
    alpn: Option<&'a [u8]>,
    max_token: usize,
    state: &'a mut SessionState,
    session: &'a mut Session<P>,
    leftover: &'a mut LeftoverBuffer,
    transport: &'a mut T,
}

impl<P: CryptoProvider, T: RawTransport> RecordReader<'_, P, T> {
    /// Reads and decrypts until the request can be answered, returning whether it was cancelled.
    fn fill(&mut self, requested: usize, deadline: Instant, allow_partial: bool) -> Result<bool, Error> {
        let mut deadline = deadline;
        let mut grace = Some(self.config.grace_extension);

        loop {
            self.decrypt_buffered()?;
            if self.leftover.satisfies(requested, allow_partial) || self.session.peer_closed {
                return Ok(false);
            }
            if self.cancel.is_cancelled() {
                debug!(channel = self.channel, buffered = self.leftover.len(), "read cancelled");
                return Ok(true);
            }

            let packet = &mut self.session.packet;
            if packet.is_full() {
                let limit = packet.capacity();
                return Err(self.violation(ProtocolViolation::OversizedRecord { limit }));
            }
            let count = self.transport.read_bytes(packet.spare_mut(), deadline, false)?;
            if count > 0 {
                packet.advance(count);
                trace!(channel = self.channel, count, carried = packet.len(), "record bytes received");
                continue;
            }

            // NOTE: a record already under way gets one short extension before giving up.
            if !packet.is_empty() && self.transport.is_connected() {
                if let Some(extension) = grace.take() {
                    trace!(channel = self.channel, ?extension, "granting grace extension");
                    deadline = deadline.max(Instant::now()) + extension;
                    continue;
                }
            }
            return Ok(false);
        }
    }

    /// Decrypts every complete unit in the packet buffer.
    fn decrypt_buffered(&mut self) -> Result<(), Error> {
        while !self.session.packet.is_empty() {
            let decrypted = self.session.context.decrypt(self.session.packet.filled_mut());
            match decrypted.status {
                DecryptStatus::Ok => {
                    self.leftover
                        .append(&self.session.packet.filled()[decrypted.data]);
                    self.session.packet.keep_tail(decrypted.extra);
                }
                DecryptStatus::Incomplete => return Ok(()),
                DecryptStatus::PeerClosed => {
                    debug!(channel = self.channel, "peer closed the session");
                    self.session.packet.clear();
                    self.acknowledge_close();
                    self.session.peer_closed = true;
                    *self.state = SessionState::ShutdownSent;
                    return Ok(());
                }
                DecryptStatus::Renegotiate => {
                    let seed = self.session.packet.tail(decrypted.extra).to_vec();
                    self.session.packet.clear();
                    self.renegotiate(&seed)?;
                }
                DecryptStatus::OutOfSequence => {
                    return Err(self.violation(ProtocolViolation::OutOfSequence))
                }
                DecryptStatus::Altered => return Err(self.violation(ProtocolViolation::MessageAltered)),
                DecryptStatus::Failed(err) => return Err(self.violation(ProtocolViolation::Rejected(err))),
            }
        }
        Ok(())
    }

    fn acknowledge_close(&mut self) {
        if !self.transport.is_connected() {
            return;
        }
        if let Err(err) = send_close(
            self.channel,
            &mut self.session.context,
            &mut *self.transport,
            self.config.shutdown_flush_timeout,
        ) {
            debug!(channel = self.channel, %err, "could not acknowledge close");
        }
    }

    fn renegotiate(&mut self, seed: &[u8]) -> Result<(), Error> {
        debug!(channel = self.channel, side = ?self.session.side, "renegotiating");
        *self.state = SessionState::Renegotiating;

        let negotiate = Negotiate {
            channel: self.channel,
            cancel: self.cancel,
            side: self.session.side,
            alpn: self.alpn,
            max_token: self.max_token,
            deadline: Instant::now() + self.config.handshake_timeout,
        };
        let mut result = negotiate.run(&mut self.session.context, &mut *self.transport, seed);
        if result.is_ok() {
            result = self
                .session
                .refresh_geometry()
                .map_err(|source| Error::crypto(self.channel, source));
        }

        match result {
            Ok(()) => {
                debug!(channel = self.channel, "renegotiated");
                *self.state = SessionState::Established;
                Ok(())
            }
            Err(source) => {
                self.leftover.clear();
                *self.state = SessionState::Error;
                Err(Error::Renegotiation {
                    channel: self.channel.to_owned(),
                    source: Box::new(source),
                })
            }
        }
    }

    /// Returns unfinished record bytes to the transport so a later read resumes them.
    fn park_carry(&mut self, result: Result<bool, Error>) -> Result<bool, Error> {
        let packet = &mut self.session.packet;
        if packet.is_empty() || *self.state == SessionState::Error {
            packet.clear();
            return result;
        }
        if !self.transport.is_connected() {
            let violation = self.violation(ProtocolViolation::PartialMessage);
            return result.and(Err(violation));
        }
        trace!(channel = self.channel, count = packet.len(), "carrying partial record");
        self.transport.push_back(packet.filled());
        packet.clear();
        result
    }

    fn violation(&mut self, violation: ProtocolViolation) -> Error {
        debug!(channel = self.channel, %violation, "session failed");
        *self.state = SessionState::Error;
        self.session.packet.clear();
        Error::protocol(self.channel, violation)
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::test::{self, MockProvider, NegotiationStep, ScriptedTransport, Step};

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    fn mock_channel(config: ChannelConfig) -> (SecureChannel<MockProvider>, ScriptedTransport) {
        let mut transport = ScriptedTransport::new(vec![b"reply".to_vec()]);
        let mut channel = SecureChannel::new("mock", MockProvider::handshake(), config);
        channel
            .connect_client(&mut transport, "mock", &[], None, deadline())
            .unwrap();
        transport.written.clear();
        transport.reads = 0;
        (channel, transport)
    }

    #[test]
    fn test_record_split_across_reads() {
        let (mut channel, mut transport) = mock_channel(ChannelConfig::default());
        let record = MockProvider::record(b"abcdef");
        for byte in record {
            transport.queue(&[byte]);
        }

        let mut buf = [0u8; 6];
        let count = channel
            .read(&mut transport, &mut buf, deadline(), ReadMode::RequireAll)
            .unwrap();
        assert_eq!(count, 6);
        assert_eq!(&buf, b"abcdef");
        assert_eq!(transport.reads, 10);
    }

    #[test]
    fn test_leftover_served_without_io() {
        let (mut channel, mut transport) = mock_channel(ChannelConfig::default());
        transport.queue(&MockProvider::record(b"abcdefgh"));

        let mut buf = [0u8; 3];
        channel
            .read(&mut transport, &mut buf, deadline(), ReadMode::AllowPartial)
            .unwrap();
        assert_eq!(&buf, b"abc");
        assert_eq!(channel.buffered(), 5);

        let reads = transport.reads;
        channel
            .read(&mut transport, &mut buf, deadline(), ReadMode::RequireAll)
            .unwrap();
        assert_eq!(&buf, b"def");
        let mut rest = [0u8; 8];
        let count = channel
            .read(&mut transport, &mut rest, deadline(), ReadMode::AllowPartial)
            .unwrap();
        assert_eq!(&rest[..count], b"gh");
        assert_eq!(transport.reads, reads);
    }

    #[test]
    fn test_multiple_records_in_one_read() {
        let (mut channel, mut transport) = mock_channel(ChannelConfig::default());
        let mut bytes = MockProvider::record(b"abc");
        bytes.extend(MockProvider::record(b"def"));
        bytes.extend(&MockProvider::record(b"ghi")[..3]);
        transport.queue(&bytes);

        let mut buf = [0u8; 6];
        channel
            .read(&mut transport, &mut buf, deadline(), ReadMode::RequireAll)
            .unwrap();
        assert_eq!(&buf, b"abcdef");
        // NOTE: the unfinished third record goes back to the transport.
        assert_eq!(transport.pending_front(), Some(MockProvider::record(b"ghi")[..3].to_vec()));
    }

    #[test]
    fn test_require_all_shortfall_keeps_data() {
        let config = ChannelConfig::default().grace_extension(Duration::ZERO);
        let (mut channel, mut transport) = mock_channel(config);
        transport.queue(&MockProvider::record(b"abc"));

        let mut buf = [0u8; 5];
        let err = channel
            .read(&mut transport, &mut buf, deadline(), ReadMode::RequireAll)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::IncompleteData {
                requested: 5,
                available: 3,
                ..
            }
        ));
        assert!(err.is_recoverable());
        assert_eq!(channel.state(), SessionState::Established);
        assert_eq!(channel.buffered(), 3);
    }

    #[test]
    fn test_partial_record_on_disconnect() {
        let (mut channel, mut transport) = mock_channel(ChannelConfig::default());
        transport.queue(&MockProvider::record(b"abc")[..4]);
        transport.disconnect_when_drained = true;

        let mut buf = [0u8; 3];
        let err = channel
            .read(&mut transport, &mut buf, deadline(), ReadMode::AllowPartial)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol {
                violation: ProtocolViolation::PartialMessage,
                ..
            }
        ));
        assert_eq!(channel.state(), SessionState::Error);
        assert!(matches!(
            channel.read(&mut transport, &mut buf, deadline(), ReadMode::AllowPartial),
            Err(Error::SessionFailed(_))
        ));
    }

    #[test]
    fn test_oversized_record() {
        let (mut channel, mut transport) = mock_channel(ChannelConfig::default());
        // NOTE: claims a body longer than the packet buffer can ever hold.
        transport.queue(&[0, 40]);
        transport.queue(&[0u8; 40]);

        let mut buf = [0u8; 4];
        let err = channel
            .read(&mut transport, &mut buf, deadline(), ReadMode::AllowPartial)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol {
                violation: ProtocolViolation::OversizedRecord { limit: 12 },
                ..
            }
        ));
    }

    #[test]
    fn test_integrity_failures() {
        let (mut channel, mut transport) = mock_channel(ChannelConfig::default());
        let mut record = MockProvider::record(b"abc");
        let last = record.len() - 1;
        record[last] = b'x';
        transport.queue(&record);

        let mut buf = [0u8; 3];
        assert!(matches!(
            channel.read(&mut transport, &mut buf, deadline(), ReadMode::AllowPartial),
            Err(Error::Protocol {
                violation: ProtocolViolation::MessageAltered,
                ..
            })
        ));

        let (mut channel, mut transport) = mock_channel(ChannelConfig::default());
        transport.queue(&MockProvider::replayed_record(b"abc"));
        assert!(matches!(
            channel.read(&mut transport, &mut buf, deadline(), ReadMode::AllowPartial),
            Err(Error::Protocol {
                violation: ProtocolViolation::OutOfSequence,
                ..
            })
        ));
        assert_eq!(channel.state(), SessionState::Error);
    }

    #[test]
    fn test_cancel_returns_buffered_data() {
        let (mut channel, mut transport) = mock_channel(ChannelConfig::default());
        transport.queue(&MockProvider::record(b"abcdef"));

        let mut buf = [0u8; 2];
        channel
            .read(&mut transport, &mut buf, deadline(), ReadMode::AllowPartial)
            .unwrap();
        assert_eq!(&buf, b"ab");

        channel.cancel_token().cancel();
        transport.queue(&MockProvider::record(b"gh"));
        let reads = transport.reads;
        let mut buf = [0u8; 8];
        let count = channel
            .read(&mut transport, &mut buf, deadline(), ReadMode::RequireAll)
            .unwrap();
        assert_eq!(&buf[..count], b"cdef");
        assert_eq!(transport.reads, reads);
        assert_eq!(channel.state(), SessionState::Established);
    }

    #[test]
    fn test_peer_close_is_acknowledged() {
        let (mut channel, mut transport) = mock_channel(ChannelConfig::default());
        let mut bytes = MockProvider::record(b"bye");
        bytes.extend(MockProvider::close_notify());
        transport.queue(&bytes);

        let mut buf = [0u8; 8];
        let count = channel
            .read(&mut transport, &mut buf, deadline(), ReadMode::AllowPartial)
            .unwrap();
        assert_eq!(&buf[..count], b"bye");
        assert!(channel.peer_closed());
        assert_eq!(channel.state(), SessionState::ShutdownSent);
        assert_eq!(transport.written, MockProvider::close_notify());

        let reads = transport.reads;
        assert_eq!(
            channel
                .read(&mut transport, &mut buf, deadline(), ReadMode::AllowPartial)
                .unwrap(),
            0
        );
        assert_eq!(transport.reads, reads);

        let report = channel.terminate(&mut transport);
        assert!(!report.close_sent);
        assert_eq!(transport.written, MockProvider::close_notify());
    }

    #[test]
    fn test_client_renegotiation_is_seeded() {
        let provider = MockProvider::new(vec![
            Step::send(b"hello"),
            Step::expect(b"reply", b"", NegotiationStep::Done),
            Step::send(b"again"),
            Step::expect(b"fresh", b"", NegotiationStep::Done),
        ]);
        let mut transport = ScriptedTransport::new(vec![b"reply".to_vec()]);
        let mut channel = SecureChannel::new("mock", provider, ChannelConfig::default());
        channel
            .connect_client(&mut transport, "mock", &[], None, deadline())
            .unwrap();

        // NOTE: the request, the server's answer and the next record arrive together.
        let mut bytes = vec![0xff, 0xfe];
        bytes.extend_from_slice(b"fresh");
        bytes.extend(MockProvider::record(b"xyz"));
        transport.queue(&bytes);

        let mut buf = [0u8; 3];
        channel
            .read(&mut transport, &mut buf, deadline(), ReadMode::RequireAll)
            .unwrap();
        assert_eq!(&buf, b"xyz");
        assert_eq!(transport.written, b"helloagain");
        assert_eq!(channel.state(), SessionState::Established);
    }

    #[test]
    fn test_failed_renegotiation_collapses_session() {
        let provider = MockProvider::new(vec![
            Step::send(b"hello"),
            Step::expect(b"reply", b"", NegotiationStep::Done),
            Step::send(b"again"),
            Step::expect(b"fresh", b"", NegotiationStep::Failed),
        ]);
        let mut transport = ScriptedTransport::new(vec![b"reply".to_vec()]);
        let mut channel = SecureChannel::new("mock", provider, ChannelConfig::default());
        channel
            .connect_client(&mut transport, "mock", &[], None, deadline())
            .unwrap();

        let mut bytes = MockProvider::record(b"ab");
        bytes.extend_from_slice(&[0xff, 0xfe]);
        bytes.extend_from_slice(b"fresh");
        transport.queue(&bytes);

        let mut buf = [0u8; 4];
        let err = channel
            .read(&mut transport, &mut buf, deadline(), ReadMode::RequireAll)
            .unwrap_err();
        assert!(matches!(
            &err,
            Error::Renegotiation { source, .. } if matches!(**source, Error::Handshake { .. })
        ));
        assert_eq!(err.status_code(), Some(0x8009_030f));
        assert_eq!(channel.state(), SessionState::Error);
        assert_eq!(channel.buffered(), 0);
    }

    #[test]
    fn test_grace_extension_completes_record() {
        let test::Pair {
            mut client,
            mut server,
            mut client_transport,
            mut server_transport,
        } = test::handshake_pair(&[]);

        client.write(&mut client_transport, b"slow record").unwrap();
        let mut raw = vec![0u8; 12 + 11 + 16];
        server_transport
            .read_bytes(&mut raw, deadline(), true)
            .unwrap();

        let (head, tail) = raw.split_at(20);
        let tail = tail.to_vec();
        let writer = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            client_transport.inject(&tail);
            client_transport
        });
        server_transport.push_back(head);

        let mut buf = [0u8; 11];
        let count = server
            .read(
                &mut server_transport,
                &mut buf,
                Instant::now() + Duration::from_millis(10),
                ReadMode::AllowPartial,
            )
            .unwrap();
        assert_eq!(&buf[..count], b"slow record");
        let _client_transport = writer.join().unwrap();
    }

    #[test]
    fn test_server_renegotiation_round() {
        let test::Pair {
            mut client,
            mut server,
            mut client_transport,
            mut server_transport,
        } = test::handshake_pair(&["h2".to_owned()]);

        server.request_renegotiation(&mut server_transport).unwrap();
        assert_eq!(server.state(), SessionState::Renegotiating);
        assert!(matches!(
            server.write(&mut server_transport, b"blocked"),
            Err(Error::InvalidState {
                state: SessionState::Renegotiating,
                ..
            })
        ));

        let client_thread = std::thread::spawn(move || {
            client.write(&mut client_transport, b"before").unwrap();
            let mut buf = [0u8; 5];
            let count = client
                .read(&mut client_transport, &mut buf, deadline(), ReadMode::RequireAll)
                .unwrap();
            assert_eq!(&buf[..count], b"after");
            assert_eq!(client.state(), SessionState::Established);
            assert_eq!(client.negotiated_protocol(), Some("h2"));
            client.write(&mut client_transport, b"again").unwrap();
            (client, client_transport)
        });

        let mut buf = [0u8; 6];
        server
            .read(&mut server_transport, &mut buf, deadline(), ReadMode::RequireAll)
            .unwrap();
        assert_eq!(&buf, b"before");

        // NOTE: the client hello arrives once the client starts reading.
        let mut buf = [0u8; 5];
        for _ in 0..50 {
            if server.state() == SessionState::Established {
                break;
            }
            let count = server
                .read(
                    &mut server_transport,
                    &mut buf,
                    Instant::now() + Duration::from_millis(100),
                    ReadMode::AllowPartial,
                )
                .unwrap();
            assert_eq!(count, 0);
        }
        assert_eq!(server.state(), SessionState::Established);

        server.write(&mut server_transport, b"after").unwrap();
        server
            .read(&mut server_transport, &mut buf, deadline(), ReadMode::RequireAll)
            .unwrap();
        assert_eq!(&buf, b"again");

        let (_client, _client_transport) = client_thread.join().unwrap();
    }

    #[test]
    fn test_unsolicited_client_hello_is_rejected() {
        let test::Pair {
            mut server,
            mut server_transport,
            ..
        } = test::handshake_pair(&[]);
        // NOTE: type 0x01 is a plaintext client hello.
        server_transport.push_back(&[0x01, 0x11, 0x00, 0x01, 0x00]);

        let mut buf = [0u8; 4];
        let err = server
            .read(&mut server_transport, &mut buf, deadline(), ReadMode::AllowPartial)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol {
                violation: ProtocolViolation::Rejected(_),
                ..
            }
        ));
        assert_eq!(server.state(), SessionState::Error);
    }
}
