use std::time::Instant;

use tracing::{debug, trace};

use super::buffer::CarryBuffer;
use super::{CancelToken, SecureChannel, SessionState};
use crate::crypto::{CryptoProvider, NegotiationStatus, SecurityContext, Side, TokenInput};
use crate::error::{CryptoError, Error, HandshakeFailure};
use crate::transport::RawTransport;

/// One run of the token exchange, from the first token to completion.
pub(super) struct Negotiate<'a> {
    pub(super) channel: &'a str,
    pub(super) cancel: &'a CancelToken,
    pub(super) side: Side,
    pub(super) alpn: Option<&'a [u8]>,
    pub(super) max_token: usize,
    pub(super) deadline: Instant,
}

impl Negotiate<'_> {
    /// Drives `context` until the provider reports completion.
    ///
    /// `seed` holds bytes already read from the transport that belong to the exchange.
    /// Bytes following the final token are pushed back onto the transport.
    pub(super) fn run<C, T>(&self, context: &mut C, transport: &mut T, seed: &[u8]) -> Result<(), Error>
    where
        C: SecurityContext,
        T: RawTransport,
    {
        let mut input = CarryBuffer::new(self.max_token);
        if !input.append(seed) {
            return Err(self.failure(HandshakeFailure::TokenTooLarge {
                limit: self.max_token,
            }));
        }
        let mut output = Vec::new();
        // NOTE: the client speaks first, without any input.
        let mut first = self.side == Side::Client;
        let mut starved = false;

        loop {
            if self.cancel.is_cancelled() {
                debug!(channel = self.channel, "negotiation cancelled");
                return Err(Error::ShutdownRequested {
                    channel: self.channel.to_owned(),
                });
            }
            if !first && (input.is_empty() || starved) {
                self.receive(&mut input, transport)?;
            }

            let token = match (first, self.alpn) {
                (true, Some(extension)) => TokenInput::ApplicationProtocols(extension),
                (true, None) => TokenInput::Empty,
                (false, _) => TokenInput::Token(input.filled()),
            };
            output.clear();
            let step = context.negotiate(token, &mut output);
            trace!(channel = self.channel, status = ?step.status, extra = step.extra, "negotiation step");

            let (complete, finished) = match step.status {
                // NOTE: the client's opening token takes no input, so it cannot wait for more.
                NegotiationStatus::Incomplete if first => {
                    return Err(self.failure(HandshakeFailure::Rejected(CryptoError::InvalidState(
                        "opening token reported incomplete",
                    ))));
                }
                NegotiationStatus::Incomplete => {
                    starved = true;
                    continue;
                }
                NegotiationStatus::Continue => (false, false),
                NegotiationStatus::CompleteAndContinue => (true, false),
                NegotiationStatus::CompleteNeeded => (true, true),
                NegotiationStatus::Done => (false, true),
                NegotiationStatus::IncompleteCredentials => {
                    return Err(self.failure(HandshakeFailure::NoClientCertificate));
                }
                NegotiationStatus::Failed(err) => {
                    // NOTE: the peer still expects whatever alert the provider produced.
                    if let Err(send_err) = self.send(transport, &output) {
                        debug!(channel = self.channel, %send_err, "could not send final token");
                    }
                    return Err(self.failure(HandshakeFailure::Rejected(err)));
                }
            };
            starved = false;

            if complete {
                context
                    .complete_token(&mut output)
                    .map_err(|err| self.failure(HandshakeFailure::TokenCompletion(err)))?;
            }
            self.send(transport, &output)?;

            let rest = match first {
                true => input.len(),
                false => step.extra,
            };
            first = false;
            if finished {
                if rest > 0 {
                    trace!(channel = self.channel, count = rest, "pushing back bytes after handshake");
                    transport.push_back(input.tail(rest));
                }
                return Ok(());
            }
            input.keep_tail(rest);
        }
    }

    fn receive<T: RawTransport>(&self, input: &mut CarryBuffer, transport: &mut T) -> Result<(), Error> {
        if input.is_full() {
            return Err(self.failure(HandshakeFailure::TokenTooLarge {
                limit: input.capacity(),
            }));
        }

        let count = transport.read_bytes(input.spare_mut(), self.deadline, false)?;
        if count == 0 {
            return Err(match transport.is_connected() {
                true => Error::Timeout {
                    channel: self.channel.to_owned(),
                    stage: "handshake token",
                },
                false => std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into(),
            });
        }
        input.advance(count);
        trace!(channel = self.channel, count, buffered = input.len(), "handshake bytes received");
        Ok(())
    }

    fn send<T: RawTransport>(&self, transport: &mut T, output: &[u8]) -> Result<(), Error> {
        if output.is_empty() {
            return Ok(());
        }
        transport.write_bytes(output)?;
        transport.flush(self.deadline)?;
        trace!(channel = self.channel, count = output.len(), "handshake token sent");
        Ok(())
    }

    fn failure(&self, reason: HandshakeFailure) -> Error {
        Error::handshake(self.channel, reason)
    }
}

impl<P: CryptoProvider> SecureChannel<P> {
    /// Asks the client to negotiate fresh keys. The exchange completes inside a later
    /// [`SecureChannel::read`], once the client's new hello arrives.
    pub fn request_renegotiation<T: RawTransport>(&mut self, transport: &mut T) -> Result<(), Error> {
        match self.state {
            SessionState::Established => {}
            SessionState::Error => return Err(Error::SessionFailed(self.name.clone())),
            state => {
                return Err(Error::InvalidState {
                    channel: self.name.clone(),
                    state,
                })
            }
        }
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| Error::NotInitialized(self.name.clone()))?;
        if session.side != Side::Server {
            return Err(Error::InvalidState {
                channel: self.name.clone(),
                state: self.state,
            });
        }

        let mut output = Vec::new();
        session
            .context
            .request_renegotiation(&mut output)
            .map_err(|source| Error::crypto(&self.name, source))?;
        transport.write_bytes(&output)?;
        transport.flush(Instant::now() + self.config.write_flush_timeout)?;

        debug!(channel = %self.name, "renegotiation requested");
        self.state = SessionState::Renegotiating;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;
    use crate::test::{MockProvider, NegotiationStep, ScriptedTransport, Step};

    fn negotiate(side: Side, cancel: &CancelToken) -> Negotiate<'_> {
        Negotiate {
            channel: "test",
            cancel,
            side,
            alpn: None,
            max_token: 16,
            deadline: Instant::now() + Duration::from_secs(1),
        }
    }

    fn context(steps: Vec<Step>, side: Side) -> <MockProvider as CryptoProvider>::Context {
        let provider = MockProvider::new(steps);
        let credentials = provider
            .acquire_credentials(side, None, Default::default())
            .unwrap();
        provider.create_context(&credentials, None).unwrap()
    }

    #[test]
    fn test_server_reads_first_and_keeps_extra() {
        let cancel = CancelToken::new();
        let mut context = context(
            vec![
                Step::expect(b"one", b"ack", NegotiationStep::Continue),
                Step::expect(b"two", b"", NegotiationStep::Done),
            ],
            Side::Server,
        );
        // NOTE: both tokens arrive in a single read.
        let mut transport = ScriptedTransport::new(vec![b"onetwo!".to_vec()]);

        negotiate(Side::Server, &cancel)
            .run(&mut context, &mut transport, &[])
            .unwrap();
        assert_eq!(transport.reads, 1);
        assert_eq!(transport.written, b"ack");
        assert_eq!(transport.pending_front(), Some(b"!".to_vec()));
    }

    #[test]
    fn test_seed_is_consumed_before_reading() {
        let cancel = CancelToken::new();
        let mut context = context(
            vec![Step::expect(b"hi", b"ok", NegotiationStep::Done)],
            Side::Server,
        );
        let mut transport = ScriptedTransport::new(Vec::new());

        negotiate(Side::Server, &cancel)
            .run(&mut context, &mut transport, b"hi")
            .unwrap();
        assert_eq!(transport.reads, 0);
        assert_eq!(transport.written, b"ok");
    }

    #[test]
    fn test_token_larger_than_limit() {
        let cancel = CancelToken::new();
        let mut context = context(
            vec![Step::expect(&[b'x'; 20], b"", NegotiationStep::Done)],
            Side::Server,
        );
        let mut transport = ScriptedTransport::new(vec![vec![b'x'; 20]]);

        let err = negotiate(Side::Server, &cancel)
            .run(&mut context, &mut transport, &[])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Handshake {
                reason: HandshakeFailure::TokenTooLarge { limit: 16 },
                ..
            }
        ));
    }

    #[test]
    fn test_disconnect_is_not_a_timeout() {
        let cancel = CancelToken::new();
        let mut context = context(
            vec![Step::expect(b"hello", b"", NegotiationStep::Done)],
            Side::Server,
        );
        let mut transport = ScriptedTransport::new(vec![b"he".to_vec()]);
        transport.disconnect_when_drained = true;

        let err = negotiate(Side::Server, &cancel)
            .run(&mut context, &mut transport, &[])
            .unwrap_err();
        assert!(matches!(err, Error::IONetwork(err) if err.kind() == std::io::ErrorKind::UnexpectedEof));
    }

    #[test]
    fn test_complete_and_continue() {
        let cancel = CancelToken::new();
        let mut context = context(
            vec![
                Step::send(b"a"),
                Step::expect(b"b", b"c", NegotiationStep::CompleteAndContinue),
                Step::expect(b"d", b"", NegotiationStep::Done),
            ],
            Side::Client,
        );
        let mut transport = ScriptedTransport::new(vec![b"b".to_vec(), b"d".to_vec()]);

        negotiate(Side::Client, &cancel)
            .run(&mut context, &mut transport, &[])
            .unwrap();
        assert_eq!(transport.written, b"ac+");
        assert_eq!(transport.flushes, 2);
    }

    #[test]
    fn test_client_opening_round_never_waits() {
        let cancel = CancelToken::new();
        let mut context = context(
            vec![Step::expect(b"reply", b"", NegotiationStep::Done)],
            Side::Client,
        );
        let mut transport = ScriptedTransport::new(vec![b"reply".to_vec()]);

        let err = negotiate(Side::Client, &cancel)
            .run(&mut context, &mut transport, &[])
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Handshake {
                reason: HandshakeFailure::Rejected(CryptoError::InvalidState(_)),
                ..
            }
        ));
        assert_eq!(transport.reads, 0);
        assert!(transport.written.is_empty());
    }
}
