use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::{SecureChannel, SessionState};
use crate::crypto::{CryptoProvider, NegotiationStatus, SecurityContext, TokenInput};
use crate::error::{Error, HandshakeFailure};
use crate::transport::RawTransport;

/// What happened during [`SecureChannel::terminate`]. Failures are collected, never raised.
#[derive(Debug, Default)]
pub struct TerminateReport {
    pub close_sent: bool,
    pub errors: Vec<Error>,
}

impl TerminateReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Produces the closing token and sends it within `timeout`.
pub(super) fn send_close<C, T>(
    channel: &str,
    context: &mut C,
    transport: &mut T,
    timeout: Duration,
) -> Result<(), Error>
where
    C: SecurityContext,
    T: RawTransport,
{
    context.apply_shutdown();
    let mut output = Vec::new();
    let step = context.negotiate(TokenInput::Empty, &mut output);
    match step.status {
        NegotiationStatus::Failed(source) => return Err(Error::crypto(channel, source)),
        NegotiationStatus::CompleteNeeded | NegotiationStatus::CompleteAndContinue => context
            .complete_token(&mut output)
            .map_err(|err| Error::handshake(channel, HandshakeFailure::TokenCompletion(err)))?,
        _ => {}
    }

    if !output.is_empty() {
        transport.write_bytes(&output)?;
        transport.flush(Instant::now() + timeout)?;
        debug!(channel, count = output.len(), "close notification sent");
    }
    Ok(())
}

impl<P: CryptoProvider> SecureChannel<P> {
    /// Closes the session and releases every provider handle. Safe to call repeatedly.
    pub fn terminate<T: RawTransport>(&mut self, transport: &mut T) -> TerminateReport {
        let mut report = TerminateReport::default();

        if let Some(mut session) = self.session.take() {
            if self.state.is_established() && !session.peer_closed && transport.is_connected() {
                match send_close(
                    &self.name,
                    &mut session.context,
                    transport,
                    self.config.shutdown_flush_timeout,
                ) {
                    Ok(()) => report.close_sent = true,
                    Err(err) => {
                        warn!(channel = %self.name, %err, "close notification failed");
                        report.errors.push(err);
                    }
                }
            }
            debug!(channel = %self.name, state = %self.state, "session released");
        }

        self.leftover.clear();
        self.alpn = None;
        self.target = None;
        self.state = SessionState::Closed;
        report
    }
}
