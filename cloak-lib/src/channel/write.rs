use std::time::Instant;

use tracing::{debug, trace};

use super::{SecureChannel, SessionState};
use crate::crypto::{CryptoProvider, SecurityContext};
use crate::error::Error;
use crate::transport::RawTransport;

impl<P: CryptoProvider> SecureChannel<P> {
    /// Encrypts `src` into as many records as needed and flushes them once.
    ///
    /// Stops between records when the cancel token is set; returns the plaintext bytes sent.
    pub fn write<T: RawTransport>(&mut self, transport: &mut T, src: &[u8]) -> Result<usize, Error> {
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
        let geometry = session.geometry;

        let mut sent = 0;
        for chunk in src.chunks(geometry.max_message) {
            if self.cancel.is_cancelled() {
                debug!(channel = %self.name, sent, total = src.len(), "write cancelled");
                break;
            }

            // LAYOUT: header | body | trailer, sized by the negotiated geometry.
            let (header, rest) = session.packet.raw_mut().split_at_mut(geometry.max_header);
            let (body, trailer) = rest.split_at_mut(geometry.max_message);
            let body = &mut body[..chunk.len()];
            body.copy_from_slice(chunk);

            let sealed = match session.context.encrypt(header, body, trailer) {
                Ok(sealed) => sealed,
                Err(source) => {
                    self.state = SessionState::Error;
                    return Err(Error::crypto(&self.name, source));
                }
            };
            // NOTE: the record holds a sequence number now, so losing any of it breaks the stream.
            let emitted = transport
                .write_bytes(&header[..sealed.header_len])
                .and_then(|()| transport.write_bytes(body))
                .and_then(|()| transport.write_bytes(&trailer[..sealed.trailer_len]));
            if let Err(err) = emitted {
                debug!(channel = %self.name, %err, "record write failed");
                self.state = SessionState::Error;
                return Err(err.into());
            }

            sent += chunk.len();
            trace!(channel = %self.name, count = chunk.len(), "record written");
        }

        if sent > 0 {
            if let Err(err) = transport.flush(Instant::now() + self.config.write_flush_timeout) {
                debug!(channel = %self.name, %err, sent, "record flush failed");
                self.state = SessionState::Error;
                return Err(err.into());
            }
        }
        Ok(sent)
    }
}
