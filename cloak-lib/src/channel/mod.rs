mod buffer;
mod handshake;
mod read;
mod shutdown;
mod state;
mod write;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::config::{CertificateRef, ChannelConfig};
use crate::crypto::{alpn, CryptoProvider, RecordGeometry, SecurityContext, Side};
use crate::error::{ConfigError, CryptoError, Error};
use crate::transport::RawTransport;

use buffer::{CarryBuffer, LeftoverBuffer};
use handshake::Negotiate;

pub use shutdown::TerminateReport;
pub use state::SessionState;

/// Cooperative cancellation flag, polled between loop iterations.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    /// Return as soon as any plaintext is available.
    AllowPartial,
    /// Fail with [`Error::IncompleteData`] unless the whole destination is filled.
    RequireAll,
}

struct Session<P: CryptoProvider> {
    side: Side,
    // NOTE: fields drop in order, so the context is released before its credentials.
    context: P::Context,
    _credentials: P::Credentials,
    geometry: RecordGeometry,
    packet: CarryBuffer,
    peer_closed: bool,
}

impl<P: CryptoProvider> Session<P> {
    /// Re-reads the record geometry after a renegotiation, resizing the packet buffer.
    fn refresh_geometry(&mut self) -> Result<(), CryptoError> {
        let geometry = self.context.geometry()?;
        if geometry != self.geometry {
            debug!(?geometry, "record geometry changed");
            self.packet = CarryBuffer::new(geometry.packet_len());
            self.geometry = geometry;
        }
        Ok(())
    }
}

/// One secure session over a caller-supplied [`RawTransport`].
///
/// The channel never owns the transport: every operation borrows it, so the same
/// transport must be passed for the lifetime of a session.
pub struct SecureChannel<P: CryptoProvider> {
    name: String,
    provider: P,
    config: ChannelConfig,
    cancel: CancelToken,
    state: SessionState,
    session: Option<Session<P>>,
    leftover: LeftoverBuffer,
    alpn: Option<Vec<u8>>,
    target: Option<String>,
}

impl<P: CryptoProvider> SecureChannel<P> {
    pub fn new(name: impl Into<String>, provider: P, config: ChannelConfig) -> Self {
        Self {
            name: name.into(),
            provider,
            config,
            cancel: CancelToken::new(),
            state: SessionState::Idle,
            session: None,
            leftover: LeftoverBuffer::default(),
            alpn: None,
            target: None,
        }
    }

    /// Negotiates a client session with the server known as `target`.
    pub fn connect_client<T: RawTransport>(
        &mut self,
        transport: &mut T,
        target: &str,
        protocols: &[String],
        certificate: Option<&CertificateRef>,
        deadline: Instant,
    ) -> Result<(), Error> {
        if self.session.is_some() {
            return Err(Error::AlreadyInitialized(self.name.clone()));
        }
        self.alpn = alpn::encode_extension(protocols)?;
        self.target = Some(target.to_owned());
        self.establish(transport, Side::Client, certificate, deadline)
    }

    /// Negotiates a server session authenticated by `certificate`.
    pub fn connect_server<T: RawTransport>(
        &mut self,
        transport: &mut T,
        certificate: Option<&CertificateRef>,
        deadline: Instant,
    ) -> Result<(), Error> {
        if self.session.is_some() {
            return Err(Error::AlreadyInitialized(self.name.clone()));
        }
        let certificate = certificate.ok_or(ConfigError::NoServerCertificate)?;
        self.establish(transport, Side::Server, Some(certificate), deadline)
    }

    fn establish<T: RawTransport>(
        &mut self,
        transport: &mut T,
        side: Side,
        certificate: Option<&CertificateRef>,
        deadline: Instant,
    ) -> Result<(), Error> {
        debug!(channel = %self.name, ?side, "negotiating");
        self.state = SessionState::Negotiating;
        self.leftover.clear();

        match self.negotiate_session(transport, side, certificate, deadline) {
            Ok(session) => {
                debug!(
                    channel = %self.name,
                    geometry = ?session.geometry,
                    protocol = ?session.context.negotiated_protocol(),
                    "established"
                );
                self.session = Some(session);
                self.state = SessionState::Established;
                Ok(())
            }
            Err(err) => {
                debug!(channel = %self.name, %err, "negotiation aborted");
                self.state = SessionState::Idle;
                self.alpn = None;
                self.target = None;
                Err(err)
            }
        }
    }

    fn negotiate_session<T: RawTransport>(
        &self,
        transport: &mut T,
        side: Side,
        certificate: Option<&CertificateRef>,
        deadline: Instant,
    ) -> Result<Session<P>, Error> {
        let credentials = self
            .provider
            .acquire_credentials(side, certificate, self.config.options)
            .map_err(|source| Error::crypto(&self.name, source))?;
        let mut context = self
            .provider
            .create_context(&credentials, self.target.as_deref())
            .map_err(|source| Error::crypto(&self.name, source))?;

        self.negotiator(side, deadline)
            .run(&mut context, transport, &[])?;

        let geometry = context
            .geometry()
            .map_err(|source| Error::crypto(&self.name, source))?;
        Ok(Session {
            side,
            context,
            _credentials: credentials,
            geometry,
            packet: CarryBuffer::new(geometry.packet_len()),
            peer_closed: false,
        })
    }

    fn negotiator(&self, side: Side, deadline: Instant) -> Negotiate<'_> {
        Negotiate {
            channel: &self.name,
            cancel: &self.cancel,
            side,
            alpn: self.alpn.as_deref(),
            max_token: self.provider.max_token_len(),
            deadline,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn side(&self) -> Option<Side> {
        self.session.as_ref().map(|session| session.side)
    }

    pub fn geometry(&self) -> Option<RecordGeometry> {
        self.session.as_ref().map(|session| session.geometry)
    }

    /// The application protocol the server selected, if any.
    pub fn negotiated_protocol(&self) -> Option<&str> {
        self.session
            .as_ref()
            .and_then(|session| session.context.negotiated_protocol())
    }

    pub fn peer_closed(&self) -> bool {
        self.session
            .as_ref()
            .map_or(false, |session| session.peer_closed)
    }

    /// Decrypted bytes waiting to be read.
    pub fn buffered(&self) -> usize {
        self.leftover.len()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }
}

impl<P: CryptoProvider> Drop for SecureChannel<P> {
    fn drop(&mut self) {
        if self.session.take().is_some() {
            warn!(channel = %self.name, state = %self.state, "dropped without terminate, session released");
        }
    }
}
