pub mod alpn;
mod engine;
mod keys;
mod secrets;

use std::ops::Range;

use crate::config::{CertificateRef, SessionOptions};
use crate::error::CryptoError;

pub use engine::{ProtocolVersion, RingContext, RingCredentials, RingProvider};
pub use keys::{generate_signing_key_pkcs8, signing_public_key};

pub(crate) const NONCE_LEN: usize = 16;
pub(crate) const ED25519_SIGNATURE_LEN: usize = 64;
pub(crate) const ED25519_PUBLIC_KEY_LEN: usize = 32;
pub(crate) const X25519_PUBLIC_KEY_LEN: usize = 32;
pub(crate) const SIGNED_CONTENT_LEN: usize = 2 * NONCE_LEN + X25519_PUBLIC_KEY_LEN;
pub(crate) const AEAD_KEY_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

/// Record-layer sizing negotiated for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordGeometry {
    pub max_header: usize,
    pub max_message: usize,
    pub max_trailer: usize,
}

impl RecordGeometry {
    pub fn packet_len(&self) -> usize {
        self.max_header + self.max_message + self.max_trailer
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenInput<'a> {
    Empty,
    Token(&'a [u8]),
    /// An application-protocol extension buffer, see [`alpn::encode_extension`].
    ApplicationProtocols(&'a [u8]),
}

#[derive(Debug)]
pub enum NegotiationStatus {
    /// The input does not hold a complete token yet; nothing was consumed.
    Incomplete,
    Continue,
    CompleteNeeded,
    CompleteAndContinue,
    Done,
    /// The peer asked for a client certificate and none is available.
    IncompleteCredentials,
    Failed(CryptoError),
}

#[derive(Debug)]
pub struct Negotiation {
    pub status: NegotiationStatus,
    /// Trailing input bytes that were not part of the consumed token.
    pub extra: usize,
}

impl Negotiation {
    pub(crate) fn new(status: NegotiationStatus, extra: usize) -> Self {
        Self { status, extra }
    }

    pub(crate) fn failed(err: CryptoError) -> Self {
        Self::new(NegotiationStatus::Failed(err), 0)
    }
}

#[derive(Debug)]
pub enum DecryptStatus {
    Ok,
    Incomplete,
    PeerClosed,
    Renegotiate,
    OutOfSequence,
    Altered,
    Failed(CryptoError),
}

#[derive(Debug)]
pub struct Decrypted {
    pub status: DecryptStatus,
    /// Plaintext position inside the decrypted buffer.
    pub data: Range<usize>,
    /// Trailing bytes that belong to the following unit.
    pub extra: usize,
}

impl Decrypted {
    pub(crate) fn new(status: DecryptStatus, data: Range<usize>, extra: usize) -> Self {
        Self {
            status,
            data,
            extra,
        }
    }

    pub(crate) fn bare(status: DecryptStatus, extra: usize) -> Self {
        Self::new(status, 0..0, extra)
    }
}

/// Lengths actually used around an encrypted body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sealed {
    pub header_len: usize,
    pub trailer_len: usize,
}

pub trait CryptoProvider {
    type Credentials;
    type Context: SecurityContext;

    /// Upper bound of a single handshake token.
    fn max_token_len(&self) -> usize;

    fn acquire_credentials(
        &self,
        side: Side,
        certificate: Option<&CertificateRef>,
        options: SessionOptions,
    ) -> Result<Self::Credentials, CryptoError>;

    fn create_context(
        &self,
        credentials: &Self::Credentials,
        target: Option<&str>,
    ) -> Result<Self::Context, CryptoError>;
}

pub trait SecurityContext {
    /// Runs one negotiation step over `input`, appending any token to send to `output`.
    ///
    /// After [`SecurityContext::apply_shutdown`] the step produces the closing token instead.
    fn negotiate(&mut self, input: TokenInput<'_>, output: &mut Vec<u8>) -> Negotiation;

    /// Finalizes a token produced with [`NegotiationStatus::CompleteNeeded`] or
    /// [`NegotiationStatus::CompleteAndContinue`].
    fn complete_token(&mut self, output: &mut Vec<u8>) -> Result<(), CryptoError>;

    fn geometry(&self) -> Result<RecordGeometry, CryptoError>;

    /// Encrypts `body` in place, filling the leading part of `header` and `trailer`.
    fn encrypt(
        &mut self,
        header: &mut [u8],
        body: &mut [u8],
        trailer: &mut [u8],
    ) -> Result<Sealed, CryptoError>;

    /// Decrypts the first unit of `data` in place.
    fn decrypt(&mut self, data: &mut [u8]) -> Decrypted;

    fn apply_shutdown(&mut self);

    fn request_renegotiation(&mut self, output: &mut Vec<u8>) -> Result<(), CryptoError>;

    fn negotiated_protocol(&self) -> Option<&str>;
}
