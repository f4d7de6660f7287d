use crate::channel::SessionState;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("Handshake failed on channel {channel:?}: {reason}")]
    Handshake {
        channel: String,
        reason: HandshakeFailure,
    },
    #[error("Timed out waiting for {stage} on channel {channel:?}")]
    Timeout {
        channel: String,
        stage: &'static str,
    },
    #[error("Incomplete data on channel {channel:?}; requested {requested}, available {available}")]
    IncompleteData {
        channel: String,
        requested: usize,
        available: usize,
    },
    #[error("Protocol violation on channel {channel:?}: {violation}")]
    Protocol {
        channel: String,
        violation: ProtocolViolation,
    },
    #[error("Renegotiation failed on channel {channel:?}: {source}")]
    Renegotiation {
        channel: String,
        #[source]
        source: Box<Error>,
    },
    #[error("Shutdown requested while negotiating channel {channel:?}")]
    ShutdownRequested { channel: String },
    #[error("Secure channel {0:?} is already initialized")]
    AlreadyInitialized(String),
    #[error("Secure channel {0:?} is not initialized")]
    NotInitialized(String),
    #[error("Secure channel {0:?} failed earlier and must be terminated")]
    SessionFailed(String),
    #[error("Operation not permitted on channel {channel:?} in state {state:?}")]
    InvalidState {
        channel: String,
        state: SessionState,
    },
    #[error("Error performing cryptographic operations on channel {channel:?}: {source} (status 0x{:08x})", .source.status_code())]
    Crypto {
        channel: String,
        #[source]
        source: CryptoError,
    },
    #[error("Error in IO/Network: {0}")]
    IONetwork(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn crypto(channel: &str, source: CryptoError) -> Self {
        Self::Crypto {
            channel: channel.to_owned(),
            source,
        }
    }

    pub(crate) fn handshake(channel: &str, reason: HandshakeFailure) -> Self {
        Self::Handshake {
            channel: channel.to_owned(),
            reason,
        }
    }

    pub(crate) fn protocol(channel: &str, violation: ProtocolViolation) -> Self {
        Self::Protocol {
            channel: channel.to_owned(),
            violation,
        }
    }

    /// Timeouts and short reads leave the session usable; everything else does not.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::IncompleteData { .. } => true,
            Self::IONetwork(err) => matches!(
                err.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// The provider status code behind this error, if the provider produced it.
    pub fn status_code(&self) -> Option<u32> {
        match self {
            Self::Crypto { source, .. } => Some(source.status_code()),
            Self::Handshake { reason, .. } => reason.status_code(),
            Self::Protocol {
                violation: ProtocolViolation::Rejected(err),
                ..
            } => Some(err.status_code()),
            Self::Renegotiation { source, .. } => source.status_code(),
            _ => None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Invalid certificate reference {0:?}; expected <source>:<location>,<common name>")]
    BadCertificateRef(String),
    #[error("Unknown certificate source {0:?}")]
    UnknownCertSource(String),
    #[error("A server channel requires a certificate")]
    NoServerCertificate,
    #[error("Invalid application protocol name {0:?}")]
    BadProtocolName(String),
    #[error("Application protocol list above limit; length {length}, limit {limit}")]
    ProtocolListTooLong { length: usize, limit: usize },
    #[error("Transport is not connected")]
    NotConnected,
}

#[derive(thiserror::Error, Debug)]
pub enum HandshakeFailure {
    #[error("negotiation rejected: {0} (status 0x{:08x})", .0.status_code())]
    Rejected(#[from] CryptoError),
    #[error("could not complete the pending token: {0}")]
    TokenCompletion(CryptoError),
    #[error("the server requires a client certificate")]
    NoClientCertificate,
    #[error("handshake token above limit; limit {limit}")]
    TokenTooLarge { limit: usize },
}

impl HandshakeFailure {
    fn status_code(&self) -> Option<u32> {
        match self {
            Self::Rejected(err) | Self::TokenCompletion(err) => Some(err.status_code()),
            _ => None,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ProtocolViolation {
    #[error("message received out of sequence")]
    OutOfSequence,
    #[error("message was altered in transit")]
    MessageAltered,
    #[error("stream ended in the middle of a record")]
    PartialMessage,
    #[error("record does not fit the packet buffer; limit {limit}")]
    OversizedRecord { limit: usize },
    #[error("record rejected: {0}")]
    Rejected(CryptoError),
}

#[derive(thiserror::Error, Debug)]
pub enum CryptoError {
    #[error("An error with absolutely no details")]
    Unspecified,
    #[error("An error parsing or validating a key: {0}")]
    KeyRejected(String),
    #[error("Bad server hello signature")]
    BadServerHelloSignature,
    #[error("Bad server public key")]
    BadServerPublicKey,
    #[error("No trusted key for target {0:?}")]
    UntrustedTarget(String),
    #[error("Certificate not found: {0}")]
    CertificateNotFound(String),
    #[error("Unsupported protocol version 0x{0:02x}")]
    UnsupportedVersion(u8),
    #[error("Malformed token: {0}")]
    MalformedToken(&'static str),
    #[error("Unexpected message type 0x{0:02x}")]
    UnexpectedMessage(u8),
    #[error("No application protocol in common")]
    NoApplicationProtocol,
    #[error("Handshake verification failed")]
    BadFinished,
    #[error("Payload length above limit; length {length}, limit {limit}")]
    PayloadTooLarge { length: usize, limit: usize },
    #[error("Operation invalid in the current context state: {0}")]
    InvalidState(&'static str),
}

impl CryptoError {
    // NOTE: codes mirror the SEC_E_* values of the closest meaning.
    pub fn status_code(&self) -> u32 {
        match self {
            Self::Unspecified => 0x8009_0304,
            Self::KeyRejected(_) => 0x8009_0308,
            Self::BadServerHelloSignature => 0x8009_0330,
            Self::BadServerPublicKey => 0x8009_0331,
            Self::UntrustedTarget(_) => 0x8009_0311,
            Self::CertificateNotFound(_) => 0x8009_030e,
            Self::UnsupportedVersion(_) => 0x8009_0332,
            Self::MalformedToken(_) => 0x8009_0318,
            Self::UnexpectedMessage(_) => 0x8009_0326,
            Self::NoApplicationProtocol => 0x8009_0367,
            Self::BadFinished => 0x8009_030f,
            Self::PayloadTooLarge { .. } => 0x8009_0329,
            Self::InvalidState(_) => 0x8009_0301,
        }
    }
}

impl From<ring::error::Unspecified> for CryptoError {
    fn from(_: ring::error::Unspecified) -> Self {
        Self::Unspecified
    }
}

impl From<ring::error::KeyRejected> for CryptoError {
    fn from(err: ring::error::KeyRejected) -> Self {
        Self::KeyRejected(err.to_string())
    }
}
