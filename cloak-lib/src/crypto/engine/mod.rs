mod context;
pub(crate) mod hello;
pub(crate) mod unit;

use std::collections::HashMap;
use std::sync::Arc;

use ring::signature::{self, KeyPair};
use tracing::debug;

use super::{CryptoProvider, Side, ED25519_PUBLIC_KEY_LEN};
use crate::config::{CertSource, CertificateRef, SessionOptions};
use crate::error::CryptoError;

pub use context::RingContext;
pub use unit::ProtocolVersion;

type PublicKey = [u8; ED25519_PUBLIC_KEY_LEN];

fn parse_public_key(bytes: &[u8]) -> Result<PublicKey, CryptoError> {
    PublicKey::try_from(bytes).map_err(|_| {
        CryptoError::KeyRejected(format!(
            "expected a {ED25519_PUBLIC_KEY_LEN}-byte Ed25519 public key, got {} bytes",
            bytes.len()
        ))
    })
}

#[derive(Debug, Clone)]
pub(crate) struct Policy {
    trusted: HashMap<String, Vec<PublicKey>>,
    default_trusted: Vec<PublicKey>,
    protocols: Vec<String>,
    max_version: ProtocolVersion,
    require_client_auth: bool,
    trusted_clients: Vec<PublicKey>,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            trusted: HashMap::new(),
            default_trusted: Vec::new(),
            protocols: Vec::new(),
            max_version: ProtocolVersion::LATEST,
            require_client_auth: false,
            trusted_clients: Vec::new(),
        }
    }
}

impl Policy {
    /// Keys a server may sign with when answering a client that targets `target`.
    pub(crate) fn server_keys(&self, target: Option<&str>, no_default: bool) -> Vec<&PublicKey> {
        let own = target
            .and_then(|target| self.trusted.get(target))
            .into_iter()
            .flatten();
        match no_default {
            true => own.collect(),
            false => own.chain(self.default_trusted.iter()).collect(),
        }
    }

    /// Picks the first locally preferred protocol the client offered.
    pub(crate) fn select_protocol(&self, offered: &[String]) -> Result<Option<String>, CryptoError> {
        if offered.is_empty() || self.protocols.is_empty() {
            return Ok(None);
        }
        self.protocols
            .iter()
            .find(|name| offered.contains(name))
            .cloned()
            .map(Some)
            .ok_or(CryptoError::NoApplicationProtocol)
    }

    pub(crate) fn max_version(&self) -> ProtocolVersion {
        self.max_version
    }

    pub(crate) fn require_client_auth(&self) -> bool {
        self.require_client_auth
    }

    pub(crate) fn is_trusted_client(&self, key: &PublicKey) -> bool {
        self.trusted_clients.is_empty() || self.trusted_clients.contains(key)
    }
}

/// A provider built from `ring` primitives: X25519 key agreement, HKDF-SHA256 key
/// derivation, AES-128-GCM records and Ed25519 server authentication.
///
/// Certificates in the `mstore`/`ustore` sources are registered in memory with
/// [`RingProvider::with_certificate`]; `file` certificates are PKCS#8 documents on disk.
#[derive(Default)]
pub struct RingProvider {
    certificates: HashMap<CertificateRef, Arc<signature::Ed25519KeyPair>>,
    policy: Arc<Policy>,
}

impl RingProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_certificate(
        mut self,
        certificate: CertificateRef,
        pkcs8: &[u8],
    ) -> Result<Self, CryptoError> {
        let key_pair = signature::Ed25519KeyPair::from_pkcs8_maybe_unchecked(pkcs8)?;
        self.certificates.insert(certificate, Arc::new(key_pair));
        Ok(self)
    }

    /// Trusts `public_key` to authenticate servers reached as `target`.
    pub fn trust(mut self, target: impl Into<String>, public_key: &[u8]) -> Result<Self, CryptoError> {
        let key = parse_public_key(public_key)?;
        Arc::make_mut(&mut self.policy)
            .trusted
            .entry(target.into())
            .or_default()
            .push(key);
        Ok(self)
    }

    /// Trusts `public_key` for every target, unless a session opts out with
    /// `no_default_credentials`.
    pub fn trust_any(mut self, public_key: &[u8]) -> Result<Self, CryptoError> {
        let key = parse_public_key(public_key)?;
        Arc::make_mut(&mut self.policy).default_trusted.push(key);
        Ok(self)
    }

    /// Application protocols a server is willing to speak, most preferred first.
    pub fn with_protocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Arc::make_mut(&mut self.policy).protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_version(mut self, version: ProtocolVersion) -> Self {
        Arc::make_mut(&mut self.policy).max_version = version;
        self
    }

    /// Makes a server demand a client certificate, optionally restricted to the given keys.
    pub fn require_client_certificate(mut self, trusted: &[&[u8]]) -> Result<Self, CryptoError> {
        let trusted = trusted
            .iter()
            .map(|key| parse_public_key(key))
            .collect::<Result<Vec<_>, _>>()?;
        let policy = Arc::make_mut(&mut self.policy);
        policy.require_client_auth = true;
        policy.trusted_clients = trusted;
        Ok(self)
    }

    fn resolve(
        &self,
        certificate: &CertificateRef,
    ) -> Result<Arc<signature::Ed25519KeyPair>, CryptoError> {
        match certificate.source {
            CertSource::File => {
                let pkcs8 = std::fs::read(&certificate.location).map_err(|err| {
                    CryptoError::CertificateNotFound(format!("{certificate}: {err}"))
                })?;
                let key_pair = signature::Ed25519KeyPair::from_pkcs8_maybe_unchecked(&pkcs8)?;
                Ok(Arc::new(key_pair))
            }
            CertSource::MachineStore | CertSource::UserStore => self
                .certificates
                .get(certificate)
                .cloned()
                .ok_or_else(|| CryptoError::CertificateNotFound(certificate.to_string())),
        }
    }
}

pub struct RingCredentials {
    side: Side,
    options: SessionOptions,
    key_pair: Option<Arc<signature::Ed25519KeyPair>>,
    policy: Arc<Policy>,
}

impl RingCredentials {
    /// The Ed25519 public key backing these credentials, if a certificate was supplied.
    pub fn public_key(&self) -> Option<&[u8]> {
        self.key_pair
            .as_ref()
            .map(|key_pair| key_pair.public_key().as_ref())
    }
}

impl CryptoProvider for RingProvider {
    type Credentials = RingCredentials;
    type Context = RingContext;

    fn max_token_len(&self) -> usize {
        unit::MAX_UNIT_LEN
    }

    fn acquire_credentials(
        &self,
        side: Side,
        certificate: Option<&CertificateRef>,
        options: SessionOptions,
    ) -> Result<Self::Credentials, CryptoError> {
        let key_pair = certificate.map(|cert| self.resolve(cert)).transpose()?;
        if side == Side::Server && key_pair.is_none() {
            return Err(CryptoError::CertificateNotFound(
                "server credentials need a certificate".to_owned(),
            ));
        }
        debug!(?side, has_certificate = key_pair.is_some(), "credentials acquired");

        Ok(RingCredentials {
            side,
            options,
            key_pair,
            policy: Arc::clone(&self.policy),
        })
    }

    fn create_context(
        &self,
        credentials: &Self::Credentials,
        target: Option<&str>,
    ) -> Result<Self::Context, CryptoError> {
        Ok(RingContext::new(
            credentials.side,
            credentials.options,
            credentials.key_pair.clone(),
            Arc::clone(&credentials.policy),
            target.map(str::to_owned),
        ))
    }
}
