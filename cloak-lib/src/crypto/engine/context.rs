use std::mem;
use std::sync::Arc;

use ring::agreement;
use ring::signature::{self, KeyPair};
use tracing::{debug, trace};

use super::hello::{
    ClientAuth, ClientFinished, ClientHello, ServerHello, REQUIRE_CLIENT_AUTH, VERIFY_DATA_LEN,
};
use super::unit::{
    self, ProtocolVersion, UnitHeader, UnitType, MAX_MESSAGE_LEN, SEALED_HEADER_LEN, SEQUENCE_LEN,
    TAG_LEN, UNIT_HEADER_LEN,
};
use super::Policy;
use crate::config::SessionOptions;
use crate::crypto::secrets::{OpenError, SessionSecrets};
use crate::crypto::{
    alpn, keys, DecryptStatus, Decrypted, Negotiation, NegotiationStatus, RecordGeometry, Sealed,
    SecurityContext, Side, TokenInput, ED25519_PUBLIC_KEY_LEN, ED25519_SIGNATURE_LEN, NONCE_LEN,
    X25519_PUBLIC_KEY_LEN,
};
use crate::error::CryptoError;

enum Handshake {
    Start,
    AwaitServerHello {
        private_key: agreement::EphemeralPrivateKey,
        nonce: [u8; NONCE_LEN],
    },
    AwaitClientFinished {
        pending: SessionSecrets,
        nonces: [u8; 2 * NONCE_LEN],
        public_key: [u8; X25519_PUBLIC_KEY_LEN],
    },
    Done,
    Failed,
}

pub struct RingContext {
    side: Side,
    options: SessionOptions,
    key_pair: Option<Arc<signature::Ed25519KeyPair>>,
    policy: Arc<Policy>,
    target: Option<String>,
    handshake: Handshake,
    // NOTE: the established keys stay in use until a renegotiation finishes.
    secrets: Option<SessionSecrets>,
    version: ProtocolVersion,
    offered: Vec<String>,
    protocol: Option<String>,
    closing: bool,
    renegotiation_requested: bool,
}

impl RingContext {
    pub(super) fn new(
        side: Side,
        options: SessionOptions,
        key_pair: Option<Arc<signature::Ed25519KeyPair>>,
        policy: Arc<Policy>,
        target: Option<String>,
    ) -> Self {
        let version = policy.max_version();
        Self {
            side,
            options,
            key_pair,
            policy,
            target,
            handshake: Handshake::Start,
            secrets: None,
            version,
            offered: Vec::new(),
            protocol: None,
            closing: false,
            renegotiation_requested: false,
        }
    }

    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    fn send_client_hello(
        &mut self,
        input: TokenInput<'_>,
        output: &mut Vec<u8>,
    ) -> Result<NegotiationStatus, CryptoError> {
        self.offered = match input {
            TokenInput::Empty => Vec::new(),
            TokenInput::ApplicationProtocols(ext) => alpn::decode_extension(ext)?,
            TokenInput::Token(_) => return Err(CryptoError::InvalidState("the client speaks first")),
        };

        let nonce = keys::generate_nonce()?;
        let (private_key, public_key) = keys::generate_ephemeral_key_pair()?;
        let hello = ClientHello {
            nonce,
            public_key,
            target: self.target.clone().unwrap_or_default(),
            protocols: self.offered.clone(),
        };

        let mut payload = Vec::new();
        hello.encode(&mut payload)?;
        unit::write_unit(UnitType::ClientHello, self.policy.max_version(), &payload, output)?;
        debug!(server_name = %hello.target, protocols = ?hello.protocols, "client hello");

        self.handshake = Handshake::AwaitServerHello { private_key, nonce };
        Ok(NegotiationStatus::Continue)
    }

    fn receive(
        &mut self,
        handshake: Handshake,
        header: UnitHeader,
        unit: &[u8],
        output: &mut Vec<u8>,
    ) -> Result<NegotiationStatus, CryptoError> {
        match (self.side, handshake) {
            (Side::Server, Handshake::Start) => self.accept_client_hello(header, unit, output),
            (Side::Client, Handshake::AwaitServerHello { private_key, nonce }) => {
                self.accept_server_hello(private_key, nonce, header, unit, output)
            }
            (
                Side::Server,
                Handshake::AwaitClientFinished {
                    pending,
                    nonces,
                    public_key,
                },
            ) => self.accept_client_finished(pending, nonces, public_key, header, unit),
            _ => Err(CryptoError::InvalidState("no negotiation in progress")),
        }
    }

    fn accept_client_hello(
        &mut self,
        header: UnitHeader,
        unit: &[u8],
        output: &mut Vec<u8>,
    ) -> Result<NegotiationStatus, CryptoError> {
        expect_type(&header, UnitType::ClientHello)?;
        // NOTE: answer with the highest version both sides speak.
        let version = ProtocolVersion::try_from(header.version.min(self.policy.max_version().into()))
            .map_err(|_| CryptoError::UnsupportedVersion(header.version))?;
        let hello = ClientHello::decode(&unit[UNIT_HEADER_LEN..])?;
        let protocol = self.policy.select_protocol(&hello.protocols)?;

        let key_pair = self
            .key_pair
            .as_ref()
            .ok_or_else(|| CryptoError::CertificateNotFound("server certificate".to_owned()))?;
        let nonce = keys::generate_nonce()?;
        let (private_key, public_key) = keys::generate_ephemeral_key_pair()?;
        let nonces = keys::join_nonces(&hello.nonce, &nonce);
        let signature = <[u8; ED25519_SIGNATURE_LEN]>::try_from(
            key_pair.sign(&keys::signed_content(&nonces, &public_key)).as_ref(),
        )
        .map_err(|_| CryptoError::Unspecified)?;

        let pending =
            keys::generate_session_secrets(private_key, &hello.public_key, &nonces, Side::Server)
                .map_err(|_| CryptoError::MalformedToken("client public key"))?;

        let reply = ServerHello {
            flags: match self.policy.require_client_auth() {
                true => REQUIRE_CLIENT_AUTH,
                false => 0,
            },
            nonce,
            public_key,
            signature,
            protocol: protocol.clone(),
        };
        let mut payload = Vec::new();
        reply.encode(&mut payload)?;
        unit::write_unit(UnitType::ServerHello, version, &payload, output)?;
        debug!(server_name = %hello.target, ?version, ?protocol, "client hello accepted");

        self.version = version;
        self.protocol = protocol;
        self.handshake = Handshake::AwaitClientFinished {
            pending,
            nonces,
            public_key,
        };
        Ok(NegotiationStatus::Continue)
    }

    fn accept_server_hello(
        &mut self,
        private_key: agreement::EphemeralPrivateKey,
        client_nonce: [u8; NONCE_LEN],
        header: UnitHeader,
        unit: &[u8],
        output: &mut Vec<u8>,
    ) -> Result<NegotiationStatus, CryptoError> {
        expect_type(&header, UnitType::ServerHello)?;
        let version = self.accept_version(header.version)?;
        let hello = ServerHello::decode(&unit[UNIT_HEADER_LEN..])?;
        let nonces = keys::join_nonces(&client_nonce, &hello.nonce);
        self.verify_server(&nonces, &hello)?;

        if hello.requires_client_auth() && self.key_pair.is_none() {
            debug!("server requires a client certificate");
            return Ok(NegotiationStatus::IncompleteCredentials);
        }
        if let Some(protocol) = &hello.protocol {
            if !self.offered.contains(protocol) {
                return Err(CryptoError::MalformedToken("selected protocol was never offered"));
            }
        }

        let mut secrets =
            keys::generate_session_secrets(private_key, &hello.public_key, &nonces, Side::Client)?;

        let auth = match (hello.requires_client_auth(), &self.key_pair) {
            (true, Some(key_pair)) => Some(ClientAuth {
                public_key: <[u8; ED25519_PUBLIC_KEY_LEN]>::try_from(key_pair.public_key().as_ref())
                    .map_err(|_| CryptoError::Unspecified)?,
                signature: <[u8; ED25519_SIGNATURE_LEN]>::try_from(
                    key_pair
                        .sign(&keys::signed_content(&nonces, &hello.public_key))
                        .as_ref(),
                )
                .map_err(|_| CryptoError::Unspecified)?,
            }),
            _ => None,
        };
        let finished = ClientFinished {
            verify_data: finished_data(&nonces)?,
            auth,
        };
        let mut payload = Vec::new();
        finished.encode(&mut payload);
        secrets.seal_unit(
            UnitType::ClientFinished.into(),
            version.into(),
            &payload,
            output,
        )?;
        debug!(?version, protocol = ?hello.protocol, "server hello accepted");

        self.version = version;
        self.protocol = hello.protocol;
        self.secrets = Some(secrets);
        self.renegotiation_requested = false;
        self.handshake = Handshake::Done;
        Ok(NegotiationStatus::Done)
    }

    fn accept_client_finished(
        &mut self,
        mut pending: SessionSecrets,
        nonces: [u8; 2 * NONCE_LEN],
        public_key: [u8; X25519_PUBLIC_KEY_LEN],
        header: UnitHeader,
        unit: &[u8],
    ) -> Result<NegotiationStatus, CryptoError> {
        expect_type(&header, UnitType::ClientFinished)?;
        if unit.len() < SEALED_HEADER_LEN + TAG_LEN {
            return Err(CryptoError::MalformedToken("client finished"));
        }

        let mut sealed = unit.to_vec();
        let (head, body) = sealed.split_at_mut(SEALED_HEADER_LEN);
        let len = pending
            .open_in_place(head, body)
            .map_err(|_| CryptoError::BadFinished)?;
        let finished = ClientFinished::decode(&body[..len])?;
        if finished.verify_data != finished_data(&nonces)? {
            return Err(CryptoError::BadFinished);
        }

        if self.policy.require_client_auth() {
            let auth = finished.auth.ok_or(CryptoError::BadFinished)?;
            signature::UnparsedPublicKey::new(&signature::ED25519, &auth.public_key)
                .verify(
                    &keys::signed_content(&nonces, &public_key),
                    &auth.signature,
                )
                .map_err(|_| CryptoError::BadFinished)?;
            if !self.policy.is_trusted_client(&auth.public_key) {
                return Err(CryptoError::KeyRejected("untrusted client key".to_owned()));
            }
        }

        debug!("client finished verified");
        self.secrets = Some(pending);
        self.renegotiation_requested = false;
        self.handshake = Handshake::Done;
        Ok(NegotiationStatus::Done)
    }

    fn accept_version(&self, offered: u8) -> Result<ProtocolVersion, CryptoError> {
        let version = ProtocolVersion::try_from(offered)
            .map_err(|_| CryptoError::UnsupportedVersion(offered))?;
        let wanted = self.policy.max_version();
        let older_allowed =
            self.options.allow_older_minor_version && wanted.previous_minor() == Some(version);
        match version == wanted || older_allowed {
            true => Ok(version),
            false => Err(CryptoError::UnsupportedVersion(offered)),
        }
    }

    fn verify_server(
        &self,
        nonces: &[u8; 2 * NONCE_LEN],
        hello: &ServerHello,
    ) -> Result<(), CryptoError> {
        let candidates = self
            .policy
            .server_keys(self.target.as_deref(), self.options.no_default_credentials);
        if candidates.is_empty() {
            return Err(CryptoError::UntrustedTarget(
                self.target.clone().unwrap_or_default(),
            ));
        }

        let content = keys::signed_content(nonces, &hello.public_key);
        candidates
            .into_iter()
            .any(|key| {
                signature::UnparsedPublicKey::new(&signature::ED25519, key)
                    .verify(&content, &hello.signature)
                    .is_ok()
            })
            .then_some(())
            .ok_or(CryptoError::BadServerHelloSignature)
    }

    fn close_token(&mut self, output: &mut Vec<u8>) -> Negotiation {
        let Some(secrets) = self.secrets.as_mut() else {
            return Negotiation::failed(CryptoError::InvalidState("no session to close"));
        };
        match secrets.seal_unit(UnitType::CloseNotify.into(), self.version.into(), &[], output) {
            Ok(()) => Negotiation::new(NegotiationStatus::Done, 0),
            Err(err) => Negotiation::failed(err),
        }
    }
}

fn expect_type(header: &UnitHeader, expected: UnitType) -> Result<(), CryptoError> {
    match header.unit_type()? == expected {
        true => Ok(()),
        false => Err(CryptoError::UnexpectedMessage(header.unit_type)),
    }
}

fn finished_data(nonces: &[u8; 2 * NONCE_LEN]) -> Result<[u8; VERIFY_DATA_LEN], CryptoError> {
    <[u8; VERIFY_DATA_LEN]>::try_from(keys::finished_digest(nonces, b"client").as_ref())
        .map_err(|_| CryptoError::Unspecified)
}

impl SecurityContext for RingContext {
    fn negotiate(&mut self, input: TokenInput<'_>, output: &mut Vec<u8>) -> Negotiation {
        if self.closing {
            return self.close_token(output);
        }

        let result = if matches!(self.handshake, Handshake::Start) && self.side == Side::Client {
            self.send_client_hello(input, output)
                .map(|status| (status, 0))
        } else if matches!(self.handshake, Handshake::Done | Handshake::Failed) {
            Err(CryptoError::InvalidState("no negotiation in progress"))
        } else {
            let TokenInput::Token(bytes) = input else {
                return Negotiation::new(NegotiationStatus::Incomplete, 0);
            };
            let Some((header, unit_len)) = unit::split_unit(bytes) else {
                trace!(available = bytes.len(), "handshake token incomplete");
                return Negotiation::new(NegotiationStatus::Incomplete, 0);
            };
            let handshake = mem::replace(&mut self.handshake, Handshake::Failed);
            self.receive(handshake, header, &bytes[..unit_len], output)
                .map(|status| (status, bytes.len() - unit_len))
        };

        match result {
            Ok((status, extra)) => Negotiation::new(status, extra),
            Err(err) => {
                debug!(side = ?self.side, %err, "negotiation failed");
                self.handshake = Handshake::Failed;
                Negotiation::failed(err)
            }
        }
    }

    fn complete_token(&mut self, _output: &mut Vec<u8>) -> Result<(), CryptoError> {
        Ok(())
    }

    fn geometry(&self) -> Result<RecordGeometry, CryptoError> {
        match self.secrets {
            Some(_) => Ok(RecordGeometry {
                max_header: SEALED_HEADER_LEN,
                max_message: MAX_MESSAGE_LEN,
                max_trailer: TAG_LEN,
            }),
            None => Err(CryptoError::InvalidState("no session established")),
        }
    }

    fn encrypt(
        &mut self,
        header: &mut [u8],
        body: &mut [u8],
        trailer: &mut [u8],
    ) -> Result<Sealed, CryptoError> {
        let secrets = self
            .secrets
            .as_mut()
            .ok_or(CryptoError::InvalidState("no session established"))?;
        if body.len() > MAX_MESSAGE_LEN {
            return Err(CryptoError::PayloadTooLarge {
                length: body.len(),
                limit: MAX_MESSAGE_LEN,
            });
        }
        if header.len() < SEALED_HEADER_LEN || trailer.len() < TAG_LEN {
            return Err(CryptoError::InvalidState("record buffers too small"));
        }

        let length = (SEQUENCE_LEN + body.len() + TAG_LEN) as u16;
        header[0] = UnitType::Record.into();
        header[1] = self.version.into();
        header[2..UNIT_HEADER_LEN].copy_from_slice(&length.to_be_bytes());
        let tag = secrets.seal_in_place(header, body)?;
        trailer[..TAG_LEN].copy_from_slice(tag.as_ref());

        Ok(Sealed {
            header_len: SEALED_HEADER_LEN,
            trailer_len: TAG_LEN,
        })
    }

    fn decrypt(&mut self, data: &mut [u8]) -> Decrypted {
        if let Some(header) = UnitHeader::peek(data) {
            if header.length > SEQUENCE_LEN + MAX_MESSAGE_LEN + TAG_LEN {
                return Decrypted::bare(
                    DecryptStatus::Failed(CryptoError::PayloadTooLarge {
                        length: header.length,
                        limit: SEQUENCE_LEN + MAX_MESSAGE_LEN + TAG_LEN,
                    }),
                    0,
                );
            }
        }
        let Some((header, unit_len)) = unit::split_unit(data) else {
            return Decrypted::bare(DecryptStatus::Incomplete, 0);
        };
        let extra = data.len() - unit_len;

        let unit_type = match header.unit_type() {
            Ok(unit_type) => unit_type,
            Err(err) => return Decrypted::bare(DecryptStatus::Failed(err), 0),
        };
        match unit_type {
            UnitType::Record | UnitType::CloseNotify | UnitType::RenegotiateRequest => {}
            UnitType::ClientHello if self.side == Side::Server && self.renegotiation_requested => {
                debug!("client hello received, renegotiating");
                self.handshake = Handshake::Start;
                // NOTE: the hello itself is the first token of the new negotiation.
                return Decrypted::bare(DecryptStatus::Renegotiate, data.len());
            }
            other => {
                return Decrypted::bare(
                    DecryptStatus::Failed(CryptoError::UnexpectedMessage(other.into())),
                    0,
                )
            }
        }

        let Some(secrets) = self.secrets.as_mut() else {
            return Decrypted::bare(
                DecryptStatus::Failed(CryptoError::InvalidState("no session established")),
                0,
            );
        };
        if unit_len < SEALED_HEADER_LEN + TAG_LEN {
            return Decrypted::bare(DecryptStatus::Altered, 0);
        }

        let (head, sealed) = data[..unit_len].split_at_mut(SEALED_HEADER_LEN);
        let len = match secrets.open_in_place(head, sealed) {
            Ok(len) => len,
            Err(OpenError::OutOfSequence) => return Decrypted::bare(DecryptStatus::OutOfSequence, 0),
            Err(OpenError::Altered) => return Decrypted::bare(DecryptStatus::Altered, 0),
        };

        match unit_type {
            UnitType::Record => Decrypted::new(
                DecryptStatus::Ok,
                SEALED_HEADER_LEN..SEALED_HEADER_LEN + len,
                extra,
            ),
            UnitType::CloseNotify => Decrypted::bare(DecryptStatus::PeerClosed, extra),
            UnitType::RenegotiateRequest if self.side == Side::Client => {
                debug!("renegotiation requested by server");
                self.handshake = Handshake::Start;
                Decrypted::bare(DecryptStatus::Renegotiate, extra)
            }
            other => Decrypted::bare(
                DecryptStatus::Failed(CryptoError::UnexpectedMessage(other.into())),
                0,
            ),
        }
    }

    fn apply_shutdown(&mut self) {
        self.closing = true;
    }

    fn request_renegotiation(&mut self, output: &mut Vec<u8>) -> Result<(), CryptoError> {
        if self.side != Side::Server || !matches!(self.handshake, Handshake::Done) {
            return Err(CryptoError::InvalidState(
                "only an established server can request renegotiation",
            ));
        }
        let secrets = self
            .secrets
            .as_mut()
            .ok_or(CryptoError::InvalidState("no session established"))?;
        secrets.seal_unit(
            UnitType::RenegotiateRequest.into(),
            self.version.into(),
            &[],
            output,
        )?;
        self.renegotiation_requested = true;
        Ok(())
    }

    fn negotiated_protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }
}
