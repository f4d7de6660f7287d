use std::sync::OnceLock;

use ring::signature::{self, KeyPair};
use ring::{aead, agreement, digest, hkdf, rand};

use super::secrets::SessionSecrets;
use super::{
    Side, AEAD_KEY_LEN, ED25519_PUBLIC_KEY_LEN, NONCE_LEN, SIGNED_CONTENT_LEN,
    X25519_PUBLIC_KEY_LEN,
};
use crate::error::CryptoError;

static SYSTEM_RANDOM: OnceLock<rand::SystemRandom> = OnceLock::new();

fn rng() -> &'static rand::SystemRandom {
    SYSTEM_RANDOM.get_or_init(rand::SystemRandom::new)
}

pub(crate) fn generate_nonce() -> Result<[u8; NONCE_LEN], CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::SecureRandom::fill(rng(), &mut nonce)?;
    Ok(nonce)
}

pub(crate) fn generate_ephemeral_key_pair(
) -> Result<(agreement::EphemeralPrivateKey, [u8; X25519_PUBLIC_KEY_LEN]), CryptoError> {
    let private_key = agreement::EphemeralPrivateKey::generate(&agreement::X25519, rng())?;
    let public_key = private_key.compute_public_key()?;
    let public_key = <[u8; X25519_PUBLIC_KEY_LEN]>::try_from(public_key.as_ref())
        .map_err(|_| CryptoError::Unspecified)?;
    Ok((private_key, public_key))
}

/// Produces a fresh Ed25519 key pair as a PKCS#8 document.
pub fn generate_signing_key_pkcs8() -> Result<Vec<u8>, CryptoError> {
    let document = signature::Ed25519KeyPair::generate_pkcs8(rng())?;
    Ok(document.as_ref().to_vec())
}

/// Returns the public half of an Ed25519 PKCS#8 document, for distributing to peers.
pub fn signing_public_key(pkcs8: &[u8]) -> Result<[u8; ED25519_PUBLIC_KEY_LEN], CryptoError> {
    let key_pair = signature::Ed25519KeyPair::from_pkcs8_maybe_unchecked(pkcs8)?;
    <[u8; ED25519_PUBLIC_KEY_LEN]>::try_from(key_pair.public_key().as_ref())
        .map_err(|_| CryptoError::KeyRejected("unexpected public key length".to_owned()))
}

// LAYOUT: client_nonce || server_nonce || public_key
pub(crate) fn signed_content(
    nonces: &[u8; 2 * NONCE_LEN],
    public_key: &[u8; X25519_PUBLIC_KEY_LEN],
) -> [u8; SIGNED_CONTENT_LEN] {
    let mut content = [0u8; SIGNED_CONTENT_LEN];
    content[..2 * NONCE_LEN].copy_from_slice(nonces);
    content[2 * NONCE_LEN..].copy_from_slice(public_key);
    content
}

pub(crate) fn join_nonces(
    client_nonce: &[u8; NONCE_LEN],
    server_nonce: &[u8; NONCE_LEN],
) -> [u8; 2 * NONCE_LEN] {
    let mut nonces = [0u8; 2 * NONCE_LEN];
    nonces[..NONCE_LEN].copy_from_slice(client_nonce);
    nonces[NONCE_LEN..].copy_from_slice(server_nonce);
    nonces
}

pub(crate) fn finished_digest(nonces: &[u8; 2 * NONCE_LEN], sender: &[u8]) -> digest::Digest {
    let mut ctx = digest::Context::new(&digest::SHA256);
    ctx.update(nonces);
    ctx.update(sender);
    ctx.update(b" finished");
    ctx.finish()
}

fn generate_pseudorandom_key(
    own_private_key: agreement::EphemeralPrivateKey,
    other_public_key: &[u8; X25519_PUBLIC_KEY_LEN],
    nonces: &[u8; 2 * NONCE_LEN],
) -> Result<hkdf::Prk, CryptoError> {
    let other_public_key = agreement::UnparsedPublicKey::new(&agreement::X25519, other_public_key);
    agreement::agree_ephemeral(own_private_key, &other_public_key, |key_material| {
        let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, nonces);
        salt.extract(key_material)
    })
    .map_err(|_| CryptoError::BadServerPublicKey)
}

fn generate_master_key(
    prk: &hkdf::Prk,
    sender: &'static [u8],
) -> Result<aead::LessSafeKey, CryptoError> {
    let mut master_key = [0u8; AEAD_KEY_LEN];
    let info = [sender, b"master key"];
    prk.expand(&info, &aead::AES_128_GCM)?.fill(&mut master_key)?;
    let key = aead::UnboundKey::new(&aead::AES_128_GCM, &master_key)?;
    Ok(aead::LessSafeKey::new(key))
}

// NOTE: here `aead::NONCE_LEN` is 12
fn generate_nonce_base(
    nonces: &[u8; 2 * NONCE_LEN],
) -> Result<[u8; aead::NONCE_LEN], CryptoError> {
    <[u8; aead::NONCE_LEN]>::try_from(
        &digest::digest(&digest::SHA256, nonces).as_ref()[..aead::NONCE_LEN],
    )
    .map_err(|_| CryptoError::Unspecified)
}

pub(crate) fn generate_session_secrets(
    own_private_key: agreement::EphemeralPrivateKey,
    other_public_key: &[u8; X25519_PUBLIC_KEY_LEN],
    // NOTE: nonces === client_nonce || server_nonce
    nonces: &[u8; 2 * NONCE_LEN],
    own_side: Side,
) -> Result<SessionSecrets, CryptoError> {
    let (send_side_bytes, recv_side_bytes) = match own_side {
        Side::Client => (b"client", b"server"),
        Side::Server => (b"server", b"client"),
    };

    let prk = generate_pseudorandom_key(own_private_key, other_public_key, nonces)?;
    let send_key = generate_master_key(&prk, send_side_bytes)?;
    let recv_key = generate_master_key(&prk, recv_side_bytes)?;
    let nonce_base = generate_nonce_base(nonces)?;

    Ok(SessionSecrets::new(send_key, recv_key, nonce_base))
}
