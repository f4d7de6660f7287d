use ring::aead;

use super::engine::unit::{SEALED_HEADER_LEN, SEQUENCE_LEN, TAG_LEN, UNIT_HEADER_LEN};
use crate::error::CryptoError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpenError {
    OutOfSequence,
    Altered,
}

// TODO: use `secrecy` and `zeroize` to secure the secrets
pub(crate) struct SessionSecrets {
    send_key: aead::LessSafeKey,
    recv_key: aead::LessSafeKey,
    nonce_base: [u8; aead::NONCE_LEN],
    send_seq: u64,
    recv_seq: u64,
}

impl SessionSecrets {
    pub(crate) fn new(
        send_key: aead::LessSafeKey,
        recv_key: aead::LessSafeKey,
        nonce_base: [u8; aead::NONCE_LEN],
    ) -> Self {
        Self {
            send_key,
            recv_key,
            nonce_base,
            send_seq: 0,
            recv_seq: 0,
        }
    }

    // NOTE: the sequence number occupies the low eight bytes of the nonce.
    fn nonce(&self, seq: u64) -> aead::Nonce {
        let mut nonce = self.nonce_base;
        for (byte, seq_byte) in nonce[aead::NONCE_LEN - SEQUENCE_LEN..]
            .iter_mut()
            .zip(seq.to_be_bytes())
        {
            *byte ^= seq_byte;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }

    /// Encrypts `body` in place and returns its tag.
    ///
    /// PRECONDITION: `header` starts with the unit header; the sequence number is
    /// written after it and the whole header is authenticated.
    pub(crate) fn seal_in_place(
        &mut self,
        header: &mut [u8],
        body: &mut [u8],
    ) -> Result<aead::Tag, CryptoError> {
        let header = header
            .get_mut(..SEALED_HEADER_LEN)
            .ok_or(CryptoError::InvalidState("header buffer too small"))?;
        let seq = self.send_seq;
        let next_seq = seq
            .checked_add(1)
            .ok_or(CryptoError::InvalidState("sequence numbers exhausted"))?;
        header[UNIT_HEADER_LEN..].copy_from_slice(&seq.to_be_bytes());

        let tag = self.send_key.seal_in_place_separate_tag(
            self.nonce(seq),
            aead::Aad::from(&*header),
            body,
        )?;
        self.send_seq = next_seq;
        Ok(tag)
    }

    /// Appends a complete sealed unit carrying `payload` to `out`.
    pub(crate) fn seal_unit(
        &mut self,
        unit_type: u8,
        version: u8,
        payload: &[u8],
        out: &mut Vec<u8>,
    ) -> Result<(), CryptoError> {
        let length = SEQUENCE_LEN + payload.len() + TAG_LEN;
        if length > u16::MAX as usize {
            return Err(CryptoError::PayloadTooLarge {
                length: payload.len(),
                limit: u16::MAX as usize - SEQUENCE_LEN - TAG_LEN,
            });
        }

        let start = out.len();
        out.extend_from_slice(&[unit_type, version]);
        out.extend_from_slice(&(length as u16).to_be_bytes());
        out.extend_from_slice(&[0u8; SEQUENCE_LEN]);
        out.extend_from_slice(payload);

        let (header, body) = out[start..].split_at_mut(SEALED_HEADER_LEN);
        let tag = self.seal_in_place(header, body)?;
        out.extend_from_slice(tag.as_ref());
        Ok(())
    }

    /// Opens `sealed` (ciphertext followed by the tag) in place, returning the plaintext length.
    pub(crate) fn open_in_place(
        &mut self,
        header: &[u8],
        sealed: &mut [u8],
    ) -> Result<usize, OpenError> {
        let seq_bytes = header
            .get(UNIT_HEADER_LEN..SEALED_HEADER_LEN)
            .and_then(|bytes| <[u8; SEQUENCE_LEN]>::try_from(bytes).ok())
            .ok_or(OpenError::Altered)?;
        let seq = u64::from_be_bytes(seq_bytes);
        if seq != self.recv_seq {
            return Err(OpenError::OutOfSequence);
        }

        let len = self
            .recv_key
            .open_in_place(
                self.nonce(seq),
                aead::Aad::from(&header[..SEALED_HEADER_LEN]),
                sealed,
            )
            .map_err(|_| OpenError::Altered)?
            .len();
        self.recv_seq += 1;
        Ok(len)
    }
}

#[cfg(test)]
mod test {
    use ring::aead;

    use super::*;

    fn secrets_pair() -> (SessionSecrets, SessionSecrets) {
        let key = |byte| {
            aead::LessSafeKey::new(aead::UnboundKey::new(&aead::AES_128_GCM, &[byte; 16]).unwrap())
        };
        (
            SessionSecrets::new(key(1), key(2), [7u8; aead::NONCE_LEN]),
            SessionSecrets::new(key(2), key(1), [7u8; aead::NONCE_LEN]),
        )
    }

    #[test]
    fn test_unit_layout() {
        let (mut sender, _) = secrets_pair();
        let mut unit = Vec::new();
        sender.seal_unit(0x03, 0x11, &[], &mut unit).unwrap();

        assert_eq!(unit.len(), SEALED_HEADER_LEN + TAG_LEN);
        assert_eq!(&unit[..4], &[0x03, 0x11, 0x00, 0x18]);
        assert_eq!(&unit[4..12], &[0u8; 8]);
    }

    #[test]
    fn test_replayed_unit_is_out_of_sequence() {
        let (mut sender, mut receiver) = secrets_pair();
        let mut unit = Vec::new();
        sender.seal_unit(0x00, 0x11, b"once", &mut unit).unwrap();
        let replay = unit.clone();

        let (header, sealed) = unit.split_at_mut(SEALED_HEADER_LEN);
        assert_eq!(receiver.open_in_place(header, sealed).unwrap(), 4);

        let mut replay = replay;
        let (header, sealed) = replay.split_at_mut(SEALED_HEADER_LEN);
        assert_eq!(
            receiver.open_in_place(header, sealed),
            Err(OpenError::OutOfSequence)
        );
    }

    #[test]
    fn test_flipped_bit_is_altered() {
        let (mut sender, mut receiver) = secrets_pair();
        let mut unit = Vec::new();
        sender.seal_unit(0x00, 0x11, b"payload", &mut unit).unwrap();
        unit[SEALED_HEADER_LEN + 2] ^= 0x01;

        let (header, sealed) = unit.split_at_mut(SEALED_HEADER_LEN);
        assert_eq!(
            receiver.open_in_place(header, sealed),
            Err(OpenError::Altered)
        );
    }
}
