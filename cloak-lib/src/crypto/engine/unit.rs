// Fix for rust-analyzer
#![allow(non_upper_case_globals)]

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::CryptoError;

pub(crate) const UNIT_HEADER_LEN: usize = 4;
pub(crate) const SEQUENCE_LEN: usize = 8;
pub(crate) const SEALED_HEADER_LEN: usize = UNIT_HEADER_LEN + SEQUENCE_LEN;
pub(crate) use ring::aead::MAX_TAG_LEN as TAG_LEN;
pub(crate) const MAX_MESSAGE_LEN: usize = 16 * 1024;
pub(crate) const MAX_UNIT_LEN: usize = UNIT_HEADER_LEN + u16::MAX as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
#[non_exhaustive]
pub(crate) enum UnitType {
    Record = 0x00,
    ClientHello = 0x01,
    ServerHello = 0x02,
    CloseNotify = 0x03,
    ClientFinished = 0x04,
    RenegotiateRequest = 0x05,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
#[non_exhaustive]
pub enum ProtocolVersion {
    V1_0 = 0x10,
    V1_1 = 0x11,
}

impl ProtocolVersion {
    pub const LATEST: Self = Self::V1_1;

    pub(crate) fn previous_minor(self) -> Option<Self> {
        match self {
            Self::V1_0 => None,
            Self::V1_1 => Some(Self::V1_0),
        }
    }
}

// LAYOUT:
// |0         |1         |2         |3         |
// |----------|----------|----------|----------|
// |type      |version   |length               |
// |----------|----------|---------------------|
// |payload                                    |
// :                                           :
// |-------------------------------------------|
//
// Sealed units carry an 8-byte sequence number right after the header, then the
// ciphertext and the tag, all counted by `length`.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct UnitHeader {
    pub(crate) unit_type: u8,
    pub(crate) version: u8,
    pub(crate) length: usize,
}

impl UnitHeader {
    /// Reads the header at the front of `bytes`, if all four bytes are present.
    pub(crate) fn peek(bytes: &[u8]) -> Option<Self> {
        match bytes {
            [unit_type, version, len_hi, len_lo, ..] => Some(Self {
                unit_type: *unit_type,
                version: *version,
                length: u16::from_be_bytes([*len_hi, *len_lo]) as usize,
            }),
            _ => None,
        }
    }

    pub(crate) fn total_len(&self) -> usize {
        UNIT_HEADER_LEN + self.length
    }

    pub(crate) fn unit_type(&self) -> Result<UnitType, CryptoError> {
        UnitType::try_from(self.unit_type).map_err(|_| CryptoError::UnexpectedMessage(self.unit_type))
    }
}

/// Returns the first complete unit of `bytes` with its header, or `None` if more bytes are needed.
pub(crate) fn split_unit(bytes: &[u8]) -> Option<(UnitHeader, usize)> {
    let header = UnitHeader::peek(bytes)?;
    (bytes.len() >= header.total_len()).then_some((header, header.total_len()))
}

pub(crate) fn write_unit(
    unit_type: UnitType,
    version: ProtocolVersion,
    payload: &[u8],
    out: &mut Vec<u8>,
) -> Result<(), CryptoError> {
    let length = u16::try_from(payload.len()).map_err(|_| CryptoError::PayloadTooLarge {
        length: payload.len(),
        limit: u16::MAX as usize,
    })?;
    out.push(unit_type.into());
    out.push(version.into());
    out.extend_from_slice(&length.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(())
}
