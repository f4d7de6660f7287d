//! Application-layer protocol negotiation extension buffers.

use crate::error::{ConfigError, CryptoError};

pub const EXTENSION_KIND_ALPN: u32 = 2;

const SIZE_FIELD_LEN: usize = 4;
const KIND_FIELD_LEN: usize = 4;
const LIST_LEN_FIELD_LEN: usize = 2;
const PREFIX_LEN: usize = SIZE_FIELD_LEN + KIND_FIELD_LEN + LIST_LEN_FIELD_LEN;

// LAYOUT: little endian
// |0        4        8    10
// |---------|--------|----|---------|-----------|---
// |size     |kind    |list|name len |name       |...
//
// `size` counts every byte after itself, `list` every byte of the name entries.

/// Builds the extension buffer, or `None` when there is nothing to offer.
pub fn encode_extension(protocols: &[String]) -> Result<Option<Vec<u8>>, ConfigError> {
    if protocols.is_empty() {
        return Ok(None);
    }

    let mut list_len = 0usize;
    for name in protocols {
        if name.is_empty() || name.len() > u8::MAX as usize {
            return Err(ConfigError::BadProtocolName(name.clone()));
        }
        list_len += 1 + name.len();
    }
    if list_len > u16::MAX as usize {
        return Err(ConfigError::ProtocolListTooLong {
            length: list_len,
            limit: u16::MAX as usize,
        });
    }

    let mut ext = Vec::with_capacity(PREFIX_LEN + list_len);
    ext.extend_from_slice(&((KIND_FIELD_LEN + LIST_LEN_FIELD_LEN + list_len) as u32).to_le_bytes());
    ext.extend_from_slice(&EXTENSION_KIND_ALPN.to_le_bytes());
    ext.extend_from_slice(&(list_len as u16).to_le_bytes());
    for name in protocols {
        ext.push(name.len() as u8);
        ext.extend_from_slice(name.as_bytes());
    }
    Ok(Some(ext))
}

pub fn decode_extension(ext: &[u8]) -> Result<Vec<String>, CryptoError> {
    let malformed = CryptoError::MalformedToken("application protocol extension");

    if ext.len() < PREFIX_LEN {
        return Err(malformed);
    }
    let size = u32::from_le_bytes([ext[0], ext[1], ext[2], ext[3]]) as usize;
    let kind = u32::from_le_bytes([ext[4], ext[5], ext[6], ext[7]]);
    let list_len = u16::from_le_bytes([ext[8], ext[9]]) as usize;

    if kind != EXTENSION_KIND_ALPN
        || size != ext.len() - SIZE_FIELD_LEN
        || list_len != ext.len() - PREFIX_LEN
    {
        return Err(malformed);
    }

    let mut protocols = Vec::new();
    let mut rest = &ext[PREFIX_LEN..];
    while let Some((&len, tail)) = rest.split_first() {
        let len = len as usize;
        if len == 0 || tail.len() < len {
            return Err(malformed);
        }
        let name = std::str::from_utf8(&tail[..len]).map_err(|_| malformed_name())?;
        protocols.push(name.to_owned());
        rest = &tail[len..];
    }
    Ok(protocols)
}

fn malformed_name() -> CryptoError {
    CryptoError::MalformedToken("application protocol name")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_extension_layout() {
        let ext = encode_extension(&["h2".to_owned(), "http/1.1".to_owned()])
            .unwrap()
            .unwrap();
        assert_eq!(
            hex::encode(&ext),
            concat!(
                "11000000", // size after this field: 4 + 2 + 11
                "02000000", // ALPN
                "0b00",     // list length
                "026832",   // "h2"
                "08687474702f312e31"  // "http/1.1"
            )
        );
        assert_eq!(decode_extension(&ext).unwrap(), vec!["h2", "http/1.1"]);
    }

    #[test]
    fn test_empty_list_disables_extension() {
        assert!(encode_extension(&[]).unwrap().is_none());
    }

    #[test]
    fn test_bad_protocol_names() {
        assert!(matches!(
            encode_extension(&[String::new()]),
            Err(ConfigError::BadProtocolName(_))
        ));
        assert!(matches!(
            encode_extension(&["x".repeat(256)]),
            Err(ConfigError::BadProtocolName(_))
        ));
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let ext = encode_extension(&["h2".to_owned()]).unwrap().unwrap();
        assert!(decode_extension(&ext[..ext.len() - 1]).is_err());

        let mut wrong_kind = ext.clone();
        wrong_kind[4] = 1;
        assert!(decode_extension(&wrong_kind).is_err());
    }
}
