use crate::crypto::{ED25519_PUBLIC_KEY_LEN, ED25519_SIGNATURE_LEN, NONCE_LEN, X25519_PUBLIC_KEY_LEN};
use crate::error::CryptoError;

pub(crate) const REQUIRE_CLIENT_AUTH: u8 = 0x01;
pub(crate) const VERIFY_DATA_LEN: usize = 32;

struct Cursor<'a> {
    bytes: &'a [u8],
    what: &'static str,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8], what: &'static str) -> Self {
        Self { bytes, what }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CryptoError> {
        if self.bytes.len() < len {
            return Err(CryptoError::MalformedToken(self.what));
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], CryptoError> {
        let what = self.what;
        <[u8; N]>::try_from(self.take(N)?).map_err(|_| CryptoError::MalformedToken(what))
    }

    fn u8(&mut self) -> Result<u8, CryptoError> {
        Ok(self.array::<1>()?[0])
    }

    fn u16(&mut self) -> Result<u16, CryptoError> {
        Ok(u16::from_be_bytes(self.array()?))
    }

    fn string(&mut self, len: usize) -> Result<String, CryptoError> {
        let what = self.what;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CryptoError::MalformedToken(what))
    }

    fn finish(self) -> Result<(), CryptoError> {
        match self.bytes.is_empty() {
            true => Ok(()),
            false => Err(CryptoError::MalformedToken(self.what)),
        }
    }
}

fn put_short_string(value: &str, out: &mut Vec<u8>, what: &'static str) -> Result<(), CryptoError> {
    let len = u8::try_from(value.len()).map_err(|_| CryptoError::MalformedToken(what))?;
    out.push(len);
    out.extend_from_slice(value.as_bytes());
    Ok(())
}

// LAYOUT:
// |nonce (16)|public key (32)|target len (1)|target|list len (2, BE)|(len (1)|name)*|

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ClientHello {
    pub(crate) nonce: [u8; NONCE_LEN],
    pub(crate) public_key: [u8; X25519_PUBLIC_KEY_LEN],
    pub(crate) target: String,
    pub(crate) protocols: Vec<String>,
}

impl ClientHello {
    pub(crate) fn encode(&self, out: &mut Vec<u8>) -> Result<(), CryptoError> {
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.public_key);
        put_short_string(&self.target, out, "target name")?;

        let mut list = Vec::new();
        for name in &self.protocols {
            put_short_string(name, &mut list, "application protocol name")?;
        }
        let list_len = u16::try_from(list.len())
            .map_err(|_| CryptoError::MalformedToken("application protocol list"))?;
        out.extend_from_slice(&list_len.to_be_bytes());
        out.extend_from_slice(&list);
        Ok(())
    }

    pub(crate) fn decode(payload: &[u8]) -> Result<Self, CryptoError> {
        let mut cursor = Cursor::new(payload, "client hello");
        let nonce = cursor.array()?;
        let public_key = cursor.array()?;
        let target_len = cursor.u8()? as usize;
        let target = cursor.string(target_len)?;

        let list_len = cursor.u16()? as usize;
        let mut list = Cursor::new(cursor.take(list_len)?, "application protocol list");
        cursor.finish()?;

        let mut protocols = Vec::new();
        while !list.bytes.is_empty() {
            let len = list.u8()? as usize;
            if len == 0 {
                return Err(CryptoError::MalformedToken("application protocol name"));
            }
            protocols.push(list.string(len)?);
        }

        Ok(Self {
            nonce,
            public_key,
            target,
            protocols,
        })
    }
}

// LAYOUT:
// |flags (1)|nonce (16)|public key (32)|signature (64)|protocol len (1)|protocol|
//
// A zero protocol length means no application protocol was selected.

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ServerHello {
    pub(crate) flags: u8,
    pub(crate) nonce: [u8; NONCE_LEN],
    pub(crate) public_key: [u8; X25519_PUBLIC_KEY_LEN],
    pub(crate) signature: [u8; ED25519_SIGNATURE_LEN],
    pub(crate) protocol: Option<String>,
}

impl ServerHello {
    pub(crate) fn encode(&self, out: &mut Vec<u8>) -> Result<(), CryptoError> {
        out.push(self.flags);
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.public_key);
        out.extend_from_slice(&self.signature);
        put_short_string(
            self.protocol.as_deref().unwrap_or_default(),
            out,
            "application protocol name",
        )
    }

    pub(crate) fn decode(payload: &[u8]) -> Result<Self, CryptoError> {
        let mut cursor = Cursor::new(payload, "server hello");
        let flags = cursor.u8()?;
        let nonce = cursor.array()?;
        let public_key = cursor.array()?;
        let signature = cursor.array()?;
        let protocol_len = cursor.u8()? as usize;
        let protocol = match protocol_len {
            0 => None,
            len => Some(cursor.string(len)?),
        };
        cursor.finish()?;

        Ok(Self {
            flags,
            nonce,
            public_key,
            signature,
            protocol,
        })
    }

    pub(crate) fn requires_client_auth(&self) -> bool {
        self.flags & REQUIRE_CLIENT_AUTH != 0
    }
}

// LAYOUT: |verify data (32)|[client key (32)|signature (64)]|

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ClientFinished {
    pub(crate) verify_data: [u8; VERIFY_DATA_LEN],
    pub(crate) auth: Option<ClientAuth>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ClientAuth {
    pub(crate) public_key: [u8; ED25519_PUBLIC_KEY_LEN],
    pub(crate) signature: [u8; ED25519_SIGNATURE_LEN],
}

impl ClientFinished {
    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.verify_data);
        if let Some(auth) = &self.auth {
            out.extend_from_slice(&auth.public_key);
            out.extend_from_slice(&auth.signature);
        }
    }

    pub(crate) fn decode(payload: &[u8]) -> Result<Self, CryptoError> {
        let mut cursor = Cursor::new(payload, "client finished");
        let verify_data = cursor.array()?;
        let auth = match cursor.bytes.is_empty() {
            true => None,
            false => Some(ClientAuth {
                public_key: cursor.array()?,
                signature: cursor.array()?,
            }),
        };
        cursor.finish()?;

        Ok(Self { verify_data, auth })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_client_hello_layout() {
        let hello = ClientHello {
            nonce: [0xaa; NONCE_LEN],
            public_key: [0xbb; X25519_PUBLIC_KEY_LEN],
            target: "srv".to_owned(),
            protocols: vec!["h2".to_owned()],
        };
        let mut out = Vec::new();
        hello.encode(&mut out).unwrap();

        assert_eq!(out.len(), NONCE_LEN + X25519_PUBLIC_KEY_LEN + 1 + 3 + 2 + 3);
        assert_eq!(
            hex::encode(&out[NONCE_LEN + X25519_PUBLIC_KEY_LEN..]),
            "037372760003026832"
        );
        assert_eq!(ClientHello::decode(&out).unwrap(), hello);
    }

    #[test]
    fn test_server_hello_without_protocol() {
        let hello = ServerHello {
            flags: REQUIRE_CLIENT_AUTH,
            nonce: [1; NONCE_LEN],
            public_key: [2; X25519_PUBLIC_KEY_LEN],
            signature: [3; ED25519_SIGNATURE_LEN],
            protocol: None,
        };
        let mut out = Vec::new();
        hello.encode(&mut out).unwrap();
        assert_eq!(*out.last().unwrap(), 0);

        let decoded = ServerHello::decode(&out).unwrap();
        assert!(decoded.requires_client_auth());
        assert_eq!(decoded.protocol, None);
    }

    #[test]
    fn test_trailing_bytes_are_rejected() {
        let finished = ClientFinished {
            verify_data: [9; VERIFY_DATA_LEN],
            auth: None,
        };
        let mut out = Vec::new();
        finished.encode(&mut out);
        assert_eq!(ClientFinished::decode(&out).unwrap(), finished);

        out.push(0);
        assert!(matches!(
            ClientFinished::decode(&out),
            Err(CryptoError::MalformedToken("client finished"))
        ));
    }

    #[test]
    fn test_truncated_client_hello() {
        let mut out = Vec::new();
        ClientHello {
            nonce: [0; NONCE_LEN],
            public_key: [0; X25519_PUBLIC_KEY_LEN],
            target: String::new(),
            protocols: Vec::new(),
        }
        .encode(&mut out)
        .unwrap();

        assert!(ClientHello::decode(&out[..out.len() - 1]).is_err());
    }
}
