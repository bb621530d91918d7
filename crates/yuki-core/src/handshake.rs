//! Handshake records.
//!
//! The handshake is two records, exchanged before any envelope:
//!
//! ```text
//! ClientHello  := LEN || JSON {"client_id", "client_secret", "version"}
//! ServerAccept := LEN || 0x01 || SessionIdLen(1) || SessionId || Key(32)
//! ServerReject := LEN || 0x00 || UTF-8 reason
//! ```
//!
//! The session key travels in the clear at this layer; confidentiality of the
//! handshake comes from the outer TLS transport.

use crate::channel::{encode_record, record_body};
use crate::error::{Result, TunnelError};
use serde::{Deserialize, Serialize};
use std::fmt;
use yuki_crypto::AeadKey;
use yuki_crypto::aead::KEY_SIZE;

/// Handshake protocol version
pub const PROTOCOL_VERSION: u32 = 1;

const ACCEPT_TAG: u8 = 0x01;
const REJECT_TAG: u8 = 0x00;

/// First record sent by the initiator.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientHello {
    /// Client identifier
    pub client_id: String,
    /// Shared secret
    pub client_secret: String,
    /// Handshake protocol version
    pub version: u32,
}

impl ClientHello {
    /// Hello for the current protocol version.
    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            version: PROTOCOL_VERSION,
        }
    }

    /// Encode as a length-prefixed record.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::HandshakeFailed`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)
            .map_err(|e| TunnelError::HandshakeFailed(format!("encode hello: {e}")))?;
        Ok(encode_record(&json)?)
    }

    /// Decode from a length-prefixed record.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::HandshakeFailed`] for a malformed record.
    pub fn decode(record: &[u8]) -> Result<Self> {
        let body = record_body(record)
            .map_err(|e| TunnelError::HandshakeFailed(format!("hello record: {e}")))?;
        serde_json::from_slice(body)
            .map_err(|e| TunnelError::HandshakeFailed(format!("hello JSON: {e}")))
    }
}

impl fmt::Debug for ClientHello {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHello")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("version", &self.version)
            .finish()
    }
}

/// Responder's answer to a [`ClientHello`].
#[derive(Debug)]
pub enum ServerReply {
    /// Session established
    Accept {
        /// Session identifier
        session_id: String,
        /// Session key
        key: AeadKey,
    },
    /// Credentials rejected
    Reject {
        /// Human-readable reason
        reason: String,
    },
}

impl ServerReply {
    /// Encode as a length-prefixed record.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::HandshakeFailed`] if the session id exceeds 255
    /// bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let body = match self {
            Self::Accept { session_id, key } => {
                let id_len = u8::try_from(session_id.len()).map_err(|_| {
                    TunnelError::HandshakeFailed(format!(
                        "session id of {} bytes does not fit",
                        session_id.len()
                    ))
                })?;
                let mut body = Vec::with_capacity(2 + session_id.len() + KEY_SIZE);
                body.push(ACCEPT_TAG);
                body.push(id_len);
                body.extend_from_slice(session_id.as_bytes());
                body.extend_from_slice(key.as_bytes());
                body
            }
            Self::Reject { reason } => {
                let mut body = Vec::with_capacity(1 + reason.len());
                body.push(REJECT_TAG);
                body.extend_from_slice(reason.as_bytes());
                body
            }
        };
        Ok(encode_record(&body)?)
    }

    /// Decode from a length-prefixed record.
    ///
    /// # Errors
    ///
    /// Returns [`TunnelError::HandshakeFailed`] for a malformed record.
    pub fn decode(record: &[u8]) -> Result<Self> {
        let body = record_body(record)
            .map_err(|e| TunnelError::HandshakeFailed(format!("reply record: {e}")))?;

        match body.split_first() {
            Some((&ACCEPT_TAG, rest)) => {
                let (&id_len, rest) = rest.split_first().ok_or_else(|| {
                    TunnelError::HandshakeFailed("accept missing id length".into())
                })?;
                let id_len = id_len as usize;
                if rest.len() != id_len + KEY_SIZE {
                    return Err(TunnelError::HandshakeFailed(format!(
                        "accept body is {} bytes, expected {}",
                        rest.len(),
                        id_len + KEY_SIZE
                    )));
                }
                let session_id = String::from_utf8(rest[..id_len].to_vec())
                    .map_err(|_| TunnelError::HandshakeFailed("session id is not UTF-8".into()))?;
                let key = AeadKey::from_slice(&rest[id_len..])?;
                Ok(Self::Accept { session_id, key })
            }
            Some((&REJECT_TAG, rest)) => Ok(Self::Reject {
                reason: String::from_utf8_lossy(rest).into_owned(),
            }),
            Some((&other, _)) => Err(TunnelError::HandshakeFailed(format!(
                "unknown reply tag 0x{other:02X}"
            ))),
            None => Err(TunnelError::HandshakeFailed("empty reply".into())),
        }
    }
}
