//! Signable claim envelope.
//!
//! A [`Token`] wraps a payload and accumulates any number of ed25519
//! signatures over it. Signing input follows the JWS general form:
//! `base64url(header) "." base64url(canonical payload JSON)`, so every
//! signature commits to the exact payload bytes and to the signer's key id.
//!
//! Signature order does not matter for verification. A token with no
//! signatures is an unsigned draft and is never sent or persisted.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use trellis_core::NodeId;

use crate::error::{CryptoError, Result};
use crate::keys::{self, KeyManager};

/// Algorithm name carried in every signature header.
pub const ALG_EDDSA: &str = "EdDSA";

/// Per-signature protected header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenHeader {
    pub alg: String,
    pub kid: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSignature {
    pub header: TokenHeader,
    pub signature: Vec<u8>,
}

/// Wire form of one signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedTokenSignature {
    pub protected: String,
    pub signature: String,
}

/// Wire form of a token: every part base64url encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedToken {
    pub payload: String,
    pub signatures: Vec<SignedTokenSignature>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token<P> {
    payload: P,
    signatures: Vec<TokenSignature>,
}

fn signing_input(protected: &str, payload: &str) -> Vec<u8> {
    let mut input = Vec::with_capacity(protected.len() + payload.len() + 1);
    input.extend_from_slice(protected.as_bytes());
    input.push(b'.');
    input.extend_from_slice(payload.as_bytes());
    input
}

fn encode_header(header: &TokenHeader) -> Result<String> {
    Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(header)?))
}

fn decode_part(part: &str, what: &str) -> Result<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(part)
        .map_err(|e| CryptoError::MalformedToken(format!("{}: {}", what, e)))
}

impl<P: Serialize + DeserializeOwned> Token<P> {
    /// Wraps an unsigned payload.
    pub fn from_payload(payload: P) -> Self {
        Self {
            payload,
            signatures: Vec::new(),
        }
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    pub fn into_payload(self) -> P {
        self.payload
    }

    pub fn signatures(&self) -> &[TokenSignature] {
        &self.signatures
    }

    pub fn is_signed(&self) -> bool {
        !self.signatures.is_empty()
    }

    /// Key ids named by the carried signatures (not verified).
    pub fn signers(&self) -> Vec<NodeId> {
        self.signatures.iter().map(|s| s.header.kid).collect()
    }

    fn encoded_payload(&self) -> Result<String> {
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(&self.payload)?))
    }

    /// Appends one signature by `keys` over the canonical payload.
    ///
    /// Signing twice with the same key appends a duplicate signature;
    /// callers must avoid double-signing.
    pub fn sign_with<K: KeyManager + ?Sized>(&mut self, keys: &K) -> Result<()> {
        let header = TokenHeader {
            alg: ALG_EDDSA.to_string(),
            kid: keys.node_id(),
        };
        let protected = encode_header(&header)?;
        let payload = self.encoded_payload()?;
        let signature = keys.sign(&signing_input(&protected, &payload))?;
        self.signatures.push(TokenSignature { header, signature });
        Ok(())
    }

    /// True when at least one carried signature verifies against `node_id`.
    ///
    /// Never errors: anything that cannot be checked verifies as `false`.
    pub fn verify_with_public_key(&self, node_id: &NodeId) -> bool {
        let Ok(payload) = self.encoded_payload() else {
            return false;
        };
        self.signatures
            .iter()
            .filter(|s| s.header.kid == *node_id && s.header.alg == ALG_EDDSA)
            .any(|s| match encode_header(&s.header) {
                Ok(protected) => {
                    keys::verify(node_id, &signing_input(&protected, &payload), &s.signature)
                }
                Err(_) => false,
            })
    }

    pub fn to_signed(&self) -> Result<SignedToken> {
        let signatures = self
            .signatures
            .iter()
            .map(|s| {
                Ok(SignedTokenSignature {
                    protected: encode_header(&s.header)?,
                    signature: URL_SAFE_NO_PAD.encode(&s.signature),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(SignedToken {
            payload: self.encoded_payload()?,
            signatures,
        })
    }

    pub fn from_signed(signed: &SignedToken) -> Result<Self> {
        let payload_bytes = decode_part(&signed.payload, "payload")?;
        let payload: P = serde_json::from_slice(&payload_bytes)
            .map_err(|e| CryptoError::MalformedToken(format!("payload: {}", e)))?;

        let signatures = signed
            .signatures
            .iter()
            .map(|s| {
                let header_bytes = decode_part(&s.protected, "protected header")?;
                let header: TokenHeader = serde_json::from_slice(&header_bytes)
                    .map_err(|e| CryptoError::MalformedToken(format!("header: {}", e)))?;
                let signature = decode_part(&s.signature, "signature")?;
                Ok(TokenSignature { header, signature })
            })
            .collect::<Result<Vec<_>>>()?;

        let token = Self {
            payload,
            signatures,
        };
        if token.encoded_payload()? != signed.payload {
            return Err(CryptoError::MalformedToken(
                "payload is not in canonical form".to_string(),
            ));
        }
        Ok(token)
    }

    /// Canonical encoded form used on the wire.
    pub fn encode(&self) -> Result<String> {
        let signed = self.to_signed()?;
        Ok(URL_SAFE_NO_PAD.encode(serde_json::to_vec(&signed)?))
    }

    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = decode_part(encoded, "token")?;
        let signed: SignedToken = serde_json::from_slice(&bytes)
            .map_err(|e| CryptoError::MalformedToken(format!("token: {}", e)))?;
        Self::from_signed(&signed)
    }
}
