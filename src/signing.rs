// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Request signing and verification (Ed25519).
//!
//! Two schemes are used between nodes:
//!
//! | Scheme | Headers | Used by |
//! |--------|---------|---------|
//! | Body signature | `X-Blobmesh-Host`, `X-Blobmesh-Signature` | push (`/internal/crud/receive`), blob upload |
//! | Signed nonce | `Authorization: Nonce <host> <unix_millis> <sig>` | bulk pull (`/internal/crud/bulk`) |
//!
//! Pushed operations are verified against the key of the operation's origin,
//! not the sender, so a node cannot inject operations on another's behalf.

use crate::config::PeerConfig;
use crate::error::{ReplicationError, Result};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use std::collections::HashMap;
use std::time::Duration;

pub const HOST_HEADER: &str = "x-blobmesh-host";
pub const SIGNATURE_HEADER: &str = "x-blobmesh-signature";
const NONCE_SCHEME: &str = "Nonce";

fn normalize(host: &str) -> &str {
    host.trim_end_matches('/')
}

/// Decode a hex Ed25519 verifying key.
pub fn decode_verifying_key(hex_key: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(hex_key)
        .map_err(|e| ReplicationError::Auth(format!("public key is not hex: {}", e)))?;
    let arr: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
        ReplicationError::Auth(format!("public key must be 32 bytes, got {}", bytes.len()))
    })?;
    VerifyingKey::from_bytes(&arr)
        .map_err(|e| ReplicationError::Auth(format!("invalid public key: {}", e)))
}

fn decode_signature(sig_hex: &str) -> Result<Signature> {
    let bytes = hex::decode(sig_hex)
        .map_err(|e| ReplicationError::Auth(format!("signature is not hex: {}", e)))?;
    Signature::from_slice(&bytes)
        .map_err(|e| ReplicationError::Auth(format!("invalid signature: {}", e)))
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn nonce_message(host: &str, nonce_millis: i64) -> String {
    format!("{}:{}", normalize(host), nonce_millis)
}

// =============================================================================
// Signing (outbound)
// =============================================================================

/// This node's signing identity.
pub struct NodeSigner {
    host: String,
    key: SigningKey,
}

impl NodeSigner {
    pub fn from_seed(host: &str, seed: [u8; 32]) -> Self {
        Self {
            host: normalize(host).to_string(),
            key: SigningKey::from_bytes(&seed),
        }
    }

    /// Build from a hex-encoded 32-byte seed.
    pub fn from_hex(host: &str, seed_hex: &str) -> Result<Self> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| ReplicationError::Config(format!("private_key is not hex: {}", e)))?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            ReplicationError::Config(format!("private_key must be 32 bytes, got {}", bytes.len()))
        })?;
        Ok(Self::from_seed(host, seed))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn public_key_hex(&self) -> String {
        hex::encode(self.key.verifying_key().to_bytes())
    }

    /// Hex signature over a request body.
    pub fn sign_hex(&self, body: &[u8]) -> String {
        hex::encode(self.key.sign(body).to_bytes())
    }

    /// `Authorization` header value carrying a fresh signed nonce.
    pub fn nonce_header(&self) -> String {
        self.nonce_header_at(now_millis())
    }

    pub fn nonce_header_at(&self, nonce_millis: i64) -> String {
        let sig = self.sign_hex(nonce_message(&self.host, nonce_millis).as_bytes());
        format!("{} {} {} {}", NONCE_SCHEME, self.host, nonce_millis, sig)
    }
}

impl std::fmt::Debug for NodeSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSigner")
            .field("host", &self.host)
            .field("public_key", &self.public_key_hex())
            .finish()
    }
}

// =============================================================================
// Verification (inbound)
// =============================================================================

/// Parsed `Authorization: Nonce ...` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceAuth {
    pub host: String,
    pub nonce_millis: i64,
    pub signature: String,
}

/// Parse a nonce header without verifying it.
pub fn parse_nonce_header(header: &str) -> Result<NonceAuth> {
    let mut parts = header.split_whitespace();
    match (parts.next(), parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(NONCE_SCHEME), Some(host), Some(nonce), Some(sig), None) => {
            let nonce_millis = nonce
                .parse::<i64>()
                .map_err(|_| ReplicationError::Auth(format!("nonce {:?} is not a number", nonce)))?;
            Ok(NonceAuth {
                host: normalize(host).to_string(),
                nonce_millis,
                signature: sig.to_string(),
            })
        }
        _ => Err(ReplicationError::Auth("malformed Authorization header".to_string())),
    }
}

/// Known verifying keys for every cluster member.
#[derive(Debug, Clone)]
pub struct PeerKeys {
    keys: HashMap<String, VerifyingKey>,
    max_skew: Duration,
}

impl PeerKeys {
    /// Peers without a configured public key are left out and will fail
    /// verification.
    pub fn from_peers<'a>(peers: impl IntoIterator<Item = &'a PeerConfig>, max_skew: Duration) -> Result<Self> {
        let mut keys = HashMap::new();
        for peer in peers {
            if peer.public_key.is_empty() {
                continue;
            }
            keys.insert(
                peer.normalized_host().to_string(),
                decode_verifying_key(&peer.public_key)?,
            );
        }
        Ok(Self { keys, max_skew })
    }

    pub fn knows(&self, host: &str) -> bool {
        self.keys.contains_key(normalize(host))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    fn key_for(&self, host: &str) -> Result<&VerifyingKey> {
        self.keys
            .get(normalize(host))
            .ok_or_else(|| ReplicationError::Auth(format!("unknown signer {}", host)))
    }

    /// Verify a body signature claimed to be made by `host`.
    pub fn verify_body(&self, host: &str, body: &[u8], sig_hex: &str) -> Result<()> {
        let key = self.key_for(host)?;
        let sig = decode_signature(sig_hex)?;
        key.verify(body, &sig)
            .map_err(|_| ReplicationError::Auth(format!("body signature mismatch for {}", host)))
    }

    /// Verify a nonce header; returns the authenticated host.
    pub fn verify_nonce_header(&self, header: &str) -> Result<String> {
        self.verify_nonce_header_at(header, now_millis())
    }

    pub fn verify_nonce_header_at(&self, header: &str, now_millis: i64) -> Result<String> {
        let auth = parse_nonce_header(header)?;
        let skew = now_millis
            .checked_sub(auth.nonce_millis)
            .map(i64::unsigned_abs)
            .ok_or_else(|| ReplicationError::Auth(format!("nonce from {} is out of range", auth.host)))?;
        if u128::from(skew) > self.max_skew.as_millis() {
            return Err(ReplicationError::Auth(format!(
                "nonce from {} is stale by {}ms",
                auth.host, skew
            )));
        }
        let key = self.key_for(&auth.host)?;
        let sig = decode_signature(&auth.signature)?;
        key.verify(nonce_message(&auth.host, auth.nonce_millis).as_bytes(), &sig)
            .map_err(|_| ReplicationError::Auth(format!("nonce signature mismatch for {}", auth.host)))?;
        Ok(auth.host)
    }
}
