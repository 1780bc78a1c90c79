//! Request encoding and secrets encryption.
//!
//! Turns a validated [`RequestConfig`] into an on-wire [`Request`]: args in
//! strict declaration order under a canonical length-prefixed encoding, and
//! the secrets mapping encrypted under the DON public key when one is
//! present. Without a key the secrets travel as their canonical plaintext
//! serialization, a simulation-only relaxation of the production rule.
//!
//! Encoding is deterministic: the same `(config, key)` pair always yields a
//! byte-identical `Request`. The x25519 sender key and the AEAD nonce are
//! therefore derived, not sampled.

use crate::errors::{EncodingError, EncodingResult};
use crate::types::{EncryptedSecrets, Request, RequestConfig, SecretsPayload};
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit},
};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

const SENDER_KEY_CONTEXT: &[u8] = b"don-harness-sender-key";
const SECRETS_KEY_CONTEXT: &[u8] = b"don-harness-secrets-encryption";

/// Secure wrapper for encryption keys that zeros memory on drop
#[derive(ZeroizeOnDrop)]
struct SecureKey([u8; 32]);

impl SecureKey {
    fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

/// Builds immutable [`Request`] values from validated configs
#[derive(Debug, Default)]
pub struct RequestEncoder;

impl RequestEncoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a validated config into an on-wire request.
    ///
    /// Args keep their declaration order; callers relying on positional
    /// semantics must supply them in exactly that order.
    pub fn encode(&self, config: &RequestConfig) -> EncodingResult<Request> {
        let encoded_args = encode_args(&config.args);

        let secrets = if config.secrets.is_empty() {
            SecretsPayload::Empty
        } else {
            let canonical = canonical_secrets_bytes(&config.secrets)?;
            match config.don_public_key.as_ref() {
                Some(don_public_key) => {
                    SecretsPayload::Encrypted(encrypt_secrets(&canonical, don_public_key)?)
                }
                None => SecretsPayload::Plain(canonical),
            }
        };

        Ok(Request {
            args: config.args.clone(),
            encoded_args,
            secrets,
            source: config.source.clone(),
            code_location: config.code_location,
            expected_return_type: config.expected_return_type,
        })
    }

    /// Recover the secrets mapping on the executing side
    pub fn decrypt_secrets(
        &self,
        payload: &SecretsPayload,
        don_public_key: Option<&[u8; 32]>,
    ) -> EncodingResult<BTreeMap<String, String>> {
        match payload {
            SecretsPayload::Empty => Ok(BTreeMap::new()),
            SecretsPayload::Plain(bytes) => parse_secrets(bytes),
            SecretsPayload::Encrypted(envelope) => {
                let don_public_key = don_public_key.ok_or_else(|| {
                    EncodingError::SecretsDecryption(
                        "encrypted secrets require the DON public key".to_string(),
                    )
                })?;
                let plaintext = decrypt_secrets(envelope, don_public_key)?;
                parse_secrets(&plaintext)
            }
        }
    }
}

/// Length-prefixed canonical byte encoding of the positional args
fn encode_args(args: &[String]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + args.iter().map(|a| 4 + a.len()).sum::<usize>());
    out.extend_from_slice(&(args.len() as u32).to_be_bytes());
    for arg in args {
        out.extend_from_slice(&(arg.len() as u32).to_be_bytes());
        out.extend_from_slice(arg.as_bytes());
    }
    out
}

/// Canonical serialization of the secrets mapping; `BTreeMap` keeps key
/// order stable so identical mappings serialize identically
fn canonical_secrets_bytes(secrets: &BTreeMap<String, String>) -> EncodingResult<Vec<u8>> {
    serde_json::to_vec(secrets).map_err(|e| EncodingError::SecretsEncryption(e.to_string()))
}

fn parse_secrets(bytes: &[u8]) -> EncodingResult<BTreeMap<String, String>> {
    serde_json::from_slice(bytes).map_err(|e| EncodingError::SecretsDecryption(e.to_string()))
}

/// Derive the shared AEAD key for a DON public key.
///
/// The harness plays both the requesting and executing roles, so its
/// x25519 sender secret is a fixed derivation rather than wallet-backed
/// key material.
fn derive_secrets_key(don_public_key: &[u8; 32]) -> EncodingResult<SecureKey> {
    let sender_seed: [u8; 32] = Sha256::digest(SENDER_KEY_CONTEXT).into();
    let sender_secret = StaticSecret::from(sender_seed);
    let shared_secret = sender_secret.diffie_hellman(&PublicKey::from(*don_public_key));

    let hk = Hkdf::<Sha256>::new(None, shared_secret.as_bytes());
    let mut key_data = [0u8; 32];
    hk.expand(SECRETS_KEY_CONTEXT, &mut key_data)
        .map_err(|e| EncodingError::SecretsEncryption(format!("key derivation failed: {e}")))?;

    let key = SecureKey(key_data);
    key_data.zeroize();
    Ok(key)
}

/// Nonce derived from key and plaintext; each distinct secrets mapping gets
/// a distinct nonce and re-encoding the same mapping stays byte-identical
fn derive_nonce(key: &SecureKey, plaintext: &[u8]) -> [u8; 12] {
    let mut hasher = Sha256::new();
    hasher.update(key.as_slice());
    hasher.update(plaintext);
    let digest = hasher.finalize();
    let mut nonce = [0u8; 12];
    nonce.copy_from_slice(&digest[..12]);
    nonce
}

fn encrypt_secrets(
    plaintext: &[u8],
    don_public_key: &[u8; 32],
) -> EncodingResult<EncryptedSecrets> {
    let key = derive_secrets_key(don_public_key)?;
    let nonce = derive_nonce(&key, plaintext);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| EncodingError::SecretsEncryption(e.to_string()))?;

    Ok(EncryptedSecrets {
        ciphertext,
        nonce: nonce.to_vec(),
    })
}

fn decrypt_secrets(
    envelope: &EncryptedSecrets,
    don_public_key: &[u8; 32],
) -> EncodingResult<Vec<u8>> {
    if envelope.nonce.len() != 12 {
        return Err(EncodingError::SecretsDecryption(format!(
            "invalid nonce size: {} (expected: 12)",
            envelope.nonce.len()
        )));
    }

    let key = derive_secrets_key(don_public_key)?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key.as_slice()));
    cipher
        .decrypt(
            Nonce::from_slice(&envelope.nonce),
            envelope.ciphertext.as_ref(),
        )
        .map_err(|e| EncodingError::SecretsDecryption(e.to_string()))
}
