//! Credential exchange codec.
//!
//! Every challenge carries the worker's ephemeral P-256 public key. We answer
//! with a fresh ephemeral key of our own, so no key pair is ever used twice:
//!
//! ```text
//! client secret (fresh) ─┐
//!                        ├─► ECDH ─► SHA-256(shared x) ─► AES-256-GCM key
//! server public key ─────┘
//!
//! credential ─► AES-256-GCM(key, random 96-bit nonce, no AAD) ─► ciphertext + 128-bit tag
//! ```
//!
//! The worker holds the matching secret and decrypts; we only ever encrypt.

use aes_gcm::aead::{AeadCore, AeadInPlace, KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use p256::PublicKey;
use p256::ecdh::EphemeralSecret;
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use prefill_protocol::{CredentialChallenge, EncryptedCredential};
use sha2::{Digest, Sha256};
use thiserror::Error;
use zeroize::Zeroizing;

const KEY_SIZE: usize = 32;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("challenge {challenge_id} carries an unusable public key: {reason}")]
    InvalidPublicKey {
        challenge_id: String,
        reason: String,
    },

    #[error("failed to encode client public key: {0}")]
    Encoding(String),

    #[error("credential encryption failed")]
    Encryption,
}

/// Encrypts one credential value for one challenge.
#[derive(Debug, Clone, Copy, Default)]
pub struct CredentialCodec;

impl CredentialCodec {
    pub fn new() -> Self {
        Self
    }

    /// Encrypt `credential` for the worker that issued `challenge`.
    ///
    /// The plaintext copy made here is wiped before returning.
    pub fn encrypt(
        &self,
        challenge: &CredentialChallenge,
        credential: &str,
    ) -> Result<EncryptedCredential, CodecError> {
        let server_key = parse_public_key(&challenge.server_public_key).map_err(|reason| {
            CodecError::InvalidPublicKey {
                challenge_id: challenge.challenge_id.clone(),
                reason,
            }
        })?;

        let client_secret = EphemeralSecret::random(&mut OsRng);
        let client_public = client_secret
            .public_key()
            .to_public_key_der()
            .map_err(|e| CodecError::Encoding(e.to_string()))?;

        let shared = client_secret.diffie_hellman(&server_key);
        let key = derive_key(shared.raw_secret_bytes().as_slice());

        let cipher =
            Aes256Gcm::new_from_slice(key.as_slice()).map_err(|_| CodecError::Encryption)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let mut buffer = Zeroizing::new(credential.as_bytes().to_vec());
        let tag = cipher
            .encrypt_in_place_detached(&nonce, b"", buffer.as_mut_slice())
            .map_err(|_| CodecError::Encryption)?;

        Ok(EncryptedCredential {
            challenge_id: challenge.challenge_id.clone(),
            client_public_key: STANDARD.encode(client_public.as_bytes()),
            encrypted_credential: STANDARD.encode(buffer.as_slice()),
            nonce: STANDARD.encode(nonce),
            tag: STANDARD.encode(tag),
        })
    }
}

/// Accepts SubjectPublicKeyInfo DER or a raw SEC1 point, base64-encoded.
fn parse_public_key(encoded: &str) -> Result<PublicKey, String> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| format!("not valid base64: {e}"))?;

    if let Ok(key) = PublicKey::from_public_key_der(&bytes) {
        return Ok(key);
    }
    PublicKey::from_sec1_bytes(&bytes).map_err(|_| "not a P-256 SPKI or SEC1 key".to_string())
}

fn derive_key(shared_secret: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
    let digest = Sha256::digest(shared_secret);
    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    key.copy_from_slice(&digest[..KEY_SIZE]);
    key
}
