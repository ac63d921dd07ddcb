//! Per-recipient share encryption
//!
//! Shares are sealed for a single recipient: an ephemeral x25519 key agrees a
//! secret with the recipient's static key, blake3 derives the AEAD key and
//! ChaCha20-Poly1305 encrypts. Layout: `ephemeral_pk || nonce || ciphertext`.

use crate::{Error, Result};
use aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use rand_core::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey, StaticSecret};
use zeroize::Zeroizing;

const SEAL_CONTEXT: &str = "confidential-core 2024 share sealing";
const NONCE_LEN: usize = 12;
const PUBLIC_KEY_LEN: usize = 32;

/// A process's long-term x25519 key material
pub struct KeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random_from_rng(OsRng))
    }

    pub fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    /// Parse a hex encoded 32-byte secret
    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes: [u8; 32] = hex::decode(encoded.trim())
            .map_err(|e| Error::InvalidConfig(format!("Invalid key hex: {}", e)))?
            .try_into()
            .map_err(|_| Error::InvalidConfig("Key must be 32 bytes".into()))?;
        Ok(Self::from_bytes(bytes))
    }

    pub fn public(&self) -> PublicKey {
        self.public
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.secret.to_bytes())
    }
}

fn derive_key(shared: &[u8; 32], ephemeral: &PublicKey, recipient: &PublicKey) -> Zeroizing<[u8; 32]> {
    let mut material = Zeroizing::new([0u8; 96]);
    material[..32].copy_from_slice(shared);
    material[32..64].copy_from_slice(ephemeral.as_bytes());
    material[64..].copy_from_slice(recipient.as_bytes());
    Zeroizing::new(blake3::derive_key(SEAL_CONTEXT, material.as_slice()))
}

/// Encrypt `plaintext` so that only the holder of `recipient`'s secret can read it
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let ephemeral = EphemeralSecret::random_from_rng(OsRng);
    let ephemeral_public = PublicKey::from(&ephemeral);
    let shared = ephemeral.diffie_hellman(recipient);
    let key = derive_key(shared.as_bytes(), &ephemeral_public, recipient);

    let mut sealed = ephemeral_public.as_bytes().to_vec();
    sealed.extend(encrypt_with_key(&key, plaintext)?);
    Ok(sealed)
}

/// Decrypt a box sealed for `keys`
pub fn open(keys: &KeyPair, sealed: &[u8]) -> Result<Vec<u8>> {
    if sealed.len() < PUBLIC_KEY_LEN + NONCE_LEN {
        return Err(Error::Crypto("Sealed share too short".into()));
    }
    let (ephemeral, body) = sealed.split_at(PUBLIC_KEY_LEN);
    let mut ephemeral_bytes = [0u8; PUBLIC_KEY_LEN];
    ephemeral_bytes.copy_from_slice(ephemeral);
    let ephemeral_public = PublicKey::from(ephemeral_bytes);

    let shared = keys.secret.diffie_hellman(&ephemeral_public);
    let key = derive_key(shared.as_bytes(), &ephemeral_public, &keys.public);
    decrypt_with_key(&key, body)
}

/// Symmetric encryption under a 32-byte key. Layout: `nonce || ciphertext`.
pub fn encrypt_with_key(key: &[u8; 32], plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|e| Error::Crypto(format!("Encryption failed: {}", e)))?;

    let mut out = nonce.to_vec();
    out.extend(ciphertext);
    Ok(out)
}

pub fn decrypt_with_key(key: &[u8; 32], data: &[u8]) -> Result<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(Error::Crypto("Ciphertext too short".into()));
    }
    let (nonce, ciphertext) = data.split_at(NONCE_LEN);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|e| Error::Crypto(format!("Decryption failed: {}", e)))
}
