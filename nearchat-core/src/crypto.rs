//! Key agreement and symmetric framing primitives.
//!
//! One ephemeral x25519 keypair per handshake attempt, a 16-byte session
//! secret truncated from the Diffie-Hellman output, and AES-128-CBC with a
//! fresh random IV prepended to every ciphertext blob. Secret material is
//! zeroized on drop.

use std::fmt;

use aes::Aes128;
use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{EphemeralSecret, PublicKey};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};

/// Size of an encoded x25519 public key on the wire.
pub const PUBLIC_KEY_SIZE: usize = 32;
/// Size of the derived symmetric session key.
pub const SESSION_KEY_SIZE: usize = 16;
/// Size of the CBC initialization vector prepended to each blob.
pub const IV_SIZE: usize = 16;

type Aes128CbcEnc = cbc::Encryptor<Aes128>;
type Aes128CbcDec = cbc::Decryptor<Aes128>;

/// The symmetric secret both peers share for the lifetime of one session.
///
/// Zeroized on drop so key material does not outlive the session.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SessionSecret([u8; SESSION_KEY_SIZE]);

impl SessionSecret {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; SESSION_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SessionSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionSecret([REDACTED])")
    }
}

/// Generates a fresh x25519 keypair for a single handshake attempt.
///
/// The secret half is consumed by the one Diffie-Hellman it performs;
/// keypairs are never reused across sessions.
pub fn generate_keypair() -> (EphemeralSecret, PublicKey) {
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);
    (secret, public)
}

/// Derives the session secret from our ephemeral secret and the peer's
/// encoded public key.
///
/// The Diffie-Hellman output is truncated to [`SESSION_KEY_SIZE`] bytes.
///
/// # Errors
///
/// Returns [`Error::KeyAgreement`] if the peer key is not exactly
/// [`PUBLIC_KEY_SIZE`] bytes, or if the exchange produces a
/// non-contributory (all-zero) shared secret.
pub fn derive_shared_secret(secret: EphemeralSecret, peer_public: &[u8]) -> Result<SessionSecret> {
    let key_bytes: [u8; PUBLIC_KEY_SIZE] = peer_public.try_into().map_err(|_| {
        Error::KeyAgreement(format!(
            "peer key must be {PUBLIC_KEY_SIZE} bytes, got {}",
            peer_public.len()
        ))
    })?;

    let shared = secret.diffie_hellman(&PublicKey::from(key_bytes));
    if !shared.was_contributory() {
        return Err(Error::KeyAgreement("degenerate shared secret".into()));
    }

    let mut truncated = [0u8; SESSION_KEY_SIZE];
    truncated.copy_from_slice(&shared.as_bytes()[..SESSION_KEY_SIZE]);
    Ok(SessionSecret(truncated))
}

/// Encrypts `plaintext` under the session secret.
///
/// A fresh random IV is generated per call and prepended, so the returned
/// blob is `IV (16 bytes) || ciphertext`. IVs are never reused.
pub fn encrypt(plaintext: &[u8], key: &SessionSecret) -> Vec<u8> {
    let mut iv = [0u8; IV_SIZE];
    OsRng.fill_bytes(&mut iv);

    let ciphertext =
        Aes128CbcEnc::new(&key.0.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

    let mut blob = Vec::with_capacity(IV_SIZE + ciphertext.len());
    blob.extend_from_slice(&iv);
    blob.extend_from_slice(&ciphertext);
    blob
}

/// Decrypts an `IV || ciphertext` blob produced by [`encrypt`].
///
/// # Errors
///
/// Returns [`Error::Decryption`] on short input, misaligned ciphertext, or
/// padding mismatch. Callers treat this as "not an encrypted frame", not as
/// a fatal session error.
pub fn decrypt(blob: &[u8], key: &SessionSecret) -> Result<Vec<u8>> {
    if blob.len() <= IV_SIZE || (blob.len() - IV_SIZE) % IV_SIZE != 0 {
        return Err(Error::Decryption);
    }
    let (iv, ciphertext) = blob.split_at(IV_SIZE);

    Aes128CbcDec::new_from_slices(&key.0, iv)
        .map_err(|_| Error::Decryption)?
        .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
        .map_err(|_| Error::Decryption)
}

/// Derives the 5-digit verification code both peers display to their users.
///
/// SHA-256 of the session key, first 4 bytes read as a big-endian unsigned
/// integer, reduced modulo 100 000 and zero-padded. Deterministic: two
/// peers holding the same secret always display the same code, so a relay
/// that completed two separate handshakes is caught by comparing codes
/// out-of-band.
pub fn verification_code(key: &SessionSecret) -> String {
    let digest = Sha256::digest(key.as_bytes());
    let n = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    format!("{:05}", n % 100_000)
}

/// Short hex fingerprint of a public key for log output.
pub fn key_fingerprint(public: &PublicKey) -> String {
    hex::encode(&public.as_bytes()[..4])
}
