use std::fmt;

use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{Error, Result};
use crate::{APP_ID, KEY_SIZE, NONCE_SIZE};

pub use chacha20poly1305::aead::Error as EncryptionError;

/// HKDF info strings, one per purpose. Each yields an independent key.
pub(crate) const PURPOSE_CONFIRM: &[u8] = b"codedrop/key-confirmation";
pub(crate) const PURPOSE_MAILBOX: &[u8] = b"codedrop/mailbox-hints";
pub(crate) const PURPOSE_TRANSIT: &[u8] = b"codedrop/transit-key";
pub(crate) const PURPOSE_HANDSHAKE: &[u8] = b"codedrop/transit-handshake";
pub(crate) const PURPOSE_RELAY_TOKEN: &[u8] = b"codedrop/transit-relay-token";

/// Symmetric key shared by both peers after a confirmed PAKE exchange.
///
/// Callers only ever hold this as an opaque handle: the bytes never leave the
/// crate, are wiped on drop and are redacted from `Debug`.
#[derive(Clone)]
pub struct SessionKey {
    bytes: Zeroizing<[u8; KEY_SIZE]>,
}

impl SessionKey {
    /// Stretch the raw SPAKE2 output into the session key.
    pub(crate) fn from_shared_secret(shared_secret: &[u8]) -> Result<Self> {
        let hkdf = Hkdf::<Sha256>::new(Some(APP_ID.as_bytes()), shared_secret);
        let mut bytes = Zeroizing::new([0u8; KEY_SIZE]);
        hkdf.expand(b"codedrop/session-key", bytes.as_mut())
            .map_err(|_| Error::protocol("HKDF rejected the session key length"))?;
        Ok(SessionKey { bytes })
    }

    /// Derive an independent sub-key for one purpose.
    pub(crate) fn derive(&self, purpose: &[u8]) -> Zeroizing<[u8; KEY_SIZE]> {
        let hkdf = Hkdf::<Sha256>::from_prk(self.bytes.as_ref())
            .unwrap_or_else(|_| Hkdf::<Sha256>::new(None, self.bytes.as_ref()));
        let mut out = Zeroizing::new([0u8; KEY_SIZE]);
        // 32 bytes is always a valid HKDF-SHA256 output length.
        let _ = hkdf.expand(purpose, out.as_mut());
        out
    }

    /// Token both peers present to the relay. Derived from the key, so the
    /// relay learns nothing that helps it decrypt.
    pub(crate) fn relay_token(&self) -> [u8; 32] {
        *self.derive(PURPOSE_RELAY_TOKEN)
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// Nonce for frame `counter` written in direction `direction`.
///
/// Layout: `direction | 0 0 0 | counter (u64 BE)`. The direction byte keeps
/// the two halves of a channel from ever reusing a nonce under the shared key.
pub fn build_nonce(direction: u8, counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[0] = direction;
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

pub fn encrypt_chunk(
    key: &[u8; KEY_SIZE],
    chunk: &[u8],
    nonce_bytes: &[u8; NONCE_SIZE],
    aad: &[u8],
) -> std::result::Result<Vec<u8>, EncryptionError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = Nonce::from_slice(nonce_bytes);

    // Ciphertext is the input length plus the 16-byte tag.
    cipher.encrypt(nonce, Payload { msg: chunk, aad })
}

pub fn decrypt_chunk(
    key: &[u8; KEY_SIZE],
    encrypted_chunk: &[u8],
    nonce_bytes: &[u8; NONCE_SIZE],
    aad: &[u8],
) -> std::result::Result<Vec<u8>, EncryptionError> {
    let cipher = ChaCha20Poly1305::new(key.into());
    let nonce = Nonce::from_slice(nonce_bytes);

    // Tag verification happens before any plaintext is returned.
    cipher.decrypt(nonce, Payload { msg: encrypted_chunk, aad })
}

/// Running whole-payload hash checked after the last chunk.
#[derive(Default, Clone)]
pub struct PayloadHasher {
    inner: Sha256,
}

impl PayloadHasher {
    pub fn new() -> Self {
        PayloadHasher { inner: Sha256::new() }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    pub fn finalize(self) -> [u8; 32] {
        self.inner.finalize().into()
    }
}
