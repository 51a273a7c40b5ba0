// AEAD primitives for request and reply protection.
// Numan Thabit 2026

use chacha20poly1305::{
    aead::{Aead, Payload},
    KeyInit, XChaCha20Poly1305, XNonce,
};
use thiserror::Error;

/// Authentication tag length.
pub const TAG_LEN: usize = 16;

/// Nonce size for XChaCha20-Poly1305.
pub const XCHACHA20_NONCE_LEN: usize = 24;

/// Symmetric key derived from the X25519 agreement.
#[derive(Clone, PartialEq, Eq)]
pub struct AeadKey([u8; 32]);

impl AeadKey {
    /// Wraps raw key material.
    #[must_use]
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AeadKey(..)")
    }
}

/// Errors returned by AEAD helpers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AeadError {
    /// Encryption failed.
    #[error("encryption failed")]
    Encrypt,
    /// Decryption or authentication failed.
    #[error("decryption failed")]
    Decrypt,
}

/// Encrypts `plaintext`, returning ciphertext concatenated with the tag.
pub fn seal(
    key: &AeadKey,
    nonce: &[u8; XCHACHA20_NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let mut xnonce = XNonce::default();
    xnonce.clone_from_slice(nonce);
    cipher
        .encrypt(
            &xnonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| AeadError::Encrypt)
}

/// Decrypts ciphertext+tag produced by [`seal`].
pub fn open(
    key: &AeadKey,
    nonce: &[u8; XCHACHA20_NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());
    let mut xnonce = XNonce::default();
    xnonce.clone_from_slice(nonce);
    cipher
        .decrypt(
            &xnonce,
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| AeadError::Decrypt)
}

/// Encrypts and returns the ciphertext body and detached tag, as they
/// are carried in separate frame fields.
pub fn seal_detached(
    key: &AeadKey,
    nonce: &[u8; XCHACHA20_NONCE_LEN],
    plaintext: &[u8],
) -> Result<(Vec<u8>, [u8; TAG_LEN]), AeadError> {
    let mut sealed = seal(key, nonce, &[], plaintext)?;
    let tag_start = sealed.len() - TAG_LEN;
    let mut tag = [0u8; TAG_LEN];
    tag.copy_from_slice(&sealed[tag_start..]);
    sealed.truncate(tag_start);
    Ok((sealed, tag))
}

/// Decrypts a ciphertext body whose tag arrived in the frame header.
pub fn open_detached(
    key: &AeadKey,
    nonce: &[u8; XCHACHA20_NONCE_LEN],
    body: &[u8],
    tag: &[u8; TAG_LEN],
) -> Result<Vec<u8>, AeadError> {
    let mut ciphertext = Vec::with_capacity(body.len() + TAG_LEN);
    ciphertext.extend_from_slice(body);
    ciphertext.extend_from_slice(tag);
    open(key, nonce, &[], &ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = AeadKey::new([0x11; 32]);
        let nonce = [0x22; XCHACHA20_NONCE_LEN];
        let plaintext = b"fingerprint check";

        let ciphertext = seal(&key, &nonce, &[], plaintext).expect("seal");
        assert_eq!(ciphertext.len(), plaintext.len() + TAG_LEN);

        let recovered = open(&key, &nonce, &[], &ciphertext).expect("open");
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn detached_round_trip() {
        let key = AeadKey::new([0x33; 32]);
        let nonce = [0x44; XCHACHA20_NONCE_LEN];
        let plaintext = b"detached tag body";

        let (body, tag) = seal_detached(&key, &nonce, plaintext).expect("seal");
        assert_eq!(body.len(), plaintext.len());

        let recovered = open_detached(&key, &nonce, &body, &tag).expect("open");
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn tampered_tag_rejected() {
        let key = AeadKey::new([0x55; 32]);
        let nonce = [0x66; XCHACHA20_NONCE_LEN];

        let (body, mut tag) = seal_detached(&key, &nonce, b"payload").expect("seal");
        tag[0] ^= 0x80;
        assert_eq!(
            open_detached(&key, &nonce, &body, &tag),
            Err(AeadError::Decrypt)
        );
    }
}
