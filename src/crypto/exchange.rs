// X25519 agreement, key schedule, and the shared-secret cache.
// Numan Thabit 2026

use std::num::NonZeroUsize;

use hkdf::Hkdf;
use lru::LruCache;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::PublicKey;

use super::{
    aead::{self, AeadError, AeadKey},
    keys::{KeyId, ServerKey},
};
use crate::wire::{EncryptedHeader, Reply, MAC_LEN, NONCE_LEN};

/// Info label for deriving the request/reply AEAD key.
pub const INFO_AEAD_KEY: &[u8] = b"numihash/aead";

/// Derives the symmetric key for one (server key, ephemeral key) pair.
pub fn derive_shared_key(key: &ServerKey, their_public: &[u8; 32]) -> AeadKey {
    let shared = key
        .secret()
        .diffie_hellman(&PublicKey::from(*their_public));
    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = [0u8; 32];
    // 32 bytes always fits a SHA-256 HKDF output.
    hk.expand(INFO_AEAD_KEY, &mut okm)
        .expect("hkdf output length");
    AeadKey::new(okm)
}

/// Bounded per-worker cache of derived shared keys.
///
/// Keyed by (recipient key id, sender ephemeral public key); repeat
/// senders skip the X25519 scalar multiplication.
pub struct SecretCache {
    cache: LruCache<(KeyId, [u8; 32]), AeadKey>,
}

impl SecretCache {
    /// Creates a cache bounded to `capacity` entries (minimum one).
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: LruCache::new(NonZeroUsize::new(capacity.max(1)).unwrap()),
        }
    }

    /// Returns the shared key for this pair, deriving on miss.
    pub fn shared_key(&mut self, key: &ServerKey, their_public: &[u8; 32]) -> AeadKey {
        let cache_key = (key.id(), *their_public);
        if let Some(found) = self.cache.get(&cache_key) {
            return found.clone();
        }
        let derived = derive_shared_key(key, their_public);
        self.cache.push(cache_key, derived.clone());
        derived
    }

    /// Number of cached secrets.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// True when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

/// Authenticates and decrypts an encrypted request body.
pub fn open_request(
    shared: &AeadKey,
    header: &EncryptedHeader,
    body: &[u8],
) -> Result<Vec<u8>, AeadError> {
    aead::open_detached(shared, &header.nonce, body, &header.mac)
}

/// Encrypts an encoded reply under a fresh random nonce.
///
/// Returns the complete encrypted reply: the 40-byte {nonce, mac}
/// header followed by the ciphertext.
pub fn seal_reply(shared: &AeadKey, payload: &[u8]) -> Result<Vec<u8>, AeadError> {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let (body, mac) = aead::seal_detached(shared, &nonce, payload)?;
    let mut out = Vec::with_capacity(NONCE_LEN + MAC_LEN + body.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&mac);
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decrypts an encrypted reply produced by [`seal_reply`] (client side
/// and tests).
pub fn open_reply(shared: &AeadKey, frame: &[u8]) -> Result<Vec<u8>, AeadError> {
    if frame.len() < NONCE_LEN + MAC_LEN {
        return Err(AeadError::Decrypt);
    }
    let nonce: [u8; NONCE_LEN] = frame[..NONCE_LEN].try_into().unwrap();
    let mac: [u8; MAC_LEN] = frame[NONCE_LEN..NONCE_LEN + MAC_LEN].try_into().unwrap();
    aead::open_detached(shared, &nonce, &frame[NONCE_LEN + MAC_LEN..], &mac)
}

/// Parses a decrypted reply frame, used by tests and client tooling.
pub fn parse_sealed_reply(
    shared: &AeadKey,
    frame: &[u8],
    epoch: crate::wire::Epoch,
) -> Result<Reply, AeadError> {
    let plain = open_reply(shared, frame)?;
    crate::wire::parse_reply(&plain, epoch).map_err(|_| AeadError::Decrypt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use x25519_dalek::StaticSecret;

    fn client_shared(server: &ServerKey, eph: &StaticSecret) -> AeadKey {
        let shared = eph.diffie_hellman(server.public());
        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut okm = [0u8; 32];
        hk.expand(INFO_AEAD_KEY, &mut okm).unwrap();
        AeadKey::new(okm)
    }

    #[test]
    fn both_sides_derive_the_same_key() {
        let server = ServerKey::new([7; 32], vec![]);
        let eph = StaticSecret::from([9; 32]);
        let eph_pub = PublicKey::from(&eph).to_bytes();

        let server_side = derive_shared_key(&server, &eph_pub);
        let client_side = client_shared(&server, &eph);
        assert_eq!(server_side, client_side);
    }

    #[test]
    fn cache_returns_identical_keys_and_evicts_lru() {
        let server = ServerKey::new([5; 32], vec![]);
        let mut cache = SecretCache::new(2);

        let a = PublicKey::from(&StaticSecret::from([1; 32])).to_bytes();
        let b = PublicKey::from(&StaticSecret::from([2; 32])).to_bytes();
        let c = PublicKey::from(&StaticSecret::from([3; 32])).to_bytes();

        let first = cache.shared_key(&server, &a);
        assert_eq!(cache.shared_key(&server, &a), first);
        assert_eq!(cache.len(), 1);

        cache.shared_key(&server, &b);
        cache.shared_key(&server, &c);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn reply_seal_open_round_trip() {
        let shared = AeadKey::new([0xAB; 32]);
        let payload = b"reply payload bytes";

        let frame = seal_reply(&shared, payload).expect("seal");
        assert_eq!(frame.len(), NONCE_LEN + MAC_LEN + payload.len());

        let recovered = open_reply(&shared, &frame).expect("open");
        assert_eq!(recovered, payload);
    }

    #[test]
    fn fresh_nonce_per_reply() {
        let shared = AeadKey::new([0xCD; 32]);
        let one = seal_reply(&shared, b"same").unwrap();
        let two = seal_reply(&shared, b"same").unwrap();
        assert_ne!(one[..NONCE_LEN], two[..NONCE_LEN]);
    }
}
