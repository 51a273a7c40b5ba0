// Server key registry and key-id lookup.
// Numan Thabit 2026

use std::sync::Arc;

use ahash::AHashMap;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::wire::KEY_ID_LEN;

/// Full public-key identifier as carried on the wire.
pub type KeyId = [u8; KEY_ID_LEN];

/// A registered server keypair with its per-key policy.
pub struct ServerKey {
    secret: StaticSecret,
    public: PublicKey,
    /// Category flags this key is never allowed to see in replies.
    /// Small set; linear scan.
    forbidden_flags: Vec<u32>,
}

impl ServerKey {
    /// Builds a key from raw secret bytes.
    pub fn new(secret_bytes: [u8; 32], forbidden_flags: Vec<u32>) -> Self {
        let secret = StaticSecret::from(secret_bytes);
        let public = PublicKey::from(&secret);
        Self {
            secret,
            public,
            forbidden_flags,
        }
    }

    /// Full key identifier (the public key bytes).
    pub fn id(&self) -> KeyId {
        self.public.to_bytes()
    }

    /// The X25519 secret half.
    pub fn secret(&self) -> &StaticSecret {
        &self.secret
    }

    /// The X25519 public half.
    pub fn public(&self) -> &PublicKey {
        &self.public
    }

    /// True when replies carrying `flag` must be blanked for this key.
    pub fn is_forbidden(&self, flag: u32) -> bool {
        self.forbidden_flags.contains(&flag)
    }

    /// Base32 form of the full key id.
    pub fn id_b32(&self) -> String {
        base32_encode(&self.id())
    }

    /// Base32 form of the first eight id bytes, used as the snapshot
    /// table key.
    pub fn short_id_b32(&self) -> String {
        base32_encode(&self.id()[..8])
    }
}

impl std::fmt::Debug for ServerKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerKey")
            .field("id", &self.short_id_b32())
            .field("forbidden_flags", &self.forbidden_flags)
            .finish()
    }
}

/// RFC 4648 base32, lowercase, no padding.
pub fn base32_encode(data: &[u8]) -> String {
    const ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";
    let mut out = String::with_capacity(data.len().div_ceil(5) * 8);
    let mut acc: u64 = 0;
    let mut bits = 0u32;
    for &byte in data {
        acc = (acc << 8) | u64::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(ALPHABET[((acc >> bits) & 0x1F) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(ALPHABET[((acc << (5 - bits)) & 0x1F) as usize] as char);
    }
    out
}

fn id_prefix(id: &KeyId) -> u64 {
    u64::from_le_bytes(id[..8].try_into().unwrap())
}

/// Registry of server keys, resolved per request by key id.
///
/// Lookup hashes the first eight id bytes and settles collisions with
/// a full 32-byte comparison; unknown ids fall through to the default
/// key when one is configured.
#[derive(Debug, Default)]
pub struct KeyRegistry {
    by_prefix: AHashMap<u64, Vec<Arc<ServerKey>>>,
    default: Option<Arc<ServerKey>>,
}

impl KeyRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a key; the first registered key becomes the default.
    pub fn insert(&mut self, key: Arc<ServerKey>) {
        if self.default.is_none() {
            self.default = Some(Arc::clone(&key));
        }
        self.by_prefix
            .entry(id_prefix(&key.id()))
            .or_default()
            .push(key);
    }

    /// True when no keys were registered.
    pub fn is_empty(&self) -> bool {
        self.default.is_none()
    }

    /// Default key for unknown ids, when configured.
    pub fn default_key(&self) -> Option<&Arc<ServerKey>> {
        self.default.as_ref()
    }

    /// Resolves a wire key id, falling back to the default key.
    pub fn resolve(&self, id: &KeyId) -> Option<&Arc<ServerKey>> {
        self.by_prefix
            .get(&id_prefix(id))
            .and_then(|bucket| bucket.iter().find(|key| key.id() == *id))
            .or(self.default.as_ref())
    }

    /// Iterates all registered keys.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ServerKey>> {
        self.by_prefix.values().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_exact_and_default() {
        let mut registry = KeyRegistry::new();
        let first = Arc::new(ServerKey::new([1; 32], vec![]));
        let second = Arc::new(ServerKey::new([2; 32], vec![9]));
        registry.insert(Arc::clone(&first));
        registry.insert(Arc::clone(&second));

        let hit = registry.resolve(&second.id()).expect("resolved");
        assert_eq!(hit.id(), second.id());

        // Unknown id falls through to the first (default) key.
        let fallback = registry.resolve(&[0xFF; 32]).expect("default");
        assert_eq!(fallback.id(), first.id());
    }

    #[test]
    fn empty_registry_resolves_nothing() {
        let registry = KeyRegistry::new();
        assert!(registry.resolve(&[0; 32]).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn forbidden_flag_scan() {
        let key = ServerKey::new([3; 32], vec![2, 11]);
        assert!(key.is_forbidden(11));
        assert!(!key.is_forbidden(1));
    }

    #[test]
    fn base32_known_vectors() {
        assert_eq!(base32_encode(b""), "");
        assert_eq!(base32_encode(b"f"), "my");
        assert_eq!(base32_encode(b"fo"), "mzxq");
        assert_eq!(base32_encode(b"foo"), "mzxw6");
        assert_eq!(base32_encode(b"foob"), "mzxw6yq");
        assert_eq!(base32_encode(b"fooba"), "mzxw6ytb");
        assert_eq!(base32_encode(b"foobar"), "mzxw6ytboi");
    }
}
