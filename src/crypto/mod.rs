// Crypto gate: AEAD, key agreement, and the key registry.
// Numan Thabit 2026

pub mod aead;
pub mod exchange;
pub mod keys;

pub use aead::{AeadError, AeadKey, TAG_LEN, XCHACHA20_NONCE_LEN};
pub use exchange::{derive_shared_key, open_request, seal_reply, SecretCache};
pub use keys::{base32_encode, KeyId, KeyRegistry, ServerKey};
