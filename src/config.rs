// Configuration schema for the fingerprint server.
// Numan Thabit 2026

use std::{
    env, fs,
    io::{self, Read},
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
};

use serde::Deserialize;
use thiserror::Error;

use crate::crypto::keys::{KeyRegistry, ServerKey};
use crate::limit::RateLimitParams;
use crate::prefix::{DigestSet, KeyIdSet, PrefixSet, PrefixError};

/// Default flush period, seconds.
pub const DEFAULT_SYNC_TIMEOUT: f64 = 60.0;
/// Default entry TTL consumed by the backend, seconds (90 days).
pub const DEFAULT_EXPIRE: f64 = 90.0 * 86400.0;
/// Default shared-secret cache capacity.
pub const DEFAULT_KEYPAIR_CACHE_SIZE: usize = 512;
/// Default consecutive flush failures tolerated.
pub const DEFAULT_UPDATES_MAXFAIL: u32 = 3;
/// Default bound on rate-limit buckets.
pub const DEFAULT_MAX_BUCKETS: usize = 2000;
/// Default rate-limit bucket TTL, seconds.
pub const DEFAULT_BUCKET_TTL: f64 = 3600.0;
/// Default IPv4 network mask for rate limiting.
pub const DEFAULT_BUCKET_MASK: u32 = 24;

/// Error returned while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error when reading a configuration file from disk.
    #[error("failed to read config '{path}': {source}")]
    Io {
        /// Path that failed to read.
        path: PathBuf,
        /// Source IO error.
        #[source]
        source: io::Error,
    },
    /// Error when parsing the configuration contents.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    /// The configuration did not pass validation checks.
    #[error("invalid config: {0}")]
    Validation(String),
    /// A prefix map entry failed to parse.
    #[error("invalid prefix map: {0}")]
    Prefix(#[from] PrefixError),
}

/// One configured server keypair.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct KeypairConfig {
    /// X25519 secret key, 64 hex characters.
    pub privkey: String,
    /// Category flags never revealed to clients of this key.
    pub forbidden_flags: Vec<u32>,
}

impl KeypairConfig {
    fn secret_bytes(&self) -> Result<[u8; 32], ConfigError> {
        let raw = self.privkey.trim();
        if raw.len() != 64 {
            return Err(ConfigError::Validation(format!(
                "keypair privkey must be 64 hex characters, got {}",
                raw.len()
            )));
        }
        let mut out = [0u8; 32];
        for (i, chunk) in raw.as_bytes().chunks_exact(2).enumerate() {
            let hex = std::str::from_utf8(chunk).expect("hex chunk");
            out[i] = u8::from_str_radix(hex, 16).map_err(|_| {
                ConfigError::Validation(format!("keypair privkey is not hex: '{hex}'"))
            })?;
        }
        Ok(out)
    }
}

/// Server configuration loaded at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// UDP listening address.
    pub bind: String,
    /// Worker count; all workers share the port via SO_REUSEPORT.
    pub workers: usize,
    /// Flush period for the update queue, seconds.
    pub sync: f64,
    /// Entry TTL handed to the backend, seconds.
    pub expire: f64,
    /// Reply-delay threshold, seconds; absent disables delaying.
    pub delay: Option<f64>,
    /// Encryption keypairs; the first is the default key.
    pub keypair: Vec<KeypairConfig>,
    /// Shared-secret cache capacity per worker.
    pub keypair_cache_size: usize,
    /// Reject plaintext requests.
    pub encrypted_only: bool,
    /// Reject every mutation.
    pub read_only: bool,
    /// Dedicate worker 0 to updates; it stops serving UDP clients.
    pub dedicated_update_worker: bool,
    /// Consecutive flush failures tolerated before dropping a batch.
    pub updates_maxfail: u32,
    /// Networks allowed to submit updates.
    pub allow_update: Vec<String>,
    /// Key ids (base32) allowed to submit updates.
    pub allow_update_keys: Vec<String>,
    /// Digests (hex) refused on write with a 401.
    pub skip_hashes: Vec<String>,
    /// Networks dropped silently.
    pub blocked: Vec<String>,
    /// Networks exempt from rate limiting.
    pub ratelimit_whitelist: Vec<String>,
    /// Bound on tracked rate-limit networks.
    pub ratelimit_max_buckets: usize,
    /// IPv4 mask grouping clients into buckets.
    pub ratelimit_network_mask: u32,
    /// Bucket (and lockout) lifetime, seconds.
    pub ratelimit_bucket_ttl: f64,
    /// Bucket drain rate, requests per second; enables limiting
    /// together with `ratelimit_burst`.
    pub ratelimit_rate: Option<f64>,
    /// Bucket burst capacity.
    pub ratelimit_burst: Option<f64>,
    /// Run the limiter for observability but ignore its verdict.
    pub ratelimit_log_only: bool,
    /// Networks exempt from reply delaying.
    pub delay_whitelist: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:11335".to_string(),
            workers: 1,
            sync: DEFAULT_SYNC_TIMEOUT,
            expire: DEFAULT_EXPIRE,
            delay: None,
            keypair: Vec::new(),
            keypair_cache_size: DEFAULT_KEYPAIR_CACHE_SIZE,
            encrypted_only: false,
            read_only: false,
            dedicated_update_worker: false,
            updates_maxfail: DEFAULT_UPDATES_MAXFAIL,
            allow_update: Vec::new(),
            allow_update_keys: Vec::new(),
            skip_hashes: Vec::new(),
            blocked: Vec::new(),
            ratelimit_whitelist: Vec::new(),
            ratelimit_max_buckets: DEFAULT_MAX_BUCKETS,
            ratelimit_network_mask: DEFAULT_BUCKET_MASK,
            ratelimit_bucket_ttl: DEFAULT_BUCKET_TTL,
            ratelimit_rate: None,
            ratelimit_burst: None,
            ratelimit_log_only: false,
            delay_whitelist: Vec::new(),
        }
    }
}

impl Config {
    /// Loads configuration from `NUMIHASH_CONFIG` if set, otherwise
    /// returns defaults.
    pub fn load() -> Result<Self, ConfigError> {
        match env::var("NUMIHASH_CONFIG") {
            Ok(path) => Self::from_path(path),
            Err(_missing) => {
                let cfg = Self::default();
                cfg.validate()?;
                Ok(cfg)
            }
        }
    }

    /// Loads a configuration file from the provided path.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::Io {
            path: path_ref.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&contents)
    }

    /// Loads configuration from any reader implementing [`Read`].
    pub fn from_reader<R: Read>(mut reader: R) -> Result<Self, ConfigError> {
        let mut buf = String::new();
        reader
            .read_to_string(&mut buf)
            .map_err(|source| ConfigError::Io {
                path: PathBuf::from("<reader>"),
                source,
            })?;
        Self::from_toml_str(&buf)
    }

    /// Loads configuration from a TOML string slice.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        <Self as FromStr>::from_str(input)
    }

    /// Validates the configuration, returning an error when
    /// constraints are violated.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Validation("workers must be at least 1".into()));
        }
        if self.sync <= 0.0 {
            return Err(ConfigError::Validation("sync period must be positive".into()));
        }
        if self.expire < 0.0 {
            return Err(ConfigError::Validation("expire must not be negative".into()));
        }
        if let Some(delay) = self.delay {
            if delay <= 0.0 {
                return Err(ConfigError::Validation("delay must be positive".into()));
            }
        }
        if self.updates_maxfail == 0 {
            return Err(ConfigError::Validation(
                "updates_maxfail must be at least 1".into(),
            ));
        }
        if self.ratelimit_rate.is_some() != self.ratelimit_burst.is_some() {
            return Err(ConfigError::Validation(
                "ratelimit_rate and ratelimit_burst must be set together".into(),
            ));
        }
        if let (Some(rate), Some(burst)) = (self.ratelimit_rate, self.ratelimit_burst) {
            if rate <= 0.0 || burst <= 0.0 {
                return Err(ConfigError::Validation(
                    "ratelimit rate and burst must be positive".into(),
                ));
            }
            if self.ratelimit_network_mask == 0 || self.ratelimit_network_mask > 32 {
                return Err(ConfigError::Validation(
                    "ratelimit_network_mask must be within 1..=32".into(),
                ));
            }
            if self.ratelimit_bucket_ttl <= 0.0 {
                return Err(ConfigError::Validation(
                    "ratelimit_bucket_ttl must be positive".into(),
                ));
            }
            if self.ratelimit_max_buckets == 0 {
                return Err(ConfigError::Validation(
                    "ratelimit_max_buckets must be at least 1".into(),
                ));
            }
        }
        if self.encrypted_only && self.keypair.is_empty() {
            return Err(ConfigError::Validation(
                "encrypted_only requires at least one keypair".into(),
            ));
        }
        for kp in &self.keypair {
            kp.secret_bytes()?;
        }
        Ok(())
    }

    /// Builds the key registry from the configured keypairs.
    pub fn build_keys(&self) -> Result<KeyRegistry, ConfigError> {
        let mut registry = KeyRegistry::new();
        for kp in &self.keypair {
            let secret = kp.secret_bytes()?;
            registry.insert(Arc::new(ServerKey::new(secret, kp.forbidden_flags.clone())));
        }
        Ok(registry)
    }

    /// Rate-limiter parameters, when limiting is enabled.
    pub fn ratelimit_params(&self) -> Option<RateLimitParams> {
        let rate = self.ratelimit_rate?;
        let burst = self.ratelimit_burst?;
        Some(RateLimitParams {
            burst,
            rate,
            ttl: self.ratelimit_bucket_ttl,
            mask: self.ratelimit_network_mask,
            max_buckets: self.ratelimit_max_buckets,
        })
    }

    /// Parses the blocked-network map.
    pub fn blocked_set(&self) -> Result<PrefixSet, ConfigError> {
        Ok(PrefixSet::from_entries(&self.blocked)?)
    }

    /// Parses the update-allow network map.
    pub fn allow_update_set(&self) -> Result<PrefixSet, ConfigError> {
        Ok(PrefixSet::from_entries(&self.allow_update)?)
    }

    /// Parses the rate-limit whitelist map.
    pub fn ratelimit_whitelist_set(&self) -> Result<PrefixSet, ConfigError> {
        Ok(PrefixSet::from_entries(&self.ratelimit_whitelist)?)
    }

    /// Parses the delay whitelist map.
    pub fn delay_whitelist_set(&self) -> Result<PrefixSet, ConfigError> {
        Ok(PrefixSet::from_entries(&self.delay_whitelist)?)
    }

    /// The update-allow key-id set.
    pub fn allow_update_key_set(&self) -> KeyIdSet {
        KeyIdSet::from_entries(&self.allow_update_keys)
    }

    /// The skip-hash digest set.
    pub fn skip_hash_set(&self) -> DigestSet {
        DigestSet::from_entries(&self.skip_hashes)
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let cfg: Self = toml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = Config::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.ratelimit_params().is_none());
    }

    #[test]
    fn parses_full_config() {
        let input = r#"
            bind = "127.0.0.1:20443"
            workers = 4
            sync = 30.0
            delay = 120.0
            encrypted_only = true
            ratelimit_rate = 2.5
            ratelimit_burst = 100.0
            ratelimit_network_mask = 24
            allow_update = ["10.0.0.0/8"]
            blocked = ["198.51.100.0/24"]

            [[keypair]]
            privkey = "000102030405060708090a0b0c0d0e0f101112131415161718191a1b1c1d1e1f"
            forbidden_flags = [6, 9]
        "#;

        let cfg = Config::from_toml_str(input).unwrap();
        assert_eq!(cfg.workers, 4);
        assert_eq!(cfg.delay, Some(120.0));

        let params = cfg.ratelimit_params().unwrap();
        assert_eq!(params.burst, 100.0);
        assert_eq!(params.mask, 24);

        let keys = cfg.build_keys().unwrap();
        let default = keys.default_key().unwrap();
        assert!(default.is_forbidden(9));

        assert!(cfg
            .blocked_set()
            .unwrap()
            .contains("198.51.100.9".parse().unwrap()));
    }

    #[test]
    fn rejects_orphan_ratelimit_rate() {
        let err = Config::from_toml_str("ratelimit_rate = 1.0").unwrap_err();
        match err {
            ConfigError::Validation(msg) => assert!(msg.contains("together")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rejects_encrypted_only_without_keys() {
        let err = Config::from_toml_str("encrypted_only = true").unwrap_err();
        match err {
            ConfigError::Validation(msg) => assert!(msg.contains("keypair")),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_privkey_hex() {
        let input = r#"
            [[keypair]]
            privkey = "zz"
        "#;
        assert!(Config::from_toml_str(input).is_err());
    }
}
