// Address prefix sets, network masking, and admission maps.
// Numan Thabit 2026

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use ahash::AHashSet;
use thiserror::Error;

use crate::crypto::keys::{base32_encode, KeyId};
use crate::wire::Digest;

/// Error returned while parsing prefix entries.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PrefixError {
    /// Entry was not an address or CIDR network.
    #[error("invalid prefix entry '{0}'")]
    BadEntry(String),
    /// Prefix length exceeds the address family width.
    #[error("prefix length {len} too long for '{entry}'")]
    BadLength { entry: String, len: u32 },
}

/// A set of IPv4/IPv6 networks with membership checks.
#[derive(Debug, Clone, Default)]
pub struct PrefixSet {
    v4: Vec<(u32, u8)>,
    v6: Vec<(u128, u8)>,
}

fn v4_net(addr: Ipv4Addr, len: u8) -> u32 {
    let bits = u32::from(addr);
    if len == 0 {
        0
    } else {
        bits & (u32::MAX << (32 - len))
    }
}

fn v6_net(addr: Ipv6Addr, len: u8) -> u128 {
    let bits = u128::from(addr);
    if len == 0 {
        0
    } else {
        bits & (u128::MAX << (128 - len))
    }
}

impl PrefixSet {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a list of `addr` or `addr/len` entries.
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Result<Self, PrefixError> {
        let mut set = Self::new();
        for entry in entries {
            set.add(entry.as_ref())?;
        }
        Ok(set)
    }

    /// Adds one entry; a bare address is a host prefix.
    pub fn add(&mut self, entry: &str) -> Result<(), PrefixError> {
        let (addr_part, len_part) = match entry.split_once('/') {
            Some((addr, len)) => (addr, Some(len)),
            None => (entry, None),
        };

        let addr = IpAddr::from_str(addr_part)
            .map_err(|_| PrefixError::BadEntry(entry.to_string()))?;
        let max_len = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        let len = match len_part {
            Some(raw) => {
                let len: u32 = raw
                    .parse()
                    .map_err(|_| PrefixError::BadEntry(entry.to_string()))?;
                if len > max_len {
                    return Err(PrefixError::BadLength {
                        entry: entry.to_string(),
                        len,
                    });
                }
                len as u8
            }
            None => max_len as u8,
        };

        match addr {
            IpAddr::V4(v4) => self.v4.push((v4_net(v4, len), len)),
            IpAddr::V6(v6) => self.v6.push((v6_net(v6, len), len)),
        }
        Ok(())
    }

    /// True when no entries are configured.
    pub fn is_empty(&self) -> bool {
        self.v4.is_empty() && self.v6.is_empty()
    }

    /// Membership check for a client address.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match addr {
            IpAddr::V4(v4) => self
                .v4
                .iter()
                .any(|&(net, len)| v4_net(v4, len) == net),
            IpAddr::V6(v6) => self
                .v6
                .iter()
                .any(|&(net, len)| v6_net(v6, len) == net),
        }
    }
}

/// Applies the configured rate-limit mask to a client address.
///
/// IPv4 masks to `min(mask, 32)` bits; IPv6 to `min(max(mask * 4, 64),
/// 128)` so a /24 IPv4 policy maps to /96-but-at-least-/64 networks.
pub fn mask_addr(addr: IpAddr, mask: u32) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let len = mask.min(32) as u8;
            IpAddr::V4(Ipv4Addr::from(v4_net(v4, len)))
        }
        IpAddr::V6(v6) => {
            let len = (mask * 4).max(64).min(128) as u8;
            IpAddr::V6(Ipv6Addr::from(v6_net(v6, len)))
        }
    }
}

/// Hex form of a digest, used for skip-map membership.
pub fn digest_hex(digest: &Digest) -> String {
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Set of key ids allowed to perform updates, stored in base32.
#[derive(Debug, Clone, Default)]
pub struct KeyIdSet {
    entries: AHashSet<String>,
}

impl KeyIdSet {
    /// Builds the set from base32 key-id strings.
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|e| e.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, id: &KeyId) -> bool {
        self.entries.contains(&base32_encode(id))
    }
}

/// Set of digests exempt from writes, stored as hex.
#[derive(Debug, Clone, Default)]
pub struct DigestSet {
    entries: AHashSet<String>,
}

impl DigestSet {
    /// Builds the set from hex digest strings.
    pub fn from_entries<S: AsRef<str>>(entries: &[S]) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|e| e.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.entries.contains(&digest_hex(digest))
    }
}
