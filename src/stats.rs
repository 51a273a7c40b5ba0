// Request statistics: global, per-key, and per-client counters.
// Numan Thabit 2026

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::num::NonZeroUsize;

use ahash::AHashMap;
use lru::LruCache;
use serde::Serialize;

use crate::crypto::keys::{KeyId, KeyRegistry};
use crate::wire::{Command, Epoch, EPOCH_COUNT};

/// Window between per-key EMA refreshes, seconds.
pub const KEY_STAT_INTERVAL: f64 = 3600.0;

/// Decay factor fed into the hourly moving averages.
pub const EMA_ALPHA: f64 = 0.5;

/// Bound on tracked client addresses per key.
pub const LAST_IPS_CAPACITY: usize = 1024;

/// Bound on tracked malformed-request sources.
pub const ERRORS_IPS_CAPACITY: usize = 1024;

/// Exponential moving average over window deltas.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EmaCounter {
    /// Smoothed per-window mean.
    pub mean: f64,
}

impl EmaCounter {
    fn update(&mut self, value: f64) {
        self.mean = EMA_ALPHA * value + (1.0 - EMA_ALPHA) * self.mean;
    }
}

/// Counters shared by per-key and per-client records.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericStats {
    pub checked: u64,
    pub matched: u64,
    pub added: u64,
    pub deleted: u64,
    pub errors: u64,
}

impl GenericStats {
    fn record(&mut self, cmd: Command, matched: bool, value: i32) {
        if !matched && value != 0 {
            self.errors += 1;
            return;
        }
        match cmd {
            Command::Check => {
                self.checked += 1;
                if matched {
                    self.matched += 1;
                }
            }
            Command::Write => self.added += 1,
            Command::Delete => self.deleted += 1,
            Command::Stat | Command::Refresh => {}
        }
    }
}

/// Per-key statistics with hourly averages and a per-client table.
pub struct KeyStats {
    pub generic: GenericStats,
    pub checked_ctr: EmaCounter,
    pub matched_ctr: EmaCounter,
    last_window_ts: f64,
    last_window_checked: u64,
    last_window_matched: u64,
    last_ips: LruCache<IpAddr, GenericStats>,
}

impl KeyStats {
    fn new() -> Self {
        Self {
            generic: GenericStats::default(),
            checked_ctr: EmaCounter::default(),
            matched_ctr: EmaCounter::default(),
            last_window_ts: 0.0,
            last_window_checked: 0,
            last_window_matched: 0,
            last_ips: LruCache::new(NonZeroUsize::new(LAST_IPS_CAPACITY).unwrap()),
        }
    }

    fn roll_window(&mut self, now: f64) {
        if self.last_window_ts == 0.0 {
            self.last_window_ts = now;
            self.last_window_checked = self.generic.checked;
            self.last_window_matched = self.generic.matched;
        } else if now > self.last_window_ts + KEY_STAT_INTERVAL {
            let nchecked = self.generic.checked - self.last_window_checked;
            let nmatched = self.generic.matched - self.last_window_matched;
            self.checked_ctr.update(nchecked as f64);
            self.matched_ctr.update(nmatched as f64);
            self.last_window_ts = now;
            self.last_window_checked = self.generic.checked;
            self.last_window_matched = self.generic.matched;
        }
    }
}

/// Process-wide counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalStats {
    /// Entries currently stored (refreshed from the backend).
    pub stored: u64,
    /// Entries the backend has expired.
    pub expired: u64,
    pub checked: [u64; EPOCH_COUNT],
    pub shingles_checked: [u64; EPOCH_COUNT],
    pub matched: [u64; EPOCH_COUNT],
    pub invalid_requests: u64,
    pub delayed_hashes: u64,
}

/// Statistics registry owned by one worker.
pub struct StatsRegistry {
    pub global: GlobalStats,
    keys: AHashMap<KeyId, KeyStats>,
    errors_ips: LruCache<IpAddr, u64>,
}

impl Default for StatsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self {
            global: GlobalStats::default(),
            keys: AHashMap::default(),
            errors_ips: LruCache::new(NonZeroUsize::new(ERRORS_IPS_CAPACITY).unwrap()),
        }
    }

    /// Records a request that failed to decode.
    pub fn note_invalid(&mut self, addr: Option<IpAddr>) {
        self.global.invalid_requests += 1;
        if let Some(addr) = addr {
            *self.errors_ips.get_or_insert_mut(addr, || 0) += 1;
        }
    }

    /// Records one completed request. Runs after the backend result is
    /// known and before the reply is sent.
    #[allow(clippy::too_many_arguments)]
    pub fn update_request(
        &mut self,
        key: Option<&KeyId>,
        addr: Option<IpAddr>,
        epoch: Epoch,
        cmd: Command,
        matched: bool,
        is_shingle: bool,
        delayed: bool,
        value: i32,
        now: f64,
    ) {
        let idx = epoch.index();
        self.global.checked[idx] += 1;
        if matched {
            self.global.matched[idx] += 1;
        }
        if is_shingle {
            self.global.shingles_checked[idx] += 1;
        }
        if delayed {
            self.global.delayed_hashes += 1;
        }

        let Some(key) = key else {
            return;
        };
        let key_stats = self.keys.entry(*key).or_insert_with(KeyStats::new);
        key_stats.generic.record(cmd, matched, value);
        if cmd == Command::Check && (matched || value == 0) {
            key_stats.roll_window(now);
        }

        if let Some(addr) = addr {
            key_stats
                .last_ips
                .get_or_insert_mut(addr, GenericStats::default)
                .record(cmd, matched, value);
        }
    }

    /// Per-key counters, when the key has been seen.
    pub fn key_stats(&self, key: &KeyId) -> Option<&KeyStats> {
        self.keys.get(key)
    }

    /// Builds a serializable snapshot of every counter.
    pub fn snapshot(&self, registry: &KeyRegistry, include_ips: bool) -> StatsSnapshot {
        let mut keys = BTreeMap::new();
        for key in registry.iter() {
            let id = key.id();
            let stats = self.keys.get(&id);
            let generic = stats.map(|s| s.generic).unwrap_or_default();

            let ips = if include_ips {
                stats.map(|s| {
                    s.last_ips
                        .iter()
                        .map(|(addr, g)| (addr.to_string(), IpSnapshot::from(*g)))
                        .collect()
                })
            } else {
                None
            };

            keys.insert(
                key.short_id_b32(),
                KeySnapshot {
                    checked: generic.checked,
                    checked_per_hour: stats.map(|s| s.checked_ctr.mean).unwrap_or(0.0),
                    matched: generic.matched,
                    matched_per_hour: stats.map(|s| s.matched_ctr.mean).unwrap_or(0.0),
                    added: generic.added,
                    deleted: generic.deleted,
                    errors: generic.errors,
                    keypair: KeypairSnapshot {
                        pubkey: key.id_b32(),
                    },
                    ips,
                },
            );
        }

        let errors_ips = if include_ips {
            Some(
                self.errors_ips
                    .iter()
                    .map(|(addr, count)| (addr.to_string(), *count))
                    .collect(),
            )
        } else {
            None
        };

        StatsSnapshot {
            keys,
            fuzzy_stored: self.global.stored,
            fuzzy_expired: self.global.expired,
            invalid_requests: self.global.invalid_requests,
            delayed_hashes: self.global.delayed_hashes,
            errors_ips,
            fuzzy_checked: self.global.checked.to_vec(),
            fuzzy_shingles: self.global.shingles_checked.to_vec(),
            fuzzy_found: self.global.matched.to_vec(),
        }
    }
}

/// Serializable view of per-client counters.
#[derive(Debug, Serialize)]
pub struct IpSnapshot {
    pub checked: u64,
    pub matched: u64,
    pub added: u64,
    pub deleted: u64,
    pub errors: u64,
}

impl From<GenericStats> for IpSnapshot {
    fn from(g: GenericStats) -> Self {
        Self {
            checked: g.checked,
            matched: g.matched,
            added: g.added,
            deleted: g.deleted,
            errors: g.errors,
        }
    }
}

/// Public half of a keypair as exposed in snapshots.
#[derive(Debug, Serialize)]
pub struct KeypairSnapshot {
    pub pubkey: String,
}

/// Serializable per-key record.
#[derive(Debug, Serialize)]
pub struct KeySnapshot {
    pub checked: u64,
    pub checked_per_hour: f64,
    pub matched: u64,
    pub matched_per_hour: f64,
    pub added: u64,
    pub deleted: u64,
    pub errors: u64,
    pub keypair: KeypairSnapshot,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ips: Option<BTreeMap<String, IpSnapshot>>,
}

/// Full statistics document, serialized for the control channel.
#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub keys: BTreeMap<String, KeySnapshot>,
    pub fuzzy_stored: u64,
    pub fuzzy_expired: u64,
    pub invalid_requests: u64,
    pub delayed_hashes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errors_ips: Option<BTreeMap<String, u64>>,
    pub fuzzy_checked: Vec<u64>,
    pub fuzzy_shingles: Vec<u64>,
    pub fuzzy_found: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::ServerKey;
    use std::sync::Arc;

    fn sample_key() -> Arc<ServerKey> {
        Arc::new(ServerKey::new([4; 32], vec![]))
    }

    #[test]
    fn check_updates_global_and_key_counters() {
        let mut stats = StatsRegistry::new();
        let key = sample_key();
        let id = key.id();
        let addr: IpAddr = "192.0.2.10".parse().unwrap();

        stats.update_request(
            Some(&id),
            Some(addr),
            Epoch::Current,
            Command::Check,
            true,
            true,
            false,
            0,
            1000.0,
        );

        assert_eq!(stats.global.checked[Epoch::Current.index()], 1);
        assert_eq!(stats.global.matched[Epoch::Current.index()], 1);
        assert_eq!(stats.global.shingles_checked[Epoch::Current.index()], 1);

        let key_stats = stats.key_stats(&id).unwrap();
        assert_eq!(key_stats.generic.checked, 1);
        assert_eq!(key_stats.generic.matched, 1);
    }

    #[test]
    fn backend_error_counts_as_error() {
        let mut stats = StatsRegistry::new();
        let key = sample_key();
        let id = key.id();

        stats.update_request(
            Some(&id),
            None,
            Epoch::Legacy,
            Command::Check,
            false,
            false,
            false,
            500,
            0.0,
        );

        let key_stats = stats.key_stats(&id).unwrap();
        assert_eq!(key_stats.generic.errors, 1);
        assert_eq!(key_stats.generic.checked, 0);
    }

    #[test]
    fn ema_window_separates_checked_and_matched() {
        let mut stats = StatsRegistry::new();
        let key = sample_key();
        let id = key.id();

        // First check opens the window.
        stats.update_request(
            Some(&id),
            None,
            Epoch::Current,
            Command::Check,
            true,
            false,
            false,
            0,
            1.0,
        );
        // Three more checks, one matched, inside the window.
        for matched in [true, false, false] {
            stats.update_request(
                Some(&id),
                None,
                Epoch::Current,
                Command::Check,
                matched,
                false,
                false,
                0,
                10.0,
            );
        }
        // Past the window boundary the deltas feed the two counters.
        stats.update_request(
            Some(&id),
            None,
            Epoch::Current,
            Command::Check,
            false,
            false,
            false,
            0,
            KEY_STAT_INTERVAL + 20.0,
        );

        let key_stats = stats.key_stats(&id).unwrap();
        // Window delta: 4 checks and 1 match beyond the opening one.
        assert!(key_stats.checked_ctr.mean > 0.0);
        assert!(key_stats.matched_ctr.mean > 0.0);
        assert!(key_stats.checked_ctr.mean > key_stats.matched_ctr.mean);
    }

    #[test]
    fn invalid_requests_tracked_per_ip() {
        let mut stats = StatsRegistry::new();
        let addr: IpAddr = "198.51.100.3".parse().unwrap();

        stats.note_invalid(Some(addr));
        stats.note_invalid(Some(addr));
        stats.note_invalid(None);

        assert_eq!(stats.global.invalid_requests, 3);
        let registry = KeyRegistry::new();
        let snapshot = stats.snapshot(&registry, true);
        assert_eq!(snapshot.errors_ips.unwrap()["198.51.100.3"], 2);
    }

    #[test]
    fn snapshot_serializes_keys_table() {
        let mut stats = StatsRegistry::new();
        let key = sample_key();
        let id = key.id();
        let mut registry = KeyRegistry::new();
        registry.insert(Arc::clone(&key));

        let addr: IpAddr = "192.0.2.20".parse().unwrap();
        stats.update_request(
            Some(&id),
            Some(addr),
            Epoch::Current,
            Command::Write,
            false,
            false,
            false,
            0,
            5.0,
        );

        let snapshot = stats.snapshot(&registry, true);
        let record = &snapshot.keys[&key.short_id_b32()];
        assert_eq!(record.added, 1);
        assert_eq!(record.keypair.pubkey, key.id_b32());
        assert_eq!(record.ips.as_ref().unwrap()["192.0.2.20"].added, 1);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["fuzzy_stored"], 0);
        assert!(json["fuzzy_checked"].is_array());
    }
}
