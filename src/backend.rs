// Fingerprint store interface consumed by the request pipeline.
// Numan Thabit 2026

use std::io;

use ahash::AHashMap;
use thiserror::Error;

use crate::queue::PendingUpdate;
use crate::wire::{Command, Digest, Shingles, SHINGLE_COUNT};

/// Error surfaced by a backend operation.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Underlying storage I/O failed.
    #[error("backend io error: {0}")]
    Io(#[from] io::Error),
    /// The store rejected the operation.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Lookup result for one digest.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CheckResult {
    /// Matched or probed digest.
    pub digest: Digest,
    /// Status code; non-zero reports a backend-level error.
    pub value: i32,
    /// 0.0 miss, 1.0 exact hit, shingle fraction otherwise.
    pub prob: f32,
    /// Category flag of the matched entry.
    pub flag: u32,
    /// Timestamp the entry was last written or refreshed.
    pub ts: u64,
}

impl CheckResult {
    /// A miss for the probed digest.
    pub fn miss(digest: Digest) -> Self {
        Self {
            digest,
            value: 0,
            prob: 0.0,
            flag: 0,
            ts: 0,
        }
    }
}

/// Outcome of one committed update batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateSummary {
    pub added: u32,
    pub deleted: u32,
    pub extended: u32,
    pub ignored: u32,
}

/// Transactional fingerprint store.
///
/// Called synchronously from the worker's single-threaded loop, which
/// keeps completions in submission order with one in-flight batch.
pub trait Backend: Send {
    /// Looks up a digest, optionally with its shingle vector.
    fn check(
        &mut self,
        digest: &Digest,
        shingles: Option<&Shingles>,
    ) -> Result<CheckResult, BackendError>;

    /// Applies a batch of updates atomically.
    fn process_updates(
        &mut self,
        updates: &[PendingUpdate],
        source: &str,
    ) -> Result<UpdateSummary, BackendError>;

    /// Total stored entries.
    fn count(&mut self) -> Result<u64, BackendError>;

    /// Opaque generation token for a source.
    fn version(&mut self, source: &str) -> Result<u64, BackendError>;

    /// Releases resources before reload or shutdown.
    fn close(&mut self) {}
}

/// Factory used to (re)open the backend on startup and `Reload`.
pub type BackendFactory =
    std::sync::Arc<dyn Fn() -> Result<Box<dyn Backend>, BackendError> + Send + Sync>;

#[derive(Debug, Clone)]
struct StoredEntry {
    flag: u32,
    ts: u64,
    shingles: Option<Shingles>,
}

/// In-memory reference backend for tests and local experiments.
#[derive(Default)]
pub struct MemoryBackend {
    entries: AHashMap<Digest, StoredEntry>,
    versions: AHashMap<String, u64>,
    clock: u64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeds an entry, for tests that need a populated store.
    pub fn insert(&mut self, digest: Digest, flag: u32, ts: u64, shingles: Option<Shingles>) {
        self.entries.insert(digest, StoredEntry { flag, ts, shingles });
    }

    /// Sets the timestamp assigned to subsequent writes.
    pub fn set_clock(&mut self, now: u64) {
        self.clock = now;
    }

    fn best_shingle_match(&self, probe: &Shingles) -> Option<(Digest, f32, u32, u64)> {
        let mut best: Option<(Digest, f32, u32, u64)> = None;
        for (digest, entry) in &self.entries {
            let Some(stored) = &entry.shingles else {
                continue;
            };
            let common = probe
                .iter()
                .zip(stored.iter())
                .filter(|(a, b)| a == b)
                .count();
            let prob = common as f32 / SHINGLE_COUNT as f32;
            if prob > 0.5 && best.map_or(true, |(_, p, _, _)| prob > p) {
                best = Some((*digest, prob, entry.flag, entry.ts));
            }
        }
        best
    }
}

impl Backend for MemoryBackend {
    fn check(
        &mut self,
        digest: &Digest,
        shingles: Option<&Shingles>,
    ) -> Result<CheckResult, BackendError> {
        if let Some(entry) = self.entries.get(digest) {
            return Ok(CheckResult {
                digest: *digest,
                value: 0,
                prob: 1.0,
                flag: entry.flag,
                ts: entry.ts,
            });
        }

        if let Some(probe) = shingles {
            if let Some((matched, prob, flag, ts)) = self.best_shingle_match(probe) {
                return Ok(CheckResult {
                    digest: matched,
                    value: 0,
                    prob,
                    flag,
                    ts,
                });
            }
        }

        Ok(CheckResult::miss(*digest))
    }

    fn process_updates(
        &mut self,
        updates: &[PendingUpdate],
        source: &str,
    ) -> Result<UpdateSummary, BackendError> {
        let mut summary = UpdateSummary::default();
        for update in updates {
            match update.cmd() {
                Command::Write => {
                    if self.entries.contains_key(update.digest()) {
                        summary.ignored += 1;
                    } else {
                        self.entries.insert(
                            *update.digest(),
                            StoredEntry {
                                flag: update.flag(),
                                ts: self.clock,
                                shingles: update.shingles().copied(),
                            },
                        );
                        summary.added += 1;
                    }
                }
                Command::Delete => {
                    if self.entries.remove(update.digest()).is_some() {
                        summary.deleted += 1;
                    } else {
                        summary.ignored += 1;
                    }
                }
                Command::Refresh => {
                    if let Some(entry) = self.entries.get_mut(update.digest()) {
                        entry.ts = self.clock;
                        summary.extended += 1;
                    } else {
                        summary.ignored += 1;
                    }
                }
                Command::Check | Command::Stat => summary.ignored += 1,
            }
        }
        *self.versions.entry(source.to_string()).or_insert(0) += 1;
        Ok(summary)
    }

    fn count(&mut self) -> Result<u64, BackendError> {
        Ok(self.entries.len() as u64)
    }

    fn version(&mut self, source: &str) -> Result<u64, BackendError> {
        Ok(self.versions.get(source).copied().unwrap_or(0))
    }
}

/// A backend that fails every operation, for retry-path tests.
#[cfg(test)]
pub struct FailingBackend;

#[cfg(test)]
impl Backend for FailingBackend {
    fn check(
        &mut self,
        digest: &Digest,
        _shingles: Option<&Shingles>,
    ) -> Result<CheckResult, BackendError> {
        let _ = digest;
        Err(BackendError::Unavailable("check failed".into()))
    }

    fn process_updates(
        &mut self,
        _updates: &[PendingUpdate],
        _source: &str,
    ) -> Result<UpdateSummary, BackendError> {
        Err(BackendError::Unavailable("commit failed".into()))
    }

    fn count(&mut self) -> Result<u64, BackendError> {
        Err(BackendError::Unavailable("count failed".into()))
    }

    fn version(&mut self, _source: &str) -> Result<u64, BackendError> {
        Err(BackendError::Unavailable("version failed".into()))
    }
}
