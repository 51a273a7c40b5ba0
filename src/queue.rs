// Pending-update queue drained into transactional backend batches.
// Numan Thabit 2026

use tracing::{error, warn};

use crate::wire::{Command, Digest, Request, Shingles};

/// Source label for updates accepted over the UDP port.
pub const LOCAL_SOURCE: &str = "local";

/// A buffered mutation awaiting the next flush.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingUpdate {
    /// Digest-only mutation.
    Normal {
        digest: Digest,
        flag: u32,
        cmd: Command,
    },
    /// Mutation carrying the shingle vector.
    Shingle {
        digest: Digest,
        flag: u32,
        cmd: Command,
        shingles: Shingles,
    },
}

impl PendingUpdate {
    /// Builds an update owning a full copy of the request payload.
    pub fn from_request(req: &Request) -> Self {
        match req.shingles {
            Some(shingles) => PendingUpdate::Shingle {
                digest: req.digest,
                flag: req.flag,
                cmd: req.cmd,
                shingles,
            },
            None => PendingUpdate::Normal {
                digest: req.digest,
                flag: req.flag,
                cmd: req.cmd,
            },
        }
    }

    /// Synthesized refresh for a confidently matched digest.
    pub fn refresh(digest: Digest, flag: u32, shingles: Option<Shingles>) -> Self {
        match shingles {
            Some(shingles) => PendingUpdate::Shingle {
                digest,
                flag,
                cmd: Command::Refresh,
                shingles,
            },
            None => PendingUpdate::Normal {
                digest,
                flag,
                cmd: Command::Refresh,
            },
        }
    }

    pub fn digest(&self) -> &Digest {
        match self {
            PendingUpdate::Normal { digest, .. } | PendingUpdate::Shingle { digest, .. } => digest,
        }
    }

    pub fn cmd(&self) -> Command {
        match self {
            PendingUpdate::Normal { cmd, .. } | PendingUpdate::Shingle { cmd, .. } => *cmd,
        }
    }

    pub fn flag(&self) -> u32 {
        match self {
            PendingUpdate::Normal { flag, .. } | PendingUpdate::Shingle { flag, .. } => *flag,
        }
    }

    pub fn shingles(&self) -> Option<&Shingles> {
        match self {
            PendingUpdate::Normal { .. } => None,
            PendingUpdate::Shingle { shingles, .. } => Some(shingles),
        }
    }
}

/// A drained batch handed to the backend; owns its updates and hands
/// leftovers back to the queue on failure.
#[derive(Debug)]
pub struct UpdateBatch {
    pub updates: Vec<PendingUpdate>,
    pub source: String,
    pub is_final: bool,
}

/// The leader's authoritative pending queue.
///
/// Followers never construct one; they forward over the peer socket.
#[derive(Debug)]
pub struct UpdateQueue {
    pending: Vec<PendingUpdate>,
    failures: u32,
    maxfail: u32,
}

impl UpdateQueue {
    /// Creates a queue that tolerates `maxfail` consecutive flush
    /// failures before discarding a batch.
    pub fn new(maxfail: u32) -> Self {
        Self {
            pending: Vec::with_capacity(1024),
            failures: 0,
            maxfail,
        }
    }

    /// Appends one update in arrival order.
    pub fn push(&mut self, update: PendingUpdate) {
        self.pending.push(update);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Consecutive flush failures so far.
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Atomically swaps the queue for an empty one and returns the
    /// drained batch, or `None` when there is nothing to flush.
    pub fn take_batch(&mut self, source: &str, is_final: bool) -> Option<UpdateBatch> {
        if self.pending.is_empty() {
            return None;
        }
        let updates = std::mem::take(&mut self.pending);
        Some(UpdateBatch {
            updates,
            source: source.to_string(),
            is_final,
        })
    }

    /// Marks the in-flight batch committed.
    pub fn note_success(&mut self) {
        self.failures = 0;
    }

    /// Handles a failed batch: requeues it ahead of newer updates, or
    /// drops it after `maxfail` consecutive failures. Returns whether
    /// the batch was kept.
    pub fn note_failure(&mut self, batch: UpdateBatch) -> bool {
        self.failures += 1;
        if self.failures > self.maxfail {
            error!(
                discarded = batch.updates.len(),
                retries = self.maxfail,
                source = %batch.source,
                "cannot commit update batch, discarding after repeated failures"
            );
            self.failures = 0;
            return false;
        }

        warn!(
            kept = batch.updates.len(),
            pending = self.pending.len(),
            retries_left = self.maxfail - self.failures,
            "update batch failed, requeueing for retry"
        );
        // Failed updates predate anything queued since the swap.
        let mut updates = batch.updates;
        updates.append(&mut self.pending);
        self.pending = updates;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(byte: u8, cmd: Command) -> PendingUpdate {
        PendingUpdate::Normal {
            digest: [byte; 64],
            flag: 1,
            cmd,
        }
    }

    #[test]
    fn take_batch_swaps_queue() {
        let mut queue = UpdateQueue::new(3);
        queue.push(update(1, Command::Write));
        queue.push(update(2, Command::Delete));

        let batch = queue.take_batch(LOCAL_SOURCE, false).unwrap();
        assert_eq!(batch.updates.len(), 2);
        assert!(queue.is_empty());
        assert!(queue.take_batch(LOCAL_SOURCE, false).is_none());
    }

    #[test]
    fn requeue_preserves_fifo_order() {
        let mut queue = UpdateQueue::new(3);
        queue.push(update(1, Command::Write));
        let batch = queue.take_batch(LOCAL_SOURCE, false).unwrap();

        // Something newer lands while the batch is in flight.
        queue.push(update(2, Command::Write));
        assert!(queue.note_failure(batch));

        let retry = queue.take_batch(LOCAL_SOURCE, false).unwrap();
        assert_eq!(retry.updates[0], update(1, Command::Write));
        assert_eq!(retry.updates[1], update(2, Command::Write));
    }

    #[test]
    fn drops_batch_after_maxfail() {
        let mut queue = UpdateQueue::new(2);

        for round in 0..3 {
            queue.push(update(round, Command::Write));
            let batch = queue.take_batch(LOCAL_SOURCE, false).unwrap();
            let kept = queue.note_failure(batch);
            if round < 2 {
                assert!(kept, "round {round} should requeue");
            } else {
                assert!(!kept, "round 3 should drop");
                assert_eq!(queue.failures(), 0);
            }
        }
    }

    #[test]
    fn success_resets_failure_count() {
        let mut queue = UpdateQueue::new(1);
        queue.push(update(1, Command::Write));
        let batch = queue.take_batch(LOCAL_SOURCE, false).unwrap();
        assert!(queue.note_failure(batch));
        queue.note_success();
        assert_eq!(queue.failures(), 0);
    }

    #[test]
    fn refresh_copies_shingles() {
        let shingles = [7u64; 32];
        let refresh = PendingUpdate::refresh([9; 64], 3, Some(shingles));
        assert_eq!(refresh.cmd(), Command::Refresh);
        assert_eq!(refresh.shingles(), Some(&shingles));
    }
}
