// Worker-to-leader update funneling over a datagram socket pair.
// Numan Thabit 2026

use std::io;
use std::os::unix::net::UnixDatagram;

use thiserror::Error;
use tracing::{error, warn};

use crate::queue::{PendingUpdate, UpdateQueue};
use crate::wire::{Command, Digest, Shingles, DIGEST_LEN, SHINGLES_LEN, SHINGLE_COUNT};

/// Fixed size of one update datagram: shingle marker, command, flag,
/// digest, and the (possibly zeroed) shingle area. One datagram
/// carries one full update copy, so no framing is needed.
pub const PEER_UPDATE_LEN: usize = 1 + 1 + 4 + DIGEST_LEN + SHINGLES_LEN;

/// Error raised while decoding a peer datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PeerError {
    /// Datagram size did not match [`PEER_UPDATE_LEN`].
    #[error("peer datagram of {0} bytes, expected {PEER_UPDATE_LEN}")]
    BadLength(usize),
    /// Unknown command byte.
    #[error("peer datagram with unknown command {0}")]
    BadCommand(u8),
}

/// Serializes one pending update into a fixed-size datagram.
pub fn encode_peer_update(update: &PendingUpdate) -> Vec<u8> {
    let mut out = Vec::with_capacity(PEER_UPDATE_LEN);
    out.push(u8::from(update.shingles().is_some()));
    out.push(update.cmd() as u8);
    out.extend_from_slice(&update.flag().to_le_bytes());
    out.extend_from_slice(update.digest());
    match update.shingles() {
        Some(shingles) => {
            for value in shingles {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
        None => out.resize(PEER_UPDATE_LEN, 0),
    }
    out
}

/// Parses a datagram produced by [`encode_peer_update`].
pub fn parse_peer_update(buf: &[u8]) -> Result<PendingUpdate, PeerError> {
    if buf.len() != PEER_UPDATE_LEN {
        return Err(PeerError::BadLength(buf.len()));
    }
    let is_shingle = buf[0] != 0;
    let cmd = Command::try_from(buf[1]).map_err(|_| PeerError::BadCommand(buf[1]))?;
    let flag = u32::from_le_bytes(buf[2..6].try_into().unwrap());
    let mut digest: Digest = [0u8; DIGEST_LEN];
    digest.copy_from_slice(&buf[6..6 + DIGEST_LEN]);

    if is_shingle {
        let mut shingles: Shingles = [0u64; SHINGLE_COUNT];
        for (i, chunk) in buf[6 + DIGEST_LEN..].chunks_exact(8).enumerate() {
            shingles[i] = u64::from_le_bytes(chunk.try_into().unwrap());
        }
        Ok(PendingUpdate::Shingle {
            digest,
            flag,
            cmd,
            shingles,
        })
    } else {
        Ok(PendingUpdate::Normal { digest, flag, cmd })
    }
}

/// Creates the leader/follower socket pair, both ends nonblocking.
pub fn peer_channel() -> io::Result<(PeerReceiver, PeerSender)> {
    let (leader, follower) = UnixDatagram::pair()?;
    leader.set_nonblocking(true)?;
    follower.set_nonblocking(true)?;
    Ok((PeerReceiver::new(leader), PeerSender::new(follower)))
}

/// Follower-side writer: forwards each update as one datagram, with a
/// deferred-send slot for a momentarily full socket buffer.
#[derive(Debug)]
pub struct PeerSender {
    sock: UnixDatagram,
    pending: std::collections::VecDeque<Vec<u8>>,
}

impl PeerSender {
    /// Wraps a nonblocking datagram socket.
    pub fn new(sock: UnixDatagram) -> Self {
        Self {
            sock,
            pending: std::collections::VecDeque::new(),
        }
    }

    /// Clones the sender for another follower worker.
    pub fn try_clone(&self) -> io::Result<Self> {
        Ok(Self::new(self.sock.try_clone()?))
    }

    /// Forwards one update to the leader, deferring when the socket
    /// would block.
    pub fn forward(&mut self, update: &PendingUpdate) {
        let frame = encode_peer_update(update);
        if self.pending.is_empty() {
            match self.try_send(&frame) {
                Ok(true) => return,
                Ok(false) => {}
                Err(err) => {
                    error!(error = %err, "cannot send update to the leader");
                    return;
                }
            }
        }
        self.pending.push_back(frame);
    }

    /// Retries deferred datagrams; called when the loop next drives.
    pub fn flush(&mut self) {
        while let Some(frame) = self.pending.front() {
            match self.try_send(frame) {
                Ok(true) => {
                    self.pending.pop_front();
                }
                Ok(false) => break,
                Err(err) => {
                    error!(error = %err, "cannot send update to the leader, dropping");
                    self.pending.pop_front();
                }
            }
        }
    }

    /// Number of deferred datagrams.
    pub fn backlog(&self) -> usize {
        self.pending.len()
    }

    fn try_send(&self, frame: &[u8]) -> io::Result<bool> {
        loop {
            match self.sock.send(frame) {
                Ok(n) if n == frame.len() => return Ok(true),
                Ok(n) => {
                    warn!(sent = n, expected = frame.len(), "short peer datagram write");
                    return Ok(true);
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

/// Leader-side reader: drains fan-in datagrams into the update queue.
#[derive(Debug)]
pub struct PeerReceiver {
    sock: UnixDatagram,
}

impl PeerReceiver {
    /// Wraps a nonblocking datagram socket.
    pub fn new(sock: UnixDatagram) -> Self {
        Self { sock }
    }

    /// Reads every available datagram, appending decoded updates to
    /// the queue in arrival order. Returns how many were accepted.
    pub fn drain(&mut self, queue: &mut UpdateQueue) -> usize {
        let mut buf = [0u8; PEER_UPDATE_LEN + 1];
        let mut accepted = 0;
        loop {
            match self.sock.recv(&mut buf) {
                Ok(len) => match parse_peer_update(&buf[..len]) {
                    Ok(update) => {
                        queue.push(update);
                        accepted += 1;
                    }
                    Err(err) => warn!(error = %err, "discarding malformed peer datagram"),
                },
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    error!(error = %err, "cannot read from the peer socket");
                    break;
                }
            }
        }
        accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_update(shingles: bool) -> PendingUpdate {
        if shingles {
            PendingUpdate::Shingle {
                digest: [0xA1; 64],
                flag: 6,
                cmd: Command::Write,
                shingles: std::array::from_fn(|i| (i as u64) << 3),
            }
        } else {
            PendingUpdate::Normal {
                digest: [0xB2; 64],
                flag: 2,
                cmd: Command::Refresh,
            }
        }
    }

    #[test]
    fn datagram_round_trip() {
        for shingles in [false, true] {
            let update = sample_update(shingles);
            let frame = encode_peer_update(&update);
            assert_eq!(frame.len(), PEER_UPDATE_LEN);
            assert_eq!(parse_peer_update(&frame).unwrap(), update);
        }
    }

    #[test]
    fn short_datagram_rejected() {
        assert_eq!(
            parse_peer_update(&[0u8; 10]),
            Err(PeerError::BadLength(10))
        );
    }

    #[test]
    fn follower_to_leader_fan_in() {
        let (mut receiver, mut sender) = peer_channel().unwrap();
        let mut queue = UpdateQueue::new(3);

        let update = sample_update(true);
        sender.forward(&update);
        assert_eq!(sender.backlog(), 0);

        // Exactly one datagram of the fixed size arrives.
        assert_eq!(receiver.drain(&mut queue), 1);
        assert_eq!(queue.len(), 1);
        let batch = queue.take_batch("local", false).unwrap();
        assert_eq!(batch.updates[0], update);
    }

    #[test]
    fn cloned_senders_share_the_leader() {
        let (mut receiver, sender) = peer_channel().unwrap();
        let mut first = sender.try_clone().unwrap();
        let mut second = sender.try_clone().unwrap();
        let mut queue = UpdateQueue::new(3);

        first.forward(&sample_update(false));
        second.forward(&sample_update(true));

        assert_eq!(receiver.drain(&mut queue), 2);
        assert_eq!(queue.len(), 2);
    }
}
