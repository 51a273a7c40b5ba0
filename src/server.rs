// Worker reactor: socket loop, request pipeline, and update flushing.
// Numan Thabit 2026

use std::collections::VecDeque;
use std::io;
#[cfg(target_os = "linux")]
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendError, BackendFactory};
use crate::config::{Config, ConfigError};
use crate::crypto::{self, keys::KeyRegistry, SecretCache};
use crate::hooks::{HookRegistry, HookResult};
use crate::limit::RateLimiter;
use crate::metrics::{Metrics, MetricsError};
use crate::peer::{self, PeerReceiver, PeerSender};
use crate::prefix::{DigestSet, KeyIdSet, PrefixSet};
use crate::queue::{PendingUpdate, UpdateQueue, LOCAL_SOURCE};
use crate::session::{jittered_delay, now_ts, Session};
use crate::stats::{StatsRegistry, StatsSnapshot};
use crate::wire::{self, Command, Reply, WireError, MAX_DATAGRAM_LEN};

/// Datagrams received per batch; matches the kernel fan-out the
/// batched receive syscall can return in one call.
pub const RECV_BATCH: usize = 16;

/// Receive passes per drive tick before yielding back to the loop.
const MAX_PASSES_PER_DRIVE: usize = 4;

/// Server construction and runtime errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

/// Out-of-band admin operations, delivered through the worker's
/// command channel rather than the UDP port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Close and reopen the backend.
    Reload,
    /// Flush the update queue immediately.
    Sync,
    /// Serialize the statistics snapshot into an unlinked temp file.
    Stat,
}

/// Control command outcome.
#[derive(Debug)]
pub enum ControlReply {
    /// Command completed; zero status is success.
    Done { status: i32 },
    /// Snapshot file, rewound and ready to read.
    Stat { file: std::fs::File },
}

/// Binds a nonblocking UDP socket with SO_REUSEPORT so every worker
/// shares the listening address and the kernel distributes load.
pub fn bind_socket(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

#[derive(Debug)]
struct PendingReply {
    frame: Bytes,
    addr: SocketAddr,
}

/// One single-threaded worker: socket reactor, pipeline state, and
/// (on the leader) the authoritative update queue.
///
/// Nothing in here crosses a worker boundary by reference; the only
/// cross-worker channel is the peer datagram socket.
pub struct Worker {
    index: usize,
    socket: Option<UdpSocket>,
    running: bool,
    nconns: u64,
    sync_period: f64,

    encrypted_only: bool,
    read_only: bool,
    delay: Option<f64>,
    ratelimit_log_only: bool,
    blocked: PrefixSet,
    update_ips: PrefixSet,
    update_keys: KeyIdSet,
    skip_hashes: DigestSet,
    delay_whitelist: PrefixSet,

    keys: KeyRegistry,
    secrets: SecretCache,
    limiter: Option<RateLimiter>,
    hooks: HookRegistry,
    stats: StatsRegistry,
    metrics: Arc<Metrics>,
    backend: Box<dyn Backend>,
    factory: BackendFactory,

    queue: Option<UpdateQueue>,
    peer_rx: Option<PeerReceiver>,
    peer_tx: Option<PeerSender>,

    pending_replies: VecDeque<PendingReply>,
    recv_bufs: Vec<Vec<u8>>,
}

impl Worker {
    /// Assembles a worker from its parts. Worker 0 is the leader and
    /// owns the update queue; everyone else forwards via `peer_tx`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        cfg: &Config,
        socket: Option<UdpSocket>,
        mut backend: Box<dyn Backend>,
        factory: BackendFactory,
        metrics: Arc<Metrics>,
        peer_rx: Option<PeerReceiver>,
        peer_tx: Option<PeerSender>,
    ) -> Result<Self, ServerError> {
        let limiter = cfg
            .ratelimit_params()
            .map(|params| -> Result<RateLimiter, ServerError> {
                Ok(RateLimiter::new(params, cfg.ratelimit_whitelist_set()?))
            })
            .transpose()?;

        let mut stats = StatsRegistry::new();
        if let Ok(count) = backend.count() {
            stats.global.stored = count;
            metrics.stored_hashes.set(count as i64);
        }

        Ok(Self {
            index,
            socket,
            running: true,
            nconns: 0,
            sync_period: cfg.sync,
            encrypted_only: cfg.encrypted_only,
            read_only: cfg.read_only,
            delay: cfg.delay,
            ratelimit_log_only: cfg.ratelimit_log_only,
            blocked: cfg.blocked_set()?,
            update_ips: cfg.allow_update_set()?,
            update_keys: cfg.allow_update_key_set(),
            skip_hashes: cfg.skip_hash_set(),
            delay_whitelist: cfg.delay_whitelist_set()?,
            keys: cfg.build_keys()?,
            secrets: SecretCache::new(cfg.keypair_cache_size),
            limiter,
            hooks: HookRegistry::new(),
            stats,
            metrics,
            backend,
            factory,
            queue: (index == 0).then(|| UpdateQueue::new(cfg.updates_maxfail)),
            peer_rx,
            peer_tx,
            pending_replies: VecDeque::new(),
            recv_bufs: (0..RECV_BATCH).map(|_| vec![0u8; MAX_DATAGRAM_LEN]).collect(),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Flush period in seconds, as configured.
    pub fn sync_period(&self) -> f64 {
        self.sync_period
    }

    /// Requests handled since startup.
    pub fn connections(&self) -> u64 {
        self.nconns
    }

    /// Updates waiting for the next flush (leader only).
    pub fn pending_updates(&self) -> usize {
        self.queue.as_ref().map_or(0, UpdateQueue::len)
    }

    /// Statistics registry, for snapshots and tests.
    pub fn stats(&self) -> &StatsRegistry {
        &self.stats
    }

    /// Hook slots; installed before the worker starts serving.
    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    /// One cooperative pass: retries deferred sends, drains peer
    /// fan-in, then receives and processes client datagrams.
    pub fn drive(&mut self) {
        self.drive_at(now_ts());
    }

    /// [`Worker::drive`] with an explicit timestamp, for tests.
    pub fn drive_at(&mut self, now: f64) {
        self.flush_pending_replies();
        if let Some(tx) = &mut self.peer_tx {
            tx.flush();
        }
        if let (Some(rx), Some(queue)) = (&mut self.peer_rx, &mut self.queue) {
            rx.drain(queue);
        }

        let mut bufs = std::mem::take(&mut self.recv_bufs);
        for _ in 0..MAX_PASSES_PER_DRIVE {
            let received = {
                let Some(socket) = &self.socket else { break };
                match recv_batch(socket, &mut bufs) {
                    Ok(received) => received,
                    Err(err) => {
                        error!(error = %err, "got error while reading from socket");
                        break;
                    }
                }
            };
            if received.is_empty() {
                break;
            }
            let full_batch = received.len() == RECV_BATCH;
            for (idx, len, addr) in received {
                self.handle_datagram(&bufs[idx][..len], addr, now);
            }
            if !full_batch {
                break;
            }
        }
        self.recv_bufs = bufs;

        self.metrics
            .pending_updates
            .set(self.pending_updates() as i64);
    }

    /// Periodic tick: leader flushes the queue; every worker refreshes
    /// the stored-entry gauge from the backend.
    pub fn sync_tick(&mut self) {
        if self.queue.is_some() {
            self.flush_updates(false);
        }
        match self.backend.count() {
            Ok(count) => {
                self.stats.global.stored = count;
                self.metrics.stored_hashes.set(count as i64);
            }
            Err(err) => debug!(error = %err, "backend count failed"),
        }
    }

    /// Handles one admin command.
    pub fn control(&mut self, cmd: ControlCommand) -> ControlReply {
        match cmd {
            ControlCommand::Sync => {
                if self.queue.is_some() {
                    self.flush_updates(false);
                }
                ControlReply::Done { status: 0 }
            }
            ControlCommand::Reload => {
                info!("reloading fingerprint storage after reload command");
                self.backend.close();
                match (self.factory)() {
                    Ok(backend) => {
                        self.backend = backend;
                        if let Ok(count) = self.backend.count() {
                            self.stats.global.stored = count;
                            self.metrics.stored_hashes.set(count as i64);
                        }
                        ControlReply::Done { status: 0 }
                    }
                    Err(err) => {
                        error!(error = %err, "cannot open backend after reload");
                        ControlReply::Done { status: 1 }
                    }
                }
            }
            ControlCommand::Stat => {
                let snapshot = self.stats.snapshot(&self.keys, true);
                match write_snapshot(&snapshot) {
                    Ok(file) => ControlReply::Stat { file },
                    Err(err) => {
                        error!(error = %err, "cannot write statistics snapshot");
                        ControlReply::Done { status: 1 }
                    }
                }
            }
        }
    }

    /// Shutdown path: the leader runs a final flush cycle for any
    /// pending updates, then the backend is closed.
    pub fn finalize(&mut self) {
        if self.queue.as_ref().is_some_and(|q| !q.is_empty()) {
            info!("running final update sync before exit");
            self.flush_updates(true);
        }
        self.backend.close();
    }

    /// Full pipeline for one datagram. Public so tests can drive the
    /// worker with a fixed clock.
    pub fn handle_datagram(&mut self, buf: &[u8], addr: Option<SocketAddr>, now: f64) {
        if let Some(ip) = addr.map(|a| a.ip()) {
            if self.blocked.contains(ip) {
                self.metrics.blocklist_drops.inc();
                self.hooks.notify_blacklist(Some(ip), "blacklisted");
                return;
            }
        }

        let session = match self.decode_session(buf, addr, now) {
            Ok(session) => session,
            Err(err) => {
                debug!(len = buf.len(), error = %err, "invalid request received");
                self.metrics.invalid_requests.inc();
                self.stats.note_invalid(addr.map(|a| a.ip()));
                return;
            }
        };

        self.metrics.requests_total.inc();
        self.nconns += 1;
        self.process_session(session, now);
    }

    fn decode_session(
        &mut self,
        buf: &[u8],
        addr: Option<SocketAddr>,
        now: f64,
    ) -> Result<Session, WireError> {
        if !wire::is_encrypted(buf) {
            return Ok(Session::new(wire::parse_request(buf)?, addr, now));
        }

        let (header, body) = wire::split_encrypted(buf)?;
        let Some(key) = self.keys.resolve(&header.key_id).cloned() else {
            warn!("received encrypted request when encryption is not enabled");
            return Err(WireError::UnknownEncryption);
        };

        let shared = self.secrets.shared_key(&key, &header.pubkey);
        let plain = match crypto::open_request(&shared, &header, body) {
            Ok(plain) => plain,
            Err(_) => {
                self.metrics.decrypt_failures.inc();
                warn!(client = ?addr, "decryption failed");
                return Err(WireError::UnknownEncryption);
            }
        };

        let mut session = Session::new(wire::parse_request(&plain)?, addr, now);
        session.key = Some(key);
        session.shared = Some(shared);
        Ok(session)
    }

    fn process_session(&mut self, session: Session, now: f64) {
        if self.encrypted_only && !session.is_encrypted() {
            let mut reply = session.reply_template();
            reply.value = 403;
            return self.finish(session, reply, false);
        }

        // Admission, per command class.
        match session.request.cmd {
            Command::Check => {
                if !self.admit_check(&session, now) {
                    let mut reply = session.reply_template();
                    reply.value = 403;
                    reply.flag = 0;
                    return self.finish(session, reply, false);
                }
            }
            cmd if cmd.is_write() => {
                if !self.write_allowed(&session) {
                    let mut reply = session.reply_template();
                    reply.value = 403;
                    return self.finish(session, reply, false);
                }
                if cmd == Command::Write && self.skip_hashes.contains(&session.request.digest) {
                    let mut reply = session.reply_template();
                    reply.value = 401;
                    return self.finish(session, reply, false);
                }
            }
            _ => {}
        }

        if let Some(verdict) = self.hooks.run_pre(&session.hook_request()) {
            let mut reply = session.reply_template();
            reply.value = verdict.value;
            reply.prob = verdict.prob;
            return self.finish(session, reply, false);
        }

        match session.request.cmd {
            Command::Check => self.dispatch_check(session, now),
            Command::Stat => {
                let mut reply = session.reply_template();
                reply.prob = 1.0;
                reply.value = 0;
                reply.flag = self.stats.global.stored as u32;
                self.finish(session, reply, false);
            }
            _ => {
                self.submit_update(PendingUpdate::from_request(&session.request));
                let mut reply = session.reply_template();
                reply.value = 0;
                reply.prob = 1.0;
                self.finish(session, reply, false);
            }
        }
    }

    fn admit_check(&mut self, session: &Session, now: f64) -> bool {
        let Some(limiter) = &mut self.limiter else {
            return true;
        };
        let Some(ip) = session.client_ip() else {
            return true;
        };
        let allowed = limiter.check(ip, now);
        if !allowed {
            self.metrics.ratelimit_rejects.inc();
            self.hooks.notify_blacklist(Some(ip), "ratelimit");
        }
        allowed || self.ratelimit_log_only
    }

    fn write_allowed(&self, session: &Session) -> bool {
        if self.read_only {
            return false;
        }
        // Local transports are trusted.
        let Some(ip) = session.client_ip() else {
            return true;
        };
        if self.update_ips.contains(ip) {
            return true;
        }
        if let Some(key) = &session.key {
            if self.update_keys.contains(&key.id()) {
                return true;
            }
        }
        false
    }

    fn dispatch_check(&mut self, session: Session, now: f64) {
        let result = match self
            .backend
            .check(&session.request.digest, session.request.shingles.as_ref())
        {
            Ok(result) => result,
            Err(err) => {
                error!(error = %err, "backend check failed");
                self.metrics.backend_errors.inc();
                let mut reply = session.reply_template();
                reply.value = 500;
                return self.finish(session, reply, false);
            }
        };

        if let Some(verdict) = self.hooks.run_post(
            &session.hook_request(),
            HookResult {
                value: result.value,
                prob: result.prob,
                flag: result.flag,
                ts: result.ts,
            },
        ) {
            let mut reply = session.reply_template();
            reply.value = verdict.value;
            reply.prob = verdict.prob;
            reply.flag = verdict.flag.unwrap_or(result.flag);
            reply.ts = result.ts;
            return self.finish(session, reply, false);
        }

        let mut delayed = false;
        if let Some(delay) = self.delay {
            let exempt = session
                .client_ip()
                .is_some_and(|ip| self.delay_whitelist.contains(ip));
            if !exempt {
                let hash_age = now - result.ts as f64;
                if hash_age < jittered_delay(delay) {
                    delayed = true;
                }
            }
        }

        // A confident hit refreshes the entry through the normal
        // update path.
        if result.prob > 0.9 && !self.read_only {
            let refresh =
                PendingUpdate::refresh(result.digest, result.flag, session.request.shingles);
            self.submit_update(refresh);
        }

        let mut reply = session.reply_template();
        reply.value = result.value;
        reply.prob = result.prob;
        reply.flag = result.flag;
        reply.ts = result.ts;
        self.finish(session, reply, delayed);
    }

    /// Reply tail shared by every path: statistics, censoring,
    /// encoding, and the single send attempt.
    fn finish(&mut self, session: Session, reply: Reply, delayed: bool) {
        let key_id = session.key.as_ref().map(|k| k.id());
        self.stats.update_request(
            key_id.as_ref(),
            session.client_ip(),
            session.epoch,
            session.request.cmd,
            reply.prob > 0.5,
            session.is_shingle(),
            delayed,
            reply.value,
            session.timestamp,
        );
        if delayed {
            self.metrics.replies_delayed.inc();
        }

        let (frame, censored) = match session.encode_reply(reply, delayed) {
            Ok(encoded) => encoded,
            Err(err) => {
                error!(error = %err, "cannot seal reply");
                return;
            }
        };
        if censored {
            self.metrics.replies_censored.inc();
        }

        let Some(addr) = session.addr else { return };
        self.send_reply(Bytes::from(frame), addr);
    }

    fn send_reply(&mut self, frame: Bytes, addr: SocketAddr) {
        let send_result = {
            let Some(socket) = &self.socket else { return };
            socket.send_to(&frame, addr)
        };
        match send_result {
            Ok(_) => {}
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                // Park the reply; the next drive pass completes it.
                self.metrics.replies_deferred.inc();
                self.pending_replies.push_back(PendingReply { frame, addr });
            }
            Err(err) => {
                self.metrics.reply_errors.inc();
                error!(error = %err, "error while writing reply");
            }
        }
    }

    fn flush_pending_replies(&mut self) {
        while let Some(pending) = self.pending_replies.pop_front() {
            let send_result = {
                let Some(socket) = &self.socket else { return };
                socket.send_to(&pending.frame, pending.addr)
            };
            match send_result {
                Ok(_) => {}
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) =>
                {
                    self.pending_replies.push_front(pending);
                    break;
                }
                Err(err) => {
                    self.metrics.reply_errors.inc();
                    error!(error = %err, "error while writing deferred reply");
                }
            }
        }
    }

    fn submit_update(&mut self, update: PendingUpdate) {
        if let Some(queue) = &mut self.queue {
            queue.push(update);
            self.metrics.pending_updates.set(queue.len() as i64);
        } else if let Some(tx) = &mut self.peer_tx {
            tx.forward(&update);
            self.metrics.peer_forwarded.inc();
        }
    }

    fn flush_updates(&mut self, is_final: bool) {
        let Some(queue) = self.queue.as_mut() else {
            if is_final {
                self.running = false;
            }
            return;
        };
        let Some(batch) = queue.take_batch(LOCAL_SOURCE, is_final) else {
            if is_final {
                self.running = false;
            }
            return;
        };

        match self.backend.process_updates(&batch.updates, &batch.source) {
            Ok(summary) => {
                info!(
                    updates = batch.updates.len(),
                    added = summary.added,
                    deleted = summary.deleted,
                    extended = summary.extended,
                    ignored = summary.ignored,
                    "successfully committed update batch"
                );
                self.metrics
                    .updates_flushed
                    .inc_by(batch.updates.len() as u64);
                queue.note_success();

                if let Ok(count) = self.backend.count() {
                    self.stats.global.stored = count;
                    self.metrics.stored_hashes.set(count as i64);
                }
                if let Err(err) = self.backend.version(&batch.source) {
                    debug!(error = %err, "backend version query failed");
                }
                if batch.is_final {
                    self.running = false;
                }
            }
            Err(err) => {
                error!(error = %err, "cannot commit update batch");
                let final_batch = batch.is_final;
                let batch_len = batch.updates.len() as u64;
                if queue.note_failure(batch) {
                    self.metrics.updates_requeued.inc_by(batch_len);
                } else {
                    self.metrics.updates_dropped.inc_by(batch_len);
                }

                if final_batch {
                    // One last synchronous retry before exit.
                    if let Some(retry) = queue.take_batch(LOCAL_SOURCE, true) {
                        match self.backend.process_updates(&retry.updates, &retry.source) {
                            Ok(_) => queue.note_success(),
                            Err(err) => {
                                error!(
                                    error = %err,
                                    discarded = retry.updates.len(),
                                    "final retry failed, updates are lost"
                                );
                            }
                        }
                    }
                    self.running = false;
                }
            }
        }

        self.metrics
            .pending_updates
            .set(self.pending_updates() as i64);
    }
}

fn write_snapshot(snapshot: &StatsSnapshot) -> io::Result<std::fs::File> {
    use std::io::Seek;

    let mut file = tempfile::tempfile()?;
    serde_json::to_writer(&mut file, snapshot).map_err(io::Error::other)?;
    file.seek(io::SeekFrom::Start(0))?;
    Ok(file)
}

#[cfg(target_os = "linux")]
fn sockaddr_to_std(
    storage: &libc::sockaddr_storage,
    namelen: libc::socklen_t,
) -> Option<SocketAddr> {
    if (namelen as usize) < std::mem::size_of::<libc::sa_family_t>() {
        return None;
    }
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sin.sin_port)))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sin6.sin6_port)))
        }
        _ => None,
    }
}

/// Batched receive: up to [`RECV_BATCH`] datagrams in one syscall.
/// Returns (buffer index, length, source address) triples.
#[cfg(target_os = "linux")]
fn recv_batch(
    socket: &UdpSocket,
    bufs: &mut [Vec<u8>],
) -> io::Result<Vec<(usize, usize, Option<SocketAddr>)>> {
    use std::os::fd::AsRawFd;

    let count = bufs.len();
    let mut iovecs: Vec<libc::iovec> = bufs
        .iter_mut()
        .map(|buf| libc::iovec {
            iov_base: buf.as_mut_ptr().cast(),
            iov_len: buf.len(),
        })
        .collect();
    let mut addrs: Vec<libc::sockaddr_storage> = vec![unsafe { std::mem::zeroed() }; count];
    let mut msgs: Vec<libc::mmsghdr> = Vec::with_capacity(count);
    for i in 0..count {
        let mut hdr: libc::msghdr = unsafe { std::mem::zeroed() };
        hdr.msg_name = (&mut addrs[i] as *mut libc::sockaddr_storage).cast();
        hdr.msg_namelen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        hdr.msg_iov = &mut iovecs[i];
        hdr.msg_iovlen = 1;
        msgs.push(libc::mmsghdr {
            msg_hdr: hdr,
            msg_len: 0,
        });
    }

    let received = unsafe {
        libc::recvmmsg(
            socket.as_raw_fd(),
            msgs.as_mut_ptr(),
            count as libc::c_uint,
            libc::MSG_DONTWAIT,
            std::ptr::null_mut(),
        )
    };
    if received < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(Vec::new()),
            _ => Err(err),
        };
    }

    let mut out = Vec::with_capacity(received as usize);
    for (i, msg) in msgs.iter().take(received as usize).enumerate() {
        out.push((
            i,
            msg.msg_len as usize,
            sockaddr_to_std(&addrs[i], msg.msg_hdr.msg_namelen),
        ));
    }
    Ok(out)
}

/// Portable fallback: one datagram per syscall, up to the batch size.
#[cfg(not(target_os = "linux"))]
fn recv_batch(
    socket: &UdpSocket,
    bufs: &mut [Vec<u8>],
) -> io::Result<Vec<(usize, usize, Option<SocketAddr>)>> {
    let mut out = Vec::new();
    for (idx, buf) in bufs.iter_mut().enumerate() {
        match socket.recv_from(buf) {
            Ok((len, addr)) => out.push((idx, len, Some(addr))),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(out)
}

/// Builds the full worker set: shared listening sockets, the peer
/// socket pair, and one backend per worker.
pub fn build_workers(cfg: &Config, factory: BackendFactory) -> Result<Vec<Worker>, ServerError> {
    cfg.validate()?;
    let bind_addr: SocketAddr = cfg.bind.parse().map_err(|_| {
        ConfigError::Validation(format!("invalid bind address '{}'", cfg.bind))
    })?;

    let first = bind_socket(bind_addr)?;
    let local = first.local_addr()?;
    info!(addr = %local, workers = cfg.workers, "start listening");

    let mut sockets: Vec<Option<UdpSocket>> = vec![Some(first)];
    for _ in 1..cfg.workers {
        sockets.push(Some(bind_socket(local)?));
    }
    if cfg.dedicated_update_worker && cfg.workers > 1 {
        info!("stop serving client requests in dedicated update mode");
        sockets[0] = None;
    }

    let metrics = Arc::new(Metrics::new()?);
    let (mut peer_rx, peer_tx) = if cfg.workers > 1 {
        let (rx, tx) = peer::peer_channel()?;
        (Some(rx), Some(tx))
    } else {
        (None, None)
    };

    let mut workers = Vec::with_capacity(cfg.workers);
    for (index, socket) in sockets.into_iter().enumerate() {
        let backend = (factory)()?;
        let worker_tx = if index == 0 {
            None
        } else {
            Some(
                peer_tx
                    .as_ref()
                    .expect("peer channel exists with multiple workers")
                    .try_clone()?,
            )
        };
        workers.push(Worker::new(
            index,
            cfg,
            socket,
            backend,
            Arc::clone(&factory),
            Arc::clone(&metrics),
            if index == 0 { peer_rx.take() } else { None },
            worker_tx,
        )?);
    }
    Ok(workers)
}

/// Parameters for the tick-driven worker task.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Interval between drive passes.
    pub tick: Duration,
    /// Capacity of the command channel.
    pub command_buffer: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(5),
            command_buffer: 64,
        }
    }
}

#[derive(Debug)]
enum WorkerCommand {
    Control(ControlCommand, oneshot::Sender<ControlReply>),
    Shutdown,
}

/// Errors surfaced by [`WorkerHandle`] operations.
#[derive(Debug, Error)]
pub enum HandleError {
    #[error("worker command channel closed")]
    ChannelClosed,
    #[error("worker stopped before replying")]
    WorkerStopped,
    #[error("worker task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// Handle to a spawned worker task.
#[derive(Debug)]
pub struct WorkerHandle {
    index: usize,
    commands: mpsc::Sender<WorkerCommand>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Sends an admin command and awaits its reply.
    pub async fn control(&self, cmd: ControlCommand) -> Result<ControlReply, HandleError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(WorkerCommand::Control(cmd, tx))
            .await
            .map_err(|_| HandleError::ChannelClosed)?;
        rx.await.map_err(|_| HandleError::WorkerStopped)
    }

    /// Stops the worker and waits for its final flush cycle.
    pub async fn shutdown(self) -> Result<(), HandleError> {
        let _ = self.commands.send(WorkerCommand::Shutdown).await;
        self.join.await.map_err(HandleError::Join)
    }
}

/// Launches one worker as a tick-driven task on the current runtime.
pub fn spawn_worker(mut worker: Worker, config: RuntimeConfig) -> WorkerHandle {
    let (commands, mut rx) = mpsc::channel(config.command_buffer.max(1));
    let index = worker.index();
    let sync_period = Duration::from_secs_f64(worker.sync_period().max(0.001));

    let join = tokio::spawn(async move {
        let mut tick = time::interval(config.tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sync = time::interval(sync_period);
        sync.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = tick.tick() => worker.drive(),
                _ = sync.tick() => worker.sync_tick(),
                cmd = rx.recv() => match cmd {
                    Some(WorkerCommand::Control(cmd, reply)) => {
                        let _ = reply.send(worker.control(cmd));
                    }
                    Some(WorkerCommand::Shutdown) | None => break,
                },
            }
            if !worker.is_running() {
                break;
            }
        }
        worker.finalize();
        debug!(index, "worker stopped");
    });

    WorkerHandle {
        index,
        commands,
        join,
    }
}

/// Builds and spawns every worker; the caller keeps the handles.
pub fn spawn_server(
    cfg: &Config,
    factory: BackendFactory,
    runtime: RuntimeConfig,
) -> Result<Vec<WorkerHandle>, ServerError> {
    Ok(build_workers(cfg, factory)?
        .into_iter()
        .map(|worker| spawn_worker(worker, runtime.clone()))
        .collect())
}
