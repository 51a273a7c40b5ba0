// Numihash fuzzy-fingerprint query server library surface.
// Numan Thabit 2026

pub mod config;

pub mod wire;

pub mod crypto;

pub mod prefix;

pub mod limit;

pub mod hooks;

pub mod stats;

pub mod backend;

pub mod queue;

pub mod peer;

pub mod session;

pub mod server;

pub mod metrics;

pub use config::{Config, ConfigError, KeypairConfig};

pub use wire::{
    encode_reply, encode_request, parse_reply, parse_request, Command, DecodedRequest, Digest,
    Epoch, ExtensionKind, Extensions, Reply, Request, Shingles, WireError, BASIC_CMD_LEN,
    DIGEST_LEN, MAX_DATAGRAM_LEN, SHINGLE_CMD_LEN, SHINGLE_COUNT,
};

pub use crypto::{
    aead::{AeadError, AeadKey, TAG_LEN, XCHACHA20_NONCE_LEN},
    exchange::{derive_shared_key, open_request, seal_reply, SecretCache},
    keys::{base32_encode, KeyId, KeyRegistry, ServerKey},
};

pub use prefix::{mask_addr, DigestSet, KeyIdSet, PrefixError, PrefixSet};

pub use limit::{RateLimitParams, RateLimiter};

pub use hooks::{HookError, HookRegistry, HookRequest, HookResult, PostVerdict, PreVerdict};

pub use stats::{GenericStats, GlobalStats, StatsRegistry, StatsSnapshot, KEY_STAT_INTERVAL};

pub use backend::{Backend, BackendError, BackendFactory, CheckResult, MemoryBackend, UpdateSummary};

pub use queue::{PendingUpdate, UpdateBatch, UpdateQueue, LOCAL_SOURCE};

pub use peer::{peer_channel, PeerError, PeerReceiver, PeerSender, PEER_UPDATE_LEN};

pub use session::{now_ts, Session};

pub use server::{
    bind_socket, build_workers, spawn_server, spawn_worker, ControlCommand, ControlReply,
    HandleError, RuntimeConfig, ServerError, Worker, WorkerHandle, RECV_BATCH,
};

pub use metrics::{Metrics, MetricsError};
