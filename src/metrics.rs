// Numan Thabit 2026
// metrics.rs - Prometheus counters for the request pipeline
use prometheus::{IntCounter, IntGauge, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub requests_total: IntCounter,
    pub invalid_requests: IntCounter,
    pub decrypt_failures: IntCounter,
    pub blocklist_drops: IntCounter,
    pub ratelimit_rejects: IntCounter,
    pub replies_delayed: IntCounter,
    pub replies_censored: IntCounter,
    pub replies_deferred: IntCounter,
    pub reply_errors: IntCounter,
    pub backend_errors: IntCounter,
    pub updates_flushed: IntCounter,
    pub updates_requeued: IntCounter,
    pub updates_dropped: IntCounter,
    pub peer_forwarded: IntCounter,
    pub pending_updates: IntGauge,
    pub stored_hashes: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("numihash".into()), None)?;

        macro_rules! register_counter {
            ($name:expr, $help:expr) => {{
                let counter = IntCounter::new($name, $help)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        macro_rules! register_gauge {
            ($name:expr, $help:expr) => {{
                let gauge = IntGauge::new($name, $help)?;
                registry.register(Box::new(gauge.clone()))?;
                gauge
            }};
        }

        let requests_total = register_counter!("requests_total", "Datagrams accepted for processing");
        let invalid_requests =
            register_counter!("invalid_requests", "Datagrams that failed to decode");
        let decrypt_failures =
            register_counter!("decrypt_failures", "Encrypted requests that failed to open");
        let blocklist_drops =
            register_counter!("blocklist_drops", "Datagrams dropped by the blocklist");
        let ratelimit_rejects =
            register_counter!("ratelimit_rejects", "Check requests rejected by rate limiting");
        let replies_delayed =
            register_counter!("replies_delayed", "Replies censored by the freshness delay");
        let replies_censored = register_counter!(
            "replies_censored",
            "Replies blanked by a per-key forbidden flag"
        );
        let replies_deferred = register_counter!(
            "replies_deferred",
            "Replies parked for a write-readiness retry"
        );
        let reply_errors = register_counter!("reply_errors", "Replies dropped on send errors");
        let backend_errors = register_counter!("backend_errors", "Backend lookup failures");
        let updates_flushed =
            register_counter!("updates_flushed", "Updates committed to the backend");
        let updates_requeued =
            register_counter!("updates_requeued", "Updates requeued after a failed flush");
        let updates_dropped = register_counter!(
            "updates_dropped",
            "Updates discarded after repeated flush failures"
        );
        let peer_forwarded =
            register_counter!("peer_forwarded", "Updates forwarded to the leader worker");
        let pending_updates = register_gauge!("pending_updates", "Updates waiting for a flush");
        let stored_hashes = register_gauge!("stored_hashes", "Entries reported by the backend");

        Ok(Self {
            registry,
            requests_total,
            invalid_requests,
            decrypt_failures,
            blocklist_drops,
            ratelimit_rejects,
            replies_delayed,
            replies_censored,
            replies_deferred,
            reply_errors,
            backend_errors,
            updates_flushed,
            updates_requeued,
            updates_dropped,
            peer_forwarded,
            pending_updates,
            stored_hashes,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}
