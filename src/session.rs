// Per-request session state and reply assembly.
// Numan Thabit 2026

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::crypto::{aead::AeadKey, exchange, keys::ServerKey, AeadError};
use crate::hooks::HookRequest;
use crate::wire::{self, DecodedRequest, Epoch, Extensions, Reply, Request};

/// Wall-clock seconds, the timestamp domain shared with stored
/// entries.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Jittered freshness threshold: somewhere in [delay, 1.5 * delay).
pub fn jittered_delay(delay: f64) -> f64 {
    delay + rand::random::<f64>() * (delay / 2.0)
}

/// One in-flight request; owns the decoded command, the resolved key
/// reference, and the shared secret when the request was encrypted.
pub struct Session {
    pub epoch: Epoch,
    pub request: Request,
    pub extensions: Extensions,
    /// Client address; `None` for local transports, which are always
    /// allowed to write.
    pub addr: Option<SocketAddr>,
    /// Key resolved from the encrypted header.
    pub key: Option<Arc<ServerKey>>,
    /// Shared AEAD key for sealing the reply.
    pub shared: Option<AeadKey>,
    /// Receive timestamp, wall-clock seconds.
    pub timestamp: f64,
}

impl Session {
    /// Builds a session from a decoded plaintext or decrypted frame.
    pub fn new(decoded: DecodedRequest, addr: Option<SocketAddr>, timestamp: f64) -> Self {
        Self {
            epoch: decoded.epoch,
            request: decoded.request,
            extensions: decoded.extensions,
            addr,
            key: None,
            shared: None,
            timestamp,
        }
    }

    /// True when the request arrived encrypted.
    pub fn is_encrypted(&self) -> bool {
        self.shared.is_some()
    }

    /// Whether the request carried a shingle vector.
    pub fn is_shingle(&self) -> bool {
        self.request.shingles.is_some()
    }

    /// Client IP, when the transport has one.
    pub fn client_ip(&self) -> Option<IpAddr> {
        self.addr.map(|a| a.ip())
    }

    /// Arguments marshalled for the pre/post hooks.
    pub fn hook_request(&self) -> HookRequest<'_> {
        HookRequest {
            addr: self.client_ip(),
            cmd: self.request.cmd,
            digest: &self.request.digest,
            is_shingle: self.is_shingle(),
            extensions: &self.extensions,
        }
    }

    /// A reply skeleton echoing the request tag and flag.
    pub fn reply_template(&self) -> Reply {
        Reply {
            tag: self.request.tag,
            flag: self.request.flag,
            ..Reply::default()
        }
    }

    /// Finalizes a reply into wire bytes.
    ///
    /// Applies the delay censor, then the per-key forbidden-flag
    /// censor (encrypted replies only), then encodes for the session
    /// epoch and seals when the request was encrypted. Returns the
    /// frame and whether the forbidden censor fired.
    pub fn encode_reply(
        &self,
        mut reply: Reply,
        delayed: bool,
    ) -> Result<(Vec<u8>, bool), AeadError> {
        if delayed {
            reply.censor_delay();
        }

        let mut censored = false;
        if self.is_encrypted() {
            if let Some(key) = &self.key {
                if reply.prob > 0.0 && key.is_forbidden(reply.flag) {
                    reply.censor_forbidden();
                    censored = true;
                }
            }
        }

        let payload = wire::encode_reply(&reply, self.epoch);
        let frame = match &self.shared {
            Some(shared) => exchange::seal_reply(shared, &payload)?,
            None => payload,
        };
        Ok((frame, censored))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{Command, REPLY_ENC_HDR_LEN, REPLY_LEN, REPLY_V1_LEN};

    fn session(epoch: Epoch, key: Option<Arc<ServerKey>>, shared: Option<AeadKey>) -> Session {
        let decoded = DecodedRequest {
            epoch,
            request: Request {
                cmd: Command::Check,
                flag: 3,
                tag: 0xAA,
                digest: [1; 64],
                shingles: None,
            },
            extensions: Extensions::default(),
        };
        let mut s = Session::new(decoded, Some("192.0.2.1:4000".parse().unwrap()), 100.0);
        s.key = key;
        s.shared = shared;
        s
    }

    #[test]
    fn delay_censor_preserves_tag() {
        let s = session(Epoch::Current, None, None);
        let reply = Reply {
            tag: 0xAA,
            prob: 1.0,
            flag: 3,
            value: 0,
            ts: 95,
        };
        let (frame, censored) = s.encode_reply(reply, true).unwrap();
        assert!(!censored);

        let parsed = wire::parse_reply(&frame, Epoch::Current).unwrap();
        assert_eq!(parsed.tag, 0xAA);
        assert_eq!(parsed.ts, 0);
        assert_eq!(parsed.prob, 0.0);
        assert_eq!(parsed.value, 0);
        // Delay keeps the flag; only the forbidden censor blanks it.
        assert_eq!(parsed.flag, 3);
    }

    #[test]
    fn forbidden_flag_blanks_encrypted_reply() {
        let key = Arc::new(ServerKey::new([8; 32], vec![3]));
        let shared = AeadKey::new([0x42; 32]);
        let s = session(Epoch::Current, Some(key), Some(shared.clone()));

        let reply = Reply {
            tag: 0xAA,
            prob: 1.0,
            flag: 3,
            value: 0,
            ts: 95,
        };
        let (frame, censored) = s.encode_reply(reply, false).unwrap();
        assert!(censored);

        let parsed =
            exchange::parse_sealed_reply(&shared, &frame, Epoch::Current).unwrap();
        assert_eq!(parsed.tag, 0xAA);
        assert_eq!(parsed.flag, 0);
        assert_eq!(parsed.prob, 0.0);
        assert_eq!(parsed.ts, 0);
        assert_eq!(parsed.value, 0);
    }

    #[test]
    fn forbidden_flag_ignored_for_plaintext() {
        let key = Arc::new(ServerKey::new([8; 32], vec![3]));
        let mut s = session(Epoch::Current, Some(key), None);
        s.shared = None;

        let reply = Reply {
            tag: 0xAA,
            prob: 1.0,
            flag: 3,
            value: 0,
            ts: 95,
        };
        let (frame, censored) = s.encode_reply(reply, false).unwrap();
        assert!(!censored);
        assert_eq!(wire::parse_reply(&frame, Epoch::Current).unwrap().flag, 3);
    }

    #[test]
    fn reply_frame_sizes_track_epoch_and_encryption() {
        let plain_legacy = session(Epoch::Legacy, None, None);
        let (frame, _) = plain_legacy.encode_reply(Reply::default(), false).unwrap();
        assert_eq!(frame.len(), REPLY_V1_LEN);

        let shared = AeadKey::new([9; 32]);
        let enc_current = session(Epoch::Current, None, Some(shared));
        let (frame, _) = enc_current.encode_reply(Reply::default(), false).unwrap();
        assert_eq!(frame.len(), REPLY_ENC_HDR_LEN + REPLY_LEN);

        let enc_legacy = session(
            Epoch::Legacy,
            None,
            Some(AeadKey::new([9; 32])),
        );
        let (frame, _) = enc_legacy.encode_reply(Reply::default(), false).unwrap();
        assert_eq!(frame.len(), REPLY_ENC_HDR_LEN + REPLY_V1_LEN);
    }

    #[test]
    fn jitter_stays_in_band() {
        for _ in 0..64 {
            let j = jittered_delay(60.0);
            assert!((60.0..90.0).contains(&j));
        }
    }
}
