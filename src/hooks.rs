// Pre/post/blacklist hook slots for external extensions.
// Numan Thabit 2026

use std::net::IpAddr;

use thiserror::Error;
use tracing::error;

use crate::wire::{Command, Digest, Extensions};

/// Failure reported by a hook; logged and otherwise ignored.
#[derive(Debug, Error)]
#[error("hook failed: {0}")]
pub struct HookError(pub String);

/// Request-side arguments handed to pre and post hooks.
#[derive(Debug)]
pub struct HookRequest<'a> {
    /// Client address, absent for local transports.
    pub addr: Option<IpAddr>,
    /// Requested operation.
    pub cmd: Command,
    /// Content fingerprint.
    pub digest: &'a Digest,
    /// Whether the request carried shingles.
    pub is_shingle: bool,
    /// Source-attribution extensions.
    pub extensions: &'a Extensions,
}

/// Backend result fields exposed to the post hook.
#[derive(Debug, Clone, Copy)]
pub struct HookResult {
    pub value: i32,
    pub prob: f32,
    pub flag: u32,
    pub ts: u64,
}

/// Short-circuit reply produced by a pre hook.
#[derive(Debug, Clone, Copy)]
pub struct PreVerdict {
    pub value: i32,
    pub prob: f32,
}

/// Override produced by a post hook; `flag` is kept when `None`.
#[derive(Debug, Clone, Copy)]
pub struct PostVerdict {
    pub value: i32,
    pub prob: f32,
    pub flag: Option<u32>,
}

type PreHook = Box<dyn Fn(&HookRequest<'_>) -> Result<Option<PreVerdict>, HookError> + Send>;
type PostHook =
    Box<dyn Fn(&HookRequest<'_>, HookResult) -> Result<Option<PostVerdict>, HookError> + Send>;
type BlacklistHook = Box<dyn Fn(Option<IpAddr>, &str) + Send>;

/// Holder for the three optional hook slots, resolved at startup.
#[derive(Default)]
pub struct HookRegistry {
    pre: Option<PreHook>,
    post: Option<PostHook>,
    blacklist: Option<BlacklistHook>,
}

impl HookRegistry {
    /// Creates an empty registry; all hooks are no-ops.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the pre hook.
    pub fn set_pre<F>(&mut self, hook: F)
    where
        F: Fn(&HookRequest<'_>) -> Result<Option<PreVerdict>, HookError> + Send + 'static,
    {
        self.pre = Some(Box::new(hook));
    }

    /// Installs the post hook.
    pub fn set_post<F>(&mut self, hook: F)
    where
        F: Fn(&HookRequest<'_>, HookResult) -> Result<Option<PostVerdict>, HookError>
            + Send
            + 'static,
    {
        self.post = Some(Box::new(hook));
    }

    /// Installs the blacklist notification hook.
    pub fn set_blacklist<F>(&mut self, hook: F)
    where
        F: Fn(Option<IpAddr>, &str) + Send + 'static,
    {
        self.blacklist = Some(Box::new(hook));
    }

    /// Runs the pre hook; failures log and do not override.
    pub fn run_pre(&self, req: &HookRequest<'_>) -> Option<PreVerdict> {
        let hook = self.pre.as_ref()?;
        match hook(req) {
            Ok(verdict) => verdict,
            Err(err) => {
                error!(error = %err, "pre hook failed");
                None
            }
        }
    }

    /// Runs the post hook; failures log and do not override.
    pub fn run_post(&self, req: &HookRequest<'_>, result: HookResult) -> Option<PostVerdict> {
        let hook = self.post.as_ref()?;
        match hook(req, result) {
            Ok(verdict) => verdict,
            Err(err) => {
                error!(error = %err, "post hook failed");
                None
            }
        }
    }

    /// Fire-and-forget blacklist notification.
    pub fn notify_blacklist(&self, addr: Option<IpAddr>, reason: &str) {
        if let Some(hook) = &self.blacklist {
            hook(addr, reason);
        }
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("pre", &self.pre.is_some())
            .field("post", &self.post.is_some())
            .field("blacklist", &self.blacklist.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn request<'a>(digest: &'a Digest, extensions: &'a Extensions) -> HookRequest<'a> {
        HookRequest {
            addr: Some("192.0.2.1".parse().unwrap()),
            cmd: Command::Check,
            digest,
            is_shingle: false,
            extensions,
        }
    }

    #[test]
    fn missing_hooks_do_not_override() {
        let registry = HookRegistry::new();
        let digest = [0u8; 64];
        let ext = Extensions::default();
        assert!(registry.run_pre(&request(&digest, &ext)).is_none());
        registry.notify_blacklist(None, "ratelimit");
    }

    #[test]
    fn pre_hook_short_circuits() {
        let mut registry = HookRegistry::new();
        registry.set_pre(|_req| {
            Ok(Some(PreVerdict {
                value: 403,
                prob: 0.0,
            }))
        });

        let digest = [1u8; 64];
        let ext = Extensions::default();
        let verdict = registry.run_pre(&request(&digest, &ext)).unwrap();
        assert_eq!(verdict.value, 403);
    }

    #[test]
    fn failing_hook_counts_as_no_override() {
        let mut registry = HookRegistry::new();
        registry.set_post(|_req, _res| Err(HookError("backend unavailable".into())));

        let digest = [2u8; 64];
        let ext = Extensions::default();
        let result = HookResult {
            value: 0,
            prob: 1.0,
            flag: 3,
            ts: 99,
        };
        assert!(registry.run_post(&request(&digest, &ext), result).is_none());
    }

    #[test]
    fn blacklist_hook_receives_reason() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);

        let mut registry = HookRegistry::new();
        registry.set_blacklist(move |addr, reason| {
            assert!(addr.is_some());
            assert_eq!(reason, "blacklisted");
            seen.fetch_add(1, Ordering::SeqCst);
        });

        registry.notify_blacklist(Some("192.0.2.7".parse().unwrap()), "blacklisted");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
