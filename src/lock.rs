/// Lock primitive: conditional set with expiry.
///
/// `unlock` deletes unconditionally and never checks the caller holds the
/// lock, so any process can force-release an orphaned lock.
///
use crate::store::BoundedStore;
use serde_json::json;

pub const LOCK_PREFIX: &str = "lock:";
pub const DEFAULT_LOCK_TTL_MS: u64 = 30_000;

#[derive(Debug, Clone)]
pub struct LockOpts {
    /// lock expiry in milliseconds
    pub ttl: u64,
    /// opaque owner token; generated when unset
    pub owner: Option<String>,
    /// takeover: set unconditionally instead of set-if-absent
    pub force: bool,
}

impl Default for LockOpts {
    fn default() -> LockOpts {
        LockOpts {
            ttl: DEFAULT_LOCK_TTL_MS,
            owner: None,
            force: false,
        }
    }
}

impl LockOpts {
    pub fn new() -> LockOpts {
        LockOpts::default()
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> LockOpts {
        self.ttl = ttl_ms;
        self
    }

    pub fn with_owner(mut self, owner: &str) -> LockOpts {
        self.owner = Some(owner.to_string());
        self
    }

    pub fn with_force(mut self) -> LockOpts {
        self.force = true;
        self
    }
}

/// opaque owner token for callers that don't supply one
pub fn owner_token() -> String {
    format!("{:08x}{:08x}", fastrand::u32(..), fastrand::u32(..))
}

pub(crate) fn lock_key(name: &str) -> String {
    format!("{}{}", LOCK_PREFIX, name)
}

/// set-if-absent (or takeover with `force`) against the bounded store;
/// runs inside the coordinator's serialized dispatch, which is what makes
/// the check-then-set a single atomic step
pub(crate) fn acquire(
    store: &mut BoundedStore,
    name: &str,
    owner: &str,
    ttl: u64,
    force: bool,
    now: u64,
) -> bool {
    let key = lock_key(name);
    if force || !store.exists(&key, now) {
        store.put(&key, json!(owner), Some(ttl), now);
        true
    } else {
        false
    }
}

pub(crate) fn release(store: &mut BoundedStore, name: &str, now: u64) -> bool {
    store.del(&lock_key(name), now)
}
