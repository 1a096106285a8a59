/// The uniform store client interface and its failure taxonomy.
///
/// Two implementations: `proxy::ProxyClient` (message passing to the
/// coordinator) and `remote::RemoteClient` (redis, bypassing the
/// coordinator).  Operational failures are fail-open: every method
/// returns a `Degraded<T>` carrying a usable default plus the optional
/// `Fault`, so a broken backend can never block request handling.
/// Protocol misuse is a hard `CacheError` because it is a programming
/// mistake, not an operational condition.
///
pub mod proxy;
pub mod remote;

use crate::lock::LockOpts;
use crate::message::{
    IncrSnapshot, IncrTarget, JsonValue, KeySel, LimiterOpts, LimiterVerdict, StoreOpts,
    StoreStats,
};
use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("connection error: {0}")]
    Connection(String),
}

/// operational failure; always resolved fail-open
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// channel closed or backend unreachable
    Transport,
    /// no reply within the deadline
    Timeout,
    /// backend-side error executing an operation or script
    Script(String),
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Transport => write!(f, "transport failure"),
            Fault::Timeout => write!(f, "timeout"),
            Fault::Script(msg) => write!(f, "script failure: {}", msg),
        }
    }
}

/// a result that is always usable: the default value plus the fault that
/// degraded it, if any
#[derive(Debug, Clone, PartialEq)]
pub struct Degraded<T> {
    pub value: T,
    pub fault: Option<Fault>,
}

impl<T> Degraded<T> {
    pub fn ok(value: T) -> Degraded<T> {
        Degraded { value, fault: None }
    }

    pub fn fallback(value: T, fault: Fault) -> Degraded<T> {
        Degraded {
            value,
            fault: Some(fault),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.fault.is_some()
    }
}

pub type ClientResult<T> = Result<Degraded<T>, CacheError>;

/// the uniform operation vocabulary, identical over both backends
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// scalar read, map field read (`"*"` = all fields), list membership
    /// test / full read / guarded pop
    async fn get(&self, key: KeySel, opts: StoreOpts) -> ClientResult<Option<JsonValue>>;

    /// upsert; list adds return the new size; `opts.setmax` writes are
    /// conditional and atomic
    async fn put(&self, key: &str, value: JsonValue, opts: StoreOpts) -> ClientResult<Option<u64>>;

    /// atomic add of one counter or several fields
    async fn incr(&self, target: IncrTarget, opts: StoreOpts) -> ClientResult<IncrSnapshot>;

    async fn del(&self, key: &str, opts: StoreOpts) -> ClientResult<bool>;

    async fn clear(&self, pattern: Option<&str>) -> ClientResult<u64>;

    async fn keys(&self, pattern: Option<&str>) -> ClientResult<Vec<String>>;

    async fn stats(&self) -> ClientResult<StoreStats>;

    /// conditional set with expiry; true when this caller took the lock
    async fn lock(&self, name: &str, opts: LockOpts) -> ClientResult<bool>;

    /// unconditional release (no ownership check)
    async fn unlock(&self, name: &str) -> ClientResult<()>;

    /// one token-bucket check; `delay == 0` means allowed
    async fn limiter(&self, opts: LimiterOpts) -> ClientResult<LimiterVerdict>;
}

/// degraded default for an incr: the counter reads as zero
pub(crate) fn zero_snapshot() -> IncrSnapshot {
    IncrSnapshot {
        old: None,
        new: Some(JsonValue::from(0)),
    }
}
