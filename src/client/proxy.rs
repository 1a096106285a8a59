/// In-process proxy client: the member side of the coordinator path.
///
/// Every call builds a `Request` and sends it over the coordinator's
/// channel.  Fire-and-forget writes return immediately; correlated calls
/// register a pending id and await the reply under a deadline.  A closed
/// channel or an expired deadline resolves the call with the degraded
/// default; a broken cache never blocks request processing.
///
use crate::channel::{CorrelationRegistry, Envelope};
use crate::client::{
    zero_snapshot, CacheError, ClientResult, Degraded, Fault, StoreClient,
};
use crate::coordinator::Coordinator;
use crate::lock::{self, LockOpts};
use crate::message::{
    IncrSnapshot, IncrTarget, JsonValue, KeySel, LimiterOpts, LimiterVerdict, Op, OpResult,
    Reply, Request, StoreOpts, StoreStats,
};
use async_channel::Sender;
use async_std::future;
use async_trait::async_trait;
use domain_keys::keys::RouteKey;
use log::*;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_TIMEOUT_MS: u64 = 1_000;

const REPLY_CAPACITY: usize = 250;

#[derive(Debug, Clone)]
pub struct ProxyClient {
    id: String,
    request_tx: Sender<Envelope>,
    reply_tx: Sender<Reply>,
    registry: Arc<CorrelationRegistry>,
    timeout: Duration,
}

impl ProxyClient {
    /// connect a member to the coordinator with the default reply deadline
    pub async fn connect(coordinator: &Coordinator) -> ProxyClient {
        Self::with_timeout(coordinator, DEFAULT_TIMEOUT_MS).await
    }

    pub async fn with_timeout(coordinator: &Coordinator, timeout_ms: u64) -> ProxyClient {
        let id = RouteKey::create();
        let (reply_tx, reply_rx) = async_channel::bounded(REPLY_CAPACITY);
        let registry = Arc::new(CorrelationRegistry::new());

        // reply pump: resolves pending calls, drops stale ids
        let pump = registry.clone();
        let pump_id = id.clone();
        async_std::task::spawn(async move {
            while let Ok(reply) = reply_rx.recv().await {
                pump.resolve(reply);
            }
            info!("reply pump exit for member id: {}", pump_id);
        });

        let client = ProxyClient {
            id,
            request_tx: coordinator.request_channel(),
            reply_tx,
            registry,
            timeout: Duration::from_millis(timeout_ms),
        };

        info!("proxy client created: {:?}", &client);

        client
    }

    pub fn id(&self) -> String {
        self.id.to_string()
    }

    pub fn in_flight(&self) -> usize {
        self.registry.in_flight()
    }

    /// send and await the correlated reply under the deadline
    async fn call(&self, op: Op) -> Result<OpResult, Fault> {
        let (id, rx) = self.registry.register();
        let env = Envelope::correlated(Request { id: Some(id), op }, self.reply_tx.clone());

        if self.request_tx.send(env).await.is_err() {
            self.registry.discard(id);
            warn!("coordinator channel closed, failing open, id: {}", id);
            return Err(Fault::Transport);
        }

        match future::timeout(self.timeout, rx.recv()).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => {
                self.registry.discard(id);
                Err(Fault::Transport)
            }
            Err(_) => {
                // drop the pending call; a late reply finds nothing
                self.registry.discard(id);
                warn!("reply deadline expired, dropping pending call, id: {}", id);
                Err(Fault::Timeout)
            }
        }
    }

    /// fire-and-forget write
    async fn cast(&self, op: Op) -> Option<Fault> {
        let env = Envelope::fire_and_forget(Request { id: None, op });
        if self.request_tx.send(env).await.is_err() {
            warn!("coordinator channel closed, dropping write");
            Some(Fault::Transport)
        } else {
            None
        }
    }
}

fn unexpected(body: OpResult) -> CacheError {
    CacheError::Unsupported(format!("unexpected reply shape: {:?}", body))
}

/// collapse a correlated result to the typed value, or the degraded
/// default on an operational fault
macro_rules! resolve_call {
    ($outcome:expr, $default:expr, $($pattern:pat => $value:expr),+ $(,)?) => {
        match $outcome {
            Ok(OpResult::Unsupported(msg)) => Err(CacheError::Unsupported(msg)),
            $(Ok($pattern) => Ok(Degraded::ok($value)),)+
            Ok(other) => Err(unexpected(other)),
            Err(fault) => Ok(Degraded::fallback($default, fault)),
        }
    };
}

#[async_trait]
impl StoreClient for ProxyClient {
    async fn get(&self, key: KeySel, opts: StoreOpts) -> ClientResult<Option<JsonValue>> {
        let outcome = self.call(Op::Get { key, opts }).await;
        resolve_call!(
            outcome,
            None,
            OpResult::None => None,
            OpResult::Value(v) => Some(v),
            OpResult::Values(vs) => Some(JsonValue::Array(vs)),
            OpResult::Flag(b) => Some(JsonValue::Bool(b)),
        )
    }

    async fn put(&self, key: &str, value: JsonValue, opts: StoreOpts) -> ClientResult<Option<u64>> {
        // list adds and conditional writes report back; plain writes are
        // fire-and-forget
        if opts.list.is_some() || opts.setmax {
            let outcome = self
                .call(Op::Put {
                    key: key.to_string(),
                    value,
                    opts,
                })
                .await;
            return resolve_call!(
                outcome,
                None,
                OpResult::Size(n) => Some(n),
                OpResult::Flag(_) => None,
                OpResult::None => None,
            );
        }

        match self
            .cast(Op::Put {
                key: key.to_string(),
                value,
                opts,
            })
            .await
        {
            None => Ok(Degraded::ok(None)),
            Some(fault) => Ok(Degraded::fallback(None, fault)),
        }
    }

    async fn incr(&self, target: IncrTarget, opts: StoreOpts) -> ClientResult<IncrSnapshot> {
        let outcome = self.call(Op::Incr { target, opts }).await;
        resolve_call!(
            outcome,
            zero_snapshot(),
            OpResult::Counters(snap) => snap,
        )
    }

    async fn del(&self, key: &str, opts: StoreOpts) -> ClientResult<bool> {
        let outcome = self
            .call(Op::Del {
                key: key.to_string(),
                opts,
            })
            .await;
        resolve_call!(
            outcome,
            false,
            OpResult::Flag(b) => b,
        )
    }

    async fn clear(&self, pattern: Option<&str>) -> ClientResult<u64> {
        let outcome = self
            .call(Op::Clear {
                pattern: pattern.map(|p| p.to_string()),
            })
            .await;
        resolve_call!(
            outcome,
            0,
            OpResult::Size(n) => n,
        )
    }

    async fn keys(&self, pattern: Option<&str>) -> ClientResult<Vec<String>> {
        let outcome = self
            .call(Op::Keys {
                pattern: pattern.map(|p| p.to_string()),
            })
            .await;
        resolve_call!(
            outcome,
            Vec::new(),
            OpResult::Keys(keys) => keys,
        )
    }

    async fn stats(&self) -> ClientResult<StoreStats> {
        let outcome = self.call(Op::Stats).await;
        resolve_call!(
            outcome,
            StoreStats::default(),
            OpResult::Stats(stats) => stats,
        )
    }

    async fn lock(&self, name: &str, opts: LockOpts) -> ClientResult<bool> {
        let owner = opts.owner.unwrap_or_else(lock::owner_token);
        let outcome = self
            .call(Op::Lock {
                name: name.to_string(),
                owner,
                ttl: opts.ttl,
                force: opts.force,
            })
            .await;
        resolve_call!(
            outcome,
            false,
            OpResult::Flag(b) => b,
        )
    }

    async fn unlock(&self, name: &str) -> ClientResult<()> {
        match self
            .cast(Op::Unlock {
                name: name.to_string(),
            })
            .await
        {
            None => Ok(Degraded::ok(())),
            Some(fault) => Ok(Degraded::fallback((), fault)),
        }
    }

    async fn limiter(&self, opts: LimiterOpts) -> ClientResult<LimiterVerdict> {
        let outcome = self.call(Op::Limiter { opts }).await;
        resolve_call!(
            outcome,
            LimiterVerdict::default(),
            OpResult::Limiter(verdict) => verdict,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn round_trip() {
        async_std::task::block_on(async move {
            let coordinator = Coordinator::start(100).await;
            let client = ProxyClient::connect(&coordinator).await;
            assert_eq!(client.id().len(), 16);

            let put = client
                .put("k", json!("v"), StoreOpts::scalar())
                .await
                .expect("put should not be misuse");
            assert!(!put.is_degraded());

            let got = client
                .get("k".into(), StoreOpts::scalar())
                .await
                .expect("get should not be misuse");
            assert_eq!(got.value, Some(json!("v")));
            assert_eq!(client.in_flight(), 0);
        });
    }

    #[test]
    fn fail_open_after_shutdown() {
        async_std::task::block_on(async move {
            let coordinator = Coordinator::start(100).await;
            let client = ProxyClient::connect(&coordinator).await;
            assert!(coordinator.shutdown());

            let got = client
                .get("k".into(), StoreOpts::scalar())
                .await
                .expect("fail-open, not an error");
            assert_eq!(got.value, None);
            assert_eq!(got.fault, Some(Fault::Transport));

            let verdict = client
                .limiter(LimiterOpts::new("api"))
                .await
                .expect("fail-open, not an error");
            assert!(verdict.value.allowed(), "degraded limiter never throttles");
            assert!(verdict.is_degraded());

            let locked = client.lock("ddl", LockOpts::new()).await.expect("fail-open");
            assert_eq!(locked.value, false);
        });
    }

    #[test]
    fn misuse_is_an_error() {
        async_std::task::block_on(async move {
            let coordinator = Coordinator::start(100).await;
            let client = ProxyClient::connect(&coordinator).await;

            let result = client
                .get("k".into(), StoreOpts::scalar().with_pop())
                .await;
            assert!(matches!(result, Err(CacheError::Unsupported(_))));
        });
    }
}
