/// Coordinator: the single task owning the bounded store.
///
/// Members send `Envelope`s over the request channel; the dispatch loop
/// processes one message at a time and executes it against the store, so
/// no two operations for the same key can interleave.  That serialization
/// is the only atomicity mechanism on this path.
///
use crate::channel::Envelope;
use crate::limiter::{self, LimiterState};
use crate::lock;
use crate::message::{
    member_text, IncrSnapshot, IncrTarget, JsonValue, KeySel, LimiterOpts, Op, OpResult, Reply,
    StoreOpts,
};
use crate::store::{now_ms, BoundedStore};
use anyhow::Result;
use async_channel::{bounded, Receiver, Sender};
use domain_keys::keys::RouteKey;
use log::*;
use serde_json::json;
use service_uptime::Uptime;

pub const LIMITER_PREFIX: &str = "limiter:";
pub const SEEN_PREFIX: &str = "seen:";
/// sentinel ttl for guarded pops when the caller doesn't set one
pub const POP_GUARD_TTL_MS: u64 = 5_000;
pub const DEFAULT_CAPACITY: usize = 50_000;

const CHANNEL_CAPACITY: usize = 250;

/// the dispatch loop; runs until the request channel closes
pub async fn dispatch(id: String, rx: Receiver<Envelope>, capacity: usize) -> Result<()> {
    let uptime = Uptime::new();
    let mut store = BoundedStore::new(capacity);
    let mut error_count = 0u16;

    while let Ok(env) = rx.recv().await {
        debug!("recv request: {:?}", env.request.op);
        let body = execute(&mut store, env.request.op, &uptime);

        if let (Some(reply_id), Some(tx)) = (env.request.id, env.reply_to) {
            if tx.send(Reply { id: reply_id, body }).await.is_err() {
                error_count += 1;
                error!("error returning reply, id: {}", reply_id);
            }
        }
    }

    info!(
        "coordinator dispatch exit, id: {}, send errors: {}",
        id, error_count
    );
    rx.close();

    Ok(())
}

/// execute one operation against the store
pub fn execute(store: &mut BoundedStore, op: Op, uptime: &Uptime) -> OpResult {
    let now = now_ms();
    match op {
        Op::Get { key, opts } => exec_get(store, key, &opts, now),
        Op::Put { key, value, opts } => exec_put(store, &key, value, &opts, now),
        Op::Incr { target, opts } => exec_incr(store, target, &opts, now),
        Op::Del { key, opts } => exec_del(store, &key, &opts, now),
        Op::Clear { pattern } => OpResult::Size(store.clear(pattern.as_deref())),
        Op::Keys { pattern } => OpResult::Keys(store.keys(pattern.as_deref(), now)),
        Op::Stats => {
            let mut stats = store.stats();
            stats.uptime = Some(uptime.to_string());
            OpResult::Stats(stats)
        }
        Op::Lock {
            name,
            owner,
            ttl,
            force,
        } => OpResult::Flag(lock::acquire(store, &name, &owner, ttl, force, now)),
        Op::Unlock { name } => {
            lock::release(store, &name, now);
            OpResult::None
        }
        Op::Limiter { opts } => exec_limiter(store, &opts, now),
    }
}

fn misuse(msg: &str) -> OpResult {
    warn!("protocol misuse: {}", msg);
    OpResult::Unsupported(msg.to_string())
}

fn check_structure(opts: &StoreOpts) -> Option<OpResult> {
    match opts.validate() {
        Ok(()) => None,
        Err(msg) => Some(misuse(&msg)),
    }
}

fn exec_get(store: &mut BoundedStore, key: KeySel, opts: &StoreOpts, now: u64) -> OpResult {
    if let Some(err) = check_structure(opts) {
        return err;
    }

    if let Some(map) = &opts.map {
        let obj = match store.get(map, now) {
            Some(JsonValue::Object(obj)) => obj,
            Some(_) => return misuse("entry is not a map"),
            None => return OpResult::None,
        };
        return match key {
            KeySel::One(field) if field == "*" => OpResult::Value(JsonValue::Object(obj)),
            KeySel::One(field) => match obj.get(&field) {
                Some(v) => OpResult::Value(v.clone()),
                None => OpResult::None,
            },
            KeySel::Many(fields) => OpResult::Values(
                fields
                    .iter()
                    .map(|f| obj.get(f).cloned().unwrap_or(JsonValue::Null))
                    .collect(),
            ),
        };
    }

    if let Some(list) = &opts.list {
        if opts.pop {
            return exec_pop(store, list, opts.ttl, now);
        }
        let members = match store.get(list, now) {
            Some(JsonValue::Array(members)) => members,
            Some(_) => return misuse("entry is not a list"),
            None => return OpResult::None,
        };
        return match key {
            KeySel::One(member) if member == "*" => OpResult::Value(JsonValue::Array(members)),
            KeySel::One(member) => {
                OpResult::Flag(members.iter().any(|v| value_matches(v, &member)))
            }
            KeySel::Many(_) => misuse("multi-key get is not supported for lists"),
        };
    }

    match key {
        KeySel::One(key) => match store.get(&key, now) {
            Some(v) => OpResult::Value(v),
            None => OpResult::None,
        },
        KeySel::Many(keys) => OpResult::Values(
            keys.iter()
                .map(|k| store.get(k, now).unwrap_or(JsonValue::Null))
                .collect(),
        ),
    }
}

/// pop one member with the anti-reprocessing guard: a popped member whose
/// sentinel is still live was already claimed by a racing popper inside
/// the window, so it is dropped and the next member is tried
fn exec_pop(store: &mut BoundedStore, list: &str, ttl: Option<u64>, now: u64) -> OpResult {
    let mut members = match store.get(list, now) {
        Some(JsonValue::Array(members)) => members,
        Some(_) => return misuse("entry is not a list"),
        None => return OpResult::None,
    };

    let guard_ttl = ttl.unwrap_or(POP_GUARD_TTL_MS);
    let mut popped = None;

    while !members.is_empty() {
        let member = members.remove(0);
        let guard = format!("{}{}:{}", SEEN_PREFIX, list, member_text(&member));
        if store.exists(&guard, now) {
            debug!("skipping recently delivered member of {}", list);
            continue;
        }
        store.put(&guard, json!(true), Some(guard_ttl), now);
        popped = Some(member);
        break;
    }

    store.put(list, JsonValue::Array(members), None, now);
    match popped {
        Some(member) => OpResult::Value(member),
        None => OpResult::None,
    }
}

fn exec_put(
    store: &mut BoundedStore,
    key: &str,
    value: JsonValue,
    opts: &StoreOpts,
    now: u64,
) -> OpResult {
    if let Some(err) = check_structure(opts) {
        return err;
    }
    if opts.pop {
        return misuse("opts.pop is a get option");
    }

    if let Some(list) = &opts.list {
        if opts.setmax {
            return misuse("opts.setmax is not supported for lists");
        }
        let mut members = match store.get(list, now) {
            Some(JsonValue::Array(members)) => members,
            Some(_) => return misuse("entry is not a list"),
            None => Vec::new(),
        };
        if !members.contains(&value) {
            members.push(value);
        }
        let size = members.len() as u64;
        store.put(list, JsonValue::Array(members), opts.ttl, now);
        return OpResult::Size(size);
    }

    if let Some(map) = &opts.map {
        let mut obj = match store.get(map, now) {
            Some(JsonValue::Object(obj)) => obj,
            Some(_) => return misuse("entry is not a map"),
            None => serde_json::Map::new(),
        };

        let fields: Vec<(String, JsonValue)> = if key == "*" {
            match value {
                JsonValue::Object(bulk) => bulk.into_iter().collect(),
                _ => return misuse("bulk map write requires an object value"),
            }
        } else {
            vec![(key.to_string(), value)]
        };

        let mut applied = false;
        for (field, v) in fields {
            if opts.setmax {
                let next = match v.as_f64() {
                    Some(n) => n,
                    None => return misuse("setmax requires a numeric value"),
                };
                let prior = obj.get(&field).and_then(|p| p.as_f64());
                if matches!(prior, Some(p) if next <= p) {
                    continue;
                }
                applied = true;
            }
            obj.insert(field, v);
        }
        store.put(map, JsonValue::Object(obj), opts.ttl, now);
        return if opts.setmax {
            OpResult::Flag(applied)
        } else {
            OpResult::None
        };
    }

    if opts.setmax {
        let next = match value.as_f64() {
            Some(n) => n,
            None => return misuse("setmax requires a numeric value"),
        };
        let prior = store.get(key, now).and_then(|p| p.as_f64());
        if matches!(prior, Some(p) if next <= p) {
            return OpResult::Flag(false);
        }
        store.put(key, value, opts.ttl, now);
        return OpResult::Flag(true);
    }

    store.put(key, value, opts.ttl, now);
    OpResult::None
}

fn exec_incr(
    store: &mut BoundedStore,
    target: IncrTarget,
    opts: &StoreOpts,
    now: u64,
) -> OpResult {
    if let Some(err) = check_structure(opts) {
        return err;
    }
    if opts.list.is_some() {
        return misuse("incr is not supported for lists");
    }

    let pairs: Vec<(String, f64)> = match target {
        IncrTarget::Key { key, delta } => vec![(key, delta)],
        IncrTarget::Fields(pairs) => pairs,
    };

    let mut old = serde_json::Map::new();
    let mut new = serde_json::Map::new();

    if let Some(map) = &opts.map {
        let mut obj = match store.get(map, now) {
            Some(JsonValue::Object(obj)) => obj,
            Some(_) => return misuse("entry is not a map"),
            None => serde_json::Map::new(),
        };
        for (field, delta) in &pairs {
            let prior = obj.get(field).and_then(|v| v.as_f64()).unwrap_or(0.0);
            let next = prior + delta;
            obj.insert(field.clone(), json!(next));
            old.insert(field.clone(), json!(prior));
            new.insert(field.clone(), json!(next));
        }
        store.put(map, JsonValue::Object(obj), opts.ttl, now);
    } else {
        for (key, delta) in &pairs {
            let next = store.incr(key, *delta, opts.ttl, now);
            old.insert(key.clone(), json!(next - delta));
            new.insert(key.clone(), json!(next));
        }
    }

    OpResult::Counters(IncrSnapshot::build(
        pairs.len() == 1,
        old,
        new,
        opts.returning,
    ))
}

fn exec_del(store: &mut BoundedStore, key: &str, opts: &StoreOpts, now: u64) -> OpResult {
    if let Some(err) = check_structure(opts) {
        return err;
    }

    if let Some(map) = &opts.map {
        let mut obj = match store.get(map, now) {
            Some(JsonValue::Object(obj)) => obj,
            Some(_) => return misuse("entry is not a map"),
            None => return OpResult::Flag(false),
        };
        let removed = obj.remove(key).is_some();
        store.put(map, JsonValue::Object(obj), None, now);
        return OpResult::Flag(removed);
    }

    if let Some(list) = &opts.list {
        let mut members = match store.get(list, now) {
            Some(JsonValue::Array(members)) => members,
            Some(_) => return misuse("entry is not a list"),
            None => return OpResult::Flag(false),
        };
        let before = members.len();
        members.retain(|v| !value_matches(v, key));
        let removed = members.len() < before;
        store.put(list, JsonValue::Array(members), None, now);
        return OpResult::Flag(removed);
    }

    OpResult::Flag(store.del(key, now))
}

fn exec_limiter(store: &mut BoundedStore, opts: &LimiterOpts, now: u64) -> OpResult {
    let key = format!("{}{}", LIMITER_PREFIX, opts.name);
    let prev: Option<LimiterState> = store
        .get(&key, now)
        .and_then(|v| serde_json::from_value(v).ok());

    let (next, verdict) = limiter::tick(prev, opts, now);
    match next {
        Some(state) => match serde_json::to_value(&state) {
            Ok(blob) => store.put(&key, blob, opts.ttl, now),
            Err(e) => error!("limiter state encode failed for {}: {:?}", opts.name, e),
        },
        None => {
            store.del(&key, now);
        }
    }

    OpResult::Limiter(verdict)
}

fn value_matches(value: &JsonValue, key: &str) -> bool {
    member_text(value) == key
}

/// handle for the coordinator task, in the worker style: create, hand out
/// request channels, shut down by closing the channel
#[derive(Debug, Clone)]
pub struct Coordinator {
    id: String,
    uptime: Uptime,
    request_tx: Sender<Envelope>,
}

impl Coordinator {
    /// create the coordinator and spawn its dispatch loop
    pub async fn start(capacity: usize) -> Coordinator {
        let id = RouteKey::create();
        let cid = id.clone();

        info!("starting up coordinator, id: {}", id);

        let (request_tx, request_rx) = bounded(CHANNEL_CAPACITY);

        async_std::task::spawn(async move {
            match dispatch(id.clone(), request_rx, capacity).await {
                Ok(()) => info!("dispatch exit for coordinator id: {}", id),
                Err(e) => error!("dispatch exit with error: {:?}", e),
            }
        });

        let coordinator = Coordinator {
            id: cid,
            uptime: Uptime::new(),
            request_tx,
        };

        info!("coordinator created: {:?}", &coordinator);

        coordinator
    }

    pub fn id(&self) -> String {
        self.id.to_string()
    }

    pub fn get_uptime(&self) -> String {
        self.uptime.to_string()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.uptime.get_uptime_seconds()
    }

    /// invoked by member clients to send requests to the dispatch loop
    pub fn request_channel(&self) -> Sender<Envelope> {
        self.request_tx.clone()
    }

    /// close the request channel; members degrade to fail-open defaults
    pub fn shutdown(&self) -> bool {
        self.request_tx.close()
    }
}
