/// Networked store client: the same operation vocabulary served by redis,
/// bypassing the coordinator.
///
/// Redis is mutated by arbitrarily many member processes concurrently, so
/// every multi-step mutation runs as a single server-side Lua script (or a
/// natively atomic command / MULTI pipeline).  Separate read-modify-write
/// round trips would let two callers both observe and both consume the
/// same state, which is exactly what this layer exists to prevent.
///
use crate::client::{
    zero_snapshot, CacheError, ClientResult, Degraded, Fault, StoreClient,
};
use crate::coordinator::{LIMITER_PREFIX, POP_GUARD_TTL_MS, SEEN_PREFIX};
use crate::limiter::{LUA_TOKEN_BUCKET, MAX_BACKOFF_MS};
use crate::lock::{self, LockOpts};
use crate::message::{
    member_text, IncrSnapshot, IncrTarget, JsonValue, KeySel, LimiterOpts, LimiterVerdict,
    StoreOpts, StoreStats,
};
use crate::store::now_ms;
use async_trait::async_trait;
use log::*;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;

/// conditional scalar write: apply only if absent, non-numeric or greater.
/// KEYS[1] = key, ARGV = new value, ttl (0 = none)
const LUA_SETMAX: &str = r#"
local cur = redis.call('GET', KEYS[1])
local new = tonumber(ARGV[1])
if cur == false or tonumber(cur) == nil or new > tonumber(cur) then
  redis.call('SET', KEYS[1], ARGV[1])
  if tonumber(ARGV[2]) > 0 then redis.call('PEXPIRE', KEYS[1], ARGV[2]) end
  return 1
end
return 0
"#;

/// per-field variant of setmax.
/// KEYS[1] = hash key, ARGV = field, new value, ttl (0 = none)
const LUA_HSETMAX: &str = r#"
local cur = redis.call('HGET', KEYS[1], ARGV[1])
local new = tonumber(ARGV[2])
local applied = 0
if cur == false or tonumber(cur) == nil or new > tonumber(cur) then
  redis.call('HSET', KEYS[1], ARGV[1], ARGV[2])
  applied = 1
end
if tonumber(ARGV[3]) > 0 then redis.call('PEXPIRE', KEYS[1], ARGV[3]) end
return applied
"#;

/// pop one member with the anti-reprocessing guard: a member whose
/// sentinel is still live was claimed by a racing popper, drop it and try
/// the next.  KEYS[1] = set key, ARGV = sentinel prefix, guard ttl
const LUA_GUARDED_POP: &str = r#"
local n = redis.call('SCARD', KEYS[1])
for i = 1, n do
  local v = redis.call('SPOP', KEYS[1])
  if v == false then return false end
  local guard = ARGV[1] .. v
  if redis.call('EXISTS', guard) == 0 then
    redis.call('SET', guard, '1', 'PX', ARGV[2])
    return v
  end
end
return false
"#;

pub struct RemoteClient {
    conn: MultiplexedConnection,
    prefix: String,
    limiter_script: Script,
    setmax_script: Script,
    hsetmax_script: Script,
    pop_script: Script,
}

impl RemoteClient {
    pub async fn connect(url: &str) -> Result<RemoteClient, CacheError> {
        Self::connect_with_prefix(url, "").await
    }

    /// optional key prefix isolates clusters cohabiting one database
    pub async fn connect_with_prefix(url: &str, prefix: &str) -> Result<RemoteClient, CacheError> {
        let client = redis::Client::open(url).map_err(|e| CacheError::Config(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_std_connection()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        info!("remote store client connected: {}", url);

        Ok(RemoteClient {
            conn,
            prefix: prefix.to_string(),
            limiter_script: Script::new(LUA_TOKEN_BUCKET),
            setmax_script: Script::new(LUA_SETMAX),
            hsetmax_script: Script::new(LUA_HSETMAX),
            pop_script: Script::new(LUA_GUARDED_POP),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }
}

/// values travel as JSON text; bare strings that fail to parse round-trip
/// as strings so numbers stay INCRBYFLOAT-compatible
fn encode(value: &JsonValue) -> String {
    value.to_string()
}

fn decode(text: String) -> JsonValue {
    serde_json::from_str(&text).unwrap_or_else(|_| JsonValue::String(text))
}

fn fault(e: redis::RedisError) -> Fault {
    warn!("redis operation failed: {}", e);
    if e.kind() == redis::ErrorKind::ResponseError {
        Fault::Script(e.to_string())
    } else {
        Fault::Transport
    }
}

fn degrade<T>(default: T, e: redis::RedisError) -> Degraded<T> {
    Degraded::fallback(default, fault(e))
}

fn parse_verdict(fields: &[String]) -> LimiterVerdict {
    let num = |i: usize| {
        fields
            .get(i)
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(0.0)
    };
    LimiterVerdict {
        delay: num(0) as u64,
        count: num(1),
        total: num(2) as u64,
        elapsed: num(3) as u64,
        interval: num(4) as u64,
    }
}

fn validate(opts: &StoreOpts) -> Result<(), CacheError> {
    opts.validate().map_err(CacheError::Unsupported)
}

#[async_trait]
impl StoreClient for RemoteClient {
    async fn get(&self, key: KeySel, opts: StoreOpts) -> ClientResult<Option<JsonValue>> {
        validate(&opts)?;
        let mut conn = self.conn.clone();

        if let Some(map) = &opts.map {
            let mkey = self.key(map);
            return match key {
                KeySel::One(field) if field == "*" => {
                    match conn.hgetall::<_, HashMap<String, String>>(&mkey).await {
                        Ok(fields) if fields.is_empty() => Ok(Degraded::ok(None)),
                        Ok(fields) => {
                            let mut obj = serde_json::Map::new();
                            for (f, v) in fields {
                                obj.insert(f, decode(v));
                            }
                            Ok(Degraded::ok(Some(JsonValue::Object(obj))))
                        }
                        Err(e) => Ok(degrade(None, e)),
                    }
                }
                KeySel::One(field) => match conn.hget::<_, _, Option<String>>(&mkey, &field).await
                {
                    Ok(v) => Ok(Degraded::ok(v.map(decode))),
                    Err(e) => Ok(degrade(None, e)),
                },
                KeySel::Many(fields) => {
                    let result = redis::cmd("HMGET")
                        .arg(&mkey)
                        .arg(&fields)
                        .query_async::<_, Vec<Option<String>>>(&mut conn)
                        .await;
                    match result {
                        Ok(vs) => Ok(Degraded::ok(Some(JsonValue::Array(
                            vs.into_iter()
                                .map(|v| v.map(decode).unwrap_or(JsonValue::Null))
                                .collect(),
                        )))),
                        Err(e) => Ok(degrade(None, e)),
                    }
                }
            };
        }

        if let Some(list) = &opts.list {
            let lkey = self.key(list);

            if opts.pop {
                let guard_prefix = format!("{}{}{}:", self.prefix, SEEN_PREFIX, list);
                let guard_ttl = opts.ttl.unwrap_or(POP_GUARD_TTL_MS);
                let result: Result<Option<String>, _> = self
                    .pop_script
                    .key(&lkey)
                    .arg(&guard_prefix)
                    .arg(guard_ttl)
                    .invoke_async(&mut conn)
                    .await;
                return match result {
                    Ok(v) => Ok(Degraded::ok(v.map(decode))),
                    Err(e) => Ok(degrade(None, e)),
                };
            }

            return match key {
                KeySel::One(member) if member == "*" => {
                    match conn.smembers::<_, Vec<String>>(&lkey).await {
                        Ok(members) if members.is_empty() => Ok(Degraded::ok(None)),
                        Ok(members) => Ok(Degraded::ok(Some(JsonValue::Array(
                            members.into_iter().map(decode).collect(),
                        )))),
                        Err(e) => Ok(degrade(None, e)),
                    }
                }
                KeySel::One(member) => match conn.sismember::<_, _, bool>(&lkey, &member).await {
                    Ok(b) => Ok(Degraded::ok(Some(JsonValue::Bool(b)))),
                    Err(e) => Ok(degrade(None, e)),
                },
                KeySel::Many(_) => Err(CacheError::Unsupported(
                    "multi-key get is not supported for lists".to_string(),
                )),
            };
        }

        match key {
            KeySel::One(k) => match conn.get::<_, Option<String>>(self.key(&k)).await {
                Ok(v) => Ok(Degraded::ok(v.map(decode))),
                Err(e) => Ok(degrade(None, e)),
            },
            KeySel::Many(ks) => {
                let keys: Vec<String> = ks.iter().map(|k| self.key(k)).collect();
                let result = redis::cmd("MGET")
                    .arg(&keys)
                    .query_async::<_, Vec<Option<String>>>(&mut conn)
                    .await;
                match result {
                    Ok(vs) => Ok(Degraded::ok(Some(JsonValue::Array(
                        vs.into_iter()
                            .map(|v| v.map(decode).unwrap_or(JsonValue::Null))
                            .collect(),
                    )))),
                    Err(e) => Ok(degrade(None, e)),
                }
            }
        }
    }

    async fn put(&self, key: &str, value: JsonValue, opts: StoreOpts) -> ClientResult<Option<u64>> {
        validate(&opts)?;
        if opts.pop {
            return Err(CacheError::Unsupported("opts.pop is a get option".to_string()));
        }
        let mut conn = self.conn.clone();

        if let Some(list) = &opts.list {
            if opts.setmax {
                return Err(CacheError::Unsupported(
                    "opts.setmax is not supported for lists".to_string(),
                ));
            }
            let lkey = self.key(list);
            let mut pipe = redis::pipe();
            pipe.atomic().sadd(&lkey, member_text(&value)).ignore();
            if let Some(ttl) = opts.ttl {
                pipe.pexpire(&lkey, ttl as usize).ignore();
            }
            pipe.scard(&lkey);
            return match pipe.query_async::<_, (u64,)>(&mut conn).await {
                Ok((size,)) => Ok(Degraded::ok(Some(size))),
                Err(e) => Ok(degrade(None, e)),
            };
        }

        if let Some(map) = &opts.map {
            let mkey = self.key(map);
            let fields: Vec<(String, JsonValue)> = if key == "*" {
                match value {
                    JsonValue::Object(bulk) => bulk.into_iter().collect(),
                    _ => {
                        return Err(CacheError::Unsupported(
                            "bulk map write requires an object value".to_string(),
                        ))
                    }
                }
            } else {
                vec![(key.to_string(), value)]
            };

            if opts.setmax {
                let ttl = opts.ttl.unwrap_or(0);
                for (field, v) in fields {
                    let next = match v.as_f64() {
                        Some(n) => n,
                        None => {
                            return Err(CacheError::Unsupported(
                                "setmax requires a numeric value".to_string(),
                            ))
                        }
                    };
                    let result: Result<i64, _> = self
                        .hsetmax_script
                        .key(&mkey)
                        .arg(&field)
                        .arg(next)
                        .arg(ttl)
                        .invoke_async(&mut conn)
                        .await;
                    if let Err(e) = result {
                        return Ok(degrade(None, e));
                    }
                }
                return Ok(Degraded::ok(None));
            }

            let mut pipe = redis::pipe();
            pipe.atomic();
            for (field, v) in &fields {
                pipe.hset(&mkey, field, encode(v)).ignore();
            }
            if let Some(ttl) = opts.ttl {
                pipe.pexpire(&mkey, ttl as usize).ignore();
            }
            return match pipe.query_async::<_, ()>(&mut conn).await {
                Ok(()) => Ok(Degraded::ok(None)),
                Err(e) => Ok(degrade(None, e)),
            };
        }

        let skey = self.key(key);

        if opts.setmax {
            let next = match value.as_f64() {
                Some(n) => n,
                None => {
                    return Err(CacheError::Unsupported(
                        "setmax requires a numeric value".to_string(),
                    ))
                }
            };
            let result: Result<i64, _> = self
                .setmax_script
                .key(&skey)
                .arg(next)
                .arg(opts.ttl.unwrap_or(0))
                .invoke_async(&mut conn)
                .await;
            return match result {
                Ok(_) => Ok(Degraded::ok(None)),
                Err(e) => Ok(degrade(None, e)),
            };
        }

        let result = match opts.ttl {
            Some(ttl) => {
                redis::cmd("SET")
                    .arg(&skey)
                    .arg(encode(&value))
                    .arg("PX")
                    .arg(ttl)
                    .query_async::<_, ()>(&mut conn)
                    .await
            }
            None => conn.set::<_, _, ()>(&skey, encode(&value)).await,
        };
        match result {
            Ok(()) => Ok(Degraded::ok(None)),
            Err(e) => Ok(degrade(None, e)),
        }
    }

    async fn incr(&self, target: IncrTarget, opts: StoreOpts) -> ClientResult<IncrSnapshot> {
        validate(&opts)?;
        if opts.list.is_some() {
            return Err(CacheError::Unsupported(
                "incr is not supported for lists".to_string(),
            ));
        }
        let mut conn = self.conn.clone();

        let pairs: Vec<(String, f64)> = match target {
            IncrTarget::Key { key, delta } => vec![(key, delta)],
            IncrTarget::Fields(pairs) => pairs,
        };

        let mut pipe = redis::pipe();
        pipe.atomic();

        if let Some(map) = &opts.map {
            let mkey = self.key(map);
            for (field, delta) in &pairs {
                pipe.hincr(&mkey, field, *delta);
            }
            if let Some(ttl) = opts.ttl {
                pipe.pexpire(&mkey, ttl as usize).ignore();
            }
        } else {
            for (key, delta) in &pairs {
                pipe.incr(self.key(key), *delta);
                if let Some(ttl) = opts.ttl {
                    pipe.pexpire(self.key(key), ttl as usize).ignore();
                }
            }
        }

        match pipe.query_async::<_, Vec<f64>>(&mut conn).await {
            Ok(nexts) => {
                let mut old = serde_json::Map::new();
                let mut new = serde_json::Map::new();
                for ((key, delta), next) in pairs.iter().zip(nexts) {
                    old.insert(key.clone(), JsonValue::from(next - delta));
                    new.insert(key.clone(), JsonValue::from(next));
                }
                Ok(Degraded::ok(IncrSnapshot::build(
                    pairs.len() == 1,
                    old,
                    new,
                    opts.returning,
                )))
            }
            Err(e) => Ok(degrade(zero_snapshot(), e)),
        }
    }

    async fn del(&self, key: &str, opts: StoreOpts) -> ClientResult<bool> {
        validate(&opts)?;
        let mut conn = self.conn.clone();

        let result = if let Some(map) = &opts.map {
            conn.hdel::<_, _, u64>(self.key(map), key).await
        } else if let Some(list) = &opts.list {
            conn.srem::<_, _, u64>(self.key(list), key).await
        } else {
            conn.del::<_, u64>(self.key(key)).await
        };

        match result {
            Ok(n) => Ok(Degraded::ok(n > 0)),
            Err(e) => Ok(degrade(false, e)),
        }
    }

    async fn clear(&self, pattern: Option<&str>) -> ClientResult<u64> {
        let mut conn = self.conn.clone();
        let pat = format!("{}{}", self.prefix, pattern.unwrap_or("*"));

        let keys = match conn.keys::<_, Vec<String>>(&pat).await {
            Ok(keys) => keys,
            Err(e) => return Ok(degrade(0, e)),
        };
        if keys.is_empty() {
            return Ok(Degraded::ok(0));
        }

        match conn.del::<_, u64>(keys).await {
            Ok(n) => Ok(Degraded::ok(n)),
            Err(e) => Ok(degrade(0, e)),
        }
    }

    async fn keys(&self, pattern: Option<&str>) -> ClientResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pat = format!("{}{}", self.prefix, pattern.unwrap_or("*"));

        match conn.keys::<_, Vec<String>>(&pat).await {
            Ok(keys) => {
                let mut list: Vec<String> = keys
                    .into_iter()
                    .map(|k| {
                        k.strip_prefix(&self.prefix)
                            .map(|s| s.to_string())
                            .unwrap_or(k)
                    })
                    .collect();
                list.sort();
                Ok(Degraded::ok(list))
            }
            Err(e) => Ok(degrade(Vec::new(), e)),
        }
    }

    async fn stats(&self) -> ClientResult<StoreStats> {
        let mut conn = self.conn.clone();

        match redis::cmd("DBSIZE").query_async::<_, u64>(&mut conn).await {
            Ok(keys) => Ok(Degraded::ok(StoreStats {
                keys,
                ..StoreStats::default()
            })),
            Err(e) => Ok(degrade(StoreStats::default(), e)),
        }
    }

    async fn lock(&self, name: &str, opts: LockOpts) -> ClientResult<bool> {
        let mut conn = self.conn.clone();
        let key = format!("{}{}", self.prefix, lock::lock_key(name));
        let owner = opts.owner.unwrap_or_else(lock::owner_token);

        // SET NX PX is natively a single atomic step
        let mut cmd = redis::cmd("SET");
        cmd.arg(&key).arg(&owner).arg("PX").arg(opts.ttl);
        if !opts.force {
            cmd.arg("NX");
        }

        match cmd.query_async::<_, Option<String>>(&mut conn).await {
            Ok(reply) => Ok(Degraded::ok(reply.is_some())),
            Err(e) => Ok(degrade(false, e)),
        }
    }

    async fn unlock(&self, name: &str) -> ClientResult<()> {
        let mut conn = self.conn.clone();
        let key = format!("{}{}", self.prefix, lock::lock_key(name));

        match conn.del::<_, u64>(&key).await {
            Ok(_) => Ok(Degraded::ok(())),
            Err(e) => Ok(degrade((), e)),
        }
    }

    async fn limiter(&self, opts: LimiterOpts) -> ClientResult<LimiterVerdict> {
        let mut conn = self.conn.clone();
        let key = format!("{}{}{}", self.prefix, LIMITER_PREFIX, opts.name);
        let cap = MAX_BACKOFF_MS.max(opts.interval);

        let result: Result<Vec<String>, _> = self
            .limiter_script
            .key(&key)
            .arg(now_ms())
            .arg(opts.rate)
            .arg(opts.max)
            .arg(opts.interval)
            .arg(opts.ttl.unwrap_or(0))
            .arg(opts.reset)
            .arg(opts.multiplier)
            .arg(opts.consume)
            .arg(cap)
            .invoke_async(&mut conn)
            .await;

        match result {
            Ok(fields) => Ok(Degraded::ok(parse_verdict(&fields))),
            // a failed script check must never throttle the request path
            Err(e) => Ok(degrade(LimiterVerdict::default(), e)),
        }
    }
}
