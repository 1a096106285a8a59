/// Bounded in-memory store owned by the coordinator.
///
/// A capacity-evicting key/value map with per-entry expiry.  This is the
/// backing-store collaborator: the coordination layer relies only on the
/// get/put/del/incr/exists/keys/clear/stats contract, not on the eviction
/// policy (an oldest-access-stamp scan here).
///
/// Every method takes `now` in epoch milliseconds so expiry is
/// deterministic under test.
///
use crate::message::{JsonValue, StoreStats};
use hashbrown::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// epoch milliseconds
pub fn now_ms() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as u64,
        Err(_) => 0,
    }
}

#[derive(Debug, Clone)]
struct Entry {
    value: JsonValue,
    expires: Option<u64>,
    stamp: u64,
}

#[derive(Debug)]
pub struct BoundedStore {
    capacity: usize,
    clock: u64,
    data: HashMap<String, Entry>,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl BoundedStore {
    pub fn new(capacity: usize) -> BoundedStore {
        BoundedStore {
            capacity: capacity.max(1),
            clock: 0,
            data: HashMap::with_capacity(capacity.min(1_024)),
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn expired(entry: &Entry, now: u64) -> bool {
        matches!(entry.expires, Some(at) if at <= now)
    }

    pub fn get(&mut self, key: &str, now: u64) -> Option<JsonValue> {
        if let Some(entry) = self.data.get(key) {
            if Self::expired(entry, now) {
                self.data.remove(key);
                self.misses += 1;
                return None;
            }
        }

        let stamp = self.tick();
        match self.data.get_mut(key) {
            Some(entry) => {
                entry.stamp = stamp;
                self.hits += 1;
                Some(entry.value.clone())
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn exists(&mut self, key: &str, now: u64) -> bool {
        self.get(key, now).is_some()
    }

    /// upsert.  `ttl` of `Some` sets a fresh expiry; `None` keeps the
    /// existing entry's expiry (new entries get none).
    pub fn put(&mut self, key: &str, value: JsonValue, ttl: Option<u64>, now: u64) {
        let stamp = self.tick();

        // a dead entry must not lend its expiry to the new value
        if let Some(entry) = self.data.get(key) {
            if Self::expired(entry, now) {
                self.data.remove(key);
            }
        }

        if let Some(entry) = self.data.get_mut(key) {
            entry.value = value;
            entry.stamp = stamp;
            if let Some(ttl) = ttl {
                entry.expires = Some(now + ttl);
            }
            return;
        }

        if self.data.len() >= self.capacity {
            self.evict(now);
        }

        self.data.insert(
            key.to_string(),
            Entry {
                value,
                expires: ttl.map(|t| now + t),
                stamp,
            },
        );
    }

    pub fn del(&mut self, key: &str, now: u64) -> bool {
        match self.data.remove(key) {
            Some(entry) => !Self::expired(&entry, now),
            None => false,
        }
    }

    /// atomic numeric add; a missing or non-numeric value counts as 0
    pub fn incr(&mut self, key: &str, delta: f64, ttl: Option<u64>, now: u64) -> f64 {
        let prior = self
            .get(key, now)
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let next = prior + delta;

        let value = serde_json::Number::from_f64(next)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null);
        self.put(key, value, ttl, now);
        next
    }

    pub fn keys(&mut self, pattern: Option<&str>, now: u64) -> Vec<String> {
        self.sweep(now);
        let mut list: Vec<String> = self
            .data
            .keys()
            .filter(|k| pattern_match(pattern, k))
            .cloned()
            .collect();
        list.sort();
        list
    }

    pub fn clear(&mut self, pattern: Option<&str>) -> u64 {
        let before = self.data.len();
        match pattern {
            None => self.data.clear(),
            Some(p) => self.data.retain(|k, _| !pattern_match(Some(p), k)),
        }
        (before - self.data.len()) as u64
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            keys: self.data.len() as u64,
            capacity: self.capacity as u64,
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            uptime: None,
        }
    }

    fn sweep(&mut self, now: u64) {
        self.data.retain(|_, entry| !Self::expired(entry, now));
    }

    fn evict(&mut self, now: u64) {
        self.sweep(now);
        if self.data.len() < self.capacity {
            return;
        }

        // oldest access stamp loses
        let victim = self
            .data
            .iter()
            .min_by_key(|(_, entry)| entry.stamp)
            .map(|(k, _)| k.clone());

        if let Some(key) = victim {
            self.data.remove(&key);
            self.evictions += 1;
        }
    }
}

fn pattern_match(pattern: Option<&str>, key: &str) -> bool {
    match pattern {
        None | Some("*") => true,
        Some(p) => match p.strip_suffix('*') {
            Some(prefix) => key.starts_with(prefix),
            None => key == p,
        },
    }
}
