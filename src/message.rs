/// Wire vocabulary shared by members and the coordinator.
///
/// Each operation is one variant of the closed `Op` enum so the dispatch
/// match is checked for coverage at compile time.  All types serialize with
/// serde; `Request`/`Reply` are the member<->coordinator message format.
///
use serde::{Deserialize, Serialize};

pub type JsonValue = serde_json::Value;

/// structured options selecting the sub-structure and write semantics
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StoreOpts {
    /// target a map (hash) of this name; the op key addresses a field
    pub map: Option<String>,
    /// target a list (set) of this name; the op key addresses a member
    pub list: Option<String>,
    /// entry expiry in milliseconds from now
    pub ttl: Option<u64>,
    /// conditional write: apply only if absent or numerically greater
    pub setmax: bool,
    /// list get variant: pop one member with the anti-reprocessing guard
    pub pop: bool,
    /// which snapshots an incr should return
    pub returning: Option<Returning>,
}

impl StoreOpts {
    pub fn scalar() -> StoreOpts {
        StoreOpts::default()
    }

    pub fn map(name: &str) -> StoreOpts {
        StoreOpts {
            map: Some(name.to_string()),
            ..StoreOpts::default()
        }
    }

    pub fn list(name: &str) -> StoreOpts {
        StoreOpts {
            list: Some(name.to_string()),
            ..StoreOpts::default()
        }
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> StoreOpts {
        self.ttl = Some(ttl_ms);
        self
    }

    pub fn with_setmax(mut self) -> StoreOpts {
        self.setmax = true;
        self
    }

    pub fn with_pop(mut self) -> StoreOpts {
        self.pop = true;
        self
    }

    pub fn with_returning(mut self, returning: Returning) -> StoreOpts {
        self.returning = Some(returning);
        self
    }

    /// reject unsupported structure combinations up front; both backends
    /// report these to the caller instead of coercing
    pub fn validate(&self) -> Result<(), String> {
        if self.map.is_some() && self.list.is_some() {
            return Err("opts.map and opts.list are mutually exclusive".to_string());
        }
        if self.pop && self.list.is_none() {
            return Err("opts.pop requires opts.list".to_string());
        }
        Ok(())
    }
}

/// canonical text form of a list member or guard key: strings as-is,
/// anything else as compact JSON
pub fn member_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Returning {
    Old,
    #[default]
    New,
    Both,
}

/// one key or several; `"*"` selects all fields of a map or the full list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KeySel {
    One(String),
    Many(Vec<String>),
}

impl From<&str> for KeySel {
    fn from(key: &str) -> KeySel {
        KeySel::One(key.to_string())
    }
}

impl From<Vec<String>> for KeySel {
    fn from(keys: Vec<String>) -> KeySel {
        KeySel::Many(keys)
    }
}

/// a single counter or a batch of field/delta pairs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum IncrTarget {
    Key { key: String, delta: f64 },
    Fields(Vec<(String, f64)>),
}

impl IncrTarget {
    pub fn key(key: &str, delta: f64) -> IncrTarget {
        IncrTarget::Key {
            key: key.to_string(),
            delta,
        }
    }
}

/// token bucket parameters, one set per named limiter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterOpts {
    pub name: String,
    /// tokens refilled per interval
    pub rate: f64,
    /// bucket capacity
    pub max: f64,
    /// base refill interval in milliseconds
    pub interval: u64,
    /// state expiry in milliseconds
    pub ttl: Option<u64>,
    /// reset > 1 clears after N total requests; any positive value also
    /// clears immediately on a starved request
    pub reset: f64,
    /// interval backoff factor on starvation; negative values collapse the
    /// interval back to the base after a successful consume
    pub multiplier: f64,
    /// tokens spent by one allowed request
    pub consume: f64,
}

impl Default for LimiterOpts {
    fn default() -> LimiterOpts {
        LimiterOpts {
            name: String::new(),
            rate: 10.0,
            max: 10.0,
            interval: 1_000,
            ttl: None,
            reset: 0.0,
            multiplier: 0.0,
            consume: 1.0,
        }
    }
}

impl LimiterOpts {
    pub fn new(name: &str) -> LimiterOpts {
        LimiterOpts {
            name: name.to_string(),
            ..LimiterOpts::default()
        }
    }

    pub fn with_bucket(mut self, rate: f64, max: f64, interval_ms: u64) -> LimiterOpts {
        self.rate = rate;
        self.max = max;
        self.interval = interval_ms;
        self
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> LimiterOpts {
        self.ttl = Some(ttl_ms);
        self
    }

    pub fn with_reset(mut self, reset: f64) -> LimiterOpts {
        self.reset = reset;
        self
    }

    pub fn with_multiplier(mut self, multiplier: f64) -> LimiterOpts {
        self.multiplier = multiplier;
        self
    }

    pub fn with_consume(mut self, consume: f64) -> LimiterOpts {
        self.consume = consume;
        self
    }
}

/// limiter check outcome; `delay == 0` means the request is allowed
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterVerdict {
    /// milliseconds the caller should wait; 0 = not limited
    pub delay: u64,
    pub count: f64,
    pub total: u64,
    pub elapsed: u64,
    pub interval: u64,
}

impl LimiterVerdict {
    pub fn allowed(&self) -> bool {
        self.delay == 0
    }
}

/// old/new counter snapshots from an incr, per `Returning`
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncrSnapshot {
    pub old: Option<JsonValue>,
    pub new: Option<JsonValue>,
}

impl IncrSnapshot {
    /// shape the snapshots for the caller; single-counter snapshots
    /// collapse to bare numbers
    pub fn build(
        single: bool,
        old: serde_json::Map<String, JsonValue>,
        new: serde_json::Map<String, JsonValue>,
        returning: Option<Returning>,
    ) -> IncrSnapshot {
        let flatten = |m: serde_json::Map<String, JsonValue>| -> JsonValue {
            if single {
                m.into_iter()
                    .next()
                    .map(|(_, v)| v)
                    .unwrap_or(JsonValue::Null)
            } else {
                JsonValue::Object(m)
            }
        };

        match returning.unwrap_or_default() {
            Returning::Old => IncrSnapshot {
                old: Some(flatten(old)),
                new: None,
            },
            Returning::New => IncrSnapshot {
                old: None,
                new: Some(flatten(new)),
            },
            Returning::Both => IncrSnapshot {
                old: Some(flatten(old)),
                new: Some(flatten(new)),
            },
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    pub keys: u64,
    pub capacity: u64,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub uptime: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Op {
    Get {
        key: KeySel,
        opts: StoreOpts,
    },
    Put {
        key: String,
        value: JsonValue,
        opts: StoreOpts,
    },
    Incr {
        target: IncrTarget,
        opts: StoreOpts,
    },
    Del {
        key: String,
        opts: StoreOpts,
    },
    Clear {
        pattern: Option<String>,
    },
    Keys {
        pattern: Option<String>,
    },
    Stats,
    Lock {
        name: String,
        owner: String,
        ttl: u64,
        force: bool,
    },
    Unlock {
        name: String,
    },
    Limiter {
        opts: LimiterOpts,
    },
}

/// member -> coordinator; `id` present means a correlated reply is expected
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: Option<u64>,
    pub op: Op,
}

/// coordinator -> member, correlated by `id`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub id: u64,
    pub body: OpResult,
}

/// closed result set matching the operation vocabulary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpResult {
    None,
    Value(JsonValue),
    Values(Vec<JsonValue>),
    Flag(bool),
    Size(u64),
    Keys(Vec<String>),
    Counters(IncrSnapshot),
    Stats(StoreStats),
    Limiter(LimiterVerdict),
    /// protocol misuse reported back to the caller
    Unsupported(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opts_builders() {
        let opts = StoreOpts::map("session").with_ttl(5_000);
        assert_eq!(opts.map.as_deref(), Some("session"));
        assert_eq!(opts.ttl, Some(5_000));
        assert!(opts.list.is_none());
        assert!(!opts.setmax);

        let opts = StoreOpts::list("inbox").with_pop();
        assert_eq!(opts.list.as_deref(), Some("inbox"));
        assert!(opts.pop);
    }

    #[test]
    fn limiter_defaults() {
        let opts = LimiterOpts::new("api");
        assert_eq!(opts.name, "api");
        assert_eq!(opts.interval, 1_000);
        assert_eq!(opts.consume, 1.0);
        assert_eq!(opts.reset, 0.0);
    }

    #[test]
    fn request_round_trip() {
        let request = Request {
            id: Some(42),
            op: Op::Limiter {
                opts: LimiterOpts::new("api").with_bucket(1.0, 1.0, 100),
            },
        };

        let js = serde_json::to_string(&request).expect("should serialize");
        let parsed: Request = serde_json::from_str(&js).expect("should parse");

        assert_eq!(parsed.id, Some(42));
        match parsed.op {
            Op::Limiter { opts } => {
                assert_eq!(opts.name, "api");
                assert_eq!(opts.interval, 100);
            }
            _ => panic!("wrong op"),
        }
    }

    #[test]
    fn verdict_allowed() {
        let verdict = LimiterVerdict::default();
        assert!(verdict.allowed());

        let verdict = LimiterVerdict {
            delay: 95,
            ..LimiterVerdict::default()
        };
        assert!(!verdict.allowed());
    }
}
