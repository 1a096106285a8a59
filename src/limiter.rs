/// Token bucket rate limiter.
///
/// The algorithm lives in `tick()`, a pure function over the persisted
/// state.  The coordinator runs it inside its serialized dispatch loop;
/// the networked client runs the equivalent `LUA_TOKEN_BUCKET` script so
/// the whole load/refill/consume/persist step stays atomic under
/// concurrent member processes.
///
use crate::message::{LimiterOpts, LimiterVerdict};
use serde::{Deserialize, Serialize};

/// backoff never inflates the interval past this (or past the base
/// interval when that is already larger)
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// persisted per-name limiter state; the backoff-inflated `interval`
/// lives in the same blob as `count` so both change in one atomic step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterState {
    pub count: f64,
    pub mtime: u64,
    pub total: u64,
    pub interval: u64,
}

/// one limiter check.  Returns the state to persist (`None` means the
/// state was cleared by reset semantics) and the verdict for the caller.
pub fn tick(
    prev: Option<LimiterState>,
    opts: &LimiterOpts,
    now: u64,
) -> (Option<LimiterState>, LimiterVerdict) {
    let mut state = prev.unwrap_or(LimiterState {
        count: opts.max,
        mtime: now,
        total: 0,
        interval: opts.interval,
    });

    // clock skew: never let a future mtime starve the refill
    if now < state.mtime {
        state.mtime = now.saturating_sub(state.interval);
    }

    let elapsed = now - state.mtime;
    if state.count < opts.max {
        let refill = opts.rate * elapsed as f64 / state.interval.max(1) as f64;
        state.count = (state.count + refill).min(opts.max);
    }

    state.mtime = now;
    state.total += 1;

    if state.count < 1.0 {
        // starved
        if opts.multiplier != 0.0 {
            let cap = MAX_BACKOFF_MS.max(opts.interval);
            let grown = (state.interval as f64 * opts.multiplier.abs()) as u64;
            state.interval = grown.min(cap);
        }

        let verdict = LimiterVerdict {
            delay: state.interval.saturating_sub(elapsed).max(1),
            count: state.count,
            total: state.total,
            elapsed,
            interval: state.interval,
        };

        if opts.reset > 0.0 {
            (None, verdict)
        } else {
            (Some(state), verdict)
        }
    } else {
        state.count -= opts.consume;

        let verdict = LimiterVerdict {
            delay: 0,
            count: state.count,
            total: state.total,
            elapsed,
            interval: state.interval,
        };

        if opts.reset > 1.0 && state.total as f64 >= opts.reset {
            (None, verdict)
        } else {
            if opts.multiplier < 0.0 {
                // successful consume collapses the backoff
                state.interval = opts.interval;
            }
            (Some(state), verdict)
        }
    }
}

/// redis-side mirror of `tick()`.
///
/// KEYS[1] = limiter state key (hash: count, mtime, total, interval)
/// ARGV    = now, rate, max, base interval, ttl (0 = none), reset,
///           multiplier, consume, backoff cap
/// returns { delay, count, total, elapsed, interval } as strings
pub const LUA_TOKEN_BUCKET: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
local base = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])
local reset = tonumber(ARGV[6])
local mult = tonumber(ARGV[7])
local consume = tonumber(ARGV[8])
local cap = tonumber(ARGV[9])

local s = redis.call('HMGET', key, 'count', 'mtime', 'total', 'interval')
local count = tonumber(s[1])
local mtime = tonumber(s[2])
local total = tonumber(s[3])
local interval = tonumber(s[4])
if count == nil then
  count = max
  mtime = now
  total = 0
  interval = base
end
if interval < 1 then interval = 1 end

if now < mtime then
  mtime = now - interval
  if mtime < 0 then mtime = 0 end
end

local elapsed = now - mtime
if count < max then
  count = count + rate * elapsed / interval
  if count > max then count = max end
end
mtime = now
total = total + 1

local function persist()
  redis.call('HMSET', key, 'count', count, 'mtime', mtime, 'total', total, 'interval', interval)
  if ttl > 0 then redis.call('PEXPIRE', key, ttl) end
end

if count < 1 then
  if mult ~= 0 then
    local grown = interval * math.abs(mult)
    if grown > cap then grown = cap end
    interval = grown
  end
  if reset > 0 then
    redis.call('DEL', key)
  else
    persist()
  end
  local delay = interval - elapsed
  if delay < 1 then delay = 1 end
  return { tostring(delay), tostring(count), tostring(total), tostring(elapsed), tostring(interval) }
end

count = count - consume
if reset > 1 and total >= reset then
  redis.call('DEL', key)
else
  if mult < 0 then interval = base end
  persist()
end
return { tostring(0), tostring(count), tostring(total), tostring(elapsed), tostring(interval) }
"#;
