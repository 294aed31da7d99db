//! Idempotency cache for paid tool executions.
//!
//! One entry per execution key, created atomically after verify+execute.
//! Writes never overwrite an existing outcome (compare-and-swap), so the
//! first execution's bytes are what every duplicate replays. Entries fall
//! out by TTL or by LRU once the cap is hit; pruning runs on every access
//! under the cache lock. The cache is in-memory only and does not survive
//! the process.

use jsonrpc_core::Error as RpcError;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(600);
pub const DEFAULT_CAPACITY: usize = 1024;

/// Recorded result of one paid execution.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status_code: u16,
    /// Serialized tool result, when execution reached the tool.
    pub result: Option<Value>,
    /// RPC-level failure, when the envelope was rejected instead.
    pub rpc_error: Option<RpcError>,
    /// Execution succeeded without a tool error, so settlement is owed.
    pub requires_settle: bool,
    pub settled: bool,
    /// Opaque facilitator settle response, forwarded verbatim.
    pub payment_response: Option<String>,
    pub updated_at: Instant,
}

impl ExecutionOutcome {
    pub fn from_result(status_code: u16, result: Value) -> Self {
        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(true);
        Self {
            status_code,
            result: Some(result),
            rpc_error: None,
            requires_settle: !is_error,
            settled: false,
            payment_response: None,
            updated_at: Instant::now(),
        }
    }

    pub fn from_rpc_error(status_code: u16, error: RpcError) -> Self {
        Self {
            status_code,
            result: None,
            rpc_error: Some(error),
            requires_settle: false,
            settled: false,
            payment_response: None,
            updated_at: Instant::now(),
        }
    }
}

struct CacheInner {
    map: HashMap<String, ExecutionOutcome>,
    /// Recency order, oldest first.
    order: Vec<String>,
}

pub struct OutcomeCache {
    inner: Mutex<CacheInner>,
    ttl: Duration,
    capacity: usize,
}

impl OutcomeCache {
    pub fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                order: Vec::new(),
            }),
            ttl: if ttl.is_zero() { DEFAULT_TTL } else { ttl },
            capacity: if capacity == 0 {
                DEFAULT_CAPACITY
            } else {
                capacity
            },
        }
    }

    pub fn get(&self, key: &str) -> Option<ExecutionOutcome> {
        let mut inner = self.inner.lock();
        self.prune(&mut inner, Instant::now());
        let outcome = inner.map.get(key).cloned()?;
        touch_order(&mut inner.order, key);
        Some(outcome)
    }

    /// Insert unless present; the stored outcome (existing on collision)
    /// is returned, making the first write authoritative.
    pub fn insert_if_absent(&self, key: &str, outcome: ExecutionOutcome) -> ExecutionOutcome {
        let mut inner = self.inner.lock();
        self.prune(&mut inner, Instant::now());
        if let Some(existing) = inner.map.get(key) {
            return existing.clone();
        }
        inner.map.insert(key.to_string(), outcome.clone());
        inner.order.push(key.to_string());
        outcome
    }

    pub fn mark_settled(&self, key: &str, payment_response: String) -> Option<ExecutionOutcome> {
        let mut inner = self.inner.lock();
        self.prune(&mut inner, Instant::now());
        let entry = inner.map.get_mut(key)?;
        entry.settled = true;
        entry.payment_response = Some(payment_response);
        entry.updated_at = Instant::now();
        let updated = entry.clone();
        touch_order(&mut inner.order, key);
        Some(updated)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn prune(&self, inner: &mut CacheInner, now: Instant) {
        inner.map.retain(|_, outcome| {
            now.saturating_duration_since(outcome.updated_at) <= self.ttl
        });
        inner.order.retain(|key| inner.map.contains_key(key));
        while inner.map.len() > self.capacity {
            let evicted = inner.order.remove(0);
            inner.map.remove(&evicted);
        }
    }
}

fn touch_order(order: &mut Vec<String>, key: &str) {
    if let Some(pos) = order.iter().position(|k| k == key) {
        let entry = order.remove(pos);
        order.push(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok_outcome() -> ExecutionOutcome {
        ExecutionOutcome::from_result(200, json!({"isError": false, "content": []}))
    }

    #[test]
    fn requires_settle_follows_is_error() {
        let ok = ok_outcome();
        assert!(ok.requires_settle);

        let failed =
            ExecutionOutcome::from_result(200, json!({"isError": true, "content": []}));
        assert!(!failed.requires_settle);

        let rpc = ExecutionOutcome::from_rpc_error(
            400,
            jsonrpc_core::Error::invalid_request(),
        );
        assert!(!rpc.requires_settle);
    }

    #[test]
    fn insert_is_compare_and_swap() {
        let cache = OutcomeCache::new(DEFAULT_TTL, 16);
        let first = cache.insert_if_absent("k", ok_outcome());

        let mut second = ok_outcome();
        second.status_code = 500;
        let stored = cache.insert_if_absent("k", second);

        assert_eq!(stored.status_code, first.status_code);
        assert_eq!(cache.get("k").unwrap().status_code, first.status_code);
    }

    #[test]
    fn mark_settled_records_response() {
        let cache = OutcomeCache::new(DEFAULT_TTL, 16);
        cache.insert_if_absent("k", ok_outcome());

        let updated = cache.mark_settled("k", "{\"tx\":\"0xabc\"}".to_string()).unwrap();
        assert!(updated.settled);
        assert_eq!(updated.payment_response.as_deref(), Some("{\"tx\":\"0xabc\"}"));
    }

    #[test]
    fn ttl_expiry_prunes_on_access() {
        let cache = OutcomeCache::new(Duration::from_millis(10), 16);
        cache.insert_if_absent("k", ok_outcome());
        std::thread::sleep(Duration::from_millis(30));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn lru_cap_evicts_oldest() {
        let cache = OutcomeCache::new(DEFAULT_TTL, 2);
        cache.insert_if_absent("a", ok_outcome());
        cache.insert_if_absent("b", ok_outcome());
        // Refresh "a" so "b" is the eviction candidate.
        cache.get("a");
        cache.insert_if_absent("c", ok_outcome());

        assert!(cache.get("a").is_some());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }
}
