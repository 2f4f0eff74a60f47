//! Shared state store port with an in-memory fallback.
//!
//! Conversation sessions, rate counters, block flags, and HITL aggregates
//! all live behind the [`StateStore`] trait. Two implementations:
//!
//! - **[`RestStateStore`]** — an Upstash-compatible Redis REST client
//!   (single-command POST, bearer token auth).
//! - **[`MemoryStateStore`]** — `HashMap` behind `std::sync::RwLock` with
//!   lazy TTL expiry, used for tests and as the degraded fallback.
//!
//! [`StateHandle`] wraps an optional remote store plus the memory fallback
//! behind a circuit breaker (`Closed → Open → HalfOpen`): three consecutive
//! remote failures open the circuit, a cooldown later one probe is admitted,
//! and a probe success closes it again. A state-store outage therefore
//! degrades to per-process guarantees instead of failing requests.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::warn;

/// Key/value port over the external shared state store.
///
/// Counters must use [`incr`](StateStore::incr) (atomic on the remote side),
/// never read-then-write.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
    /// Atomically increment a counter, returning the new value.
    async fn incr(&self, key: &str) -> Result<i64>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
    async fn list_push(&self, key: &str, value: &str) -> Result<()>;
    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>>;
    /// List keys matching a `prefix*` pattern. Used by admin surfaces only.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

// ═══════════════════════════════════════════════════════════════════════
// In-memory implementation
// ═══════════════════════════════════════════════════════════════════════

enum Entry {
    Value(String),
    List(Vec<String>),
}

struct Slot {
    entry: Entry,
    expires_at: Option<Instant>,
}

impl Slot {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory state store with lazy TTL expiry.
#[derive(Default)]
pub struct MemoryStateStore {
    slots: RwLock<HashMap<String, Slot>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop expired slots. Called opportunistically on writes so a
    /// long-running process does not accumulate dead sessions.
    fn sweep(slots: &mut HashMap<String, Slot>) {
        slots.retain(|_, slot| !slot.expired());
    }

    fn read_live(&self, key: &str) -> Option<String> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let slot = slots.get(key)?;
        if slot.expired() {
            return None;
        }
        match &slot.entry {
            Entry::Value(v) => Some(v.clone()),
            Entry::List(_) => None,
        }
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.read_live(key))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        Self::sweep(&mut slots);
        slots.insert(
            key.to_string(),
            Slot {
                entry: Entry::Value(value.to_string()),
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        slots.remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        let current = match slots.get(key) {
            Some(slot) if !slot.expired() => match &slot.entry {
                Entry::Value(v) => v.parse::<i64>().unwrap_or(0),
                Entry::List(_) => 0,
            },
            _ => 0,
        };
        let next = current + 1;
        let expires_at = slots.get(key).filter(|s| !s.expired()).and_then(|s| s.expires_at);
        slots.insert(
            key.to_string(),
            Slot {
                entry: Entry::Value(next.to_string()),
                expires_at,
            },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        if let Some(slot) = slots.get_mut(key) {
            slot.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<()> {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        match slots.get_mut(key) {
            Some(slot) if !slot.expired() => {
                if let Entry::List(items) = &mut slot.entry {
                    items.push(value.to_string());
                    return Ok(());
                }
                slot.entry = Entry::List(vec![value.to_string()]);
            }
            _ => {
                slots.insert(
                    key.to_string(),
                    Slot {
                        entry: Entry::List(vec![value.to_string()]),
                        expires_at: None,
                    },
                );
            }
        }
        Ok(())
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        let Some(slot) = slots.get(key) else {
            return Ok(Vec::new());
        };
        if slot.expired() {
            return Ok(Vec::new());
        }
        let Entry::List(items) = &slot.entry else {
            return Ok(Vec::new());
        };
        // LRANGE semantics: negative indices count from the tail, the stop
        // index clamps to the last element, and a start past the end yields
        // an empty range rather than the tail.
        let len = items.len() as i64;
        if len == 0 {
            return Ok(Vec::new());
        }
        let a = if start < 0 { (len + start).max(0) } else { start };
        let b = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if a >= len || b < 0 || a > b {
            return Ok(Vec::new());
        }
        Ok(items[a as usize..=b as usize].to_vec())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let slots = self.slots.read().unwrap_or_else(|e| e.into_inner());
        Ok(slots
            .iter()
            .filter(|(k, slot)| k.starts_with(prefix) && !slot.expired())
            .map(|(k, _)| k.clone())
            .collect())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// REST (Upstash-compatible) implementation
// ═══════════════════════════════════════════════════════════════════════

/// Upstash-compatible Redis REST client.
///
/// Every command is a single `POST <base_url>` with a JSON array body
/// (e.g. `["SET", "k", "v", "EX", "60"]`) and a bearer token; responses
/// are `{"result": …}`.
pub struct RestStateStore {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl RestStateStore {
    pub fn new(base_url: &str, token: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build state store HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn command(&self, parts: &[&str]) -> Result<Value> {
        let response = self
            .client
            .post(&self.base_url)
            .bearer_auth(&self.token)
            .json(&json!(parts))
            .send()
            .await
            .context("State store request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("State store returned {}: {}", status, body));
        }

        let mut body: Value = response
            .json()
            .await
            .context("State store returned invalid JSON")?;
        Ok(body
            .get_mut("result")
            .map(Value::take)
            .unwrap_or(Value::Null))
    }
}

#[async_trait]
impl StateStore for RestStateStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.command(&["GET", key]).await? {
            Value::Null => Ok(None),
            Value::String(s) => Ok(Some(s)),
            other => Ok(Some(other.to_string())),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        match ttl {
            Some(t) => {
                let secs = t.as_secs().max(1).to_string();
                self.command(&["SET", key, value, "EX", &secs]).await?;
            }
            None => {
                self.command(&["SET", key, value]).await?;
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.command(&["DEL", key]).await?;
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        match self.command(&["INCR", key]).await? {
            Value::Number(n) => Ok(n.as_i64().unwrap_or(0)),
            other => Err(anyhow!("INCR returned non-number: {}", other)),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let secs = ttl.as_secs().max(1).to_string();
        self.command(&["EXPIRE", key, &secs]).await?;
        Ok(())
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<()> {
        self.command(&["RPUSH", key, value]).await?;
        Ok(())
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>> {
        let start = start.to_string();
        let stop = stop.to_string();
        match self.command(&["LRANGE", key, &start, &stop]).await? {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s),
                    _ => None,
                })
                .collect()),
            _ => Ok(Vec::new()),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}*", prefix);
        match self.command(&["KEYS", &pattern]).await? {
            Value::Array(items) => Ok(items
                .into_iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s),
                    _ => None,
                })
                .collect()),
            _ => Ok(Vec::new()),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Circuit breaker
// ═══════════════════════════════════════════════════════════════════════

const TRIP_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Small single-owner circuit breaker for the remote state store.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    cooldown: Duration,
}

impl CircuitBreaker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            cooldown,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    /// Whether a remote call may be attempted right now. An open circuit
    /// past its cooldown transitions to half-open and admits exactly one
    /// probe; further callers are held off until that probe settles via
    /// [`record_success`](Self::record_success) or
    /// [`record_failure`](Self::record_failure).
    pub fn allow(&mut self) -> bool {
        match self.state {
            BreakerState::Closed => true,
            // A probe is already in flight.
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|at| at.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    pub fn record_failure(&mut self) {
        match self.state {
            BreakerState::HalfOpen => {
                self.state = BreakerState::Open;
                self.opened_at = Some(Instant::now());
            }
            _ => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= TRIP_THRESHOLD {
                    self.state = BreakerState::Open;
                    self.opened_at = Some(Instant::now());
                }
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Handle: remote-with-fallback
// ═══════════════════════════════════════════════════════════════════════

/// Remote state store with in-memory fallback behind a circuit breaker.
///
/// Every operation tries the remote store when one is configured and the
/// breaker admits the call, and falls back to the process-local store on
/// failure. Infrastructure failure therefore never propagates to callers;
/// they just get weaker (per-process) guarantees.
pub struct StateHandle {
    remote: Option<Arc<dyn StateStore>>,
    memory: MemoryStateStore,
    breaker: Mutex<CircuitBreaker>,
}

impl StateHandle {
    /// Handle with no remote store: memory-only, breaker never consulted.
    pub fn memory_only() -> Self {
        Self {
            remote: None,
            memory: MemoryStateStore::new(),
            breaker: Mutex::new(CircuitBreaker::new(Duration::from_secs(30))),
        }
    }

    pub fn with_remote(remote: Arc<dyn StateStore>, cooldown: Duration) -> Self {
        Self {
            remote: Some(remote),
            memory: MemoryStateStore::new(),
            breaker: Mutex::new(CircuitBreaker::new(cooldown)),
        }
    }

    /// Current breaker state, for the health endpoint.
    pub fn breaker_state(&self) -> BreakerState {
        self.breaker.lock().unwrap_or_else(|e| e.into_inner()).state()
    }

    pub fn is_remote(&self) -> bool {
        self.remote.is_some()
    }

    fn admitted_remote(&self) -> Option<&Arc<dyn StateStore>> {
        let remote = self.remote.as_ref()?;
        let mut breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
        breaker.allow().then_some(remote)
    }

    fn settle(&self, outcome: &Result<()>) {
        let mut breaker = self.breaker.lock().unwrap_or_else(|e| e.into_inner());
        match outcome {
            Ok(()) => breaker.record_success(),
            Err(_) => breaker.record_failure(),
        }
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        if let Some(remote) = self.admitted_remote() {
            match remote.get(key).await {
                Ok(value) => {
                    self.settle(&Ok(()));
                    return value;
                }
                Err(e) => {
                    self.settle(&Err(e));
                    warn!(key, "state store get failed, using memory fallback");
                }
            }
        }
        self.memory.get(key).await.unwrap_or(None)
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) {
        if let Some(remote) = self.admitted_remote() {
            match remote.set(key, value, ttl).await {
                Ok(()) => {
                    self.settle(&Ok(()));
                    return;
                }
                Err(e) => {
                    self.settle(&Err(e));
                    warn!(key, "state store set failed, using memory fallback");
                }
            }
        }
        let _ = self.memory.set(key, value, ttl).await;
    }

    pub async fn delete(&self, key: &str) {
        if let Some(remote) = self.admitted_remote() {
            match remote.delete(key).await {
                Ok(()) => self.settle(&Ok(())),
                Err(e) => {
                    self.settle(&Err(e));
                    warn!(key, "state store delete failed");
                }
            }
        }
        let _ = self.memory.delete(key).await;
    }

    pub async fn incr(&self, key: &str) -> i64 {
        if let Some(remote) = self.admitted_remote() {
            match remote.incr(key).await {
                Ok(n) => {
                    self.settle(&Ok(()));
                    return n;
                }
                Err(e) => {
                    self.settle(&Err(e));
                    warn!(key, "state store incr failed, using memory fallback");
                }
            }
        }
        self.memory.incr(key).await.unwrap_or(0)
    }

    pub async fn expire(&self, key: &str, ttl: Duration) {
        if let Some(remote) = self.admitted_remote() {
            match remote.expire(key, ttl).await {
                Ok(()) => self.settle(&Ok(())),
                Err(e) => {
                    self.settle(&Err(e));
                    warn!(key, "state store expire failed");
                }
            }
        }
        let _ = self.memory.expire(key, ttl).await;
    }

    pub async fn list_push(&self, key: &str, value: &str) {
        if let Some(remote) = self.admitted_remote() {
            match remote.list_push(key, value).await {
                Ok(()) => {
                    self.settle(&Ok(()));
                    return;
                }
                Err(e) => {
                    self.settle(&Err(e));
                    warn!(key, "state store push failed, using memory fallback");
                }
            }
        }
        let _ = self.memory.list_push(key, value).await;
    }

    pub async fn list_range(&self, key: &str, start: i64, stop: i64) -> Vec<String> {
        if let Some(remote) = self.admitted_remote() {
            match remote.list_range(key, start, stop).await {
                Ok(items) => {
                    self.settle(&Ok(()));
                    return items;
                }
                Err(e) => {
                    self.settle(&Err(e));
                    warn!(key, "state store range failed, using memory fallback");
                }
            }
        }
        self.memory.list_range(key, start, stop).await.unwrap_or_default()
    }

    pub async fn scan_prefix(&self, prefix: &str) -> Vec<String> {
        if let Some(remote) = self.admitted_remote() {
            match remote.scan_prefix(prefix).await {
                Ok(keys) => {
                    self.settle(&Ok(()));
                    return keys;
                }
                Err(e) => {
                    self.settle(&Err(e));
                    warn!(prefix, "state store scan failed, using memory fallback");
                }
            }
        }
        self.memory.scan_prefix(prefix).await.unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_set_get_roundtrip() {
        let store = MemoryStateStore::new();
        store.set("k", "v", None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_ttl_expires() {
        let store = MemoryStateStore::new();
        store
            .set("k", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_incr_is_sequential() {
        let store = MemoryStateStore::new();
        assert_eq!(store.incr("n").await.unwrap(), 1);
        assert_eq!(store.incr("n").await.unwrap(), 2);
        assert_eq!(store.incr("n").await.unwrap(), 3);
    }

    #[tokio::test]
    async fn memory_list_range_negative_indices() {
        let store = MemoryStateStore::new();
        for v in ["a", "b", "c"] {
            store.list_push("l", v).await.unwrap();
        }
        assert_eq!(store.list_range("l", 0, -1).await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(store.list_range("l", -2, -1).await.unwrap(), vec!["b", "c"]);
    }

    #[tokio::test]
    async fn memory_list_range_out_of_bounds_is_empty() {
        let store = MemoryStateStore::new();
        for v in ["a", "b", "c"] {
            store.list_push("l", v).await.unwrap();
        }
        assert!(store.list_range("l", 5, 9).await.unwrap().is_empty());
        assert!(store.list_range("l", 3, -1).await.unwrap().is_empty());
        assert!(store.list_range("l", 0, -5).await.unwrap().is_empty());
        assert_eq!(store.list_range("l", 1, 99).await.unwrap(), vec!["b", "c"]);
    }

    #[test]
    fn breaker_trips_after_three_failures() {
        let mut breaker = CircuitBreaker::new(Duration::from_secs(30));
        assert!(breaker.allow());
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.allow());
    }

    #[test]
    fn breaker_half_open_probe() {
        let mut breaker = CircuitBreaker::new(Duration::from_millis(0));
        for _ in 0..3 {
            breaker.record_failure();
        }
        // Cooldown of zero: next allow() transitions to half-open.
        assert!(breaker.allow());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        breaker.record_failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        assert!(breaker.allow());
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn breaker_admits_one_probe_at_a_time() {
        let mut breaker = CircuitBreaker::new(Duration::from_millis(0));
        for _ in 0..3 {
            breaker.record_failure();
        }

        // First caller past the cooldown gets the probe; a concurrent
        // caller is held off until the probe settles.
        assert!(breaker.allow());
        assert!(!breaker.allow());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        assert!(breaker.allow());
        assert!(breaker.allow());
    }

    #[tokio::test]
    async fn handle_memory_only_roundtrip() {
        let handle = StateHandle::memory_only();
        handle.set("k", "v", None).await;
        assert_eq!(handle.get("k").await, Some("v".to_string()));
        assert_eq!(handle.incr("n").await, 1);
        assert_eq!(handle.incr("n").await, 2);
    }
}
