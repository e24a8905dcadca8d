//! In-memory coordination store
//!
//! Shared by every router instance holding the same `Arc<MemoryStore>`, which
//! makes it the backend for tests and single-host deployments. Supports fault
//! injection (outage, per-operation failures, random failure rate, latency).

use crate::common::{Error, Result};
use crate::store::CoordinationStore;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct Data {
    sorted_sets: HashMap<String, HashMap<String, u64>>,
    sets: HashMap<String, BTreeSet<String>>,
    hashes: HashMap<String, HashMap<String, String>>,
}

#[derive(Debug, Default)]
struct Faults {
    failing_ops: HashSet<&'static str>,
    failure_rate: f64,
    latency: Option<Duration>,
}

#[derive(Debug)]
pub struct MemoryStore {
    data: Mutex<Data>,
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
    available: AtomicBool,
    faults: Mutex<Faults>,
    calls: Mutex<HashMap<&'static str, u64>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(Data::default()),
            channels: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
            faults: Mutex::new(Faults::default()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Simulate a full outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make every call to `op` (e.g. `"zadd"`) fail until [`heal`](Self::heal).
    pub fn fail_on(&self, op: &'static str) {
        lock(&self.faults).failing_ops.insert(op);
    }

    /// Fail each call with probability `rate` (0.0..=1.0).
    pub fn set_failure_rate(&self, rate: f64) {
        lock(&self.faults).failure_rate = rate.clamp(0.0, 1.0);
    }

    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        lock(&self.faults).latency = latency;
    }

    /// Clear all injected faults.
    pub fn heal(&self) {
        *lock(&self.faults) = Faults::default();
        self.set_available(true);
    }

    /// Number of calls made to `op` so far.
    pub fn call_count(&self, op: &str) -> u64 {
        lock(&self.calls).get(op).copied().unwrap_or(0)
    }

    async fn check(&self, op: &'static str) -> Result<()> {
        *lock(&self.calls).entry(op).or_insert(0) += 1;

        let (latency, failing, rate) = {
            let faults = lock(&self.faults);
            (
                faults.latency,
                faults.failing_ops.contains(op),
                faults.failure_rate,
            )
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(Error::StoreUnavailable(format!("{}: store offline", op)));
        }
        if failing || (rate > 0.0 && rand::random::<f64>() < rate) {
            return Err(Error::StoreUnavailable(format!("{}: injected failure", op)));
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn zadd(&self, key: &str, members: &[(String, u64)]) -> Result<()> {
        self.check("zadd").await?;
        let mut data = lock(&self.data);
        let zset = data.sorted_sets.entry(key.to_string()).or_default();
        for (member, score) in members {
            zset.insert(member.clone(), *score);
        }
        Ok(())
    }

    async fn zrem(&self, key: &str, members: &[String]) -> Result<usize> {
        self.check("zrem").await?;
        let mut data = lock(&self.data);
        let Some(zset) = data.sorted_sets.get_mut(key) else {
            return Ok(0);
        };
        let removed = members.iter().filter(|m| zset.remove(*m).is_some()).count();
        if zset.is_empty() {
            data.sorted_sets.remove(key);
        }
        Ok(removed)
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, u64)>> {
        self.check("zrange").await?;
        let data = lock(&self.data);
        let mut members: Vec<(String, u64)> = data
            .sorted_sets
            .get(key)
            .map(|zset| zset.iter().map(|(m, s)| (m.clone(), *s)).collect())
            .unwrap_or_default();
        members.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        Ok(members)
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        self.check("sadd").await?;
        let mut data = lock(&self.data);
        Ok(data
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        self.check("srem").await?;
        let mut data = lock(&self.data);
        let Some(set) = data.sets.get_mut(key) else {
            return Ok(false);
        };
        let removed = set.remove(member);
        if set.is_empty() {
            data.sets.remove(key);
        }
        Ok(removed)
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        self.check("sismember").await?;
        let data = lock(&self.data);
        Ok(data.sets.get(key).is_some_and(|set| set.contains(member)))
    }

    async fn smembers(&self, key: &str) -> Result<BTreeSet<String>> {
        self.check("smembers").await?;
        let data = lock(&self.data);
        Ok(data.sets.get(key).cloned().unwrap_or_default())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.check("hget").await?;
        let data = lock(&self.data);
        Ok(data.hashes.get(key).and_then(|h| h.get(field)).cloned())
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.check("hset").await?;
        let mut data = lock(&self.data);
        data.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
        Ok(())
    }

    async fn hset_many(&self, key: &str, entries: &[(String, String)]) -> Result<()> {
        self.check("hset").await?;
        let mut data = lock(&self.data);
        let hash = data.hashes.entry(key.to_string()).or_default();
        for (field, value) in entries {
            hash.insert(field.clone(), value.clone());
        }
        Ok(())
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<usize> {
        self.check("hdel").await?;
        let mut data = lock(&self.data);
        let Some(hash) = data.hashes.get_mut(key) else {
            return Ok(0);
        };
        let removed = fields.iter().filter(|f| hash.remove(*f).is_some()).count();
        if hash.is_empty() {
            data.hashes.remove(key);
        }
        Ok(removed)
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.check("hgetall").await?;
        let data = lock(&self.data);
        Ok(data.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.check("hincrby").await?;
        let mut data = lock(&self.data);
        let hash = data.hashes.entry(key.to_string()).or_default();
        let current = match hash.get(field) {
            Some(raw) => raw.parse::<i64>().map_err(|_| {
                Error::Internal(format!("{}.{} is not an integer: {}", key, field, raw))
            })?,
            None => 0,
        };
        let next = current + delta;
        hash.insert(field.to_string(), next.to_string());
        Ok(next)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check("exists").await?;
        let data = lock(&self.data);
        Ok(data.sorted_sets.contains_key(key)
            || data.sets.contains_key(key)
            || data.hashes.contains_key(key))
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        self.check("publish").await?;
        let channels = lock(&self.channels);
        match channels.get(channel) {
            // A send error only means nobody is listening.
            Some(sender) => Ok(sender.send(payload.to_string()).unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>> {
        self.check("subscribe").await?;
        let mut channels = lock(&self.channels);
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Ok(sender.subscribe())
    }
}
