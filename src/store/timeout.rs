//! Per-call timeouts at the store boundary
//!
//! Wraps any [`CoordinationStore`] so that a hung backend turns into
//! [`Error::Timeout`] after a fixed bound instead of stalling the router.

use crate::common::{Error, Result};
use crate::store::CoordinationStore;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::time::Duration;
use tokio::sync::broadcast;

pub struct TimeoutStore<S> {
    inner: S,
    timeout: Duration,
}

impl<S: CoordinationStore> TimeoutStore<S> {
    pub fn new(inner: S, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn bounded<T>(&self, op: &str, fut: impl Future<Output = Result<T>> + Send) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!("{} exceeded {:?}", op, self.timeout))),
        }
    }
}

#[async_trait]
impl<S: CoordinationStore> CoordinationStore for TimeoutStore<S> {
    async fn zadd(&self, key: &str, members: &[(String, u64)]) -> Result<()> {
        self.bounded("zadd", self.inner.zadd(key, members)).await
    }

    async fn zrem(&self, key: &str, members: &[String]) -> Result<usize> {
        self.bounded("zrem", self.inner.zrem(key, members)).await
    }

    async fn zrange_with_scores(&self, key: &str) -> Result<Vec<(String, u64)>> {
        self.bounded("zrange", self.inner.zrange_with_scores(key))
            .await
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<bool> {
        self.bounded("sadd", self.inner.sadd(key, member)).await
    }

    async fn srem(&self, key: &str, member: &str) -> Result<bool> {
        self.bounded("srem", self.inner.srem(key, member)).await
    }

    async fn sismember(&self, key: &str, member: &str) -> Result<bool> {
        self.bounded("sismember", self.inner.sismember(key, member))
            .await
    }

    async fn smembers(&self, key: &str) -> Result<BTreeSet<String>> {
        self.bounded("smembers", self.inner.smembers(key)).await
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        self.bounded("hget", self.inner.hget(key, field)).await
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        self.bounded("hset", self.inner.hset(key, field, value)).await
    }

    async fn hset_many(&self, key: &str, entries: &[(String, String)]) -> Result<()> {
        self.bounded("hset", self.inner.hset_many(key, entries)).await
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> Result<usize> {
        self.bounded("hdel", self.inner.hdel(key, fields)).await
    }

    async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>> {
        self.bounded("hgetall", self.inner.hgetall(key)).await
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> Result<i64> {
        self.bounded("hincrby", self.inner.hincr_by(key, field, delta))
            .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.bounded("exists", self.inner.exists(key)).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<usize> {
        self.bounded("publish", self.inner.publish(channel, payload))
            .await
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<String>> {
        self.bounded("subscribe", self.inner.subscribe(channel))
            .await
    }
}
