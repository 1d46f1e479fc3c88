use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

// Redis dependencies (only used by the Redis implementation)
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Unix-seconds clock seam so tests can drive TTL and window math.
pub trait Clock: Send + Sync {
    fn now_unix(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// Manually advanced clock for tests.
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(start: i64) -> Self {
        Self(AtomicI64::new(start))
    }

    pub fn advance(&self, secs: i64) {
        self.0.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, now: i64) {
        self.0.store(now, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_unix(&self) -> i64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Typed operations over the networked key-value store. All keys are logical;
/// implementations namespace them with an instance prefix.
#[async_trait]
pub trait KeyValue: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()>;
    /// SET NX EX; returns true when the sentinel was newly written.
    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool>;
    /// Atomic increment; returns the post-increment value.
    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64>;
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()>;
    /// Remaining TTL in seconds; negative per Redis conventions when absent.
    async fn ttl(&self, key: &str) -> Result<i64>;
    async fn del(&self, key: &str) -> Result<()>;
    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>>;
    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()>;
    async fn rpush(&self, key: &str, value: &str) -> Result<i64>;
    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>>;
    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()>;
    async fn llen(&self, key: &str) -> Result<i64>;
    /// Remove up to `count` occurrences of `value` (negative count scans from the tail).
    async fn lrem(&self, key: &str, count: isize, value: &str) -> Result<i64>;
}

// ---------------- Redis implementation ----------------

#[derive(Clone)]
pub struct RedisKeyValue {
    manager: ConnectionManager,
    prefix: String,
}

impl RedisKeyValue {
    pub async fn new(redis_url: &str, prefix: String) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let manager = ConnectionManager::new(client)
            .await
            .context("Failed to create Redis connection manager")?;
        Ok(Self { manager, prefix })
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }
}

#[async_trait]
impl KeyValue for RedisKeyValue {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.get(self.key(key)).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("EX")
            .arg(ttl_secs)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let mut conn = self.manager.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let mut conn = self.manager.clone();
        let value: i64 = conn.incr(self.key(key), delta).await?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let mut conn = self.manager.clone();
        redis::cmd("EXPIRE")
            .arg(self.key(key))
            .arg(ttl_secs)
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let mut conn = self.manager.clone();
        let ttl: i64 = redis::cmd("TTL").arg(self.key(key)).query_async(&mut conn).await?;
        Ok(ttl)
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.del(self.key(key)).await?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn.hget(self.key(key), field).await?;
        Ok(value)
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.hset(self.key(key), field, value).await?;
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<i64> {
        let mut conn = self.manager.clone();
        let len: i64 = conn.rpush(self.key(key), value).await?;
        Ok(len)
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let mut conn = self.manager.clone();
        let values: Vec<String> = conn.lrange(self.key(key), start, stop).await?;
        Ok(values)
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: () = conn.ltrim(self.key(key), start, stop).await?;
        Ok(())
    }

    async fn llen(&self, key: &str) -> Result<i64> {
        let mut conn = self.manager.clone();
        let len: i64 = conn.llen(self.key(key)).await?;
        Ok(len)
    }

    async fn lrem(&self, key: &str, count: isize, value: &str) -> Result<i64> {
        let mut conn = self.manager.clone();
        let removed: i64 = conn.lrem(self.key(key), count, value).await?;
        Ok(removed)
    }
}

// ---------------- In-memory implementation (tests) ----------------

#[derive(Clone)]
enum MemValue {
    Str(String),
    List(Vec<String>),
    Hash(HashMap<String, String>),
}

struct MemEntry {
    value: MemValue,
    expires_at: Option<i64>,
}

/// Test double with real TTL semantics driven by an injectable clock.
#[derive(Clone)]
pub struct MemoryKeyValue {
    inner: Arc<Mutex<HashMap<String, MemEntry>>>,
    clock: Arc<dyn Clock>,
}

impl MemoryKeyValue {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())), clock }
    }

    fn live<'a>(
        map: &'a mut HashMap<String, MemEntry>,
        key: &str,
        now: i64,
    ) -> Option<&'a mut MemEntry> {
        if let Some(entry) = map.get(key) {
            if entry.expires_at.map(|at| at <= now).unwrap_or(false) {
                map.remove(key);
                return None;
            }
        }
        map.get_mut(key)
    }
}

impl Default for MemoryKeyValue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValue for MemoryKeyValue {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now_unix();
        let mut map = self.inner.lock().await;
        Ok(match Self::live(&mut map, key, now) {
            Some(MemEntry { value: MemValue::Str(s), .. }) => Some(s.clone()),
            _ => None,
        })
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<()> {
        let now = self.clock.now_unix();
        let mut map = self.inner.lock().await;
        map.insert(
            key.to_string(),
            MemEntry { value: MemValue::Str(value.to_string()), expires_at: Some(now + ttl_secs as i64) },
        );
        Ok(())
    }

    async fn set_nx_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<bool> {
        let now = self.clock.now_unix();
        let mut map = self.inner.lock().await;
        if Self::live(&mut map, key, now).is_some() {
            return Ok(false);
        }
        map.insert(
            key.to_string(),
            MemEntry { value: MemValue::Str(value.to_string()), expires_at: Some(now + ttl_secs as i64) },
        );
        Ok(true)
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64> {
        let now = self.clock.now_unix();
        let mut map = self.inner.lock().await;
        let current = match Self::live(&mut map, key, now) {
            Some(MemEntry { value: MemValue::Str(s), .. }) => s.parse::<i64>().unwrap_or(0),
            _ => 0,
        };
        let next = current + delta;
        let expires_at = map.get(key).and_then(|e| e.expires_at);
        map.insert(
            key.to_string(),
            MemEntry { value: MemValue::Str(next.to_string()), expires_at },
        );
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<()> {
        let now = self.clock.now_unix();
        let mut map = self.inner.lock().await;
        if let Some(entry) = Self::live(&mut map, key, now) {
            entry.expires_at = Some(now + ttl_secs as i64);
        }
        Ok(())
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        let now = self.clock.now_unix();
        let mut map = self.inner.lock().await;
        Ok(match Self::live(&mut map, key, now) {
            Some(MemEntry { expires_at: Some(at), .. }) => (*at - now).max(0),
            Some(MemEntry { expires_at: None, .. }) => -1,
            None => -2,
        })
    }

    async fn del(&self, key: &str) -> Result<()> {
        let mut map = self.inner.lock().await;
        map.remove(key);
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let now = self.clock.now_unix();
        let mut map = self.inner.lock().await;
        Ok(match Self::live(&mut map, key, now) {
            Some(MemEntry { value: MemValue::Hash(hash), .. }) => hash.get(field).cloned(),
            _ => None,
        })
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        let now = self.clock.now_unix();
        let mut map = self.inner.lock().await;
        match Self::live(&mut map, key, now) {
            Some(MemEntry { value: MemValue::Hash(hash), .. }) => {
                hash.insert(field.to_string(), value.to_string());
            }
            _ => {
                let mut hash = HashMap::new();
                hash.insert(field.to_string(), value.to_string());
                map.insert(
                    key.to_string(),
                    MemEntry { value: MemValue::Hash(hash), expires_at: None },
                );
            }
        }
        Ok(())
    }

    async fn rpush(&self, key: &str, value: &str) -> Result<i64> {
        let now = self.clock.now_unix();
        let mut map = self.inner.lock().await;
        match Self::live(&mut map, key, now) {
            Some(MemEntry { value: MemValue::List(list), .. }) => {
                list.push(value.to_string());
                Ok(list.len() as i64)
            }
            _ => {
                map.insert(
                    key.to_string(),
                    MemEntry { value: MemValue::List(vec![value.to_string()]), expires_at: None },
                );
                Ok(1)
            }
        }
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>> {
        let now = self.clock.now_unix();
        let mut map = self.inner.lock().await;
        let list = match Self::live(&mut map, key, now) {
            Some(MemEntry { value: MemValue::List(list), .. }) => list,
            _ => return Ok(Vec::new()),
        };
        let len = list.len() as isize;
        let norm = |idx: isize| -> isize {
            if idx < 0 {
                (len + idx).max(0)
            } else {
                idx.min(len)
            }
        };
        let from = norm(start);
        let to = if stop < 0 { len + stop } else { stop.min(len - 1) };
        if len == 0 || from > to {
            return Ok(Vec::new());
        }
        Ok(list[from as usize..=(to.min(len - 1)) as usize].to_vec())
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> Result<()> {
        let now = self.clock.now_unix();
        let mut map = self.inner.lock().await;
        if let Some(MemEntry { value: MemValue::List(list), .. }) = Self::live(&mut map, key, now) {
            let len = list.len() as isize;
            let from = if start < 0 { (len + start).max(0) } else { start.min(len) };
            let to = if stop < 0 { len + stop } else { stop.min(len - 1) };
            if from > to || len == 0 {
                list.clear();
            } else {
                *list = list[from as usize..=(to.min(len - 1)) as usize].to_vec();
            }
        }
        Ok(())
    }

    async fn llen(&self, key: &str) -> Result<i64> {
        let now = self.clock.now_unix();
        let mut map = self.inner.lock().await;
        Ok(match Self::live(&mut map, key, now) {
            Some(MemEntry { value: MemValue::List(list), .. }) => list.len() as i64,
            _ => 0,
        })
    }

    async fn lrem(&self, key: &str, count: isize, value: &str) -> Result<i64> {
        let now = self.clock.now_unix();
        let mut map = self.inner.lock().await;
        let list = match Self::live(&mut map, key, now) {
            Some(MemEntry { value: MemValue::List(list), .. }) => list,
            _ => return Ok(0),
        };
        let mut removed = 0i64;
        let max_removals = if count == 0 { isize::MAX } else { count.abs() };
        if count >= 0 {
            let mut idx = 0;
            while idx < list.len() && removed < max_removals as i64 {
                if list[idx] == value {
                    list.remove(idx);
                    removed += 1;
                } else {
                    idx += 1;
                }
            }
        } else {
            let mut idx = list.len();
            while idx > 0 && removed < max_removals as i64 {
                idx -= 1;
                if list[idx] == value {
                    list.remove(idx);
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ttl_expiry_follows_clock() {
        let clock = Arc::new(ManualClock::new(1_000));
        let kv = MemoryKeyValue::with_clock(clock.clone());
        kv.set_ex("k", "v", 10).await.unwrap();
        assert_eq!(kv.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(kv.ttl("k").await.unwrap(), 10);
        clock.advance(10);
        assert_eq!(kv.get("k").await.unwrap(), None);
        assert_eq!(kv.ttl("k").await.unwrap(), -2);
    }

    #[tokio::test]
    async fn incr_starts_from_zero_and_keeps_ttl() {
        let clock = Arc::new(ManualClock::new(0));
        let kv = MemoryKeyValue::with_clock(clock.clone());
        assert_eq!(kv.incr_by("c", 1).await.unwrap(), 1);
        assert_eq!(kv.incr_by("c", 2).await.unwrap(), 3);
        kv.expire("c", 5).await.unwrap();
        assert_eq!(kv.incr_by("c", 1).await.unwrap(), 4);
        assert_eq!(kv.ttl("c").await.unwrap(), 5);
        clock.advance(6);
        assert_eq!(kv.incr_by("c", 1).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn set_nx_only_writes_once_per_ttl() {
        let clock = Arc::new(ManualClock::new(0));
        let kv = MemoryKeyValue::with_clock(clock.clone());
        assert!(kv.set_nx_ex("s", "1", 30).await.unwrap());
        assert!(!kv.set_nx_ex("s", "1", 30).await.unwrap());
        clock.advance(31);
        assert!(kv.set_nx_ex("s", "1", 30).await.unwrap());
    }

    #[tokio::test]
    async fn hash_fields_are_independent() {
        let kv = MemoryKeyValue::new();
        kv.hset("h", "tokens", "41").await.unwrap();
        kv.hset("h", "ts", "1700000000").await.unwrap();
        kv.hset("h", "tokens", "42").await.unwrap();
        assert_eq!(kv.hget("h", "tokens").await.unwrap().as_deref(), Some("42"));
        assert_eq!(kv.hget("h", "ts").await.unwrap().as_deref(), Some("1700000000"));
        assert_eq!(kv.hget("h", "missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_ops_trim_and_remove_from_tail() {
        let kv = MemoryKeyValue::new();
        for ts in ["10", "11", "12", "12", "13"] {
            kv.rpush("l", ts).await.unwrap();
        }
        assert_eq!(kv.llen("l").await.unwrap(), 5);
        // drop the two oldest
        kv.ltrim("l", 2, -1).await.unwrap();
        assert_eq!(kv.lrange("l", 0, -1).await.unwrap(), vec!["12", "12", "13"]);
        // tail-first removal takes the later duplicate
        assert_eq!(kv.lrem("l", -1, "12").await.unwrap(), 1);
        assert_eq!(kv.lrange("l", 0, -1).await.unwrap(), vec!["12", "13"]);
    }
}
