//! Rate-limited, de-duplicating work queue of reconciliation keys.
//!
//! A key handed out by [`WorkQueue::get`] stays in the processing set until
//! [`WorkQueue::done`] is called for it. Adds that arrive meanwhile only mark
//! the key dirty, so no two workers ever hold the same key at once; the key
//! goes back on the queue when the current holder releases it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::trace;

/// Decides how long a key waits before it is re-added.
pub trait RateLimiter: Send + Sync {
    fn when(&self, key: &str) -> Duration;
    fn forget(&self, key: &str);
    fn num_requeues(&self, key: &str) -> u32;
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `base * 2^failures`, capped at `max`.
pub struct ItemExponentialLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl ItemExponentialLimiter {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Mutex::new(HashMap::new()),
        }
    }
}

impl RateLimiter for ItemExponentialLimiter {
    fn when(&self, key: &str) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(key.to_string()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);
        2u32.checked_pow(exp)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |d| d.min(self.max))
    }

    fn forget(&self, key: &str) {
        lock(&self.failures).remove(key);
    }

    fn num_requeues(&self, key: &str) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token bucket shared by all keys. Each call reserves one token and
/// returns how long the caller has to wait for it. A `qps` that is not a
/// positive finite number disables the bucket.
pub struct BucketLimiter {
    qps: f64,
    burst: f64,
    bucket: Mutex<Bucket>,
}

impl BucketLimiter {
    pub fn new(qps: f64, burst: u32) -> Self {
        let qps = if qps.is_finite() && qps > 0.0 { qps } else { 0.0 };
        Self {
            qps,
            burst: burst as f64,
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last: Instant::now(),
            }),
        }
    }
}

impl RateLimiter for BucketLimiter {
    fn when(&self, _key: &str) -> Duration {
        if self.qps <= 0.0 {
            return Duration::ZERO;
        }
        let mut bucket = lock(&self.bucket);
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last);
        bucket.tokens =
            (bucket.tokens + elapsed.as_secs_f64() * self.qps).min(self.burst);
        bucket.last = now;
        bucket.tokens -= 1.0;
        if bucket.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-bucket.tokens / self.qps)
                .unwrap_or(Duration::MAX)
        }
    }

    fn forget(&self, _key: &str) {}

    fn num_requeues(&self, _key: &str) -> u32 {
        0
    }
}

/// Waits as long as the slowest of its limiters.
pub struct MaxOfLimiter {
    limiters: Vec<Box<dyn RateLimiter>>,
}

impl MaxOfLimiter {
    pub fn new(limiters: Vec<Box<dyn RateLimiter>>) -> Self {
        Self { limiters }
    }
}

impl RateLimiter for MaxOfLimiter {
    fn when(&self, key: &str) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.when(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    fn forget(&self, key: &str) {
        for l in &self.limiters {
            l.forget(key);
        }
    }

    fn num_requeues(&self, key: &str) -> u32 {
        self.limiters
            .iter()
            .map(|l| l.num_requeues(key))
            .max()
            .unwrap_or(0)
    }
}

#[derive(Default)]
struct QueueState {
    queue: VecDeque<String>,
    dirty: HashSet<String>,
    processing: HashSet<String>,
    shutting_down: bool,
}

struct Inner {
    state: Mutex<QueueState>,
    notify: Notify,
    limiter: Box<dyn RateLimiter>,
}

#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<Inner>,
}

impl WorkQueue {
    pub fn new(limiter: impl RateLimiter + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                notify: Notify::new(),
                limiter: Box::new(limiter),
            }),
        }
    }

    /// Enqueue `key`, coalescing with a pending entry for the same key.
    pub fn add(&self, key: &str) {
        let mut st = lock(&self.inner.state);
        if st.shutting_down || st.dirty.contains(key) {
            return;
        }
        st.dirty.insert(key.to_string());
        if st.processing.contains(key) {
            // re-queued by done()
            return;
        }
        st.queue.push_back(key.to_string());
        drop(st);
        self.inner.notify.notify_one();
    }

    pub fn add_after(&self, key: &str, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(key);
            return;
        }
        trace!(%key, ?delay, "queue: delayed add");
        let queue = self.clone();
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    pub fn add_rate_limited(&self, key: &str) {
        let delay = self.inner.limiter.when(key);
        self.add_after(key, delay);
    }

    pub fn forget(&self, key: &str) {
        self.inner.limiter.forget(key);
    }

    pub fn num_requeues(&self, key: &str) -> u32 {
        self.inner.limiter.num_requeues(key)
    }

    /// Blocks until a key is available. Returns `None` once the queue has
    /// been shut down and drained.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut st = lock(&self.inner.state);
                if let Some(key) = st.queue.pop_front() {
                    st.dirty.remove(&key);
                    st.processing.insert(key.clone());
                    if !st.queue.is_empty() {
                        // Notify keeps a single permit; pass it on.
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
                if st.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Like [`get`](Self::get), but the key is released when the returned
    /// guard drops.
    pub async fn next(&self) -> Option<InFlight> {
        let key = self.get().await?;
        Some(InFlight {
            queue: self.clone(),
            key,
        })
    }

    /// Release a key obtained from `get`.
    pub fn done(&self, key: &str) {
        let mut st = lock(&self.inner.state);
        st.processing.remove(key);
        if st.dirty.contains(key) {
            st.queue.push_back(key.to_string());
            drop(st);
            self.inner.notify.notify_one();
        }
    }

    pub fn shut_down(&self) {
        lock(&self.inner.state).shutting_down = true;
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        lock(&self.inner.state).shutting_down
    }

    /// Number of queued keys, not counting keys being processed.
    pub fn len(&self) -> usize {
        lock(&self.inner.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A key checked out of the queue.
pub struct InFlight {
    queue: WorkQueue,
    key: String,
}

impl InFlight {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.queue.done(&self.key);
    }
}
