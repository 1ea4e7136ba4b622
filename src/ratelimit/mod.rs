use crate::models::Exchange;
use rand::Rng;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio::time::{sleep, Duration, Instant};

/// Exchanges enforce separate sub-limits for order management and market
/// data, so each class gets its own bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Orders,
    MarketData,
}

/// Queue lane for `acquire`. Urgent requests (profit-taking closes) are
/// served ahead of all queued normal requests, FIFO within a lane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Urgent,
    Normal,
}

/// Documented exchange limit for one bucket
#[derive(Debug, Clone, Copy)]
pub struct LimitConfig {
    pub capacity: f64,
    /// Tokens per second
    pub refill_rate: f64,
}

/// Limiter-wide tuning
#[derive(Debug, Clone)]
pub struct LimiterSettings {
    /// Fraction of the documented capacity we allow ourselves to use,
    /// leaving headroom for bursts from other processes
    pub utilization_cap: f64,
    /// Tokens drained on each reported throttle
    pub throttle_penalty: f64,
    /// Consecutive throttles before entering conservative mode
    pub conservative_threshold: u32,
    /// Consecutive successes required to leave conservative mode
    pub recovery_successes: u32,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            utilization_cap: 0.90,
            throttle_penalty: 5.0,
            conservative_threshold: 3,
            recovery_successes: 10,
        }
    }
}

/// Point-in-time view of one bucket, for logging and tests
#[derive(Debug, Clone, Copy)]
pub struct BucketSnapshot {
    pub tokens: f64,
    pub conservative: bool,
    pub consecutive_throttles: u32,
}

struct Bucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
    conservative: bool,
    consecutive_throttles: u32,
    success_streak: u32,
    urgent: VecDeque<u64>,
    normal: VecDeque<u64>,
    next_ticket: u64,
    notify: Arc<Notify>,
}

impl Bucket {
    fn new(limit: LimitConfig, settings: &LimiterSettings) -> Self {
        let effective = (limit.capacity * settings.utilization_cap).max(1.0);
        Self {
            capacity: limit.capacity,
            refill_rate: limit.refill_rate,
            tokens: effective,
            last_refill: Instant::now(),
            conservative: false,
            consecutive_throttles: 0,
            success_streak: 0,
            urgent: VecDeque::new(),
            normal: VecDeque::new(),
            next_ticket: 0,
            notify: Arc::new(Notify::new()),
        }
    }

    /// Capacity we allow ourselves right now. Halved while conservative,
    /// but never below one token: grants need a whole token, so a sub-unit
    /// cap would starve `acquire` forever.
    fn effective_capacity(&self, settings: &LimiterSettings) -> f64 {
        let capped = self.capacity * settings.utilization_cap;
        let capped = if self.conservative {
            capped / 2.0
        } else {
            capped
        };
        capped.max(1.0)
    }

    fn effective_refill_rate(&self) -> f64 {
        if self.conservative {
            self.refill_rate / 2.0
        } else {
            self.refill_rate
        }
    }

    /// Lazy continuous refill, computed on every access
    fn refill(&mut self, now: Instant, settings: &LimiterSettings) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;
        let cap = self.effective_capacity(settings);
        self.tokens = (self.tokens + elapsed * self.effective_refill_rate()).min(cap);
    }

    /// Is this ticket the next one the queue discipline allows through?
    fn at_head(&self, ticket: u64, priority: Priority) -> bool {
        match priority {
            Priority::Urgent => self.urgent.front() == Some(&ticket),
            Priority::Normal => self.urgent.is_empty() && self.normal.front() == Some(&ticket),
        }
    }

    fn dequeue(&mut self, ticket: u64, priority: Priority) {
        let lane = match priority {
            Priority::Urgent => &mut self.urgent,
            Priority::Normal => &mut self.normal,
        };
        lane.retain(|t| *t != ticket);
    }
}

/// Per-exchange, per-endpoint-class leaky-bucket gate.
///
/// `acquire` never fails, it only delays; callers bound total wall-clock
/// time with their own retry budget. All bucket state is owned by this
/// instance, shared via `Arc`, and mutated under one mutex (critical
/// sections never await).
pub struct RateLimiter {
    settings: LimiterSettings,
    buckets: Mutex<HashMap<(Exchange, EndpointClass), Bucket>>,
    overrides: HashMap<(Exchange, EndpointClass), LimitConfig>,
}

impl RateLimiter {
    pub fn new(settings: LimiterSettings) -> Self {
        Self {
            settings,
            buckets: Mutex::new(HashMap::new()),
            overrides: HashMap::new(),
        }
    }

    /// Replace the documented limit for one bucket (tests, exotic accounts)
    pub fn with_limit(
        mut self,
        exchange: Exchange,
        class: EndpointClass,
        limit: LimitConfig,
    ) -> Self {
        self.overrides.insert((exchange, class), limit);
        self
    }

    /// Documented per-exchange limits, conservative readings of each
    /// exchange's published REST limits
    fn default_limit(exchange: Exchange, class: EndpointClass) -> LimitConfig {
        match (exchange, class) {
            // 100 orders / 10s
            (Exchange::Binance, EndpointClass::Orders) => LimitConfig {
                capacity: 100.0,
                refill_rate: 10.0,
            },
            (Exchange::Binance, EndpointClass::MarketData) => LimitConfig {
                capacity: 120.0,
                refill_rate: 20.0,
            },
            (Exchange::Bybit, EndpointClass::Orders) => LimitConfig {
                capacity: 50.0,
                refill_rate: 10.0,
            },
            (Exchange::Bybit, EndpointClass::MarketData) => LimitConfig {
                capacity: 100.0,
                refill_rate: 20.0,
            },
            // 60 / 2s
            (Exchange::Okx, EndpointClass::Orders) => LimitConfig {
                capacity: 60.0,
                refill_rate: 30.0,
            },
            (Exchange::Okx, EndpointClass::MarketData) => LimitConfig {
                capacity: 20.0,
                refill_rate: 10.0,
            },
        }
    }

    fn limit_for(&self, exchange: Exchange, class: EndpointClass) -> LimitConfig {
        self.overrides
            .get(&(exchange, class))
            .copied()
            .unwrap_or_else(|| Self::default_limit(exchange, class))
    }

    /// Block until a token is available, then deduct it. Cost is pre-paid:
    /// there is no release.
    pub async fn acquire(&self, exchange: Exchange, class: EndpointClass, priority: Priority) {
        let key = (exchange, class);
        let (ticket, notify) = {
            let mut buckets = self.buckets.lock().unwrap();
            let settings = &self.settings;
            let limit = self.limit_for(exchange, class);
            let bucket = buckets
                .entry(key)
                .or_insert_with(|| Bucket::new(limit, settings));
            let ticket = bucket.next_ticket;
            bucket.next_ticket += 1;
            match priority {
                Priority::Urgent => bucket.urgent.push_back(ticket),
                Priority::Normal => bucket.normal.push_back(ticket),
            }
            (ticket, bucket.notify.clone())
        };

        let guard = QueueGuard {
            limiter: self,
            key,
            ticket,
            priority,
            granted: false,
        };
        guard.wait_for_token(notify).await;
    }

    /// Report a rate-limit rejection from a downstream call. Drains a token
    /// penalty and escalates into conservative mode after repeated hits.
    pub fn record_throttle(&self, exchange: Exchange, class: EndpointClass) {
        let mut buckets = self.buckets.lock().unwrap();
        let Some(bucket) = buckets.get_mut(&(exchange, class)) else {
            return;
        };
        bucket.refill(Instant::now(), &self.settings);
        bucket.tokens = (bucket.tokens - self.settings.throttle_penalty).max(0.0);
        bucket.consecutive_throttles += 1;
        bucket.success_streak = 0;
        tracing::warn!(
            "{} {:?}: throttled ({} consecutive)",
            exchange,
            class,
            bucket.consecutive_throttles
        );
        if bucket.consecutive_throttles >= self.settings.conservative_threshold
            && !bucket.conservative
        {
            bucket.conservative = true;
            bucket.tokens = 0.0;
            tracing::warn!("{} {:?}: entering conservative mode", exchange, class);
        }
    }

    /// Report a successful downstream call. Resets the throttle streak and
    /// nudges a conservative bucket back toward normal operation rather
    /// than snapping back instantly.
    pub fn record_success(&self, exchange: Exchange, class: EndpointClass) {
        let mut buckets = self.buckets.lock().unwrap();
        let Some(bucket) = buckets.get_mut(&(exchange, class)) else {
            return;
        };
        bucket.consecutive_throttles = 0;
        if bucket.conservative {
            bucket.success_streak += 1;
            let cap = bucket.effective_capacity(&self.settings);
            let nudge = cap / self.settings.recovery_successes as f64;
            bucket.tokens = (bucket.tokens + nudge).min(cap);
            if bucket.success_streak >= self.settings.recovery_successes {
                bucket.conservative = false;
                bucket.success_streak = 0;
                tracing::info!("{} {:?}: leaving conservative mode", exchange, class);
            }
        }
    }

    pub fn snapshot(&self, exchange: Exchange, class: EndpointClass) -> Option<BucketSnapshot> {
        let mut buckets = self.buckets.lock().unwrap();
        let bucket = buckets.get_mut(&(exchange, class))?;
        bucket.refill(Instant::now(), &self.settings);
        Some(BucketSnapshot {
            tokens: bucket.tokens,
            conservative: bucket.conservative,
            consecutive_throttles: bucket.consecutive_throttles,
        })
    }

    /// ±25% jitter so concurrent callers don't wake in lockstep
    fn jitter(wait: Duration) -> Duration {
        let factor = rand::thread_rng().gen_range(0.75..1.25);
        wait.mul_f64(factor)
    }
}

/// Removes its queue ticket on drop so an abandoned `acquire` can never
/// wedge the lane behind it.
struct QueueGuard<'a> {
    limiter: &'a RateLimiter,
    key: (Exchange, EndpointClass),
    ticket: u64,
    priority: Priority,
    granted: bool,
}

impl QueueGuard<'_> {
    async fn wait_for_token(mut self, notify: Arc<Notify>) {
        loop {
            let wait = {
                let mut buckets = self.limiter.buckets.lock().unwrap();
                let bucket = buckets
                    .get_mut(&self.key)
                    .expect("bucket exists while queued");
                bucket.refill(Instant::now(), &self.limiter.settings);
                if bucket.at_head(self.ticket, self.priority) && bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    bucket.dequeue(self.ticket, self.priority);
                    bucket.notify.notify_waiters();
                    self.granted = true;
                    return;
                }
                let deficit = (1.0 - bucket.tokens).max(0.0);
                let rate = bucket.effective_refill_rate();
                let base = if rate > 0.0 { deficit / rate } else { 1.0 };
                RateLimiter::jitter(Duration::from_secs_f64(base.max(0.01)))
            };
            tokio::select! {
                _ = notify.notified() => {}
                _ = sleep(wait) => {}
            }
        }
    }
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        if let Ok(mut buckets) = self.limiter.buckets.lock() {
            if let Some(bucket) = buckets.get_mut(&self.key) {
                bucket.dequeue(self.ticket, self.priority);
                bucket.notify.notify_waiters();
            }
        }
    }
}
