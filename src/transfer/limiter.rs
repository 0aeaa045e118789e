//! Per-client token-bucket rate limiting.
//!
//! One bucket per client IP; writers drain tokens before every socket write
//! and wait cooperatively while the bucket refills. A periodic sweep drops
//! buckets that have been idle for an hour.

use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Idle age past which a client's bucket is dropped.
pub const IDLE_EVICTION: Duration = Duration::from_secs(60 * 60);
/// How often the registry sweeps for idle buckets.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(30 * 60);

const MIN_BURST: f64 = 4096.0;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket in bytes per second.
pub struct TokenBucket {
    rate: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn from_mbps(mbps: u64) -> Self {
        let rate = (mbps as f64) * 1_000_000.0 / 8.0;
        Self::new(rate)
    }

    fn new(rate: f64) -> Self {
        let burst = (rate / 10.0).max(MIN_BURST);
        Self {
            rate,
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn burst(&self) -> f64 {
        self.burst
    }

    /// Take `amount` tokens, sleeping until the bucket has refilled enough.
    /// Oversized requests (> burst) drain in burst-sized slices so one huge
    /// write cannot deadlock against the bucket cap.
    pub async fn acquire(&self, amount: u64) {
        let mut remaining = amount as f64;
        while remaining > 0.0 {
            let slice = remaining.min(self.burst);
            loop {
                let wait = {
                    let mut state = self.state.lock().unwrap();
                    let now = Instant::now();
                    let elapsed = now.duration_since(state.last_refill).as_secs_f64();
                    state.tokens = (state.tokens + elapsed * self.rate).min(self.burst);
                    state.last_refill = now;

                    if state.tokens >= slice {
                        state.tokens -= slice;
                        None
                    } else {
                        Some(Duration::from_secs_f64(
                            (slice - state.tokens) / self.rate,
                        ))
                    }
                };
                match wait {
                    None => break,
                    Some(delay) => tokio::time::sleep(delay).await,
                }
            }
            remaining -= slice;
        }
    }
}

struct RegistryEntry {
    bucket: Arc<TokenBucket>,
    last_access: Mutex<Instant>,
}

/// One bucket per client IP, created on first use.
pub struct LimiterRegistry {
    entries: DashMap<String, Arc<RegistryEntry>>,
    mbps: u64,
}

impl LimiterRegistry {
    pub fn new(mbps: u64) -> Self {
        Self {
            entries: DashMap::new(),
            mbps,
        }
    }

    pub fn for_client(&self, ip: &str) -> Arc<TokenBucket> {
        let entry = self
            .entries
            .entry(ip.to_string())
            .or_insert_with(|| {
                Arc::new(RegistryEntry {
                    bucket: Arc::new(TokenBucket::from_mbps(self.mbps)),
                    last_access: Mutex::new(Instant::now()),
                })
            })
            .value()
            .clone();

        *entry.last_access.lock().unwrap() = Instant::now();
        entry.bucket.clone()
    }

    /// Drop entries idle longer than `max_idle`; returns how many went.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.last_access.lock().unwrap().elapsed() < max_idle);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
