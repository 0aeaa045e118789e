//! Progress accounting, kept free of any terminal concerns.
//!
//! The engine produces snapshot values; whatever front end is attached
//! (CLI bar, web socket, nothing) decides how to draw them.

use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Minimum interval between emitted updates.
pub const UPDATE_INTERVAL: Duration = Duration::from_millis(100);

/// Per-transfer entry in the aggregator.
struct Entry {
    filename: String,
    expected: AtomicU64,
    received: AtomicU64,
    complete: AtomicBool,
    started_at: Instant,
    ended_at: Mutex<Option<Instant>>,
}

/// One transfer's state at snapshot time.
#[derive(Clone, Debug, Serialize)]
pub struct FileProgress {
    pub id: String,
    pub filename: String,
    pub expected: u64,
    pub received: u64,
    pub complete: bool,
    pub elapsed_ms: u64,
}

/// Roll-up of every live transfer.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ProgressSnapshot {
    pub transfers: Vec<FileProgress>,
    pub total_expected: u64,
    pub total_received: u64,
}

impl ProgressSnapshot {
    pub fn is_complete(&self) -> bool {
        !self.transfers.is_empty() && self.transfers.iter().all(|t| t.complete)
    }
}

/// Multi-file aggregator keyed by session id (host mode: one entry per
/// concurrent upload).
#[derive(Clone, Default)]
pub struct ProgressAggregator {
    entries: Arc<DashMap<String, Arc<Entry>>>,
}

impl ProgressAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: &str, filename: &str, expected: u64) {
        self.entries
            .entry(id.to_string())
            .or_insert_with(|| {
                Arc::new(Entry {
                    filename: filename.to_string(),
                    expected: AtomicU64::new(expected),
                    received: AtomicU64::new(0),
                    complete: AtomicBool::new(false),
                    started_at: Instant::now(),
                    ended_at: Mutex::new(None),
                })
            });
    }

    /// Absolute received-byte count; replays recompute rather than add so
    /// retried chunks cannot inflate the number.
    pub fn set_received(&self, id: &str, received: u64) {
        if let Some(entry) = self.entries.get(id) {
            entry.received.store(received, Ordering::SeqCst);
        }
    }

    pub fn add_received(&self, id: &str, bytes: u64) {
        if let Some(entry) = self.entries.get(id) {
            entry.received.fetch_add(bytes, Ordering::SeqCst);
        }
    }

    pub fn mark_complete(&self, id: &str) {
        if let Some(entry) = self.entries.get(id) {
            if !entry.complete.swap(true, Ordering::SeqCst) {
                *entry.ended_at.lock().unwrap() = Some(Instant::now());
            }
        }
    }

    pub fn remove(&self, id: &str) {
        self.entries.remove(id);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let mut transfers: Vec<FileProgress> = self
            .entries
            .iter()
            .map(|pair| {
                let entry = pair.value();
                let end = entry.ended_at.lock().unwrap().unwrap_or_else(Instant::now);
                FileProgress {
                    id: pair.key().clone(),
                    filename: entry.filename.clone(),
                    expected: entry.expected.load(Ordering::SeqCst),
                    received: entry.received.load(Ordering::SeqCst),
                    complete: entry.complete.load(Ordering::SeqCst),
                    elapsed_ms: end.duration_since(entry.started_at).as_millis() as u64,
                }
            })
            .collect();
        transfers.sort_by(|a, b| a.id.cmp(&b.id));

        let total_expected = transfers.iter().map(|t| t.expected).sum();
        let total_received = transfers.iter().map(|t| t.received).sum();

        ProgressSnapshot {
            transfers,
            total_expected,
            total_received,
        }
    }
}

/// Byte meter for a single download stream: current, total, rolling speed
/// and ETA. Rendering decisions (bar width, redraw cadence) stay with the
/// caller; `should_emit` just enforces the 10 Hz cap.
pub struct TransferMeter {
    total: Option<u64>,
    current: AtomicU64,
    started_at: Instant,
    window: Mutex<SpeedWindow>,
    last_emit: Mutex<Instant>,
}

struct SpeedWindow {
    at: Instant,
    bytes: u64,
    speed: f64,
}

#[derive(Clone, Debug)]
pub struct MeterSnapshot {
    pub current: u64,
    pub total: Option<u64>,
    pub elapsed: Duration,
    /// Bytes per second over the most recent window
    pub speed: f64,
    pub eta: Option<Duration>,
}

impl TransferMeter {
    pub fn new(total: Option<u64>) -> Self {
        let now = Instant::now();
        Self {
            total,
            current: AtomicU64::new(0),
            started_at: now,
            window: Mutex::new(SpeedWindow {
                at: now,
                bytes: 0,
                speed: 0.0,
            }),
            last_emit: Mutex::new(now.checked_sub(UPDATE_INTERVAL).unwrap_or(now)),
        }
    }

    pub fn add(&self, bytes: u64) {
        let current = self.current.fetch_add(bytes, Ordering::SeqCst) + bytes;

        let mut window = self.window.lock().unwrap();
        let elapsed = window.at.elapsed();
        if elapsed >= UPDATE_INTERVAL {
            let delta = current - window.bytes;
            window.speed = delta as f64 / elapsed.as_secs_f64();
            window.at = Instant::now();
            window.bytes = current;
        }
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::SeqCst)
    }

    /// True at most ten times a second.
    pub fn should_emit(&self) -> bool {
        let mut last = self.last_emit.lock().unwrap();
        if last.elapsed() >= UPDATE_INTERVAL {
            *last = Instant::now();
            true
        } else {
            false
        }
    }

    pub fn snapshot(&self) -> MeterSnapshot {
        let current = self.current.load(Ordering::SeqCst);
        let speed = self.window.lock().unwrap().speed;
        let eta = match (self.total, speed > 0.0) {
            (Some(total), true) if total > current => Some(Duration::from_secs_f64(
                (total - current) as f64 / speed,
            )),
            (Some(_), _) => Some(Duration::ZERO),
            (None, _) => None,
        };
        MeterSnapshot {
            current,
            total: self.total,
            elapsed: self.started_at.elapsed(),
            speed,
            eta,
        }
    }
}
