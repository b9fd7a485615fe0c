//! Pipeline metrics feeding the stats aggregator.

use std::{
    collections::VecDeque,
    sync::{atomic::AtomicU64, Mutex},
    time::{Duration, Instant},
};

const LATENCY_WINDOW: usize = 1024;
const ERROR_WINDOW: Duration = Duration::from_secs(3600);

pub struct Metrics {
    pub balance_updates: AtomicU64,
    pub transaction_events: AtomicU64,
    pub baselines_recorded: AtomicU64,
    pub duplicates_skipped: AtomicU64,
    pub updates_dropped: AtomicU64,
    latencies_us: Mutex<VecDeque<u64>>,
    error_times: Mutex<VecDeque<Instant>>,
    started_at: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            balance_updates: AtomicU64::new(0),
            transaction_events: AtomicU64::new(0),
            baselines_recorded: AtomicU64::new(0),
            duplicates_skipped: AtomicU64::new(0),
            updates_dropped: AtomicU64::new(0),
            latencies_us: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            error_times: Mutex::new(VecDeque::new()),
            started_at: Instant::now(),
        }
    }

    pub fn record_latency(&self, elapsed: Duration) {
        let mut window = self.latencies_us.lock().unwrap();
        if window.len() == LATENCY_WINDOW {
            window.pop_front();
        }
        window.push_back(elapsed.as_micros() as u64);
    }

    /// Rolling average processing latency over the recent window, in ms.
    pub fn avg_processing_ms(&self) -> f64 {
        let window = self.latencies_us.lock().unwrap();
        if window.is_empty() {
            return 0.0;
        }
        let sum: u64 = window.iter().sum();
        (sum as f64 / window.len() as f64) / 1000.0
    }

    pub fn record_error(&self) {
        let mut times = self.error_times.lock().unwrap();
        times.push_back(Instant::now());
    }

    /// Errors observed in the trailing hour. Prunes the window as it counts.
    pub fn errors_last_hour(&self) -> u32 {
        let mut times = self.error_times.lock().unwrap();
        let cutoff = Instant::now() - ERROR_WINDOW;
        while times.front().is_some_and(|t| *t < cutoff) {
            times.pop_front();
        }
        times.len() as u32
    }

    pub fn uptime_seconds(&self) -> i64 {
        self.started_at.elapsed().as_secs() as i64
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
