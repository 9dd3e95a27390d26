//! Performance metrics: bounded time series plus the JSON producers the
//! WebSocket dashboard consumes.
//!
//! Two ring buffers back the series: the last 1000 requests and the last 300
//! system samples; the oldest entry is evicted on insert. The three JSON
//! producers all emit a top-level `{"type": ..., "data": ...}` document:
//!
//! - `metrics` — request totals snapshot
//! - `request_rate` — 60 one-second buckets, oldest first
//! - `system_metrics` — the buffered system samples

use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Bound on the request history ring.
const MAX_REQUEST_HISTORY: usize = 1000;

/// Bound on the system-sample ring.
const MAX_SYSTEM_HISTORY: usize = 300;

/// Width of the request-rate window, in one-second buckets.
const RATE_WINDOW_SECS: u64 = 60;

/// One served request.
#[derive(Debug, Clone)]
pub struct RequestMetric {
    pub timestamp: Instant,
    pub response_time_ms: f64,
    pub status_code: u16,
    pub method: String,
    pub path: String,
}

/// One system sample.
#[derive(Debug, Clone)]
pub struct SystemMetric {
    pub timestamp_ms: u64,
    pub memory_mb: u64,
    pub cpu_percent: f64,
    pub active_connections: usize,
    pub total_requests: u64,
    pub requests_per_second: f64,
    pub queue_size: usize,
    pub thread_count: usize,
}

struct MetricsState {
    request_history: VecDeque<RequestMetric>,
    system_history: VecDeque<SystemMetric>,
    last_minute_reset: Instant,
    cpu_last_sample: Instant,
    cpu_last_requests: u64,
}

/// Shared metrics collector.
pub struct PerformanceMetrics {
    state: Mutex<MetricsState>,
    total_requests: AtomicU64,
    requests_last_minute: AtomicU64,
}

impl PerformanceMetrics {
    #[must_use]
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(MetricsState {
                request_history: VecDeque::with_capacity(MAX_REQUEST_HISTORY),
                system_history: VecDeque::with_capacity(MAX_SYSTEM_HISTORY),
                last_minute_reset: now,
                cpu_last_sample: now,
                cpu_last_requests: 0,
            }),
            total_requests: AtomicU64::new(0),
            requests_last_minute: AtomicU64::new(0),
        }
    }

    pub fn record_request(&self, method: &str, path: &str, status_code: u16, response_time_ms: f64) {
        let mut state = self.state.lock();

        state.request_history.push_back(RequestMetric {
            timestamp: Instant::now(),
            response_time_ms,
            status_code,
            method: method.to_string(),
            path: path.to_string(),
        });
        while state.request_history.len() > MAX_REQUEST_HISTORY {
            state.request_history.pop_front();
        }

        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.requests_last_minute.fetch_add(1, Ordering::Relaxed);

        // The per-minute counter resets on a one-minute cadence.
        if state.last_minute_reset.elapsed() >= Duration::from_secs(60) {
            self.requests_last_minute.store(0, Ordering::Relaxed);
            state.last_minute_reset = Instant::now();
        }
    }

    /// Record one system sample. `memory_mb = 0` and `cpu_percent < 0`
    /// request auto-detection.
    pub fn record_system_metrics(
        &self,
        memory_mb: u64,
        cpu_percent: f64,
        active_connections: usize,
        queue_size: usize,
        thread_count: usize,
    ) {
        let mut state = self.state.lock();

        let memory = if memory_mb > 0 {
            memory_mb
        } else {
            read_process_memory_mb()
        };
        let cpu = if cpu_percent >= 0.0 {
            cpu_percent
        } else {
            self.estimate_cpu(&mut state)
        };

        let sample = SystemMetric {
            timestamp_ms: now_unix_ms(),
            memory_mb: memory,
            cpu_percent: cpu,
            active_connections,
            total_requests: self.total_requests.load(Ordering::Relaxed),
            requests_per_second: self.requests_last_minute.load(Ordering::Relaxed) as f64 / 60.0,
            queue_size,
            thread_count,
        };

        state.system_history.push_back(sample);
        while state.system_history.len() > MAX_SYSTEM_HISTORY {
            state.system_history.pop_front();
        }
    }

    #[must_use]
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// `{"type":"metrics","data":{...}}` snapshot.
    #[must_use]
    pub fn metrics_json(&self) -> String {
        let _state = self.state.lock();
        json!({
            "type": "metrics",
            "data": {
                "total_requests": self.total_requests.load(Ordering::Relaxed),
                "requests_per_minute": self.requests_last_minute.load(Ordering::Relaxed),
                "timestamp": now_unix_ms(),
            }
        })
        .to_string()
    }

    /// `{"type":"request_rate","data":[...]}` — 60 one-second buckets,
    /// oldest first.
    #[must_use]
    pub fn request_rate_json(&self) -> String {
        let state = self.state.lock();
        let now = Instant::now();
        let now_ms = now_unix_ms();

        let mut counts = [0u64; RATE_WINDOW_SECS as usize];
        for metric in &state.request_history {
            let age = now.duration_since(metric.timestamp).as_secs();
            if age < RATE_WINDOW_SECS {
                counts[age as usize] += 1;
            }
        }

        let buckets: Vec<serde_json::Value> = (0..RATE_WINDOW_SECS)
            .rev()
            .map(|age| {
                json!({
                    "timestamp": now_ms.saturating_sub(age * 1000),
                    "count": counts[age as usize],
                })
            })
            .collect();

        json!({ "type": "request_rate", "data": buckets }).to_string()
    }

    /// `{"type":"system_metrics","data":[...]}` — buffered samples.
    #[must_use]
    pub fn system_metrics_json(&self) -> String {
        let state = self.state.lock();
        let samples: Vec<serde_json::Value> = state
            .system_history
            .iter()
            .map(|sample| {
                json!({
                    "timestamp": sample.timestamp_ms,
                    "memory_mb": sample.memory_mb,
                    "cpu_percent": round2(sample.cpu_percent),
                    "active_connections": sample.active_connections,
                    "total_requests": sample.total_requests,
                    "requests_per_second": round2(sample.requests_per_second),
                    "queue_size": sample.queue_size,
                    "thread_count": sample.thread_count,
                })
            })
            .collect();

        json!({ "type": "system_metrics", "data": samples }).to_string()
    }

    /// Rough CPU estimate derived from the request rate, capped at 100.
    fn estimate_cpu(&self, state: &mut MetricsState) -> f64 {
        let elapsed = state.cpu_last_sample.elapsed().as_secs();
        if elapsed == 0 {
            return 0.0;
        }
        let current = self.total_requests.load(Ordering::Relaxed);
        let rate = current.saturating_sub(state.cpu_last_requests) as f64 / elapsed as f64;
        state.cpu_last_requests = current;
        state.cpu_last_sample = Instant::now();
        (rate * 0.5).min(100.0)
    }
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// VmRSS from `/proc/self/status`, in MiB. 0 when unavailable.
fn read_process_memory_mb() -> u64 {
    let Ok(status) = std::fs::read_to_string("/proc/self/status") else {
        return 0;
    };
    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: u64 = rest
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            return kb / 1024;
        }
    }
    0
}
