//! Request statistics for the registry.
//!
//! Global counters plus per-identity accumulators with a bounded latency
//! window for average and p95 figures.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Registry-wide counters.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub sessions_created: u64,
    pub requests_made: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub proxy_switches: u64,
    pub rate_limited: u64,
    pub retries: u64,
    pub average_latency: Option<Duration>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            sessions_created: 0,
            requests_made: 0,
            successful_requests: 0,
            failed_requests: 0,
            proxy_switches: 0,
            rate_limited: 0,
            retries: 0,
            average_latency: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IdentityStats {
    pub identity: String,
    pub total_requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    pub consecutive_failures: u32,
    pub last_status: Option<u16>,
}

impl IdentityStats {
    fn from_accumulator(identity: &str, acc: &IdentityAccumulator) -> Self {
        let (avg, p95) = acc.latency_stats();
        Self {
            identity: identity.to_string(),
            total_requests: acc.total_requests,
            successes: acc.successes,
            failures: acc.failures,
            average_latency: avg,
            p95_latency: p95,
            consecutive_failures: acc.consecutive_failures,
            last_status: acc.last_status,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub global: GlobalStats,
    pub identities: Vec<IdentityStats>,
}

impl StatsSnapshot {
    pub fn identity(&self, identity: &str) -> Option<&IdentityStats> {
        self.identities.iter().find(|stats| stats.identity == identity)
    }
}

#[derive(Debug)]
struct IdentityAccumulator {
    total_requests: u64,
    successes: u64,
    failures: u64,
    latencies: VecDeque<Duration>,
    max_window: usize,
    consecutive_failures: u32,
    last_status: Option<u16>,
}

impl IdentityAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            total_requests: 0,
            successes: 0,
            failures: 0,
            latencies: VecDeque::with_capacity(max_window),
            max_window,
            consecutive_failures: 0,
            last_status: None,
        }
    }

    fn record_outcome(&mut self, success: bool) {
        self.total_requests += 1;
        if success {
            self.successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.failures += 1;
            self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        }
    }

    fn record_latency(&mut self, latency: Duration) {
        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }

    fn latency_stats(&self) -> (Option<Duration>, Option<Duration>) {
        if self.latencies.is_empty() {
            return (None, None);
        }
        let mut samples: Vec<_> = self.latencies.iter().cloned().collect();
        samples.sort_unstable();
        let avg = samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64;
        let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        (Some(Duration::from_secs_f64(avg)), Some(samples[p95_index]))
    }
}

#[derive(Debug)]
struct StatsState {
    global: GlobalStats,
    max_window: usize,
    identities: HashMap<String, IdentityAccumulator>,
}

impl StatsState {
    fn new(max_window: usize) -> Self {
        Self {
            global: GlobalStats::default(),
            max_window,
            identities: HashMap::new(),
        }
    }

    fn accumulator_mut(&mut self, identity: &str) -> &mut IdentityAccumulator {
        let window = self.max_window;
        self.identities
            .entry(identity.to_string())
            .or_insert_with(|| IdentityAccumulator::new(window))
    }
}

/// Thread-safe statistics shared by every client of a registry.
#[derive(Clone, Debug)]
pub struct StatsCollector {
    inner: Arc<Mutex<StatsState>>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::with_window(128)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatsState::new(window.max(16)))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StatsState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record_session_created(&self) {
        self.lock().global.sessions_created += 1;
    }

    /// A request that produced a response; `< 400` counts as success.
    pub fn record_response(&self, identity: &str, status: u16, latency: Duration) {
        let mut guard = self.lock();
        let success = status < 400;
        guard.global.requests_made += 1;
        if success {
            guard.global.successful_requests += 1;
        } else {
            guard.global.failed_requests += 1;
        }

        guard.global.average_latency = Some(match guard.global.average_latency {
            Some(avg) => {
                Duration::from_secs_f64(avg.as_secs_f64() * 0.9 + latency.as_secs_f64() * 0.1)
            }
            None => latency,
        });

        let acc = guard.accumulator_mut(identity);
        acc.record_outcome(success);
        acc.last_status = Some(status);
        acc.record_latency(latency);
    }

    /// A request that ended without a usable response.
    pub fn record_failure(&self, identity: &str) {
        let mut guard = self.lock();
        guard.global.requests_made += 1;
        guard.global.failed_requests += 1;
        let acc = guard.accumulator_mut(identity);
        acc.record_outcome(false);
        acc.last_status = None;
    }

    pub fn record_proxy_switch(&self) {
        self.lock().global.proxy_switches += 1;
    }

    pub fn record_rate_limited(&self) {
        self.lock().global.rate_limited += 1;
    }

    pub fn record_retry(&self) {
        self.lock().global.retries += 1;
    }

    pub fn forget(&self, identity: &str) {
        self.lock().identities.remove(identity);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let guard = self.lock();
        let mut identities: Vec<_> = guard
            .identities
            .iter()
            .map(|(identity, acc)| IdentityStats::from_accumulator(identity, acc))
            .collect();
        identities.sort_by(|a, b| a.identity.cmp(&b.identity));
        StatsSnapshot {
            global: guard.global.clone(),
            identities,
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
