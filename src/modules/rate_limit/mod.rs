//! Per-identity request spacing and retry backoff.
//!
//! The map lock only guards lookups and slot reservations; sleeps happen with
//! the lock released so one identity never stalls another.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::behavior::{ActionType, BehaviorClock};
use super::pacing::{Cancelled, DelayRange, Pacer, uniform};
use crate::config::{HourWindow, PacingConfig};

/// Spacing bookkeeping for one identity. Never persisted.
#[derive(Debug, Clone, Copy)]
pub struct RateState {
    pub last_request: Instant,
    pub request_count: u64,
}

#[derive(Debug, Default)]
struct Entry {
    state: Option<RateState>,
    behavior: Option<Arc<BehaviorClock>>,
}

/// What `wait_if_needed` decided and how long it actually slept.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PacingDecision {
    pub action: ActionType,
    /// Minimum gap required since the previous request.
    pub needed: Duration,
    pub waited: Duration,
    pub bootstrap: bool,
}

/// `min(cap, (2^attempt + jitter) * multiplier)` seconds.
pub fn backoff_delay(attempt: u32, jitter: f64, multiplier: Option<f64>, cap: f64) -> Duration {
    let exponential = 2f64.powi(attempt.min(32) as i32) + jitter.max(0.0);
    let stretched = exponential * multiplier.unwrap_or(1.0).max(1.0);
    Duration::from_secs_f64(stretched.min(cap).max(0.0))
}

#[derive(Debug)]
pub struct RateLimiter {
    pacer: Pacer,
    bootstrap_delay: DelayRange,
    business_hours: HourWindow,
    business_hours_multiplier: DelayRange,
    backoff_jitter: DelayRange,
    backoff_cap: f64,
    entries: Mutex<HashMap<String, Entry>>,
}

impl RateLimiter {
    pub fn new(pacer: Pacer, config: &PacingConfig) -> Self {
        Self {
            pacer,
            bootstrap_delay: config.bootstrap_delay,
            business_hours: config.business_hours,
            business_hours_multiplier: config.business_hours_multiplier,
            backoff_jitter: config.backoff_jitter,
            backoff_cap: config.backoff_cap_secs,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register(&self, identity: &str, behavior: Arc<BehaviorClock>) {
        self.lock().entry(identity.to_string()).or_default().behavior = Some(behavior);
    }

    pub fn forget(&self, identity: &str) {
        self.lock().remove(identity);
    }

    pub fn state(&self, identity: &str) -> Option<RateState> {
        self.lock().get(identity).and_then(|entry| entry.state)
    }

    pub fn request_count(&self, identity: &str) -> u64 {
        self.state(identity).map(|state| state.request_count).unwrap_or(0)
    }

    /// Waits until `identity` may issue its next `action`.
    ///
    /// The first request sleeps a bootstrap delay; later ones sleep whatever
    /// is left of the behavioural delay since the previous request. The slot
    /// is reserved under the map lock before sleeping, so concurrent callers
    /// for the same identity queue behind each other.
    pub async fn wait_if_needed(
        &self,
        identity: &str,
        action: ActionType,
    ) -> Result<PacingDecision, Cancelled> {
        let clock = self.pacer.clock();
        let decision = {
            let mut entries = self.lock();
            let entry = entries.entry(identity.to_string()).or_default();
            let now = clock.now();
            let (decision, slot) = match (entry.state, entry.behavior.clone()) {
                (Some(state), Some(behavior)) => {
                    let needed = behavior.action_delay(action);
                    let earliest = state.last_request + needed;
                    let wait = earliest.saturating_duration_since(now);
                    let decision = PacingDecision {
                        action,
                        needed,
                        waited: wait,
                        bootstrap: false,
                    };
                    (decision, now + wait)
                }
                _ => {
                    let delay = self.bootstrap_delay.sample();
                    let decision = PacingDecision {
                        action,
                        needed: delay,
                        waited: delay,
                        bootstrap: true,
                    };
                    (decision, now + delay)
                }
            };
            let count = entry.state.map(|state| state.request_count).unwrap_or(0) + 1;
            entry.state = Some(RateState {
                last_request: slot,
                request_count: count,
            });
            decision
        };

        if decision.bootstrap {
            log::debug!("{identity}: initial delay {:.2}s", decision.waited.as_secs_f64());
        } else if !decision.waited.is_zero() {
            log::debug!(
                "{identity}: behavioural delay {:.2}s ({action})",
                decision.waited.as_secs_f64()
            );
        }
        self.pacer.sleep(decision.waited).await?;
        Ok(decision)
    }

    /// Delay that `backoff` would sleep for `attempt` at the current hour.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let jitter = uniform(self.backoff_jitter.min, self.backoff_jitter.max);
        let multiplier = self
            .business_hours
            .contains(self.pacer.clock().local_hour())
            .then(|| uniform(self.business_hours_multiplier.min, self.business_hours_multiplier.max));
        backoff_delay(attempt, jitter, multiplier, self.backoff_cap)
    }

    pub async fn backoff(&self, identity: &str, attempt: u32) -> Result<Duration, Cancelled> {
        let delay = self.backoff_duration(attempt);
        log::info!(
            "{identity}: backing off {:.2}s (attempt {attempt})",
            delay.as_secs_f64()
        );
        self.pacer.sleep(delay).await?;
        Ok(delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::fingerprint::TimingProfile;
    use crate::modules::pacing::{Clock, ManualClock, ShutdownSignal};

    fn limiter(clock: Arc<ManualClock>) -> RateLimiter {
        let pacer = Pacer::new(clock, ShutdownSignal::new(), Duration::from_secs(1));
        RateLimiter::new(pacer, &PacingConfig::default())
    }

    #[test]
    fn backoff_is_monotone_and_capped() {
        let mut previous = Duration::ZERO;
        for attempt in 0..20 {
            let delay = backoff_delay(attempt, 1.0, Some(1.75), 300.0);
            assert!(delay >= previous);
            assert!(delay <= Duration::from_secs(300));
            previous = delay;
        }
        assert_eq!(backoff_delay(1, 0.5, None, 300.0), Duration::from_secs_f64(2.5));
    }

    #[tokio::test]
    async fn first_request_bootstraps() {
        let clock = Arc::new(ManualClock::new());
        let limiter = limiter(clock.clone());
        let decision = limiter.wait_if_needed("a", ActionType::Read).await.unwrap();
        assert!(decision.bootstrap);
        assert!(DelayRange::new(1.0, 5.0).contains(clock.total_slept().as_secs_f64()));
        assert_eq!(limiter.request_count("a"), 1);
    }

    #[tokio::test]
    async fn spaces_consecutive_requests() {
        let clock = Arc::new(ManualClock::with_hour(12));
        let limiter = limiter(clock.clone());
        let profile = TimingProfile {
            base_delay: 1.0,
            variance: 0.2,
            peak_hours: [12].into_iter().collect(),
        };
        limiter.register("a", Arc::new(BehaviorClock::new(profile, clock.clone())));

        limiter.wait_if_needed("a", ActionType::Click).await.unwrap();
        let first = clock.now();
        let decision = limiter.wait_if_needed("a", ActionType::Click).await.unwrap();
        let gap = clock.now() - first;
        assert!(!decision.bootstrap);
        assert!(gap + Duration::from_millis(1) >= decision.needed);
        assert_eq!(limiter.request_count("a"), 2);
    }

    #[tokio::test]
    async fn elapsed_time_counts_toward_delay() {
        let clock = Arc::new(ManualClock::with_hour(12));
        let limiter = limiter(clock.clone());
        let profile = TimingProfile {
            base_delay: 1.0,
            variance: 0.2,
            peak_hours: [12].into_iter().collect(),
        };
        limiter.register("a", Arc::new(BehaviorClock::new(profile, clock.clone())));
        limiter.wait_if_needed("a", ActionType::Click).await.unwrap();

        clock.advance(Duration::from_secs(600));
        let decision = limiter.wait_if_needed("a", ActionType::Click).await.unwrap();
        assert_eq!(decision.waited, Duration::ZERO);
    }

    #[tokio::test]
    async fn concurrent_requests_queue_behind_each_other() {
        let clock = Arc::new(ManualClock::with_hour(12));
        let limiter = limiter(clock.clone());
        let profile = TimingProfile {
            base_delay: 1.0,
            variance: 0.2,
            peak_hours: [12].into_iter().collect(),
        };
        limiter.register("a", Arc::new(BehaviorClock::new(profile, clock.clone())));
        limiter.wait_if_needed("a", ActionType::Click).await.unwrap();
        let start = clock.now();

        let (first, second) = tokio::join!(
            limiter.wait_if_needed("a", ActionType::Click),
            limiter.wait_if_needed("a", ActionType::Click)
        );
        let (first, second) = (first.unwrap(), second.unwrap());

        let last = limiter.state("a").unwrap().last_request;
        assert!(last.duration_since(start) + Duration::from_millis(1) >= first.needed + second.needed);
        assert_eq!(limiter.request_count("a"), 3);
    }

    #[tokio::test]
    async fn backoff_stretches_during_business_hours() {
        let clock = Arc::new(ManualClock::with_hour(3));
        let limiter = limiter(clock.clone());
        let night = limiter.backoff("a", 2).await.unwrap().as_secs_f64();
        assert!((4.0..=6.0).contains(&night));

        clock.set_hour(10);
        let day = limiter.backoff_duration(2).as_secs_f64();
        assert!((6.0..=12.0).contains(&day));
    }
}
