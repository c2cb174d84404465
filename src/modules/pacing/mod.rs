//! Clock and interruptible sleep primitives.
//!
//! Every pause the client takes (behavioural delays, backoff, cooldowns) goes
//! through a [`Pacer`], which sleeps in short chunks so a shutdown request is
//! honoured within roughly one chunk instead of after a multi-minute wait.

use async_trait::async_trait;
use chrono::{DateTime, Local, Timelike, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Returned when a sleep was interrupted by the shutdown signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled by shutdown signal")]
pub struct Cancelled;

/// Time source used by the pacing layers.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    /// Monotonic instant used for request spacing.
    fn now(&self) -> Instant;
    /// Local hour of day (0..=23) used by circadian heuristics.
    fn local_hour(&self) -> u32;
    /// Wall-clock time used for persisted timestamps.
    fn wall_time(&self) -> DateTime<Utc>;
    async fn sleep(&self, duration: Duration);
}

/// Real clock backed by tokio timers.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn local_hour(&self) -> u32 {
        Local::now().hour()
    }

    fn wall_time(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug)]
struct ManualState {
    offset: Duration,
    hour: u32,
    sleeps: Vec<Duration>,
}

/// Virtual clock: sleeping advances time immediately and is recorded.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    wall_origin: DateTime<Utc>,
    state: Mutex<ManualState>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::with_hour(12)
    }

    pub fn with_hour(hour: u32) -> Self {
        Self {
            origin: Instant::now(),
            wall_origin: Utc::now(),
            state: Mutex::new(ManualState {
                offset: Duration::ZERO,
                hour: hour % 24,
                sleeps: Vec::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn advance(&self, duration: Duration) {
        self.state().offset += duration;
    }

    pub fn set_hour(&self, hour: u32) {
        self.state().hour = hour % 24;
    }

    /// Virtual time elapsed since the clock was created.
    pub fn elapsed(&self) -> Duration {
        self.state().offset
    }

    /// Every individual `sleep` call in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state().sleeps.clone()
    }

    pub fn total_slept(&self) -> Duration {
        self.state().sleeps.iter().sum()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.state().offset
    }

    fn local_hour(&self) -> u32 {
        self.state().hour
    }

    fn wall_time(&self) -> DateTime<Utc> {
        let offset = chrono::Duration::from_std(self.state().offset)
            .unwrap_or_else(|_| chrono::Duration::zero());
        self.wall_origin + offset
    }

    async fn sleep(&self, duration: Duration) {
        {
            let mut state = self.state();
            state.offset += duration;
            state.sleeps.push(duration);
        }
        tokio::task::yield_now().await;
    }
}

/// Cooperative shutdown flag shared by every worker.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Clock plus shutdown signal; the only way the core sleeps.
#[derive(Debug, Clone)]
pub struct Pacer {
    clock: Arc<dyn Clock>,
    shutdown: ShutdownSignal,
    chunk: Duration,
}

impl Pacer {
    pub fn new(clock: Arc<dyn Clock>, shutdown: ShutdownSignal, chunk: Duration) -> Self {
        let chunk = if chunk.is_zero() {
            Duration::from_secs(1)
        } else {
            chunk
        };
        Self {
            clock,
            shutdown,
            chunk,
        }
    }

    pub fn system() -> Self {
        Self::new(
            Arc::new(SystemClock),
            ShutdownSignal::new(),
            Duration::from_secs(1),
        )
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn shutdown(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        if self.shutdown.is_triggered() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleeps `duration` in chunks, re-checking the shutdown flag each time.
    pub async fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let mut remaining = duration;
        while !remaining.is_zero() {
            self.check()?;
            let step = remaining.min(self.chunk);
            self.clock.sleep(step).await;
            remaining -= step;
        }
        self.check()
    }

    /// Sleeps a uniformly random number of seconds in `[min, max]`.
    pub async fn sleep_between(&self, min: f64, max: f64) -> Result<Duration, Cancelled> {
        let duration = Duration::from_secs_f64(uniform(min, max));
        self.sleep(duration).await?;
        Ok(duration)
    }
}

/// Inclusive band of seconds a random delay is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct DelayRange {
    pub min: f64,
    pub max: f64,
}

impl DelayRange {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, secs: f64) -> bool {
        (self.min..=self.max).contains(&secs)
    }

    pub fn sample(&self) -> Duration {
        Duration::from_secs_f64(uniform(self.min, self.max))
    }
}

impl Pacer {
    pub async fn sleep_range(&self, range: DelayRange) -> Result<Duration, Cancelled> {
        self.sleep_between(range.min, range.max).await
    }
}

/// Uniform sample in `[min, max]`; tolerates inverted or degenerate bounds.
pub fn uniform(min: f64, max: f64) -> f64 {
    use rand::Rng;

    let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
    if (hi - lo).abs() < f64::EPSILON {
        return lo.max(0.0);
    }
    rand::thread_rng().gen_range(lo..=hi).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sleeps_in_chunks() {
        let clock = Arc::new(ManualClock::new());
        let pacer = Pacer::new(clock.clone(), ShutdownSignal::new(), Duration::from_secs(1));
        pacer.sleep(Duration::from_millis(3500)).await.unwrap();
        assert_eq!(clock.sleeps().len(), 4);
        assert_eq!(clock.elapsed(), Duration::from_millis(3500));
    }

    #[tokio::test]
    async fn shutdown_interrupts_sleep() {
        let clock = Arc::new(ManualClock::new());
        let shutdown = ShutdownSignal::new();
        let pacer = Pacer::new(clock.clone(), shutdown.clone(), Duration::from_secs(1));
        shutdown.trigger();
        assert_eq!(pacer.sleep(Duration::from_secs(120)).await, Err(Cancelled));
        assert!(clock.sleeps().is_empty());
    }

    #[test]
    fn uniform_handles_degenerate_range() {
        assert_eq!(uniform(2.0, 2.0), 2.0);
        let value = uniform(5.0, 1.0);
        assert!((1.0..=5.0).contains(&value));
    }
}
