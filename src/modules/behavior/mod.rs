//! Human-like action pacing derived from an identity's timing profile.
//!
//! Each known action type has a fixed delay band; everything else samples
//! the fingerprint's `base_delay ± variance`. Off-peak hours slow the
//! identity down and occasionally trigger a longer break.

use http::Method;
use rand::Rng;
use rand::seq::SliceRandom;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use url::Url;

use super::fingerprint::TimingProfile;
use super::pacing::Clock;

const MIN_DELAY_SECS: f64 = 0.1;

const DECOY_PATHS: &[&str] = &[
    "/favicon.ico",
    "/manifest.json",
    "/robots.txt",
    "/_next/static/css/app.css",
    "/_next/static/js/app.js",
    "/api/health",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    Click,
    Read,
    Type,
    Scroll,
    TabSwitch,
    PageLoad,
    Default,
}

impl ActionType {
    /// Fixed `[min, max]` seconds band, or `None` for profile-driven timing.
    pub fn band(self) -> Option<(f64, f64)> {
        match self {
            ActionType::Read => Some((2.0, 8.0)),
            ActionType::Click => Some((0.3, 1.2)),
            ActionType::Type => Some((0.05, 0.15)),
            ActionType::Scroll => Some((0.5, 2.0)),
            ActionType::TabSwitch => Some((1.0, 4.0)),
            ActionType::PageLoad => Some((1.5, 4.0)),
            ActionType::Default => None,
        }
    }

    /// Guesses the action behind a request from its URL and method.
    pub fn classify(method: &Method, url: &str) -> Self {
        let lowered = url.to_ascii_lowercase();
        if lowered.contains("like") || lowered.contains("follow") {
            ActionType::Click
        } else if lowered.contains("post") || lowered.contains("cast") {
            ActionType::Type
        } else if *method == Method::GET {
            ActionType::Read
        } else {
            ActionType::Default
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Click => "click",
            ActionType::Read => "read",
            ActionType::Type => "type",
            ActionType::Scroll => "scroll",
            ActionType::TabSwitch => "tab_switch",
            ActionType::PageLoad => "page_load",
            ActionType::Default => "default",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn sample(min: f64, max: f64) -> f64 {
    let (lo, hi) = if min <= max { (min, max) } else { (max, min) };
    if hi - lo < f64::EPSILON {
        return lo;
    }
    rand::thread_rng().gen_range(lo..=hi)
}

/// Combines a base delay with the optional break and off-peak adjustments.
pub fn compose_action_delay(
    base: f64,
    break_extra: Option<f64>,
    off_peak_multiplier: Option<f64>,
) -> f64 {
    let mut delay = base + break_extra.unwrap_or(0.0);
    if let Some(multiplier) = off_peak_multiplier {
        delay *= multiplier;
    }
    delay
}

/// Per-identity behavioural timing.
#[derive(Debug)]
pub struct BehaviorClock {
    profile: TimingProfile,
    clock: Arc<dyn Clock>,
    action_count: AtomicU64,
}

impl BehaviorClock {
    pub fn new(profile: TimingProfile, clock: Arc<dyn Clock>) -> Self {
        Self {
            profile,
            clock,
            action_count: AtomicU64::new(0),
        }
    }

    pub fn profile(&self) -> &TimingProfile {
        &self.profile
    }

    pub fn action_count(&self) -> u64 {
        self.action_count.load(Ordering::Relaxed)
    }

    pub fn is_peak_hour(&self) -> bool {
        self.profile.is_peak_hour(self.clock.local_hour())
    }

    /// Raw delay for `action`, floored at 100ms.
    pub fn delay(&self, action: ActionType) -> Duration {
        let secs = match action.band() {
            Some((min, max)) => sample(min, max),
            None => {
                let base = self.profile.base_delay;
                let variance = self.profile.variance;
                base + sample(-variance, variance)
            }
        };
        Duration::from_secs_f64(secs.max(MIN_DELAY_SECS))
    }

    /// Counts an action and decides whether it should be followed by a break.
    pub fn should_break(&self) -> bool {
        let count = self.action_count.fetch_add(1, Ordering::Relaxed) + 1;
        let mut rng = rand::thread_rng();
        if count % rng.gen_range(50..=100u64) == 0 {
            return true;
        }
        !self.is_peak_hour() && rng.gen_bool(0.3)
    }

    pub fn action_delay(&self, action: ActionType) -> Duration {
        let base = self.delay(action).as_secs_f64();
        let break_extra = self.should_break().then(|| sample(10.0, 60.0));
        if let Some(extra) = break_extra {
            log::debug!("taking a {extra:.1}s break before {action}");
        }
        let off_peak = (!self.is_peak_hour()).then(|| sample(1.2, 2.0));
        Duration::from_secs_f64(compose_action_delay(base, break_extra, off_peak))
    }

    /// Time to read `content_length` characters at 200-300 wpm, at least 2s.
    pub fn reading_time(&self, content_length: usize) -> Duration {
        let words = content_length as f64 / 5.0;
        let words_per_minute = sample(200.0, 300.0);
        let secs = (words / words_per_minute) * 60.0 * sample(0.7, 1.5);
        Duration::from_secs_f64(secs.max(2.0))
    }

    /// Time to type `text_length` characters with a pause every 10th one.
    pub fn typing_time(&self, text_length: usize) -> Duration {
        let (min, max) = ActionType::Type.band().unwrap_or((0.05, 0.15));
        let total: f64 = (0..text_length)
            .map(|i| {
                let pause = if i % 10 == 0 { sample(0.1, 0.5) } else { 0.0 };
                sample(min, max) + pause
            })
            .sum();
        Duration::from_secs_f64(total)
    }
}

/// One to three static-looking resources on the target's host.
pub fn decoy_urls(target: &Url) -> Vec<Url> {
    let Some(host) = target.host_str() else {
        return Vec::new();
    };
    let origin = match target.port() {
        Some(port) => format!("{}://{host}:{port}", target.scheme()),
        None => format!("{}://{host}", target.scheme()),
    };

    let mut rng = rand::thread_rng();
    let count = rng.gen_range(1..=3usize.min(DECOY_PATHS.len()));
    DECOY_PATHS
        .choose_multiple(&mut rng, count)
        .filter_map(|path| Url::parse(&format!("{origin}{path}")).ok())
        .collect()
}
