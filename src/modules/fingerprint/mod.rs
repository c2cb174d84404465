//! Deterministic per-identity browser fingerprints.
//!
//! A fingerprint is a pure function of the identity: the identity's stable
//! hash seeds a PRNG which picks every attribute from fixed candidate lists.
//! Records are persisted so later runs present the same browser even if the
//! candidate lists change.

use http::{HeaderMap, HeaderName, HeaderValue};
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::seq::{IteratorRandom, SliceRandom};
use rand::{Rng, SeedableRng};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;

use super::identity::{salted_digest, stable_hash};
use super::storage::{MemoryStore, Store};

const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:124.0) Gecko/20100101 Firefox/124.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36 Edg/125.0.0.0",
];

const SCREEN_RESOLUTIONS: &[(u32, u32)] = &[
    (1920, 1080),
    (1366, 768),
    (1440, 900),
    (1536, 864),
    (1280, 720),
    (1600, 900),
    (2560, 1440),
    (1920, 1200),
    (1680, 1050),
    (1280, 1024),
    (3840, 2160),
    (2048, 1152),
];

const LANGUAGES: &[&str] = &[
    "en-US,en;q=0.9",
    "en-US,en;q=0.9,id;q=0.8",
    "en-US,en;q=0.9,es;q=0.8",
    "en-GB,en;q=0.9",
    "en-US,en;q=0.8,fr;q=0.7",
    "en-US,en;q=0.9,de;q=0.8",
    "en-US,en;q=0.9,pt;q=0.8",
    "en-US,en;q=0.9,ja;q=0.8",
    "en-US,en;q=0.9,zh;q=0.8",
];

const TIMEZONES: &[&str] = &[
    "America/New_York",
    "America/Los_Angeles",
    "America/Chicago",
    "Europe/London",
    "Europe/Paris",
    "Europe/Berlin",
    "Asia/Tokyo",
    "Asia/Shanghai",
    "Asia/Seoul",
    "Australia/Sydney",
    "America/Toronto",
    "America/Denver",
    "Asia/Jakarta",
    "Asia/Singapore",
    "Europe/Amsterdam",
];

const WEBGL_VENDORS: &[&str] = &["Google Inc.", "NVIDIA Corporation", "AMD", "Intel Inc."];

const WEBGL_RENDERERS: &[&str] = &[
    "ANGLE (NVIDIA GeForce GTX 1060 Direct3D11 vs_5_0 ps_5_0)",
    "ANGLE (AMD Radeon RX 580 Direct3D11 vs_5_0 ps_5_0)",
    "ANGLE (Intel HD Graphics 620 Direct3D11 vs_5_0 ps_5_0)",
    "ANGLE (NVIDIA GeForce RTX 3060 Direct3D11 vs_5_0 ps_5_0)",
];

const FONTS: &[&str] = &[
    "Arial",
    "Times New Roman",
    "Helvetica",
    "Courier New",
    "Verdana",
    "Georgia",
    "Palatino",
    "Garamond",
    "Bookman",
    "Comic Sans MS",
    "Trebuchet MS",
    "Arial Black",
    "Impact",
    "Lucida Console",
    "Tahoma",
    "Monaco",
    "Lucida Grande",
    "Century Gothic",
];

const PLUGINS: &[&str] = &[
    "Chrome PDF Plugin",
    "Chrome PDF Viewer",
    "Native Client",
    "Widevine Content Decryption Module",
    "Microsoft Edge PDF Plugin",
];

const APP_CLIENT_VERSION: &str = "1.0.0";

static CHROME_VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Chrome/(\d+)").expect("valid chrome version regex"));

/// Browser family inferred from a user agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrowserFamily {
    Chrome,
    Edge,
    Firefox,
    Safari,
    Other,
}

impl BrowserFamily {
    pub fn from_user_agent(user_agent: &str) -> Self {
        if user_agent.contains("Edg/") {
            BrowserFamily::Edge
        } else if user_agent.contains("Chrome") {
            BrowserFamily::Chrome
        } else if user_agent.contains("Firefox") {
            BrowserFamily::Firefox
        } else if user_agent.contains("Safari") {
            BrowserFamily::Safari
        } else {
            BrowserFamily::Other
        }
    }
}

/// Major Chrome version embedded in a user agent, if any.
pub fn chrome_major_version(user_agent: &str) -> Option<u32> {
    CHROME_VERSION_RE
        .captures(user_agent)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebglParameters {
    pub version: String,
    pub shading_language_version: String,
    pub max_texture_size: u32,
    pub max_viewport_dims: (u32, u32),
}

/// Per-identity pacing envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingProfile {
    /// Seconds, in `[0.5, 2.0]`.
    pub base_delay: f64,
    /// Seconds, in `[0.2, 0.8]`.
    pub variance: f64,
    /// Hours of day (6..=22) during which this identity is "active".
    pub peak_hours: BTreeSet<u32>,
}

impl TimingProfile {
    pub fn is_peak_hour(&self, hour: u32) -> bool {
        self.peak_hours.contains(&hour)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub user_agent: String,
    pub screen_resolution: Resolution,
    pub language: String,
    pub timezone: String,
    pub platform: String,
    pub device_id: String,
    pub session_id: String,
    pub viewport: Resolution,
    pub color_depth: u8,
    pub pixel_ratio: f32,
    pub touch_support: bool,
    pub hardware_concurrency: u8,
    pub memory: u8,
    pub webgl_vendor: String,
    pub webgl_renderer: String,
    pub webgl: WebglParameters,
    pub canvas_hash: String,
    pub webgl_hash: String,
    pub audio_hash: String,
    pub fonts: Vec<String>,
    pub plugins: Vec<String>,
    pub app_device_id: String,
    pub app_session_id: String,
    pub app_build_id: String,
    pub app_client_version: String,
    pub timing_profile: TimingProfile,
}

impl Fingerprint {
    pub fn browser_family(&self) -> BrowserFamily {
        BrowserFamily::from_user_agent(&self.user_agent)
    }
}

fn seeded_rng(identity: &str, salt: &str) -> StdRng {
    StdRng::seed_from_u64(stable_hash(&format!("{identity}_{salt}")))
}

fn platforms_for(user_agent: &str) -> &'static [&'static str] {
    if user_agent.contains("Windows") {
        &["Win32"]
    } else if user_agent.contains("Macintosh") {
        &["MacIntel"]
    } else {
        &["Linux x86_64", "Linux armv7l"]
    }
}

fn pick<'a, R: Rng>(rng: &mut R, items: &[&'a str]) -> &'a str {
    items.choose(rng).copied().unwrap_or_default()
}

fn sample_sorted<R: Rng>(rng: &mut R, items: &[&str], min: usize) -> Vec<String> {
    let count = rng.gen_range(min.min(items.len())..=items.len());
    let mut chosen: Vec<String> = items
        .choose_multiple(rng, count)
        .map(|s| s.to_string())
        .collect();
    chosen.sort();
    chosen
}

/// Generates the fingerprint for `identity`. Pure: same identity, same record.
pub fn generate(identity: &str) -> Fingerprint {
    let mut rng = seeded_rng(identity, "profile");

    let user_agent = pick(&mut rng, USER_AGENTS).to_string();
    let (width, height) = SCREEN_RESOLUTIONS
        .choose(&mut rng)
        .copied()
        .unwrap_or((1920, 1080));
    let language = pick(&mut rng, LANGUAGES).to_string();
    let timezone = pick(&mut rng, TIMEZONES).to_string();
    let platform = pick(&mut rng, platforms_for(&user_agent)).to_string();
    let session_id = format!("{:016x}", rng.r#gen::<u64>());

    let viewport = Resolution {
        width: width.saturating_sub(rng.gen_range(0..=100)),
        height: height.saturating_sub(rng.gen_range(50..=150)),
    };
    let color_depth = *[24u8, 32].choose(&mut rng).unwrap_or(&24);
    let pixel_ratio = *[1.0f32, 1.25, 1.5, 2.0].choose(&mut rng).unwrap_or(&1.0);
    let touch_support = rng.gen_bool(0.5);
    let hardware_concurrency = *[2u8, 4, 6, 8, 12, 16].choose(&mut rng).unwrap_or(&8);
    let memory = *[2u8, 4, 8, 16, 32].choose(&mut rng).unwrap_or(&8);
    let webgl_vendor = pick(&mut rng, WEBGL_VENDORS).to_string();
    let webgl_renderer = pick(&mut rng, WEBGL_RENDERERS).to_string();

    let canvas_noise: u32 = rng.gen_range(1..=1000);
    let webgl = WebglParameters {
        version: pick(&mut rng, &["WebGL 1.0", "WebGL 2.0"]).to_string(),
        shading_language_version: pick(&mut rng, &["WebGL GLSL ES 1.0", "WebGL GLSL ES 3.00"])
            .to_string(),
        max_texture_size: *[4096u32, 8192, 16384].choose(&mut rng).unwrap_or(&8192),
        max_viewport_dims: *[(4096u32, 4096u32), (8192, 8192)]
            .choose(&mut rng)
            .unwrap_or(&(4096, 4096)),
    };

    let base_delay = rng.gen_range(0.5..=2.0);
    let variance = rng.gen_range(0.2..=0.8);
    let peak_count = rng.gen_range(3..=6);
    let peak_hours: BTreeSet<u32> = (6u32..23).choose_multiple(&mut rng, peak_count).into_iter().collect();

    let app_session_seed: u128 = rng.r#gen();

    Fingerprint {
        user_agent,
        screen_resolution: Resolution { width, height },
        language,
        timezone,
        platform,
        device_id: salted_digest(identity, "device", 20),
        session_id,
        viewport,
        color_depth,
        pixel_ratio,
        touch_support,
        hardware_concurrency,
        memory,
        webgl_vendor,
        webgl_renderer,
        webgl,
        canvas_hash: salted_digest(identity, &format!("canvas_{canvas_noise}"), 32),
        webgl_hash: salted_digest(identity, "webgl", 16),
        audio_hash: salted_digest(identity, "audio", 16),
        fonts: sample_sorted(&mut seeded_rng(identity, "fonts"), FONTS, 12),
        plugins: sample_sorted(&mut seeded_rng(identity, "plugins"), PLUGINS, 2),
        app_device_id: salted_digest(identity, "app_device", 32),
        app_session_id: format!("{app_session_seed:032x}"),
        app_build_id: format!("production-{}", salted_digest(identity, "build", 12)),
        app_client_version: APP_CLIENT_VERSION.to_string(),
        timing_profile: TimingProfile {
            base_delay,
            variance,
            peak_hours,
        },
    }
}

/// Picks a candidate user agent different from `current`.
pub fn fresh_user_agent(current: &str) -> String {
    let mut rng = rand::thread_rng();
    USER_AGENTS
        .iter()
        .filter(|ua| **ua != current)
        .choose(&mut rng)
        .map(|ua| ua.to_string())
        .unwrap_or_else(|| current.to_string())
}

fn ch_platform(platform: &str) -> &'static str {
    if platform.starts_with("Win") {
        "Windows"
    } else if platform.starts_with("Mac") {
        "macOS"
    } else {
        "Linux"
    }
}

fn insert(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Realistic browser header set for `fp`.
pub fn headers(fp: &Fingerprint, referer: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    insert(&mut headers, "user-agent", &fp.user_agent);
    insert(&mut headers, "accept", "*/*");
    insert(&mut headers, "accept-language", &fp.language);
    insert(&mut headers, "accept-encoding", "gzip, deflate, br");
    insert(&mut headers, "connection", "keep-alive");
    insert(&mut headers, "upgrade-insecure-requests", "1");
    insert(&mut headers, "sec-fetch-dest", "empty");
    insert(&mut headers, "sec-fetch-mode", "cors");
    insert(&mut headers, "sec-fetch-site", "same-origin");
    insert(&mut headers, "cache-control", "no-cache");
    insert(&mut headers, "pragma", "no-cache");
    insert(&mut headers, "dnt", "1");

    if let Some(referer) = referer {
        insert(&mut headers, "referer", referer);
    }

    match fp.browser_family() {
        BrowserFamily::Chrome | BrowserFamily::Edge => {
            let major = chrome_major_version(&fp.user_agent).unwrap_or(125);
            let brand = if fp.browser_family() == BrowserFamily::Edge {
                "Microsoft Edge"
            } else {
                "Google Chrome"
            };
            let arch = if fp.platform.contains("arm") { "\"arm\"" } else { "\"x86\"" };
            insert(
                &mut headers,
                "sec-ch-ua",
                &format!("\"Not_A Brand\";v=\"8\", \"Chromium\";v=\"{major}\", \"{brand}\";v=\"{major}\""),
            );
            insert(&mut headers, "sec-ch-ua-mobile", "?0");
            insert(
                &mut headers,
                "sec-ch-ua-platform",
                &format!("\"{}\"", ch_platform(&fp.platform)),
            );
            insert(&mut headers, "sec-ch-ua-arch", arch);
            insert(&mut headers, "sec-ch-ua-bitness", "\"64\"");
            insert(
                &mut headers,
                "sec-ch-ua-full-version-list",
                &format!(
                    "\"Not_A Brand\";v=\"8.0.0.0\", \"Chromium\";v=\"{major}.0.0.0\", \"{brand}\";v=\"{major}.0.0.0\""
                ),
            );
        }
        BrowserFamily::Firefox => {
            insert(
                &mut headers,
                "accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,*/*;q=0.8",
            );
            insert(&mut headers, "sec-fetch-mode", "navigate");
        }
        BrowserFamily::Safari | BrowserFamily::Other => {}
    }

    headers
}

/// Overlays `overrides` on `base`; override values win on key conflicts.
pub fn merge_headers(mut base: HeaderMap, overrides: &HeaderMap) -> HeaderMap {
    for name in overrides.keys() {
        base.remove(name);
        for value in overrides.get_all(name) {
            base.append(name.clone(), value.clone());
        }
    }
    base
}

/// Authentication carried by API calls.
#[derive(Debug, Clone)]
pub enum ApiAuth {
    Bearer(String),
    ApiKey { header: String, key: String },
    None,
}

/// API-call overlay on top of the browser headers.
#[derive(Debug, Clone)]
pub struct ApiHeaders {
    pub auth: ApiAuth,
    pub origin: Option<String>,
    /// Adds the app device/session/build identifier headers.
    pub include_app_ids: bool,
}

impl ApiHeaders {
    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            auth: ApiAuth::Bearer(token.into()),
            origin: None,
            include_app_ids: false,
        }
    }

    pub fn api_key(header: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            auth: ApiAuth::ApiKey {
                header: header.into(),
                key: key.into(),
            },
            origin: None,
            include_app_ids: false,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_app_ids(mut self) -> Self {
        self.include_app_ids = true;
        self
    }
}

fn insert_dynamic(headers: &mut HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

/// Browser headers plus the JSON/auth/origin overlay for API endpoints.
pub fn api_headers(fp: &Fingerprint, overlay: &ApiHeaders) -> HeaderMap {
    let mut headers = headers(fp, None);
    insert(&mut headers, "content-type", "application/json");
    insert(&mut headers, "accept", "application/json");

    match &overlay.auth {
        ApiAuth::Bearer(token) => insert(&mut headers, "authorization", &format!("Bearer {token}")),
        ApiAuth::ApiKey { header, key } => insert_dynamic(&mut headers, header, key),
        ApiAuth::None => {}
    }

    if let Some(origin) = &overlay.origin {
        let origin = origin.trim_end_matches('/');
        insert(&mut headers, "origin", origin);
        insert(&mut headers, "referer", &format!("{origin}/"));
    }

    if overlay.include_app_ids {
        let idempotency: u128 = rand::thread_rng().r#gen();
        insert(&mut headers, "idempotency-key", &format!("{idempotency:032x}"));
        insert(&mut headers, "x-client-device-id", &fp.app_device_id);
        insert(&mut headers, "x-client-session-id", &fp.app_session_id);
        insert(&mut headers, "x-client-build-id", &fp.app_build_id);
        insert(&mut headers, "x-client-version", &fp.app_client_version);
    }

    headers
}

/// Load-or-generate front end over a fingerprint [`Store`].
#[derive(Clone)]
pub struct FingerprintStore {
    store: Arc<dyn Store<Fingerprint>>,
}

impl FingerprintStore {
    pub fn new(store: Arc<dyn Store<Fingerprint>>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::<Fingerprint>::new()))
    }

    pub fn generate(&self, identity: &str) -> Fingerprint {
        generate(identity)
    }

    /// Stored record, if any. Backend failures are logged and read as absent.
    pub fn load(&self, identity: &str) -> Option<Fingerprint> {
        match self.store.load(identity) {
            Ok(found) => found,
            Err(err) => {
                log::warn!("failed to load fingerprint for {identity}: {err}");
                None
            }
        }
    }

    pub fn save(&self, identity: &str, fingerprint: &Fingerprint) {
        if let Err(err) = self.store.save(identity, fingerprint) {
            log::warn!("failed to save fingerprint for {identity}: {err}");
        }
    }

    /// Stored fingerprint, or a freshly generated (and saved) one.
    pub fn load_or_generate(&self, identity: &str) -> Fingerprint {
        if let Some(fingerprint) = self.load(identity) {
            log::debug!("loaded persistent fingerprint for {identity}");
            return fingerprint;
        }
        let fingerprint = generate(identity);
        self.save(identity, &fingerprint);
        log::debug!("generated fingerprint for {identity}");
        fingerprint
    }
}
