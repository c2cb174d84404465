//! Per-identity cookies and session blobs.
//!
//! Persistence failures never surface to callers: they are logged and the
//! client carries on with empty state.

use chrono::{DateTime, Utc};
use http::HeaderMap;
use http::header::{COOKIE, HeaderValue, SET_COOKIE};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use super::pacing::{Clock, SystemClock};
use super::storage::{MemoryStore, Store};

/// Cookie name -> value.
pub type CookieMap = BTreeMap<String, String>;

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(1))
}

/// In-memory cookie jar owned by a single client.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CookieJar {
    cookies: CookieMap,
}

impl CookieJar {
    pub fn from_map(cookies: CookieMap) -> Self {
        Self { cookies }
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.cookies.insert(name.into(), value.into());
    }

    pub fn as_map(&self) -> &CookieMap {
        &self.cookies
    }

    /// Absorbs every `Set-Cookie` header; only `name=value` is kept.
    pub fn absorb(&mut self, headers: &HeaderMap) -> usize {
        let mut absorbed = 0;
        for value in headers.get_all(SET_COOKIE) {
            let Ok(raw) = value.to_str() else {
                continue;
            };
            let pair = raw.split(';').next().unwrap_or_default();
            if let Some((name, value)) = pair.split_once('=') {
                let name = name.trim();
                if name.is_empty() {
                    continue;
                }
                self.cookies
                    .insert(name.to_string(), value.trim().to_string());
                absorbed += 1;
            }
        }
        absorbed
    }

    /// `Cookie` header value, or `None` when the jar is empty.
    pub fn header_value(&self) -> Option<HeaderValue> {
        if self.cookies.is_empty() {
            return None;
        }
        let joined = self
            .cookies
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("; ");
        HeaderValue::from_str(&joined).ok()
    }

    /// Adds the jar as a `Cookie` header unless one is already present.
    pub fn apply(&self, headers: &mut HeaderMap) {
        if headers.contains_key(COOKIE) {
            return;
        }
        if let Some(value) = self.header_value() {
            headers.insert(COOKIE, value);
        }
    }
}

/// Free-form per-identity session values, stamped with the last save time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionBlob {
    pub values: HashMap<String, Value>,
    pub last_save_time: DateTime<Utc>,
}

impl SessionBlob {
    pub fn new(values: HashMap<String, Value>, last_save_time: DateTime<Utc>) -> Self {
        Self {
            values,
            last_save_time,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>, ttl: Duration) -> bool {
        now - self.last_save_time > chrono_duration(ttl)
    }
}

pub struct SessionStateStore {
    cookies: Arc<dyn Store<CookieMap>>,
    sessions: Arc<dyn Store<SessionBlob>>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl SessionStateStore {
    pub fn new(
        cookies: Arc<dyn Store<CookieMap>>,
        sessions: Arc<dyn Store<SessionBlob>>,
        clock: Arc<dyn Clock>,
        ttl: Duration,
    ) -> Self {
        Self {
            cookies,
            sessions,
            clock,
            ttl,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(MemoryStore::<CookieMap>::new()),
            Arc::new(MemoryStore::<SessionBlob>::new()),
            Arc::new(SystemClock),
            Duration::from_secs(24 * 60 * 60),
        )
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn load_cookies(&self, identity: &str) -> CookieMap {
        match self.cookies.load(identity) {
            Ok(Some(cookies)) => {
                log::debug!("loaded {} cookies for {identity}", cookies.len());
                cookies
            }
            Ok(None) => CookieMap::new(),
            Err(err) => {
                log::warn!("failed to load cookies for {identity}: {err}");
                CookieMap::new()
            }
        }
    }

    /// Merges `cookies` into the stored map; later values win per name.
    pub fn save_cookies(&self, identity: &str, cookies: &CookieMap) {
        let mut merged = self.load_cookies(identity);
        merged.extend(cookies.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Err(err) = self.cookies.save(identity, &merged) {
            log::warn!("failed to save cookies for {identity}: {err}");
        }
    }

    /// Stored blob, or `None` when missing, unreadable or older than the TTL.
    pub fn load_session_blob(&self, identity: &str) -> Option<SessionBlob> {
        let blob = match self.sessions.load(identity) {
            Ok(blob) => blob?,
            Err(err) => {
                log::warn!("failed to load session for {identity}: {err}");
                return None;
            }
        };
        if blob.is_expired(self.clock.wall_time(), self.ttl) {
            log::debug!("session for {identity} expired");
            return None;
        }
        Some(blob)
    }

    pub fn save_session_blob(&self, identity: &str, values: &HashMap<String, Value>) {
        let blob = SessionBlob::new(values.clone(), self.clock.wall_time());
        self.store_blob(identity, &blob);
    }

    /// Persists a blob with its own timestamp.
    pub fn store_blob(&self, identity: &str, blob: &SessionBlob) {
        if let Err(err) = self.sessions.save(identity, blob) {
            log::warn!("failed to save session for {identity}: {err}");
        }
    }

    pub fn clear(&self, identity: &str) {
        if let Err(err) = self.cookies.remove(identity) {
            log::warn!("failed to clear cookies for {identity}: {err}");
        }
        if let Err(err) = self.sessions.remove(identity) {
            log::warn!("failed to clear session for {identity}: {err}");
        }
    }
}

impl Default for SessionStateStore {
    fn default() -> Self {
        Self::in_memory()
    }
}
