//! HTTP execution behind a single `Transport` capability.
//!
//! Two implementations exist: [`StealthTransport`], which hands requests to a
//! pluggable handshake-spoofing [`StealthBackend`] under a browser client
//! profile, and [`FallbackTransport`], a pooled `reqwest` client with
//! status-based retries. The choice is made once when a client is built.

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, Method};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

use super::fingerprint::{BrowserFamily, Fingerprint, chrome_major_version};
use super::pacing::Pacer;
use super::proxy::Proxy;
use crate::config::TransportConfig;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("proxy error: {0}")]
    Proxy(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("transport closed")]
    Closed,
    #[error("transport cancelled")]
    Cancelled,
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            TransportError::Timeout(timeout)
        } else if err.is_connect() {
            TransportError::Connect(err.to_string())
        } else if err.is_builder() {
            TransportError::InvalidRequest(err.to_string())
        } else {
            TransportError::Other(err.to_string())
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub timeout: Duration,
    pub proxy: Option<Proxy>,
}

impl TransportRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: Duration::from_secs(30),
            proxy: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: Option<Bytes>) -> Self {
        self.body = body;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_proxy(mut self, proxy: Option<Proxy>) -> Self {
        self.proxy = proxy;
        self
    }
}

#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub elapsed: Duration,
}

impl TransportResponse {
    pub fn new(status: u16, url: Url) -> Self {
        Self {
            status,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            elapsed: Duration::ZERO,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Stealth,
    Fallback,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportKind::Stealth => "stealth",
            TransportKind::Fallback => "fallback",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Executes HTTP requests for one client.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn kind(&self) -> TransportKind;

    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;

    /// Releases pooled connections. Must be idempotent.
    fn close(&self) {}
}

/// Browser handshake profile presented by the stealth backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientProfile {
    pub id: &'static str,
    pub random_tls_extension_order: bool,
}

impl ClientProfile {
    pub fn for_user_agent(user_agent: &str) -> Self {
        let id = match BrowserFamily::from_user_agent(user_agent) {
            BrowserFamily::Chrome | BrowserFamily::Edge => {
                match chrome_major_version(user_agent) {
                    Some(version) if version >= 123 => "chrome_124",
                    Some(_) => "chrome_120",
                    None => "chrome_124",
                }
            }
            BrowserFamily::Firefox => "firefox_120",
            BrowserFamily::Safari if user_agent.contains("Version/") => "safari_ios_16_0",
            _ => "chrome_124",
        };
        Self {
            id,
            random_tls_extension_order: true,
        }
    }
}

/// Engine able to send requests with a spoofed TLS/HTTP2 handshake.
#[async_trait]
pub trait StealthBackend: Send + Sync + fmt::Debug {
    async fn execute(
        &self,
        profile: &ClientProfile,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError>;

    fn close(&self) {}
}

#[derive(Debug)]
pub struct StealthTransport {
    backend: Arc<dyn StealthBackend>,
    profile: ClientProfile,
    closed: AtomicBool,
}

impl StealthTransport {
    pub fn new(backend: Arc<dyn StealthBackend>, profile: ClientProfile) -> Self {
        Self {
            backend,
            profile,
            closed: AtomicBool::new(false),
        }
    }

    pub fn profile(&self) -> &ClientProfile {
        &self.profile
    }
}

#[async_trait]
impl Transport for StealthTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stealth
    }

    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.backend.execute(&self.profile, request).await
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.backend.close();
        }
    }
}

/// Pooled `reqwest` transport with status-code retries.
#[derive(Debug)]
pub struct FallbackTransport {
    config: TransportConfig,
    pacer: Pacer,
    clients: Mutex<HashMap<Option<String>, reqwest::Client>>,
    closed: AtomicBool,
}

impl FallbackTransport {
    pub fn new(config: TransportConfig, pacer: Pacer) -> Self {
        Self {
            config,
            pacer,
            clients: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    async fn client(&self, proxy: Option<&Proxy>) -> Result<reqwest::Client, TransportError> {
        let mut guard = self.clients.lock().await;
        let key = proxy.map(|p| p.url.clone());
        if let Some(client) = guard.get(&key) {
            return Ok(client.clone());
        }

        let mut builder = reqwest::Client::builder()
            .pool_max_idle_per_host(self.config.pool_max_idle_per_host)
            .danger_accept_invalid_certs(self.config.accept_invalid_certs);

        if let Some(proxy) = proxy {
            let endpoint = reqwest::Proxy::all(proxy.url.as_str())
                .map_err(|err| TransportError::Proxy(err.to_string()))?;
            builder = builder.proxy(endpoint);
        }

        let client = builder
            .build()
            .map_err(|err| TransportError::InvalidRequest(err.to_string()))?;
        guard.insert(key, client.clone());
        Ok(client)
    }

    async fn send_once(
        &self,
        client: &reqwest::Client,
        request: &TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        let mut builder = client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .timeout(request.timeout);
        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let started = Instant::now();
        let resp = builder
            .send()
            .await
            .map_err(|err| TransportError::from_reqwest(err, request.timeout))?;

        let status = resp.status().as_u16();
        let url = resp.url().clone();
        let headers = resp.headers().clone();
        let body = resp
            .bytes()
            .await
            .map_err(|err| TransportError::from_reqwest(err, request.timeout))?;

        Ok(TransportResponse {
            status,
            url,
            headers,
            body,
            elapsed: started.elapsed(),
        })
    }

    /// Seconds to wait before status retry `retry` (1-based).
    fn retry_delay(&self, retry: u32, response: &TransportResponse) -> Duration {
        let retry_after = response
            .headers
            .get(http::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        if let Some(secs) = retry_after {
            return Duration::from_secs(secs.min(120));
        }
        let exponent = retry.saturating_sub(1).min(16) as i32;
        Duration::from_secs_f64(self.config.status_backoff_factor.max(0.0) * 2f64.powi(exponent))
    }
}

#[async_trait]
impl Transport for FallbackTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Fallback
    }

    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let client = self.client(request.proxy.as_ref()).await?;

        let mut retry = 0;
        loop {
            let response = self.send_once(&client, &request).await?;
            if !self.config.status_forcelist.contains(&response.status)
                || retry >= self.config.status_retries
            {
                return Ok(response);
            }

            retry += 1;
            let delay = self.retry_delay(retry, &response);
            log::debug!(
                "{} {} returned {}; transport retry {retry} in {:.1}s",
                request.method,
                request.url,
                response.status,
                delay.as_secs_f64()
            );
            self.pacer
                .sleep(delay)
                .await
                .map_err(|_| TransportError::Cancelled)?;
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match self.clients.try_lock() {
            Ok(mut clients) => clients.clear(),
            Err(_) => log::debug!("fallback transport busy during close; pool dropped with it"),
        }
    }
}

/// Builds the transport for a newly created client.
pub trait TransportFactory: Send + Sync + fmt::Debug {
    fn create(
        &self,
        fingerprint: &Fingerprint,
        pacer: &Pacer,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// Uses the stealth backend when one is installed, `reqwest` otherwise.
#[derive(Debug, Clone, Default)]
pub struct DefaultTransportFactory {
    config: TransportConfig,
    backend: Option<Arc<dyn StealthBackend>>,
}

impl DefaultTransportFactory {
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            backend: None,
        }
    }

    pub fn with_backend(mut self, backend: Arc<dyn StealthBackend>) -> Self {
        self.backend = Some(backend);
        self
    }
}

impl TransportFactory for DefaultTransportFactory {
    fn create(
        &self,
        fingerprint: &Fingerprint,
        pacer: &Pacer,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        match &self.backend {
            Some(backend) => {
                let mut profile = ClientProfile::for_user_agent(&fingerprint.user_agent);
                profile.random_tls_extension_order = self.config.random_tls_extension_order;
                log::debug!("using stealth transport with profile {}", profile.id);
                Ok(Arc::new(StealthTransport::new(backend.clone(), profile)))
            }
            None => Ok(Arc::new(FallbackTransport::new(
                self.config.clone(),
                pacer.clone(),
            ))),
        }
    }
}
