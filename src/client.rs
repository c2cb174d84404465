//! Per-identity stealth client.
//!
//! Wires an identity's fingerprint, proxy, cookies and behavioural clock to a
//! transport and drives the paced request loop: behavioural wait, optional
//! decoy traffic, jitter, execution, then either success, a 429 cooldown, or
//! backoff with proxy rotation.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use rand::Rng;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::config::{ConfigError, StealthConfig};
use crate::modules::behavior::{ActionType, BehaviorClock, decoy_urls};
use crate::modules::events::{
	ClientEvent, EventDispatcher, FailureEvent, ProxySwitchEvent, RateLimitEvent, RequestEvent,
	ResponseEvent, RetryEvent,
};
use crate::modules::fingerprint::{
	ApiAuth, ApiHeaders, Fingerprint, FingerprintStore, api_headers, fresh_user_agent,
	headers as browser_headers, merge_headers,
};
use crate::modules::pacing::{Cancelled, Pacer};
use crate::modules::proxy::{Proxy, ProxyPool};
use crate::modules::rate_limit::RateLimiter;
use crate::modules::state::{CookieJar, CookieMap, SessionStateStore};
use crate::modules::storage::StoreError;
use crate::modules::transport::{
	Transport, TransportError, TransportFactory, TransportKind, TransportRequest,
	TransportResponse,
};

/// Result alias used across the client layer.
pub type StealthResult<T> = Result<T, StealthError>;

#[derive(Debug, Error)]
pub enum StealthError {
	#[error("request for {identity} failed after {attempts} attempts: {source}")]
	RequestFailed {
		identity: String,
		attempts: u32,
		#[source]
		source: TransportError,
	},
	#[error("{identity} still rate limited after {attempts} attempts")]
	RateLimited { identity: String, attempts: u32 },
	#[error(transparent)]
	Cancelled(#[from] Cancelled),
	#[error("url parse error: {0}")]
	Url(#[from] url::ParseError),
	#[error("header conversion failed: {0}")]
	InvalidHeader(String),
	#[error("body serialization failed: {0}")]
	Body(#[from] serde_json::Error),
	#[error("storage error: {0}")]
	Store(#[from] StoreError),
	#[error("transport error: {0}")]
	Transport(#[from] TransportError),
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
	#[error("client for {0} is closed")]
	Closed(String),
}

/// Lifecycle of a client. `Ready` once fingerprint, proxy and cookies are wired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
	Created,
	Ready,
	Requesting,
	Retrying,
	Completed,
	Failed,
	Closed,
}

/// Per-request knobs. Caller headers win over generated ones.
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
	pub headers: HeaderMap,
	pub body: Option<Bytes>,
	pub timeout: Option<Duration>,
	pub action: Option<ActionType>,
}

impl RequestOptions {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_headers(mut self, headers: HeaderMap) -> Self {
		for (name, value) in headers.iter() {
			self.headers.insert(name.clone(), value.clone());
		}
		self
	}

	pub fn with_header(mut self, name: &str, value: &str) -> StealthResult<Self> {
		let header_name = HeaderName::from_bytes(name.as_bytes())
			.map_err(|_| StealthError::InvalidHeader(name.to_string()))?;
		let header_value =
			HeaderValue::from_str(value).map_err(|_| StealthError::InvalidHeader(name.to_string()))?;
		self.headers.insert(header_name, header_value);
		Ok(self)
	}

	pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
		self.body = Some(body.into());
		self
	}

	pub fn with_json<T: Serialize + ?Sized>(mut self, value: &T) -> StealthResult<Self> {
		self.body = Some(Bytes::from(serde_json::to_vec(value)?));
		if !self.headers.contains_key(CONTENT_TYPE) {
			self.headers
				.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
		}
		Ok(self)
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = Some(timeout);
		self
	}

	/// Overrides the action inferred from the URL and method.
	pub fn with_action(mut self, action: ActionType) -> Self {
		self.action = Some(action);
		self
	}
}

/// Response returned by the client.
#[derive(Debug, Clone)]
pub struct StealthResponse {
	status: u16,
	headers: HeaderMap,
	body: Bytes,
	url: Url,
	elapsed: Duration,
	attempts: u32,
}

impl StealthResponse {
	fn new(response: TransportResponse, attempts: u32) -> Self {
		Self {
			status: response.status,
			headers: response.headers,
			body: response.body,
			url: response.url,
			elapsed: response.elapsed,
			attempts,
		}
	}

	pub fn status(&self) -> u16 {
		self.status
	}

	pub fn is_success(&self) -> bool {
		self.status < 400
	}

	pub fn url(&self) -> &Url {
		&self.url
	}

	pub fn headers(&self) -> &HeaderMap {
		&self.headers
	}

	pub fn elapsed(&self) -> Duration {
		self.elapsed
	}

	/// Transport attempts used, including 429 retries.
	pub fn attempts(&self) -> u32 {
		self.attempts
	}

	pub fn text(&self) -> String {
		String::from_utf8_lossy(&self.body).into_owned()
	}

	pub fn bytes(&self) -> Bytes {
		self.body.clone()
	}

	pub fn json<T: DeserializeOwned>(&self) -> StealthResult<T> {
		Ok(serde_json::from_slice(&self.body)?)
	}
}

/// Point-in-time view of a client for registry stats.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSummary {
	pub identity: String,
	pub state: ClientState,
	pub transport: TransportKind,
	pub proxy_host: Option<String>,
	pub user_agent: String,
	pub requests: u64,
}

/// Services shared by every client of a registry.
#[derive(Clone)]
pub(crate) struct ClientContext {
	pub(crate) config: Arc<StealthConfig>,
	pub(crate) fingerprints: Arc<FingerprintStore>,
	pub(crate) sessions: Arc<SessionStateStore>,
	pub(crate) proxies: Arc<ProxyPool>,
	pub(crate) rate_limiter: Arc<RateLimiter>,
	pub(crate) transports: Arc<dyn TransportFactory>,
	pub(crate) pacer: Pacer,
	pub(crate) events: Arc<EventDispatcher>,
}

pub struct StealthClient {
	identity: String,
	auth_token: Option<String>,
	config: Arc<StealthConfig>,
	fingerprint: RwLock<Fingerprint>,
	behavior: Arc<BehaviorClock>,
	proxies: Arc<ProxyPool>,
	proxy: Mutex<Option<Proxy>>,
	sessions: Arc<SessionStateStore>,
	cookies: Mutex<CookieJar>,
	session_values: Mutex<HashMap<String, Value>>,
	rate_limiter: Arc<RateLimiter>,
	transport: Arc<dyn Transport>,
	pacer: Pacer,
	events: Arc<EventDispatcher>,
	state: Mutex<ClientState>,
	closed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
	mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl StealthClient {
	pub(crate) fn connect(
		identity: &str,
		auth_token: Option<&str>,
		ctx: &ClientContext,
	) -> StealthResult<Self> {
		let fingerprint = ctx.fingerprints.load_or_generate(identity);
		let behavior = Arc::new(BehaviorClock::new(
			fingerprint.timing_profile.clone(),
			ctx.pacer.clock().clone(),
		));
		ctx.rate_limiter.register(identity, behavior.clone());

		let proxy = ctx.proxies.select(identity);
		let cookies = CookieJar::from_map(ctx.sessions.load_cookies(identity));
		let session_values = ctx
			.sessions
			.load_session_blob(identity)
			.map(|blob| blob.values)
			.unwrap_or_default();
		let transport = ctx.transports.create(&fingerprint, &ctx.pacer)?;

		if let Some(ref proxy) = proxy {
			log::info!("{identity}: using proxy {}", proxy.display_host());
		}

		Ok(Self {
			identity: identity.to_string(),
			auth_token: auth_token.map(str::to_string),
			config: ctx.config.clone(),
			fingerprint: RwLock::new(fingerprint),
			behavior,
			proxies: ctx.proxies.clone(),
			proxy: Mutex::new(proxy),
			sessions: ctx.sessions.clone(),
			cookies: Mutex::new(cookies),
			session_values: Mutex::new(session_values),
			rate_limiter: ctx.rate_limiter.clone(),
			transport,
			pacer: ctx.pacer.clone(),
			events: ctx.events.clone(),
			state: Mutex::new(ClientState::Ready),
			closed: AtomicBool::new(false),
		})
	}

	pub fn identity(&self) -> &str {
		&self.identity
	}

	pub fn auth_token(&self) -> Option<&str> {
		self.auth_token.as_deref()
	}

	pub fn state(&self) -> ClientState {
		*lock(&self.state)
	}

	fn set_state(&self, state: ClientState) {
		let mut guard = lock(&self.state);
		if *guard != ClientState::Closed {
			*guard = state;
		}
	}

	pub fn fingerprint(&self) -> Fingerprint {
		self.fingerprint
			.read()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
			.clone()
	}

	pub fn user_agent(&self) -> String {
		self.fingerprint
			.read()
			.unwrap_or_else(|poisoned| poisoned.into_inner())
			.user_agent
			.clone()
	}

	pub fn behavior(&self) -> &Arc<BehaviorClock> {
		&self.behavior
	}

	pub fn proxy(&self) -> Option<Proxy> {
		lock(&self.proxy).clone()
	}

	pub fn transport_kind(&self) -> TransportKind {
		self.transport.kind()
	}

	pub fn cookies(&self) -> CookieMap {
		lock(&self.cookies).as_map().clone()
	}

	pub fn set_cookie(&self, name: impl Into<String>, value: impl Into<String>) {
		lock(&self.cookies).insert(name, value);
	}

	pub fn session_value(&self, key: &str) -> Option<Value> {
		lock(&self.session_values).get(key).cloned()
	}

	pub fn set_session_value(&self, key: impl Into<String>, value: Value) {
		lock(&self.session_values).insert(key.into(), value);
	}

	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::SeqCst)
	}

	pub fn summary(&self) -> ClientSummary {
		ClientSummary {
			identity: self.identity.clone(),
			state: self.state(),
			transport: self.transport.kind(),
			proxy_host: self.proxy().map(|proxy| proxy.display_host()),
			user_agent: self.user_agent(),
			requests: self.rate_limiter.request_count(&self.identity),
		}
	}

	/// Browser headers for `url`, overlaid with `overrides` and the cookie jar.
	pub fn headers_for(&self, overrides: &HeaderMap) -> HeaderMap {
		let generated = {
			let fingerprint = self
				.fingerprint
				.read()
				.unwrap_or_else(|poisoned| poisoned.into_inner());
			browser_headers(&fingerprint, None)
		};
		let mut merged = merge_headers(generated, overrides);
		lock(&self.cookies).apply(&mut merged);
		merged
	}

	/// API-call headers using the auth token supplied at creation.
	pub fn api_headers(&self, origin: Option<&str>) -> HeaderMap {
		let mut overlay = match &self.auth_token {
			Some(token) => ApiHeaders::bearer(token.clone()),
			None => ApiHeaders {
				auth: ApiAuth::None,
				origin: None,
				include_app_ids: false,
			},
		}
		.with_app_ids();
		if let Some(origin) = origin {
			overlay = overlay.with_origin(origin);
		}
		let fingerprint = self
			.fingerprint
			.read()
			.unwrap_or_else(|poisoned| poisoned.into_inner());
		api_headers(&fingerprint, &overlay)
	}

	/// Swaps in a different candidate user agent. Not persisted.
	pub fn rotate_user_agent(&self) -> String {
		let mut fingerprint = self
			.fingerprint
			.write()
			.unwrap_or_else(|poisoned| poisoned.into_inner());
		let fresh = fresh_user_agent(&fingerprint.user_agent);
		fingerprint.user_agent = fresh.clone();
		fresh
	}

	pub async fn get(&self, url: &str) -> StealthResult<StealthResponse> {
		self.request(Method::GET, url, RequestOptions::default()).await
	}

	pub async fn post(&self, url: &str, body: impl Into<Bytes>) -> StealthResult<StealthResponse> {
		self.request(Method::POST, url, RequestOptions::new().with_body(body))
			.await
	}

	pub async fn request(
		&self,
		method: Method,
		url: &str,
		options: RequestOptions,
	) -> StealthResult<StealthResponse> {
		if self.is_closed() {
			return Err(StealthError::Closed(self.identity.clone()));
		}
		let url = Url::parse(url)?;
		let action = options
			.action
			.unwrap_or_else(|| ActionType::classify(&method, url.as_str()));

		self.set_state(ClientState::Requesting);
		let result = self.execute(method, url, action, options).await;
		self.set_state(if result.is_ok() {
			ClientState::Completed
		} else {
			ClientState::Failed
		});
		result
	}

	async fn execute(
		&self,
		method: Method,
		url: Url,
		action: ActionType,
		options: RequestOptions,
	) -> StealthResult<StealthResponse> {
		let pacing = &self.config.pacing;
		let retry = &self.config.retry;

		self.rate_limiter
			.wait_if_needed(&self.identity, action)
			.await?;
		self.send_decoys(&url).await?;

		let headers = self.headers_for(&options.headers);
		let timeout = options
			.timeout
			.unwrap_or_else(|| self.config.transport.timeout.sample());

		let mut attempts = 0u32;
		let mut failures = 0u32;
		let mut last_error: Option<TransportError> = None;

		loop {
			if attempts >= retry.attempt_ceiling {
				let error = match &last_error {
					Some(err) => err.to_string(),
					None => "rate limit persisted past the attempt ceiling".into(),
				};
				self.events.dispatch(ClientEvent::Failed(FailureEvent {
					identity: self.identity.clone(),
					url: url.clone(),
					attempts,
					error,
					timestamp: chrono::Utc::now(),
				}));
				return Err(match last_error {
					Some(source) => StealthError::RequestFailed {
						identity: self.identity.clone(),
						attempts,
						source,
					},
					None => StealthError::RateLimited {
						identity: self.identity.clone(),
						attempts,
					},
				});
			}
			attempts += 1;

			self.pacer.sleep_range(pacing.jitter).await?;

			let proxy = self.proxy();
			self.events.dispatch(ClientEvent::Request(RequestEvent {
				identity: self.identity.clone(),
				method: method.clone(),
				url: url.clone(),
				action,
				attempt: attempts,
				timestamp: chrono::Utc::now(),
			}));

			let request = TransportRequest::new(method.clone(), url.clone())
				.with_headers(headers.clone())
				.with_body(options.body.clone())
				.with_timeout(timeout)
				.with_proxy(proxy.clone());

			let started = Instant::now();
			match self.transport.execute(request).await {
				Ok(response) => {
					let latency = started.elapsed();
					if let Some(ref proxy) = proxy {
						self.proxies.record_success(proxy, latency);
					}

					if response.status == 429 {
						last_error = None;
						let cooldown = pacing.rate_limit_cooldown.sample();
						self.set_state(ClientState::Retrying);
						self.events.dispatch(ClientEvent::RateLimited(RateLimitEvent {
							identity: self.identity.clone(),
							url: url.clone(),
							attempt: attempts,
							cooldown,
							timestamp: chrono::Utc::now(),
						}));
						self.pacer.sleep(cooldown).await?;
						continue;
					}

					lock(&self.cookies).absorb(&response.headers);
					if response.status < 400 {
						self.persist();
					}

					self.events.dispatch(ClientEvent::Completed(ResponseEvent {
						identity: self.identity.clone(),
						method: method.clone(),
						url: response.url.clone(),
						status: response.status,
						latency,
						timestamp: chrono::Utc::now(),
					}));
					return Ok(StealthResponse::new(response, attempts));
				}
				Err(TransportError::Cancelled) => return Err(StealthError::Cancelled(Cancelled)),
				Err(TransportError::Closed) => {
					return Err(StealthError::Closed(self.identity.clone()));
				}
				Err(err) => {
					failures += 1;
					if let Some(ref proxy) = proxy {
						self.proxies.record_error(proxy);
					}

					if failures >= retry.max_retries {
						self.events.dispatch(ClientEvent::Failed(FailureEvent {
							identity: self.identity.clone(),
							url: url.clone(),
							attempts,
							error: err.to_string(),
							timestamp: chrono::Utc::now(),
						}));
						return Err(StealthError::RequestFailed {
							identity: self.identity.clone(),
							attempts,
							source: err,
						});
					}

					self.set_state(ClientState::Retrying);
					let delay = self.rate_limiter.backoff(&self.identity, failures - 1).await?;
					self.events.dispatch(ClientEvent::Retry(RetryEvent {
						identity: self.identity.clone(),
						attempt: attempts,
						reason: err.to_string(),
						scheduled_after: delay,
						timestamp: chrono::Utc::now(),
					}));

					if failures == retry.proxy_switch_attempt {
						self.switch_proxy(failures - 1);
					}
					last_error = Some(err);
				}
			}
		}
	}

	/// Best-effort static-resource requests; their failures are ignored.
	async fn send_decoys(&self, target: &Url) -> Result<(), Cancelled> {
		let pacing = &self.config.pacing;
		let probability = pacing.decoy_probability.clamp(0.0, 1.0);
		let count = {
			let mut rng = rand::thread_rng();
			if probability > 0.0 && rng.gen_bool(probability) {
				rng.gen_range(pacing.decoy_min.min(pacing.decoy_limit)..=pacing.decoy_limit)
			} else {
				0
			}
		};
		if count == 0 {
			return Ok(());
		}

		let headers = self.headers_for(&HeaderMap::new());
		let timeout = Duration::from_secs_f64(pacing.decoy_timeout_secs.max(0.1));
		for decoy in decoy_urls(target).into_iter().take(count) {
			let request = TransportRequest::new(Method::GET, decoy.clone())
				.with_headers(headers.clone())
				.with_timeout(timeout)
				.with_proxy(self.proxy());
			match self.transport.execute(request).await {
				Ok(response) => log::debug!("{}: decoy {decoy} -> {}", self.identity, response.status),
				Err(err) => log::debug!("{}: decoy {decoy} failed: {err}", self.identity),
			}
			self.pacer.sleep_range(pacing.decoy_gap).await?;
		}
		Ok(())
	}

	fn switch_proxy(&self, attempt: u32) {
		let key = format!("{}_retry_{attempt}", self.identity);
		let Some(candidate) = self.proxies.select(&key) else {
			return;
		};
		let mut current = lock(&self.proxy);
		if current.as_ref() == Some(&candidate) {
			return;
		}
		self.events.dispatch(ClientEvent::ProxySwitch(ProxySwitchEvent {
			identity: self.identity.clone(),
			from: current.as_ref().map(Proxy::display_host),
			to: candidate.display_host(),
			timestamp: chrono::Utc::now(),
		}));
		*current = Some(candidate);
	}

	/// Sleeps as long as a person would need to read `content_length` characters.
	pub async fn pause_for_reading(&self, content_length: usize) -> StealthResult<Duration> {
		let duration = self.behavior.reading_time(content_length);
		self.pacer.sleep(duration).await?;
		Ok(duration)
	}

	/// Sleeps as long as a person would need to type `text_length` characters.
	pub async fn pause_for_typing(&self, text_length: usize) -> StealthResult<Duration> {
		let duration = self.behavior.typing_time(text_length);
		self.pacer.sleep(duration).await?;
		Ok(duration)
	}

	/// Writes cookies and session values to the session store.
	pub fn persist(&self) {
		let cookies = lock(&self.cookies).as_map().clone();
		if !cookies.is_empty() {
			self.sessions.save_cookies(&self.identity, &cookies);
		}
		let values = lock(&self.session_values).clone();
		if !values.is_empty() {
			self.sessions.save_session_blob(&self.identity, &values);
		}
	}

	/// Persists state and releases the transport. Safe to call repeatedly.
	pub fn close(&self) {
		if self.closed.swap(true, Ordering::SeqCst) {
			return;
		}
		self.persist();
		self.transport.close();
		*lock(&self.state) = ClientState::Closed;
		self.events.dispatch(ClientEvent::Closed {
			identity: self.identity.clone(),
		});
	}
}

impl Drop for StealthClient {
	fn drop(&mut self) {
		self.close();
	}
}

impl fmt::Debug for StealthClient {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("StealthClient")
			.field("identity", &self.identity)
			.field("state", &self.state())
			.field("transport", &self.transport.kind())
			.field("proxy", &self.proxy().map(|proxy| proxy.display_host()))
			.finish()
	}
}
