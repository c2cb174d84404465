//! Registry of per-identity clients.
//!
//! Owns the shared services (stores, proxy pool, rate limiter, transport
//! factory, events) and hands out one [`StealthClient`] per identity.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard};

use http::Method;

use crate::client::{
	ClientContext, ClientSummary, RequestOptions, StealthClient, StealthResponse, StealthResult,
};
use crate::config::StealthConfig;
use crate::modules::events::{
	ClientEvent, EventDispatcher, EventHandler, LoggingHandler, SessionEvent, StatsHandler,
};
use crate::modules::fingerprint::{Fingerprint, FingerprintStore};
use crate::modules::identity;
use crate::modules::metrics::{StatsCollector, StatsSnapshot};
use crate::modules::pacing::{Cancelled, Clock, Pacer, ShutdownSignal, SystemClock};
use crate::modules::proxy::{ProbeResult, ProxyHealthReport, ProxyPool};
use crate::modules::rate_limit::RateLimiter;
use crate::modules::state::{CookieMap, SessionBlob, SessionStateStore};
use crate::modules::storage::{
	COOKIE_TABLE, FINGERPRINT_TABLE, MemoryStore, RedbStore, SESSION_TABLE, Store, open_database,
};
use crate::modules::transport::{DefaultTransportFactory, StealthBackend, TransportFactory};

/// Aggregate view returned by [`ClientRegistry::stats`].
#[derive(Debug, Clone)]
pub struct RegistryStats {
	pub stats: StatsSnapshot,
	pub active_sessions: usize,
	pub clients: Vec<ClientSummary>,
	pub proxies: ProxyHealthReport,
	pub stealth_backend: bool,
}

type Stores = (
	Arc<dyn Store<Fingerprint>>,
	Arc<dyn Store<CookieMap>>,
	Arc<dyn Store<SessionBlob>>,
);

/// Builder for [`ClientRegistry`].
#[derive(Default)]
pub struct RegistryBuilder {
	config: StealthConfig,
	clock: Option<Arc<dyn Clock>>,
	shutdown: Option<ShutdownSignal>,
	backend: Option<Arc<dyn StealthBackend>>,
	transports: Option<Arc<dyn TransportFactory>>,
	proxies: Option<ProxyPool>,
	stores: Option<Stores>,
	handlers: Vec<Arc<dyn EventHandler>>,
}

impl RegistryBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with_config(mut self, config: StealthConfig) -> Self {
		self.config = config;
		self
	}

	pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
		self.clock = Some(clock);
		self
	}

	pub fn with_shutdown(mut self, shutdown: ShutdownSignal) -> Self {
		self.shutdown = Some(shutdown);
		self
	}

	/// Installs a handshake-spoofing backend; clients then use the stealth transport.
	pub fn with_stealth_backend(mut self, backend: Arc<dyn StealthBackend>) -> Self {
		self.backend = Some(backend);
		self
	}

	pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
		self.transports = Some(factory);
		self
	}

	pub fn with_proxy_pool(mut self, pool: ProxyPool) -> Self {
		self.proxies = Some(pool);
		self
	}

	pub fn with_stores(
		mut self,
		fingerprints: Arc<dyn Store<Fingerprint>>,
		cookies: Arc<dyn Store<CookieMap>>,
		sessions: Arc<dyn Store<SessionBlob>>,
	) -> Self {
		self.stores = Some((fingerprints, cookies, sessions));
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	fn open_stores(config: &StealthConfig) -> StealthResult<Stores> {
		let Some(path) = &config.storage.path else {
			let fingerprints: Arc<dyn Store<Fingerprint>> = Arc::new(MemoryStore::<Fingerprint>::new());
			let cookies: Arc<dyn Store<CookieMap>> = Arc::new(MemoryStore::<CookieMap>::new());
			let sessions: Arc<dyn Store<SessionBlob>> = Arc::new(MemoryStore::<SessionBlob>::new());
			return Ok((fingerprints, cookies, sessions));
		};

		let db = open_database(path)?;
		log::info!("persisting identity state to {}", path.display());
		let fingerprints: Arc<dyn Store<Fingerprint>> =
			Arc::new(RedbStore::<Fingerprint>::new(db.clone(), FINGERPRINT_TABLE));
		let cookies: Arc<dyn Store<CookieMap>> =
			Arc::new(RedbStore::<CookieMap>::new(db.clone(), COOKIE_TABLE));
		let sessions: Arc<dyn Store<SessionBlob>> =
			Arc::new(RedbStore::<SessionBlob>::new(db, SESSION_TABLE));
		Ok((fingerprints, cookies, sessions))
	}

	fn load_proxies(config: &StealthConfig) -> ProxyPool {
		let mut lines = config.proxies.clone();
		if let Some(path) = &config.proxy_file {
			match fs::read_to_string(path) {
				Ok(contents) => lines.extend(contents.lines().map(str::to_string)),
				Err(err) => log::warn!("proxy file {} unavailable: {err}", path.display()),
			}
		}
		let pool = ProxyPool::from_lines(config.proxy.clone(), lines);
		if pool.is_empty() {
			log::warn!("no proxies loaded, using direct connections");
		}
		pool
	}

	pub fn build(self) -> StealthResult<ClientRegistry> {
		self.config.validate()?;
		let config = Arc::new(self.config);

		let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
		let shutdown = self.shutdown.unwrap_or_default();
		let pacer = Pacer::new(clock.clone(), shutdown.clone(), config.pacing.sleep_chunk());

		let (fingerprint_store, cookie_store, session_store) = match self.stores {
			Some(stores) => stores,
			None => Self::open_stores(&config)?,
		};
		let sessions = SessionStateStore::new(
			cookie_store,
			session_store,
			clock,
			config.storage.session_ttl(),
		);

		let proxies = self
			.proxies
			.unwrap_or_else(|| Self::load_proxies(&config));
		let stealth_backend = self.backend.is_some() && self.transports.is_none();
		let transports: Arc<dyn TransportFactory> = match self.transports {
			Some(factory) => factory,
			None => {
				let mut factory = DefaultTransportFactory::new(config.transport.clone());
				if let Some(backend) = self.backend {
					factory = factory.with_backend(backend);
				}
				Arc::new(factory)
			}
		};

		let stats = StatsCollector::new();
		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		events.register_handler(Arc::new(StatsHandler::new(stats.clone())));
		for handler in self.handlers {
			events.register_handler(handler);
		}

		let ctx = ClientContext {
			rate_limiter: Arc::new(RateLimiter::new(pacer.clone(), &config.pacing)),
			config,
			fingerprints: Arc::new(FingerprintStore::new(fingerprint_store)),
			sessions: Arc::new(sessions),
			proxies: Arc::new(proxies),
			transports,
			pacer,
			events: Arc::new(events),
		};

		log::info!(
			"client registry ready ({} proxies, {} transport)",
			ctx.proxies.len(),
			if stealth_backend { "stealth" } else { "default" }
		);

		Ok(ClientRegistry {
			ctx,
			clients: Mutex::new(HashMap::new()),
			stats,
			shutdown,
			stealth_backend,
		})
	}
}

/// One client per identity, created lazily and shared.
pub struct ClientRegistry {
	ctx: ClientContext,
	clients: Mutex<HashMap<String, Arc<StealthClient>>>,
	stats: StatsCollector,
	shutdown: ShutdownSignal,
	stealth_backend: bool,
}

impl ClientRegistry {
	pub fn builder() -> RegistryBuilder {
		RegistryBuilder::new()
	}

	pub fn new(config: StealthConfig) -> StealthResult<Self> {
		RegistryBuilder::new().with_config(config).build()
	}

	/// Identity key for an account: token prefix when usable, else `account_{index}`.
	pub fn identity_for(index: usize, auth_token: Option<&str>) -> String {
		identity::identity_for(index, auth_token)
	}

	fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<StealthClient>>> {
		self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
	}

	pub fn config(&self) -> &StealthConfig {
		&self.ctx.config
	}

	pub fn proxies(&self) -> &Arc<ProxyPool> {
		&self.ctx.proxies
	}

	pub fn sessions(&self) -> &Arc<SessionStateStore> {
		&self.ctx.sessions
	}

	pub fn fingerprints(&self) -> &Arc<FingerprintStore> {
		&self.ctx.fingerprints
	}

	pub fn shutdown_signal(&self) -> &ShutdownSignal {
		&self.shutdown
	}

	pub fn get(&self, identity: &str) -> Option<Arc<StealthClient>> {
		self.lock().get(identity).cloned()
	}

	pub fn len(&self) -> usize {
		self.lock().len()
	}

	pub fn is_empty(&self) -> bool {
		self.lock().is_empty()
	}

	/// Existing client for `identity`, or a newly wired one.
	pub fn get_or_create(
		&self,
		identity: &str,
		auth_token: Option<&str>,
	) -> StealthResult<Arc<StealthClient>> {
		if let Some(client) = self.get(identity) {
			return Ok(client);
		}
		if self.shutdown.is_triggered() {
			return Err(Cancelled.into());
		}

		let mut clients = self.lock();
		if let Some(client) = clients.get(identity) {
			return Ok(client.clone());
		}

		let client = Arc::new(StealthClient::connect(identity, auth_token, &self.ctx)?);
		clients.insert(identity.to_string(), client.clone());
		drop(clients);

		self.ctx.events.dispatch(ClientEvent::SessionCreated(SessionEvent {
			identity: identity.to_string(),
			transport: client.transport_kind(),
			proxy: client.proxy().map(|proxy| proxy.display_host()),
			timestamp: chrono::Utc::now(),
		}));
		Ok(client)
	}

	/// Convenience wrapper: look up or create the client and issue one request.
	pub async fn request(
		&self,
		identity: &str,
		method: Method,
		url: &str,
		options: RequestOptions,
	) -> StealthResult<StealthResponse> {
		let client = self.get_or_create(identity, None)?;
		client.request(method, url, options).await
	}

	pub fn stats(&self) -> RegistryStats {
		let clients: Vec<ClientSummary> = {
			let guard = self.lock();
			let mut summaries: Vec<_> = guard.values().map(|client| client.summary()).collect();
			summaries.sort_by(|a, b| a.identity.cmp(&b.identity));
			summaries
		};
		RegistryStats {
			stats: self.stats.snapshot(),
			active_sessions: clients.len(),
			clients,
			proxies: self.ctx.proxies.health_report(),
			stealth_backend: self.stealth_backend,
		}
	}

	/// Gives every live client a different user agent. Returns how many changed.
	pub fn rotate_user_agents(&self) -> usize {
		let guard = self.lock();
		for client in guard.values() {
			let user_agent = client.rotate_user_agent();
			log::debug!("rotated user agent for {}: {user_agent}", client.identity());
		}
		log::info!("rotated user agents for {} sessions", guard.len());
		guard.len()
	}

	/// Closes and forgets one client. Returns whether it existed.
	pub fn cleanup(&self, identity: &str) -> bool {
		let removed = self.lock().remove(identity);
		match removed {
			Some(client) => {
				client.close();
				self.ctx.rate_limiter.forget(identity);
				self.stats.forget(identity);
				log::info!("cleaned up session for {identity}");
				true
			}
			None => false,
		}
	}

	/// Closes and forgets every client. Returns how many were closed.
	pub fn cleanup_all(&self) -> usize {
		let drained: Vec<(String, Arc<StealthClient>)> = self.lock().drain().collect();
		for (identity, client) in &drained {
			client.close();
			self.ctx.rate_limiter.forget(identity);
			self.stats.forget(identity);
		}
		log::info!("cleaned up {} sessions", drained.len());
		drained.len()
	}

	/// Health-checks every proxy through a throwaway transport.
	pub async fn probe_proxies(&self) -> StealthResult<Vec<ProbeResult>> {
		let fingerprint = self.ctx.fingerprints.generate("proxy-probe");
		let transport = self.ctx.transports.create(&fingerprint, &self.ctx.pacer)?;
		let results = self.ctx.proxies.probe_all(transport.as_ref()).await;
		transport.close();
		let working = results.iter().filter(|result| result.working).count();
		log::info!("{working}/{} proxies working", results.len());
		Ok(results)
	}

	/// Interrupts every in-flight sleep and refuses new clients.
	pub fn shutdown(&self) {
		log::info!("shutdown requested");
		self.shutdown.trigger();
	}
}

impl fmt::Debug for ClientRegistry {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ClientRegistry")
			.field("clients", &self.len())
			.field("proxies", &self.ctx.proxies.len())
			.field("shutdown", &self.shutdown.is_triggered())
			.finish()
	}
}
