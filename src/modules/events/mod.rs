//! Event system for client activity.
//!
//! Clients publish lifecycle and request events; handlers turn them into log
//! lines, registry statistics, or anything custom.

use chrono::{DateTime, Utc};
use http::Method;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

use super::behavior::ActionType;
use super::metrics::StatsCollector;
use super::transport::TransportKind;

#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub identity: String,
    pub transport: TransportKind,
    pub proxy: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Emitted right before a request attempt hits the transport.
#[derive(Debug, Clone)]
pub struct RequestEvent {
    pub identity: String,
    pub method: Method,
    pub url: Url,
    pub action: ActionType,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ResponseEvent {
    pub identity: String,
    pub method: Method,
    pub url: Url,
    pub status: u16,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RateLimitEvent {
    pub identity: String,
    pub url: Url,
    pub attempt: u32,
    pub cooldown: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub identity: String,
    pub attempt: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ProxySwitchEvent {
    pub identity: String,
    pub from: Option<String>,
    pub to: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct FailureEvent {
    pub identity: String,
    pub url: Url,
    pub attempts: u32,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    SessionCreated(SessionEvent),
    Request(RequestEvent),
    Completed(ResponseEvent),
    RateLimited(RateLimitEvent),
    Retry(RetryEvent),
    ProxySwitch(ProxySwitchEvent),
    Failed(FailureEvent),
    Closed { identity: String },
}

impl ClientEvent {
    pub fn identity(&self) -> &str {
        match self {
            ClientEvent::SessionCreated(e) => &e.identity,
            ClientEvent::Request(e) => &e.identity,
            ClientEvent::Completed(e) => &e.identity,
            ClientEvent::RateLimited(e) => &e.identity,
            ClientEvent::Retry(e) => &e.identity,
            ClientEvent::ProxySwitch(e) => &e.identity,
            ClientEvent::Failed(e) => &e.identity,
            ClientEvent::Closed { identity } => identity,
        }
    }
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &ClientEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: ClientEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &ClientEvent) {
        match event {
            ClientEvent::SessionCreated(session) => {
                log::info!(
                    "session created for {} via {} transport (proxy: {})",
                    session.identity,
                    session.transport,
                    session.proxy.as_deref().unwrap_or("direct")
                );
            }
            ClientEvent::Request(req) => {
                log::debug!(
                    "{}: -> {} {} ({}, attempt {})",
                    req.identity,
                    req.method,
                    req.url,
                    req.action,
                    req.attempt
                );
            }
            ClientEvent::Completed(resp) => {
                log::info!(
                    "{}: {} {} -> {} ({:.2}s)",
                    resp.identity,
                    resp.method,
                    resp.url,
                    resp.status,
                    resp.latency.as_secs_f64()
                );
            }
            ClientEvent::RateLimited(limited) => {
                log::warn!(
                    "{}: rate limited on {}, cooling down {:.1}s",
                    limited.identity,
                    limited.url,
                    limited.cooldown.as_secs_f64()
                );
            }
            ClientEvent::Retry(retry) => {
                log::warn!(
                    "{}: attempt {} failed ({}), retrying after {:.2}s",
                    retry.identity,
                    retry.attempt,
                    retry.reason,
                    retry.scheduled_after.as_secs_f64()
                );
            }
            ClientEvent::ProxySwitch(switch) => {
                log::info!(
                    "{}: switching proxy {} -> {}",
                    switch.identity,
                    switch.from.as_deref().unwrap_or("direct"),
                    switch.to
                );
            }
            ClientEvent::Failed(failed) => {
                log::error!(
                    "{}: {} failed after {} attempts: {}",
                    failed.identity,
                    failed.url,
                    failed.attempts,
                    failed.error
                );
            }
            ClientEvent::Closed { identity } => {
                log::info!("closed session for {identity}");
            }
        }
    }
}

/// Feeds the registry's statistics.
#[derive(Clone, Debug)]
pub struct StatsHandler {
    stats: StatsCollector,
}

impl StatsHandler {
    pub fn new(stats: StatsCollector) -> Self {
        Self { stats }
    }
}

impl EventHandler for StatsHandler {
    fn handle(&self, event: &ClientEvent) {
        match event {
            ClientEvent::SessionCreated(_) => self.stats.record_session_created(),
            ClientEvent::Completed(resp) => {
                self.stats
                    .record_response(&resp.identity, resp.status, resp.latency);
            }
            ClientEvent::Failed(failed) => self.stats.record_failure(&failed.identity),
            ClientEvent::ProxySwitch(_) => self.stats.record_proxy_switch(),
            ClientEvent::RateLimited(_) => self.stats.record_rate_limited(),
            ClientEvent::Retry(_) => self.stats.record_retry(),
            ClientEvent::Request(_) | ClientEvent::Closed { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &ClientEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher.dispatch(ClientEvent::Closed {
            identity: "alice".into(),
        });
        assert_eq!(*counter.0.lock().unwrap(), 1);
    }

    #[test]
    fn stats_handler_counts_outcomes() {
        let stats = StatsCollector::new();
        let handler = StatsHandler::new(stats.clone());
        let url = Url::parse("https://example.com/feed").unwrap();

        handler.handle(&ClientEvent::Completed(ResponseEvent {
            identity: "alice".into(),
            method: Method::GET,
            url: url.clone(),
            status: 200,
            latency: Duration::from_millis(120),
            timestamp: Utc::now(),
        }));
        handler.handle(&ClientEvent::Failed(FailureEvent {
            identity: "alice".into(),
            url,
            attempts: 3,
            error: "connection refused".into(),
            timestamp: Utc::now(),
        }));

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.global.requests_made, 2);
        assert_eq!(snapshot.global.successful_requests, 1);
        assert_eq!(snapshot.global.failed_requests, 1);
    }
}
