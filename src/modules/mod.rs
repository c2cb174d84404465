//! Cross-cutting services module
//!
//! Fingerprints, proxies, pacing, persistence, transports, and the event and
//! statistics plumbing shared by every client.

pub mod behavior;
pub mod events;
pub mod fingerprint;
pub mod identity;
pub mod metrics;
pub mod pacing;
pub mod proxy;
pub mod rate_limit;
pub mod state;
pub mod storage;
pub mod transport;

// Re-export commonly used types
pub use behavior::{ActionType, BehaviorClock, decoy_urls};
pub use events::{
    ClientEvent, EventDispatcher, EventHandler, FailureEvent, LoggingHandler, ProxySwitchEvent,
    RateLimitEvent, RequestEvent, ResponseEvent, RetryEvent, SessionEvent, StatsHandler,
};
pub use fingerprint::{
    ApiAuth, ApiHeaders, BrowserFamily, Fingerprint, FingerprintStore, TimingProfile,
    api_headers, fresh_user_agent, headers as fingerprint_headers, merge_headers,
};
pub use identity::{identity_for, stable_hash};
pub use metrics::{GlobalStats, IdentityStats, StatsCollector, StatsSnapshot};
pub use pacing::{Cancelled, Clock, DelayRange, ManualClock, Pacer, ShutdownSignal, SystemClock};
pub use proxy::{
    ProbeResult, Proxy, ProxyConfig, ProxyHealth, ProxyHealthReport, ProxyParseError, ProxyPool,
};
pub use rate_limit::{PacingDecision, RateLimiter, RateState, backoff_delay};
pub use state::{CookieJar, CookieMap, SessionBlob, SessionStateStore};
pub use storage::{MemoryStore, RedbStore, Store, StoreError, open_database};
pub use transport::{
    ClientProfile, DefaultTransportFactory, FallbackTransport, StealthBackend, StealthTransport,
    Transport, TransportError, TransportFactory, TransportKind, TransportRequest,
    TransportResponse,
};
