#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use http::HeaderMap;
use http::header::{HeaderValue, SET_COOKIE};

use stealth_http::modules::Pacer;
use stealth_http::{
    ClientEvent, ClientRegistry, EventHandler, Fingerprint, ManualClock, StealthConfig, Transport,
    TransportError, TransportFactory, TransportKind, TransportRequest, TransportResponse,
};

/// One canned transport outcome.
#[derive(Debug, Clone)]
pub enum Reply {
    Status(u16, HeaderMap),
    Fail(TransportError),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Status(200, HeaderMap::new())
    }

    pub fn status(status: u16) -> Self {
        Reply::Status(status, HeaderMap::new())
    }

    pub fn with_cookie(cookie: &'static str) -> Self {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static(cookie));
        Reply::Status(200, headers)
    }

    pub fn connect_error() -> Self {
        Reply::Fail(TransportError::Connect("connection refused".into()))
    }
}

/// Replies are consumed in order; `fallback` answers once the queue is empty.
#[derive(Debug)]
pub struct Script {
    replies: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    requests: Mutex<Vec<TransportRequest>>,
    only_path: Mutex<Option<String>>,
    closed: AtomicUsize,
}

impl Script {
    pub fn new(fallback: Reply) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(VecDeque::new()),
            fallback,
            requests: Mutex::new(Vec::new()),
            only_path: Mutex::new(None),
            closed: AtomicUsize::new(0),
        })
    }

    pub fn push(&self, reply: Reply) {
        self.replies.lock().unwrap().push_back(reply);
    }

    /// Requests to any other path fail with a connection error.
    pub fn fail_except(&self, path: &str) {
        *self.only_path.lock().unwrap() = Some(path.to_string());
    }

    pub fn requests(&self) -> Vec<TransportRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    fn next(&self) -> Reply {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[derive(Debug)]
pub struct ScriptedTransport {
    script: Arc<Script>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Fallback
    }

    async fn execute(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let url = request.url.clone();
        self.script.requests.lock().unwrap().push(request);
        let only_path = self.script.only_path.lock().unwrap().clone();
        if let Some(path) = only_path
            && url.path() != path
        {
            return Err(TransportError::Connect("connection reset".into()));
        }
        match self.script.next() {
            Reply::Status(status, headers) => {
                Ok(TransportResponse::new(status, url).with_headers(headers))
            }
            Reply::Fail(err) => Err(err),
        }
    }

    fn close(&self) {
        self.script.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct ScriptedFactory {
    pub script: Arc<Script>,
}

impl TransportFactory for ScriptedFactory {
    fn create(
        &self,
        _fingerprint: &Fingerprint,
        _pacer: &Pacer,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        Ok(Arc::new(ScriptedTransport {
            script: self.script.clone(),
        }))
    }
}

#[derive(Default)]
pub struct Captured {
    events: Mutex<Vec<ClientEvent>>,
}

impl Captured {
    pub fn events(&self) -> Vec<ClientEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&ClientEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| matches(e)).count()
    }
}

impl EventHandler for Captured {
    fn handle(&self, event: &ClientEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub fn quiet_config() -> StealthConfig {
    StealthConfig::builder().disable_decoys().build().unwrap()
}

pub struct Harness {
    pub registry: ClientRegistry,
    pub script: Arc<Script>,
    pub clock: Arc<ManualClock>,
    pub events: Arc<Captured>,
}

pub fn harness(config: StealthConfig, fallback: Reply) -> Harness {
    let script = Script::new(fallback);
    let clock = Arc::new(ManualClock::new());
    let events = Arc::new(Captured::default());
    let registry = ClientRegistry::builder()
        .with_config(config)
        .with_clock(clock.clone())
        .with_transport_factory(Arc::new(ScriptedFactory {
            script: script.clone(),
        }))
        .with_event_handler(events.clone())
        .build()
        .unwrap();
    Harness {
        registry,
        script,
        clock,
        events,
    }
}
