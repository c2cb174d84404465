mod common;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use common::{Reply, harness, quiet_config};
use stealth_http::modules::ClientProfile;
use stealth_http::{
    ClientEvent, ClientRegistry, ManualClock, StealthBackend, StealthConfig, StealthError,
    TransportError, TransportKind, TransportRequest, TransportResponse,
};

#[test]
fn same_identity_shares_one_client() {
    let h = harness(quiet_config(), Reply::ok());
    let first = h.registry.get_or_create("account_0", None).unwrap();
    let second = h.registry.get_or_create("account_0", None).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    h.registry.get_or_create("account_1", None).unwrap();
    assert_eq!(h.registry.len(), 2);

    let stats = h.registry.stats();
    assert_eq!(stats.active_sessions, 2);
    assert_eq!(stats.stats.global.sessions_created, 2);
    assert_eq!(
        h.events.count(|e| matches!(e, ClientEvent::SessionCreated(_))),
        2
    );
    assert_eq!(stats.clients[0].identity, "account_0");
    assert!(!stats.stealth_backend);
}

#[test]
fn fingerprint_survives_cleanup() {
    let h = harness(quiet_config(), Reply::ok());
    let before = h.registry.get_or_create("account_0", None).unwrap();
    let fingerprint = before.fingerprint();

    assert!(h.registry.cleanup("account_0"));
    assert!(!h.registry.cleanup("account_0"));
    assert!(before.is_closed());
    assert!(h.registry.is_empty());

    let after = h.registry.get_or_create("account_0", None).unwrap();
    assert!(!Arc::ptr_eq(&before, &after));
    assert_eq!(after.fingerprint(), fingerprint);
}

#[tokio::test]
async fn cleanup_drops_identity_stats() {
    let h = harness(quiet_config(), Reply::ok());
    let client = h.registry.get_or_create("account_0", None).unwrap();
    client.get("https://example.com/").await.unwrap();
    assert!(h.registry.stats().stats.identity("account_0").is_some());

    h.registry.cleanup("account_0");
    let stats = h.registry.stats().stats;
    assert!(stats.identity("account_0").is_none());
    assert_eq!(stats.global.successful_requests, 1);
}

#[test]
fn cleanup_all_closes_everything() {
    let h = harness(quiet_config(), Reply::ok());
    let a = h.registry.get_or_create("account_0", None).unwrap();
    let b = h.registry.get_or_create("account_1", None).unwrap();

    assert_eq!(h.registry.cleanup_all(), 2);
    assert!(a.is_closed() && b.is_closed());
    assert_eq!(h.registry.cleanup_all(), 0);
    assert_eq!(h.script.closed(), 2);
}

#[tokio::test]
async fn cookies_reload_into_a_fresh_client() {
    let h = harness(quiet_config(), Reply::with_cookie("sid=abc"));
    h.registry
        .request("account_0", http::Method::GET, "https://example.com/", Default::default())
        .await
        .unwrap();
    h.registry.cleanup("account_0");

    let client = h.registry.get_or_create("account_0", None).unwrap();
    assert_eq!(client.cookies().get("sid").map(String::as_str), Some("abc"));
}

#[test]
fn shutdown_refuses_new_clients() {
    let h = harness(quiet_config(), Reply::ok());
    let existing = h.registry.get_or_create("account_0", None).unwrap();
    h.registry.shutdown();

    assert!(h.registry.shutdown_signal().is_triggered());
    let again = h.registry.get_or_create("account_0", None).unwrap();
    assert!(Arc::ptr_eq(&existing, &again));
    assert!(matches!(
        h.registry.get_or_create("account_9", None),
        Err(StealthError::Cancelled(_))
    ));
}

#[test]
fn rotating_user_agents_touches_every_client() {
    let h = harness(quiet_config(), Reply::ok());
    let client = h.registry.get_or_create("account_0", None).unwrap();
    let original = client.user_agent();

    assert_eq!(h.registry.rotate_user_agents(), 1);
    assert_ne!(client.user_agent(), original);
}

#[tokio::test]
async fn probing_flags_failing_proxies() {
    let config = StealthConfig::builder()
        .with_proxies(["10.0.0.1:8080", "socks5://10.0.0.2:1080"])
        .disable_decoys()
        .build()
        .unwrap();
    let h = harness(config, Reply::ok());
    h.script.push(Reply::status(407));

    let results = h.registry.probe_proxies().await.unwrap();
    assert_eq!(results.len(), 2);
    assert!(!results[0].working);
    assert!(results[1].working);

    let report = h.registry.stats().proxies;
    assert_eq!(report.total_proxies, 2);
    assert_eq!(report.working_proxies, 2);

    let health = h.registry.proxies().health(&results[0].proxy).unwrap();
    assert_eq!(health.consecutive_errors, 1);
}

#[test]
fn identity_prefers_token_prefix() {
    assert_eq!(
        ClientRegistry::identity_for(4, Some("tok_1234567890abc")),
        "tok_123456"
    );
    assert_eq!(ClientRegistry::identity_for(4, None), "account_4");
}

#[derive(Debug)]
struct EchoBackend;

#[async_trait]
impl StealthBackend for EchoBackend {
    async fn execute(
        &self,
        profile: &ClientProfile,
        request: TransportRequest,
    ) -> Result<TransportResponse, TransportError> {
        Ok(TransportResponse::new(200, request.url).with_body(profile.id))
    }
}

#[tokio::test]
async fn stealth_backend_is_preferred() {
    let registry = ClientRegistry::builder()
        .with_config(quiet_config())
        .with_clock(Arc::new(ManualClock::new()))
        .with_stealth_backend(Arc::new(EchoBackend))
        .build()
        .unwrap();
    let client = registry.get_or_create("account_0", None).unwrap();
    assert_eq!(client.transport_kind(), TransportKind::Stealth);
    assert!(registry.stats().stealth_backend);

    let response = client.get("https://example.com/").await.unwrap();
    assert!(!response.text().is_empty());
}

#[tokio::test]
async fn redb_state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.redb");
    let config = || {
        StealthConfig::builder()
            .with_storage_path(&path)
            .disable_decoys()
            .build()
            .unwrap()
    };

    let user_agent = {
        let registry = ClientRegistry::builder()
            .with_config(config())
            .with_clock(Arc::new(ManualClock::new()))
            .build()
            .unwrap();
        let client = registry.get_or_create("account_0", None).unwrap();
        client.set_cookie("sid", "abc");
        client.set_session_value("step", Value::from(3));
        let user_agent = client.user_agent();
        drop(client);
        registry.cleanup_all();
        user_agent
    };

    let registry = ClientRegistry::builder()
        .with_config(config())
        .with_clock(Arc::new(ManualClock::new()))
        .build()
        .unwrap();
    let client = registry.get_or_create("account_0", None).unwrap();
    assert_eq!(client.user_agent(), user_agent);
    assert_eq!(client.cookies().get("sid").map(String::as_str), Some("abc"));
    assert_eq!(client.session_value("step"), Some(Value::from(3)));
}
