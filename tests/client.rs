mod common;

use std::time::Duration;

use http::Method;
use http::header::{AUTHORIZATION, COOKIE};
use serde_json::json;

use common::{Reply, harness, quiet_config};
use stealth_http::{
    ClientEvent, ClientState, PacingConfig, RequestOptions, StealthConfig, StealthError,
};

#[tokio::test]
async fn gives_up_after_max_retries() {
    let h = harness(quiet_config(), Reply::connect_error());
    let client = h.registry.get_or_create("account_0", None).unwrap();

    let err = client.get("https://example.com/api/feed").await.unwrap_err();
    match err {
        StealthError::RequestFailed { attempts, ref identity, .. } => {
            assert_eq!(attempts, 3);
            assert_eq!(identity, "account_0");
        }
        other => panic!("unexpected error: {other}"),
    }

    assert_eq!(h.script.requests().len(), 3);
    assert_eq!(h.events.count(|e| matches!(e, ClientEvent::Retry(_))), 2);
    assert_eq!(h.events.count(|e| matches!(e, ClientEvent::Failed(_))), 1);
    assert_eq!(client.state(), ClientState::Failed);

    let stats = h.registry.stats().stats;
    assert_eq!(stats.global.failed_requests, 1);
    assert_eq!(stats.global.retries, 2);
}

#[tokio::test]
async fn rate_limit_cools_down_without_spending_retries() {
    let h = harness(quiet_config(), Reply::ok());
    h.script.push(Reply::status(429));
    let client = h.registry.get_or_create("account_0", None).unwrap();

    let response = client.get("https://example.com/home").await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.attempts(), 2);

    let cooldowns: Vec<Duration> = h
        .events
        .events()
        .into_iter()
        .filter_map(|event| match event {
            ClientEvent::RateLimited(limited) => Some(limited.cooldown),
            _ => None,
        })
        .collect();
    assert_eq!(cooldowns.len(), 1);
    assert!(cooldowns[0] >= Duration::from_secs(30));
    assert!(cooldowns[0] <= Duration::from_secs(120));
    assert!(h.clock.total_slept() >= cooldowns[0]);

    let stats = h.registry.stats().stats;
    assert_eq!(stats.global.rate_limited, 1);
    assert_eq!(stats.global.successful_requests, 1);
    assert_eq!(stats.global.retries, 0);
}

#[tokio::test]
async fn persistent_rate_limit_stops_at_the_ceiling() {
    let h = harness(quiet_config(), Reply::status(429));
    let client = h.registry.get_or_create("account_0", None).unwrap();

    let err = client.get("https://example.com/home").await.unwrap_err();
    assert!(matches!(err, StealthError::RateLimited { attempts: 8, .. }));
    assert_eq!(h.script.requests().len(), 8);
}

#[tokio::test]
async fn ceiling_reports_the_last_transport_error() {
    let config = StealthConfig::builder()
        .with_max_retries(5)
        .disable_decoys()
        .build()
        .unwrap();
    let h = harness(config, Reply::connect_error());
    for _ in 0..6 {
        h.script.push(Reply::status(429));
    }
    let client = h.registry.get_or_create("account_0", None).unwrap();

    let err = client.get("https://example.com/home").await.unwrap_err();
    match err {
        StealthError::RequestFailed { attempts, source, .. } => {
            assert_eq!(attempts, 8);
            assert!(matches!(source, stealth_http::TransportError::Connect(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(h.script.requests().len(), 8);
}

#[tokio::test]
async fn decoy_failures_never_reach_the_caller() {
    let pacing = PacingConfig {
        decoy_probability: 1.0,
        decoy_min: 1,
        ..PacingConfig::default()
    };
    let config = StealthConfig::builder()
        .with_proxies(["10.0.0.1:8080"])
        .with_pacing(pacing)
        .build()
        .unwrap();
    let h = harness(config, Reply::ok());
    h.script.fail_except("/api/feed");
    let client = h.registry.get_or_create("account_0", None).unwrap();

    let response = client.get("https://example.com/api/feed").await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.attempts(), 1);

    let requests = h.script.requests();
    let (main, decoys) = requests.split_last().unwrap();
    assert_eq!(main.url.path(), "/api/feed");
    assert!((1..=2).contains(&decoys.len()));
    for decoy in decoys {
        assert_eq!(decoy.url.host_str(), Some("example.com"));
        assert_ne!(decoy.url.path(), "/api/feed");
        assert_eq!(decoy.proxy, client.proxy());
    }
    assert_eq!(h.events.count(|e| matches!(e, ClientEvent::Retry(_))), 0);
    assert_eq!(h.events.count(|e| matches!(e, ClientEvent::Failed(_))), 0);
}

#[tokio::test]
async fn consecutive_requests_are_spaced() {
    let h = harness(quiet_config(), Reply::ok());
    let client = h.registry.get_or_create("account_0", None).unwrap();

    client.get("https://example.com/a").await.unwrap();
    let first = h.clock.elapsed();
    assert!(first >= Duration::from_secs(1), "bootstrap delay applies");

    client.get("https://example.com/b").await.unwrap();
    let second = h.clock.elapsed();
    assert!(second - first >= Duration::from_millis(100));
    assert_eq!(client.summary().requests, 2);
}

#[tokio::test]
async fn http_errors_are_returned_not_retried() {
    let h = harness(quiet_config(), Reply::status(503));
    let client = h.registry.get_or_create("account_0", None).unwrap();

    let response = client.get("https://example.com/").await.unwrap();
    assert_eq!(response.status(), 503);
    assert!(!response.is_success());
    assert_eq!(h.script.requests().len(), 1);
    assert_eq!(h.registry.stats().stats.global.failed_requests, 1);
}

#[tokio::test]
async fn cookies_flow_into_later_requests() {
    let h = harness(quiet_config(), Reply::ok());
    h.script.push(Reply::with_cookie("sid=abc; Path=/; HttpOnly"));
    let client = h.registry.get_or_create("account_0", None).unwrap();

    client.get("https://example.com/login").await.unwrap();
    assert_eq!(client.cookies().get("sid").map(String::as_str), Some("abc"));

    client.get("https://example.com/feed").await.unwrap();
    let requests = h.script.requests();
    assert_eq!(requests[1].headers.get(COOKIE).unwrap(), "sid=abc");
}

#[tokio::test]
async fn caller_headers_override_generated_ones() {
    let h = harness(quiet_config(), Reply::ok());
    let client = h.registry.get_or_create("account_0", None).unwrap();

    let options = RequestOptions::new()
        .with_header("user-agent", "custom-agent/1.0")
        .unwrap()
        .with_json(&json!({"q": 1}))
        .unwrap();
    client
        .request(Method::POST, "https://example.com/api/search", options)
        .await
        .unwrap();

    let request = &h.script.requests()[0];
    assert_eq!(request.headers.get("user-agent").unwrap(), "custom-agent/1.0");
    assert_eq!(request.headers.get("content-type").unwrap(), "application/json");
    assert_eq!(request.body.as_deref(), Some(&b"{\"q\":1}"[..]));
}

#[tokio::test]
async fn api_headers_carry_the_auth_token() {
    let h = harness(quiet_config(), Reply::ok());
    let client = h
        .registry
        .get_or_create("abcdef0123", Some("abcdef0123456789"))
        .unwrap();

    let headers = client.api_headers(Some("https://app.example.com/"));
    assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer abcdef0123456789");
    assert_eq!(headers.get("origin").unwrap(), "https://app.example.com");
    assert!(headers.contains_key("x-client-device-id"));
}

#[tokio::test]
async fn proxy_switches_on_second_failure() {
    let config = StealthConfig::builder()
        .with_proxies(["10.0.0.1:8080", "10.0.0.2:8080"])
        .disable_decoys()
        .build()
        .unwrap();
    let h = harness(config, Reply::ok());
    h.script.push(Reply::connect_error());
    h.script.push(Reply::connect_error());

    let client = h.registry.get_or_create("account_1", None).unwrap();
    let initial = client.proxy().unwrap();

    let response = client.get("https://example.com/").await.unwrap();
    assert_eq!(response.attempts(), 3);

    let requests = h.script.requests();
    assert_eq!(requests[0].proxy.as_ref(), Some(&initial));
    assert_eq!(requests[1].proxy.as_ref(), Some(&initial));
    assert_ne!(requests[2].proxy.as_ref(), Some(&initial));
    assert_ne!(client.proxy().unwrap(), initial);

    assert_eq!(h.events.count(|e| matches!(e, ClientEvent::ProxySwitch(_))), 1);
    assert_eq!(h.registry.stats().stats.global.proxy_switches, 1);

    let health = h.registry.proxies().health(&initial).unwrap();
    assert_eq!(health.consecutive_errors, 2);
    assert!(health.is_working);
}

#[tokio::test]
async fn reading_and_typing_pauses_sleep_on_the_clock() {
    let h = harness(quiet_config(), Reply::ok());
    let client = h.registry.get_or_create("account_0", None).unwrap();

    let reading = client.pause_for_reading(2_000).await.unwrap();
    let typing = client.pause_for_typing(40).await.unwrap();
    assert_eq!(h.clock.total_slept(), reading + typing);
    assert!(typing >= Duration::from_secs(1));
}

#[tokio::test]
async fn closed_client_refuses_requests() {
    let h = harness(quiet_config(), Reply::ok());
    let client = h.registry.get_or_create("account_0", None).unwrap();
    client.close();
    client.close();

    assert!(client.is_closed());
    assert_eq!(client.state(), ClientState::Closed);
    assert_eq!(h.script.closed(), 1);
    assert_eq!(
        h.events.count(|e| matches!(e, ClientEvent::Closed { .. })),
        1
    );
    let err = client.get("https://example.com/").await.unwrap_err();
    assert!(matches!(err, StealthError::Closed(_)));
}

#[tokio::test]
async fn shutdown_interrupts_pending_requests() {
    let h = harness(quiet_config(), Reply::ok());
    let client = h.registry.get_or_create("account_0", None).unwrap();
    h.registry.shutdown();

    let err = client.get("https://example.com/").await.unwrap_err();
    assert!(matches!(err, StealthError::Cancelled(_)));
    assert!(h.script.requests().is_empty());
}
