use std::sync::{Arc, Mutex};
use std::time::Duration;

use httpmock::prelude::*;
use posthog_rust::{Client, Config, Event};

fn collecting_errors() -> (Arc<Mutex<Vec<(i32, String)>>>, impl Fn(i32, &str) + Send + Sync) {
    let errors: Arc<Mutex<Vec<(i32, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    let callback = move |status: i32, message: &str| {
        sink.lock().unwrap().push((status, message.to_string()));
    };
    (errors, callback)
}

#[tokio::test]
async fn events_are_batched_by_batch_size() {
    let server = MockServer::start();

    // First request carries the first two events together.
    let first_batch = server.mock(|when, then| {
        when.method(POST)
            .path("/batch")
            .body_contains(r#""event":"first""#)
            .body_contains(r#""event":"second""#)
            .body_contains(r#""$lib":"posthog-rust""#)
            .body_contains(r#""api_key":"phc_test""#);
        then.status(200).json_body(serde_json::json!({"status": 1}));
    });
    // Second request carries the remainder.
    let second_batch = server.mock(|when, then| {
        when.method(POST)
            .path("/batch")
            .body_contains(r#""event":"third""#);
        then.status(200).json_body(serde_json::json!({"status": 1}));
    });

    let config = Config::builder("phc_test")
        .host(server.base_url())
        .batch_size(2)
        .build()
        .unwrap();
    let client = Client::new(config).await.unwrap();

    assert!(client.capture(Event::new("first", "user-1")).await);
    assert!(client.capture(Event::new("second", "user-1")).await);
    assert!(client.capture(Event::new("third", "user-1")).await);
    client.flush().await;

    first_batch.assert_hits(1);
    second_batch.assert_hits(1);
    client.shutdown().await;
}

#[tokio::test]
async fn validation_failure_reports_and_returns_false() {
    let server = MockServer::start();
    let batch_mock = server.mock(|when, then| {
        when.method(POST).path("/batch");
        then.status(200).json_body(serde_json::json!({"status": 1}));
    });

    let (errors, callback) = collecting_errors();
    let config = Config::builder("phc_test")
        .host(server.base_url())
        .on_error(callback)
        .build()
        .unwrap();
    let client = Client::new(config).await.unwrap();

    assert!(!client.capture(Event::new("x", "")).await);
    assert_eq!(
        errors.lock().unwrap().as_slice(),
        &[(-1, "distinct_id must be given".to_string())]
    );

    client.shutdown().await;
    batch_mock.assert_hits(0);
}

// The test runtime is single-threaded, so the worker cannot run
// between captures; the queue genuinely fills.
#[tokio::test]
async fn queue_overflow_drops_newest_and_reports() {
    let server = MockServer::start();
    let batch_mock = server.mock(|when, then| {
        when.method(POST).path("/batch");
        then.status(200).json_body(serde_json::json!({"status": 1}));
    });

    let (errors, callback) = collecting_errors();
    let config = Config::builder("phc_test")
        .host(server.base_url())
        .max_queue_size(2)
        .on_error(callback)
        .build()
        .unwrap();
    let client = Client::new(config).await.unwrap();

    assert!(client.capture(Event::new("one", "user-1")).await);
    assert!(client.capture(Event::new("two", "user-1")).await);
    assert_eq!(client.queue_size(), 2);
    assert!(!client.capture(Event::new("three", "user-1")).await);
    assert!(!client.capture(Event::new("four", "user-1")).await);
    assert_eq!(client.queue_size(), 2);

    assert_eq!(
        errors.lock().unwrap().as_slice(),
        &[
            (-1, "queue full".to_string()),
            (-1, "queue full".to_string())
        ]
    );

    // The two accepted events still go out on shutdown.
    client.shutdown().await;
    assert_eq!(batch_mock.hits(), 1);
}

#[tokio::test]
async fn delivery_retries_server_errors_until_success() {
    let server = MockServer::start();
    let mut failing = server.mock(|when, then| {
        when.method(POST).path("/batch");
        then.status(500).body("upstream sad");
    });

    let config = Config::builder("phc_test")
        .host(server.base_url())
        .batch_size(1)
        .build()
        .unwrap();
    let client = Client::new(config).await.unwrap();

    assert!(client.capture(Event::new("retry-me", "user-1")).await);

    // Let the worker burn two attempts against the failing mock.
    while failing.hits() < 2 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Swap in a healthy endpoint before deleting the failing one so
    // there is no window where the request has no matching mock.
    let healthy = server.mock(|when, then| {
        when.method(POST).path("/batch");
        then.status(200).json_body(serde_json::json!({"status": 1}));
    });
    failing.delete();

    client.flush().await;
    assert_eq!(healthy.hits(), 1, "exactly one successful delivery");
    client.shutdown().await;
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let server = MockServer::start();
    let rejecting = server.mock(|when, then| {
        when.method(POST).path("/batch");
        then.status(400).body("bad payload");
    });

    let (errors, callback) = collecting_errors();
    let config = Config::builder("phc_test")
        .host(server.base_url())
        .batch_size(1)
        .on_error(callback)
        .build()
        .unwrap();
    let client = Client::new(config).await.unwrap();

    assert!(client.capture(Event::new("rejected", "user-1")).await);
    client.flush().await;

    rejecting.assert_hits(1);
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, 400);
    client.shutdown().await;
}

#[tokio::test]
async fn oversized_message_is_dropped_but_others_deliver() {
    let server = MockServer::start();
    let batch_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/batch")
            .body_contains(r#""event":"small""#);
        then.status(200).json_body(serde_json::json!({"status": 1}));
    });

    let (errors, callback) = collecting_errors();
    let config = Config::builder("phc_test")
        .host(server.base_url())
        .on_error(callback)
        .build()
        .unwrap();
    let client = Client::new(config).await.unwrap();

    let mut huge = Event::new("huge", "user-1");
    huge.insert_prop("blob", "x".repeat(40_000)).unwrap();
    assert!(client.capture(huge).await, "accepted into the queue");
    assert!(client.capture(Event::new("small", "user-1")).await);
    client.flush().await;

    batch_mock.assert_hits(1);
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].0, -1);
    assert!(
        errors[0].1.starts_with("message too large: "),
        "unexpected error: {}",
        errors[0].1
    );
    drop(errors);
    client.shutdown().await;
}

#[tokio::test]
async fn retry_after_header_is_honored_on_429() {
    let server = MockServer::start();
    let mut limited = server.mock(|when, then| {
        when.method(POST).path("/batch");
        then.status(429)
            .header("Retry-After", "1")
            .body("slow down");
    });

    let config = Config::builder("phc_test")
        .host(server.base_url())
        .batch_size(1)
        .build()
        .unwrap();
    let client = Client::new(config).await.unwrap();

    let started = std::time::Instant::now();
    assert!(client.capture(Event::new("limited", "user-1")).await);

    while limited.hits() < 1 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let healthy = server.mock(|when, then| {
        when.method(POST).path("/batch");
        then.status(200).json_body(serde_json::json!({"status": 1}));
    });
    limited.delete();

    client.flush().await;
    healthy.assert_hits(1);
    // The server asked for one second; the retry must not have come
    // back earlier.
    assert!(started.elapsed() >= Duration::from_secs(1));
    client.shutdown().await;
}

#[tokio::test]
async fn shutdown_drains_every_enqueued_message() {
    let server = MockServer::start();
    let batch_mock = server.mock(|when, then| {
        when.method(POST).path("/batch");
        then.status(200).json_body(serde_json::json!({"status": 1}));
    });

    let config = Config::builder("phc_test")
        .host(server.base_url())
        .batch_size(2)
        .build()
        .unwrap();
    let client = Client::new(config).await.unwrap();

    for i in 0..5 {
        assert!(client.capture(Event::new("tick", &format!("user-{i}")[..])).await);
    }
    client.shutdown().await;

    // Five messages at a batch size of two: 2 + 2 + 1.
    batch_mock.assert_hits(3);
}

#[tokio::test]
async fn sync_mode_sends_on_the_caller_task() {
    let server = MockServer::start();
    let batch_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/batch")
            .body_contains(r#""event":"direct""#);
        then.status(200).json_body(serde_json::json!({"status": 1}));
    });

    let config = Config::builder("phc_test")
        .host(server.base_url())
        .async_mode(false)
        .build()
        .unwrap();
    let client = Client::new(config).await.unwrap();

    assert!(client.capture(Event::new("direct", "user-1")).await);
    batch_mock.assert_hits(1);
    client.shutdown().await;
}

#[tokio::test]
async fn identify_alias_and_group_identify_reach_the_batch_endpoint() {
    let server = MockServer::start();
    let identify_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/batch")
            .body_contains(r#""type":"identify""#)
            .body_contains(r#""$set":{"#)
            .body_contains(r#""plan":"pro""#);
        then.status(200).json_body(serde_json::json!({"status": 1}));
    });
    let alias_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/batch")
            .body_contains(r#""event":"$create_alias""#)
            .body_contains(r#""alias":"anon-9""#);
        then.status(200).json_body(serde_json::json!({"status": 1}));
    });
    let group_mock = server.mock(|when, then| {
        when.method(POST)
            .path("/batch")
            .body_contains(r#""event":"$groupidentify""#)
            .body_contains(r#""distinct_id":"$company_acme""#);
        then.status(200).json_body(serde_json::json!({"status": 1}));
    });

    let config = Config::builder("phc_test")
        .host(server.base_url())
        .build()
        .unwrap();
    let client = Client::new(config).await.unwrap();

    let mut props = posthog_rust::Properties::new();
    props.insert("plan".to_string(), serde_json::json!("pro"));
    assert!(client.identify("user-1", props).await);
    client.flush().await;

    assert!(client.alias("user-1", "anon-9").await);
    client.flush().await;

    assert!(
        client
            .group_identify("company", "acme", posthog_rust::Properties::new(), None)
            .await
    );
    client.flush().await;

    identify_mock.assert_hits(1);
    alias_mock.assert_hits(1);
    group_mock.assert_hits(1);
    client.shutdown().await;
}
