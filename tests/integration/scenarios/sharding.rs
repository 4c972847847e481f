//! Sharding and fan-out tests
//!
//! Key placement across several servers, multi-key gets that span them,
//! and the flush broadcast.

use crate::integration::{client_for, MockMemcached, ResponseMode};
use memshard::{Client, Item, MemcacheError};
use std::collections::HashMap;

async fn mocks(n: usize) -> Vec<MockMemcached> {
    let mut mocks = Vec::with_capacity(n);
    for _ in 0..n {
        mocks.push(MockMemcached::new().await.unwrap());
    }
    mocks
}

/// Finds a key owned by the server at `addr`.
fn key_on(client: &Client, addr: &str, prefix: &str) -> String {
    (0..10_000)
        .map(|i| format!("{}{}", prefix, i))
        .find(|key| client.selector().pick_server(key).unwrap().server() == addr)
        .unwrap()
}

// ============================================================================
// Placement
// ============================================================================

#[tokio::test]
async fn test_keys_land_on_checksum_selected_server() {
    let mocks = mocks(3).await;
    let client = client_for(&[&mocks[0], &mocks[1], &mocks[2]]).await;

    for i in 0..60 {
        let key = format!("key{}", i);
        client.set(&Item::new(key.as_str(), "v")).await.unwrap();

        let expected = crc32fast::hash(key.as_bytes()) as usize % mocks.len();
        for (idx, mock) in mocks.iter().enumerate() {
            assert_eq!(
                mock.get_stored_value(&key).is_some(),
                idx == expected,
                "key {} on server {}",
                key,
                idx
            );
        }
    }

    // Sixty keys over three servers should not all pile onto one
    assert!(mocks.iter().filter(|m| m.stored_len() > 0).count() > 1);

    for mock in mocks {
        mock.shutdown();
    }
}

// ============================================================================
// Multi-get
// ============================================================================

#[tokio::test]
async fn test_get_multi_returns_only_hits() {
    let mocks = mocks(3).await;
    let client = client_for(&[&mocks[0], &mocks[1], &mocks[2]]).await;

    client.set(&Item::new("foo1", "fooval1")).await.unwrap();
    client
        .set(&Item::new("foo2", "fooval2").with_flags(9))
        .await
        .unwrap();

    let fetched = client
        .get_multi(&["foo1", "foo2", "missing"])
        .await
        .unwrap();
    assert!(fetched.is_complete());

    let items = fetched.into_result().unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items["foo1"].value, b"fooval1");
    assert_eq!(items["foo2"].value, b"fooval2");
    assert_eq!(items["foo2"].flags, 9);
    assert!(!items.contains_key("missing"));

    for mock in mocks {
        mock.shutdown();
    }
}

#[tokio::test]
async fn test_get_multi_sends_one_request_per_server() {
    let mocks = mocks(2).await;
    let client = client_for(&[&mocks[0], &mocks[1]]).await;

    let mut keys = Vec::new();
    for mock in &mocks {
        for n in 0..3 {
            let key = key_on(&client, mock.addr(), &format!("k{}-", n));
            mock.set_stored_value(&key, key.as_bytes());
            keys.push(key);
        }
    }

    let items = client.get_multi(keys.as_slice()).await.unwrap().into_result().unwrap();
    assert_eq!(items.len(), keys.len());
    for key in &keys {
        assert_eq!(items[key].value, key.as_bytes());
    }

    for mock in &mocks {
        assert_eq!(mock.stats().gets, 1);
    }

    for mock in mocks {
        mock.shutdown();
    }
}

#[tokio::test]
async fn test_get_multi_empty_and_duplicate_keys() {
    let mock = MockMemcached::new().await.unwrap();
    let client = client_for(&[&mock]).await;

    let empty: [&str; 0] = [];
    let fetched = client.get_multi(&empty).await.unwrap();
    assert!(fetched.items.is_empty());
    assert!(fetched.is_complete());
    assert_eq!(mock.stats().requests, 0);

    mock.set_stored_value("dup", b"x");
    let items = client
        .get_multi(&["dup", "dup"])
        .await
        .unwrap()
        .into_result()
        .unwrap();
    assert_eq!(items.len(), 1);

    mock.shutdown();
}

#[tokio::test]
async fn test_get_multi_keeps_results_from_healthy_shards() {
    let mocks = mocks(2).await;
    let client = client_for(&[&mocks[0], &mocks[1]]).await;

    let healthy_key = key_on(&client, mocks[0].addr(), "ok");
    let broken_key = key_on(&client, mocks[1].addr(), "bad");
    mocks[0].set_stored_value(&healthy_key, b"alive");
    mocks[1].set_stored_value(&broken_key, b"unreachable");
    mocks[1].set_response_mode(ResponseMode::Failure);

    let fetched = client
        .get_multi(&[healthy_key.as_str(), broken_key.as_str()])
        .await
        .unwrap();

    assert!(!fetched.is_complete());
    assert!(matches!(fetched.error, Some(MemcacheError::Io(_))));
    assert_eq!(fetched.items.len(), 1);
    assert_eq!(fetched.items[&healthy_key].value, b"alive");

    for mock in mocks {
        mock.shutdown();
    }
}

#[tokio::test]
async fn test_get_multi_reports_an_error_when_several_shards_fail() {
    let mocks = mocks(3).await;
    let client = client_for(&[&mocks[0], &mocks[1], &mocks[2]]).await;

    let healthy_keys: Vec<String> = (0..3)
        .map(|n| key_on(&client, mocks[0].addr(), &format!("ok{}-", n)))
        .collect();
    for key in &healthy_keys {
        mocks[0].set_stored_value(key, key.as_bytes());
    }
    let closed_key = key_on(&client, mocks[1].addr(), "closed");
    let erroring_key = key_on(&client, mocks[2].addr(), "erroring");
    mocks[1].set_response_mode(ResponseMode::Failure);
    mocks[2].set_response_mode(ResponseMode::Custom("SERVER_ERROR busy\r\n".to_string()));

    let mut keys = healthy_keys.clone();
    keys.push(closed_key);
    keys.push(erroring_key);
    let fetched = client.get_multi(keys.as_slice()).await.unwrap();

    assert_eq!(fetched.items.len(), healthy_keys.len());
    for key in &healthy_keys {
        assert_eq!(fetched.items[key].value, key.as_bytes());
    }
    match &fetched.error {
        Some(MemcacheError::Io(_)) => {}
        Some(MemcacheError::ServerError(msg)) => assert_eq!(msg, "busy"),
        other => panic!("Expected a shard error, got {:?}", other),
    }
    assert!(fetched.into_result().is_err());

    for mock in mocks {
        mock.shutdown();
    }
}

// ============================================================================
// Flush broadcast
// ============================================================================

#[tokio::test]
async fn test_flush_all_clears_every_server() {
    let mocks = mocks(3).await;
    let client = client_for(&[&mocks[0], &mocks[1], &mocks[2]]).await;

    for i in 0..30 {
        client
            .set(&Item::new(format!("key{}", i), "v"))
            .await
            .unwrap();
    }

    client.flush_all().await.unwrap();

    for mock in &mocks {
        assert_eq!(mock.stats().flushes, 1);
        assert_eq!(mock.stored_len(), 0);
    }

    for mock in mocks {
        mock.shutdown();
    }
}

#[tokio::test]
async fn test_flush_all_stops_at_first_failure() {
    let mocks = mocks(3).await;
    mocks[1].set_response_mode(ResponseMode::Custom(
        "SERVER_ERROR flush disabled\r\n".to_string(),
    ));
    let client = client_for(&[&mocks[0], &mocks[1], &mocks[2]]).await;

    match client.flush_all().await {
        Err(MemcacheError::ServerError(msg)) => assert_eq!(msg, "flush disabled"),
        other => panic!("Expected server error, got {:?}", other),
    }

    let flushes: Vec<usize> = mocks.iter().map(|m| m.stats().flushes).collect();
    assert_eq!(flushes, vec![1, 1, 0]);

    for mock in mocks {
        mock.shutdown();
    }
}

#[tokio::test]
async fn test_duplicate_server_gets_double_weight() {
    let a = MockMemcached::new().await.unwrap();
    let b = MockMemcached::new().await.unwrap();
    let client = client_for(&[&a, &a, &b]).await;

    let mut owners: HashMap<String, usize> = HashMap::new();
    for i in 0..3000 {
        let node = client.selector().pick_server(&format!("key{}", i)).unwrap();
        *owners.entry(node.server().to_string()).or_default() += 1;
    }

    // Expect roughly 2000 vs 1000
    let on_a = owners[a.addr()];
    let on_b = owners[b.addr()];
    assert!(on_a > on_b, "a={} b={}", on_a, on_b);

    a.shutdown();
    b.shutdown();
}
