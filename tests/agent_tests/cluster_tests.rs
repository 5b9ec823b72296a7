//! Cluster Behaviour Tests
//!
//! Retries, re-routing, timeouts, reconnects, authentication and the
//! per-node operations (stats, random reads) against the mock cluster.

mod common;

use std::time::{Duration, Instant};

use common::{agent, cluster, config, connect, eventually, node_for, run, store, WAIT};
use memdcore::completion::channel;
use memdcore::mock::{default_vbucket_map, BucketConfig, MockCluster, MockConfig};
use memdcore::protocol::{HelloFeature, Opcode};
use memdcore::{make_dist_keys, ErrorKind, MemdError, StatusCode};

fn secured_cluster() -> MockCluster {
    let config =
        MockConfig::default().bucket(BucketConfig::couchbase("secure").with_password("s3cret"));
    MockCluster::with_config(config).expect("mock cluster starts")
}

// =============================================================================
// Stats and Endpoints
// =============================================================================

#[test]
fn test_stats_from_every_node() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    for i in 0..10 {
        store(&agent, &format!("stat-{}", i), "v");
    }

    let nodes = run(|cb| agent.stats("", cb)).unwrap();
    assert_eq!(nodes.len(), cluster.num_nodes());
    for address in cluster.addresses() {
        let node = &nodes[&address];
        assert!(node.error.is_none());
        assert_eq!(node.stats["curr_items"], "10");
        assert!(node.stats.contains_key("uptime"));
        assert!(node.stats.contains_key("version"));
    }
}

#[test]
fn test_stats_vbucket_group() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    let nodes = run(|cb| agent.stats("vbucket", cb)).unwrap();
    let active: usize = nodes
        .values()
        .map(|node| node.stats.values().filter(|state| *state == "active").count())
        .sum();
    assert_eq!(active, agent.topology().num_vbuckets());
}

#[test]
fn test_stats_unknown_group() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    let nodes = run(|cb| agent.stats("no-such-group", cb)).unwrap();
    assert_eq!(nodes.len(), cluster.num_nodes());
    for node in nodes.values() {
        let error = node.error.as_ref().expect("per-node error");
        assert!(error.is_key_not_found());
    }
}

#[test]
fn test_service_endpoints() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    assert_eq!(agent.num_pipelines(), cluster.num_nodes());
    assert_eq!(agent.mgmt_endpoints().len(), cluster.num_nodes());
    assert!(!agent.query_endpoints().is_empty());
    assert!(agent.capi_endpoints().iter().all(|e| e.ends_with("/default")));
}

#[test]
fn test_capabilities() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    let capabilities = agent.capabilities().expect("negotiated");
    assert!(capabilities.xattr());
    assert!(capabilities.mutation_tokens());
    assert!(capabilities.enhanced_errors());
    assert!(capabilities.error_map);
}

#[test]
fn test_features_follow_the_server() {
    let config = MockConfig::default()
        .features(vec![HelloFeature::TcpNoDelay, HelloFeature::SelectBucket])
        .error_map(false);
    let cluster = MockCluster::with_config(config).unwrap();
    let agent = agent(&cluster, "default");

    let capabilities = agent.capabilities().expect("negotiated");
    assert!(!capabilities.mutation_tokens());
    assert!(!capabilities.error_map);
    assert!(store(&agent, "plain", "v").mutation_token.is_none());
}

// =============================================================================
// Retries
// =============================================================================

#[test]
fn test_temporary_failure_is_retried() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    store(&agent, "flaky", "v");

    let node = node_for(&agent, b"flaky", 0);
    cluster.fail_next(node, Opcode::Get, StatusCode::TmpFail, 3);

    let started = Instant::now();
    let got = run(|cb| agent.get(b"flaky", cb)).unwrap();
    assert_eq!(&got.value[..], b"v");
    // Error map backoff: 5 + 10 + 20 ms
    assert!(started.elapsed() >= Duration::from_millis(35));
}

#[test]
fn test_busy_is_retried() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    let node = node_for(&agent, b"busy", 0);
    cluster.fail_next(node, Opcode::Set, StatusCode::Busy, 2);
    store(&agent, "busy", "v");

    let got = run(|cb| agent.get(b"busy", cb)).unwrap();
    assert_eq!(&got.value[..], b"v");
}

#[test]
fn test_retries_stop_at_the_deadline() {
    let cluster = cluster();
    let agent = connect(
        &cluster,
        config("default").op_timeout(Duration::from_millis(200)).build(),
    )
    .unwrap();

    let node = node_for(&agent, b"stuck", 0);
    cluster.fail_next(node, Opcode::Get, StatusCode::TmpFail, 1000);

    let error = run(|cb| agent.get(b"stuck", cb)).unwrap_err();
    assert_eq!(error.kind(), Some(ErrorKind::TemporaryFailure));
}

#[test]
fn test_terminal_failure_carries_enhanced_context() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    let node = node_for(&agent, b"too-big", 0);
    cluster.fail_next(node, Opcode::Set, StatusCode::TooBig, 1);

    let error = run(|cb| agent.set(b"too-big", &b"v"[..], 0, 0, 0, cb)).unwrap_err();
    match error {
        MemdError::Kv(kv) => {
            assert_eq!(kv.status, StatusCode::TooBig);
            assert_eq!(kv.context.as_deref(), Some("injected TooBig"));
            assert_eq!(kv.reference, Some(format!("mock-node-{}", node)));
        }
        other => panic!("expected a server error, got {:?}", other),
    }

    // The fault is consumed; the next write goes through
    store(&agent, "too-big", "v");
}

// =============================================================================
// Topology Changes
// =============================================================================

#[test]
fn test_not_my_vbucket_reroutes_after_topology_update() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    store(&agent, "moving", "v");

    let bucket = cluster.bucket("default").unwrap();
    let old = cluster.topology("default").unwrap();
    let moved = default_vbucket_map(64, cluster.num_nodes(), 1)
        .into_iter()
        .map(|row| {
            row.into_iter()
                .map(|ix| if ix < 0 { ix } else { (ix + 1) % cluster.num_nodes() as i32 })
                .collect()
        })
        .collect();
    bucket.set_vbucket_map(moved);

    let before = node_for(&agent, b"moving", 0);
    let (callback, waiter) = channel();
    agent.get(b"moving", callback).unwrap();

    std::thread::sleep(Duration::from_millis(50));
    assert!(agent.apply_topology(cluster.topology("default").unwrap()).unwrap());
    assert_ne!(node_for(&agent, b"moving", 0), before);

    let got = waiter.wait_timeout(WAIT).unwrap();
    assert_eq!(&got.value[..], b"v");

    // A stale snapshot is ignored
    assert!(!agent.apply_topology(old).unwrap());
    assert_ne!(node_for(&agent, b"moving", 0), before);
}

#[test]
fn test_dist_keys_cover_the_cluster() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    let keys = make_dist_keys(&agent.topology()).unwrap();
    assert_eq!(keys.len(), cluster.num_nodes());
    for (node, key) in keys.iter().enumerate() {
        assert_eq!(node_for(&agent, key.as_bytes(), 0), node);
        store(&agent, key, "spread");
    }
}

// =============================================================================
// Timeouts, Cancellation and Reconnects
// =============================================================================

#[test]
fn test_operation_timeout() {
    let cluster = cluster();
    let agent = connect(
        &cluster,
        config("default").op_timeout(Duration::from_millis(100)).build(),
    )
    .unwrap();

    let node = node_for(&agent, b"slow", 0);
    cluster.set_latency(node, Duration::from_millis(500));

    let started = Instant::now();
    let error = run(|cb| agent.get(b"slow", cb)).unwrap_err();
    assert!(matches!(error, MemdError::Timeout));
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[test]
fn test_cancel() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    let node = node_for(&agent, b"cancelled", 0);
    cluster.set_latency(node, Duration::from_millis(300));

    let (callback, waiter) = channel();
    let pending = agent.get(b"cancelled", callback).unwrap();
    assert!(!pending.is_completed());
    assert!(pending.cancel());
    assert!(pending.is_completed());
    assert!(!pending.cancel());

    assert!(matches!(waiter.wait_timeout(WAIT), Err(MemdError::Cancelled)));
}

#[test]
fn test_reconnect_after_connection_loss() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    store(&agent, "survivor", "v");

    let node = node_for(&agent, b"survivor", 0);
    cluster.drop_connections(node);

    let got = eventually(WAIT, || run(|cb| agent.get(b"survivor", cb))).unwrap();
    assert_eq!(&got.value[..], b"v");
    agent.wait_ready(WAIT).unwrap();
}

#[test]
fn test_in_flight_request_fails_on_connection_loss() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    store(&agent, "in-flight", "v");

    let node = node_for(&agent, b"in-flight", 0);
    cluster.set_latency(node, Duration::from_millis(400));

    let (callback, waiter) = channel();
    agent.get(b"in-flight", callback).unwrap();
    std::thread::sleep(Duration::from_millis(100));
    cluster.drop_connections(node);

    let error = waiter.wait_timeout(WAIT).unwrap_err();
    assert!(matches!(error, MemdError::ConnectionLost(_)));
}

#[test]
fn test_closed_connections_are_released() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    for node in 0..cluster.num_nodes() {
        assert_eq!(cluster.connection_count(node), 1);
    }

    agent.close();
    let deadline = Instant::now() + WAIT;
    while (0..cluster.num_nodes()).any(|node| cluster.connection_count(node) > 0) {
        assert!(Instant::now() < deadline, "mock still holds closed connections");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_close() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    agent.close();
    assert!(matches!(agent.get(b"k", |_| {}), Err(MemdError::Shutdown)));
    assert!(matches!(agent.stats("", |_| {}), Err(MemdError::Shutdown)));
    agent.close();
}

// =============================================================================
// Authentication
// =============================================================================

#[test]
fn test_protected_bucket_needs_credentials() {
    let cluster = secured_cluster();

    let error = connect(&cluster, config("secure").build()).unwrap_err();
    assert!(matches!(error, MemdError::Auth(_)));

    let wrong = config("secure").sasl_plain("secure", "wrong").build();
    let error = connect(&cluster, wrong).unwrap_err();
    assert!(matches!(error, MemdError::Auth(_)));
}

#[test]
fn test_protected_bucket_with_credentials() {
    let cluster = secured_cluster();
    let secure = config("secure").sasl_plain("secure", "s3cret").build();
    let agent = connect(&cluster, secure).unwrap();

    store(&agent, "secret", "v");
    let got = run(|cb| agent.get(b"secret", cb)).unwrap();
    assert_eq!(&got.value[..], b"v");

    // Buckets do not share documents
    let other = common::agent(&cluster, "default");
    assert!(run(|cb| other.get(b"secret", cb)).unwrap_err().is_key_not_found());
}

#[test]
fn test_unknown_bucket() {
    let cluster = cluster();
    let config = config("nope").build();
    // The mock has no topology for it; borrow the default bucket's layout
    let snapshot = cluster.topology("default").unwrap();
    let error = memdcore::Agent::connect(config, snapshot).unwrap_err();
    assert!(matches!(error, MemdError::Auth(_)));
}
