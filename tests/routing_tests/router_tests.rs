//! Router Tests
//!
//! Tests for key hashing, replica selection, snapshot swaps and dist keys.

use std::sync::Arc;
use std::thread;

use memdcore::mock::default_vbucket_map;
use memdcore::routing::{make_dist_keys, BucketType, ReplicaTarget, Router, TopologySnapshot};
use memdcore::MemdError;

fn addresses(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("node{}:11210", i)).collect()
}

fn snapshot(nodes: usize, vbuckets: usize, replicas: usize) -> TopologySnapshot {
    TopologySnapshot::couchbase(
        addresses(nodes),
        default_vbucket_map(vbuckets, nodes, replicas),
    )
    .unwrap()
}

// =============================================================================
// Hashing Tests
// =============================================================================

#[test]
fn test_vbucket_formula() {
    let snapshot = snapshot(4, 1024, 1);
    for key in [&b"foo"[..], b"hello", b"user::42", b""] {
        let expected = ((crc32fast::hash(key) >> 16) & 0x7fff) as usize % 1024;
        assert_eq!(snapshot.vbucket_by_key(key) as usize, expected);
    }
}

#[test]
fn test_same_key_same_route() {
    let router = Router::new(snapshot(4, 64, 1));
    let first = router.route(b"stable", ReplicaTarget::Primary, |_| true).unwrap();
    for _ in 0..10 {
        let again = router.route(b"stable", ReplicaTarget::Primary, |_| true).unwrap();
        assert_eq!(again.vbucket, first.vbucket);
        assert_eq!(again.node, first.node);
    }
}

// =============================================================================
// Replica Selection Tests
// =============================================================================

#[test]
fn test_replica_indexes() {
    let router = Router::new(snapshot(4, 64, 2));
    let primary = router.route(b"key", ReplicaTarget::Primary, |_| true).unwrap();
    let first = router.route(b"key", ReplicaTarget::Replica(1), |_| true).unwrap();
    let second = router.route(b"key", ReplicaTarget::Replica(2), |_| true).unwrap();

    assert_eq!(first.node, (primary.node + 1) % 4);
    assert_eq!(second.node, (primary.node + 2) % 4);
    assert_eq!(primary.address(), format!("node{}:11210", primary.node));

    assert!(matches!(
        router.route(b"key", ReplicaTarget::Replica(3), |_| true),
        Err(MemdError::ReplicaUnavailable(3))
    ));
}

#[test]
fn test_missing_replica_slot() {
    let map = vec![vec![0, -1]; 8];
    let router = Router::new(TopologySnapshot::couchbase(addresses(1), map).unwrap());

    assert!(matches!(
        router.route(b"key", ReplicaTarget::Replica(1), |_| true),
        Err(MemdError::ReplicaUnavailable(1))
    ));
    assert!(router.route(b"key", ReplicaTarget::AnyReplica, |_| true).is_err());
}

#[test]
fn test_any_replica_only_picks_live_nodes() {
    let router = Router::new(snapshot(4, 64, 3));
    let primary = router.route(b"k", ReplicaTarget::Primary, |_| true).unwrap().node;
    let only = (primary + 2) % 4;

    for _ in 0..20 {
        let route = router
            .route(b"k", ReplicaTarget::AnyReplica, |ix| ix == only)
            .unwrap();
        assert_eq!(route.node, only);
    }
}

#[test]
fn test_cache_only_bucket() {
    let snapshot = TopologySnapshot::memcached(addresses(3)).unwrap();
    assert_eq!(snapshot.bucket_type(), BucketType::Memcached);
    assert!(!snapshot.has_vbuckets());

    let router = Router::new(snapshot);
    let route = router.route(b"abc", ReplicaTarget::Primary, |_| true).unwrap();
    assert_eq!(route.node, crc32fast::hash(b"abc") as usize % 3);
    assert_eq!(route.vbucket, 0);

    assert!(matches!(
        router.route(b"abc", ReplicaTarget::Replica(1), |_| true),
        Err(MemdError::NotSupported(_))
    ));
}

// =============================================================================
// Snapshot Tests
// =============================================================================

#[test]
fn test_rejects_empty_topologies() {
    assert!(TopologySnapshot::couchbase(Vec::new(), vec![vec![0]]).is_err());
    assert!(TopologySnapshot::memcached(Vec::new()).is_err());
    assert!(TopologySnapshot::couchbase(addresses(2), vec![vec![0], vec![5]]).is_err());
}

#[test]
fn test_older_revision_ignored() {
    let router = Router::new(snapshot(2, 16, 1).with_revision(5));
    assert!(!router.install(snapshot(3, 16, 1).with_revision(4)));
    assert_eq!(router.snapshot().num_nodes(), 2);

    assert!(router.install(snapshot(3, 16, 1).with_revision(6)));
    assert_eq!(router.snapshot().num_nodes(), 3);

    // Unversioned snapshots always replace
    assert!(router.install(snapshot(1, 16, 0)));
    assert_eq!(router.snapshot().revision(), 0);
}

#[test]
fn test_concurrent_readers_see_whole_snapshots() {
    let router = Arc::new(Router::new(snapshot(2, 64, 1)));

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let router = Arc::clone(&router);
            thread::spawn(move || {
                for i in 0..2000 {
                    let key = format!("key{}", i);
                    let route = router
                        .route(key.as_bytes(), ReplicaTarget::Primary, |_| true)
                        .unwrap();
                    let snapshot = &route.snapshot;
                    assert!(route.node < snapshot.num_nodes());
                    assert_eq!(snapshot.num_vbuckets(), 64);
                }
            })
        })
        .collect();

    for n in 0..200 {
        router.install(snapshot(2 + n % 3, 64, 1));
    }
    for reader in readers {
        reader.join().unwrap();
    }
}

// =============================================================================
// Dist Key Tests
// =============================================================================

#[test]
fn test_dist_keys_cover_every_node() {
    let snapshot = snapshot(4, 64, 1);
    let keys = make_dist_keys(&snapshot).unwrap();
    assert_eq!(keys.len(), 4);

    for (node, key) in keys.iter().enumerate() {
        assert!(key.starts_with("DistKey_"));
        let vb = snapshot.vbucket_by_key(key.as_bytes());
        assert_eq!(snapshot.node_by_vbucket(vb, 0).unwrap(), node);
    }
}

#[test]
fn test_dist_keys_cache_only() {
    let snapshot = TopologySnapshot::memcached(addresses(3)).unwrap();
    let keys = make_dist_keys(&snapshot).unwrap();
    for (node, key) in keys.iter().enumerate() {
        assert_eq!(snapshot.node_by_key_hash(key.as_bytes()), node);
    }
}

#[test]
fn test_dist_keys_idle_node() {
    let map = vec![vec![0]; 16];
    let snapshot = TopologySnapshot::couchbase(addresses(2), map).unwrap();
    assert!(matches!(make_dist_keys(&snapshot), Err(MemdError::Routing(_))));
}
