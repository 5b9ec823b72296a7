//! Durability Tests
//!
//! Observe and observe-seqno polling against active and replica copies.

mod common;

use common::{agent, cluster, run, store};
use memdcore::{KeyState, MemdError};

// =============================================================================
// Observe
// =============================================================================

#[test]
fn test_observe_persisted() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    let stored = store(&agent, "durable", "v");

    let result = run(|cb| agent.observe(b"durable", 0, cb)).unwrap();
    assert_eq!(result.key_state, KeyState::Persisted);
    assert_eq!(result.cas, stored.cas);
}

#[test]
fn test_observe_not_persisted() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    let bucket = cluster.bucket("default").unwrap();

    bucket.pause_persistence();
    store(&agent, "in-memory", "v");
    let result = run(|cb| agent.observe(b"in-memory", 0, cb)).unwrap();
    assert_eq!(result.key_state, KeyState::NotPersisted);

    bucket.resume_persistence();
    let result = run(|cb| agent.observe(b"in-memory", 0, cb)).unwrap();
    assert_eq!(result.key_state, KeyState::Persisted);
}

#[test]
fn test_observe_deleted_and_missing() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    store(&agent, "gone", "v");
    let removed = run(|cb| agent.remove(b"gone", 0, cb)).unwrap();
    let result = run(|cb| agent.observe(b"gone", 0, cb)).unwrap();
    assert_eq!(result.key_state, KeyState::Deleted);
    assert_eq!(result.cas, removed.cas);

    let result = run(|cb| agent.observe(b"never-there", 0, cb)).unwrap();
    assert_eq!(result.key_state, KeyState::NotFound);
}

#[test]
fn test_observe_replica() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    let stored = store(&agent, "copied", "v");

    let result = run(|cb| agent.observe(b"copied", 1, cb)).unwrap();
    assert_eq!(result.cas, stored.cas);

    let error = agent.observe(b"copied", 2, |_| {}).unwrap_err();
    assert!(matches!(error, MemdError::ReplicaUnavailable(2)));
}

// =============================================================================
// Observe SeqNo
// =============================================================================

#[test]
fn test_observe_seqno_tracks_token() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    let token = store(&agent, "seq", "v").mutation_token.unwrap();

    let result = run(|cb| agent.observe_seqno(b"seq", token.vbuuid, 0, cb)).unwrap();
    assert_eq!(result.vbucket, token.vbucket);
    assert_eq!(result.vbuuid, token.vbuuid);
    assert!(result.failover.is_none());
    assert!(result.current >= token.seqno);
    assert!(token.is_observed_by(&result));
    assert!(token.is_persisted_by(&result));

    let replica = run(|cb| agent.observe_seqno(b"seq", token.vbuuid, 1, cb)).unwrap();
    assert!(token.is_observed_by(&replica));
}

#[test]
fn test_observe_seqno_is_monotonic() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    let first = store(&agent, "climbing", "1").mutation_token.unwrap();
    let before = run(|cb| agent.observe_seqno(b"climbing", first.vbuuid, 0, cb)).unwrap();
    store(&agent, "climbing", "2");
    let after = run(|cb| agent.observe_seqno(b"climbing", first.vbuuid, 0, cb)).unwrap();

    assert!(after.current >= before.current);
    assert!(after.current > first.seqno);
}

#[test]
fn test_observe_seqno_while_not_persisted() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    let bucket = cluster.bucket("default").unwrap();

    bucket.pause_persistence();
    let token = store(&agent, "unsaved", "v").mutation_token.unwrap();
    let result = run(|cb| agent.observe_seqno(b"unsaved", token.vbuuid, 0, cb)).unwrap();
    assert!(token.is_observed_by(&result));
    assert!(!token.is_persisted_by(&result));
    assert!(result.persisted < token.seqno);

    bucket.resume_persistence();
    let result = run(|cb| agent.observe_seqno(b"unsaved", token.vbuuid, 0, cb)).unwrap();
    assert!(token.is_persisted_by(&result));
}

#[test]
fn test_observe_seqno_after_failover() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    let bucket = cluster.bucket("default").unwrap();
    let token = store(&agent, "branched", "v").mutation_token.unwrap();

    let new_uuid = bucket.failover(token.vbucket).unwrap();
    assert_ne!(new_uuid, token.vbuuid);

    let result = run(|cb| agent.observe_seqno(b"branched", token.vbuuid, 0, cb)).unwrap();
    assert_eq!(result.vbuuid, new_uuid);
    let failover = result.failover.expect("failover section");
    assert_eq!(failover.old_vbuuid, token.vbuuid);
    assert!(failover.last_seqno >= token.seqno);
    assert!(token.is_observed_by(&result));

    // Writes on the new branch are judged against the new uuid
    let next = store(&agent, "branched", "w").mutation_token.unwrap();
    assert_eq!(next.vbuuid, new_uuid);
    let result = run(|cb| agent.observe_seqno(b"branched", next.vbuuid, 0, cb)).unwrap();
    assert!(result.failover.is_none());
    assert!(next.is_observed_by(&result));
}

#[test]
fn test_unknown_branch_is_not_reached() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    let mut token = store(&agent, "stranger", "v").mutation_token.unwrap();
    token.vbuuid ^= 0xffff;

    let result = run(|cb| agent.observe_seqno(b"stranger", token.vbuuid, 0, cb)).unwrap();
    assert!(result.failover.is_none());
    assert!(!token.is_observed_by(&result));
}

// =============================================================================
// Unsupported Buckets
// =============================================================================

#[test]
fn test_memcached_bucket_rejects_observe() {
    let cluster = cluster();
    let agent = agent(&cluster, "memd");

    assert!(matches!(
        agent.observe(b"k", 0, |_| {}),
        Err(MemdError::NotSupported(_))
    ));
    assert!(matches!(
        agent.observe_seqno(b"k", 0, 0, |_| {}),
        Err(MemdError::NotSupported(_))
    ));
}
