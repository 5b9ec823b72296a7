//! KV Operation Tests
//!
//! Basic document operations through the agent against the mock cluster.

mod common;

use std::time::Duration;

use common::{agent, cluster, node_for, run, store};
use memdcore::{ErrorKind, MemdError, StatusCode};

// =============================================================================
// Get / Set / Add / Replace / Remove
// =============================================================================

#[test]
fn test_set_then_get() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    let stored = run(|cb| agent.set(b"test", &b"{\"x\":1}"[..], 0x0102_0304, 0, 0, cb)).unwrap();
    assert_ne!(stored.cas, 0);

    let got = run(|cb| agent.get(b"test", cb)).unwrap();
    assert_eq!(&got.value[..], b"{\"x\":1}");
    assert_eq!(got.flags, 0x0102_0304);
    assert_eq!(got.cas, stored.cas);
}

#[test]
fn test_every_mutation_changes_cas() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    let first = store(&agent, "cas-key", "a");
    let second = store(&agent, "cas-key", "b");
    assert_ne!(first.cas, second.cas);
}

#[test]
fn test_get_missing() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    let error = run(|cb| agent.get(b"no-such-key", cb)).unwrap_err();
    assert!(error.is_key_not_found());
    assert_eq!(error.kind(), Some(ErrorKind::KeyNotFound));
}

#[test]
fn test_add_existing_fails() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    run(|cb| agent.add(b"added", &b"one"[..], 0, 0, cb)).unwrap();
    let error = run(|cb| agent.add(b"added", &b"two"[..], 0, 0, cb)).unwrap_err();
    assert!(error.is_key_exists());

    let got = run(|cb| agent.get(b"added", cb)).unwrap();
    assert_eq!(&got.value[..], b"one");
}

#[test]
fn test_replace_requires_existing() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    let error = run(|cb| agent.replace(b"replaced", &b"v"[..], 0, 0, 0, cb)).unwrap_err();
    assert!(error.is_key_not_found());

    store(&agent, "replaced", "old");
    run(|cb| agent.replace(b"replaced", &b"new"[..], 0, 0, 0, cb)).unwrap();
    let got = run(|cb| agent.get(b"replaced", cb)).unwrap();
    assert_eq!(&got.value[..], b"new");
}

#[test]
fn test_cas_mismatch_leaves_value() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    let stored = store(&agent, "guarded", "original");
    let error =
        run(|cb| agent.set(b"guarded", &b"stomp"[..], 0, 0, stored.cas + 1, cb)).unwrap_err();
    assert!(error.is_cas_mismatch());
    assert!(error.is_status(StatusCode::KeyExists));

    let got = run(|cb| agent.get(b"guarded", cb)).unwrap();
    assert_eq!(&got.value[..], b"original");

    let updated = run(|cb| agent.set(b"guarded", &b"ok"[..], 0, 0, stored.cas, cb)).unwrap();
    assert_ne!(updated.cas, stored.cas);
}

#[test]
fn test_remove() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    let stored = store(&agent, "doomed", "bye");
    let error = run(|cb| agent.remove(b"doomed", stored.cas + 1, cb)).unwrap_err();
    assert!(error.is_cas_mismatch());

    run(|cb| agent.remove(b"doomed", 0, cb)).unwrap();
    assert!(run(|cb| agent.get(b"doomed", cb)).unwrap_err().is_key_not_found());
    assert!(run(|cb| agent.remove(b"doomed", 0, cb)).unwrap_err().is_key_not_found());
}

#[test]
fn test_mutation_tokens() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    let first = store(&agent, "tokened", "1").mutation_token.expect("token");
    let second = store(&agent, "tokened", "2").mutation_token.expect("token");

    assert_eq!(first.vbucket, agent.topology().vbucket_by_key(b"tokened"));
    assert_eq!(first.vbuuid, second.vbuuid);
    assert!(second.seqno > first.seqno);
}

#[test]
fn test_invalid_keys_fail_synchronously() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    let result = agent.get(b"", |_| panic!("callback runs for a rejected key"));
    assert!(matches!(result, Err(MemdError::InvalidArgument(_))));

    let long = vec![b'k'; 251];
    assert!(matches!(
        agent.get(&long, |_| {}),
        Err(MemdError::InvalidArgument(_))
    ));
}

// =============================================================================
// Counters and Adjoins
// =============================================================================

#[test]
fn test_counters() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    let seeded = run(|cb| agent.increment(b"counter", 5, Some(10), 0, cb)).unwrap();
    assert_eq!(seeded.value, 10);

    let bumped = run(|cb| agent.increment(b"counter", 5, Some(10), 0, cb)).unwrap();
    assert_eq!(bumped.value, 15);
    assert_ne!(bumped.cas, seeded.cas);
    assert!(bumped.mutation_token.is_some());

    let lowered = run(|cb| agent.decrement(b"counter", 3, None, 0, cb)).unwrap();
    assert_eq!(lowered.value, 12);

    let floored = run(|cb| agent.decrement(b"counter", 100, None, 0, cb)).unwrap();
    assert_eq!(floored.value, 0);

    let got = run(|cb| agent.get(b"counter", cb)).unwrap();
    assert_eq!(&got.value[..], b"0");
}

#[test]
fn test_counter_initial_only_seeds() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    let first = run(|cb| agent.increment(b"seeded", 5, Some(11), 0, cb)).unwrap();
    assert_eq!(first.value, 11);
    let second = run(|cb| agent.increment(b"seeded", 5, Some(22), 0, cb)).unwrap();
    assert_eq!(second.value, 16);
    let third = run(|cb| agent.decrement(b"seeded", 3, Some(65), 0, cb)).unwrap();
    assert_eq!(third.value, 13);
}

#[test]
fn test_counter_without_initial() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    let error = run(|cb| agent.increment(b"absent-counter", 1, None, 0, cb)).unwrap_err();
    assert!(error.is_key_not_found());
}

#[test]
fn test_counter_on_non_numeric_value() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    store(&agent, "words", "not a number");
    let error = run(|cb| agent.increment(b"words", 1, Some(0), 0, cb)).unwrap_err();
    assert_eq!(error.kind(), Some(ErrorKind::BadDelta));
}

#[test]
fn test_append_prepend() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    store(&agent, "adjoined", "middle");
    run(|cb| agent.append(b"adjoined", &b"-end"[..], cb)).unwrap();
    run(|cb| agent.prepend(b"adjoined", &b"start-"[..], cb)).unwrap();

    let got = run(|cb| agent.get(b"adjoined", cb)).unwrap();
    assert_eq!(&got.value[..], b"start-middle-end");

    store(&agent, "greeting", "there");
    run(|cb| agent.append(b"greeting", &b" Frank!"[..], cb)).unwrap();
    run(|cb| agent.prepend(b"greeting", &b"Hello "[..], cb)).unwrap();
    let got = run(|cb| agent.get(b"greeting", cb)).unwrap();
    assert_eq!(&got.value[..], b"Hello there Frank!");

    let error = run(|cb| agent.append(b"nothing-here", &b"x"[..], cb)).unwrap_err();
    assert_eq!(error.kind(), Some(ErrorKind::NotStored));
}

// =============================================================================
// Expiry
// =============================================================================

#[test]
fn test_expiry() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    run(|cb| agent.set(b"ephemeral", &b"v"[..], 0, 1, 0, cb)).unwrap();
    assert!(run(|cb| agent.get(b"ephemeral", cb)).is_ok());

    cluster.time_travel(Duration::from_secs(2));
    assert!(run(|cb| agent.get(b"ephemeral", cb)).unwrap_err().is_key_not_found());
}

#[test]
fn test_touch_extends_expiry() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    run(|cb| agent.set(b"touched", &b"v"[..], 0, 1, 0, cb)).unwrap();
    run(|cb| agent.touch(b"touched", 10, cb)).unwrap();

    cluster.time_travel(Duration::from_secs(2));
    assert!(run(|cb| agent.get(b"touched", cb)).is_ok());

    cluster.time_travel(Duration::from_secs(10));
    assert!(run(|cb| agent.get(b"touched", cb)).unwrap_err().is_key_not_found());
}

#[test]
fn test_get_and_touch() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    let stored = run(|cb| agent.set(b"gat", &b"payload"[..], 9, 1, 0, cb)).unwrap();
    let got = run(|cb| agent.get_and_touch(b"gat", 10, cb)).unwrap();
    assert_eq!(&got.value[..], b"payload");
    assert_eq!(got.flags, 9);
    assert_ne!(got.cas, stored.cas);

    cluster.time_travel(Duration::from_secs(2));
    assert!(run(|cb| agent.get(b"gat", cb)).is_ok());

    let error = run(|cb| agent.get_and_touch(b"missing-gat", 10, cb)).unwrap_err();
    assert!(error.is_key_not_found());
}

// =============================================================================
// Replicas and Random Reads
// =============================================================================

#[test]
fn test_get_replica() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    store(&agent, "replicated", "copy");
    assert_ne!(
        node_for(&agent, b"replicated", 0),
        node_for(&agent, b"replicated", 1)
    );

    let any = run(|cb| agent.get_replica(b"replicated", 0, cb)).unwrap();
    assert_eq!(&any.value[..], b"copy");

    let first = run(|cb| agent.get_replica(b"replicated", 1, cb)).unwrap();
    assert_eq!(&first.value[..], b"copy");

    // The default layout has a single replica
    let error = agent.get_replica(b"replicated", 2, |_| {}).unwrap_err();
    assert!(matches!(error, MemdError::ReplicaUnavailable(2)));
}

#[test]
fn test_get_random() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    for i in 0..32 {
        store(&agent, &format!("random-{}", i), "r");
    }

    let random = run(|cb| agent.get_random(cb)).unwrap();
    assert!(random.key.starts_with(b"random-"));
    assert_eq!(&random.value[..], b"r");
    assert_ne!(random.cas, 0);
}

// =============================================================================
// Cache-only Buckets
// =============================================================================

#[test]
fn test_memcached_bucket() {
    let cluster = cluster();
    let agent = agent(&cluster, "memd");

    let stored = store(&agent, "cached", "value");
    assert!(stored.mutation_token.is_none());

    let got = run(|cb| agent.get(b"cached", cb)).unwrap();
    assert_eq!(&got.value[..], b"value");

    let counter = run(|cb| agent.increment(b"hits", 1, Some(1), 0, cb)).unwrap();
    assert_eq!(counter.value, 1);

    assert!(matches!(
        agent.get_replica(b"cached", 1, |_| {}),
        Err(MemdError::NotSupported(_))
    ));
}
