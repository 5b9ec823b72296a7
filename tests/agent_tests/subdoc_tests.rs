//! Sub-Document Tests
//!
//! Multi-lookup and multi-mutation through the agent, including extended
//! attributes and access to deleted documents.

mod common;

use common::{agent, cluster, run, store};
use memdcore::subdoc::SubDocOpKind;
use memdcore::{DocFlags, ErrorKind, MemdError, StatusCode, SubDocFlags, SubDocOp};

const PROFILE: &str = r#"{"name":"ada","tags":["a","b"],"address":{"city":"london"}}"#;

// =============================================================================
// Lookups
// =============================================================================

#[test]
fn test_lookup_paths() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    let stored = store(&agent, "profile", PROFILE);

    let ops = vec![
        SubDocOp::get("name"),
        SubDocOp::exists("address.city"),
        SubDocOp::get_count("tags"),
        SubDocOp::get("tags[-1]"),
    ];
    let result = run(|cb| agent.lookup_in(b"profile", ops, DocFlags::empty(), cb)).unwrap();

    assert_eq!(result.cas, stored.cas);
    assert!(!result.deleted);
    assert!(result.results.iter().all(|r| r.is_success()));
    assert_eq!(&result.results[0].value[..], b"\"ada\"");
    assert!(result.results[1].value.is_empty());
    assert_eq!(&result.results[2].value[..], b"2");
    assert_eq!(&result.results[3].value[..], b"\"b\"");
}

#[test]
fn test_lookup_reports_per_path_failures() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    store(&agent, "partial", PROFILE);

    let ops = vec![
        SubDocOp::get("name"),
        SubDocOp::get("missing"),
        SubDocOp::get_count("name"),
    ];
    let result = run(|cb| agent.lookup_in(b"partial", ops, DocFlags::empty(), cb)).unwrap();

    assert!(result.results[0].is_success());
    assert_eq!(result.results[1].status, StatusCode::SubDocPathNotFound);
    assert_eq!(result.results[2].status, StatusCode::SubDocPathMismatch);
    assert!(result.results[1].error.is_some());
}

#[test]
fn test_lookup_whole_document() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    store(&agent, "whole", PROFILE);

    let ops = vec![SubDocOp::new(SubDocOpKind::GetDoc, "")];
    let result = run(|cb| agent.lookup_in(b"whole", ops, DocFlags::empty(), cb)).unwrap();
    assert_eq!(&result.results[0].value[..], PROFILE.as_bytes());
}

#[test]
fn test_lookup_missing_document() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    let ops = vec![SubDocOp::get("name")];
    let error = run(|cb| agent.lookup_in(b"nobody", ops, DocFlags::empty(), cb)).unwrap_err();
    assert!(error.is_key_not_found());
}

#[test]
fn test_lookup_non_json_document() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    store(&agent, "plain", "just text");

    let ops = vec![SubDocOp::get("name")];
    let result = run(|cb| agent.lookup_in(b"plain", ops, DocFlags::empty(), cb)).unwrap();
    assert_eq!(result.results[0].status, StatusCode::SubDocNotJson);
}

// =============================================================================
// Mutations
// =============================================================================

#[test]
fn test_mutate_paths() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    let stored = store(&agent, "mutated", PROFILE);

    let ops = vec![
        SubDocOp::dict_set("name", &b"\"grace\""[..]),
        SubDocOp::array_push_last("tags", &b"\"c\""[..]),
        SubDocOp::array_push_first("tags", &b"\"z\""[..]),
        SubDocOp::dict_add("address.zip", &b"\"n1\""[..]),
        SubDocOp::delete("address.city"),
        SubDocOp::counter("visits", 3),
    ];
    let result =
        run(|cb| agent.mutate_in(b"mutated", ops, DocFlags::empty(), 0, 0, cb)).unwrap();
    assert_ne!(result.cas, stored.cas);
    assert!(result.mutation_token.is_some());
    assert_eq!(&result.results[5].value[..], b"3");

    let got = run(|cb| agent.get(b"mutated", cb)).unwrap();
    let doc: serde_json::Value = serde_json::from_slice(&got.value).unwrap();
    assert_eq!(doc["name"], "grace");
    assert_eq!(doc["tags"], serde_json::json!(["z", "a", "b", "c"]));
    assert_eq!(doc["address"], serde_json::json!({"zip": "n1"}));
    assert_eq!(doc["visits"], 3);
}

#[test]
fn test_mutation_is_atomic() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    let stored = store(&agent, "atomic", PROFILE);

    let ops = vec![
        SubDocOp::dict_set("name", &b"\"changed\""[..]),
        SubDocOp::replace("no.such.path", &b"1"[..]),
    ];
    let error =
        run(|cb| agent.mutate_in(b"atomic", ops, DocFlags::empty(), 0, 0, cb)).unwrap_err();
    match &error {
        MemdError::SubDocPathFailure { index, error } => {
            assert_eq!(*index, 1);
            assert_eq!(error.status, StatusCode::SubDocPathNotFound);
        }
        other => panic!("expected a path failure, got {:?}", other),
    }
    assert_eq!(error.kind(), Some(ErrorKind::SubDocPathNotFound));

    let got = run(|cb| agent.get(b"atomic", cb)).unwrap();
    assert_eq!(got.cas, stored.cas);
    assert_eq!(&got.value[..], PROFILE.as_bytes());
}

#[test]
fn test_mutation_existing_path() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    store(&agent, "dict", PROFILE);

    let ops = vec![SubDocOp::dict_add("name", &b"\"again\""[..])];
    let error = run(|cb| agent.mutate_in(b"dict", ops, DocFlags::empty(), 0, 0, cb)).unwrap_err();
    assert!(error.is_status(StatusCode::SubDocPathExists));
}

#[test]
fn test_mutation_creates_parents() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    store(&agent, "nested", "{}");

    let ops = vec![SubDocOp::dict_set("a.b.c", &b"true"[..]).with_flags(SubDocFlags::MKDIR_P)];
    run(|cb| agent.mutate_in(b"nested", ops, DocFlags::empty(), 0, 0, cb)).unwrap();

    let ops = vec![SubDocOp::get("a.b.c")];
    let result = run(|cb| agent.lookup_in(b"nested", ops, DocFlags::empty(), cb)).unwrap();
    assert_eq!(&result.results[0].value[..], b"true");
}

#[test]
fn test_mutation_with_cas() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    let stored = store(&agent, "guarded-doc", PROFILE);

    let ops = vec![SubDocOp::dict_set("name", &b"\"x\""[..])];
    let error = run(|cb| {
        agent.mutate_in(b"guarded-doc", ops, DocFlags::empty(), stored.cas + 1, 0, cb)
    })
    .unwrap_err();
    assert!(error.is_cas_mismatch());
}

#[test]
fn test_mkdoc() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");

    let ops = vec![SubDocOp::counter("count", 5)];
    let error = run(|cb| agent.mutate_in(b"fresh", ops, DocFlags::empty(), 0, 0, cb)).unwrap_err();
    assert!(error.is_key_not_found());

    let ops = vec![SubDocOp::counter("count", 5)];
    let created = run(|cb| agent.mutate_in(b"fresh", ops, DocFlags::MKDOC, 0, 0, cb)).unwrap();
    assert_eq!(&created.results[0].value[..], b"5");

    let ops = vec![SubDocOp::counter("count", -2)];
    let updated = run(|cb| agent.mutate_in(b"fresh", ops, DocFlags::MKDOC, 0, 0, cb)).unwrap();
    assert_eq!(&updated.results[0].value[..], b"3");
}

// =============================================================================
// Extended Attributes
// =============================================================================

#[test]
fn test_xattr_roundtrip() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    store(&agent, "xattr-doc", PROFILE);

    let ops = vec![
        SubDocOp::dict_set("xatest.test", &b"\"test value\""[..])
            .with_flags(SubDocFlags::XATTR_PATH | SubDocFlags::MKDIR_P),
    ];
    run(|cb| agent.mutate_in(b"xattr-doc", ops, DocFlags::empty(), 0, 0, cb)).unwrap();

    let ops = vec![
        SubDocOp::get("xatest").with_flags(SubDocFlags::XATTR_PATH),
        SubDocOp::get("name"),
    ];
    let result = run(|cb| agent.lookup_in(b"xattr-doc", ops, DocFlags::empty(), cb)).unwrap();
    let xattr: serde_json::Value = serde_json::from_slice(&result.results[0].value).unwrap();
    assert_eq!(xattr, serde_json::json!({"test": "test value"}));
    assert_eq!(&result.results[1].value[..], b"\"ada\"");

    // The body is untouched by attribute writes
    let got = run(|cb| agent.get(b"xattr-doc", cb)).unwrap();
    assert_eq!(&got.value[..], PROFILE.as_bytes());
}

#[test]
fn test_xattr_and_body_in_one_mutation() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    store(&agent, "mixed", "{}");

    let ops = vec![
        SubDocOp::dict_set("meta.owner", &b"\"ops\""[..])
            .with_flags(SubDocFlags::XATTR_PATH | SubDocFlags::MKDIR_P),
        SubDocOp::dict_set("status", &b"\"open\""[..]),
    ];
    run(|cb| agent.mutate_in(b"mixed", ops, DocFlags::empty(), 0, 0, cb)).unwrap();

    let ops = vec![
        SubDocOp::get("meta.owner").with_flags(SubDocFlags::XATTR_PATH),
        SubDocOp::get("status"),
    ];
    let result = run(|cb| agent.lookup_in(b"mixed", ops, DocFlags::empty(), cb)).unwrap();
    assert_eq!(result.results.len(), 2);
    assert!(result.results.iter().all(|r| r.is_success()));
    assert_eq!(&result.results[0].value[..], b"\"ops\"");
    assert_eq!(&result.results[1].value[..], b"\"open\"");
}

#[test]
fn test_xattr_macro_expansion() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    store(&agent, "macro-doc", "{}");

    let ops = vec![SubDocOp::dict_set("meta.cas", &b"\"${Mutation.CAS}\""[..]).with_flags(
        SubDocFlags::XATTR_PATH | SubDocFlags::MKDIR_P | SubDocFlags::EXPAND_MACROS,
    )];
    let mutated =
        run(|cb| agent.mutate_in(b"macro-doc", ops, DocFlags::empty(), 0, 0, cb)).unwrap();

    let ops = vec![SubDocOp::get("meta.cas").with_flags(SubDocFlags::XATTR_PATH)];
    let result = run(|cb| agent.lookup_in(b"macro-doc", ops, DocFlags::empty(), cb)).unwrap();
    let value: String = serde_json::from_slice(&result.results[0].value).unwrap();
    assert!(value.starts_with("0x"));
    assert_eq!(u64::from_str_radix(&value[2..], 16).unwrap(), mutated.cas);
}

#[test]
fn test_document_virtual_xattr() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    let stored = store(&agent, "vattr-doc", PROFILE);

    let ops = vec![
        SubDocOp::get("$document").with_flags(SubDocFlags::XATTR_PATH),
        SubDocOp::get("$nonsense").with_flags(SubDocFlags::XATTR_PATH),
    ];
    let result = run(|cb| agent.lookup_in(b"vattr-doc", ops, DocFlags::empty(), cb)).unwrap();

    let vattr: serde_json::Value = serde_json::from_slice(&result.results[0].value).unwrap();
    assert_eq!(vattr["CAS"], format!("0x{:016x}", stored.cas));
    assert_eq!(vattr["value_bytes"], PROFILE.len());
    assert_eq!(result.results[1].status, StatusCode::SubDocXattrUnknownVAttr);
}

#[test]
fn test_virtual_xattr_is_read_only() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    store(&agent, "vattr-write", "{}");

    let ops = vec![SubDocOp::dict_set("$document.CAS", &b"1"[..]).with_flags(SubDocFlags::XATTR_PATH)];
    let error =
        run(|cb| agent.mutate_in(b"vattr-write", ops, DocFlags::empty(), 0, 0, cb)).unwrap_err();
    assert!(error.is_status(StatusCode::SubDocXattrCannotModifyVAttr));
}

#[test]
fn test_access_deleted() {
    let cluster = cluster();
    let agent = agent(&cluster, "default");
    store(&agent, "tombstoned", PROFILE);

    let ops = vec![
        SubDocOp::dict_set("_sync.rev", &b"\"1-abc\""[..])
            .with_flags(SubDocFlags::XATTR_PATH | SubDocFlags::MKDIR_P),
        SubDocOp::dict_set("user", &b"1"[..])
            .with_flags(SubDocFlags::XATTR_PATH | SubDocFlags::MKDIR_P),
    ];
    // Two different attributes in one batch are rejected
    let error =
        run(|cb| agent.mutate_in(b"tombstoned", ops, DocFlags::empty(), 0, 0, cb)).unwrap_err();
    assert!(error.is_status(StatusCode::SubDocXattrInvalidKeyCombo));

    let ops = vec![SubDocOp::dict_set("_sync.rev", &b"\"1-abc\""[..])
        .with_flags(SubDocFlags::XATTR_PATH | SubDocFlags::MKDIR_P)];
    run(|cb| agent.mutate_in(b"tombstoned", ops, DocFlags::empty(), 0, 0, cb)).unwrap();
    run(|cb| agent.remove(b"tombstoned", 0, cb)).unwrap();

    let ops = vec![SubDocOp::get("_sync.rev").with_flags(SubDocFlags::XATTR_PATH)];
    let error = run(|cb| agent.lookup_in(b"tombstoned", ops, DocFlags::empty(), cb)).unwrap_err();
    assert!(error.is_key_not_found());

    let ops = vec![SubDocOp::get("_sync.rev").with_flags(SubDocFlags::XATTR_PATH)];
    let result =
        run(|cb| agent.lookup_in(b"tombstoned", ops, DocFlags::ACCESS_DELETED, cb)).unwrap();
    assert!(result.deleted);
    assert_eq!(&result.results[0].value[..], b"\"1-abc\"");

    let ops = vec![SubDocOp::dict_set("_sync.rev", &b"\"2-def\""[..])
        .with_flags(SubDocFlags::XATTR_PATH)];
    run(|cb| agent.mutate_in(b"tombstoned", ops, DocFlags::ACCESS_DELETED, 0, 0, cb)).unwrap();

    // Still a tombstone to plain reads
    assert!(run(|cb| agent.get(b"tombstoned", cb)).unwrap_err().is_key_not_found());
}

// =============================================================================
// Unsupported Buckets
// =============================================================================

#[test]
fn test_memcached_bucket_rejects_subdoc() {
    let cluster = cluster();
    let agent = agent(&cluster, "memd");

    let result = agent.lookup_in(b"k", vec![SubDocOp::get("a")], DocFlags::empty(), |_| {});
    assert!(matches!(result, Err(MemdError::NotSupported(_))));

    let result = agent.mutate_in(
        b"k",
        vec![SubDocOp::dict_set("a", &b"1"[..])],
        DocFlags::MKDOC,
        0,
        0,
        |_| {},
    );
    assert!(matches!(result, Err(MemdError::NotSupported(_))));
}
