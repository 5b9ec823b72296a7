//! Mock command engine
//!
//! Executes one request against the cluster state on behalf of one node and
//! produces its response frames (several for streamed stats).
//!
//! ## Responsibilities
//! - Session commands: HELLO, SASL PLAIN, select bucket, error map
//! - vbucket ownership checks (NotMyVbucket)
//! - KV, observe, sub-document and stats commands
//! - Fault injection and enhanced error bodies

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use rand::seq::SliceRandom;
use serde_json::json;

use crate::durability::{
    encode_observe_entry, encode_observe_seqno_response, parse_observe_request, FailoverInfo,
    KeyState, ObserveResult, ObserveSeqNoResult,
};
use crate::protocol::{HelloFeature, Opcode, Packet, DATATYPE_JSON};
use crate::status::StatusCode;
use crate::subdoc::{
    encode_lookup_response, encode_mutation_failure, encode_mutation_response,
    parse_lookup_request, parse_mutation_request, DocFlags, MAX_SUBDOC_OPS,
};

use super::cluster::ClusterState;
use super::store::{Document, MockBucket};
use super::subdoc::{self as paths, MacroValues};

/// Expiry marking a counter op that must not create the document
const NO_CREATE: u32 = 0xffff_ffff;

type Reply<T = Packet> = std::result::Result<T, StatusCode>;

/// Per-connection protocol state
#[derive(Debug, Default)]
pub struct Session {
    pub features: Vec<HelloFeature>,
    pub user: Option<String>,
    pub bucket: Option<Arc<MockBucket>>,
}

impl Session {
    fn has(&self, feature: HelloFeature) -> bool {
        self.features.contains(&feature)
    }
}

fn be_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn be_u64(bytes: &[u8], at: usize) -> u64 {
    (be_u32(bytes, at) as u64) << 32 | be_u32(bytes, at + 4) as u64
}

fn check_cas(cas: u64, existing: Option<&Document>) -> std::result::Result<(), StatusCode> {
    match existing {
        _ if cas == 0 => Ok(()),
        None => Err(StatusCode::KeyNotFound),
        Some(doc) if doc.cas != cas => Err(StatusCode::KeyExists),
        Some(_) => Ok(()),
    }
}

/// The error map every mock node serves
pub fn error_map_json() -> serde_json::Value {
    json!({
        "version": 1,
        "revision": 1,
        "errors": {
            "1": {"name": "KEY_ENOENT", "desc": "Not Found", "attrs": ["item-only"]},
            "2": {"name": "KEY_EEXISTS", "desc": "key already exists, or CAS mismatch", "attrs": ["item-only"]},
            "7": {"name": "NOT_MY_VBUCKET", "desc": "Server does not own the vbucket", "attrs": ["fetch-config", "invalid-input"]},
            "85": {"name": "EBUSY", "desc": "Server is busy", "attrs": ["temp", "retry-later"]},
            "86": {
                "name": "ETMPFAIL",
                "desc": "Temporary failure",
                "attrs": ["temp", "retry-later"],
                "retry": {"strategy": "exponential", "interval": 5, "after": 5, "ceil": 50, "max-duration": 2000}
            }
        }
    })
}

/// Command executor for one mock node
pub struct MockEngine {
    node: usize,
    state: Arc<ClusterState>,
    started: Instant,
    latency_ms: AtomicU64,
    cmd_get: AtomicU64,
    cmd_set: AtomicU64,
    pub(crate) curr_connections: AtomicU64,
}

impl MockEngine {
    pub(crate) fn new(node: usize, state: Arc<ClusterState>) -> Self {
        Self {
            node,
            state,
            started: Instant::now(),
            latency_ms: AtomicU64::new(0),
            cmd_get: AtomicU64::new(0),
            cmd_set: AtomicU64::new(0),
            curr_connections: AtomicU64::new(0),
        }
    }

    /// A fresh session; the passwordless "default" bucket is preselected
    pub fn session(&self) -> Session {
        let bucket = self
            .state
            .bucket("default")
            .filter(|bucket| bucket.password().is_empty());
        Session {
            bucket,
            ..Session::default()
        }
    }

    pub fn latency(&self) -> Duration {
        Duration::from_millis(self.latency_ms.load(Ordering::Relaxed))
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    /// Execute one request
    pub fn execute(&self, session: &mut Session, request: &Packet) -> Vec<Packet> {
        let reply = match request.opcode {
            Opcode::Hello => Ok(self.hello(session, request)),
            Opcode::SaslListMechs => {
                Ok(Packet::response_to(request, StatusCode::Success).with_value(&b"PLAIN"[..]))
            }
            Opcode::SaslAuth => self.sasl_auth(session, request),
            Opcode::SelectBucket => self.select_bucket(session, request),
            Opcode::GetErrorMap => self.error_map(request),
            Opcode::Stat => return self.stats(session, request),
            _ => self.data_command(session, request),
        };
        vec![reply.unwrap_or_else(|status| Packet::response_to(request, status))]
    }

    // =========================================================================
    // Session commands
    // =========================================================================

    fn hello(&self, session: &mut Session, request: &Packet) -> Packet {
        let mut agreed = Vec::new();
        for pair in request.value.chunks_exact(2) {
            let feature = HelloFeature::from(u16::from_be_bytes([pair[0], pair[1]]));
            if self.state.config.features.contains(&feature) && !agreed.contains(&feature) {
                agreed.push(feature);
            }
        }
        tracing::debug!(
            "Node {} HELLO from {:?}: {:?}",
            self.node,
            String::from_utf8_lossy(&request.key),
            agreed
        );

        let mut value = BytesMut::with_capacity(agreed.len() * 2);
        for feature in &agreed {
            value.put_u16(feature.code());
        }
        session.features = agreed;
        Packet::response_to(request, StatusCode::Success).with_value(value.freeze())
    }

    fn sasl_auth(&self, session: &mut Session, request: &Packet) -> Reply {
        if &request.key[..] != b"PLAIN" {
            return Err(StatusCode::AuthError);
        }
        let mut parts = request.value.splitn(3, |b| *b == 0);
        let (_authzid, user, password) = match (parts.next(), parts.next(), parts.next()) {
            (Some(authzid), Some(user), Some(password)) => (authzid, user, password),
            _ => return Err(StatusCode::AuthError),
        };
        let user = String::from_utf8_lossy(user).into_owned();

        let bucket = self
            .state
            .bucket(&user)
            .filter(|bucket| bucket.password().as_bytes() == password)
            .ok_or(StatusCode::AuthError)?;

        tracing::debug!("Node {} authenticated {}", self.node, user);
        session.user = Some(user);
        session.bucket = Some(bucket);
        Ok(Packet::response_to(request, StatusCode::Success))
    }

    fn select_bucket(&self, session: &mut Session, request: &Packet) -> Reply {
        let name = String::from_utf8_lossy(&request.key);
        let bucket = self.state.bucket(&name).ok_or(StatusCode::KeyNotFound)?;
        if !bucket.password().is_empty() && session.user.as_deref() != Some(&*name) {
            return Err(StatusCode::AccessError);
        }
        session.bucket = Some(bucket);
        Ok(Packet::response_to(request, StatusCode::Success))
    }

    fn error_map(&self, request: &Packet) -> Reply {
        if !self.state.config.error_map {
            return Err(StatusCode::UnknownCommand);
        }
        if request.value.len() != 2 || be_u16(&request.value) == 0 {
            return Err(StatusCode::InvalidArgs);
        }
        let body = serde_json::to_vec(&error_map_json()).map_err(|_| StatusCode::InternalError)?;
        Ok(Packet::response_to(request, StatusCode::Success).with_value(body))
    }

    fn stats(&self, session: &Session, request: &Packet) -> Vec<Packet> {
        let group = String::from_utf8_lossy(&request.key).into_owned();
        let entries: Vec<(String, String)> = match group.as_str() {
            "" => {
                let items = session.bucket.as_ref().map_or(0, |b| b.item_count());
                vec![
                    ("pid".to_string(), std::process::id().to_string()),
                    ("uptime".to_string(), self.started.elapsed().as_secs().to_string()),
                    ("time".to_string(), self.state.clock.now().to_string()),
                    ("version".to_string(), format!("memdcore-mock/{}", crate::VERSION)),
                    ("node".to_string(), self.node.to_string()),
                    (
                        "curr_connections".to_string(),
                        self.curr_connections.load(Ordering::Relaxed).to_string(),
                    ),
                    ("curr_items".to_string(), items.to_string()),
                    ("cmd_get".to_string(), self.cmd_get.load(Ordering::Relaxed).to_string()),
                    ("cmd_set".to_string(), self.cmd_set.load(Ordering::Relaxed).to_string()),
                ]
            }
            "vbucket" => match &session.bucket {
                Some(bucket) if !bucket.is_memcached() => (0..bucket.num_vbuckets() as u16)
                    .filter_map(|vb| {
                        let state = match bucket.role(vb, self.node)? {
                            0 => "active",
                            _ => "replica",
                        };
                        Some((format!("vb_{}", vb), state.to_string()))
                    })
                    .collect(),
                Some(_) => Vec::new(),
                None => return vec![Packet::response_to(request, StatusCode::NoBucket)],
            },
            _ => return vec![Packet::response_to(request, StatusCode::KeyNotFound)],
        };

        let mut responses: Vec<Packet> = entries
            .into_iter()
            .map(|(key, value)| {
                Packet::response_to(request, StatusCode::Success)
                    .with_key(key.into_bytes())
                    .with_value(value.into_bytes())
            })
            .collect();
        responses.push(Packet::response_to(request, StatusCode::Success));
        responses
    }

    // =========================================================================
    // Data commands
    // =========================================================================

    fn data_command(&self, session: &Session, request: &Packet) -> Reply {
        let bucket = session.bucket.clone().ok_or(StatusCode::NoBucket)?;
        if let Some(status) = self.state.take_fault(self.node, request.opcode) {
            return Ok(self.fault(session, request, status));
        }

        match request.opcode {
            Opcode::Get
            | Opcode::GetReplica
            | Opcode::GetAndTouch
            | Opcode::Touch
            | Opcode::Set
            | Opcode::Add
            | Opcode::Replace
            | Opcode::Delete
            | Opcode::Increment
            | Opcode::Decrement
            | Opcode::Append
            | Opcode::Prepend => self.key_command(session, &bucket, request),
            Opcode::GetRandom => self.get_random(&bucket, request),
            Opcode::Observe => self.observe(&bucket, request),
            Opcode::ObserveSeqNo => self.observe_seqno(&bucket, request),
            Opcode::SubDocMultiLookup => self.multi_lookup(&bucket, request),
            Opcode::SubDocMultiMutation => self.multi_mutation(session, &bucket, request),
            _ => Err(StatusCode::UnknownCommand),
        }
    }

    fn fault(&self, session: &Session, request: &Packet, status: StatusCode) -> Packet {
        let response = Packet::response_to(request, status);
        if !session.has(HelloFeature::Xerror) {
            return response;
        }
        let body = json!({
            "error": {
                "context": format!("injected {:?}", status),
                "ref": format!("mock-node-{}", self.node),
            }
        });
        match serde_json::to_vec(&body) {
            Ok(body) => response.with_datatype(DATATYPE_JSON).with_value(body),
            Err(_) => response,
        }
    }

    /// Whether this node serves `vbucket` in the requested role
    fn check_owner(&self, bucket: &MockBucket, vbucket: u16, replica: bool) -> Reply<()> {
        if bucket.is_memcached() {
            return Ok(());
        }
        match bucket.role(vbucket, self.node) {
            Some(0) if !replica => Ok(()),
            Some(n) if replica && n > 0 => Ok(()),
            _ => Err(StatusCode::NotMyVbucket),
        }
    }

    fn check_any_role(&self, bucket: &MockBucket, vbucket: u16) -> Reply<()> {
        bucket
            .role(vbucket, self.node)
            .map(|_| ())
            .ok_or(StatusCode::NotMyVbucket)
    }

    fn get_reply(&self, session: &Session, request: &Packet, doc: &Document) -> Packet {
        let datatype = if session.has(HelloFeature::Json) {
            doc.datatype & DATATYPE_JSON
        } else {
            0
        };
        Packet::response_to(request, StatusCode::Success)
            .with_extras(doc.flags.to_be_bytes().to_vec())
            .with_datatype(datatype)
            .with_cas(doc.cas)
            .with_value(doc.value.clone())
    }

    fn stored_reply(
        &self,
        session: &Session,
        bucket: &MockBucket,
        request: &Packet,
        vbuuid: u64,
        doc: &Document,
    ) -> Packet {
        let response = Packet::response_to(request, StatusCode::Success).with_cas(doc.cas);
        if bucket.is_memcached() || !session.has(HelloFeature::SeqNo) {
            return response;
        }
        let mut extras = BytesMut::with_capacity(16);
        extras.put_u64(vbuuid);
        extras.put_u64(doc.seqno);
        response.with_extras(extras.freeze())
    }

    fn key_command(&self, session: &Session, bucket: &MockBucket, request: &Packet) -> Reply {
        let replica = request.opcode == Opcode::GetReplica;
        if replica && bucket.is_memcached() {
            return Err(StatusCode::NotSupported);
        }
        self.check_owner(bucket, request.vbucket, replica)?;

        let now = bucket.now();
        let persist = bucket.persists();
        let mut vb = bucket
            .vbucket(request.vbucket)
            .ok_or(StatusCode::NotMyVbucket)?;
        let key = request.key.clone();
        let extras = &request.extras;

        match request.opcode {
            Opcode::Get | Opcode::GetReplica => {
                self.cmd_get.fetch_add(1, Ordering::Relaxed);
                let doc = vb.live(&key, now).ok_or(StatusCode::KeyNotFound)?;
                Ok(self.get_reply(session, request, doc))
            }
            Opcode::GetAndTouch | Opcode::Touch => {
                if extras.len() != 4 {
                    return Err(StatusCode::InvalidArgs);
                }
                let mut doc = vb.live(&key, now).cloned().ok_or(StatusCode::KeyNotFound)?;
                doc.expires_at = bucket.deadline(be_u32(extras, 0));
                doc.cas = bucket.next_cas();
                let doc = vb.commit(key, doc, persist);
                if request.opcode == Opcode::GetAndTouch {
                    self.cmd_get.fetch_add(1, Ordering::Relaxed);
                    Ok(self.get_reply(session, request, &doc))
                } else {
                    Ok(self.stored_reply(session, bucket, request, vb.vbuuid, &doc))
                }
            }
            Opcode::Set | Opcode::Add | Opcode::Replace => {
                if extras.len() != 8 {
                    return Err(StatusCode::InvalidArgs);
                }
                self.cmd_set.fetch_add(1, Ordering::Relaxed);
                let existing = vb.live(&key, now).cloned();
                match (request.opcode, &existing) {
                    (Opcode::Add, Some(_)) => return Err(StatusCode::KeyExists),
                    (Opcode::Replace, None) => return Err(StatusCode::KeyNotFound),
                    _ => {}
                }
                check_cas(request.cas, existing.as_ref())?;

                let mut doc = Document::new(request.value.clone(), be_u32(extras, 0));
                doc.datatype = request.datatype;
                if let Some(old) = existing {
                    doc.xattrs = old.xattrs;
                    doc.retain_system_xattrs();
                }
                doc.expires_at = bucket.deadline(be_u32(extras, 4));
                doc.cas = bucket.next_cas();
                let doc = vb.commit(key, doc, persist);
                Ok(self.stored_reply(session, bucket, request, vb.vbuuid, &doc))
            }
            Opcode::Delete => {
                let mut doc = vb.live(&key, now).cloned().ok_or(StatusCode::KeyNotFound)?;
                check_cas(request.cas, Some(&doc))?;
                doc.tombstone();
                doc.cas = bucket.next_cas();
                let doc = vb.commit(key, doc, persist);
                Ok(self.stored_reply(session, bucket, request, vb.vbuuid, &doc))
            }
            Opcode::Increment | Opcode::Decrement => {
                if extras.len() != 20 {
                    return Err(StatusCode::InvalidArgs);
                }
                let delta = be_u64(extras, 0);
                let initial = be_u64(extras, 8);
                let expiry = be_u32(extras, 16);

                let (mut doc, value) = match vb.live(&key, now).cloned() {
                    Some(doc) => {
                        let current: u64 = std::str::from_utf8(&doc.value)
                            .ok()
                            .and_then(|text| text.trim().parse().ok())
                            .ok_or(StatusCode::BadDelta)?;
                        let value = if request.opcode == Opcode::Increment {
                            current.wrapping_add(delta)
                        } else {
                            current.saturating_sub(delta)
                        };
                        (doc, value)
                    }
                    None if expiry == NO_CREATE => return Err(StatusCode::KeyNotFound),
                    None => {
                        let mut doc = Document::new(Bytes::new(), 0);
                        doc.expires_at = bucket.deadline(expiry);
                        (doc, initial)
                    }
                };
                doc.value = Bytes::from(value.to_string());
                doc.cas = bucket.next_cas();
                let doc = vb.commit(key, doc, persist);
                Ok(self
                    .stored_reply(session, bucket, request, vb.vbuuid, &doc)
                    .with_value(value.to_be_bytes().to_vec()))
            }
            Opcode::Append | Opcode::Prepend => {
                let mut doc = vb.live(&key, now).cloned().ok_or(StatusCode::NotStored)?;
                check_cas(request.cas, Some(&doc))?;
                let mut value = BytesMut::with_capacity(doc.value.len() + request.value.len());
                if request.opcode == Opcode::Append {
                    value.put_slice(&doc.value);
                    value.put_slice(&request.value);
                } else {
                    value.put_slice(&request.value);
                    value.put_slice(&doc.value);
                }
                doc.value = value.freeze();
                doc.cas = bucket.next_cas();
                let doc = vb.commit(key, doc, persist);
                Ok(self.stored_reply(session, bucket, request, vb.vbuuid, &doc))
            }
            _ => Err(StatusCode::UnknownCommand),
        }
    }

    fn get_random(&self, bucket: &MockBucket, request: &Packet) -> Reply {
        if bucket.is_memcached() {
            return Err(StatusCode::NotSupported);
        }
        let now = bucket.now();
        let mut owned: Vec<u16> = (0..bucket.num_vbuckets() as u16)
            .filter(|&vb| bucket.role(vb, self.node) == Some(0))
            .collect();
        owned.shuffle(&mut rand::thread_rng());

        for vb in owned {
            let found = bucket.vbucket(vb).and_then(|vb| vb.random_live(now));
            if let Some((key, doc)) = found {
                return Ok(Packet::response_to(request, StatusCode::Success)
                    .with_extras(doc.flags.to_be_bytes().to_vec())
                    .with_cas(doc.cas)
                    .with_key(key)
                    .with_value(doc.value));
            }
        }
        Err(StatusCode::KeyNotFound)
    }

    fn observe(&self, bucket: &MockBucket, request: &Packet) -> Reply {
        if bucket.is_memcached() {
            return Err(StatusCode::NotSupported);
        }
        let keys = parse_observe_request(&request.value).map_err(|_| StatusCode::InvalidArgs)?;
        let now = bucket.now();
        let mut value = BytesMut::new();

        for (vbucket, key) in keys {
            self.check_any_role(bucket, vbucket)?;
            let mut vb = bucket.vbucket(vbucket).ok_or(StatusCode::NotMyVbucket)?;
            let persisted = vb.persisted_seqno;
            let result = match vb.lookup(&key, now) {
                Some(doc) if doc.deleted => ObserveResult {
                    key_state: KeyState::Deleted,
                    cas: doc.cas,
                },
                Some(doc) => ObserveResult {
                    key_state: if doc.seqno <= persisted {
                        KeyState::Persisted
                    } else {
                        KeyState::NotPersisted
                    },
                    cas: doc.cas,
                },
                None => ObserveResult {
                    key_state: KeyState::NotFound,
                    cas: 0,
                },
            };
            encode_observe_entry(&mut value, vbucket, &key, result);
        }

        Ok(Packet::response_to(request, StatusCode::Success).with_value(value.freeze()))
    }

    fn observe_seqno(&self, bucket: &MockBucket, request: &Packet) -> Reply {
        if bucket.is_memcached() {
            return Err(StatusCode::NotSupported);
        }
        self.check_any_role(bucket, request.vbucket)?;
        if request.value.len() != 8 {
            return Err(StatusCode::InvalidArgs);
        }
        let asked = be_u64(&request.value, 0);
        let vb = bucket
            .vbucket(request.vbucket)
            .ok_or(StatusCode::NotMyVbucket)?;

        let failover = if asked == vb.vbuuid {
            None
        } else {
            vb.previous_branch(asked).map(|entry| FailoverInfo {
                old_vbuuid: entry.vbuuid,
                last_seqno: entry.seqno,
            })
        };
        let result = ObserveSeqNoResult {
            vbucket: request.vbucket,
            vbuuid: vb.vbuuid,
            persisted: vb.persisted_seqno,
            current: vb.high_seqno,
            failover,
        };
        Ok(Packet::response_to(request, StatusCode::Success)
            .with_value(encode_observe_seqno_response(&result)))
    }

    fn multi_lookup(&self, bucket: &MockBucket, request: &Packet) -> Reply {
        if bucket.is_memcached() {
            return Err(StatusCode::NotSupported);
        }
        self.check_owner(bucket, request.vbucket, false)?;
        let (doc_flags, ops) = parse_lookup_request(&request.extras, &request.value)
            .map_err(|_| StatusCode::InvalidArgs)?;
        if ops.is_empty() || ops.len() > MAX_SUBDOC_OPS {
            return Err(StatusCode::SubDocBadCombo);
        }

        let now = bucket.now();
        let doc = {
            let mut vb = bucket
                .vbucket(request.vbucket)
                .ok_or(StatusCode::NotMyVbucket)?;
            vb.lookup(&request.key, now)
                .cloned()
                .ok_or(StatusCode::KeyNotFound)?
        };
        if doc.deleted && !doc_flags.contains(DocFlags::ACCESS_DELETED) {
            return Err(StatusCode::KeyNotFound);
        }

        let results = paths::lookup(&doc, &ops);
        let failed = results.iter().any(|(status, _)| *status != StatusCode::Success);
        let status = match (doc.deleted, failed) {
            (false, false) => StatusCode::Success,
            (false, true) => StatusCode::SubDocBadMulti,
            (true, false) => StatusCode::SubDocSuccessDeleted,
            (true, true) => StatusCode::SubDocMultiPathFailureDeleted,
        };
        Ok(Packet::response_to(request, status)
            .with_cas(doc.cas)
            .with_value(encode_lookup_response(&results)))
    }

    fn multi_mutation(&self, session: &Session, bucket: &MockBucket, request: &Packet) -> Reply {
        if bucket.is_memcached() {
            return Err(StatusCode::NotSupported);
        }
        self.check_owner(bucket, request.vbucket, false)?;
        let (expiry, doc_flags, ops) = parse_mutation_request(&request.extras, &request.value)
            .map_err(|_| StatusCode::InvalidArgs)?;
        if ops.is_empty() || ops.len() > MAX_SUBDOC_OPS {
            return Err(StatusCode::SubDocBadCombo);
        }

        let now = bucket.now();
        let persist = bucket.persists();
        let mut vb = bucket
            .vbucket(request.vbucket)
            .ok_or(StatusCode::NotMyVbucket)?;

        let stored = vb.lookup(&request.key, now).cloned();
        let (base, exists) = match stored {
            Some(doc) if !doc.deleted => (doc, true),
            Some(doc) if doc_flags.contains(DocFlags::ACCESS_DELETED) => (doc, true),
            _ if doc_flags.contains(DocFlags::MKDOC)
                && !doc_flags.contains(DocFlags::REPLACE_DOC) =>
            {
                (Document::new(Bytes::from_static(b"{}"), 0), false)
            }
            _ => return Err(StatusCode::KeyNotFound),
        };
        check_cas(request.cas, exists.then_some(&base))?;

        let cas = bucket.next_cas();
        let macros = MacroValues {
            cas,
            seqno: vb.high_seqno + 1,
        };
        let outcome = match paths::mutate(&base, exists, &ops, macros) {
            Ok(outcome) => outcome,
            Err((_, StatusCode::KeyExists)) => return Err(StatusCode::KeyExists),
            Err((index, status)) => {
                return Ok(Packet::response_to(request, StatusCode::SubDocBadMulti)
                    .with_value(encode_mutation_failure(index, status)))
            }
        };

        let mut doc = base;
        doc.value = outcome.body;
        doc.xattrs = outcome.xattrs;
        doc.cas = cas;
        if expiry != 0 {
            doc.expires_at = bucket.deadline(expiry);
        }
        if outcome.delete {
            doc.tombstone();
        }
        let status = if doc.deleted && !outcome.delete {
            StatusCode::SubDocSuccessDeleted
        } else {
            StatusCode::Success
        };

        let doc = vb.commit(request.key.clone(), doc, persist);
        let mut response = self.stored_reply(session, bucket, request, vb.vbuuid, &doc);
        response.status = status;
        Ok(response.with_value(encode_mutation_response(&outcome.results)))
    }
}

fn be_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}
