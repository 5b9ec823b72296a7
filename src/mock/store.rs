//! Mock bucket storage
//!
//! Documents live per vbucket and are shared by every mock node; which node
//! may serve a vbucket is decided by the bucket's vbucket map, not by where
//! the data is.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::{Mutex, MutexGuard, RwLock};
use rand::seq::SliceRandom;
use rand::Rng;
use serde_json::{Map, Value};

use crate::routing::BucketType;

/// Expiry values up to this many seconds are relative to now
pub const RELATIVE_EXPIRY_LIMIT: u32 = 30 * 24 * 60 * 60;

/// Controllable wall clock shared by the whole mock cluster
#[derive(Debug, Default)]
pub struct MockClock {
    offset_secs: AtomicU64,
}

impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current mock time in unix seconds
    pub fn now(&self) -> u64 {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        wall + self.offset_secs.load(Ordering::Relaxed)
    }

    /// Move the clock forward, rounding up to whole seconds
    pub fn advance(&self, by: Duration) {
        let secs = by.as_secs() + u64::from(by.subsec_nanos() > 0);
        self.offset_secs.fetch_add(secs, Ordering::Relaxed);
    }

    /// Absolute expiry time for a wire expiry value; 0 means never
    pub fn deadline(&self, expiry: u32) -> u64 {
        match expiry {
            0 => 0,
            e if e <= RELATIVE_EXPIRY_LIMIT => self.now() + e as u64,
            e => e as u64,
        }
    }
}

// =============================================================================
// Documents
// =============================================================================

/// One stored document (or tombstone)
#[derive(Debug, Clone, Default)]
pub struct Document {
    pub value: Bytes,
    pub flags: u32,
    pub datatype: u8,
    pub cas: u64,
    /// Unix seconds; 0 never expires
    pub expires_at: u64,
    pub seqno: u64,
    pub xattrs: Map<String, Value>,
    pub deleted: bool,
}

impl Document {
    pub fn new(value: Bytes, flags: u32) -> Self {
        Self {
            value,
            flags,
            ..Self::default()
        }
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.expires_at != 0 && now >= self.expires_at
    }

    /// Drop user xattrs; system xattrs (leading `_`) survive
    pub fn retain_system_xattrs(&mut self) {
        self.xattrs.retain(|name, _| name.starts_with('_'));
    }

    /// Turn into a tombstone
    pub fn tombstone(&mut self) {
        self.value = Bytes::new();
        self.flags = 0;
        self.datatype = 0;
        self.expires_at = 0;
        self.deleted = true;
        self.retain_system_xattrs();
    }
}

/// A previous branch of a vbucket's history
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailoverEntry {
    pub vbuuid: u64,
    /// Last seqno written on that branch
    pub seqno: u64,
}

/// One vbucket's documents and sequence state
#[derive(Debug)]
pub struct Vbucket {
    docs: HashMap<Bytes, Document>,
    pub vbuuid: u64,
    pub high_seqno: u64,
    pub persisted_seqno: u64,
    pub failover_log: Vec<FailoverEntry>,
}

impl Vbucket {
    pub fn new() -> Self {
        Self {
            docs: HashMap::new(),
            vbuuid: rand::thread_rng().gen(),
            high_seqno: 0,
            persisted_seqno: 0,
            failover_log: Vec::new(),
        }
    }

    /// Stored version of `key`, tombstones included; expired documents are
    /// purged first
    pub fn lookup(&mut self, key: &[u8], now: u64) -> Option<&Document> {
        let expired = self
            .docs
            .get(key)
            .map_or(false, |doc| !doc.deleted && doc.is_expired(now));
        if expired {
            self.docs.remove(key);
        }
        self.docs.get(key)
    }

    /// Live (not deleted, not expired) version of `key`
    pub fn live(&mut self, key: &[u8], now: u64) -> Option<&Document> {
        self.lookup(key, now).filter(|doc| !doc.deleted)
    }

    /// Store a new version, assigning it the next seqno
    pub fn commit(&mut self, key: Bytes, mut doc: Document, persist: bool) -> Document {
        self.high_seqno += 1;
        doc.seqno = self.high_seqno;
        if persist {
            self.persisted_seqno = self.high_seqno;
        }
        self.docs.insert(key, doc.clone());
        doc
    }

    /// Branch history under a fresh uuid
    pub fn failover(&mut self) -> u64 {
        self.failover_log.push(FailoverEntry {
            vbuuid: self.vbuuid,
            seqno: self.high_seqno,
        });
        self.vbuuid = rand::thread_rng().gen();
        self.vbuuid
    }

    /// Failover entry for a previous uuid
    pub fn previous_branch(&self, vbuuid: u64) -> Option<FailoverEntry> {
        self.failover_log
            .iter()
            .rev()
            .find(|entry| entry.vbuuid == vbuuid)
            .copied()
    }

    /// A random live document
    pub fn random_live(&self, now: u64) -> Option<(Bytes, Document)> {
        let live: Vec<(&Bytes, &Document)> = self
            .docs
            .iter()
            .filter(|(_, doc)| !doc.deleted && !doc.is_expired(now))
            .collect();
        live.choose(&mut rand::thread_rng())
            .map(|(key, doc)| ((*key).clone(), (*doc).clone()))
    }

    pub fn live_count(&self, now: u64) -> usize {
        self.docs
            .values()
            .filter(|doc| !doc.deleted && !doc.is_expired(now))
            .count()
    }
}

impl Default for Vbucket {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Buckets
// =============================================================================

/// Bucket definition for a mock cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketConfig {
    pub name: String,
    pub bucket_type: BucketType,
    /// SASL password; empty allows selecting the bucket without auth
    pub password: String,
}

impl BucketConfig {
    pub fn couchbase(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bucket_type: BucketType::Couchbase,
            password: String::new(),
        }
    }

    pub fn memcached(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bucket_type: BucketType::Memcached,
            password: String::new(),
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }
}

/// A bucket served by the mock cluster
pub struct MockBucket {
    config: BucketConfig,
    vbuckets: Vec<Mutex<Vbucket>>,

    /// vbucket → [active, replica 1, …]; empty for cache-only buckets
    map: RwLock<Vec<Vec<i32>>>,
    revision: AtomicU64,
    next_cas: AtomicU64,
    persistence_paused: AtomicBool,
    clock: Arc<MockClock>,
}

impl MockBucket {
    pub(crate) fn new(config: BucketConfig, map: Vec<Vec<i32>>, clock: Arc<MockClock>) -> Self {
        let count = match config.bucket_type {
            BucketType::Couchbase => map.len().max(1),
            BucketType::Memcached => 1,
        };
        Self {
            config,
            vbuckets: (0..count).map(|_| Mutex::new(Vbucket::new())).collect(),
            map: RwLock::new(map),
            revision: AtomicU64::new(1),
            next_cas: AtomicU64::new(0x1000),
            persistence_paused: AtomicBool::new(false),
            clock,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn bucket_type(&self) -> BucketType {
        self.config.bucket_type
    }

    pub fn password(&self) -> &str {
        &self.config.password
    }

    pub fn is_memcached(&self) -> bool {
        self.config.bucket_type == BucketType::Memcached
    }

    pub fn num_vbuckets(&self) -> usize {
        self.vbuckets.len()
    }

    /// Lock one vbucket; cache-only buckets keep everything in vbucket 0
    pub fn vbucket(&self, vbucket: u16) -> Option<MutexGuard<'_, Vbucket>> {
        let index = if self.is_memcached() { 0 } else { vbucket as usize };
        self.vbuckets.get(index).map(|vb| vb.lock())
    }

    pub fn next_cas(&self) -> u64 {
        self.next_cas.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn now(&self) -> u64 {
        self.clock.now()
    }

    pub fn deadline(&self, expiry: u32) -> u64 {
        self.clock.deadline(expiry)
    }

    /// Role of `node` for `vbucket`: 0 active, n the n-th replica
    pub fn role(&self, vbucket: u16, node: usize) -> Option<usize> {
        self.map
            .read()
            .get(vbucket as usize)?
            .iter()
            .position(|&ix| ix == node as i32)
    }

    pub fn vbucket_map(&self) -> Vec<Vec<i32>> {
        self.map.read().clone()
    }

    /// Move vbuckets around; bumps the topology revision
    pub fn set_vbucket_map(&self, map: Vec<Vec<i32>>) {
        *self.map.write() = map;
        self.revision.fetch_add(1, Ordering::AcqRel);
    }

    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    pub fn persists(&self) -> bool {
        !self.persistence_paused.load(Ordering::Acquire)
    }

    /// Stop advancing persisted seqnos (writes stay in memory only)
    pub fn pause_persistence(&self) {
        self.persistence_paused.store(true, Ordering::Release);
    }

    /// Persist everything written so far and resume
    pub fn resume_persistence(&self) {
        self.persistence_paused.store(false, Ordering::Release);
        for vbucket in &self.vbuckets {
            let mut vbucket = vbucket.lock();
            vbucket.persisted_seqno = vbucket.high_seqno;
        }
    }

    /// Fail over one vbucket; returns its new uuid
    pub fn failover(&self, vbucket: u16) -> Option<u64> {
        self.vbucket(vbucket).map(|mut vb| vb.failover())
    }

    /// Live documents across all vbuckets
    pub fn item_count(&self) -> usize {
        let now = self.now();
        self.vbuckets.iter().map(|vb| vb.lock().live_count(now)).sum()
    }
}

impl std::fmt::Debug for MockBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockBucket")
            .field("name", &self.config.name)
            .field("type", &self.config.bucket_type)
            .field("vbuckets", &self.vbuckets.len())
            .finish()
    }
}
