//! Topology snapshots
//!
//! An immutable view of the cluster as delivered by the bootstrap/config
//! component. A new snapshot replaces the old one wholesale.

use crate::error::{MemdError, Result};

/// Kind of bucket the snapshot describes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketType {
    /// vbucket-partitioned, replicated, persistent
    Couchbase,
    /// Cache-only; no vbuckets, replicas or durability introspection
    Memcached,
}

/// Immutable cluster topology
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologySnapshot {
    revision: u64,
    bucket_type: BucketType,

    /// Data-service node addresses (`host:port`), indexed by the vbucket map
    nodes: Vec<String>,

    num_replicas: usize,

    /// vbucket → [primary, replica 1, …]; `-1` marks a missing node
    vbucket_map: Vec<Vec<i32>>,

    query_endpoints: Vec<String>,
    mgmt_endpoints: Vec<String>,
    capi_endpoints: Vec<String>,
}

impl TopologySnapshot {
    /// Create a vbucket-partitioned snapshot
    pub fn couchbase(nodes: Vec<String>, vbucket_map: Vec<Vec<i32>>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(MemdError::Config("topology has no nodes".to_string()));
        }
        if vbucket_map.is_empty() || vbucket_map.len() > u16::MAX as usize + 1 {
            return Err(MemdError::Config(format!(
                "invalid vbucket count: {}",
                vbucket_map.len()
            )));
        }

        let width = vbucket_map[0].len();
        if width == 0 {
            return Err(MemdError::Config("vbucket map rows are empty".to_string()));
        }

        for (vb, row) in vbucket_map.iter().enumerate() {
            if row.len() != width {
                return Err(MemdError::Config(format!(
                    "vbucket {} has {} entries, expected {}",
                    vb,
                    row.len(),
                    width
                )));
            }
            if let Some(bad) = row.iter().find(|&&ix| ix < -1 || ix >= nodes.len() as i32) {
                return Err(MemdError::Config(format!(
                    "vbucket {} references unknown node index {}",
                    vb, bad
                )));
            }
        }

        Ok(Self {
            revision: 0,
            bucket_type: BucketType::Couchbase,
            nodes,
            num_replicas: width - 1,
            vbucket_map,
            query_endpoints: Vec::new(),
            mgmt_endpoints: Vec::new(),
            capi_endpoints: Vec::new(),
        })
    }

    /// Create a cache-only snapshot
    pub fn memcached(nodes: Vec<String>) -> Result<Self> {
        if nodes.is_empty() {
            return Err(MemdError::Config("topology has no nodes".to_string()));
        }

        Ok(Self {
            revision: 0,
            bucket_type: BucketType::Memcached,
            nodes,
            num_replicas: 0,
            vbucket_map: Vec::new(),
            query_endpoints: Vec::new(),
            mgmt_endpoints: Vec::new(),
            capi_endpoints: Vec::new(),
        })
    }

    pub fn with_revision(mut self, revision: u64) -> Self {
        self.revision = revision;
        self
    }

    pub fn with_query_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.query_endpoints = endpoints;
        self
    }

    pub fn with_mgmt_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.mgmt_endpoints = endpoints;
        self
    }

    pub fn with_capi_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.capi_endpoints = endpoints;
        self
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn bucket_type(&self) -> BucketType {
        self.bucket_type
    }

    pub fn nodes(&self) -> &[String] {
        &self.nodes
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_replicas(&self) -> usize {
        self.num_replicas
    }

    pub fn num_vbuckets(&self) -> usize {
        self.vbucket_map.len()
    }

    pub fn vbucket_map(&self) -> &[Vec<i32>] {
        &self.vbucket_map
    }

    pub fn query_endpoints(&self) -> &[String] {
        &self.query_endpoints
    }

    pub fn mgmt_endpoints(&self) -> &[String] {
        &self.mgmt_endpoints
    }

    pub fn capi_endpoints(&self) -> &[String] {
        &self.capi_endpoints
    }

    pub fn has_vbuckets(&self) -> bool {
        self.bucket_type == BucketType::Couchbase
    }

    // =========================================================================
    // Mapping
    // =========================================================================

    /// The vbucket a key belongs to
    ///
    /// `((crc32(key) >> 16) & 0x7fff) % num_vbuckets`, identical to the server.
    /// Cache-only snapshots have no vbuckets and always yield 0.
    pub fn vbucket_by_key(&self, key: &[u8]) -> u16 {
        if self.vbucket_map.is_empty() {
            return 0;
        }
        let hash = (crc32fast::hash(key) >> 16) & 0x7fff;
        (hash as usize % self.vbucket_map.len()) as u16
    }

    /// The node index serving `vbucket` as `replica` (0 = primary)
    pub fn node_by_vbucket(&self, vbucket: u16, replica: u32) -> Result<usize> {
        let row = self.vbucket_map.get(vbucket as usize).ok_or_else(|| {
            MemdError::Routing(format!(
                "vbucket {} out of range ({} vbuckets)",
                vbucket,
                self.vbucket_map.len()
            ))
        })?;

        match row.get(replica as usize) {
            Some(&ix) if ix >= 0 => Ok(ix as usize),
            _ if replica == 0 => Err(MemdError::Routing(format!(
                "vbucket {} has no active node",
                vbucket
            ))),
            _ => Err(MemdError::ReplicaUnavailable(replica)),
        }
    }

    /// Node index for a key in a cache-only bucket
    pub fn node_by_key_hash(&self, key: &[u8]) -> usize {
        crc32fast::hash(key) as usize % self.nodes.len()
    }
}
