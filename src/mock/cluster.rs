//! In-process mock cluster
//!
//! Starts a set of mock nodes on localhost that share bucket state, and
//! exposes the knobs tests need: topology snapshots, a controllable clock,
//! fault injection, latency and dropped connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{MemdError, Result};
use crate::protocol::{HelloFeature, Opcode};
use crate::routing::{BucketType, TopologySnapshot};
use crate::status::StatusCode;

use super::engine::MockEngine;
use super::server::MockNode;
use super::store::{BucketConfig, MockBucket, MockClock};

/// Mock cluster layout
#[derive(Debug, Clone)]
pub struct MockConfig {
    pub num_nodes: usize,
    pub num_replicas: usize,
    pub num_vbuckets: usize,
    pub buckets: Vec<BucketConfig>,
    /// Features the nodes agree to in HELLO
    pub features: Vec<HelloFeature>,
    /// Whether the nodes serve GET_ERROR_MAP
    pub error_map: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            num_nodes: 4,
            num_replicas: 1,
            num_vbuckets: 64,
            buckets: vec![
                BucketConfig::couchbase("default"),
                BucketConfig::memcached("memd"),
            ],
            features: vec![
                HelloFeature::Datatype,
                HelloFeature::TcpNoDelay,
                HelloFeature::SeqNo,
                HelloFeature::Xattr,
                HelloFeature::Xerror,
                HelloFeature::SelectBucket,
                HelloFeature::Json,
            ],
            error_map: true,
        }
    }
}

impl MockConfig {
    pub fn nodes(mut self, count: usize) -> Self {
        self.num_nodes = count;
        self
    }

    pub fn replicas(mut self, count: usize) -> Self {
        self.num_replicas = count;
        self
    }

    pub fn vbuckets(mut self, count: usize) -> Self {
        self.num_vbuckets = count;
        self
    }

    pub fn bucket(mut self, bucket: BucketConfig) -> Self {
        self.buckets.retain(|b| b.name != bucket.name);
        self.buckets.push(bucket);
        self
    }

    pub fn features(mut self, features: Vec<HelloFeature>) -> Self {
        self.features = features;
        self
    }

    pub fn error_map(mut self, enabled: bool) -> Self {
        self.error_map = enabled;
        self
    }
}

/// Initial vbucket map: actives round-robin, each replica on the next node
pub fn default_vbucket_map(
    num_vbuckets: usize,
    num_nodes: usize,
    num_replicas: usize,
) -> Vec<Vec<i32>> {
    (0..num_vbuckets)
        .map(|vb| {
            (0..=num_replicas)
                .map(|copy| {
                    if copy >= num_nodes {
                        -1
                    } else {
                        ((vb + copy) % num_nodes) as i32
                    }
                })
                .collect()
        })
        .collect()
}

#[derive(Debug)]
struct Fault {
    node: usize,
    opcode: Opcode,
    status: StatusCode,
    remaining: u32,
}

/// State shared by every node of a mock cluster
pub struct ClusterState {
    pub(crate) config: MockConfig,
    pub(crate) clock: Arc<MockClock>,
    buckets: HashMap<String, Arc<MockBucket>>,
    faults: Mutex<Vec<Fault>>,
}

impl ClusterState {
    pub fn bucket(&self, name: &str) -> Option<Arc<MockBucket>> {
        self.buckets.get(name).cloned()
    }

    /// Consume one injected failure matching `node` and `opcode`
    pub(crate) fn take_fault(&self, node: usize, opcode: Opcode) -> Option<StatusCode> {
        let mut faults = self.faults.lock();
        let index = faults
            .iter()
            .position(|f| f.node == node && f.opcode == opcode)?;
        let status = faults[index].status;
        faults[index].remaining -= 1;
        if faults[index].remaining == 0 {
            faults.remove(index);
        }
        Some(status)
    }
}

/// A running mock cluster
pub struct MockCluster {
    state: Arc<ClusterState>,
    nodes: Vec<MockNode>,
}

impl MockCluster {
    /// Start the default layout: 4 nodes, 1 replica, 64 vbuckets
    pub fn start() -> Result<Self> {
        Self::with_config(MockConfig::default())
    }

    pub fn with_config(config: MockConfig) -> Result<Self> {
        if config.num_nodes == 0 {
            return Err(MemdError::Config(
                "mock cluster needs at least one node".to_string(),
            ));
        }
        if config.num_vbuckets == 0 || config.num_vbuckets > u16::MAX as usize {
            return Err(MemdError::Config(format!(
                "invalid vbucket count {}",
                config.num_vbuckets
            )));
        }

        let clock = Arc::new(MockClock::new());
        let buckets = config
            .buckets
            .iter()
            .map(|bucket| {
                let map = match bucket.bucket_type {
                    BucketType::Couchbase => default_vbucket_map(
                        config.num_vbuckets,
                        config.num_nodes,
                        config.num_replicas,
                    ),
                    BucketType::Memcached => Vec::new(),
                };
                let mock = MockBucket::new(bucket.clone(), map, Arc::clone(&clock));
                (bucket.name.clone(), Arc::new(mock))
            })
            .collect();

        let state = Arc::new(ClusterState {
            config,
            clock,
            buckets,
            faults: Mutex::new(Vec::new()),
        });

        let nodes = (0..state.config.num_nodes)
            .map(|index| {
                let engine = Arc::new(MockEngine::new(index, Arc::clone(&state)));
                MockNode::start(index, engine)
            })
            .collect::<Result<Vec<_>>>()?;

        tracing::info!(
            "Mock cluster started with {} nodes: {:?}",
            nodes.len(),
            nodes.iter().map(MockNode::address).collect::<Vec<_>>()
        );
        Ok(Self { state, nodes })
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    /// Node addresses, in node index order
    pub fn addresses(&self) -> Vec<String> {
        self.nodes.iter().map(MockNode::address).collect()
    }

    pub fn bucket(&self, name: &str) -> Option<Arc<MockBucket>> {
        self.state.bucket(name)
    }

    /// Current topology of `bucket` as a client would receive it
    pub fn topology(&self, bucket: &str) -> Result<TopologySnapshot> {
        let mock = self
            .bucket(bucket)
            .ok_or_else(|| MemdError::Config(format!("no mock bucket named {}", bucket)))?;
        let addresses = self.addresses();
        let snapshot = match mock.bucket_type() {
            BucketType::Couchbase => {
                TopologySnapshot::couchbase(addresses.clone(), mock.vbucket_map())?
            }
            BucketType::Memcached => TopologySnapshot::memcached(addresses.clone())?,
        };

        let endpoints = |port: u16, path: &str| -> Vec<String> {
            addresses
                .iter()
                .map(|address| {
                    let host = address.rsplit_once(':').map_or(address.as_str(), |(h, _)| h);
                    format!("http://{}:{}{}", host, port, path)
                })
                .collect()
        };
        Ok(snapshot
            .with_revision(mock.revision())
            .with_mgmt_endpoints(endpoints(8091, ""))
            .with_capi_endpoints(endpoints(8092, &format!("/{}", bucket)))
            .with_query_endpoints(endpoints(8093, "/query/service")))
    }

    /// Move the shared clock forward
    pub fn time_travel(&self, by: Duration) {
        tracing::debug!("Mock cluster time travel by {:?}", by);
        self.state.clock.advance(by);
    }

    /// Fail the next `times` requests of `opcode` on `node` with `status`
    pub fn fail_next(&self, node: usize, opcode: Opcode, status: StatusCode, times: u32) {
        if times == 0 {
            return;
        }
        self.state.faults.lock().push(Fault {
            node,
            opcode,
            status,
            remaining: times,
        });
    }

    /// Delay every response of `node`
    pub fn set_latency(&self, node: usize, latency: Duration) {
        if let Some(node) = self.nodes.get(node) {
            node.engine().set_latency(latency);
        }
    }

    /// Client connections currently open on `node`
    pub fn connection_count(&self, node: usize) -> usize {
        self.nodes.get(node).map_or(0, MockNode::connection_count)
    }

    /// Sever the client connections of `node`
    pub fn drop_connections(&self, node: usize) {
        if let Some(node) = self.nodes.get(node) {
            node.drop_connections();
        }
    }

    pub fn shutdown(&self) {
        for node in &self.nodes {
            node.shutdown();
        }
    }
}

impl Drop for MockCluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for MockCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockCluster")
            .field("nodes", &self.addresses())
            .finish()
    }
}
