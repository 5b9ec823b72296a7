//! Mock Cluster Module
//!
//! An in-process binary-protocol cluster for tests, benches and the
//! `memd-mock` binary.
//!
//! ## Architecture
//! - One listening socket and acceptor thread per node
//! - One thread per client connection
//! - Bucket data shared by all nodes; the vbucket map decides who may serve it

mod cluster;
mod connection;
mod engine;
mod server;
mod store;
mod subdoc;

pub use cluster::{default_vbucket_map, ClusterState, MockCluster, MockConfig};
pub use connection::Connection;
pub use engine::{error_map_json, MockEngine, Session};
pub use server::MockNode;
pub use store::{
    BucketConfig, Document, FailoverEntry, MockBucket, MockClock, Vbucket, RELATIVE_EXPIRY_LIMIT,
};
