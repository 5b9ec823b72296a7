//! memd-mock binary
//!
//! Runs an in-process mock cluster and prints what a client needs to reach it.

use std::time::Duration;

use clap::Parser;
use memdcore::mock::{BucketConfig, MockCluster, MockConfig};
use tracing_subscriber::{fmt, EnvFilter};

/// memdcore mock cluster
#[derive(Parser, Debug)]
#[command(name = "memd-mock")]
#[command(about = "In-process binary-protocol mock cluster")]
#[command(version)]
struct Args {
    /// Number of nodes
    #[arg(short, long, default_value = "4")]
    nodes: usize,

    /// Replicas per vbucket
    #[arg(short, long, default_value = "1")]
    replicas: usize,

    /// Number of vbuckets
    #[arg(short, long, default_value = "64")]
    vbuckets: usize,

    /// Extra password-protected bucket as name:password
    #[arg(short, long)]
    bucket: Vec<String>,

    /// Stop after this many seconds (runs until killed otherwise)
    #[arg(short, long)]
    duration: Option<u64>,
}

fn main() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,memdcore=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::info!("memd-mock v{}", memdcore::VERSION);

    let mut config = MockConfig::default()
        .nodes(args.nodes)
        .replicas(args.replicas)
        .vbuckets(args.vbuckets);
    for spec in &args.bucket {
        let bucket = match spec.split_once(':') {
            Some((name, password)) => BucketConfig::couchbase(name).with_password(password),
            None => BucketConfig::couchbase(spec.as_str()),
        };
        config = config.bucket(bucket);
    }
    let buckets: Vec<String> = config.buckets.iter().map(|b| b.name.clone()).collect();

    let cluster = match MockCluster::with_config(config) {
        Ok(cluster) => cluster,
        Err(e) => {
            tracing::error!("Failed to start mock cluster: {}", e);
            std::process::exit(1);
        }
    };

    println!("nodes: {}", cluster.addresses().join(","));
    for name in &buckets {
        match cluster.topology(name) {
            Ok(topology) => println!(
                "bucket {}: {:?}, {} vbuckets, {} replicas",
                name,
                topology.bucket_type(),
                topology.num_vbuckets(),
                topology.num_replicas()
            ),
            Err(e) => tracing::warn!("No topology for {}: {}", name, e),
        }
    }

    match args.duration {
        Some(secs) => std::thread::sleep(Duration::from_secs(secs)),
        None => loop {
            std::thread::park();
        },
    }

    cluster.shutdown();
    tracing::info!("Mock cluster stopped");
}
