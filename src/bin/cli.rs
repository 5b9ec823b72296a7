//! memd-cli
//!
//! Command-line interface for running single operations against a cluster.

use std::time::Duration;

use clap::{Parser, Subcommand};
use memdcore::completion::{channel, Waiter};
use memdcore::mock::{default_vbucket_map, MockCluster};
use memdcore::{make_dist_keys, Agent, Config, PendingOp, Result, TopologySnapshot};
use tracing_subscriber::{fmt, EnvFilter};

/// memdcore CLI
#[derive(Parser, Debug)]
#[command(name = "memd-cli")]
#[command(about = "CLI for binary-protocol key-value clusters")]
struct Args {
    /// Comma-separated node addresses (ignored with --mock)
    #[arg(short, long, default_value = "127.0.0.1:11210")]
    nodes: String,

    /// Run against a fresh in-process mock cluster
    #[arg(long)]
    mock: bool,

    /// Bucket to select
    #[arg(short, long, default_value = "default")]
    bucket: String,

    /// SASL PLAIN credentials as user:password
    #[arg(short, long)]
    auth: Option<String>,

    /// Number of vbuckets the nodes serve
    #[arg(long, default_value = "64")]
    vbuckets: usize,

    /// Replicas per vbucket
    #[arg(long, default_value = "1")]
    replicas: usize,

    /// Treat the nodes as a cache-only bucket
    #[arg(long)]
    memcached: bool,

    /// Operation timeout in milliseconds
    #[arg(short, long, default_value = "2500")]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Get a value by key
    Get {
        key: String,

        /// Read from this replica (0 = any)
        #[arg(short, long)]
        replica: Option<u32>,
    },

    /// Store a value
    Set {
        key: String,
        value: String,

        #[arg(short, long, default_value = "0")]
        flags: u32,

        #[arg(short, long, default_value = "0")]
        expiry: u32,
    },

    /// Delete a key
    Remove { key: String },

    /// Increment a counter
    Incr {
        key: String,

        #[arg(default_value = "1")]
        delta: u64,

        /// Seed for a missing counter
        #[arg(short, long)]
        initial: Option<u64>,
    },

    /// Fetch a stats group from every node
    Stats {
        #[arg(default_value = "")]
        group: String,
    },

    /// Observe a key on one copy of its vbucket
    Observe {
        key: String,

        #[arg(short, long, default_value = "0")]
        replica: u32,
    },

    /// Print one key owned by each node
    DistKeys,
}

fn topology(args: &Args, mock: Option<&MockCluster>) -> Result<TopologySnapshot> {
    if let Some(cluster) = mock {
        return cluster.topology(&args.bucket);
    }
    let nodes: Vec<String> = args
        .nodes
        .split(',')
        .map(|node| node.trim().to_string())
        .filter(|node| !node.is_empty())
        .collect();
    if args.memcached {
        TopologySnapshot::memcached(nodes)
    } else {
        let map = default_vbucket_map(args.vbuckets, nodes.len(), args.replicas);
        TopologySnapshot::couchbase(nodes, map)
    }
}

fn wait<T>(pending: Result<PendingOp>, waiter: Waiter<T>) -> Result<T> {
    pending?;
    waiter.wait()
}

fn run(args: &Args, agent: &Agent) -> Result<()> {
    match &args.command {
        Commands::Get { key, replica } => {
            let (callback, waiter) = channel();
            let pending = match replica {
                Some(replica) => agent.get_replica(key.as_bytes(), *replica, callback),
                None => agent.get(key.as_bytes(), callback),
            };
            let result = wait(pending, waiter)?;
            println!("{}", String::from_utf8_lossy(&result.value));
            println!("flags={} cas={}", result.flags, result.cas);
        }
        Commands::Set {
            key,
            value,
            flags,
            expiry,
        } => {
            let (callback, waiter) = channel();
            let pending = agent.set(key.as_bytes(), value.clone(), *flags, *expiry, 0, callback);
            let result = wait(pending, waiter)?;
            println!("OK cas={}", result.cas);
            if let Some(token) = result.mutation_token {
                println!("token={:?}", token);
            }
        }
        Commands::Remove { key } => {
            let (callback, waiter) = channel();
            let result = wait(agent.remove(key.as_bytes(), 0, callback), waiter)?;
            println!("OK cas={}", result.cas);
        }
        Commands::Incr {
            key,
            delta,
            initial,
        } => {
            let (callback, waiter) = channel();
            let pending = agent.increment(key.as_bytes(), *delta, *initial, 0, callback);
            let result = wait(pending, waiter)?;
            println!("{}", result.value);
        }
        Commands::Stats { group } => {
            let (callback, waiter) = channel();
            let nodes = wait(agent.stats(group, callback), waiter)?;
            let mut addresses: Vec<&String> = nodes.keys().collect();
            addresses.sort();
            for address in addresses {
                let node = &nodes[address];
                println!("[{}]", address);
                if let Some(error) = &node.error {
                    println!("  error: {}", error);
                }
                let mut stats: Vec<_> = node.stats.iter().collect();
                stats.sort();
                for (name, value) in stats {
                    println!("  {} = {}", name, value);
                }
            }
        }
        Commands::Observe { key, replica } => {
            let (callback, waiter) = channel();
            let result = wait(agent.observe(key.as_bytes(), *replica, callback), waiter)?;
            println!("{:?} cas={}", result.key_state, result.cas);
        }
        Commands::DistKeys => {
            for (node, key) in make_dist_keys(&agent.topology())?.iter().enumerate() {
                println!("{} {}", node, key);
            }
        }
    }
    Ok(())
}

fn main() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    fmt().with_env_filter(filter).with_target(true).init();

    let args = Args::parse();

    let mock = if args.mock {
        match MockCluster::start() {
            Ok(cluster) => Some(cluster),
            Err(e) => {
                eprintln!("Failed to start mock cluster: {}", e);
                std::process::exit(1);
            }
        }
    } else {
        None
    };

    let mut builder = Config::builder()
        .bucket_name(args.bucket.clone())
        .op_timeout(Duration::from_millis(args.timeout_ms));
    if let Some((user, password)) = args.auth.as_deref().and_then(|a| a.split_once(':')) {
        builder = builder.sasl_plain(user, password);
    }

    let result = topology(&args, mock.as_ref())
        .and_then(|snapshot| Agent::connect(builder.build(), snapshot))
        .and_then(|agent| run(&args, &agent));

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
