//! Agent Module
//!
//! The command dispatcher: the public entry point for every KV operation.
//!
//! ## Flow
//! ```text
//! op(key, .., callback)
//!   └─► route (Router) ─► encode ─► Pipeline::send ─► PendingOp
//!                                        │
//!          response / error ◄────────────┘ (I/O thread)
//!            ├─ accepted status ─► decode ─► callback
//!            ├─ retryable ─► RetryScheduler ─► (re-route) ─► send again
//!            └─ terminal ─► translate ─► callback
//! ```
//!
//! Every operation resolves its callback exactly once, on a pipeline or
//! scheduler thread, with a result, an error, [`MemdError::Timeout`] once
//! the operation deadline passes, or [`MemdError::Cancelled`].

mod kv;
mod observe;
mod retry;
mod stats;
mod subdoc;

pub use kv::{CounterResult, GetResult, RandomResult, StoreResult};
pub use retry::RetryScheduler;
pub use stats::SingleServerStats;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::RwLock;

use crate::completion::{PendingOp, Slot};
use crate::config::Config;
use crate::error::{KvError, MemdError, Result};
use crate::pipeline::{Capabilities, Pipeline, PipelineRequest};
use crate::protocol::Packet;
use crate::routing::{ReplicaTarget, Route, Router, TopologySnapshot};
use crate::status::{ErrorKind, RetryDecision, StatusCode, Translator};

/// Longest key the server accepts
pub const MAX_KEY_LEN: usize = 250;

// =============================================================================
// Operation plumbing
// =============================================================================

/// Where an operation is sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    /// The node holding the given copy of the key's vbucket
    Key(ReplicaTarget),
    /// A specific node index in the current snapshot
    Node(usize),
}

type Encoder = Box<dyn Fn(&Route) -> Result<Packet> + Send + Sync>;
type Decoder<T> = Box<dyn Fn(&Route, Packet) -> Result<T> + Send + Sync>;

/// Everything needed to (re)send one operation
pub(crate) struct OpSpec<T> {
    pub key: Bytes,
    pub target: Target,
    pub encode: Encoder,
    /// Statuses handed to `decode` instead of being treated as errors
    pub accept: fn(StatusCode) -> bool,
    pub decode: Decoder<T>,
    /// A non-zero CAS was supplied; KeyExists means CAS mismatch
    pub cas_checked: bool,
}

impl<T> OpSpec<T> {
    pub fn new(
        key: Bytes,
        target: Target,
        encode: impl Fn(&Route) -> Result<Packet> + Send + Sync + 'static,
        decode: impl Fn(&Route, Packet) -> Result<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            key,
            target,
            encode: Box::new(encode),
            accept: only_success,
            decode: Box::new(decode),
            cas_checked: false,
        }
    }

    pub fn accept(mut self, accept: fn(StatusCode) -> bool) -> Self {
        self.accept = accept;
        self
    }

    pub fn cas_checked(mut self, cas: u64) -> Self {
        self.cas_checked = cas != 0;
        self
    }
}

fn only_success(status: StatusCode) -> bool {
    status == StatusCode::Success
}

struct Operation<T> {
    spec: OpSpec<T>,
    slot: Arc<Slot<T>>,
    started: Instant,
    deadline: Instant,
    attempts: AtomicU32,
}

// =============================================================================
// Agent
// =============================================================================

/// Client handle for one bucket
///
/// Cheap to share behind an `Arc`; all operations take `&self`. Dropping the
/// agent shuts down its pipelines.
pub struct Agent {
    inner: Arc<AgentInner>,
}

pub(crate) struct AgentInner {
    config: Arc<Config>,
    router: Router,
    translator: Arc<Translator>,
    pipelines: RwLock<HashMap<String, Arc<Pipeline>>>,
    scheduler: RetryScheduler,
    closed: AtomicBool,
}

impl Agent {
    /// Create an agent without waiting for connections
    pub fn new(config: Config, snapshot: TopologySnapshot) -> Result<Self> {
        let config = Arc::new(config);
        let translator = Arc::new(Translator::new(config.retry_delay));

        let mut pipelines = HashMap::new();
        for address in snapshot.nodes() {
            if !pipelines.contains_key(address) {
                let pipeline =
                    Pipeline::start(address.clone(), Arc::clone(&config), Arc::clone(&translator))?;
                pipelines.insert(address.clone(), Arc::new(pipeline));
            }
        }

        tracing::info!(
            "Agent for bucket {} started with {} nodes",
            config.bucket_name,
            pipelines.len()
        );

        Ok(Self {
            inner: Arc::new(AgentInner {
                router: Router::new(snapshot),
                translator,
                pipelines: RwLock::new(pipelines),
                scheduler: RetryScheduler::start()?,
                closed: AtomicBool::new(false),
                config,
            }),
        })
    }

    /// Create an agent and wait until every node is connected
    pub fn connect(config: Config, snapshot: TopologySnapshot) -> Result<Self> {
        let timeout = config.connect_timeout;
        let agent = Self::new(config, snapshot)?;
        agent.wait_ready(timeout)?;
        Ok(agent)
    }

    /// Block until every pipeline has bootstrapped
    ///
    /// Fails early with [`MemdError::Auth`] if any node rejected the
    /// credentials or bucket.
    pub fn wait_ready(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let pipelines: Vec<Arc<Pipeline>> = self.inner.pipelines.read().values().cloned().collect();
        for pipeline in pipelines {
            let remaining = deadline.saturating_duration_since(Instant::now());
            pipeline.wait_connected(remaining)?;
        }
        Ok(())
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The current topology snapshot
    pub fn topology(&self) -> Arc<TopologySnapshot> {
        self.inner.router.snapshot()
    }

    /// Install a new topology
    ///
    /// Starts pipelines for new nodes and shuts down pipelines for nodes that
    /// left. Requests still queued on a removed node are re-routed. Returns
    /// whether the snapshot was installed (older revisions are ignored).
    pub fn apply_topology(&self, snapshot: TopologySnapshot) -> Result<bool> {
        self.inner.check_open()?;
        let wanted: HashSet<String> = snapshot.nodes().iter().cloned().collect();

        // New pipelines exist before the snapshot that routes to them
        let mut added = Vec::new();
        {
            let mut pipelines = self.inner.pipelines.write();
            for address in &wanted {
                if !pipelines.contains_key(address) {
                    tracing::info!("Adding node {}", address);
                    let pipeline = Pipeline::start(
                        address.clone(),
                        Arc::clone(&self.inner.config),
                        Arc::clone(&self.inner.translator),
                    )?;
                    pipelines.insert(address.clone(), Arc::new(pipeline));
                    added.push(address.clone());
                }
            }
        }

        if !self.inner.router.install(snapshot) {
            let stale: Vec<Arc<Pipeline>> = {
                let mut pipelines = self.inner.pipelines.write();
                added.iter().filter_map(|a| pipelines.remove(a)).collect()
            };
            for pipeline in stale {
                pipeline.shutdown();
            }
            return Ok(false);
        }

        let removed: Vec<Arc<Pipeline>> = {
            let mut pipelines = self.inner.pipelines.write();
            let gone: Vec<String> = pipelines
                .keys()
                .filter(|address| !wanted.contains(*address))
                .cloned()
                .collect();
            gone.iter().filter_map(|a| pipelines.remove(a)).collect()
        };
        for pipeline in removed {
            tracing::info!("Removing node {}", pipeline.address());
            pipeline.shutdown();
        }

        Ok(true)
    }

    /// Features negotiated with the cluster, once any node has connected
    pub fn capabilities(&self) -> Option<Arc<Capabilities>> {
        self.inner
            .pipelines
            .read()
            .values()
            .find_map(|pipeline| pipeline.capabilities())
    }

    /// Query service endpoints
    pub fn query_endpoints(&self) -> Vec<String> {
        self.topology().query_endpoints().to_vec()
    }

    /// Management (REST) endpoints
    pub fn mgmt_endpoints(&self) -> Vec<String> {
        self.topology().mgmt_endpoints().to_vec()
    }

    /// Legacy view (CAPI) endpoints
    pub fn capi_endpoints(&self) -> Vec<String> {
        self.topology().capi_endpoints().to_vec()
    }

    /// Number of node pipelines
    pub fn num_pipelines(&self) -> usize {
        self.inner.pipelines.read().len()
    }

    /// Shut down every pipeline; pending operations fail
    pub fn close(&self) {
        self.inner.close();
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("bucket", &self.inner.config.bucket_name)
            .field("pipelines", &self.num_pipelines())
            .finish()
    }
}

// =============================================================================
// Dispatch
// =============================================================================

impl AgentInner {
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(MemdError::Shutdown);
        }
        Ok(())
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pipelines: Vec<Arc<Pipeline>> =
            self.pipelines.write().drain().map(|(_, p)| p).collect();
        for pipeline in pipelines {
            pipeline.shutdown();
        }
        self.scheduler.shutdown();
        tracing::info!("Agent for bucket {} closed", self.config.bucket_name);
    }

    fn is_alive(&self, address: &str) -> bool {
        self.pipelines
            .read()
            .get(address)
            .map_or(false, |pipeline| pipeline.is_connected())
    }

    fn pipeline_for(&self, route: &Route) -> Result<Arc<Pipeline>> {
        self.pipelines
            .read()
            .get(route.address())
            .cloned()
            .ok_or_else(|| MemdError::Routing(format!("no pipeline for {}", route.address())))
    }

    /// Resolve a target against the current snapshot
    fn resolve(&self, key: &[u8], target: Target) -> Result<Route> {
        match target {
            Target::Key(replica) => {
                let snapshot = self.router.snapshot();
                self.router.route(key, replica, |ix| {
                    snapshot
                        .nodes()
                        .get(ix)
                        .map_or(false, |address| self.is_alive(address))
                })
            }
            Target::Node(node) => {
                let snapshot = self.router.snapshot();
                if node >= snapshot.num_nodes() {
                    return Err(MemdError::Routing(format!(
                        "node {} out of range ({} nodes)",
                        node,
                        snapshot.num_nodes()
                    )));
                }
                Ok(Route {
                    vbucket: 0,
                    node,
                    snapshot,
                })
            }
        }
    }

    fn map_error(cas_checked: bool, error: KvError) -> MemdError {
        if cas_checked && error.kind == ErrorKind::KeyExists {
            MemdError::CasMismatch(Some(error))
        } else {
            MemdError::Kv(error)
        }
    }

    /// Send an operation's first attempt
    ///
    /// Routing, validation and submission failures are returned directly;
    /// the callback is then dropped without being invoked.
    pub(crate) fn dispatch<T: Send + 'static>(
        self: &Arc<Self>,
        spec: OpSpec<T>,
        callback: impl FnOnce(Result<T>) + Send + 'static,
    ) -> Result<PendingOp> {
        self.check_open()?;
        if let Target::Key(_) = spec.target {
            validate_key(&spec.key)?;
        }

        let route = self.resolve(&spec.key, spec.target)?;
        let slot = Slot::new(callback);
        let started = Instant::now();
        let operation = Arc::new(Operation {
            spec,
            slot: Arc::clone(&slot),
            started,
            deadline: started + self.config.op_timeout,
            attempts: AtomicU32::new(0),
        });

        self.submit(&operation, route)?;
        Ok(PendingOp::new(slot))
    }

    fn submit<T: Send + 'static>(
        self: &Arc<Self>,
        operation: &Arc<Operation<T>>,
        route: Route,
    ) -> Result<()> {
        let pipeline = self.pipeline_for(&route)?;
        let packet = (operation.spec.encode)(&route)?;

        let agent = Arc::downgrade(self);
        let op = Arc::clone(operation);
        let request = PipelineRequest::new(
            packet,
            operation.deadline,
            operation.slot.clone(),
            move |result| {
                on_response(&agent, &op, &route, result);
                true
            },
        );
        pipeline.send(request)
    }

    /// Retry after `decision`'s delay, or fail with `error`
    fn retry_or_fail<T: Send + 'static>(
        self: &Arc<Self>,
        operation: &Arc<Operation<T>>,
        previous: &Route,
        decision: RetryDecision,
        error: MemdError,
    ) {
        let (delay, refresh) = match decision {
            RetryDecision::Never => {
                operation.slot.resolve(Err(error));
                return;
            }
            RetryDecision::AfterDelay(delay) => (delay, false),
            RetryDecision::AfterTopologyRefresh(delay) => (delay, true),
        };

        if operation.slot.is_resolved() {
            return;
        }
        if self.closed.load(Ordering::Acquire) || Instant::now() + delay >= operation.deadline {
            operation.slot.resolve(Err(error));
            return;
        }

        tracing::debug!(
            "Retrying {} on vb {} in {:?} ({}, attempt {})",
            String::from_utf8_lossy(&operation.spec.key),
            previous.vbucket,
            delay,
            error,
            operation.attempts.load(Ordering::Relaxed)
        );

        let agent = Arc::downgrade(self);
        let op = Arc::clone(operation);
        let route = previous.clone();
        let scheduled = self.scheduler.schedule(delay, move || match agent.upgrade() {
            Some(agent) => agent.retry(&op, route, refresh),
            None => {
                op.slot.resolve(Err(MemdError::Shutdown));
            }
        });
        if scheduled.is_err() {
            operation.slot.resolve(Err(error));
        }
    }

    fn retry<T: Send + 'static>(
        self: &Arc<Self>,
        operation: &Arc<Operation<T>>,
        previous: Route,
        refresh: bool,
    ) {
        if operation.slot.is_resolved() {
            return;
        }
        if self.closed.load(Ordering::Acquire) {
            operation.slot.resolve(Err(MemdError::Shutdown));
            return;
        }

        let route = if refresh {
            match self.resolve(&operation.spec.key, operation.spec.target) {
                Ok(route) => route,
                Err(e @ MemdError::Routing(_)) => {
                    let decision = RetryDecision::AfterTopologyRefresh(self.config.retry_delay);
                    self.retry_or_fail(operation, &previous, decision, e);
                    return;
                }
                Err(e) => {
                    operation.slot.resolve(Err(e));
                    return;
                }
            }
        } else {
            previous
        };

        let fallback = route.clone();
        match self.submit(operation, route) {
            Ok(()) => {}
            Err(e @ (MemdError::Routing(_) | MemdError::Shutdown)) => {
                let decision = RetryDecision::AfterTopologyRefresh(self.config.retry_delay);
                self.retry_or_fail(operation, &fallback, decision, e);
            }
            Err(e) => {
                operation.slot.resolve(Err(e));
            }
        }
    }
}

/// Per-attempt response handling, run on the I/O thread
fn on_response<T: Send + 'static>(
    agent: &Weak<AgentInner>,
    operation: &Arc<Operation<T>>,
    route: &Route,
    result: Result<Packet>,
) {
    match result {
        Ok(packet) if (operation.spec.accept)(packet.status) => {
            operation.slot.resolve((operation.spec.decode)(route, packet));
        }
        Ok(packet) => {
            let Some(agent) = agent.upgrade() else {
                let error = KvError::new(packet.status);
                operation
                    .slot
                    .resolve(Err(AgentInner::map_error(operation.spec.cas_checked, error)));
                return;
            };

            let error = agent.translator.to_error(&packet);
            let attempt = operation.attempts.fetch_add(1, Ordering::Relaxed) + 1;
            let decision =
                agent
                    .translator
                    .retry_decision(packet.status, attempt, operation.started.elapsed());
            let error = AgentInner::map_error(operation.spec.cas_checked, error);
            agent.retry_or_fail(operation, route, decision, error);
        }
        // Queued on a pipeline that was removed from the topology
        Err(MemdError::Shutdown) => match agent.upgrade() {
            Some(agent) => {
                let decision = RetryDecision::AfterTopologyRefresh(Duration::ZERO);
                agent.retry_or_fail(operation, route, decision, MemdError::Shutdown);
            }
            None => {
                operation.slot.resolve(Err(MemdError::Shutdown));
            }
        },
        Err(e) => {
            operation.slot.resolve(Err(e));
        }
    }
}

fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(MemdError::InvalidArgument("key must not be empty".to_string()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(MemdError::InvalidArgument(format!(
            "key length {} exceeds {}",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    Ok(())
}
