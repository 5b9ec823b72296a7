//! Node pipeline
//!
//! One pipeline per data node. A supervisor thread owns the write half of
//! the socket, reconnects with exponential backoff and sweeps deadlines; a
//! reader thread per live connection matches responses to pending records
//! by opaque.
//!
//! ```text
//!  send() ──► [channel] ──► supervisor ──► socket ──► node
//!                              │  ▲                    │
//!                     backlog ◄┘  │ Disconnected       │
//!                                 │                    ▼
//!                              reader ◄──────────── socket
//!                                 │
//!                                 ▼
//!                           PendingTable ──► handler
//! ```

use std::collections::VecDeque;
use std::io::{BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};

use crate::config::Config;
use crate::error::{MemdError, Result};
use crate::protocol::{encode_packet, FrameReader};
use crate::status::Translator;

use super::bootstrap::{bootstrap, Capabilities};
use super::pending::{PendingTable, PipelineRequest};

/// Connection state of a pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineState {
    /// Not connected yet, or reconnecting
    Connecting,
    Connected,
    /// Bootstrap failed fatally (authentication, bucket selection)
    Failed(String),
    Closed,
}

enum Command {
    Send(PipelineRequest),
    Disconnected { generation: u64, reason: String },
    Shutdown,
}

struct Shared {
    address: String,
    config: Arc<Config>,
    translator: Arc<Translator>,
    pending: PendingTable,
    next_opaque: AtomicU32,
    generation: AtomicU64,
    shutdown: AtomicBool,
    state: Mutex<PipelineState>,
    state_changed: Condvar,
    capabilities: ArcSwapOption<Capabilities>,
}

impl Shared {
    fn set_state(&self, state: PipelineState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::debug!("Pipeline {} {:?} -> {:?}", self.address, *current, state);
            *current = state;
            self.state_changed.notify_all();
        }
    }
}

/// Multiplexed connection to a single node
pub struct Pipeline {
    shared: Arc<Shared>,
    tx: Sender<Command>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Start a pipeline; it connects in the background
    pub fn start(
        address: impl Into<String>,
        config: Arc<Config>,
        translator: Arc<Translator>,
    ) -> Result<Self> {
        let address = address.into();
        let (tx, rx) = channel::unbounded();

        let shared = Arc::new(Shared {
            address: address.clone(),
            config,
            translator,
            pending: PendingTable::new(),
            next_opaque: AtomicU32::new(1),
            generation: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            state: Mutex::new(PipelineState::Connecting),
            state_changed: Condvar::new(),
            capabilities: ArcSwapOption::empty(),
        });

        let supervisor = Supervisor {
            shared: Arc::clone(&shared),
            rx,
            tx: tx.clone(),
            backlog: VecDeque::new(),
        };
        let handle = thread::Builder::new()
            .name(format!("memd-pipe-{}", address))
            .spawn(move || supervisor.run())?;

        Ok(Self {
            shared,
            tx,
            supervisor: Mutex::new(Some(handle)),
        })
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    pub fn state(&self) -> PipelineState {
        self.shared.state.lock().clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.state.lock() == PipelineState::Connected
    }

    /// Features negotiated on the current connection
    pub fn capabilities(&self) -> Option<Arc<Capabilities>> {
        self.shared.capabilities.load_full()
    }

    /// Number of requests awaiting a response
    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    /// Queue a request
    ///
    /// Fails immediately if the pipeline is closed or failed fatally; the
    /// request (and its handler) is dropped in that case.
    pub fn send(&self, request: PipelineRequest) -> Result<()> {
        // Held until queued: the supervisor moves to Closed/Failed under this
        // lock before its last drain, so every accepted request is drained
        let state = self.shared.state.lock();
        match &*state {
            PipelineState::Failed(reason) => return Err(MemdError::Auth(reason.clone())),
            PipelineState::Closed => return Err(MemdError::Shutdown),
            _ => {}
        }
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(MemdError::Shutdown);
        }
        let sent = self
            .tx
            .send(Command::Send(request))
            .map_err(|_| MemdError::Shutdown);
        drop(state);
        sent
    }

    /// Block until connected, failed or `timeout` elapses
    pub fn wait_connected(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        loop {
            match &*state {
                PipelineState::Connected => return Ok(()),
                PipelineState::Failed(reason) => return Err(MemdError::Auth(reason.clone())),
                PipelineState::Closed => return Err(MemdError::Shutdown),
                PipelineState::Connecting => {
                    if self
                        .shared
                        .state_changed
                        .wait_until(&mut state, deadline)
                        .timed_out()
                    {
                        return Err(MemdError::Timeout);
                    }
                }
            }
        }
    }

    /// Stop the pipeline
    ///
    /// Unsent requests fail with [`MemdError::Shutdown`]; requests already on
    /// the wire fail with [`MemdError::ConnectionLost`].
    pub fn shutdown(&self) {
        self.shared.shutdown.store(true, Ordering::Release);
        let _ = self.tx.send(Command::Shutdown);
        if on_io_thread() {
            // Joining from a pipeline thread could wait on ourselves; the
            // supervisor exits on its own
            return;
        }
        if let Some(handle) = self.supervisor.lock().take() {
            if handle.join().is_err() {
                tracing::error!("Pipeline supervisor for {} panicked", self.shared.address);
            }
        }
    }
}

/// Whether the current thread belongs to a pipeline or the retry scheduler
pub(crate) fn on_io_thread() -> bool {
    thread::current()
        .name()
        .map_or(false, |name| name.starts_with("memd-"))
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("address", &self.shared.address)
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}

// =============================================================================
// Supervisor
// =============================================================================

/// A live, bootstrapped connection
struct Connection {
    stream: TcpStream,
    writer: BufWriter<TcpStream>,
    reader: JoinHandle<()>,
    generation: u64,
}

struct Supervisor {
    shared: Arc<Shared>,
    rx: Receiver<Command>,
    tx: Sender<Command>,

    /// Requests submitted while disconnected, in submission order
    backlog: VecDeque<PipelineRequest>,
}

impl Supervisor {
    fn run(mut self) {
        let mut failures = 0u32;

        while !self.is_shutdown() {
            match self.connect() {
                Ok(connection) => {
                    failures = 0;
                    self.shared.set_state(PipelineState::Connected);
                    tracing::info!("Connected to {}", self.shared.address);
                    self.serve(connection);
                }
                Err(MemdError::Auth(reason)) => {
                    tracing::error!("Pipeline {} failed: {}", self.shared.address, reason);
                    self.fail_forever(reason);
                    return;
                }
                Err(e) => {
                    let delay = self.shared.config.reconnect_delay(failures);
                    failures = failures.saturating_add(1);
                    tracing::warn!(
                        "Connecting to {} failed: {} (retry in {:?})",
                        self.shared.address,
                        e,
                        delay
                    );
                    self.shared.set_state(PipelineState::Connecting);
                    self.backoff(delay);
                }
            }
        }

        self.close();
    }

    fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    fn connect(&mut self) -> Result<Connection> {
        let config = &self.shared.config;
        let address = &self.shared.address;

        let addrs: Vec<SocketAddr> = address.to_socket_addrs()?.collect();
        let mut last_error = MemdError::Routing(format!("{} resolved to no address", address));
        let mut connected = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, config.server_connect_timeout) {
                Ok(stream) => {
                    connected = Some(stream);
                    break;
                }
                Err(e) => last_error = e.into(),
            }
        }
        let stream = connected.ok_or(last_error)?;

        stream.set_nodelay(config.tcp_nodelay)?;
        stream.set_read_timeout(Some(config.server_connect_timeout))?;
        stream.set_write_timeout(Some(config.server_connect_timeout))?;

        let capabilities = bootstrap(&stream, address, config, &self.shared.translator)?;
        self.shared.capabilities.store(Some(Arc::new(capabilities)));

        // The reader ticks on this timeout to notice shutdown
        stream.set_read_timeout(Some(config.io_tick))?;

        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let reader = {
            let mut stream = stream.try_clone()?;
            let shared = Arc::clone(&self.shared);
            let tx = self.tx.clone();
            thread::Builder::new()
                .name(format!("memd-read-{}", address))
                .spawn(move || read_loop(&mut stream, &shared, &tx, generation))?
        };

        Ok(Connection {
            writer: BufWriter::new(stream.try_clone()?),
            stream,
            reader,
            generation,
        })
    }

    /// Multiplex requests over a live connection until it drops
    fn serve(&mut self, mut connection: Connection) {
        let tick = self.shared.config.io_tick;
        let mut last_sweep = Instant::now();

        let reason = 'serve: {
            while let Some(request) = self.backlog.pop_front() {
                if let Err(e) = self.write(&mut connection.writer, request) {
                    break 'serve e.to_string();
                }
            }
            if let Err(e) = connection.writer.flush() {
                break 'serve e.to_string();
            }

            loop {
                match self.rx.recv_timeout(tick) {
                    Ok(Command::Send(request)) => {
                        if let Err(e) = self.write(&mut connection.writer, request) {
                            break 'serve e.to_string();
                        }
                        if self.rx.is_empty() {
                            if let Err(e) = connection.writer.flush() {
                                break 'serve e.to_string();
                            }
                        }
                    }
                    Ok(Command::Disconnected { generation, reason }) => {
                        if generation == connection.generation {
                            break 'serve reason;
                        }
                    }
                    Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                        break 'serve "pipeline shut down".to_string();
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                }

                if self.is_shutdown() {
                    break 'serve "pipeline shut down".to_string();
                }

                let now = Instant::now();
                if now.duration_since(last_sweep) >= tick {
                    let expired = self.shared.pending.sweep(now);
                    if expired > 0 {
                        tracing::debug!(
                            "Timed out {} requests on {}",
                            expired,
                            self.shared.address
                        );
                    }
                    last_sweep = now;
                }
            }
        };

        if !self.is_shutdown() {
            tracing::warn!("Lost connection to {}: {}", self.shared.address, reason);
            self.shared.set_state(PipelineState::Connecting);
        }

        let _ = connection.stream.shutdown(Shutdown::Both);
        if connection.reader.join().is_err() {
            tracing::error!("Reader for {} panicked", self.shared.address);
        }

        let address = self.shared.address.clone();
        let failed = self
            .shared
            .pending
            .fail_all(|| MemdError::ConnectionLost(address.clone()));
        if failed > 0 {
            tracing::debug!("Failed {} in-flight requests on {}", failed, address);
        }
    }

    /// Register and write one request
    fn write(&self, writer: &mut BufWriter<TcpStream>, mut request: PipelineRequest) -> Result<()> {
        if request.is_abandoned() {
            return Ok(());
        }
        if request.deadline <= Instant::now() {
            request.fail(MemdError::Timeout);
            return Ok(());
        }

        request.packet.opaque = self.shared.next_opaque.fetch_add(1, Ordering::Relaxed);
        let bytes = encode_packet(&request.packet);
        tracing::trace!(
            "-> {} {:?} opaque={} vb={}",
            self.shared.address,
            request.packet.opcode,
            request.packet.opaque,
            request.packet.vbucket
        );

        // Registered before the write so a fast response always finds it
        self.shared.pending.insert(request);
        writer.write_all(&bytes)?;
        Ok(())
    }

    /// Wait out a reconnect delay while still accepting requests
    fn backoff(&mut self, delay: Duration) {
        let until = Instant::now() + delay;
        let tick = self.shared.config.io_tick;

        loop {
            self.expire_backlog();
            let now = Instant::now();
            if now >= until || self.is_shutdown() {
                return;
            }

            match self.rx.recv_timeout((until - now).min(tick)) {
                Ok(Command::Send(request)) => {
                    if !request.is_abandoned() {
                        self.backlog.push_back(request);
                    }
                }
                Ok(Command::Disconnected { .. }) | Err(RecvTimeoutError::Timeout) => {}
                Ok(Command::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
            }
        }
    }

    fn expire_backlog(&mut self) {
        let now = Instant::now();
        let mut kept = VecDeque::with_capacity(self.backlog.len());
        for request in self.backlog.drain(..) {
            if request.is_abandoned() {
                continue;
            }
            if request.deadline <= now {
                request.fail(MemdError::Timeout);
            } else {
                kept.push_back(request);
            }
        }
        self.backlog = kept;
    }

    /// Fatal bootstrap failure: reject everything until shut down
    fn fail_forever(&mut self, reason: String) {
        self.shared.set_state(PipelineState::Failed(reason.clone()));
        for request in self.backlog.drain(..) {
            request.fail(MemdError::Auth(reason.clone()));
        }

        loop {
            match self.rx.recv() {
                Ok(Command::Send(request)) => request.fail(MemdError::Auth(reason.clone())),
                Ok(Command::Disconnected { .. }) => {}
                Ok(Command::Shutdown) | Err(_) => break,
            }
        }
        while let Ok(command) = self.rx.try_recv() {
            if let Command::Send(request) = command {
                request.fail(MemdError::Auth(reason.clone()));
            }
        }
    }

    fn close(&mut self) {
        self.shared.set_state(PipelineState::Closed);

        for request in self.backlog.drain(..) {
            request.fail(MemdError::Shutdown);
        }
        while let Ok(command) = self.rx.try_recv() {
            if let Command::Send(request) = command {
                request.fail(MemdError::Shutdown);
            }
        }

        let address = self.shared.address.clone();
        self.shared
            .pending
            .fail_all(|| MemdError::ConnectionLost(address.clone()));
        tracing::info!("Pipeline {} closed", address);
    }
}

// =============================================================================
// Reader
// =============================================================================

fn read_loop(stream: &mut TcpStream, shared: &Shared, tx: &Sender<Command>, generation: u64) {
    let mut frames = FrameReader::new();

    loop {
        if shared.shutdown.load(Ordering::Acquire)
            || shared.generation.load(Ordering::Acquire) != generation
        {
            return;
        }

        match frames.poll(stream) {
            Ok(Some(packet)) => {
                tracing::trace!(
                    "<- {} {:?} opaque={} status={:?}",
                    shared.address,
                    packet.opcode,
                    packet.opaque,
                    packet.status
                );
                shared.pending.complete(packet);
            }
            Ok(None) => {}
            Err(e) => {
                let _ = tx.send(Command::Disconnected {
                    generation,
                    reason: e.to_string(),
                });
                return;
            }
        }
    }
}
