//! Mock node server
//!
//! One listening socket per mock node: a single acceptor thread plus one
//! thread per connection.

use std::collections::HashMap;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Result;

use super::connection::Connection;
use super::engine::MockEngine;

/// How often the acceptor checks for shutdown
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Open client streams keyed by connection id
type StreamTable = Mutex<HashMap<u64, TcpStream>>;

/// A running mock node
pub struct MockNode {
    index: usize,
    address: SocketAddr,
    engine: Arc<MockEngine>,
    shutdown: Arc<AtomicBool>,
    streams: Arc<StreamTable>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl MockNode {
    /// Bind an ephemeral localhost port and start accepting
    pub(crate) fn start(index: usize, engine: Arc<MockEngine>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        listener.set_nonblocking(true)?;
        let address = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let streams = Arc::new(Mutex::new(HashMap::new()));

        let acceptor = {
            let engine = Arc::clone(&engine);
            let shutdown = Arc::clone(&shutdown);
            let streams = Arc::clone(&streams);
            thread::Builder::new()
                .name(format!("mock-node{}-accept", index))
                .spawn(move || accept_loop(index, listener, engine, shutdown, streams))?
        };

        tracing::debug!("Mock node {} listening on {}", index, address);
        Ok(Self {
            index,
            address,
            engine,
            shutdown,
            streams,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// "host:port" of the node
    pub fn address(&self) -> String {
        self.address.to_string()
    }

    pub fn engine(&self) -> &Arc<MockEngine> {
        &self.engine
    }

    /// Number of client connections still open
    pub fn connection_count(&self) -> usize {
        self.streams.lock().len()
    }

    /// Sever every open client connection; the node keeps accepting
    pub fn drop_connections(&self) {
        let streams = std::mem::take(&mut *self.streams.lock());
        tracing::debug!(
            "Mock node {} dropping {} connections",
            self.index,
            streams.len()
        );
        for stream in streams.into_values() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Stop accepting and close every connection
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.acceptor.lock().take() {
            let _ = handle.join();
        }
        self.drop_connections();
    }
}

impl Drop for MockNode {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(
    index: usize,
    listener: TcpListener,
    engine: Arc<MockEngine>,
    shutdown: Arc<AtomicBool>,
    streams: Arc<StreamTable>,
) {
    let next_id = AtomicU64::new(0);
    while !shutdown.load(Ordering::Acquire) {
        let (stream, peer) = match listener.accept() {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(e) => {
                tracing::warn!("Mock node {} accept failed: {}", index, e);
                thread::sleep(ACCEPT_POLL);
                continue;
            }
        };

        let id = next_id.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = serve(index, id, stream, &engine, &streams) {
            tracing::warn!("Mock node {} could not serve {}: {}", index, peer, e);
        }
    }
    tracing::debug!("Mock node {} stopped accepting", index);
}

fn serve(
    index: usize,
    id: u64,
    stream: TcpStream,
    engine: &Arc<MockEngine>,
    streams: &Arc<StreamTable>,
) -> Result<()> {
    stream.set_nonblocking(false)?;
    streams.lock().insert(id, stream.try_clone()?);

    let mut connection = match Connection::new(stream, Arc::clone(engine)) {
        Ok(connection) => connection,
        Err(e) => {
            streams.lock().remove(&id);
            return Err(e);
        }
    };
    let table = Arc::clone(streams);
    thread::Builder::new()
        .name(format!("mock-node{}-conn", index))
        .spawn(move || {
            if let Err(e) = connection.handle() {
                tracing::debug!("Mock connection {} ended: {}", connection.peer_addr(), e);
            }
            table.lock().remove(&id);
        })
        .map_err(|e| {
            streams.lock().remove(&id);
            e
        })?;
    Ok(())
}
