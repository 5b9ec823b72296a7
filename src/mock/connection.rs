//! Mock Connection Handler
//!
//! Serves one client connection of one mock node.

use std::io::{BufReader, BufWriter, ErrorKind};
use std::net::TcpStream;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::{MemdError, Result};
use crate::protocol::{read_packet, write_packet, Magic, Packet};

use super::engine::{MockEngine, Session};

fn is_disconnect(error: &MemdError) -> bool {
    match error {
        MemdError::Io(e) => matches!(
            e.kind(),
            ErrorKind::UnexpectedEof
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe
                | ErrorKind::WouldBlock
                | ErrorKind::TimedOut
                | ErrorKind::NotConnected
        ),
        _ => false,
    }
}

/// Handles a single client connection
pub struct Connection {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
    engine: Arc<MockEngine>,
    session: Session,
    peer_addr: String,
}

impl Connection {
    pub fn new(stream: TcpStream, engine: Arc<MockEngine>) -> Result<Self> {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        stream.set_nodelay(true)?;
        let read_stream = stream.try_clone()?;

        Ok(Self {
            reader: BufReader::new(read_stream),
            writer: BufWriter::new(stream),
            session: engine.session(),
            engine,
            peer_addr,
        })
    }

    /// Serve requests until the client goes away
    pub fn handle(&mut self) -> Result<()> {
        tracing::debug!("Mock connection established from {}", self.peer_addr);
        self.engine.curr_connections.fetch_add(1, Ordering::Relaxed);
        let result = self.serve();
        self.engine.curr_connections.fetch_sub(1, Ordering::Relaxed);
        result
    }

    fn serve(&mut self) -> Result<()> {
        loop {
            let request = match read_packet(&mut self.reader) {
                Ok(packet) => packet,
                Err(e) if is_disconnect(&e) => {
                    tracing::debug!("Client {} disconnected", self.peer_addr);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!("Error reading from {}: {}", self.peer_addr, e);
                    return Err(e);
                }
            };

            if request.magic != Magic::Request {
                tracing::warn!("Unexpected response frame from {}", self.peer_addr);
                continue;
            }
            tracing::trace!(
                "Received {:?} opaque {} from {}",
                request.opcode,
                request.opaque,
                self.peer_addr
            );

            let latency = self.engine.latency();
            if !latency.is_zero() {
                std::thread::sleep(latency);
            }

            let responses = self.engine.execute(&mut self.session, &request);
            if let Err(e) = self.send(&responses) {
                if is_disconnect(&e) {
                    tracing::debug!(
                        "Client {} disconnected before response could be sent: {}",
                        self.peer_addr,
                        e
                    );
                    return Ok(());
                }
                tracing::warn!("Error writing to {}: {}", self.peer_addr, e);
                return Err(e);
            }
        }
    }

    fn send(&mut self, responses: &[Packet]) -> Result<()> {
        for response in responses {
            write_packet(&mut self.writer, response)?;
        }
        Ok(())
    }

    pub fn peer_addr(&self) -> &str {
        &self.peer_addr
    }
}
